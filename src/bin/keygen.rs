//! Ed25519 identity generator.
//!
//! Creates a client identity keypair for use against a profile server:
//! - Secret key (32 bytes) - keep private
//! - Public key (32 bytes) - sent in StartConversation
//! - Identity id - SHA256 of the public key
//!
//! Usage:
//!   cargo run --bin keygen -- --name alice --output ./keys/

use clap::Parser;
use profile_server::crypto::{base64url_encode, Keypair};
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keygen", version, about = "Profile identity key generator")]
struct Args {
    /// Identity name (file name prefix)
    #[arg(short, long)]
    name: String,

    /// Output directory for keys
    #[arg(short, long, default_value = ".")]
    output: PathBuf,
}

fn main() {
    let args = Args::parse();

    let keys = Keypair::generate();
    let identity_id = keys.identity_id();

    fs::create_dir_all(&args.output).expect("Failed to create output directory");

    let secret_path = args.output.join(format!("{}_secret.key", args.name));
    fs::write(&secret_path, keys.secret_bytes()).expect("Failed to write secret key");

    let public_path = args.output.join(format!("{}_public.key", args.name));
    fs::write(&public_path, keys.public).expect("Failed to write public key");

    println!("Identity:   {}", args.name);
    println!("Secret key: {}", secret_path.display());
    println!("Public key: {} ({})", public_path.display(), base64url_encode(&keys.public));
    println!("IdentityId: {}", hex::encode(identity_id));
}
