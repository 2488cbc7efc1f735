//! IoP profile server daemon.
//!
//! Binds the four role listeners, starts the action queue worker, the
//! location-service adapter, and the maintenance scheduler, then waits for
//! ctrl-c. Shutdown drains in order: accept loops, client connections (5 s
//! grace), background workers (30 s grace, then abort), persistence flush.

use clap::Parser;
use profile_server::can::CanClient;
use profile_server::net::types::{CLIENT_DRAIN_GRACE_SECS, WORKER_DRAIN_GRACE_SECS};
use profile_server::net::{client, server};
use profile_server::queue::QueueWorker;
use profile_server::types::GpsLocation;
use profile_server::{location, maintenance, Config, ServerContext};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "profile-server", version, about = "IoP profile server")]
struct Args {
    /// Interface to bind; `any` binds every interface
    #[arg(long, default_value = "any")]
    server_interface: String,

    /// Plaintext role port (service listing)
    #[arg(long, default_value_t = 16987)]
    primary_interface_port: u16,

    /// TLS role port for non-customer clients
    #[arg(long, default_value_t = 16988)]
    client_non_customer_interface_port: u16,

    /// TLS role port for customer clients
    #[arg(long, default_value_t = 16989)]
    client_customer_interface_port: u16,

    /// TLS role port for neighbor servers
    #[arg(long, default_value_t = 16990)]
    sr_neighbor_interface_port: u16,

    /// PEM file with the TLS certificate and key for all encrypted roles
    #[arg(long, default_value = "./data/server.pem")]
    tls_server_certificate: PathBuf,

    /// Data directory
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Root of the image blob store (default: <data-dir>/images)
    #[arg(long)]
    image_data_folder: Option<PathBuf>,

    /// Staging folder for image uploads (default: <data-dir>/tmp)
    #[arg(long)]
    temp_data_folder: Option<PathBuf>,

    /// Cap on concurrently hosted identities
    #[arg(long, default_value_t = 20_000)]
    max_hosted_identities: usize,

    /// host:port of the external location service
    #[arg(long)]
    location_service_endpoint: Option<SocketAddr>,

    /// host:port of the content-addressable-network gateway
    #[arg(long)]
    can_endpoint: Option<SocketAddr>,

    /// Advertised GPS latitude in degrees
    #[arg(long, default_value_t = 0.0)]
    latitude: f64,

    /// Advertised GPS longitude in degrees
    #[arg(long, default_value_t = 0.0)]
    longitude: f64,
}

impl Args {
    fn into_config(self) -> Result<Config, String> {
        let server_interface = Config::parse_interface(&self.server_interface)
            .ok_or_else(|| format!("bad server_interface: {}", self.server_interface))?;
        let location = GpsLocation::from_degrees(self.latitude, self.longitude)
            .ok_or_else(|| "latitude/longitude out of range".to_string())?;

        Ok(Config {
            server_interface,
            primary_port: self.primary_interface_port,
            client_non_customer_port: self.client_non_customer_interface_port,
            client_customer_port: self.client_customer_interface_port,
            sr_neighbor_port: self.sr_neighbor_interface_port,
            tls_certificate_file: self.tls_server_certificate,
            image_data_folder: self
                .image_data_folder
                .unwrap_or_else(|| self.data_dir.join("images")),
            temp_data_folder: self.temp_data_folder.unwrap_or_else(|| self.data_dir.join("tmp")),
            data_dir: self.data_dir,
            max_hosted_identities: self.max_hosted_identities,
            location_service_endpoint: self.location_service_endpoint,
            can_endpoint: self.can_endpoint,
            location,
            ..Config::default()
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("profile_server=info".parse().unwrap()),
        )
        .init();

    let config = match Args::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Bad configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = match ServerContext::build(config, shutdown_rx) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Initialization failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!("════════════════════════════════════════════════════════════");
    info!("  IoP profile server v{VERSION}");
    info!("════════════════════════════════════════════════════════════");

    let listeners = match server::start(ctx.clone()).await {
        Ok(listeners) => listeners,
        Err(e) => {
            error!("Failed to bind role listeners: {e}");
            return ExitCode::FAILURE;
        }
    };

    let connector = client::shared_connector();
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    workers.push(tokio::spawn(QueueWorker::new(ctx.clone(), connector).run()));
    workers.push(tokio::spawn(location::run(ctx.clone())));
    let can = Arc::new(CanClient::new(ctx.config.can_endpoint));
    workers.push(tokio::spawn(maintenance::run(ctx.clone(), can)));

    info!(
        "Serving {} hosted identities",
        ctx.store.hosted_active_count().unwrap_or(0)
    );

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");
    let _ = shutdown_tx.send(true);

    // Accept loops and client connections first, then the workers.
    drain(listeners, CLIENT_DRAIN_GRACE_SECS).await;
    drain(workers, WORKER_DRAIN_GRACE_SECS).await;

    if let Err(e) = ctx.store.flush() {
        error!("Final flush failed: {e}");
        return ExitCode::FAILURE;
    }
    info!("Shutdown complete");
    ExitCode::SUCCESS
}

async fn drain(handles: Vec<JoinHandle<()>>, grace_secs: u64) {
    let deadline = Instant::now() + Duration::from_secs(grace_secs);
    for mut handle in handles {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if timeout(remaining, &mut handle).await.is_err() {
            handle.abort();
        }
    }
}
