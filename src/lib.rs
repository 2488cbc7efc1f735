pub mod can;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod hosting;
pub mod images;
pub mod location;
pub mod maintenance;
pub mod neighborhood;
pub mod net;
pub mod proto;
pub mod queue;
pub mod search;
pub mod store;
pub mod types;

pub use config::Config;
pub use context::ServerContext;
pub use crypto::{sha256, Keypair};
pub use error::{ServerError, ServerResult};
pub use hosting::HostingManager;
pub use images::ImageStore;
pub use search::SearchEngine;
pub use store::Store;
pub use types::*;
