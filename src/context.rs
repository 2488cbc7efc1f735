//! Startup-constructed server context.
//!
//! Everything a component needs is built once here and handed down
//! explicitly; nothing reaches for process-wide state.

use crate::config::Config;
use crate::crypto::Keypair;
use crate::error::{ServerError, ServerResult};
use crate::hosting::HostingManager;
use crate::images::ImageStore;
use crate::net::conversation::CustomerRegistry;
use crate::net::types::Role;
use crate::proto::ServerRole;
use crate::search::SearchEngine;
use crate::store::{Store, SETTING_PRIMARY_ADDRESS, SETTING_SERVER_SECRET_KEY};
use crate::types::ServerId;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::info;

pub struct ServerContext {
    pub config: Config,
    /// The server's own Ed25519 identity, stable across restarts.
    pub keys: Keypair,
    /// SHA256 of the server public key; this server's network id.
    pub network_id: ServerId,
    pub store: Store,
    pub images: ImageStore,
    pub hosting: HostingManager,
    pub search: SearchEngine,
    pub customers: CustomerRegistry,
    /// Wakes the action queue worker when new actions are enqueued.
    pub action_wakeup: Arc<Notify>,
    pub shutdown: watch::Receiver<bool>,
}

impl ServerContext {
    pub fn build(config: Config, shutdown: watch::Receiver<bool>) -> ServerResult<Arc<Self>> {
        let store = Store::open(config.data_dir.join("db"))?;
        let images = ImageStore::open(&config.image_data_folder, &config.temp_data_folder)?;
        let keys = load_or_create_keys(&store)?;
        let network_id = keys.identity_id();

        // Remember the advertised primary address across restarts so a
        // changed binding is visible in the logs.
        let primary = config.primary_addr().to_string();
        if let Some(saved) = store.get_setting(SETTING_PRIMARY_ADDRESS)? {
            if saved != primary.as_bytes() {
                info!(
                    "Primary address changed from {} to {}",
                    String::from_utf8_lossy(&saved),
                    primary
                );
            }
        }
        store.put_setting(SETTING_PRIMARY_ADDRESS, primary.as_bytes())?;

        info!("Server network id {}", hex::encode(network_id));

        let action_wakeup = Arc::new(Notify::new());
        let hosting =
            HostingManager::new(store.clone(), images.clone(), &config, action_wakeup.clone());
        let search = SearchEngine::new(store.clone(), images.clone(), &config);

        Ok(Arc::new(Self {
            config,
            keys,
            network_id,
            store,
            images,
            hosting,
            search,
            customers: CustomerRegistry::new(),
            action_wakeup,
            shutdown,
        }))
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Service listing served on the primary role.
    pub fn role_listing(&self) -> Vec<ServerRole> {
        Role::ALL
            .iter()
            .map(|role| ServerRole {
                role: role.wire_type() as i32,
                port: role.port(&self.config) as u32,
                is_tls: role.is_tls(),
            })
            .collect()
    }
}

fn load_or_create_keys(store: &Store) -> ServerResult<Keypair> {
    if let Some(secret) = store.get_setting(SETTING_SERVER_SECRET_KEY)? {
        return Keypair::from_secret_bytes(&secret).map_err(ServerError::from);
    }
    let keys = Keypair::generate();
    store.put_setting(SETTING_SERVER_SECRET_KEY, &keys.secret_bytes())?;
    info!("Generated new server keypair");
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_keys_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            image_data_folder: dir.path().join("images"),
            temp_data_folder: dir.path().join("tmp"),
            ..Config::default()
        };

        let (_tx, rx) = watch::channel(false);
        let first = ServerContext::build(config.clone(), rx.clone()).unwrap();
        let first_id = first.network_id;
        drop(first);

        let second = ServerContext::build(config, rx).unwrap();
        assert_eq!(second.network_id, first_id);
    }

    #[test]
    fn role_listing_covers_all_roles() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            image_data_folder: dir.path().join("images"),
            temp_data_folder: dir.path().join("tmp"),
            ..Config::default()
        };
        let (_tx, rx) = watch::channel(false);
        let ctx = ServerContext::build(config, rx).unwrap();

        let roles = ctx.role_listing();
        assert_eq!(roles.len(), 4);
        assert_eq!(roles.iter().filter(|r| !r.is_tls).count(), 1);
    }
}
