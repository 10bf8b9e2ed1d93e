// master/src/state.rs

use reqwest::Client;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::Semaphore;

use crate::config::MasterConfig;
use crate::launcher::Launchers;
use crate::store::{MemoryProjectStore, ProjectStore};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ProjectStore>,
    pub launchers: Launchers,
    /// Limita los lanzamientos simultáneos (spawn / envío REST).
    pub launch_permits: Arc<Semaphore>,
    /// Canales de control: "{deployId}-{epoch}" -> URL REST del backend.
    pub channels: Arc<Mutex<HashMap<String, String>>>,
    /// Cliente para reenviar pedidos por el canal de control.
    pub http: Client,
    pub config: Arc<MasterConfig>,
}

impl AppState {
    pub fn new(config: MasterConfig) -> Self {
        let launchers = Launchers::with_defaults(&config);
        Self::with_parts(config, Arc::new(MemoryProjectStore::new()), launchers)
    }

    pub fn with_parts(
        config: MasterConfig,
        store: Arc<dyn ProjectStore>,
        launchers: Launchers,
    ) -> Self {
        Self {
            store,
            launchers,
            launch_permits: Arc::new(Semaphore::new(config.launch_concurrency.max(1))),
            channels: Arc::new(Mutex::new(HashMap::new())),
            http: Client::new(),
            config: Arc::new(config),
        }
    }
}
