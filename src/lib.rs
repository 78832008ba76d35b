pub mod config;
pub mod db;
pub mod error;
pub mod migrate;
pub mod model;
pub mod newznab;
pub mod proxy;
pub mod store;

use std::sync::Arc;

use crate::config::Config;
use crate::proxy::ProxyService;

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub service: Arc<dyn ProxyService>,
    /// API key allow-list; `None` means key validation is disabled.
    pub api_keys: Option<Arc<Vec<String>>>,
}

impl AppState {
    pub fn new(config: Arc<Config>, service: Arc<dyn ProxyService>) -> Self {
        let api_keys = config.web.api_keys.clone().map(Arc::new);
        Self {
            config,
            service,
            api_keys,
        }
    }
}
