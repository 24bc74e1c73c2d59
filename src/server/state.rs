use crate::config::Settings;
use crate::keys::KeyRegistry;
use crate::metrics::{Metrics, RequestCounters};
use crate::store::RateLimitStore;
use std::sync::Arc;

/// Shared server state, cheaply cloneable — every handler gets its own
/// clone of the `Arc`s inside.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub keys: Arc<KeyRegistry>,
    pub store: Arc<RateLimitStore>,
    pub metrics: Metrics,
    pub counters: RequestCounters,
}

impl AppState {
    pub fn new(
        settings: Settings,
        keys: KeyRegistry,
        store: RateLimitStore,
        metrics: Metrics,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            keys: Arc::new(keys),
            store: Arc::new(store),
            metrics,
            counters: RequestCounters::default(),
        }
    }
}
