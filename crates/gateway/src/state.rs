use std::sync::Arc;

use cadence_domain::config::Config;
use cadence_engine::Engine;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Arc<Engine>,
}
