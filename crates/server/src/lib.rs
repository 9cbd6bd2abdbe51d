use std::sync::Arc;

use services::services::{apply::ApplyService, config::Config};

pub mod error;
pub mod http;
pub mod hub;
pub mod routes;

/// Shared state of the agent's HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub apply: ApplyService,
}

impl AppState {
    pub fn new(config: Arc<Config>, apply: ApplyService) -> Self {
        Self { config, apply }
    }
}
