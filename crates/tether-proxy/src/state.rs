use std::sync::Arc;

use crate::handler::EdgeHandler;
use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<EdgeHandler>,
    pub metrics: Arc<Metrics>,
}
