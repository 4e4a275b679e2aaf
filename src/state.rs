use std::sync::Arc;

use crate::services::DeliveryEngine;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DeliveryEngine>,
}

impl AppState {
    pub fn new(engine: Arc<DeliveryEngine>) -> Self {
        Self { engine }
    }
}
