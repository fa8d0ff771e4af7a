use std::sync::Arc;

use crate::inference::TextEncoder;

/// Shared, read-only handles passed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub encoder: Arc<dyn TextEncoder>,
}

impl AppState {
    pub fn new(encoder: Arc<dyn TextEncoder>) -> Self {
        Self { encoder }
    }
}
