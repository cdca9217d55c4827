use std::sync::Arc;

use crate::services::{queue::WorkQueue, store::JobStore};

/// Shared state for the worker's operational HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn WorkQueue>,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn WorkQueue>) -> Self {
        Self { store, queue }
    }
}
