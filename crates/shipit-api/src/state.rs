//! Application state.

use shipit_core::bus::LogBus;
use shipit_db::JobStore;
use shipit_scheduler::DispatchQueue;
use std::sync::Arc;

/// Shared application state: the handles built at startup.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn DispatchQueue>,
    pub bus: Arc<dyn LogBus>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn DispatchQueue>,
        bus: Arc<dyn LogBus>,
    ) -> Self {
        Self { store, queue, bus }
    }
}
