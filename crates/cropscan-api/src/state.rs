//! Shared application state handed to every handler.

use cropscan_db::JobStore;
use cropscan_queue::BrokerHealth;
use cropscan_services::{JobIntakeService, Reaper};
use cropscan_storage::ObjectStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub intake: JobIntakeService,
    pub jobs: Arc<dyn JobStore>,
    pub files: Arc<ObjectStore>,
    pub reaper: Arc<Reaper>,
    pub broker_health: BrokerHealth,
    /// Size of the consumer pool, reported by `/health`.
    pub workers: usize,
}
