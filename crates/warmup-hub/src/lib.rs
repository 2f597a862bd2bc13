pub mod config;
pub mod error;
pub mod hub;
pub mod logging;
pub mod operation;
pub mod scheduler;
pub mod server;

use config::Config;
use error::HubError;
use hub::{BroadcastHub, HubSettings};
use operation::WarmupOperation;
use scheduler::WarmupScheduler;
use server::AppState;
use std::sync::Arc;

/// Wires scheduler, hub and background tasks together. Must run inside a
/// tokio runtime.
pub fn launch(config: &Config, operation: Arc<dyn WarmupOperation>) -> Result<Arc<AppState>, HubError> {
    if config.resources.is_empty() {
        return Err(HubError::NoResources);
    }
    let (scheduler, updates) =
        WarmupScheduler::new(config.resources.clone(), operation, config.max_warmup);
    let hub = Arc::new(BroadcastHub::new(
        scheduler,
        HubSettings {
            ping_interval: config.ping_interval,
            max_missed_pings: config.max_missed_pings,
        },
    ));
    hub.clone().spawn_fanout(updates);
    hub.clone().start_liveness_reaper();
    Ok(Arc::new(AppState {
        hub,
        write_timeout: config.write_timeout,
        queue_capacity: config.queue_capacity,
    }))
}
