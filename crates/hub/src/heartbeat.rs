use relay_storage::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::hub::Hub;

/// Periodic bookkeeping: stamps `last_seen` on connected agents and purges
/// expired pairing codes. Socket liveness is the transport's job.
pub struct HeartbeatService {
    hub: Arc<Hub>,
    store: Store,
    interval: Duration,
    cleanup_interval: Duration,
}

impl HeartbeatService {
    pub fn new(hub: Arc<Hub>, store: Store) -> Self {
        let interval = Duration::from_secs(hub.config().heartbeat_secs.max(1));
        let cleanup_interval = Duration::from_secs(hub.config().pairing_cleanup_secs.max(1));
        Self {
            hub,
            store,
            interval,
            cleanup_interval,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    fn beat(&self) {
        let touched = self.hub.touch_connected_agents();
        debug!(touched, "Heartbeat");
    }

    fn cleanup(&self) {
        if let Err(e) = self.store.purge_expired_pairing_codes() {
            error!(error = %e, "Pairing code cleanup failed");
        }
    }

    pub async fn run_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            cleanup_secs = self.cleanup_interval.as_secs(),
            "HeartbeatService started"
        );

        let mut interval = tokio::time::interval(self.interval);
        let mut cleanup = tokio::time::interval(self.cleanup_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => self.beat(),
                _ = cleanup.tick() => self.cleanup(),
                _ = shutdown.recv() => {
                    info!("HeartbeatService shutting down");
                    break;
                }
            }
        }
    }
}
