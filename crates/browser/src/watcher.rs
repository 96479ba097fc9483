use relay_core::protocol::DomSnapshot;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::driver::BrowserDriver;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Polls the page and forwards a snapshot whenever its HTML changes.
pub struct DomWatcher {
    driver: Arc<dyn BrowserDriver>,
    interval: Duration,
    updates: mpsc::Sender<DomSnapshot>,
}

impl DomWatcher {
    pub fn new(driver: Arc<dyn BrowserDriver>, updates: mpsc::Sender<DomSnapshot>) -> Self {
        Self {
            driver,
            interval: DEFAULT_POLL_INTERVAL,
            updates,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run_loop(self, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_ms = self.interval.as_millis() as u64, "DomWatcher started");
        let mut ticker = tokio::time::interval(self.interval);
        let mut last_html: Option<String> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = match self.driver.dom_snapshot().await {
                        Ok(s) => s,
                        Err(e) => {
                            debug!(error = %e, "DOM snapshot failed");
                            continue;
                        }
                    };
                    if last_html.as_deref() == Some(snapshot.html.as_str()) {
                        continue;
                    }
                    last_html = Some(snapshot.html.clone());
                    if self.updates.send(snapshot).await.is_err() {
                        debug!("DOM update receiver dropped");
                        break;
                    }
                }
                _ = shutdown.recv() => {
                    info!("DomWatcher shutting down");
                    break;
                }
            }
        }
    }
}
