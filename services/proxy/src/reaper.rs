//! Session Reaper.
//!
//! The only component that removes sessions on time alone. Removal goes
//! through [`SessionStore::remove`], which closes the owned connection
//! before the session is dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, instrument};

use crate::session::SessionStore;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// Sessions idle for at least this long are removed.
    pub idle_threshold: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            idle_threshold: Duration::from_secs(300),
        }
    }
}

pub struct SessionReaper {
    store: Arc<SessionStore>,
    config: ReaperConfig,
    /// Which store this reaper sweeps, for logs.
    name: &'static str,
}

impl SessionReaper {
    pub fn new(name: &'static str, store: Arc<SessionStore>, config: ReaperConfig) -> Self {
        Self {
            store,
            config,
            name,
        }
    }

    #[instrument(skip(self, shutdown), fields(store = self.name))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            idle_threshold_secs = self.config.idle_threshold.as_secs(),
            "Starting session reaper"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Session reaper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass. Returns how many sessions were removed.
    pub async fn sweep(&self) -> usize {
        let idle = self.store.idle_sessions(self.config.idle_threshold);
        let mut removed = 0;
        for id in idle {
            // Activity may have resumed since the scan.
            let still_idle = self
                .store
                .get(&id)
                .is_some_and(|s| s.idle_for() >= self.config.idle_threshold);
            if still_idle && self.store.remove(&id).await.is_some() {
                debug!(session_id = %id, "Evicted idle session");
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, remaining = self.store.len(), "Reaped idle sessions");
        }
        removed
    }
}
