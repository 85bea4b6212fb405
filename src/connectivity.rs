use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::{Duration, interval};

use crate::backend::ImageBackend;

// Online/offline flag consulted by the error classifier
pub struct Connectivity {
    online: AtomicBool,
}

impl Connectivity {
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    /// Returns the previous value.
    pub fn set_online(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::Relaxed)
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new()
    }
}

// Probe the backend every `check_interval` and flip the flag on change
pub async fn connectivity_monitor(
    connectivity: Arc<Connectivity>,
    backend: Arc<dyn ImageBackend>,
    check_interval: Duration,
) {
    let mut interval = interval(check_interval);

    tracing::info!(interval = ?check_interval, "Connectivity monitor started");

    loop {
        interval.tick().await;

        let is_online = backend.probe().await;
        let was_online = connectivity.set_online(is_online);

        // Log status changes
        if was_online != is_online {
            if is_online {
                tracing::info!("Backend reachable again, back online");
            } else {
                tracing::warn!("Backend unreachable, marking offline");
            }
        }
    }
}
