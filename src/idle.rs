//! ==============================================================================
//! idle.rs - deferred active -> idle transition per device
//! ==============================================================================
//!
//! purpose:
//!     every accepted upload re-arms a per-device timer. when the timer runs
//!     out the device is moved from `active` to `idle` (a device marked
//!     anomalous in the meantime is left alone).
//!
//! invariants:
//!     - at most one timer per device is outstanding; `touch` aborts the
//!       previous one before arming a new one
//!     - a timer applies its transition while holding the timer map lock, so
//!       a concurrent `touch` either cancels it first or waits for it
//!     - `shutdown` aborts every pending timer and refuses new ones
//!
//! timers are tokio tasks sleeping on the runtime's timer wheel, not os timers.
//!
//! ==============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use crate::domain::DeviceStatus;
use crate::store::DeviceRegistry;

struct Timer {
    generation: u64,
    handle: AbortHandle,
}

pub struct IdleMonitor {
    idle_after: Duration,
    devices: Arc<dyn DeviceRegistry>,
    timers: Arc<Mutex<HashMap<String, Timer>>>,
    generation: AtomicU64,
    closed: AtomicBool,
}

impl IdleMonitor {
    pub fn new(idle_after: Duration, devices: Arc<dyn DeviceRegistry>) -> Self {
        Self {
            idle_after,
            devices,
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// cancel any pending timer for the device and arm a fresh one
    pub async fn touch(&self, device_id: &str) {
        let mut timers = self.timers.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(previous) = timers.remove(device_id) {
            previous.handle.abort();
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let id = device_id.to_string();
        let devices = self.devices.clone();
        let map = self.timers.clone();
        let idle_after = self.idle_after;

        let task = tokio::spawn(async move {
            tokio::time::sleep(idle_after).await;

            let mut timers = map.lock().await;
            // superseded while waiting for the lock
            if timers.get(&id).map(|t| t.generation) != Some(generation) {
                return;
            }
            timers.remove(&id);

            match devices.transition(&id, DeviceStatus::Active, DeviceStatus::Idle).await {
                Ok(true) => tracing::info!(device_id = %id, "device idle"),
                Ok(false) => {
                    tracing::debug!(device_id = %id, "idle timer fired, status not active")
                }
                Err(e) => tracing::warn!(device_id = %id, "idle transition failed: {}", e),
            }
        });

        timers.insert(
            device_id.to_string(),
            Timer {
                generation,
                handle: task.abort_handle(),
            },
        );
    }

    /// number of outstanding timers
    pub async fn pending(&self) -> usize {
        self.timers.lock().await.len()
    }

    /// abort all timers; later `touch` calls are ignored
    pub async fn shutdown(&self) {
        let mut timers = self.timers.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        let count = timers.len();
        for (_, timer) in timers.drain() {
            timer.handle.abort();
        }
        tracing::info!(cancelled = count, "idle monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    async fn setup() -> (Arc<MemoryStore>, IdleMonitor) {
        let store = Arc::new(MemoryStore::new());
        store.provision("dev", "secret").await.unwrap();
        store.record_activity("dev", 1).await.unwrap();
        let monitor = IdleMonitor::new(Duration::from_secs(60), store.clone());
        (store, monitor)
    }

    async fn status(store: &MemoryStore) -> DeviceStatus {
        store.find("dev").await.unwrap().unwrap().status
    }

    #[tokio::test(start_paused = true)]
    async fn device_turns_idle_after_silence() {
        let (store, monitor) = setup().await;
        monitor.touch("dev").await;

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(status(&store).await, DeviceStatus::Active);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(status(&store).await, DeviceStatus::Idle);
        assert_eq!(monitor.pending().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resets_the_timer() {
        let (store, monitor) = setup().await;
        monitor.touch("dev").await;
        tokio::time::sleep(Duration::from_secs(40)).await;
        monitor.touch("dev").await;
        assert_eq!(monitor.pending().await, 1);

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(status(&store).await, DeviceStatus::Active);

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(status(&store).await, DeviceStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn anomalous_device_is_left_alone() {
        let (store, monitor) = setup().await;
        monitor.touch("dev").await;
        store.set_status("dev", DeviceStatus::Anomalous).await.unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(status(&store).await, DeviceStatus::Anomalous);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_timers() {
        let (store, monitor) = setup().await;
        monitor.touch("dev").await;
        monitor.shutdown().await;
        assert_eq!(monitor.pending().await, 0);

        monitor.touch("dev").await;
        assert_eq!(monitor.pending().await, 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(status(&store).await, DeviceStatus::Active);
    }
}
