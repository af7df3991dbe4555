use crate::jobs::JobTracker;
use crate::registry::DeviceRegistry;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize)]
pub struct CoordinatorHealth {
    pub uptime_seconds: u64,
    pub devices_tracked: u32,
    pub jobs_tracked: u32,
    pub bus_status: String,
    pub bus_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    bus_reconnects: Arc<AtomicU32>,
    bus_status: Arc<parking_lot::Mutex<String>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            bus_reconnects: Arc::new(AtomicU32::new(0)),
            bus_status: Arc::new(parking_lot::Mutex::new("connecting".to_string())),
        }
    }

    pub fn mark_bus_connected(&self) {
        *self.bus_status.lock() = "connected".to_string();
    }

    pub fn mark_bus_reconnecting(&self) {
        self.bus_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.bus_status.lock() = "reconnecting".to_string();
    }

    pub fn snapshot(&self, registry: &DeviceRegistry, tracker: &JobTracker) -> CoordinatorHealth {
        CoordinatorHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            devices_tracked: registry.device_count() as u32,
            jobs_tracked: tracker.job_count() as u32,
            bus_status: self.bus_status.lock().clone(),
            bus_reconnects: self.bus_reconnects.load(Ordering::Relaxed),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}
