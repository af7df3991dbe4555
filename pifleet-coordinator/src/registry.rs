/*!
Device registry.

One entry per device, keyed by its MAC-derived identity. An entry is
created on the first heartbeat ever received and upserted on every later
one; nothing ever deletes it. Heartbeats are applied with logical
ordering: a report older than what the registry already holds is ignored,
so out-of-order delivery cannot roll freshness backwards.

Liveness is computed lazily at read time: a device whose last heartbeat
is older than the configured threshold is reported `stale`.
*/

use crate::models::{new_state, HeartbeatMsg, Shared};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: String,
    pub status: String,
    pub last_heartbeat_ts: i64,
    pub first_seen_ts: i64,
}

pub type DevicesMap = HashMap<String, DeviceState>;

/// Registry entry as exposed on the API, with liveness resolved.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    pub device_id: String,
    pub status: String,
    pub last_heartbeat_ts: i64,
    pub last_heartbeat: String,
    pub stale_for_seconds: i64,
}

#[derive(Clone)]
pub struct DeviceRegistry {
    devices: Shared<DevicesMap>,
    stale_after_secs: i64,
}

impl DeviceRegistry {
    pub fn new(stale_after_secs: i64) -> Self {
        Self { devices: new_state(HashMap::new()), stale_after_secs }
    }

    /// Apply one heartbeat. Returns false when the report was ignored for
    /// being older than the stored entry.
    pub fn ingest_heartbeat(&self, msg: &HeartbeatMsg, now: i64) -> bool {
        let mut devices = self.devices.lock();
        match devices.get_mut(&msg.device_id) {
            Some(existing) => {
                if msg.timestamp < existing.last_heartbeat_ts {
                    println!(
                        "[registry] ignoring out-of-order heartbeat from {} ({} < {})",
                        msg.device_id, msg.timestamp, existing.last_heartbeat_ts
                    );
                    return false;
                }
                existing.status = msg.status.clone();
                existing.last_heartbeat_ts = msg.timestamp;
            }
            None => {
                println!("[registry] new device {}", msg.device_id);
                devices.insert(
                    msg.device_id.clone(),
                    DeviceState {
                        device_id: msg.device_id.clone(),
                        status: msg.status.clone(),
                        last_heartbeat_ts: msg.timestamp,
                        first_seen_ts: now,
                    },
                );
            }
        }
        true
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.devices.lock().contains_key(device_id)
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }

    /// Current state of one device, for persistence.
    pub fn get(&self, device_id: &str) -> Option<DeviceState> {
        self.devices.lock().get(device_id).cloned()
    }

    /// Restore entries persisted by a previous run. Existing (fresher)
    /// entries win over restored ones.
    pub fn restore(&self, states: Vec<DeviceState>) {
        let mut devices = self.devices.lock();
        for state in states {
            devices.entry(state.device_id.clone()).or_insert(state);
        }
    }

    pub fn list_devices(&self) -> Vec<DeviceView> {
        self.list_devices_at(OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Read view at a given instant; liveness is resolved here, nothing is
    /// mutated. Sorted by device id for a stable API ordering.
    pub fn list_devices_at(&self, now: i64) -> Vec<DeviceView> {
        let mut views: Vec<DeviceView> = self
            .devices
            .lock()
            .values()
            .map(|d| self.to_view(d, now))
            .collect();
        views.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        views
    }

    fn to_view(&self, device: &DeviceState, now: i64) -> DeviceView {
        let age = (now - device.last_heartbeat_ts).max(0);
        let stale = age > self.stale_after_secs;
        let last_heartbeat = OffsetDateTime::from_unix_timestamp(device.last_heartbeat_ts)
            .ok()
            .and_then(|t| t.format(&Rfc3339).ok())
            .unwrap_or_default();
        DeviceView {
            device_id: device.device_id.clone(),
            status: if stale { "stale".into() } else { device.status.clone() },
            last_heartbeat_ts: device.last_heartbeat_ts,
            last_heartbeat,
            stale_for_seconds: if stale { age - self.stale_after_secs } else { 0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hb(device_id: &str, status: &str, timestamp: i64) -> HeartbeatMsg {
        HeartbeatMsg { device_id: device_id.into(), status: status.into(), timestamp }
    }

    #[test]
    fn newer_heartbeat_wins() {
        let registry = DeviceRegistry::new(120);
        registry.ingest_heartbeat(&hb("aa:bb:cc:dd:ee:ff", "online", 1000), 1000);
        registry.ingest_heartbeat(&hb("aa:bb:cc:dd:ee:ff", "busy", 1060), 1060);

        let views = registry.list_devices_at(1061);
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].status, "busy");
        assert_eq!(views[0].last_heartbeat_ts, 1060);
    }

    #[test]
    fn out_of_order_heartbeat_is_ignored() {
        let registry = DeviceRegistry::new(120);
        registry.ingest_heartbeat(&hb("aa:bb:cc:dd:ee:ff", "online", 1060), 1060);
        let applied = registry.ingest_heartbeat(&hb("aa:bb:cc:dd:ee:ff", "online", 1000), 1061);

        assert!(!applied);
        assert_eq!(registry.list_devices_at(1061)[0].last_heartbeat_ts, 1060);
    }

    #[test]
    fn duplicate_heartbeat_keeps_one_entry() {
        let registry = DeviceRegistry::new(120);
        let msg = hb("aa:bb:cc:dd:ee:ff", "online", 1000);
        registry.ingest_heartbeat(&msg, 1000);
        registry.ingest_heartbeat(&msg, 1000);

        assert_eq!(registry.device_count(), 1);
        assert_eq!(registry.list_devices_at(1000)[0].last_heartbeat_ts, 1000);
    }

    #[test]
    fn n_devices_n_entries() {
        let registry = DeviceRegistry::new(120);
        for i in 0..5 {
            let id = format!("aa:bb:cc:dd:ee:0{i}");
            registry.ingest_heartbeat(&hb(&id, "online", 1000 + i), 1000 + i);
        }

        let views = registry.list_devices_at(1010);
        assert_eq!(views.len(), 5);
        for (i, view) in views.iter().enumerate() {
            assert_eq!(view.last_heartbeat_ts, 1000 + i as i64);
        }
    }

    #[test]
    fn silent_device_reads_as_stale() {
        let registry = DeviceRegistry::new(120);
        registry.ingest_heartbeat(&hb("aa:bb:cc:dd:ee:ff", "online", 1000), 1000);

        let fresh = registry.list_devices_at(1100);
        assert_eq!(fresh[0].status, "online");
        assert_eq!(fresh[0].stale_for_seconds, 0);

        let stale = registry.list_devices_at(1300);
        assert_eq!(stale[0].status, "stale");
        assert_eq!(stale[0].stale_for_seconds, 180);
    }

    #[test]
    fn restore_does_not_clobber_live_entries() {
        let registry = DeviceRegistry::new(120);
        registry.ingest_heartbeat(&hb("aa:bb:cc:dd:ee:ff", "online", 2000), 2000);
        registry.restore(vec![DeviceState {
            device_id: "aa:bb:cc:dd:ee:ff".into(),
            status: "online".into(),
            last_heartbeat_ts: 1000,
            first_seen_ts: 500,
        }]);

        assert_eq!(registry.get("aa:bb:cc:dd:ee:ff").unwrap().last_heartbeat_ts, 2000);
    }
}
