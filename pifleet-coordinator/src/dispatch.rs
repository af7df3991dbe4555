/*!
Job dispatch.

A ping request is turned into a self-contained shell script, wrapped in a
correlation envelope, and published fire-and-forget on the target's
dispatch topic. Nothing waits for delivery: the acknowledgment only says
the payload went onto the bus.

Payload construction is a pure function of the request parameters and can
optionally be memoized per (packet_count, destination).
*/

use crate::bus::BusClient;
use crate::config::CoordinatorConfig;
use crate::jobs::JobTracker;
use crate::models::{job_topic, new_state, JobEnvelope, Shared};
use crate::registry::DeviceRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct PingRequest {
    pub target_device: String,
    pub packet_count: u32,
    pub destination: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchAck {
    pub status: String,
    pub job_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("target device not registered: {0}")]
    TargetNotRegistered(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("bus publish failed: {0}")]
    Bus(String),
}

/// Everything `submit` does short of touching the broker.
#[derive(Debug)]
pub struct PreparedJob {
    pub job_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Build the ping diagnostic script for a request.
pub fn build_ping_script(packet_count: u32, destination: &str) -> Result<Vec<u8>, DispatchError> {
    if packet_count == 0 {
        return Err(DispatchError::InvalidRequest("packet_count must be at least 1".into()));
    }
    if destination.is_empty() {
        return Err(DispatchError::InvalidRequest("destination must not be empty".into()));
    }
    // The destination lands inside single quotes in the script; reject
    // anything that could break out of them.
    if destination.chars().any(|c| c == '\'' || c.is_whitespace() || c.is_control()) {
        return Err(DispatchError::InvalidRequest(format!(
            "destination contains unsafe characters: {destination:?}"
        )));
    }
    Ok(format!("#!/bin/sh\nping -c {packet_count} '{destination}'\n").into_bytes())
}

pub struct Dispatcher {
    registry: DeviceRegistry,
    tracker: JobTracker,
    bus: Option<Arc<BusClient>>,
    /// Some(..) when payload memoization is enabled.
    cache: Option<Shared<HashMap<(u32, String), Vec<u8>>>>,
    correlate: bool,
    builds: AtomicU64,
}

impl Dispatcher {
    pub fn new(registry: DeviceRegistry, tracker: JobTracker, cfg: &CoordinatorConfig) -> Self {
        Self {
            registry,
            tracker,
            bus: None,
            cache: cfg.cache_payloads.then(|| new_state(HashMap::new())),
            correlate: cfg.correlate_results,
            builds: AtomicU64::new(0),
        }
    }

    pub fn with_bus(mut self, bus: Arc<BusClient>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Scripts actually built (cache misses count, cache hits do not).
    pub fn build_count(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    fn payload_script(&self, req: &PingRequest) -> Result<Vec<u8>, DispatchError> {
        if let Some(cache) = &self.cache {
            let key = (req.packet_count, req.destination.clone());
            if let Some(script) = cache.lock().get(&key) {
                return Ok(script.clone());
            }
            let script = build_ping_script(req.packet_count, &req.destination)?;
            self.builds.fetch_add(1, Ordering::Relaxed);
            cache.lock().insert(key, script.clone());
            Ok(script)
        } else {
            self.builds.fetch_add(1, Ordering::Relaxed);
            build_ping_script(req.packet_count, &req.destination)
        }
    }

    /// Validate, build the payload and register the job, without
    /// publishing. Split out so the whole dispatch path is testable
    /// against a bus stub.
    pub fn prepare(&self, req: &PingRequest, now: i64) -> Result<PreparedJob, DispatchError> {
        if self.correlate && !self.registry.contains(&req.target_device) {
            return Err(DispatchError::TargetNotRegistered(req.target_device.clone()));
        }

        let script = self.payload_script(req)?;
        let job_id = Uuid::new_v4().to_string();
        self.tracker.create(&job_id, &req.target_device, now);

        let payload = if self.correlate {
            serde_json::to_vec(&JobEnvelope::wrap(&job_id, &script))
                .map_err(|e| DispatchError::InvalidRequest(e.to_string()))?
        } else {
            // Original wire shape: raw executable bytes, no envelope.
            script
        };

        Ok(PreparedJob { job_id, topic: job_topic(&req.target_device), payload })
    }

    /// Dispatch a job: build, publish, acknowledge. Fire-and-forget, so
    /// a returned ack does not mean the device received anything.
    pub async fn submit(&self, req: &PingRequest, now: i64) -> Result<DispatchAck, DispatchError> {
        let prepared = self.prepare(req, now)?;

        // Marked before the publish await: a result racing it back over
        // the bus must find the job dispatched, not requested. A failed
        // publish expires the job instead of leaving it hanging.
        self.tracker.mark_dispatched(&prepared.job_id, now);

        let published = match self.bus.as_ref() {
            Some(bus) => bus
                .publish(&prepared.topic, prepared.payload)
                .await
                .map_err(|e| DispatchError::Bus(e.to_string())),
            None => Err(DispatchError::Bus("bus client not configured".into())),
        };
        if let Err(e) = published {
            self.tracker.expire(&prepared.job_id, now);
            return Err(e);
        }

        println!(
            "[dispatch] job {} sent to {} ({} packets to {})",
            prepared.job_id, req.target_device, req.packet_count, req.destination
        );
        Ok(DispatchAck { status: "sent".into(), job_id: prepared.job_id })
    }
}

pub type SharedDispatcher = Arc<Dispatcher>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobState;
    use crate::models::HeartbeatMsg;

    fn registered_registry(device_id: &str) -> DeviceRegistry {
        let registry = DeviceRegistry::new(120);
        registry.ingest_heartbeat(
            &HeartbeatMsg { device_id: device_id.into(), status: "online".into(), timestamp: 1000 },
            1000,
        );
        registry
    }

    fn request(target: &str) -> PingRequest {
        PingRequest { target_device: target.into(), packet_count: 4, destination: "example.com".into() }
    }

    #[test]
    fn script_is_deterministic() {
        let a = build_ping_script(4, "example.com").unwrap();
        let b = build_ping_script(4, "example.com").unwrap();
        assert_eq!(a, b);
        assert_eq!(String::from_utf8(a).unwrap(), "#!/bin/sh\nping -c 4 'example.com'\n");
    }

    #[test]
    fn script_rejects_shell_breakouts() {
        assert!(matches!(
            build_ping_script(4, "a'; rm -rf /"),
            Err(DispatchError::InvalidRequest(_))
        ));
        assert!(matches!(build_ping_script(0, "example.com"), Err(DispatchError::InvalidRequest(_))));
        assert!(matches!(build_ping_script(4, ""), Err(DispatchError::InvalidRequest(_))));
    }

    #[test]
    fn prepare_rejects_unregistered_target() {
        let registry = DeviceRegistry::new(120);
        let tracker = JobTracker::new();
        let dispatcher = Dispatcher::new(registry, tracker.clone(), &CoordinatorConfig::default());

        let err = dispatcher.prepare(&request("aa:bb:cc:dd:ee:ff"), 1000).unwrap_err();
        assert!(matches!(err, DispatchError::TargetNotRegistered(_)));
        assert_eq!(tracker.job_count(), 0);
    }

    #[test]
    fn prepare_wraps_payload_in_envelope() {
        let registry = registered_registry("aa:bb:cc:dd:ee:ff");
        let tracker = JobTracker::new();
        let dispatcher = Dispatcher::new(registry, tracker.clone(), &CoordinatorConfig::default());

        let prepared = dispatcher.prepare(&request("aa:bb:cc:dd:ee:ff"), 1000).unwrap();
        assert_eq!(prepared.topic, "job/aa:bb:cc:dd:ee:ff");

        let envelope: JobEnvelope = serde_json::from_slice(&prepared.payload).unwrap();
        assert_eq!(envelope.job_id, prepared.job_id);
        let script = envelope.decode_executable().unwrap();
        assert!(String::from_utf8(script).unwrap().contains("ping -c 4"));

        assert_eq!(tracker.get_job(&prepared.job_id).unwrap().state, JobState::Requested);
    }

    #[test]
    fn compat_mode_sends_raw_bytes_and_skips_registry_check() {
        let registry = DeviceRegistry::new(120);
        let tracker = JobTracker::new();
        let cfg = CoordinatorConfig { correlate_results: false, ..Default::default() };
        let dispatcher = Dispatcher::new(registry, tracker, &cfg);

        // Target never sent a heartbeat; compat mode dispatches anyway.
        let prepared = dispatcher.prepare(&request("aa:bb:cc:dd:ee:ff"), 1000).unwrap();
        assert!(prepared.payload.starts_with(b"#!/bin/sh"));
    }

    #[tokio::test]
    async fn failed_publish_expires_the_job() {
        let registry = registered_registry("aa:bb:cc:dd:ee:ff");
        let tracker = JobTracker::new();
        let dispatcher = Dispatcher::new(registry, tracker.clone(), &CoordinatorConfig::default());

        // No bus configured: the publish path fails after the job exists.
        let err = dispatcher.submit(&request("aa:bb:cc:dd:ee:ff"), 1000).await.unwrap_err();
        assert!(matches!(err, DispatchError::Bus(_)));

        let jobs = tracker.list_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state, JobState::TimedOut);
    }

    #[test]
    fn cache_builds_once_per_parameters() {
        let registry = registered_registry("aa:bb:cc:dd:ee:ff");
        let cfg = CoordinatorConfig { cache_payloads: true, ..Default::default() };
        let dispatcher = Dispatcher::new(registry, JobTracker::new(), &cfg);

        dispatcher.prepare(&request("aa:bb:cc:dd:ee:ff"), 1000).unwrap();
        dispatcher.prepare(&request("aa:bb:cc:dd:ee:ff"), 1001).unwrap();
        assert_eq!(dispatcher.build_count(), 1);

        let mut other = request("aa:bb:cc:dd:ee:ff");
        other.packet_count = 8;
        dispatcher.prepare(&other, 1002).unwrap();
        assert_eq!(dispatcher.build_count(), 2);
    }

    #[test]
    fn without_cache_every_prepare_rebuilds() {
        let registry = registered_registry("aa:bb:cc:dd:ee:ff");
        let dispatcher =
            Dispatcher::new(registry, JobTracker::new(), &CoordinatorConfig::default());

        dispatcher.prepare(&request("aa:bb:cc:dd:ee:ff"), 1000).unwrap();
        dispatcher.prepare(&request("aa:bb:cc:dd:ee:ff"), 1001).unwrap();
        assert_eq!(dispatcher.build_count(), 2);
    }
}
