/*!
End-to-end lifecycle tests over an in-process bus.

These wire the coordinator pieces together the way `main` does, but
against the devkit's `MemoryBus` instead of a broker: heartbeats flow
into the registry, dispatches go out on per-device topics, simulated
agents echo results back, and the tracker and results log are asserted
on afterwards.
*/

use crate::config::CoordinatorConfig;
use crate::dispatch::{Dispatcher, PingRequest};
use crate::jobs::{Attribution, JobState, JobTracker};
use crate::models::{job_topic, HeartbeatMsg, JobEnvelope, ResultMsg, RESULT_TOPIC, STATUS_TOPIC};
use crate::registry::DeviceRegistry;
use crate::store::{MemoryStore, StoreWriter};
use pifleet_devkit::{init_test_logging, MemoryBus, MessageBuilder};
use std::sync::Arc;

const DEVICE_A: &str = "aa:bb:cc:dd:ee:01";
const DEVICE_B: &str = "aa:bb:cc:dd:ee:02";

/// The coordinator side, wired to a stub bus like `main` wires it to
/// the real one.
struct Harness {
    bus: MemoryBus,
    registry: DeviceRegistry,
    tracker: JobTracker,
    dispatcher: Dispatcher,
    store: StoreWriter,
}

impl Harness {
    fn new(cfg: CoordinatorConfig) -> Self {
        init_test_logging();
        let bus = MemoryBus::new();
        let registry = DeviceRegistry::new(cfg.stale_after_secs);
        let tracker = JobTracker::new();
        let store = StoreWriter::new(
            Arc::new(MemoryStore::new(None)),
            Arc::new(MemoryStore::new(Some(cfg.max_results))),
        );
        let dispatcher = Dispatcher::new(registry.clone(), tracker.clone(), &cfg);

        // Ingestion handlers, same shape as the subscriptions in main.
        {
            let registry = registry.clone();
            let store = store.clone();
            bus.subscribe(STATUS_TOPIC, move |_, payload| {
                if let Ok(msg) = serde_json::from_slice::<HeartbeatMsg>(payload) {
                    let now = msg.timestamp;
                    if registry.ingest_heartbeat(&msg, now) {
                        if let Some(state) = registry.get(&msg.device_id) {
                            store.record_device(&state);
                        }
                    }
                }
            });
        }
        {
            let tracker = tracker.clone();
            let store = store.clone();
            bus.subscribe(RESULT_TOPIC, move |_, payload| {
                if let Ok(msg) = serde_json::from_slice::<ResultMsg>(payload) {
                    tracker.record_result(&msg, 2000);
                    store.record_result(&msg, 2000);
                }
            });
        }

        Self { bus, registry, tracker, dispatcher, store }
    }

    fn heartbeat(&self, device_id: &str, ts: i64) {
        let msg = MessageBuilder::heartbeat(device_id, "online", ts);
        self.bus.publish(STATUS_TOPIC, msg.to_string().into_bytes());
    }

    /// Dispatch through prepare + bus, the way `submit` does against a
    /// real broker.
    fn dispatch(&self, target: &str) -> String {
        let req = PingRequest {
            target_device: target.into(),
            packet_count: 4,
            destination: "example.com".into(),
        };
        let prepared = self.dispatcher.prepare(&req, 1500).expect("dispatch rejected");
        // Same ordering as `submit`: the job reads as dispatched before
        // the payload goes out, so a result racing the publish still
        // correlates.
        self.tracker.mark_dispatched(&prepared.job_id, 1500);
        self.bus.publish(&prepared.topic, prepared.payload);
        prepared.job_id
    }

    /// A simulated agent on its dispatch topic: decodes the envelope and
    /// echoes a canned ping transcript back on `result`.
    fn attach_agent(&self, device_id: &str) {
        let bus = self.bus.clone();
        let device_id = device_id.to_string();
        self.bus.subscribe(&job_topic(&device_id), move |_, payload| {
            let envelope: JobEnvelope =
                serde_json::from_slice(payload).expect("agent received malformed envelope");
            envelope.decode_executable().expect("undecodable executable");
            let result =
                MessageBuilder::result(&device_id, &envelope.job_id, "4 packets transmitted, 4 received");
            bus.publish(RESULT_TOPIC, result.to_string().into_bytes());
        });
    }
}

#[test]
fn devkit_topics_match_the_wire_protocol() {
    // The devkit builders carry their own copies of the topic names; a
    // rename on either side must fail here, not silently detach the
    // harness from the wire.
    assert_eq!(pifleet_devkit::messages::STATUS_TOPIC, STATUS_TOPIC);
    assert_eq!(pifleet_devkit::messages::RESULT_TOPIC, RESULT_TOPIC);
    assert_eq!(pifleet_devkit::messages::job_topic(DEVICE_A), job_topic(DEVICE_A));
}

#[test]
fn heartbeat_registers_device_and_persists_it() {
    let h = Harness::new(CoordinatorConfig::default());

    h.heartbeat(DEVICE_A, 1000);

    let state = h.registry.get(DEVICE_A).expect("device not registered");
    assert_eq!(state.status, "online");
    assert_eq!(state.last_heartbeat_ts, 1000);
    assert_eq!(h.store.stored_devices().len(), 1);
}

#[test]
fn out_of_order_heartbeats_keep_the_newest_timestamp() {
    let h = Harness::new(CoordinatorConfig::default());

    h.heartbeat(DEVICE_A, 1000);
    h.heartbeat(DEVICE_A, 1010);
    h.heartbeat(DEVICE_A, 1005); // delayed redelivery

    let state = h.registry.get(DEVICE_A).unwrap();
    assert_eq!(state.last_heartbeat_ts, 1010);
    assert_eq!(h.registry.device_count(), 1);
}

#[test]
fn device_goes_stale_at_read_time() {
    let h = Harness::new(CoordinatorConfig::default());
    h.heartbeat(DEVICE_A, 1000);

    let fresh = h.registry.list_devices_at(1060);
    assert_eq!(fresh[0].status, "online");

    let later = h.registry.list_devices_at(1000 + 121);
    assert_eq!(later[0].status, "stale");
    assert_eq!(later[0].stale_for_seconds, 1);
}

#[test]
fn dispatch_reaches_only_the_target_device() {
    let h = Harness::new(CoordinatorConfig::default());
    h.heartbeat(DEVICE_A, 1000);
    h.heartbeat(DEVICE_B, 1000);

    h.dispatch(DEVICE_A);

    assert_eq!(h.bus.published_on(&job_topic(DEVICE_A)).len(), 1);
    assert_eq!(h.bus.published_on(&job_topic(DEVICE_B)).len(), 0);
}

#[test]
fn full_round_trip_correlates_exactly_one_result() {
    let h = Harness::new(CoordinatorConfig::default());
    h.heartbeat(DEVICE_A, 1000);
    h.attach_agent(DEVICE_A);

    let job_id = h.dispatch(DEVICE_A);

    let job = h.tracker.get_job(&job_id).unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.result.as_deref(), Some("4 packets transmitted, 4 received"));

    let results = h.store.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].job_id.as_deref(), Some(job_id.as_str()));
}

#[test]
fn three_devices_round_trip_independently() {
    let devices = ["aa:bb:cc:dd:ee:01", "aa:bb:cc:dd:ee:02", "aa:bb:cc:dd:ee:03"];
    let h = Harness::new(CoordinatorConfig::default());
    for d in devices {
        h.heartbeat(d, 1000);
        h.attach_agent(d);
    }

    let job_ids: Vec<String> = devices.iter().map(|d| h.dispatch(d)).collect();

    for (device, job_id) in devices.iter().zip(&job_ids) {
        let job = h.tracker.get_job(job_id).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(&job.device_id, device);
    }
    assert_eq!(h.store.results().len(), 3);
}

#[test]
fn unregistered_target_is_rejected_before_the_bus() {
    let h = Harness::new(CoordinatorConfig::default());

    let req = PingRequest {
        target_device: DEVICE_A.into(),
        packet_count: 4,
        destination: "example.com".into(),
    };
    assert!(h.dispatcher.prepare(&req, 1500).is_err());
    assert!(h.bus.published().is_empty());
    assert_eq!(h.tracker.job_count(), 0);
}

#[test]
fn compat_mode_attributes_bare_results_by_device() {
    let cfg = CoordinatorConfig { correlate_results: false, ..Default::default() };
    let h = Harness::new(cfg);

    // Compat agent: treats the payload as a raw script, reports with no
    // job id.
    {
        let bus = h.bus.clone();
        h.bus.subscribe(&job_topic(DEVICE_A), move |_, payload| {
            assert!(payload.starts_with(b"#!/bin/sh"));
            let result = MessageBuilder::bare_result(DEVICE_A, "4 packets transmitted");
            bus.publish(RESULT_TOPIC, result.to_string().into_bytes());
        });
    }

    let job_id = h.dispatch(DEVICE_A);

    let job = h.tracker.get_job(&job_id).unwrap();
    assert_eq!(job.state, JobState::Completed);
    let results = h.store.results();
    assert_eq!(results.len(), 1);
    assert!(results[0].job_id.is_none());
}

#[test]
fn uncorrelated_result_still_lands_in_the_log() {
    let h = Harness::new(CoordinatorConfig::default());

    // No job outstanding anywhere; the result is kept but attributed to
    // nothing.
    let msg = ResultMsg { device_id: DEVICE_A.into(), job_id: None, result: "stray".into() };
    assert_eq!(h.tracker.record_result(&msg, 2000), Attribution::Unattributed);
    h.store.record_result(&msg, 2000);

    assert_eq!(h.store.results().len(), 1);
    assert_eq!(h.tracker.job_count(), 0);
}
