/*!
PIFLEET COORDINATOR - control plane of the device fleet.

Tracks device liveness from heartbeats on the bus, dispatches ad-hoc
executable jobs to individual devices over device-scoped topics, ingests
and correlates their results, and exposes the whole picture over a REST
API. No direct connection to any device: everything goes through MQTT.
*/

mod bus;
mod config;
mod dispatch;
mod health;
mod http;
mod jobs;
#[cfg(test)]
mod lifecycle_tests;
mod models;
mod registry;
mod store;

use crate::bus::BusClient;
use crate::config::load_config;
use crate::dispatch::Dispatcher;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::jobs::JobTracker;
use crate::models::{HeartbeatMsg, ResultMsg, RESULT_TOPIC, STATUS_TOPIC};
use crate::registry::DeviceRegistry;
use crate::store::{JsonFileStore, MemoryStore, RegistryStore, StoreWriter};

use std::net::SocketAddr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::net::TcpListener;

fn open_store(path: &str, cap: Option<usize>) -> Arc<dyn RegistryStore> {
    match JsonFileStore::open(path, cap) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("[coordinator] failed to open {path}: {e}, falling back to memory store");
            Arc::new(MemoryStore::new(cap))
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let cfg = load_config().await;

    std::fs::create_dir_all(&cfg.data_dir).unwrap_or_else(|e| {
        eprintln!("[coordinator] warning: failed to create data dir: {e}");
    });

    let devices_store = open_store(&format!("{}/devices.json", cfg.data_dir), None);
    let results_store =
        open_store(&format!("{}/results.json", cfg.data_dir), Some(cfg.max_results));
    let store = StoreWriter::new(devices_store, results_store);

    let registry = DeviceRegistry::new(cfg.stale_after_secs);
    let restored = store.stored_devices();
    if !restored.is_empty() {
        println!("[coordinator] restored {} devices from store", restored.len());
        registry.restore(restored);
    }

    let tracker = JobTracker::new();
    let health = HealthTracker::new();

    let bus = Arc::new(BusClient::connect("pifleet-coordinator", &cfg.mqtt, health.clone()));

    // Heartbeat ingestion: status topic -> registry -> device store.
    {
        let registry = registry.clone();
        let store = store.clone();
        let subscribed = bus
            .subscribe(
                STATUS_TOPIC,
                Arc::new(move |_topic, payload| {
                    let msg: HeartbeatMsg = match serde_json::from_slice(payload) {
                        Ok(msg) => msg,
                        Err(e) => {
                            eprintln!("[coordinator] invalid heartbeat: {e}");
                            return;
                        }
                    };
                    let now = OffsetDateTime::now_utc().unix_timestamp();
                    if registry.ingest_heartbeat(&msg, now) {
                        if let Some(state) = registry.get(&msg.device_id) {
                            store.record_device(&state);
                        }
                    }
                }),
            )
            .await;
        if let Err(e) = subscribed {
            eprintln!("[coordinator] failed to subscribe to {STATUS_TOPIC}: {e}");
        }
    }

    // Result ingestion: result topic -> tracker correlation -> results log.
    {
        let tracker = tracker.clone();
        let store = store.clone();
        let subscribed = bus
            .subscribe(
                RESULT_TOPIC,
                Arc::new(move |_topic, payload| {
                    let msg: ResultMsg = match serde_json::from_slice(payload) {
                        Ok(msg) => msg,
                        Err(e) => {
                            eprintln!("[coordinator] invalid result: {e}");
                            return;
                        }
                    };
                    let now = OffsetDateTime::now_utc().unix_timestamp();
                    let attribution = tracker.record_result(&msg, now);
                    println!(
                        "[coordinator] result from {} ({:?})",
                        msg.device_id, attribution
                    );
                    store.record_result(&msg, now);
                }),
            )
            .await;
        if let Err(e) = subscribed {
            eprintln!("[coordinator] failed to subscribe to {RESULT_TOPIC}: {e}");
        }
    }

    let dispatcher =
        Arc::new(Dispatcher::new(registry.clone(), tracker.clone(), &cfg).with_bus(bus.clone()));

    JobTracker::spawn_timeout_monitor(tracker.clone(), cfg.job_timeout_secs);

    let app_state = AppState { registry, tracker, dispatcher, store, health };
    let app = http::build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    println!("[coordinator] listening on http://{addr}");
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("[coordinator] failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    tokio::select! {
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                eprintln!("[coordinator] server error: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!("[coordinator] shutting down");
        }
    }
    bus.shutdown().await;
}
