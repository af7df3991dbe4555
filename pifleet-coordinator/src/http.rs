/*!
Control-plane HTTP surface.

Read endpoints are pure views over coordinator state; `POST /ping` is the
one write and it only acknowledges that a payload went onto the bus.
"sent" never means "delivered".
*/

use crate::dispatch::{DispatchError, PingRequest, SharedDispatcher};
use crate::health::HealthTracker;
use crate::jobs::{JobRecord, JobTracker};
use crate::registry::{DeviceRegistry, DeviceView};
use crate::store::{ResultEntry, StoreWriter};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use time::OffsetDateTime;

#[derive(Clone)]
pub struct AppState {
    pub registry: DeviceRegistry,
    pub tracker: JobTracker,
    pub dispatcher: SharedDispatcher,
    pub store: StoreWriter,
    pub health: HealthTracker,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/ping", post(post_ping))
        .route("/pi_status", get(get_pi_status))
        .route("/ping_results", get(get_ping_results))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .with_state(app_state)
}

// POST /ping (dispatch a ping job to one device)
async fn post_ping(
    State(app): State<AppState>,
    Json(req): Json<PingRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    match app.dispatcher.submit(&req, now).await {
        Ok(ack) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": ack.status, "job_id": ack.job_id })),
        ),
        Err(e) => {
            let code = match &e {
                DispatchError::TargetNotRegistered(_) => StatusCode::NOT_FOUND,
                DispatchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                DispatchError::Bus(_) => StatusCode::BAD_GATEWAY,
            };
            (code, Json(serde_json::json!({ "error": e.to_string() })))
        }
    }
}

// GET /pi_status (full device registry, liveness resolved at read time)
async fn get_pi_status(State(app): State<AppState>) -> Json<Vec<DeviceView>> {
    Json(app.registry.list_devices())
}

// GET /ping_results (results log, oldest first, capped by retention)
async fn get_ping_results(State(app): State<AppState>) -> Json<Vec<ResultEntry>> {
    Json(app.store.results())
}

// GET /jobs (lifecycle tracker, oldest first)
async fn list_jobs(State(app): State<AppState>) -> Json<Vec<JobRecord>> {
    Json(app.tracker.list_jobs())
}

// GET /jobs/:id
async fn get_job(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, StatusCode> {
    app.tracker.get_job(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<crate::health::CoordinatorHealth> {
    Json(app.health.snapshot(&app.registry, &app.tracker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::dispatch::Dispatcher;
    use crate::models::HeartbeatMsg;
    use crate::store::{MemoryStore, RegistryStore};
    use std::sync::Arc;

    fn test_state() -> AppState {
        let registry = DeviceRegistry::new(120);
        let tracker = JobTracker::new();
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            tracker.clone(),
            &CoordinatorConfig::default(),
        ));
        let devices: Arc<dyn RegistryStore> = Arc::new(MemoryStore::new(None));
        let results: Arc<dyn RegistryStore> = Arc::new(MemoryStore::new(Some(100)));
        AppState {
            registry,
            tracker,
            dispatcher,
            store: StoreWriter::new(devices, results),
            health: HealthTracker::new(),
        }
    }

    #[tokio::test]
    async fn pi_status_reflects_heartbeat() {
        let app = test_state();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        app.registry.ingest_heartbeat(
            &HeartbeatMsg {
                device_id: "aa:bb:cc:dd:ee:ff".into(),
                status: "online".into(),
                timestamp: now,
            },
            now,
        );

        let Json(views) = get_pi_status(State(app)).await;
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].device_id, "aa:bb:cc:dd:ee:ff");
        assert_eq!(views[0].status, "online");
        assert_eq!(views[0].last_heartbeat_ts, now);
    }

    #[tokio::test]
    async fn ping_unregistered_target_is_404() {
        let app = test_state();
        let req = PingRequest {
            target_device: "aa:bb:cc:dd:ee:ff".into(),
            packet_count: 4,
            destination: "example.com".into(),
        };

        let (code, Json(body)) = post_ping(State(app.clone()), Json(req)).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not registered"));
        assert!(app.tracker.list_jobs().is_empty());
    }

    #[tokio::test]
    async fn ping_results_serve_the_log() {
        let app = test_state();
        app.store.record_result(
            &crate::models::ResultMsg {
                device_id: "aa:bb:cc:dd:ee:ff".into(),
                job_id: None,
                result: "4 packets transmitted".into(),
            },
            1000,
        );

        let Json(results) = get_ping_results(State(app)).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].device_id, "aa:bb:cc:dd:ee:ff");
        assert_eq!(results[0].result, "4 packets transmitted");
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let app = test_state();
        let res = get_job(State(app), Path("nope".into())).await;
        assert!(matches!(res, Err(StatusCode::NOT_FOUND)));
    }
}
