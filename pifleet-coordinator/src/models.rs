/*!
Wire protocol of the fleet bus.

Three topics:
- `status`         : every agent -> coordinator, JSON heartbeat
- `job/<deviceId>` : coordinator -> one agent, job payload
- `result`         : every agent -> coordinator, JSON job result

Device ids are colon-separated lowercase MAC addresses; timestamps are
unix seconds.
*/

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

pub const STATUS_TOPIC: &str = "status";
pub const RESULT_TOPIC: &str = "result";
pub const JOB_TOPIC_PREFIX: &str = "job/";

/// Dispatch topic for one device.
pub fn job_topic(device_id: &str) -> String {
    format!("{}{}", JOB_TOPIC_PREFIX, device_id)
}

/// Liveness report published on `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMsg {
    pub device_id: String,
    pub status: String,
    pub timestamp: i64,
}

/// Job outcome published on `result`.
///
/// `job_id` is absent when the reporting agent received a raw payload
/// (original protocol shape); attribution then falls back to the device
/// identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMsg {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub result: String,
}

/// Envelope carried on `job/<deviceId>` when correlation is enabled.
///
/// The executable travels base64-encoded so the envelope stays valid JSON
/// regardless of payload bytes. In compatibility mode the coordinator
/// publishes the raw executable instead, with no envelope at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_id: String,
    pub executable: String,
}

impl JobEnvelope {
    pub fn wrap(job_id: &str, executable: &[u8]) -> Self {
        Self {
            job_id: job_id.to_string(),
            executable: BASE64.encode(executable),
        }
    }

    pub fn decode_executable(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.executable)
    }
}
