/*!
Builders for the pifleet wire messages.

Produces the JSON payloads agents put on the bus, so tests and ad-hoc
tooling can feed the coordinator without a real device.
*/

use serde_json::{json, Value};

/// Topics of the fleet protocol.
pub const STATUS_TOPIC: &str = "status";
pub const RESULT_TOPIC: &str = "result";

pub fn job_topic(device_id: &str) -> String {
    format!("job/{}", device_id)
}

/// Wire message builders.
pub struct MessageBuilder;

impl MessageBuilder {
    /// Heartbeat as published on `status`.
    pub fn heartbeat(device_id: &str, status: &str, timestamp: i64) -> Value {
        json!({
            "device_id": device_id,
            "status": status,
            "timestamp": timestamp,
        })
    }

    /// Correlated result as published on `result`.
    pub fn result(device_id: &str, job_id: &str, result: &str) -> Value {
        json!({
            "device_id": device_id,
            "job_id": job_id,
            "result": result,
        })
    }

    /// Uncorrelated result (original protocol shape, no job id).
    pub fn bare_result(device_id: &str, result: &str) -> Value {
        json!({
            "device_id": device_id,
            "result": result,
        })
    }
}
