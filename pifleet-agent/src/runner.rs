//! Job payload execution.
//!
//! A payload is either a correlation envelope (JSON with a base64
//! executable) or, in the original protocol shape, the raw executable
//! bytes themselves. Either way the executable is written to the work
//! directory, marked executable, run to completion with a timeout, and
//! removed again.
//!
//! There is no separate failure channel on the wire: a non-zero exit, a
//! missing interpreter or a timeout all end up as text in the result,
//! exactly like regular output.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

/// Envelope published by the coordinator when correlation is enabled.
#[derive(Debug, Deserialize)]
struct JobEnvelope {
    job_id: String,
    executable: String,
}

/// Outcome of executing one payload.
#[derive(Debug)]
pub struct JobOutcome {
    /// Echoed back in the result message when the payload carried one.
    pub job_id: Option<String>,
    pub output: String,
}

/// Execute a job payload and capture its combined output.
pub async fn run_payload(payload: &[u8], work_dir: &Path, timeout_secs: u64) -> JobOutcome {
    let (job_id, executable) = decode_payload(payload);
    let executable = match executable {
        Ok(bytes) => bytes,
        Err(e) => {
            return JobOutcome { job_id, output: format!("invalid payload encoding: {e}") };
        }
    };

    let output = execute(&executable, work_dir, timeout_secs).await;
    JobOutcome { job_id, output }
}

/// Split a payload into its optional correlation id and executable bytes.
fn decode_payload(payload: &[u8]) -> (Option<String>, Result<Vec<u8>, base64::DecodeError>) {
    match serde_json::from_slice::<JobEnvelope>(payload) {
        Ok(envelope) => {
            debug!("payload is an envelope for job {}", envelope.job_id);
            let bytes = BASE64.decode(&envelope.executable);
            (Some(envelope.job_id), bytes)
        }
        // Not JSON we recognize: raw executable, no correlation id.
        Err(_) => (None, Ok(payload.to_vec())),
    }
}

async fn execute(executable: &[u8], work_dir: &Path, timeout_secs: u64) -> String {
    let path = work_dir.join(format!("job-{}.sh", Uuid::new_v4()));

    if let Err(e) = tokio::fs::write(&path, executable).await {
        return format!("failed to write payload: {e}");
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)) {
            tokio::fs::remove_file(&path).await.ok();
            return format!("failed to mark payload executable: {e}");
        }
    }

    info!("executing job payload {}", path.display());
    // kill_on_drop so a timed-out job does not keep running behind us
    let result = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        Command::new(&path).kill_on_drop(true).output(),
    )
    .await;

    tokio::fs::remove_file(&path).await.ok();

    match result {
        Ok(Ok(output)) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut combined = if stderr.is_empty() {
                stdout.to_string()
            } else {
                format!("{}\nSTDERR:\n{}", stdout, stderr)
            };
            if !output.status.success() {
                let code = output.status.code().unwrap_or(-1);
                combined = format!("{}\n(exit code {})", combined.trim_end(), code);
            }
            combined
        }
        Ok(Err(e)) => format!("failed to execute payload: {e}"),
        Err(_) => format!("job timed out after {timeout_secs}s"),
    }
}
