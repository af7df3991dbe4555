/*!
Job lifecycle tracker.

Every dispatched job is modeled from creation to a terminal state:

    Requested -> Dispatched -> Completed
            \              \-> TimedOut
             \-> TimedOut (never reached the bus)

Results correlate by the job id echoed back in the result message. When a
result carries no job id (original protocol shape) attribution falls back
to the device identity, which is only unambiguous while that device has
exactly one outstanding job.
*/

use crate::models::{new_state, ResultMsg, Shared};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Requested,
    Dispatched,
    Completed,
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub device_id: String,
    pub state: JobState,
    pub created_ts: i64,
    pub updated_ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// How a result message was attributed to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribution {
    /// Matched by job id.
    Correlated(String),
    /// No job id on the message; matched the single outstanding job for
    /// the reporting device.
    DeviceFallback(String),
    /// No job could be identified; the result is kept in the log only.
    Unattributed,
}

#[derive(Clone)]
pub struct JobTracker {
    jobs: Shared<HashMap<String, JobRecord>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self { jobs: new_state(HashMap::new()) }
    }

    pub fn create(&self, job_id: &str, device_id: &str, now: i64) {
        self.jobs.lock().insert(
            job_id.to_string(),
            JobRecord {
                job_id: job_id.to_string(),
                device_id: device_id.to_string(),
                state: JobState::Requested,
                created_ts: now,
                updated_ts: now,
                result: None,
            },
        );
    }

    pub fn mark_dispatched(&self, job_id: &str, now: i64) {
        if let Some(job) = self.jobs.lock().get_mut(job_id) {
            job.state = JobState::Dispatched;
            job.updated_ts = now;
        }
    }

    /// Force a job to `TimedOut` immediately. Used when dispatch could
    /// not hand the payload to the bus; the job must not sit in a
    /// non-terminal state waiting for a result that can never come.
    pub fn expire(&self, job_id: &str, now: i64) {
        if let Some(job) = self.jobs.lock().get_mut(job_id) {
            job.state = JobState::TimedOut;
            job.updated_ts = now;
            println!("[jobs] job {} for {} expired at dispatch", job.job_id, job.device_id);
        }
    }

    /// Attribute a result to a job. Never fails: an uncorrelatable result
    /// is reported as such and the caller keeps it in the results log
    /// regardless.
    pub fn record_result(&self, msg: &ResultMsg, now: i64) -> Attribution {
        let mut jobs = self.jobs.lock();

        if let Some(job_id) = &msg.job_id {
            return match jobs.get_mut(job_id) {
                Some(job) if job.state == JobState::Dispatched => {
                    job.state = JobState::Completed;
                    job.updated_ts = now;
                    job.result = Some(msg.result.clone());
                    Attribution::Correlated(job_id.clone())
                }
                Some(job) => {
                    println!(
                        "[jobs] late result for job {} in state {:?}, keeping log entry only",
                        job_id, job.state
                    );
                    Attribution::Unattributed
                }
                None => {
                    println!("[jobs] result for unknown job {}", job_id);
                    Attribution::Unattributed
                }
            };
        }

        // Degraded mode: attribute by device identity, but only when that
        // is unambiguous.
        let mut outstanding: Vec<&mut JobRecord> = jobs
            .values_mut()
            .filter(|j| j.device_id == msg.device_id && j.state == JobState::Dispatched)
            .collect();
        match outstanding.len() {
            1 => {
                let job = outstanding.remove(0);
                job.state = JobState::Completed;
                job.updated_ts = now;
                job.result = Some(msg.result.clone());
                Attribution::DeviceFallback(job.job_id.clone())
            }
            0 => Attribution::Unattributed,
            n => {
                println!(
                    "[jobs] {} outstanding jobs for {}, result attribution ambiguous",
                    n, msg.device_id
                );
                Attribution::Unattributed
            }
        }
    }

    /// Transition non-terminal jobs past the bound to TimedOut. Returns
    /// how many were expired. A job still `Requested` here never made it
    /// onto the bus; it expires like one whose result never came back.
    pub fn sweep_timeouts(&self, now: i64, bound_secs: i64) -> usize {
        let mut expired = 0;
        for job in self.jobs.lock().values_mut() {
            let pending = matches!(job.state, JobState::Requested | JobState::Dispatched);
            if pending && now - job.updated_ts > bound_secs {
                job.state = JobState::TimedOut;
                job.updated_ts = now;
                expired += 1;
                println!("[jobs] job {} for {} timed out", job.job_id, job.device_id);
            }
        }
        expired
    }

    pub fn get_job(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.lock().get(job_id).cloned()
    }

    /// All jobs, oldest first.
    pub fn list_jobs(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self.jobs.lock().values().cloned().collect();
        jobs.sort_by(|a, b| a.created_ts.cmp(&b.created_ts).then(a.job_id.cmp(&b.job_id)));
        jobs
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Periodic timeout sweep, in the tracker's own task.
    pub fn spawn_timeout_monitor(tracker: JobTracker, bound_secs: i64) {
        println!("[jobs] starting timeout monitor (bound: {}s)", bound_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(15));
            loop {
                interval.tick().await;
                let now = OffsetDateTime::now_utc().unix_timestamp();
                tracker.sweep_timeouts(now, bound_secs);
            }
        });
    }
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}
