use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub mqtt: MqttConf,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// A device is reported stale past this age (2x the heartbeat period).
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: i64,
    /// Dispatched jobs with no result within this bound become timed out.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: i64,
    /// Retention cap on the results log.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Memoize built payloads by (packet_count, destination).
    #[serde(default)]
    pub cache_payloads: bool,
    /// false reproduces the original wire shape: raw payloads without a
    /// correlation envelope and no target-existence check at dispatch.
    #[serde(default = "default_true")]
    pub correlate_results: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

fn default_http_port() -> u16 {
    8080
}
fn default_data_dir() -> String {
    "./data".into()
}
fn default_stale_after_secs() -> i64 {
    120
}
fn default_job_timeout_secs() -> i64 {
    120
}
fn default_max_results() -> usize {
    1000
}
fn default_true() -> bool {
    true
}

impl Default for MqttConf {
    fn default() -> Self {
        Self { host: "localhost".into(), port: 1883 }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConf::default(),
            http_port: default_http_port(),
            data_dir: default_data_dir(),
            stale_after_secs: default_stale_after_secs(),
            job_timeout_secs: default_job_timeout_secs(),
            max_results: default_max_results(),
            cache_payloads: false,
            correlate_results: true,
        }
    }
}

pub async fn load_config() -> CoordinatorConfig {
    let path =
        std::env::var("PIFLEET_COORDINATOR_CONFIG").unwrap_or_else(|_| "coordinator.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return CoordinatorConfig::default();
        }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            eprintln!("[config] invalid {path}: {e}");
            CoordinatorConfig::default()
        })
    } else {
        eprintln!("[config] no {path}, using defaults");
        CoordinatorConfig::default()
    }
}
