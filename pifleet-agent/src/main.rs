//! pifleet agent - one device's side of the fleet protocol.
//!
//! - Resolves a stable identity from the primary network interface MAC
//! - Publishes a heartbeat on the shared `status` topic every period
//! - Receives job payloads on its own `job/<device_id>` topic, executes
//!   them and publishes the outcome on the shared `result` topic
//!
//! Jobs run inline on the delivery loop, so at most one executes at a
//! time; a payload arriving mid-execution waits in the bus client.

mod identity;
mod runner;

use anyhow::{Context, Result};
use chrono::Utc;
use identity::DeviceIdentity;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

const STATUS_TOPIC: &str = "status";
const RESULT_TOPIC: &str = "result";

/// Agent configuration, from environment with sane defaults.
#[derive(Debug, Clone)]
struct AgentConfig {
    broker_host: String,
    broker_port: u16,
    heartbeat_secs: u64,
    exec_timeout_secs: u64,
    work_dir: PathBuf,
}

impl AgentConfig {
    fn from_env() -> Self {
        let env = |key: &str| std::env::var(key).ok();
        Self {
            broker_host: env("PIFLEET_BROKER_HOST").unwrap_or_else(|| "localhost".into()),
            broker_port: env("PIFLEET_BROKER_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1883),
            heartbeat_secs: env("PIFLEET_HEARTBEAT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            exec_timeout_secs: env("PIFLEET_EXEC_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
            work_dir: env("PIFLEET_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
        }
    }
}

/// Heartbeat as published on `status`.
#[derive(Debug, Serialize)]
struct HeartbeatMsg {
    device_id: String,
    status: String,
    timestamp: i64,
}

/// Job outcome as published on `result`.
#[derive(Debug, Serialize)]
struct ResultMsg {
    device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<String>,
    result: String,
}

struct Agent {
    config: AgentConfig,
    identity: DeviceIdentity,
    mqtt_client: AsyncClient,
    eventloop: EventLoop,
    job_topic: String,
}

impl Agent {
    fn new(config: AgentConfig) -> Result<Self> {
        let identity = identity::resolve_identity().context("identity resolution failed")?;

        let client_id = format!("pifleet-agent-{}", identity.device_id.replace(':', ""));
        let mut opts = MqttOptions::new(&client_id, &config.broker_host, config.broker_port);
        opts.set_keep_alive(Duration::from_secs(30));
        opts.set_clean_session(true);

        let (mqtt_client, eventloop) = AsyncClient::new(opts, 10);
        let job_topic = format!("job/{}", identity.device_id);

        info!(
            "agent initialized - device {} on {} ({})",
            identity.device_id, identity.interface, identity.hostname
        );

        Ok(Self { config, identity, mqtt_client, eventloop, job_topic })
    }

    async fn run(&mut self) -> Result<()> {
        let mut heartbeat_timer = interval(Duration::from_secs(self.config.heartbeat_secs));

        loop {
            tokio::select! {
                _ = heartbeat_timer.tick() => {
                    // Best effort: a failed heartbeat is skipped, the
                    // next tick tries again.
                    if let Err(e) = self.send_heartbeat().await {
                        error!("failed to send heartbeat: {e}");
                    }
                }

                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        // Clean session: the broker forgets this
                        // subscription on every reconnect, so it is
                        // re-issued on every ConnAck. try_ variant
                        // because the event loop is not polled here.
                        match self.mqtt_client.try_subscribe(&self.job_topic, QoS::AtLeastOnce) {
                            Ok(()) => info!("subscribed to {}", self.job_topic),
                            Err(e) => error!("failed to subscribe to {}: {e}", self.job_topic),
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if publish.topic == self.job_topic {
                            self.handle_job(&publish.payload).await;
                        } else {
                            debug!("ignoring message on {}", publish.topic);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT connection error: {e}. Reconnecting...");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }
    }

    async fn send_heartbeat(&self) -> Result<()> {
        let heartbeat = HeartbeatMsg {
            device_id: self.identity.device_id.clone(),
            status: "online".to_string(),
            timestamp: Utc::now().timestamp(),
        };
        let payload = serde_json::to_string(&heartbeat)?;
        self.mqtt_client
            .publish(STATUS_TOPIC, QoS::AtLeastOnce, false, payload)
            .await
            .context("failed to publish heartbeat")?;
        debug!("heartbeat sent");
        Ok(())
    }

    /// Execute one payload and report the outcome. Runs inline so jobs
    /// serialize; execution problems become result text, not errors.
    async fn handle_job(&self, payload: &[u8]) {
        info!("job payload received ({} bytes)", payload.len());
        let outcome =
            runner::run_payload(payload, &self.config.work_dir, self.config.exec_timeout_secs)
                .await;

        let result = ResultMsg {
            device_id: self.identity.device_id.clone(),
            job_id: outcome.job_id,
            result: outcome.output,
        };
        match serde_json::to_string(&result) {
            Ok(json) => {
                if let Err(e) = self
                    .mqtt_client
                    .publish(RESULT_TOPIC, QoS::AtLeastOnce, false, json)
                    .await
                {
                    error!("failed to publish result: {e}");
                }
            }
            Err(e) => error!("failed to serialize result: {e}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let config = AgentConfig::from_env();
    info!("pifleet agent starting (broker {}:{})", config.broker_host, config.broker_port);

    let mut agent = Agent::new(config).context("failed to create agent")?;
    agent.run().await.context("agent execution failed")?;
    Ok(())
}
