/*!
Message bus client shim.

Thin wrapper over the MQTT client: `BusClient` owns the `AsyncClient`,
its own subscription table and the background delivery task. Nothing is
process-global; a client is constructed per process and `shutdown`
releases every subscription with it.

Delivery runs on the spawned task only, so publishing (from HTTP
handlers) and handling (ingestion) never block each other. A broker
outage is retried with a short sleep and is invisible above this module.
*/

use crate::config::MqttConf;
use crate::health::HealthTracker;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub type Handler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

pub struct BusClient {
    client: AsyncClient,
    subscriptions: Arc<Mutex<Vec<(String, Handler)>>>,
    delivery_task: JoinHandle<()>,
}

impl BusClient {
    /// Create the client and start the delivery loop. Does not wait for
    /// the broker: rumqttc connects (and reconnects) from the loop.
    pub fn connect(client_id: &str, cfg: &MqttConf, health: HealthTracker) -> Self {
        let mut opts = MqttOptions::new(client_id, &cfg.host, cfg.port);
        opts.set_keep_alive(Duration::from_secs(15));

        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        let subscriptions: Arc<Mutex<Vec<(String, Handler)>>> = Arc::new(Mutex::new(Vec::new()));

        let table = subscriptions.clone();
        let loop_client = client.clone();
        let delivery_task = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        println!("[bus] connected");
                        health.mark_bus_connected();
                        // A clean-session reconnect loses every broker-side
                        // subscription; replay the table on each ConnAck.
                        // try_ variant: the event loop is not being polled
                        // while this arm runs.
                        let patterns: Vec<String> =
                            table.lock().iter().map(|(p, _)| p.clone()).collect();
                        for pattern in patterns {
                            if let Err(e) =
                                loop_client.try_subscribe(&pattern, QoS::AtLeastOnce)
                            {
                                eprintln!("[bus] resubscribe to {pattern} failed: {e}");
                            }
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        // Clone matching handlers out of the lock before
                        // running them; handlers may subscribe or publish.
                        let matching: Vec<Handler> = table
                            .lock()
                            .iter()
                            .filter(|(pattern, _)| topic_matches(pattern, &p.topic))
                            .map(|(_, h)| h.clone())
                            .collect();
                        for handler in matching {
                            handler(&p.topic, &p.payload);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        eprintln!("[bus] connection error: {e:?}");
                        health.mark_bus_reconnecting();
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Self { client, subscriptions, delivery_task }
    }

    /// Register a handler and subscribe on the broker. Patterns use MQTT
    /// wildcards (`+`, trailing `#`). The pattern stays in the table and
    /// is replayed on every reconnect.
    pub async fn subscribe(&self, pattern: &str, handler: Handler) -> anyhow::Result<()> {
        self.subscriptions.lock().push((pattern.to_string(), handler));
        self.client.subscribe(pattern, QoS::AtLeastOnce).await?;
        println!("[bus] subscribed to {pattern}");
        Ok(())
    }

    /// Patterns currently held for replay.
    pub fn patterns(&self) -> Vec<String> {
        self.subscriptions.lock().iter().map(|(p, _)| p.clone()).collect()
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        self.client.publish(topic, QoS::AtLeastOnce, false, payload).await?;
        Ok(())
    }

    /// Drop all subscriptions, disconnect and stop the delivery loop.
    pub async fn shutdown(&self) {
        self.subscriptions.lock().clear();
        self.client.disconnect().await.ok();
        self.delivery_task.abort();
        println!("[bus] shut down");
    }
}

/// MQTT topic filter matching: `+` matches one level, a trailing `#`
/// matches everything below.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_parts = pattern.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
