use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, ConnectionError, Event, MqttOptions};
use rumqttc::Transport;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::Notifier;

#[derive(Clone, Debug)]
pub struct MqttConfig {
    /// Broker address, `host:port` with optional `mqtt://` or `mqtts://`.
    pub broker: String,
    pub topic_prefix: String,
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "127.0.0.1:1883".to_string(),
            topic_prefix: "detectord".to_string(),
            client_id: "detectord".to_string(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct BrokerEndpoint {
    host: String,
    port: u16,
    use_tls: bool,
}

fn parse_broker(addr: &str) -> Result<BrokerEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = remainder
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    let port: u16 = port.parse().context("invalid MQTT port")?;
    Ok(BrokerEndpoint {
        host: host.to_string(),
        port,
        use_tls,
    })
}

/// Pause between reconnect attempts after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, PartialEq, Eq)]
enum ConnectionAction {
    Continue,
    Retry,
    Stop,
}

fn on_connection_event(event: &Result<Event, ConnectionError>, stopping: bool) -> ConnectionAction {
    match event {
        Ok(_) => ConnectionAction::Continue,
        Err(ConnectionError::RequestsDone) => ConnectionAction::Stop,
        Err(_) if stopping => ConnectionAction::Stop,
        Err(_) => ConnectionAction::Retry,
    }
}

#[derive(Serialize)]
struct AlertPayload<'a> {
    recipient: &'a str,
    subject: &'a str,
    body: &'a str,
}

/// Publishes alerts as JSON to `{prefix}/alerts` with QoS 1.
pub struct MqttNotifier {
    client: Client,
    topic: String,
    stopping: Arc<AtomicBool>,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttNotifier {
    pub fn connect(config: &MqttConfig) -> Result<Self> {
        let endpoint = parse_broker(&config.broker)?;
        let mut options = MqttOptions::new(&config.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, mut connection) = Client::new(options, 10);
        let stopping = Arc::new(AtomicBool::new(false));
        let thread_stopping = stopping.clone();
        let handle = std::thread::Builder::new()
            .name("mqtt-notifier".to_string())
            .spawn(move || {
                // The event loop reconnects on the next poll after an error.
                for event in connection.iter() {
                    match on_connection_event(&event, thread_stopping.load(Ordering::SeqCst)) {
                        ConnectionAction::Continue => {}
                        ConnectionAction::Stop => break,
                        ConnectionAction::Retry => {
                            if let Err(e) = &event {
                                log::warn!(
                                    "MQTT connection error: {}, retrying in {:?}",
                                    e,
                                    RECONNECT_DELAY
                                );
                            }
                            std::thread::sleep(RECONNECT_DELAY);
                        }
                    }
                }
                log::debug!("MQTT connection thread stopped");
            })
            .context("spawn MQTT connection thread")?;

        log::info!(
            "MQTT notifier publishing to {}:{} (TLS: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls
        );
        Ok(Self {
            client,
            topic: format!("{}/alerts", config.topic_prefix.trim_end_matches('/')),
            stopping,
            connection_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn disconnect(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        self.client.disconnect()?;
        let handle = self
            .connection_handle
            .lock()
            .map_err(|_| anyhow!("MQTT handle lock poisoned"))?
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Notifier for MqttNotifier {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()> {
        let payload = serde_json::to_vec(&AlertPayload {
            recipient,
            subject,
            body,
        })?;
        self.client
            .publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload)
            .context("publish MQTT alert")?;
        Ok(())
    }
}
