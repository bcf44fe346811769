//! MQTT sink.
//!
//! One `MqttPublisher` owns the broker connection and the thread that drives
//! it. Each sampling loop gets its own `MqttSubmitter`, a cheap clone of the
//! client bound to the topic prefix.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::Transport;

use super::{IngestAck, IngestPayload, VitalsSink};

pub const DEFAULT_TOPIC_PREFIX: &str = "nicu/unit-a";

/// Pause between broker reconnect attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq)]
pub struct MqttConfig {
    /// `mqtt://host:port` or `mqtts://host:port`.
    pub broker: String,
    pub client_id: String,
    pub topic_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "mqtt://localhost:1883".to_string(),
            client_id: "vitals-connector".to_string(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            username: None,
            password: None,
        }
    }
}

/// `<prefix>/patient/<id>/vitals/camera`
pub fn vitals_topic(prefix: &str, patient_id: u64) -> String {
    format!(
        "{}/patient/{}/vitals/camera",
        prefix.trim_end_matches('/'),
        patient_id
    )
}

#[derive(Debug, PartialEq)]
pub(crate) struct MqttEndpoint {
    host: String,
    port: u16,
    use_tls: bool,
}

pub(crate) fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
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
    Ok(MqttEndpoint {
        host: host.to_string(),
        port,
        use_tls,
    })
}

/// Broker connection shared by every sampling loop.
pub struct MqttPublisher {
    client: Client,
    prefix: String,
    stopping: Arc<AtomicBool>,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttPublisher {
    pub fn connect(config: &MqttConfig) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(&config.broker)?;
        let mut options = MqttOptions::new(&config.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = &config.username {
            options.set_credentials(user, config.password.clone().unwrap_or_default());
        }
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, connection) = Client::new(options, 10);
        log::info!(
            "MqttPublisher: broker {}:{} (TLS: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            config.username.is_some()
        );
        let stopping = Arc::new(AtomicBool::new(false));
        Ok(Self {
            client,
            prefix: config.topic_prefix.clone(),
            connection_handle: Some(drive_connection(connection, stopping.clone())),
            stopping,
        })
    }

    /// A sink for one sampling loop.
    pub fn submitter(&self) -> MqttSubmitter {
        MqttSubmitter {
            client: self.client.clone(),
            prefix: self.prefix.clone(),
        }
    }

    /// Send DISCONNECT and stop the connection thread. Every submitter must
    /// be dropped first, otherwise the thread keeps the connection alive.
    pub fn disconnect(self) -> Result<()> {
        let Self {
            client,
            stopping,
            connection_handle,
            ..
        } = self;
        stopping.store(true, Ordering::SeqCst);
        let result = client.disconnect().context("send MQTT disconnect");
        drop(client);
        if let Some(handle) = connection_handle {
            let _ = handle.join();
        }
        result
    }
}

/// Drive the event loop until `disconnect` is requested. Iterating after an
/// error makes rumqttc reconnect, so errors only pause the loop.
fn drive_connection(mut connection: Connection, stopping: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                Err(e) => {
                    if stopping.load(Ordering::SeqCst) {
                        break;
                    }
                    log::warn!(
                        "MQTT connection error, retrying in {:?}: {}",
                        RECONNECT_BACKOFF,
                        e
                    );
                    pause(RECONNECT_BACKOFF, &stopping);
                }
            }
        }
    })
}

fn pause(duration: Duration, stopping: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while !stopping.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
}

/// Publishes payloads at QoS 1. A queued publish counts as accepted.
pub struct MqttSubmitter {
    client: Client,
    prefix: String,
}

impl VitalsSink for MqttSubmitter {
    fn name(&self) -> String {
        format!("mqtt {}", self.prefix)
    }

    fn submit(&mut self, payload: &IngestPayload) -> Result<IngestAck> {
        let topic = vitals_topic(&self.prefix, payload.patient_id);
        let body = serde_json::to_vec(payload).context("serialize vitals payload")?;
        self.client
            .publish(topic.clone(), QoS::AtLeastOnce, false, body)
            .with_context(|| format!("publish to {}", topic))?;
        Ok(IngestAck::accepted(None))
    }
}
