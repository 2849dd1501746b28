//! MQTT notifier.
//!
//! Camera status is published retained so late subscribers see the current
//! link state; capacity alerts are plain QoS 1 messages.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::Transport;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{Notification, Notifier};

const REQUEST_QUEUE_DEPTH: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub broker_addr: String,
    pub client_id: String,
    pub topic_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Parse the configured broker address.
///
/// Accepted forms:
/// - `host:port` or `mqtt://host:port` for plain TCP
/// - `mqtts://host:port` for TLS
/// - a bracketed IPv6 host in either form, e.g. `mqtt://[::1]:1883`
///
/// The port is always required.
pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let addr = addr.trim();
    let (use_tls, authority) = match addr.split_once("://") {
        None => (false, addr),
        Some(("mqtt", rest)) => (false, rest),
        Some(("mqtts", rest)) => (true, rest),
        Some((scheme, _)) => return Err(anyhow!("unsupported MQTT scheme: {}", scheme)),
    };

    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let host = match host.strip_prefix('[') {
        Some(bracketed) => bracketed
            .strip_suffix(']')
            .ok_or_else(|| anyhow!("unterminated IPv6 host in {}", addr))?,
        None if host.contains(':') => {
            return Err(anyhow!("IPv6 MQTT host must be bracketed: {}", addr))
        }
        None => host,
    };
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok(MqttEndpoint {
        host: host.to_string(),
        port,
        use_tls,
    })
}

pub struct MqttNotifier {
    client: Client,
    camera_topic: String,
    alert_topic: String,
    _event_loop: JoinHandle<()>,
}

impl MqttNotifier {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(&settings.broker_addr)?;
        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = settings.username.as_deref() {
            options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
        }
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, connection) = Client::new(options, REQUEST_QUEUE_DEPTH);
        log::info!(
            "MQTT notifier targeting {}:{} (TLS: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls
        );
        Ok(Self {
            client,
            camera_topic: format!("{}/camera", settings.topic_prefix),
            alert_topic: format!("{}/alerts", settings.topic_prefix),
            _event_loop: spawn_event_loop(connection),
        })
    }
}

/// Drive the rumqttc event loop; it reconnects on its own on the next poll.
/// The thread is detached and ends with the process.
fn spawn_event_loop(mut connection: Connection) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                Err(e) => {
                    log::warn!("MQTT connection error: {}", e);
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
    })
}

impl Notifier for MqttNotifier {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn deliver(&mut self, notification: &Notification) -> Result<()> {
        let payload = serde_json::to_vec(notification)?;
        let (topic, retain) = match notification {
            Notification::Camera { .. } => (self.camera_topic.as_str(), true),
            Notification::CapacityExceeded { .. } => (self.alert_topic.as_str(), false),
        };
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload)
            .map_err(|e| anyhow!("MQTT publish to {} failed: {}", topic, e))?;
        Ok(())
    }
}

impl Drop for MqttNotifier {
    fn drop(&mut self) {
        let _ = self.client.try_disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_tls_endpoints() -> Result<()> {
        assert_eq!(
            parse_mqtt_endpoint("127.0.0.1:1883")?,
            MqttEndpoint {
                host: "127.0.0.1".to_string(),
                port: 1883,
                use_tls: false
            }
        );
        let tls = parse_mqtt_endpoint("mqtts://broker.local:8883")?;
        assert!(tls.use_tls);
        assert_eq!(tls.port, 8883);
        let v6 = parse_mqtt_endpoint("[::1]:1883")?;
        assert_eq!(v6.host, "::1");
        let v6_tls = parse_mqtt_endpoint(" mqtts://[fe80::2]:8883 ")?;
        assert_eq!((v6_tls.host.as_str(), v6_tls.use_tls), ("fe80::2", true));
        Ok(())
    }

    #[test]
    fn rejects_malformed_endpoints() {
        assert!(parse_mqtt_endpoint("broker.local").is_err());
        assert!(parse_mqtt_endpoint("ws://broker:80").is_err());
        assert!(parse_mqtt_endpoint(":1883").is_err());
        assert!(parse_mqtt_endpoint("broker:notaport").is_err());
        assert!(parse_mqtt_endpoint("tcp://broker:1883").is_err());
        assert!(parse_mqtt_endpoint("::1:1883").is_err());
        assert!(parse_mqtt_endpoint("[::1:1883").is_err());
        assert!(parse_mqtt_endpoint("[]:1883").is_err());
    }
}
