//! Cloud telemetry client.
//!
//! MQTT session against the Cloud IoT Core bridge: password-JWT
//! authentication, TLS with a caller-supplied CA bundle, and QoS 1
//! telemetry publishes to the device event topic.

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use parking_lot::RwLock;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cloud::config::{CloudConfig, MQTT_BRIDGE_HOSTNAME, MQTT_BRIDGE_PORT};
use crate::error::{Error, Result};
use crate::feature::Sample;

/// Lifetime of the password JWT.
const JWT_LIFETIME: Duration = Duration::from_secs(20 * 60);

/// How long to wait for the broker's CONNACK.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// JWT claims expected by the Cloud IoT bridge.
#[derive(Debug, Serialize)]
struct JwtClaims {
    /// Issued-at, seconds since the epoch.
    iat: i64,
    /// Expiry, seconds since the epoch.
    exp: i64,
    /// Audience: the cloud project id.
    aud: String,
}

/// Telemetry event payload.
///
/// The `value` field is the bracketed value list; the ingest side strips
/// the brackets and parses the float.
#[derive(Debug, Serialize)]
struct EventPayload<'a> {
    feature: &'a str,
    value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<u32>,
}

/// Sink for telemetry events.
///
/// Fronts the MQTT client so forwarding policy can be tested without a
/// broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudSink: Send + Sync {
    /// Publish one sample of the named feature.
    async fn send_event(&self, feature_name: &str, sample: &Sample) -> Result<()>;
}

/// MQTT client for the cloud telemetry endpoint.
pub struct CloudClient {
    /// Client configuration.
    config: CloudConfig,
    /// Live MQTT handle, present while connected.
    client: RwLock<Option<AsyncClient>>,
    /// Whether the broker has acknowledged the session.
    connected: Arc<AtomicBool>,
    /// Event loop driver task handle.
    eventloop_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl CloudClient {
    /// Create a new, unconnected client.
    ///
    /// Construction never fails: empty configuration fields are accepted
    /// and only surface as errors at [`connect`](Self::connect).
    pub fn new(config: CloudConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            eventloop_handle: RwLock::new(None),
        }
    }

    /// Get the client configuration.
    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    /// Check whether the broker has acknowledged the session.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Establish the MQTT session.
    ///
    /// Signs a fresh JWT, opens the TLS connection and waits for the
    /// broker's CONNACK.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            debug!("Cloud client already connected");
            return Ok(());
        }

        let jwt = self.create_jwt()?;

        let mut options = MqttOptions::new(
            self.config.client_id(),
            MQTT_BRIDGE_HOSTNAME,
            MQTT_BRIDGE_PORT,
        );
        options.set_keep_alive(Duration::from_secs(60));
        // The bridge ignores the username; authentication is the JWT password
        options.set_credentials("unused", jwt);

        let ca = std::fs::read(&self.config.ca_certs)?;
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: None,
        }));

        let (client, mut eventloop) = AsyncClient::new(options, 10);

        let connected = self.connected.clone();
        let handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        info!("MQTT session acknowledged: {:?}", ack.code);
                        connected.store(true, Ordering::SeqCst);
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("Broker requested disconnect");
                        connected.store(false, Ordering::SeqCst);
                    }
                    Ok(event) => {
                        debug!("MQTT event: {:?}", event);
                    }
                    Err(e) => {
                        warn!("MQTT connection error: {}", e);
                        connected.store(false, Ordering::SeqCst);
                        // The event loop reconnects on the next poll
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        *self.eventloop_handle.write() = Some(handle);
        *self.client.write() = Some(client.clone());

        // Wait for the CONNACK before reporting success
        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        while !self.is_connected() {
            if tokio::time::Instant::now() >= deadline {
                self.teardown().await;
                return Err(Error::ConnectionFailed {
                    reason: "timed out waiting for MQTT CONNACK".to_string(),
                });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // A gateway session must attach the device before the bridge
        // accepts events published on its behalf
        if self.config.uses_gateway() {
            client
                .publish(self.config.attach_topic(), QoS::AtLeastOnce, false, "{}")
                .await?;
            info!(
                "Attached device {} through gateway {}",
                self.config.device_id, self.config.gateway_id
            );
        }

        info!("Connected to {} as {}", MQTT_BRIDGE_HOSTNAME, self.config.client_id());

        Ok(())
    }

    /// Close the MQTT session.
    ///
    /// A gateway session detaches the device first; detach failures are
    /// logged and do not block the disconnect.
    pub async fn disconnect(&self) -> Result<()> {
        let client = self.client.read().clone();
        if let Some(client) = client {
            if self.config.uses_gateway() && self.is_connected() {
                if let Err(e) = client
                    .publish(self.config.detach_topic(), QoS::AtLeastOnce, false, "{}")
                    .await
                {
                    warn!("MQTT detach failed: {}", e);
                }
            }

            if let Err(e) = client.disconnect().await {
                warn!("MQTT disconnect failed: {}", e);
            }
        }

        self.teardown().await;

        info!("Disconnected from cloud");

        Ok(())
    }

    /// Sign the password JWT from the configured private key.
    fn create_jwt(&self) -> Result<String> {
        let key_bytes = std::fs::read(&self.config.private_key_file)?;

        let (algorithm, key) = match self.config.algorithm.as_str() {
            "ES256" => (Algorithm::ES256, EncodingKey::from_ec_pem(&key_bytes)?),
            // RS256 is the bridge default
            _ => (Algorithm::RS256, EncodingKey::from_rsa_pem(&key_bytes)?),
        };

        let now = Utc::now().timestamp();
        let claims = JwtClaims {
            iat: now,
            exp: now + JWT_LIFETIME.as_secs() as i64,
            aud: self.config.project_id.clone(),
        };

        Ok(encode(&Header::new(algorithm), &claims, &key)?)
    }

    async fn teardown(&self) {
        if let Some(handle) = self.eventloop_handle.write().take() {
            handle.abort();
        }
        *self.client.write() = None;
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl CloudSink for CloudClient {
    async fn send_event(&self, feature_name: &str, sample: &Sample) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::CloudNotConnected);
        }

        let client = self.client.read().clone().ok_or(Error::CloudNotConnected)?;

        let payload = EventPayload {
            feature: feature_name,
            value: sample.values_string(),
            timestamp: sample.timestamp,
        };
        let body = serde_json::to_vec(&payload)?;

        client
            .publish(self.config.event_topic(), QoS::AtLeastOnce, false, body)
            .await?;

        debug!("Published {} event to cloud", feature_name);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample(values: Vec<f32>, timestamp: Option<u32>) -> Sample {
        Sample {
            timestamp,
            values,
            raw: Vec::new(),
            notification_time: Utc::now(),
        }
    }

    #[test]
    fn test_event_payload_shape() {
        let s = sample(vec![23.4], Some(100));
        let payload = EventPayload {
            feature: "Temperature",
            value: s.values_string(),
            timestamp: s.timestamp,
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "feature": "Temperature",
                "value": "[23.4]",
                "timestamp": 100,
            })
        );
    }

    #[test]
    fn test_event_payload_omits_missing_timestamp() {
        let s = sample(Vec::new(), None);
        let payload = EventPayload {
            feature: "ADPCM Audio",
            value: s.values_string(),
            timestamp: s.timestamp,
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json.get("timestamp"), None);
    }

    #[tokio::test]
    async fn test_send_event_requires_connection() {
        let client = CloudClient::new(CloudConfig::default());
        let err = client
            .send_event("Temperature", &sample(vec![1.0], Some(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CloudNotConnected));
    }

    #[test]
    fn test_unknown_algorithm_falls_back_to_rs256() {
        // create_jwt reads the key file first, so a missing file is the
        // observable failure for any algorithm value
        let client = CloudClient::new(CloudConfig {
            algorithm: "HS999".into(),
            private_key_file: "/nonexistent/key.pem".into(),
            ..CloudConfig::default()
        });
        let err = client.create_jwt().unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
