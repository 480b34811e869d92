//! Cloud client configuration.
//!
//! All account-scoping parameters come verbatim from the process
//! environment; a missing variable yields an empty field and never fails
//! construction. Problems surface later when the client connects.

use crate::utils::env_or_empty;

/// Cloud IoT MQTT bridge hostname.
pub const MQTT_BRIDGE_HOSTNAME: &str = "mqtt.googleapis.com";
/// Cloud IoT MQTT bridge TLS port.
pub const MQTT_BRIDGE_PORT: u16 = 8883;

/// Configuration for the cloud telemetry client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloudConfig {
    /// Cloud project identifier.
    pub project_id: String,
    /// Device registry identifier.
    pub registry_id: String,
    /// Device identifier within the registry.
    pub device_id: String,
    /// Path to the PEM private key used to sign the auth JWT.
    pub private_key_file: String,
    /// Cloud region hosting the registry.
    pub cloud_region: String,
    /// Path to the CA certificate bundle for the TLS session.
    pub ca_certs: String,
    /// JWT signing algorithm ("RS256" or "ES256").
    pub algorithm: String,
    /// Gateway identifier, when publishing through a gateway.
    pub gateway_id: String,
}

impl CloudConfig {
    /// Build a configuration from the process environment.
    ///
    /// Reads `PROJECT_ID`, `REGISTRY_ID`, `DEVICE_ID`, `PRIVATE_KEY_FILE`,
    /// `CLOUD_REGION`, `CA_CERTS`, `ALGORITHM` and `GATEWAY_ID`. No
    /// defaults are applied; absent variables become empty strings.
    pub fn from_env() -> Self {
        Self {
            project_id: env_or_empty("PROJECT_ID"),
            registry_id: env_or_empty("REGISTRY_ID"),
            device_id: env_or_empty("DEVICE_ID"),
            private_key_file: env_or_empty("PRIVATE_KEY_FILE"),
            cloud_region: env_or_empty("CLOUD_REGION"),
            ca_certs: env_or_empty("CA_CERTS"),
            algorithm: env_or_empty("ALGORITHM"),
            gateway_id: env_or_empty("GATEWAY_ID"),
        }
    }

    /// The MQTT client identifier expected by the Cloud IoT bridge.
    ///
    /// When a gateway id is set, the session authenticates as the
    /// gateway; otherwise as the device itself.
    pub fn client_id(&self) -> String {
        let connecting_id = if self.gateway_id.is_empty() {
            &self.device_id
        } else {
            &self.gateway_id
        };
        format!(
            "projects/{}/locations/{}/registries/{}/devices/{}",
            self.project_id, self.cloud_region, self.registry_id, connecting_id
        )
    }

    /// The telemetry topic events are published to.
    pub fn event_topic(&self) -> String {
        format!("/devices/{}/events", self.device_id)
    }

    /// Check whether the session goes through a gateway.
    pub fn uses_gateway(&self) -> bool {
        !self.gateway_id.is_empty()
    }

    /// The topic a gateway attaches the device on.
    ///
    /// A gateway session must attach the device before the bridge accepts
    /// events published on its behalf.
    pub fn attach_topic(&self) -> String {
        format!("/devices/{}/attach", self.device_id)
    }

    /// The topic a gateway detaches the device on.
    pub fn detach_topic(&self) -> String {
        format!("/devices/{}/detach", self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config() -> CloudConfig {
        CloudConfig {
            project_id: "my-project".into(),
            registry_id: "my-registry".into(),
            device_id: "sensi1".into(),
            private_key_file: "rsa_private.pem".into(),
            cloud_region: "europe-west1".into(),
            ca_certs: "roots.pem".into(),
            algorithm: "RS256".into(),
            gateway_id: String::new(),
        }
    }

    #[test]
    fn test_client_id_without_gateway() {
        assert_eq!(
            config().client_id(),
            "projects/my-project/locations/europe-west1/registries/my-registry/devices/sensi1"
        );
    }

    #[test]
    fn test_client_id_with_gateway() {
        let mut cfg = config();
        cfg.gateway_id = "gw1".into();
        assert_eq!(
            cfg.client_id(),
            "projects/my-project/locations/europe-west1/registries/my-registry/devices/gw1"
        );
    }

    #[test]
    fn test_event_topic() {
        assert_eq!(config().event_topic(), "/devices/sensi1/events");
    }

    #[test]
    fn test_attach_detach_topics() {
        let mut cfg = config();
        cfg.gateway_id = "gw1".into();
        assert!(cfg.uses_gateway());
        // Attach names the device being attached, not the gateway
        assert_eq!(cfg.attach_topic(), "/devices/sensi1/attach");
        assert_eq!(cfg.detach_topic(), "/devices/sensi1/detach");
    }

    #[test]
    fn test_no_gateway_without_gateway_id() {
        assert!(!config().uses_gateway());
    }

    #[test]
    fn test_from_env_missing_vars_are_empty() {
        // The variables are not set in the test environment; construction
        // must still succeed with empty fields.
        for name in [
            "PROJECT_ID",
            "REGISTRY_ID",
            "DEVICE_ID",
            "PRIVATE_KEY_FILE",
            "CLOUD_REGION",
            "CA_CERTS",
            "ALGORITHM",
            "GATEWAY_ID",
        ] {
            std::env::remove_var(name);
        }

        let cfg = CloudConfig::from_env();
        assert_eq!(cfg, CloudConfig::default());
    }
}
