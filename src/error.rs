//! Error types for the sensortile-cloud crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The specified node was not found.
    #[error("Node not found: {identifier}")]
    NodeNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// Operation requires a connection but the node is not connected.
    #[error("Node not connected")]
    NotConnected,

    /// Failed to establish a connection to the node.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The advertising payload is not valid BlueST data.
    #[error("Invalid advertising data: {context}")]
    InvalidAdvertisement {
        /// Description of what was invalid about the payload.
        context: String,
    },

    /// Invalid data was received from the node.
    #[error("Invalid data received: {context}")]
    InvalidData {
        /// Description of what was invalid about the data.
        context: String,
    },

    /// The requested feature is not exported by the node.
    #[error("Feature not found: {name}")]
    FeatureNotFound {
        /// The feature name that was searched for.
        name: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// The feature does not support notifications.
    #[error("Notifications not supported by feature: {name}")]
    NotificationsNotSupported {
        /// The name of the feature.
        name: String,
    },

    /// Operation requires a cloud session but the client is not connected.
    #[error("Cloud client not connected")]
    CloudNotConnected,

    /// MQTT request could not be queued.
    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// The MQTT session could not be established or was lost.
    #[error("MQTT connection error: {0}")]
    MqttConnection(#[from] rumqttc::ConnectionError),

    /// JWT signing failed while authenticating to the cloud.
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// Telemetry payload could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error (private key or CA bundle).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
