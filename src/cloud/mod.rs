//! Cloud telemetry layer: configuration from the environment and the
//! MQTT client for the Cloud IoT bridge.

pub mod config;
pub mod mqtt;

pub use config::CloudConfig;
pub use mqtt::{CloudClient, CloudSink};
