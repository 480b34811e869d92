// Allow holding locks across await points - we use parking_lot which is designed for this
#![allow(clippy::await_holding_lock)]

//! # sensortile-cloud
//!
//! A Rust library and demo application for BlueST-protocol Bluetooth Low
//! Energy sensor nodes (SensorTile, BlueCoin, Nucleo expansion boards and
//! friends): discover nodes, connect, enumerate the features they export,
//! subscribe to sample notifications and forward a bounded number of
//! samples to a cloud telemetry endpoint over MQTT.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sensortile_cloud::{Manager, Result};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Scan for 5 seconds
//!     let manager = Manager::new().await?;
//!     manager.discover(Duration::from_secs(5)).await?;
//!
//!     for node in manager.nodes() {
//!         println!("{}: [{}]", node.name(), node.tag());
//!
//!         node.connect().await?;
//!         for feature in node.features() {
//!             println!("  {}", feature.name());
//!         }
//!         node.disconnect().await?;
//!     }
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Cloud forwarding
//!
//! The cloud client reads its account parameters (`PROJECT_ID`,
//! `REGISTRY_ID`, `DEVICE_ID`, `PRIVATE_KEY_FILE`, `CLOUD_REGION`,
//! `CA_CERTS`, `ALGORITHM`, `GATEWAY_ID`) verbatim from the environment
//! and publishes feature samples as JSON events over TLS MQTT.
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.

// Public modules
pub mod ble;
pub mod cloud;
pub mod error;
pub mod feature;
pub mod forward;
pub mod manager;
pub mod node;
pub mod utils;

// Re-exports for convenience
pub use cloud::{CloudClient, CloudConfig, CloudSink};
pub use error::{Error, Result};
pub use feature::{Feature, FeatureKind, Field, Sample};
pub use forward::{SampleForwarder, NOTIFICATION_LIMIT};
pub use manager::{DiscoveryEvent, Manager};
pub use node::{CallbackHandle, Node};

// Re-export commonly used types from submodules
pub use ble::advertising::{AdvertisingInfo, BoardFamily};
pub use ble::connection::{NodeStatus, StatusEvent};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<Manager>();
        let _ = std::any::TypeId::of::<Node>();
        let _ = std::any::TypeId::of::<Feature>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<CloudClient>();
        let _ = std::any::TypeId::of::<SampleForwarder>();
        let _ = std::any::TypeId::of::<AdvertisingInfo>();
    }

    #[test]
    fn test_notification_limit() {
        assert_eq!(NOTIFICATION_LIMIT, 10);
    }
}
