//! BLE layer: scanning, connection handling, GATT plumbing and BlueST
//! advertising/UUID conventions.

pub mod advertising;
pub mod characteristics;
pub mod connection;
pub mod scanner;
pub mod uuids;

pub use advertising::{AdvertisingInfo, BoardFamily};
pub use characteristics::{CharacteristicHandler, NotificationEvent};
pub use connection::{ConnectionManager, NodeStatus, StatusEvent};
pub use scanner::{BleScanner, NodeDiscoveryEvent};
