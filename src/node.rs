//! Node struct and methods.
//!
//! A node is one discovered BlueST peripheral: name, board info, status,
//! and the set of features it exports.

use btleplug::platform::Peripheral;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::advertising::{AdvertisingInfo, BoardFamily};
use crate::ble::characteristics::CharacteristicHandler;
use crate::ble::connection::{ConnectionManager, NodeStatus, StatusEvent};
use crate::ble::uuids::feature_mask_from_uuid;
use crate::error::{Error, Result};
use crate::feature::{expand_mask, Feature, FeatureKind};

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Internal state for a node.
struct NodeState {
    /// Advertised device name.
    name: Option<String>,
    /// Last parsed advertising payload.
    advertising: AdvertisingInfo,
    /// RSSI value.
    rssi: Option<i16>,
    /// Last advertising update time.
    last_update: Instant,
}

/// Represents a single BlueST sensor node.
pub struct Node {
    /// BLE identifier ("tag" in BlueST terms).
    identifier: String,
    /// Internal state.
    state: Arc<RwLock<NodeState>>,
    /// Connection manager.
    connection: Arc<ConnectionManager>,
    /// Characteristic handler, present while connected.
    characteristics: RwLock<Option<Arc<CharacteristicHandler>>>,
    /// Exported features, built at connect time.
    features: RwLock<Vec<Arc<Feature>>>,
    /// Features grouped per characteristic, in payload decode order.
    dispatch: Arc<RwLock<HashMap<Uuid, Vec<Arc<Feature>>>>>,
    /// Notification dispatch task handle.
    dispatch_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
}

impl Node {
    /// Create a new node instance.
    pub(crate) fn new(
        identifier: String,
        peripheral: Peripheral,
        name: Option<String>,
        advertising: AdvertisingInfo,
        rssi: Option<i16>,
    ) -> Self {
        Self {
            identifier,
            state: Arc::new(RwLock::new(NodeState {
                name,
                advertising,
                rssi,
                last_update: Instant::now(),
            })),
            connection: Arc::new(ConnectionManager::new(peripheral)),
            characteristics: RwLock::new(None),
            features: RwLock::new(Vec::new()),
            dispatch: Arc::new(RwLock::new(HashMap::new())),
            dispatch_handle: RwLock::new(None),
            callback_counter: AtomicU64::new(0),
        }
    }

    /// Update from a fresh advertising payload.
    pub(crate) fn update_from_advertising(
        &self,
        advertising: &AdvertisingInfo,
        name: Option<String>,
        rssi: Option<i16>,
    ) {
        let mut state = self.state.write();
        state.advertising = advertising.clone();
        if name.is_some() {
            state.name = name;
        }
        state.rssi = rssi;
        state.last_update = Instant::now();
    }

    // === Identification ===

    /// Get the advertised device name, or `"Unknown"` if none was seen.
    pub fn name(&self) -> String {
        self.state
            .read()
            .name
            .clone()
            .unwrap_or_else(|| "Unknown".to_string())
    }

    /// Get the BLE identifier (the node's tag).
    pub fn tag(&self) -> &str {
        &self.identifier
    }

    /// Get the board family from advertising data.
    pub fn board(&self) -> BoardFamily {
        self.state.read().advertising.board
    }

    /// Get the advertised feature mask.
    pub fn feature_mask(&self) -> u32 {
        self.state.read().advertising.feature_mask
    }

    /// Get the signal strength (RSSI).
    pub fn rssi(&self) -> Option<i16> {
        self.state.read().rssi
    }

    // === Status ===

    /// Get the current node status.
    pub fn status(&self) -> NodeStatus {
        self.connection.status()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Subscribe to status transition events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.connection.subscribe()
    }

    /// Register a callback invoked on each status transition with the old
    /// and new status.
    pub fn on_status_change<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(NodeStatus, NodeStatus) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.connection.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                callback(event.old_status, event.new_status);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    // === Connection ===

    /// Connect to the node, discover its characteristics and build the
    /// feature table.
    pub async fn connect(&self) -> Result<()> {
        info!("Connecting to node {}", self.name());

        self.connection.connect().await?;

        let handler = Arc::new(CharacteristicHandler::new(
            self.connection.peripheral().clone(),
        ));
        handler.discover_characteristics().await?;

        self.build_features(&handler);

        handler.start_notifications().await?;
        self.start_dispatch(&handler);

        *self.characteristics.write() = Some(handler);

        info!(
            "Connected to node {} ({} features)",
            self.name(),
            self.features.read().len()
        );

        Ok(())
    }

    /// Disconnect from the node.
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting from node {}", self.name());

        if let Some(handle) = self.dispatch_handle.write().take() {
            handle.abort();
        }

        if let Some(handler) = self.characteristics.write().take() {
            handler.stop_notifications().await;
        }

        for feature in self.features.read().iter() {
            feature.set_notifying(false);
        }

        self.connection.disconnect().await
    }

    // === Features ===

    /// Get the features exported by the node.
    ///
    /// Empty until the node is connected.
    pub fn features(&self) -> Vec<Arc<Feature>> {
        self.features.read().clone()
    }

    /// Get a feature by kind.
    pub fn get_feature(&self, kind: FeatureKind) -> Option<Arc<Feature>> {
        self.features
            .read()
            .iter()
            .find(|f| f.kind() == kind)
            .cloned()
    }

    /// Enable notifications for a feature.
    pub async fn enable_notifications(&self, feature: &Feature) -> Result<()> {
        let handler = self.require_handler()?;

        handler.subscribe(&feature.characteristic_uuid()).await?;
        feature.set_notifying(true);

        debug!("Notifications enabled for {}", feature.name());

        Ok(())
    }

    /// Disable notifications for a feature.
    pub async fn disable_notifications(&self, feature: &Feature) -> Result<()> {
        let handler = self.require_handler()?;

        handler.unsubscribe(&feature.characteristic_uuid()).await?;
        feature.set_notifying(false);

        debug!("Notifications disabled for {}", feature.name());

        Ok(())
    }

    // === Internal ===

    /// Build the feature table from the discovered characteristics.
    ///
    /// Each BlueST characteristic UUID carries the mask of the features it
    /// exports; the advertised mask narrows which bits are actually
    /// enabled on this firmware build.
    fn build_features(&self, handler: &CharacteristicHandler) {
        let advertised = self.feature_mask();

        let mut features: Vec<Arc<Feature>> = Vec::new();
        let mut dispatch: HashMap<Uuid, Vec<Arc<Feature>>> = HashMap::new();

        for uuid in handler.characteristic_uuids() {
            let char_mask = match feature_mask_from_uuid(&uuid) {
                Some(mask) => mask,
                None => continue,
            };

            let mut on_char: Vec<Arc<Feature>> = Vec::new();
            for bit in expand_mask(char_mask) {
                let feature = Arc::new(Feature::new(bit, uuid));
                feature.set_enabled(advertised == 0 || advertised & bit != 0);
                on_char.push(feature);
            }

            if on_char.is_empty() {
                continue;
            }

            features.extend(on_char.iter().cloned());
            dispatch.insert(uuid, on_char);
        }

        // Stable listing order: highest mask bit first
        features.sort_by_key(|f| std::cmp::Reverse(f.mask()));

        debug!("Built {} features for node {}", features.len(), self.name());

        *self.features.write() = features;
        *self.dispatch.write() = dispatch;
    }

    /// Start the background task that routes notifications to features.
    ///
    /// Payload layout: a 2-byte little-endian timestamp (absent on audio
    /// characteristics), then each feature's data in descending mask
    /// order.
    fn start_dispatch(&self, handler: &CharacteristicHandler) {
        let mut rx = handler.subscribe_notifications();
        let dispatch = self.dispatch.clone();

        let handle = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                let features = match dispatch.read().get(&event.characteristic_uuid) {
                    Some(features) => features.clone(),
                    None => continue,
                };

                let has_timestamp = features
                    .first()
                    .map(|f| f.kind().has_timestamp())
                    .unwrap_or(true);

                let (timestamp, mut offset) = if has_timestamp {
                    if event.data.len() < 2 {
                        warn!(
                            "Notification from {} too short for timestamp",
                            event.characteristic_uuid
                        );
                        continue;
                    }
                    let ts = u16::from_le_bytes([event.data[0], event.data[1]]) as u32;
                    (Some(ts), 2usize)
                } else {
                    (None, 0usize)
                };

                for feature in &features {
                    match feature.update(timestamp, &event.data[offset..]) {
                        Ok(read) => offset += read,
                        Err(e) => {
                            warn!("Failed to decode {} sample: {}", feature.name(), e);
                            break;
                        }
                    }
                }
            }

            debug!("Notification dispatch task stopped");
        });

        *self.dispatch_handle.write() = Some(handle);
    }

    fn require_handler(&self) -> Result<Arc<CharacteristicHandler>> {
        self.characteristics
            .read()
            .clone()
            .ok_or(Error::NotConnected)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name())
            .field("tag", &self.identifier)
            .field("board", &self.board())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_handle_unregister_runs_once() {
        use std::sync::atomic::AtomicU32;

        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();

        let handle = CallbackHandle::new(0, move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        handle.unregister();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_handle_unregisters_on_drop() {
        use std::sync::atomic::AtomicU32;

        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();

        {
            let _handle = CallbackHandle::new(7, move || {
                count_clone.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
