//! BLE connection management.
//!
//! Handles connecting to and maintaining connections with BlueST nodes.

use btleplug::api::Peripheral as _;
use btleplug::platform::Peripheral;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Lifecycle status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NodeStatus {
    /// Discovered but not connected.
    #[default]
    Idle,
    /// Currently attempting to connect.
    Connecting,
    /// Connected to the node.
    Connected,
    /// Currently disconnecting.
    Disconnecting,
    /// The link dropped without a requested disconnect.
    Lost,
    /// The node is gone and will not be retried.
    Dead,
}

impl NodeStatus {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Lost => write!(f, "Lost"),
            Self::Dead => write!(f, "Dead"),
        }
    }
}

/// Event for node status transitions.
///
/// Carries both sides of the transition so listeners can report
/// "went from X to Y".
#[derive(Debug, Clone)]
pub struct StatusEvent {
    /// The identifier of the peripheral.
    pub identifier: String,
    /// The status before the transition.
    pub old_status: NodeStatus,
    /// The status after the transition.
    pub new_status: NodeStatus,
}

/// Status cell shared between the connection manager and its link watch
/// task.
struct StatusTracker {
    /// The identifier of the peripheral, carried in emitted events.
    identifier: String,
    /// Current node status.
    status: RwLock<NodeStatus>,
    /// Channel for status events.
    event_tx: broadcast::Sender<StatusEvent>,
}

impl StatusTracker {
    fn new(identifier: String) -> Self {
        let (event_tx, _) = broadcast::channel(16);

        Self {
            identifier,
            status: RwLock::new(NodeStatus::Idle),
            event_tx,
        }
    }

    fn get(&self) -> NodeStatus {
        *self.status.read()
    }

    fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.event_tx.subscribe()
    }

    /// Update the status and emit an event for a real transition.
    fn set(&self, new_status: NodeStatus) {
        let old_status = {
            let mut status = self.status.write();
            let old = *status;
            *status = new_status;
            old
        };

        if old_status != new_status {
            debug!("Node status changed: {} -> {}", old_status, new_status);

            let _ = self.event_tx.send(StatusEvent {
                identifier: self.identifier.clone(),
                old_status,
                new_status,
            });
        }
    }

    /// Record that the link dropped without a requested disconnect.
    ///
    /// Only a connected node moves to `Lost`; a drop observed during a
    /// requested disconnect is not a loss.
    fn link_lost(&self) {
        if self.get().is_connected() {
            warn!("Connection to {} lost", self.identifier);
            self.set(NodeStatus::Lost);
        }
    }
}

/// Manages the connection to a single BlueST node.
pub struct ConnectionManager {
    /// The peripheral to manage.
    peripheral: Peripheral,
    /// Status cell, shared with the link watch task.
    tracker: Arc<StatusTracker>,
    /// Link watch task handle, present while connected.
    watch_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
    /// Maximum connection attempts.
    max_connect_attempts: u32,
    /// Delay between connection attempts.
    retry_delay: Duration,
    /// Poll interval of the link watch task.
    watch_interval: Duration,
}

impl ConnectionManager {
    /// Create a new connection manager for a peripheral.
    pub fn new(peripheral: Peripheral) -> Self {
        let identifier = format!("{:?}", peripheral.id());

        Self {
            peripheral,
            tracker: Arc::new(StatusTracker::new(identifier)),
            watch_handle: RwLock::new(None),
            max_connect_attempts: 3,
            retry_delay: Duration::from_secs(1),
            watch_interval: Duration::from_secs(1),
        }
    }

    /// Get the current node status.
    pub fn status(&self) -> NodeStatus {
        self.tracker.get()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// Subscribe to status events.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tracker.subscribe()
    }

    /// Get the peripheral.
    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    /// Attempt to connect to the node and discover its services.
    pub async fn connect(&self) -> Result<()> {
        let current = self.tracker.get();

        if current.is_connected() {
            debug!("Already connected");
            return Ok(());
        }

        if current.is_transitioning() {
            return Err(Error::ConnectionFailed {
                reason: "Connection already in progress".to_string(),
            });
        }

        self.tracker.set(NodeStatus::Connecting);

        // Check if already connected at BLE level
        if self.peripheral.is_connected().await.unwrap_or(false) {
            info!("Peripheral already connected at BLE level");
            self.discover_services().await?;
            self.tracker.set(NodeStatus::Connected);
            self.start_link_watch();
            return Ok(());
        }

        let mut attempts = 0;
        while attempts < self.max_connect_attempts {
            attempts += 1;

            debug!(
                "Connection attempt {} of {}",
                attempts, self.max_connect_attempts
            );

            match self.peripheral.connect().await {
                Ok(_) => {
                    info!("Successfully connected to node");
                    self.discover_services().await?;
                    self.tracker.set(NodeStatus::Connected);
                    self.start_link_watch();
                    return Ok(());
                }
                Err(e) => {
                    warn!("Connection attempt {} failed: {}", attempts, e);

                    if attempts < self.max_connect_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        self.tracker.set(NodeStatus::Dead);
        Err(Error::ConnectionFailed {
            reason: format!("Failed after {} attempts", self.max_connect_attempts),
        })
    }

    /// Disconnect from the node.
    pub async fn disconnect(&self) -> Result<()> {
        let current = self.tracker.get();

        if matches!(current, NodeStatus::Idle | NodeStatus::Disconnecting) {
            return Ok(());
        }

        if let Some(handle) = self.watch_handle.write().take() {
            handle.abort();
        }

        self.tracker.set(NodeStatus::Disconnecting);

        match self.peripheral.disconnect().await {
            Ok(_) => {
                info!("Successfully disconnected from node");
                self.tracker.set(NodeStatus::Idle);
                Ok(())
            }
            Err(e) => {
                error!("Failed to disconnect: {}", e);
                self.tracker.set(NodeStatus::Idle);
                Err(Error::Bluetooth(e))
            }
        }
    }

    /// Set the connection attempt parameters.
    pub fn set_retry_params(&mut self, max_attempts: u32, delay: Duration) {
        self.max_connect_attempts = max_attempts;
        self.retry_delay = delay;
    }

    /// Record that the link dropped without a requested disconnect.
    pub fn handle_link_loss(&self) {
        self.tracker.link_lost();
    }

    /// Start the background task that watches the BLE link while
    /// connected.
    ///
    /// The drop is observed by polling the peripheral; btleplug's
    /// disconnect event stream is adapter-wide and the scanner's event
    /// loop is stopped while streaming.
    fn start_link_watch(&self) {
        let peripheral = self.peripheral.clone();
        let tracker = self.tracker.clone();
        let interval = self.watch_interval;

        let handle = tokio::spawn(async move {
            while tracker.get().is_connected() {
                tokio::time::sleep(interval).await;

                if !tracker.get().is_connected() {
                    break;
                }

                if !peripheral.is_connected().await.unwrap_or(false) {
                    tracker.link_lost();
                    break;
                }
            }

            debug!("Link watch ended");
        });

        *self.watch_handle.write() = Some(handle);
    }

    /// Discover GATT services after a successful connect.
    async fn discover_services(&self) -> Result<()> {
        self.peripheral
            .discover_services()
            .await
            .map_err(Error::Bluetooth)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.watch_handle.write().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_status() {
        assert!(!NodeStatus::Idle.is_connected());
        assert!(NodeStatus::Connected.is_connected());
        assert!(!NodeStatus::Lost.is_connected());

        assert!(NodeStatus::Connecting.is_transitioning());
        assert!(NodeStatus::Disconnecting.is_transitioning());
        assert!(!NodeStatus::Connected.is_transitioning());
    }

    #[test]
    fn test_node_status_display() {
        assert_eq!(format!("{}", NodeStatus::Connected), "Connected");
        assert_eq!(format!("{}", NodeStatus::Idle), "Idle");
        assert_eq!(format!("{}", NodeStatus::Lost), "Lost");
    }

    #[test]
    fn test_link_loss_emits_lost_transition() {
        let tracker = StatusTracker::new("node".to_string());
        let mut rx = tracker.subscribe();

        tracker.set(NodeStatus::Connecting);
        tracker.set(NodeStatus::Connected);
        tracker.link_lost();

        let _ = rx.try_recv().unwrap();
        let _ = rx.try_recv().unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.old_status, NodeStatus::Connected);
        assert_eq!(event.new_status, NodeStatus::Lost);

        assert_eq!(tracker.get(), NodeStatus::Lost);
        assert!(!tracker.get().is_connected());
    }

    #[test]
    fn test_link_loss_ignored_unless_connected() {
        let tracker = StatusTracker::new("node".to_string());

        tracker.link_lost();
        assert_eq!(tracker.get(), NodeStatus::Idle);

        tracker.set(NodeStatus::Disconnecting);
        tracker.link_lost();
        assert_eq!(tracker.get(), NodeStatus::Disconnecting);
    }
}
