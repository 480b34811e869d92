//! Manager for discovering BlueST nodes.
//!
//! Wraps the BLE scanner with node lifecycle management: bounded
//! discovery windows, the discovered-node list and discovery events.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::ble::scanner::{BleScanner, NodeDiscoveryEvent};
use crate::error::Result;
use crate::node::{CallbackHandle, Node};

/// Event emitted during discovery.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A discovery window started.
    Started,
    /// A discovery window stopped.
    Stopped,
    /// A new node was discovered.
    NodeDiscovered(Arc<Node>),
}

/// Central manager for discovering BlueST nodes.
pub struct Manager {
    /// BLE scanner.
    scanner: Arc<BleScanner>,
    /// Discovered nodes in discovery order.
    nodes: Arc<RwLock<Vec<Arc<Node>>>>,
    /// Discovery event channel.
    discovery_tx: broadcast::Sender<DiscoveryEvent>,
    /// Background collector task handle.
    collect_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
    /// Discovery running flag.
    is_discovering: Arc<AtomicBool>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
}

impl Manager {
    /// Create a new manager instance.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        Ok(Self::with_scanner(BleScanner::new().await?))
    }

    /// Create a manager over an existing scanner.
    pub fn with_scanner(scanner: BleScanner) -> Self {
        let (discovery_tx, _) = broadcast::channel(32);

        Self {
            scanner: Arc::new(scanner),
            nodes: Arc::new(RwLock::new(Vec::new())),
            discovery_tx,
            collect_handle: RwLock::new(None),
            is_discovering: Arc::new(AtomicBool::new(false)),
            callback_counter: AtomicU64::new(0),
        }
    }

    /// Run a bounded discovery window: scan for `timeout`, then stop.
    pub async fn discover(&self, timeout: Duration) -> Result<()> {
        self.start_discovery().await?;
        tokio::time::sleep(timeout).await;
        self.stop_discovery().await
    }

    /// Start an open-ended discovery.
    pub async fn start_discovery(&self) -> Result<()> {
        if self.is_discovering.load(Ordering::SeqCst) {
            debug!("Discovery already running");
            return Ok(());
        }

        self.scanner.start_scanning().await?;
        self.is_discovering.store(true, Ordering::SeqCst);

        let mut rx = self.scanner.subscribe();
        let nodes = self.nodes.clone();
        let discovery_tx = self.discovery_tx.clone();
        let is_discovering = self.is_discovering.clone();

        let handle = tokio::spawn(async move {
            while is_discovering.load(Ordering::SeqCst) {
                tokio::select! {
                    Ok(event) = rx.recv() => {
                        Self::handle_discovery_event(event, &nodes, &discovery_tx);
                    }
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {
                        if !is_discovering.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                }
            }

            debug!("Discovery collector ended");
        });

        *self.collect_handle.write() = Some(handle);

        let _ = self.discovery_tx.send(DiscoveryEvent::Started);

        Ok(())
    }

    /// Stop discovery.
    pub async fn stop_discovery(&self) -> Result<()> {
        if !self.is_discovering.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.is_discovering.store(false, Ordering::SeqCst);
        self.scanner.stop_scanning().await?;

        if let Some(handle) = self.collect_handle.write().take() {
            let _ = handle.await;
        }

        let _ = self.discovery_tx.send(DiscoveryEvent::Stopped);

        Ok(())
    }

    /// Check if discovery is running.
    pub fn is_discovering(&self) -> bool {
        self.is_discovering.load(Ordering::SeqCst)
    }

    /// Get the discovered nodes in discovery order.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().clone()
    }

    /// Get a node by its tag (BLE identifier).
    pub fn get_node(&self, tag: &str) -> Option<Arc<Node>> {
        self.nodes.read().iter().find(|n| n.tag() == tag).cloned()
    }

    /// Forget all discovered nodes so the next window starts fresh.
    pub fn reset_discovery(&self) {
        self.nodes.write().clear();
        self.scanner.clear_discovered();
    }

    /// Subscribe to discovery events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.discovery_tx.subscribe()
    }

    /// Register a callback invoked when a discovery window starts or
    /// stops (`true` on start, `false` on stop).
    pub fn on_discovery_change<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.discovery_tx.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                match event {
                    DiscoveryEvent::Started => callback(true),
                    DiscoveryEvent::Stopped => callback(false),
                    DiscoveryEvent::NodeDiscovered(_) => {}
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Register a callback invoked for each newly discovered node.
    pub fn on_node_discovered<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(Arc<Node>) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.discovery_tx.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let DiscoveryEvent::NodeDiscovered(node) = event {
                    callback(node);
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Clean shutdown: stop discovery and disconnect every node.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down manager");

        self.stop_discovery().await?;

        let nodes: Vec<_> = self.nodes.read().clone();
        for node in nodes {
            if node.is_connected() {
                if let Err(e) = node.disconnect().await {
                    warn!("Error disconnecting node {}: {}", node.tag(), e);
                }
            }
        }

        self.nodes.write().clear();

        Ok(())
    }

    /// Handle a discovery event from the scanner.
    ///
    /// The same peripheral showing up again updates the existing node in
    /// place; only genuinely new nodes are announced.
    fn handle_discovery_event(
        event: NodeDiscoveryEvent,
        nodes: &Arc<RwLock<Vec<Arc<Node>>>>,
        discovery_tx: &broadcast::Sender<DiscoveryEvent>,
    ) {
        let existing = nodes
            .read()
            .iter()
            .find(|n| n.tag() == event.identifier)
            .cloned();

        if let Some(node) = existing {
            node.update_from_advertising(&event.advertising, event.local_name, event.rssi);
            return;
        }

        let node = Arc::new(Node::new(
            event.identifier.clone(),
            event.peripheral,
            event.local_name,
            event.advertising,
            event.rssi,
        ));

        info!("Discovered new node: {} ({})", node.name(), node.tag());

        nodes.write().push(node.clone());

        let _ = discovery_tx.send(DiscoveryEvent::NodeDiscovered(node));
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.is_discovering.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_event_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<DiscoveryEvent>();
    }
}
