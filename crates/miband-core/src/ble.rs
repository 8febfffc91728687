//! [`RadioLink`] over btleplug.
//!
//! btleplug addresses characteristics by UUID and hides ATT handles, so the
//! link numbers the attribute table itself after each discovery: a service
//! declaration, then per characteristic a declaration, its value at
//! declaration + 1, and its descriptors (client configuration first). On
//! the band this puts the notification descriptor at declaration + 2, the
//! layout the session derives its handles from. Incoming notifications are
//! mapped from their characteristic UUID back to the value handle.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Characteristic, Peripheral as _, Service};
use btleplug::platform::{Adapter, Peripheral};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use miband_types::uuid::CCCD;
use miband_types::{CharacteristicHandle, DeviceAddress};

use crate::error::LinkError;
use crate::link::{
    CharacteristicInfo, ConnectMode, DescriptorInfo, NotificationCallback, RadioLink, ServiceInfo,
};
use crate::scan::find_peripheral;

/// Default timeout for establishing a connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default timeout for characteristic reads and CCCD writes.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for attribute discovery.
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time spent scanning for the band before the first connect.
const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeouts for [`BleLink`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use miband_core::LinkConfig;
///
/// let config = LinkConfig::default()
///     .connect_timeout(Duration::from_secs(20))
///     .read_timeout(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LinkConfig {
    /// Timeout for one connect attempt.
    pub connect_timeout: Duration,
    /// Timeout for one read or notification enable.
    pub read_timeout: Duration,
    /// Timeout for attribute discovery.
    pub discovery_timeout: Duration,
    /// How long to scan for the band when it is not yet known to the adapter.
    pub scan_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
        }
    }
}

impl LinkConfig {
    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the read timeout.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the discovery timeout.
    #[must_use]
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set the scan timeout.
    #[must_use]
    pub fn scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }
}

/// Numbered attribute table of the current connection.
#[derive(Debug, Default, Clone)]
struct HandleLayout {
    services: Vec<ServiceInfo>,
    characteristics: Vec<CharacteristicInfo>,
    descriptors: Vec<DescriptorInfo>,
    /// Characteristic that owns each client configuration descriptor.
    by_cccd: HashMap<CharacteristicHandle, Characteristic>,
    /// Value handle of each characteristic, for routing notifications.
    value_handles: HashMap<Uuid, CharacteristicHandle>,
}

impl HandleLayout {
    fn build(services: &BTreeSet<Service>) -> Self {
        let mut layout = Self::default();
        let mut next = 1u16;
        let mut take = || {
            let handle = CharacteristicHandle(next);
            next = next.saturating_add(1);
            handle
        };

        for service in services.iter().filter(|s| s.primary) {
            layout.services.push(ServiceInfo {
                uuid: service.uuid,
                handle: take(),
            });

            for characteristic in &service.characteristics {
                let declaration = take();
                let value = take();
                layout.characteristics.push(CharacteristicInfo {
                    uuid: characteristic.uuid,
                    service: service.uuid,
                    handle: declaration,
                });
                layout.value_handles.insert(characteristic.uuid, value);

                let mut descriptors: Vec<Uuid> =
                    characteristic.descriptors.iter().map(|d| d.uuid).collect();
                descriptors.sort_by_key(|uuid| *uuid != CCCD);

                for uuid in descriptors {
                    let handle = take();
                    if uuid == CCCD {
                        layout.by_cccd.insert(handle, characteristic.clone());
                    }
                    layout.descriptors.push(DescriptorInfo {
                        uuid,
                        characteristic: characteristic.uuid,
                        handle,
                    });
                }
            }
        }

        layout
    }
}

/// A BLE connection to one band.
///
/// The peripheral is located lazily on the first connect and reused for the
/// lifetime of the link.
pub struct BleLink {
    address: DeviceAddress,
    config: LinkConfig,
    target: OnceCell<(Adapter, Peripheral)>,
    layout: RwLock<Option<HandleLayout>>,
    notification_handles: Mutex<Vec<JoinHandle<()>>>,
    pending_connect: Mutex<Option<JoinHandle<()>>>,
    disconnected: AtomicBool,
}

impl std::fmt::Debug for BleLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleLink")
            .field("address", &self.address)
            .field("config", &self.config)
            .field("resolved", &self.target.initialized())
            .finish_non_exhaustive()
    }
}

impl BleLink {
    /// Create a link to `address`. No radio activity happens until
    /// [`RadioLink::connect`].
    pub fn new(address: DeviceAddress, config: LinkConfig) -> Self {
        Self {
            address,
            config,
            target: OnceCell::new(),
            layout: RwLock::new(None),
            notification_handles: Mutex::new(Vec::new()),
            pending_connect: Mutex::new(None),
            disconnected: AtomicBool::new(true),
        }
    }

    /// The link's timeouts.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    async fn peripheral(&self) -> Result<&Peripheral, LinkError> {
        let (_, peripheral) = self
            .target
            .get_or_try_init(|| find_peripheral(&self.address, self.config.scan_timeout))
            .await?;
        Ok(peripheral)
    }

    fn resolved_peripheral(&self) -> Option<&Peripheral> {
        self.target.get().map(|(_, peripheral)| peripheral)
    }

    async fn connected_peripheral(&self) -> Result<&Peripheral, LinkError> {
        let peripheral = self.resolved_peripheral().ok_or(LinkError::NotConnected)?;
        if peripheral.is_connected().await.unwrap_or(false) {
            Ok(peripheral)
        } else {
            Err(LinkError::NotConnected)
        }
    }

    /// Map a btleplug failure, reporting a dead link as [`LinkError::NotConnected`].
    async fn classify(&self, peripheral: &Peripheral, error: btleplug::Error) -> LinkError {
        if peripheral.is_connected().await.unwrap_or(false) {
            LinkError::Bluetooth(error)
        } else {
            debug!("Link to {} dropped: {}", self.address, error);
            LinkError::NotConnected
        }
    }

    /// Discover the attribute table of the current connection once.
    async fn layout(&self) -> Result<HandleLayout, LinkError> {
        if let Some(layout) = self.layout.read().await.as_ref() {
            return Ok(layout.clone());
        }

        let peripheral = self.connected_peripheral().await?;
        debug!("Discovering services on {}", self.address);
        match timeout(self.config.discovery_timeout, peripheral.discover_services()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.classify(peripheral, e).await),
            Err(_) => {
                return Err(LinkError::timeout(
                    "discover services",
                    self.config.discovery_timeout,
                ));
            }
        }

        let layout = HandleLayout::build(&peripheral.services());
        debug!(
            "Discovered {} services, {} characteristics, {} descriptors",
            layout.services.len(),
            layout.characteristics.len(),
            layout.descriptors.len()
        );
        *self.layout.write().await = Some(layout.clone());
        Ok(layout)
    }

    async fn abort_tasks(&self) {
        for handle in self.notification_handles.lock().await.drain(..) {
            handle.abort();
        }
        if let Some(handle) = self.pending_connect.lock().await.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl RadioLink for BleLink {
    fn address(&self) -> &DeviceAddress {
        &self.address
    }

    #[tracing::instrument(level = "debug", skip(self), fields(address = %self.address))]
    async fn connect(&self, mode: ConnectMode) -> Result<(), LinkError> {
        let peripheral = self.peripheral().await?;
        if peripheral.is_connected().await.unwrap_or(false) {
            return Ok(());
        }

        // A fresh connection gets a fresh attribute table
        *self.layout.write().await = None;
        self.disconnected.store(false, Ordering::SeqCst);

        match mode {
            ConnectMode::Blocking => {
                timeout(self.config.connect_timeout, peripheral.connect())
                    .await
                    .map_err(|_| LinkError::timeout("connect", self.config.connect_timeout))?
                    .map_err(|e| LinkError::ConnectionFailed(e.to_string()))?;
                info!("Connected to {}", self.address);
            }
            ConnectMode::NonBlocking => {
                let peripheral = peripheral.clone();
                let address = self.address.clone();
                let connect_timeout = self.config.connect_timeout;
                let handle = tokio::spawn(async move {
                    match timeout(connect_timeout, peripheral.connect()).await {
                        Ok(Ok(())) => debug!("Background connect to {} finished", address),
                        Ok(Err(e)) => debug!("Background connect to {} failed: {}", address, e),
                        Err(_) => debug!("Background connect to {} timed out", address),
                    }
                });
                if let Some(previous) = self.pending_connect.lock().await.replace(handle) {
                    previous.abort();
                }
            }
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        match self.resolved_peripheral() {
            Some(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            None => false,
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(address = %self.address))]
    async fn disconnect(&self) -> Result<(), LinkError> {
        self.disconnected.store(true, Ordering::SeqCst);
        self.abort_tasks().await;
        *self.layout.write().await = None;

        let Some(peripheral) = self.resolved_peripheral() else {
            return Ok(());
        };
        if !peripheral.is_connected().await.unwrap_or(false) {
            return Ok(());
        }

        if let Err(e) = peripheral.disconnect().await {
            if peripheral.is_connected().await.unwrap_or(false) {
                return Err(LinkError::Bluetooth(e));
            }
            debug!("Disconnect of {} raced with link loss: {}", self.address, e);
        }
        debug!("Disconnected from {}", self.address);
        Ok(())
    }

    async fn read_by_uuid(&self, uuid: Uuid) -> Result<Bytes, LinkError> {
        let peripheral = self.connected_peripheral().await?;
        // Reads may precede explicit discovery; btleplug needs the table.
        self.layout().await?;

        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(LinkError::CharacteristicNotFound { uuid })?;

        match timeout(self.config.read_timeout, peripheral.read(&characteristic)).await {
            Ok(Ok(data)) => {
                trace!("Read {} bytes from {}", data.len(), uuid);
                Ok(Bytes::from(data))
            }
            Ok(Err(e)) => Err(self.classify(peripheral, e).await),
            Err(_) => Err(LinkError::timeout(
                format!("read {}", uuid),
                self.config.read_timeout,
            )),
        }
    }

    async fn discover_services(&self) -> Result<Vec<ServiceInfo>, LinkError> {
        Ok(self.layout().await?.services)
    }

    async fn discover_characteristics(&self) -> Result<Vec<CharacteristicInfo>, LinkError> {
        Ok(self.layout().await?.characteristics)
    }

    async fn discover_descriptors(&self) -> Result<Vec<DescriptorInfo>, LinkError> {
        Ok(self.layout().await?.descriptors)
    }

    async fn subscribe(
        &self,
        notify_handle: CharacteristicHandle,
        callback: NotificationCallback,
    ) -> Result<(), LinkError> {
        let peripheral = self.connected_peripheral().await?;
        let layout = self.layout().await?;

        let characteristic = layout.by_cccd.get(&notify_handle).cloned().ok_or_else(|| {
            LinkError::DiscoveryFailed(format!(
                "no notification descriptor at {}",
                notify_handle
            ))
        })?;

        // Open the stream first so nothing sent right after enabling is lost
        let mut stream = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => return Err(self.classify(peripheral, e).await),
        };

        match timeout(self.config.read_timeout, peripheral.subscribe(&characteristic)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.classify(peripheral, e).await),
            Err(_) => {
                return Err(LinkError::timeout(
                    format!("enable notifications on {}", characteristic.uuid),
                    self.config.read_timeout,
                ));
            }
        }
        let value_handles = layout.value_handles;
        let address = self.address.clone();

        let handle = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                match value_handles.get(&notification.uuid) {
                    Some(handle) => callback(*handle, Bytes::from(notification.value)),
                    None => trace!(
                        "Notification from {} on unknown characteristic {}",
                        address, notification.uuid
                    ),
                }
            }
            trace!("Notification stream for {} ended", address);
        });

        self.notification_handles.lock().await.push(handle);
        debug!(
            "Subscribed to {} via {}",
            characteristic.uuid, notify_handle
        );
        Ok(())
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        if self.disconnected.load(Ordering::SeqCst) {
            return;
        }

        warn!(
            address = %self.address,
            "BleLink dropped while connected, performing best-effort cleanup"
        );

        if let Ok(mut handles) = self.notification_handles.try_lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }

        if let (Some(peripheral), Ok(runtime)) = (
            self.resolved_peripheral().cloned(),
            tokio::runtime::Handle::try_current(),
        ) {
            runtime.spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    debug!(error = %e, "Best-effort disconnect failed");
                }
            });
        }
    }
}
