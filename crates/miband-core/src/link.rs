//! The radio link abstraction.
//!
//! [`RadioLink`] is the seam between the session state machine and the
//! Bluetooth stack. [`crate::ble::BleLink`] implements it over btleplug and
//! [`crate::mock::MockLink`] implements it for tests.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use miband_types::{CharacteristicHandle, DeviceAddress};

use crate::error::LinkError;

/// Callback invoked for every notification the peer pushes.
///
/// Runs on a link-owned task in arrival order. It must only route and
/// decode; issuing radio operations from it would deadlock the link.
pub type NotificationCallback = Arc<dyn Fn(CharacteristicHandle, Bytes) + Send + Sync>;

/// How [`RadioLink::connect`] behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectMode {
    /// Wait inline until the connection is established or fails.
    #[default]
    Blocking,
    /// Initiate the connection and return; the caller confirms with
    /// [`RadioLink::is_connected`].
    NonBlocking,
}

/// A primary service in the attribute table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceInfo {
    /// Service UUID.
    pub uuid: Uuid,
    /// Service declaration handle.
    pub handle: CharacteristicHandle,
}

/// A characteristic in the attribute table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicInfo {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// UUID of the owning service.
    pub service: Uuid,
    /// Characteristic declaration handle.
    pub handle: CharacteristicHandle,
}

/// A descriptor in the attribute table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorInfo {
    /// Descriptor UUID.
    pub uuid: Uuid,
    /// UUID of the owning characteristic.
    pub characteristic: Uuid,
    /// Descriptor handle.
    pub handle: CharacteristicHandle,
}

/// Trait abstracting a connection-oriented radio link to one peer.
///
/// Implementations own the connection handle; callers own the lifecycle
/// (a session opens, uses and closes the link within one refresh cycle).
#[async_trait]
pub trait RadioLink: Send + Sync {
    /// Address of the peer this link talks to.
    fn address(&self) -> &DeviceAddress;

    /// Establish the connection. No-op if already connected.
    async fn connect(&self, mode: ConnectMode) -> Result<(), LinkError>;

    /// Non-blocking connection status.
    async fn is_connected(&self) -> bool;

    /// Tear down the connection.
    ///
    /// No-op if not connected. Must succeed on a connection that already
    /// died asynchronously.
    async fn disconnect(&self) -> Result<(), LinkError>;

    /// Synchronous request/response read of a characteristic by UUID.
    ///
    /// Fails with [`LinkError::NotConnected`] if the link dropped mid-call and
    /// [`LinkError::Timeout`] if the peer did not answer in time.
    async fn read_by_uuid(&self, uuid: Uuid) -> Result<Bytes, LinkError>;

    /// Enumerate primary services. Only valid while connected.
    async fn discover_services(&self) -> Result<Vec<ServiceInfo>, LinkError>;

    /// Enumerate characteristics. Only valid while connected.
    async fn discover_characteristics(&self) -> Result<Vec<CharacteristicInfo>, LinkError>;

    /// Enumerate descriptors. Only valid while connected.
    async fn discover_descriptors(&self) -> Result<Vec<DescriptorInfo>, LinkError>;

    /// Enable notifications through the descriptor at `notify_handle` and
    /// deliver every subsequent notification to `callback`.
    ///
    /// Registrations end when the link disconnects.
    async fn subscribe(
        &self,
        notify_handle: CharacteristicHandle,
        callback: NotificationCallback,
    ) -> Result<(), LinkError>;
}

/// Snapshot of a discovered attribute table.
///
/// Cached by the session across refreshes; compared on rediscovery to detect
/// a changed table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeTable {
    /// Primary services.
    pub services: Vec<ServiceInfo>,
    /// Characteristics of all services.
    pub characteristics: Vec<CharacteristicInfo>,
    /// Descriptors of all characteristics.
    pub descriptors: Vec<DescriptorInfo>,
}

impl AttributeTable {
    /// Run all three discovery steps against a connected link.
    pub async fn discover<L: RadioLink + ?Sized>(link: &L) -> Result<Self, LinkError> {
        let services = link.discover_services().await?;
        let characteristics = link.discover_characteristics().await?;
        let descriptors = link.discover_descriptors().await?;

        if services.is_empty() {
            return Err(LinkError::DiscoveryFailed(
                "peer reported no services".to_string(),
            ));
        }

        Ok(Self {
            services,
            characteristics,
            descriptors,
        })
    }

    /// Declaration handle of the characteristic with the given UUID.
    pub fn find_characteristic_handle(&self, uuid: Uuid) -> Option<CharacteristicHandle> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .map(|c| c.handle)
    }

    /// Number of attributes of all kinds.
    pub fn len(&self) -> usize {
        self.services.len() + self.characteristics.len() + self.descriptors.len()
    }

    /// Whether nothing has been discovered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handles of the activity characteristic.
///
/// Derived from the declaration handle by fixed offsets: the value follows
/// the declaration and the notification descriptor follows the value. This
/// matches the band's attribute table layout and is not validated against
/// the discovered descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityHandles {
    /// Characteristic declaration handle.
    pub declaration: CharacteristicHandle,
    /// Value handle notifications arrive on.
    pub value: CharacteristicHandle,
    /// Descriptor written to enable notifications.
    pub notify: CharacteristicHandle,
}

impl ActivityHandles {
    /// Derive value and notify handles from the declaration handle.
    pub fn from_declaration(declaration: CharacteristicHandle) -> Option<Self> {
        Some(Self {
            declaration,
            value: declaration.offset(1)?,
            notify: declaration.offset(2)?,
        })
    }
}
