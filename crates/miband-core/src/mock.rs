//! Mock radio link for testing.
//!
//! [`MockLink`] implements [`RadioLink`] without Bluetooth hardware. It
//! simulates a band with a fixed attribute table and lets tests inject the
//! failures a real radio produces.
//!
//! # Features
//!
//! - **Failure injection**: failing connects, dropped links after subscribe
//!   or during reads, transient read timeouts
//! - **Scripted notifications**: payloads pushed after each subscribe
//! - **Call counters**: connects, disconnects, reads, subscribes, discoveries
//!
//! # Example
//!
//! ```
//! use miband_core::{ConnectMode, MockLink, RadioLink};
//!
//! #[tokio::main]
//! async fn main() {
//!     let link = MockLink::builder().battery(73).build();
//!     link.connect(ConnectMode::Blocking).await.unwrap();
//!     let payload = link.read_by_uuid(miband_types::uuid::BATTERY_LEVEL).await.unwrap();
//!     assert_eq!(payload[0], 73);
//! }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use miband_types::uuid::{
    ACTIVITY, BATTERY_LEVEL, BATTERY_SERVICE, CCCD, DEVICE_INFO_SERVICE, DEVICE_NAME,
    GAP_SERVICE, HARDWARE_REVISION, MIBAND_SERVICE, SERIAL_NUMBER, SOFTWARE_REVISION,
};
use miband_types::{CharacteristicHandle, DeviceAddress, DeviceInfo};

use crate::error::LinkError;
use crate::link::{
    AttributeTable, CharacteristicInfo, ConnectMode, DescriptorInfo, NotificationCallback,
    RadioLink, ServiceInfo,
};

/// Declaration handle of the activity characteristic in the default table.
pub const MOCK_ACTIVITY_HANDLE: CharacteristicHandle = CharacteristicHandle(70);

/// Value handle activity notifications arrive on in the default table.
pub const MOCK_ACTIVITY_VALUE_HANDLE: CharacteristicHandle = CharacteristicHandle(71);

/// Build a 16-byte activity payload.
pub fn activity_payload(steps: u32, distance_m: u32, calories: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u32_le(0x0000_000C);
    buf.put_u32_le(steps);
    buf.put_u32_le(distance_m);
    buf.put_u32_le(calories);
    buf.freeze()
}

/// Attribute table of a Mi Band 2 as seen by the session.
pub fn default_table() -> AttributeTable {
    let h = CharacteristicHandle;
    let service = |uuid, handle| ServiceInfo { uuid, handle };
    let characteristic = |uuid, service, handle| CharacteristicInfo {
        uuid,
        service,
        handle,
    };

    AttributeTable {
        services: vec![
            service(GAP_SERVICE, h(1)),
            service(DEVICE_INFO_SERVICE, h(12)),
            service(BATTERY_SERVICE, h(60)),
            service(MIBAND_SERVICE, h(63)),
        ],
        characteristics: vec![
            characteristic(DEVICE_NAME, GAP_SERVICE, h(2)),
            characteristic(SERIAL_NUMBER, DEVICE_INFO_SERVICE, h(13)),
            characteristic(HARDWARE_REVISION, DEVICE_INFO_SERVICE, h(15)),
            characteristic(SOFTWARE_REVISION, DEVICE_INFO_SERVICE, h(17)),
            characteristic(BATTERY_LEVEL, BATTERY_SERVICE, h(61)),
            characteristic(ACTIVITY, MIBAND_SERVICE, MOCK_ACTIVITY_HANDLE),
        ],
        descriptors: vec![DescriptorInfo {
            uuid: CCCD,
            characteristic: ACTIVITY,
            handle: h(72),
        }],
    }
}

/// A simulated band for testing.
pub struct MockLink {
    address: DeviceAddress,
    connected: AtomicBool,
    battery: RwLock<Bytes>,
    info: RwLock<DeviceInfo>,
    table: RwLock<AttributeTable>,
    notifications: RwLock<Vec<(CharacteristicHandle, Bytes)>>,
    notification_delay: Duration,
    connect_latency: Duration,
    always_fail_connect: AtomicBool,
    connect_failures: AtomicU32,
    read_timeouts: AtomicU32,
    drops_on_read: AtomicU32,
    drops_after_subscribe: AtomicU32,
    connect_calls: AtomicU32,
    disconnect_calls: AtomicU32,
    read_calls: AtomicU32,
    subscribe_calls: AtomicU32,
    discover_calls: AtomicU32,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for MockLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLink")
            .field("address", &self.address)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MockLink {
    /// Start building a mock link.
    pub fn builder() -> MockLinkBuilder {
        MockLinkBuilder::default()
    }

    // --- Runtime controls ---

    /// Replace the battery payload.
    pub async fn set_battery_payload(&self, payload: impl Into<Bytes>) {
        *self.battery.write().await = payload.into();
    }

    /// Replace the attribute table returned by discovery.
    pub async fn set_table(&self, table: AttributeTable) {
        *self.table.write().await = table;
    }

    /// Replace the notifications pushed after each subscribe.
    pub async fn set_notifications(&self, notifications: Vec<(CharacteristicHandle, Bytes)>) {
        *self.notifications.write().await = notifications;
    }

    /// Make every connect attempt fail (or stop failing).
    pub fn set_always_fail_connect(&self, fail: bool) {
        self.always_fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` connect attempts.
    pub fn set_connect_failures(&self, count: u32) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Drop the link right after the next `count` subscribes.
    pub fn set_drops_after_subscribe(&self, count: u32) {
        self.drops_after_subscribe.store(count, Ordering::SeqCst);
    }

    /// Simulate the band going out of range.
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    // --- Counters ---

    /// Number of `connect` calls.
    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Number of `disconnect` calls.
    pub fn disconnect_calls(&self) -> u32 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Number of `read_by_uuid` calls.
    pub fn read_calls(&self) -> u32 {
        self.read_calls.load(Ordering::SeqCst)
    }

    /// Number of `subscribe` calls.
    pub fn subscribe_calls(&self) -> u32 {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of full discoveries (counted on `discover_services`).
    pub fn discover_calls(&self) -> u32 {
        self.discover_calls.load(Ordering::SeqCst)
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn ensure_connected(&self) -> Result<(), LinkError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LinkError::NotConnected)
        }
    }
}

#[async_trait]
impl RadioLink for MockLink {
    fn address(&self) -> &DeviceAddress {
        &self.address
    }

    async fn connect(&self, mode: ConnectMode) -> Result<(), LinkError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        if !self.connect_latency.is_zero() {
            tokio::time::sleep(self.connect_latency).await;
        }

        let fails = self.always_fail_connect.load(Ordering::SeqCst)
            || Self::take_one(&self.connect_failures);
        match (fails, mode) {
            (false, _) => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            // The attempt is started but never completes
            (true, ConnectMode::NonBlocking) => Ok(()),
            (true, ConnectMode::Blocking) => Err(LinkError::ConnectionFailed(format!(
                "{} did not respond",
                self.address
            ))),
        }
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn read_by_uuid(&self, uuid: Uuid) -> Result<Bytes, LinkError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_connected()?;

        if Self::take_one(&self.drops_on_read) {
            self.drop_link();
            return Err(LinkError::NotConnected);
        }
        if Self::take_one(&self.read_timeouts) {
            return Err(LinkError::timeout(
                format!("read {}", uuid),
                Duration::from_secs(10),
            ));
        }

        let info = self.info.read().await;
        let text = |s: &str| Bytes::copy_from_slice(s.as_bytes());
        match uuid {
            BATTERY_LEVEL => Ok(self.battery.read().await.clone()),
            DEVICE_NAME => Ok(text(&info.name)),
            SERIAL_NUMBER => Ok(text(&info.serial)),
            HARDWARE_REVISION => Ok(text(&info.hardware_revision)),
            SOFTWARE_REVISION => Ok(text(&info.software_revision)),
            _ => Err(LinkError::CharacteristicNotFound { uuid }),
        }
    }

    async fn discover_services(&self) -> Result<Vec<ServiceInfo>, LinkError> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_connected()?;
        Ok(self.table.read().await.services.clone())
    }

    async fn discover_characteristics(&self) -> Result<Vec<CharacteristicInfo>, LinkError> {
        self.ensure_connected()?;
        Ok(self.table.read().await.characteristics.clone())
    }

    async fn discover_descriptors(&self) -> Result<Vec<DescriptorInfo>, LinkError> {
        self.ensure_connected()?;
        Ok(self.table.read().await.descriptors.clone())
    }

    async fn subscribe(
        &self,
        notify_handle: CharacteristicHandle,
        callback: NotificationCallback,
    ) -> Result<(), LinkError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_connected()?;

        let known = self
            .table
            .read()
            .await
            .descriptors
            .iter()
            .any(|d| d.handle == notify_handle && d.uuid == CCCD);
        if !known {
            return Err(LinkError::DiscoveryFailed(format!(
                "no notification descriptor at {}",
                notify_handle
            )));
        }

        if Self::take_one(&self.drops_after_subscribe) {
            self.drop_link();
            return Ok(());
        }

        let notifications = self.notifications.read().await.clone();
        if notifications.is_empty() {
            return Ok(());
        }

        let delay = self.notification_delay;
        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            for (handle, payload) in notifications {
                callback(handle, payload);
            }
        });
        self.tasks.lock().await.push(task);
        Ok(())
    }
}

/// Builder for [`MockLink`].
#[derive(Debug, Clone)]
pub struct MockLinkBuilder {
    address: String,
    battery: Bytes,
    info: DeviceInfo,
    table: AttributeTable,
    notifications: Vec<(CharacteristicHandle, Bytes)>,
    notification_delay: Duration,
    connect_latency: Duration,
    always_fail_connect: bool,
    connect_failures: u32,
    read_timeouts: u32,
    drops_on_read: u32,
    drops_after_subscribe: u32,
}

impl Default for MockLinkBuilder {
    fn default() -> Self {
        Self {
            address: "C8:0F:10:00:00:01".to_string(),
            battery: Bytes::from_static(&[85]),
            info: DeviceInfo::builder()
                .name("MI Band 2")
                .serial("MOCK-0001")
                .hardware_revision("V0.1.3.1")
                .software_revision("V1.0.1.81")
                .build(),
            table: default_table(),
            notifications: Vec::new(),
            notification_delay: Duration::from_millis(500),
            connect_latency: Duration::ZERO,
            always_fail_connect: false,
            connect_failures: 0,
            read_timeouts: 0,
            drops_on_read: 0,
            drops_after_subscribe: 0,
        }
    }
}

impl MockLinkBuilder {
    /// Set the peer address.
    #[must_use]
    pub fn address(mut self, address: &str) -> Self {
        self.address = address.to_string();
        self
    }

    /// Battery level reported by the band.
    #[must_use]
    pub fn battery(mut self, percent: u8) -> Self {
        self.battery = Bytes::copy_from_slice(&[percent]);
        self
    }

    /// Raw battery payload, for malformed data tests.
    #[must_use]
    pub fn battery_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.battery = payload.into();
        self
    }

    /// Device information strings.
    #[must_use]
    pub fn device_info(mut self, info: DeviceInfo) -> Self {
        self.info = info;
        self
    }

    /// Attribute table returned by discovery.
    #[must_use]
    pub fn table(mut self, table: AttributeTable) -> Self {
        self.table = table;
        self
    }

    /// Push an activity notification on the default value handle after
    /// each subscribe.
    #[must_use]
    pub fn activity(self, steps: u32, distance_m: u32, calories: u32) -> Self {
        self.notification(
            MOCK_ACTIVITY_VALUE_HANDLE,
            activity_payload(steps, distance_m, calories),
        )
    }

    /// Push an arbitrary notification after each subscribe.
    #[must_use]
    pub fn notification(mut self, handle: CharacteristicHandle, payload: impl Into<Bytes>) -> Self {
        self.notifications.push((handle, payload.into()));
        self
    }

    /// Delay between subscribe and the scripted notifications.
    #[must_use]
    pub fn notification_delay(mut self, delay: Duration) -> Self {
        self.notification_delay = delay;
        self
    }

    /// Time each successful or failing connect takes.
    #[must_use]
    pub fn connect_latency(mut self, latency: Duration) -> Self {
        self.connect_latency = latency;
        self
    }

    /// Make every connect attempt fail.
    #[must_use]
    pub fn always_fail_connect(mut self) -> Self {
        self.always_fail_connect = true;
        self
    }

    /// Fail the first `count` connect attempts.
    #[must_use]
    pub fn connect_failures(mut self, count: u32) -> Self {
        self.connect_failures = count;
        self
    }

    /// Time out the first `count` reads.
    #[must_use]
    pub fn read_timeouts(mut self, count: u32) -> Self {
        self.read_timeouts = count;
        self
    }

    /// Drop the link during the first `count` reads.
    #[must_use]
    pub fn drops_on_read(mut self, count: u32) -> Self {
        self.drops_on_read = count;
        self
    }

    /// Drop the link right after the first `count` subscribes.
    #[must_use]
    pub fn drops_after_subscribe(mut self, count: u32) -> Self {
        self.drops_after_subscribe = count;
        self
    }

    /// Build the mock link.
    ///
    /// # Panics
    ///
    /// Panics if the address is not a valid device address.
    #[must_use]
    pub fn build(self) -> MockLink {
        MockLink {
            address: DeviceAddress::parse(&self.address).expect("invalid mock address"),
            connected: AtomicBool::new(false),
            battery: RwLock::new(self.battery),
            info: RwLock::new(self.info),
            table: RwLock::new(self.table),
            notifications: RwLock::new(self.notifications),
            notification_delay: self.notification_delay,
            connect_latency: self.connect_latency,
            always_fail_connect: AtomicBool::new(self.always_fail_connect),
            connect_failures: AtomicU32::new(self.connect_failures),
            read_timeouts: AtomicU32::new(self.read_timeouts),
            drops_on_read: AtomicU32::new(self.drops_on_read),
            drops_after_subscribe: AtomicU32::new(self.drops_after_subscribe),
            connect_calls: AtomicU32::new(0),
            disconnect_calls: AtomicU32::new(0),
            read_calls: AtomicU32::new(0),
            subscribe_calls: AtomicU32::new(0),
            discover_calls: AtomicU32::new(0),
            tasks: Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn test_connect_and_read() {
        let link = MockLink::builder().battery(42).build();
        assert!(matches!(
            link.read_by_uuid(BATTERY_LEVEL).await,
            Err(LinkError::NotConnected)
        ));

        link.connect(ConnectMode::Blocking).await.unwrap();
        assert!(link.is_connected().await);
        assert_eq!(link.read_by_uuid(BATTERY_LEVEL).await.unwrap()[..], [42]);
        assert_eq!(link.read_calls(), 2);
    }

    #[tokio::test]
    async fn test_connect_failures_then_success() {
        let link = MockLink::builder().connect_failures(2).build();

        assert!(link.connect(ConnectMode::Blocking).await.is_err());
        assert!(link.connect(ConnectMode::Blocking).await.is_err());
        assert!(link.connect(ConnectMode::Blocking).await.is_ok());
        assert_eq!(link.connect_calls(), 3);
    }

    #[tokio::test]
    async fn test_non_blocking_failure_never_connects() {
        let link = MockLink::builder().always_fail_connect().build();
        assert!(link.connect(ConnectMode::NonBlocking).await.is_ok());
        assert!(!link.is_connected().await);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let link = MockLink::builder().build();
        link.disconnect().await.unwrap();
        link.connect(ConnectMode::Blocking).await.unwrap();
        link.drop_link();
        link.disconnect().await.unwrap();
        assert_eq!(link.disconnect_calls(), 2);
    }

    #[tokio::test]
    async fn test_discovery_finds_activity() {
        let link = MockLink::builder().build();
        link.connect(ConnectMode::Blocking).await.unwrap();

        let table = AttributeTable::discover(&link).await.unwrap();
        assert_eq!(
            table.find_characteristic_handle(ACTIVITY),
            Some(MOCK_ACTIVITY_HANDLE)
        );
        assert_eq!(link.discover_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted_notifications_delivered_in_order() {
        let link = MockLink::builder()
            .activity(1, 2, 3)
            .notification(CharacteristicHandle(5), Bytes::from_static(&[0]))
            .build();
        link.connect(ConnectMode::Blocking).await.unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        link.subscribe(
            CharacteristicHandle(72),
            Arc::new(move |handle: CharacteristicHandle, payload: Bytes| {
                sink.lock().unwrap().push((handle, payload.len()));
            }),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(MOCK_ACTIVITY_VALUE_HANDLE, 16), (CharacteristicHandle(5), 1)]
        );
    }

    #[tokio::test]
    async fn test_drop_after_subscribe() {
        let link = MockLink::builder().drops_after_subscribe(1).build();
        link.connect(ConnectMode::Blocking).await.unwrap();
        let ignore: NotificationCallback = Arc::new(|_, _| {});
        link.subscribe(CharacteristicHandle(72), ignore).await.unwrap();
        assert!(!link.is_connected().await);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_descriptor() {
        let link = MockLink::builder().build();
        link.connect(ConnectMode::Blocking).await.unwrap();
        let ignore: NotificationCallback = Arc::new(|_, _| {});
        let result = link.subscribe(CharacteristicHandle(99), ignore).await;
        assert!(matches!(result, Err(LinkError::DiscoveryFailed(_))));
    }

    #[test]
    fn test_activity_payload_layout() {
        let payload = activity_payload(10_000, 8_000, 450);
        assert_eq!(payload.len(), 16);
        assert_eq!(&payload[4..8], &10_000u32.to_le_bytes());
    }
}
