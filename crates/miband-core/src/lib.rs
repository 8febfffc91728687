//! BLE polling sessions for Mi Smart Band fitness bands.
//!
//! This crate talks to a band over Bluetooth Low Energy in short refresh
//! cycles: connect, read the battery level, subscribe to the activity
//! characteristic, wait for one notification, disconnect. The band drops
//! idle links aggressively, so nothing is held open between refreshes.
//!
//! # Layers
//!
//! - [`RadioLink`]: the radio primitives a session needs. [`BleLink`]
//!   implements it with btleplug; [`MockLink`] simulates a band for tests.
//! - [`NotificationRouter`]: decodes activity notifications and wakes the
//!   waiting session.
//! - [`DeviceSession`]: the refresh state machine with its connect, read and
//!   cycle retry budgets.
//! - [`SnapshotStore`]: the last good reading of each kind, shared with
//!   whatever publishes them.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use miband_core::{BleLink, DeviceSession, LinkConfig, SessionConfig, SnapshotStore};
//! use miband_types::DeviceAddress;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let address = DeviceAddress::parse("C8:0F:10:AA:BB:CC")?;
//!     let link = BleLink::new(address, LinkConfig::default());
//!     let snapshot = Arc::new(SnapshotStore::new());
//!     let session = DeviceSession::new(link, SessionConfig::default(), Arc::clone(&snapshot))?;
//!
//!     let outcome = session.refresh().await;
//!     println!("{:?}: battery {:?}", outcome, snapshot.battery().map(|b| b.percent));
//!     Ok(())
//! }
//! ```
//!
//! # Platform Differences
//!
//! On macOS, peripherals are identified by a CoreBluetooth UUID instead of
//! their MAC address. [`DeviceAddress`](miband_types::DeviceAddress) accepts
//! both; use the identifier [`scan::scan_for_devices`] reports.

pub mod ble;
pub mod error;
pub mod events;
pub mod link;
pub mod metrics;
pub mod mock;
pub mod retry;
pub mod router;
pub mod scan;
pub mod session;
pub mod snapshot;
pub mod util;

pub use miband_types;
pub use miband_types::uuid;

// Core exports
pub use ble::{BleLink, LinkConfig};
pub use error::{DeviceNotFoundReason, Error, LinkError, Result};
pub use link::{
    ActivityHandles, AttributeTable, CharacteristicInfo, ConnectMode, DescriptorInfo,
    NotificationCallback, RadioLink, ServiceInfo,
};
pub use session::{DeviceSession, RefreshOutcome, SessionConfig, SessionState};
pub use snapshot::SnapshotStore;

pub use events::{EventDispatcher, EventReceiver, SessionEvent};
pub use metrics::{OperationStats, SessionMetricsSummary};
pub use mock::{MockLink, MockLinkBuilder};
pub use retry::{RetryFailure, RetryPolicy, Retryable, with_retry};
pub use router::{NotificationRouter, WakePolicy, Wakeup, decode_notification};
pub use scan::{DiscoveredDevice, ScanOptions, scan_for_devices};
pub use util::{create_identifier, format_peripheral_id};

/// A session shared between the scheduler task and readers.
pub type SharedSession<L> = std::sync::Arc<DeviceSession<L>>;
