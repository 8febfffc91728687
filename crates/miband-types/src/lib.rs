//! Platform-agnostic types for Mi Smart Band fitness bands.
//!
//! This crate holds the data model shared by the BLE session layer
//! (miband-core) and host integrations (miband-service): readings, their
//! payload decoders, and the GATT UUID constants of the band.
//!
//! # Example
//!
//! ```
//! use miband_types::ActivitySample;
//! use time::OffsetDateTime;
//!
//! let payload = [
//!     0x0C, 0x00, 0x00, 0x00, // header, ignored
//!     0x10, 0x27, 0x00, 0x00, // steps = 10000
//!     0x40, 0x1F, 0x00, 0x00, // distance = 8000 m
//!     0xC2, 0x01, 0x00, 0x00, // calories = 450
//! ];
//! let sample = ActivitySample::from_bytes(&payload, OffsetDateTime::now_utc()).unwrap();
//! assert_eq!(sample.steps, 10_000);
//! ```

pub mod error;
pub mod types;
pub mod uuid;

pub use error::{AddressError, DecodeError, DecodeResult};
pub use types::{
    ActivitySample, BatteryReading, CharacteristicHandle, DeviceAddress, DeviceInfo,
    DeviceInfoBuilder, MAX_BATTERY_PERCENT, MIN_ACTIVITY_PAYLOAD_BYTES, Reading, ReadingKind,
};
pub use uuid as uuids;
