//! Core types for Mi Band readings.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{AddressError, DecodeError, DecodeResult};

/// Minimum number of bytes in an activity notification payload.
pub const MIN_ACTIVITY_PAYLOAD_BYTES: usize = 16;

/// Maximum valid battery percentage.
pub const MAX_BATTERY_PERCENT: u8 = 100;

/// Address of the radio peer a session talks to.
///
/// On Linux and Windows this is the Bluetooth MAC address
/// (`C8:0F:10:AA:BB:CC`), normalised to upper case. On macOS it is the
/// CoreBluetooth peripheral UUID. Either way it is opaque to the session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Parse an address, trimming whitespace and upper-casing MAC addresses.
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        let trimmed = address.trim();
        if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
            return Err(AddressError(address.to_string()));
        }

        if trimmed.contains(':') {
            let octets: Vec<&str> = trimmed.split(':').collect();
            let valid = octets.len() == 6
                && octets
                    .iter()
                    .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
            if !valid {
                return Err(AddressError(address.to_string()));
            }
            return Ok(Self(trimmed.to_ascii_uppercase()));
        }

        Ok(Self(trimmed.to_string()))
    }

    /// The address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether a scanned peer identifier refers to this address.
    pub fn matches(&self, identifier: &str) -> bool {
        self.0.eq_ignore_ascii_case(identifier.trim())
    }
}

impl FromStr for DeviceAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeviceAddress> for String {
    fn from(address: DeviceAddress) -> Self {
        address.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle of a remote attribute in the band's attribute table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CharacteristicHandle(pub u16);

impl CharacteristicHandle {
    /// Handle at a fixed offset from this one, or `None` on overflow.
    #[must_use]
    pub fn offset(self, by: u16) -> Option<Self> {
        self.0.checked_add(by).map(Self)
    }
}

impl fmt::Display for CharacteristicHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Kind of reading held in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ReadingKind {
    /// Battery percentage.
    BatteryLevel,
    /// Steps, distance and calories.
    Activity,
}

impl ReadingKind {
    /// All reading kinds, in display order.
    pub const ALL: [ReadingKind; 2] = [ReadingKind::BatteryLevel, ReadingKind::Activity];

    /// Stable snake-case key for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingKind::BatteryLevel => "battery_level",
            ReadingKind::Activity => "activity",
        }
    }
}

impl fmt::Display for ReadingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Activity counters pushed by the band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ActivitySample {
    /// When the notification carrying this sample arrived.
    pub captured_at: OffsetDateTime,
    /// Step count.
    pub steps: u32,
    /// Distance walked in meters.
    pub distance_m: u32,
    /// Calories burned.
    pub calories: u32,
}

impl ActivitySample {
    /// Decode an activity notification payload.
    ///
    /// The byte format is:
    /// - bytes 0-3: ignored
    /// - bytes 4-7: Steps (u32 LE)
    /// - bytes 8-11: Distance in meters (u32 LE)
    /// - bytes 12-15: Calories (u32 LE)
    ///
    /// Anything past byte 15 is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::MalformedPayload`] if `data` contains fewer than
    /// [`MIN_ACTIVITY_PAYLOAD_BYTES`] (16) bytes. A short payload never yields
    /// a partial sample.
    #[must_use = "decoding returns a Result that should be handled"]
    pub fn from_bytes(data: &[u8], captured_at: OffsetDateTime) -> DecodeResult<Self> {
        use bytes::Buf;

        if data.len() < MIN_ACTIVITY_PAYLOAD_BYTES {
            return Err(DecodeError::malformed(
                MIN_ACTIVITY_PAYLOAD_BYTES,
                data.len(),
            ));
        }

        let mut buf = &data[4..MIN_ACTIVITY_PAYLOAD_BYTES];
        let steps = buf.get_u32_le();
        let distance_m = buf.get_u32_le();
        let calories = buf.get_u32_le();

        Ok(Self {
            captured_at,
            steps,
            distance_m,
            calories,
        })
    }
}

/// Battery level read from the standard battery characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BatteryReading {
    /// When the read completed.
    pub captured_at: OffsetDateTime,
    /// Battery level percentage (0-100).
    pub percent: u8,
}

impl BatteryReading {
    /// Decode a battery level payload.
    ///
    /// The whole payload is read as one little-endian integer, so trailing
    /// non-zero bytes push the value out of range rather than being ignored.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::MalformedPayload`] for an empty payload and
    /// [`DecodeError::OutOfRange`] for a value above 100. Out-of-range values
    /// are never clamped; values wider than 32 bits saturate to `u32::MAX`.
    #[must_use = "decoding returns a Result that should be handled"]
    pub fn from_bytes(data: &[u8], captured_at: OffsetDateTime) -> DecodeResult<Self> {
        if data.is_empty() {
            return Err(DecodeError::malformed(1, 0));
        }

        let value = data
            .iter()
            .enumerate()
            .fold(0u32, |acc, (i, &byte)| match (i, byte) {
                (_, 0) => acc,
                (0..=3, byte) => acc | (u32::from(byte) << (8 * i)),
                _ => u32::MAX,
            });

        match u8::try_from(value) {
            Ok(percent) if percent <= MAX_BATTERY_PERCENT => Ok(Self {
                captured_at,
                percent,
            }),
            _ => Err(DecodeError::OutOfRange {
                value,
                max: u32::from(MAX_BATTERY_PERCENT),
            }),
        }
    }
}

/// A successfully decoded reading of either kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum Reading {
    /// Battery level.
    #[cfg_attr(feature = "serde", serde(rename = "battery_level"))]
    Battery(BatteryReading),
    /// Activity counters.
    Activity(ActivitySample),
}

impl Reading {
    /// The kind of this reading.
    pub fn kind(&self) -> ReadingKind {
        match self {
            Reading::Battery(_) => ReadingKind::BatteryLevel,
            Reading::Activity(_) => ReadingKind::Activity,
        }
    }

    /// Capture timestamp of this reading.
    pub fn captured_at(&self) -> OffsetDateTime {
        match self {
            Reading::Battery(b) => b.captured_at,
            Reading::Activity(a) => a.captured_at,
        }
    }
}

impl From<BatteryReading> for Reading {
    fn from(reading: BatteryReading) -> Self {
        Reading::Battery(reading)
    }
}

impl From<ActivitySample> for Reading {
    fn from(sample: ActivitySample) -> Self {
        Reading::Activity(sample)
    }
}

/// Identity strings read from the band's GAP and Device Information services.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceInfo {
    /// Advertised device name.
    pub name: String,
    /// Serial number.
    pub serial: String,
    /// Hardware revision.
    pub hardware_revision: String,
    /// Software revision.
    pub software_revision: String,
}

impl DeviceInfo {
    /// Create a builder for constructing `DeviceInfo`.
    pub fn builder() -> DeviceInfoBuilder {
        DeviceInfoBuilder::default()
    }
}

/// Builder for constructing `DeviceInfo`.
#[derive(Debug, Default, Clone)]
#[must_use]
pub struct DeviceInfoBuilder {
    info: DeviceInfo,
}

impl DeviceInfoBuilder {
    /// Set the device name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.info.name = name.into();
        self
    }

    /// Set the serial number.
    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.info.serial = serial.into();
        self
    }

    /// Set the hardware revision.
    pub fn hardware_revision(mut self, revision: impl Into<String>) -> Self {
        self.info.hardware_revision = revision.into();
        self
    }

    /// Set the software revision.
    pub fn software_revision(mut self, revision: impl Into<String>) -> Self {
        self.info.software_revision = revision.into();
        self
    }

    /// Build the `DeviceInfo`.
    #[must_use]
    pub fn build(self) -> DeviceInfo {
        self.info
    }
}
