//! Bluetooth UUIDs for Mi Smart Band devices.
//!
//! These are protocol constants of the band's attribute table, not
//! configuration.

use uuid::{Uuid, uuid};

// --- Standard BLE Service UUIDs ---

/// Generic Access Profile (GAP) service.
pub const GAP_SERVICE: Uuid = uuid!("00001800-0000-1000-8000-00805f9b34fb");

/// Device Information service.
pub const DEVICE_INFO_SERVICE: Uuid = uuid!("0000180a-0000-1000-8000-00805f9b34fb");

/// Battery service.
pub const BATTERY_SERVICE: Uuid = uuid!("0000180f-0000-1000-8000-00805f9b34fb");

// --- Device Information Characteristic UUIDs ---

/// Device name characteristic.
pub const DEVICE_NAME: Uuid = uuid!("00002a00-0000-1000-8000-00805f9b34fb");

/// Serial number string characteristic.
pub const SERIAL_NUMBER: Uuid = uuid!("00002a25-0000-1000-8000-00805f9b34fb");

/// Hardware revision string characteristic.
pub const HARDWARE_REVISION: Uuid = uuid!("00002a27-0000-1000-8000-00805f9b34fb");

/// Software revision string characteristic.
pub const SOFTWARE_REVISION: Uuid = uuid!("00002a28-0000-1000-8000-00805f9b34fb");

// --- Battery Characteristic UUIDs ---

/// Battery level characteristic (single byte, percent).
pub const BATTERY_LEVEL: Uuid = uuid!("00002a19-0000-1000-8000-00805f9b34fb");

// --- Mi Band vendor UUIDs ---

/// Xiaomi vendor service hosting the activity characteristic.
pub const MIBAND_SERVICE: Uuid = uuid!("0000fee0-0000-1000-8000-00805f9b34fb");

/// Realtime activity characteristic (steps, distance, calories).
///
/// The band pushes a 16-byte notification on this characteristic's value
/// handle once notifications are enabled.
pub const ACTIVITY: Uuid = uuid!("00000007-0000-3512-2118-0009af100700");

// --- Descriptor UUIDs ---

/// Client Characteristic Configuration Descriptor.
pub const CCCD: Uuid = uuid!("00002902-0000-1000-8000-00805f9b34fb");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery_level_uuid() {
        assert_eq!(
            BATTERY_LEVEL.to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_activity_uuid_is_vendor_specific() {
        assert_eq!(
            ACTIVITY.to_string(),
            "00000007-0000-3512-2118-0009af100700"
        );
        // Not on the Bluetooth base UUID
        assert!(!ACTIVITY.to_string().ends_with("-0000-1000-8000-00805f9b34fb"));
    }

    #[test]
    fn test_miband_service_uuid() {
        assert_eq!(
            MIBAND_SERVICE.to_string(),
            "0000fee0-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_device_info_uuids_share_base() {
        for uuid in [DEVICE_NAME, SERIAL_NUMBER, HARDWARE_REVISION, SOFTWARE_REVISION] {
            assert!(uuid.to_string().ends_with("-0000-1000-8000-00805f9b34fb"));
        }
    }

    #[test]
    fn test_uuids_unique() {
        let all = [
            GAP_SERVICE,
            DEVICE_INFO_SERVICE,
            BATTERY_SERVICE,
            DEVICE_NAME,
            SERIAL_NUMBER,
            HARDWARE_REVISION,
            SOFTWARE_REVISION,
            BATTERY_LEVEL,
            MIBAND_SERVICE,
            ACTIVITY,
            CCCD,
        ];
        let unique: std::collections::HashSet<_> = all.iter().collect();
        assert_eq!(unique.len(), all.len());
    }
}
