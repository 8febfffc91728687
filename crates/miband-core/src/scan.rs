//! Adapter lookup and band discovery.
//!
//! Used by [`crate::ble::BleLink`] to locate its peer and by the service
//! binary's `scan` command.

use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use miband_types::DeviceAddress;
use miband_types::uuid::MIBAND_SERVICE;

use crate::error::{DeviceNotFoundReason, LinkError};
use crate::util::{addresses_match, create_identifier, format_peripheral_id};

/// Scan attempts made by [`find_peripheral`] before giving up.
const FIND_ATTEMPTS: u32 = 3;

/// A band (or other peripheral) seen during a scan.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DiscoveredDevice {
    /// Advertised local name (e.g. "MI Band 2").
    pub name: Option<String>,
    /// Identifier to put in the configuration file.
    pub identifier: String,
    /// Bluetooth address as reported by the platform.
    pub address: String,
    /// Signal strength.
    pub rssi: Option<i16>,
    /// Whether the advertisement looks like a Mi band.
    pub is_miband: bool,
}

/// Options for scanning.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// How long to listen for advertisements.
    pub duration: Duration,
    /// Only report peripherals that look like Mi bands.
    pub filter_miband_only: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(5),
            filter_miband_only: true,
        }
    }
}

impl ScanOptions {
    /// Set the scan duration.
    #[must_use]
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Report every peripheral, not only Mi bands.
    #[must_use]
    pub fn all_devices(mut self) -> Self {
        self.filter_miband_only = false;
        self
    }
}

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter, LinkError> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or(LinkError::DeviceNotFound(DeviceNotFoundReason::NoAdapter))
}

/// Scan for bands in range with the default adapter.
///
/// An empty list means nothing was found and is not an error.
pub async fn scan_for_devices(options: ScanOptions) -> Result<Vec<DiscoveredDevice>, LinkError> {
    let adapter = get_adapter().await?;
    scan_with_adapter(&adapter, &options).await
}

/// Scan for bands using a specific adapter.
pub async fn scan_with_adapter(
    adapter: &Adapter,
    options: &ScanOptions,
) -> Result<Vec<DiscoveredDevice>, LinkError> {
    info!("Starting BLE scan for {:?}", options.duration);

    adapter.start_scan(ScanFilter::default()).await?;
    sleep(options.duration).await;
    adapter.stop_scan().await?;

    let mut discovered = Vec::new();
    for peripheral in adapter.peripherals().await? {
        let properties = match peripheral.properties().await {
            Ok(Some(properties)) => properties,
            Ok(None) => continue,
            Err(e) => {
                debug!("Error reading peripheral properties: {}", e);
                continue;
            }
        };

        let address = properties.address.to_string();
        let is_miband = looks_like_miband(properties.local_name.as_deref(), &properties.services);
        if options.filter_miband_only && !is_miband {
            continue;
        }

        discovered.push(DiscoveredDevice {
            identifier: create_identifier(&address, &peripheral.id()),
            name: properties.local_name,
            address,
            rssi: properties.rssi,
            is_miband,
        });
    }

    info!("Scan complete. Found {} device(s)", discovered.len());
    Ok(discovered)
}

/// Whether an advertisement looks like it came from a Mi band.
pub fn looks_like_miband(name: Option<&str>, services: &[Uuid]) -> bool {
    if services.contains(&MIBAND_SERVICE) {
        return true;
    }
    name.map(str::to_lowercase)
        .is_some_and(|n| n.contains("mi band") || n.contains("mi smart band"))
}

/// Locate the peripheral for `address`.
///
/// Checks peripherals the adapter already knows first, then scans up to
/// three times with increasing durations since advertisements are easily
/// missed while the band sleeps.
pub async fn find_peripheral(
    address: &DeviceAddress,
    scan_duration: Duration,
) -> Result<(Adapter, Peripheral), LinkError> {
    let adapter = get_adapter().await?;

    if let Some(peripheral) = find_known_peripheral(&adapter, address).await? {
        debug!("Found {} without scanning", address);
        return Ok((adapter, peripheral));
    }

    let base = (scan_duration / 2).max(Duration::from_secs(2));
    for attempt in 1..=FIND_ATTEMPTS {
        let duration = base * attempt;
        debug!(
            "Scan attempt {}/{} for {} ({:?})",
            attempt, FIND_ATTEMPTS, address, duration
        );

        adapter.start_scan(ScanFilter::default()).await?;
        sleep(duration).await;
        adapter.stop_scan().await?;

        if let Some(peripheral) = find_known_peripheral(&adapter, address).await? {
            info!("Found {} on scan attempt {}", address, attempt);
            return Ok((adapter, peripheral));
        }
    }

    warn!("{} not found after {} scans", address, FIND_ATTEMPTS);
    Err(LinkError::device_not_found(address.as_str()))
}

async fn find_known_peripheral(
    adapter: &Adapter,
    address: &DeviceAddress,
) -> Result<Option<Peripheral>, LinkError> {
    for peripheral in adapter.peripherals().await? {
        if let Ok(Some(properties)) = peripheral.properties().await
            && peripheral_matches(&peripheral, &properties, address)
        {
            return Ok(Some(peripheral));
        }
    }
    Ok(None)
}

fn peripheral_matches(
    peripheral: &Peripheral,
    properties: &PeripheralProperties,
    address: &DeviceAddress,
) -> bool {
    addresses_match(&properties.address.to_string(), address.as_str())
        || address.matches(&format_peripheral_id(&peripheral.id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use miband_types::uuid::BATTERY_SERVICE;

    #[test]
    fn test_looks_like_miband_by_name() {
        assert!(looks_like_miband(Some("MI Band 2"), &[]));
        assert!(looks_like_miband(Some("Mi Smart Band 4"), &[]));
        assert!(!looks_like_miband(Some("Thermo 12345"), &[]));
        assert!(!looks_like_miband(None, &[]));
    }

    #[test]
    fn test_looks_like_miband_by_service() {
        assert!(looks_like_miband(None, &[BATTERY_SERVICE, MIBAND_SERVICE]));
        assert!(!looks_like_miband(None, &[BATTERY_SERVICE]));
    }

    #[test]
    fn test_scan_options_builder() {
        let options = ScanOptions::default()
            .duration(Duration::from_secs(10))
            .all_devices();
        assert_eq!(options.duration, Duration::from_secs(10));
        assert!(!options.filter_miband_only);
    }
}
