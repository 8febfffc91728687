//! Latest-value store for device readings.
//!
//! The store keeps at most one reading per [`ReadingKind`]. The session is
//! the only writer; any number of host readers may call [`SnapshotStore::get`]
//! concurrently and always see a whole reading, never a torn one.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

use miband_types::{ActivitySample, BatteryReading, Reading, ReadingKind};

/// Latest reading of each kind.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    readings: RwLock<HashMap<ReadingKind, Reading>>,
}

impl SnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the reading of `reading.kind()`.
    ///
    /// A reading captured before the stored one is rejected so a slow cycle
    /// cannot overwrite newer data. Returns whether the store was updated.
    pub fn set(&self, reading: Reading) -> bool {
        let mut readings = self
            .readings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let kind = reading.kind();
        if let Some(current) = readings.get(&kind)
            && current.captured_at() > reading.captured_at()
        {
            debug!(
                "Ignoring stale {} reading from {}, have {}",
                kind,
                reading.captured_at(),
                current.captured_at()
            );
            return false;
        }

        readings.insert(kind, reading);
        true
    }

    /// The latest reading of `kind`, or `None` if never produced.
    pub fn get(&self, kind: ReadingKind) -> Option<Reading> {
        self.readings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&kind)
            .copied()
    }

    /// The latest battery reading.
    pub fn battery(&self) -> Option<BatteryReading> {
        match self.get(ReadingKind::BatteryLevel)? {
            Reading::Battery(reading) => Some(reading),
            Reading::Activity(_) => None,
        }
    }

    /// The latest activity sample.
    pub fn activity(&self) -> Option<ActivitySample> {
        match self.get(ReadingKind::Activity)? {
            Reading::Activity(sample) => Some(sample),
            Reading::Battery(_) => None,
        }
    }

    /// All stored readings, in [`ReadingKind::ALL`] order.
    pub fn all(&self) -> Vec<Reading> {
        let readings = self
            .readings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        ReadingKind::ALL
            .iter()
            .filter_map(|kind| readings.get(kind).copied())
            .collect()
    }
}
