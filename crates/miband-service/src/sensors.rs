//! Named sensor view over a band's snapshot.
//!
//! Each band exposes four sensors named after its configured name:
//! `"{name} Battery Level"`, `"{name} Steps"`, `"{name} Distance"` and
//! `"{name} Calories"`. A sensor with no reading yet has no value.

use serde::Serialize;
use time::OffsetDateTime;

use miband_core::SnapshotStore;

/// The quantity a sensor reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    BatteryLevel,
    Steps,
    Distance,
    Calories,
}

impl SensorKind {
    /// Every sensor of a band, in display order.
    pub const ALL: [SensorKind; 4] = [
        SensorKind::BatteryLevel,
        SensorKind::Steps,
        SensorKind::Distance,
        SensorKind::Calories,
    ];

    /// Suffix appended to the device name.
    pub fn suffix(self) -> &'static str {
        match self {
            SensorKind::BatteryLevel => "Battery Level",
            SensorKind::Steps => "Steps",
            SensorKind::Distance => "Distance",
            SensorKind::Calories => "Calories",
        }
    }
}

/// One named sensor value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorReading {
    /// Full sensor name, e.g. "Mi Band Steps".
    pub name: String,
    /// What the value measures.
    pub kind: SensorKind,
    /// Latest value, if any was ever produced.
    pub value: Option<u32>,
    /// When the value was captured.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
}

impl std::fmt::Display for SensorReading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.value {
            Some(value) => write!(f, "{}: {}", self.name, value),
            None => write!(f, "{}: unknown", self.name),
        }
    }
}

/// Flatten `snapshot` into the sensors of the band called `device_name`.
pub fn sensor_readings(device_name: &str, snapshot: &SnapshotStore) -> Vec<SensorReading> {
    let battery = snapshot.battery();
    let activity = snapshot.activity();

    SensorKind::ALL
        .into_iter()
        .map(|kind| {
            let (value, last_updated) = match kind {
                SensorKind::BatteryLevel => (
                    battery.map(|b| u32::from(b.percent)),
                    battery.map(|b| b.captured_at),
                ),
                SensorKind::Steps => (activity.map(|a| a.steps), activity.map(|a| a.captured_at)),
                SensorKind::Distance => (
                    activity.map(|a| a.distance_m),
                    activity.map(|a| a.captured_at),
                ),
                SensorKind::Calories => (
                    activity.map(|a| a.calories),
                    activity.map(|a| a.captured_at),
                ),
            };
            SensorReading {
                name: format!("{} {}", device_name, kind.suffix()),
                kind,
                value,
                last_updated,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use miband_types::{ActivitySample, BatteryReading, Reading};

    #[test]
    fn test_unknown_before_first_reading() {
        let snapshot = SnapshotStore::new();
        let sensors = sensor_readings("Mi Band", &snapshot);

        assert_eq!(sensors.len(), 4);
        assert!(sensors.iter().all(|s| s.value.is_none()));
        assert!(sensors.iter().all(|s| s.last_updated.is_none()));
        assert_eq!(sensors[0].to_string(), "Mi Band Battery Level: unknown");
    }

    #[test]
    fn test_sensor_names_and_values() {
        let snapshot = SnapshotStore::new();
        let now = OffsetDateTime::now_utc();
        snapshot.set(Reading::Battery(BatteryReading {
            captured_at: now,
            percent: 0,
        }));
        snapshot.set(Reading::Activity(ActivitySample {
            captured_at: now,
            steps: 10_000,
            distance_m: 8_000,
            calories: 450,
        }));

        let sensors = sensor_readings("Wrist", &snapshot);
        let names: Vec<_> = sensors.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            ["Wrist Battery Level", "Wrist Steps", "Wrist Distance", "Wrist Calories"]
        );

        // Zero is a real reading
        assert_eq!(sensors[0].value, Some(0));
        assert_eq!(sensors[1].value, Some(10_000));
        assert_eq!(sensors[2].value, Some(8_000));
        assert_eq!(sensors[3].to_string(), "Wrist Calories: 450");
        assert!(sensors.iter().all(|s| s.last_updated == Some(now)));
    }

    #[test]
    fn test_sensor_serialization() {
        let snapshot = SnapshotStore::new();
        let sensors = sensor_readings("Mi Band", &snapshot);
        let json = serde_json::to_value(&sensors[1]).unwrap();
        assert_eq!(json["name"], "Mi Band Steps");
        assert_eq!(json["kind"], "steps");
        assert!(json["value"].is_null());
        assert!(json["last_updated"].is_null());
    }
}
