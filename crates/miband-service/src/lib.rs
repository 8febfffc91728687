//! Background poller exposing Mi Smart Band readings as named sensors.
//!
//! This crate provides the host side of a band integration:
//! - Polls configured bands on a schedule, throttled per band
//! - Keeps the latest battery level and activity counters in memory
//! - Exposes them as named sensors (`"{name} Steps"`, ...)
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/miband/config.toml`:
//!
//! ```toml
//! [session]
//! cycle_attempts = 10
//! notification_timeout = 20
//!
//! [[devices]]
//! name = "Mi Band"
//! address = "C8:0F:10:AA:BB:CC"
//! poll_interval = 300
//! min_interval = 300
//! ```

pub mod collector;
pub mod config;
pub mod sensors;

pub use collector::{DevicePoller, PollScheduler, ble_poller, cancel_on};
pub use config::{Config, ConfigError, DeviceConfig, LinkSettings, SessionSettings};
pub use sensors::{SensorKind, SensorReading, sensor_readings};
