//! Service configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use miband_core::{ConnectMode, LinkConfig, RetryPolicy, SessionConfig, WakePolicy};
use miband_types::DeviceAddress;

/// Service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Refresh timing shared by every device.
    pub session: SessionSettings,
    /// Radio timeouts shared by every device.
    pub link: LinkSettings,
    /// Bands to poll.
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return every problem found.
    ///
    /// This checks:
    /// - Device names are not empty
    /// - Device addresses parse and are unique (case-insensitive)
    /// - Poll intervals are within bounds (30 s - 1 day)
    /// - Session timings are usable
    ///
    /// # Example
    ///
    /// ```
    /// use miband_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.session.validate());
        errors.extend(self.link.validate());

        let mut seen = std::collections::HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            let prefix = format!("devices[{}]", i);
            errors.extend(device.validate(&prefix));

            if !seen.insert(device.address.to_uppercase()) {
                errors.push(ValidationError {
                    field: format!("{}.address", prefix),
                    message: format!("duplicate device address '{}'", device.address),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Find a device by name or address.
    pub fn device(&self, name_or_address: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| {
            d.name.eq_ignore_ascii_case(name_or_address)
                || d.address.eq_ignore_ascii_case(name_or_address)
        })
    }
}

/// Refresh timing, in seconds unless noted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Connect attempts per cycle.
    pub connect_attempts: u32,
    /// Pause between connect attempts.
    pub connect_delay: u64,
    /// Attempts per characteristic read.
    pub read_attempts: u32,
    /// Refresh cycles before giving up.
    pub cycle_attempts: u32,
    /// Pause between refresh cycles.
    pub cycle_delay: u64,
    /// How connects are issued.
    pub connect_mode: ConnectMode,
    /// Time to confirm a non-blocking connect.
    pub connect_confirm_timeout: u64,
    /// Pause after connecting, in milliseconds.
    pub settle_delay_ms: u64,
    /// Time to wait for an activity notification.
    pub notification_timeout: u64,
    /// Which notifications end the wait.
    pub wake_policy: WakePolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            connect_attempts: defaults.connect.max_attempts,
            connect_delay: defaults.connect.delay.as_secs(),
            read_attempts: defaults.read.max_attempts,
            cycle_attempts: defaults.cycle.max_attempts,
            cycle_delay: defaults.cycle.delay.as_secs(),
            connect_mode: defaults.connect_mode,
            connect_confirm_timeout: defaults.connect_confirm_timeout.as_secs(),
            settle_delay_ms: defaults.settle_delay.as_millis() as u64,
            notification_timeout: defaults.notification_timeout.as_secs(),
            wake_policy: defaults.wake_policy,
        }
    }
}

impl SessionSettings {
    /// Session configuration for one device.
    pub fn to_session_config(&self, want_activity: bool) -> SessionConfig {
        let defaults = SessionConfig::default();
        SessionConfig::default()
            .connect_policy(RetryPolicy::fixed(
                self.connect_attempts,
                Duration::from_secs(self.connect_delay),
            ))
            .read_policy(defaults.read.max_attempts(self.read_attempts))
            .cycle_policy(RetryPolicy::fixed(
                self.cycle_attempts,
                Duration::from_secs(self.cycle_delay),
            ))
            .connect_mode(self.connect_mode)
            .connect_confirm_timeout(Duration::from_secs(self.connect_confirm_timeout))
            .settle_delay(Duration::from_millis(self.settle_delay_ms))
            .notification_timeout(Duration::from_secs(self.notification_timeout))
            .wake_policy(self.wake_policy)
            .want_activity(want_activity)
    }

    /// Validate session settings.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut require = |field: &str, ok: bool, message: &str| {
            if !ok {
                errors.push(ValidationError {
                    field: format!("session.{}", field),
                    message: message.to_string(),
                });
            }
        };

        require("connect_attempts", self.connect_attempts >= 1, "must be at least 1");
        require("read_attempts", self.read_attempts >= 1, "must be at least 1");
        require("cycle_attempts", self.cycle_attempts >= 1, "must be at least 1");
        require("notification_timeout", self.notification_timeout > 0, "must be > 0");
        if self.connect_mode == ConnectMode::NonBlocking {
            require(
                "connect_confirm_timeout",
                self.connect_confirm_timeout > 0,
                "must be > 0 for non-blocking connects",
            );
        }

        errors
    }
}

/// Radio timeouts in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// Timeout for one connect attempt.
    pub connect_timeout: u64,
    /// Timeout for one read.
    pub read_timeout: u64,
    /// How long to scan for a band the adapter has not seen yet.
    pub scan_timeout: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        let defaults = LinkConfig::default();
        Self {
            connect_timeout: defaults.connect_timeout.as_secs(),
            read_timeout: defaults.read_timeout.as_secs(),
            scan_timeout: defaults.scan_timeout.as_secs(),
        }
    }
}

impl LinkSettings {
    /// Link configuration for a [`miband_core::BleLink`].
    pub fn to_link_config(&self) -> LinkConfig {
        LinkConfig::default()
            .connect_timeout(Duration::from_secs(self.connect_timeout))
            .read_timeout(Duration::from_secs(self.read_timeout))
            .scan_timeout(Duration::from_secs(self.scan_timeout))
    }

    /// Validate link settings.
    pub fn validate(&self) -> Vec<ValidationError> {
        [
            ("connect_timeout", self.connect_timeout),
            ("read_timeout", self.read_timeout),
            ("scan_timeout", self.scan_timeout),
        ]
        .into_iter()
        .filter(|(_, secs)| *secs == 0)
        .map(|(field, _)| ValidationError {
            field: format!("link.{}", field),
            message: "must be > 0".to_string(),
        })
        .collect()
    }
}

/// A band to poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Prefix of the sensor names, e.g. "Mi Band".
    pub name: String,
    /// Bluetooth address (or platform identifier on macOS).
    pub address: String,
    /// Seconds between scheduled polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Minimum seconds between two refreshes, however they are triggered.
    #[serde(default = "default_min_interval")]
    pub min_interval: u64,
    /// Whether to wait for activity data or read the battery only.
    #[serde(default = "default_activity")]
    pub activity: bool,
}

/// Minimum poll interval in seconds.
pub const MIN_POLL_INTERVAL: u64 = 30;
/// Maximum poll interval in seconds (1 day).
pub const MAX_POLL_INTERVAL: u64 = 86_400;

fn default_poll_interval() -> u64 {
    300
}

fn default_min_interval() -> u64 {
    300
}

fn default_activity() -> bool {
    true
}

impl DeviceConfig {
    /// A device with default intervals.
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            poll_interval: default_poll_interval(),
            min_interval: default_min_interval(),
            activity: default_activity(),
        }
    }

    /// Parsed device address.
    pub fn device_address(&self) -> Result<DeviceAddress, ConfigError> {
        DeviceAddress::parse(&self.address).map_err(|e| {
            ConfigError::Validation(vec![ValidationError {
                field: "address".to_string(),
                message: e.to_string(),
            }])
        })
    }

    /// Scheduled poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    /// Refresh throttle.
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval)
    }

    /// Validate device configuration.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(ValidationError {
                field: format!("{}.name", prefix),
                message: "device name cannot be empty".to_string(),
            });
        }

        if self.address.is_empty() {
            errors.push(ValidationError {
                field: format!("{}.address", prefix),
                message: "device address cannot be empty".to_string(),
            });
        } else if let Err(e) = DeviceAddress::parse(&self.address) {
            errors.push(ValidationError {
                field: format!("{}.address", prefix),
                message: e.to_string(),
            });
        }

        if self.poll_interval < MIN_POLL_INTERVAL {
            errors.push(ValidationError {
                field: format!("{}.poll_interval", prefix),
                message: format!(
                    "poll interval {} is too short (minimum {} seconds)",
                    self.poll_interval, MIN_POLL_INTERVAL
                ),
            });
        } else if self.poll_interval > MAX_POLL_INTERVAL {
            errors.push(ValidationError {
                field: format!("{}.poll_interval", prefix),
                message: format!(
                    "poll interval {} is too long (maximum {} seconds / 1 day)",
                    self.poll_interval, MAX_POLL_INTERVAL
                ),
            });
        }

        if self.min_interval > MAX_POLL_INTERVAL {
            errors.push(ValidationError {
                field: format!("{}.min_interval", prefix),
                message: format!(
                    "min interval {} is too long (maximum {} seconds / 1 day)",
                    self.min_interval, MAX_POLL_INTERVAL
                ),
            });
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `session.cycle_attempts` or `devices[0].address`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("miband")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band(name: &str, address: &str) -> DeviceConfig {
        DeviceConfig::new(name, address)
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.devices.is_empty());
        assert_eq!(config.session.connect_attempts, 3);
        assert_eq!(config.session.cycle_attempts, 10);
        assert_eq!(config.session.notification_timeout, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_device_config_defaults() {
        let toml = r#"
            name = "Mi Band"
            address = "C8:0F:10:AA:BB:CC"
        "#;
        let config: DeviceConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.poll_interval, 300);
        assert_eq!(config.min_interval, 300);
        assert!(config.activity);
        assert_eq!(config.min_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_session_settings_map_to_session_config() {
        let settings = SessionSettings {
            connect_attempts: 5,
            cycle_attempts: 2,
            notification_timeout: 30,
            wake_policy: WakePolicy::MatchedHandle,
            ..SessionSettings::default()
        };
        let config = settings.to_session_config(false);
        assert_eq!(config.connect.max_attempts, 5);
        assert_eq!(config.cycle.max_attempts, 2);
        assert_eq!(config.notification_timeout, Duration::from_secs(30));
        assert_eq!(config.wake_policy, WakePolicy::MatchedHandle);
        assert!(!config.want_activity);
        assert!(config.validate().is_ok());

        // Defaults round-trip to the library defaults
        let config = SessionSettings::default().to_session_config(true);
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn test_link_settings_map_to_link_config() {
        let settings = LinkSettings {
            scan_timeout: 25,
            ..LinkSettings::default()
        };
        let config = settings.to_link_config();
        assert_eq!(config.scan_timeout, Duration::from_secs(25));
        assert_eq!(config.read_timeout, LinkConfig::default().read_timeout);
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.session.cycle_attempts = 4;
        config.session.connect_mode = ConnectMode::NonBlocking;
        config.devices.push(DeviceConfig {
            poll_interval: 600,
            activity: false,
            ..band("Wrist", "C8:0F:10:AA:BB:CC")
        });

        config.save(&config_path).unwrap();
        let loaded = Config::load_validated(&config_path).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_load_nonexistent() {
        let result = Config::load("/nonexistent/path/config.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("invalid.toml");
        std::fs::write(&config_path, "this is not valid { toml").unwrap();

        let result = Config::load(&config_path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_config_full_toml() {
        let toml = r#"
            [session]
            connect_attempts = 4
            connect_mode = "non_blocking"
            wake_policy = "matched_handle"
            notification_timeout = 15

            [link]
            scan_timeout = 20

            [[devices]]
            name = "Mi Band"
            address = "C8:0F:10:AA:BB:CC"
            poll_interval = 120
            min_interval = 60

            [[devices]]
            name = "Spare"
            address = "C8:0F:10:AA:BB:CD"
            activity = false
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.session.connect_attempts, 4);
        assert_eq!(config.session.connect_mode, ConnectMode::NonBlocking);
        assert_eq!(config.session.wake_policy, WakePolicy::MatchedHandle);
        assert_eq!(config.session.cycle_attempts, 10);
        assert_eq!(config.link.scan_timeout, 20);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].min_interval, 60);
        assert!(!config.devices[1].activity);
        assert!(config.validate().is_ok());

        assert_eq!(config.device("spare").map(|d| d.poll_interval), Some(300));
        assert!(config.device("c8:0f:10:aa:bb:cc").is_some());
        assert!(config.device("unknown").is_none());
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("miband/config.toml"));
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::Read {
            path: PathBuf::from("/test/path"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        let display = format!("{}", error);
        assert!(display.contains("/test/path"));
        assert!(display.contains("not found"));
    }

    // ==========================================================================
    // Validation tests
    // ==========================================================================

    #[test]
    fn test_device_config_validation() {
        assert!(band("Mi Band", "C8:0F:10:AA:BB:CC").validate("devices[0]").is_empty());

        let errors = band("", "C8:0F:10:AA:BB:CC").validate("devices[0]");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "devices[0].name");

        let errors = band("Mi Band", "").validate("devices[0]");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("cannot be empty"));

        let errors = band("Mi Band", "not an address").validate("devices[0]");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "devices[0].address");

        let short_poll = DeviceConfig {
            poll_interval: 5,
            ..band("Mi Band", "C8:0F:10:AA:BB:CC")
        };
        let errors = short_poll.validate("devices[0]");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("too short"));

        let long_poll = DeviceConfig {
            poll_interval: 100_000,
            ..band("Mi Band", "C8:0F:10:AA:BB:CC")
        };
        let errors = long_poll.validate("devices[0]");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("too long"));
    }

    #[test]
    fn test_duplicate_addresses_case_insensitive() {
        let config = Config {
            devices: vec![
                band("Left", "C8:0F:10:AA:BB:CC"),
                band("Right", "c8:0f:10:aa:bb:cc"),
            ],
            ..Config::default()
        };

        match config.validate() {
            Err(ConfigError::Validation(errors)) => {
                assert!(errors.iter().any(|e| e.message.contains("duplicate")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_session_settings_validation() {
        let settings = SessionSettings {
            cycle_attempts: 0,
            notification_timeout: 0,
            ..SessionSettings::default()
        };
        let errors = settings.validate();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.field == "session.cycle_attempts"));

        let settings = SessionSettings {
            connect_mode: ConnectMode::NonBlocking,
            connect_confirm_timeout: 0,
            ..SessionSettings::default()
        };
        assert_eq!(settings.validate().len(), 1);

        let link = LinkSettings {
            read_timeout: 0,
            ..LinkSettings::default()
        };
        assert_eq!(link.validate()[0].field, "link.read_timeout");
    }

    #[test]
    fn test_config_validation_error_display() {
        let error = ConfigError::Validation(vec![
            ValidationError {
                field: "session.cycle_attempts".to_string(),
                message: "must be at least 1".to_string(),
            },
            ValidationError {
                field: "devices[0].address".to_string(),
                message: "cannot be empty".to_string(),
            },
        ]);
        let display = format!("{}", error);
        assert!(display.contains("session.cycle_attempts"));
        assert!(display.contains("devices[0].address"));
    }
}
