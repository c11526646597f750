//! Configuration loading using Figment.
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. Built-in defaults ([`Settings::default`])
//! 2. A TOML file (`config/default.toml` unless another path is given)
//! 3. Environment variables prefixed with `LABDAQ_`, nested keys split on `__`
//!
//! ```text
//! LABDAQ_APPLICATION__LOG_LEVEL=debug
//! LABDAQ_APPLICATION__TEST_MODE=true
//! LABDAQ_TIMING__CLOSE_TIMEOUT=2s
//! ```
//!
//! Durations use humantime notation (`"500ms"`, `"1s"`, `"2m"`).
//!
//! # Example
//!
//! ```no_run
//! use lab_daq::config::Settings;
//!
//! let settings = Settings::load("config/default.toml")?;
//! println!("{} devices", settings.devices.len());
//! # Ok::<(), lab_daq::error::DaqError>(())
//! ```

use crate::channel::{Channel, ChannelKind, ChargeAccumulator};
use crate::controller::ControllerOptions;
use crate::devices::{DeviceKind, DeviceSpec};
use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Lock, close and join timing
    #[serde(default)]
    pub timing: TimingSettings,
    /// Device definitions
    #[serde(default)]
    pub devices: Vec<DeviceSettings>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Synthesize values instead of talking to hardware
    #[serde(default)]
    pub test_mode: bool,
    /// Base seed for simulated values; unset varies per run
    #[serde(default)]
    pub simulation_seed: Option<u64>,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "lab_daq".to_string(),
            log_level: "info".to_string(),
            test_mode: false,
            simulation_seed: None,
        }
    }
}

/// Controller timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Wait for the transport lock in read/write cycles
    #[serde(with = "humantime_serde", default = "default_lock_timeout")]
    pub lock_timeout: Duration,
    /// Wait for the transport lock when closing
    #[serde(with = "humantime_serde", default = "default_close_timeout")]
    pub close_timeout: Duration,
    /// Wait for a previous worker before starting a new one
    #[serde(with = "humantime_serde", default = "default_join_timeout")]
    pub join_timeout: Duration,
    /// Duration of a simulated initialization
    #[serde(with = "humantime_serde", default = "default_simulated_init_delay")]
    pub simulated_init_delay: Duration,
    /// Fully failed read cycles before acquisition stops (0 = never)
    #[serde(default)]
    pub max_consecutive_failures: u32,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            lock_timeout: default_lock_timeout(),
            close_timeout: default_close_timeout(),
            join_timeout: default_join_timeout(),
            simulated_init_delay: default_simulated_init_delay(),
            max_consecutive_failures: 0,
        }
    }
}

/// One device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Unique device name
    pub name: String,
    /// Instrument kind (maxigauge, tic, pt104, keithley6487)
    pub kind: DeviceKind,
    /// Whether this device is initialized
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Polling interval
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub interval: Duration,
    /// Serial port or bridge name (unused by per-channel bus devices)
    #[serde(default)]
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Read timeout of the transport
    #[serde(with = "humantime_serde", default = "default_transport_timeout")]
    pub transport_timeout: Duration,
    /// Channels in display order
    #[serde(default)]
    pub channels: Vec<ChannelSettings>,
}

/// One channel; fields not used by the device kind are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Display name
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_enabled")]
    pub active: bool,
    #[serde(default = "default_enabled")]
    pub real: bool,
    #[serde(default)]
    pub background: f64,
    /// Gauge index (pressure devices)
    #[serde(default)]
    pub gauge: u8,
    /// Sensor slot (temperature devices)
    #[serde(default = "default_sensor")]
    pub sensor: u8,
    /// Wire count (temperature devices)
    #[serde(default = "default_wires")]
    pub wires: u8,
    /// Bus address (per-channel devices)
    #[serde(default)]
    pub address: Option<String>,
    /// Source voltage (current devices)
    #[serde(default)]
    pub voltage: f64,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_lock_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_close_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_join_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_simulated_init_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_enabled() -> bool {
    true
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_transport_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_sensor() -> u8 {
    1
}

fn default_wires() -> u8 {
    4
}

// ============================================================================
// Loading and validation
// ============================================================================

impl Settings {
    /// Loads defaults, then `path`, then `LABDAQ_` environment variables, and validates.
    ///
    /// A missing file is not an error; the defaults and environment apply.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        Self::load_with(path, false)
    }

    /// Like [`Settings::load`], with `force_test_mode` layered on top before
    /// validation, so hardware checks are skipped for a simulated run.
    pub fn load_with(path: impl AsRef<Path>, force_test_mode: bool) -> AppResult<Self> {
        let mut figment = Self::figment(path.as_ref());
        if force_test_mode {
            figment = figment.merge(Serialized::default("application.test_mode", true));
        }
        let settings: Self = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// The provider stack behind [`Settings::load`].
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("LABDAQ_").split("__"))
    }

    /// Checks:
    /// - log level is one of trace, debug, info, warn, error
    /// - device names are unique and intervals non-zero
    /// - every device has channels
    /// - outside test mode, serial devices have a port and bus devices an address per channel
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if !names.insert(device.name.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate device name: '{}'",
                    device.name
                )));
            }
            self.validate_device(device)?;
        }
        Ok(())
    }

    fn validate_device(&self, device: &DeviceSettings) -> AppResult<()> {
        if device.interval.is_zero() {
            return Err(DaqError::Configuration(format!(
                "Device '{}': interval must be greater than zero",
                device.name
            )));
        }
        if device.channels.is_empty() {
            return Err(DaqError::Configuration(format!(
                "Device '{}' has no channels",
                device.name
            )));
        }
        if self.application.test_mode {
            return Ok(());
        }
        if device.kind.controller_per_channel() {
            if let Some(channel) = device
                .channels
                .iter()
                .find(|channel| channel.address.as_deref().map_or(true, str::is_empty))
            {
                return Err(DaqError::Configuration(format!(
                    "Device '{}': channel '{}' needs an 'address'",
                    device.name, channel.name
                )));
            }
        } else if device.port.is_empty() {
            return Err(DaqError::Configuration(format!(
                "Device '{}': 'port' cannot be empty",
                device.name
            )));
        }
        Ok(())
    }

    /// Effective settings rendered back to TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DaqError::Configuration(format!("Cannot render settings: {e}")))
    }

    /// Options for every controller of the run.
    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            test_mode: self.application.test_mode,
            lock_timeout: self.timing.lock_timeout,
            close_timeout: self.timing.close_timeout,
            join_timeout: self.timing.join_timeout,
            simulated_init_delay: self.timing.simulated_init_delay,
            seed: self.application.simulation_seed,
            max_consecutive_failures: self.timing.max_consecutive_failures,
        }
    }

    /// Device specs for every configured device.
    pub fn device_specs(&self) -> Vec<DeviceSpec> {
        self.devices.iter().map(DeviceSettings::to_spec).collect()
    }
}

impl DeviceSettings {
    /// Builds the channels and transports this device needs.
    pub fn to_spec(&self) -> DeviceSpec {
        let mut spec =
            DeviceSpec::new(self.name.as_str(), self.kind, self.interval).enabled(self.enabled);
        for settings in &self.channels {
            spec = spec.with_channel(settings.to_channel(self.kind));
        }
        if self.kind.controller_per_channel() {
            for channel in &self.channels {
                spec = spec.with_transport(self.kind.transport(
                    &self.port,
                    self.baud_rate,
                    channel.address.as_deref(),
                    self.transport_timeout,
                ));
            }
        } else {
            spec = spec.with_transport(self.kind.transport(
                &self.port,
                self.baud_rate,
                None,
                self.transport_timeout,
            ));
        }
        spec
    }
}

impl ChannelSettings {
    /// Channel of the shape `kind` uses.
    pub fn to_channel(&self, kind: DeviceKind) -> Channel {
        let channel_kind = match kind {
            DeviceKind::MaxiGauge | DeviceKind::Tic => ChannelKind::Pressure { gauge: self.gauge },
            DeviceKind::Pt104 => ChannelKind::Temperature {
                sensor: self.sensor,
                wires: self.wires,
            },
            DeviceKind::Keithley6487 => ChannelKind::Current {
                address: self.address.clone().unwrap_or_default(),
                voltage: self.voltage,
                charge: ChargeAccumulator::default(),
            },
        };
        let mut channel = Channel::new(self.name.as_str(), channel_kind);
        channel.enabled = self.enabled;
        channel.active = self.active;
        channel.real = self.real;
        channel.background = self.background;
        channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[application]
name = "vacuum rig"
log_level = "debug"
simulation_seed = 42

[timing]
close_timeout = "250ms"
max_consecutive_failures = 5

[[devices]]
name = "tpg"
kind = "maxigauge"
port = "/dev/ttyUSB0"
interval = "500ms"

[[devices.channels]]
name = "Load lock"
gauge = 1

[[devices.channels]]
name = "Chamber"
gauge = 2
active = false

[[devices]]
name = "keithley"
kind = "keithley6487"

[[devices.channels]]
name = "Faraday cup"
address = "GPIB0::22::INSTR"
background = 0.5
"#;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write");
        file
    }

    #[test]
    fn test_load_sample() {
        let file = write_config(SAMPLE);
        let settings = Settings::load(file.path()).expect("load");
        assert_eq!(settings.application.name, "vacuum rig");
        assert_eq!(settings.application.simulation_seed, Some(42));
        assert_eq!(settings.timing.close_timeout, Duration::from_millis(250));
        assert_eq!(settings.timing.lock_timeout, Duration::from_secs(1));
        assert_eq!(settings.devices.len(), 2);
        assert_eq!(settings.devices[0].interval, Duration::from_millis(500));
        assert_eq!(settings.devices[1].interval, Duration::from_secs(1));
        assert!(!settings.devices[0].channels[1].active);

        let options = settings.controller_options();
        assert_eq!(options.max_consecutive_failures, 5);
        assert!(!options.test_mode);
    }

    #[test]
    fn test_device_specs() {
        let file = write_config(SAMPLE);
        let specs = Settings::load(file.path()).expect("load").device_specs();
        assert_eq!(specs[0].transports.len(), 1);
        assert_eq!(specs[0].transports[0].resource(), "/dev/ttyUSB0");
        assert_eq!(specs[1].transports.len(), 1);
        assert_eq!(specs[1].transports[0].resource(), "GPIB0::22::INSTR");
        assert_eq!(specs[1].channels[0].background, 0.5);
        assert!(matches!(specs[0].channels[1].kind, ChannelKind::Pressure { gauge: 2 }));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("dir");
        let settings = Settings::load(dir.path().join("absent.toml")).expect("defaults");
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_validation_errors() {
        let duplicate = SAMPLE.replace("name = \"keithley\"", "name = \"tpg\"");
        let file = write_config(&duplicate);
        let err = Settings::load(file.path()).expect_err("duplicate");
        assert!(err.to_string().contains("Duplicate device name"));

        let zero = SAMPLE.replace("interval = \"500ms\"", "interval = \"0s\"");
        let file = write_config(&zero);
        assert!(Settings::load(file.path()).is_err());

        let no_port = SAMPLE.replace("port = \"/dev/ttyUSB0\"\n", "");
        let file = write_config(&no_port);
        assert!(Settings::load(file.path()).is_err());

        let bad_level = SAMPLE.replace("log_level = \"debug\"", "log_level = \"loud\"");
        let file = write_config(&bad_level);
        assert!(Settings::load(file.path()).is_err());
    }

    #[test]
    fn test_forced_test_mode_skips_hardware_checks() {
        let no_port = SAMPLE.replace("port = \"/dev/ttyUSB0\"\n", "");
        let file = write_config(&no_port);
        assert!(Settings::load(file.path()).is_err());

        let settings = Settings::load_with(file.path(), true).expect("simulated run");
        assert!(settings.application.test_mode);
        assert!(settings.controller_options().test_mode);
        assert_eq!(settings.application.name, "vacuum rig");
    }

    #[test]
    fn test_channels_required() {
        let mut settings = Settings::default();
        settings.application.test_mode = true;
        settings.devices.push(DeviceSettings {
            name: "empty".into(),
            kind: DeviceKind::Tic,
            enabled: true,
            interval: Duration::from_secs(1),
            port: String::new(),
            baud_rate: 9600,
            transport_timeout: Duration::from_secs(2),
            channels: Vec::new(),
        });
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rendered_settings_load_back() {
        let file = write_config(SAMPLE);
        let settings = Settings::load(file.path()).expect("load");
        let rendered = settings.to_toml().expect("render");
        assert!(rendered.contains("close_timeout = \"250ms\""));

        let copy = write_config(&rendered);
        assert_eq!(Settings::load(copy.path()).expect("reload"), settings);
    }

    #[test]
    fn test_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("lab.toml", SAMPLE)?;
            jail.set_env("LABDAQ_APPLICATION__TEST_MODE", "true");
            jail.set_env("LABDAQ_TIMING__LOCK_TIMEOUT", "3s");
            let settings = Settings::load("lab.toml").map_err(|e| e.to_string())?;
            assert!(settings.application.test_mode);
            assert_eq!(settings.timing.lock_timeout, Duration::from_secs(3));
            Ok(())
        });
    }
}
