//! Monitor and per-device settings.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! environment variables prefixed with `BIOSIGNAL_`. Nested keys are separated
//! by a double underscore, e.g. `BIOSIGNAL_RETRY__ATTEMPTS=5`.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::channel::{ChannelFunction, DEFAULT_RANGE_MAX, DEFAULT_RANGE_MIN};
use crate::device::{Device, RetrieveMode, SendMode, DEFAULT_RETRIEVE_PORT, DEFAULT_SEND_PORT};
use crate::error::DeviceError;
use crate::transport::{LinkSettings, RetryPolicy};

pub const ENV_PREFIX: &str = "BIOSIGNAL_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot load configuration: {0}")]
    Load(#[from] figment::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub index: usize,
    pub enabled: bool,
    pub signal: Option<String>,
    pub function: ChannelFunction,
    pub min: f64,
    pub max: f64,
    /// Sample rate of the bound signal.
    pub frequency: Option<f64>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            index: 0,
            enabled: true,
            signal: None,
            function: ChannelFunction::default(),
            min: DEFAULT_RANGE_MIN,
            max: DEFAULT_RANGE_MAX,
            frequency: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub retrieve_mode: RetrieveMode,
    pub send_mode: SendMode,
    pub retrieve_port: u16,
    pub send_port: u16,
    /// Start polling as soon as the device is initialized.
    pub autostart: bool,
    pub channels: Vec<ChannelConfig>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            retrieve_mode: RetrieveMode::None,
            send_mode: SendMode::None,
            retrieve_port: DEFAULT_RETRIEVE_PORT,
            send_port: DEFAULT_SEND_PORT,
            autostart: false,
            channels: Vec::new(),
        }
    }
}

impl DeviceConfig {
    /// Apply the settings through the regular device operations.
    ///
    /// Every rejected setting is logged and returned; the device keeps its
    /// previous value for it.
    pub fn apply(&self, device: &mut Device) -> Vec<DeviceError> {
        let mut rejected = Vec::new();
        let mut check = |result: Result<(), DeviceError>| {
            if let Err(e) = result {
                log::warn!("Rejected setting ({}): {}", e.code(), e);
                rejected.push(e);
            }
        };

        check(device.set_retrieve_port(self.retrieve_port));
        check(device.set_send_port(self.send_port));

        for channel in &self.channels {
            check(device.set_channel_state(channel.index, channel.enabled));
            check(device.set_channel_function(channel.index, channel.function));
            check(device.set_range(channel.index, channel.min, channel.max));
            if let Some(signal) = &channel.signal {
                check(device.add_signal_chosen(signal, channel.index).map(|_| ()));
                if let Some(frequency) = channel.frequency {
                    check(device.set_frequency(signal, frequency));
                }
            }
        }

        check(device.set_retrieve_mode(self.retrieve_mode));
        check(device.set_send_mode(self.send_mode));
        rejected
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub tick_ms: u64,
    pub receive_timeout_ms: u64,
    pub send_host: Ipv4Addr,
    pub pipe_dir: PathBuf,
    pub pipe_name: String,
    pub pipe_timeout_ms: u64,
    pub retry: RetryPolicy,
    /// Process the observations are published to.
    pub consumer_application: String,
    pub liveness_interval_ms: u64,
    pub attach_simulator: bool,
    /// Pending events kept for the host before new ones are dropped.
    pub event_capacity: usize,
    /// Per-device settings keyed by device code.
    pub devices: BTreeMap<String, DeviceConfig>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let link = LinkSettings::default();
        Self {
            tick_ms: 25,
            receive_timeout_ms: link.receive_timeout.as_millis() as u64,
            send_host: link.send_host,
            pipe_dir: link.pipe_dir,
            pipe_name: link.pipe_name,
            pipe_timeout_ms: link.pipe_timeout.as_millis() as u64,
            retry: link.retry,
            consumer_application: "TherapyDesktopV2".to_string(),
            liveness_interval_ms: 1000,
            attach_simulator: false,
            event_capacity: 1024,
            devices: BTreeMap::new(),
        }
    }
}

impl MonitorConfig {
    pub fn figment(path: Option<&Path>) -> Figment {
        Self::layered(path, ENV_PREFIX)
    }

    fn layered(path: Option<&Path>, env_prefix: &str) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(env_prefix).split("__"))
    }

    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(path).extract()?;
        log::debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn link(&self) -> LinkSettings {
        LinkSettings {
            send_host: self.send_host,
            pipe_dir: self.pipe_dir.clone(),
            pipe_name: self.pipe_name.clone(),
            pipe_timeout: Duration::from_millis(self.pipe_timeout_ms),
            receive_timeout: Duration::from_millis(self.receive_timeout_ms),
            retry: self.retry,
        }
    }

    /// Settings for the device with `code`. Keys match case-insensitively
    /// since environment keys arrive lowercased.
    pub fn device(&self, code: &str) -> Option<&DeviceConfig> {
        self.devices
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(code))
            .map(|(_, config)| config)
    }
}
