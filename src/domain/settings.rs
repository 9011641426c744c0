use crate::domain::channels::{DEFAULT_CHANNEL_COUNT, DEFAULT_CHANNEL_MAX};
use crate::domain::models::Device;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Serial-over-TCP bridge, device address is `host:port`
    Tcp,
    /// In-process loopback, nothing leaves the machine
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default = "default_transport_kind")]
    pub kind: TransportKind,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            kind: default_transport_kind(),
            connect_timeout_ms: default_connect_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Streaming
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_teardown_timeout_ms")]
    pub teardown_timeout_ms: u64,

    // Keyboard surface
    #[serde(default = "default_channel_count")]
    pub channel_count: usize,
    #[serde(default = "default_channel_max")]
    pub channel_max: i32,
    #[serde(default = "default_surface_width")]
    pub surface_width: f64,
    #[serde(default = "default_surface_inset")]
    pub surface_inset: f64,

    #[serde(default = "default_message_log_capacity")]
    pub message_log_capacity: usize,

    #[serde(default)]
    pub transport: TransportSettings,

    // Devices
    #[serde(default)]
    pub last_device: Option<Device>,
    #[serde(default)]
    pub known_devices: Vec<Device>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            tick_interval_ms: default_tick_interval_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            teardown_timeout_ms: default_teardown_timeout_ms(),
            channel_count: default_channel_count(),
            channel_max: default_channel_max(),
            surface_width: default_surface_width(),
            surface_inset: default_surface_inset(),
            message_log_capacity: default_message_log_capacity(),
            transport: TransportSettings::default(),
            last_device: None,
            known_devices: Vec::new(),
        }
    }
}

impl Settings {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms.max(1)),
            keepalive_interval: Duration::from_millis(self.keepalive_interval_ms.max(1)),
            teardown_timeout: Duration::from_millis(self.teardown_timeout_ms.max(1)),
            message_log_capacity: self.message_log_capacity,
        }
    }
}

/// Runtime knobs of a session manager
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub tick_interval: Duration,
    pub keepalive_interval: Duration,
    /// Upper bound for each teardown step (final frame, close)
    pub teardown_timeout: Duration,
    pub message_log_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Settings::default().session_config()
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "klavier_remote".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_tick_interval_ms() -> u64 {
    50
}
fn default_keepalive_interval_ms() -> u64 {
    5000
}
fn default_teardown_timeout_ms() -> u64 {
    1000
}
fn default_channel_count() -> usize {
    DEFAULT_CHANNEL_COUNT
}
fn default_channel_max() -> i32 {
    DEFAULT_CHANNEL_MAX
}
fn default_surface_width() -> f64 {
    360.0
}
fn default_surface_inset() -> f64 {
    32.0
}
fn default_message_log_capacity() -> usize {
    200
}
fn default_transport_kind() -> TransportKind {
    TransportKind::Tcp
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_write_timeout_ms() -> u64 {
    2000
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load settings from an explicit file, falling back to defaults
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("KlavierRemote");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    /// Remember a device as the last one used and add it to the known list
    pub fn remember_device(&mut self, device: &Device) -> anyhow::Result<()> {
        if !self
            .settings
            .known_devices
            .iter()
            .any(|d| d.address == device.address)
        {
            self.settings.known_devices.push(device.clone());
        }
        self.settings.last_device = Some(device.clone());
        self.save()
    }
}
