use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

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
    #[serde(default)]
    pub rotation: LogRotation,
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
            rotation: LogRotation::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Minutely,
    Hourly,
    #[default]
    Daily,
    Never,
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
    "owotrack".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Last used server
    #[serde(default = "default_server_ip")]
    pub server_ip: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default = "default_true")]
    pub use_magnetometer: bool,

    // Device identity
    /// Local source port of the last successful connection. Some servers key
    /// trackers by source port, so it is reused across reconnects.
    #[serde(default)]
    pub bind_port: Option<u16>,
    #[serde(default)]
    pub pseudo_mac: Option<[u8; 6]>,

    // Connection tuning
    #[serde(default = "default_handshake_retry_interval_ms")]
    pub handshake_retry_interval_ms: u64,
    #[serde(default = "default_battery_interval_secs")]
    pub battery_interval_secs: u64,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_ip: default_server_ip(),
            server_port: default_server_port(),
            use_magnetometer: true,
            bind_port: None,
            pseudo_mac: None,
            handshake_retry_interval_ms: default_handshake_retry_interval_ms(),
            battery_interval_secs: default_battery_interval_secs(),
            log_settings: LogSettings::default(),
        }
    }
}

fn default_server_ip() -> String {
    "192.168.0.10".to_string()
}
fn default_server_port() -> u16 {
    6969
}
fn default_handshake_retry_interval_ms() -> u64 {
    400
}
fn default_battery_interval_secs() -> u64 {
    10
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load settings from an explicit file, falling back to defaults
    pub fn with_path(settings_path: impl Into<PathBuf>) -> Self {
        let settings_path = settings_path.into();
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("OwOTrack");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn remember_endpoint(
        &mut self,
        ip: &str,
        port: u16,
        use_magnetometer: bool,
    ) -> anyhow::Result<()> {
        self.settings.server_ip = ip.to_string();
        self.settings.server_port = port;
        self.settings.use_magnetometer = use_magnetometer;
        self.save()
    }

    /// Stable per-install device identifier, generated on first use
    pub fn pseudo_mac(&mut self) -> anyhow::Result<[u8; 6]> {
        if let Some(mac) = self.settings.pseudo_mac {
            return Ok(mac);
        }
        let mac: [u8; 6] = rand::thread_rng().gen();
        self.settings.pseudo_mac = Some(mac);
        self.save()?;
        tracing::info!("Generated pseudo MAC {:02x?}", mac);
        Ok(mac)
    }

    pub fn set_bind_port(&mut self, port: u16) -> anyhow::Result<()> {
        if self.settings.bind_port == Some(port) {
            return Ok(());
        }
        self.settings.bind_port = Some(port);
        self.save()
    }

    pub fn clear_bind_port(&mut self) -> anyhow::Result<()> {
        if self.settings.bind_port.take().is_some() {
            self.save()?;
        }
        Ok(())
    }
}
