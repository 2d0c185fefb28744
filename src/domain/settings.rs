use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
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
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
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
    "aerlink".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Link timing, retry and discovery parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    // Discovery
    #[serde(default = "default_allowed_device_names")]
    pub allowed_device_names: Vec<String>,
    #[serde(default = "default_adapter_retry_delay_ms")]
    pub adapter_retry_delay_ms: u64,
    #[serde(default = "default_scan_cooldown_ms")]
    pub scan_cooldown_ms: u64,
    #[serde(default = "default_scan_deferral_ms")]
    pub scan_deferral_ms: u64,

    // Session setup
    #[serde(default = "default_desired_mtu")]
    pub desired_mtu: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_mtu_timeout_ms")]
    pub mtu_timeout_ms: u64,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    #[serde(default = "default_subscription_timeout_ms")]
    pub subscription_timeout_ms: u64,
    #[serde(default = "default_submit_retries")]
    pub submit_retries: u32,

    // Command pipeline
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_operation_spacing_ms")]
    pub operation_spacing_ms: u64,
    #[serde(default = "default_command_start_attempts")]
    pub command_start_attempts: u32,

    // Escalation
    #[serde(default = "default_power_cycle_every")]
    pub power_cycle_every: u32,
    #[serde(default = "default_unbond_every")]
    pub unbond_every: u32,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            allowed_device_names: default_allowed_device_names(),
            adapter_retry_delay_ms: default_adapter_retry_delay_ms(),
            scan_cooldown_ms: default_scan_cooldown_ms(),
            scan_deferral_ms: default_scan_deferral_ms(),
            desired_mtu: default_desired_mtu(),
            connect_timeout_ms: default_connect_timeout_ms(),
            mtu_timeout_ms: default_mtu_timeout_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            subscription_timeout_ms: default_subscription_timeout_ms(),
            submit_retries: default_submit_retries(),
            operation_timeout_ms: default_operation_timeout_ms(),
            operation_spacing_ms: default_operation_spacing_ms(),
            command_start_attempts: default_command_start_attempts(),
            power_cycle_every: default_power_cycle_every(),
            unbond_every: default_unbond_every(),
        }
    }
}

fn default_allowed_device_names() -> Vec<String> {
    vec![
        "Aerlink".to_string(),
        "BLE Utility".to_string(),
        "Blank".to_string(),
    ]
}
fn default_adapter_retry_delay_ms() -> u64 {
    3000
}
fn default_scan_cooldown_ms() -> u64 {
    6000
}
fn default_scan_deferral_ms() -> u64 {
    1000
}
fn default_desired_mtu() -> u16 {
    512
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_mtu_timeout_ms() -> u64 {
    1000
}
fn default_discovery_timeout_ms() -> u64 {
    2000
}
fn default_subscription_timeout_ms() -> u64 {
    3000
}
fn default_submit_retries() -> u32 {
    3
}
fn default_operation_timeout_ms() -> u64 {
    2000
}
fn default_operation_spacing_ms() -> u64 {
    180
}
fn default_command_start_attempts() -> u32 {
    3
}
fn default_power_cycle_every() -> u32 {
    3
}
fn default_unbond_every() -> u32 {
    9
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub link: LinkSettings,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    #[serde(default)]
    pub last_connected_peripheral: Option<String>,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("Aerlink");
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

    pub fn remember_peripheral(&mut self, peripheral: &str) -> anyhow::Result<()> {
        if self.settings.last_connected_peripheral.as_deref() != Some(peripheral) {
            self.settings.last_connected_peripheral = Some(peripheral.to_string());
            self.save()?;
        }
        Ok(())
    }
}
