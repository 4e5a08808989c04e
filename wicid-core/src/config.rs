//! Device settings persisted as `settings.json` in the device root
use crate::fsutil::atomic_write;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "settings I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "settings parse error: {}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid settings: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Installed firmware version
    pub version: String,
    pub manifest_url: Option<String>,
    pub update_check_interval_hours: u32,
    pub initial_update_delay_secs: u64,
    /// 0 disables the uptime watchdog
    pub periodic_reboot_hours: u32,
    /// Failed attempts before a release is skipped for good
    pub max_install_attempts: u32,
    /// Reject releases that publish no sha256
    pub require_checksum: bool,
    /// Overrides the machine type reported by the platform
    pub machine_type: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: "0.0.0".to_string(),
            manifest_url: None,
            update_check_interval_hours: 24,
            initial_update_delay_secs: 60,
            periodic_reboot_hours: 0,
            max_install_attempts: 1,
            require_checksum: true,
            machine_type: None,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read(path)?;
        let settings: Settings = serde_json::from_slice(&data)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(settings) => {
                log::info!("Loaded settings from {}", path.display());
                settings
            }
            Err(e) => {
                log::warn!("Failed to load settings from {}: {}, using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        let json = serde_json::to_vec_pretty(self)?;
        atomic_write(path, &json)?;
        log::info!("Settings saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.version
            .parse::<Version>()
            .map_err(|e| ConfigError::Invalid(format!("version '{}': {}", self.version, e)))?;

        if self.update_check_interval_hours == 0 {
            return Err(ConfigError::Invalid(
                "update_check_interval_hours must be at least 1".to_string(),
            ));
        }
        if self.max_install_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_install_attempts must be at least 1".to_string(),
            ));
        }
        if let Some(url) = &self.manifest_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!("manifest_url '{}' is not http(s)", url)));
            }
        }
        Ok(())
    }

    pub fn update_check_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.update_check_interval_hours) * 3600)
    }

    pub fn initial_update_delay(&self) -> Duration {
        Duration::from_secs(self.initial_update_delay_secs)
    }

    pub fn periodic_reboot_interval(&self) -> Option<Duration> {
        match self.periodic_reboot_hours {
            0 => None,
            hours => Some(Duration::from_secs(u64::from(hours) * 3600)),
        }
    }
}

/// Rewrite only the installed version, keeping every other setting
pub fn record_installed_version(path: &Path, version: &str) -> Result<(), ConfigError> {
    let mut settings = match Settings::load(path) {
        Ok(settings) => settings,
        Err(ConfigError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Settings::default(),
        Err(e) => return Err(e),
    };
    settings.version = version.to_string();
    settings.save(path)
}
