//! Hardware seams for the runtime: ESP-IDF on the device, std + reqwest on the host

use std::path::Path;
use std::rc::Rc;
use wicid_core::platform::{DeviceControl, HttpClient};
use wicid_core::{DeviceIdentity, Settings};

#[cfg(target_os = "espidf")]
mod esp;
#[cfg(target_os = "espidf")]
pub use esp::{init, mount_root};

#[cfg(not(target_os = "espidf"))]
mod host;
#[cfg(not(target_os = "espidf"))]
pub use host::{init, mount_root};

/// Everything the runtime needs from the board
pub struct Platform {
    pub http: Rc<dyn HttpClient>,
    pub device: Rc<dyn DeviceControl>,
    pub identity: DeviceIdentity,
    /// Keeps network drivers alive for the life of the runtime
    _link: Box<dyn std::any::Any>,
}

/// Wi-Fi credentials from `secrets.json`
#[derive(Debug, Default, serde::Deserialize)]
pub struct Secrets {
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub password: String,
}

impl Secrets {
    pub fn load(root: &Path) -> anyhow::Result<Self> {
        let path = root.join(wicid_core::layout::SECRETS_FILE);
        let data = std::fs::read(&path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Machine type from settings, or the board default
fn machine_type(settings: &Settings, default: &str) -> String {
    settings
        .machine_type
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(default)
        .to_string()
}
