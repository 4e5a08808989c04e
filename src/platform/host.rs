// Host simulator: real HTTP through reqwest, device root on the local disk

use super::{machine_type, Platform, Secrets};
use anyhow::Result;
use reqwest::blocking::{Client, Response};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;
use wicid_core::identity::OsIdentity;
use wicid_core::platform::{DeviceControl, HttpClient, HttpResponse};
use wicid_core::{DeviceIdentity, Settings};

const DEFAULT_ROOT: &str = "device";
const DEFAULT_MACHINE: &str = "WICID Simulator";
const DEFAULT_OS: &str = "circuitpython_10_1";

/// `$WICID_ROOT`, or `./device`, created if missing
pub fn mount_root() -> Result<PathBuf> {
    let root = std::env::var_os("WICID_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT));
    std::fs::create_dir_all(&root)?;
    Ok(root)
}

pub fn init(root: &Path, settings: &Settings) -> Result<Platform> {
    match Secrets::load(root) {
        Ok(secrets) if !secrets.ssid.is_empty() => log::info!("Simulating network '{}'", secrets.ssid),
        _ => log::warn!("No Wi-Fi credentials in secrets.json, using host network"),
    }

    let os_name = std::env::var("WICID_OS").unwrap_or_else(|_| DEFAULT_OS.to_string());
    let os: OsIdentity = os_name.parse().map_err(anyhow::Error::msg)?;
    let identity = DeviceIdentity::new(&machine_type(settings, DEFAULT_MACHINE), os);

    let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
    Ok(Platform {
        http: Rc::new(HostHttp { client }),
        device: Rc::new(HostDevice),
        identity,
        _link: Box::new(()),
    })
}

struct HostHttp {
    client: Client,
}

impl HttpClient for HostHttp {
    fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<Box<dyn HttpResponse>> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        Ok(Box::new(HostResponse(request.send()?)))
    }
}

struct HostResponse(Response);

impl HttpResponse for HostResponse {
    fn status(&self) -> u16 {
        self.0.status().as_u16()
    }

    fn content_length(&self) -> Option<u64> {
        self.0.content_length()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.0.read(buf)?)
    }
}

/// A reset ends the process; the supervisor (or the user) starts it again
struct HostDevice;

impl DeviceControl for HostDevice {
    fn hard_reset(&self, reason: &str) {
        log::warn!("Hard reset requested: {}", reason);
        log::logger().flush();
        std::process::exit(0);
    }

    fn enter_safe_mode(&self, reason: &str) {
        log::error!("SAFE MODE: {}", reason);
        log::error!("Repair the device root and restart");
        std::process::exit(2);
    }
}
