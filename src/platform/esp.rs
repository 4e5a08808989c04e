// ESP32-S3 platform: FAT storage, station Wi-Fi, esp_http_client, esp_restart

use super::{machine_type, Platform, Secrets};
use anyhow::{bail, Result};
use embedded_svc::http::Method;
use esp_idf_hal::peripherals::Peripherals;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    http::client::{Configuration as HttpConfig, EspHttpConnection},
    nvs::EspDefaultNvsPartition,
    wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi},
};
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;
use wicid_core::identity::OsIdentity;
use wicid_core::platform::{DeviceControl, HttpClient, HttpResponse};
use wicid_core::{DeviceIdentity, Settings};

const BASE_PATH: &str = "/storage";
const PARTITION_LABEL: &str = "storage";
const DEFAULT_MACHINE: &str = "ESP32-S3";

/// Mount the wear-levelled FAT partition that holds the device root
pub fn mount_root() -> Result<PathBuf> {
    let base = CString::new(BASE_PATH)?;
    let label = CString::new(PARTITION_LABEL)?;
    let config = esp_idf_sys::esp_vfs_fat_mount_config_t {
        format_if_mount_failed: true,
        max_files: 8,
        allocation_unit_size: 4096,
        ..Default::default()
    };
    let mut handle: esp_idf_sys::wl_handle_t = esp_idf_sys::WL_INVALID_HANDLE as _;

    let err = unsafe {
        esp_idf_sys::esp_vfs_fat_spiflash_mount_rw_wl(base.as_ptr(), label.as_ptr(), &config, &mut handle)
    };
    esp_idf_sys::esp!(err)?;
    log::info!("FAT filesystem mounted at {}", BASE_PATH);
    Ok(PathBuf::from(BASE_PATH))
}

pub fn init(root: &Path, settings: &Settings) -> Result<Platform> {
    let os = OsIdentity::new(
        "espidf",
        esp_idf_sys::ESP_IDF_VERSION_MAJOR,
        esp_idf_sys::ESP_IDF_VERSION_MINOR,
        Some(esp_idf_sys::ESP_IDF_VERSION_PATCH),
    );
    let identity = DeviceIdentity::new(&machine_type(settings, DEFAULT_MACHINE), os);

    // Without Wi-Fi the runtime still boots; update checks fail and retry
    let link: Box<dyn std::any::Any> = match Secrets::load(root).and_then(connect_wifi) {
        Ok(wifi) => Box::new(wifi),
        Err(e) => {
            log::warn!("Wi-Fi unavailable: {:#}", e);
            Box::new(())
        }
    };

    Ok(Platform {
        http: Rc::new(EspHttp),
        device: Rc::new(EspDevice),
        identity,
        _link: link,
    })
}

fn connect_wifi(secrets: Secrets) -> Result<BlockingWifi<EspWifi<'static>>> {
    if secrets.ssid.is_empty() {
        bail!("no SSID in secrets.json");
    }
    log::info!("Connecting to Wi-Fi '{}'", secrets.ssid);

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;
    let mut esp_wifi = EspWifi::new(peripherals.modem, sys_loop.clone(), Some(nvs))?;

    let cfg = Configuration::Client(ClientConfiguration {
        ssid: secrets
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Invalid SSID format: {}", secrets.ssid))?,
        password: secrets
            .password
            .as_str()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Invalid password format"))?,
        auth_method: if secrets.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        },
        ..Default::default()
    });
    esp_wifi.set_configuration(&cfg)?;

    let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;
    wifi.start()?;
    wifi.connect()?;
    wifi.wait_netif_up()?;
    log::info!("Wi-Fi connected");
    Ok(wifi)
}

struct EspHttp;

impl HttpClient for EspHttp {
    fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<Box<dyn HttpResponse>> {
        let config = HttpConfig {
            buffer_size: Some(4096),
            timeout: Some(Duration::from_secs(30)),
            crt_bundle_attach: Some(esp_idf_sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let mut connection = EspHttpConnection::new(&config)?;
        connection.initiate_request(Method::Get, url, headers)?;
        connection.initiate_response()?;
        Ok(Box::new(EspResponse(connection)))
    }
}

struct EspResponse(EspHttpConnection);

impl HttpResponse for EspResponse {
    fn status(&self) -> u16 {
        self.0.status()
    }

    fn content_length(&self) -> Option<u64> {
        self.0.header("Content-Length").and_then(|v| v.trim().parse().ok())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.0.read(buf)?)
    }
}

struct EspDevice;

impl DeviceControl for EspDevice {
    fn hard_reset(&self, reason: &str) {
        log::warn!("Restarting: {}", reason);
        std::thread::sleep(Duration::from_millis(200));
        unsafe {
            esp_idf_sys::esp_restart();
        }
    }

    fn enter_safe_mode(&self, reason: &str) {
        // Stay up with the console alive so the files can be repaired over USB
        loop {
            log::error!("SAFE MODE: {}", reason);
            std::thread::sleep(Duration::from_secs(60));
        }
    }
}
