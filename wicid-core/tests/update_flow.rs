//! End-to-end update flow on a temporary device root:
//! manifest fetch, release resolution, staging, then the next boot's install.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;
use tempfile::tempdir;
use wicid_core::config::Settings;
use wicid_core::layout::DeviceLayout;
use wicid_core::platform::{DeviceControl, HttpClient, HttpResponse, LogIndicator};
use wicid_core::{
    block_on, BootOutcome, BootPipeline, DeviceIdentity, HookRegistry, Installer, ManualClock, Scheduler,
    SystemConfig, SystemManager, UpdateConfig, UpdateManager,
};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

const MACHINE: &str = "Adafruit QT Py ESP32S3 4MB 2MB PSRAM";
const MANIFEST_URL: &str = "https://www.wicid.ai/releases.json";

#[derive(Default)]
struct StaticHttp {
    routes: RefCell<HashMap<String, Vec<u8>>>,
    hits: RefCell<Vec<String>>,
}

impl HttpClient for StaticHttp {
    fn get(&self, url: &str, _headers: &[(&str, &str)]) -> Result<Box<dyn HttpResponse>> {
        self.hits.borrow_mut().push(url.to_string());
        match self.routes.borrow().get(url) {
            Some(body) => Ok(Box::new(Body(body.clone()))),
            None => anyhow::bail!("no route to {}", url),
        }
    }
}

struct Body(Vec<u8>);

impl HttpResponse for Body {
    fn status(&self) -> u16 {
        200
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.0.len() as u64)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.0.len());
        buf[..n].copy_from_slice(&self.0[..n]);
        self.0.drain(..n);
        Ok(n)
    }
}

#[derive(Default)]
struct Device {
    resets: RefCell<Vec<String>>,
}

impl DeviceControl for Device {
    fn hard_reset(&self, reason: &str) {
        self.resets.borrow_mut().push(reason.to_string());
    }

    fn enter_safe_mode(&self, reason: &str) {
        panic!("unexpected safe mode: {}", reason);
    }
}

fn bundle(version: &str) -> Vec<u8> {
    let manifest = format!(
        r#"{{"version": "{}", "target_machine_types": ["{}"], "target_operating_systems": ["circuitpython_10_0"], "release_type": "production", "release_notes": "archived"}}"#,
        version, MACHINE
    );
    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let files = [
        ("manifest.json", manifest.into_bytes(), deflated),
        ("settings.json", format!(r#"{{"version": "{}"}}"#, version).into_bytes(), deflated),
        ("firmware/wicid.bin", format!("firmware {}", version).into_bytes(), deflated),
        ("www/index.html", b"<html></html>".to_vec(), deflated),
        (".DS_Store", b"junk".to_vec(), stored),
    ];

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data, options) in files {
        zip.start_file(name, options).unwrap();
        zip.write_all(&data).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

/// 1.5.0 needs at least 1.2.0 installed, so a 1.0.0 device falls back to the archive.
/// Development 1.6.0 is only seen by devices with a DEVELOPMENT marker.
fn release_manifest(archive: &[(&str, &str)]) -> String {
    let archive: Vec<String> = archive
        .iter()
        .map(|(version, sha)| {
            format!(
                r#"{{"version": "{v}", "zip_url": "https://www.wicid.ai/releases/v{v}", "sha256": "{sha}", "release_date": "2025-01-0{d}T00:00:00Z", "release_type": "production"}}"#,
                v = version,
                sha = sha,
                d = &version[2..3],
            )
        })
        .collect();
    format!(
        r#"{{
            "schema_version": "1.0.0",
            "last_updated": "2025-03-01T00:00:00Z",
            "releases": [{{
                "target_machine_types": ["{machine}"],
                "target_operating_systems": ["circuitpython_10_0"],
                "production": {{
                    "version": "1.5.0",
                    "zip_url": "https://www.wicid.ai/releases/v1.5.0",
                    "sha256": "00",
                    "minimum_prior_version": "1.2.0"
                }},
                "development": {{
                    "version": "1.6.0",
                    "zip_url": "https://www.wicid.ai/releases/v1.6.0",
                    "sha256": "00"
                }},
                "archive": [{archive}]
            }}]
        }}"#,
        machine = MACHINE,
        archive = archive.join(",")
    )
}

fn install_base(root: &Path) {
    fs::create_dir_all(root.join("firmware")).unwrap();
    fs::write(root.join("firmware/wicid.bin"), b"firmware 1.0.0").unwrap();
    fs::write(
        root.join("manifest.json"),
        format!(r#"{{"version": "1.0.0", "target_machine_types": ["{}"], "target_operating_systems": ["circuitpython_10_0"]}}"#, MACHINE),
    )
    .unwrap();
    fs::write(root.join("secrets.json"), br#"{"ssid": "home"}"#).unwrap();
    let mut settings = Settings::default();
    settings.version = "1.0.0".to_string();
    settings.manifest_url = Some(MANIFEST_URL.to_string());
    settings.save(&root.join("settings.json")).unwrap();
}

fn identity() -> DeviceIdentity {
    DeviceIdentity::new(MACHINE, "circuitpython_10_1".parse().unwrap())
}

#[test]
fn archived_release_is_staged_then_installed_on_boot() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    install_base(root);
    let layout = DeviceLayout::new(root);

    let v13 = bundle("1.3.0");
    let v11 = bundle("1.1.0");
    let http = Rc::new(StaticHttp::default());
    http.routes.borrow_mut().insert(
        MANIFEST_URL.to_string(),
        release_manifest(&[
            ("1.1.0", &format!("{:x}", Sha256::digest(&v11))),
            ("1.3.0", &format!("{:X}", Sha256::digest(&v13))),
        ])
        .into_bytes(),
    );
    http.routes
        .borrow_mut()
        .insert("https://www.wicid.ai/releases/v1.3.0".to_string(), v13);

    // Running firmware: the system manager checks, stages and asks for a reboot
    let clock = Rc::new(ManualClock::new());
    let scheduler = Scheduler::new(clock.clone());
    let device = Rc::new(Device::default());
    let settings = Settings::load(&layout.settings_file()).unwrap();
    let updates = UpdateManager::new(
        layout.clone(),
        identity(),
        http.clone(),
        Rc::new(LogIndicator),
        device.clone(),
        UpdateConfig::from_settings(&settings),
    )
    .unwrap();
    let system = SystemManager::new(
        scheduler.clone(),
        Rc::new(updates),
        device.clone(),
        SystemConfig::from_settings(&settings),
    )
    .unwrap();
    system.start();
    scheduler.run_for(Duration::from_secs(120)).unwrap();

    assert_eq!(
        http.hits.borrow().as_slice(),
        &[MANIFEST_URL.to_string(), "https://www.wicid.ai/releases/v1.3.0".to_string()]
    );
    assert_eq!(device.resets.borrow().as_slice(), &["Installing update 1.3.0".to_string()]);
    assert!(layout.ready_marker().is_file());
    assert!(!layout.pending_root().join(".DS_Store").exists());

    // Next boot: the pending update is installed
    let installer = Installer::new(layout.clone(), identity(), Rc::new(HookRegistry::new()), Rc::new(LogIndicator), 1);
    let boot = BootPipeline::new(installer);
    let outcome = block_on(clock.as_ref(), boot.run());
    assert_eq!(
        outcome,
        BootOutcome::RebootRequired("Update installed: 1.0.0 -> 1.3.0".to_string())
    );

    assert_eq!(fs::read(root.join("firmware/wicid.bin")).unwrap(), b"firmware 1.3.0");
    assert!(root.join("www/index.html").is_file());
    assert_eq!(fs::read(root.join("secrets.json")).unwrap(), br#"{"ssid": "home"}"#);
    assert_eq!(Settings::load(&layout.settings_file()).unwrap().version, "1.3.0");
    assert!(!layout.pending_dir().exists());
    assert!(layout.recovery_dir().join("firmware/wicid.bin").is_file());

    // The boot after that is a normal one
    let installer = Installer::new(layout, identity(), Rc::new(HookRegistry::new()), Rc::new(LogIndicator), 1);
    assert_eq!(block_on(clock.as_ref(), BootPipeline::new(installer).run()), BootOutcome::Normal);
}

#[test]
fn corrupt_download_is_blocked_and_never_installed() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    install_base(root);
    let layout = DeviceLayout::new(root);

    let v13 = bundle("1.3.0");
    let http = Rc::new(StaticHttp::default());
    http.routes.borrow_mut().insert(
        MANIFEST_URL.to_string(),
        release_manifest(&[("1.3.0", "deadbeef")]).into_bytes(),
    );
    http.routes
        .borrow_mut()
        .insert("https://www.wicid.ai/releases/v1.3.0".to_string(), v13);

    let clock = ManualClock::new();
    let device = Rc::new(Device::default());
    let settings = Settings::load(&layout.settings_file()).unwrap();
    let updates = UpdateManager::new(
        layout.clone(),
        identity(),
        http.clone(),
        Rc::new(LogIndicator),
        device.clone(),
        UpdateConfig::from_settings(&settings),
    )
    .unwrap();

    assert!(block_on(&clock, updates.check_download_and_reboot(Duration::from_secs(1))).is_err());
    assert!(device.resets.borrow().is_empty());
    assert!(!layout.pending_dir().exists());
    assert!(updates.ledger().status("1.3.0", 1).blocked);

    // With 1.3.0 blocked and 1.5.0 out of reach, nothing is offered
    assert_eq!(block_on(&clock, updates.check_for_updates()).unwrap(), None);

    let installer = Installer::new(layout, identity(), Rc::new(HookRegistry::new()), Rc::new(LogIndicator), 1);
    assert_eq!(block_on(&clock, BootPipeline::new(installer).run()), BootOutcome::Normal);
    assert_eq!(fs::read(root.join("firmware/wicid.bin")).unwrap(), b"firmware 1.0.0");
}

#[test]
fn newest_archive_is_staged_when_current_releases_are_out_of_reach() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    install_base(root);
    fs::write(root.join("DEVELOPMENT"), b"").unwrap();
    let layout = DeviceLayout::new(root);

    let v11 = bundle("1.1.0");
    let v13 = bundle("1.3.0");
    let v13_sha = format!("{:x}", Sha256::digest(&v13));
    let http = Rc::new(StaticHttp::default());
    http.routes.borrow_mut().insert(
        MANIFEST_URL.to_string(),
        release_manifest(&[("1.3.0", &v13_sha), ("1.1.0", &format!("{:x}", Sha256::digest(&v11)))]).into_bytes(),
    );
    http.routes
        .borrow_mut()
        .insert("https://www.wicid.ai/releases/v1.1.0".to_string(), v11);
    http.routes
        .borrow_mut()
        .insert("https://www.wicid.ai/releases/v1.3.0".to_string(), v13);

    let clock = ManualClock::new();
    let settings = Settings::load(&layout.settings_file()).unwrap();
    let updates = UpdateManager::new(
        layout.clone(),
        identity(),
        http.clone(),
        Rc::new(LogIndicator),
        Rc::new(Device::default()),
        UpdateConfig::from_settings(&settings),
    )
    .unwrap();

    // Production 1.5.0 fails its minimum prior version, development 1.6.0 is blocked
    updates.ledger().record_failure("1.6.0", "Installation failed: boot loop").unwrap();

    let release = block_on(&clock, updates.check_for_updates()).unwrap().unwrap();
    assert_eq!(release.version, "1.3.0");
    assert!(release.from_archive);

    let pending = block_on(&clock, updates.download_update(&release)).unwrap();
    assert_eq!(pending.version, "1.3.0");
    assert_eq!(fs::read(layout.pending_root().join("firmware/wicid.bin")).unwrap(), b"firmware 1.3.0");
    assert_eq!(fs::read_to_string(layout.ready_marker()).unwrap(), v13_sha);
    assert!(!layout.update_archive().exists());
    assert_eq!(
        http.hits.borrow().as_slice(),
        &[MANIFEST_URL.to_string(), "https://www.wicid.ai/releases/v1.3.0".to_string()]
    );
}
