//! Update manager
//!
//! Fetches the release manifest, picks the best release for this device and
//! stages its bundle under `/pending_update` for the boot pipeline to install.
//! A staged update is complete only once the `.ready` marker exists.

pub mod bundle;
pub mod resolve;

pub use bundle::{Bundle, BundleEntry, BundleError};
pub use resolve::{Ineligible, ResolvedRelease, Resolver};

use crate::clock::format_duration;
use crate::config::{ConfigError, Settings};
use crate::fsutil::{atomic_write, is_hidden, missing_files, remove_dir_all_quiet};
use crate::identity::DeviceIdentity;
use crate::layout::{DeviceLayout, BUNDLE_MANIFEST};
use crate::ledger::CompatibilityLedger;
use crate::manifest::{BundleManifest, ReleaseManifest};
use crate::platform::{read_body, DeviceControl, HttpClient, StatusIndicator, UpdatePhase};
use crate::scheduler::{sleep, yield_control};
use crate::version::Version;
use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

/// Download chunk size; one yield per chunk
pub const DOWNLOAD_CHUNK_SIZE: usize = 2048;

/// Largest release manifest accepted
pub const MANIFEST_SIZE_LIMIT: usize = 64 * 1024;

/// Marker content when the release published no checksum
pub const NO_CHECKSUM: &str = "no-checksum";

#[derive(Debug)]
pub enum UpdateError {
    NotConfigured,
    Network(anyhow::Error),
    HttpStatus(u16),
    Checksum { expected: String, actual: String },
    MissingChecksum,
    Bundle(BundleError),
    InvalidManifest(String),
    IncompletePackage(Vec<String>),
    Staging(String),
    Io(io::Error),
}

impl UpdateError {
    /// True when the fault lies with the release itself rather than the
    /// network or this device, so retrying the same release is pointless
    pub fn is_release_fault(&self) -> bool {
        match self {
            UpdateError::Checksum { .. }
            | UpdateError::MissingChecksum
            | UpdateError::InvalidManifest(_)
            | UpdateError::IncompletePackage(_)
            | UpdateError::Staging(_) => true,
            UpdateError::Bundle(BundleError::Io(_)) => false,
            UpdateError::Bundle(_) => true,
            UpdateError::NotConfigured
            | UpdateError::Network(_)
            | UpdateError::HttpStatus(_)
            | UpdateError::Io(_) => false,
        }
    }
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateError::NotConfigured => write!(f, "no manifest URL configured"),
            UpdateError::Network(e) => write!(f, "network error: {:#}", e),
            UpdateError::HttpStatus(code) => write!(f, "HTTP status {}", code),
            UpdateError::Checksum { expected, actual } => {
                write!(f, "Checksum verification failed: expected {}, got {}", expected, actual)
            }
            UpdateError::MissingChecksum => write!(f, "release has no sha256 checksum"),
            UpdateError::Bundle(e) => write!(f, "{}", e),
            UpdateError::InvalidManifest(msg) => write!(f, "Invalid bundle manifest: {}", msg),
            UpdateError::IncompletePackage(missing) => {
                write!(f, "Update package incomplete: missing {}", missing.join(", "))
            }
            UpdateError::Staging(msg) => write!(f, "Staging failed: {}", msg),
            UpdateError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for UpdateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UpdateError::Network(e) => Some(&**e),
            UpdateError::Bundle(e) => Some(e),
            UpdateError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for UpdateError {
    fn from(e: io::Error) -> Self {
        UpdateError::Io(e)
    }
}

impl From<BundleError> for UpdateError {
    fn from(e: BundleError) -> Self {
        UpdateError::Bundle(e)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateConfig {
    pub manifest_url: Option<String>,
    pub installed_version: String,
    pub check_interval: Duration,
    pub max_attempts: u32,
    pub require_checksum: bool,
}

impl UpdateConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            manifest_url: settings.manifest_url.clone(),
            installed_version: settings.version.clone(),
            check_interval: settings.update_check_interval(),
            max_attempts: settings.max_install_attempts,
            require_checksum: settings.require_checksum,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.installed_version.parse::<Version>().map_err(|e| {
            ConfigError::Invalid(format!("installed version '{}': {}", self.installed_version, e))
        })?;
        if self.check_interval.is_zero() {
            return Err(ConfigError::Invalid("update check interval must be non-zero".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max attempts must be at least 1".to_string()));
        }
        if let Some(url) = &self.manifest_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!("manifest URL '{}' is not http(s)", url)));
            }
        }
        Ok(())
    }
}

/// A bundle staged under `/pending_update/root`, ready for the installer
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate {
    pub version: String,
    pub root_dir: PathBuf,
    pub pending_dir: PathBuf,
    pub has_pre_install_script: bool,
    pub has_post_install_script: bool,
    pub script_only_release: bool,
}

impl PendingUpdate {
    pub fn new(layout: &DeviceLayout, manifest: &BundleManifest) -> Self {
        Self {
            version: manifest.version.clone(),
            root_dir: layout.pending_root(),
            pending_dir: layout.pending_dir(),
            has_pre_install_script: manifest.has_pre_install_script,
            has_post_install_script: manifest.has_post_install_script,
            script_only_release: manifest.is_script_only(),
        }
    }
}

/// Read and parse `manifest.json` from an extracted bundle directory
pub fn read_bundle_manifest(dir: &Path) -> Result<BundleManifest, UpdateError> {
    let path = dir.join(BUNDLE_MANIFEST);
    let bytes = fs::read(&path)
        .map_err(|e| UpdateError::InvalidManifest(format!("{}: {}", path.display(), e)))?;
    let manifest = BundleManifest::from_json(&bytes)
        .map_err(|e| UpdateError::InvalidManifest(format!("{}: {}", path.display(), e)))?;
    manifest
        .version
        .parse::<Version>()
        .map_err(|e| UpdateError::InvalidManifest(format!("version '{}': {}", manifest.version, e)))?;
    Ok(manifest)
}

pub struct UpdateManager {
    layout: DeviceLayout,
    device: DeviceIdentity,
    http: Rc<dyn HttpClient>,
    ledger: CompatibilityLedger,
    indicator: Rc<dyn StatusIndicator>,
    device_control: Rc<dyn DeviceControl>,
    config: RefCell<UpdateConfig>,
}

impl UpdateManager {
    pub fn new(
        layout: DeviceLayout,
        device: DeviceIdentity,
        http: Rc<dyn HttpClient>,
        indicator: Rc<dyn StatusIndicator>,
        device_control: Rc<dyn DeviceControl>,
        config: UpdateConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let ledger = CompatibilityLedger::new(layout.ledger_file());
        Ok(Self {
            layout,
            device,
            http,
            ledger,
            indicator,
            device_control,
            config: RefCell::new(config),
        })
    }

    pub fn layout(&self) -> &DeviceLayout {
        &self.layout
    }

    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    pub fn ledger(&self) -> &CompatibilityLedger {
        &self.ledger
    }

    pub fn config(&self) -> UpdateConfig {
        self.config.borrow().clone()
    }

    pub fn installed_version(&self) -> String {
        self.config.borrow().installed_version.clone()
    }

    /// Delay before the next scheduled check
    pub fn next_check_delay(&self) -> Duration {
        self.config.borrow().check_interval
    }

    /// Validate and apply new settings. The old configuration stays on error.
    pub fn reconfigure(&self, config: UpdateConfig) -> Result<(), ConfigError> {
        config.validate()?;
        info!(
            "Update manager reconfigured: url={:?} interval={} max_attempts={}",
            config.manifest_url,
            format_duration(config.check_interval),
            config.max_attempts
        );
        *self.config.borrow_mut() = config;
        Ok(())
    }

    fn request_headers(&self, installed: &str) -> [(&'static str, String); 2] {
        [
            ("Connection", "close".to_string()),
            ("User-Agent", self.device.user_agent(installed)),
        ]
    }

    /// Fetch the manifest and resolve the best eligible release.
    ///
    /// `Ok(None)` covers every "nothing to do" outcome, including a malformed
    /// manifest. Errors are transport failures worth retrying later.
    pub async fn check_for_updates(&self) -> Result<Option<ResolvedRelease>, UpdateError> {
        let config = self.config();
        let url = config.manifest_url.as_deref().ok_or(UpdateError::NotConfigured)?;
        info!("Checking for updates: {}", url);

        let headers = self.request_headers(&config.installed_version);
        let headers: Vec<(&str, &str)> = headers.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let mut response = self.http.get(url, &headers).map_err(UpdateError::Network)?;
        yield_control().await;

        let status = response.status();
        if !(200..300).contains(&status) {
            return Err(UpdateError::HttpStatus(status));
        }
        let body = read_body(response.as_mut(), MANIFEST_SIZE_LIMIT).map_err(UpdateError::Network)?;

        let manifest = match ReleaseManifest::from_json(&body) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Ignoring malformed release manifest: {}", e);
                return Ok(None);
            }
        };

        let resolver = Resolver {
            device: &self.device,
            installed_version: &config.installed_version,
            channel: self.layout.channel(),
            max_attempts: config.max_attempts,
            require_checksum: config.require_checksum,
            ledger: &self.ledger,
        };
        let release = resolver.resolve(&manifest);
        match &release {
            Some(r) => info!("Update available: {} -> {}", config.installed_version, r.version),
            None => info!("No update available for {}", config.installed_version),
        }
        Ok(release)
    }

    /// Download, verify and unpack a release into `/pending_update/root`.
    ///
    /// Any failure removes the partial staging area. Failures caused by the
    /// release itself are recorded in the compatibility ledger.
    pub async fn download_update(&self, release: &ResolvedRelease) -> Result<PendingUpdate, UpdateError> {
        match self.stage(release).await {
            Ok(pending) => {
                self.indicator
                    .progress(UpdatePhase::Complete, &format!("Update {} ready", release.version), Some(100.0));
                Ok(pending)
            }
            Err(e) => {
                error!("Staging {} failed: {}", release.version, e);
                if let Err(cleanup) = remove_dir_all_quiet(&self.layout.pending_dir()) {
                    warn!("Could not clean up pending update: {}", cleanup);
                }
                self.indicator.progress(UpdatePhase::Error, &e.to_string(), None);
                if e.is_release_fault() {
                    if let Err(le) = self.ledger.record_failure(&release.version, &e.to_string()) {
                        warn!("Could not update compatibility ledger: {:#}", le);
                    }
                }
                Err(e)
            }
        }
    }

    /// Check, stage and request a reboot after `delay`. Returns whether an update was staged.
    pub async fn check_download_and_reboot(&self, delay: Duration) -> Result<bool, UpdateError> {
        let Some(release) = self.check_for_updates().await? else {
            return Ok(false);
        };
        self.download_update(&release).await?;

        info!("Update {} staged, rebooting in {}", release.version, format_duration(delay));
        sleep(delay).await;
        self.device_control
            .hard_reset(&format!("Installing update {}", release.version));
        Ok(true)
    }

    async fn stage(&self, release: &ResolvedRelease) -> Result<PendingUpdate, UpdateError> {
        let config = self.config();
        if release.sha256.is_none() && config.require_checksum {
            return Err(UpdateError::MissingChecksum);
        }

        let pending_dir = self.layout.pending_dir();
        let staging_dir = self.layout.staging_dir();
        remove_dir_all_quiet(&pending_dir)?;
        fs::create_dir_all(&staging_dir)?;

        let archive = self.layout.update_archive();
        let actual = self.download_archive(release, &config.installed_version, &archive).await?;

        self.indicator
            .progress(UpdatePhase::Verifying, "Verifying checksum", None);
        match &release.sha256 {
            Some(expected) if !expected.trim().eq_ignore_ascii_case(&actual) => {
                return Err(UpdateError::Checksum {
                    expected: expected.trim().to_lowercase(),
                    actual,
                });
            }
            Some(_) => info!("Checksum verified for {}", release.version),
            None => warn!("No checksum published for {}, skipping verification", release.version),
        }

        let files = self.extract_archive(&archive, &staging_dir).await?;
        info!("Extracted {} files", files);

        let manifest = read_bundle_manifest(&staging_dir)?;
        if manifest.version != release.version {
            return Err(UpdateError::InvalidManifest(format!(
                "bundle version {} does not match release {}",
                manifest.version, release.version
            )));
        }
        if !manifest.is_script_only() {
            let missing = missing_files(&staging_dir, self.layout.critical_files());
            if !missing.is_empty() {
                return Err(UpdateError::IncompletePackage(missing));
            }
        }

        fs::remove_file(&archive)?;
        fs::rename(&staging_dir, self.layout.pending_root())
            .map_err(|e| UpdateError::Staging(format!("could not finalize staging: {}", e)))?;

        let marker = release.sha256.as_deref().map(str::trim).unwrap_or(NO_CHECKSUM);
        atomic_write(&self.layout.ready_marker(), marker.as_bytes())?;
        info!("Update {} staged in {}", release.version, pending_dir.display());

        Ok(PendingUpdate::new(&self.layout, &manifest))
    }

    /// Stream the bundle to disk, hashing as it arrives. Returns the hex sha256.
    async fn download_archive(
        &self,
        release: &ResolvedRelease,
        installed: &str,
        archive: &Path,
    ) -> Result<String, UpdateError> {
        info!("Downloading {} from {}", release.version, release.zip_url);
        let headers = self.request_headers(installed);
        let headers: Vec<(&str, &str)> = headers.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let mut response = self
            .http
            .get(&release.zip_url, &headers)
            .map_err(UpdateError::Network)?;
        yield_control().await;

        let status = response.status();
        if !(200..300).contains(&status) {
            return Err(UpdateError::HttpStatus(status));
        }

        let total = response.content_length().filter(|&t| t > 0);
        let message = format!("Downloading {}", release.version);
        let mut file = File::create(archive)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; DOWNLOAD_CHUNK_SIZE];
        let mut received = 0u64;

        loop {
            let n = response.read(&mut buf).map_err(UpdateError::Network)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
            hasher.update(&buf[..n]);
            received += n as u64;

            // Capped below 100 until verification finishes
            let percent = total.map(|t| (received as f32 / t as f32 * 100.0).min(99.0));
            self.indicator.progress(UpdatePhase::Downloading, &message, percent);
            yield_control().await;
        }
        file.sync_all()?;

        if let Some(total) = total {
            if received != total {
                return Err(UpdateError::Network(anyhow::anyhow!(
                    "download truncated: {} of {} bytes",
                    received,
                    total
                )));
            }
        }
        info!("Downloaded {} bytes", received);
        Ok(format!("{:x}", hasher.finalize()))
    }

    async fn extract_archive(&self, archive: &Path, dest: &Path) -> Result<usize, UpdateError> {
        let mut bundle = Bundle::open_file(archive)?;
        let entries: Vec<BundleEntry> = bundle
            .entries()
            .iter()
            .filter(|e| {
                let hidden = is_hidden(&e.name);
                if hidden {
                    debug!("Skipping hidden bundle entry {}", e.name);
                }
                !hidden
            })
            .cloned()
            .collect();

        let total = entries.len();
        for (index, entry) in entries.iter().enumerate() {
            bundle.extract(entry, dest)?;
            let done = index + 1;
            if done % 3 == 0 || done == total {
                let percent = done as f32 / total as f32 * 100.0;
                self.indicator.progress(
                    UpdatePhase::Unpacking,
                    &format!("Unpacking {}/{}", done, total),
                    Some(percent),
                );
            }
            yield_control().await;
        }
        Ok(total)
    }
}
