//! Where everything lives on the device filesystem

use crate::manifest::Channel;
use std::path::{Path, PathBuf};

pub const PENDING_UPDATE_DIR: &str = "pending_update";
pub const STAGING_DIR: &str = ".staging";
pub const PENDING_ROOT_DIR: &str = "root";
pub const READY_MARKER: &str = ".ready";
pub const UPDATE_ARCHIVE: &str = "update.zip";
pub const BUNDLE_MANIFEST: &str = "manifest.json";
pub const INSTALL_SCRIPTS_DIR: &str = "firmware_install_scripts";
pub const RECOVERY_DIR: &str = "recovery";
pub const INTEGRITY_FILE: &str = ".integrity";
pub const INSTALL_LOG_FILE: &str = "boot_log.txt";
pub const SETTINGS_FILE: &str = "settings.json";
pub const SECRETS_FILE: &str = "secrets.json";
pub const LEDGER_FILE: &str = "incompatible_releases.json";
pub const DEVELOPMENT_MARKER: &str = "DEVELOPMENT";

/// User data an install must never delete or overwrite
pub const PRESERVED_FILES: [&str; 4] = [INSTALL_LOG_FILE, SECRETS_FILE, LEDGER_FILE, DEVELOPMENT_MARKER];

/// Files the device needs to boot and to fetch its next update
pub const DEFAULT_CRITICAL_FILES: [&str; 3] = [BUNDLE_MANIFEST, SETTINGS_FILE, "firmware/wicid.bin"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLayout {
    root: PathBuf,
    critical_files: Vec<String>,
}

impl DeviceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            critical_files: DEFAULT_CRITICAL_FILES.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn with_critical_files<S: AsRef<str>>(mut self, files: &[S]) -> Self {
        self.critical_files = files.iter().map(|f| f.as_ref().to_string()).collect();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn critical_files(&self) -> &[String] {
        &self.critical_files
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.root.join(PENDING_UPDATE_DIR)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.pending_dir().join(STAGING_DIR)
    }

    pub fn pending_root(&self) -> PathBuf {
        self.pending_dir().join(PENDING_ROOT_DIR)
    }

    pub fn ready_marker(&self) -> PathBuf {
        self.pending_dir().join(READY_MARKER)
    }

    pub fn update_archive(&self) -> PathBuf {
        self.pending_dir().join(UPDATE_ARCHIVE)
    }

    pub fn recovery_dir(&self) -> PathBuf {
        self.root.join(RECOVERY_DIR)
    }

    pub fn integrity_file(&self) -> PathBuf {
        self.recovery_dir().join(INTEGRITY_FILE)
    }

    pub fn install_log(&self) -> PathBuf {
        self.root.join(INSTALL_LOG_FILE)
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }

    pub fn ledger_file(&self) -> PathBuf {
        self.root.join(LEDGER_FILE)
    }

    /// Top-level names a full install leaves untouched
    pub fn preserved_names(&self) -> Vec<&'static str> {
        let mut names = PRESERVED_FILES.to_vec();
        names.push(RECOVERY_DIR);
        names.push(PENDING_UPDATE_DIR);
        names
    }

    /// A `DEVELOPMENT` marker in the root opts the device into development releases
    pub fn channel(&self) -> Channel {
        if self.root.join(DEVELOPMENT_MARKER).exists() {
            Channel::Development
        } else {
            Channel::Production
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let layout = DeviceLayout::new("/device");
        assert_eq!(layout.staging_dir(), PathBuf::from("/device/pending_update/.staging"));
        assert_eq!(layout.pending_root(), PathBuf::from("/device/pending_update/root"));
        assert_eq!(layout.integrity_file(), PathBuf::from("/device/recovery/.integrity"));
        assert_eq!(layout.critical_files().len(), DEFAULT_CRITICAL_FILES.len());
    }

    #[test]
    fn test_channel_from_marker() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DeviceLayout::new(dir.path());
        assert_eq!(layout.channel(), Channel::Production);
        std::fs::write(dir.path().join(DEVELOPMENT_MARKER), b"").unwrap();
        assert_eq!(layout.channel(), Channel::Development);
    }

    #[test]
    fn test_preserved_names() {
        let names = DeviceLayout::new("/").preserved_names();
        for name in ["boot_log.txt", "secrets.json", "incompatible_releases.json", "DEVELOPMENT", "recovery", "pending_update"] {
            assert!(names.contains(&name), "{} should be preserved", name);
        }
    }
}
