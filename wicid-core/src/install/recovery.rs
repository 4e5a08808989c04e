//! Recovery backup of the files the device needs to boot and update itself
//!
//! `recovery/` holds a copy of every critical file plus an `.integrity`
//! document mapping each relative path to its SHA-256. At boot, missing or
//! unreadable critical files are restored from the backup after the backup
//! itself checks out.

use crate::fsutil::{atomic_write, copy_file, remove_dir_all_quiet};
use crate::install_log::InstallLog;
use crate::layout::DeviceLayout;
use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    NotNeeded,
    Restored(usize),
    Failed(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Integrity {
    files: BTreeMap<String, String>,
}

pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone)]
pub struct Recovery {
    layout: DeviceLayout,
}

impl Recovery {
    pub fn new(layout: DeviceLayout) -> Self {
        Self { layout }
    }

    /// Critical files under `base` that are missing or cannot be opened
    pub fn missing_in(&self, base: &Path) -> Vec<String> {
        self.layout
            .critical_files()
            .iter()
            .filter(|f| {
                let path = base.join(f.as_str());
                !path.is_file() || File::open(&path).is_err()
            })
            .cloned()
            .collect()
    }

    pub fn missing_critical(&self) -> Vec<String> {
        self.missing_in(self.layout.root())
    }

    pub fn backup_exists(&self) -> bool {
        fs::read_dir(self.layout.recovery_dir())
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }

    /// Replace the backup with copies of the current critical files
    pub fn create_backup(&self) -> Result<usize> {
        let recovery_dir = self.layout.recovery_dir();
        remove_dir_all_quiet(&recovery_dir)
            .with_context(|| format!("clearing {}", recovery_dir.display()))?;
        fs::create_dir_all(&recovery_dir)?;

        let mut integrity = Integrity::default();
        let mut failures = Vec::new();
        for file in self.layout.critical_files() {
            let src = self.layout.root().join(file);
            let dst = recovery_dir.join(file);
            let copied = copy_file(&src, &dst).and_then(|_| file_sha256(&dst));
            match copied {
                Ok(hash) => {
                    debug!("Backed up {}", file);
                    integrity.files.insert(file.clone(), hash);
                }
                Err(e) => failures.push(format!("{}: {}", file, e)),
            }
        }

        if !failures.is_empty() {
            bail!("Recovery backup incomplete: {}", failures.join(", "));
        }

        let json = serde_json::to_vec_pretty(&integrity)?;
        atomic_write(&self.layout.integrity_file(), &json)?;
        info!("Recovery backup created: {} files", integrity.files.len());
        Ok(integrity.files.len())
    }

    /// Check that every critical file is backed up and matches its recorded hash
    pub fn validate_backup(&self) -> Result<usize> {
        if !self.backup_exists() {
            bail!("No recovery backup found");
        }

        let recovery_dir = self.layout.recovery_dir();
        let missing = self.missing_in(&recovery_dir);
        if !missing.is_empty() {
            bail!("Recovery backup incomplete: {} files missing", missing.len());
        }

        let integrity = self.read_integrity()?;
        for file in self.layout.critical_files() {
            let expected = integrity
                .files
                .get(file)
                .ok_or_else(|| anyhow!("No integrity record for {}", file))?;
            let actual = file_sha256(&recovery_dir.join(file))?;
            if !expected.eq_ignore_ascii_case(&actual) {
                bail!("Recovery copy of {} is corrupt", file);
            }
        }
        Ok(integrity.files.len())
    }

    /// Copy every backed-up file into the root
    pub fn restore(&self) -> Result<usize> {
        let integrity = self.read_integrity()?;
        let recovery_dir = self.layout.recovery_dir();

        let mut failures = Vec::new();
        for file in integrity.files.keys() {
            if let Err(e) = copy_file(&recovery_dir.join(file), &self.layout.root().join(file)) {
                failures.push(format!("{}: {}", file, e));
            }
        }
        if !failures.is_empty() {
            bail!("Restore failed for {}", failures.join(", "));
        }

        let still_missing = self.missing_critical();
        if !still_missing.is_empty() {
            bail!("Still missing after restore: {}", still_missing.join(", "));
        }
        Ok(integrity.files.len())
    }

    /// Restore from the backup if any critical file is missing
    pub fn check_and_restore(&self, log: &InstallLog) -> RecoveryOutcome {
        let missing = self.missing_critical();
        if missing.is_empty() {
            debug!("All critical files present");
            return RecoveryOutcome::NotNeeded;
        }
        log.error(&format!("CRITICAL: Missing critical files: {}", missing.join(", ")));

        if let Err(e) = self.validate_backup() {
            let message = format!("{:#}", e);
            log.error(&format!("Cannot restore: {}", message));
            return RecoveryOutcome::Failed(message);
        }

        log.warn("Restoring from recovery backup");
        match self.restore() {
            Ok(count) => {
                log.info(&format!("Restored {} files from recovery backup", count));
                RecoveryOutcome::Restored(count)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                log.error(&message);
                RecoveryOutcome::Failed(message)
            }
        }
    }

    fn read_integrity(&self) -> Result<Integrity> {
        let path = self.layout.integrity_file();
        let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn installed() -> (TempDir, Recovery, InstallLog) {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("firmware")).unwrap();
        fs::write(dir.path().join("manifest.json"), br#"{"version": "1.0.0"}"#).unwrap();
        fs::write(dir.path().join("settings.json"), br#"{"version": "1.0.0"}"#).unwrap();
        fs::write(dir.path().join("firmware/wicid.bin"), b"firmware").unwrap();
        let recovery = Recovery::new(DeviceLayout::new(dir.path()));
        let log = InstallLog::new(dir.path().join("boot_log.txt"));
        (dir, recovery, log)
    }

    #[test]
    fn test_nothing_missing() {
        let (_dir, recovery, log) = installed();
        assert!(recovery.missing_critical().is_empty());
        assert_eq!(recovery.check_and_restore(&log), RecoveryOutcome::NotNeeded);
    }

    #[test]
    fn test_backup_and_restore() {
        let (dir, recovery, log) = installed();
        assert_eq!(recovery.create_backup().unwrap(), 3);
        assert!(dir.path().join("recovery/.integrity").is_file());
        assert_eq!(recovery.validate_backup().unwrap(), 3);

        fs::remove_file(dir.path().join("firmware/wicid.bin")).unwrap();
        assert_eq!(recovery.missing_critical(), vec!["firmware/wicid.bin".to_string()]);

        assert_eq!(recovery.check_and_restore(&log), RecoveryOutcome::Restored(3));
        assert_eq!(fs::read(dir.path().join("firmware/wicid.bin")).unwrap(), b"firmware");
        assert!(fs::read_to_string(dir.path().join("boot_log.txt"))
            .unwrap()
            .contains("Restored 3 files"));
    }

    #[test]
    fn test_no_backup_fails() {
        let (dir, recovery, log) = installed();
        fs::remove_file(dir.path().join("settings.json")).unwrap();
        assert_eq!(
            recovery.check_and_restore(&log),
            RecoveryOutcome::Failed("No recovery backup found".to_string())
        );
    }

    #[test]
    fn test_corrupt_backup_is_refused() {
        let (dir, recovery, log) = installed();
        recovery.create_backup().unwrap();
        fs::write(dir.path().join("recovery/firmware/wicid.bin"), b"bitrot").unwrap();
        fs::remove_file(dir.path().join("firmware/wicid.bin")).unwrap();

        match recovery.check_and_restore(&log) {
            RecoveryOutcome::Failed(msg) => assert!(msg.contains("corrupt"), "{}", msg),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!dir.path().join("firmware/wicid.bin").exists());
    }

    #[test]
    fn test_backup_requires_every_critical_file() {
        let (dir, recovery, _log) = installed();
        fs::remove_file(dir.path().join("manifest.json")).unwrap();
        assert!(recovery.create_backup().is_err());
        assert!(recovery.validate_backup().is_err());
    }
}
