//! Boot pipeline: recovery check, then pending update installation

use super::recovery::RecoveryOutcome;
use super::{InstallOutcome, Installer};
use crate::fsutil::remove_dir_all_quiet;
use crate::platform::DeviceControl;
use crate::update::read_bundle_manifest;
use log::info;

/// Recorded against a pending update when the device had to be restored from backup
pub const RECOVERY_LEDGER_REASON: &str =
    "Automatic recovery triggered - update left device in unbootable state";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootOutcome {
    /// Continue into the application
    Normal,
    /// Files changed underneath the running firmware; reset before continuing
    RebootRequired(String),
    /// Critical files are gone and could not be restored. Never reboot from here.
    SafeMode(String),
}

impl BootOutcome {
    /// Hand the outcome to the hardware. Returns true if boot may continue.
    pub fn apply(&self, device: &dyn DeviceControl) -> bool {
        match self {
            BootOutcome::Normal => true,
            BootOutcome::RebootRequired(reason) => {
                device.hard_reset(reason);
                false
            }
            BootOutcome::SafeMode(reason) => {
                device.enter_safe_mode(reason);
                false
            }
        }
    }
}

pub struct BootPipeline {
    installer: Installer,
}

impl BootPipeline {
    pub fn new(installer: Installer) -> Self {
        Self { installer }
    }

    pub fn installer(&self) -> &Installer {
        &self.installer
    }

    pub async fn run(&self) -> BootOutcome {
        self.installer.log().info("=== BOOT: recovery check ===");
        if let Some(outcome) = self.recover() {
            return outcome;
        }

        let outcome = match self.installer.process_pending_update().await {
            InstallOutcome::NoPendingUpdate => BootOutcome::Normal,
            InstallOutcome::Installed { from, to, script_only } => {
                let kind = if script_only { "Script-only update" } else { "Update" };
                BootOutcome::RebootRequired(format!("{} installed: {} -> {}", kind, from, to))
            }
            // An abort late in the install can leave critical files missing
            InstallOutcome::Aborted { .. } => self.recover().unwrap_or(BootOutcome::Normal),
        };
        info!("Boot pipeline finished: {:?}", outcome);
        outcome
    }

    fn recover(&self) -> Option<BootOutcome> {
        let log = self.installer.log();
        match self.installer.recovery().check_and_restore(log) {
            RecoveryOutcome::NotNeeded => None,
            RecoveryOutcome::Restored(count) => {
                let layout = self.installer.layout();
                if let Ok(manifest) = read_bundle_manifest(&layout.pending_root()) {
                    if let Err(e) = self
                        .installer
                        .ledger()
                        .record_failure(&manifest.version, RECOVERY_LEDGER_REASON)
                    {
                        log.error(&format!("Could not update compatibility ledger: {:#}", e));
                    }
                }
                if let Err(e) = remove_dir_all_quiet(&layout.pending_dir()) {
                    log.error(&format!("Could not remove pending update: {}", e));
                }
                Some(BootOutcome::RebootRequired(format!(
                    "Restored {} files from recovery backup",
                    count
                )))
            }
            RecoveryOutcome::Failed(reason) => {
                log.error(&format!("Recovery failed, entering safe mode: {}", reason));
                Some(BootOutcome::SafeMode(reason))
            }
        }
    }
}
