//! Installs a staged update at boot
//!
//! Order of operations for a full release:
//! pre-install hook, compatibility and package checks, delete everything but
//! the preserved set, move the bundle in, record the version, refresh the
//! recovery backup, post-install hook, clean up. A script-only release stops
//! after the pre-install hook and only records its version.

pub mod boot;
pub mod hooks;
pub mod recovery;

pub use boot::{BootOutcome, BootPipeline};
pub use hooks::{HookContext, HookKind, HookOutcome, HookRegistry};
pub use recovery::{Recovery, RecoveryOutcome};

use crate::config::{record_installed_version, Settings};
use crate::fsutil::{delete_all_except, missing_files, move_tree, remove_dir_all_quiet};
use crate::identity::DeviceIdentity;
use crate::install_log::InstallLog;
use crate::layout::{DeviceLayout, PRESERVED_FILES};
use crate::ledger::CompatibilityLedger;
use crate::manifest::{BundleManifest, Channel};
use crate::platform::{StatusIndicator, UpdatePhase};
use crate::scheduler::yield_control;
use crate::update::{read_bundle_manifest, PendingUpdate};
use crate::version::is_newer;
use std::fs;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    NoPendingUpdate,
    Installed {
        from: String,
        to: String,
        script_only: bool,
    },
    /// Nothing was installed; the reason is already in the ledger and install log
    Aborted { version: String, reason: String },
}

pub struct Installer {
    layout: DeviceLayout,
    device: DeviceIdentity,
    ledger: CompatibilityLedger,
    recovery: Recovery,
    hooks: Rc<HookRegistry>,
    indicator: Rc<dyn StatusIndicator>,
    log: InstallLog,
    max_attempts: u32,
}

impl Installer {
    pub fn new(
        layout: DeviceLayout,
        device: DeviceIdentity,
        hooks: Rc<HookRegistry>,
        indicator: Rc<dyn StatusIndicator>,
        max_attempts: u32,
    ) -> Self {
        Self {
            ledger: CompatibilityLedger::new(layout.ledger_file()),
            recovery: Recovery::new(layout.clone()),
            log: InstallLog::new(layout.install_log()),
            layout,
            device,
            hooks,
            indicator,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn layout(&self) -> &DeviceLayout {
        &self.layout
    }

    pub fn log(&self) -> &InstallLog {
        &self.log
    }

    pub fn ledger(&self) -> &CompatibilityLedger {
        &self.ledger
    }

    pub fn recovery(&self) -> &Recovery {
        &self.recovery
    }

    fn current_version(&self) -> String {
        Settings::load_or_default(&self.layout.settings_file()).version
    }

    pub async fn process_pending_update(&self) -> InstallOutcome {
        self.log.info("Checking for pending firmware updates");
        self.cleanup_incomplete_staging();

        if !self.pending_update_ready() {
            self.log.info("No pending update found - proceeding with normal boot");
            return InstallOutcome::NoPendingUpdate;
        }
        self.indicator
            .progress(UpdatePhase::Installing, "Update detected", None);

        let manifest = match read_bundle_manifest(&self.layout.pending_root()) {
            Ok(manifest) => manifest,
            Err(e) => {
                self.log.error(&format!("Could not load manifest: {}", e));
                self.cleanup_pending();
                return InstallOutcome::Aborted {
                    version: "unknown".to_string(),
                    reason: e.to_string(),
                };
            }
        };
        let pending = PendingUpdate::new(&self.layout, &manifest);
        let current = self.current_version();
        let version = pending.version.clone();
        self.log
            .info(&format!("WICID Firmware Update: {} -> {}", current, version));

        let pre = self.run_hook(HookKind::PreInstall, pending.has_pre_install_script, &pending).await;
        if let HookOutcome::Failed(msg) = pre {
            return self.abort(&version, format!("pre_install script failed: {}", msg));
        }

        if pending.script_only_release {
            self.log
                .info("Script-only release - recording version and cleaning up");
            self.record_version(&version);
            return self.complete(current, version, true);
        }

        if let Err(reason) = self.verify_compatibility(&manifest, &current) {
            return self.abort(&version, reason);
        }
        self.log.info("Compatibility verified");

        let missing = missing_files(&pending.root_dir, self.layout.critical_files());
        if !missing.is_empty() {
            self.log.error(&format!(
                "Update package incomplete - missing {} critical files: {}",
                missing.len(),
                missing.join(", ")
            ));
            return self.abort(
                &version,
                format!("Incomplete package - missing {} critical files", missing.len()),
            );
        }
        self.log.info("Package integrity validated");
        yield_control().await;

        self.indicator
            .progress(UpdatePhase::Installing, "Replacing firmware files", None);
        self.log.info("Performing full reset (deleting all existing files)");
        let preserved = self.layout.preserved_names();
        match delete_all_except(self.layout.root(), &preserved) {
            Ok(failures) => self.log_failures("delete", &failures),
            Err(e) => self.log.error(&format!("Could not list device root: {}", e)),
        }
        yield_control().await;

        match move_tree(&pending.root_dir, self.layout.root(), &PRESERVED_FILES) {
            Ok(failures) => self.log_failures("move", &failures),
            Err(e) => self.log.error(&format!("Could not read staged files: {}", e)),
        }
        yield_control().await;

        let missing = missing_files(self.layout.root(), self.layout.critical_files());
        if !missing.is_empty() {
            return self.abort(
                &version,
                format!("Install left critical files missing: {}", missing.join(", ")),
            );
        }

        self.record_version(&version);
        match self.recovery.create_backup() {
            Ok(count) => self
                .log
                .info(&format!("Recovery backup created: {} files", count)),
            Err(e) => self.log.error(&format!("Recovery backup failed: {:#}", e)),
        }
        yield_control().await;

        let post = self.run_hook(HookKind::PostInstall, pending.has_post_install_script, &pending).await;
        if let HookOutcome::Failed(msg) = post {
            let reason = format!("post_install script failed: {}", msg);
            self.log.warn(&format!("{} (continuing with update)", reason));
            self.record_failure(&version, &reason);
        }

        self.complete(current, version, false)
    }

    async fn run_hook(&self, kind: HookKind, declared: bool, pending: &PendingUpdate) -> HookOutcome {
        if declared {
            self.indicator.progress(
                UpdatePhase::Installing,
                &format!("Running {} script", kind.as_str()),
                None,
            );
        }
        self.hooks
            .run(
                kind,
                declared,
                &pending.version,
                self.layout.root(),
                &pending.root_dir,
                &pending.pending_dir,
                &self.log,
            )
            .await
    }

    /// Re-check the staged release against this device before touching any file
    fn verify_compatibility(&self, manifest: &BundleManifest, current: &str) -> Result<(), String> {
        if !self.device.matches_machine(&manifest.target_machine_types) {
            return Err(format!(
                "Incompatible machine type: {} not in {:?}",
                self.device.machine_type, manifest.target_machine_types
            ));
        }
        if !self.device.os.matches_any(&manifest.target_operating_systems) {
            return Err(format!(
                "Incompatible OS: {} does not satisfy {:?}",
                self.device.os, manifest.target_operating_systems
            ));
        }
        if manifest.release_type == Some(Channel::Development)
            && self.layout.channel() == Channel::Production
        {
            return Err("Development release on a production device".to_string());
        }
        if !is_newer(&manifest.version, current) {
            return Err(format!(
                "Version {} is not newer than installed {}",
                manifest.version, current
            ));
        }
        let status = self.ledger.status(&manifest.version, self.max_attempts);
        if status.blocked {
            return Err(format!(
                "Version {} previously failed: {}",
                manifest.version,
                status.reason.unwrap_or_default()
            ));
        }
        Ok(())
    }

    fn pending_update_ready(&self) -> bool {
        let pending_root = self.layout.pending_root();
        let has_files = match fs::read_dir(&pending_root) {
            Ok(mut entries) => entries.next().is_some(),
            Err(_) => return false,
        };
        if !has_files {
            self.log
                .info("Pending update directory is empty - cleaning up");
            self.cleanup_pending();
            return false;
        }

        let marker = fs::read_to_string(self.layout.ready_marker()).unwrap_or_default();
        if marker.trim().is_empty() {
            self.log
                .warn("Pending update missing .ready marker - staging incomplete, cleaning up");
            self.cleanup_pending();
            return false;
        }
        self.log.info("Ready marker validated - firmware update detected");
        true
    }

    fn cleanup_incomplete_staging(&self) {
        let staging = self.layout.staging_dir();
        if staging.exists() {
            self.log
                .info("Found incomplete staging directory - cleaning up");
            if let Err(e) = remove_dir_all_quiet(&staging) {
                self.log.error(&format!("Could not remove staging directory: {}", e));
            }
        }
    }

    fn cleanup_pending(&self) {
        if let Err(e) = remove_dir_all_quiet(&self.layout.pending_dir()) {
            self.log.error(&format!("Cleanup error: {}", e));
        }
    }

    fn record_version(&self, version: &str) {
        if let Err(e) = record_installed_version(&self.layout.settings_file(), version) {
            self.log
                .error(&format!("Could not record installed version {}: {}", version, e));
        }
    }

    fn record_failure(&self, version: &str, reason: &str) {
        if let Err(e) = self.ledger.record_failure(version, reason) {
            self.log
                .error(&format!("Could not update compatibility ledger: {:#}", e));
        }
    }

    fn log_failures(&self, action: &str, failures: &[String]) {
        for failure in failures {
            self.log.error(&format!("Could not {} {}", action, failure));
        }
    }

    fn abort(&self, version: &str, reason: String) -> InstallOutcome {
        self.indicator.progress(UpdatePhase::Error, &reason, None);
        self.record_failure(version, &reason);
        self.cleanup_pending();
        self.log.error(&format!("Update aborted: {}", reason));
        InstallOutcome::Aborted {
            version: version.to_string(),
            reason,
        }
    }

    fn complete(&self, from: String, to: String, script_only: bool) -> InstallOutcome {
        self.cleanup_pending();
        let kind = if script_only { "Script-only update" } else { "Update" };
        self.log
            .info(&format!("{} complete: {} -> {}", kind, from, to));
        self.indicator
            .progress(UpdatePhase::Complete, &format!("{} {} installed", kind, to), Some(100.0));
        InstallOutcome::Installed {
            from,
            to,
            script_only,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fsutil::atomic_write;
    use crate::layout::{READY_MARKER, SECRETS_FILE};
    use crate::platform::LogIndicator;
    use crate::scheduler::block_on;
    use crate::test_support::{bundle_manifest_json, MACHINE, OS};
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    fn device() -> DeviceIdentity {
        DeviceIdentity::new(MACHINE, OS.parse().unwrap())
    }

    /// A device running 1.0.0 with a backup in place
    fn device_root() -> (TempDir, DeviceLayout) {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("firmware")).unwrap();
        fs::write(root.join("manifest.json"), bundle_manifest_json("1.0.0")).unwrap();
        fs::write(root.join("firmware/wicid.bin"), b"firmware 1.0.0").unwrap();
        fs::write(root.join("old_module.bin"), b"stale").unwrap();
        fs::write(root.join(SECRETS_FILE), br#"{"ssid": "home"}"#).unwrap();
        let layout = DeviceLayout::new(root);
        let mut settings = Settings::default();
        settings.version = "1.0.0".to_string();
        settings.save(&layout.settings_file()).unwrap();
        (dir, layout)
    }

    fn stage(layout: &DeviceLayout, manifest: &str, files: &[(&str, &str)]) {
        let root = layout.pending_root();
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("manifest.json"), manifest).unwrap();
        for (name, data) in files {
            let path = root.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, data).unwrap();
        }
        atomic_write(&layout.ready_marker(), b"abc123").unwrap();
    }

    fn stage_full(layout: &DeviceLayout, version: &str) {
        stage(
            layout,
            &bundle_manifest_json(version),
            &[
                ("settings.json", format!(r#"{{"version": "{}"}}"#, version).as_str()),
                ("firmware/wicid.bin", format!("firmware {}", version).as_str()),
                ("secrets.json", "from bundle"),
            ],
        );
    }

    fn installer(layout: &DeviceLayout, hooks: HookRegistry) -> Installer {
        Installer::new(layout.clone(), device(), Rc::new(hooks), Rc::new(LogIndicator), 1)
    }

    fn process(installer: &Installer) -> InstallOutcome {
        block_on(&ManualClock::new(), installer.process_pending_update())
    }

    fn installed_version(root: &Path) -> String {
        Settings::load(&root.join("settings.json")).unwrap().version
    }

    #[test]
    fn test_no_pending_update() {
        let (_dir, layout) = device_root();
        assert_eq!(process(&installer(&layout, HookRegistry::new())), InstallOutcome::NoPendingUpdate);
    }

    #[test]
    fn test_missing_ready_marker_discards_staging() {
        let (_dir, layout) = device_root();
        stage_full(&layout, "1.1.0");
        fs::remove_file(layout.pending_dir().join(READY_MARKER)).unwrap();
        fs::create_dir_all(layout.staging_dir()).unwrap();

        assert_eq!(process(&installer(&layout, HookRegistry::new())), InstallOutcome::NoPendingUpdate);
        assert!(!layout.pending_dir().exists());
    }

    #[test]
    fn test_full_install() {
        let (_dir, layout) = device_root();
        stage_full(&layout, "1.1.0");

        let outcome = process(&installer(&layout, HookRegistry::new()));
        assert_eq!(
            outcome,
            InstallOutcome::Installed {
                from: "1.0.0".to_string(),
                to: "1.1.0".to_string(),
                script_only: false
            }
        );

        let root = layout.root();
        assert_eq!(fs::read(root.join("firmware/wicid.bin")).unwrap(), b"firmware 1.1.0");
        assert!(!root.join("old_module.bin").exists());
        assert_eq!(fs::read(root.join(SECRETS_FILE)).unwrap(), br#"{"ssid": "home"}"#);
        assert_eq!(installed_version(root), "1.1.0");
        assert!(!layout.pending_dir().exists());
        assert!(layout.integrity_file().is_file());
        assert_eq!(fs::read(root.join("recovery/firmware/wicid.bin")).unwrap(), b"firmware 1.1.0");

        let log = fs::read_to_string(layout.install_log()).unwrap();
        assert!(log.contains("Update complete: 1.0.0 -> 1.1.0"));
    }

    #[test]
    fn test_pre_install_failure_aborts() {
        let (_dir, layout) = device_root();
        let manifest = bundle_manifest_json("1.1.0").replace('}', r#", "has_pre_install_script": true}"#);
        stage(
            &layout,
            &manifest,
            &[
                ("settings.json", "{}"),
                ("firmware/wicid.bin", "new"),
                ("firmware_install_scripts/pre_install_v1.1.0.py", "marker"),
            ],
        );
        let mut hooks = HookRegistry::new();
        hooks.register_pre_install("1.1.0", |_| async { Ok(false) });

        let installer = installer(&layout, hooks);
        match process(&installer) {
            InstallOutcome::Aborted { version, reason } => {
                assert_eq!(version, "1.1.0");
                assert_eq!(reason, "pre_install script failed: pre_install script returned failure");
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        assert_eq!(fs::read(layout.root().join("firmware/wicid.bin")).unwrap(), b"firmware 1.0.0");
        assert!(layout.root().join("old_module.bin").exists());
        assert!(installer.ledger().is_blocked("1.1.0", 1));
        assert!(!layout.pending_dir().exists());
        let log = fs::read_to_string(layout.install_log()).unwrap();
        assert!(log.contains("Update aborted: pre_install script failed"));
    }

    #[test]
    fn test_declared_hook_without_file() {
        let (_dir, layout) = device_root();
        let manifest = bundle_manifest_json("1.1.0").replace('}', r#", "has_pre_install_script": true}"#);
        stage(&layout, &manifest, &[("settings.json", "{}"), ("firmware/wicid.bin", "new")]);

        let installer = installer(&layout, HookRegistry::new());
        match process(&installer) {
            InstallOutcome::Aborted { reason, .. } => assert!(reason.contains("Script not found"), "{}", reason),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_script_only_release_keeps_files() {
        let (_dir, layout) = device_root();
        let manifest = bundle_manifest_json("1.0.0-s1").replace('}', r#", "has_pre_install_script": true}"#);
        stage(
            &layout,
            &manifest,
            &[("firmware_install_scripts/pre_install_v1.0.0-s1.py", "marker")],
        );
        let ran = Rc::new(std::cell::Cell::new(false));
        let flag = ran.clone();
        let mut hooks = HookRegistry::new();
        hooks.register_pre_install("1.0.0-s1", move |ctx| {
            let flag = flag.clone();
            async move {
                ctx.log_message("fixing up settings");
                flag.set(true);
                Ok(true)
            }
        });

        let outcome = process(&installer(&layout, hooks));
        assert_eq!(
            outcome,
            InstallOutcome::Installed {
                from: "1.0.0".to_string(),
                to: "1.0.0-s1".to_string(),
                script_only: true
            }
        );
        assert!(ran.get());
        assert!(layout.root().join("old_module.bin").exists());
        assert_eq!(installed_version(layout.root()), "1.0.0-s1");
        assert!(!layout.pending_dir().exists());
    }

    #[test]
    fn test_incompatible_bundle_is_rejected() {
        let (_dir, layout) = device_root();
        let manifest = bundle_manifest_json("1.1.0").replace("circuitpython_10_0", "circuitpython_11_0");
        stage(&layout, &manifest, &[("settings.json", "{}"), ("firmware/wicid.bin", "new")]);

        let installer = installer(&layout, HookRegistry::new());
        match process(&installer) {
            InstallOutcome::Aborted { reason, .. } => assert!(reason.starts_with("Incompatible OS"), "{}", reason),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(layout.root().join("old_module.bin").exists());
    }

    #[test]
    fn test_incomplete_package_is_rejected() {
        let (_dir, layout) = device_root();
        stage(&layout, &bundle_manifest_json("1.1.0"), &[("settings.json", "{}")]);

        let installer = installer(&layout, HookRegistry::new());
        match process(&installer) {
            InstallOutcome::Aborted { reason, .. } => {
                assert_eq!(reason, "Incomplete package - missing 1 critical files")
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(fs::read(layout.root().join("firmware/wicid.bin")).unwrap(), b"firmware 1.0.0");
    }

    #[test]
    fn test_post_install_failure_is_recorded_but_install_completes() {
        let (_dir, layout) = device_root();
        let manifest = bundle_manifest_json("1.1.0").replace('}', r#", "has_post_install_script": true}"#);
        stage(
            &layout,
            &manifest,
            &[
                ("settings.json", "{}"),
                ("firmware/wicid.bin", "new"),
                ("firmware_install_scripts/post_install_v1.1.0.py", "marker"),
            ],
        );
        let mut hooks = HookRegistry::new();
        hooks.register_post_install("1.1.0", |_| async { Err(anyhow::anyhow!("migration failed")) });

        let installer = installer(&layout, hooks);
        assert!(matches!(process(&installer), InstallOutcome::Installed { .. }));
        let status = installer.ledger().status("1.1.0", 1);
        assert_eq!(
            status.reason.as_deref(),
            Some("post_install script failed: post_install script error: migration failed")
        );
    }
}
