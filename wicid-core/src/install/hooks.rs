// Install lifecycle hooks.
//
// Hooks are compiled into the firmware and registered per target version.
// A bundle declares a hook in its manifest and ships a marker file named
// `<kind>_v<version>.py` under `firmware_install_scripts/`; the marker only
// locates the hook, its contents are never executed.

use crate::install_log::InstallLog;
use crate::layout::INSTALL_SCRIPTS_DIR;
use crate::scheduler::yield_control;
use log::debug;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    PreInstall,
    PostInstall,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::PreInstall => "pre_install",
            HookKind::PostInstall => "post_install",
        }
    }

    /// `pre_install_v1.2.0.py`. The version is used verbatim, prerelease included.
    pub fn file_name(&self, version: &str) -> String {
        format!("{}_v{}.py", self.as_str(), version)
    }

    /// Marker path beneath `base`
    pub fn script_path(&self, base: &Path, version: &str) -> PathBuf {
        base.join(INSTALL_SCRIPTS_DIR).join(self.file_name(version))
    }
}

/// What a hook gets to work with.
///
/// Pre-install hooks run before any file is touched and see the staged
/// bundle (`pending_root`, `pending_dir`). Post-install hooks run from the
/// freshly installed root.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub kind: HookKind,
    pub version: String,
    pub device_root: PathBuf,
    pub pending_root: PathBuf,
    pub pending_dir: PathBuf,
    log: InstallLog,
}

impl HookContext {
    /// Append a line to the install log
    pub fn log_message(&self, message: &str) {
        self.log.write_line(message);
    }
}

pub type HookFuture = Pin<Box<dyn Future<Output = anyhow::Result<bool>>>>;
type HookFn = Rc<dyn Fn(HookContext) -> HookFuture>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// Not declared by the bundle
    Skipped,
    Succeeded,
    Failed(String),
}

impl HookOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, HookOutcome::Failed(_))
    }
}

/// Version-keyed table of compiled hooks
#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: HashMap<(HookKind, String), HookFn>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook for one exact target version. A hook returning
    /// `Ok(true)` succeeded; `Ok(false)` reports failure.
    pub fn register<F, Fut>(&mut self, kind: HookKind, version: &str, hook: F)
    where
        F: Fn(HookContext) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + 'static,
    {
        let boxed: HookFn = Rc::new(move |ctx: HookContext| -> HookFuture { Box::pin(hook(ctx)) });
        if self.hooks.insert((kind, version.to_string()), boxed).is_some() {
            log::warn!("Replaced {} hook for {}", kind.as_str(), version);
        }
    }

    pub fn register_pre_install<F, Fut>(&mut self, version: &str, hook: F)
    where
        F: Fn(HookContext) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + 'static,
    {
        self.register(HookKind::PreInstall, version, hook);
    }

    pub fn register_post_install<F, Fut>(&mut self, version: &str, hook: F)
    where
        F: Fn(HookContext) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + 'static,
    {
        self.register(HookKind::PostInstall, version, hook);
    }

    pub fn contains(&self, kind: HookKind, version: &str) -> bool {
        self.hooks.contains_key(&(kind, version.to_string()))
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run one hook if the bundle declared it.
    ///
    /// Pre-install markers are looked up in the staged bundle, post-install
    /// markers in the live root.
    pub async fn run(
        &self,
        kind: HookKind,
        declared: bool,
        version: &str,
        device_root: &Path,
        pending_root: &Path,
        pending_dir: &Path,
        log: &InstallLog,
    ) -> HookOutcome {
        if !declared {
            debug!("No {} hook declared for {}", kind.as_str(), version);
            return HookOutcome::Skipped;
        }

        let base = match kind {
            HookKind::PreInstall => pending_root,
            HookKind::PostInstall => device_root,
        };
        let path = kind.script_path(base, version);
        log.info(&format!("Executing {} script v{}", kind.as_str(), version));

        if !path.is_file() {
            return fail(log, format!("Script not found: {}", path.display()));
        }

        let hook = match self.hooks.get(&(kind, version.to_string())) {
            Some(hook) => hook.clone(),
            None => {
                return fail(
                    log,
                    format!("Script missing main() function: {}", path.display()),
                )
            }
        };

        let ctx = HookContext {
            kind,
            version: version.to_string(),
            device_root: device_root.to_path_buf(),
            pending_root: pending_root.to_path_buf(),
            pending_dir: pending_dir.to_path_buf(),
            log: log.clone(),
        };

        yield_control().await;
        let result = hook(ctx).await;
        yield_control().await;

        match result {
            Ok(true) => {
                log.info(&format!("{} script completed successfully", kind.as_str()));
                HookOutcome::Succeeded
            }
            Ok(false) => fail(log, format!("{} script returned failure", kind.as_str())),
            Err(e) => fail(log, format!("{} script error: {:#}", kind.as_str(), e)),
        }
    }
}

fn fail(log: &InstallLog, message: String) -> HookOutcome {
    log.error(&message);
    HookOutcome::Failed(message)
}
