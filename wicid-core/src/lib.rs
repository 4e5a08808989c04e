//! WICID Core - Hardware-independent runtime for the WICID weather indicator
//!
//! This crate contains the cooperative scheduler and the over-the-air update
//! pipeline (release resolution, bundle staging, boot-time install and
//! recovery) so they can be tested on the host without device hardware.
//! The firmware supplies the platform seams in [`platform`].

pub mod clock;
pub mod config;
pub mod fsutil;
pub mod identity;
pub mod install;
pub mod install_log;
pub mod layout;
pub mod ledger;
pub mod manifest;
pub mod platform;
pub mod scheduler;
pub mod system;
pub mod update;
pub mod version;

#[cfg(test)]
mod test_support;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, Settings};
pub use identity::{DeviceIdentity, OsIdentity};
pub use install::{BootOutcome, BootPipeline, HookRegistry, InstallOutcome, Installer};
pub use layout::DeviceLayout;
pub use ledger::CompatibilityLedger;
pub use scheduler::{block_on, sleep, yield_control, Scheduler, SchedulerError, TaskError, TaskHandle};
pub use system::{SystemConfig, SystemManager};
pub use update::{ResolvedRelease, UpdateConfig, UpdateError, UpdateManager};
