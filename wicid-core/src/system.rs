//! System manager
//!
//! Owns the two long-running housekeeping jobs: the update check chain
//! (first run after an initial delay, then on the update manager's cadence)
//! and the optional uptime watchdog that reboots the device every N hours.

use crate::clock::format_duration;
use crate::config::{ConfigError, Settings};
use crate::platform::DeviceControl;
use crate::scheduler::{sleep, Scheduler, TaskError, TaskHandle};
use crate::update::UpdateManager;
use log::{debug, info, warn};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

/// How often the watchdog compares uptime against its deadline
pub const WATCHDOG_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Pause between announcing a reboot and performing it, so logs can flush
pub const REBOOT_GRACE: Duration = Duration::from_secs(1);

const WATCHDOG_PRIORITY: u8 = 10;
const UPDATE_CHECK_PRIORITY: u8 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemConfig {
    pub initial_update_delay: Duration,
    /// `None` disables the watchdog
    pub reboot_interval: Option<Duration>,
}

impl SystemConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            initial_update_delay: settings.initial_update_delay(),
            reboot_interval: settings.periodic_reboot_interval(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reboot_interval == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid(
                "reboot interval must be non-zero; use None to disable".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SystemState {
    update_task: Option<TaskHandle>,
    watchdog_task: Option<TaskHandle>,
    next_update_check: Option<Duration>,
    reboot_deadline: Option<Duration>,
    reboot_requested: bool,
}

pub struct SystemManager {
    scheduler: Scheduler,
    updates: Rc<UpdateManager>,
    device: Rc<dyn DeviceControl>,
    boot_time: Duration,
    config: RefCell<SystemConfig>,
    state: RefCell<SystemState>,
}

impl SystemManager {
    pub fn new(
        scheduler: Scheduler,
        updates: Rc<UpdateManager>,
        device: Rc<dyn DeviceControl>,
        config: SystemConfig,
    ) -> Result<Rc<Self>, ConfigError> {
        config.validate()?;
        let boot_time = scheduler.now();
        Ok(Rc::new(Self {
            scheduler,
            updates,
            device,
            boot_time,
            config: RefCell::new(config),
            state: RefCell::new(SystemState::default()),
        }))
    }

    /// Schedule the first update check and arm the watchdog
    pub fn start(self: &Rc<Self>) {
        let delay = self.config.borrow().initial_update_delay;
        info!("System manager started, first update check in {}", format_duration(delay));
        self.schedule_update_check(delay);
        self.arm_watchdog();
    }

    /// Apply new settings. The update chain keeps its schedule; the watchdog is re-armed.
    pub fn reconfigure(self: &Rc<Self>, config: SystemConfig) -> Result<(), ConfigError> {
        config.validate()?;
        *self.config.borrow_mut() = config;
        self.arm_watchdog();
        Ok(())
    }

    pub fn config(&self) -> SystemConfig {
        self.config.borrow().clone()
    }

    pub fn uptime(&self) -> Duration {
        self.scheduler.now().saturating_sub(self.boot_time)
    }

    /// Time until the next update check, if one is scheduled
    pub fn next_update_check(&self) -> Option<Duration> {
        self.state
            .borrow()
            .next_update_check
            .map(|at| at.saturating_sub(self.scheduler.now()))
    }

    /// Uptime at which the watchdog reboots the device
    pub fn reboot_deadline(&self) -> Option<Duration> {
        self.state
            .borrow()
            .reboot_deadline
            .map(|at| at.saturating_sub(self.boot_time))
    }

    pub fn update_task(&self) -> Option<TaskHandle> {
        self.state.borrow().update_task
    }

    pub fn watchdog_task(&self) -> Option<TaskHandle> {
        self.state.borrow().watchdog_task
    }

    /// One-line status for heartbeat logging
    pub fn summary(&self) -> String {
        let next_check = match self.next_update_check() {
            Some(delay) => format!("next update check in {}", format_duration(delay)),
            None => "no update check scheduled".to_string(),
        };
        let reboot = match self.reboot_deadline() {
            Some(at) => format!(
                "reboot in {}",
                format_duration(at.saturating_sub(self.uptime()))
            ),
            None => "periodic reboot disabled".to_string(),
        };
        format!("Uptime {}, {}, {}", format_duration(self.uptime()), next_check, reboot)
    }

    fn schedule_update_check(self: &Rc<Self>, delay: Duration) {
        let weak = Rc::downgrade(self);
        let handle = self.scheduler.schedule_once(
            move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(manager) => manager.run_update_check().await,
                        None => Ok(()),
                    }
                }
            },
            delay,
            UPDATE_CHECK_PRIORITY,
            "update-check",
        );

        let mut state = self.state.borrow_mut();
        state.update_task = Some(handle);
        state.next_update_check = Some(self.scheduler.now() + delay);
    }

    async fn run_update_check(self: Rc<Self>) -> Result<(), TaskError> {
        let result = self.updates.check_download_and_reboot(REBOOT_GRACE).await;

        // Reschedule first so a failed check never ends the chain
        let delay = self.updates.next_check_delay();
        self.schedule_update_check(delay);

        match result {
            Ok(true) => info!("Update staged, reboot requested"),
            Ok(false) => debug!("Next update check in {}", format_duration(delay)),
            Err(e) => {
                warn!("Update check failed: {}, retrying in {}", e, format_duration(delay));
                return Err(TaskError::non_fatal(e));
            }
        }
        Ok(())
    }

    fn arm_watchdog(self: &Rc<Self>) {
        if let Some(old) = self.state.borrow_mut().watchdog_task.take() {
            self.scheduler.cancel(old);
        }

        let Some(interval) = self.config.borrow().reboot_interval else {
            info!("Periodic reboot disabled");
            self.state.borrow_mut().reboot_deadline = None;
            return;
        };

        let deadline = self.boot_time + interval;
        info!("Periodic reboot after {} of uptime", format_duration(interval));

        let weak: Weak<Self> = Rc::downgrade(self);
        let handle = self.scheduler.schedule_recurring(
            move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(manager) => manager.check_reboot_deadline().await,
                        None => Ok(()),
                    }
                }
            },
            WATCHDOG_CHECK_INTERVAL,
            WATCHDOG_PRIORITY,
            "reboot-watchdog",
        );

        let mut state = self.state.borrow_mut();
        state.reboot_deadline = Some(deadline);
        state.watchdog_task = Some(handle);
    }

    async fn check_reboot_deadline(self: Rc<Self>) -> Result<(), TaskError> {
        let now = self.scheduler.now();
        {
            let mut state = self.state.borrow_mut();
            match state.reboot_deadline {
                Some(deadline) if now >= deadline && !state.reboot_requested => {
                    state.reboot_requested = true;
                }
                _ => return Ok(()),
            }
        }

        info!(
            "Uptime {} reached the periodic reboot interval, rebooting",
            format_duration(self.uptime())
        );
        sleep(REBOOT_GRACE).await;
        self.device.hard_reset("Periodic reboot");
        Ok(())
    }
}
