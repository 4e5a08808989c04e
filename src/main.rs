use anyhow::Result;
use log::{error, info, warn};
use std::rc::Rc;
use std::time::Duration;

use wicid_core::platform::LogIndicator;
use wicid_core::{
    BootPipeline, DeviceLayout, HookRegistry, Installer, Scheduler, Settings, SystemClock, SystemConfig,
    SystemManager, TaskError, UpdateConfig, UpdateManager,
};

// Generate ESP-IDF app descriptor
#[cfg(target_os = "espidf")]
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

mod logging;
mod platform;
mod version;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);
const BOOT_PRIORITY: u8 = 0;
const HEARTBEAT_PRIORITY: u8 = 200;

fn main() -> Result<()> {
    #[cfg(target_os = "espidf")]
    esp_idf_svc::sys::link_patches();

    if let Err(e) = logging::init_logger() {
        eprintln!("Logger already installed: {}", e);
    }
    if let Ok(level) = std::env::var("WICID_LOG") {
        if !logging::set_max_level_from_str(&level) {
            warn!("Unknown log level '{}'", level);
        }
    }

    let root = platform::mount_root()?;
    let layout = DeviceLayout::new(&root);
    let settings = Settings::load_or_default(&layout.settings_file());
    info!("WICID {}", version::full_version(&settings.version));
    info!("Device root {}, {} channel", root.display(), layout.channel());

    let board = platform::init(&root, &settings)?;
    info!("Running as {}", board.identity.user_agent(&settings.version));

    let scheduler = Scheduler::new(Rc::new(SystemClock::new()));

    // Install hooks for specific releases are registered here
    let hooks = Rc::new(HookRegistry::new());
    let installer = Installer::new(
        layout.clone(),
        board.identity.clone(),
        hooks,
        Rc::new(LogIndicator),
        settings.max_install_attempts,
    );
    let pipeline = Rc::new(BootPipeline::new(installer));

    let updates = UpdateManager::new(
        layout,
        board.identity.clone(),
        board.http.clone(),
        Rc::new(LogIndicator),
        board.device.clone(),
        UpdateConfig::from_settings(&settings),
    )?;
    let system = SystemManager::new(
        scheduler.clone(),
        Rc::new(updates),
        board.device.clone(),
        SystemConfig::from_settings(&settings),
    )?;

    // Boot pipeline first; the application only starts on a normal boot
    {
        let pipeline = pipeline.clone();
        let system = system.clone();
        let device = board.device.clone();
        scheduler.schedule_now(
            move || {
                let pipeline = pipeline.clone();
                let system = system.clone();
                let device = device.clone();
                async move {
                    let outcome = pipeline.run().await;
                    if outcome.apply(device.as_ref()) {
                        system.start();
                        Ok(())
                    } else {
                        Err(TaskError::fatal(anyhow::anyhow!("boot halted: {:?}", outcome)))
                    }
                }
            },
            BOOT_PRIORITY,
            "boot-pipeline",
        );
    }

    {
        let system = Rc::downgrade(&system);
        let sched = scheduler.clone();
        scheduler.schedule_periodic(
            move || {
                let system = system.clone();
                let sched = sched.clone();
                async move {
                    if let Some(system) = system.upgrade() {
                        info!("{}", system.summary());
                    }
                    log::debug!("{}", sched.snapshot());
                    Ok::<(), TaskError>(())
                }
            },
            HEARTBEAT_INTERVAL,
            HEARTBEAT_PRIORITY,
            "heartbeat",
        );
    }

    if let Err(e) = scheduler.run_forever() {
        error!("Scheduler stopped: {}", e);
        warn!("{}", scheduler.snapshot());
        board.device.hard_reset(&format!("Fatal scheduler error: {}", e));
    }
    Ok(())
}
