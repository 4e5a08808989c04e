use log::{Level, LevelFilter, Metadata, Record};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

static BOOT_TIME: OnceLock<Instant> = OnceLock::new();

#[allow(dead_code)]
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BRIGHT_RED: &str = "\x1b[91m";
    pub const BRIGHT_YELLOW: &str = "\x1b[93m";
    pub const BRIGHT_GREEN: &str = "\x1b[92m";
    pub const BRIGHT_BLUE: &str = "\x1b[94m";
    pub const GRAY: &str = "\x1b[90m";
}

/// Console logger that prints colored, uptime-stamped, module-tagged lines
struct EnhancedLogger;

/// Compact uptime stamp: `  5.042s`, ` 3m07s`, ` 2h15m`
fn format_uptime(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    if seconds < 60 {
        format!("{:>3}.{:03}s", seconds, elapsed.subsec_millis())
    } else if seconds < 3600 {
        format!("{:>2}m{:02}s", seconds / 60, seconds % 60)
    } else {
        format!("{:>2}h{:02}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

/// Last path segment, truncated to the column width
fn module_tag(module_path: Option<&str>) -> &str {
    let module = module_path
        .unwrap_or("unknown")
        .rsplit("::")
        .next()
        .unwrap_or("unknown");
    match module.char_indices().nth(12) {
        Some((end, _)) => &module[..end],
        None => module,
    }
}

impl log::Log for EnhancedLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let boot_time = BOOT_TIME.get_or_init(Instant::now);
        let ts_compact = format_uptime(boot_time.elapsed());

        let (color, level_char) = match record.level() {
            Level::Error => (colors::BRIGHT_RED, 'E'),
            Level::Warn => (colors::BRIGHT_YELLOW, 'W'),
            Level::Info => (colors::BRIGHT_GREEN, 'I'),
            Level::Debug => (colors::BRIGHT_BLUE, 'D'),
            Level::Trace => (colors::GRAY, 'T'),
        };

        // ANSI colors are fine over serial
        println!(
            "{}{} [{}] {:>12} | {}{}",
            color,
            ts_compact,
            level_char,
            module_tag(record.module_path()),
            record.args(),
            colors::RESET
        );
    }

    fn flush(&self) {}
}

static LOGGER: EnhancedLogger = EnhancedLogger;

/// Initialize the enhanced logger with colors and timestamps
pub fn init_logger() -> Result<(), log::SetLoggerError> {
    let _ = BOOT_TIME.set(Instant::now());
    log::set_logger(&LOGGER)?;
    log::set_max_level(LevelFilter::Debug);

    println!("{}┌─────────────────────────────────────────┐{}", colors::BRIGHT_GREEN, colors::RESET);
    println!("{}│        WICID Weather Indicator          │{}", colors::BRIGHT_GREEN, colors::RESET);
    println!(
        "{}│   Levels: {}E{}rror {}W{}arn {}I{}nfo {}D{}ebug {}T{}race   │{}",
        colors::BRIGHT_GREEN,
        colors::BRIGHT_RED,
        colors::BRIGHT_GREEN,
        colors::BRIGHT_YELLOW,
        colors::BRIGHT_GREEN,
        colors::BRIGHT_GREEN,
        colors::BRIGHT_GREEN,
        colors::BRIGHT_BLUE,
        colors::BRIGHT_GREEN,
        colors::GRAY,
        colors::BRIGHT_GREEN,
        colors::RESET
    );
    println!("{}└─────────────────────────────────────────┘{}", colors::BRIGHT_GREEN, colors::RESET);
    Ok(())
}

/// Parse and set log level from a string; returns true if applied
pub fn set_max_level_from_str(level: &str) -> bool {
    let lf = match level.trim().to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => return false,
    };
    log::set_max_level(lf);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::from_millis(5042)), "  5.042s");
        assert_eq!(format_uptime(Duration::from_secs(187)), " 3m07s");
        assert_eq!(format_uptime(Duration::from_secs(2 * 3600 + 15 * 60)), " 2h15m");
    }

    #[test]
    fn test_module_tag() {
        assert_eq!(module_tag(Some("wicid_core::update::resolve")), "resolve");
        assert_eq!(module_tag(Some("wicid::averyveryverylongname")), "averyveryver");
        assert_eq!(module_tag(None), "unknown");
    }

    #[test]
    fn test_level_from_str() {
        assert!(set_max_level_from_str("Warning"));
        assert_eq!(log::max_level(), LevelFilter::Warn);
        assert!(!set_max_level_from_str("loud"));
        assert_eq!(log::max_level(), LevelFilter::Warn);
    }
}
