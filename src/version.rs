// Centralized version information

// Cargo package version of the firmware runtime
pub const CARGO_VERSION: &str = env!("CARGO_PKG_VERSION");

// Runtime version plus the installed release from settings.json
pub fn full_version(installed: &str) -> String {
    format!("v{} (runtime {})", installed, CARGO_VERSION)
}
