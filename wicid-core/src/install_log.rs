//! Persistent install log (`boot_log.txt`)
//!
//! Every line also goes through the `log` facade. Writes to the file are
//! best-effort: the first failure is reported once, later ones are dropped.

use log::{error, info, warn, Level};
use std::cell::Cell;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

#[derive(Debug, Clone)]
pub struct InstallLog {
    path: PathBuf,
    write_failed: Rc<Cell<bool>>,
}

impl InstallLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_failed: Rc::new(Cell::new(false)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self, message: &str) {
        info!(target: "wicid::install", "{}", message);
        self.append(Level::Info, message);
    }

    pub fn warn(&self, message: &str) {
        warn!(target: "wicid::install", "{}", message);
        self.append(Level::Warn, message);
    }

    pub fn error(&self, message: &str) {
        error!(target: "wicid::install", "{}", message);
        self.append(Level::Error, message);
    }

    /// Raw line for install hooks, written without a level tag
    pub fn write_line(&self, message: &str) {
        info!(target: "wicid::install::hook", "{}", message);
        self.append_raw(message);
    }

    fn append(&self, level: Level, message: &str) {
        self.append_raw(&format!("[{}] {}", level, message));
    }

    fn append_raw(&self, line: &str) {
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{}", line));

        if let Err(e) = result {
            if !self.write_failed.replace(true) {
                warn!("Install log {} unavailable: {}", self.path.display(), e);
            }
        }
    }
}
