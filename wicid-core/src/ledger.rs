//! Compatibility ledger
//!
//! Persists releases that failed to stage or install so the device stops
//! retrying them. Each entry counts attempts; a version is blocked once its
//! attempts reach the configured maximum. The file holds at most
//! [`MAX_LEDGER_ENTRIES`] versions.

use crate::fsutil::atomic_write;
use crate::version::Version;
use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const MAX_LEDGER_ENTRIES: usize = 10;

/// Attempts assigned to versions from the old list-only format so they stay blocked
pub const PERMANENT_BLOCK: u32 = u32::MAX;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub reason: String,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reason: Option<String>,
}

impl LedgerEntry {
    pub fn latest_reason(&self) -> &str {
        self.last_reason.as_deref().unwrap_or(&self.reason)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    releases: BTreeMap<String, LedgerEntry>,
    #[serde(default, skip_serializing)]
    versions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockStatus {
    pub blocked: bool,
    pub attempts: u32,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompatibilityLedger {
    path: PathBuf,
}

impl CompatibilityLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current entries. A missing file is empty; an unreadable one is logged and treated as empty.
    pub fn entries(&self) -> BTreeMap<String, LedgerEntry> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(e) => {
                warn!("Could not read ledger {}: {}", self.path.display(), e);
                return BTreeMap::new();
            }
        };

        let file: LedgerFile = match serde_json::from_slice(&bytes) {
            Ok(file) => file,
            Err(e) => {
                warn!("Ignoring corrupt ledger {}: {}", self.path.display(), e);
                return BTreeMap::new();
            }
        };

        let mut entries = file.releases;
        for version in file.versions {
            entries.entry(version).or_insert_with(|| LedgerEntry {
                reason: "Unknown (migrated)".to_string(),
                attempts: PERMANENT_BLOCK,
                last_reason: None,
            });
        }
        entries
    }

    pub fn status(&self, version: &str, max_attempts: u32) -> BlockStatus {
        match self.entries().get(version) {
            Some(entry) => BlockStatus {
                blocked: entry.attempts >= max_attempts,
                attempts: entry.attempts,
                reason: Some(entry.latest_reason().to_string()),
            },
            None => BlockStatus {
                blocked: false,
                attempts: 0,
                reason: None,
            },
        }
    }

    pub fn is_blocked(&self, version: &str, max_attempts: u32) -> bool {
        self.status(version, max_attempts).blocked
    }

    /// Record a failed attempt and return the new attempt count
    pub fn record_failure(&self, version: &str, reason: &str) -> Result<u32> {
        let mut entries = self.entries();

        let attempts = match entries.get_mut(version) {
            Some(entry) => {
                entry.attempts = entry.attempts.saturating_add(1);
                entry.last_reason = Some(reason.to_string());
                entry.attempts
            }
            None => {
                entries.insert(
                    version.to_string(),
                    LedgerEntry {
                        reason: reason.to_string(),
                        attempts: 1,
                        last_reason: None,
                    },
                );
                1
            }
        };

        while entries.len() > MAX_LEDGER_ENTRIES {
            match eviction_candidate(&entries, version) {
                Some(victim) => {
                    debug!("Ledger full, dropping {}", victim);
                    entries.remove(&victim);
                }
                None => break,
            }
        }

        let file = LedgerFile {
            releases: entries,
            versions: Vec::new(),
        };
        let json = serde_json::to_vec_pretty(&file)?;
        atomic_write(&self.path, &json)
            .with_context(|| format!("writing ledger {}", self.path.display()))?;

        warn!("Marked {} as incompatible (attempt {}): {}", version, attempts, reason);
        Ok(attempts)
    }
}

/// The entry with the fewest attempts, oldest version first, never the one just recorded
fn eviction_candidate(entries: &BTreeMap<String, LedgerEntry>, keep: &str) -> Option<String> {
    entries
        .iter()
        .filter(|(version, _)| version.as_str() != keep)
        .min_by(|(va, a), (vb, b)| {
            a.attempts.cmp(&b.attempts).then_with(|| {
                match (va.parse::<Version>(), vb.parse::<Version>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => va.cmp(vb),
                }
            })
        })
        .map(|(version, _)| version.clone())
}
