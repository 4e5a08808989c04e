//! Picks the single best release for this device from a release manifest

use crate::identity::DeviceIdentity;
use crate::ledger::CompatibilityLedger;
use crate::manifest::{Channel, ReleaseEntry, ReleaseGroup, ReleaseManifest};
use crate::version::Version;
use log::{debug, info};
use std::cmp::Ordering;
use std::fmt;

/// Why a release entry was passed over
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ineligible {
    InvalidVersion(String),
    NotNewer,
    Blocked { attempts: u32, reason: String },
    PriorVersionTooOld { required: String },
    MissingChecksum,
}

impl fmt::Display for Ineligible {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ineligible::InvalidVersion(v) => write!(f, "invalid version '{}'", v),
            Ineligible::NotNewer => write!(f, "not newer than installed"),
            Ineligible::Blocked { attempts, reason } => {
                write!(f, "blocked after {} attempt(s): {}", attempts, reason)
            }
            Ineligible::PriorVersionTooOld { required } => {
                write!(f, "requires installed version {} or later", required)
            }
            Ineligible::MissingChecksum => write!(f, "no sha256 published"),
        }
    }
}

/// A release chosen for installation
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRelease {
    pub version: String,
    pub zip_url: String,
    pub sha256: Option<String>,
    pub release_notes: String,
    pub release_date: Option<String>,
    pub release_type: Channel,
    pub from_archive: bool,
    pub target_machine_types: Vec<String>,
    pub target_operating_systems: Vec<String>,
}

impl ResolvedRelease {
    fn new(entry: &ReleaseEntry, release_type: Channel, from_archive: bool, group: &ReleaseGroup) -> Self {
        Self {
            version: entry.version.clone(),
            zip_url: entry.zip_url.clone(),
            sha256: entry.sha256.clone().filter(|s| !s.trim().is_empty()),
            release_notes: entry.release_notes.clone(),
            release_date: entry.release_date.clone(),
            release_type,
            from_archive,
            target_machine_types: group.target_machine_types.clone(),
            target_operating_systems: group.target_operating_systems.clone(),
        }
    }
}

pub struct Resolver<'a> {
    pub device: &'a DeviceIdentity,
    pub installed_version: &'a str,
    pub channel: Channel,
    pub max_attempts: u32,
    pub require_checksum: bool,
    pub ledger: &'a CompatibilityLedger,
}

struct Candidate<'m> {
    entry: &'m ReleaseEntry,
    version: Version,
    release_type: Channel,
    group: &'m ReleaseGroup,
}

impl<'a> Resolver<'a> {
    pub fn resolve(&self, manifest: &ReleaseManifest) -> Option<ResolvedRelease> {
        if manifest.releases.is_empty() {
            debug!("Release manifest lists no releases");
            return None;
        }

        let groups: Vec<&ReleaseGroup> = manifest
            .releases
            .iter()
            .filter(|g| {
                self.device.matches_machine(&g.target_machine_types)
                    && self.device.os.matches_any(&g.target_operating_systems)
            })
            .collect();

        if groups.is_empty() {
            info!(
                "No releases target {} on {}",
                self.device.machine_type, self.device.os
            );
            return None;
        }

        if let Some(current) = self.best_current(&groups) {
            info!(
                "Selected {} release {}",
                current.release_type, current.entry.version
            );
            return Some(ResolvedRelease::new(current.entry, current.release_type, false, current.group));
        }

        let archived = self.best_archived(&groups)?;
        info!(
            "Selected archived {} release {}",
            archived.release_type, archived.entry.version
        );
        Some(ResolvedRelease::new(archived.entry, archived.release_type, true, archived.group))
    }

    /// Check one entry against the installed version, ledger and checksum policy
    pub fn eligibility(&self, entry: &ReleaseEntry) -> Result<Version, Ineligible> {
        let version = entry
            .version
            .parse::<Version>()
            .map_err(|_| Ineligible::InvalidVersion(entry.version.clone()))?;
        let installed = self
            .installed_version
            .parse::<Version>()
            .map_err(|_| Ineligible::InvalidVersion(self.installed_version.to_string()))?;

        if version <= installed {
            return Err(Ineligible::NotNewer);
        }

        let status = self.ledger.status(&entry.version, self.max_attempts);
        if status.blocked {
            return Err(Ineligible::Blocked {
                attempts: status.attempts,
                reason: status.reason.unwrap_or_default(),
            });
        }

        if let Some(required) = entry.required_prior_version() {
            match required.parse::<Version>() {
                Ok(min) if installed >= min => {}
                _ => {
                    return Err(Ineligible::PriorVersionTooOld {
                        required: required.to_string(),
                    })
                }
            }
        }

        if self.require_checksum && entry.sha256.as_deref().map_or(true, |s| s.trim().is_empty()) {
            return Err(Ineligible::MissingChecksum);
        }

        Ok(version)
    }

    fn check<'m>(&self, entry: &'m ReleaseEntry, release_type: Channel, group: &'m ReleaseGroup) -> Option<Candidate<'m>> {
        match self.eligibility(entry) {
            Ok(version) => Some(Candidate {
                entry,
                version,
                release_type,
                group,
            }),
            Err(why) => {
                debug!("Skipping {} {}: {}", release_type, entry.version, why);
                None
            }
        }
    }

    /// The channel's current entry. Development devices weigh both current
    /// entries and take the newer, production on a tie.
    ///
    /// Every group that targets this device is considered, not just the first
    /// one in manifest order: the newest eligible entry across all of them wins,
    /// and groups listed earlier win ties.
    fn best_current<'m>(&self, groups: &[&'m ReleaseGroup]) -> Option<Candidate<'m>> {
        let channels: &[Channel] = match self.channel {
            Channel::Production => &[Channel::Production],
            Channel::Development => &[Channel::Production, Channel::Development],
        };

        let mut best: Option<Candidate<'m>> = None;
        for group in groups {
            for &channel in channels {
                let Some(entry) = group.current(channel) else {
                    continue;
                };
                if let Some(candidate) = self.check(entry, channel, group) {
                    // Strictly newer replaces, so earlier production entries win ties
                    if best.as_ref().map_or(true, |b| candidate.version > b.version) {
                        best = Some(candidate);
                    }
                }
            }
        }
        best
    }

    fn best_archived<'m>(&self, groups: &[&'m ReleaseGroup]) -> Option<Candidate<'m>> {
        let mut best: Option<Candidate<'m>> = None;
        for group in groups {
            for archived in &group.archive {
                if !self.channel.accepts(archived.release_type) {
                    continue;
                }
                if let Some(candidate) = self.check(&archived.release, archived.release_type, group) {
                    if best.as_ref().map_or(true, |b| archive_order(&candidate, b) == Ordering::Greater) {
                        best = Some(candidate);
                    }
                }
            }
        }
        best
    }
}

/// Version first; equal versions go to the later release date, then production
fn archive_order(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    a.version
        .cmp(&b.version)
        .then_with(|| a.entry.release_date.cmp(&b.entry.release_date))
        .then_with(|| match (a.release_type, b.release_type) {
            (Channel::Production, Channel::Development) => Ordering::Greater,
            (Channel::Development, Channel::Production) => Ordering::Less,
            _ => Ordering::Equal,
        })
}
