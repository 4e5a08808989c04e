//! Release version strings
//!
//! `major[.minor[.patch]][-prerelease]`. Missing components count as zero.
//! A release sorts above any prerelease of the same numbers; two
//! prereleases compare as plain strings.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    Empty,
    InvalidComponent(String),
}

impl fmt::Display for VersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionError::Empty => write!(f, "empty version string"),
            VersionError::InvalidComponent(part) => {
                write!(f, "invalid version component '{}'", part)
            }
        }
    }
}

impl std::error::Error for VersionError {}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub prerelease: Option<String>,
}

impl Version {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            prerelease: None,
        }
    }

    /// Script-only releases carry a `-s` or `-s<N>` suffix
    pub fn is_script_only(&self) -> bool {
        match self.prerelease.as_deref() {
            Some(pre) => {
                let rest = match pre.strip_prefix('s') {
                    Some(rest) => rest,
                    None => return false,
                };
                rest.chars().all(|c| c.is_ascii_digit())
            }
            None => false,
        }
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(VersionError::Empty);
        }

        let (numbers, prerelease) = match s.split_once('-') {
            Some((numbers, pre)) => (numbers, Some(pre.to_string())),
            None => (s, None),
        };

        let mut parts = [0u32; 3];
        for (slot, part) in parts.iter_mut().zip(numbers.split('.')) {
            *slot = part
                .parse()
                .map_err(|_| VersionError::InvalidComponent(part.to_string()))?;
        }

        Ok(Self {
            major: parts[0],
            minor: parts[1],
            patch: parts[2],
            prerelease,
        })
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.prerelease {
            write!(f, "-{}", pre)?;
        }
        Ok(())
    }
}

/// Compare two version strings
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering, VersionError> {
    Ok(a.parse::<Version>()?.cmp(&b.parse::<Version>()?))
}

/// True when `candidate` is strictly newer than `installed`. Unparseable
/// versions are never newer.
pub fn is_newer(candidate: &str, installed: &str) -> bool {
    matches!(compare_versions(candidate, installed), Ok(Ordering::Greater))
}

/// Script-only check on a raw version string
pub fn is_script_only_version(version: &str) -> bool {
    version
        .parse::<Version>()
        .map(|v| v.is_script_only())
        .unwrap_or(false)
}
