//! Device self-identification used for release targeting

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// OS identity in the `<name>_<major>_<minor>[_<patch>]` form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsIdentity {
    pub name: String,
    pub major: u32,
    pub minor: u32,
    pub patch: Option<u32>,
}

impl OsIdentity {
    pub fn new(name: &str, major: u32, minor: u32, patch: Option<u32>) -> Self {
        Self {
            name: name.to_string(),
            major,
            minor,
            patch,
        }
    }

    /// Same OS name and this major.minor at least the target's. Patch is ignored.
    pub fn satisfies(&self, target: &OsIdentity) -> bool {
        self.name == target.name && (self.major, self.minor) >= (target.major, target.minor)
    }

    /// True if any parseable target string is satisfied
    pub fn matches_any<S: AsRef<str>>(&self, targets: &[S]) -> bool {
        targets.iter().any(|t| match t.as_ref().parse::<OsIdentity>() {
            Ok(target) => self.satisfies(&target),
            Err(_) => {
                log::debug!("Ignoring malformed OS target '{}'", t.as_ref());
                false
            }
        })
    }
}

impl FromStr for OsIdentity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('_');
        let name = match parts.next() {
            Some(name) if !name.is_empty() => name,
            _ => return Err(format!("missing OS name in '{}'", s)),
        };
        let number = |part: Option<&str>| -> Result<Option<u32>, String> {
            part.map(|p| p.parse::<u32>().map_err(|_| format!("bad OS version part '{}' in '{}'", p, s)))
                .transpose()
        };

        let major = number(parts.next())?.ok_or_else(|| format!("missing OS major version in '{}'", s))?;
        let minor = number(parts.next())?.unwrap_or(0);
        let patch = number(parts.next())?;

        Ok(Self {
            name: name.to_string(),
            major,
            minor,
            patch,
        })
    }
}

impl fmt::Display for OsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.name, self.major, self.minor)?;
        if let Some(patch) = self.patch {
            write!(f, "_{}", patch)?;
        }
        Ok(())
    }
}

impl Serialize for OsIdentity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for OsIdentity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// What the device reports about itself when checking for releases
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Opaque board identifier, matched exactly
    pub machine_type: String,
    pub os: OsIdentity,
}

impl DeviceIdentity {
    pub fn new(machine_type: &str, os: OsIdentity) -> Self {
        Self {
            machine_type: machine_type.to_string(),
            os,
        }
    }

    pub fn matches_machine<S: AsRef<str>>(&self, targets: &[S]) -> bool {
        targets.iter().any(|t| t.as_ref() == self.machine_type)
    }

    /// `WICID/<version> (<machine>; <os>)`
    pub fn user_agent(&self, installed_version: &str) -> String {
        format!("WICID/{} ({}; {})", installed_version, self.machine_type, self.os)
    }
}
