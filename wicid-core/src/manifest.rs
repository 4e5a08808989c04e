//! Release manifest and bundle manifest documents

use crate::version::is_script_only_version;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Production,
    Development,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Production => "production",
            Channel::Development => "development",
        }
    }

    /// Development devices also accept production releases
    pub fn accepts(&self, release_type: Channel) -> bool {
        match self {
            Channel::Production => release_type == Channel::Production,
            Channel::Development => true,
        }
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" => Ok(Channel::Production),
            "development" => Ok(Channel::Development),
            other => Err(format!("unknown release type '{}'", other)),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level document served at the manifest URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseManifest {
    #[serde(default)]
    pub schema_version: String,
    #[serde(default)]
    pub last_updated: String,
    #[serde(default)]
    pub releases: Vec<ReleaseGroup>,
}

impl ReleaseManifest {
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Releases for one family of machine types and operating systems
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseGroup {
    #[serde(default)]
    pub target_machine_types: Vec<String>,
    #[serde(default)]
    pub target_operating_systems: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub production: Option<ReleaseEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub development: Option<ReleaseEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub archive: Vec<ArchiveEntry>,
}

impl ReleaseGroup {
    pub fn current(&self, channel: Channel) -> Option<&ReleaseEntry> {
        match channel {
            Channel::Production => self.production.as_ref(),
            Channel::Development => self.development.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseEntry {
    pub version: String,
    #[serde(default)]
    pub release_notes: String,
    pub zip_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// ISO8601 timestamp, only consulted to break ties between equal versions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_prior_version: Option<String>,
}

impl ReleaseEntry {
    /// The minimum prior version, ignoring blank values
    pub fn required_prior_version(&self) -> Option<&str> {
        self.minimum_prior_version
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    #[serde(flatten)]
    pub release: ReleaseEntry,
    pub release_type: Channel,
}

/// `manifest.json` shipped inside a bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleManifest {
    #[serde(default)]
    pub schema_version: String,
    pub version: String,
    #[serde(default)]
    pub target_machine_types: Vec<String>,
    #[serde(default)]
    pub target_operating_systems: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_type: Option<Channel>,
    #[serde(default)]
    pub release_notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,
    #[serde(default)]
    pub has_pre_install_script: bool,
    #[serde(default)]
    pub has_post_install_script: bool,
    #[serde(default)]
    pub script_only_release: bool,
}

impl BundleManifest {
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Flagged in the manifest or implied by an `-s`/`-s<N>` version suffix
    pub fn is_script_only(&self) -> bool {
        self.script_only_release || is_script_only_version(&self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "schema_version": "1.0.0",
        "last_updated": "2025-03-01T12:00:00Z",
        "releases": [{
            "target_machine_types": ["Adafruit QT Py ESP32S3 4MB 2MB PSRAM"],
            "target_operating_systems": ["circuitpython_10_0"],
            "production": {
                "version": "1.2.0",
                "release_notes": "Bug fixes",
                "zip_url": "https://example.com/wicid-1.2.0.zip",
                "sha256": "abc123",
                "release_date": "2025-03-01T12:00:00Z"
            },
            "archive": [{
                "version": "1.1.0",
                "zip_url": "https://example.com/wicid-1.1.0.zip",
                "release_type": "development",
                "minimum_prior_version": ""
            }]
        }]
    }"#;

    #[test]
    fn test_release_manifest_parsing() {
        let manifest = ReleaseManifest::from_json(MANIFEST.as_bytes()).unwrap();
        assert_eq!(manifest.releases.len(), 1);

        let group = &manifest.releases[0];
        assert_eq!(group.current(Channel::Production).unwrap().version, "1.2.0");
        assert!(group.current(Channel::Development).is_none());
        assert_eq!(group.archive[0].release_type, Channel::Development);
        assert_eq!(group.archive[0].release.version, "1.1.0");
        assert_eq!(group.archive[0].release.required_prior_version(), None);
    }

    #[test]
    fn test_missing_releases_is_empty() {
        let manifest = ReleaseManifest::from_json(br#"{"schema_version": "1.0.0"}"#).unwrap();
        assert!(manifest.releases.is_empty());
        assert!(ReleaseManifest::from_json(b"<html>").is_err());
    }

    #[test]
    fn test_channel_acceptance() {
        assert!(Channel::Production.accepts(Channel::Production));
        assert!(!Channel::Production.accepts(Channel::Development));
        assert!(Channel::Development.accepts(Channel::Production));
        assert!(Channel::Development.accepts(Channel::Development));
        assert_eq!("Production".parse::<Channel>().unwrap(), Channel::Production);
        assert!("beta".parse::<Channel>().is_err());
    }

    #[test]
    fn test_bundle_manifest_script_only() {
        let flagged = BundleManifest::from_json(
            br#"{"version": "1.3.0", "script_only_release": true, "has_pre_install_script": true}"#,
        )
        .unwrap();
        assert!(flagged.is_script_only());
        assert!(!flagged.has_post_install_script);

        let suffixed = BundleManifest::from_json(br#"{"version": "1.3.0-s2"}"#).unwrap();
        assert!(suffixed.is_script_only());

        let full = BundleManifest::from_json(br#"{"version": "1.3.0"}"#).unwrap();
        assert!(!full.is_script_only());
    }
}
