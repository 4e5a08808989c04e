// releases.json maintenance

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use wicid_core::fsutil::atomic_write;
use wicid_core::manifest::{ArchiveEntry, BundleManifest, Channel, ReleaseEntry, ReleaseGroup, ReleaseManifest};

pub const SCHEMA_VERSION: &str = "1.0.0";

/// Load an existing releases.json, or start an empty one
pub fn load(path: &Path) -> Result<ReleaseManifest> {
    if !path.exists() {
        return Ok(ReleaseManifest {
            schema_version: SCHEMA_VERSION.to_string(),
            last_updated: String::new(),
            releases: Vec::new(),
        });
    }
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    ReleaseManifest::from_json(&data).with_context(|| format!("parsing {}", path.display()))
}

pub fn save(path: &Path, manifest: &ReleaseManifest) -> Result<()> {
    let mut json = serde_json::to_vec_pretty(manifest)?;
    json.push(b'\n');
    atomic_write(path, &json).with_context(|| format!("writing {}", path.display()))
}

fn latest_date(group: &ReleaseGroup) -> String {
    [group.production.as_ref(), group.development.as_ref()]
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.release_date.clone())
        .max()
        .unwrap_or_default()
}

/// Publish a bundle as the current release of its channel.
///
/// The group whose targets match exactly is updated (or created). A different
/// version previously current on that channel moves to the archive, so devices
/// that cannot take the new release still have a fallback.
pub fn publish(
    releases: &mut ReleaseManifest,
    bundle: &BundleManifest,
    base_url: &str,
    sha256: &str,
    now: &str,
) {
    let channel = bundle.release_type.unwrap_or(Channel::Production);
    let index = releases
        .releases
        .iter()
        .position(|g| {
            g.target_machine_types == bundle.target_machine_types
                && g.target_operating_systems == bundle.target_operating_systems
        })
        .unwrap_or_else(|| {
            releases.releases.push(ReleaseGroup {
                target_machine_types: bundle.target_machine_types.clone(),
                target_operating_systems: bundle.target_operating_systems.clone(),
                production: None,
                development: None,
                archive: Vec::new(),
            });
            releases.releases.len() - 1
        });
    let group = &mut releases.releases[index];

    let entry = ReleaseEntry {
        version: bundle.version.clone(),
        release_notes: bundle.release_notes.clone(),
        zip_url: format!("{}/v{}", base_url.trim_end_matches('/'), bundle.version),
        sha256: Some(sha256.to_string()),
        release_date: bundle.release_date.clone(),
        minimum_prior_version: None,
    };

    let slot = match channel {
        Channel::Production => &mut group.production,
        Channel::Development => &mut group.development,
    };
    if let Some(previous) = slot.replace(entry) {
        if previous.version != bundle.version {
            group.archive.retain(|a| a.release.version != previous.version || a.release_type != channel);
            group.archive.insert(
                0,
                ArchiveEntry {
                    release: previous,
                    release_type: channel,
                },
            );
        }
    }

    releases.releases.sort_by_key(|g| std::cmp::Reverse(latest_date(g)));
    releases.last_updated = now.to_string();
    if releases.schema_version.is_empty() {
        releases.schema_version = SCHEMA_VERSION.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MACHINE: &str = "Adafruit QT Py ESP32S3 4MB 2MB PSRAM";

    fn bundle(version: &str, os: &str, date: &str, channel: Channel) -> BundleManifest {
        BundleManifest {
            schema_version: "1.0.0".to_string(),
            version: version.to_string(),
            target_machine_types: vec![MACHINE.to_string()],
            target_operating_systems: vec![os.to_string()],
            release_type: Some(channel),
            release_notes: format!("Release {}", version),
            release_date: Some(date.to_string()),
            has_pre_install_script: false,
            has_post_install_script: false,
            script_only_release: false,
        }
    }

    #[test]
    fn test_publish_creates_group() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("releases.json");
        let mut releases = load(&path).unwrap();
        assert!(releases.releases.is_empty());

        let b = bundle("1.0.0", "circuitpython_10_0", "2025-01-01T00:00:00Z", Channel::Production);
        publish(&mut releases, &b, "https://www.wicid.ai/releases/", "abc", "2025-01-02T00:00:00Z");
        save(&path, &releases).unwrap();

        let loaded = load(&path).unwrap();
        let group = &loaded.releases[0];
        let current = group.production.as_ref().unwrap();
        assert_eq!(current.zip_url, "https://www.wicid.ai/releases/v1.0.0");
        assert_eq!(current.sha256.as_deref(), Some("abc"));
        assert!(group.development.is_none());
        assert_eq!(loaded.last_updated, "2025-01-02T00:00:00Z");
    }

    #[test]
    fn test_previous_release_is_archived() {
        let mut releases = load(Path::new("/nonexistent/releases.json")).unwrap();
        let base = "https://www.wicid.ai/releases";
        publish(&mut releases, &bundle("1.0.0", "circuitpython_10_0", "2025-01-01", Channel::Production), base, "a", "t1");
        publish(&mut releases, &bundle("1.1.0", "circuitpython_10_0", "2025-02-01", Channel::Production), base, "b", "t2");
        // Republishing the same version replaces it in place
        publish(&mut releases, &bundle("1.1.0", "circuitpython_10_0", "2025-02-02", Channel::Production), base, "c", "t3");

        assert_eq!(releases.releases.len(), 1);
        let group = &releases.releases[0];
        assert_eq!(group.production.as_ref().unwrap().sha256.as_deref(), Some("c"));
        assert_eq!(group.archive.len(), 1);
        assert_eq!(group.archive[0].release.version, "1.0.0");
        assert_eq!(group.archive[0].release_type, Channel::Production);
    }

    #[test]
    fn test_groups_sorted_by_latest_release() {
        let mut releases = load(Path::new("/nonexistent/releases.json")).unwrap();
        let base = "https://www.wicid.ai/releases";
        publish(&mut releases, &bundle("1.0.0", "circuitpython_9_2", "2025-01-01", Channel::Production), base, "a", "t1");
        publish(&mut releases, &bundle("2.0.0", "circuitpython_10_0", "2025-03-01", Channel::Development), base, "b", "t2");

        assert_eq!(releases.releases.len(), 2);
        assert_eq!(releases.releases[0].target_operating_systems, vec!["circuitpython_10_0"]);
        assert!(releases.releases[0].development.is_some());
        assert!(releases.releases[0].production.is_none());
    }
}
