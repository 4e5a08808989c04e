// Builds a release bundle from a firmware directory

use anyhow::{bail, Context, Result};
use indicatif::ProgressBar;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use wicid_core::fsutil::is_hidden;
use wicid_core::install::HookKind;
use wicid_core::layout::{BUNDLE_MANIFEST, DEFAULT_CRITICAL_FILES};
use wicid_core::manifest::{BundleManifest, Channel};
use wicid_core::version::Version;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub struct PackageOptions {
    pub source: PathBuf,
    pub version: String,
    pub machines: Vec<String>,
    pub oses: Vec<String>,
    pub release_type: Channel,
    pub notes: String,
    pub release_date: String,
    pub pre_install: bool,
    pub post_install: bool,
    pub script_only: bool,
}

#[derive(Debug)]
pub struct BuiltPackage {
    pub manifest: BundleManifest,
    pub data: Vec<u8>,
    pub sha256: String,
    pub files: usize,
}

pub fn create_manifest(opts: &PackageOptions) -> BundleManifest {
    BundleManifest {
        schema_version: "1.0.0".to_string(),
        version: opts.version.clone(),
        target_machine_types: opts.machines.clone(),
        target_operating_systems: opts.oses.clone(),
        release_type: Some(opts.release_type),
        release_notes: opts.notes.clone(),
        release_date: Some(opts.release_date.clone()),
        has_pre_install_script: opts.pre_install,
        has_post_install_script: opts.post_install,
        script_only_release: opts.script_only,
    }
}

/// Every non-hidden file under `source` as (archive name, path), sorted by name.
/// A `manifest.json` in the source is skipped; the generated one replaces it.
pub fn collect_files(source: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    let mut pending = vec![source.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))? {
            let path = entry?.path();
            let relative = path
                .strip_prefix(source)?
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if is_hidden(&relative) || relative == BUNDLE_MANIFEST {
                continue;
            }
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push((relative, path));
            }
        }
    }

    files.sort();
    Ok(files)
}

pub fn build_package(opts: &PackageOptions, progress: &ProgressBar) -> Result<BuiltPackage> {
    opts.version
        .parse::<Version>()
        .map_err(|e| anyhow::anyhow!("invalid version '{}': {}", opts.version, e))?;
    if opts.machines.is_empty() || opts.oses.is_empty() {
        bail!("at least one target machine type and operating system is required");
    }

    let manifest = create_manifest(opts);
    for (kind, declared) in [
        (HookKind::PreInstall, manifest.has_pre_install_script),
        (HookKind::PostInstall, manifest.has_post_install_script),
    ] {
        let script = kind.script_path(&opts.source, &opts.version);
        if declared && !script.is_file() {
            bail!("{} declared but {} does not exist", kind.as_str(), script.display());
        }
    }

    let files = collect_files(&opts.source)?;
    if !manifest.is_script_only() {
        let missing: Vec<&str> = DEFAULT_CRITICAL_FILES
            .iter()
            .copied()
            .filter(|f| *f != BUNDLE_MANIFEST)
            .filter(|f| !files.iter().any(|(name, _)| name == f))
            .collect();
        if !missing.is_empty() {
            bail!("missing critical files: {}", missing.join(", "));
        }
    }

    progress.set_length(files.len() as u64 + 1);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));

    zip.start_file(BUNDLE_MANIFEST, options)?;
    zip.write_all(&serde_json::to_vec_pretty(&manifest)?)?;
    progress.inc(1);
    for (name, path) in &files {
        zip.start_file(name.as_str(), options)?;
        let mut file = File::open(path).with_context(|| format!("reading {}", path.display()))?;
        std::io::copy(&mut file, &mut zip)?;
        progress.set_message(name.clone());
        progress.inc(1);
    }

    let data = zip.finish()?.into_inner();
    let sha256 = format!("{:x}", Sha256::digest(&data));
    Ok(BuiltPackage {
        manifest,
        data,
        sha256,
        files: files.len() + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wicid_core::update::Bundle;

    fn options(source: &Path) -> PackageOptions {
        PackageOptions {
            source: source.to_path_buf(),
            version: "1.2.0".to_string(),
            machines: vec!["Adafruit QT Py ESP32S3 4MB 2MB PSRAM".to_string()],
            oses: vec!["circuitpython_10_0".to_string()],
            release_type: Channel::Production,
            notes: "Bug fixes".to_string(),
            release_date: "2025-03-01T12:00:00+00:00".to_string(),
            pre_install: false,
            post_install: false,
            script_only: false,
        }
    }

    fn firmware_dir() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("firmware")).unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join("firmware/wicid.bin"), b"firmware").unwrap();
        fs::write(dir.path().join("settings.json"), br#"{"version": "1.2.0"}"#).unwrap();
        fs::write(dir.path().join("manifest.json"), b"stale").unwrap();
        fs::write(dir.path().join(".git/HEAD"), b"ref").unwrap();
        dir
    }

    #[test]
    fn test_collect_skips_hidden_and_manifest() {
        let dir = firmware_dir();
        let names: Vec<String> = collect_files(dir.path()).unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["firmware/wicid.bin", "settings.json"]);
    }

    #[test]
    fn test_build_package() {
        let dir = firmware_dir();
        let built = build_package(&options(dir.path()), &ProgressBar::hidden()).unwrap();
        assert_eq!(built.files, 3);
        assert_eq!(built.sha256.len(), 64);

        let mut bundle = Bundle::new(Cursor::new(built.data)).unwrap();
        let entry = bundle.entries()[0].clone();
        assert_eq!(entry.name, "manifest.json");
        let mut json = Vec::new();
        bundle.read_entry(&entry, &mut json).unwrap();
        let manifest = BundleManifest::from_json(&json).unwrap();
        assert_eq!(manifest.version, "1.2.0");
        assert_eq!(manifest.release_type, Some(Channel::Production));
    }

    #[test]
    fn test_missing_critical_files() {
        let dir = firmware_dir();
        fs::remove_file(dir.path().join("firmware/wicid.bin")).unwrap();
        let err = build_package(&options(dir.path()), &ProgressBar::hidden()).unwrap_err();
        assert!(err.to_string().contains("firmware/wicid.bin"));

        // Script-only releases carry no firmware
        let mut opts = options(dir.path());
        opts.script_only = true;
        assert!(build_package(&opts, &ProgressBar::hidden()).is_ok());
    }

    #[test]
    fn test_declared_hook_must_exist() {
        let dir = firmware_dir();
        let mut opts = options(dir.path());
        opts.pre_install = true;
        assert!(build_package(&opts, &ProgressBar::hidden()).is_err());

        fs::create_dir_all(dir.path().join("firmware_install_scripts")).unwrap();
        fs::write(
            dir.path().join("firmware_install_scripts/pre_install_v1.2.0.py"),
            b"def main(log, root, pending): return True\n",
        )
        .unwrap();
        assert!(build_package(&opts, &ProgressBar::hidden()).is_ok());
    }
}
