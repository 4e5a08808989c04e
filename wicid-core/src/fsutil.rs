// Filesystem helpers shared by staging, install and recovery.
//
// The device filesystem is FAT32, so name comparisons against the preserved
// set ignore case.

use log::{debug, warn};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

/// Write to a sibling temp file then rename over the target
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;

    fs::rename(&temp_path, path)
}

/// Remove a directory tree, treating "already gone" as success
pub fn remove_dir_all_quiet(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove a file or directory at `path`, whichever it is
pub fn remove_path(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

pub fn is_preserved(name: &str, preserved: &[&str]) -> bool {
    preserved.iter().any(|p| p.eq_ignore_ascii_case(name))
}

pub fn is_hidden(relative: &str) -> bool {
    relative
        .split('/')
        .any(|part| part.starts_with('.') && !part.is_empty())
}

/// Copy one file, creating parent directories as needed
pub fn copy_file(src: &Path, dst: &Path) -> io::Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst)
}

/// Move every entry of `src` into `dst`, merging directories.
///
/// Top-level names in `skip` are left behind and deleted from the source.
/// Per-entry failures are collected rather than aborting the move.
pub fn move_tree(src: &Path, dst: &Path, skip: &[&str]) -> io::Result<Vec<String>> {
    let mut failures = Vec::new();
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let from = entry.path();
        let to = dst.join(&name);

        if is_preserved(&name, skip) {
            debug!("Skipping preserved file from bundle: {}", name);
            if let Err(e) = remove_path(&from) {
                warn!("Could not discard {}: {}", from.display(), e);
            }
            continue;
        }

        let result = if from.is_dir() {
            move_tree(&from, &to, &[]).map(|nested| {
                failures.extend(nested);
                // Not empty when a nested entry failed to move
                if let Err(e) = fs::remove_dir(&from) {
                    if e.kind() != io::ErrorKind::NotFound {
                        debug!("Leaving {} in place: {}", from.display(), e);
                    }
                }
            })
        } else {
            move_file(&from, &to)
        };

        if let Err(e) = result {
            failures.push(format!("{}: {}", from.display(), e));
        }
    }

    Ok(failures)
}

fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if to.is_dir() {
        fs::remove_dir_all(to)?;
    }
    // Rename fails across mount points; fall back to copy + delete
    if fs::rename(from, to).is_err() {
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(())
}

/// Delete every top-level entry of `root` not named in `preserved`
pub fn delete_all_except(root: &Path, preserved: &[&str]) -> io::Result<Vec<String>> {
    let mut failures = Vec::new();

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_preserved(&name, preserved) {
            debug!("Preserved: {}", name);
            continue;
        }
        if let Err(e) = remove_path(&entry.path()) {
            failures.push(format!("{}: {}", name, e));
        }
    }

    Ok(failures)
}

/// Relative paths from `files` that do not exist as regular files under `base`
pub fn missing_files<S: AsRef<str>>(base: &Path, files: &[S]) -> Vec<String> {
    files
        .iter()
        .map(|f| f.as_ref())
        .filter(|f| !base.join(f).is_file())
        .map(str::to_string)
        .collect()
}
