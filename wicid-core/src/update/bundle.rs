// Firmware bundle archives.
//
// Bundles are zip files read through the `zip` crate. Entry names are
// checked so nothing can be written outside the extraction root, and an
// entry never produces more bytes than its declared size.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Seek, Write};
use std::path::{Component, Path, PathBuf};
use zip::result::ZipError;
use zip::ZipArchive;

#[derive(Debug)]
pub enum BundleError {
    Io(io::Error),
    NotAZip,
    Corrupt(String),
    Unsupported(String),
    UnsafePath(String),
    Oversized { name: String, declared: u64 },
}

impl fmt::Display for BundleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BundleError::Io(e) => write!(f, "bundle I/O error: {}", e),
            BundleError::NotAZip => write!(f, "bundle is not a zip archive"),
            BundleError::Corrupt(msg) => write!(f, "corrupt bundle: {}", msg),
            BundleError::Unsupported(msg) => write!(f, "unsupported bundle feature: {}", msg),
            BundleError::UnsafePath(name) => write!(f, "unsafe path in bundle: {}", name),
            BundleError::Oversized { name, declared } => {
                write!(f, "{} expands past its declared {} bytes", name, declared)
            }
        }
    }
}

impl std::error::Error for BundleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BundleError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for BundleError {
    fn from(e: io::Error) -> Self {
        BundleError::Io(e)
    }
}

impl From<ZipError> for BundleError {
    fn from(e: ZipError) -> Self {
        match e {
            ZipError::Io(e) => read_error("archive", e),
            ZipError::UnsupportedArchive(msg) => BundleError::Unsupported(msg.to_string()),
            other => BundleError::Corrupt(other.to_string()),
        }
    }
}

/// Failures while decoding archive data are release faults, not storage faults
fn read_error(name: &str, e: io::Error) -> BundleError {
    match e.kind() {
        io::ErrorKind::InvalidData
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::Other => BundleError::Corrupt(format!("{}: {}", name, e)),
        _ => BundleError::Io(e),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleEntry {
    pub name: String,
    pub size: u64,
    pub compressed_size: u64,
    index: usize,
}

impl BundleEntry {
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }
}

pub struct Bundle<R> {
    archive: ZipArchive<R>,
    entries: Vec<BundleEntry>,
}

impl Bundle<File> {
    pub fn open_file(path: &Path) -> Result<Self, BundleError> {
        Self::new(File::open(path)?)
    }
}

impl<R: Read + Seek> Bundle<R> {
    /// Read the central directory
    pub fn new(reader: R) -> Result<Self, BundleError> {
        let mut archive = ZipArchive::new(reader).map_err(|e| match e {
            ZipError::Io(e)
                if !matches!(
                    e.kind(),
                    io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput
                ) =>
            {
                BundleError::Io(e)
            }
            ZipError::UnsupportedArchive(msg) => BundleError::Unsupported(msg.to_string()),
            _ => BundleError::NotAZip,
        })?;

        let mut entries = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let file = archive.by_index_raw(index)?;
            entries.push(BundleEntry {
                name: file.name().to_string(),
                size: file.size(),
                compressed_size: file.compressed_size(),
                index,
            });
        }

        Ok(Self { archive, entries })
    }

    pub fn entries(&self) -> &[BundleEntry] {
        &self.entries
    }

    /// Stream one entry's contents into `out`. The archive verifies the CRC;
    /// output stops at the declared size so a lying header cannot fill storage.
    pub fn read_entry(&mut self, entry: &BundleEntry, out: &mut dyn Write) -> Result<u64, BundleError> {
        let file = self.archive.by_index(entry.index)?;
        let mut limited = file.take(entry.size.saturating_add(1));

        let mut buf = [0u8; 2048];
        let mut total = 0u64;
        loop {
            let n = match limited.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(read_error(&entry.name, e)),
            };
            if total + n as u64 > entry.size {
                return Err(BundleError::Oversized {
                    name: entry.name.clone(),
                    declared: entry.size,
                });
            }
            out.write_all(&buf[..n])?;
            total += n as u64;
        }

        if total != entry.size {
            return Err(BundleError::Corrupt(format!(
                "{}: {} of {} bytes",
                entry.name, total, entry.size
            )));
        }
        Ok(total)
    }

    /// Extract one entry beneath `root`. Directories are created, files written.
    pub fn extract(&mut self, entry: &BundleEntry, root: &Path) -> Result<PathBuf, BundleError> {
        let target = root.join(safe_relative_path(&entry.name)?);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            return Ok(target);
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&target)?;
        self.read_entry(entry, &mut file)?;
        file.flush()?;
        Ok(target)
    }
}

/// Turn an archive name into a relative path, rejecting absolute paths and `..`
pub fn safe_relative_path(name: &str) -> Result<PathBuf, BundleError> {
    if name.contains('\\') {
        return Err(BundleError::UnsafePath(name.to_string()));
    }
    let mut path = PathBuf::new();
    for component in Path::new(name.trim_end_matches('/')).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => return Err(BundleError::UnsafePath(name.to_string())),
        }
    }
    if path.as_os_str().is_empty() {
        return Err(BundleError::UnsafePath(name.to_string()));
    }
    Ok(path)
}
