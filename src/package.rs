//! Package intake: turn an uploaded archive or a local directory into the
//! flat file list that [`crate::storage::AppFiles::save`] accepts.
//!
//! Archives are zip files. Entries that would escape the package root are
//! rejected, and the total unpacked size is capped. When the manifest is not
//! at the archive root but every entry shares a single top-level directory
//! (the usual result of zipping a folder), that directory is stripped.

use std::io::{Cursor, Read};
use std::path::Path;

use appgetter_core::manifest::{is_package_relative, MANIFEST_FILE};
use thiserror::Error;
use walkdir::WalkDir;

/// One file of an application package, keyed by its package-relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFile {
    pub path: String,
    pub data: Vec<u8>,
}

impl PackageFile {
    pub fn new(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("package is larger than {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("package archive is not a valid zip file: {0}")]
    InvalidArchive(String),
    #[error("package entry {0:?} is outside the package root")]
    UnsafePath(String),
    #[error("package is empty")]
    Empty,
    #[error("failed to read package: {0}")]
    Io(#[from] std::io::Error),
}

/// Unpack a zip archive held in memory.
pub fn unpack_zip(bytes: &[u8], max_bytes: u64) -> Result<Vec<PackageFile>, PackageError> {
    if bytes.len() as u64 > max_bytes {
        return Err(PackageError::TooLarge { limit: max_bytes });
    }

    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| PackageError::InvalidArchive(e.to_string()))?;

    let mut files = Vec::new();
    let mut total: u64 = 0;
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| PackageError::InvalidArchive(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let path = match entry.enclosed_name() {
            Some(p) => normalize(&p),
            None => return Err(PackageError::UnsafePath(name)),
        };

        let remaining = max_bytes.saturating_sub(total);
        let mut data = Vec::new();
        entry.take(remaining + 1).read_to_end(&mut data)?;
        total += data.len() as u64;
        if total > max_bytes {
            return Err(PackageError::TooLarge { limit: max_bytes });
        }
        files.push(PackageFile { path, data });
    }

    finish(files)
}

/// Read every regular file under `dir`.
pub fn load_dir(dir: &Path, max_bytes: u64) -> Result<Vec<PackageFile>, PackageError> {
    let mut files = Vec::new();
    let mut total: u64 = 0;
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| PackageError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|_| PackageError::UnsafePath(entry.path().display().to_string()))?;
        let data = std::fs::read(entry.path())?;
        total += data.len() as u64;
        if total > max_bytes {
            return Err(PackageError::TooLarge { limit: max_bytes });
        }
        files.push(PackageFile {
            path: normalize(rel),
            data,
        });
    }
    finish(files)
}

fn normalize(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn finish(mut files: Vec<PackageFile>) -> Result<Vec<PackageFile>, PackageError> {
    if files.is_empty() {
        return Err(PackageError::Empty);
    }
    for f in &files {
        if !is_package_relative(&f.path) {
            return Err(PackageError::UnsafePath(f.path.clone()));
        }
    }
    strip_common_root(&mut files);
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn strip_common_root(files: &mut [PackageFile]) {
    if files.iter().any(|f| f.path == MANIFEST_FILE) {
        return;
    }
    let Some(first) = files[0].path.split_once('/').map(|(root, _)| root.to_string()) else {
        return;
    };
    let prefix = format!("{}/", first);
    if !files.iter().all(|f| f.path.starts_with(&prefix)) {
        return;
    }
    for f in files.iter_mut() {
        f.path = f.path[prefix.len()..].to_string();
    }
}
