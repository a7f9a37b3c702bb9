//! File storage for application packages.
//!
//! Every saved package gets its own *location*, an opaque key naming a
//! directory under the storage root:
//!
//! ```text
//! <root>/<location>/
//!     app/          package files as uploaded
//!     routes.json   route table written after discovery
//!     log.txt       per-location audit log (see crate::audit)
//! ```

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use uuid::Uuid;
use walkdir::WalkDir;

use appgetter_core::manifest::{is_package_relative, AppManifest, ManifestError, MANIFEST_FILE};
use appgetter_core::routes::RouteDescriptor;

use crate::package::PackageFile;

pub const ROUTES_FILE: &str = "routes.json";
pub const APP_DIR: &str = "app";

/// Storage collaborator used by the pipeline and the lifecycle operations.
#[async_trait]
pub trait AppFiles: Send + Sync {
    /// Write a package into a fresh location and return its key.
    async fn save(&self, files: &[PackageFile]) -> Result<String>;

    /// Read and parse the package manifest.
    async fn read_manifest(&self, location: &str) -> Result<AppManifest, ManifestError>;

    /// Package-relative paths of every file in the package.
    async fn package_files(&self, location: &str) -> Result<HashSet<String>>;

    /// Persist the canonical route table for the location.
    async fn write_routes(&self, location: &str, routes: &[RouteDescriptor]) -> Result<()>;

    /// Remove the location and everything in it.
    async fn delete(&self, location: &str) -> Result<()>;

    /// Does the location exist? Keys that are not valid locations do not.
    async fn exists(&self, location: &str) -> Result<bool>;
}

/// [`AppFiles`] on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalAppFiles {
    root: PathBuf,
}

impl LocalAppFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory of a location. Keys that could escape the root are refused.
    pub fn location_dir(&self, location: &str) -> Result<PathBuf> {
        if location.is_empty() || !location.chars().all(|c| c.is_ascii_alphanumeric()) {
            bail!("invalid location key {:?}", location);
        }
        Ok(self.root.join(location))
    }

    /// Directory holding the package files of a location.
    pub fn app_dir(&self, location: &str) -> Result<PathBuf> {
        Ok(self.location_dir(location)?.join(APP_DIR))
    }
}

#[async_trait]
impl AppFiles for LocalAppFiles {
    async fn save(&self, files: &[PackageFile]) -> Result<String> {
        let location = format!("app{}", Uuid::new_v4().simple());
        let app_dir = self.app_dir(&location)?;
        tokio::fs::create_dir_all(&app_dir)
            .await
            .with_context(|| format!("Failed to create {}", app_dir.display()))?;

        for f in files {
            if !is_package_relative(&f.path) {
                bail!("package path {:?} is outside the package", f.path);
            }
            let dest = app_dir.join(&f.path);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&dest, &f.data)
                .await
                .with_context(|| format!("Failed to write {}", dest.display()))?;
        }

        Ok(location)
    }

    async fn read_manifest(&self, location: &str) -> Result<AppManifest, ManifestError> {
        let path = self
            .app_dir(location)
            .map_err(|e| ManifestError::Io(std::io::Error::other(e.to_string())))?
            .join(MANIFEST_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => AppManifest::from_json(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ManifestError::NotFound),
            Err(e) => Err(ManifestError::Io(e)),
        }
    }

    async fn package_files(&self, location: &str) -> Result<HashSet<String>> {
        let app_dir = self.app_dir(location)?;
        tokio::task::spawn_blocking(move || -> Result<HashSet<String>> {
            let mut out = HashSet::new();
            for entry in WalkDir::new(&app_dir).follow_links(false) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry.path().strip_prefix(&app_dir)?;
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.insert(rel);
            }
            Ok(out)
        })
        .await
        .context("package listing task panicked")?
    }

    async fn write_routes(&self, location: &str, routes: &[RouteDescriptor]) -> Result<()> {
        let path = self.location_dir(location)?.join(ROUTES_FILE);
        let json = serde_json::to_vec_pretty(routes)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    async fn delete(&self, location: &str) -> Result<()> {
        let dir = self.location_dir(location)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", dir.display())),
        }
    }

    async fn exists(&self, location: &str) -> Result<bool> {
        let Ok(dir) = self.location_dir(location) else {
            return Ok(false);
        };
        Ok(tokio::fs::try_exists(&dir).await?)
    }
}
