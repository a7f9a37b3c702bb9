//! In-memory [`AppStore`] implementation for testing.
//!
//! Uses `Vec` behind `std::sync::RwLock` for thread safety. Ids are
//! assigned sequentially starting at 1.

use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::models::{App, AppId, AppVersion, NewVersion, UserId};

use super::AppStore;

/// In-memory store for tests and local experiments.
pub struct InMemoryAppStore {
    apps: RwLock<Vec<App>>,
    versions: RwLock<Vec<AppVersion>>,
}

impl InMemoryAppStore {
    pub fn new() -> Self {
        Self {
            apps: RwLock::new(Vec::new()),
            versions: RwLock::new(Vec::new()),
        }
    }

    /// Insert a version row directly, bypassing app existence checks.
    /// Useful for seeding fixtures with arbitrary (even corrupt) data.
    pub fn insert_version(&self, version: AppVersion) {
        self.versions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(version);
    }
}

impl Default for InMemoryAppStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AppStore for InMemoryAppStore {
    async fn create_app(&self, owner_id: UserId, name: &str) -> Result<App> {
        let mut apps = self.apps.write().unwrap_or_else(|e| e.into_inner());
        let app = App {
            app_id: apps.len() as AppId + 1,
            owner_id,
            name: name.to_string(),
            created: Utc::now(),
        };
        apps.push(app.clone());
        Ok(app)
    }

    async fn get_app(&self, app_id: AppId) -> Result<Option<App>> {
        let apps = self.apps.read().unwrap_or_else(|e| e.into_inner());
        Ok(apps.iter().find(|a| a.app_id == app_id).cloned())
    }

    async fn create_version(&self, version: &NewVersion) -> Result<AppVersion> {
        let mut versions = self.versions.write().unwrap_or_else(|e| e.into_inner());
        if versions
            .iter()
            .any(|v| v.app_id == version.app_id && v.version == version.version)
        {
            bail!(
                "app {} already has version {}",
                version.app_id,
                version.version
            );
        }
        let row = AppVersion {
            app_id: version.app_id,
            name: version.name.clone(),
            version: version.version.clone(),
            schema: version.schema,
            api_version: version.api_version,
            location_key: version.location_key.clone(),
            created: Utc::now(),
        };
        versions.push(row.clone());
        Ok(row)
    }

    async fn create_app_with_version(
        &self,
        owner_id: UserId,
        version: &NewVersion,
    ) -> Result<(App, AppVersion)> {
        let mut apps = self.apps.write().unwrap_or_else(|e| e.into_inner());
        let mut versions = self.versions.write().unwrap_or_else(|e| e.into_inner());
        let created = Utc::now();
        let app = App {
            app_id: apps.len() as AppId + 1,
            owner_id,
            name: version.name.clone(),
            created,
        };
        let row = AppVersion {
            app_id: app.app_id,
            name: version.name.clone(),
            version: version.version.clone(),
            schema: version.schema,
            api_version: version.api_version,
            location_key: version.location_key.clone(),
            created,
        };
        apps.push(app.clone());
        versions.push(row.clone());
        Ok((app, row))
    }

    async fn list_versions(&self, app_id: AppId) -> Result<Vec<AppVersion>> {
        let versions = self.versions.read().unwrap_or_else(|e| e.into_inner());
        Ok(versions
            .iter()
            .filter(|v| v.app_id == app_id)
            .cloned()
            .collect())
    }
}
