//! Storage abstraction for application and version rows.
//!
//! The [`AppStore`] trait covers the persistence the ingestion pipeline and
//! its commit step need, enabling pluggable backends (SQLite in the host,
//! in-memory for tests).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{App, AppId, AppVersion, NewVersion, UserId};

/// Abstract persistence backend for applications.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_app`](AppStore::create_app) | Insert a new application row |
/// | [`get_app`](AppStore::get_app) | Look up one application |
/// | [`create_version`](AppStore::create_version) | Insert a version row bound to a location |
/// | [`create_app_with_version`](AppStore::create_app_with_version) | Both inserts, all or nothing |
/// | [`list_versions`](AppStore::list_versions) | All versions of one application |
#[async_trait]
pub trait AppStore: Send + Sync {
    /// Insert a new application owned by `owner_id`.
    async fn create_app(&self, owner_id: UserId, name: &str) -> Result<App>;

    async fn get_app(&self, app_id: AppId) -> Result<Option<App>>;

    /// Insert a version row. Fails if the app already has that version.
    async fn create_version(&self, version: &NewVersion) -> Result<AppVersion>;

    /// Insert a new application together with its first version. Either
    /// both rows are written or neither is. `version.app_id` is ignored.
    async fn create_app_with_version(
        &self,
        owner_id: UserId,
        version: &NewVersion,
    ) -> Result<(App, AppVersion)>;

    /// Versions of an app, in no particular order.
    async fn list_versions(&self, app_id: AppId) -> Result<Vec<AppVersion>>;
}
