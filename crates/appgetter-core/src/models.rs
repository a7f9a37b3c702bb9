//! Core data models shared by the pipeline, the stores, and the HTTP API.
//!
//! These types represent the persisted application and version rows plus
//! the small identifiers that flow between them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of an installed application.
pub type AppId = i64;

/// Identifier of the user who owns an application or a submission.
pub type UserId = i64;

/// An installed application. Versions hang off it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub app_id: AppId,
    pub owner_id: UserId,
    pub name: String,
    pub created: DateTime<Utc>,
}

/// One committed version of an application, bound to the file-storage
/// location that holds its code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppVersion {
    pub app_id: AppId,
    pub name: String,
    pub version: String,
    pub schema: u32,
    pub api_version: u32,
    pub location_key: String,
    pub created: DateTime<Utc>,
}

/// Fields needed to create a new [`AppVersion`] row.
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub app_id: AppId,
    pub name: String,
    pub version: String,
    pub schema: u32,
    pub api_version: u32,
    pub location_key: String,
}
