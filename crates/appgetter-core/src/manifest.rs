//! Application manifest: typed deserialization and metadata validation.
//!
//! The manifest (`app.json` at the root of a package) is parsed into
//! [`AppManifest`]. Unknown keys and wrongly-typed values are rejected at
//! the deserialization boundary; everything that parses is then checked by
//! [`validate_metadata`], which accumulates author-facing errors and
//! non-fatal warnings instead of stopping at the first problem.
//!
//! # Example manifest
//!
//! ```json
//! {
//!   "name": "Notes",
//!   "version": "1.2.0",
//!   "schema": 2,
//!   "api": 0,
//!   "entrypoint": "app.lua",
//!   "short-description": "Shared notes",
//!   "permissions": [{ "key": "edit", "name": "Edit notes" }],
//!   "migrations": [
//!     { "direction": "up", "schema": 1 },
//!     { "direction": "up", "schema": 2 }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name of the manifest inside a package.
pub const MANIFEST_FILE: &str = "app.json";

pub const ERR_MANIFEST_NOT_FOUND: &str = "application manifest not found";
pub const ERR_BLANK_NAME: &str = "App name can not be blank";

const SHORT_DESCRIPTION_MAX: usize = 35;

fn default_entrypoint() -> String {
    "app.lua".to_string()
}

/// Author-declared metadata packaged with an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AppManifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Shape of appspace data this version expects.
    #[serde(default)]
    pub schema: u32,
    /// Host API level the app is written against.
    #[serde(default, rename = "api")]
    pub api_version: u32,
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accent_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default)]
    pub permissions: Vec<PermissionEntry>,
    #[serde(default)]
    pub migrations: Vec<MigrationStep>,
}

impl AppManifest {
    /// Parse manifest bytes. Unknown fields are an error.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ManifestError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Does `version` parse as a semantic version?
    pub fn has_valid_version(&self) -> bool {
        semver::Version::parse(&self.version).is_ok()
    }
}

/// A permission the app asks appspace owners to grant to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PermissionEntry {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationDirection {
    Up,
    Down,
}

impl std::fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationDirection::Up => f.write_str("up"),
            MigrationDirection::Down => f.write_str("down"),
        }
    }
}

/// One declared data migration step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationStep {
    pub direction: MigrationDirection,
    pub schema: u32,
}

/// Why a manifest could not be obtained.
///
/// `NotFound` and `Malformed` are problems with the package and are shown to
/// the author; `Io` is an infrastructure fault.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("application manifest not found")]
    NotFound,
    #[error("application manifest is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("failed to read application manifest: {0}")]
    Io(#[from] std::io::Error),
}

impl ManifestError {
    /// True when the error describes the package rather than the host.
    pub fn is_validation(&self) -> bool {
        !matches!(self, ManifestError::Io(_))
    }
}

/// Host-side rules the manifest is checked against.
#[derive(Debug, Clone, Copy)]
pub struct MetadataRules<'a> {
    pub supported_api_versions: &'a [u32],
}

/// Accumulated result of [`validate_metadata`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataCheck {
    pub errors: Vec<String>,
    pub warnings: BTreeMap<String, String>,
}

/// Check a parsed manifest. `has_file` answers whether a package-relative
/// path exists in the package.
pub fn validate_metadata(
    manifest: &AppManifest,
    rules: MetadataRules<'_>,
    has_file: impl Fn(&str) -> bool,
) -> MetadataCheck {
    let mut check = MetadataCheck::default();

    if manifest.name.trim().is_empty() {
        check.errors.push(ERR_BLANK_NAME.to_string());
    }

    if !rules.supported_api_versions.contains(&manifest.api_version) {
        check.errors.push(format!(
            "API version {} is not supported by this host",
            manifest.api_version
        ));
    }

    if manifest.version.trim().is_empty() {
        check.errors.push("App version can not be blank".to_string());
    } else if let Err(e) = semver::Version::parse(&manifest.version) {
        check.errors.push(format!(
            "App version {} is not a valid semantic version: {}",
            manifest.version, e
        ));
    }

    validate_permissions(&manifest.permissions, &mut check.errors);
    validate_migrations(manifest.schema, &manifest.migrations, &mut check.errors);

    let entrypoint = manifest.entrypoint.trim();
    if entrypoint.is_empty() {
        check.errors.push("Entrypoint can not be blank".to_string());
    } else if entrypoint != manifest.entrypoint {
        check.errors.push(format!(
            "Entrypoint {:?} has leading or trailing whitespace",
            manifest.entrypoint
        ));
    } else if !is_package_relative(entrypoint) {
        check
            .errors
            .push("Entrypoint must be a relative path inside the package".to_string());
    } else if !has_file(entrypoint) {
        check
            .errors
            .push(format!("Entrypoint {} not found in package", entrypoint));
    }

    collect_warnings(manifest, &has_file, &mut check.warnings);

    check
}

fn validate_permissions(permissions: &[PermissionEntry], errors: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for p in permissions {
        let key = p.key.trim();
        if key.is_empty() {
            errors.push("Permission key can not be blank".to_string());
            continue;
        }
        if !seen.insert(key) {
            errors.push(format!("Permission key {} is declared more than once", key));
        }
    }
}

fn validate_migrations(schema: u32, migrations: &[MigrationStep], errors: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for m in migrations {
        if m.schema == 0 {
            errors.push(format!("Migration {} 0 is not allowed", m.direction));
            continue;
        }
        if m.schema > schema {
            errors.push(format!(
                "Migration {} {} exceeds the app schema {}",
                m.direction, m.schema, schema
            ));
        }
        if !seen.insert((m.direction, m.schema)) {
            errors.push(format!(
                "Migration {} {} is declared more than once",
                m.direction, m.schema
            ));
        }
    }
    for s in 1..=schema {
        if !seen.contains(&(MigrationDirection::Up, s)) {
            errors.push(format!("Migration up to schema {} is missing", s));
        }
    }
}

fn collect_warnings(
    manifest: &AppManifest,
    has_file: &impl Fn(&str) -> bool,
    warnings: &mut BTreeMap<String, String>,
) {
    if let Some(desc) = &manifest.short_description {
        if desc.chars().count() > SHORT_DESCRIPTION_MAX {
            warnings.insert(
                "short-description".to_string(),
                format!(
                    "Short description is longer than {} characters",
                    SHORT_DESCRIPTION_MAX
                ),
            );
        }
    }

    if let Some(color) = &manifest.accent_color {
        if !is_hex_color(color) {
            warnings.insert(
                "accent-color".to_string(),
                format!("Accent color {} is not a #rrggbb color", color),
            );
        }
    }

    if let Some(icon) = &manifest.icon {
        if !is_package_relative(icon) || !has_file(icon) {
            warnings.insert(
                "icon".to_string(),
                format!("Icon {} not found in package", icon),
            );
        }
    }

    if let Some(site) = &manifest.website {
        if !(site.starts_with("https://") || site.starts_with("http://")) {
            warnings.insert(
                "website".to_string(),
                "Website should be an http or https URL".to_string(),
            );
        }
    }

    match &manifest.license {
        Some(l) if !l.trim().is_empty() => {}
        _ => {
            warnings.insert(
                "license".to_string(),
                "No license declared".to_string(),
            );
        }
    }
}

fn is_hex_color(s: &str) -> bool {
    s.len() == 7 && s.starts_with('#') && s[1..].chars().all(|c| c.is_ascii_hexdigit())
}

/// A path that stays inside the package: relative, no `..` segments.
pub fn is_package_relative(path: &str) -> bool {
    !path.starts_with('/')
        && !path.starts_with('\\')
        && path.split(['/', '\\']).all(|seg| seg != "..")
}
