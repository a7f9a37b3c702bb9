//! Version sequencing for new versions of an existing application.
//!
//! A candidate version is placed into the ascending semver order of the
//! versions already stored for the app. Its schema number is then compared
//! with its immediate neighbors only: the predecessor must not have a higher
//! schema and the successor must not have a lower one. Comparing against
//! neighbors (rather than every version) allows long schema plateaus while
//! still catching a local regression.
//!
//! Precedence follows semver rules, so build metadata does not distinguish
//! two versions: `1.0.0+a` duplicates `1.0.0`.

use std::cmp::Ordering;

use semver::Version;
use thiserror::Error;

use crate::models::AppVersion;

pub const ERR_DUPLICATE_VERSION: &str = "This version already exists in this app";
pub const ERR_PREV_HIGHER_SCHEMA: &str = "Previous version has a higher schema";
pub const ERR_NEXT_LOWER_SCHEMA: &str = "Next version has a lower schema";
pub const ERR_INVALID_CANDIDATE: &str = "Version is not a valid semantic version";

/// A version string paired with the schema it expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSchema {
    pub version: String,
    pub schema: u32,
}

impl VersionSchema {
    pub fn new(version: impl Into<String>, schema: u32) -> Self {
        Self {
            version: version.into(),
            schema,
        }
    }
}

impl From<&AppVersion> for VersionSchema {
    fn from(v: &AppVersion) -> Self {
        Self::new(v.version.clone(), v.schema)
    }
}

/// Outcome of placing a candidate into an existing sequence.
///
/// `errors` are author-facing validation messages. `prev_version` and
/// `next_version` name the adjacent stored versions, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceCheck {
    pub errors: Vec<String>,
    pub prev_version: Option<String>,
    pub next_version: Option<String>,
}

impl SequenceCheck {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A stored version that no longer parses. This is data corruption, not a
/// problem with the submitted package.
#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("stored version {version:?} is not a valid semantic version: {source}")]
    CorruptVersion {
        version: String,
        #[source]
        source: semver::Error,
    },
}

struct Entry<'a> {
    parsed: Version,
    raw: &'a str,
    schema: u32,
    candidate: bool,
}

/// Check where `candidate` falls among `existing` and whether its schema
/// keeps the sequence monotonic.
pub fn check_sequence(
    existing: &[VersionSchema],
    candidate: &VersionSchema,
) -> Result<SequenceCheck, SequenceError> {
    let mut entries = Vec::with_capacity(existing.len() + 1);
    for v in existing {
        let parsed =
            Version::parse(&v.version).map_err(|source| SequenceError::CorruptVersion {
                version: v.version.clone(),
                source,
            })?;
        entries.push(Entry {
            parsed,
            raw: &v.version,
            schema: v.schema,
            candidate: false,
        });
    }

    let Ok(parsed) = Version::parse(&candidate.version) else {
        return Ok(SequenceCheck {
            errors: vec![ERR_INVALID_CANDIDATE.to_string()],
            ..Default::default()
        });
    };

    if entries
        .iter()
        .any(|e| e.parsed.cmp_precedence(&parsed) == Ordering::Equal)
    {
        return Ok(SequenceCheck {
            errors: vec![ERR_DUPLICATE_VERSION.to_string()],
            ..Default::default()
        });
    }

    entries.push(Entry {
        parsed,
        raw: &candidate.version,
        schema: candidate.schema,
        candidate: true,
    });
    entries.sort_by(|a, b| a.parsed.cmp_precedence(&b.parsed));

    // The candidate was pushed above, so it is always found.
    let idx = entries.iter().position(|e| e.candidate).unwrap_or(0);

    let mut check = SequenceCheck::default();

    if let Some(prev) = idx.checked_sub(1).map(|i| &entries[i]) {
        check.prev_version = Some(prev.raw.to_string());
        if prev.schema > candidate.schema {
            check.errors.push(ERR_PREV_HIGHER_SCHEMA.to_string());
        }
    }

    if let Some(next) = entries.get(idx + 1) {
        check.next_version = Some(next.raw.to_string());
        if next.schema < candidate.schema {
            check.errors.push(ERR_NEXT_LOWER_SCHEMA.to_string());
        }
    }

    Ok(check)
}

/// Sort stored versions into ascending semver order. Versions that do not
/// parse go last, in string order.
pub fn sort_versions(versions: &mut [AppVersion]) {
    versions.sort_by(|a, b| {
        match (Version::parse(&a.version), Version::parse(&b.version)) {
            (Ok(x), Ok(y)) => x.cmp_precedence(&y),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => a.version.cmp(&b.version),
        }
    });
}
