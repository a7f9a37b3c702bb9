//! Errors returned by the lifecycle operations of [`crate::getter::AppGetter`].
//!
//! Validation problems never show up here: they are accumulated as strings in
//! the session's [`crate::keys::ProcessResults`]. These variants are what a
//! caller branches on (HTTP status, CLI exit code).

use thiserror::Error;

use crate::fetch::FetchError;
use crate::package::PackageError;

#[derive(Debug, Error)]
pub enum GetterError {
    /// The token is unknown or its session was already cleaned up.
    #[error("no ingestion session for this token")]
    NotFound,

    /// The pipeline has not finished for this session.
    #[error("application is still being processed")]
    NotReady,

    /// Another caller is committing this session.
    #[error("application is being committed")]
    Committing,

    /// The session finished with validation errors or an internal failure.
    #[error("application has errors and can not be committed")]
    HasErrors,

    /// Versions committed since validation make this version invalid.
    #[error("version conflicts with stored versions: {0}")]
    Conflict(String),

    /// The uploaded package could not be unpacked.
    #[error(transparent)]
    Package(#[from] PackageError),

    /// The package could not be downloaded.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Infrastructure fault. Detail is logged, not shown.
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl From<anyhow::Error> for GetterError {
    fn from(e: anyhow::Error) -> Self {
        GetterError::Internal(e)
    }
}
