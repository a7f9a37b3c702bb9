//! Route descriptors declared by an application and their structural checks.
//!
//! An app reports its routes when asked by the host during ingestion. The
//! reply is a JSON array of [`RouteDescriptor`]s:
//!
//! ```json
//! [
//!   {
//!     "method": "GET",
//!     "path": { "path": "/notes", "end": true },
//!     "auth": { "allow": "authorized", "permission": "read" },
//!     "handler": { "type": "function", "function": "listNotes" }
//!   },
//!   {
//!     "method": "GET",
//!     "path": { "path": "/static", "end": false },
//!     "auth": { "allow": "public" },
//!     "handler": { "type": "static", "path": "frontend/" }
//!   }
//! ]
//! ```
//!
//! Deserialization rejects unknown keys and unknown handler types. The
//! [`RouteValidator`] then checks the table as a whole.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::manifest::is_package_relative;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Options => "OPTIONS",
        };
        f.write_str(s)
    }
}

/// Path matcher. `end: true` matches the path exactly, otherwise it is a
/// prefix match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutePath {
    pub path: String,
    #[serde(default)]
    pub end: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteAllow {
    Public,
    Authorized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteAuth {
    pub allow: RouteAllow,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum RouteHandler {
    /// Call an exported function of the app.
    Function {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<String>,
        function: String,
    },
    /// Serve files from a package directory.
    Static { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteDescriptor {
    pub method: HttpMethod,
    pub path: RoutePath,
    pub auth: RouteAuth,
    pub handler: RouteHandler,
}

/// Parse a route-table payload. Anything but an array of well-formed
/// descriptors is an error.
pub fn parse_routes(payload: &[u8]) -> Result<Vec<RouteDescriptor>, serde_json::Error> {
    serde_json::from_slice(payload)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("route {index}: path {path:?} must start with /")]
    PathNotAbsolute { index: usize, path: String },
    #[error("route {index}: {method} {path} is declared more than once")]
    Duplicate {
        index: usize,
        method: HttpMethod,
        path: String,
    },
    #[error("route {index}: static path can not be blank")]
    BlankStaticPath { index: usize },
    #[error("route {index}: static path {path:?} must stay inside the package")]
    StaticPathEscapes { index: usize, path: String },
    #[error("route {index}: function name can not be blank")]
    BlankFunction { index: usize },
    #[error("route {index}: permission can not be blank")]
    BlankPermission { index: usize },
    #[error("route {index}: public routes can not require a permission")]
    PermissionOnPublic { index: usize },
}

/// Checks a full route table before it is written to storage.
pub trait RouteValidator: Send + Sync {
    fn validate_routes(&self, routes: &[RouteDescriptor]) -> Result<(), RouteError>;
}

/// Default validator: per-route shape plus uniqueness across the table.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralValidator;

impl RouteValidator for StructuralValidator {
    fn validate_routes(&self, routes: &[RouteDescriptor]) -> Result<(), RouteError> {
        let mut seen = HashSet::new();
        for (index, route) in routes.iter().enumerate() {
            if !route.path.path.starts_with('/') {
                return Err(RouteError::PathNotAbsolute {
                    index,
                    path: route.path.path.clone(),
                });
            }
            if !seen.insert((route.method, route.path.path.as_str(), route.path.end)) {
                return Err(RouteError::Duplicate {
                    index,
                    method: route.method,
                    path: route.path.path.clone(),
                });
            }

            match (&route.auth.allow, &route.auth.permission) {
                (RouteAllow::Public, Some(_)) => {
                    return Err(RouteError::PermissionOnPublic { index })
                }
                (RouteAllow::Authorized, Some(p)) if p.trim().is_empty() => {
                    return Err(RouteError::BlankPermission { index })
                }
                _ => {}
            }

            match &route.handler {
                RouteHandler::Static { path } => {
                    if path.trim().is_empty() {
                        return Err(RouteError::BlankStaticPath { index });
                    }
                    if !is_package_relative(path) {
                        return Err(RouteError::StaticPathEscapes {
                            index,
                            path: path.clone(),
                        });
                    }
                }
                RouteHandler::Function { function, .. } => {
                    if function.trim().is_empty() {
                        return Err(RouteError::BlankFunction { index });
                    }
                }
            }
        }
        Ok(())
    }
}
