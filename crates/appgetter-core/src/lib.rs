//! # AppGetter Core
//!
//! Runtime-free logic for the AppGetter ingestion pipeline: data models,
//! manifest parsing and metadata validation, version sequencing, route
//! descriptors, and the application store abstraction.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or sandbox code.
//! Everything here is deterministic and can be tested without a runtime.

pub mod manifest;
pub mod models;
pub mod routes;
pub mod store;
pub mod versions;
