//! # AppGetter
//!
//! Ingestion and validation pipeline for sandboxed appspace applications.
//!
//! A package (zip archive, directory, or URL) is stored in its own location
//! and handed a processing token. In the background its manifest is
//! validated, a new version is checked against the versions already stored
//! for the app, and a single-use Lua sandbox is asked for the app's route
//! table. Callers follow progress by polling or subscribing, then commit
//! the package as a new app version or delete it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │ HTTP/CLI │──▶│  AppGetter  │──▶│   Pipeline   │──▶│ Sandbox  │
//! └──────────┘   │ keys events │   │ (tokio task) │   │  (Lua)   │
//!                └──────┬──────┘   └──────┬───────┘   └──────────┘
//!                       │                 │
//!                       ▼                 ▼
//!                 ┌──────────┐      ┌──────────┐
//!                 │  SQLite  │      │  Files   │
//!                 │ apps/ver │      │ location │
//!                 └──────────┘      └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! appgetter init                       # create database
//! appgetter check ./my-app             # validate a package, then discard it
//! appgetter install ./my-app.zip       # validate and commit as a new app
//! appgetter install ./v2 --app-id 1    # add a version to app 1
//! appgetter versions 1
//! appgetter serve                      # start HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`getter`] | Submission, observation and commit/delete lifecycle |
//! | [`pipeline`] | Per-session validation and route discovery |
//! | [`keys`] | Token registry and results |
//! | [`events`] | Progress event hub |
//! | [`sandbox`] | Sandbox interface and the Lua sandbox |
//! | [`storage`] | Package file storage |
//! | [`package`] | Zip and directory intake |
//! | [`sqlite_store`] | SQLite app/version rows |
//! | [`server`] | HTTP API |
//! | [`config`] | TOML configuration parsing |

pub mod audit;
pub mod check;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod fetch;
pub mod getter;
pub mod keys;
pub mod list;
pub mod migrate;
pub mod package;
pub mod pipeline;
pub mod progress;
pub mod sandbox;
pub mod server;
pub mod sqlite_store;
pub mod storage;
