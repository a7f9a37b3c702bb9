//! `AppGetter`: entry point for application ingestion.
//!
//! Accepts packages (files, zip archives, URLs, or an existing location),
//! hands out a processing token per submission and runs the
//! [`crate::pipeline`] for it in the background. Callers poll
//! [`AppGetter::get_results`] / [`AppGetter::get_last_event`], or
//! [`AppGetter::subscribe`] to progress events, and finish the session with
//! one of:
//!
//! | Operation | Files | App/version rows | Session bookkeeping |
//! |-----------|-------|------------------|---------------------|
//! | [`commit`](AppGetter::commit) | kept | created | removed |
//! | [`delete`](AppGetter::delete) | deleted | untouched | removed |
//! | [`delete_key_data`](AppGetter::delete_key_data) | kept | untouched | removed |
//!
//! A session being committed can not be deleted, and only a session whose
//! pipeline finished cleanly can be committed. A version added to an
//! existing app is checked against the stored versions once more at commit
//! time, one commit per app at a time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use appgetter_core::models::{AppId, NewVersion, UserId};
use appgetter_core::routes::{RouteValidator, StructuralValidator};
use appgetter_core::store::AppStore;
use appgetter_core::versions::{check_sequence, VersionSchema};
use sqlx::SqlitePool;

use crate::audit::{AuditLog, LocationLog};
use crate::config::Config;
use crate::error::GetterError;
use crate::events::{EventHub, ProcessEvent, Subscription, SubscriptionId};
use crate::fetch::fetch_archive;
use crate::keys::{KeyRegistry, ProcessResults, Session, SessionState};
use crate::package::{unpack_zip, PackageError, PackageFile};
use crate::pipeline::{self, AUDIT_SOURCE, STEP_STARTING};
use crate::sandbox::{LuaLauncher, SandboxLauncher};
use crate::sqlite_store::SqliteAppStore;
use crate::storage::{AppFiles, LocalAppFiles};

/// Step label of the event sent to subscribers of a discarded session.
pub const STEP_REMOVED: &str = "Removed";

/// Host-side limits and rules.
#[derive(Debug, Clone)]
pub struct Settings {
    pub supported_api_versions: Vec<u32>,
    pub route_timeout: Duration,
    pub max_package_bytes: u64,
    pub fetch_timeout: Duration,
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            supported_api_versions: config.ingest.supported_api_versions.clone(),
            route_timeout: config.sandbox.route_timeout(),
            max_package_bytes: config.ingest.max_package_bytes,
            fetch_timeout: Duration::from_secs(config.ingest.fetch_timeout_secs),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            supported_api_versions: vec![0],
            route_timeout: Duration::from_secs(60),
            max_package_bytes: 50 * 1024 * 1024,
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

/// The collaborators the pipeline and the lifecycle operations talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub files: Arc<dyn AppFiles>,
    pub store: Arc<dyn AppStore>,
    pub audit: Arc<dyn AuditLog>,
    pub launcher: Arc<dyn SandboxLauncher>,
    pub validator: Arc<dyn RouteValidator>,
}

pub(crate) struct Inner {
    pub(crate) files: Arc<dyn AppFiles>,
    pub(crate) store: Arc<dyn AppStore>,
    pub(crate) audit: Arc<dyn AuditLog>,
    pub(crate) launcher: Arc<dyn SandboxLauncher>,
    pub(crate) validator: Arc<dyn RouteValidator>,
    pub(crate) registry: KeyRegistry,
    pub(crate) hub: EventHub,
    pub(crate) settings: Settings,
    /// Serializes commits that add a version to the same app.
    app_locks: Mutex<HashMap<AppId, Arc<tokio::sync::Mutex<()>>>>,
}

#[derive(Clone)]
pub struct AppGetter {
    inner: Arc<Inner>,
}

impl AppGetter {
    pub fn new(collaborators: Collaborators, settings: Settings) -> Self {
        Self::with_registry(collaborators, settings, KeyRegistry::new())
    }

    /// Use a caller-built registry, e.g. one with a seeded random source.
    pub fn with_registry(
        collaborators: Collaborators,
        settings: Settings,
        registry: KeyRegistry,
    ) -> Self {
        let Collaborators {
            files,
            store,
            audit,
            launcher,
            validator,
        } = collaborators;
        Self {
            inner: Arc::new(Inner {
                files,
                store,
                audit,
                launcher,
                validator,
                registry,
                hub: EventHub::new(),
                settings,
                app_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Production wiring: local files, SQLite rows, Lua sandboxes.
    pub fn from_config(config: &Config, pool: SqlitePool) -> Self {
        let files = LocalAppFiles::new(&config.storage.root);
        let collaborators = Collaborators {
            files: Arc::new(files.clone()),
            store: Arc::new(SqliteAppStore::new(pool)),
            audit: Arc::new(LocationLog::new(&config.storage.root)),
            launcher: Arc::new(LuaLauncher::new(files)),
            validator: Arc::new(StructuralValidator),
        };
        Self::new(collaborators, Settings::from_config(config))
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    // ═══════════════════════════════════════════════════════════════════
    // Submission
    // ═══════════════════════════════════════════════════════════════════

    /// Store `files` in a fresh location and start processing them.
    pub async fn install_files(
        &self,
        user_id: UserId,
        files: &[PackageFile],
        app_id: Option<AppId>,
    ) -> Result<String, GetterError> {
        if files.is_empty() {
            return Err(PackageError::Empty.into());
        }
        let location = self
            .inner
            .files
            .save(files)
            .await
            .context("Failed to save package")?;
        Ok(self.submit(Session::new(user_id, location, app_id)))
    }

    /// Unpack a zip archive and process it.
    pub async fn install_archive(
        &self,
        user_id: UserId,
        archive: Vec<u8>,
        app_id: Option<AppId>,
    ) -> Result<String, GetterError> {
        let max_bytes = self.inner.settings.max_package_bytes;
        let files = tokio::task::spawn_blocking(move || unpack_zip(&archive, max_bytes))
            .await
            .context("archive unpacking task panicked")??;
        self.install_files(user_id, &files, app_id).await
    }

    /// Download an archive and process it.
    pub async fn install_from_url(
        &self,
        user_id: UserId,
        url: &str,
        app_id: Option<AppId>,
    ) -> Result<String, GetterError> {
        let settings = &self.inner.settings;
        let archive = fetch_archive(url, settings.max_package_bytes, settings.fetch_timeout).await?;
        self.install_archive(user_id, archive, app_id).await
    }

    /// Process files already stored at `location` again.
    pub async fn reprocess(
        &self,
        user_id: UserId,
        app_id: Option<AppId>,
        location: &str,
    ) -> Result<String, GetterError> {
        if !self.inner.files.exists(location).await? {
            return Err(GetterError::NotFound);
        }
        Ok(self.submit(Session::new(user_id, location, app_id)))
    }

    fn submit(&self, session: Session) -> String {
        let location = session.location.clone();
        let token = self.inner.registry.submit(session);
        self.inner.hub.open(&token);
        self.inner.hub.send(ProcessEvent::step(&token, STEP_STARTING));
        info!(token = %token, location = %location, "processing application");

        tokio::spawn(pipeline::process(self.inner.clone(), token.clone()));
        token
    }

    // ═══════════════════════════════════════════════════════════════════
    // Observation
    // ═══════════════════════════════════════════════════════════════════

    pub fn get_results(&self, token: &str) -> Option<ProcessResults> {
        self.inner.registry.get_results(token)
    }

    pub fn get_last_event(&self, token: &str) -> Option<ProcessEvent> {
        self.inner.hub.last_event(token)
    }

    pub fn get_location(&self, token: &str) -> Option<String> {
        self.inner.registry.get(token).map(|s| s.location)
    }

    pub fn session_state(&self, token: &str) -> Option<SessionState> {
        self.inner.registry.get(token).map(|s| s.state)
    }

    /// See [`EventHub::subscribe`].
    pub fn subscribe(&self, token: &str) -> (Option<ProcessEvent>, Option<Subscription>) {
        self.inner.hub.subscribe(token)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.hub.unsubscribe(id);
    }

    pub fn unsubscribe_all(&self, token: &str) {
        self.inner.hub.unsubscribe_all(token);
    }

    /// Wait for the session's terminal event, passing each event seen to
    /// `on_event`. Returns `None` for unknown tokens.
    pub async fn wait_done(
        &self,
        token: &str,
        mut on_event: impl FnMut(&ProcessEvent),
    ) -> Option<ProcessEvent> {
        let (last, sub) = self.subscribe(token);
        if let Some(e) = &last {
            on_event(e);
        }
        let Some(mut sub) = sub else {
            return last;
        };
        let mut last = last;
        while let Some(event) = sub.events.recv().await {
            on_event(&event);
            let done = event.done;
            last = Some(event);
            if done {
                break;
            }
        }
        self.unsubscribe(sub.id);
        last
    }

    // ═══════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════

    /// Persist a cleanly processed session as a new app version. Creates
    /// the app first when the session did not target an existing one.
    pub async fn commit(&self, token: &str) -> Result<(AppId, String), GetterError> {
        let (session, results) =
            self.inner
                .registry
                .begin_commit(token)
                .map_err(|state| match state {
                    None => GetterError::NotFound,
                    Some(SessionState::Committing) => GetterError::Committing,
                    Some(_) => GetterError::NotReady,
                })?;

        if !results.is_ok() {
            self.inner.registry.abort_commit(token);
            return Err(GetterError::HasErrors);
        }

        match self.persist(&session).await {
            Ok((app_id, version)) => {
                info!(token, app_id, version = %version, "committed application version");
                self.delete_key_data(token);
                Ok((app_id, version))
            }
            Err(GetterError::Internal(e)) => {
                self.inner.audit.log(
                    &session.location,
                    AUDIT_SOURCE,
                    &format!("commit failed: {:#}", e),
                );
                self.inner.registry.abort_commit(token);
                Err(GetterError::Internal(e))
            }
            Err(e) => {
                info!(token, error = %e, "commit refused");
                self.inner.registry.abort_commit(token);
                Err(e)
            }
        }
    }

    async fn persist(&self, session: &Session) -> Result<(AppId, String), GetterError> {
        let manifest = self
            .inner
            .files
            .read_manifest(&session.location)
            .await
            .context("Failed to re-read manifest")?;

        let row = NewVersion {
            app_id: session.app_id.unwrap_or_default(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            schema: manifest.schema,
            api_version: manifest.api_version,
            location_key: session.location.clone(),
        };

        let Some(app_id) = session.app_id else {
            let (app, version) = self
                .inner
                .store
                .create_app_with_version(session.user_id, &row)
                .await?;
            return Ok((app.app_id, version.version));
        };

        // Other sessions may have committed to this app since validation.
        let lock = self.app_lock(app_id);
        let _guard = lock.lock().await;

        let existing: Vec<VersionSchema> = self
            .inner
            .store
            .list_versions(app_id)
            .await?
            .iter()
            .map(VersionSchema::from)
            .collect();
        let candidate = VersionSchema::new(manifest.version.clone(), manifest.schema);
        let check = check_sequence(&existing, &candidate)
            .context("Failed to re-check version sequence")?;
        if !check.is_ok() {
            return Err(GetterError::Conflict(check.errors.join("; ")));
        }

        let version = self.inner.store.create_version(&row).await?;
        Ok((app_id, version.version))
    }

    fn app_lock(&self, app_id: AppId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .inner
            .app_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        locks.entry(app_id).or_default().clone()
    }

    /// Discard a session and its files, stopping any running sandbox.
    pub async fn delete(&self, token: &str) -> Result<(), GetterError> {
        let session = self
            .inner
            .registry
            .remove_unless_committing(token)
            .map_err(|state| match state {
                Some(SessionState::Committing) => GetterError::Committing,
                _ => GetterError::NotFound,
            })?;

        session.cancel.cancel();
        if let Some(sandbox) = &session.sandbox {
            sandbox.kill();
        }

        let deleted = self.inner.files.delete(&session.location).await;
        self.delete_key_data(token);

        deleted.map_err(|e| {
            self.inner.audit.log(
                &session.location,
                AUDIT_SOURCE,
                &format!("delete failed: {:#}", e),
            );
            GetterError::Internal(e)
        })?;
        info!(token, location = %session.location, "deleted application package");
        Ok(())
    }

    /// Forget a session without touching its files. Subscribers still
    /// waiting get a final `done` event.
    pub fn delete_key_data(&self, token: &str) {
        self.inner.registry.remove(token);
        self.inner.registry.remove_results(token);
        self.inner
            .hub
            .close(token, ProcessEvent::finished(token, STEP_REMOVED, true));
    }
}
