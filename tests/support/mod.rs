//! Test doubles for the collaborators of `AppGetter`.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use appgetter::audit::AuditLog;
use appgetter::getter::{AppGetter, Collaborators, Settings};
use appgetter::package::PackageFile;
use appgetter::sandbox::{
    LaunchSpec, PendingReply, Reply, ReplySender, Sandbox, SandboxError, SandboxLauncher,
    SandboxStatus, GET_ROUTES,
};
use appgetter::storage::LocalAppFiles;
use appgetter_core::models::{App, AppId, AppVersion, NewVersion, UserId};
use appgetter_core::routes::StructuralValidator;
use appgetter_core::store::memory::InMemoryAppStore;
use appgetter_core::store::AppStore;

pub const ONE_ROUTE: &str = r#"[{
    "method": "GET",
    "path": { "path": "/", "end": true },
    "auth": { "allow": "public" },
    "handler": { "type": "function", "function": "index" }
}]"#;

/// How a [`FakeSandbox`] answers the route request.
#[derive(Clone)]
pub enum Behavior {
    Reply(Reply),
    /// Never answers.
    Silent,
}

impl Behavior {
    pub fn routes(json: &str) -> Self {
        Behavior::Reply(Reply {
            command: GET_ROUTES,
            payload: json.as_bytes().to_vec(),
        })
    }
}

pub struct FakeSandbox {
    behavior: Behavior,
    parked: Mutex<Vec<ReplySender>>,
    status: Mutex<SandboxStatus>,
    pub kills: AtomicUsize,
    pub graceful: AtomicUsize,
}

impl Sandbox for FakeSandbox {
    fn status(&self) -> SandboxStatus {
        *self.status.lock().unwrap()
    }

    fn kill(&self) {
        let mut status = self.status.lock().unwrap();
        if !status.is_alive() {
            return;
        }
        self.kills.fetch_add(1, Ordering::SeqCst);
        *status = SandboxStatus::Killed;
        self.parked.lock().unwrap().clear();
    }

    fn graceful(&self) {
        self.graceful.fetch_add(1, Ordering::SeqCst);
        *self.status.lock().unwrap() = SandboxStatus::Dead;
    }

    fn send_message(
        &self,
        _service: u16,
        _command: u16,
        _payload: Vec<u8>,
    ) -> Result<PendingReply, SandboxError> {
        let (tx, pending) = PendingReply::channel();
        match &self.behavior {
            Behavior::Reply(reply) => {
                let _ = tx.send(Ok(reply.clone()));
            }
            Behavior::Silent => self.parked.lock().unwrap().push(tx),
        }
        Ok(pending)
    }
}

pub struct FakeLauncher {
    behavior: Mutex<Behavior>,
    pub launched: Mutex<Vec<Arc<FakeSandbox>>>,
    pub specs: Mutex<Vec<LaunchSpec>>,
}

impl FakeLauncher {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            launched: Mutex::new(Vec::new()),
            specs: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn launch_count(&self) -> usize {
        self.launched.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<FakeSandbox> {
        self.launched.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl SandboxLauncher for FakeLauncher {
    async fn launch_for_app(&self, spec: &LaunchSpec) -> Result<Arc<dyn Sandbox>> {
        let sandbox = Arc::new(FakeSandbox {
            behavior: self.behavior.lock().unwrap().clone(),
            parked: Mutex::new(Vec::new()),
            status: Mutex::new(SandboxStatus::Ready),
            kills: AtomicUsize::new(0),
            graceful: AtomicUsize::new(0),
        });
        self.specs.lock().unwrap().push(spec.clone());
        self.launched.lock().unwrap().push(sandbox.clone());
        Ok(sandbox)
    }
}

#[derive(Default)]
pub struct RecordingAudit {
    pub entries: Mutex<Vec<(String, String, String)>>,
}

impl RecordingAudit {
    pub fn messages(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, m)| m.clone())
            .collect()
    }
}

impl AuditLog for RecordingAudit {
    fn log(&self, location: &str, source: &str, message: &str) {
        self.entries.lock().unwrap().push((
            location.to_string(),
            source.to_string(),
            message.to_string(),
        ));
    }
}

/// [`InMemoryAppStore`] whose app creation waits until released.
pub struct GatedStore {
    pub inner: InMemoryAppStore,
    pub gate: tokio::sync::Semaphore,
}

impl GatedStore {
    pub fn closed() -> Self {
        Self {
            inner: InMemoryAppStore::new(),
            gate: tokio::sync::Semaphore::new(0),
        }
    }

    pub fn open(&self) {
        self.gate.add_permits(1000);
    }
}

#[async_trait]
impl AppStore for GatedStore {
    async fn create_app(&self, owner_id: UserId, name: &str) -> Result<App> {
        let _permit = self.gate.acquire().await?;
        self.inner.create_app(owner_id, name).await
    }
    async fn get_app(&self, app_id: AppId) -> Result<Option<App>> {
        self.inner.get_app(app_id).await
    }
    async fn create_version(&self, version: &NewVersion) -> Result<AppVersion> {
        self.inner.create_version(version).await
    }
    async fn create_app_with_version(
        &self,
        owner_id: UserId,
        version: &NewVersion,
    ) -> Result<(App, AppVersion)> {
        let _permit = self.gate.acquire().await?;
        self.inner.create_app_with_version(owner_id, version).await
    }
    async fn list_versions(&self, app_id: AppId) -> Result<Vec<AppVersion>> {
        self.inner.list_versions(app_id).await
    }
}

/// [`InMemoryAppStore`] whose next `failures` version writes fail without
/// writing anything.
pub struct FlakyStore {
    pub inner: InMemoryAppStore,
    failures: AtomicUsize,
}

impl FlakyStore {
    pub fn failing(failures: usize) -> Self {
        Self {
            inner: InMemoryAppStore::new(),
            failures: AtomicUsize::new(failures),
        }
    }

    fn fail_now(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl AppStore for FlakyStore {
    async fn create_app(&self, owner_id: UserId, name: &str) -> Result<App> {
        self.inner.create_app(owner_id, name).await
    }
    async fn get_app(&self, app_id: AppId) -> Result<Option<App>> {
        self.inner.get_app(app_id).await
    }
    async fn create_version(&self, version: &NewVersion) -> Result<AppVersion> {
        if self.fail_now() {
            anyhow::bail!("database is locked");
        }
        self.inner.create_version(version).await
    }
    async fn create_app_with_version(
        &self,
        owner_id: UserId,
        version: &NewVersion,
    ) -> Result<(App, AppVersion)> {
        if self.fail_now() {
            anyhow::bail!("database is locked");
        }
        self.inner.create_app_with_version(owner_id, version).await
    }
    async fn list_versions(&self, app_id: AppId) -> Result<Vec<AppVersion>> {
        self.inner.list_versions(app_id).await
    }
}

pub struct Harness {
    pub tmp: TempDir,
    pub files: Arc<LocalAppFiles>,
    pub store: Arc<dyn AppStore>,
    pub audit: Arc<RecordingAudit>,
    pub launcher: Arc<FakeLauncher>,
    pub getter: AppGetter,
}

impl Harness {
    pub fn new(behavior: Behavior) -> Self {
        Self::with_store(behavior, Arc::new(InMemoryAppStore::new()))
    }

    pub fn with_store(behavior: Behavior, store: Arc<dyn AppStore>) -> Self {
        let tmp = TempDir::new().unwrap();
        let files = Arc::new(LocalAppFiles::new(tmp.path()));
        let audit = Arc::new(RecordingAudit::default());
        let launcher = Arc::new(FakeLauncher::new(behavior));
        let getter = AppGetter::new(
            Collaborators {
                files: files.clone(),
                store: store.clone(),
                audit: audit.clone(),
                launcher: launcher.clone(),
                validator: Arc::new(StructuralValidator),
            },
            Settings::default(),
        );
        Self {
            tmp,
            files,
            store,
            audit,
            launcher,
            getter,
        }
    }
}

/// A minimal package with the given manifest JSON and an `app.lua`.
pub fn package(manifest: &str) -> Vec<PackageFile> {
    vec![
        PackageFile::new("app.json", manifest),
        PackageFile::new("app.lua", "function routes() return {} end"),
    ]
}

pub fn seed_version(store: &InMemoryAppStore, app_id: AppId, version: &str, schema: u32) {
    store.insert_version(AppVersion {
        app_id,
        name: "notes".to_string(),
        version: version.to_string(),
        schema,
        api_version: 0,
        location_key: format!("seed{}", version.replace('.', "")),
        created: chrono::Utc::now(),
    });
}

/// Number of package locations under the storage root.
pub fn location_count(tmp: &TempDir) -> usize {
    std::fs::read_dir(tmp.path()).unwrap().count()
}

pub fn kills(sandbox: &FakeSandbox) -> usize {
    sandbox.kills.load(Ordering::SeqCst)
}
