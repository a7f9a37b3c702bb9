//! Lua 5.4 sandbox for application code.
//!
//! Each [`LuaSandbox`] owns one VM on a dedicated OS thread. Messages reach
//! the thread over a channel and are handled one at a time; every message
//! carries a oneshot sender for its reply.
//!
//! ```text
//!  pipeline ── send_message ──▶ mpsc ──▶ [ sandbox thread: Lua VM ]
//!     ▲                                           │
//!     └──────────── PendingReply ◀── oneshot ─────┘
//! ```
//!
//! # Host APIs
//!
//! | Module | Functions |
//! |--------|-----------|
//! | `log` | `info`, `warn`, `error`, `debug` |
//! | `json` | `parse`, `encode` |
//!
//! # Sandboxing
//!
//! `os`, `io`, `debug`, `loadfile` and `dofile` are removed. `require` only
//! resolves modules inside the package. An instruction hook checks the kill
//! flag, so [`Sandbox::kill`] stops even code stuck in a loop.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use mlua::prelude::*;
use tracing::{debug, error, info, warn};

use super::{
    LaunchSpec, PendingReply, Reply, ReplySender, Sandbox, SandboxError, SandboxLauncher,
    SandboxStatus, GET_ROUTES, ROUTES_SERVICE,
};
use crate::storage::LocalAppFiles;

/// Launches a [`LuaSandbox`] for packages kept in [`LocalAppFiles`].
#[derive(Debug, Clone)]
pub struct LuaLauncher {
    files: LocalAppFiles,
}

impl LuaLauncher {
    pub fn new(files: LocalAppFiles) -> Self {
        Self { files }
    }
}

#[async_trait]
impl SandboxLauncher for LuaLauncher {
    async fn launch_for_app(&self, spec: &LaunchSpec) -> Result<Arc<dyn Sandbox>> {
        let app_dir = self.files.app_dir(&spec.location)?;
        let sandbox = LuaSandbox::start(app_dir, spec)?;
        Ok(Arc::new(sandbox))
    }
}

struct Envelope {
    service: u16,
    command: u16,
    reply: ReplySender,
}

struct Shared {
    status: Mutex<SandboxStatus>,
    killed: AtomicBool,
    /// Why the application failed to load, if it did.
    failure: Mutex<Option<String>>,
}

impl Shared {
    fn set_status(&self, status: SandboxStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    fn status(&self) -> SandboxStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `Starting -> Ready`, unless a kill got there first.
    fn mark_ready(&self) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if *status == SandboxStatus::Starting {
            *status = SandboxStatus::Ready;
        }
    }

    /// Flip a live sandbox to `Killed`. Returns false if it was already
    /// stopped or killed.
    fn mark_killed(&self) -> bool {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if !status.is_alive() {
            return false;
        }
        *status = SandboxStatus::Killed;
        self.killed.store(true, Ordering::SeqCst);
        true
    }
}

pub struct LuaSandbox {
    shared: Arc<Shared>,
    tx: Mutex<Option<mpsc::Sender<Envelope>>>,
}

impl LuaSandbox {
    /// Spawn the VM thread. Loading the application happens on that thread,
    /// so this returns before the entrypoint has run.
    pub fn start(app_dir: PathBuf, spec: &LaunchSpec) -> Result<Self> {
        let shared = Arc::new(Shared {
            status: Mutex::new(SandboxStatus::Starting),
            killed: AtomicBool::new(false),
            failure: Mutex::new(None),
        });
        let (tx, rx) = mpsc::channel();

        let thread_shared = shared.clone();
        let location = spec.location.clone();
        let entrypoint = spec.entrypoint.clone();
        std::thread::Builder::new()
            .name(format!("sandbox-{}", spec.location))
            .spawn(move || run_vm(&app_dir, &entrypoint, &location, rx, thread_shared))
            .context("Failed to spawn sandbox thread")?;

        Ok(Self {
            shared,
            tx: Mutex::new(Some(tx)),
        })
    }

    fn take_sender(&self) -> Option<mpsc::Sender<Envelope>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl Sandbox for LuaSandbox {
    fn status(&self) -> SandboxStatus {
        self.shared.status()
    }

    fn kill(&self) {
        if self.shared.mark_killed() {
            self.take_sender();
        }
    }

    fn graceful(&self) {
        self.take_sender();
    }

    fn send_message(
        &self,
        service: u16,
        command: u16,
        _payload: Vec<u8>,
    ) -> Result<PendingReply, SandboxError> {
        if self.shared.killed.load(Ordering::SeqCst) {
            return Err(SandboxError::Killed);
        }
        if self.shared.status() == SandboxStatus::Dead {
            let failure = self
                .shared
                .failure
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            return Err(failure.map(SandboxError::Script).unwrap_or(SandboxError::Closed));
        }

        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            return Err(SandboxError::Closed);
        };
        let (reply, pending) = PendingReply::channel();
        tx.send(Envelope {
            service,
            command,
            reply,
        })
        .map_err(|_| SandboxError::Closed)?;
        Ok(pending)
    }
}

impl Drop for LuaSandbox {
    fn drop(&mut self) {
        self.take_sender();
    }
}

fn run_vm(
    app_dir: &Path,
    entrypoint: &str,
    location: &str,
    rx: mpsc::Receiver<Envelope>,
    shared: Arc<Shared>,
) {
    let lua = Lua::new();

    match load_app(&lua, app_dir, entrypoint, location, &shared) {
        Ok(()) => {
            shared.mark_ready();
            while let Ok(env) = rx.recv() {
                if shared.killed.load(Ordering::SeqCst) {
                    let _ = env.reply.send(Err(SandboxError::Killed));
                    break;
                }
                let result = handle_message(&lua, env.service, env.command, &shared);
                let _ = env.reply.send(result);
            }
        }
        Err(e) => {
            let message = e.to_string();
            warn!(location, error = %message, "application failed to load");
            *shared.failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.clone());
            for env in rx.try_iter() {
                let _ = env.reply.send(Err(SandboxError::Script(message.clone())));
            }
        }
    }

    if shared.killed.load(Ordering::SeqCst) {
        shared.set_status(SandboxStatus::Killed);
    } else {
        shared.set_status(SandboxStatus::Dead);
    }
    debug!(location, "sandbox stopped");
}

fn load_app(
    lua: &Lua,
    app_dir: &Path,
    entrypoint: &str,
    location: &str,
    shared: &Arc<Shared>,
) -> Result<()> {
    let script_src = std::fs::read_to_string(app_dir.join(entrypoint))
        .with_context(|| format!("Failed to read entrypoint {}", entrypoint))?;

    let hook_shared = shared.clone();
    lua.set_hook(
        mlua::HookTriggers::new().every_nth_instruction(10_000),
        move |_lua, _debug| {
            if hook_shared.killed.load(Ordering::SeqCst) {
                Err(mlua::Error::RuntimeError("sandbox killed".to_string()))
            } else {
                Ok(mlua::VmState::Continue)
            }
        },
    );

    register_host_apis(lua, location, app_dir)?;

    lua.load(&script_src)
        .set_name(entrypoint)
        .exec()
        .map_err(|e| anyhow::anyhow!("Failed to run {}: {}", entrypoint, e))?;
    Ok(())
}

fn handle_message(
    lua: &Lua,
    service: u16,
    command: u16,
    shared: &Shared,
) -> Result<Reply, SandboxError> {
    if (service, command) != (ROUTES_SERVICE, GET_ROUTES) {
        return Err(SandboxError::Protocol(format!(
            "unknown service {} command {}",
            service, command
        )));
    }

    let routes: LuaFunction = lua
        .globals()
        .get::<LuaFunction>("routes")
        .map_err(|_| SandboxError::Script("application does not define routes()".to_string()))?;

    let value = routes.call::<LuaValue>(()).map_err(|e| {
        if shared.killed.load(Ordering::SeqCst) {
            SandboxError::Killed
        } else {
            SandboxError::Script(e.to_string())
        }
    })?;

    let json = match lua_value_to_json(value).map_err(|e| SandboxError::Script(e.to_string()))? {
        serde_json::Value::Object(map) if map.is_empty() => serde_json::Value::Array(Vec::new()),
        other => other,
    };
    let payload =
        serde_json::to_vec(&json).map_err(|e| SandboxError::Protocol(e.to_string()))?;

    Ok(Reply {
        command: GET_ROUTES,
        payload,
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Host APIs
// ═══════════════════════════════════════════════════════════════════════

fn register_host_apis(lua: &Lua, location: &str, app_dir: &Path) -> LuaResult<()> {
    sandbox_globals(lua, app_dir)?;
    register_json_api(lua)?;
    register_log_api(lua, location)?;
    Ok(())
}

/// Remove dangerous standard library functions and confine `require` to
/// the package directory.
fn sandbox_globals(lua: &Lua, app_dir: &Path) -> LuaResult<()> {
    let globals = lua.globals();
    globals.set("os", LuaValue::Nil)?;
    globals.set("io", LuaValue::Nil)?;
    globals.set("loadfile", LuaValue::Nil)?;
    globals.set("dofile", LuaValue::Nil)?;
    globals.set("debug", LuaValue::Nil)?;

    let package: LuaTable = globals.get::<LuaTable>("package")?;
    let root = app_dir.to_string_lossy();
    package.set("path", format!("{root}/?.lua;{root}/?/init.lua"))?;
    package.set("cpath", "")?;
    Ok(())
}

fn register_json_api(lua: &Lua) -> LuaResult<()> {
    let json_table = lua.create_table()?;

    json_table.set(
        "parse",
        lua.create_function(|lua, s: String| {
            let value: serde_json::Value = serde_json::from_str(&s)
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("json.parse: {}", e)))?;
            json_value_to_lua(lua, &value)
        })?,
    )?;

    json_table.set(
        "encode",
        lua.create_function(|_lua, value: LuaValue| {
            let json = lua_value_to_json(value)?;
            serde_json::to_string(&json)
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("json.encode: {}", e)))
        })?,
    )?;

    lua.globals().set("json", json_table)?;
    Ok(())
}

/// `log.*` goes to `tracing` with the package location as a field.
fn register_log_api(lua: &Lua, location: &str) -> LuaResult<()> {
    let log = lua.create_table()?;

    let loc = location.to_string();
    log.set(
        "info",
        lua.create_function(move |_lua, msg: String| {
            info!(location = %loc, "app: {}", msg);
            Ok(())
        })?,
    )?;

    let loc = location.to_string();
    log.set(
        "warn",
        lua.create_function(move |_lua, msg: String| {
            warn!(location = %loc, "app: {}", msg);
            Ok(())
        })?,
    )?;

    let loc = location.to_string();
    log.set(
        "error",
        lua.create_function(move |_lua, msg: String| {
            error!(location = %loc, "app: {}", msg);
            Ok(())
        })?,
    )?;

    let loc = location.to_string();
    log.set(
        "debug",
        lua.create_function(move |_lua, msg: String| {
            debug!(location = %loc, "app: {}", msg);
            Ok(())
        })?,
    )?;

    lua.globals().set("log", log)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Value conversions: JSON ↔ Lua
// ═══════════════════════════════════════════════════════════════════════

fn json_value_to_lua(lua: &Lua, value: &serde_json::Value) -> LuaResult<LuaValue> {
    match value {
        serde_json::Value::Null => Ok(LuaValue::Nil),
        serde_json::Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(LuaValue::Integer(i)),
            None => Ok(LuaValue::Number(n.as_f64().unwrap_or(0.0))),
        },
        serde_json::Value::String(s) => lua.create_string(s).map(LuaValue::String),
        serde_json::Value::Array(arr) => {
            let table = lua.create_table()?;
            for (i, v) in arr.iter().enumerate() {
                table.set(i as i64 + 1, json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        serde_json::Value::Object(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.set(k.as_str(), json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}

/// Tables with a sequence part become arrays, anything else an object.
fn lua_value_to_json(value: LuaValue) -> LuaResult<serde_json::Value> {
    match value {
        LuaValue::Nil => Ok(serde_json::Value::Null),
        LuaValue::Boolean(b) => Ok(serde_json::Value::Bool(b)),
        LuaValue::Integer(i) => Ok(serde_json::Value::Number(i.into())),
        LuaValue::Number(n) => Ok(serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        LuaValue::String(s) => Ok(serde_json::Value::String(s.to_str()?.to_string())),
        LuaValue::Table(t) => {
            let len = t.raw_len();
            if len > 0 {
                let mut arr = Vec::with_capacity(len);
                for i in 1..=len {
                    let v: LuaValue = t.raw_get(i)?;
                    arr.push(lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Array(arr))
            } else {
                let mut map = serde_json::Map::new();
                for pair in t.pairs::<String, LuaValue>() {
                    let (k, v) = pair?;
                    map.insert(k, lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Object(map))
            }
        }
        _ => Ok(serde_json::Value::Null),
    }
}
