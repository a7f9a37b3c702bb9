//! Key registry: the token → session map and the token → results map.
//!
//! Both maps, and the random source tokens are drawn from, sit behind one
//! mutex. Tokens are 20 characters from a 32-letter alphabet (100 bits) and
//! are checked against the live map before being handed out.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::{RngCore, SeedableRng};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use appgetter_core::manifest::AppManifest;
use appgetter_core::models::{AppId, UserId};

use crate::sandbox::Sandbox;

const TOKEN_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";
const TOKEN_LEN: usize = 20;

/// Where a session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// The pipeline is still running.
    Processing,
    /// Results are available; the session may be committed or deleted.
    Ready,
    /// A commit is persisting this session.
    Committing,
}

/// Per-token bookkeeping for one ingestion.
#[derive(Clone)]
pub struct Session {
    pub user_id: UserId,
    pub location: String,
    /// Set when the package is a new version of an existing app.
    pub app_id: Option<AppId>,
    pub sandbox: Option<Arc<dyn Sandbox>>,
    pub cancel: CancellationToken,
    pub state: SessionState,
}

impl Session {
    pub fn new(user_id: UserId, location: impl Into<String>, app_id: Option<AppId>) -> Self {
        Self {
            user_id,
            location: location.into(),
            app_id,
            sandbox: None,
            cancel: CancellationToken::new(),
            state: SessionState::Processing,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("location", &self.location)
            .field("app_id", &self.app_id)
            .field("sandbox", &self.sandbox.is_some())
            .field("state", &self.state)
            .finish()
    }
}

/// Final outcome of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessResults {
    pub token: String,
    pub manifest: Option<AppManifest>,
    pub errors: Vec<String>,
    pub warnings: BTreeMap<String, String>,
    pub prev_version: Option<String>,
    pub next_version: Option<String>,
    /// An infrastructure fault ended the run. Detail went to the audit log.
    pub internal_error: bool,
}

impl ProcessResults {
    pub fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty() && !self.internal_error
    }
}

struct Registry {
    sessions: HashMap<String, Session>,
    results: HashMap<String, ProcessResults>,
    rng: Box<dyn RngCore + Send>,
}

impl Registry {
    fn new_token(&mut self) -> String {
        let mut bytes = [0u8; TOKEN_LEN];
        loop {
            self.rng.fill_bytes(&mut bytes);
            let token: String = bytes
                .iter()
                .map(|b| TOKEN_ALPHABET[(*b as usize) % TOKEN_ALPHABET.len()] as char)
                .collect();
            if !self.sessions.contains_key(&token) && !self.results.contains_key(&token) {
                return token;
            }
        }
    }
}

pub struct KeyRegistry {
    inner: Mutex<Registry>,
}

impl KeyRegistry {
    /// Registry drawing tokens from the operating system's random source.
    pub fn new() -> Self {
        Self::with_rng(Box::new(rand::rngs::StdRng::from_entropy()))
    }

    pub fn with_rng(rng: Box<dyn RngCore + Send>) -> Self {
        Self {
            inner: Mutex::new(Registry {
                sessions: HashMap::new(),
                results: HashMap::new(),
                rng,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a new session under a fresh token.
    pub fn submit(&self, session: Session) -> String {
        let mut reg = self.lock();
        let token = reg.new_token();
        reg.sessions.insert(token.clone(), session);
        token
    }

    /// Record the running sandbox. Returns `false` if the session is gone,
    /// in which case the caller still owns the sandbox and must stop it.
    pub fn attach_sandbox(&self, token: &str, sandbox: Arc<dyn Sandbox>) -> bool {
        match self.lock().sessions.get_mut(token) {
            Some(s) => {
                s.sandbox = Some(sandbox);
                true
            }
            None => false,
        }
    }

    /// Drop the sandbox handle once discovery is over.
    pub fn detach_sandbox(&self, token: &str) {
        if let Some(s) = self.lock().sessions.get_mut(token) {
            s.sandbox = None;
        }
    }

    pub fn get(&self, token: &str) -> Option<Session> {
        self.lock().sessions.get(token).cloned()
    }

    pub fn remove(&self, token: &str) -> Option<Session> {
        self.lock().sessions.remove(token)
    }

    /// Store the final results and mark the session ready. Returns `false`
    /// if the session was removed while the pipeline ran.
    pub fn set_results(&self, results: ProcessResults) -> bool {
        let mut reg = self.lock();
        let Some(session) = reg.sessions.get_mut(&results.token) else {
            return false;
        };
        session.state = SessionState::Ready;
        reg.results.insert(results.token.clone(), results);
        true
    }

    pub fn get_results(&self, token: &str) -> Option<ProcessResults> {
        self.lock().results.get(token).cloned()
    }

    pub fn remove_results(&self, token: &str) -> Option<ProcessResults> {
        self.lock().results.remove(token)
    }

    /// Move a `Ready` session to `Committing`, returning it together with its
    /// results. The state the session was actually in is returned on failure.
    pub fn begin_commit(
        &self,
        token: &str,
    ) -> Result<(Session, ProcessResults), Option<SessionState>> {
        let mut reg = self.lock();
        let results = reg.results.get(token).cloned();
        let Some(session) = reg.sessions.get_mut(token) else {
            return Err(None);
        };
        match (session.state, results) {
            (SessionState::Ready, Some(results)) => {
                session.state = SessionState::Committing;
                Ok((session.clone(), results))
            }
            (state, _) => Err(Some(state)),
        }
    }

    /// Return a failed commit's session to `Ready`.
    pub fn abort_commit(&self, token: &str) {
        if let Some(s) = self.lock().sessions.get_mut(token) {
            if s.state == SessionState::Committing {
                s.state = SessionState::Ready;
            }
        }
    }

    /// Remove a session unless it is being committed.
    pub fn remove_unless_committing(&self, token: &str) -> Result<Session, Option<SessionState>> {
        let mut reg = self.lock();
        match reg.sessions.get(token).map(|s| s.state) {
            None => Err(None),
            Some(SessionState::Committing) => Err(Some(SessionState::Committing)),
            Some(_) => reg.sessions.remove(token).ok_or(None),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
