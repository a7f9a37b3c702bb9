//! Sandbox supervisor interface.
//!
//! The pipeline only needs one exchange with application code: ask the
//! freshly uploaded app for its route table. A [`SandboxLauncher`] starts a
//! single-use [`Sandbox`] for a package location; the pipeline sends the
//! route request with [`Sandbox::send_message`] and waits on the returned
//! [`PendingReply`].
//!
//! # Wire exchange
//!
//! | Direction | Service | Command | Payload |
//! |-----------|---------|---------|---------|
//! | host → app | [`ROUTES_SERVICE`] | [`GET_ROUTES`] | empty |
//! | app → host | | [`GET_ROUTES`] | JSON array of route descriptors |
//!
//! A reply carrying any other command id is a protocol error.

pub mod lua;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

pub use lua::LuaLauncher;

/// Service id of the route-discovery exchange.
pub const ROUTES_SERVICE: u16 = 13;
/// Command id of the route request, echoed by a successful reply.
pub const GET_ROUTES: u16 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    /// Loading the application code.
    Starting,
    /// Accepting messages.
    Ready,
    /// Stopped by [`Sandbox::kill`].
    Killed,
    /// Exited on its own, or after [`Sandbox::graceful`].
    Dead,
}

impl SandboxStatus {
    pub fn is_alive(self) -> bool {
        matches!(self, SandboxStatus::Starting | SandboxStatus::Ready)
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox exited before replying")]
    Closed,
    #[error("sandbox was killed")]
    Killed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("application code failed: {0}")]
    Script(String),
}

/// A reply message from the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub command: u16,
    pub payload: Vec<u8>,
}

pub type ReplySender = oneshot::Sender<Result<Reply, SandboxError>>;

/// Handle on a reply that has not arrived yet.
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<Result<Reply, SandboxError>>,
}

impl PendingReply {
    pub fn channel() -> (ReplySender, PendingReply) {
        let (tx, rx) = oneshot::channel();
        (tx, PendingReply { rx })
    }

    /// Wait for the reply. A sandbox that goes away without answering
    /// yields [`SandboxError::Closed`].
    pub async fn wait_reply(self) -> Result<Reply, SandboxError> {
        self.rx.await.map_err(|_| SandboxError::Closed)?
    }
}

/// A running, single-use sandbox.
pub trait Sandbox: Send + Sync {
    fn status(&self) -> SandboxStatus;

    /// Stop immediately, abandoning any work in progress.
    ///
    /// Implementations act only on the first call made while the sandbox is
    /// alive. Later calls, concurrent ones included, and calls after it
    /// stopped are no-ops, so callers never check [`Sandbox::status`] first.
    fn kill(&self);

    /// Stop once queued messages are handled.
    fn graceful(&self);

    fn send_message(
        &self,
        service: u16,
        command: u16,
        payload: Vec<u8>,
    ) -> Result<PendingReply, SandboxError>;
}

/// What the launcher needs to know about the package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub location: String,
    pub entrypoint: String,
    pub api_version: u32,
}

#[async_trait]
pub trait SandboxLauncher: Send + Sync {
    async fn launch_for_app(&self, spec: &LaunchSpec) -> Result<Arc<dyn Sandbox>>;
}
