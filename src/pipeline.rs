//! Processing pipeline for one ingestion session.
//!
//! Runs in its own tokio task, detached from the caller that submitted the
//! package. Every step announces itself on the event hub:
//!
//! ```text
//! Starting
//!   → Validating application metadata
//!       → Validating version sequence      (only for a new version of an existing app)
//!           → Getting routes               (skipped once validation found errors)
//!               → Writing routes
//!                   → Finished / Finished with errors / Internal error
//! ```
//!
//! Validation problems accumulate in [`ProcessResults::errors`]. Any other
//! failure (storage, database, sandbox, malformed reply) ends the run: the
//! full error goes to the audit log and the caller only sees
//! [`ERR_INTERNAL`] with `internal_error` set.
//!
//! Results are stored before the terminal event is sent, so whoever sees
//! `done` can read them.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use appgetter_core::manifest::{validate_metadata, AppManifest, MetadataRules};
use appgetter_core::routes::{parse_routes, RouteDescriptor};
use appgetter_core::versions::{check_sequence, VersionSchema};

use crate::events::ProcessEvent;
use crate::getter::Inner;
use crate::keys::{ProcessResults, Session};
use crate::sandbox::{LaunchSpec, Sandbox, SandboxError, GET_ROUTES, ROUTES_SERVICE};

pub const STEP_STARTING: &str = "Starting";
pub const STEP_METADATA: &str = "Validating application metadata";
pub const STEP_SEQUENCE: &str = "Validating version sequence";
pub const STEP_GETTING_ROUTES: &str = "Getting routes";
pub const STEP_WRITING_ROUTES: &str = "Writing routes";
pub const STEP_FINISHED: &str = "Finished";
pub const STEP_FINISHED_WITH_ERRORS: &str = "Finished with errors";
pub const STEP_INTERNAL_ERROR: &str = "Internal error";

pub const ERR_INTERNAL: &str = "An internal error occurred while processing the application";
pub const ERR_APP_NOT_FOUND: &str = "Application not found";
pub const ERR_NOT_OWNER: &str = "Application belongs to another user";

/// Source name used for audit log entries written by the pipeline.
pub const AUDIT_SOURCE: &str = "appgetter";

pub(crate) async fn process(inner: Arc<Inner>, token: String) {
    let Some(session) = inner.registry.get(&token) else {
        debug!(token = %token, "session removed before processing started");
        return;
    };

    let mut results = ProcessResults::new(&token);
    let (step, error) = match run_steps(&inner, &token, &session, &mut results).await {
        Ok(()) if results.errors.is_empty() => (STEP_FINISHED, false),
        Ok(()) => (STEP_FINISHED_WITH_ERRORS, true),
        Err(e) if session.cancel.is_cancelled() => {
            debug!(token = %token, error = %e, "processing stopped by delete");
            return;
        }
        Err(e) => {
            inner.audit.log(
                &session.location,
                AUDIT_SOURCE,
                &format!("processing failed: {:#}", e),
            );
            results.errors.push(ERR_INTERNAL.to_string());
            results.internal_error = true;
            (STEP_INTERNAL_ERROR, true)
        }
    };

    info!(
        token = %token,
        location = %session.location,
        errors = results.errors.len(),
        "processing finished"
    );

    if inner.registry.set_results(results) {
        inner.hub.send(ProcessEvent::finished(&token, step, error));
    } else {
        debug!(token = %token, "session removed while processing");
    }
}

async fn run_steps(
    inner: &Inner,
    token: &str,
    session: &Session,
    results: &mut ProcessResults,
) -> Result<()> {
    let location = session.location.as_str();

    inner.hub.send(ProcessEvent::step(token, STEP_METADATA));
    let manifest = match inner.files.read_manifest(location).await {
        Ok(m) => m,
        Err(e) if e.is_validation() => {
            results.errors.push(e.to_string());
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed to read manifest"),
    };

    let package_files = inner
        .files
        .package_files(location)
        .await
        .context("Failed to list package files")?;
    let rules = MetadataRules {
        supported_api_versions: &inner.settings.supported_api_versions,
    };
    let check = validate_metadata(&manifest, rules, |p| package_files.contains(p));
    results.errors.extend(check.errors);
    results.warnings = check.warnings;
    results.manifest = Some(manifest.clone());

    if let Some(app_id) = session.app_id {
        inner.hub.send(ProcessEvent::step(token, STEP_SEQUENCE));
        match inner.store.get_app(app_id).await? {
            None => results.errors.push(ERR_APP_NOT_FOUND.to_string()),
            Some(app) if app.owner_id != session.user_id => {
                results.errors.push(ERR_NOT_OWNER.to_string())
            }
            Some(_) if !manifest.has_valid_version() => {}
            Some(_) => {
                let existing: Vec<VersionSchema> = inner
                    .store
                    .list_versions(app_id)
                    .await?
                    .iter()
                    .map(VersionSchema::from)
                    .collect();
                let candidate = VersionSchema::new(manifest.version.clone(), manifest.schema);
                let seq = check_sequence(&existing, &candidate)?;
                results.errors.extend(seq.errors);
                results.prev_version = seq.prev_version;
                results.next_version = seq.next_version;
            }
        }
    }

    if !results.errors.is_empty() {
        return Ok(());
    }

    inner.hub.send(ProcessEvent::step(token, STEP_GETTING_ROUTES));
    let routes = discover_routes(inner, token, session, &manifest).await?;
    if let Err(e) = inner.validator.validate_routes(&routes) {
        results.errors.push(e.to_string());
        return Ok(());
    }

    inner.hub.send(ProcessEvent::step(token, STEP_WRITING_ROUTES));
    inner
        .files
        .write_routes(location, &routes)
        .await
        .context("Failed to write routes")?;

    Ok(())
}

async fn discover_routes(
    inner: &Inner,
    token: &str,
    session: &Session,
    manifest: &AppManifest,
) -> Result<Vec<RouteDescriptor>> {
    let deadline = Instant::now() + inner.settings.route_timeout;
    let spec = LaunchSpec {
        location: session.location.clone(),
        entrypoint: manifest.entrypoint.clone(),
        api_version: manifest.api_version,
    };

    let sandbox = tokio::time::timeout_at(deadline, inner.launcher.launch_for_app(&spec))
        .await
        .map_err(|_| anyhow!("sandbox did not start before the deadline"))?
        .context("Failed to launch sandbox")?;

    if !inner.registry.attach_sandbox(token, sandbox.clone()) {
        sandbox.kill();
        bail!("session removed before route discovery");
    }

    let reply = request_routes(sandbox.as_ref(), deadline, &session.cancel).await;
    inner.registry.detach_sandbox(token);

    let payload = reply?;
    parse_routes(&payload).context("Malformed route reply")
}

/// Ask a sandbox for its route table, giving up at `deadline` or when
/// `cancel` fires. The sandbox is killed after a failed exchange and asked
/// to stop gracefully after a good reply.
pub async fn request_routes(
    sandbox: &dyn Sandbox,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    let exchange = async {
        sandbox
            .send_message(ROUTES_SERVICE, GET_ROUTES, Vec::new())?
            .wait_reply()
            .await
    };

    let outcome = tokio::select! {
        r = tokio::time::timeout_at(deadline, exchange) => match r {
            Ok(reply) => reply.map_err(anyhow::Error::from),
            Err(_) => Err(anyhow!("sandbox did not reply before the deadline")),
        },
        _ = cancel.cancelled() => Err(anyhow!("route discovery cancelled")),
    };

    match outcome {
        Ok(reply) if reply.command == GET_ROUTES => {
            sandbox.graceful();
            Ok(reply.payload)
        }
        Ok(reply) => {
            stop(sandbox);
            Err(SandboxError::Protocol(format!("unexpected reply command {}", reply.command)).into())
        }
        Err(e) => {
            stop(sandbox);
            Err(e)
        }
    }
}

fn stop(sandbox: &dyn Sandbox) {
    sandbox.kill();
}
