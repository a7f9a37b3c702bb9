//! HTTP API for application ingestion.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/apps?user=&app_id=` | Upload a zip archive (request body); returns a token |
//! | `POST` | `/apps/fetch` | `{user, url, app_id?}`: download and process an archive |
//! | `GET`  | `/in-process/{token}` | Last event, session state and results |
//! | `GET`  | `/in-process/{token}/events` | Progress as Server-Sent Events |
//! | `POST` | `/in-process/{token}/commit` | Persist the processed version |
//! | `DELETE` | `/in-process/{token}` | Discard the session and its files |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_ready", "message": "application is still being processed" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `not_ready` (409),
//! `committing` (409), `conflict` (409), `has_errors` (422), `internal`
//! (500). Internal errors never carry detail; it is logged instead.
//!
//! # Trust
//!
//! The API is unauthenticated and meant to listen on a local or otherwise
//! trusted interface. The `user` given with a submission is taken as is, so
//! the ownership check of the version-sequence step only protects against
//! mistakes, not against a hostile caller. Put an authenticating proxy in
//! front that sets `user` before exposing it further.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use appgetter_core::models::{AppId, UserId};

use crate::error::GetterError;
use crate::events::ProcessEvent;
use crate::getter::AppGetter;
use crate::keys::{ProcessResults, SessionState};

#[derive(Clone)]
struct AppState {
    getter: AppGetter,
}

/// Build the router. Exposed separately from [`run_server`] for tests.
pub fn router(getter: AppGetter) -> Router {
    let body_limit = usize::try_from(getter.settings().max_package_bytes).unwrap_or(usize::MAX);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/apps", post(handle_upload))
        .route("/apps/fetch", post(handle_fetch))
        .route(
            "/in-process/{token}",
            get(handle_status).delete(handle_delete),
        )
        .route("/in-process/{token}/events", get(handle_events))
        .route("/in-process/{token}/commit", post(handle_commit))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(AppState { getter })
}

/// Serve the API on `bind` until the process is terminated.
pub async fn run_server(bind: &str, getter: AppGetter) -> anyhow::Result<()> {
    let app = router(getter);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("appgetter listening on http://{}", bind);
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn not_found() -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: GetterError::NotFound.to_string(),
    }
}

impl From<GetterError> for AppError {
    fn from(e: GetterError) -> Self {
        let (status, code) = match &e {
            GetterError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            GetterError::NotReady => (StatusCode::CONFLICT, "not_ready"),
            GetterError::Committing => (StatusCode::CONFLICT, "committing"),
            GetterError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            GetterError::HasErrors => (StatusCode::UNPROCESSABLE_ENTITY, "has_errors"),
            GetterError::Package(_) | GetterError::Fetch(_) => {
                (StatusCode::BAD_REQUEST, "bad_request")
            }
            GetterError::Internal(inner) => {
                error!(error = %format!("{:#}", inner), "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        AppError {
            status,
            code,
            message: e.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Submission ============

#[derive(Serialize)]
struct TokenResponse {
    token: String,
}

#[derive(Deserialize)]
struct UploadQuery {
    user: UserId,
    app_id: Option<AppId>,
}

async fn handle_upload(
    State(state): State<AppState>,
    Query(q): Query<UploadQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<TokenResponse>), AppError> {
    let token = state
        .getter
        .install_archive(q.user, body.to_vec(), q.app_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(TokenResponse { token })))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FetchRequest {
    user: UserId,
    url: String,
    #[serde(default)]
    app_id: Option<AppId>,
}

async fn handle_fetch(
    State(state): State<AppState>,
    Json(req): Json<FetchRequest>,
) -> Result<(StatusCode, Json<TokenResponse>), AppError> {
    let token = state
        .getter
        .install_from_url(req.user, &req.url, req.app_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(TokenResponse { token })))
}

// ============ Observation ============

#[derive(Serialize)]
struct StatusResponse {
    last_event: Option<ProcessEvent>,
    state: Option<SessionState>,
    results: Option<ProcessResults>,
}

async fn handle_status(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    let resp = StatusResponse {
        last_event: state.getter.get_last_event(&token),
        state: state.getter.session_state(&token),
        results: state.getter.get_results(&token),
    };
    if resp.last_event.is_none() && resp.state.is_none() {
        return Err(not_found());
    }
    Ok(Json(resp))
}

async fn handle_events(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let (last, sub) = state.getter.subscribe(&token);
    if last.is_none() && sub.is_none() {
        return Err(not_found());
    }

    let live = match sub {
        Some(sub) => stream::unfold((sub.events, false), |(mut rx, finished)| async move {
            if finished {
                return None;
            }
            let event = rx.recv().await?;
            let finished = event.done;
            Some((event, (rx, finished)))
        })
        .boxed(),
        None => stream::empty().boxed(),
    };

    let events = stream::iter(last).chain(live).map(|e| {
        Ok(Event::default()
            .event("progress")
            .json_data(&e)
            .unwrap_or_else(|_| Event::default().event("progress")))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

// ============ Lifecycle ============

#[derive(Serialize)]
struct CommitResponse {
    app_id: AppId,
    version: String,
}

async fn handle_commit(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<CommitResponse>, AppError> {
    let (app_id, version) = state.getter.commit(&token).await?;
    Ok(Json(CommitResponse { app_id, version }))
}

async fn handle_delete(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<StatusCode, AppError> {
    state.getter.delete(&token).await?;
    Ok(StatusCode::NO_CONTENT)
}
