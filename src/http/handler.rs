//! Axum router and request dispatch for the proxy.
//!
//! Routes:
//! - `GET  /{host}/{owner}/{repo}[.git]/info/refs`       - ensure + advertise refs
//! - `POST /{host}/{owner}/{repo}[.git]/git-upload-pack` - ensure + pack transfer
//! - `POST /{host}/{owner}/{repo}[.git]/git-receive-pack`- always rejected (read-only)
//! - `GET  /healthz`                                     - health check
//! - `GET  /metrics`                                     - Prometheus metrics

use std::io::Read;
use std::sync::Arc;

use anyhow::Context as _;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use serde::Deserialize;
use tracing::{debug, error, info, instrument, warn};

use crate::config::AuthMode;
use crate::http::gitserve;
use crate::metrics::RequestKind;
use crate::mirror::EnsureError;
use crate::AppState;

/// Upload-pack negotiation bodies can carry thousands of have lines; axum's
/// 2 MB default is too small.
const MAX_BODY_BYTES: usize = 64 << 20;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/{host}/{owner}/{repo}/info/refs", get(handle_info_refs))
        .route(
            "/{host}/{owner}/{repo}/git-upload-pack",
            post(handle_upload_pack),
        )
        .route(
            "/{host}/{owner}/{repo}/git-receive-pack",
            post(handle_receive_pack),
        )
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Target resolution
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Target {
    host: String,
    owner: String,
    repo: String,
    key: String,
    upstream_url: String,
}

fn resolve_target(
    state: &AppState,
    host: &str,
    owner: &str,
    repo: &str,
) -> Result<Target, AppError> {
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    // Segments arrive percent-decoded, so an encoded `..%2F` shows up here as
    // an embedded traversal sequence; nothing with separators or `..` may
    // ever reach a filesystem join.
    for part in [host, owner, repo] {
        if part.is_empty()
            || part == "."
            || part.contains("..")
            || part.contains('/')
            || part.contains('\\')
        {
            return Err(AppError::BadRequest("invalid repository path".into()));
        }
    }
    if !state.config.allowed_upstreams.iter().any(|h| h == host) {
        return Err(AppError::BadRequest(format!(
            "upstream {host:?} not in allowed list"
        )));
    }
    Ok(Target {
        host: host.to_owned(),
        owner: owner.to_owned(),
        repo: repo.to_owned(),
        key: format!("{host}/{owner}/{repo}"),
        upstream_url: format!("https://{host}/{owner}/{repo}.git"),
    })
}

/// The Authorization value used against the upstream, per the configured
/// auth mode.
fn upstream_auth(state: &AppState, headers: &HeaderMap) -> String {
    match state.config.auth_mode {
        AuthMode::None => String::new(),
        AuthMode::Static => format!("Bearer {}", state.config.static_token),
        AuthMode::PassThrough => headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned(),
    }
}

fn git_protocol(headers: &HeaderMap) -> Option<String> {
    headers
        .get("git-protocol")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_owned())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct InfoRefsQuery {
    service: Option<String>,
}

/// `GET /{host}/{owner}/{repo}/info/refs?service=git-upload-pack`
#[instrument(skip(state, headers), fields(%host, %owner, %repo))]
async fn handle_info_refs(
    State(state): State<Arc<AppState>>,
    Path((host, owner, repo)): Path<(String, String, String)>,
    Query(query): Query<InfoRefsQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let target = resolve_target(&state, &host, &owner, &repo)?;
    state.metrics.record_request(&target.key, RequestKind::Info);

    match query.service.as_deref() {
        Some("git-upload-pack") => {}
        Some("git-receive-pack") => {
            return Err(AppError::BadRequest(
                "push (git-receive-pack) is not supported by this proxy".into(),
            ));
        }
        other => {
            return Err(AppError::BadRequest(format!(
                "unsupported service: {}",
                other.unwrap_or("<none>")
            )));
        }
    }

    let auth = upstream_auth(&state, &headers);
    let ensure_start = std::time::Instant::now();
    let (path, status) = state
        .mirror
        .ensure_repo(
            &target.host,
            &target.owner,
            &target.repo,
            &target.upstream_url,
            &auth,
        )
        .await
        .map_err(|err| state.fail(&target.key, RequestKind::Info, err))?;

    state
        .metrics
        .metrics
        .ensure_duration_seconds
        .observe(ensure_start.elapsed().as_secs_f64());
    state.metrics.record_ensure(status);
    state
        .statuses
        .lock()
        .unwrap()
        .insert(target.key.clone(), status);
    info!(repo = %target.key, %status, "request");

    let resp = gitserve::advertise_refs(
        &path,
        status,
        git_protocol(&headers).as_deref(),
        state.config.upload_pack_threads,
    )
    .await
    .map_err(AppError::Internal)?;

    state
        .metrics
        .record_response(&target.key, RequestKind::Info, resp.status());
    Ok(resp)
}

/// `POST /{host}/{owner}/{repo}/git-upload-pack`
#[instrument(skip(state, headers, body), fields(%host, %owner, %repo))]
async fn handle_upload_pack(
    State(state): State<Arc<AppState>>,
    Path((host, owner, repo)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let target = resolve_target(&state, &host, &owner, &repo)?;
    state.metrics.record_request(&target.key, RequestKind::Pack);

    let auth = upstream_auth(&state, &headers);
    let (path, ensured) = state
        .mirror
        .ensure_repo(
            &target.host,
            &target.owner,
            &target.repo,
            &target.upstream_url,
            &auth,
        )
        .await
        .map_err(|err| state.fail(&target.key, RequestKind::Pack, err))?;

    // The info/refs call that preceded this POST recorded what the mirror
    // layer did; forward that status so a clone shows up as `clone` on both
    // halves of the exchange.
    let status = state
        .statuses
        .lock()
        .unwrap()
        .remove(&target.key)
        .unwrap_or(ensured);

    let body = decode_body(&headers, body)?;
    let proto = git_protocol(&headers);

    if state.config.enable_pack_cache {
        if let Some(resp) = state
            .pack_cache
            .try_serve(
                &path,
                &target.key,
                &body,
                proto.as_deref(),
                state.config.upload_pack_threads,
                &state.metrics,
            )
            .await
        {
            debug!(repo = %target.key, "served cached pack");
            state
                .metrics
                .record_response(&target.key, RequestKind::Pack, resp.status());
            return Ok(resp);
        }
    }

    let guard = if state.config.serialize_upload_pack {
        Some(state.mirror.repo_lock(&target.key).lock_owned().await)
    } else {
        None
    };

    let resp = gitserve::upload_pack(
        &path,
        status,
        body,
        proto.as_deref(),
        state.config.upload_pack_threads,
        guard,
    )
    .await
    .map_err(AppError::Internal)?;

    state
        .metrics
        .record_response(&target.key, RequestKind::Pack, resp.status());
    Ok(resp)
}

/// `POST /{host}/{owner}/{repo}/git-receive-pack` - the proxy is read-only.
#[instrument(fields(%host, %owner, %repo))]
async fn handle_receive_pack(
    Path((host, owner, repo)): Path<(String, String, String)>,
) -> Response {
    warn!("rejected git-receive-pack (push)");
    (
        StatusCode::BAD_REQUEST,
        "push (git-receive-pack) is not supported by this proxy\n",
    )
        .into_response()
}

async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, "ok\n")
}

async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let mut buf = String::new();
    prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;
    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Body decoding
// ---------------------------------------------------------------------------

/// Gunzip the request body when the client sent `Content-Encoding: gzip`
/// (git does this for large negotiation requests).
fn decode_body(headers: &HeaderMap, body: Bytes) -> Result<Bytes, AppError> {
    let gzipped = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("gzip"));
    if !gzipped {
        return Ok(body);
    }
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(body.as_ref())
        .read_to_end(&mut out)
        .context("failed to gunzip request body")
        .map_err(|e| AppError::BadRequest(format!("{e:#}")))?;
    Ok(Bytes::from(out))
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Request failures mapped to HTTP statuses: client mistakes get 400,
/// anything that kept us from producing mirror data gets 502.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    AuthRequired(String),
    Upstream(anyhow::Error),
    Internal(anyhow::Error),
}

impl From<EnsureError> for AppError {
    fn from(err: EnsureError) -> Self {
        match err {
            EnsureError::AuthRequired(e) => AppError::AuthRequired(format!("{e:#}")),
            EnsureError::TransientUpstream(e) => AppError::Upstream(e),
            EnsureError::CloneFailed(e) => AppError::Upstream(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::AuthRequired(msg) => (
                StatusCode::BAD_GATEWAY,
                format!("authentication required: {msg}"),
            )
                .into_response(),
            AppError::Upstream(err) => {
                warn!(error = %format!("{err:#}"), "upstream failure");
                (StatusCode::BAD_GATEWAY, format!("{err:#}")).into_response()
            }
            AppError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
                    .into_response()
            }
        }
    }
}

impl AppState {
    /// Count the error and convert it for the HTTP layer.
    fn fail(&self, repo_key: &str, kind: RequestKind, err: EnsureError) -> AppError {
        self.metrics.record_error(repo_key, kind);
        warn!(repo = %repo_key, ?kind, error = %err, "ensure failed");
        AppError::from(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
