//! Smart HTTP serving out of an ensured local mirror.
//!
//! Both operations wrap `git upload-pack --stateless-rpc`: the GET advertises
//! refs, the POST carries a complete negotiation exchange. Stdout is always
//! streamed to the client, never buffered whole, because pack responses can
//! be many gigabytes.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{error, warn};

use crate::git;
use crate::mirror::Status;

/// Response header reporting what the mirror layer did for this repo.
pub const STATUS_HEADER: &str = "x-git-proxy-status";

const ADVERTISEMENT_TYPE: &str = "application/x-git-upload-pack-advertisement";
const RESULT_TYPE: &str = "application/x-git-upload-pack-result";

// ---------------------------------------------------------------------------
// info/refs
// ---------------------------------------------------------------------------

/// Stream the ref advertisement for `GET .../info/refs?service=git-upload-pack`.
///
/// Protocol v1 expects a `# service=` pkt-line and a flush before the
/// advertisement; protocol v2 (announced via the `Git-Protocol` request
/// header) must not have them.
pub async fn advertise_refs(
    repo_path: &Path,
    status: Status,
    git_protocol: Option<&str>,
    pack_threads: usize,
) -> Result<Response> {
    let mut cmd = git::upload_pack_command(repo_path, true, pack_threads, git_protocol);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().context("failed to spawn git upload-pack --advertise-refs")?;
    let stdout = child
        .stdout
        .take()
        .context("failed to capture upload-pack stdout")?;

    reap_in_background(child, None);

    let v2 = git_protocol.is_some_and(|p| p.contains("version=2"));
    let prefix = if v2 {
        Vec::new()
    } else {
        service_announcement().into_bytes()
    };
    let body = Body::from_stream(ReaderStream::new(
        std::io::Cursor::new(prefix).chain(stdout),
    ));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, ADVERTISEMENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static(STATUS_HEADER), status.as_str()),
        ],
        body,
    )
        .into_response())
}

/// The protocol-v1 service announcement: a pkt-line plus a flush packet.
fn service_announcement() -> String {
    let line = "# service=git-upload-pack\n";
    format!("{:04x}{}0000", line.len() + 4, line)
}

// ---------------------------------------------------------------------------
// upload-pack
// ---------------------------------------------------------------------------

/// Run the pack negotiation for `POST .../git-upload-pack`, streaming the
/// child's stdout as the response body.
///
/// `body` must already be decompressed. When upload-pack serialisation is
/// enabled the caller passes the per-repo guard, which is held until the
/// child exits so pack generation for one repo never runs in parallel.
pub async fn upload_pack(
    repo_path: &Path,
    status: Status,
    body: Bytes,
    git_protocol: Option<&str>,
    pack_threads: usize,
    serialize_guard: Option<tokio::sync::OwnedMutexGuard<()>>,
) -> Result<Response> {
    let mut cmd = git::upload_pack_command(repo_path, false, pack_threads, git_protocol);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().context("failed to spawn git upload-pack")?;

    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            if let Err(err) = stdin.write_all(&body).await {
                warn!(error = %err, "failed to write request body to upload-pack");
            }
            // Dropping stdin signals EOF.
        });
    }

    let stdout = child
        .stdout
        .take()
        .context("failed to capture upload-pack stdout")?;

    reap_in_background(child, serialize_guard);

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, RESULT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static(STATUS_HEADER), status.as_str()),
        ],
        Body::from_stream(ReaderStream::new(stdout)),
    )
        .into_response())
}

/// Wait on the child so we never leak processes; the optional guard keeps the
/// per-repo serialisation lock held until the child is done.
fn reap_in_background(
    mut child: tokio::process::Child,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
) {
    tokio::spawn(async move {
        let _guard = guard;
        match child.wait().await {
            Ok(status) if !status.success() => {
                warn!(%status, "git upload-pack exited with non-zero status");
            }
            Err(err) => {
                error!(error = %err, "failed to wait on git upload-pack");
            }
            _ => {}
        }
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcement_is_framed_as_pkt_line() {
        // 4 hex digits of length, the service line, then a flush packet.
        assert_eq!(service_announcement(), "001e# service=git-upload-pack\n0000");
    }
}
