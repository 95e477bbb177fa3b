//! Fast path for CI-style single-commit checkouts.
//!
//! A `git fetch --depth=1` of one ref produces an upload-pack request with
//! exactly one `want`, a `deepen 1`, and no `have` lines. The response for
//! such a request is fully determined by the request body and the mirror
//! contents, so we cache upload-pack's stdout on disk keyed by
//! `(repo key, want, sha256(body))` and replay it for identical requests.
//! Anything that does not match this shape bypasses the cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock, Mutex};

use anyhow::{bail, Context, Result};
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use regex::bytes::Regex;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::git;
use crate::metrics::MetricsRegistry;
use crate::mirror::singleflight;

static WANT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^want ([0-9a-f]{40})(?:\s|$)").unwrap());
static HAVE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^have ").unwrap());
static DEEPEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^deepen (\d+)$").unwrap());
// Tolerant fallbacks for bodies whose pkt-line framing we failed to strip.
static RAW_WANT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)want ([0-9a-f]{40})").unwrap());
static RAW_DEEPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)deepen\s+(\d+)").unwrap());

#[derive(Clone)]
struct PackEntry {
    path: PathBuf,
    size: u64,
}

pub struct PackCache {
    entries: Mutex<HashMap<String, PackEntry>>,
    builds: singleflight::Group<Result<(), Arc<anyhow::Error>>>,
}

impl Default for PackCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PackCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            builds: singleflight::Group::new(),
        }
    }

    /// Serve the request from the pack cache when it has the cacheable
    /// shape, populating the cache on first sight. Returns `None` when the
    /// request must go through the regular upload-pack path.
    pub async fn try_serve(
        &self,
        repo_path: &Path,
        repo_key: &str,
        body: &Bytes,
        git_protocol: Option<&str>,
        pack_threads: usize,
        metrics: &MetricsRegistry,
    ) -> Option<Response> {
        let want = cacheable_want(body)?;
        let body_hash = hex::encode(Sha256::digest(body));
        let cache_key = format!("{repo_key}:{want}:{body_hash}");

        if let Some(entry) = self.lookup(&cache_key) {
            match serve_pack_file(&entry).await {
                Ok(resp) => {
                    metrics.record_pack_cache_hit();
                    debug!(%repo_key, %want, size = entry.size, "pack cache hit");
                    return Some(resp);
                }
                Err(err) => {
                    // File vanished or is unreadable; rebuild below.
                    debug!(%repo_key, error = %err, "cached pack unreadable, dropping entry");
                    self.entries.lock().unwrap().remove(&cache_key);
                }
            }
        }

        // Cacheable shape but nothing usable on disk.
        metrics.record_pack_cache_miss();

        let (built, _) = self
            .builds
            .run(&cache_key, || async {
                self.build(repo_path, &cache_key, body, git_protocol, pack_threads)
                    .await
                    .map_err(Arc::new)
            })
            .await;
        if let Err(err) = built {
            debug!(%repo_key, error = %err, "pack cache population failed");
            return None;
        }

        let entry = self.lookup(&cache_key)?;
        match serve_pack_file(&entry).await {
            Ok(resp) => Some(resp),
            Err(err) => {
                debug!(%repo_key, error = %err, "failed to serve freshly cached pack");
                self.entries.lock().unwrap().remove(&cache_key);
                None
            }
        }
    }

    fn lookup(&self, cache_key: &str) -> Option<PackEntry> {
        self.entries.lock().unwrap().get(cache_key).cloned()
    }

    /// Run upload-pack once with its stdout captured into a file inside the
    /// mirror directory, then record the file under `cache_key`.
    async fn build(
        &self,
        repo_path: &Path,
        cache_key: &str,
        body: &Bytes,
        git_protocol: Option<&str>,
        pack_threads: usize,
    ) -> Result<()> {
        let staging = tempfile::Builder::new()
            .prefix("cached-pack-")
            .suffix(".packresp")
            .tempfile_in(repo_path)
            .context("failed to create pack staging file")?;

        let mut cmd = git::upload_pack_command(repo_path, false, pack_threads, git_protocol);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::from(
            staging.reopen().context("failed to reopen staging file")?,
        ));
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().context("failed to spawn upload-pack for pack cache")?;
        if let Some(mut stdin) = child.stdin.take() {
            let body = body.clone();
            tokio::spawn(async move {
                let _ = stdin.write_all(&body).await;
            });
        }
        let output = child
            .wait_with_output()
            .await
            .context("failed to wait on upload-pack")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "upload-pack cache build failed (status {}): {}",
                output.status,
                stderr.trim(),
            );
        }

        let size = staging
            .as_file()
            .metadata()
            .context("failed to stat staged pack")?
            .len();
        let (_file, path) = staging.keep().context("failed to persist staged pack")?;
        debug!(%cache_key, path = %path.display(), size, "pack cache populated");
        self.entries
            .lock()
            .unwrap()
            .insert(cache_key.to_owned(), PackEntry { path, size });
        Ok(())
    }
}

async fn serve_pack_file(entry: &PackEntry) -> Result<Response> {
    let file = tokio::fs::File::open(&entry.path)
        .await
        .with_context(|| format!("open cached pack {}", entry.path.display()))?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/x-git-upload-pack-result"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Request-shape detection
// ---------------------------------------------------------------------------

/// Return the single wanted object id when the request is cacheable:
/// exactly one `want`, an explicit `deepen 1`, and no `have` lines.
fn cacheable_want(body: &[u8]) -> Option<String> {
    let payload = strip_pkt_payload(body);

    if HAVE_RE.is_match(&payload) {
        return None;
    }

    let mut wants: Vec<_> = WANT_RE.captures_iter(&payload).collect();
    if wants.is_empty() {
        wants = RAW_WANT_RE.captures_iter(&payload).collect();
    }
    if wants.len() != 1 {
        // Protocol-v2 bodies hide the wants behind a delim packet; scan the
        // raw framing as a last resort.
        wants = RAW_WANT_RE.captures_iter(body).collect();
        if wants.len() != 1 {
            return None;
        }
    }
    let want = String::from_utf8_lossy(&wants[0][1]).into_owned();

    let depth = DEEPEN_RE
        .captures(&payload)
        .or_else(|| RAW_DEEPEN_RE.captures(&payload))
        .or_else(|| RAW_DEEPEN_RE.captures(body))?;
    if &depth[1] != b"1" {
        return None;
    }

    Some(want)
}

/// Concatenate pkt-line payloads separated by `\n`, tolerating malformed
/// framing by returning the input unchanged when nothing parses.
fn strip_pkt_payload(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i + 4 <= body.len() {
        let Ok(len_str) = std::str::from_utf8(&body[i..i + 4]) else {
            break;
        };
        let Ok(n) = usize::from_str_radix(len_str, 16) else {
            break;
        };
        i += 4;
        if n == 0 {
            // Flush packet terminates the section we care about.
            break;
        }
        if n < 4 || i + (n - 4) > body.len() {
            break;
        }
        out.extend_from_slice(&body[i..i + (n - 4)]);
        if out.last() != Some(&b'\n') {
            out.push(b'\n');
        }
        i += n - 4;
    }
    if out.is_empty() {
        body.to_vec()
    } else {
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
