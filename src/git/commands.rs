//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every function here shells out to the system `git` binary. All commands
//! run with `kill_on_drop` so that dropping the owning future (client
//! disconnect, request cancellation) terminates the child, and with the host
//! configuration masked out: a host-level `insteadOf` rewrite pointing back
//! at the proxy would otherwise loop requests through ourselves.

use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::config::MaintenanceMode;

/// Sentinel another git process leaves while writing the commit graph.
const COMMIT_GRAPH_LOCK: &str = "objects/info/commit-graph.lock";

/// `-c` settings that disable GC and keep peak memory low while transferring
/// very large repositories.
const LOW_MEMORY_CONFIG: &[&str] = &[
    "-c",
    "gc.auto=0",
    "-c",
    "core.compression=0",
    "-c",
    "pack.window=0",
    "-c",
    "pack.depth=0",
    "-c",
    "pack.deltaCacheSize=1",
    "-c",
    "pack.threads=1",
];

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Environment variables applied to every git invocation.
///
/// When `auth_header` is present, the Authorization header is injected via
/// git's indexed-config mechanism (`GIT_CONFIG_COUNT`/`KEY_0`/`VALUE_0`) so
/// credentials are passed in memory only and never written to repo config.
pub(crate) fn git_env(auth_header: Option<&str>) -> Vec<(String, String)> {
    let mut env = vec![
        ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
        ("GIT_CONFIG_GLOBAL".to_string(), "/dev/null".to_string()),
        ("GIT_CONFIG_SYSTEM".to_string(), "/dev/null".to_string()),
    ];
    if let Some(header) = auth_header.filter(|h| !h.is_empty()) {
        env.push(("GIT_CONFIG_COUNT".to_string(), "1".to_string()));
        env.push((
            "GIT_CONFIG_KEY_0".to_string(),
            "http.extraheader".to_string(),
        ));
        env.push((
            "GIT_CONFIG_VALUE_0".to_string(),
            format!("Authorization: {header}"),
        ));
    }
    env
}

fn git_command(auth_header: Option<&str>) -> Command {
    let mut cmd = Command::new("git");
    cmd.envs(git_env(auth_header));
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    cmd
}

// ---------------------------------------------------------------------------
// Clone
// ---------------------------------------------------------------------------

/// Create a new bare mirror at `dest` from `url`.
///
/// A leftover directory at `dest` (a previous clone that was killed before
/// completing) is removed first. On failure the destination is removed again
/// so the next attempt starts from a clean slate.
#[instrument(skip(auth_header), fields(%url, dest = %dest.display(), has_auth = auth_header.is_some()))]
pub async fn clone_mirror(url: &str, dest: &Path, auth_header: Option<&str>) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create parent directory: {}", parent.display()))?;
    }
    if dest.exists() {
        warn!("removing leftover partial mirror before cloning");
        tokio::fs::remove_dir_all(dest)
            .await
            .with_context(|| format!("failed to clear partial mirror: {}", dest.display()))?;
    }

    let mut cmd = git_command(auth_header);
    cmd.args(LOW_MEMORY_CONFIG)
        .arg("clone")
        .arg("--bare")
        .arg("--mirror")
        .arg(url)
        .arg(dest);

    debug!("spawning git clone --bare --mirror");

    let output = cmd.output().await.context("failed to spawn git clone")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let _ = tokio::fs::remove_dir_all(dest).await;
        bail!(
            "git clone failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("git clone complete");
    Ok(())
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

/// Fetch all refs from the configured remote inside an existing bare mirror.
#[instrument(skip(auth_header), fields(repo = %repo_path.display(), has_auth = auth_header.is_some()))]
pub async fn fetch_mirror(repo_path: &Path, auth_header: Option<&str>) -> Result<()> {
    let mut cmd = git_command(auth_header);
    cmd.arg("-C")
        .arg(repo_path)
        .args(LOW_MEMORY_CONFIG)
        .arg("fetch")
        .arg("--all")
        .arg("--prune")
        .arg("--force");

    debug!("spawning git fetch");

    let output = cmd.output().await.context("failed to spawn git fetch")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git fetch failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("git fetch complete");
    Ok(())
}

// ---------------------------------------------------------------------------
// Optimisation
// ---------------------------------------------------------------------------

/// Run maintenance on a bare mirror.
///
/// Full mode repacks everything with a bitmap index before refreshing the
/// commit graph and multi-pack-index; light mode refreshes only the latter
/// two. Individual step failures are logged and skipped so a degraded repo
/// still gets whatever maintenance can be applied; the next cycle retries.
#[instrument(fields(repo = %repo_path.display(), ?mode))]
pub async fn optimize_repo(repo_path: &Path, mode: MaintenanceMode, pack_threads: usize) {
    if repo_path.join(COMMIT_GRAPH_LOCK).exists() {
        debug!("commit-graph lock present, skipping maintenance");
        return;
    }

    if mode == MaintenanceMode::Full {
        let mut cmd = git_command(None);
        if pack_threads > 0 {
            cmd.arg("-c").arg(format!("pack.threads={pack_threads}"));
        }
        cmd.arg("-C")
            .arg(repo_path)
            .arg("repack")
            .arg("-a")
            .arg("-d")
            .arg("-b")
            .arg("--write-bitmap-index");
        run_maintenance_step(cmd, "repack").await;
    }

    let mut cmd = git_command(None);
    cmd.arg("-C")
        .arg(repo_path)
        .arg("commit-graph")
        .arg("write")
        .arg("--reachable");
    run_maintenance_step(cmd, "commit-graph write").await;

    let mut cmd = git_command(None);
    cmd.arg("-C")
        .arg(repo_path)
        .arg("multi-pack-index")
        .arg("write")
        .arg("--bitmap");
    run_maintenance_step(cmd, "multi-pack-index write").await;

    debug!("maintenance complete");
}

async fn run_maintenance_step(mut cmd: Command, step: &str) {
    match cmd.output().await {
        Ok(output) if output.status.success() => {
            debug!(step, "maintenance step complete");
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(step, status = %output.status, stderr = %stderr.trim(), "maintenance step failed");
        }
        Err(err) => {
            warn!(step, error = %err, "failed to spawn maintenance step");
        }
    }
}

// ---------------------------------------------------------------------------
// Upload-pack
// ---------------------------------------------------------------------------

/// Build a `git upload-pack --stateless-rpc` command for a local mirror.
///
/// `git_protocol` carries the client's `Git-Protocol` request header so
/// protocol-v2 negotiation survives the proxy hop. The caller decides how to
/// wire stdin/stdout before spawning.
pub fn upload_pack_command(
    repo_path: &Path,
    advertise_refs: bool,
    pack_threads: usize,
    git_protocol: Option<&str>,
) -> Command {
    let mut cmd = git_command(None);
    if let Some(proto) = git_protocol.filter(|p| !p.is_empty()) {
        cmd.env("GIT_PROTOCOL", proto);
    }
    if pack_threads > 0 {
        cmd.arg("-c").arg(format!("pack.threads={pack_threads}"));
    }
    cmd.arg("upload-pack").arg("--stateless-rpc");
    if advertise_refs {
        cmd.arg("--advertise-refs");
    }
    cmd.arg(repo_path);
    cmd
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
