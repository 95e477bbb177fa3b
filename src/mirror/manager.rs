//! The mirror coordination engine.
//!
//! `ensure_repo` is the single entry point the HTTP layer calls for every
//! Smart HTTP request: it guarantees a complete bare mirror exists on disk,
//! re-fetches it when stale, enforces authentication for private mirrors,
//! and reports whether the caller got a fresh hit, a brand-new clone, or a
//! just-synced mirror.
//!
//! Concurrency contract: any number of tasks may call `ensure_repo` at once.
//! Clones and fetches are deduplicated per repo key, maintenance per mirror
//! path, and distinct keys never contend on a shared lock.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info, warn};

use crate::config::{Config, MaintenanceMode};
use crate::git;
use crate::mirror::auth::{AuthError, AuthValidator};
use crate::mirror::lru::LruStore;
use crate::mirror::singleflight;

/// Sentinel file marking a mirror that was created with credentials.
const REQUIRES_AUTH_SENTINEL: &str = ".requires-auth";

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// What `ensure_repo` had to do for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Served from an existing fresh mirror.
    Hit,
    /// A new mirror was cloned.
    Clone,
    /// An existing stale mirror was fetched.
    Sync,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Hit => "hit",
            Status::Clone => "clone",
            Status::Sync => "sync",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Request-path failures from `ensure_repo`, by required HTTP treatment.
#[derive(Debug)]
pub enum EnsureError {
    /// A private mirror rejected the presented credentials.
    AuthRequired(anyhow::Error),
    /// The upstream is unreachable and nothing cached can vouch for the
    /// caller.
    TransientUpstream(anyhow::Error),
    /// The initial clone failed; there is no mirror to serve.
    CloneFailed(anyhow::Error),
}

impl fmt::Display for EnsureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnsureError::AuthRequired(err) => write!(f, "authentication required: {err}"),
            EnsureError::TransientUpstream(err) => write!(f, "upstream unavailable: {err}"),
            EnsureError::CloneFailed(err) => write!(f, "mirror clone failed: {err}"),
        }
    }
}

impl std::error::Error for EnsureError {}

impl From<AuthError> for EnsureError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Rejected(e) => EnsureError::AuthRequired(e),
            AuthError::Unavailable(e) => EnsureError::TransientUpstream(e),
        }
    }
}

/// Errors shared between singleflight followers must be cloneable.
type SharedError = Arc<anyhow::Error>;

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct MirrorManager {
    root: PathBuf,
    stale_after: std::time::Duration,
    pack_threads: usize,
    maintain_after_sync: bool,

    clone_flights: singleflight::Group<Result<Status, SharedError>>,
    sync_flights: singleflight::Group<Result<(), SharedError>>,
    maint_flights: Arc<singleflight::Group<()>>,

    last_sync: Mutex<HashMap<String, Instant>>,
    repo_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,

    pub(crate) lru: LruStore,
    auth: AuthValidator,
}

impl MirrorManager {
    pub fn new(config: &Config, http_client: reqwest::Client) -> Result<Self> {
        let root = PathBuf::from(&config.mirror_dir);
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create mirror root: {}", root.display()))?;
        Ok(Self {
            stale_after: config.sync_stale_after,
            pack_threads: config.upload_pack_threads,
            maintain_after_sync: config.maintain_after_sync,
            clone_flights: singleflight::Group::new(),
            sync_flights: singleflight::Group::new(),
            maint_flights: Arc::new(singleflight::Group::new()),
            last_sync: Mutex::new(HashMap::new()),
            repo_locks: Mutex::new(HashMap::new()),
            lru: LruStore::new(&root, config.mirror_max_size),
            auth: AuthValidator::new(http_client, &root),
            root,
        })
    }

    /// Filesystem path of a mirror.
    pub fn repo_path(&self, host: &str, owner: &str, repo: &str) -> PathBuf {
        self.root
            .join(host)
            .join(owner)
            .join(format!("{repo}.git"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ensure the mirror for `(host, owner, repo)` exists and is fresh enough
    /// to serve, cloning or fetching from `upstream_url` as needed.
    ///
    /// `auth_header` is the Authorization value forwarded to the upstream
    /// (empty for anonymous access).
    pub async fn ensure_repo(
        self: &Arc<Self>,
        host: &str,
        owner: &str,
        repo: &str,
        upstream_url: &str,
        auth_header: &str,
    ) -> Result<(PathBuf, Status), EnsureError> {
        let key = format!("{host}/{owner}/{repo}");
        let path = self.repo_path(host, owner, repo);

        // The existence check runs inside the clone flight: a caller that
        // races a half-finished clone waits for it instead of serving a
        // partial repo.
        let (outcome, shared) = self
            .clone_flights
            .run(&key, || async {
                if mirror_exists(&path) {
                    return Ok(Status::Hit);
                }
                match git::clone_mirror(upstream_url, &path, Some(auth_header)).await {
                    Ok(()) => {
                        self.set_last_sync(&key, Instant::now());
                        self.lru.touch(&key);
                        if !auth_header.is_empty() {
                            self.mark_requires_auth(&path);
                        }
                        self.schedule_optimize(&path, MaintenanceMode::Full);
                        self.schedule_eviction();
                        Ok(Status::Clone)
                    }
                    Err(err) => Err(Arc::new(err)),
                }
            })
            .await;
        if shared {
            debug!(%key, "waited for in-flight clone check");
        }

        let status = outcome.map_err(|err| EnsureError::CloneFailed(anyhow!("{err:#}")))?;
        if status == Status::Clone && !shared {
            info!(%key, "mirror cloned");
            return Ok((path, Status::Clone));
        }
        // Callers that piggybacked on another request's clone observe the
        // finished mirror like any other hit and fall through to the auth
        // check below.

        self.lru.touch(&key);

        let mut status = Status::Hit;
        if self.is_stale(&key) {
            let (synced, shared) = self
                .sync_flights
                .run(&key, || async {
                    git::fetch_mirror(&path, Some(auth_header))
                        .await
                        .map_err(Arc::new)
                })
                .await;
            if shared {
                debug!(%key, "waited for in-flight sync");
            }
            match synced {
                Ok(()) => {
                    status = Status::Sync;
                    self.set_last_sync(&key, Instant::now());
                    if self.maintain_after_sync {
                        self.schedule_optimize(&path, MaintenanceMode::Light);
                    }
                    info!(%key, "mirror synced");
                }
                Err(err) => {
                    // Availability over freshness: keep serving what we have.
                    warn!(%key, error = %err, "sync failed, serving stale mirror");
                }
            }
        }

        // A completed sync already proved the credentials against the
        // upstream; only plain hits on private mirrors need re-validation.
        if status == Status::Hit && self.requires_auth(&path) {
            self.auth.validate(upstream_url, auth_header).await?;
        }

        Ok((path, status))
    }

    // -- staleness ---------------------------------------------------------

    fn is_stale(&self, key: &str) -> bool {
        match self.last_sync.lock().unwrap().get(key) {
            Some(last) => last.elapsed() > self.stale_after,
            None => true,
        }
    }

    /// Seed the last-sync instant for a key. Exists so tests can move a
    /// mirror across the staleness boundary without sleeping.
    pub fn set_last_sync(&self, key: &str, when: Instant) {
        self.last_sync.lock().unwrap().insert(key.to_owned(), when);
    }

    // -- auth sentinel -----------------------------------------------------

    fn requires_auth(&self, path: &Path) -> bool {
        path.join(REQUIRES_AUTH_SENTINEL).exists()
    }

    fn mark_requires_auth(&self, path: &Path) {
        if let Err(err) = std::fs::write(path.join(REQUIRES_AUTH_SENTINEL), b"1") {
            warn!(path = %path.display(), error = %err, "failed to write requires-auth sentinel");
        }
    }

    // -- upload-pack serialisation ----------------------------------------

    /// Per-repo mutex handed to the serving layer when upload-pack
    /// serialisation is enabled.
    pub fn repo_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.repo_locks
            .lock()
            .unwrap()
            .entry(key.to_owned())
            .or_default()
            .clone()
    }

    // -- maintenance -------------------------------------------------------

    /// Kick off background optimisation, deduplicated per mirror path. The
    /// task is detached so request cancellation never aborts a repack.
    fn schedule_optimize(self: &Arc<Self>, path: &Path, mode: MaintenanceMode) {
        let flights = Arc::clone(&self.maint_flights);
        let path = path.to_path_buf();
        let pack_threads = self.pack_threads;
        tokio::spawn(async move {
            let flight_key = path.display().to_string();
            flights
                .run(&flight_key, || async {
                    git::optimize_repo(&path, mode, pack_threads).await;
                })
                .await;
        });
    }

    fn schedule_eviction(self: &Arc<Self>) {
        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = mgr.lru.maybe_evict(|key| mgr.is_in_flight(key)).await {
                warn!(error = %err, "mirror eviction sweep failed");
            }
        });
    }

    fn is_in_flight(&self, key: &str) -> bool {
        self.clone_flights.contains(key) || self.sync_flights.contains(key)
    }

    /// Run maintenance synchronously on one repo key (one-shot CLI mode).
    pub async fn maintain_repo(&self, key: &str, mode: MaintenanceMode) -> Result<()> {
        let mut parts = key.splitn(3, '/');
        let (Some(host), Some(owner), Some(repo)) = (parts.next(), parts.next(), parts.next())
        else {
            bail!("invalid repo key {key:?}, expected host/owner/repo");
        };
        let path = self.repo_path(host, owner, repo);
        if !mirror_exists(&path) {
            bail!("no mirror found at {}", path.display());
        }
        git::optimize_repo(&path, mode, self.pack_threads).await;
        Ok(())
    }

    /// Run maintenance synchronously on every `*.git` directory under the
    /// root (one-shot CLI mode with `all`).
    pub async fn maintain_all(&self, mode: MaintenanceMode) -> Result<()> {
        let root = self.root.clone();
        let mirrors = tokio::task::spawn_blocking(move || find_mirrors(&root))
            .await
            .context("mirror walk task panicked")??;
        for path in mirrors {
            git::optimize_repo(&path, mode, self.pack_threads).await;
        }
        Ok(())
    }
}

/// A mirror is present when the bare repo's HEAD file exists; a directory
/// without one is debris from an interrupted clone and gets re-cloned.
fn mirror_exists(path: &Path) -> bool {
    path.join("HEAD").is_file()
}

fn find_mirrors(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if path.extension().is_some_and(|ext| ext == "git") {
                out.push(path);
            } else {
                stack.push(path);
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::process::Command;
    use std::time::Duration;

    use super::*;
    use crate::config::Config;

    /// Whether a usable `git` binary is on PATH; tests that shell out return
    /// early when it is missing.
    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn run_git(dir: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_CONFIG_GLOBAL", "/dev/null")
            .env("GIT_CONFIG_SYSTEM", "/dev/null")
            .env("GIT_AUTHOR_NAME", "test")
            .env("GIT_AUTHOR_EMAIL", "test@example.com")
            .env("GIT_COMMITTER_NAME", "test")
            .env("GIT_COMMITTER_EMAIL", "test@example.com")
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    /// Local upstream repo with one commit, reachable over file://.
    fn make_upstream(dir: &Path) -> String {
        std::fs::create_dir_all(dir).unwrap();
        run_git(dir, &["init", "-b", "main", "."]);
        std::fs::write(dir.join("file.txt"), "first\n").unwrap();
        run_git(dir, &["add", "file.txt"]);
        run_git(dir, &["commit", "-m", "first"]);
        format!("file://{}", dir.display())
    }

    fn add_commit(dir: &Path) {
        std::fs::write(dir.join("file.txt"), "first\nsecond\n").unwrap();
        run_git(dir, &["add", "file.txt"]);
        run_git(dir, &["commit", "-m", "second"]);
    }

    fn manager(mirror_dir: &Path, stale_after: &str) -> Arc<MirrorManager> {
        let cfg = Config::load_from([
            "gitmirrord",
            "--auth-mode=none",
            &format!("--mirror-dir={}", mirror_dir.display()),
            &format!("--sync-stale-after={stale_after}"),
        ])
        .unwrap();
        Arc::new(MirrorManager::new(&cfg, reqwest::Client::new()).unwrap())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_first_requests_share_one_clone() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let url = make_upstream(&tmp.path().join("upstream"));
        let mgr = manager(&tmp.path().join("mirrors"), "1h");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mgr = Arc::clone(&mgr);
            let url = url.clone();
            handles.push(tokio::spawn(async move {
                mgr.ensure_repo("example.com", "org", "repo", &url, "")
                    .await
                    .unwrap()
            }));
        }

        let mut clones = 0;
        let mut paths = Vec::new();
        for handle in handles {
            let (path, status) = handle.await.unwrap();
            assert_ne!(status, Status::Sync);
            if status == Status::Clone {
                clones += 1;
            }
            paths.push(path);
        }
        // Exactly one caller performed the clone; the rest observed the
        // existing mirror.
        assert_eq!(clones, 1);
        paths.dedup();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].join("HEAD").is_file());
    }

    #[tokio::test]
    async fn second_request_within_staleness_is_a_hit() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let url = make_upstream(&tmp.path().join("upstream"));
        let mgr = manager(&tmp.path().join("mirrors"), "1h");

        let (_, first) = mgr
            .ensure_repo("example.com", "org", "repo", &url, "")
            .await
            .unwrap();
        assert_eq!(first, Status::Clone);

        let (_, second) = mgr
            .ensure_repo("example.com", "org", "repo", &url, "")
            .await
            .unwrap();
        assert_eq!(second, Status::Hit);
    }

    #[tokio::test]
    async fn stale_mirror_is_synced() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let upstream = tmp.path().join("upstream");
        let url = make_upstream(&upstream);
        let mgr = manager(&tmp.path().join("mirrors"), "1h");

        let (path, _) = mgr
            .ensure_repo("example.com", "org", "repo", &url, "")
            .await
            .unwrap();

        add_commit(&upstream);

        // Just inside the window: no fetch.
        let Some(slightly_old) = Instant::now().checked_sub(Duration::from_secs(10)) else {
            return; // machine uptime too short to backdate
        };
        mgr.set_last_sync("example.com/org/repo", slightly_old);
        let (_, status) = mgr
            .ensure_repo("example.com", "org", "repo", &url, "")
            .await
            .unwrap();
        assert_eq!(status, Status::Hit);

        // Past the window: one fetch, and the mirror sees the new commit.
        let Some(stale) = Instant::now().checked_sub(Duration::from_secs(2 * 3600)) else {
            return;
        };
        mgr.set_last_sync("example.com/org/repo", stale);
        let (_, status) = mgr
            .ensure_repo("example.com", "org", "repo", &url, "")
            .await
            .unwrap();
        assert_eq!(status, Status::Sync);

        let log = Command::new("git")
            .args(["-C", path.to_str().unwrap(), "log", "--oneline"])
            .output()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&log.stdout).lines().count(), 2);
    }

    #[tokio::test]
    async fn failed_sync_serves_stale_as_hit() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let upstream = tmp.path().join("upstream");
        let url = make_upstream(&upstream);
        let mgr = manager(&tmp.path().join("mirrors"), "1h");

        mgr.ensure_repo("example.com", "org", "repo", &url, "")
            .await
            .unwrap();

        // Take the upstream away and force staleness.
        std::fs::remove_dir_all(&upstream).unwrap();
        let Some(stale) = Instant::now().checked_sub(Duration::from_secs(2 * 3600)) else {
            return;
        };
        mgr.set_last_sync("example.com/org/repo", stale);

        let (path, status) = mgr
            .ensure_repo("example.com", "org", "repo", &url, "")
            .await
            .unwrap();
        assert_eq!(status, Status::Hit);
        assert!(path.join("HEAD").is_file());
    }

    #[tokio::test]
    async fn clone_failure_leaves_no_mirror_behind() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let mirrors = tmp.path().join("mirrors");
        let mgr = manager(&mirrors, "1h");
        let url = format!("file://{}", tmp.path().join("missing").display());

        let err = mgr
            .ensure_repo("example.com", "org", "repo", &url, "")
            .await
            .unwrap_err();
        assert!(matches!(err, EnsureError::CloneFailed(_)));
        assert!(!mirrors.join("example.com/org/repo.git").exists());

        // The next attempt with a healthy upstream succeeds.
        let good = make_upstream(&tmp.path().join("upstream"));
        let (_, status) = mgr
            .ensure_repo("example.com", "org", "repo", &good, "")
            .await
            .unwrap();
        assert_eq!(status, Status::Clone);
    }

    #[tokio::test]
    async fn authenticated_clone_writes_sentinel() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let url = make_upstream(&tmp.path().join("upstream"));
        let mgr = manager(&tmp.path().join("mirrors"), "1h");

        // file:// upstreams ignore the header; the sentinel must still land.
        let (path, status) = mgr
            .ensure_repo("example.com", "org", "repo", &url, "Bearer XYZ")
            .await
            .unwrap();
        assert_eq!(status, Status::Clone);
        assert!(path.join(REQUIRES_AUTH_SENTINEL).is_file());
    }

    #[tokio::test]
    async fn maintain_repo_rejects_bad_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp.path().join("mirrors"), "1h");
        assert!(mgr
            .maintain_repo("not-a-key", MaintenanceMode::Light)
            .await
            .is_err());
        assert!(mgr
            .maintain_repo("example.com/org/absent", MaintenanceMode::Light)
            .await
            .is_err());
    }

    #[test]
    fn repo_path_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), "1h");
        assert_eq!(
            mgr.repo_path("github.com", "octocat", "hello"),
            tmp.path().join("github.com/octocat/hello.git")
        );
    }
}
