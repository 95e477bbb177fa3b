//! LRU capacity management for the mirror root.
//!
//! Last-access times live in memory; the filesystem stays authoritative for
//! which mirrors exist and how big they are. When the summed size of all
//! bare mirrors exceeds the configured budget, the least recently used repos
//! are deleted until the total fits again. Keys with no in-memory record
//! (typically after a restart) fall back to the directory mtime, which also
//! breaks ties.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::SizeSpec;

/// Attempts made when every over-budget candidate is pinned by in-flight work.
const EVICT_RETRIES: u32 = 5;
const EVICT_BACKOFF: Duration = Duration::from_millis(250);

pub struct LruStore {
    root: PathBuf,
    max_size: SizeSpec,
    last_access: Mutex<HashMap<String, SystemTime>>,
}

#[derive(Debug)]
struct RepoUsage {
    key: String,
    path: PathBuf,
    size: u64,
    last_used: SystemTime,
}

impl LruStore {
    pub fn new(root: impl Into<PathBuf>, max_size: SizeSpec) -> Self {
        Self {
            root: root.into(),
            max_size,
            last_access: Mutex::new(HashMap::new()),
        }
    }

    /// Record an access for LRU ordering. Called on every ensure, regardless
    /// of outcome.
    pub fn touch(&self, key: &str) {
        self.last_access
            .lock()
            .unwrap()
            .insert(key.to_owned(), SystemTime::now());
    }

    /// Resolve the configured budget to bytes.
    pub fn budget_bytes(&self) -> Result<u64> {
        match self.max_size {
            SizeSpec::Bytes(n) => Ok(n),
            SizeSpec::Percent(pct) => {
                let total = filesystem_capacity(&self.root)
                    .context("failed to stat mirror filesystem")?;
                Ok((total as f64 * pct / 100.0) as u64)
            }
        }
    }

    /// Evict least-recently-used mirrors until the total size fits the
    /// budget. Keys for which `is_busy` returns true (a clone or fetch is in
    /// flight) are skipped; if only busy repos remain over budget, back off
    /// briefly and retry a bounded number of times.
    ///
    /// Returns the number of bytes freed.
    pub async fn maybe_evict(&self, is_busy: impl Fn(&str) -> bool) -> Result<u64> {
        let budget = self.budget_bytes()?;
        let mut freed: u64 = 0;

        for attempt in 0..EVICT_RETRIES {
            let mut repos = self.scan().await?;
            let mut total: u64 = repos.iter().map(|r| r.size).sum();
            if total <= budget {
                break;
            }
            repos.sort_by_key(|r| r.last_used);

            let mut evicted_any = false;
            for repo in &repos {
                if total <= budget {
                    break;
                }
                if is_busy(&repo.key) {
                    debug!(key = %repo.key, "skipping eviction of in-flight mirror");
                    continue;
                }
                match tokio::fs::remove_dir_all(&repo.path).await {
                    Ok(()) => {
                        info!(key = %repo.key, size = repo.size, "evicted mirror");
                        self.last_access.lock().unwrap().remove(&repo.key);
                        total -= repo.size;
                        freed += repo.size;
                        evicted_any = true;
                    }
                    Err(err) => {
                        warn!(key = %repo.key, error = %err, "failed to evict mirror");
                    }
                }
            }

            if total <= budget {
                break;
            }
            if !evicted_any {
                debug!(attempt, "no evictable mirrors, backing off");
                tokio::time::sleep(EVICT_BACKOFF * (attempt + 1)).await;
            }
        }

        Ok(freed)
    }

    /// Walk `<root>/<host>/<owner>/*.git` and report per-mirror usage.
    async fn scan(&self) -> Result<Vec<RepoUsage>> {
        let root = self.root.clone();
        let found = tokio::task::spawn_blocking(move || scan_mirrors(&root))
            .await
            .context("mirror scan task panicked")??;

        let last_access = self.last_access.lock().unwrap();
        Ok(found
            .into_iter()
            .map(|(key, path, size, mtime)| {
                let last_used = last_access.get(&key).copied().unwrap_or(mtime);
                RepoUsage {
                    key,
                    path,
                    size,
                    last_used,
                }
            })
            .collect())
    }
}

fn scan_mirrors(root: &Path) -> Result<Vec<(String, PathBuf, u64, SystemTime)>> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    for host in read_dirs(root)? {
        for owner in read_dirs(&host)? {
            for repo in read_dirs(&owner)? {
                let name = repo.file_name().and_then(|n| n.to_str()).unwrap_or("");
                let Some(stem) = name.strip_suffix(".git") else {
                    continue;
                };
                let key = format!(
                    "{}/{}/{}",
                    component(&host),
                    component(&owner),
                    stem,
                );
                let size = dir_size(&repo);
                let mtime = std::fs::metadata(&repo)
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                out.push((key, repo, size, mtime));
            }
        }
    }
    Ok(out)
}

fn component(path: &Path) -> std::borrow::Cow<'_, str> {
    path.file_name().unwrap_or_default().to_string_lossy()
}

fn read_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))?;
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

/// Total size of all regular files under `dir`. Symlinks are not followed.
pub(crate) fn dir_size(dir: &Path) -> u64 {
    let mut total: u64 = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            if meta.is_dir() {
                stack.push(entry.path());
            } else if meta.is_file() {
                total += meta.len();
            }
        }
    }
    total
}

/// Capacity in bytes of the filesystem hosting `path`.
#[cfg(target_family = "unix")]
fn filesystem_capacity(path: &Path) -> std::io::Result<u64> {
    use std::os::unix::ffi::OsStrExt;

    let cstr = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // SAFETY: statvfs is a plain POSIX syscall; `stat` is a zeroable C struct
    // and `cstr` is a valid NUL-terminated path.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cstr.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(stat.f_blocks as u64 * stat.f_frsize as u64)
}

#[cfg(not(target_family = "unix"))]
fn filesystem_capacity(_path: &Path) -> std::io::Result<u64> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "filesystem capacity probing is only supported on Unix",
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Create a fake bare mirror of `size` bytes under the root.
    fn make_mirror(root: &Path, key: &str, size: usize) -> PathBuf {
        let path = root.join(format!("{key}.git"));
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("pack"), vec![0u8; size]).unwrap();
        path
    }

    #[test]
    fn dir_size_counts_nested_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a"), b"aaa").unwrap();
        let sub = tmp.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("b"), b"bbbbb").unwrap();
        assert_eq!(dir_size(tmp.path()), 8);
    }

    #[tokio::test]
    async fn within_budget_evicts_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        make_mirror(tmp.path(), "host/owner/a", 100);
        let lru = LruStore::new(tmp.path(), SizeSpec::Bytes(1_000));
        let freed = lru.maybe_evict(|_| false).await.unwrap();
        assert_eq!(freed, 0);
        assert!(tmp.path().join("host/owner/a.git").exists());
    }

    #[tokio::test]
    async fn evicts_least_recently_used_first() {
        let tmp = tempfile::tempdir().unwrap();
        make_mirror(tmp.path(), "host/owner/a", 1_000);
        make_mirror(tmp.path(), "host/owner/b", 1_000);
        make_mirror(tmp.path(), "host/owner/c", 1_000);

        // Budget fits two repos; access order makes b the oldest.
        let lru = LruStore::new(tmp.path(), SizeSpec::Bytes(2_500));
        lru.touch("host/owner/b");
        std::thread::sleep(Duration::from_millis(10));
        lru.touch("host/owner/a");
        std::thread::sleep(Duration::from_millis(10));
        lru.touch("host/owner/c");

        let freed = lru.maybe_evict(|_| false).await.unwrap();
        assert_eq!(freed, 1_000);
        assert!(!tmp.path().join("host/owner/b.git").exists());
        assert!(tmp.path().join("host/owner/a.git").exists());
        assert!(tmp.path().join("host/owner/c.git").exists());
    }

    #[tokio::test]
    async fn never_evicts_in_flight_mirrors() {
        let tmp = tempfile::tempdir().unwrap();
        make_mirror(tmp.path(), "host/owner/a", 1_000);
        make_mirror(tmp.path(), "host/owner/b", 1_000);

        let lru = LruStore::new(tmp.path(), SizeSpec::Bytes(1_500));
        lru.touch("host/owner/a");
        std::thread::sleep(Duration::from_millis(10));
        lru.touch("host/owner/b");

        // The older repo is busy, so the newer one goes instead.
        let freed = lru
            .maybe_evict(|key| key == "host/owner/a")
            .await
            .unwrap();
        assert_eq!(freed, 1_000);
        assert!(tmp.path().join("host/owner/a.git").exists());
        assert!(!tmp.path().join("host/owner/b.git").exists());
    }

    #[tokio::test]
    async fn untracked_mirrors_fall_back_to_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        make_mirror(tmp.path(), "host/owner/old", 1_000);
        std::thread::sleep(Duration::from_millis(20));
        make_mirror(tmp.path(), "host/owner/new", 1_000);
        // Only the newer repo has an in-memory access record.
        let lru = LruStore::new(tmp.path(), SizeSpec::Bytes(1_500));
        lru.touch("host/owner/new");

        lru.maybe_evict(|_| false).await.unwrap();
        assert!(!tmp.path().join("host/owner/old.git").exists());
        assert!(tmp.path().join("host/owner/new.git").exists());
    }

    #[test]
    fn percent_budget_resolves_against_filesystem() {
        let tmp = tempfile::tempdir().unwrap();
        let lru = LruStore::new(tmp.path(), SizeSpec::Percent(80.0));
        let budget = lru.budget_bytes().unwrap();
        assert!(budget > 0);
        let full = LruStore::new(tmp.path(), SizeSpec::Percent(100.0))
            .budget_bytes()
            .unwrap();
        assert!(budget < full);
    }
}
