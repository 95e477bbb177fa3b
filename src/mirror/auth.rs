//! Upstream auth validation with a persistent fallback cache.
//!
//! A client asking for a private mirror must prove its credentials are still
//! good. We probe the upstream with an unauthenticated `info/refs` GET: a 401
//! confirms the repo is private, a 2xx means it is effectively public. The
//! cache stores SHA-1 digests of Authorization header values that some
//! upstream has accepted before, so a brief upstream outage does not lock
//! clients out of mirrors they could already read. Raw header bytes never
//! touch the disk.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use reqwest::StatusCode;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

/// File under the mirror root holding the digest set.
pub const AUTH_CACHE_FILE: &str = ".auth-cache.json";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum AuthError {
    /// The upstream confirmed the repo is private and the presented
    /// credentials have never been accepted.
    Rejected(anyhow::Error),
    /// The upstream could not be reached and the credentials are not cached.
    Unavailable(anyhow::Error),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Rejected(err) => write!(f, "authentication required: {err}"),
            AuthError::Unavailable(err) => write!(f, "upstream unavailable: {err}"),
        }
    }
}

impl std::error::Error for AuthError {}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

pub struct AuthValidator {
    client: reqwest::Client,
    cache_path: PathBuf,
    // Serialises whole-file read-modify-write cycles on the cache.
    cache_lock: Mutex<()>,
}

impl AuthValidator {
    pub fn new(client: reqwest::Client, mirror_root: impl Into<PathBuf>) -> Self {
        Self {
            client,
            cache_path: mirror_root.into().join(AUTH_CACHE_FILE),
            cache_lock: Mutex::new(()),
        }
    }

    /// Decide whether a client presenting `auth_header` may be served from a
    /// mirror that requires authentication.
    pub async fn validate(&self, upstream_url: &str, auth_header: &str) -> Result<(), AuthError> {
        let probe_url = format!(
            "{}/info/refs?service=git-upload-pack",
            upstream_url.trim_end_matches('/')
        );

        match self.client.get(&probe_url).send().await {
            Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED => {
                // Private repo: only previously accepted credentials pass.
                if self.contains(auth_header) {
                    debug!(%probe_url, "private upstream, credentials known good");
                    Ok(())
                } else {
                    self.remove(auth_header);
                    Err(AuthError::Rejected(anyhow!(
                        "upstream returned 401 and credentials are not in the auth cache"
                    )))
                }
            }
            Ok(resp) if resp.status().is_success() => {
                // Effectively public; remember the header so outages succeed.
                self.insert(auth_header);
                debug!(%probe_url, "upstream is public, credentials accepted");
                Ok(())
            }
            Ok(resp) => {
                // 403/404/5xx tell us nothing about the client's credentials;
                // treat like an unreachable upstream and fall back to the cache.
                let status = resp.status();
                if self.contains(auth_header) {
                    warn!(%probe_url, %status, "unexpected probe status, accepting via auth cache");
                    Ok(())
                } else {
                    Err(AuthError::Unavailable(anyhow!(
                        "upstream probe returned {status} and credentials are not cached"
                    )))
                }
            }
            Err(err) => {
                if self.contains(auth_header) {
                    warn!(%probe_url, error = %err, "upstream unreachable, accepting via auth cache");
                    Ok(())
                } else {
                    Err(AuthError::Unavailable(
                        anyhow::Error::new(err).context("upstream auth probe failed"),
                    ))
                }
            }
        }
    }

    /// Record that `auth_header` was accepted by some upstream.
    pub fn insert(&self, auth_header: &str) {
        let digest = digest_hex(auth_header);
        let _guard = self.cache_lock.lock().unwrap();
        let mut set = self.load();
        if set.insert(digest) {
            self.store(&set);
        }
    }

    /// Drop `auth_header` from the cache (it was just rejected upstream).
    pub fn remove(&self, auth_header: &str) {
        let digest = digest_hex(auth_header);
        let _guard = self.cache_lock.lock().unwrap();
        let mut set = self.load();
        if set.remove(&digest) {
            self.store(&set);
        }
    }

    /// Whether `auth_header` was ever accepted by an upstream.
    pub fn contains(&self, auth_header: &str) -> bool {
        let digest = digest_hex(auth_header);
        let _guard = self.cache_lock.lock().unwrap();
        self.load().contains(&digest)
    }

    // A missing or corrupt cache file reads as empty: absence of a digest is
    // never proof of invalidity, so losing the file only costs availability.
    fn load(&self) -> HashSet<String> {
        let blob = match std::fs::read(&self.cache_path) {
            Ok(blob) => blob,
            Err(_) => return HashSet::new(),
        };
        match serde_json::from_slice(&blob) {
            Ok(set) => set,
            Err(err) => {
                warn!(path = %self.cache_path.display(), error = %err, "auth cache unreadable, treating as empty");
                HashSet::new()
            }
        }
    }

    fn store(&self, set: &HashSet<String>) {
        let result: Result<()> = (|| {
            let blob = serde_json::to_vec(set).context("serialise auth cache")?;
            std::fs::write(&self.cache_path, blob)
                .with_context(|| format!("write {}", self.cache_path.display()))?;
            Ok(())
        })();
        if let Err(err) = result {
            warn!(error = %err, "failed to persist auth cache");
        }
    }
}

/// Hex-encoded SHA-1 of the full header value, scheme included.
fn digest_hex(auth_header: &str) -> String {
    hex::encode(Sha1::digest(auth_header.as_bytes()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(dir: &std::path::Path) -> AuthValidator {
        AuthValidator::new(reqwest::Client::new(), dir)
    }

    #[test]
    fn digest_is_sha1_of_full_header() {
        // sha1("Bearer XYZ")
        assert_eq!(
            digest_hex("Bearer XYZ"),
            "8fe512fcb8372a3c58cd0f484aa4c1a8db89f009"
        );
    }

    #[test]
    fn insert_contains_remove_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let v = validator(tmp.path());

        assert!(!v.contains("Bearer XYZ"));
        v.insert("Bearer XYZ");
        assert!(v.contains("Bearer XYZ"));
        assert!(!v.contains("Bearer OTHER"));

        // Survives a fresh validator over the same root.
        let v2 = validator(tmp.path());
        assert!(v2.contains("Bearer XYZ"));

        v2.remove("Bearer XYZ");
        assert!(!v.contains("Bearer XYZ"));
    }

    #[test]
    fn corrupt_cache_file_reads_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(AUTH_CACHE_FILE), b"not json{{").unwrap();
        let v = validator(tmp.path());
        assert!(!v.contains("Bearer XYZ"));
        // And it recovers on the next write.
        v.insert("Bearer XYZ");
        assert!(v.contains("Bearer XYZ"));
    }

    #[test]
    fn cache_file_never_contains_raw_header() {
        let tmp = tempfile::tempdir().unwrap();
        let v = validator(tmp.path());
        v.insert("Bearer super-secret-token");
        let blob = std::fs::read_to_string(tmp.path().join(AUTH_CACHE_FILE)).unwrap();
        assert!(!blob.contains("super-secret-token"));
    }

    /// Stub upstream that answers every path with a fixed status.
    async fn stub_upstream(status: reqwest::StatusCode) -> String {
        use axum::routing::get;
        let code =
            axum::http::StatusCode::from_u16(status.as_u16()).unwrap();
        let app = axum::Router::new().route("/{*rest}", get(move || async move { code }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/owner/repo.git")
    }

    #[tokio::test]
    async fn private_upstream_rejects_unknown_credentials() {
        let tmp = tempfile::tempdir().unwrap();
        let v = validator(tmp.path());
        let url = stub_upstream(StatusCode::UNAUTHORIZED).await;

        match v.validate(&url, "Bearer unknown").await {
            Err(AuthError::Rejected(_)) => {}
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn private_upstream_accepts_cached_credentials() {
        let tmp = tempfile::tempdir().unwrap();
        let v = validator(tmp.path());
        v.insert("Bearer XYZ");
        let url = stub_upstream(StatusCode::UNAUTHORIZED).await;
        v.validate(&url, "Bearer XYZ").await.unwrap();
    }

    #[tokio::test]
    async fn public_upstream_accepts_and_caches() {
        let tmp = tempfile::tempdir().unwrap();
        let v = validator(tmp.path());
        let url = stub_upstream(StatusCode::OK).await;

        v.validate(&url, "Bearer XYZ").await.unwrap();
        assert!(v.contains("Bearer XYZ"));
    }

    #[tokio::test]
    async fn unreachable_upstream_falls_back_to_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let v = validator(tmp.path());

        // Grab an ephemeral port, then free it so connections are refused.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let url = format!("http://{addr}/owner/repo.git");

        match v.validate(&url, "Bearer XYZ").await {
            Err(AuthError::Unavailable(_)) => {}
            other => panic!("expected unavailable, got {other:?}"),
        }

        v.insert("Bearer XYZ");
        v.validate(&url, "Bearer XYZ").await.unwrap();
        // A different, never-cached header still fails.
        assert!(v.validate(&url, "Bearer OTHER").await.is_err());
    }
}
