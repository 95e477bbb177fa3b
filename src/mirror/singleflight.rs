//! Per-key call deduplication.
//!
//! Collapses concurrent calls that share a key into a single execution: the
//! first caller (the leader) runs the work, every later caller (a follower)
//! subscribes to the leader's result. Once the leader finishes, the key is
//! forgotten and the next caller starts a fresh flight.
//!
//! If the leader's future is dropped mid-flight (the request that owned it
//! was cancelled), the map entry is cleaned up and one waiting follower
//! promotes itself to leader and re-runs the work.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use tokio::sync::watch;

pub struct Group<T: Clone> {
    calls: Mutex<HashMap<String, watch::Receiver<Option<T>>>>,
}

impl<T: Clone> Default for Group<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Group<T> {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a flight for `key` is currently in progress.
    pub fn contains(&self, key: &str) -> bool {
        self.calls.lock().unwrap().contains_key(key)
    }

    /// Run `work` under `key`, deduplicating concurrent callers.
    ///
    /// Returns the shared value and whether this caller piggybacked on
    /// another caller's execution instead of running `work` itself.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> (T, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        enum Role<T> {
            Leader(watch::Sender<Option<T>>),
            Follower(watch::Receiver<Option<T>>),
        }

        let mut work = Some(work);
        loop {
            let role = {
                let mut calls = self.calls.lock().unwrap();
                if let Some(rx) = calls.get(key) {
                    Role::Follower(rx.clone())
                } else {
                    let (tx, rx) = watch::channel(None);
                    calls.insert(key.to_owned(), rx);
                    Role::Leader(tx)
                }
            };

            match role {
                Role::Leader(tx) => {
                    // The guard removes the map entry even if `work` is
                    // cancelled, so followers never wait on a dead flight.
                    let _guard = FlightGuard { group: self, key };
                    let work = work.take().expect("singleflight leader entered twice");
                    let value = work().await;
                    let _ = tx.send(Some(value.clone()));
                    return (value, false);
                }
                Role::Follower(mut rx) => {
                    let outcome = loop {
                        if let Some(v) = rx.borrow_and_update().clone() {
                            break Some(v);
                        }
                        if rx.changed().await.is_err() {
                            break rx.borrow().clone();
                        }
                    };
                    match outcome {
                        Some(v) => return (v, true),
                        // Leader vanished without producing a value.
                        None => continue,
                    }
                }
            }
        }
    }
}

struct FlightGuard<'a, T: Clone> {
    group: &'a Group<T>,
    key: &'a str,
}

impl<T: Clone> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        self.group.calls.lock().unwrap().remove(self.key);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
