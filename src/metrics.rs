use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::mirror::Status;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RequestKind {
    Info,
    Pack,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub repo: String,
    pub kind: RequestKind,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResponseLabels {
    pub repo: String,
    pub kind: RequestKind,
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EnsureLabels {
    pub status: EnsureStatus,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum EnsureStatus {
    Hit,
    Clone,
    Sync,
}

impl From<Status> for EnsureStatus {
    fn from(status: Status) -> Self {
        match status {
            Status::Hit => EnsureStatus::Hit,
            Status::Clone => EnsureStatus::Clone,
            Status::Sync => EnsureStatus::Sync,
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the proxy.
pub struct Metrics {
    pub requests_total: Family<RequestLabels, Counter>,
    pub responses_total: Family<ResponseLabels, Counter>,
    pub errors_total: Family<RequestLabels, Counter>,
    pub ensure_total: Family<EnsureLabels, Counter>,
    pub ensure_duration_seconds: Histogram,
    pub pack_cache_hits: Counter,
    pub pack_cache_misses: Counter,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "gitmirrord_requests_total",
            "Smart HTTP requests received by repo and kind",
            requests_total.clone(),
        );

        let responses_total = Family::<ResponseLabels, Counter>::default();
        registry.register(
            "gitmirrord_responses_total",
            "Responses sent by repo, kind and HTTP status",
            responses_total.clone(),
        );

        let errors_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "gitmirrord_errors_total",
            "Requests that failed before serving, by repo and kind",
            errors_total.clone(),
        );

        let ensure_total = Family::<EnsureLabels, Counter>::default();
        registry.register(
            "gitmirrord_ensure_total",
            "Mirror ensure outcomes (hit / clone / sync)",
            ensure_total.clone(),
        );

        let ensure_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 16));
        registry.register(
            "gitmirrord_ensure_duration_seconds",
            "Latency of the mirror ensure step",
            ensure_duration_seconds.clone(),
        );

        let pack_cache_hits = Counter::default();
        registry.register(
            "gitmirrord_pack_cache_hits_total",
            "Upload-pack requests served from the cached-pack fast path",
            pack_cache_hits.clone(),
        );

        let pack_cache_misses = Counter::default();
        registry.register(
            "gitmirrord_pack_cache_misses_total",
            "Cacheable upload-pack requests that had to build a pack",
            pack_cache_misses.clone(),
        );

        Self {
            requests_total,
            responses_total,
            errors_total,
            ensure_total,
            ensure_duration_seconds,
            pack_cache_hits,
            pack_cache_misses,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper around the registry, shared via `AppState`.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    pub fn record_request(&self, repo: &str, kind: RequestKind) {
        self.metrics
            .requests_total
            .get_or_create(&RequestLabels {
                repo: repo.to_owned(),
                kind,
            })
            .inc();
    }

    pub fn record_response(&self, repo: &str, kind: RequestKind, status: axum::http::StatusCode) {
        self.metrics
            .responses_total
            .get_or_create(&ResponseLabels {
                repo: repo.to_owned(),
                kind,
                status: status.as_u16().to_string(),
            })
            .inc();
    }

    pub fn record_error(&self, repo: &str, kind: RequestKind) {
        self.metrics
            .errors_total
            .get_or_create(&RequestLabels {
                repo: repo.to_owned(),
                kind,
            })
            .inc();
    }

    pub fn record_ensure(&self, status: Status) {
        self.metrics
            .ensure_total
            .get_or_create(&EnsureLabels {
                status: status.into(),
            })
            .inc();
    }

    pub fn record_pack_cache_hit(&self) {
        self.metrics.pack_cache_hits.inc();
    }

    pub fn record_pack_cache_miss(&self) {
        self.metrics.pack_cache_misses.inc();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_exposition() {
        let registry = MetricsRegistry::new();
        registry.record_request("github.com/octocat/hello", RequestKind::Info);
        registry.record_ensure(Status::Clone);
        registry.record_pack_cache_hit();
        registry.record_pack_cache_miss();

        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &registry.registry).unwrap();
        assert!(buf.contains("gitmirrord_requests_total"));
        assert!(buf.contains("gitmirrord_ensure_total"));
        assert!(buf.contains("gitmirrord_pack_cache_hits"));
        assert!(buf.contains("gitmirrord_pack_cache_misses"));
        assert!(buf.contains("repo=\"github.com/octocat/hello\""));
        assert_eq!(registry.metrics.pack_cache_hits.get(), 1);
        assert_eq!(registry.metrics.pack_cache_misses.get(), 1);
    }
}
