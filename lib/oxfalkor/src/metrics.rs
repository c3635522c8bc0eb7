//! Observability counters for the adapter.
//!
//! Lock-free atomic counters recording query traffic, pushdown hit
//! rate and write volume, exportable in Prometheus text format.

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics collected by a [`Store`](crate::store::Store).
#[derive(Debug, Default)]
pub struct StoreMetrics {
    /// Total number of SPARQL queries executed.
    pub queries_total: AtomicU64,
    /// Queries answered by a compiled Cypher statement.
    pub pushdowns_total: AtomicU64,
    /// Queries answered by the fallback evaluator.
    pub fallbacks_total: AtomicU64,
    /// Total number of triples inserted.
    pub inserts_total: AtomicU64,
    /// Total number of triples deleted.
    pub deletes_total: AtomicU64,
    /// Total number of `UNWIND` batches flushed by commits.
    pub flush_batches_total: AtomicU64,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_query(&self, pushed_down: bool) {
        self.queries_total.fetch_add(1, Ordering::Relaxed);
        if pushed_down {
            self.pushdowns_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fallbacks_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_inserts(&self, count: u64) {
        self.inserts_total.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_deletes(&self, count: u64) {
        self.deletes_total.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_flush_batches(&self, count: u64) {
        self.flush_batches_total.fetch_add(count, Ordering::Relaxed);
    }

    /// Export the counters in Prometheus text format.
    pub fn to_prometheus_format(&self) -> String {
        let queries = self.queries_total.load(Ordering::Relaxed);
        let pushdowns = self.pushdowns_total.load(Ordering::Relaxed);
        let fallbacks = self.fallbacks_total.load(Ordering::Relaxed);
        let inserts = self.inserts_total.load(Ordering::Relaxed);
        let deletes = self.deletes_total.load(Ordering::Relaxed);
        let batches = self.flush_batches_total.load(Ordering::Relaxed);

        format!(
            "# HELP oxfalkor_queries_total Total number of SPARQL queries executed\n\
             # TYPE oxfalkor_queries_total counter\n\
             oxfalkor_queries_total {queries}\n\
             # HELP oxfalkor_pushdowns_total Queries answered by a compiled Cypher statement\n\
             # TYPE oxfalkor_pushdowns_total counter\n\
             oxfalkor_pushdowns_total {pushdowns}\n\
             # HELP oxfalkor_fallbacks_total Queries answered by the fallback evaluator\n\
             # TYPE oxfalkor_fallbacks_total counter\n\
             oxfalkor_fallbacks_total {fallbacks}\n\
             # HELP oxfalkor_inserts_total Total number of triples inserted\n\
             # TYPE oxfalkor_inserts_total counter\n\
             oxfalkor_inserts_total {inserts}\n\
             # HELP oxfalkor_deletes_total Total number of triples deleted\n\
             # TYPE oxfalkor_deletes_total counter\n\
             oxfalkor_deletes_total {deletes}\n\
             # HELP oxfalkor_flush_batches_total Total number of UNWIND batches flushed\n\
             # TYPE oxfalkor_flush_batches_total counter\n\
             oxfalkor_flush_batches_total {batches}\n"
        )
    }
}
