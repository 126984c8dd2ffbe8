//! メトリクス
//!
//! 計測はあってもなくても本処理の正しさに影響しないため、
//! トレイト + no-op 実装の差し替え可能な形にしている。
//! 本番は AtomicU64 カウンタを /metrics で Prometheus 形式に出力する。

use std::sync::atomic::{AtomicU64, Ordering};

/// 注文系メトリクスの記録窓口。既定実装はすべて no-op。
pub trait OrderMetrics: Send + Sync {
    fn record_order_created(&self) {}
    fn record_idempotency_hit(&self) {}
    fn record_idempotency_conflict(&self) {}
    fn record_rate_limited(&self) {}
    fn record_overloaded(&self) {}
    fn record_cache_hit(&self) {}
    fn record_cache_miss(&self) {}
}

/// 計測なし
pub struct NoopOrderMetrics;

impl OrderMetrics for NoopOrderMetrics {}

/// プロセス内カウンタ
#[derive(Default)]
pub struct AtomicOrderMetrics {
    orders_created: AtomicU64,
    idempotency_hits: AtomicU64,
    idempotency_conflicts: AtomicU64,
    rate_limited: AtomicU64,
    overloaded: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl AtomicOrderMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prometheus形式で出力
    pub fn render_prometheus(&self) -> String {
        format!(
            "# HELP orders_created_total Orders successfully created\n\
             # TYPE orders_created_total counter\n\
             orders_created_total {}\n\
             # HELP idempotency_hits_total Replays served from stored outcomes\n\
             # TYPE idempotency_hits_total counter\n\
             idempotency_hits_total {}\n\
             # HELP idempotency_conflicts_total Keys reused with a different payload\n\
             # TYPE idempotency_conflicts_total counter\n\
             idempotency_conflicts_total {}\n\
             # HELP rate_limited_total Requests shed by the token bucket\n\
             # TYPE rate_limited_total counter\n\
             rate_limited_total {}\n\
             # HELP overloaded_total Requests shed by the admission semaphore\n\
             # TYPE overloaded_total counter\n\
             overloaded_total {}\n\
             # HELP cache_hits_total Order reads served from cache\n\
             # TYPE cache_hits_total counter\n\
             cache_hits_total {}\n\
             # HELP cache_misses_total Order reads that missed the cache\n\
             # TYPE cache_misses_total counter\n\
             cache_misses_total {}\n",
            self.orders_created.load(Ordering::Relaxed),
            self.idempotency_hits.load(Ordering::Relaxed),
            self.idempotency_conflicts.load(Ordering::Relaxed),
            self.rate_limited.load(Ordering::Relaxed),
            self.overloaded.load(Ordering::Relaxed),
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
        )
    }
}

impl OrderMetrics for AtomicOrderMetrics {
    fn record_order_created(&self) {
        self.orders_created.fetch_add(1, Ordering::Relaxed);
    }

    fn record_idempotency_hit(&self) {
        self.idempotency_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_idempotency_conflict(&self) {
        self.idempotency_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    fn record_overloaded(&self) {
        self.overloaded.fetch_add(1, Ordering::Relaxed);
    }

    fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }
}
