//! Lock-free process-global counters for the store, sync and archive paths.
//!
//! Recording is a relaxed atomic add; `bookchat stats` serializes a snapshot.

use serde::Serialize;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Counter {
    v: AtomicU64,
}

impl Counter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            v: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc(&self) {
        self.v.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, delta: u64) {
        self.v.fetch_add(delta, Ordering::Relaxed);
    }

    #[inline]
    pub fn load(&self) -> u64 {
        self.v.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    v: AtomicU64,
}

impl Gauge {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            v: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn set(&self, value: u64) {
        self.v.store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn load(&self) -> u64 {
        self.v.load(Ordering::Relaxed)
    }
}

const BUCKETS: usize = 64;

/// Power-of-two bucketed latency histogram.
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; BUCKETS],
    count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LatencySnapshot {
    pub count: u64,
    pub mean: u64,
    pub max: u64,
    pub p50: u64,
    pub p99: u64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyHistogram {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record(&self, value: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
        self.buckets[bucket_of(value)].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_duration(&self, d: std::time::Duration) {
        self.record(u64::try_from(d.as_micros()).unwrap_or(u64::MAX));
    }

    #[must_use]
    pub fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let max = self.max.load(Ordering::Relaxed);
        if count == 0 {
            return LatencySnapshot {
                count: 0,
                mean: 0,
                max: 0,
                p50: 0,
                p99: 0,
            };
        }
        let buckets: [u64; BUCKETS] =
            std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed));
        LatencySnapshot {
            count,
            mean: self.sum.load(Ordering::Relaxed) / count,
            max,
            p50: quantile(&buckets, count, 500, max),
            p99: quantile(&buckets, count, 990, max),
        }
    }
}

#[inline]
const fn bucket_of(value: u64) -> usize {
    if value == 0 {
        0
    } else {
        63 - value.leading_zeros() as usize
    }
}

/// Nearest-rank estimate, reported as the upper bound of the matching bucket.
fn quantile(buckets: &[u64; BUCKETS], count: u64, permille: u64, max: u64) -> u64 {
    let rank = (count.saturating_mul(permille).div_ceil(1000)).clamp(1, count);
    let mut seen = 0u64;
    for (idx, n) in buckets.iter().enumerate() {
        seen = seen.saturating_add(*n);
        if seen >= rank {
            let upper = if idx >= 63 {
                u64::MAX
            } else {
                (1u64 << (idx + 1)) - 1
            };
            return upper.min(max);
        }
    }
    max
}

// ---------------------------------------------------------------------------
// Global surface
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct StoreMetrics {
    pub appends_total: Counter,
    pub append_errors_total: Counter,
    pub list_calls_total: Counter,
    pub files_skipped_total: Counter,
    pub verify_failures_total: Counter,
    pub commit_latency_us: LatencyHistogram,
    pub branches_known: Gauge,
}

#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub fetches_total: Counter,
    pub pushes_total: Counter,
    pub retries_total: Counter,
    pub stale_marks_total: Counter,
    pub cooldown_skips_total: Counter,
    pub network_latency_us: LatencyHistogram,
}

#[derive(Debug, Default)]
pub struct ArchiveMetrics {
    pub runs_total: Counter,
    pub messages_moved_total: Counter,
    pub commits_total: Counter,
}

#[derive(Debug, Default)]
pub struct GlobalMetrics {
    pub store: StoreMetrics,
    pub sync: SyncMetrics,
    pub archive: ArchiveMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalMetricsSnapshot {
    pub appends_total: u64,
    pub append_errors_total: u64,
    pub list_calls_total: u64,
    pub files_skipped_total: u64,
    pub verify_failures_total: u64,
    pub commit_latency_us: LatencySnapshot,
    pub branches_known: u64,
    pub fetches_total: u64,
    pub pushes_total: u64,
    pub sync_retries_total: u64,
    pub stale_marks_total: u64,
    pub cooldown_skips_total: u64,
    pub network_latency_us: LatencySnapshot,
    pub archive_runs_total: u64,
    pub archive_messages_moved_total: u64,
    pub archive_commits_total: u64,
}

impl GlobalMetrics {
    #[must_use]
    pub fn snapshot(&self) -> GlobalMetricsSnapshot {
        GlobalMetricsSnapshot {
            appends_total: self.store.appends_total.load(),
            append_errors_total: self.store.append_errors_total.load(),
            list_calls_total: self.store.list_calls_total.load(),
            files_skipped_total: self.store.files_skipped_total.load(),
            verify_failures_total: self.store.verify_failures_total.load(),
            commit_latency_us: self.store.commit_latency_us.snapshot(),
            branches_known: self.store.branches_known.load(),
            fetches_total: self.sync.fetches_total.load(),
            pushes_total: self.sync.pushes_total.load(),
            sync_retries_total: self.sync.retries_total.load(),
            stale_marks_total: self.sync.stale_marks_total.load(),
            cooldown_skips_total: self.sync.cooldown_skips_total.load(),
            network_latency_us: self.sync.network_latency_us.snapshot(),
            archive_runs_total: self.archive.runs_total.load(),
            archive_messages_moved_total: self.archive.messages_moved_total.load(),
            archive_commits_total: self.archive.commits_total.load(),
        }
    }
}

static GLOBAL_METRICS: LazyLock<GlobalMetrics> = LazyLock::new(GlobalMetrics::default);

#[must_use]
pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}
