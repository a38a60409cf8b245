//! Counters and latency histograms for the coordinator and floor processes
//!
//! Recording is a few relaxed atomic adds, so lanes, connection tasks and the
//! coordinator share one `Metrics` without contention. These are statistics
//! only: nothing in the control path reads them back. `report()` swaps the
//! periodic parts to zero and hands back a snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Histogram bucket upper bounds in microseconds; an overflow bucket follows
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
pub const METRICS_NUM_BUCKETS: usize = METRICS_BUCKET_BOUNDS.len() + 1;

#[inline]
fn slot_for(latency_us: u64) -> usize {
    METRICS_BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Upper bound of the bucket holding quantile `q`. The overflow bucket
/// reports twice the last bound.
fn quantile_us(buckets: &[u64; METRICS_NUM_BUCKETS], q: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }
    let rank = (total as f64 * q).ceil() as u64;
    let mut seen = 0u64;
    let slot = buckets
        .iter()
        .position(|&count| {
            seen += count;
            seen >= rank
        })
        .unwrap_or(METRICS_NUM_BUCKETS - 1);
    METRICS_BUCKET_BOUNDS.get(slot).copied().unwrap_or(METRICS_BUCKET_BOUNDS[9] * 2)
}

/// Latency histogram with running sum and max, drained by `take()`
struct Histogram {
    buckets: [AtomicU64; METRICS_NUM_BUCKETS],
    sum_us: AtomicU64,
    max_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self { buckets: Default::default(), sum_us: AtomicU64::new(0), max_us: AtomicU64::new(0) }
    }

    #[inline]
    fn record(&self, latency_us: u64) {
        self.buckets[slot_for(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.max_us.fetch_max(latency_us, Ordering::Relaxed);
    }

    fn take(&self) -> LatencySnapshot {
        let buckets: [u64; METRICS_NUM_BUCKETS] = std::array::from_fn(|i| self.buckets[i].swap(0, Ordering::Relaxed));
        let sum_us = self.sum_us.swap(0, Ordering::Relaxed);
        let count: u64 = buckets.iter().sum();
        LatencySnapshot {
            count,
            avg_us: sum_us.checked_div(count).unwrap_or(0),
            max_us: self.max_us.swap(0, Ordering::Relaxed),
            p50_us: quantile_us(&buckets, 0.50),
            p99_us: quantile_us(&buckets, 0.99),
            buckets,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LatencySnapshot {
    pub count: u64,
    pub avg_us: u64,
    pub max_us: u64,
    pub p50_us: u64,
    pub p99_us: u64,
    /// Per-bucket counts, aligned with `METRICS_BUCKET_BOUNDS` plus overflow
    pub buckets: [u64; METRICS_NUM_BUCKETS],
}

/// Shared by every task of one process
pub struct Metrics {
    /// Events handled by the coordinator (monotonic)
    events_total: AtomicU64,
    /// Drained by `report()` to compute the event rate
    events_since_report: AtomicU64,
    event_latency: Histogram,
    entries_granted: AtomicU64,
    exits_granted: AtomicU64,
    denials: AtomicU64,
    duplicate_entries: AtomicU64,
    unknown_exits: AtomicU64,
    /// Retransmitted events answered from the ledger
    replays: AtomicU64,
    /// FAULT/MAINTENANCE events recorded
    events_recorded: AtomicU64,
    /// Revenue in cents (monotonic)
    revenue_cents: AtomicU64,
    bus_transactions: AtomicU64,
    bus_faults: AtomicU64,
    bus_latency: Histogram,
    transport_requests: AtomicU64,
    transport_faults: AtomicU64,
    lane_faults: AtomicU64,
    lane_resets: AtomicU64,
    passages: AtomicU64,
    display_updates: AtomicU64,
    reported_at: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_total: AtomicU64::new(0),
            events_since_report: AtomicU64::new(0),
            event_latency: Histogram::new(),
            entries_granted: AtomicU64::new(0),
            exits_granted: AtomicU64::new(0),
            denials: AtomicU64::new(0),
            duplicate_entries: AtomicU64::new(0),
            unknown_exits: AtomicU64::new(0),
            replays: AtomicU64::new(0),
            events_recorded: AtomicU64::new(0),
            revenue_cents: AtomicU64::new(0),
            bus_transactions: AtomicU64::new(0),
            bus_faults: AtomicU64::new(0),
            bus_latency: Histogram::new(),
            transport_requests: AtomicU64::new(0),
            transport_faults: AtomicU64::new(0),
            lane_faults: AtomicU64::new(0),
            lane_resets: AtomicU64::new(0),
            passages: AtomicU64::new(0),
            display_updates: AtomicU64::new(0),
            reported_at: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record one `handle_event` call (lock-free)
    #[inline]
    pub fn record_event_handled(&self, latency_us: u64) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
        self.events_since_report.fetch_add(1, Ordering::Relaxed);
        self.event_latency.record(latency_us);
    }

    #[inline]
    pub fn record_entry_granted(&self) {
        self.entries_granted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a granted exit with its fee (rounded to cents)
    #[inline]
    pub fn record_exit_granted(&self, fee: Option<f64>) {
        self.exits_granted.fetch_add(1, Ordering::Relaxed);
        if let Some(fee) = fee {
            let cents = (fee * 100.0).round().max(0.0) as u64;
            self.revenue_cents.fetch_add(cents, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_denial(&self) {
        self.denials.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_duplicate_entry(&self) {
        self.duplicate_entries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unknown_exit(&self) {
        self.unknown_exits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_replay(&self) {
        self.replays.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_recorded(&self) {
        self.events_recorded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one bus transaction and whether it succeeded
    #[inline]
    pub fn record_bus_transaction(&self, latency_us: u64, ok: bool) {
        self.bus_transactions.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.bus_faults.fetch_add(1, Ordering::Relaxed);
        }
        self.bus_latency.record(latency_us);
    }

    #[inline]
    pub fn record_transport_request(&self, ok: bool) {
        self.transport_requests.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.transport_faults.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_lane_fault(&self) {
        self.lane_faults.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_lane_reset(&self) {
        self.lane_resets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_passage(&self) {
        self.passages.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_display_update(&self) {
        self.display_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_total(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }

    pub fn entries_granted(&self) -> u64 {
        self.entries_granted.load(Ordering::Relaxed)
    }

    pub fn exits_granted(&self) -> u64 {
        self.exits_granted.load(Ordering::Relaxed)
    }

    pub fn denials(&self) -> u64 {
        self.denials.load(Ordering::Relaxed)
    }

    pub fn duplicate_entries(&self) -> u64 {
        self.duplicate_entries.load(Ordering::Relaxed)
    }

    pub fn unknown_exits(&self) -> u64 {
        self.unknown_exits.load(Ordering::Relaxed)
    }

    pub fn replays(&self) -> u64 {
        self.replays.load(Ordering::Relaxed)
    }

    pub fn bus_faults(&self) -> u64 {
        self.bus_faults.load(Ordering::Relaxed)
    }

    pub fn lane_faults(&self) -> u64 {
        self.lane_faults.load(Ordering::Relaxed)
    }

    pub fn passages(&self) -> u64 {
        self.passages.load(Ordering::Relaxed)
    }

    /// Snapshot everything; histograms and the event rate restart from zero
    pub fn report(&self, occupied: u32, total_spaces: u32) -> MetricsSummary {
        let handled = self.events_since_report.swap(0, Ordering::Relaxed);
        let event_latency = self.event_latency.take();
        let bus_latency = self.bus_latency.take();

        let elapsed = {
            let mut reported_at = self.reported_at.lock();
            let now = Instant::now();
            let elapsed = now.duration_since(*reported_at);
            *reported_at = now;
            elapsed.as_secs_f64()
        };
        let events_per_sec = if elapsed > 0.0 { handled as f64 / elapsed } else { 0.0 };

        MetricsSummary {
            events_total: self.events_total.load(Ordering::Relaxed),
            events_per_sec,
            event_latency,
            entries_granted: self.entries_granted.load(Ordering::Relaxed),
            exits_granted: self.exits_granted.load(Ordering::Relaxed),
            denials: self.denials.load(Ordering::Relaxed),
            duplicate_entries: self.duplicate_entries.load(Ordering::Relaxed),
            unknown_exits: self.unknown_exits.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
            events_recorded: self.events_recorded.load(Ordering::Relaxed),
            revenue_total: self.revenue_cents.load(Ordering::Relaxed) as f64 / 100.0,
            bus_transactions: self.bus_transactions.load(Ordering::Relaxed),
            bus_faults: self.bus_faults.load(Ordering::Relaxed),
            bus_latency,
            transport_requests: self.transport_requests.load(Ordering::Relaxed),
            transport_faults: self.transport_faults.load(Ordering::Relaxed),
            lane_faults: self.lane_faults.load(Ordering::Relaxed),
            lane_resets: self.lane_resets.load(Ordering::Relaxed),
            passages: self.passages.load(Ordering::Relaxed),
            display_updates: self.display_updates.load(Ordering::Relaxed),
            occupied,
            total_spaces,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub events_total: u64,
    pub events_per_sec: f64,
    pub event_latency: LatencySnapshot,
    pub entries_granted: u64,
    pub exits_granted: u64,
    pub denials: u64,
    pub duplicate_entries: u64,
    pub unknown_exits: u64,
    pub replays: u64,
    pub events_recorded: u64,
    pub revenue_total: f64,
    pub bus_transactions: u64,
    pub bus_faults: u64,
    pub bus_latency: LatencySnapshot,
    pub transport_requests: u64,
    pub transport_faults: u64,
    pub lane_faults: u64,
    pub lane_resets: u64,
    pub passages: u64,
    pub display_updates: u64,
    /// Occupancy at report time
    pub occupied: u32,
    pub total_spaces: u32,
}

impl MetricsSummary {
    /// Coordinator-side view
    pub fn log(&self) {
        info!(
            events_total = %self.events_total,
            events_per_sec = format!("{:.1}", self.events_per_sec),
            avg_latency_us = %self.event_latency.avg_us,
            max_latency_us = %self.event_latency.max_us,
            p99_us = %self.event_latency.p99_us,
            entries = %self.entries_granted,
            exits = %self.exits_granted,
            denials = %self.denials,
            unknown_exits = %self.unknown_exits,
            replays = %self.replays,
            occupied = %self.occupied,
            total = %self.total_spaces,
            revenue = format!("{:.2}", self.revenue_total),
            "metrics"
        );
    }

    /// Floor-controller view
    pub fn log_floor(&self) {
        info!(
            bus_transactions = %self.bus_transactions,
            bus_faults = %self.bus_faults,
            bus_avg_us = %self.bus_latency.avg_us,
            bus_p99_us = %self.bus_latency.p99_us,
            transport_requests = %self.transport_requests,
            transport_faults = %self.transport_faults,
            passages = %self.passages,
            lane_faults = %self.lane_faults,
            lane_resets = %self.lane_resets,
            display_updates = %self.display_updates,
            "floor_metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_report_snapshot_and_drain() {
        let metrics = Metrics::new();
        for latency in [100, 200, 300] {
            metrics.record_event_handled(latency);
        }
        metrics.record_entry_granted();
        metrics.record_exit_granted(Some(2.0));
        metrics.record_exit_granted(Some(3.15));
        metrics.record_exit_granted(None);

        let summary = metrics.report(3, 8);
        assert_eq!(summary.events_total, 3);
        assert_eq!(summary.event_latency.count, 3);
        assert_eq!(summary.event_latency.avg_us, 200);
        assert_eq!(summary.event_latency.max_us, 300);
        assert_eq!((summary.entries_granted, summary.exits_granted), (1, 3));
        assert_eq!(summary.revenue_total, 5.15);
        assert_eq!((summary.occupied, summary.total_spaces), (3, 8));

        // Totals survive a report, histograms do not
        let again = metrics.report(3, 8);
        assert_eq!(again.events_total, 3);
        assert_eq!(again.event_latency.count, 0);
        assert_eq!(again.event_latency.max_us, 0);
        assert_eq!(again.revenue_total, 5.15);
    }

    #[test]
    fn test_empty_report() {
        let summary = Metrics::new().report(0, 8);
        assert_eq!(summary.events_total, 0);
        assert_eq!(summary.event_latency.avg_us, 0);
        assert_eq!(summary.event_latency.p99_us, 0);
        assert_eq!(summary.bus_latency.max_us, 0);
    }

    #[test]
    fn test_bus_faults_and_buckets() {
        let metrics = Metrics::new();
        metrics.record_bus_transaction(20_000, true);
        metrics.record_bus_transaction(3_000_000, false);

        let summary = metrics.report(0, 8);
        assert_eq!((summary.bus_transactions, summary.bus_faults), (2, 1));
        assert_eq!(summary.bus_latency.buckets[8], 1);
        assert_eq!(summary.bus_latency.buckets[METRICS_NUM_BUCKETS - 1], 1);
        assert_eq!(summary.bus_latency.p99_us, 102_400);
    }

    #[test]
    fn test_slot_edges() {
        assert_eq!(slot_for(0), 0);
        assert_eq!(slot_for(100), 0);
        assert_eq!(slot_for(101), 1);
        assert_eq!(slot_for(51_200), 9);
        assert_eq!(slot_for(51_201), 10);
    }

    #[test]
    fn test_quantiles_use_bucket_bounds() {
        let metrics = Metrics::new();
        for _ in 0..90 {
            metrics.record_event_handled(150);
        }
        for _ in 0..10 {
            metrics.record_event_handled(5_000);
        }
        let latency = metrics.report(0, 8).event_latency;
        assert_eq!(latency.p50_us, 200);
        assert_eq!(latency.p99_us, 6_400);
    }

    #[test]
    fn test_recording_from_many_threads() {
        let metrics = Arc::new(Metrics::new());
        std::thread::scope(|scope| {
            for lane in 0..8u64 {
                let metrics = metrics.clone();
                scope.spawn(move || {
                    for i in 0..500 {
                        metrics.record_event_handled(lane * 1_000 + i);
                        metrics.record_passage();
                    }
                });
            }
        });
        assert_eq!(metrics.events_total(), 4_000);
        assert_eq!(metrics.passages(), 4_000);
    }
}
