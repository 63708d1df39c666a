use std::sync::atomic::{AtomicU64, Ordering};

/// Metric names exported through [`PipelineTelemetry::render_metrics`].
pub const DELIVERED_TOTAL: &str = "sequentra_delivered_total";
pub const REPLAYED_TOTAL: &str = "sequentra_replayed_total";
pub const DUPLICATES_TOTAL: &str = "sequentra_duplicates_total";
pub const GAPS_OPENED_TOTAL: &str = "sequentra_gaps_opened_total";
pub const GAPS_CLOSED_TOTAL: &str = "sequentra_gaps_closed_total";
pub const RANGE_REPLAYS_TOTAL: &str = "sequentra_range_replays_total";
pub const FAILED_STREAMS_TOTAL: &str = "sequentra_failed_streams_total";

/// Counters accumulated across the delivery pipeline.
#[derive(Debug, Default)]
pub struct PipelineTelemetry {
    delivered: AtomicU64,
    replayed: AtomicU64,
    duplicates: AtomicU64,
    gaps_opened: AtomicU64,
    gaps_closed: AtomicU64,
    range_replays: AtomicU64,
    failed_streams: AtomicU64,
}

impl PipelineTelemetry {
    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replayed(&self) {
        self.replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gap_opened(&self) {
        self.gaps_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gap_closed(&self) {
        self.gaps_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_range_replay(&self) {
        self.range_replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_stream(&self) {
        self.failed_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn replayed(&self) -> u64 {
        self.replayed.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn gaps_opened(&self) -> u64 {
        self.gaps_opened.load(Ordering::Relaxed)
    }

    pub fn gaps_closed(&self) -> u64 {
        self.gaps_closed.load(Ordering::Relaxed)
    }

    pub fn range_replays(&self) -> u64 {
        self.range_replays.load(Ordering::Relaxed)
    }

    pub fn failed_streams(&self) -> u64 {
        self.failed_streams.load(Ordering::Relaxed)
    }

    /// Renders the counters in Prometheus text exposition format.
    pub fn render_metrics(&self) -> String {
        format!(
            "{DELIVERED_TOTAL} {}\n{REPLAYED_TOTAL} {}\n{DUPLICATES_TOTAL} {}\n\
             {GAPS_OPENED_TOTAL} {}\n{GAPS_CLOSED_TOTAL} {}\n{RANGE_REPLAYS_TOTAL} {}\n\
             {FAILED_STREAMS_TOTAL} {}\n",
            self.delivered(),
            self.replayed(),
            self.duplicates(),
            self.gaps_opened(),
            self.gaps_closed(),
            self.range_replays(),
            self.failed_streams(),
        )
    }
}
