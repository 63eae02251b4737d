//! # Telemetry
//!
//! In-process counters and latency histograms, flushed periodically to the
//! telemetry endpoint. Latencies land in 23 exponential buckets; counters are
//! atomics so the evaluation hot path never takes a lock. `pop_stats` drains
//! everything atomically into a serializable payload, and the init snapshot
//! is captured once when the factory becomes ready.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::settings::{refresh_rates, Settings};
use crate::utils::epoch_ms;

/// Exponential latency bucket boundaries in microseconds (factor ~1.5).
/// Values above the cap collapse into the last bucket.
pub const BUCKETS: [u64; 23] = [
    1_000, 1_500, 2_250, 3_375, 5_063, 7_594, 11_391, 17_086, 25_629, 38_443, 57_665, 86_498,
    129_746, 194_620, 291_929, 437_894, 656_841, 985_261, 1_477_892, 2_216_838, 3_325_257,
    4_987_885, 7_481_828,
];

pub const MAX_LATENCY_MICROS: u64 = 7_481_828;
pub const LATENCY_BUCKET_COUNT: usize = 23;
pub const MAX_STREAMING_EVENTS: usize = 20;

/// Lower-bound index of the bucket a measured latency falls into.
pub fn latency_bucket_index(micros: u64) -> usize {
    if micros > MAX_LATENCY_MICROS {
        return LATENCY_BUCKET_COUNT - 1;
    }
    BUCKETS.partition_point(|b| *b < micros)
}

/// Client-facing methods tracked by the method tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Treatment,
    Treatments,
    TreatmentWithConfig,
    TreatmentsWithConfig,
    Track,
}

impl Method {
    const ALL: [Method; 5] = [
        Method::Treatment,
        Method::Treatments,
        Method::TreatmentWithConfig,
        Method::TreatmentsWithConfig,
        Method::Track,
    ];

    fn index(self) -> usize {
        match self {
            Method::Treatment => 0,
            Method::Treatments => 1,
            Method::TreatmentWithConfig => 2,
            Method::TreatmentsWithConfig => 3,
            Method::Track => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Treatment => "treatment",
            Method::Treatments => "treatments",
            Method::TreatmentWithConfig => "treatmentWithConfig",
            Method::TreatmentsWithConfig => "treatmentsWithConfig",
            Method::Track => "track",
        }
    }
}

/// Backend endpoints tracked by the HTTP tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Split,
    Segment,
    Impression,
    ImpressionCount,
    Event,
    Telemetry,
    Token,
}

impl Endpoint {
    const ALL: [Endpoint; 7] = [
        Endpoint::Split,
        Endpoint::Segment,
        Endpoint::Impression,
        Endpoint::ImpressionCount,
        Endpoint::Event,
        Endpoint::Telemetry,
        Endpoint::Token,
    ];

    fn index(self) -> usize {
        match self {
            Endpoint::Split => 0,
            Endpoint::Segment => 1,
            Endpoint::Impression => 2,
            Endpoint::ImpressionCount => 3,
            Endpoint::Event => 4,
            Endpoint::Telemetry => 5,
            Endpoint::Token => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Endpoint::Split => "split",
            Endpoint::Segment => "segment",
            Endpoint::Impression => "impression",
            Endpoint::ImpressionCount => "impressionCount",
            Endpoint::Event => "event",
            Endpoint::Telemetry => "telemetry",
            Endpoint::Token => "token",
        }
    }
}

/// Streaming-subsystem events kept in a bounded ring for diagnostics.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingEvent {
    /// Event type code (connection established, occupancy, ablen, etc.).
    pub event_type: u16,
    pub data: i64,
    pub timestamp: i64,
}

pub mod streaming_event_types {
    pub const CONNECTION_ESTABLISHED: u16 = 0;
    pub const OCCUPANCY_PRI: u16 = 10;
    pub const OCCUPANCY_SEC: u16 = 20;
    pub const STREAMING_STATUS: u16 = 30;
    pub const TOKEN_REFRESH: u16 = 40;
    pub const ABLY_ERROR: u16 = 50;
    pub const SYNC_MODE_UPDATE: u16 = 60;
}

struct LatencyTable<const N: usize> {
    rows: [[AtomicU64; LATENCY_BUCKET_COUNT]; N],
}

impl<const N: usize> LatencyTable<N> {
    fn new() -> Self {
        Self {
            rows: std::array::from_fn(|_| std::array::from_fn(|_| AtomicU64::new(0))),
        }
    }

    fn record(&self, row: usize, micros: u64) {
        self.rows[row][latency_bucket_index(micros)].fetch_add(1, Ordering::Relaxed);
    }

    fn pop_row(&self, row: usize) -> Vec<u64> {
        self.rows[row]
            .iter()
            .map(|cell| cell.swap(0, Ordering::Relaxed))
            .collect()
    }
}

/// Central telemetry store shared by every subsystem.
pub struct TelemetryStorage {
    method_latencies: LatencyTable<5>,
    method_exceptions: [AtomicU64; 5],
    http_latencies: LatencyTable<7>,
    http_errors: Mutex<HashMap<(Endpoint, u16), u64>>,
    last_synchronizations: [AtomicI64; 7],
    streaming_events: Mutex<Vec<StreamingEvent>>,

    impressions_queued: AtomicU64,
    impressions_deduped: AtomicU64,
    impressions_dropped: AtomicU64,
    events_queued: AtomicU64,
    events_dropped: AtomicU64,
    updates_from_sse: AtomicU64,
    auth_rejections: AtomicU64,
    token_refreshes: AtomicU64,
    not_ready_usages: AtomicU64,
    flags_with_unsupported_matchers: AtomicU64,
    session_start_ms: AtomicI64,
    time_until_ready_ms: AtomicI64,
}

impl Default for TelemetryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryStorage {
    pub fn new() -> Self {
        Self {
            method_latencies: LatencyTable::new(),
            method_exceptions: std::array::from_fn(|_| AtomicU64::new(0)),
            http_latencies: LatencyTable::new(),
            http_errors: Mutex::new(HashMap::new()),
            last_synchronizations: std::array::from_fn(|_| AtomicI64::new(0)),
            streaming_events: Mutex::new(Vec::new()),
            impressions_queued: AtomicU64::new(0),
            impressions_deduped: AtomicU64::new(0),
            impressions_dropped: AtomicU64::new(0),
            events_queued: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            updates_from_sse: AtomicU64::new(0),
            auth_rejections: AtomicU64::new(0),
            token_refreshes: AtomicU64::new(0),
            not_ready_usages: AtomicU64::new(0),
            flags_with_unsupported_matchers: AtomicU64::new(0),
            session_start_ms: AtomicI64::new(epoch_ms()),
            time_until_ready_ms: AtomicI64::new(0),
        }
    }

    // --- method tables ---

    pub fn record_latency(&self, method: Method, micros: u64) {
        self.method_latencies.record(method.index(), micros);
    }

    pub fn record_exception(&self, method: Method) {
        self.method_exceptions[method.index()].fetch_add(1, Ordering::Relaxed);
    }

    // --- http tables ---

    pub fn record_http_latency(&self, endpoint: Endpoint, micros: u64) {
        self.http_latencies.record(endpoint.index(), micros);
    }

    pub fn record_http_error(&self, endpoint: Endpoint, status: u16) {
        let mut errors = self.http_errors.lock().unwrap_or_else(|e| e.into_inner());
        *errors.entry((endpoint, status)).or_insert(0) += 1;
    }

    pub fn record_successful_sync(&self, endpoint: Endpoint, timestamp_ms: i64) {
        self.last_synchronizations[endpoint.index()].store(timestamp_ms, Ordering::Relaxed);
    }

    // --- streaming ---

    pub fn record_streaming_event(&self, event_type: u16, data: i64) {
        let mut ring = self.streaming_events.lock().unwrap_or_else(|e| e.into_inner());
        if ring.len() >= MAX_STREAMING_EVENTS {
            return; // ring full until next flush
        }
        ring.push(StreamingEvent { event_type, data, timestamp: epoch_ms() });
    }

    pub fn record_auth_rejection(&self) {
        self.auth_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_token_refresh(&self) {
        self.token_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_update_from_sse(&self) {
        self.updates_from_sse.fetch_add(1, Ordering::Relaxed);
    }

    // --- recorder counters ---

    pub fn record_impressions_queued(&self, count: u64) {
        self.impressions_queued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_impressions_deduped(&self, count: u64) {
        self.impressions_deduped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_impressions_dropped(&self, count: u64) {
        self.impressions_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_events_queued(&self, count: u64) {
        self.events_queued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_events_dropped(&self, count: u64) {
        self.events_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn impressions_dropped(&self) -> u64 {
        self.impressions_dropped.load(Ordering::Relaxed)
    }

    pub fn impressions_deduped(&self) -> u64 {
        self.impressions_deduped.load(Ordering::Relaxed)
    }

    // --- readiness ---

    pub fn record_not_ready_usage(&self) {
        self.not_ready_usages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ready(&self) {
        let elapsed = epoch_ms() - self.session_start_ms.load(Ordering::Relaxed);
        self.time_until_ready_ms.store(elapsed, Ordering::Relaxed);
    }

    pub fn record_unsupported_matchers(&self, count: u64) {
        self.flags_with_unsupported_matchers.fetch_add(count, Ordering::Relaxed);
    }

    /// Drain the periodic stats into a payload. Counters reset; last-sync
    /// timestamps and session length are point-in-time reads.
    pub fn pop_stats(&self) -> StatsPayload {
        let method_latencies = Method::ALL
            .iter()
            .map(|m| (m.as_str(), self.method_latencies.pop_row(m.index())))
            .collect();
        let method_exceptions = Method::ALL
            .iter()
            .map(|m| (m.as_str(), self.method_exceptions[m.index()].swap(0, Ordering::Relaxed)))
            .collect();
        let http_latencies = Endpoint::ALL
            .iter()
            .map(|e| (e.as_str(), self.http_latencies.pop_row(e.index())))
            .collect();
        let last_synchronizations = Endpoint::ALL
            .iter()
            .map(|e| (e.as_str(), self.last_synchronizations[e.index()].load(Ordering::Relaxed)))
            .collect();

        let http_errors = {
            let mut errors = self.http_errors.lock().unwrap_or_else(|e| e.into_inner());
            let mut grouped: HashMap<&'static str, HashMap<u16, u64>> = HashMap::new();
            for ((endpoint, status), count) in errors.drain() {
                *grouped.entry(endpoint.as_str()).or_default().entry(status).or_insert(0) +=
                    count;
            }
            grouped
        };

        let streaming_events = {
            let mut ring = self.streaming_events.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *ring)
        };

        StatsPayload {
            method_latencies,
            method_exceptions,
            http_latencies,
            http_errors,
            last_synchronizations,
            streaming_events,
            impressions_queued: self.impressions_queued.swap(0, Ordering::Relaxed),
            impressions_deduped: self.impressions_deduped.swap(0, Ordering::Relaxed),
            impressions_dropped: self.impressions_dropped.swap(0, Ordering::Relaxed),
            events_queued: self.events_queued.swap(0, Ordering::Relaxed),
            events_dropped: self.events_dropped.swap(0, Ordering::Relaxed),
            updates_from_sse: self.updates_from_sse.swap(0, Ordering::Relaxed),
            auth_rejections: self.auth_rejections.swap(0, Ordering::Relaxed),
            token_refreshes: self.token_refreshes.swap(0, Ordering::Relaxed),
            session_length_ms: epoch_ms() - self.session_start_ms.load(Ordering::Relaxed),
        }
    }

    /// One-shot init snapshot, shipped when the factory becomes ready.
    pub fn config_snapshot(
        &self,
        settings: &Settings,
        active_factories: u64,
        redundant_factories: u64,
    ) -> ConfigPayload {
        ConfigPayload {
            operation_mode: settings.operation_mode.as_str(),
            storage_type: settings.operation_mode.storage_type(),
            streaming_enabled: settings.streaming_enabled,
            refresh_rates: refresh_rates(settings),
            url_overrides: vec![
                ("sdk", settings.urls.sdk.is_some()),
                ("events", settings.urls.events.is_some()),
                ("auth", settings.urls.auth.is_some()),
                ("streaming", settings.urls.streaming.is_some()),
                ("telemetry", settings.urls.telemetry.is_some()),
            ]
            .into_iter()
            .collect(),
            impressions_queue_size: settings.impressions_queue_size,
            events_queue_size: settings.events_queue_size,
            impressions_mode: settings.impressions_mode.as_str(),
            impression_listener: settings.impression_listener,
            https_proxy: Settings::https_proxy_detected(),
            active_factories,
            redundant_factories,
            not_ready_usages: self.not_ready_usages.load(Ordering::Relaxed),
            time_until_ready_ms: self.time_until_ready_ms.load(Ordering::Relaxed),
            flags_with_unsupported_matchers: self
                .flags_with_unsupported_matchers
                .load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsPayload {
    pub method_latencies: HashMap<&'static str, Vec<u64>>,
    pub method_exceptions: HashMap<&'static str, u64>,
    pub http_latencies: HashMap<&'static str, Vec<u64>>,
    pub http_errors: HashMap<&'static str, HashMap<u16, u64>>,
    pub last_synchronizations: HashMap<&'static str, i64>,
    pub streaming_events: Vec<StreamingEvent>,
    pub impressions_queued: u64,
    pub impressions_deduped: u64,
    pub impressions_dropped: u64,
    pub events_queued: u64,
    pub events_dropped: u64,
    pub updates_from_sse: u64,
    pub auth_rejections: u64,
    pub token_refreshes: u64,
    pub session_length_ms: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPayload {
    pub operation_mode: &'static str,
    pub storage_type: &'static str,
    pub streaming_enabled: bool,
    pub refresh_rates: HashMap<&'static str, u64>,
    pub url_overrides: HashMap<&'static str, bool>,
    pub impressions_queue_size: usize,
    pub events_queue_size: usize,
    pub impressions_mode: &'static str,
    pub impression_listener: bool,
    pub https_proxy: bool,
    pub active_factories: u64,
    pub redundant_factories: u64,
    pub not_ready_usages: u64,
    pub time_until_ready_ms: i64,
    pub flags_with_unsupported_matchers: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_boundaries() {
        assert_eq!(latency_bucket_index(0), 0);
        assert_eq!(latency_bucket_index(1_000), 0);
        assert_eq!(latency_bucket_index(1_001), 1);
        assert_eq!(latency_bucket_index(1_500), 1);
        assert_eq!(latency_bucket_index(7_481_828), 22);
        assert_eq!(latency_bucket_index(u64::MAX), 22);
    }

    #[test]
    fn test_method_latency_pop_resets() {
        let telemetry = TelemetryStorage::new();
        telemetry.record_latency(Method::Treatment, 1_200);
        telemetry.record_latency(Method::Treatment, 1_200);
        telemetry.record_latency(Method::Track, 10);

        let stats = telemetry.pop_stats();
        assert_eq!(stats.method_latencies["treatment"][1], 2);
        assert_eq!(stats.method_latencies["track"][0], 1);

        let stats = telemetry.pop_stats();
        assert!(stats.method_latencies["treatment"].iter().all(|c| *c == 0));
    }

    #[test]
    fn test_http_errors_grouped_by_endpoint_and_status() {
        let telemetry = TelemetryStorage::new();
        telemetry.record_http_error(Endpoint::Split, 500);
        telemetry.record_http_error(Endpoint::Split, 500);
        telemetry.record_http_error(Endpoint::Event, 401);

        let stats = telemetry.pop_stats();
        assert_eq!(stats.http_errors["split"][&500], 2);
        assert_eq!(stats.http_errors["event"][&401], 1);
        let stats = telemetry.pop_stats();
        assert!(stats.http_errors.is_empty());
    }

    #[test]
    fn test_streaming_event_ring_cap() {
        let telemetry = TelemetryStorage::new();
        for i in 0..30 {
            telemetry.record_streaming_event(streaming_event_types::OCCUPANCY_PRI, i);
        }
        let stats = telemetry.pop_stats();
        assert_eq!(stats.streaming_events.len(), MAX_STREAMING_EVENTS);
    }

    #[test]
    fn test_config_snapshot_fields() {
        let telemetry = TelemetryStorage::new();
        telemetry.record_not_ready_usage();
        let settings = Settings::default();
        let config = telemetry.config_snapshot(&settings, 1, 0);
        assert_eq!(config.operation_mode, "in-memory");
        assert_eq!(config.storage_type, "memory");
        assert_eq!(config.not_ready_usages, 1);
        assert_eq!(config.refresh_rates["featuresRefreshRate"], 30);
        assert!(!config.url_overrides["sdk"]);
    }
}
