//! # Recorder Pipelines
//!
//! Bounded in-memory queues between the evaluation hot path and the backend,
//! drained by periodic flusher tasks. Overflow drops the newest record with a
//! counter increment; a failed ship requeues the batch at the head when
//! capacity allows. Events additionally track accumulated property bytes and
//! trigger an early flush past a byte budget.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::api::recording::{group_impressions, ImpressionCountsPayload, RecordingApi};
use crate::impressions::ImpressionsManager;
use crate::settings::Settings;
use crate::telemetry::TelemetryStorage;
use crate::types::events::{Event, Impression};

/// Accumulated event bytes that trigger an immediate flush.
const EVENTS_FLUSH_BYTES: usize = 5 * 1024 * 1024;

/// FIFO with a hard capacity. `push` drops the incoming record when full;
/// `requeue_front` restores a failed batch only while there is room.
struct BoundedBuffer<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> BoundedBuffer<T> {
    fn new(capacity: usize) -> Self {
        Self { items: Mutex::new(VecDeque::new()), capacity }
    }

    fn push(&self, item: T) -> bool {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        if items.len() >= self.capacity {
            return false;
        }
        items.push_back(item);
        true
    }

    fn drain(&self, max: usize) -> Vec<T> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let take = max.min(items.len());
        items.drain(..take).collect()
    }

    fn requeue_front(&self, batch: Vec<T>) -> bool {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        if items.len() + batch.len() > self.capacity {
            return false;
        }
        for item in batch.into_iter().rev() {
            items.push_front(item);
        }
        true
    }

    fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Impressions: mode processing, bounded ring, bulk shipping.
pub struct ImpressionsRecorder {
    manager: ImpressionsManager,
    buffer: BoundedBuffer<Impression>,
    api: Arc<RecordingApi>,
    telemetry: Arc<TelemetryStorage>,
    bulk_size: usize,
}

impl ImpressionsRecorder {
    pub fn new(
        manager: ImpressionsManager,
        api: Arc<RecordingApi>,
        telemetry: Arc<TelemetryStorage>,
        settings: &Settings,
    ) -> Self {
        Self {
            manager,
            buffer: BoundedBuffer::new(settings.impressions_queue_size),
            api,
            telemetry,
            bulk_size: settings.impressions_bulk_size,
        }
    }

    /// Hot-path entry: dedupe per mode, then enqueue. Never blocks.
    pub fn record(&self, impressions: Vec<Impression>) {
        let (to_emit, deduped) = self.manager.process(impressions);
        if deduped > 0 {
            self.telemetry.record_impressions_deduped(deduped);
        }
        let mut queued: u64 = 0;
        let mut dropped: u64 = 0;
        for impression in to_emit {
            if self.buffer.push(impression) {
                queued += 1;
            } else {
                dropped += 1;
            }
        }
        if queued > 0 {
            self.telemetry.record_impressions_queued(queued);
        }
        if dropped > 0 {
            self.telemetry.record_impressions_dropped(dropped);
        }
    }

    pub fn queue_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drain up to one bulk and ship it. Transient failures requeue at the
    /// head if there is room; permanent ones drop the batch.
    pub async fn flush(&self) {
        let batch = self.buffer.drain(self.bulk_size);
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        let grouped = group_impressions(batch.clone());
        match self.api.post_impressions(&grouped).await {
            Ok(()) => debug!("[ImpressionsRecorder] Shipped {} impressions", count),
            Err(e) if e.is_retryable() => {
                warn!("[ImpressionsRecorder] Ship failed ({}), requeueing {}", e, count);
                if !self.buffer.requeue_front(batch) {
                    self.telemetry.record_impressions_dropped(count as u64);
                }
            }
            Err(e) => {
                error!("[ImpressionsRecorder] Ship rejected ({}), dropping {}", e, count);
                self.telemetry.record_impressions_dropped(count as u64);
            }
        }
    }

    /// Ship the hourly counter buckets.
    pub async fn flush_counts(&self) {
        if self.manager.counter().is_empty() {
            return;
        }
        let payload = ImpressionCountsPayload { per_feature: self.manager.counter().pop_all() };
        if let Err(e) = self.api.post_impression_counts(&payload).await {
            warn!("[ImpressionsRecorder] Count ship failed: {}", e);
        }
    }
}

/// Events: validated upstream, queued here under a count and byte budget.
pub struct EventsRecorder {
    buffer: BoundedBuffer<Event>,
    pending_bytes: AtomicUsize,
    flush_hint: Notify,
    api: Arc<RecordingApi>,
    telemetry: Arc<TelemetryStorage>,
    bulk_size: usize,
}

impl EventsRecorder {
    pub fn new(
        api: Arc<RecordingApi>,
        telemetry: Arc<TelemetryStorage>,
        settings: &Settings,
    ) -> Self {
        Self {
            buffer: BoundedBuffer::new(settings.events_queue_size),
            pending_bytes: AtomicUsize::new(0),
            flush_hint: Notify::new(),
            api,
            telemetry,
            bulk_size: settings.events_bulk_size,
        }
    }

    /// Hot-path entry. Returns whether the event was accepted.
    pub fn track(&self, event: Event) -> bool {
        let size = event.size_bytes;
        if !self.buffer.push(event) {
            self.telemetry.record_events_dropped(1);
            return false;
        }
        self.telemetry.record_events_queued(1);
        let pending = self.pending_bytes.fetch_add(size, Ordering::Relaxed) + size;
        if pending >= EVENTS_FLUSH_BYTES {
            self.flush_hint.notify_one();
        }
        true
    }

    pub fn queue_len(&self) -> usize {
        self.buffer.len()
    }

    pub async fn flush(&self) {
        let batch = self.buffer.drain(self.bulk_size);
        if batch.is_empty() {
            return;
        }
        let bytes: usize = batch.iter().map(|e| e.size_bytes).sum();
        let _ = self
            .pending_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(bytes)));

        let count = batch.len();
        match self.api.post_events(&batch).await {
            Ok(()) => debug!("[EventsRecorder] Shipped {} events", count),
            Err(e) if e.is_retryable() => {
                warn!("[EventsRecorder] Ship failed ({}), requeueing {}", e, count);
                if !self.buffer.requeue_front(batch) {
                    self.telemetry.record_events_dropped(count as u64);
                }
            }
            Err(e) => {
                error!("[EventsRecorder] Ship rejected ({}), dropping {}", e, count);
                self.telemetry.record_events_dropped(count as u64);
            }
        }
    }
}

/// Ships the periodic stats and the one-shot init snapshot.
pub struct TelemetrySubmitter {
    api: Arc<RecordingApi>,
    telemetry: Arc<TelemetryStorage>,
}

impl TelemetrySubmitter {
    pub fn new(api: Arc<RecordingApi>, telemetry: Arc<TelemetryStorage>) -> Self {
        Self { api, telemetry }
    }

    pub async fn flush_stats(&self) {
        let stats = self.telemetry.pop_stats();
        if let Err(e) = self.api.post_stats(&stats).await {
            warn!("[Telemetry] Stats ship failed: {}", e);
        }
    }

    pub async fn flush_config(&self, settings: &Settings, active: u64, redundant: u64) {
        let config = self.telemetry.config_snapshot(settings, active, redundant);
        if let Err(e) = self.api.post_config(&config).await {
            warn!("[Telemetry] Config ship failed: {}", e);
        }
    }
}

/// Spawn every periodic flusher. All of them share one stop signal and exit
/// promptly when it flips.
pub fn start_flushers(
    impressions: Arc<ImpressionsRecorder>,
    events: Arc<EventsRecorder>,
    telemetry: Arc<TelemetrySubmitter>,
    settings: &Settings,
    stop: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    info!("[Recorders] Starting periodic flushers");
    let mut handles = Vec::with_capacity(4);

    handles.push(spawn_flusher(
        "impressions",
        Duration::from_secs(settings.impressions_refresh_rate),
        stop.clone(),
        {
            let impressions = impressions.clone();
            move || {
                let impressions = impressions.clone();
                async move { impressions.flush().await }
            }
        },
    ));

    handles.push(spawn_flusher(
        "impression-counts",
        Duration::from_secs(settings.impressions_refresh_rate),
        stop.clone(),
        {
            let impressions = impressions.clone();
            move || {
                let impressions = impressions.clone();
                async move { impressions.flush_counts().await }
            }
        },
    ));

    // Events flusher also reacts to the byte-budget hint.
    handles.push({
        let events = events.clone();
        let mut stop = stop.clone();
        let period = Duration::from_secs(settings.events_push_rate);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => events.flush().await,
                    _ = events.flush_hint.notified() => {
                        debug!("[Recorders] Early event flush (byte budget)");
                        events.flush().await;
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("[Recorders] events flusher exited");
        })
    });

    handles.push(spawn_flusher(
        "telemetry-stats",
        Duration::from_secs(settings.telemetry_refresh_rate),
        stop,
        {
            let telemetry = telemetry.clone();
            move || {
                let telemetry = telemetry.clone();
                async move { telemetry.flush_stats().await }
            }
        },
    ));

    handles
}

fn spawn_flusher<F, Fut>(
    name: &'static str,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    task: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so flushers start on
        // their cadence, not at startup.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => task().await,
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("[Recorders] {} flusher exited", name);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_buffer_drops_newest_on_overflow() {
        let buffer: BoundedBuffer<i32> = BoundedBuffer::new(3);
        assert!(buffer.push(1));
        assert!(buffer.push(2));
        assert!(buffer.push(3));
        assert!(!buffer.push(4), "overflow must reject the incoming record");
        assert_eq!(buffer.drain(10), vec![1, 2, 3]);
    }

    #[test]
    fn test_bounded_buffer_drain_respects_bulk_size() {
        let buffer: BoundedBuffer<i32> = BoundedBuffer::new(10);
        for i in 0..5 {
            buffer.push(i);
        }
        assert_eq!(buffer.drain(2), vec![0, 1]);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_requeue_front_preserves_order() {
        let buffer: BoundedBuffer<i32> = BoundedBuffer::new(10);
        buffer.push(3);
        assert!(buffer.requeue_front(vec![1, 2]));
        assert_eq!(buffer.drain(10), vec![1, 2, 3]);
    }

    #[test]
    fn test_requeue_front_refuses_past_capacity() {
        let buffer: BoundedBuffer<i32> = BoundedBuffer::new(2);
        buffer.push(1);
        assert!(!buffer.requeue_front(vec![2, 3]));
        assert_eq!(buffer.len(), 1);
    }
}
