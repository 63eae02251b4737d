//! # Synchronizer
//!
//! Keeps flag and segment storage current. `sync_all` performs the blocking
//! initial fetch that gates readiness; afterwards the same loops serve both
//! periodic polling (when streaming is down) and targeted catch-up fetches
//! requested by push notifications. Updates are totally ordered per entity by
//! change number; anything stale is a counted no-op at the storage layer.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::api::{SegmentsApi, SplitsApi};
use crate::error::SdkError;
use crate::settings::Settings;
use crate::storage::{SegmentStorage, SplitStorage};
use crate::telemetry::TelemetryStorage;
use crate::types::flag::{FeatureFlag, SplitDto};

/// Attempts against a backend that keeps answering with an older `till` than
/// the one a push notification promised (stale CDN edge). After these, accept
/// the stale view; polling or the next notification will close the gap.
const CDN_BYPASS_MAX_ATTEMPTS: u8 = 3;
const CDN_BYPASS_BACKOFF_BASE_MS: u64 = 500;

pub struct SplitSynchronizer {
    api: Arc<SplitsApi>,
    storage: Arc<dyn SplitStorage>,
    telemetry: Arc<TelemetryStorage>,
}

impl SplitSynchronizer {
    pub fn new(
        api: Arc<SplitsApi>,
        storage: Arc<dyn SplitStorage>,
        telemetry: Arc<TelemetryStorage>,
    ) -> Self {
        Self { api, storage, telemetry }
    }

    /// Fetch diffs until storage is current. With a `till` target (from a
    /// push notification) the loop keeps fetching until the cursor reaches
    /// it, retrying past a stale CDN at most a few times.
    pub async fn synchronize(&self, till: Option<i64>) -> Result<(), SdkError> {
        let mut bypass_attempts: u8 = 0;
        loop {
            let since = self.storage.get_change_number();
            if matches!(till, Some(t) if t < since) {
                return Ok(());
            }

            let bypass = if bypass_attempts > 0 { till } else { None };
            let changes = self.api.fetch_splits(since, bypass).await?;
            self.apply(changes.splits);
            self.storage.set_change_number(changes.till);

            let reached_target = till.map_or(true, |t| changes.till >= t);
            if changes.till == changes.since {
                if reached_target {
                    return Ok(());
                }
                bypass_attempts += 1;
                if bypass_attempts >= CDN_BYPASS_MAX_ATTEMPTS {
                    warn!(
                        "[SplitSync] Backend still behind requested till {:?} after {} attempts; accepting cn {}",
                        till, bypass_attempts, changes.till
                    );
                    return Ok(());
                }
                let backoff = Duration::from_millis(
                    CDN_BYPASS_BACKOFF_BASE_MS * u64::from(bypass_attempts),
                );
                debug!("[SplitSync] CDN bypass attempt {} in {:?}", bypass_attempts, backoff);
                tokio::time::sleep(backoff).await;
            }
        }
    }

    /// Apply an embedded definition from a push notification without a
    /// fetch, iff the notification's previous change number matches storage.
    pub fn apply_instant_update(&self, flag: FeatureFlag, previous_change_number: i64) -> bool {
        if previous_change_number != self.storage.get_change_number() {
            return false;
        }
        let change_number = flag.change_number;
        self.count_unsupported(&flag);
        self.storage.put(flag);
        self.storage.set_change_number(change_number);
        self.telemetry.record_update_from_sse();
        true
    }

    pub fn kill_locally(&self, name: &str, default_treatment: &str, change_number: i64) {
        if self.storage.kill_locally(name, default_treatment, change_number) {
            info!("[SplitSync] Killed `{}` locally at cn {}", name, change_number);
        }
    }

    fn apply(&self, splits: Vec<SplitDto>) {
        for dto in splits {
            if dto.status != "ACTIVE" {
                self.storage.remove(&dto.name);
                continue;
            }
            match FeatureFlag::from_dto(dto) {
                Ok(flag) => {
                    self.count_unsupported(&flag);
                    self.storage.put(flag);
                }
                Err(e) => warn!("[SplitSync] Dropping invalid definition: {}", e),
            }
        }
    }

    fn count_unsupported(&self, flag: &FeatureFlag) {
        let unsupported = flag
            .conditions
            .iter()
            .flat_map(|c| c.matchers.iter())
            .filter(|m| m.is_unsupported())
            .count();
        if unsupported > 0 {
            self.telemetry.record_unsupported_matchers(unsupported as u64);
        }
    }
}

pub struct SegmentSynchronizer {
    api: Arc<SegmentsApi>,
    splits: Arc<dyn SplitStorage>,
    storage: Arc<dyn SegmentStorage>,
}

impl SegmentSynchronizer {
    pub fn new(
        api: Arc<SegmentsApi>,
        splits: Arc<dyn SplitStorage>,
        storage: Arc<dyn SegmentStorage>,
    ) -> Self {
        Self { api, splits, storage }
    }

    /// Fetch one segment until current, with the same bounded stale-CDN retry
    /// as the flag loop.
    pub async fn synchronize_segment(
        &self,
        name: &str,
        till: Option<i64>,
    ) -> Result<(), SdkError> {
        self.storage.register(name);
        let mut bypass_attempts: u8 = 0;
        loop {
            let since = self.storage.get_change_number(name).unwrap_or(-1);
            if matches!(till, Some(t) if t < since) {
                return Ok(());
            }

            let changes = self.api.fetch_segment(name, since).await?;
            self.storage.update(name, &changes.added, &changes.removed, changes.till);

            let reached_target = till.map_or(true, |t| changes.till >= t);
            if changes.till == changes.since {
                if reached_target {
                    return Ok(());
                }
                bypass_attempts += 1;
                if bypass_attempts >= CDN_BYPASS_MAX_ATTEMPTS {
                    warn!(
                        "[SegmentSync] `{}` still behind requested till {:?} after {} attempts",
                        name, till, bypass_attempts
                    );
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(
                    CDN_BYPASS_BACKOFF_BASE_MS * u64::from(bypass_attempts),
                ))
                .await;
            }
        }
    }

    /// Bring every segment referenced by stored flags up to date.
    pub async fn synchronize_all(&self) -> Result<(), SdkError> {
        for name in self.splits.referenced_segment_names() {
            self.synchronize_segment(&name, None).await?;
        }
        Ok(())
    }
}

/// Orchestrates initial sync, polling tasks, and the update hooks push uses.
pub struct Synchronizer {
    splits: SplitSynchronizer,
    segments: SegmentSynchronizer,
    features_refresh: Duration,
    segments_refresh: Duration,
    fetching: Mutex<Option<watch::Sender<bool>>>,
}

impl Synchronizer {
    pub fn new(
        splits: SplitSynchronizer,
        segments: SegmentSynchronizer,
        settings: &Settings,
    ) -> Self {
        Self {
            splits,
            segments,
            features_refresh: Duration::from_secs(settings.features_refresh_rate),
            segments_refresh: Duration::from_secs(settings.segments_refresh_rate),
            fetching: Mutex::new(None),
        }
    }

    /// Blocking initial sync: flags until current, then every referenced
    /// segment. Gates the ready signal.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn sync_all(&self) -> Result<(), SdkError> {
        self.splits.synchronize(None).await?;
        self.segments.synchronize_all().await
    }

    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn synchronize_splits(&self, till: Option<i64>) -> Result<(), SdkError> {
        self.splits.synchronize(till).await?;
        // New flags may reference segments we have never seen.
        self.segments.synchronize_all().await
    }

    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn synchronize_segment(&self, name: &str, till: Option<i64>) -> Result<(), SdkError> {
        self.segments.synchronize_segment(name, till).await
    }

    pub fn apply_instant_update(&self, flag: FeatureFlag, previous_change_number: i64) -> bool {
        self.splits.apply_instant_update(flag, previous_change_number)
    }

    pub fn kill_split_locally(&self, name: &str, default_treatment: &str, change_number: i64) {
        self.splits.kill_locally(name, default_treatment, change_number);
    }

    /// Start the polling tasks. Idempotent: a second start while running is a
    /// no-op.
    pub fn start_periodic_fetching(self: &Arc<Self>) {
        let mut guard = self.fetching.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return;
        }
        info!("[Synchronizer] Starting periodic fetching");
        let (stop_tx, stop_rx) = watch::channel(false);

        let this = self.clone();
        let mut stop = stop_rx.clone();
        tokio::spawn(async move {
            let mut ticker = interval(this.features_refresh);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tokio::select! {
                            result = this.splits.synchronize(None) => {
                                if let Err(e) = result {
                                    error!("[Synchronizer] Split fetch failed: {}", e);
                                }
                            }
                            _ = stop.changed() => break,
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
            debug!("[Synchronizer] Split fetcher exited");
        });

        let this = self.clone();
        let mut stop = stop_rx;
        tokio::spawn(async move {
            let mut ticker = interval(this.segments_refresh);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tokio::select! {
                            result = this.segments.synchronize_all() => {
                                if let Err(e) = result {
                                    error!("[Synchronizer] Segment fetch failed: {}", e);
                                }
                            }
                            _ = stop.changed() => break,
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
            debug!("[Synchronizer] Segment fetcher exited");
        });

        *guard = Some(stop_tx);
    }

    /// Stop the polling tasks. Idempotent.
    pub fn stop_periodic_fetching(&self) {
        let mut guard = self.fetching.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stop) = guard.take() {
            info!("[Synchronizer] Stopping periodic fetching");
            let _ = stop.send(true);
        }
    }
}
