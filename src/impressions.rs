//! # Impression Processing
//!
//! Mode-dependent dedupe in front of the impressions queue. OPTIMIZED keeps a
//! per-(feature, key, treatment) cache of the last emitted hour: repeats
//! within the hour are suppressed but still counted into hourly buckets.
//! DEBUG ships everything raw; NONE ships only the hourly counters.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use dashmap::DashMap;
use log::debug;

use crate::api::recording::ImpressionCount;
use crate::settings::ImpressionsMode;
use crate::types::events::Impression;
use crate::utils::hour_floor_ms;

/// Upper bound on observer entries. Past it, a slice of entries is evicted
/// opportunistically; dedupe degrades to emitting, never to dropping.
const OBSERVER_CACHE_MAX: usize = 500_000;

/// Remembers the last hour an identical decision was emitted.
#[derive(Default)]
pub struct ImpressionObserver {
    last_seen: DashMap<u64, i64>,
}

impl ImpressionObserver {
    pub fn new() -> Self {
        Self { last_seen: DashMap::new() }
    }

    fn cache_key(impression: &Impression) -> u64 {
        let mut hasher = DefaultHasher::new();
        impression.feature_name.hash(&mut hasher);
        impression.key_name.hash(&mut hasher);
        impression.treatment.hash(&mut hasher);
        hasher.finish()
    }

    /// Record this impression's hour and return the previously cached one.
    pub fn test_and_set(&self, impression: &Impression) -> Option<i64> {
        self.maybe_evict();
        let hour = hour_floor_ms(impression.time);
        self.last_seen.insert(Self::cache_key(impression), hour)
    }

    fn maybe_evict(&self) {
        if self.last_seen.len() < OBSERVER_CACHE_MAX {
            return;
        }
        let to_remove = OBSERVER_CACHE_MAX / 10;
        let victims: Vec<u64> = self
            .last_seen
            .iter()
            .take(to_remove)
            .map(|entry| *entry.key())
            .collect();
        for key in victims {
            self.last_seen.remove(&key);
        }
        debug!("[ImpressionObserver] Evicted {} entries", to_remove);
    }
}

/// Hourly (feature, timeFrame) buckets shipped by the counts flusher.
#[derive(Default)]
pub struct ImpressionCounter {
    counts: DashMap<(String, i64), u64>,
}

impl ImpressionCounter {
    pub fn new() -> Self {
        Self { counts: DashMap::new() }
    }

    pub fn track(&self, feature: &str, time: i64) {
        let frame = hour_floor_ms(time);
        *self.counts.entry((feature.to_string(), frame)).or_insert(0) += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Drain all buckets for shipping.
    pub fn pop_all(&self) -> Vec<ImpressionCount> {
        let keys: Vec<(String, i64)> =
            self.counts.iter().map(|entry| entry.key().clone()).collect();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(((feature, time_frame), count)) = self.counts.remove(&key) {
                out.push(ImpressionCount { feature, time_frame, count });
            }
        }
        out
    }
}

/// What to do with one processed impression.
#[derive(Debug, PartialEq)]
enum Decision {
    Emit(Impression),
    Dedupe,
}

/// Mode front-end: decides, per impression, whether it goes to the queue.
pub struct ImpressionsManager {
    mode: ImpressionsMode,
    observer: ImpressionObserver,
    counter: ImpressionCounter,
}

impl ImpressionsManager {
    pub fn new(mode: ImpressionsMode) -> Self {
        Self { mode, observer: ImpressionObserver::new(), counter: ImpressionCounter::new() }
    }

    pub fn mode(&self) -> ImpressionsMode {
        self.mode
    }

    pub fn counter(&self) -> &ImpressionCounter {
        &self.counter
    }

    /// Returns the impressions to enqueue and how many were suppressed.
    pub fn process(&self, impressions: Vec<Impression>) -> (Vec<Impression>, u64) {
        let mut to_emit = Vec::with_capacity(impressions.len());
        let mut deduped: u64 = 0;
        for impression in impressions {
            match self.process_one(impression) {
                Decision::Emit(impression) => to_emit.push(impression),
                Decision::Dedupe => deduped += 1,
            }
        }
        (to_emit, deduped)
    }

    fn process_one(&self, mut impression: Impression) -> Decision {
        match self.mode {
            ImpressionsMode::Debug => Decision::Emit(impression),
            ImpressionsMode::None => {
                self.counter.track(&impression.feature_name, impression.time);
                Decision::Dedupe
            }
            ImpressionsMode::Optimized => {
                let hour = hour_floor_ms(impression.time);
                match self.observer.test_and_set(&impression) {
                    Some(previous_hour) if previous_hour == hour => {
                        self.counter.track(&impression.feature_name, impression.time);
                        Decision::Dedupe
                    }
                    previous => {
                        impression.previous_time = previous;
                        Decision::Emit(impression)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn impression(feature: &str, key: &str, treatment: &str, time: i64) -> Impression {
        Impression {
            key_name: key.to_string(),
            bucketing_key: None,
            feature_name: feature.to_string(),
            treatment: treatment.to_string(),
            label: Some("default rule".to_string()),
            change_number: Some(1),
            time,
            previous_time: None,
        }
    }

    const HOUR: i64 = 3_600_000;

    #[test]
    fn test_optimized_dedupes_within_hour() {
        let manager = ImpressionsManager::new(ImpressionsMode::Optimized);
        let t0 = 1_700_000_000_000;

        let (emitted, deduped) = manager.process(vec![
            impression("demo", "k1", "on", t0),
            impression("demo", "k1", "on", t0 + 1000),
            impression("demo", "k1", "on", t0 + 2000),
        ]);
        assert_eq!(emitted.len(), 1);
        assert_eq!(deduped, 2);
        assert_eq!(emitted[0].previous_time, None);
    }

    #[test]
    fn test_optimized_emits_across_hours_with_previous_time() {
        let manager = ImpressionsManager::new(ImpressionsMode::Optimized);
        let t0 = 1_700_000_000_000;

        let (first, _) = manager.process(vec![impression("demo", "k1", "on", t0)]);
        assert_eq!(first.len(), 1);

        let (second, deduped) = manager.process(vec![impression("demo", "k1", "on", t0 + HOUR)]);
        assert_eq!(deduped, 0);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].previous_time, Some(hour_floor_ms(t0)));
    }

    #[test]
    fn test_optimized_distinct_tuples_all_emit() {
        let manager = ImpressionsManager::new(ImpressionsMode::Optimized);
        let t0 = 1_700_000_000_000;
        let (emitted, deduped) = manager.process(vec![
            impression("demo", "k1", "on", t0),
            impression("demo", "k2", "on", t0),
            impression("demo", "k1", "off", t0),
            impression("other", "k1", "on", t0),
        ]);
        assert_eq!(emitted.len(), 4);
        assert_eq!(deduped, 0);
    }

    #[test]
    fn test_debug_mode_never_dedupes_or_counts() {
        let manager = ImpressionsManager::new(ImpressionsMode::Debug);
        let t0 = 1_700_000_000_000;
        let (emitted, deduped) = manager.process(vec![
            impression("demo", "k1", "on", t0),
            impression("demo", "k1", "on", t0),
        ]);
        assert_eq!(emitted.len(), 2);
        assert_eq!(deduped, 0);
        assert!(manager.counter().is_empty());
    }

    #[test]
    fn test_none_mode_only_counts() {
        let manager = ImpressionsManager::new(ImpressionsMode::None);
        let t0 = 1_700_000_000_000;
        let (emitted, deduped) = manager.process(vec![
            impression("demo", "k1", "on", t0),
            impression("demo", "k2", "on", t0),
        ]);
        assert!(emitted.is_empty());
        assert_eq!(deduped, 2);
        let counts = manager.counter().pop_all();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].count, 2);
        assert_eq!(counts[0].time_frame, hour_floor_ms(t0));
    }

    #[test]
    fn test_counter_buckets_by_hour() {
        use itertools::Itertools;

        let counter = ImpressionCounter::new();
        let t0 = 1_700_000_000_000;
        counter.track("demo", t0);
        counter.track("demo", t0 + 1);
        counter.track("demo", t0 + HOUR);
        let counts: Vec<_> =
            counter.pop_all().into_iter().sorted_by_key(|c| c.time_frame).collect();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].count, 2);
        assert_eq!(counts[1].count, 1);
        assert!(counter.is_empty());
    }
}
