//! # Flag & Segment Storage
//!
//! Read-mostly stores indexed by name. Values are published as `Arc`
//! snapshots (copy-on-write per entity) so concurrent evaluations keep a
//! consistent view while the sync runtime swaps entries in. Change numbers
//! are monotonic per store; an update carrying a change number at or below
//! the stored one is a counted no-op.
//!
//! The traits are the seam the out-of-scope Redis/pluggable adapters would
//! implement; the in-memory variants below are the core.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::debug;

use crate::types::flag::{FeatureFlag, FlagStatus};
use crate::types::segment::Segment;

pub trait SplitStorage: Send + Sync {
    fn get(&self, name: &str) -> Option<Arc<FeatureFlag>>;
    fn get_all(&self) -> Vec<Arc<FeatureFlag>>;
    fn split_names(&self) -> Vec<String>;
    /// Insert or replace a definition. Returns false (and counts it) when the
    /// stored version is already at or past the incoming change number.
    fn put(&self, flag: FeatureFlag) -> bool;
    fn remove(&self, name: &str) -> bool;
    fn get_change_number(&self) -> i64;
    fn set_change_number(&self, change_number: i64);
    /// Number of active flags using a traffic type, for track-time validation.
    fn traffic_type_count(&self, traffic_type: &str) -> usize;
    /// Kill a flag in place without a fetch.
    fn kill_locally(&self, name: &str, default_treatment: &str, change_number: i64) -> bool;
    /// Distinct segments referenced by any stored flag.
    fn referenced_segment_names(&self) -> HashSet<String>;
    /// Updates ignored because they were not newer than stored state.
    fn ignored_updates(&self) -> u64;
}

pub trait SegmentStorage: Send + Sync {
    fn get(&self, name: &str) -> Option<Arc<Segment>>;
    fn segment_names(&self) -> Vec<String>;
    /// Register a segment so its change number tracking starts at -1.
    fn register(&self, name: &str);
    /// Apply a diff; returns false (counted) when `till` is not newer.
    fn update(&self, name: &str, added: &[String], removed: &[String], till: i64) -> bool;
    fn get_change_number(&self, name: &str) -> Option<i64>;
    fn segment_contains(&self, name: &str, key: &str) -> bool;
    fn ignored_updates(&self) -> u64;
}

// ============================================================================
// IN-MEMORY IMPLEMENTATIONS
// ============================================================================

#[derive(Default)]
pub struct InMemorySplitStorage {
    flags: DashMap<String, Arc<FeatureFlag>>,
    traffic_types: DashMap<String, usize>,
    change_number: AtomicI64,
    ignored_updates: AtomicU64,
}

impl InMemorySplitStorage {
    pub fn new() -> Self {
        Self {
            flags: DashMap::new(),
            traffic_types: DashMap::new(),
            change_number: AtomicI64::new(-1),
            ignored_updates: AtomicU64::new(0),
        }
    }

    fn increase_traffic_type(&self, traffic_type: &str) {
        if traffic_type.is_empty() {
            return;
        }
        *self.traffic_types.entry(traffic_type.to_string()).or_insert(0) += 1;
    }

    fn decrease_traffic_type(&self, traffic_type: &str) {
        if traffic_type.is_empty() {
            return;
        }
        if let Some(mut count) = self.traffic_types.get_mut(traffic_type) {
            *count = count.saturating_sub(1);
        }
        self.traffic_types.retain(|_, v| *v > 0);
    }
}

impl SplitStorage for InMemorySplitStorage {
    fn get(&self, name: &str) -> Option<Arc<FeatureFlag>> {
        self.flags.get(name).map(|entry| entry.value().clone())
    }

    fn get_all(&self) -> Vec<Arc<FeatureFlag>> {
        self.flags.iter().map(|entry| entry.value().clone()).collect()
    }

    fn split_names(&self) -> Vec<String> {
        self.flags.iter().map(|entry| entry.key().clone()).collect()
    }

    fn put(&self, flag: FeatureFlag) -> bool {
        let name = flag.name.clone();
        match self.flags.entry(name) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if flag.change_number <= current.change_number {
                    self.ignored_updates.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "[SplitStorage] Ignoring stale update for `{}` (cn {} <= {})",
                        flag.name, flag.change_number, current.change_number
                    );
                    return false;
                }
                if current.traffic_type_name != flag.traffic_type_name {
                    let old_traffic_type = current.traffic_type_name.clone();
                    self.decrease_traffic_type(&old_traffic_type);
                    self.increase_traffic_type(&flag.traffic_type_name);
                }
                occupied.insert(Arc::new(flag));
                true
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                self.increase_traffic_type(&flag.traffic_type_name);
                vacant.insert(Arc::new(flag));
                true
            }
        }
    }

    fn remove(&self, name: &str) -> bool {
        match self.flags.remove(name) {
            Some((_, flag)) => {
                self.decrease_traffic_type(&flag.traffic_type_name);
                true
            }
            None => false,
        }
    }

    fn get_change_number(&self) -> i64 {
        self.change_number.load(Ordering::Acquire)
    }

    fn set_change_number(&self, change_number: i64) {
        // Never move the cursor backwards.
        self.change_number.fetch_max(change_number, Ordering::AcqRel);
    }

    fn traffic_type_count(&self, traffic_type: &str) -> usize {
        self.traffic_types.get(traffic_type).map(|c| *c).unwrap_or(0)
    }

    fn kill_locally(&self, name: &str, default_treatment: &str, change_number: i64) -> bool {
        let Some(mut entry) = self.flags.get_mut(name) else {
            return false;
        };
        if change_number <= entry.change_number {
            self.ignored_updates.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let killed = entry.killed_copy(default_treatment.to_string(), change_number);
        *entry = Arc::new(killed);
        true
    }

    fn referenced_segment_names(&self) -> HashSet<String> {
        let mut names = HashSet::new();
        for entry in self.flags.iter() {
            if entry.value().status == FlagStatus::Active {
                names.extend(entry.value().segment_names());
            }
        }
        names
    }

    fn ignored_updates(&self) -> u64 {
        self.ignored_updates.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct InMemorySegmentStorage {
    segments: DashMap<String, Arc<Segment>>,
    ignored_updates: AtomicU64,
}

impl InMemorySegmentStorage {
    pub fn new() -> Self {
        Self { segments: DashMap::new(), ignored_updates: AtomicU64::new(0) }
    }
}

impl SegmentStorage for InMemorySegmentStorage {
    fn get(&self, name: &str) -> Option<Arc<Segment>> {
        self.segments.get(name).map(|entry| entry.value().clone())
    }

    fn segment_names(&self) -> Vec<String> {
        self.segments.iter().map(|entry| entry.key().clone()).collect()
    }

    fn register(&self, name: &str) {
        self.segments
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Segment::new(name)));
    }

    fn update(&self, name: &str, added: &[String], removed: &[String], till: i64) -> bool {
        let mut entry = self
            .segments
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Segment::new(name)));
        if till <= entry.change_number {
            self.ignored_updates.fetch_add(1, Ordering::Relaxed);
            debug!(
                "[SegmentStorage] Ignoring stale update for `{}` (till {} <= {})",
                name, till, entry.change_number
            );
            return false;
        }
        let next = entry.with_diff(added, removed, till);
        *entry = Arc::new(next);
        true
    }

    fn get_change_number(&self, name: &str) -> Option<i64> {
        self.segments.get(name).map(|entry| entry.change_number)
    }

    fn segment_contains(&self, name: &str, key: &str) -> bool {
        self.segments
            .get(name)
            .map(|entry| entry.contains(key))
            .unwrap_or(false)
    }

    fn ignored_updates(&self) -> u64 {
        self.ignored_updates.load(Ordering::Relaxed)
    }
}
