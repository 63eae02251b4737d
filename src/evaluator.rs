//! # Evaluation Engine
//!
//! Resolves a (key, flag, attributes) tuple to a treatment. Before walking
//! conditions the engine snapshots everything the walk can touch (the flags,
//! their transitive segments, and flags referenced by dependency matchers)
//! so a single evaluation sees a consistent view even while the sync runtime
//! is swapping storage entries underneath it.
//!
//! Evaluation is pure CPU and never suspends. Failures never escape the
//! per-flag boundary: the affected flag yields CONTROL with the `exception`
//! label and the rest of the batch proceeds.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::error;
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::matchers::{combine, MAX_DEPENDENCY_DEPTH};
use crate::splitter::{self, CONTROL};
use crate::storage::{SegmentStorage, SplitStorage};
use crate::types::flag::{ConditionType, FeatureFlag};
use crate::types::segment::Segment;

/// Impression labels attached to evaluation outcomes.
pub mod labels {
    pub const DEFAULT_RULE: &str = "default rule";
    pub const KILLED: &str = "killed";
    pub const DEFINITION_NOT_FOUND: &str = "definition not found";
    pub const NOT_IN_SPLIT: &str = "not in split";
    pub const EXCEPTION: &str = "exception";
    pub const NOT_READY: &str = "not ready";
}

/// Outcome of evaluating one flag.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub treatment: String,
    pub label: String,
    pub change_number: Option<i64>,
    /// The flag's configuration entry for the chosen treatment, if any.
    pub configuration: Option<String>,
}

impl Evaluation {
    pub fn control(label: &str) -> Self {
        Evaluation {
            treatment: CONTROL.to_string(),
            label: label.to_string(),
            change_number: None,
            configuration: None,
        }
    }
}

/// Immutable snapshot of the state one evaluation (or one multi-flag batch)
/// runs against.
#[derive(Debug, Default)]
pub struct EvalSnapshot {
    pub flags: HashMap<String, Arc<FeatureFlag>>,
    pub segments: HashMap<String, Arc<Segment>>,
}

impl EvalSnapshot {
    pub fn context(&self) -> EvalContext<'_> {
        EvalContext { flags: &self.flags, segments: &self.segments, depth: 0 }
    }
}

static EMPTY_FLAGS: Lazy<HashMap<String, Arc<FeatureFlag>>> = Lazy::new(HashMap::new);
static EMPTY_SEGMENTS: Lazy<HashMap<String, Arc<Segment>>> = Lazy::new(HashMap::new);

/// Borrowed view handed to matchers. Dependency matchers re-enter evaluation
/// through it with an incremented depth.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    flags: &'a HashMap<String, Arc<FeatureFlag>>,
    segments: &'a HashMap<String, Arc<Segment>>,
    depth: u8,
}

impl EvalContext<'static> {
    pub fn empty() -> Self {
        EvalContext { flags: &*EMPTY_FLAGS, segments: &*EMPTY_SEGMENTS, depth: 0 }
    }
}

impl<'a> EvalContext<'a> {
    pub fn segment_contains(&self, segment: &str, key: &str) -> bool {
        self.segments
            .get(segment)
            .map(|s| s.contains(key))
            .unwrap_or(false)
    }

    /// Evaluate a dependency flag within the same snapshot. Past the depth
    /// limit (cycles the backend failed to reject) the result is CONTROL.
    pub fn evaluate_dependency(
        &self,
        flag_name: &str,
        matching_key: &str,
        bucketing_key: &str,
        attributes: Option<&HashMap<String, Value>>,
    ) -> String {
        if self.depth >= MAX_DEPENDENCY_DEPTH {
            error!(
                "[Evaluator] Dependency depth limit reached at `{}`; returning control",
                flag_name
            );
            return CONTROL.to_string();
        }
        let Some(flag) = self.flags.get(flag_name) else {
            return CONTROL.to_string();
        };
        let child = EvalContext { flags: self.flags, segments: self.segments, depth: self.depth + 1 };
        evaluate_flag(flag, matching_key, bucketing_key, attributes, &child).treatment
    }
}

/// Walk one flag definition. See the module docs for the snapshot contract.
pub fn evaluate_flag(
    flag: &FeatureFlag,
    matching_key: &str,
    bucketing_key: &str,
    attributes: Option<&HashMap<String, Value>>,
    ctx: &EvalContext<'_>,
) -> Evaluation {
    if flag.killed {
        return Evaluation {
            treatment: flag.default_treatment.clone(),
            label: labels::KILLED.to_string(),
            change_number: Some(flag.change_number),
            configuration: flag.configurations.get(&flag.default_treatment).cloned(),
        };
    }

    for condition in &flag.conditions {
        if !combine(
            condition.combiner,
            &condition.matchers,
            matching_key,
            bucketing_key,
            attributes,
            ctx,
        ) {
            continue;
        }

        if condition.condition_type == ConditionType::Rollout && flag.traffic_allocation < 100 {
            let bucket =
                splitter::bucket(bucketing_key, flag.traffic_allocation_seed, flag.algo);
            if bucket > flag.traffic_allocation {
                return Evaluation {
                    treatment: flag.default_treatment.clone(),
                    label: labels::NOT_IN_SPLIT.to_string(),
                    change_number: Some(flag.change_number),
                    configuration: flag.configurations.get(&flag.default_treatment).cloned(),
                };
            }
        }

        let treatment =
            splitter::treatment(bucketing_key, flag.seed, &condition.partitions, flag.algo);
        let configuration = flag.configurations.get(&treatment).cloned();
        return Evaluation {
            treatment,
            label: condition.label.clone(),
            change_number: Some(flag.change_number),
            configuration,
        };
    }

    Evaluation {
        treatment: flag.default_treatment.clone(),
        label: labels::DEFAULT_RULE.to_string(),
        change_number: Some(flag.change_number),
        configuration: flag.configurations.get(&flag.default_treatment).cloned(),
    }
}

/// Builds consistent snapshots from storage for the evaluator.
pub struct EvaluationDataFactory {
    splits: Arc<dyn SplitStorage>,
    segments: Arc<dyn SegmentStorage>,
}

impl EvaluationDataFactory {
    pub fn new(splits: Arc<dyn SplitStorage>, segments: Arc<dyn SegmentStorage>) -> Self {
        Self { splits, segments }
    }

    /// Snapshot the named flags, the flags they depend on (transitively, so
    /// re-entrant dependency evaluation stays inside the snapshot), and every
    /// segment any of them references.
    pub fn snapshot_for(&self, flag_names: &[&str]) -> EvalSnapshot {
        let mut snapshot = EvalSnapshot::default();
        let mut pending: Vec<String> = flag_names.iter().map(|n| n.to_string()).collect();
        let mut visited: HashSet<String> = HashSet::new();
        let mut segment_names: HashSet<String> = HashSet::new();

        while let Some(name) = pending.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }
            let Some(flag) = self.splits.get(&name) else {
                continue;
            };
            segment_names.extend(flag.segment_names());
            for dep in flag.dependency_names() {
                if !visited.contains(&dep) {
                    pending.push(dep);
                }
            }
            snapshot.flags.insert(name, flag);
        }

        for name in segment_names {
            if let Some(segment) = self.segments.get(&name) {
                snapshot.segments.insert(name, segment);
            }
        }

        snapshot
    }
}

/// The evaluation engine: snapshots state, walks definitions, and keeps
/// failures contained per flag.
pub struct Evaluator {
    context_factory: EvaluationDataFactory,
}

impl Evaluator {
    pub fn new(splits: Arc<dyn SplitStorage>, segments: Arc<dyn SegmentStorage>) -> Self {
        Self { context_factory: EvaluationDataFactory::new(splits, segments) }
    }

    pub fn evaluate(
        &self,
        matching_key: &str,
        bucketing_key: &str,
        flag_name: &str,
        attributes: Option<&HashMap<String, Value>>,
    ) -> Evaluation {
        self.evaluate_many(matching_key, bucketing_key, &[flag_name], attributes)
            .remove(flag_name)
            .unwrap_or_else(|| Evaluation::control(labels::EXCEPTION))
    }

    /// Resolve the union of dependencies once, then evaluate each flag
    /// against the shared snapshot.
    pub fn evaluate_many(
        &self,
        matching_key: &str,
        bucketing_key: &str,
        flag_names: &[&str],
        attributes: Option<&HashMap<String, Value>>,
    ) -> HashMap<String, Evaluation> {
        let snapshot = self.context_factory.snapshot_for(flag_names);
        let ctx = snapshot.context();

        let mut results = HashMap::with_capacity(flag_names.len());
        for name in flag_names {
            let evaluation = match snapshot.flags.get(*name) {
                None => Evaluation::control(labels::DEFINITION_NOT_FOUND),
                Some(flag) => {
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        evaluate_flag(flag, matching_key, bucketing_key, attributes, &ctx)
                    }));
                    match outcome {
                        Ok(evaluation) => evaluation,
                        Err(_) => {
                            error!(
                                "[Evaluator] Evaluation of `{}` panicked; returning control",
                                name
                            );
                            Evaluation::control(labels::EXCEPTION)
                        }
                    }
                }
            };
            results.insert(name.to_string(), evaluation);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemorySegmentStorage, InMemorySplitStorage};
    use serde_json::json;

    fn flag_from_json(raw: serde_json::Value) -> FeatureFlag {
        FeatureFlag::from_dto(serde_json::from_value(raw).unwrap()).unwrap()
    }

    fn rollout_flag(name: &str, allocation: u8) -> FeatureFlag {
        flag_from_json(json!({
            "name": name,
            "trafficTypeName": "user",
            "seed": 123,
            "trafficAllocation": allocation,
            "trafficAllocationSeed": 4567,
            "status": "ACTIVE",
            "killed": false,
            "defaultTreatment": "off",
            "changeNumber": 1001,
            "algo": 2,
            "conditions": [{
                "conditionType": "ROLLOUT",
                "matcherGroup": {
                    "combiner": "AND",
                    "matchers": [{"matcherType": "ALL_KEYS", "negate": false}]
                },
                "partitions": [
                    {"treatment": "on", "size": 60},
                    {"treatment": "off", "size": 40}
                ],
                "label": "default rule"
            }]
        }))
    }

    fn engine(flags: Vec<FeatureFlag>) -> (Evaluator, Arc<InMemorySplitStorage>) {
        let splits = Arc::new(InMemorySplitStorage::new());
        for flag in flags {
            splits.put(flag);
        }
        let segments = Arc::new(InMemorySegmentStorage::new());
        (Evaluator::new(splits.clone(), segments), splits)
    }

    #[test]
    fn test_missing_flag_yields_control() {
        let (evaluator, _) = engine(vec![]);
        let result = evaluator.evaluate("k", "k", "missing", None);
        assert_eq!(result.treatment, CONTROL);
        assert_eq!(result.label, labels::DEFINITION_NOT_FOUND);
        assert_eq!(result.change_number, None);
    }

    #[test]
    fn test_killed_flag_short_circuits() {
        let mut flag = rollout_flag("demo", 100);
        flag.killed = true;
        let (evaluator, _) = engine(vec![flag]);
        let result = evaluator.evaluate("any", "any", "demo", None);
        assert_eq!(result.treatment, "off");
        assert_eq!(result.label, labels::KILLED);
        assert_eq!(result.change_number, Some(1001));
    }

    #[test]
    fn test_rollout_matches_bucket_walk() {
        let (evaluator, _) = engine(vec![rollout_flag("demo", 100)]);
        let bucket = splitter::bucket("user-42", 123, crate::hashing::HashAlgorithm::Murmur);
        let expected = if bucket <= 60 { "on" } else { "off" };
        let result = evaluator.evaluate("user-42", "user-42", "demo", None);
        assert_eq!(result.treatment, expected);
        assert_eq!(result.label, "default rule");
    }

    #[test]
    fn test_traffic_allocation_gate() {
        // Allocation 0 excludes every key whose allocation bucket is > 0,
        // which is every key.
        let (evaluator, _) = engine(vec![rollout_flag("demo", 0)]);
        let result = evaluator.evaluate("user-42", "user-42", "demo", None);
        assert_eq!(result.treatment, "off");
        assert_eq!(result.label, labels::NOT_IN_SPLIT);
    }

    #[test]
    fn test_no_condition_matches_default_rule() {
        let flag = flag_from_json(json!({
            "name": "gated",
            "trafficTypeName": "user",
            "seed": 9,
            "status": "ACTIVE",
            "defaultTreatment": "off",
            "changeNumber": 7,
            "conditions": [{
                "conditionType": "WHITELIST",
                "matcherGroup": {
                    "combiner": "AND",
                    "matchers": [{
                        "matcherType": "WHITELIST",
                        "negate": false,
                        "whitelistMatcherData": {"whitelist": ["vip"]}
                    }]
                },
                "partitions": [{"treatment": "on", "size": 100}],
                "label": "whitelisted"
            }]
        }));
        let (evaluator, _) = engine(vec![flag]);
        let vip = evaluator.evaluate("vip", "vip", "gated", None);
        assert_eq!(vip.treatment, "on");
        assert_eq!(vip.label, "whitelisted");
        let other = evaluator.evaluate("nobody", "nobody", "gated", None);
        assert_eq!(other.treatment, "off");
        assert_eq!(other.label, labels::DEFAULT_RULE);
    }

    #[test]
    fn test_dependency_evaluates_within_snapshot() {
        let parent = flag_from_json(json!({
            "name": "A",
            "trafficTypeName": "user",
            "seed": 1,
            "status": "ACTIVE",
            "defaultTreatment": "off",
            "changeNumber": 5,
            "conditions": [{
                "conditionType": "ROLLOUT",
                "matcherGroup": {
                    "combiner": "AND",
                    "matchers": [{
                        "matcherType": "IN_SPLIT_TREATMENT",
                        "negate": false,
                        "dependencyMatcherData": {"split": "B", "treatments": ["on"]}
                    }]
                },
                "partitions": [{"treatment": "on", "size": 100}],
                "label": "dependent"
            }]
        }));
        let child_on = flag_from_json(json!({
            "name": "B",
            "trafficTypeName": "user",
            "seed": 2,
            "status": "ACTIVE",
            "defaultTreatment": "off",
            "changeNumber": 6,
            "conditions": [{
                "conditionType": "WHITELIST",
                "matcherGroup": {
                    "combiner": "AND",
                    "matchers": [{
                        "matcherType": "WHITELIST",
                        "negate": false,
                        "whitelistMatcherData": {"whitelist": ["k1"]}
                    }]
                },
                "partitions": [{"treatment": "on", "size": 100}],
                "label": "whitelisted"
            }]
        }));
        let (evaluator, _) = engine(vec![parent, child_on]);

        let hit = evaluator.evaluate("k1", "k1", "A", None);
        assert_eq!(hit.treatment, "on");
        let miss = evaluator.evaluate("k2", "k2", "A", None);
        assert_eq!(miss.treatment, "off");
        assert_eq!(miss.label, labels::DEFAULT_RULE);
    }

    #[test]
    fn test_self_dependency_cycle_is_broken() {
        let cyclic = flag_from_json(json!({
            "name": "loop",
            "trafficTypeName": "user",
            "seed": 1,
            "status": "ACTIVE",
            "defaultTreatment": "off",
            "changeNumber": 5,
            "conditions": [{
                "conditionType": "ROLLOUT",
                "matcherGroup": {
                    "combiner": "AND",
                    "matchers": [{
                        "matcherType": "IN_SPLIT_TREATMENT",
                        "negate": false,
                        "dependencyMatcherData": {"split": "loop", "treatments": ["on"]}
                    }]
                },
                "partitions": [{"treatment": "on", "size": 100}],
                "label": "cyclic"
            }]
        }));
        let (evaluator, _) = engine(vec![cyclic]);
        // Depth limit turns the inner evaluation into control, so the
        // dependency never matches and the default rule applies.
        let result = evaluator.evaluate("k", "k", "loop", None);
        assert_eq!(result.treatment, "off");
        assert_eq!(result.label, labels::DEFAULT_RULE);
    }

    #[test]
    fn test_multi_flag_batch_shares_snapshot() {
        let (evaluator, _) = engine(vec![rollout_flag("one", 100), rollout_flag("two", 100)]);
        let results = evaluator.evaluate_many("user-42", "user-42", &["one", "two", "ghost"], None);
        assert_eq!(results.len(), 3);
        assert_eq!(results["ghost"].label, labels::DEFINITION_NOT_FOUND);
        assert_ne!(results["one"].treatment, CONTROL);
    }
}
