//! # Feature Flag Model
//!
//! Raw serde DTOs for the `splitChanges` payload plus the validated in-memory
//! representation the evaluator walks. Parsing is lenient about unknown
//! matcher types (they become an unsupported variant that never matches) but
//! strict about structural invariants: a flag whose condition partitions do
//! not sum to 100, or whose default treatment is empty, is rejected.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hashing::HashAlgorithm;
use crate::matchers::{Combiner, Matcher};

// ============================================================================
// WIRE DTOs (splitChanges)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitChanges {
    #[serde(default)]
    pub splits: Vec<SplitDto>,
    pub since: i64,
    pub till: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitDto {
    pub name: String,
    #[serde(default)]
    pub traffic_type_name: Option<String>,
    #[serde(default)]
    pub seed: i64,
    pub status: String,
    #[serde(default)]
    pub killed: bool,
    #[serde(default)]
    pub default_treatment: String,
    pub change_number: i64,
    #[serde(default)]
    pub algo: Option<u8>,
    #[serde(default)]
    pub traffic_allocation: Option<u8>,
    #[serde(default)]
    pub traffic_allocation_seed: Option<i64>,
    #[serde(default)]
    pub configurations: Option<HashMap<String, String>>,
    #[serde(default)]
    pub conditions: Vec<ConditionDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionDto {
    #[serde(default)]
    pub condition_type: Option<String>,
    pub matcher_group: MatcherGroupDto,
    #[serde(default)]
    pub partitions: Vec<Partition>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatcherGroupDto {
    #[serde(default)]
    pub combiner: Option<String>,
    pub matchers: Vec<MatcherDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatcherDto {
    pub matcher_type: String,
    #[serde(default)]
    pub negate: bool,
    #[serde(default)]
    pub key_selector: Option<KeySelectorDto>,
    #[serde(default)]
    pub user_defined_segment_matcher_data: Option<SegmentMatcherData>,
    #[serde(default)]
    pub whitelist_matcher_data: Option<WhitelistMatcherData>,
    #[serde(default)]
    pub unary_numeric_matcher_data: Option<UnaryNumericMatcherData>,
    #[serde(default)]
    pub between_matcher_data: Option<BetweenMatcherData>,
    #[serde(default)]
    pub dependency_matcher_data: Option<DependencyMatcherData>,
    #[serde(default)]
    pub boolean_matcher_data: Option<bool>,
    #[serde(default)]
    pub string_matcher_data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySelectorDto {
    #[serde(default)]
    pub traffic_type: Option<String>,
    #[serde(default)]
    pub attribute: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMatcherData {
    pub segment_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhitelistMatcherData {
    #[serde(default)]
    pub whitelist: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnaryNumericMatcherData {
    #[serde(default)]
    pub data_type: Option<String>,
    pub value: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetweenMatcherData {
    #[serde(default)]
    pub data_type: Option<String>,
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyMatcherData {
    pub split: String,
    #[serde(default)]
    pub treatments: Vec<String>,
}

// ============================================================================
// IN-MEMORY MODEL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlagStatus {
    Active,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionType {
    Whitelist,
    Rollout,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    pub treatment: String,
    pub size: u8,
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub condition_type: ConditionType,
    pub combiner: Combiner,
    pub matchers: Vec<Matcher>,
    pub partitions: Vec<Partition>,
    pub label: String,
}

/// A validated flag definition. Immutable once built; storage publishes new
/// `Arc<FeatureFlag>` values on update so in-flight evaluations keep a
/// consistent view.
#[derive(Debug, Clone)]
pub struct FeatureFlag {
    pub name: String,
    pub traffic_type_name: String,
    pub seed: i64,
    pub status: FlagStatus,
    pub killed: bool,
    pub default_treatment: String,
    pub change_number: i64,
    pub algo: HashAlgorithm,
    pub traffic_allocation: u8,
    pub traffic_allocation_seed: i64,
    pub configurations: HashMap<String, String>,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlagParseError {
    #[error("flag `{0}` has unknown status `{1}`")]
    UnknownStatus(String, String),
    #[error("flag `{0}` has an empty default treatment")]
    EmptyDefaultTreatment(String),
    #[error("flag `{0}` condition {1} partitions sum to {2}, expected 100")]
    PartitionSum(String, usize, u32),
}

impl FeatureFlag {
    /// Validate and convert a wire DTO. Returns an error for definitions the
    /// evaluator must never see; callers drop those with a warning and keep
    /// the previous version.
    pub fn from_dto(dto: SplitDto) -> Result<Self, FlagParseError> {
        let status = match dto.status.as_str() {
            "ACTIVE" => FlagStatus::Active,
            "ARCHIVED" => FlagStatus::Archived,
            other => {
                return Err(FlagParseError::UnknownStatus(dto.name, other.to_string()))
            }
        };

        if dto.default_treatment.is_empty() {
            return Err(FlagParseError::EmptyDefaultTreatment(dto.name));
        }

        let mut conditions = Vec::with_capacity(dto.conditions.len());
        for (idx, cond) in dto.conditions.into_iter().enumerate() {
            let sum: u32 = cond.partitions.iter().map(|p| u32::from(p.size)).sum();
            if sum != 100 {
                return Err(FlagParseError::PartitionSum(dto.name, idx, sum));
            }

            let condition_type = match cond.condition_type.as_deref() {
                Some("WHITELIST") => ConditionType::Whitelist,
                // Historic payloads omit the type; they behave as rollout.
                _ => ConditionType::Rollout,
            };

            let matchers: Vec<Matcher> = cond
                .matcher_group
                .matchers
                .into_iter()
                .map(Matcher::from_dto)
                .collect();

            conditions.push(Condition {
                condition_type,
                combiner: Combiner::from_wire(cond.matcher_group.combiner.as_deref()),
                matchers,
                partitions: cond.partitions,
                label: cond.label.unwrap_or_default(),
            });
        }

        Ok(FeatureFlag {
            name: dto.name,
            traffic_type_name: dto.traffic_type_name.unwrap_or_default(),
            seed: dto.seed,
            status,
            killed: dto.killed,
            default_treatment: dto.default_treatment,
            change_number: dto.change_number,
            algo: HashAlgorithm::from_code(dto.algo),
            traffic_allocation: dto.traffic_allocation.unwrap_or(100).min(100),
            traffic_allocation_seed: dto.traffic_allocation_seed.unwrap_or(dto.seed),
            configurations: dto.configurations.unwrap_or_default(),
            conditions,
        })
    }

    /// Parse a standalone definition (as embedded in streaming updates).
    pub fn from_json(raw: &[u8]) -> anyhow::Result<Self> {
        let dto: SplitDto = serde_json::from_slice(raw)?;
        Ok(Self::from_dto(dto)?)
    }

    /// Segments referenced by IN_SEGMENT matchers in any condition.
    pub fn segment_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for cond in &self.conditions {
            for matcher in &cond.matchers {
                if let Some(segment) = matcher.segment_name() {
                    names.push(segment.to_string());
                }
            }
        }
        names
    }

    /// Flags referenced by DEPENDENCY matchers in any condition.
    pub fn dependency_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for cond in &self.conditions {
            for matcher in &cond.matchers {
                if let Some(flag) = matcher.dependency_name() {
                    names.push(flag.to_string());
                }
            }
        }
        names
    }

    /// Local kill: returns an updated copy with the flag killed and the
    /// default treatment/change number replaced.
    pub fn killed_copy(&self, default_treatment: String, change_number: i64) -> Self {
        let mut copy = self.clone();
        copy.killed = true;
        copy.default_treatment = default_treatment;
        copy.change_number = change_number;
        copy
    }
}
