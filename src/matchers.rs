//! # Condition Matchers
//!
//! Tagged variants for every targeting rule the backend can ship. Each
//! matcher resolves its operand (the matching key, or a named attribute) and
//! answers `matches(..) -> bool`; a `negate` flag inverts the answer. Matcher
//! types this SDK does not understand deserialize to an unsupported variant
//! that never matches and is tagged for telemetry.

use std::collections::{HashMap, HashSet};

use log::{debug, warn};
use regex::Regex;
use serde_json::Value;

use crate::evaluator::EvalContext;
use crate::types::flag::MatcherDto;

const DAY_MS: i64 = 86_400_000;
const MINUTE_MS: i64 = 60_000;

/// How the matchers of a condition are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combiner {
    And,
    Or,
}

impl Combiner {
    pub fn from_wire(raw: Option<&str>) -> Self {
        match raw {
            Some("OR") => Combiner::Or,
            _ => Combiner::And,
        }
    }
}

/// Unit for numeric comparisons. DATETIME operands are epoch milliseconds and
/// are truncated before comparison (to the day for equality, to the minute
/// otherwise), matching the backend's authoring granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataUnit {
    Number,
    Datetime,
}

impl DataUnit {
    fn from_wire(raw: Option<&str>) -> Self {
        match raw {
            Some("DATETIME") => DataUnit::Datetime,
            _ => DataUnit::Number,
        }
    }
}

#[derive(Debug, Clone)]
pub enum MatcherKind {
    AllKeys,
    InSegment { segment: String },
    Whitelist { keys: HashSet<String> },
    EqualTo { value: i64, unit: DataUnit },
    GreaterThanOrEqual { value: i64, unit: DataUnit },
    LessThanOrEqual { value: i64, unit: DataUnit },
    Between { start: i64, end: i64, unit: DataUnit },
    StartsWith { prefixes: Vec<String> },
    EndsWith { suffixes: Vec<String> },
    ContainsString { substrings: Vec<String> },
    MatchesRegex { regex: Option<Regex> },
    /// Attribute value is one of the listed strings.
    InSet { set: HashSet<String> },
    ContainsAnyOf { set: HashSet<String> },
    ContainsAllOf { set: HashSet<String> },
    PartOf { set: HashSet<String> },
    EqualToSet { set: HashSet<String> },
    EqualToBoolean { value: bool },
    /// Evaluate another flag for the same key and check its treatment.
    Dependency { flag: String, treatments: Vec<String> },
    /// Recognized but outside this SDK's data model; never matches.
    InRuleBasedSegment { segment: String },
    Unsupported { matcher_type: String },
}

#[derive(Debug, Clone)]
pub struct Matcher {
    pub attribute: Option<String>,
    pub negate: bool,
    pub kind: MatcherKind,
}

impl Matcher {
    pub fn from_dto(dto: MatcherDto) -> Self {
        let attribute = dto.key_selector.as_ref().and_then(|k| k.attribute.clone());
        let negate = dto.negate;

        let whitelist_set = |dto: &MatcherDto| -> HashSet<String> {
            dto.whitelist_matcher_data
                .as_ref()
                .map(|w| w.whitelist.iter().cloned().collect())
                .unwrap_or_default()
        };
        let whitelist_vec = |dto: &MatcherDto| -> Vec<String> {
            dto.whitelist_matcher_data
                .as_ref()
                .map(|w| w.whitelist.clone())
                .unwrap_or_default()
        };
        let unary = |dto: &MatcherDto| {
            dto.unary_numeric_matcher_data
                .as_ref()
                .map(|u| (u.value, DataUnit::from_wire(u.data_type.as_deref())))
        };

        let kind = match dto.matcher_type.as_str() {
            "ALL_KEYS" => MatcherKind::AllKeys,
            "IN_SEGMENT" => match dto.user_defined_segment_matcher_data.as_ref() {
                Some(data) => MatcherKind::InSegment { segment: data.segment_name.clone() },
                None => MatcherKind::Unsupported { matcher_type: dto.matcher_type.clone() },
            },
            "WHITELIST" if attribute.is_none() => {
                MatcherKind::Whitelist { keys: whitelist_set(&dto) }
            }
            // A whitelist with an attribute selector is a set-membership
            // check on the attribute value.
            "WHITELIST" | "IN_SET" => MatcherKind::InSet { set: whitelist_set(&dto) },
            "EQUAL_TO" => match unary(&dto) {
                Some((value, unit)) => MatcherKind::EqualTo { value, unit },
                None => MatcherKind::Unsupported { matcher_type: dto.matcher_type.clone() },
            },
            "GREATER_THAN_OR_EQUAL_TO" => match unary(&dto) {
                Some((value, unit)) => MatcherKind::GreaterThanOrEqual { value, unit },
                None => MatcherKind::Unsupported { matcher_type: dto.matcher_type.clone() },
            },
            "LESS_THAN_OR_EQUAL_TO" => match unary(&dto) {
                Some((value, unit)) => MatcherKind::LessThanOrEqual { value, unit },
                None => MatcherKind::Unsupported { matcher_type: dto.matcher_type.clone() },
            },
            "BETWEEN" => match dto.between_matcher_data.as_ref() {
                Some(data) => MatcherKind::Between {
                    start: data.start,
                    end: data.end,
                    unit: DataUnit::from_wire(data.data_type.as_deref()),
                },
                None => MatcherKind::Unsupported { matcher_type: dto.matcher_type.clone() },
            },
            "STARTS_WITH" => MatcherKind::StartsWith { prefixes: whitelist_vec(&dto) },
            "ENDS_WITH" => MatcherKind::EndsWith { suffixes: whitelist_vec(&dto) },
            "CONTAINS_STRING" => MatcherKind::ContainsString { substrings: whitelist_vec(&dto) },
            "MATCHES_STRING" | "MATCHES_REGEX" => {
                let regex = dto.string_matcher_data.as_deref().and_then(|p| {
                    Regex::new(p)
                        .map_err(|e| warn!("[Matchers] Invalid regex `{}`: {}", p, e))
                        .ok()
                });
                MatcherKind::MatchesRegex { regex }
            }
            "CONTAINS_ANY_OF_SET" => MatcherKind::ContainsAnyOf { set: whitelist_set(&dto) },
            "CONTAINS_ALL_OF_SET" => MatcherKind::ContainsAllOf { set: whitelist_set(&dto) },
            "PART_OF_SET" => MatcherKind::PartOf { set: whitelist_set(&dto) },
            "EQUAL_TO_SET" => MatcherKind::EqualToSet { set: whitelist_set(&dto) },
            "EQUAL_TO_BOOLEAN" => match dto.boolean_matcher_data {
                Some(value) => MatcherKind::EqualToBoolean { value },
                None => MatcherKind::Unsupported { matcher_type: dto.matcher_type.clone() },
            },
            "IN_SPLIT_TREATMENT" | "DEPENDENCY" => match dto.dependency_matcher_data.as_ref() {
                Some(data) => MatcherKind::Dependency {
                    flag: data.split.clone(),
                    treatments: data.treatments.clone(),
                },
                None => MatcherKind::Unsupported { matcher_type: dto.matcher_type.clone() },
            },
            "IN_RULE_BASED_SEGMENT" => match dto.user_defined_segment_matcher_data.as_ref() {
                Some(data) => {
                    MatcherKind::InRuleBasedSegment { segment: data.segment_name.clone() }
                }
                None => MatcherKind::Unsupported { matcher_type: dto.matcher_type.clone() },
            },
            other => {
                debug!("[Matchers] Unsupported matcher type `{}`", other);
                MatcherKind::Unsupported { matcher_type: other.to_string() }
            }
        };

        Matcher { attribute, negate, kind }
    }

    pub fn segment_name(&self) -> Option<&str> {
        match &self.kind {
            MatcherKind::InSegment { segment } => Some(segment),
            _ => None,
        }
    }

    pub fn dependency_name(&self) -> Option<&str> {
        match &self.kind {
            MatcherKind::Dependency { flag, .. } => Some(flag),
            _ => None,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(
            self.kind,
            MatcherKind::Unsupported { .. } | MatcherKind::InRuleBasedSegment { .. }
        )
    }

    /// Evaluate against a key and attributes in a consistent snapshot.
    pub fn matches(
        &self,
        matching_key: &str,
        bucketing_key: &str,
        attributes: Option<&HashMap<String, Value>>,
        ctx: &EvalContext<'_>,
    ) -> bool {
        let raw = self.matches_inner(matching_key, bucketing_key, attributes, ctx);
        raw != self.negate
    }

    fn operand<'v>(
        &self,
        matching_key: &'v str,
        attributes: Option<&'v HashMap<String, Value>>,
    ) -> Option<Operand<'v>> {
        match &self.attribute {
            None => Some(Operand::Key(matching_key)),
            Some(attr) => attributes
                .and_then(|attrs| attrs.get(attr))
                .map(Operand::Attribute),
        }
    }

    fn matches_inner(
        &self,
        matching_key: &str,
        bucketing_key: &str,
        attributes: Option<&HashMap<String, Value>>,
        ctx: &EvalContext<'_>,
    ) -> bool {
        match &self.kind {
            MatcherKind::AllKeys => true,
            MatcherKind::InSegment { segment } => ctx.segment_contains(segment, matching_key),
            MatcherKind::Whitelist { keys } => keys.contains(matching_key),
            MatcherKind::EqualTo { value, unit } => {
                match self.operand(matching_key, attributes).and_then(|o| o.as_i64()) {
                    Some(actual) => truncate(actual, *unit, true) == truncate(*value, *unit, true),
                    None => false,
                }
            }
            MatcherKind::GreaterThanOrEqual { value, unit } => {
                match self.operand(matching_key, attributes).and_then(|o| o.as_i64()) {
                    Some(actual) => {
                        truncate(actual, *unit, false) >= truncate(*value, *unit, false)
                    }
                    None => false,
                }
            }
            MatcherKind::LessThanOrEqual { value, unit } => {
                match self.operand(matching_key, attributes).and_then(|o| o.as_i64()) {
                    Some(actual) => {
                        truncate(actual, *unit, false) <= truncate(*value, *unit, false)
                    }
                    None => false,
                }
            }
            MatcherKind::Between { start, end, unit } => {
                match self.operand(matching_key, attributes).and_then(|o| o.as_i64()) {
                    Some(actual) => {
                        let actual = truncate(actual, *unit, false);
                        truncate(*start, *unit, false) <= actual
                            && actual <= truncate(*end, *unit, false)
                    }
                    None => false,
                }
            }
            MatcherKind::StartsWith { prefixes } => {
                match self.operand(matching_key, attributes).and_then(|o| o.into_string()) {
                    Some(s) => prefixes.iter().any(|p| !p.is_empty() && s.starts_with(p)),
                    None => false,
                }
            }
            MatcherKind::EndsWith { suffixes } => {
                match self.operand(matching_key, attributes).and_then(|o| o.into_string()) {
                    Some(s) => suffixes.iter().any(|p| !p.is_empty() && s.ends_with(p)),
                    None => false,
                }
            }
            MatcherKind::ContainsString { substrings } => {
                match self.operand(matching_key, attributes).and_then(|o| o.into_string()) {
                    Some(s) => substrings.iter().any(|p| !p.is_empty() && s.contains(p)),
                    None => false,
                }
            }
            MatcherKind::MatchesRegex { regex } => {
                match (regex, self.operand(matching_key, attributes).and_then(|o| o.into_string()))
                {
                    (Some(re), Some(s)) => re.is_match(&s),
                    _ => false,
                }
            }
            MatcherKind::InSet { set } => {
                match self.operand(matching_key, attributes).and_then(|o| o.into_string()) {
                    Some(s) => set.contains(s.as_str()),
                    None => false,
                }
            }
            MatcherKind::ContainsAnyOf { set } => {
                match self.operand(matching_key, attributes).and_then(Operand::into_string_set) {
                    Some(actual) => !actual.is_disjoint(set),
                    None => false,
                }
            }
            MatcherKind::ContainsAllOf { set } => {
                match self.operand(matching_key, attributes).and_then(Operand::into_string_set) {
                    Some(actual) => set.is_subset(&actual),
                    None => false,
                }
            }
            MatcherKind::PartOf { set } => {
                match self.operand(matching_key, attributes).and_then(Operand::into_string_set) {
                    Some(actual) => !actual.is_empty() && actual.is_subset(set),
                    None => false,
                }
            }
            MatcherKind::EqualToSet { set } => {
                match self.operand(matching_key, attributes).and_then(Operand::into_string_set) {
                    Some(actual) => &actual == set,
                    None => false,
                }
            }
            MatcherKind::EqualToBoolean { value } => {
                match self.operand(matching_key, attributes).and_then(|o| o.as_bool()) {
                    Some(actual) => actual == *value,
                    None => false,
                }
            }
            MatcherKind::Dependency { flag, treatments } => {
                let treatment = ctx.evaluate_dependency(flag, matching_key, bucketing_key, attributes);
                treatments.contains(&treatment)
            }
            MatcherKind::InRuleBasedSegment { segment } => {
                debug!(
                    "[Matchers] IN_RULE_BASED_SEGMENT `{}` is outside this SDK's data model",
                    segment
                );
                false
            }
            MatcherKind::Unsupported { .. } => false,
        }
    }
}

/// The resolved operand of a matcher: the matching key itself, or an
/// attribute value from the caller-supplied map.
enum Operand<'v> {
    Key(&'v str),
    Attribute(&'v Value),
}

impl<'v> Operand<'v> {
    fn as_i64(&self) -> Option<i64> {
        match self {
            Operand::Key(s) => s.parse().ok(),
            Operand::Attribute(Value::Number(n)) => n.as_i64(),
            Operand::Attribute(_) => None,
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            Operand::Key(s) => parse_bool(s),
            Operand::Attribute(Value::Bool(b)) => Some(*b),
            Operand::Attribute(Value::String(s)) => parse_bool(s),
            Operand::Attribute(_) => None,
        }
    }

    fn into_string(self) -> Option<String> {
        match self {
            Operand::Key(s) => Some(s.to_string()),
            Operand::Attribute(Value::String(s)) => Some(s.clone()),
            Operand::Attribute(_) => None,
        }
    }

    fn into_string_set(self) -> Option<HashSet<String>> {
        match self {
            Operand::Attribute(Value::Array(items)) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
            Operand::Attribute(Value::String(s)) => {
                Some(std::iter::once(s.clone()).collect())
            }
            _ => None,
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// DATETIME operands are authored at day granularity for equality and minute
/// granularity for range comparisons.
fn truncate(value: i64, unit: DataUnit, equality: bool) -> i64 {
    match unit {
        DataUnit::Number => value,
        DataUnit::Datetime => {
            let granularity = if equality { DAY_MS } else { MINUTE_MS };
            value - value.rem_euclid(granularity)
        }
    }
}

/// Evaluate a condition's matcher group under its combiner.
pub fn combine(
    combiner: Combiner,
    matchers: &[Matcher],
    matching_key: &str,
    bucketing_key: &str,
    attributes: Option<&HashMap<String, Value>>,
    ctx: &EvalContext<'_>,
) -> bool {
    if matchers.is_empty() {
        return false;
    }
    match combiner {
        Combiner::And => matchers
            .iter()
            .all(|m| m.matches(matching_key, bucketing_key, attributes, ctx)),
        Combiner::Or => matchers
            .iter()
            .any(|m| m.matches(matching_key, bucketing_key, attributes, ctx)),
    }
}

/// Dependency evaluations at this depth or beyond yield CONTROL, which breaks
/// any cycle the backend failed to reject.
pub const MAX_DEPENDENCY_DEPTH: u8 = 5;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::EvalContext;
    use serde_json::json;

    fn empty_ctx() -> EvalContext<'static> {
        EvalContext::empty()
    }

    fn attrs(value: Value) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("attr".to_string(), value);
        map
    }

    fn matcher(kind: MatcherKind) -> Matcher {
        Matcher { attribute: Some("attr".to_string()), negate: false, kind }
    }

    #[test]
    fn test_all_keys_and_negate() {
        let ctx = empty_ctx();
        let mut m = Matcher { attribute: None, negate: false, kind: MatcherKind::AllKeys };
        assert!(m.matches("k", "k", None, &ctx));
        m.negate = true;
        assert!(!m.matches("k", "k", None, &ctx));
    }

    #[test]
    fn test_whitelist_on_key() {
        let ctx = empty_ctx();
        let m = Matcher {
            attribute: None,
            negate: false,
            kind: MatcherKind::Whitelist { keys: ["vip"].iter().map(|s| s.to_string()).collect() },
        };
        assert!(m.matches("vip", "vip", None, &ctx));
        assert!(!m.matches("other", "other", None, &ctx));
    }

    #[test]
    fn test_numeric_comparisons() {
        let ctx = empty_ctx();
        let ge = matcher(MatcherKind::GreaterThanOrEqual { value: 10, unit: DataUnit::Number });
        let a = attrs(json!(10));
        assert!(ge.matches("k", "k", Some(&a), &ctx));
        let a = attrs(json!(9));
        assert!(!ge.matches("k", "k", Some(&a), &ctx));
        // Missing attribute never matches.
        assert!(!ge.matches("k", "k", None, &ctx));

        let between = matcher(MatcherKind::Between { start: 5, end: 10, unit: DataUnit::Number });
        let a = attrs(json!(7));
        assert!(between.matches("k", "k", Some(&a), &ctx));
        let a = attrs(json!(11));
        assert!(!between.matches("k", "k", Some(&a), &ctx));
    }

    #[test]
    fn test_datetime_truncation() {
        let ctx = empty_ctx();
        // Same UTC day, different hours: EQUAL_TO on DATETIME matches.
        let noon = 1_700_000_000_000_i64 - 1_700_000_000_000_i64.rem_euclid(DAY_MS) + 12 * 3_600_000;
        let morning = noon - 5 * 3_600_000;
        let eq = matcher(MatcherKind::EqualTo { value: noon, unit: DataUnit::Datetime });
        let a = attrs(json!(morning));
        assert!(eq.matches("k", "k", Some(&a), &ctx));
    }

    #[test]
    fn test_string_matchers() {
        let ctx = empty_ctx();
        let m = matcher(MatcherKind::StartsWith { prefixes: vec!["us-".to_string()] });
        let a = attrs(json!("us-east-1"));
        assert!(m.matches("k", "k", Some(&a), &ctx));

        let m = matcher(MatcherKind::MatchesRegex { regex: Regex::new(r"^v\d+$").ok() });
        let a = attrs(json!("v42"));
        assert!(m.matches("k", "k", Some(&a), &ctx));
        let a = attrs(json!("vx"));
        assert!(!m.matches("k", "k", Some(&a), &ctx));
    }

    #[test]
    fn test_set_matchers() {
        let ctx = empty_ctx();
        let set: HashSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();

        let any = matcher(MatcherKind::ContainsAnyOf { set: set.clone() });
        let a = attrs(json!(["b", "c"]));
        assert!(any.matches("k", "k", Some(&a), &ctx));

        let all = matcher(MatcherKind::ContainsAllOf { set: set.clone() });
        let a = attrs(json!(["a", "b", "c"]));
        assert!(all.matches("k", "k", Some(&a), &ctx));
        let a = attrs(json!(["a"]));
        assert!(!all.matches("k", "k", Some(&a), &ctx));

        let part = matcher(MatcherKind::PartOf { set: set.clone() });
        let a = attrs(json!(["a"]));
        assert!(part.matches("k", "k", Some(&a), &ctx));

        let eq = matcher(MatcherKind::EqualToSet { set });
        let a = attrs(json!(["b", "a"]));
        assert!(eq.matches("k", "k", Some(&a), &ctx));
    }

    #[test]
    fn test_boolean_matcher_accepts_strings() {
        let ctx = empty_ctx();
        let m = matcher(MatcherKind::EqualToBoolean { value: true });
        let a = attrs(json!(true));
        assert!(m.matches("k", "k", Some(&a), &ctx));
        let a = attrs(json!("TRUE"));
        assert!(m.matches("k", "k", Some(&a), &ctx));
        let a = attrs(json!("yes"));
        assert!(!m.matches("k", "k", Some(&a), &ctx));
    }

    #[test]
    fn test_unsupported_never_matches() {
        let ctx = empty_ctx();
        let m = Matcher {
            attribute: None,
            negate: false,
            kind: MatcherKind::Unsupported { matcher_type: "SOMETHING_NEW".into() },
        };
        assert!(!m.matches("k", "k", None, &ctx));
    }

    #[test]
    fn test_combiner_semantics() {
        let ctx = empty_ctx();
        let yes = Matcher { attribute: None, negate: false, kind: MatcherKind::AllKeys };
        let no = Matcher { attribute: None, negate: true, kind: MatcherKind::AllKeys };
        assert!(!combine(Combiner::And, &[yes.clone(), no.clone()], "k", "k", None, &ctx));
        assert!(combine(Combiner::Or, &[yes, no], "k", "k", None, &ctx));
        assert!(!combine(Combiner::And, &[], "k", "k", None, &ctx));
    }
}
