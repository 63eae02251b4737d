//! Impression and tracked-event records produced by the client facade and
//! consumed by the recorder pipelines.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Limits on event properties. An event starts at the base size and grows by
/// the byte length of every property name and string value; past the cap the
/// event is rejected at track time.
pub const MAX_PROPERTIES_COUNT: usize = 300;
pub const MAX_PROPERTIES_SIZE_BYTES: usize = 32 * 1024;
pub const BASE_EVENT_SIZE_BYTES: usize = 1024;

/// Record of a single evaluation decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Impression {
    pub key_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucketing_key: Option<String>,
    pub feature_name: String,
    pub treatment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_number: Option<i64>,
    /// Unix epoch milliseconds of the evaluation.
    pub time: i64,
    /// Previous emission time for the same (feature, key, treatment), set by
    /// the dedupe observer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_time: Option<i64>,
}

/// A tracked event. `size_bytes` is precomputed during validation so the
/// queue can enforce its byte budget without re-walking properties.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub key: String,
    pub traffic_type_name: String,
    pub event_type_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<HashMap<String, Value>>,
    #[serde(skip)]
    pub size_bytes: usize,
}

/// Outcome of validating user-supplied properties.
pub enum PropertiesValidation {
    Valid { properties: Option<HashMap<String, Value>>, size_bytes: usize },
    TooLarge,
}

/// Sanitize event properties: non-scalar values are nulled with a warning,
/// the property count past the limit is logged, and the accumulated size is
/// checked against the byte cap.
pub fn validate_properties(properties: Option<HashMap<String, Value>>) -> PropertiesValidation {
    let Some(props) = properties else {
        return PropertiesValidation::Valid { properties: None, size_bytes: BASE_EVENT_SIZE_BYTES };
    };

    if props.len() > MAX_PROPERTIES_COUNT {
        log::warn!(
            "[Events] Event has {} properties; more than {} can impact the performance of the SDK",
            props.len(),
            MAX_PROPERTIES_COUNT
        );
    }

    let mut size = BASE_EVENT_SIZE_BYTES;
    let mut sanitized = HashMap::with_capacity(props.len());
    for (name, value) in props {
        size += name.len();
        let value = match value {
            Value::String(s) => {
                size += s.len();
                Value::String(s)
            }
            Value::Number(_) | Value::Bool(_) | Value::Null => value,
            other => {
                log::warn!(
                    "[Events] Property `{}` is of invalid type ({}), setting to null",
                    name,
                    type_name(&other)
                );
                Value::Null
            }
        };
        sanitized.insert(name, value);

        if size > MAX_PROPERTIES_SIZE_BYTES {
            return PropertiesValidation::TooLarge;
        }
    }

    PropertiesValidation::Valid { properties: Some(sanitized), size_bytes: size }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "bool",
        Value::Null => "null",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_impression_serde_roundtrip() {
        let imp = Impression {
            key_name: "user-42".into(),
            bucketing_key: None,
            feature_name: "demo".into(),
            treatment: "on".into(),
            label: Some("default rule".into()),
            change_number: Some(1001),
            time: 1_700_000_000_000,
            previous_time: None,
        };
        let encoded = serde_json::to_string(&imp).unwrap();
        assert!(!encoded.contains("bucketingKey"), "None fields omitted");
        let decoded: Impression = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, imp);
    }

    #[test]
    fn test_properties_size_accounting() {
        let mut props = HashMap::new();
        props.insert("plan".to_string(), json!("premium"));
        props.insert("visits".to_string(), json!(7));
        match validate_properties(Some(props)) {
            PropertiesValidation::Valid { size_bytes, .. } => {
                // base + "plan" + "premium" + "visits"
                assert_eq!(size_bytes, BASE_EVENT_SIZE_BYTES + 4 + 7 + 6);
            }
            PropertiesValidation::TooLarge => panic!("should fit"),
        }
    }

    #[test]
    fn test_oversize_properties_rejected() {
        let mut props = HashMap::new();
        for i in 0..40 {
            props.insert(format!("p{}", i), json!("x".repeat(1024)));
        }
        assert!(matches!(validate_properties(Some(props)), PropertiesValidation::TooLarge));
    }

    #[test]
    fn test_non_scalar_properties_nulled() {
        let mut props = HashMap::new();
        props.insert("nested".to_string(), json!({"a": 1}));
        match validate_properties(Some(props)) {
            PropertiesValidation::Valid { properties, .. } => {
                assert_eq!(properties.unwrap().get("nested"), Some(&Value::Null));
            }
            PropertiesValidation::TooLarge => panic!(),
        }
    }
}
