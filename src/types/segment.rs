//! Segment membership model and the `segmentChanges` diff payload.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentChanges {
    pub name: String,
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
    pub since: i64,
    pub till: i64,
}

/// A named set of member keys at a given change number. Storage publishes new
/// `Arc<Segment>` values when applying diffs (copy-on-write), so readers never
/// observe a half-applied update.
#[derive(Debug, Clone)]
pub struct Segment {
    pub name: String,
    pub keys: HashSet<String>,
    pub change_number: i64,
}

impl Segment {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), keys: HashSet::new(), change_number: -1 }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Apply a diff, producing the next immutable version.
    pub fn with_diff(&self, added: &[String], removed: &[String], till: i64) -> Self {
        let mut keys = self.keys.clone();
        for key in added {
            keys.insert(key.clone());
        }
        for key in removed {
            keys.remove(key);
        }
        Self { name: self.name.clone(), keys, change_number: till }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_apply_is_copy_on_write() {
        let v1 = Segment::new("beta-users");
        let v2 = v1.with_diff(
            &["k1".to_string(), "k2".to_string()],
            &[],
            10,
        );
        let v3 = v2.with_diff(&["k3".to_string()], &["k1".to_string()], 20);

        assert!(!v1.contains("k1"), "original version untouched");
        assert!(v2.contains("k1") && v2.contains("k2"));
        assert!(!v3.contains("k1") && v3.contains("k2") && v3.contains("k3"));
        assert_eq!(v3.change_number, 20);
    }

    #[test]
    fn test_changes_payload_roundtrip() {
        let raw = r#"{"name":"beta-users","added":["a"],"removed":[],"since":-1,"till":5}"#;
        let changes: SegmentChanges = serde_json::from_str(raw).unwrap();
        assert_eq!(changes.name, "beta-users");
        assert_eq!(changes.added, vec!["a"]);
        let encoded = serde_json::to_string(&changes).unwrap();
        let decoded: SegmentChanges = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.till, 5);
    }
}
