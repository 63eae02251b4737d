//! # Client Facade
//!
//! The surface the host application calls. The contract is strict: neither
//! evaluation nor track ever raises — bad input, a not-ready SDK, or an
//! internal failure all degrade to the CONTROL treatment (or a rejected
//! event) plus a log line. Every call records its latency in microseconds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{error, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::evaluator::{labels, Evaluation, Evaluator};
use crate::factory;
use crate::manager::SyncManager;
use crate::recorder::{EventsRecorder, ImpressionsRecorder};
use crate::splitter::CONTROL;
use crate::storage::SplitStorage;
use crate::telemetry::{Method, TelemetryStorage};
use crate::types::events::{validate_properties, Event, Impression, PropertiesValidation};
use crate::utils::{elapsed_micros, epoch_ms};
use tokio::sync::watch;

const MAX_KEY_LENGTH: usize = 250;

static EVENT_TYPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9][-_.:a-zA-Z0-9]{0,79}$").expect("event type pattern is valid")
});

/// Evaluation key: the matching key decides targeting, the bucketing key (if
/// different) decides rollout bucketing.
#[derive(Debug, Clone)]
pub struct SplitKey {
    pub matching_key: String,
    pub bucketing_key: Option<String>,
}

impl From<&str> for SplitKey {
    fn from(key: &str) -> Self {
        SplitKey { matching_key: key.to_string(), bucketing_key: None }
    }
}

impl From<(&str, &str)> for SplitKey {
    fn from((matching, bucketing): (&str, &str)) -> Self {
        SplitKey {
            matching_key: matching.to_string(),
            bucketing_key: Some(bucketing.to_string()),
        }
    }
}

/// Treatment plus the flag's configuration for it.
#[derive(Debug, Clone, PartialEq)]
pub struct TreatmentResult {
    pub treatment: String,
    pub config: Option<String>,
}

pub type Attributes = HashMap<String, Value>;

#[derive(Clone)]
pub struct Client {
    evaluator: Arc<Evaluator>,
    impressions: Arc<ImpressionsRecorder>,
    events: Arc<EventsRecorder>,
    telemetry: Arc<TelemetryStorage>,
    split_storage: Arc<dyn SplitStorage>,
    sync_manager: Arc<SyncManager>,
    labels_enabled: bool,
    ready: watch::Receiver<bool>,
    destroyed: Arc<AtomicBool>,
    sdk_key: Arc<str>,
}

impl Client {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        evaluator: Arc<Evaluator>,
        impressions: Arc<ImpressionsRecorder>,
        events: Arc<EventsRecorder>,
        telemetry: Arc<TelemetryStorage>,
        split_storage: Arc<dyn SplitStorage>,
        sync_manager: Arc<SyncManager>,
        labels_enabled: bool,
        ready: watch::Receiver<bool>,
        destroyed: Arc<AtomicBool>,
        sdk_key: Arc<str>,
    ) -> Self {
        Self {
            evaluator,
            impressions,
            events,
            telemetry,
            split_storage,
            sync_manager,
            labels_enabled,
            ready,
            destroyed,
            sdk_key,
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn client_is_usable(&self) -> bool {
        if self.is_destroyed() {
            error!("[Client] Client has already been destroyed - no calls possible");
            return false;
        }
        true
    }

    // ------------------------------------------------------------------
    // Treatments
    // ------------------------------------------------------------------

    pub fn get_treatment(
        &self,
        key: impl Into<SplitKey>,
        flag_name: &str,
        attributes: Option<&Attributes>,
    ) -> String {
        self.treatment_call(Method::Treatment, key.into(), flag_name, attributes)
            .treatment
    }

    pub fn get_treatment_with_config(
        &self,
        key: impl Into<SplitKey>,
        flag_name: &str,
        attributes: Option<&Attributes>,
    ) -> TreatmentResult {
        self.treatment_call(Method::TreatmentWithConfig, key.into(), flag_name, attributes)
    }

    pub fn get_treatments(
        &self,
        key: impl Into<SplitKey>,
        flag_names: &[&str],
        attributes: Option<&Attributes>,
    ) -> HashMap<String, String> {
        self.treatments_call(Method::Treatments, key.into(), flag_names, attributes)
            .into_iter()
            .map(|(name, result)| (name, result.treatment))
            .collect()
    }

    pub fn get_treatments_with_config(
        &self,
        key: impl Into<SplitKey>,
        flag_names: &[&str],
        attributes: Option<&Attributes>,
    ) -> HashMap<String, TreatmentResult> {
        self.treatments_call(Method::TreatmentsWithConfig, key.into(), flag_names, attributes)
    }

    fn treatment_call(
        &self,
        method: Method,
        key: SplitKey,
        flag_name: &str,
        attributes: Option<&Attributes>,
    ) -> TreatmentResult {
        let mut results = self.treatments_call(method, key, &[flag_name], attributes);
        results
            .remove(flag_name.trim())
            .unwrap_or(TreatmentResult { treatment: CONTROL.to_string(), config: None })
    }

    fn treatments_call(
        &self,
        method: Method,
        key: SplitKey,
        flag_names: &[&str],
        attributes: Option<&Attributes>,
    ) -> HashMap<String, TreatmentResult> {
        let start = Instant::now();
        let control_for_all = |names: &[&str]| -> HashMap<String, TreatmentResult> {
            names
                .iter()
                .map(|n| {
                    (
                        n.trim().to_string(),
                        TreatmentResult { treatment: CONTROL.to_string(), config: None },
                    )
                })
                .collect()
        };

        if !self.client_is_usable() {
            return control_for_all(flag_names);
        }

        let Some((matching_key, bucketing_key)) = validate_key(&key, method) else {
            return control_for_all(flag_names);
        };
        let flag_names = validate_flag_names(flag_names, method);
        if flag_names.is_empty() {
            return HashMap::new();
        }
        let name_refs: Vec<&str> = flag_names.iter().map(String::as_str).collect();

        if !self.is_ready() {
            self.telemetry.record_not_ready_usage();
            warn!(
                "[Client] {}: the SDK is not ready, results may be incorrect. \
                 Make sure to wait for SDK readiness before using this method",
                method.as_str()
            );
            let now = epoch_ms();
            let impressions: Vec<Impression> = name_refs
                .iter()
                .map(|name| {
                    self.build_impression(
                        &matching_key,
                        &bucketing_key,
                        name,
                        &Evaluation::control(labels::NOT_READY),
                        now,
                    )
                })
                .collect();
            self.impressions.record(impressions);
            self.telemetry.record_latency(method, elapsed_micros(start));
            return control_for_all(&name_refs);
        }

        let evaluations =
            self.evaluator
                .evaluate_many(&matching_key, &bucketing_key, &name_refs, attributes);

        let now = epoch_ms();
        let mut impressions = Vec::with_capacity(evaluations.len());
        let mut results = HashMap::with_capacity(evaluations.len());
        let mut exceptions = 0u32;
        for (name, evaluation) in evaluations {
            if evaluation.label == labels::EXCEPTION {
                exceptions += 1;
            }
            impressions.push(self.build_impression(
                &matching_key,
                &bucketing_key,
                &name,
                &evaluation,
                now,
            ));
            results.insert(
                name,
                TreatmentResult {
                    treatment: evaluation.treatment,
                    config: evaluation.configuration,
                },
            );
        }
        self.impressions.record(impressions);
        for _ in 0..exceptions {
            self.telemetry.record_exception(method);
        }
        self.telemetry.record_latency(method, elapsed_micros(start));
        results
    }

    fn build_impression(
        &self,
        matching_key: &str,
        bucketing_key: &str,
        feature: &str,
        evaluation: &Evaluation,
        time: i64,
    ) -> Impression {
        Impression {
            key_name: matching_key.to_string(),
            bucketing_key: if bucketing_key == matching_key {
                None
            } else {
                Some(bucketing_key.to_string())
            },
            feature_name: feature.to_string(),
            treatment: evaluation.treatment.clone(),
            label: self.labels_enabled.then(|| evaluation.label.clone()),
            change_number: evaluation.change_number,
            time,
            previous_time: None,
        }
    }

    // ------------------------------------------------------------------
    // Track
    // ------------------------------------------------------------------

    /// Queue an event. Returns false when validation fails or the queue is
    /// full; never raises.
    pub fn track(
        &self,
        key: &str,
        traffic_type: &str,
        event_type: &str,
        value: Option<f64>,
        properties: Option<HashMap<String, Value>>,
    ) -> bool {
        let start = Instant::now();
        if !self.client_is_usable() {
            return false;
        }

        let key = key.trim();
        if key.is_empty() || key.len() > MAX_KEY_LENGTH {
            error!("[Client] track: you passed an invalid key, key must be a non-empty string no longer than {} characters", MAX_KEY_LENGTH);
            return false;
        }
        if traffic_type.is_empty() {
            error!("[Client] track: you passed an empty traffic_type, traffic_type must be a non-empty string");
            return false;
        }
        let traffic_type = traffic_type.to_lowercase();
        if traffic_type != traffic_type.trim() {
            error!("[Client] track: traffic_type must not have leading or trailing spaces");
            return false;
        }
        if !EVENT_TYPE_RE.is_match(event_type) {
            error!(
                "[Client] track: you passed `{}`, event_type must adhere to the regular expression {}",
                event_type,
                EVENT_TYPE_RE.as_str()
            );
            return false;
        }
        if self.is_ready() && self.split_storage.traffic_type_count(&traffic_type) == 0 {
            warn!(
                "[Client] track: traffic_type `{}` does not have any corresponding feature flags in this environment",
                traffic_type
            );
        }

        let (properties, size_bytes) = match validate_properties(properties) {
            PropertiesValidation::Valid { properties, size_bytes } => (properties, size_bytes),
            PropertiesValidation::TooLarge => {
                error!("[Client] track: the maximum size allowed for the properties is 32768 bytes, event not queued");
                return false;
            }
        };

        let accepted = self.events.track(Event {
            key: key.to_string(),
            traffic_type_name: traffic_type,
            event_type_id: event_type.to_string(),
            value,
            timestamp: epoch_ms(),
            properties,
            size_bytes,
        });
        self.telemetry.record_latency(Method::Track, elapsed_micros(start));
        accepted
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Tear down the factory this client belongs to: stop background tasks,
    /// flush recorders one last time, release the registry slot. Idempotent.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        factory::unregister_factory(&self.sdk_key);
        self.sync_manager.stop().await;
    }
}

fn validate_key(key: &SplitKey, method: Method) -> Option<(String, String)> {
    let matching = key.matching_key.trim();
    if matching.is_empty() {
        error!(
            "[Client] {}: you passed an empty key, key must be a non-empty string",
            method.as_str()
        );
        return None;
    }
    if matching.len() > MAX_KEY_LENGTH {
        error!(
            "[Client] {}: key too long - must be {} characters or less",
            method.as_str(),
            MAX_KEY_LENGTH
        );
        return None;
    }
    let bucketing = match &key.bucketing_key {
        None => matching.to_string(),
        Some(bucketing) => {
            let bucketing = bucketing.trim();
            if bucketing.is_empty() || bucketing.len() > MAX_KEY_LENGTH {
                error!(
                    "[Client] {}: you passed an invalid bucketing key",
                    method.as_str()
                );
                return None;
            }
            bucketing.to_string()
        }
    };
    Some((matching.to_string(), bucketing))
}

fn validate_flag_names(flag_names: &[&str], method: Method) -> Vec<String> {
    let mut out = Vec::with_capacity(flag_names.len());
    for name in flag_names {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            error!(
                "[Client] {}: you passed an empty feature flag name, it must be a non-empty string",
                method.as_str()
            );
            continue;
        }
        if trimmed.len() != name.len() {
            warn!(
                "[Client] {}: feature flag name `{}` has extra whitespace, trimming",
                method.as_str(),
                trimmed
            );
        }
        if !out.iter().any(|existing| existing == trimmed) {
            out.push(trimmed.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert!(validate_key(&SplitKey::from(""), Method::Treatment).is_none());
        assert!(validate_key(&SplitKey::from("  "), Method::Treatment).is_none());
        let long = "x".repeat(251);
        assert!(validate_key(&SplitKey::from(long.as_str()), Method::Treatment).is_none());

        let (matching, bucketing) =
            validate_key(&SplitKey::from("user-1"), Method::Treatment).unwrap();
        assert_eq!(matching, "user-1");
        assert_eq!(bucketing, "user-1", "bucketing defaults to matching");

        let (matching, bucketing) =
            validate_key(&SplitKey::from(("m", "b")), Method::Treatment).unwrap();
        assert_eq!((matching.as_str(), bucketing.as_str()), ("m", "b"));
    }

    #[test]
    fn test_flag_name_validation_trims_and_dedupes() {
        let names = validate_flag_names(&[" demo ", "demo", "", "other"], Method::Treatments);
        assert_eq!(names, vec!["demo".to_string(), "other".to_string()]);
    }

    #[test]
    fn test_event_type_regex() {
        assert!(EVENT_TYPE_RE.is_match("page.view"));
        assert!(EVENT_TYPE_RE.is_match("checkout:completed"));
        assert!(!EVENT_TYPE_RE.is_match(""));
        assert!(!EVENT_TYPE_RE.is_match(".starts-with-dot"));
        assert!(!EVENT_TYPE_RE.is_match("has spaces"));
        assert!(!EVENT_TYPE_RE.is_match(&"x".repeat(81)));
    }
}
