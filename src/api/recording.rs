//! Posting pipelines' output to the backend: impressions (bulk + hourly
//! counts), events, and the two telemetry payloads.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::SdkError;
use crate::telemetry::{ConfigPayload, Endpoint, StatsPayload};
use crate::types::events::{Event, Impression};

use super::http::HttpClient;

/// Impressions grouped by feature, the shape the bulk endpoint expects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestImpressions {
    pub test_name: String,
    pub key_impressions: Vec<Impression>,
}

/// One hourly counter cell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImpressionCount {
    pub feature: String,
    /// Start of the UTC hour, epoch milliseconds.
    pub time_frame: i64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImpressionCountsPayload {
    pub per_feature: Vec<ImpressionCount>,
}

/// Group a drained batch by feature for the wire.
pub fn group_impressions(impressions: Vec<Impression>) -> Vec<TestImpressions> {
    let mut grouped: HashMap<String, Vec<Impression>> = HashMap::new();
    for impression in impressions {
        grouped.entry(impression.feature_name.clone()).or_default().push(impression);
    }
    grouped
        .into_iter()
        .map(|(test_name, key_impressions)| TestImpressions { test_name, key_impressions })
        .collect()
}

pub struct RecordingApi {
    http: Arc<HttpClient>,
    events_url: String,
    telemetry_url: String,
}

impl RecordingApi {
    pub fn new(http: Arc<HttpClient>, events_url: &str, telemetry_url: &str) -> Self {
        Self {
            http,
            events_url: events_url.trim_end_matches('/').to_string(),
            telemetry_url: telemetry_url.trim_end_matches('/').to_string(),
        }
    }

    /// `POST /testImpressions/bulk`
    pub async fn post_impressions(&self, bulk: &[TestImpressions]) -> Result<(), SdkError> {
        let url = format!("{}/testImpressions/bulk", self.events_url);
        self.http.post_json(Endpoint::Impression, &url, &bulk).await
    }

    /// `POST /testImpressions/count`
    pub async fn post_impression_counts(
        &self,
        counts: &ImpressionCountsPayload,
    ) -> Result<(), SdkError> {
        let url = format!("{}/testImpressions/count", self.events_url);
        self.http.post_json(Endpoint::ImpressionCount, &url, counts).await
    }

    /// `POST /events/bulk`
    pub async fn post_events(&self, events: &[Event]) -> Result<(), SdkError> {
        let url = format!("{}/events/bulk", self.events_url);
        self.http.post_json(Endpoint::Event, &url, &events).await
    }

    /// `POST /metrics/usage`
    pub async fn post_stats(&self, stats: &StatsPayload) -> Result<(), SdkError> {
        let url = format!("{}/metrics/usage", self.telemetry_url);
        self.http.post_json(Endpoint::Telemetry, &url, stats).await
    }

    /// `POST /metrics/config`
    pub async fn post_config(&self, config: &ConfigPayload) -> Result<(), SdkError> {
        let url = format!("{}/metrics/config", self.telemetry_url);
        self.http.post_json(Endpoint::Telemetry, &url, config).await
    }
}
