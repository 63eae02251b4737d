//! Segment diff fetches by `since` cursor.

use std::sync::Arc;

use crate::error::SdkError;
use crate::telemetry::Endpoint;
use crate::types::segment::SegmentChanges;

use super::http::HttpClient;

pub struct SegmentsApi {
    http: Arc<HttpClient>,
    base_url: String,
}

impl SegmentsApi {
    pub fn new(http: Arc<HttpClient>, sdk_url: &str) -> Self {
        Self { http, base_url: sdk_url.trim_end_matches('/').to_string() }
    }

    /// `GET /segmentChanges/<name>?since=<n>`
    pub async fn fetch_segment(
        &self,
        name: &str,
        since: i64,
    ) -> Result<SegmentChanges, SdkError> {
        let url = format!("{}/segmentChanges/{}?since={}", self.base_url, name, since);
        self.http.get_json(Endpoint::Segment, &url).await
    }
}
