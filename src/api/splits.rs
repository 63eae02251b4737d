//! Flag diff fetches by `since` cursor.

use std::sync::Arc;

use crate::error::SdkError;
use crate::telemetry::Endpoint;
use crate::types::flag::SplitChanges;

use super::http::HttpClient;

pub struct SplitsApi {
    http: Arc<HttpClient>,
    base_url: String,
}

impl SplitsApi {
    pub fn new(http: Arc<HttpClient>, sdk_url: &str) -> Self {
        Self { http, base_url: sdk_url.trim_end_matches('/').to_string() }
    }

    /// `GET /splitChanges?since=<n>[&till=<n>]`
    pub async fn fetch_splits(
        &self,
        since: i64,
        till: Option<i64>,
    ) -> Result<SplitChanges, SdkError> {
        let mut url = format!("{}/splitChanges?since={}", self.base_url, since);
        if let Some(till) = till {
            url.push_str(&format!("&till={}", till));
        }
        self.http.get_json(Endpoint::Split, &url).await
    }
}
