//! Shared HTTP plumbing: one reqwest client with the SDK's identity headers
//! and timeouts, plus latency/error/last-sync telemetry around every call.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SdkError;
use crate::settings::Settings;
use crate::telemetry::{Endpoint, TelemetryStorage};
use crate::utils::{elapsed_micros, epoch_ms};

pub const SDK_VERSION: &str = concat!("rust-", env!("CARGO_PKG_VERSION"));

pub struct HttpClient {
    client: reqwest::Client,
    headers: HeaderMap,
    telemetry: Arc<TelemetryStorage>,
}

impl HttpClient {
    pub fn new(
        settings: &Settings,
        sdk_key: &str,
        telemetry: Arc<TelemetryStorage>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout())
            .timeout(settings.read_timeout())
            .build()
            .context("failed to build HTTP client")?;

        let mut headers = HeaderMap::new();
        let bearer = format!("Bearer {}", sdk_key);
        let mut auth_value =
            HeaderValue::from_str(&bearer).context("sdk key is not a valid header value")?;
        auth_value.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("FlagstreamSDKVersion", HeaderValue::from_static(SDK_VERSION));

        let (machine_name, machine_ip) = settings.machine_identity();
        if let Some(name) = machine_name {
            if let Ok(value) = HeaderValue::from_str(&name) {
                headers.insert("FlagstreamSDKMachineName", value);
            }
        }
        if let Some(ip) = machine_ip {
            if let Ok(value) = HeaderValue::from_str(&ip) {
                headers.insert("FlagstreamSDKMachineIP", value);
            }
        }

        Ok(Self { client, headers, telemetry })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: Endpoint,
        url: &str,
    ) -> Result<T, SdkError> {
        let start = Instant::now();
        let response = self
            .client
            .get(url)
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|source| SdkError::Transport { endpoint: endpoint.as_str(), source })?;
        self.finish(endpoint, start, response).await
    }

    pub async fn post_json<B: Serialize>(
        &self,
        endpoint: Endpoint,
        url: &str,
        body: &B,
    ) -> Result<(), SdkError> {
        let start = Instant::now();
        let response = self
            .client
            .post(url)
            .headers(self.headers.clone())
            .json(body)
            .send()
            .await
            .map_err(|source| SdkError::Transport { endpoint: endpoint.as_str(), source })?;

        self.telemetry.record_http_latency(endpoint, elapsed_micros(start));
        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            self.telemetry.record_successful_sync(endpoint, epoch_ms());
            Ok(())
        } else {
            self.telemetry.record_http_error(endpoint, status);
            Err(SdkError::Http { endpoint: endpoint.as_str(), status })
        }
    }

    async fn finish<T: DeserializeOwned>(
        &self,
        endpoint: Endpoint,
        start: Instant,
        response: reqwest::Response,
    ) -> Result<T, SdkError> {
        self.telemetry.record_http_latency(endpoint, elapsed_micros(start));
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            self.telemetry.record_http_error(endpoint, status);
            return Err(SdkError::Http { endpoint: endpoint.as_str(), status });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|source| SdkError::Transport { endpoint: endpoint.as_str(), source })?;
        let parsed = serde_json::from_slice(&bytes)
            .map_err(|source| SdkError::Malformed { endpoint: endpoint.as_str(), source })?;
        self.telemetry.record_successful_sync(endpoint, epoch_ms());
        Ok(parsed)
    }
}
