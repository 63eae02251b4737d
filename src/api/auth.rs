//! Streaming auth: exchanges the SDK key for a channel-scoped JWT.

use std::sync::Arc;

use log::error;

use crate::error::SdkError;
use crate::telemetry::{Endpoint, TelemetryStorage};
use crate::types::token::{AuthResponse, Token};

use super::http::HttpClient;

pub struct AuthApi {
    http: Arc<HttpClient>,
    auth_url: String,
    telemetry: Arc<TelemetryStorage>,
}

impl AuthApi {
    pub fn new(http: Arc<HttpClient>, auth_url: &str, telemetry: Arc<TelemetryStorage>) -> Self {
        Self { http, auth_url: auth_url.to_string(), telemetry }
    }

    /// `GET /v2/auth`. A 4xx means the key is not entitled to streaming and
    /// is recorded as an auth rejection.
    pub async fn authenticate(&self) -> Result<Token, SdkError> {
        let response: AuthResponse = match self.http.get_json(Endpoint::Token, &self.auth_url).await
        {
            Ok(response) => response,
            Err(e) => {
                if matches!(e.status(), Some(status) if (400..500).contains(&status)) {
                    self.telemetry.record_auth_rejection();
                }
                return Err(e);
            }
        };

        Token::from_auth_response(response).map_err(|e| {
            error!("[Auth] Received an unusable streaming token: {:#}", e);
            SdkError::AuthRejected(e.to_string())
        })
    }
}
