//! Streaming auth token. The auth endpoint returns a JWT whose capability
//! claim lists the channels the connection may subscribe to; the token itself
//! is passed through to the streaming endpoint untouched.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;
use std::collections::HashMap;

/// Control channels carry occupancy metadata; they are subscribed with this
/// prefix so the backend reports publisher counts.
pub const OCCUPANCY_PREFIX: &str = "[?occupancy=metrics.publishers]";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    #[serde(default)]
    pub push_enabled: bool,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(rename = "x-ably-capability")]
    capability: String,
    exp: i64,
    iat: i64,
}

/// Parsed streaming token.
#[derive(Debug, Clone)]
pub struct Token {
    pub push_enabled: bool,
    pub raw: String,
    pub channels: Vec<String>,
    /// Expiration, unix epoch seconds.
    pub expiration_time: i64,
    /// Issue time, unix epoch seconds.
    pub issued_at: i64,
}

impl Token {
    /// Parse the auth envelope. `push_enabled: false` yields a token-less
    /// result the push manager treats as nonretryable.
    pub fn from_auth_response(response: AuthResponse) -> Result<Self> {
        if !response.push_enabled {
            return Ok(Token {
                push_enabled: false,
                raw: String::new(),
                channels: Vec::new(),
                expiration_time: 0,
                issued_at: 0,
            });
        }

        let raw = response
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow!("pushEnabled without a token"))?;

        let payload_segment = raw
            .split('.')
            .nth(1)
            .ok_or_else(|| anyhow!("token is not a JWT"))?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_segment)
            .context("token payload is not base64url")?;
        let claims: TokenClaims =
            serde_json::from_slice(&payload).context("token claims did not parse")?;

        // The capability claim is a JSON document embedded as a string,
        // mapping channel name to permitted operations.
        let capability: HashMap<String, Vec<String>> = serde_json::from_str(&claims.capability)
            .context("capability claim did not parse")?;
        let mut channels: Vec<String> = capability.into_keys().collect();
        channels.sort();

        Ok(Token {
            push_enabled: true,
            raw,
            channels,
            expiration_time: claims.exp,
            issued_at: claims.iat,
        })
    }

    /// Channel list for the subscribe query string, with control channels
    /// carrying the occupancy prefix.
    pub fn subscribe_channels(&self) -> Vec<String> {
        self.channels
            .iter()
            .map(|c| {
                if c.contains("control_") {
                    format!("{}{}", OCCUPANCY_PREFIX, c)
                } else {
                    c.clone()
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt_with_claims(claims: &str) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.as_bytes());
        format!("{}.{}.sig", header, payload)
    }

    fn demo_token() -> Token {
        let capability_raw = r#"{"NzM2_MTIyMzY_splits":["subscribe"],"NzM2_MTIyMzY_segments":["subscribe"],"control_pri":["subscribe"]}"#;
        let claims = serde_json::json!({
            "x-ably-capability": capability_raw,
            "exp": 1_700_003_600,
            "iat": 1_700_000_000,
        })
        .to_string();
        Token::from_auth_response(AuthResponse {
            push_enabled: true,
            token: Some(jwt_with_claims(&claims)),
        })
        .unwrap()
    }

    #[test]
    fn test_token_parse() {
        let token = demo_token();
        assert!(token.push_enabled);
        assert_eq!(token.channels.len(), 3);
        assert!(token.channels.contains(&"control_pri".to_string()));
        assert_eq!(token.expiration_time, 1_700_003_600);
        assert_eq!(token.issued_at, 1_700_000_000);
    }

    #[test]
    fn test_control_channel_gets_occupancy_prefix() {
        let token = demo_token();
        let channels = token.subscribe_channels();
        assert!(channels
            .iter()
            .any(|c| c == "[?occupancy=metrics.publishers]control_pri"));
        assert!(channels.iter().any(|c| c == "NzM2_MTIyMzY_splits"));
    }

    #[test]
    fn test_push_disabled_token() {
        let token = Token::from_auth_response(AuthResponse { push_enabled: false, token: None })
            .unwrap();
        assert!(!token.push_enabled);
        assert!(token.channels.is_empty());
    }

    #[test]
    fn test_garbage_token_is_error() {
        let result = Token::from_auth_response(AuthResponse {
            push_enabled: true,
            token: Some("not-a-jwt".to_string()),
        });
        assert!(result.is_err());
    }
}
