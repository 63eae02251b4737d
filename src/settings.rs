//! # SDK Configuration
//!
//! Every recognized option with its default, plus the sanitize pass that
//! tunes inconsistent combinations the way the platform expects (impressions
//! refresh floors per mode, pluggable forcing DEBUG impressions, telemetry
//! refresh minimum).

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use log::warn;

pub const DEFAULT_SDK_URL: &str = "https://sdk.flagstream.io/api";
pub const DEFAULT_EVENTS_URL: &str = "https://events.flagstream.io/api";
pub const DEFAULT_AUTH_URL: &str = "https://auth.flagstream.io/api/v2/auth";
pub const DEFAULT_STREAMING_URL: &str = "https://streaming.flagstream.io/sse";
pub const DEFAULT_TELEMETRY_URL: &str = "https://telemetry.flagstream.io/api/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationMode {
    InMemory,
    RedisConsumer,
    Pluggable,
    Localhost,
}

impl Default for OperationMode {
    fn default() -> Self {
        OperationMode::InMemory
    }
}

impl OperationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationMode::InMemory => "in-memory",
            OperationMode::RedisConsumer => "redis-consumer",
            OperationMode::Pluggable => "pluggable",
            OperationMode::Localhost => "localhost",
        }
    }

    pub fn storage_type(&self) -> &'static str {
        match self {
            OperationMode::InMemory => "memory",
            OperationMode::RedisConsumer => "redis",
            OperationMode::Pluggable => "pluggable",
            OperationMode::Localhost => "localhost",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImpressionsMode {
    Optimized,
    Debug,
    None,
}

impl Default for ImpressionsMode {
    fn default() -> Self {
        ImpressionsMode::Optimized
    }
}

impl ImpressionsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImpressionsMode::Optimized => "OPTIMIZED",
            ImpressionsMode::Debug => "DEBUG",
            ImpressionsMode::None => "NONE",
        }
    }
}

/// Per-endpoint URL overrides; unset entries fall back to production.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UrlOverrides {
    #[serde(default)]
    pub sdk: Option<String>,
    #[serde(default)]
    pub events: Option<String>,
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub streaming: Option<String>,
    #[serde(default)]
    pub telemetry: Option<String>,
}

impl UrlOverrides {
    pub fn any_set(&self) -> bool {
        self.sdk.is_some()
            || self.events.is_some()
            || self.auth.is_some()
            || self.streaming.is_some()
            || self.telemetry.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub operation_mode: OperationMode,
    pub streaming_enabled: bool,
    /// Seconds between flag fetches while polling.
    pub features_refresh_rate: u64,
    /// Seconds between segment fetches while polling.
    pub segments_refresh_rate: u64,
    /// Seconds between impression posts. Floored by the sanitize pass.
    pub impressions_refresh_rate: u64,
    pub impressions_bulk_size: usize,
    pub impressions_queue_size: usize,
    /// Seconds between event posts.
    pub events_push_rate: u64,
    pub events_bulk_size: usize,
    pub events_queue_size: usize,
    /// Seconds between telemetry stats posts.
    pub telemetry_refresh_rate: u64,
    pub labels_enabled: bool,
    #[serde(rename = "IPAddressesEnabled")]
    pub ip_addresses_enabled: bool,
    pub impressions_mode: ImpressionsMode,
    /// Whether an impression listener is attached (captured for telemetry).
    pub impression_listener: bool,
    /// Connect timeout in milliseconds.
    #[serde(rename = "connectionTimeout")]
    pub connection_timeout_ms: u64,
    /// Read timeout in milliseconds.
    #[serde(rename = "readTimeout")]
    pub read_timeout_ms: u64,
    pub machine_name: Option<String>,
    pub machine_ip: Option<String>,
    pub urls: UrlOverrides,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            operation_mode: OperationMode::InMemory,
            streaming_enabled: true,
            features_refresh_rate: 30,
            segments_refresh_rate: 30,
            impressions_refresh_rate: 300,
            impressions_bulk_size: 5000,
            impressions_queue_size: 10_000,
            events_push_rate: 10,
            events_bulk_size: 5000,
            events_queue_size: 10_000,
            telemetry_refresh_rate: 3600,
            labels_enabled: true,
            ip_addresses_enabled: true,
            impressions_mode: ImpressionsMode::Optimized,
            impression_listener: false,
            connection_timeout_ms: 1500,
            read_timeout_ms: 5000,
            machine_name: None,
            machine_ip: None,
            urls: UrlOverrides::default(),
        }
    }
}

impl Settings {
    /// Look for inconsistencies or ill-formed combinations and tune them.
    pub fn sanitize(mut self) -> Self {
        if self.operation_mode == OperationMode::Pluggable
            && self.impressions_mode != ImpressionsMode::Debug
        {
            warn!(
                "[Settings] pluggable mode only supports DEBUG impressions; \
                 adjusting impressionsMode to DEBUG"
            );
            self.impressions_mode = ImpressionsMode::Debug;
        }

        self.impressions_refresh_rate = match self.impressions_mode {
            ImpressionsMode::Debug => self.impressions_refresh_rate.max(1),
            ImpressionsMode::Optimized | ImpressionsMode::None => {
                self.impressions_refresh_rate.max(60)
            }
        };

        if self.telemetry_refresh_rate < 60 {
            warn!("[Settings] telemetryRefreshRate minimum is 60 seconds, defaulting to 3600");
            self.telemetry_refresh_rate = 3600;
        }

        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn sdk_url(&self) -> &str {
        self.urls.sdk.as_deref().unwrap_or(DEFAULT_SDK_URL)
    }

    pub fn events_url(&self) -> &str {
        self.urls.events.as_deref().unwrap_or(DEFAULT_EVENTS_URL)
    }

    pub fn auth_url(&self) -> &str {
        self.urls.auth.as_deref().unwrap_or(DEFAULT_AUTH_URL)
    }

    pub fn streaming_url(&self) -> &str {
        self.urls.streaming.as_deref().unwrap_or(DEFAULT_STREAMING_URL)
    }

    pub fn telemetry_url(&self) -> &str {
        self.urls.telemetry.as_deref().unwrap_or(DEFAULT_TELEMETRY_URL)
    }

    /// Machine identity for request headers; disabled identities send nothing.
    pub fn machine_identity(&self) -> (Option<String>, Option<String>) {
        if !self.ip_addresses_enabled {
            return (None, None);
        }
        let name = self
            .machine_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok());
        (name, self.machine_ip.clone())
    }

    /// HTTPS proxy detection, captured once into the telemetry init snapshot.
    pub fn https_proxy_detected() -> bool {
        std::env::var("HTTPS_PROXY").map(|v| !v.is_empty()).unwrap_or(false)
            || std::env::var("https_proxy").map(|v| !v.is_empty()).unwrap_or(false)
    }
}

/// Telemetry init snapshot helper: map of refresh rates as configured.
pub fn refresh_rates(settings: &Settings) -> HashMap<&'static str, u64> {
    HashMap::from([
        ("featuresRefreshRate", settings.features_refresh_rate),
        ("segmentsRefreshRate", settings.segments_refresh_rate),
        ("impressionsRefreshRate", settings.impressions_refresh_rate),
        ("eventsPushRate", settings.events_push_rate),
        ("telemetryRefreshRate", settings.telemetry_refresh_rate),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.features_refresh_rate, 30);
        assert_eq!(s.impressions_queue_size, 10_000);
        assert_eq!(s.impressions_bulk_size, 5000);
        assert_eq!(s.events_bulk_size, 5000);
        assert_eq!(s.connection_timeout_ms, 1500);
        assert!(s.streaming_enabled);
        assert_eq!(s.impressions_mode, ImpressionsMode::Optimized);
    }

    #[test]
    fn test_impressions_refresh_floors() {
        let s = Settings { impressions_refresh_rate: 10, ..Default::default() }.sanitize();
        assert_eq!(s.impressions_refresh_rate, 60, "OPTIMIZED floors to 60");

        let s = Settings {
            impressions_refresh_rate: 0,
            impressions_mode: ImpressionsMode::Debug,
            ..Default::default()
        }
        .sanitize();
        assert_eq!(s.impressions_refresh_rate, 1, "DEBUG floors to 1");

        let s = Settings {
            impressions_refresh_rate: 300,
            impressions_mode: ImpressionsMode::None,
            ..Default::default()
        }
        .sanitize();
        assert_eq!(s.impressions_refresh_rate, 300);
    }

    #[test]
    fn test_pluggable_forces_debug() {
        let s = Settings {
            operation_mode: OperationMode::Pluggable,
            impressions_mode: ImpressionsMode::Optimized,
            ..Default::default()
        }
        .sanitize();
        assert_eq!(s.impressions_mode, ImpressionsMode::Debug);
    }

    #[test]
    fn test_telemetry_rate_minimum() {
        let s = Settings { telemetry_refresh_rate: 30, ..Default::default() }.sanitize();
        assert_eq!(s.telemetry_refresh_rate, 3600);
    }

    #[test]
    fn test_url_overrides() {
        let mut s = Settings::default();
        assert_eq!(s.sdk_url(), DEFAULT_SDK_URL);
        assert!(!s.urls.any_set());
        s.urls.sdk = Some("http://localhost:8080/api".to_string());
        assert_eq!(s.sdk_url(), "http://localhost:8080/api");
        assert!(s.urls.any_set());
    }

    #[test]
    fn test_machine_identity_disabled() {
        let s = Settings {
            ip_addresses_enabled: false,
            machine_name: Some("host-1".into()),
            machine_ip: Some("10.0.0.1".into()),
            ..Default::default()
        };
        assert_eq!(s.machine_identity(), (None, None));
    }

    #[test]
    fn test_settings_from_json() {
        let raw = r#"{
            "streamingEnabled": false,
            "featuresRefreshRate": 15,
            "impressionsMode": "DEBUG",
            "IPAddressesEnabled": false
        }"#;
        let s: Settings = serde_json::from_str(raw).unwrap();
        assert!(!s.streaming_enabled);
        assert_eq!(s.features_refresh_rate, 15);
        assert_eq!(s.impressions_mode, ImpressionsMode::Debug);
        assert!(!s.ip_addresses_enabled);
    }
}
