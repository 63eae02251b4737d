//! Decoding of streaming notifications: the SSE `data` field carries a JSON
//! envelope whose inner `data` string is the typed notification. SPLIT_UPDATE
//! notifications may embed the full flag definition, base64 over one of three
//! compression codes; anything undecodable falls back to a fetch.

use std::io::Read;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::{GzDecoder, ZlibDecoder};
use serde::Deserialize;

use crate::types::flag::FeatureFlag;

/// One event as read off the SSE wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSseEvent {
    pub id: Option<String>,
    pub event: String,
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    StreamingPaused,
    StreamingResumed,
    StreamingDisabled,
}

#[derive(Debug)]
pub enum Notification {
    SplitUpdate {
        change_number: i64,
        previous_change_number: Option<i64>,
        /// Decoded embedded definition, when present and decodable.
        definition: Option<FeatureFlag>,
    },
    SplitKill {
        change_number: i64,
        split_name: String,
        default_treatment: String,
    },
    SegmentUpdate {
        change_number: i64,
        segment_name: String,
    },
    Control {
        control_type: ControlType,
    },
    Occupancy {
        channel: String,
        publishers: i64,
    },
    StreamError {
        code: i64,
        status_code: i64,
        retryable: bool,
    },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InnerNotification {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    change_number: Option<i64>,
    #[serde(default)]
    previous_change_number: Option<i64>,
    #[serde(default)]
    compression: Option<u8>,
    #[serde(default)]
    definition: Option<String>,
    #[serde(default)]
    split_name: Option<String>,
    #[serde(default)]
    default_treatment: Option<String>,
    #[serde(default)]
    segment_name: Option<String>,
    #[serde(default)]
    control_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OccupancyData {
    metrics: OccupancyMetrics,
}

#[derive(Debug, Deserialize)]
struct OccupancyMetrics {
    publishers: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamErrorData {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    status_code: i64,
}

/// Parse one raw SSE event into a notification. Heartbeats and events we
/// cannot make sense of come back as `None` (the latter with a log line).
pub fn parse_event(raw: &RawSseEvent) -> Option<Notification> {
    if raw.data.is_empty() {
        return None;
    }

    if raw.event == "error" {
        let error: StreamErrorData = serde_json::from_str(&raw.data).ok()?;
        // Token expiry codes ask for a reauth; server-side trouble is worth
        // reconnecting; anything else on this channel is fatal for push.
        let retryable =
            (40140..=40149).contains(&error.code) || error.status_code >= 500;
        return Some(Notification::StreamError {
            code: error.code,
            status_code: error.status_code,
            retryable,
        });
    }

    let envelope: Envelope = match serde_json::from_str(&raw.data) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::debug!("[PushParser] Undecodable envelope: {}", e);
            return None;
        }
    };

    // Occupancy metadata arrives as a named meta event on control channels.
    if envelope.name.as_deref() == Some("[meta]occupancy") {
        let channel = envelope.channel.unwrap_or_default();
        let data: OccupancyData = serde_json::from_str(envelope.data.as_deref()?).ok()?;
        return Some(Notification::Occupancy {
            channel: channel.replace("[?occupancy=metrics.publishers]", ""),
            publishers: data.metrics.publishers,
        });
    }

    let inner: InnerNotification = match serde_json::from_str(envelope.data.as_deref()?) {
        Ok(inner) => inner,
        Err(e) => {
            log::debug!("[PushParser] Undecodable notification: {}", e);
            return None;
        }
    };

    match inner.kind.as_str() {
        "SPLIT_UPDATE" => {
            let change_number = inner.change_number?;
            let definition = match (inner.compression, inner.definition.as_deref()) {
                (Some(compression), Some(definition)) => {
                    match decode_definition(compression, definition) {
                        Ok(bytes) => match FeatureFlag::from_json(&bytes) {
                            Ok(flag) => Some(flag),
                            Err(e) => {
                                log::warn!(
                                    "[PushParser] Embedded definition did not parse: {:#}",
                                    e
                                );
                                None
                            }
                        },
                        Err(e) => {
                            log::warn!("[PushParser] Embedded definition undecodable: {:#}", e);
                            None
                        }
                    }
                }
                _ => None,
            };
            Some(Notification::SplitUpdate {
                change_number,
                previous_change_number: inner.previous_change_number,
                definition,
            })
        }
        "SPLIT_KILL" => Some(Notification::SplitKill {
            change_number: inner.change_number?,
            split_name: inner.split_name?,
            default_treatment: inner.default_treatment?,
        }),
        "SEGMENT_UPDATE" => Some(Notification::SegmentUpdate {
            change_number: inner.change_number?,
            segment_name: inner.segment_name?,
        }),
        "CONTROL" => {
            let control_type = match inner.control_type.as_deref() {
                Some("STREAMING_PAUSED") => ControlType::StreamingPaused,
                Some("STREAMING_RESUMED") => ControlType::StreamingResumed,
                Some("STREAMING_DISABLED") => ControlType::StreamingDisabled,
                other => {
                    log::debug!("[PushParser] Unknown control type {:?}", other);
                    return None;
                }
            };
            Some(Notification::Control { control_type })
        }
        other => {
            log::debug!("[PushParser] Unknown notification type `{}`", other);
            None
        }
    }
}

/// Compression codes: 0 = none, 1 = gzip, 2 = zlib. The payload is base64 of
/// the (possibly compressed) definition bytes.
pub fn decode_definition(compression: u8, definition_b64: &str) -> Result<Vec<u8>> {
    let compressed = STANDARD
        .decode(definition_b64)
        .context("definition is not valid base64")?;
    match compression {
        0 => Ok(compressed),
        1 => {
            let mut decoder = GzDecoder::new(compressed.as_slice());
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).context("gzip decompression failed")?;
            Ok(out)
        }
        2 => {
            let mut decoder = ZlibDecoder::new(compressed.as_slice());
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).context("zlib decompression failed")?;
            Ok(out)
        }
        other => Err(anyhow!("unknown compression code {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    fn wrap(channel: &str, inner: &str) -> RawSseEvent {
        let envelope = serde_json::json!({
            "id": "e1",
            "channel": channel,
            "data": inner,
        });
        RawSseEvent {
            id: Some("e1".to_string()),
            event: "message".to_string(),
            data: envelope.to_string(),
        }
    }

    fn demo_definition() -> &'static str {
        r#"{"name":"demo","trafficTypeName":"user","seed":123,"status":"ACTIVE",
            "killed":false,"defaultTreatment":"off","changeNumber":11,"algo":2,
            "conditions":[]}"#
    }

    #[test]
    fn test_split_update_without_definition() {
        let raw = wrap("splits", r#"{"type":"SPLIT_UPDATE","changeNumber":11}"#);
        match parse_event(&raw) {
            Some(Notification::SplitUpdate { change_number, previous_change_number, definition }) => {
                assert_eq!(change_number, 11);
                assert_eq!(previous_change_number, None);
                assert!(definition.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_split_update_with_zlib_definition() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(demo_definition().as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();
        let inner = serde_json::json!({
            "type": "SPLIT_UPDATE",
            "changeNumber": 11,
            "previousChangeNumber": 10,
            "compression": 2,
            "definition": STANDARD.encode(compressed),
        });
        let raw = wrap("splits", &inner.to_string());
        match parse_event(&raw) {
            Some(Notification::SplitUpdate { definition: Some(flag), previous_change_number, .. }) => {
                assert_eq!(flag.name, "demo");
                assert_eq!(previous_change_number, Some(10));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_gzip_roundtrip_is_identity() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(demo_definition().as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();
        let decoded = decode_definition(1, &STANDARD.encode(compressed)).unwrap();
        assert_eq!(decoded, demo_definition().as_bytes());
    }

    #[test]
    fn test_unknown_compression_is_error() {
        assert!(decode_definition(9, &STANDARD.encode(b"x")).is_err());
    }

    #[test]
    fn test_split_kill() {
        let raw = wrap(
            "splits",
            r#"{"type":"SPLIT_KILL","changeNumber":12,"splitName":"demo","defaultTreatment":"off"}"#,
        );
        match parse_event(&raw) {
            Some(Notification::SplitKill { change_number, split_name, default_treatment }) => {
                assert_eq!(change_number, 12);
                assert_eq!(split_name, "demo");
                assert_eq!(default_treatment, "off");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_occupancy_event() {
        let envelope = serde_json::json!({
            "channel": "[?occupancy=metrics.publishers]control_pri",
            "name": "[meta]occupancy",
            "data": r#"{"metrics":{"publishers":2}}"#,
        });
        let raw = RawSseEvent {
            id: None,
            event: "message".to_string(),
            data: envelope.to_string(),
        };
        match parse_event(&raw) {
            Some(Notification::Occupancy { channel, publishers }) => {
                assert_eq!(channel, "control_pri");
                assert_eq!(publishers, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_control_event() {
        let raw = wrap("control_pri", r#"{"type":"CONTROL","controlType":"STREAMING_PAUSED"}"#);
        assert!(matches!(
            parse_event(&raw),
            Some(Notification::Control { control_type: ControlType::StreamingPaused })
        ));
    }

    #[test]
    fn test_error_event_classification() {
        let raw = RawSseEvent {
            id: None,
            event: "error".to_string(),
            data: r#"{"code":40142,"statusCode":401}"#.to_string(),
        };
        assert!(matches!(
            parse_event(&raw),
            Some(Notification::StreamError { retryable: true, .. })
        ));

        let raw = RawSseEvent {
            id: None,
            event: "error".to_string(),
            data: r#"{"code":40010,"statusCode":403}"#.to_string(),
        };
        assert!(matches!(
            parse_event(&raw),
            Some(Notification::StreamError { retryable: false, .. })
        ));
    }

    #[test]
    fn test_heartbeat_is_ignored() {
        let raw = RawSseEvent { id: None, event: "message".to_string(), data: String::new() };
        assert!(parse_event(&raw).is_none());
    }
}
