//! # SSE Transport
//!
//! Long-lived event-stream connection to the streaming endpoint. The reader
//! parses `id:`/`event:`/`data:` lines into raw events and feeds them to the
//! push manager. A watchdog tears the connection down when the server goes
//! silent past the heartbeat tolerance; the manager owns reconnect policy.

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use url::Url;

use crate::settings::Settings;
use crate::types::token::Token;

use super::events::RawSseEvent;

/// Server heartbeats arrive every 60 s; silence past this window means the
/// connection is dead even if TCP has not noticed.
pub const HEARTBEAT_TOLERANCE: Duration = Duration::from_secs(70);

/// Messages from the reader to the push manager.
#[derive(Debug)]
pub enum StreamMessage {
    /// The subscribe request was accepted; events follow.
    Connected,
    Event(RawSseEvent),
}

/// Why a read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// Stop signal observed.
    Stopped,
    /// No bytes (not even heartbeats) within the tolerance window.
    WatchdogTimeout,
    /// Server closed the stream or transport failed mid-read.
    StreamClosed,
    /// Connection attempt rejected with this HTTP status.
    Rejected(u16),
}

pub struct SseClient {
    client: reqwest::Client,
    streaming_url: String,
}

impl SseClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        // No overall read timeout: the stream is expected to stay open for
        // hours. Liveness is the watchdog's job.
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout())
            .build()
            .context("failed to build SSE client")?;
        Ok(Self { client, streaming_url: settings.streaming_url().to_string() })
    }

    /// Connect subscribed to the token's channels and pump events until
    /// disconnect. Every received chunk (heartbeats included) feeds the
    /// watchdog.
    pub async fn connect_and_read(
        &self,
        token: &Token,
        events: mpsc::Sender<StreamMessage>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<Disconnect> {
        let mut url = Url::parse(&self.streaming_url).context("invalid streaming url")?;
        url.query_pairs_mut()
            .append_pair("channels", &token.subscribe_channels().join(","))
            .append_pair("accessToken", &token.raw)
            .append_pair("v", "1.1")
            .append_pair("heartbeats", "true");

        debug!("[SSE] Connecting to {}", url.host_str().unwrap_or("streaming endpoint"));
        let response = self
            .client
            .get(url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .context("streaming connect failed")?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            warn!("[SSE] Connection rejected with status {}", status);
            return Ok(Disconnect::Rejected(status));
        }
        info!("📡 [SSE] Connected, streaming events");
        if events.send(StreamMessage::Connected).await.is_err() {
            return Ok(Disconnect::Stopped);
        }

        let mut stream = response.bytes_stream();
        let mut parser = LineParser::default();
        let mut deadline = Instant::now() + HEARTBEAT_TOLERANCE;

        loop {
            tokio::select! {
                chunk = stream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            deadline = Instant::now() + HEARTBEAT_TOLERANCE;
                            for event in parser.feed(&bytes) {
                                if events.send(StreamMessage::Event(event)).await.is_err() {
                                    // Receiver gone: manager is shutting down.
                                    return Ok(Disconnect::Stopped);
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!("[SSE] Stream error: {}", e);
                            return Ok(Disconnect::StreamClosed);
                        }
                        None => {
                            info!("[SSE] Stream ended by server");
                            return Ok(Disconnect::StreamClosed);
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("[SSE] No heartbeat for {:?}, dropping connection", HEARTBEAT_TOLERANCE);
                    return Ok(Disconnect::WatchdogTimeout);
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        debug!("[SSE] Stop signal received");
                        return Ok(Disconnect::Stopped);
                    }
                }
            }
        }
    }
}

/// Incremental `text/event-stream` line parser. Comment lines (`:keepalive`)
/// only feed the watchdog; an empty line terminates the pending event.
#[derive(Default)]
struct LineParser {
    buffer: String,
    pending: RawSseEvent,
}

impl LineParser {
    fn feed(&mut self, bytes: &[u8]) -> Vec<RawSseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut completed = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                let event = std::mem::take(&mut self.pending);
                if !event.data.is_empty() || !event.event.is_empty() {
                    completed.push(RawSseEvent {
                        event: if event.event.is_empty() {
                            "message".to_string()
                        } else {
                            event.event
                        },
                        ..event
                    });
                }
                continue;
            }
            if line.starts_with(':') {
                continue; // comment / heartbeat
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "id" => self.pending.id = Some(value.to_string()),
                "event" => self.pending.event = value.to_string(),
                "data" => {
                    if !self.pending.data.is_empty() {
                        self.pending.data.push('\n');
                    }
                    self.pending.data.push_str(value);
                }
                _ => {}
            }
        }

        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_assembles_events() {
        let mut parser = LineParser::default();
        let events = parser.feed(b"id: 1\nevent: message\ndata: {\"a\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.as_deref(), Some("1"));
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn test_parser_handles_split_chunks() {
        let mut parser = LineParser::default();
        assert!(parser.feed(b"data: {\"par").is_empty());
        assert!(parser.feed(b"tial\":true}\n").is_empty());
        let events = parser.feed(b"\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"partial\":true}");
        assert_eq!(events[0].event, "message", "event name defaults to message");
    }

    #[test]
    fn test_parser_skips_heartbeats() {
        let mut parser = LineParser::default();
        assert!(parser.feed(b":keepalive\n\n").is_empty());
    }

    #[test]
    fn test_multiline_data_joined() {
        let mut parser = LineParser::default();
        let events = parser.feed(b"data: line1\ndata: line2\n\n");
        assert_eq!(events[0].data, "line1\nline2");
    }
}
