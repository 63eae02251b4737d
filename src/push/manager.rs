//! # Push Manager
//!
//! Owns the streaming connection lifecycle: authenticate, connect, decode,
//! dispatch to workers, and keep the externally visible status honest. On
//! transport trouble it backs off exponentially (1 s doubling to 60 s, ±20%
//! jitter); too many consecutive failures, an auth rejection, or a
//! STREAMING_DISABLED control demote the SDK to polling for good.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::api::AuthApi;
use crate::synchronizer::Synchronizer;
use crate::telemetry::{streaming_event_types, TelemetryStorage};
use crate::types::token::Token;
use crate::utils::epoch_ms;

use super::events::{parse_event, ControlType, Notification, RawSseEvent};
use super::sse::{Disconnect, SseClient, StreamMessage};
use super::workers::{SegmentUpdateWorker, SplitUpdateWorker, UpdateQueue, UPDATE_QUEUE_CAPACITY};

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const MAX_CONSECUTIVE_FAILURES: u32 = 10;
/// Refresh the token this long before it expires (minimum one second out).
const TOKEN_REFRESH_GRACE_SECS: i64 = 600;

/// Externally visible status, consumed by the lifecycle supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    Up,
    Down,
    RetryableError,
    NonRetryableError,
}

/// Internal connection state, mostly useful for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Stopped,
}

/// Outcome of one authenticate→connect→read cycle.
enum RunStep {
    /// Token refresh due: reauthenticate immediately, no backoff.
    Reauth,
    /// Transient trouble: back off and retry.
    Backoff,
    /// Stop signal observed.
    Shutdown,
    /// Streaming is not coming back; demote to polling.
    Fatal,
}

enum EventOutcome {
    Continue,
    Reconnect,
    Fatal,
}

pub struct PushManager {
    auth: AuthApi,
    sse: Arc<SseClient>,
    synchronizer: Arc<Synchronizer>,
    telemetry: Arc<TelemetryStorage>,
    status_tx: mpsc::Sender<PushStatus>,
    split_queue: Arc<UpdateQueue<i64>>,
    segment_queue: Arc<UpdateQueue<(String, i64)>>,
    tracker: Mutex<StatusTracker>,
    state: Mutex<ConnectionState>,
    stop: Mutex<Option<watch::Sender<bool>>>,
}

impl PushManager {
    pub fn new(
        auth: AuthApi,
        sse: SseClient,
        synchronizer: Arc<Synchronizer>,
        telemetry: Arc<TelemetryStorage>,
        status_tx: mpsc::Sender<PushStatus>,
    ) -> Self {
        Self {
            auth,
            sse: Arc::new(sse),
            synchronizer,
            telemetry,
            status_tx,
            split_queue: Arc::new(UpdateQueue::new(UPDATE_QUEUE_CAPACITY)),
            segment_queue: Arc::new(UpdateQueue::new(UPDATE_QUEUE_CAPACITY)),
            tracker: Mutex::new(StatusTracker::new()),
            state: Mutex::new(ConnectionState::Idle),
            stop: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Start workers and the connection task. Idempotent while running.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.stop.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            debug!("[Push] Already running");
            return;
        }
        info!("🔌 [Push] Starting push subsystem");
        let (stop_tx, stop_rx) = watch::channel(false);
        *guard = Some(stop_tx);

        SplitUpdateWorker::new(self.split_queue.clone(), self.synchronizer.clone()).start();
        SegmentUpdateWorker::new(self.segment_queue.clone(), self.synchronizer.clone()).start();

        let this = self.clone();
        tokio::spawn(async move {
            this.run(stop_rx).await;
        });
    }

    /// Signal everything to wind down. Idempotent; double-stop is a no-op.
    pub fn stop(&self) {
        let mut guard = self.stop.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stop_tx) = guard.take() {
            info!("[Push] Stopping push subsystem");
            let _ = stop_tx.send(true);
            self.split_queue.push_sentinel();
            self.segment_queue.push_sentinel();
            self.set_state(ConnectionState::Stopped);
        }
    }

    async fn publish(&self, status: PushStatus) {
        debug!("[Push] Status -> {:?}", status);
        if self.status_tx.send(status).await.is_err() {
            warn!("[Push] Status channel closed");
        }
    }

    async fn run(self: Arc<Self>, stop: watch::Receiver<bool>) {
        let mut backoff = BACKOFF_INITIAL;
        let mut consecutive_failures: u32 = 0;

        loop {
            if *stop.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            let token = match self.auth.authenticate().await {
                Ok(token) => {
                    if !token.push_enabled {
                        info!("[Push] Streaming disabled for this key; polling only");
                        self.publish(PushStatus::NonRetryableError).await;
                        break;
                    }
                    token
                }
                Err(e) if e.is_retryable() => {
                    consecutive_failures += 1;
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        error!("[Push] Auth failed {} times, giving up", consecutive_failures);
                        self.publish(PushStatus::NonRetryableError).await;
                        break;
                    }
                    warn!("[Push] Auth failed ({}), retrying in {:?}", e, backoff);
                    self.publish(PushStatus::RetryableError).await;
                    tokio::time::sleep(jittered(backoff)).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                    continue;
                }
                Err(e) => {
                    error!("[Push] Auth rejected: {}", e);
                    self.publish(PushStatus::NonRetryableError).await;
                    break;
                }
            };

            match self
                .connected_cycle(&token, &stop, &mut consecutive_failures, &mut backoff)
                .await
            {
                RunStep::Reauth => {
                    self.telemetry.record_token_refresh();
                    self.telemetry
                        .record_streaming_event(streaming_event_types::TOKEN_REFRESH, 0);
                    backoff = BACKOFF_INITIAL;
                    continue;
                }
                RunStep::Backoff => {
                    consecutive_failures += 1;
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        error!(
                            "[Push] {} consecutive streaming failures, demoting to polling",
                            consecutive_failures
                        );
                        self.publish(PushStatus::NonRetryableError).await;
                        break;
                    }
                    self.set_state(ConnectionState::Disconnected);
                    self.publish(PushStatus::RetryableError).await;
                    tokio::time::sleep(jittered(backoff)).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
                RunStep::Shutdown => break,
                RunStep::Fatal => {
                    self.publish(PushStatus::NonRetryableError).await;
                    break;
                }
            }
        }

        self.set_state(ConnectionState::Stopped);
        debug!("[Push] Connection task exited");
    }

    /// One connection: spawn the SSE reader, pump events until something
    /// breaks the session. The failure counters reset once the subscribe is
    /// accepted, so long-lived sessions do not accumulate toward the
    /// nonretryable threshold.
    async fn connected_cycle(
        &self,
        token: &Token,
        stop: &watch::Receiver<bool>,
        consecutive_failures: &mut u32,
        backoff: &mut Duration,
    ) -> RunStep {
        let (event_tx, mut event_rx) = mpsc::channel::<StreamMessage>(256);
        let reader = {
            let sse = self.sse.clone();
            let token = token.clone();
            let stop = stop.clone();
            tokio::spawn(async move { sse.connect_and_read(&token, event_tx, stop).await })
        };

        let refresh_deadline = token_refresh_deadline(token);
        let mut stop = stop.clone();

        loop {
            tokio::select! {
                maybe_event = event_rx.recv() => {
                    match maybe_event {
                        Some(StreamMessage::Connected) => {
                            self.set_state(ConnectionState::Connected);
                            self.telemetry.record_streaming_event(
                                streaming_event_types::CONNECTION_ESTABLISHED,
                                0,
                            );
                            self.tracker.lock().unwrap_or_else(|e| e.into_inner()).reset();
                            *consecutive_failures = 0;
                            *backoff = BACKOFF_INITIAL;
                            self.publish(PushStatus::Up).await;
                        }
                        Some(StreamMessage::Event(raw)) => match self.handle_event(&raw).await {
                            EventOutcome::Continue => {}
                            EventOutcome::Reconnect => {
                                reader.abort();
                                return RunStep::Backoff;
                            }
                            EventOutcome::Fatal => {
                                reader.abort();
                                return RunStep::Fatal;
                            }
                        },
                        None => {
                            // Reader finished; classify its disconnect.
                            let disconnect = match reader.await {
                                Ok(Ok(disconnect)) => disconnect,
                                Ok(Err(e)) => {
                                    warn!("[Push] Connect failed: {:#}", e);
                                    Disconnect::StreamClosed
                                }
                                Err(_) => Disconnect::StreamClosed,
                            };
                            return match disconnect {
                                Disconnect::Stopped => RunStep::Shutdown,
                                Disconnect::WatchdogTimeout | Disconnect::StreamClosed => {
                                    RunStep::Backoff
                                }
                                Disconnect::Rejected(status) => {
                                    if (400..500).contains(&status)
                                        && status != 408
                                        && status != 429
                                    {
                                        RunStep::Fatal
                                    } else {
                                        RunStep::Backoff
                                    }
                                }
                            };
                        }
                    }
                }
                _ = tokio::time::sleep_until(refresh_deadline) => {
                    info!("[Push] Streaming token refresh due");
                    reader.abort();
                    return RunStep::Reauth;
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        reader.abort();
                        return RunStep::Shutdown;
                    }
                }
            }
        }
    }

    async fn handle_event(&self, raw: &RawSseEvent) -> EventOutcome {
        let Some(notification) = parse_event(raw) else {
            return EventOutcome::Continue;
        };

        match notification {
            Notification::SplitUpdate { change_number, previous_change_number, definition } => {
                if let (Some(flag), Some(pcn)) = (definition, previous_change_number) {
                    if self.synchronizer.apply_instant_update(flag, pcn) {
                        debug!("[Push] Applied embedded definition at cn {}", change_number);
                        return EventOutcome::Continue;
                    }
                }
                self.split_queue.push(change_number);
                EventOutcome::Continue
            }
            Notification::SplitKill { change_number, split_name, default_treatment } => {
                self.synchronizer.kill_split_locally(
                    &split_name,
                    &default_treatment,
                    change_number,
                );
                self.split_queue.push(change_number);
                EventOutcome::Continue
            }
            Notification::SegmentUpdate { change_number, segment_name } => {
                self.segment_queue.push((segment_name, change_number));
                EventOutcome::Continue
            }
            Notification::Control { control_type } => {
                if control_type == ControlType::StreamingDisabled {
                    info!("[Push] Streaming disabled by server");
                    return EventOutcome::Fatal;
                }
                self.telemetry
                    .record_streaming_event(streaming_event_types::STREAMING_STATUS, match control_type {
                        ControlType::StreamingPaused => 0,
                        ControlType::StreamingResumed => 1,
                        ControlType::StreamingDisabled => 2,
                    });
                let transition = self
                    .tracker
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .on_control(control_type);
                if let Some(status) = transition {
                    self.publish(status).await;
                }
                EventOutcome::Continue
            }
            Notification::Occupancy { channel, publishers } => {
                let event_type = if channel.contains("control_sec") {
                    streaming_event_types::OCCUPANCY_SEC
                } else {
                    streaming_event_types::OCCUPANCY_PRI
                };
                self.telemetry.record_streaming_event(event_type, publishers);
                let transition = self
                    .tracker
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .on_occupancy(channel, publishers);
                if let Some(status) = transition {
                    self.publish(status).await;
                }
                EventOutcome::Continue
            }
            Notification::StreamError { code, status_code, retryable } => {
                warn!(
                    "[Push] Stream error code={} status={} retryable={}",
                    code, status_code, retryable
                );
                self.telemetry
                    .record_streaming_event(streaming_event_types::ABLY_ERROR, code);
                if retryable {
                    EventOutcome::Reconnect
                } else {
                    EventOutcome::Fatal
                }
            }
        }
    }
}

/// Publisher-count and pause bookkeeping behind the UP/DOWN transitions.
/// Streaming counts as down when paused, or when every control channel
/// reports zero publishers.
struct StatusTracker {
    paused: bool,
    occupancy_down: bool,
    publishers: HashMap<String, i64>,
}

impl StatusTracker {
    fn new() -> Self {
        Self { paused: false, occupancy_down: false, publishers: HashMap::new() }
    }

    fn reset(&mut self) {
        self.paused = false;
        self.occupancy_down = false;
        self.publishers.clear();
    }

    fn on_control(&mut self, control: ControlType) -> Option<PushStatus> {
        match control {
            ControlType::StreamingPaused => {
                if !self.paused {
                    self.paused = true;
                    return Some(PushStatus::Down);
                }
                None
            }
            ControlType::StreamingResumed => {
                if self.paused {
                    self.paused = false;
                    if !self.occupancy_down {
                        return Some(PushStatus::Up);
                    }
                }
                None
            }
            ControlType::StreamingDisabled => None,
        }
    }

    fn on_occupancy(&mut self, channel: String, publishers: i64) -> Option<PushStatus> {
        self.publishers.insert(channel, publishers);
        let any_active = self.publishers.values().any(|p| *p > 0);
        if !any_active && !self.occupancy_down {
            self.occupancy_down = true;
            if !self.paused {
                return Some(PushStatus::Down);
            }
        } else if any_active && self.occupancy_down {
            self.occupancy_down = false;
            if !self.paused {
                return Some(PushStatus::Up);
            }
        }
        None
    }
}

fn jittered(base: Duration) -> Duration {
    base.mul_f64(0.8 + rand::random::<f64>() * 0.4)
}

fn token_refresh_deadline(token: &Token) -> Instant {
    let now_secs = epoch_ms() / 1000;
    let secs = (token.expiration_time - TOKEN_REFRESH_GRACE_SECS - now_secs).max(1);
    Instant::now() + Duration::from_secs(secs as u64)
}
