//! # Lifecycle Manager
//!
//! Composes the sync runtime: blocking initial sync gates readiness, then
//! recorder flushers start, then push (or plain polling when streaming is
//! off). A supervisor task consumes the push status channel and switches the
//! SDK between streaming and polling. Stop is idempotent and winds things
//! down in a fixed order with a final bounded flush.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::{mpsc, watch};

use crate::error::SdkError;
use crate::push::{PushManager, PushStatus};
use crate::recorder::{
    start_flushers, EventsRecorder, ImpressionsRecorder, TelemetrySubmitter,
};
use crate::settings::Settings;
use crate::synchronizer::Synchronizer;
use crate::telemetry::TelemetryStorage;

/// Budget for the final recorder flush during shutdown.
const STOP_FLUSH_DEADLINE: Duration = Duration::from_secs(5);

pub struct SyncManager {
    settings: Settings,
    synchronizer: Arc<Synchronizer>,
    push: Option<Arc<PushManager>>,
    push_status: Mutex<Option<mpsc::Receiver<PushStatus>>>,
    impressions: Arc<ImpressionsRecorder>,
    events: Arc<EventsRecorder>,
    telemetry_submitter: Arc<TelemetrySubmitter>,
    telemetry: Arc<TelemetryStorage>,
    ready_tx: watch::Sender<bool>,
    recorders_stop: Mutex<Option<watch::Sender<bool>>>,
    stopped: AtomicBool,
}

impl SyncManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        synchronizer: Arc<Synchronizer>,
        push: Option<Arc<PushManager>>,
        push_status: Option<mpsc::Receiver<PushStatus>>,
        impressions: Arc<ImpressionsRecorder>,
        events: Arc<EventsRecorder>,
        telemetry_submitter: Arc<TelemetrySubmitter>,
        telemetry: Arc<TelemetryStorage>,
        ready_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            settings,
            synchronizer,
            push,
            push_status: Mutex::new(push_status),
            impressions,
            events,
            telemetry_submitter,
            telemetry,
            ready_tx,
            recorders_stop: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Blocking start: initial sync, readiness, flushers, then streaming or
    /// polling.
    pub async fn start(
        self: &Arc<Self>,
        active_factories: u64,
        redundant_factories: u64,
    ) -> Result<(), SdkError> {
        info!("🚀 [Manager] Starting synchronization");
        self.synchronizer.sync_all().await?;
        self.telemetry.record_ready();
        let _ = self.ready_tx.send(true);
        info!("✅ [Manager] Initial sync complete, SDK ready");

        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_rx_supervisor = stop_rx.clone();
        *self.recorders_stop.lock().unwrap_or_else(|e| e.into_inner()) = Some(stop_tx);
        start_flushers(
            self.impressions.clone(),
            self.events.clone(),
            self.telemetry_submitter.clone(),
            &self.settings,
            stop_rx,
        );

        // One-shot init snapshot, shipped off the hot path.
        {
            let submitter = self.telemetry_submitter.clone();
            let settings = self.settings.clone();
            tokio::spawn(async move {
                submitter
                    .flush_config(&settings, active_factories, redundant_factories)
                    .await;
            });
        }

        match (&self.push, self.settings.streaming_enabled) {
            (Some(push), true) => {
                self.spawn_status_supervisor(stop_rx_supervisor);
                push.start();
            }
            _ => {
                info!("[Manager] Streaming disabled, polling only");
                self.synchronizer.start_periodic_fetching();
            }
        }
        Ok(())
    }

    /// Consume the push status channel and multiplex between streaming and
    /// polling. The push manager handles its own reconnect backoff; this
    /// loop's job is keeping polling coverage honest.
    fn spawn_status_supervisor(self: &Arc<Self>, mut stop: watch::Receiver<bool>) {
        let Some(mut status_rx) =
            self.push_status.lock().unwrap_or_else(|e| e.into_inner()).take()
        else {
            warn!("[Manager] Status supervisor already running");
            return;
        };
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let status = tokio::select! {
                    maybe_status = status_rx.recv() => match maybe_status {
                        Some(status) => status,
                        None => break,
                    },
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                        continue;
                    }
                };
                match status {
                    PushStatus::Up => {
                        info!("[Manager] Streaming up, disabling periodic fetching");
                        this.synchronizer.stop_periodic_fetching();
                        // Catch up on anything missed while polling.
                        if let Err(e) = this.synchronizer.sync_all().await {
                            error!("[Manager] Resync after streaming up failed: {}", e);
                        }
                    }
                    PushStatus::Down => {
                        info!("[Manager] Streaming temporarily down, polling");
                        this.synchronizer.start_periodic_fetching();
                    }
                    PushStatus::RetryableError => {
                        info!("[Manager] Streaming error, polling while push retries");
                        this.synchronizer.start_periodic_fetching();
                    }
                    PushStatus::NonRetryableError => {
                        info!("[Manager] Streaming unavailable for good, polling only");
                        this.synchronizer.start_periodic_fetching();
                        if let Some(push) = &this.push {
                            push.stop();
                        }
                        break;
                    }
                }
            }
            info!("[Manager] Status supervisor exited");
        });
    }

    /// Deterministic shutdown: push, fetchers, recorders, then one last flush
    /// (telemetry last) under a deadline. Double-stop is a no-op.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[Manager] Stopping");

        if let Some(push) = &self.push {
            push.stop();
        }
        self.synchronizer.stop_periodic_fetching();
        if let Some(stop) = self.recorders_stop.lock().unwrap_or_else(|e| e.into_inner()).take()
        {
            let _ = stop.send(true);
        }

        let final_flush = async {
            self.impressions.flush().await;
            self.impressions.flush_counts().await;
            self.events.flush().await;
            self.telemetry_submitter.flush_stats().await;
        };
        if tokio::time::timeout(STOP_FLUSH_DEADLINE, final_flush).await.is_err() {
            warn!("[Manager] Final flush exceeded {:?}, abandoning", STOP_FLUSH_DEADLINE);
        }
        info!("👋 [Manager] Stopped");
    }
}
