//! # Factory
//!
//! Composition root. Builds storage, the sync runtime, the recorder
//! pipelines, and the client facade, then starts the lifecycle manager.
//! A process-wide registry tracks how many factories exist per SDK key;
//! the counts feed the telemetry init snapshot.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, warn};
use once_cell::sync::Lazy;
use tokio::sync::{mpsc, watch};

use crate::api::{AuthApi, HttpClient, RecordingApi, SegmentsApi, SplitsApi};
use crate::client::Client;
use crate::error::SdkError;
use crate::evaluator::Evaluator;
use crate::impressions::ImpressionsManager;
use crate::manager::SyncManager;
use crate::push::manager::PushManager;
use crate::push::sse::SseClient;
use crate::recorder::{EventsRecorder, ImpressionsRecorder, TelemetrySubmitter};
use crate::settings::{OperationMode, Settings};
use crate::storage::{
    InMemorySegmentStorage, InMemorySplitStorage, SegmentStorage, SplitStorage,
};
use crate::synchronizer::{SegmentSynchronizer, SplitSynchronizer, Synchronizer};
use crate::telemetry::TelemetryStorage;
use crate::types::flag::FeatureFlag;

// ============================================================================
// PROCESS-WIDE FACTORY REGISTRY
// ============================================================================

static FACTORY_REGISTRY: Lazy<Mutex<HashMap<String, usize>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Register a new factory instance. Returns (active, redundant) counts after
/// registration, where redundant counts instances beyond the first per key.
pub(crate) fn register_factory(sdk_key: &str) -> (u64, u64) {
    let mut registry = FACTORY_REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    let entry = registry.entry(sdk_key.to_string()).or_insert(0);
    *entry += 1;
    if *entry > 1 {
        warn!(
            "[Factory] You already have {} factories with this SDK key. \
             We recommend keeping only one instance and reusing it",
            *entry - 1
        );
    }
    counts_locked(&registry)
}

pub(crate) fn unregister_factory(sdk_key: &str) {
    let mut registry = FACTORY_REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(count) = registry.get_mut(sdk_key) {
        *count -= 1;
        if *count == 0 {
            registry.remove(sdk_key);
        }
    }
}

pub(crate) fn factory_counts() -> (u64, u64) {
    let registry = FACTORY_REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    counts_locked(&registry)
}

fn counts_locked(registry: &HashMap<String, usize>) -> (u64, u64) {
    let active: usize = registry.values().sum();
    let redundant: usize = registry.values().map(|c| c.saturating_sub(1)).sum();
    (active as u64, redundant as u64)
}

// ============================================================================
// FACTORY
// ============================================================================

/// Read-only flag summary exposed by the introspection manager.
#[derive(Debug, Clone)]
pub struct SplitView {
    pub name: String,
    pub traffic_type: String,
    pub killed: bool,
    pub treatments: Vec<String>,
    pub change_number: i64,
    pub configs: HashMap<String, String>,
}

impl SplitView {
    fn from_flag(flag: &FeatureFlag) -> Self {
        let mut treatments: Vec<String> = flag
            .conditions
            .iter()
            .flat_map(|c| c.partitions.iter().map(|p| p.treatment.clone()))
            .collect();
        treatments.sort();
        treatments.dedup();
        SplitView {
            name: flag.name.clone(),
            traffic_type: flag.traffic_type_name.clone(),
            killed: flag.killed,
            treatments,
            change_number: flag.change_number,
            configs: flag.configurations.clone(),
        }
    }
}

/// Introspection over the currently stored flags.
pub struct SplitManager {
    storage: Arc<dyn SplitStorage>,
}

impl SplitManager {
    pub fn split_names(&self) -> Vec<String> {
        self.storage.split_names()
    }

    pub fn split(&self, name: &str) -> Option<SplitView> {
        self.storage.get(name).map(|flag| SplitView::from_flag(&flag))
    }

    pub fn splits(&self) -> Vec<SplitView> {
        self.storage.get_all().iter().map(|flag| SplitView::from_flag(flag)).collect()
    }
}

pub struct SplitFactory {
    client: Client,
    manager: SplitManager,
    ready_rx: watch::Receiver<bool>,
    destroyed: Arc<AtomicBool>,
}

impl SplitFactory {
    /// Build and start the SDK. Resolves once the initial sync has completed
    /// (readiness) or failed permanently.
    pub async fn build(sdk_key: &str, settings: Settings) -> Result<SplitFactory, SdkError> {
        let settings = settings.sanitize();
        match settings.operation_mode {
            OperationMode::InMemory => {}
            other => {
                error!("[Factory] Operation mode {:?} requires an external storage adapter", other);
                return Err(SdkError::UnsupportedOperationMode(other.as_str().to_string()));
            }
        }

        let telemetry = Arc::new(TelemetryStorage::new());

        let http = Arc::new(
            HttpClient::new(&settings, sdk_key, telemetry.clone())
                .map_err(|e| SdkError::Setup(e.to_string()))?,
        );
        let splits_api = Arc::new(SplitsApi::new(http.clone(), settings.sdk_url()));
        let segments_api = Arc::new(SegmentsApi::new(http.clone(), settings.sdk_url()));
        let recording_api = Arc::new(RecordingApi::new(
            http.clone(),
            settings.events_url(),
            settings.telemetry_url(),
        ));

        let split_storage: Arc<dyn SplitStorage> = Arc::new(InMemorySplitStorage::new());
        let segment_storage: Arc<dyn SegmentStorage> = Arc::new(InMemorySegmentStorage::new());

        let synchronizer = Arc::new(Synchronizer::new(
            SplitSynchronizer::new(splits_api, split_storage.clone(), telemetry.clone()),
            SegmentSynchronizer::new(segments_api, split_storage.clone(), segment_storage.clone()),
            &settings,
        ));

        let impressions = Arc::new(ImpressionsRecorder::new(
            ImpressionsManager::new(settings.impressions_mode),
            recording_api.clone(),
            telemetry.clone(),
            &settings,
        ));
        let events = Arc::new(EventsRecorder::new(
            recording_api.clone(),
            telemetry.clone(),
            &settings,
        ));
        let telemetry_submitter =
            Arc::new(TelemetrySubmitter::new(recording_api, telemetry.clone()));

        let (ready_tx, ready_rx) = watch::channel(false);

        let (push, push_status) = if settings.streaming_enabled {
            let (status_tx, status_rx) = mpsc::channel(32);
            let sse = SseClient::new(&settings)
                .map_err(|e| SdkError::Setup(e.to_string()))?;
            let auth = AuthApi::new(http, settings.auth_url(), telemetry.clone());
            let push = Arc::new(PushManager::new(
                auth,
                sse,
                synchronizer.clone(),
                telemetry.clone(),
                status_tx,
            ));
            (Some(push), Some(status_rx))
        } else {
            (None, None)
        };

        let sync_manager = Arc::new(SyncManager::new(
            settings.clone(),
            synchronizer,
            push,
            push_status,
            impressions.clone(),
            events.clone(),
            telemetry_submitter,
            telemetry.clone(),
            ready_tx,
        ));

        let (active, redundant) = register_factory(sdk_key);
        if let Err(e) = sync_manager.start(active, redundant).await {
            unregister_factory(sdk_key);
            return Err(e);
        }

        let evaluator = Arc::new(Evaluator::new(split_storage.clone(), segment_storage));
        let destroyed = Arc::new(AtomicBool::new(false));
        let client = Client::new(
            evaluator,
            impressions,
            events,
            telemetry,
            split_storage.clone(),
            sync_manager.clone(),
            settings.labels_enabled,
            ready_rx.clone(),
            destroyed.clone(),
            Arc::from(sdk_key),
        );

        Ok(SplitFactory {
            client,
            manager: SplitManager { storage: split_storage },
            ready_rx,
            destroyed,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn manager(&self) -> &SplitManager {
        &self.manager
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Wait for readiness with a timeout.
    pub async fn block_until_ready(&self, timeout: Duration) -> bool {
        let mut ready = self.ready_rx.clone();
        if *ready.borrow() {
            return true;
        }
        tokio::time::timeout(timeout, async {
            while ready.changed().await.is_ok() {
                if *ready.borrow() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Stop every background task and flush the recorders one last time.
    pub async fn destroy(&self) {
        self.client.destroy().await;
    }
}
