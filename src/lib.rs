//! # Flagstream SDK
//!
//! A high-performance Rust client library for server-sent feature flags. The
//! host application asks "for this key and this flag, which treatment
//! applies?" and gets an answer in microseconds from in-process state, while
//! background subsystems keep that state fresh and ship telemetry back.
//!
//! ## Overview
//!
//! The SDK separates the evaluation hot path from the synchronization
//! runtime. It focuses on:
//!
//! - **Evaluation**: Deterministic treatment resolution from an immutable
//!   in-process snapshot
//! - **Synchronization**: Hybrid streaming push + long-poll fallback keeping
//!   flag and segment state current
//! - **Recording**: Deduplicated, batched shipping of impressions and events
//!   under backpressure
//! - **Telemetry**: Latency histograms, error counters, and a config
//!   snapshot shipped to the control plane
//!
//! ## Architecture
//!
//! The SDK is organized into several layers:
//!
//! ### Evaluation Layer
//! Pure-CPU treatment resolution: hashing, bucketing, matchers, and the
//! snapshot-based evaluator. Never suspends, never raises.
//!
//! ### Synchronization Layer
//! A synchronizer driving diff fetches by change-number cursor, plus a push
//! subsystem (SSE) that applies embedded updates instantly or schedules
//! catch-up fetches, falling back to polling when streaming degrades.
//!
//! ### Recording Layer
//! Bounded queues and periodic flushers for impressions (with per-mode
//! dedupe and hourly counters), events, and telemetry.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use flagstream_sdk::{Settings, SplitFactory};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = SplitFactory::build("YOUR_SDK_KEY", Settings::default()).await?;
//! let client = factory.client();
//! let treatment = client.get_treatment("user-42", "new-checkout", None);
//! if treatment == "on" {
//!     // serve the new experience
//! }
//! client.track("user-42", "user", "page.view", None, None);
//! # Ok(())
//! # }
//! ```

// Evaluation Layer
/// Snapshot-based treatment resolution
pub mod evaluator;
/// MurmurHash3 / legacy key hashing
pub mod hashing;
/// Targeting rule matchers
pub mod matchers;
/// Bucketing and partition walk
pub mod splitter;

// State
/// Flag and segment storage ports with in-memory implementations
pub mod storage;
/// Wire payloads and in-memory models
pub mod types;

// Synchronization Layer
/// REST clients for the control plane
pub mod api;
/// Streaming push subsystem (SSE, workers, status machine)
pub mod push;
/// Diff-fetch loops and polling tasks
pub mod synchronizer;

// Recording Layer
/// Impression dedupe and hourly counters
pub mod impressions;
/// Bounded queues and periodic flushers
pub mod recorder;
/// Latency histograms, counters, config snapshot
pub mod telemetry;

// Surface
/// Client facade (treatments, track, destroy)
pub mod client;
/// Error kinds
pub mod error;
/// Composition root and process-wide registry
pub mod factory;
/// Lifecycle manager and status supervisor
pub mod manager;
/// Recognized configuration options
pub mod settings;

// Utilities
/// Clock helpers
pub mod utils;

// Re-exports for convenience
pub use client::{Attributes, Client, SplitKey, TreatmentResult};
pub use error::SdkError;
pub use factory::{SplitFactory, SplitManager, SplitView};
pub use settings::{ImpressionsMode, OperationMode, Settings};
pub use splitter::CONTROL;
