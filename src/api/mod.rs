// REST clients for the control plane. Each wrapper is thin: assemble the
// request, record per-endpoint telemetry, surface a typed error.

/// Streaming auth
pub mod auth;
/// Shared reqwest wrapper with SDK headers and telemetry capture
pub mod http;
/// Impression/event/telemetry posting
pub mod recording;
/// Segment diff fetches
pub mod segments;
/// Flag diff fetches
pub mod splits;

pub use auth::AuthApi;
pub use http::HttpClient;
pub use recording::RecordingApi;
pub use segments::SegmentsApi;
pub use splits::SplitsApi;
