// Streaming push subsystem: SSE transport, notification decoding, per-kind
// update workers, and the status machine that tells the lifecycle manager
// whether streaming is usable.

/// Notification envelope parsing and embedded-definition decompression
pub mod events;
/// Connection lifecycle and status machine
pub mod manager;
/// SSE transport with heartbeat watchdog
pub mod sse;
/// Bounded update queues and their worker tasks
pub mod workers;

pub use manager::{PushManager, PushStatus};
