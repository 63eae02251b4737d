// Wire payloads and in-memory models shared across the SDK.

/// Impression and tracked-event records
pub mod events;
/// Feature flag definitions and the splitChanges payload
pub mod flag;
/// Segment membership and the segmentChanges payload
pub mod segment;
/// Streaming auth token
pub mod token;
