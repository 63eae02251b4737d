// src/utils.rs
// Clock helpers shared by the recorders and telemetry.

use std::time::Instant;

/// Current unix epoch time in milliseconds.
pub fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Truncate an epoch-ms timestamp to the start of its UTC hour.
pub fn hour_floor_ms(ts: i64) -> i64 {
    ts - ts.rem_euclid(3_600_000)
}

/// Elapsed microseconds since a measurement started, saturated to u64.
pub fn elapsed_micros(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX)
}
