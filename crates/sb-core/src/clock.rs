//! Wall clock, monotonic clock, and fresh identifiers.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use std::time::Instant;

/// Current wall-clock time as unix milliseconds.
pub fn now_wall_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Monotonic instant for interval measurement.
pub fn now_mono() -> Instant {
    Instant::now()
}

/// A fresh identifier: 128 bits of entropy, URL-safe base64 (22 chars).
pub fn fresh_id() -> String {
    let bytes: [u8; 16] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}
