//! # Sequential Write-Uuid Generator
//!
//! Mints the 128-bit identifier shared by the rows of one atomic write.
//! The value is a random base whose low 8 bytes are overwritten by a
//! process-global counter initialized from the wall clock, big-endian:
//! ids minted on the same host compare by insertion order under byte-wise
//! collation, with no central allocator. Across restarts the clock seed
//! keeps the counter roughly aligned with real time; wraparound relative
//! to the clock is tolerated because the id only needs to correlate, not
//! totally order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::WriteUuid;

static COUNTER: OnceLock<AtomicU64> = OnceLock::new();

fn counter() -> &'static AtomicU64 {
    COUNTER.get_or_init(|| AtomicU64::new(current_time_ms()))
}

/// Milliseconds since the Unix epoch.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Mints the next write uuid.
pub fn next_write_uuid() -> WriteUuid {
    let mut bytes: [u8; 16] = rand::random();
    let n = counter().fetch_add(1, Ordering::Relaxed);
    bytes[8..].copy_from_slice(&n.to_be_bytes());
    WriteUuid::from_bytes(bytes)
}
