//! The only process-wide mutable state in the workspace.
//!
//! Everything else flows through per-entity state machines so that
//! restart-equivalence stays testable. The two exceptions:
//!
//! - [`block_count`]: the current chain tip height. Written by the wallet
//!   state machine whenever a tip is accepted, read synchronously by the
//!   payment state machines for CLTV checks. Monotonic.
//! - [`last_disconnect`]: wall-clock millis of the most recent server
//!   disconnect, used by reconnect backoff logic.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

static BLOCK_COUNT: AtomicU32 = AtomicU32::new(0);
static LAST_DISCONNECT_MS: AtomicU64 = AtomicU64::new(0);

pub mod block_count {
    use super::*;

    /// The current chain tip height.
    pub fn get() -> u32 {
        BLOCK_COUNT.load(Ordering::Acquire)
    }

    /// Raise the chain tip height. Stale (lower) updates are ignored so the
    /// counter is monotonic even across a reorg to an equal-height chain.
    pub fn update(height: u32) {
        BLOCK_COUNT.fetch_max(height, Ordering::AcqRel);
    }

    /// Test-only: reset the counter so tests can pin a block height.
    pub fn set_for_testing(height: u32) {
        BLOCK_COUNT.store(height, Ordering::Release);
    }
}

pub mod last_disconnect {
    use super::*;
    use crate::time::TimestampMs;

    /// Millis timestamp of the most recent disconnect, 0 if none yet.
    pub fn get() -> u64 {
        LAST_DISCONNECT_MS.load(Ordering::Acquire)
    }

    /// Stamp the current time as the most recent disconnect.
    pub fn stamp() {
        let now_ms = TimestampMs::now().as_i64() as u64;
        LAST_DISCONNECT_MS.store(now_ms, Ordering::Release);
    }
}
