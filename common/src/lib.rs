//! Shared leaf types and utilities used across the brume workspace.
//!
//! This crate must stay small and dependency-light: everything here is
//! either a plain data type, a tokio synchronization helper, or a test
//! utility. Domain logic lives in `brume-chain` and `brume-ln`.

/// The process-wide atomics: chain tip counter and last-disconnect stamp.
pub mod atoms;
/// Commonly used constants.
pub mod constants;
/// `serde` helper for byte arrays which should be hex strings in
/// human-readable formats.
pub mod hexstr_or_bytes;
/// A multi-producer multi-consumer shutdown signal.
pub mod shutdown;
/// Named task handles.
pub mod task;
/// Test-only utilities.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
/// Millisecond timestamps.
pub mod time;
