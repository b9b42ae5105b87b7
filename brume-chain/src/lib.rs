//! The Electrum SPV wallet core.
//!
//! A BIP49 (P2SH-wrapped-P2WPKH) wallet backed by Electrum-style servers:
//! a checkpointed header chain, script-hash subscriptions, history and
//! Merkle-proof reconciliation, and coin selection / signing.
//!
//! The wallet is a single-threaded state machine ([`wallet::Wallet`])
//! driven by [`electrum::WalletMessage`]s. Server I/O goes through the
//! [`electrum::ElectrumPort`] trait and persistence through
//! [`persist::WalletDb`]; both are fire-and-forget from the state
//! machine's point of view.

/// The checkpointed block header chain.
pub mod chain;
/// Electrum protocol types and the server port.
pub mod electrum;
/// BIP49 key derivation and script hash mapping.
pub mod keyring;
/// Persistence interfaces.
pub mod persist;
/// The wallet state machine, balances, and spending.
pub mod wallet;

#[cfg(test)]
pub(crate) mod testing;
