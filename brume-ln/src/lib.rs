//! Incoming-payment relay state machines.
//!
//! Two state machines handle HTLC arrivals, keyed by
//! [`htlc::FullPaymentTag`]:
//!
//! - [`receiver::IncomingReceiver`] merges multipart payments against a
//!   local invoice and fulfills or fails the whole set atomically.
//! - [`relayer::TrampolineRelayer`] forwards an aggregated incoming set
//!   to a further payee and binds the incoming fate to the outgoing
//!   attempt: incoming parts are never fulfilled before a preimage is
//!   known from the outgoing side.
//!
//! Both react to [`htlc::InFlightPayments`] snapshots delivered as
//! messages; [`manager::IncomingPaymentManager`] owns their lifecycles.

/// HTLC-level failure messages.
pub mod failure;
/// The HTLC stream model: tags, parts, snapshots.
pub mod htlc;
/// FSM lifecycle management and the relay mailbox task.
pub mod manager;
/// The size-bounded preimage memo.
pub mod preimage_cache;
/// The local multipart receiver.
pub mod receiver;
/// The atomic trampoline relayer.
pub mod relayer;
/// The payment-tag onion TLV.
pub mod tlv;
/// Storage, channel and outgoing-sender ports.
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;
