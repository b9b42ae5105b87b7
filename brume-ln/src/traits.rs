//! The ports the payment state machines talk through.
//!
//! Storage, channels and the outgoing multipart sender are external
//! collaborators. Everything here is fire-and-forget from the state
//! machines' point of view; implementations queue the work on their own
//! executors.

use crate::{
    failure::FailureMessage,
    htlc::{
        ChannelId, FullPaymentTag, NodeId, PaymentHash, PaymentPreimage,
        PaymentSecret, UpdateAddHtlc,
    },
};

// --- Storage --- //

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
}

/// A locally issued invoice, resolved by the storage layer. Since we
/// generated the invoice, its preimage is known from day one.
#[derive(Clone, Debug)]
pub struct PaymentInfo {
    pub payment_hash: PaymentHash,
    pub payment_secret: PaymentSecret,
    pub preimage: PaymentPreimage,
    /// `None` for amount-less invoices.
    pub amount_msat: Option<u64>,
    pub status: PaymentStatus,
}

/// The payment table: preimages, invoices, relay records.
pub trait PaymentBag: Send + Sync {
    fn get_preimage(&self, hash: PaymentHash) -> Option<PaymentPreimage>;

    fn set_preimage(&self, hash: PaymentHash, preimage: PaymentPreimage);

    fn payment_info(&self, hash: PaymentHash) -> Option<PaymentInfo>;

    /// Finalize a locally received payment in a single storage
    /// transaction: index it for search, mark the invoice succeeded with
    /// the received amount, and store the preimage.
    fn fulfill_local(
        &self,
        hash: PaymentHash,
        preimage: PaymentPreimage,
        received_msat: u64,
    );

    /// Record a completed relay: what was forwarded and what we earned.
    fn add_relayed_preimage_info(
        &self,
        tag: &FullPaymentTag,
        preimage: PaymentPreimage,
        relayed_msat: u64,
        earned_msat: u64,
    );
}

// --- Channels --- //

/// Commands toward the channels that HTLC parts arrived on. Channels
/// deduplicate, so re-issuing a command for a part is always safe.
pub trait ChannelPort: Send + Sync {
    /// `CMD_FULFILL_HTLC`.
    fn fulfill(&self, add: &UpdateAddHtlc, preimage: PaymentPreimage);

    /// `CMD_FAIL_HTLC`. With `None` the channel answers the peer with
    /// `IncorrectOrUnknownPaymentDetails(part amount, current height)`.
    fn fail(&self, add: &UpdateAddHtlc, failure: Option<&FailureMessage>);

    fn is_operational(&self, channel_id: ChannelId) -> bool;

    fn channel_peer(&self, channel_id: ChannelId) -> Option<NodeId>;
}

// --- The outgoing multipart sender --- //

/// The command handed to the outgoing sender when a trampoline relay
/// fires.
#[derive(Clone, Debug)]
pub struct SendMultiPart {
    pub tag: FullPaymentTag,
    pub payee: NodeId,
    pub total_amount_msat: u64,
    pub payment_secret: Option<PaymentSecret>,
    pub invoice_features: Option<Vec<u8>>,
    /// The final CLTV from the inner payload.
    pub final_cltv_expiry: u32,
    /// How much CLTV delta the route may consume, limited by the
    /// incoming slack.
    pub max_route_cltv_delta: u32,
    /// Peers that routed the payment to us; channels toward them are
    /// excluded from routing.
    pub excluded_peers: Vec<NodeId>,
    /// The nested onion for the next trampoline node.
    pub onion_to_forward: Option<Vec<u8>>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LocalFailureReason {
    NoRoutesFound,
    RetriesExhausted,
}

#[derive(Clone, Debug)]
pub enum OutgoingFailure {
    /// A failure decrypted from some node along an attempted route.
    Remote {
        origin: NodeId,
        failure: FailureMessage,
    },
    Local(LocalFailureReason),
}

/// What the outgoing sender knows when it reports back.
#[derive(Clone, Debug, Default)]
pub struct SenderData {
    pub used_fee_msat: u64,
    /// Parts still in flight at the time of the report.
    pub in_flight_parts: u32,
    pub failures: Vec<OutgoingFailure>,
}

/// Events delivered from the outgoing sender to the relayer's mailbox.
#[derive(Clone, Debug)]
pub enum OutgoingEvent {
    /// The first preimage observed from any fulfilled outgoing part.
    Preimage {
        preimage: PaymentPreimage,
        data: SenderData,
    },
    /// The whole outgoing attempt failed and nothing is in flight.
    Failed { data: SenderData },
}

/// The relayer's handle on the outgoing multipart sender FSM.
pub trait OutgoingSender: Send + Sync {
    /// Create the sender sub-FSM for `tag`. Called unconditionally on
    /// relayer creation so restart-reconciliation with leftover outgoing
    /// parts works; creating an already-existing sender is a no-op.
    fn create(&self, tag: FullPaymentTag);

    fn send(&self, cmd: SendMultiPart);
}
