//! The HTLC stream model.
//!
//! Every HTLC carries, in an onion TLV, the payment secret plus a tag;
//! [`FullPaymentTag`] is the fingerprint `(payment_hash, payment_secret,
//! kind)` which keys [`InFlightPayments`]. The secret disambiguates
//! distinct concurrent payments sharing a hash, and the kind separates
//! final payments from trampoline relays. All parts of one logical
//! payment share the same tag and survive part-by-part resolution.

use std::{collections::HashMap, fmt};

use anyhow::Context;
use bitcoin::hashes::{sha256, Hash};
use serde::{Deserialize, Serialize};

// --- Newtypes --- //

/// The sha256 image the HTLC is locked to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[derive(Serialize, Deserialize)]
pub struct PaymentHash(
    #[serde(with = "common::hexstr_or_bytes")] pub [u8; 32],
);

/// The secret whose sha256 is a [`PaymentHash`]. Revealing it settles
/// the HTLC.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PaymentPreimage(
    #[serde(with = "common::hexstr_or_bytes")] pub [u8; 32],
);

impl PaymentPreimage {
    pub fn payment_hash(&self) -> PaymentHash {
        PaymentHash(sha256::Hash::hash(&self.0).to_byte_array())
    }
}

/// The invoice-level secret distinguishing concurrent payments which
/// share a payment hash.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PaymentSecret(
    #[serde(with = "common::hexstr_or_bytes")] pub [u8; 32],
);

/// A channel's funding-derived identifier.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ChannelId(
    #[serde(with = "common::hexstr_or_bytes")] pub [u8; 32],
);

/// A remote node's identity key, kept as raw compressed-point bytes;
/// routing and validation of the point happen outside this crate.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct NodeId(#[serde(with = "common::hexstr_or_bytes")] pub [u8; 33]);

// Never log secret material.
impl fmt::Debug for PaymentPreimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PaymentPreimage(..)")
    }
}

impl fmt::Debug for PaymentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PaymentSecret(..)")
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::display(&self.0))
    }
}

// --- Payment tags --- //

/// What role this node plays for an HTLC stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentTagKind {
    /// We are the final recipient.
    Local,
    /// We are paid to extend the payment with our own routing choices.
    Trampoline,
}

/// The fingerprint of one logical payment's HTLC stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct FullPaymentTag {
    pub payment_hash: PaymentHash,
    pub payment_secret: PaymentSecret,
    pub kind: PaymentTagKind,
}

// --- Parts --- //

/// The add-HTLC message as it arrived on a channel.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UpdateAddHtlc {
    pub channel_id: ChannelId,
    pub id: u64,
    pub amount_msat: u64,
    pub payment_hash: PaymentHash,
    /// Absolute block height lock.
    pub cltv_expiry: u32,
}

/// The decrypted outer onion payload of a final hop.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FinalPayload {
    /// The total this multipart payment should add up to.
    pub total_amount_msat: u64,
    pub payment_secret: PaymentSecret,
}

/// The decrypted inner (trampoline) payload.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TrampolinePayload {
    pub amount_to_forward_msat: u64,
    /// Absolute CLTV the outgoing payment must settle by.
    pub outgoing_cltv: u32,
    pub outgoing_node_id: NodeId,
    /// Required whenever `invoice_features` is present.
    pub payment_secret: Option<PaymentSecret>,
    pub invoice_features: Option<Vec<u8>>,
}

/// What a trampoline part asks us to forward.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TrampolineForward {
    pub inner: TrampolinePayload,
    /// The nested onion packet for the next trampoline node.
    pub packet: Vec<u8>,
}

/// One incoming HTLC part: the raw add, its decrypted outer payload,
/// and (for trampoline streams) the nested packet to forward.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct IncomingPart {
    pub add: UpdateAddHtlc,
    pub outer: FinalPayload,
    pub forward: Option<TrampolineForward>,
}

impl IncomingPart {
    pub fn forward(&self) -> anyhow::Result<&TrampolineForward> {
        self.forward
            .as_ref()
            .context("Local part in a trampoline stream")
    }
}

/// One outgoing HTLC part owned by the multipart sender.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OutgoingPart {
    pub channel_id: ChannelId,
    pub amount_msat: u64,
    pub cltv_expiry: u32,
}

// --- The snapshot --- //

/// A consistent view of every HTLC currently in flight, in both
/// directions, delivered to the payment state machines as a message.
#[derive(Clone, Debug, Default)]
pub struct InFlightPayments {
    pub incoming: HashMap<FullPaymentTag, Vec<IncomingPart>>,
    pub outgoing: HashMap<FullPaymentTag, Vec<OutgoingPart>>,
}

impl InFlightPayments {
    pub fn incoming_parts(&self, tag: &FullPaymentTag) -> &[IncomingPart] {
        self.incoming.get(tag).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn outgoing_parts(&self, tag: &FullPaymentTag) -> &[OutgoingPart] {
        self.outgoing.get(tag).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every tag present on either side.
    pub fn all_tags(&self) -> Vec<FullPaymentTag> {
        let mut tags: Vec<FullPaymentTag> =
            self.incoming.keys().chain(self.outgoing.keys()).copied().collect();
        tags.sort_by_key(|tag| (tag.payment_hash, tag.kind as u8));
        tags.dedup();
        tags
    }
}
