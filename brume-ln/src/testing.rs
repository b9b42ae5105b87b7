//! Recording fakes and fixture builders for this crate's tests.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use crate::{
    failure::FailureMessage,
    htlc::{
        ChannelId, FinalPayload, FullPaymentTag, IncomingPart, NodeId,
        OutgoingPart, PaymentHash, PaymentPreimage, PaymentSecret,
        PaymentTagKind, TrampolineForward, TrampolinePayload,
        UpdateAddHtlc,
    },
    traits::{
        ChannelPort, OutgoingSender, PaymentBag, PaymentInfo, PaymentStatus,
        SendMultiPart,
    },
};

// --- Fixture builders --- //

pub fn preimage(seed: u8) -> PaymentPreimage {
    PaymentPreimage([seed; 32])
}

pub fn tag(kind: PaymentTagKind, seed: u8) -> FullPaymentTag {
    FullPaymentTag {
        payment_hash: preimage(seed).payment_hash(),
        payment_secret: PaymentSecret([seed.wrapping_add(100); 32]),
        kind,
    }
}

pub fn node_id(seed: u8) -> NodeId {
    let mut bytes = [seed; 33];
    bytes[0] = 0x02;
    NodeId(bytes)
}

pub fn add_htlc(
    tag: &FullPaymentTag,
    id: u64,
    amount_msat: u64,
    cltv_expiry: u32,
) -> UpdateAddHtlc {
    UpdateAddHtlc {
        channel_id: ChannelId([id as u8; 32]),
        id,
        amount_msat,
        payment_hash: tag.payment_hash,
        cltv_expiry,
    }
}

/// A local (final) part of a multipart payment.
pub fn local_part(
    tag: &FullPaymentTag,
    id: u64,
    amount_msat: u64,
    total_amount_msat: u64,
    cltv_expiry: u32,
) -> IncomingPart {
    IncomingPart {
        add: add_htlc(tag, id, amount_msat, cltv_expiry),
        outer: FinalPayload {
            total_amount_msat,
            payment_secret: tag.payment_secret,
        },
        forward: None,
    }
}

/// A trampoline part asking us to forward `inner`.
pub fn trampoline_part(
    tag: &FullPaymentTag,
    id: u64,
    amount_msat: u64,
    total_amount_msat: u64,
    cltv_expiry: u32,
    inner: TrampolinePayload,
) -> IncomingPart {
    IncomingPart {
        add: add_htlc(tag, id, amount_msat, cltv_expiry),
        outer: FinalPayload {
            total_amount_msat,
            payment_secret: tag.payment_secret,
        },
        forward: Some(TrampolineForward {
            inner,
            packet: vec![0xab; 32],
        }),
    }
}

pub fn inner_payload(
    amount_to_forward_msat: u64,
    outgoing_cltv: u32,
) -> TrampolinePayload {
    TrampolinePayload {
        amount_to_forward_msat,
        outgoing_cltv,
        outgoing_node_id: node_id(0x77),
        payment_secret: None,
        invoice_features: None,
    }
}

pub fn outgoing_part(amount_msat: u64) -> OutgoingPart {
    OutgoingPart {
        channel_id: ChannelId([0xee; 32]),
        amount_msat,
        cltv_expiry: 0,
    }
}

// --- MemoryBag --- //

#[derive(Debug, Default)]
pub struct MemoryBag {
    pub preimages: Mutex<HashMap<PaymentHash, PaymentPreimage>>,
    pub infos: Mutex<HashMap<PaymentHash, PaymentInfo>>,
    /// `(hash, received_msat)` per `fulfill_local` call.
    pub fulfills: Mutex<Vec<(PaymentHash, u64)>>,
    /// `(tag, relayed_msat, earned_msat)` per relay record.
    pub relay_records: Mutex<Vec<(FullPaymentTag, u64, u64)>>,
}

impl MemoryBag {
    pub fn insert_invoice(
        &self,
        tag: &FullPaymentTag,
        preimage: PaymentPreimage,
        amount_msat: Option<u64>,
        status: PaymentStatus,
    ) {
        self.infos.lock().unwrap().insert(
            tag.payment_hash,
            PaymentInfo {
                payment_hash: tag.payment_hash,
                payment_secret: tag.payment_secret,
                preimage,
                amount_msat,
                status,
            },
        );
    }
}

impl PaymentBag for MemoryBag {
    fn get_preimage(&self, hash: PaymentHash) -> Option<PaymentPreimage> {
        self.preimages.lock().unwrap().get(&hash).copied()
    }

    fn set_preimage(&self, hash: PaymentHash, preimage: PaymentPreimage) {
        self.preimages.lock().unwrap().insert(hash, preimage);
    }

    fn payment_info(&self, hash: PaymentHash) -> Option<PaymentInfo> {
        self.infos.lock().unwrap().get(&hash).cloned()
    }

    fn fulfill_local(
        &self,
        hash: PaymentHash,
        preimage: PaymentPreimage,
        received_msat: u64,
    ) {
        self.preimages.lock().unwrap().insert(hash, preimage);
        if let Some(info) = self.infos.lock().unwrap().get_mut(&hash) {
            info.status = PaymentStatus::Succeeded;
        }
        self.fulfills.lock().unwrap().push((hash, received_msat));
    }

    fn add_relayed_preimage_info(
        &self,
        tag: &FullPaymentTag,
        _preimage: PaymentPreimage,
        relayed_msat: u64,
        earned_msat: u64,
    ) {
        self.relay_records
            .lock()
            .unwrap()
            .push((*tag, relayed_msat, earned_msat));
    }
}

// --- RecordingChannels --- //

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChannelCommand {
    Fulfill {
        channel_id: ChannelId,
        htlc_id: u64,
        preimage: PaymentPreimage,
    },
    Fail {
        channel_id: ChannelId,
        htlc_id: u64,
        failure: Option<FailureMessage>,
    },
}

#[derive(Debug, Default)]
pub struct RecordingChannels {
    pub commands: Mutex<Vec<ChannelCommand>>,
    pub offline: Mutex<HashSet<ChannelId>>,
    pub peers: Mutex<HashMap<ChannelId, NodeId>>,
}

impl RecordingChannels {
    pub fn take(&self) -> Vec<ChannelCommand> {
        std::mem::take(&mut self.commands.lock().unwrap())
    }

    pub fn fulfills(&self) -> Vec<ChannelCommand> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|cmd| matches!(cmd, ChannelCommand::Fulfill { .. }))
            .cloned()
            .collect()
    }
}

impl ChannelPort for RecordingChannels {
    fn fulfill(&self, add: &UpdateAddHtlc, preimage: PaymentPreimage) {
        self.commands.lock().unwrap().push(ChannelCommand::Fulfill {
            channel_id: add.channel_id,
            htlc_id: add.id,
            preimage,
        });
    }

    fn fail(&self, add: &UpdateAddHtlc, failure: Option<&FailureMessage>) {
        self.commands.lock().unwrap().push(ChannelCommand::Fail {
            channel_id: add.channel_id,
            htlc_id: add.id,
            failure: failure.cloned(),
        });
    }

    fn is_operational(&self, channel_id: ChannelId) -> bool {
        !self.offline.lock().unwrap().contains(&channel_id)
    }

    fn channel_peer(&self, channel_id: ChannelId) -> Option<NodeId> {
        self.peers.lock().unwrap().get(&channel_id).copied()
    }
}

// --- RecordingSender --- //

#[derive(Debug, Default)]
pub struct RecordingSender {
    pub created: Mutex<Vec<FullPaymentTag>>,
    pub sent: Mutex<Vec<SendMultiPart>>,
}

impl RecordingSender {
    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl OutgoingSender for RecordingSender {
    fn create(&self, tag: FullPaymentTag) {
        self.created.lock().unwrap().push(tag);
    }

    fn send(&self, cmd: SendMultiPart) {
        self.sent.lock().unwrap().push(cmd);
    }
}
