//! The local multipart receiver.
//!
//! Created on the first HTLC part matching a [`PaymentTagKind::Local`]
//! tag, fed [`InFlightPayments`] snapshots, and torn down once every
//! related part has resolved. The receiver never sends `CMD_FULFILL_HTLC`
//! before the preimage hit storage, and it retains its chosen failure so
//! later snapshots re-issue identical error bytes.

use std::sync::Arc;

use common::atoms::block_count;
use tracing::{debug, info};

use crate::{
    failure::FailureMessage,
    htlc::{FullPaymentTag, InFlightPayments, IncomingPart, PaymentPreimage},
    preimage_cache::PreimageCache,
    traits::{ChannelPort, PaymentBag, PaymentStatus},
};

#[cfg(doc)]
use crate::htlc::PaymentTagKind;

/// How the incoming set resolved.
#[derive(Clone, Debug)]
pub enum IncomingResolution {
    Revealed(PaymentPreimage),
    /// `None` lets the channel answer with the standard
    /// `IncorrectOrUnknownPaymentDetails(amount, height)`.
    Aborted(Option<FailureMessage>),
}

#[derive(Clone, Debug)]
enum ReceiverState {
    Receiving,
    Finalizing(IncomingResolution),
    Shutdown,
}

pub struct IncomingReceiver {
    tag: FullPaymentTag,
    state: ReceiverState,
    /// Parts whose CLTV is within this many blocks of the chain tip are
    /// too risky to hold.
    cltv_reject_threshold: u32,
    bag: Arc<dyn PaymentBag>,
    preimages: Arc<PreimageCache>,
    channels: Arc<dyn ChannelPort>,
}

impl IncomingReceiver {
    pub fn new(
        tag: FullPaymentTag,
        cltv_reject_threshold: u32,
        bag: Arc<dyn PaymentBag>,
        preimages: Arc<PreimageCache>,
        channels: Arc<dyn ChannelPort>,
    ) -> Self {
        Self {
            tag,
            state: ReceiverState::Receiving,
            cltv_reject_threshold,
            bag,
            preimages,
            channels,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self.state, ReceiverState::Shutdown)
    }

    pub fn on_snapshot(&mut self, inflight: &InFlightPayments) {
        let parts = inflight.incoming_parts(&self.tag);
        match self.state.clone() {
            ReceiverState::Receiving => self.decide(parts),
            ReceiverState::Finalizing(resolution) => {
                if parts.is_empty() {
                    debug!("Receiver done: {:?}", self.tag.payment_hash);
                    self.state = ReceiverState::Shutdown;
                    return;
                }
                // Channels deduplicate; re-issue for whatever is left.
                match resolution {
                    IncomingResolution::Revealed(preimage) =>
                        for part in parts {
                            self.channels.fulfill(&part.add, preimage);
                        },
                    IncomingResolution::Aborted(failure) =>
                        for part in parts {
                            self.channels.fail(&part.add, failure.as_ref());
                        },
                }
            }
            ReceiverState::Shutdown => (),
        }
    }

    /// The armed `CMDTimeout` fired: the multipart set never completed.
    pub fn on_timeout(&mut self, inflight: &InFlightPayments) {
        if matches!(self.state, ReceiverState::Receiving) {
            self.abort(
                Some(FailureMessage::PaymentTimeout),
                inflight.incoming_parts(&self.tag),
            );
        }
    }

    /// The fulfill/abort decision, in strict priority order.
    fn decide(&mut self, parts: &[IncomingPart]) {
        if parts.is_empty() {
            self.state = ReceiverState::Shutdown;
            return;
        }

        // 1. A preimage in the store settles the set even without an
        //    invoice.
        if let Some(preimage) = self.preimages.get(self.tag.payment_hash) {
            return self.fulfill(preimage, parts);
        }

        let info = self
            .bag
            .payment_info(self.tag.payment_hash)
            .filter(|info| info.payment_secret == self.tag.payment_secret);

        // 2. An already-succeeded invoice is an idempotent retry.
        if let Some(info) = &info {
            if info.status == PaymentStatus::Succeeded {
                return self.fulfill(info.preimage, parts);
            }
        }

        // 3. A part too close to expiry endangers the channel; give the
        //    peer nothing to correlate on.
        let height = block_count::get();
        let too_close = parts.iter().any(|part| {
            part.add.cltv_expiry < height + self.cltv_reject_threshold
        });
        if too_close {
            return self.abort(None, parts);
        }

        // 4. The set covers the invoice.
        if let Some(info) = &info {
            if let Some(amount_msat) = info.amount_msat {
                let collected: u64 =
                    parts.iter().map(|part| part.add.amount_msat).sum();
                if collected >= amount_msat {
                    return self.fulfill(info.preimage, parts);
                }
            }
        }

        // 5. Wait for more parts (or the timeout).
    }

    fn fulfill(&mut self, preimage: PaymentPreimage, parts: &[IncomingPart]) {
        let received_msat: u64 =
            parts.iter().map(|part| part.add.amount_msat).sum();

        // Preimage persistence strictly precedes CMD_FULFILL_HTLC.
        self.bag
            .fulfill_local(self.tag.payment_hash, preimage, received_msat);
        self.preimages
            .note_written(self.tag.payment_hash, preimage);

        for part in parts {
            self.channels.fulfill(&part.add, preimage);
        }
        info!(
            "Fulfilled {} parts of {:?}",
            parts.len(),
            self.tag.payment_hash,
        );
        self.state =
            ReceiverState::Finalizing(IncomingResolution::Revealed(preimage));
    }

    fn abort(
        &mut self,
        failure: Option<FailureMessage>,
        parts: &[IncomingPart],
    ) {
        for part in parts {
            self.channels.fail(&part.add, failure.as_ref());
        }
        info!("Aborted {:?}: {failure:?}", self.tag.payment_hash);
        self.state =
            ReceiverState::Finalizing(IncomingResolution::Aborted(failure));
    }
}
