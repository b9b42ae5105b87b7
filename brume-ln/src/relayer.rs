//! The atomic trampoline relayer.
//!
//! Aggregates incoming trampoline HTLC parts and, once enough value has
//! collected, hands one outgoing multipart attempt to the sender FSM.
//! The incoming fate is bound to the outgoing attempt:
//!
//! - No incoming part is ever fulfilled until a preimage is known from
//!   the outgoing side (or was pre-recorded in the store).
//! - Once a preimage is known, every present incoming part is fulfilled
//!   regardless of any subsequent outgoing failure.
//!
//! Restart reconciliation: the outgoing sender sub-FSM is created
//! unconditionally on entry, so leftover outgoing parts found after a
//! restart drain through the regular event path (`Stopping`), either
//! retrying or failing the incoming side afterwards.

use std::sync::Arc;

use common::atoms::block_count;
use tracing::{debug, info, warn};

use crate::{
    failure::FailureMessage,
    htlc::{
        FullPaymentTag, InFlightPayments, IncomingPart, NodeId,
        PaymentPreimage, TrampolinePayload,
    },
    preimage_cache::PreimageCache,
    traits::{
        ChannelPort, LocalFailureReason, OutgoingEvent, OutgoingFailure,
        OutgoingSender, PaymentBag, SendMultiPart, SenderData,
    },
};

/// The relay parameters this node advertises.
#[derive(Clone, Debug)]
pub struct TrampolineOn {
    pub fee_base_msat: u64,
    pub fee_proportional_millionths: u64,
    /// Exponent of the nonlinear fee component.
    pub exponent: f64,
    /// Exponent applied to `ln(amount)` in the nonlinear fee component.
    pub log_exponent: f64,
    /// Minimum CLTV slack we keep between incoming and outgoing.
    pub cltv_expiry_delta: u32,
    pub minimum_msat: u64,
}

impl TrampolineOn {
    /// The fee required to relay `amount_msat`: an affine part plus a
    /// power/log term that grows with the amount.
    pub fn relay_fee_msat(&self, amount_msat: u64) -> u64 {
        let linear = self.fee_base_msat
            + amount_msat * self.fee_proportional_millionths / 1_000_000;
        let amount = amount_msat as f64;
        let nonlinear =
            amount.powf(self.exponent) + amount.ln().powf(self.log_exponent);
        linear + nonlinear.ceil() as u64
    }
}

#[derive(Clone, Debug)]
enum SendingPhase {
    /// The outgoing attempt toward `payee` is live.
    Processing { payee: NodeId },
    /// Leftover outgoing parts are draining; retry the relay afterwards
    /// or give up.
    Stopping { retry: bool },
    /// A preimage is known; leftovers fulfill as they arrive.
    Revealed { preimage: PaymentPreimage },
}

#[derive(Clone, Debug)]
enum RelayResolution {
    Revealed(PaymentPreimage),
    Aborted(FailureMessage),
}

#[derive(Clone, Debug)]
enum RelayerState {
    Receiving,
    Sending(SendingPhase),
    Finalizing(RelayResolution),
    Shutdown,
}

pub struct TrampolineRelayer {
    tag: FullPaymentTag,
    state: RelayerState,
    on: TrampolineOn,
    bag: Arc<dyn PaymentBag>,
    preimages: Arc<PreimageCache>,
    channels: Arc<dyn ChannelPort>,
    sender: Arc<dyn OutgoingSender>,

    /// The last snapshot seen, replayed when a drain completes.
    last_snapshot: InFlightPayments,
    /// Cached from the inner payload for earnings accounting.
    amount_to_forward_msat: Option<u64>,
    incoming_total_msat: u64,
    payee: Option<NodeId>,
    earnings_recorded: bool,
}

impl TrampolineRelayer {
    pub fn new(
        tag: FullPaymentTag,
        on: TrampolineOn,
        bag: Arc<dyn PaymentBag>,
        preimages: Arc<PreimageCache>,
        channels: Arc<dyn ChannelPort>,
        sender: Arc<dyn OutgoingSender>,
    ) -> Self {
        // Unconditional: a restart may find leftover outgoing parts that
        // only the sender sub-FSM can drain.
        sender.create(tag);
        Self {
            tag,
            state: RelayerState::Receiving,
            on,
            bag,
            preimages,
            channels,
            sender,
            last_snapshot: InFlightPayments::default(),
            amount_to_forward_msat: None,
            incoming_total_msat: 0,
            payee: None,
            earnings_recorded: false,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self.state, RelayerState::Shutdown)
    }

    pub fn on_snapshot(&mut self, inflight: &InFlightPayments) {
        self.last_snapshot = inflight.clone();
        self.process();
    }

    /// The armed `CMDTimeout` fired.
    pub fn on_timeout(&mut self) {
        let outgoing_empty =
            self.last_snapshot.outgoing_parts(&self.tag).is_empty();
        if matches!(self.state, RelayerState::Receiving) && outgoing_empty {
            let parts =
                self.last_snapshot.incoming_parts(&self.tag).to_vec();
            self.abort(FailureMessage::PaymentTimeout, &parts);
        }
    }

    pub fn on_outgoing_event(&mut self, event: OutgoingEvent) {
        match (self.state.clone(), event) {
            // A preimage always wins, even over an earlier abort.
            (_, OutgoingEvent::Preimage { preimage, data }) =>
                self.reveal_from_sender(preimage, data),

            (
                RelayerState::Sending(SendingPhase::Processing { .. }),
                OutgoingEvent::Failed { data },
            ) => {
                let failure = self.select_failure(&data);
                let parts =
                    self.last_snapshot.incoming_parts(&self.tag).to_vec();
                self.abort(failure, &parts);
            }

            (
                RelayerState::Sending(SendingPhase::Stopping { retry: true }),
                OutgoingEvent::Failed { .. },
            ) => {
                debug!("Leftover outgoing drained; retrying the relay");
                self.state = RelayerState::Receiving;
                self.process();
            }

            (
                RelayerState::Sending(SendingPhase::Stopping {
                    retry: false,
                }),
                OutgoingEvent::Failed { data },
            ) => {
                let failure = self.select_failure(&data);
                let parts =
                    self.last_snapshot.incoming_parts(&self.tag).to_vec();
                self.abort(failure, &parts);
            }

            // Already revealed or finalized; late failures are noise.
            (_, OutgoingEvent::Failed { .. }) => (),
        }
    }

    // --- Snapshot processing --- //

    fn process(&mut self) {
        let parts = self.last_snapshot.incoming_parts(&self.tag).to_vec();
        let outgoing = self.last_snapshot.outgoing_parts(&self.tag).to_vec();

        self.incoming_total_msat =
            parts.iter().map(|part| part.add.amount_msat).sum();
        if let Some(fwd) =
            parts.first().and_then(|part| part.forward.as_ref())
        {
            self.amount_to_forward_msat =
                Some(fwd.inner.amount_to_forward_msat);
        }

        match self.state.clone() {
            RelayerState::Receiving =>
                self.process_receiving(&parts, outgoing.is_empty()),
            RelayerState::Sending(SendingPhase::Revealed { preimage }) => {
                for part in &parts {
                    self.channels.fulfill(&part.add, preimage);
                }
                if parts.is_empty() && outgoing.is_empty() {
                    self.state = RelayerState::Shutdown;
                }
            }
            RelayerState::Sending(_) => (),
            RelayerState::Finalizing(resolution) => {
                if parts.is_empty() {
                    self.state = RelayerState::Shutdown;
                    return;
                }
                match resolution {
                    RelayResolution::Revealed(preimage) =>
                        for part in &parts {
                            self.channels.fulfill(&part.add, preimage);
                        },
                    RelayResolution::Aborted(failure) =>
                        for part in &parts {
                            self.channels.fail(&part.add, Some(&failure));
                        },
                }
            }
            RelayerState::Shutdown => (),
        }
    }

    fn process_receiving(
        &mut self,
        parts: &[IncomingPart],
        outgoing_empty: bool,
    ) {
        if parts.is_empty() && outgoing_empty {
            self.state = RelayerState::Shutdown;
            return;
        }

        // A pre-recorded preimage (e.g. we fulfilled before a crash)
        // settles everything immediately.
        if let Some(preimage) = self.preimages.get(self.tag.payment_hash) {
            for part in parts {
                self.channels.fulfill(&part.add, preimage);
            }
            self.state = RelayerState::Finalizing(
                RelayResolution::Revealed(preimage),
            );
            return;
        }

        // The sender's declared total is the collection target; whether
        // what we collected actually clears our fee is for validation.
        let collected_enough = parts
            .first()
            .map(|part| {
                self.incoming_total_msat >= part.outer.total_amount_msat
            })
            .unwrap_or(false);

        match (collected_enough, outgoing_empty) {
            (true, true) => match self.validate(parts) {
                Err(failure) => self.abort(failure, parts),
                Ok(cmd) => {
                    self.payee = Some(cmd.payee);
                    info!(
                        "Relaying {} msat of {:?}",
                        cmd.total_amount_msat, self.tag.payment_hash,
                    );
                    self.sender.send(cmd.clone());
                    self.state = RelayerState::Sending(
                        SendingPhase::Processing { payee: cmd.payee },
                    );
                }
            },
            // Restart: leftovers must drain before we retry.
            (true, false) =>
                self.state = RelayerState::Sending(SendingPhase::Stopping {
                    retry: true,
                }),
            // Pathological restart: not enough incoming left to retry.
            (false, false) =>
                self.state = RelayerState::Sending(SendingPhase::Stopping {
                    retry: false,
                }),
            (false, true) => (), // keep collecting
        }
    }

    /// The relay validation table. Any failure here aborts the whole
    /// incoming set with the listed message.
    fn validate(
        &self,
        parts: &[IncomingPart],
    ) -> Result<SendMultiPart, FailureMessage> {
        let height = block_count::get();
        let reject = FailureMessage::IncorrectOrUnknownPaymentDetails {
            amount_msat: self.incoming_total_msat,
            height,
        };

        let mut forwards = Vec::with_capacity(parts.len());
        for part in parts {
            match &part.forward {
                Some(forward) => forwards.push(forward),
                None => return Err(FailureMessage::TemporaryNodeFailure),
            }
        }
        let inner: &TrampolinePayload = &forwards[0].inner;

        let outer_total = parts[0].outer.total_amount_msat;
        if parts
            .iter()
            .any(|part| part.outer.total_amount_msat != outer_total)
        {
            return Err(reject);
        }

        if forwards.iter().any(|fwd| {
            fwd.inner.amount_to_forward_msat != inner.amount_to_forward_msat
        }) {
            return Err(reject);
        }

        if inner.invoice_features.is_some() && inner.payment_secret.is_none()
        {
            return Err(FailureMessage::TemporaryNodeFailure);
        }

        let forward = inner.amount_to_forward_msat;
        let collected_fee =
            self.incoming_total_msat.saturating_sub(forward);
        if collected_fee < self.on.relay_fee_msat(forward) {
            return Err(FailureMessage::TrampolineFeeInsufficient);
        }

        let min_incoming_cltv = parts
            .iter()
            .map(|part| part.add.cltv_expiry)
            .min()
            .unwrap_or(0);
        let slack =
            min_incoming_cltv.saturating_sub(inner.outgoing_cltv);
        if slack < self.on.cltv_expiry_delta {
            return Err(FailureMessage::TrampolineExpiryTooSoon);
        }
        if inner.outgoing_cltv <= height {
            return Err(FailureMessage::TrampolineExpiryTooSoon);
        }

        if forward < self.on.minimum_msat {
            return Err(FailureMessage::TemporaryNodeFailure);
        }

        if parts.iter().any(|part| {
            !self.channels.is_operational(part.add.channel_id)
        }) {
            return Err(FailureMessage::TemporaryNodeFailure);
        }

        // Don't route the relay back out through whoever routed it in.
        let mut excluded_peers: Vec<NodeId> = parts
            .iter()
            .filter_map(|part| {
                self.channels.channel_peer(part.add.channel_id)
            })
            .collect();
        excluded_peers.sort_by_key(|peer| peer.0);
        excluded_peers.dedup();

        Ok(SendMultiPart {
            tag: self.tag,
            payee: inner.outgoing_node_id,
            total_amount_msat: forward,
            payment_secret: inner.payment_secret,
            invoice_features: inner.invoice_features.clone(),
            final_cltv_expiry: inner.outgoing_cltv,
            max_route_cltv_delta: slack,
            excluded_peers,
            onion_to_forward: Some(forwards[0].packet.clone()),
        })
    }

    // --- Resolution --- //

    fn reveal_from_sender(
        &mut self,
        preimage: PaymentPreimage,
        data: SenderData,
    ) {
        // Preimage persistence strictly precedes any CMD_FULFILL_HTLC.
        self.preimages.put(self.tag.payment_hash, preimage);

        if !self.earnings_recorded {
            let relayed = self.amount_to_forward_msat.unwrap_or(0);
            let reserve =
                self.incoming_total_msat.saturating_sub(relayed);
            let earned_msat = if data.in_flight_parts > 0 {
                reserve.saturating_sub(data.used_fee_msat)
            } else {
                self.on.relay_fee_msat(relayed)
            };
            self.bag.add_relayed_preimage_info(
                &self.tag,
                preimage,
                relayed,
                earned_msat,
            );
            self.earnings_recorded = true;
        }

        let parts = self.last_snapshot.incoming_parts(&self.tag).to_vec();
        for part in &parts {
            self.channels.fulfill(&part.add, preimage);
        }
        info!("Trampoline revealed for {:?}", self.tag.payment_hash);

        // A late reveal overrides an earlier abort; otherwise stay in
        // SENDING so incoming leftovers fulfill as they arrive.
        self.state = match self.state {
            RelayerState::Finalizing(_) | RelayerState::Shutdown =>
                RelayerState::Finalizing(RelayResolution::Revealed(preimage)),
            _ => RelayerState::Sending(SendingPhase::Revealed { preimage }),
        };
    }

    fn abort(&mut self, failure: FailureMessage, parts: &[IncomingPart]) {
        for part in parts {
            self.channels.fail(&part.add, Some(&failure));
        }
        warn!("Relay aborted for {:?}: {failure:?}", self.tag.payment_hash);
        self.state =
            RelayerState::Finalizing(RelayResolution::Aborted(failure));
    }

    /// Pick the failure to send upstream after a final outgoing failure:
    /// prefer what the final node said, then any remote failure, then
    /// translate a local "no routes" into a fee problem the upstream
    /// sender can retry around.
    fn select_failure(&self, data: &SenderData) -> FailureMessage {
        let from_payee = data.failures.iter().find_map(|failure| {
            match failure {
                OutgoingFailure::Remote { origin, failure }
                    if Some(*origin) == self.payee =>
                    Some(failure.clone()),
                _ => None,
            }
        });
        if let Some(failure) = from_payee {
            return failure;
        }

        let any_remote = data.failures.iter().find_map(|failure| {
            match failure {
                OutgoingFailure::Remote { failure, .. } =>
                    Some(failure.clone()),
                _ => None,
            }
        });
        if let Some(failure) = any_remote {
            return failure;
        }

        let no_routes = data.failures.iter().any(|failure| {
            matches!(
                failure,
                OutgoingFailure::Local(LocalFailureReason::NoRoutesFound),
            )
        });
        if no_routes {
            return FailureMessage::TrampolineFeeInsufficient;
        }

        FailureMessage::TemporaryNodeFailure
    }
}

#[cfg(test)]
mod test {
    use common::atoms::block_count;

    use super::*;
    use crate::htlc::PaymentTagKind;
    use crate::testing::{
        inner_payload, node_id, outgoing_part, preimage, tag,
        trampoline_part, ChannelCommand, MemoryBag, RecordingChannels,
        RecordingSender,
    };

    struct Setup {
        relayer: TrampolineRelayer,
        bag: Arc<MemoryBag>,
        channels: Arc<RecordingChannels>,
        sender: Arc<RecordingSender>,
        tag: FullPaymentTag,
    }

    fn trampoline_on() -> TrampolineOn {
        TrampolineOn {
            fee_base_msat: 100,
            fee_proportional_millionths: 1000, // 0.1%
            exponent: 0.0,                     // a^0 = 1
            log_exponent: 0.0,                 // ln(a)^0 = 1
            cltv_expiry_delta: 72,
            minimum_msat: 1000,
        }
    }

    fn setup() -> Setup {
        logger::init_for_testing();
        block_count::set_for_testing(100);
        let bag = Arc::new(MemoryBag::default());
        let channels = Arc::new(RecordingChannels::default());
        let sender = Arc::new(RecordingSender::default());
        let tag = tag(PaymentTagKind::Trampoline, 2);
        let preimages = Arc::new(PreimageCache::new(bag.clone(), 64));
        let relayer = TrampolineRelayer::new(
            tag,
            trampoline_on(),
            bag.clone(),
            preimages,
            channels.clone(),
            sender.clone(),
        );
        Setup {
            relayer,
            bag,
            channels,
            sender,
            tag,
        }
    }

    fn snapshot(
        tag: &FullPaymentTag,
        incoming: Vec<crate::htlc::IncomingPart>,
        outgoing: Vec<crate::htlc::OutgoingPart>,
    ) -> InFlightPayments {
        let mut inflight = InFlightPayments::default();
        inflight.incoming.insert(*tag, incoming);
        inflight.outgoing.insert(*tag, outgoing);
        inflight
    }

    // With exponent = log_exponent = 0 the required fee for 1_000_000
    // forwarded is 100 + 1000 + 2 = 1102 msat.

    #[test]
    fn sender_subfsm_is_created_unconditionally() {
        let s = setup();
        assert_eq!(s.sender.created.lock().unwrap().as_slice(), &[s.tag]);
    }

    #[test]
    fn relays_once_collected_and_fulfills_on_reveal() {
        let mut s = setup();
        let inner = inner_payload(1_000_000, 300);
        let parts = vec![
            trampoline_part(&s.tag, 0, 600_000, 1_001_102, 500, inner.clone()),
            trampoline_part(&s.tag, 1, 401_102, 1_001_102, 480, inner.clone()),
        ];

        // First part alone: not enough collected, nothing sent.
        s.relayer.on_snapshot(&snapshot(&s.tag, parts[..1].to_vec(), vec![]));
        assert_eq!(s.sender.sent_count(), 0);

        // Both parts: validation passes and SendMultiPart goes out.
        s.relayer.on_snapshot(&snapshot(&s.tag, parts.clone(), vec![]));
        assert_eq!(s.sender.sent_count(), 1);
        {
            let sent = s.sender.sent.lock().unwrap();
            let cmd = &sent[0];
            assert_eq!(cmd.total_amount_msat, 1_000_000);
            assert_eq!(cmd.payee, inner.outgoing_node_id);
            assert_eq!(cmd.final_cltv_expiry, 300);
            // Slack limited by the smallest incoming CLTV.
            assert_eq!(cmd.max_route_cltv_delta, 180);
        }
        // Nothing fulfilled yet: no preimage known.
        assert!(s.channels.fulfills().is_empty());

        // The outgoing sender reports a preimage: record earnings, then
        // fulfill every incoming part.
        let pre = preimage(2);
        s.relayer.on_outgoing_event(OutgoingEvent::Preimage {
            preimage: pre,
            data: SenderData {
                used_fee_msat: 400,
                in_flight_parts: 2,
                failures: vec![],
            },
        });
        assert_eq!(s.channels.fulfills().len(), 2);
        // Preimage persisted before the fulfills went out.
        assert_eq!(s.bag.get_preimage(s.tag.payment_hash), Some(pre));
        // reserve = 1_001_102 - 1_000_000 = 1102; earned = 1102 - 400.
        assert_eq!(
            s.bag.relay_records.lock().unwrap().as_slice(),
            &[(s.tag, 1_000_000, 702)],
        );
    }

    #[test]
    fn fee_insufficient_aborts_without_sending() {
        let mut s = setup();
        // Incoming 1_001_000 for 1_000_000 forwarded: 1000 msat margin,
        // required 1102.
        let inner = inner_payload(1_000_000, 300);
        let parts = vec![trampoline_part(
            &s.tag,
            0,
            1_001_000,
            1_001_000,
            500,
            inner,
        )];
        s.relayer.on_snapshot(&snapshot(&s.tag, parts, vec![]));

        assert_eq!(s.sender.sent_count(), 0);
        let commands = s.channels.take();
        assert_eq!(commands.len(), 1);
        assert!(matches!(
            &commands[0],
            ChannelCommand::Fail {
                failure: Some(FailureMessage::TrampolineFeeInsufficient),
                ..
            },
        ));
    }

    #[test]
    fn expiry_too_soon_aborts() {
        let mut s = setup();
        // Slack 500 - 450 = 50 < delta 72.
        let inner = inner_payload(1_000_000, 450);
        let parts = vec![trampoline_part(
            &s.tag,
            0,
            1_002_000,
            1_002_000,
            500,
            inner,
        )];
        s.relayer.on_snapshot(&snapshot(&s.tag, parts, vec![]));
        assert!(matches!(
            &s.channels.take()[0],
            ChannelCommand::Fail {
                failure: Some(FailureMessage::TrampolineExpiryTooSoon),
                ..
            },
        ));
    }

    #[test]
    fn disagreeing_totals_reject_with_payment_details() {
        let mut s = setup();
        let inner = inner_payload(1_000_000, 300);
        let parts = vec![
            trampoline_part(&s.tag, 0, 600_000, 1_001_102, 500, inner.clone()),
            trampoline_part(&s.tag, 1, 401_102, 9_999_999, 480, inner),
        ];
        s.relayer.on_snapshot(&snapshot(&s.tag, parts, vec![]));
        match &s.channels.take()[0] {
            ChannelCommand::Fail {
                failure:
                    Some(FailureMessage::IncorrectOrUnknownPaymentDetails {
                        height,
                        ..
                    }),
                ..
            } => assert_eq!(*height, 100),
            other => panic!("Expected payment-details reject: {other:?}"),
        }
    }

    #[test]
    fn features_without_secret_is_a_node_failure() {
        let mut s = setup();
        let mut inner = inner_payload(1_000_000, 300);
        inner.invoice_features = Some(vec![0x02]);
        inner.payment_secret = None;
        let parts = vec![trampoline_part(
            &s.tag,
            0,
            1_002_000,
            1_002_000,
            500,
            inner,
        )];
        s.relayer.on_snapshot(&snapshot(&s.tag, parts, vec![]));
        assert!(matches!(
            &s.channels.take()[0],
            ChannelCommand::Fail {
                failure: Some(FailureMessage::TemporaryNodeFailure),
                ..
            },
        ));
    }

    #[test]
    fn restart_with_outgoing_drains_then_retries() {
        let mut s = setup();
        let inner = inner_payload(1_000_000, 300);
        let parts = vec![trampoline_part(
            &s.tag,
            0,
            1_002_000,
            1_002_000,
            500,
            inner,
        )];

        // Boot snapshot: enough incoming AND leftover outgoing parts.
        s.relayer.on_snapshot(&snapshot(
            &s.tag,
            parts.clone(),
            vec![outgoing_part(500_000)],
        ));
        // Nothing sent, nothing failed: we wait for the drain.
        assert_eq!(s.sender.sent_count(), 0);
        assert!(s.channels.take().is_empty());

        // The leftover outgoing finally fails: re-enter RECEIVING and
        // retry, which fires the relay this time.
        s.relayer.on_snapshot(&snapshot(&s.tag, parts, vec![]));
        s.relayer.on_outgoing_event(OutgoingEvent::Failed {
            data: SenderData::default(),
        });
        assert_eq!(s.sender.sent_count(), 1);
    }

    #[test]
    fn restart_with_outgoing_and_thin_incoming_fails_after_drain() {
        let mut s = setup();
        // Not enough incoming to ever retry.
        let inner = inner_payload(1_000_000, 300);
        let parts = vec![trampoline_part(
            &s.tag,
            0,
            200_000,
            1_002_000,
            500,
            inner,
        )];
        s.relayer.on_snapshot(&snapshot(
            &s.tag,
            parts,
            vec![outgoing_part(500_000)],
        ));
        s.relayer.on_outgoing_event(OutgoingEvent::Failed {
            data: SenderData::default(),
        });
        assert!(matches!(
            &s.channels.take()[0],
            ChannelCommand::Fail {
                failure: Some(FailureMessage::TemporaryNodeFailure),
                ..
            },
        ));
    }

    #[test]
    fn reveal_after_restart_fulfills_incoming() {
        let mut s = setup();
        let inner = inner_payload(1_000_000, 300);
        let parts = vec![trampoline_part(
            &s.tag,
            0,
            1_002_000,
            1_002_000,
            500,
            inner,
        )];
        s.relayer.on_snapshot(&snapshot(
            &s.tag,
            parts,
            vec![outgoing_part(500_000)],
        ));

        // The leftover outgoing completes with a preimage instead of
        // failing: incoming gets fulfilled.
        s.relayer.on_outgoing_event(OutgoingEvent::Preimage {
            preimage: preimage(2),
            data: SenderData {
                used_fee_msat: 0,
                in_flight_parts: 0,
                failures: vec![],
            },
        });
        assert_eq!(s.channels.fulfills().len(), 1);
        // No in-flight data: earnings fall back to the nominal fee.
        assert_eq!(
            s.bag.relay_records.lock().unwrap().as_slice(),
            &[(s.tag, 1_000_000, 1102)],
        );
    }

    #[test]
    fn failure_preference_order() {
        let payee = node_id(0x77);
        let other = node_id(0x33);

        let mut s = setup();
        s.relayer.payee = Some(payee);

        // 1. The final node's failure wins.
        let data = SenderData {
            used_fee_msat: 0,
            in_flight_parts: 0,
            failures: vec![
                OutgoingFailure::Local(LocalFailureReason::NoRoutesFound),
                OutgoingFailure::Remote {
                    origin: other,
                    failure: FailureMessage::TemporaryNodeFailure,
                },
                OutgoingFailure::Remote {
                    origin: payee,
                    failure: FailureMessage::PaymentTimeout,
                },
            ],
        };
        assert_eq!(
            s.relayer.select_failure(&data),
            FailureMessage::PaymentTimeout,
        );

        // 2. Otherwise any remote failure.
        let data = SenderData {
            failures: vec![OutgoingFailure::Remote {
                origin: other,
                failure: FailureMessage::TemporaryNodeFailure,
            }],
            ..SenderData::default()
        };
        assert_eq!(
            s.relayer.select_failure(&data),
            FailureMessage::TemporaryNodeFailure,
        );

        // 3. Local no-routes translates to a retryable fee problem.
        let data = SenderData {
            failures: vec![OutgoingFailure::Local(
                LocalFailureReason::NoRoutesFound,
            )],
            ..SenderData::default()
        };
        assert_eq!(
            s.relayer.select_failure(&data),
            FailureMessage::TrampolineFeeInsufficient,
        );

        // 4. Nothing usable.
        assert_eq!(
            s.relayer.select_failure(&SenderData::default()),
            FailureMessage::TemporaryNodeFailure,
        );
    }

    #[test]
    fn late_reveal_overrides_abort() {
        let mut s = setup();
        let inner = inner_payload(1_000_000, 300);
        let parts = vec![trampoline_part(
            &s.tag,
            0,
            1_002_000,
            1_002_000,
            500,
            inner,
        )];
        s.relayer.on_snapshot(&snapshot(&s.tag, parts.clone(), vec![]));
        assert_eq!(s.sender.sent_count(), 1);

        // The attempt fails: abort.
        s.relayer.on_outgoing_event(OutgoingEvent::Failed {
            data: SenderData::default(),
        });
        assert!(!s.channels.take().is_empty());

        // A preimage still arrives (race with the failure): override to
        // revealed and fulfill the parts still present.
        s.relayer.on_outgoing_event(OutgoingEvent::Preimage {
            preimage: preimage(2),
            data: SenderData::default(),
        });
        s.relayer.on_snapshot(&snapshot(&s.tag, parts, vec![]));
        assert!(!s.channels.fulfills().is_empty());
    }

    #[test]
    fn never_fulfills_before_a_preimage_is_known() {
        let mut s = setup();
        let inner = inner_payload(1_000_000, 300);
        let parts = vec![trampoline_part(
            &s.tag,
            0,
            1_002_000,
            1_002_000,
            500,
            inner,
        )];

        // Through collection, validation, sending: zero fulfills.
        s.relayer.on_snapshot(&snapshot(&s.tag, parts.clone(), vec![]));
        s.relayer.on_snapshot(&snapshot(&s.tag, parts, vec![]));
        assert!(s.channels.fulfills().is_empty());
    }

    #[test]
    fn timeout_with_nothing_outgoing_aborts() {
        let mut s = setup();
        let inner = inner_payload(1_000_000, 300);
        // A single part below the required total.
        let parts = vec![trampoline_part(
            &s.tag,
            0,
            400_000,
            1_002_000,
            500,
            inner,
        )];
        s.relayer.on_snapshot(&snapshot(&s.tag, parts, vec![]));
        s.relayer.on_timeout();
        assert!(matches!(
            &s.channels.take()[0],
            ChannelCommand::Fail {
                failure: Some(FailureMessage::PaymentTimeout),
                ..
            },
        ));
    }

    #[test]
    fn finalizing_shuts_down_when_tag_vanishes() {
        let mut s = setup();
        let inner = inner_payload(100, 300); // below minimum_msat
        let parts = vec![trampoline_part(&s.tag, 0, 5_000, 5_000, 500, inner)];
        s.relayer.on_snapshot(&snapshot(&s.tag, parts, vec![]));
        // Aborted (amount below minimum); once everything drains, gone.
        s.relayer.on_snapshot(&snapshot(&s.tag, vec![], vec![]));
        assert!(s.relayer.is_shutdown());
    }
}
