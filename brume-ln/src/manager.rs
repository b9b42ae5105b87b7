//! Lifecycle management for the payment state machines.
//!
//! One FSM per [`FullPaymentTag`], created on the first matching part of
//! an [`InFlightPayments`] snapshot and dropped once it reaches
//! `SHUTDOWN`. The manager also owns the `CMDTimeout` bookkeeping: each
//! new part resets the tag's deadline (`replace_work` semantics), and an
//! expired deadline is delivered to the FSM as a timeout message.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use common::{constants, shutdown::ShutdownChannel, task::LxTask};
use tokio::sync::mpsc;
use tracing::info;

use crate::{
    htlc::{FullPaymentTag, InFlightPayments, PaymentTagKind},
    preimage_cache::PreimageCache,
    receiver::IncomingReceiver,
    relayer::{TrampolineOn, TrampolineRelayer},
    traits::{ChannelPort, OutgoingEvent, OutgoingSender, PaymentBag},
};

/// Static parameters shared by every payment FSM.
#[derive(Clone, Debug)]
pub struct RelayParams {
    pub cltv_reject_threshold: u32,
    /// How long a multipart set may keep collecting after its latest
    /// part.
    pub mpp_timeout: Duration,
    pub trampoline: TrampolineOn,
}

enum IncomingFsm {
    Receiver(IncomingReceiver),
    Relayer(TrampolineRelayer),
}

impl IncomingFsm {
    fn on_snapshot(&mut self, inflight: &InFlightPayments) {
        match self {
            Self::Receiver(fsm) => fsm.on_snapshot(inflight),
            Self::Relayer(fsm) => fsm.on_snapshot(inflight),
        }
    }

    fn on_timeout(&mut self, inflight: &InFlightPayments) {
        match self {
            Self::Receiver(fsm) => fsm.on_timeout(inflight),
            Self::Relayer(fsm) => fsm.on_timeout(),
        }
    }

    fn is_shutdown(&self) -> bool {
        match self {
            Self::Receiver(fsm) => fsm.is_shutdown(),
            Self::Relayer(fsm) => fsm.is_shutdown(),
        }
    }
}

pub struct IncomingPaymentManager {
    params: RelayParams,
    bag: Arc<dyn PaymentBag>,
    preimages: Arc<PreimageCache>,
    channels: Arc<dyn ChannelPort>,
    sender: Arc<dyn OutgoingSender>,

    fsms: HashMap<FullPaymentTag, IncomingFsm>,
    /// Part counts at the last snapshot, for timeout resets.
    parts_seen: HashMap<FullPaymentTag, usize>,
    deadlines: HashMap<FullPaymentTag, Instant>,
    last_snapshot: InFlightPayments,
}

impl IncomingPaymentManager {
    pub fn new(
        params: RelayParams,
        bag: Arc<dyn PaymentBag>,
        channels: Arc<dyn ChannelPort>,
        sender: Arc<dyn OutgoingSender>,
    ) -> Self {
        let preimages = Arc::new(PreimageCache::new(bag.clone(), 512));
        Self {
            params,
            bag,
            preimages,
            channels,
            sender,
            fsms: HashMap::new(),
            parts_seen: HashMap::new(),
            deadlines: HashMap::new(),
            last_snapshot: InFlightPayments::default(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.fsms.len()
    }

    pub fn on_snapshot(&mut self, inflight: &InFlightPayments) {
        self.last_snapshot = inflight.clone();
        let now = Instant::now();

        for tag in inflight.all_tags() {
            self.ensure_fsm(tag);
            let parts = inflight.incoming_parts(&tag).len();
            let seen = self.parts_seen.entry(tag).or_insert(0);
            if parts > *seen {
                *seen = parts;
                // A fresh part re-arms the timeout, replacing any
                // previously scheduled one.
                self.deadlines
                    .insert(tag, now + self.params.mpp_timeout);
            }
        }

        for fsm in self.fsms.values_mut() {
            fsm.on_snapshot(inflight);
        }
        self.reap();
    }

    /// Drive expired deadlines. Called from the mailbox task's tick.
    pub fn on_tick(&mut self, now: Instant) {
        let expired: Vec<FullPaymentTag> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in expired {
            self.deadlines.remove(&tag);
            if let Some(fsm) = self.fsms.get_mut(&tag) {
                fsm.on_timeout(&self.last_snapshot);
            }
        }
        self.reap();
    }

    pub fn on_outgoing_event(
        &mut self,
        tag: FullPaymentTag,
        event: OutgoingEvent,
    ) {
        if let Some(IncomingFsm::Relayer(relayer)) = self.fsms.get_mut(&tag)
        {
            relayer.on_outgoing_event(event);
        }
        self.reap();
    }

    fn ensure_fsm(&mut self, tag: FullPaymentTag) {
        self.fsms.entry(tag).or_insert_with(|| match tag.kind {
            PaymentTagKind::Local =>
                IncomingFsm::Receiver(IncomingReceiver::new(
                    tag,
                    self.params.cltv_reject_threshold,
                    self.bag.clone(),
                    self.preimages.clone(),
                    self.channels.clone(),
                )),
            PaymentTagKind::Trampoline =>
                IncomingFsm::Relayer(TrampolineRelayer::new(
                    tag,
                    self.params.trampoline.clone(),
                    self.bag.clone(),
                    self.preimages.clone(),
                    self.channels.clone(),
                    self.sender.clone(),
                )),
        });
    }

    /// Deregister everything that reached SHUTDOWN.
    fn reap(&mut self) {
        let gone: Vec<FullPaymentTag> = self
            .fsms
            .iter()
            .filter(|(_, fsm)| fsm.is_shutdown())
            .map(|(tag, _)| *tag)
            .collect();
        for tag in gone {
            self.fsms.remove(&tag);
            self.parts_seen.remove(&tag);
            self.deadlines.remove(&tag);
        }
    }
}

/// Messages delivered to the relay mailbox.
#[derive(Debug)]
pub enum RelayMessage {
    /// A fresh in-flight snapshot from the channel layer.
    Snapshot(InFlightPayments),
    /// A report from the outgoing sender sub-FSM.
    Outgoing {
        tag: FullPaymentTag,
        event: OutgoingEvent,
    },
}

/// Standard mailbox size for the relay task.
pub const RELAY_MAILBOX_SIZE: usize = constants::DEFAULT_CHANNEL_SIZE;

/// Drain the relay mailbox until shutdown, ticking timeouts once a
/// second.
pub fn spawn_relay_task(
    mut manager: IncomingPaymentManager,
    mut msg_rx: mpsc::Receiver<RelayMessage>,
    mut shutdown: ShutdownChannel,
) -> LxTask<()> {
    LxTask::spawn_named("incoming payment relay", async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                biased;
                () = shutdown.recv() => break,
                maybe_msg = msg_rx.recv() => match maybe_msg {
                    Some(RelayMessage::Snapshot(inflight)) =>
                        manager.on_snapshot(&inflight),
                    Some(RelayMessage::Outgoing { tag, event }) =>
                        manager.on_outgoing_event(tag, event),
                    None => break,
                },
                _ = tick.tick() => manager.on_tick(Instant::now()),
            }
        }
        info!("incoming payment relay shutting down");
    })
}
