//! The wallet state machine.
//!
//! One `Wallet` is one logical entity with a single mailbox: the transport
//! delivers [`WalletMessage`]s, the wallet mutates itself and fires
//! requests / events, and nothing inside ever blocks. See
//! [`spawn_wallet_task`] for the standard way to drive it.
//!
//! States: `Disconnected`, `WaitingForTip`, `Syncing`, `Running`. The
//! interesting work happens in `Running`, where script-hash statuses,
//! histories, transactions and Merkle proofs are continuously reconciled
//! against the connected server, and in the sync loop, which walks header
//! chunks from the last checkpoint to the server tip.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::Context;
use bitcoin::{block::Header, Address, OutPoint, Transaction, Txid};
use common::{atoms::block_count, shutdown::ShutdownChannel, task::LxTask};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    chain::{Checkpoint, ChunkAction, HeaderChain, RETARGETING_PERIOD},
    electrum::{
        ElectrumPort, ElectrumRequest, HistoryItem, MerkleProof, ScriptHash,
        WalletMessage,
    },
    keyring::{KeyChain, KeyRing},
    persist::{PersistentData, WalletDb},
};

/// Balances, coin selection, signing.
pub mod spend;

/// Static wallet parameters.
#[derive(Clone, Debug)]
pub struct WalletConfig {
    pub network: bitcoin::Network,
    /// The BIP32 gap limit: how many unused look-ahead keys to maintain
    /// per chain.
    pub swipe_range: u32,
    /// Below this output value a change output is dropped and the excess
    /// donated to fees.
    pub dust_limit_sat: u64,
    pub allow_spend_unconfirmed: bool,
}

impl WalletConfig {
    pub fn new(network: bitcoin::Network) -> Self {
        Self {
            network,
            swipe_range: 10,
            dust_limit_sat: 546,
            allow_spend_unconfirmed: true,
        }
    }
}

/// A (confirmed, unconfirmed) satoshi balance pair.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Balance {
    pub confirmed_sat: u64,
    pub unconfirmed_sat: u64,
}

impl Balance {
    pub fn total_sat(&self) -> u64 {
        self.confirmed_sat + self.unconfirmed_sat
    }
}

/// Emitted on every transition into a ready state distinct from the last
/// one emitted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalletReady {
    pub confirmed_sat: u64,
    pub unconfirmed_sat: u64,
    pub height: u32,
    /// The tip header's timestamp.
    pub timestamp: u32,
}

/// Emitted for each transaction successfully connected to its parents.
#[derive(Clone, Debug)]
pub struct TransactionReceived {
    pub tx: Transaction,
    pub depth: u32,
    pub received_sat: u64,
    pub sent_sat: u64,
    /// Present iff every input of the transaction is ours.
    pub fee_sat: Option<u64>,
    pub wallet_addresses: Vec<Address>,
}

#[derive(Clone, Debug)]
pub enum WalletEvent {
    Ready(WalletReady),
    TransactionReceived(TransactionReceived),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum FsmState {
    Disconnected,
    WaitingForTip,
    Syncing,
    Running,
}

pub struct Wallet {
    config: WalletConfig,
    keyring: KeyRing,
    chain: HeaderChain,
    state: FsmState,

    /// Server-provided history digest per script hash; the empty string
    /// means "address never used".
    status: HashMap<ScriptHash, String>,
    transactions: HashMap<Txid, Transaction>,
    heights: HashMap<Txid, i32>,
    history: HashMap<ScriptHash, Vec<HistoryItem>>,
    proofs: HashMap<Txid, MerkleProof>,
    /// Outpoints reserved away from ordinary coin selection; see
    /// [`Wallet::lock_outpoint`].
    locked_outpoints: HashSet<OutPoint>,

    pending_history_requests: HashSet<ScriptHash>,
    pending_transaction_requests: HashSet<Txid>,
    pending_headers_requests: HashSet<(u32, u32)>,
    /// Transactions waiting for a missing parent.
    pending_transactions: Vec<Transaction>,
    /// Merkle responses waiting for their enclosing header chunk.
    pending_merkle_replays: Vec<(Txid, u32, MerkleProof)>,

    last_ready: Option<WalletReady>,

    port: Arc<dyn ElectrumPort>,
    db: Arc<dyn WalletDb>,
    events: mpsc::UnboundedSender<WalletEvent>,
}

impl Wallet {
    /// Build a wallet from a seed plus whatever the storage layer has:
    /// persisted headers are replayed into the in-memory chain and the
    /// last persisted snapshot is applied.
    pub fn new(
        config: WalletConfig,
        seed: &[u8],
        port: Arc<dyn ElectrumPort>,
        db: Arc<dyn WalletDb>,
        events: mpsc::UnboundedSender<WalletEvent>,
    ) -> anyhow::Result<Self> {
        let data = db.read_persistent_data().unwrap_or_default();

        let account_count = data.account_keys_count.max(config.swipe_range);
        let change_count = data.change_keys_count.max(config.swipe_range);
        let keyring = KeyRing::new(
            seed,
            config.network,
            account_count,
            change_count,
        )?;

        let mut chain = HeaderChain::new(
            config.network,
            Checkpoint::for_network(config.network),
        );
        loop {
            let start = chain.next_chunk_start();
            let headers = db.get_headers(start, RETARGETING_PERIOD);
            if headers.is_empty() {
                break;
            }
            let full = headers.len() == RETARGETING_PERIOD as usize;
            chain
                .add_headers_chunk(start, &headers)
                .context("Stored headers failed validation")?;
            // Already persisted; just drop sealed chunks from the window.
            chain.optimize();
            if !full {
                break;
            }
        }
        if let Some(height) = chain.height() {
            block_count::update(height);
        }

        Ok(Self {
            config,
            keyring,
            chain,
            state: FsmState::Disconnected,
            status: data.status,
            transactions: data.transactions,
            heights: data.heights,
            history: data.history,
            proofs: data.proofs,
            locked_outpoints: data.locked_outpoints,
            pending_history_requests: HashSet::new(),
            pending_transaction_requests: HashSet::new(),
            pending_headers_requests: HashSet::new(),
            pending_transactions: data.pending_transactions,
            pending_merkle_replays: Vec::new(),
            last_ready: None,
            port,
            db,
            events,
        })
    }

    pub fn keyring(&self) -> &KeyRing {
        &self.keyring
    }

    pub fn chain(&self) -> &HeaderChain {
        &self.chain
    }

    /// Hand a signed transaction to the connected server.
    pub fn broadcast(&self, tx: Transaction) {
        self.port
            .request(ElectrumRequest::BroadcastTransaction(tx));
    }

    // --- Message dispatch --- //

    pub fn handle(&mut self, msg: WalletMessage) {
        match msg {
            WalletMessage::Disconnected => self.on_disconnected(),
            WalletMessage::ServerReady => self.on_server_ready(),
            WalletMessage::Tip { height, header } =>
                self.on_tip(height, header),
            WalletMessage::Headers { start, headers } =>
                self.on_headers(start, headers),
            WalletMessage::ScriptHashStatus {
                script_hash,
                status,
            } => self.on_script_hash_status(script_hash, status),
            WalletMessage::History { script_hash, items } =>
                self.on_history(script_hash, items),
            WalletMessage::Transaction { tx } => self.on_transaction(tx),
            WalletMessage::Merkle {
                txid,
                height,
                proof,
            } => self.on_merkle(txid, height, proof),
        }
    }

    // --- Connection lifecycle --- //

    fn on_server_ready(&mut self) {
        if self.state != FsmState::Disconnected {
            debug!("Ignoring ServerReady in {:?}", self.state);
            return;
        }
        self.port.request(ElectrumRequest::HeaderSubscription);
        self.state = FsmState::WaitingForTip;
    }

    /// Every outstanding request is void once the connection drops. Any
    /// script hash whose history was in flight gets its status forgotten
    /// so it is re-queried on reconnect.
    fn on_disconnected(&mut self) {
        for script_hash in self.pending_history_requests.drain() {
            self.status.remove(&script_hash);
        }
        self.pending_transaction_requests.clear();
        self.pending_headers_requests.clear();
        self.pending_merkle_replays.clear();
        self.last_ready = None;
        self.state = FsmState::Disconnected;
        common::atoms::last_disconnect::stamp();
    }

    fn request_disconnect(&mut self) {
        self.port.disconnect();
        self.on_disconnected();
    }

    // --- Header plumbing --- //

    fn on_tip(&mut self, height: u32, header: Header) {
        match self.state {
            FsmState::WaitingForTip =>
                self.on_tip_waiting(height, header),
            FsmState::Running => self.on_tip_running(height, header),
            FsmState::Syncing => debug!("Tip at {height} while syncing"),
            FsmState::Disconnected => (),
        }
    }

    fn on_tip_waiting(&mut self, height: u32, header: Header) {
        let our_height = self.chain.height();

        if Some(height) < our_height {
            info!("Server at {height} is behind us at {our_height:?}");
            self.request_disconnect();
            return;
        }

        match self.chain.tip() {
            None => {
                self.request_next_chunk();
                self.state = FsmState::Syncing;
            }
            Some(tip) if tip.header == header => self.enter_running(),
            Some(_) => {
                self.request_next_chunk();
                self.state = FsmState::Syncing;
            }
        }
    }

    fn on_tip_running(&mut self, height: u32, header: Header) {
        let tip = match self.chain.tip() {
            Some(tip) => *tip,
            None => return,
        };
        if tip.header == header {
            return;
        }

        if height == tip.height + 1
            && header.prev_blockhash == tip.hash()
        {
            match self.chain.add_header(height, header) {
                Ok(_) => {
                    block_count::update(height);
                    self.flush_sealed_chunks();
                    self.persist_and_notify();
                }
                Err(e) => {
                    warn!("Server sent a bad tip: {e}");
                    self.request_disconnect();
                }
            }
        } else if height > tip.height {
            // The server jumped ahead; backfill the gap.
            self.request_next_chunk();
            self.state = FsmState::Syncing;
        } else {
            // Same-height replacement or older header: a potential reorg.
            match self.chain.add_header(height, header) {
                Ok(result) => {
                    debug!("Alternative header at {height}: {result:?}");
                    self.flush_sealed_chunks();
                    self.persist_and_notify();
                }
                Err(e) => {
                    warn!("Server sent an invalid header at {height}: {e}");
                    self.request_disconnect();
                }
            }
        }
    }

    fn request_next_chunk(&mut self) {
        let start = self.chain.next_chunk_start();
        if self
            .pending_headers_requests
            .insert((start, RETARGETING_PERIOD))
        {
            self.port.request(ElectrumRequest::GetHeaders {
                start,
                count: RETARGETING_PERIOD,
            });
        }
    }

    fn on_headers(&mut self, start: u32, headers: Vec<Header>) {
        let was_pending = self
            .pending_headers_requests
            .iter()
            .any(|(s, _)| *s == start);
        self.pending_headers_requests.retain(|(s, _)| *s != start);
        if !was_pending {
            warn!("Unsolicited headers response at {start}");
            return;
        }

        match self.state {
            FsmState::Syncing => self.on_headers_syncing(start, headers),
            FsmState::Running => self.on_headers_running(start, headers),
            _ => (),
        }
    }

    fn on_headers_syncing(&mut self, start: u32, headers: Vec<Header>) {
        if headers.is_empty() {
            // Caught up with the server.
            self.enter_running();
            return;
        }

        let result = if self.chain.is_empty() || start % RETARGETING_PERIOD == 0
        {
            self.chain.add_headers_chunk(start, &headers).map(|_| ())
        } else {
            self.chain.add_headers(start, &headers)
        };

        match result {
            Ok(()) => {
                if let Some(height) = self.chain.height() {
                    block_count::update(height);
                }
                self.flush_sealed_chunks();
                self.request_next_chunk();
            }
            Err(e) => {
                warn!("Header sync failed at {start}: {e}");
                self.request_disconnect();
            }
        }
    }

    /// In `Running`, header responses are chunk backfills for Merkle
    /// proofs whose enclosing header we don't have.
    fn on_headers_running(&mut self, start: u32, headers: Vec<Header>) {
        match self.chain.add_headers_chunk(start, &headers) {
            Ok(ChunkAction::Validated) =>
                self.db.add_headers(start, &headers),
            Ok(_) => self.flush_sealed_chunks(),
            Err(e) => {
                warn!("Backfill chunk at {start} failed validation: {e}");
                self.request_disconnect();
                return;
            }
        }

        let end = start + headers.len() as u32;
        let replayable: Vec<(Txid, u32, MerkleProof)> = {
            let (replay, keep) = self
                .pending_merkle_replays
                .drain(..)
                .partition(|(_, h, _)| (start..end).contains(h));
            self.pending_merkle_replays = keep;
            replay
        };
        for (txid, height, proof) in replayable {
            self.on_merkle(txid, height, proof);
        }
    }

    fn flush_sealed_chunks(&mut self) {
        for chunk in self.chain.optimize() {
            self.db.add_headers(chunk.start, &chunk.headers);
        }
    }

    fn enter_running(&mut self) {
        self.state = FsmState::Running;
        if let Some(height) = self.chain.height() {
            block_count::update(height);
        }
        for script_hash in self.keyring.all_script_hashes() {
            self.port
                .request(ElectrumRequest::ScriptHashSubscription(script_hash));
        }
        info!("Wallet running at height {:?}", self.chain.height());
        self.persist_and_notify();
    }

    // --- Script hash reconciliation --- //

    fn on_script_hash_status(
        &mut self,
        script_hash: ScriptHash,
        status: String,
    ) {
        if self.state != FsmState::Running {
            return;
        }
        let Some((chain_kind, index)) = self.keyring.locate(script_hash)
        else {
            warn!("Ignoring status for unknown script hash {script_hash}");
            return;
        };

        if self.status.get(&script_hash) == Some(&status) {
            // Nothing changed server-side; make sure we aren't missing any
            // transaction bodies for this script hash.
            self.rerequest_missing_txs(script_hash);
            return;
        }

        if status.is_empty() {
            self.status.insert(script_hash, status);
            self.persist_and_notify();
            return;
        }

        self.status.insert(script_hash, status);
        self.pending_history_requests.insert(script_hash);
        self.port
            .request(ElectrumRequest::GetScriptHashHistory(script_hash));

        // If the just-used key was the last one of its chain, derive one
        // more so the unused look-ahead stays at `swipe_range`.
        if index + 1 == self.keyring.key_count(chain_kind) {
            match self.keyring.derive_next(chain_kind) {
                Ok(key) => {
                    let script_hash = key.script_hash;
                    self.port.request(
                        ElectrumRequest::ScriptHashSubscription(script_hash),
                    );
                }
                Err(e) => warn!("Failed to extend {chain_kind:?}: {e:#}"),
            }
        }
    }

    fn rerequest_missing_txs(&mut self, script_hash: ScriptHash) {
        let missing: Vec<Txid> = self
            .history
            .get(&script_hash)
            .map(|items| {
                items
                    .iter()
                    .map(|item| item.txid)
                    .filter(|txid| self.is_tx_missing(txid))
                    .collect()
            })
            .unwrap_or_default();
        for txid in missing {
            self.pending_transaction_requests.insert(txid);
            self.port.request(ElectrumRequest::GetTransaction(txid));
        }
    }

    fn is_tx_missing(&self, txid: &Txid) -> bool {
        !self.transactions.contains_key(txid)
            && !self.pending_transaction_requests.contains(txid)
            && !self
                .pending_transactions
                .iter()
                .any(|tx| tx.compute_txid() == *txid)
    }

    fn on_history(&mut self, script_hash: ScriptHash, items: Vec<HistoryItem>) {
        if self.state != FsmState::Running {
            return;
        }
        if !self.keyring.contains(script_hash) {
            warn!("Ignoring history for unknown script hash {script_hash}");
            return;
        }
        self.pending_history_requests.remove(&script_hash);

        // Items we knew about but the server no longer lists. Keeping them
        // prevents an unconfirmed self-sent tx from vanishing before the
        // server reflects it.
        let old = self.history.get(&script_hash).cloned().unwrap_or_default();
        let shadow: Vec<HistoryItem> = old
            .iter()
            .filter(|prior| !items.iter().any(|it| it.txid == prior.txid))
            .copied()
            .collect();

        for item in &items {
            let prior_height = self.heights.insert(item.txid, item.height);

            if self.is_tx_missing(&item.txid) {
                self.pending_transaction_requests.insert(item.txid);
                self.port
                    .request(ElectrumRequest::GetTransaction(item.txid));
            }

            if item.height > 0 {
                // A height change for a known tx means our proof (if any)
                // is for the wrong block now.
                if prior_height != Some(item.height) {
                    self.proofs.remove(&item.txid);
                }
                if !self.proofs.contains_key(&item.txid) {
                    self.port.request(ElectrumRequest::GetMerkle {
                        txid: item.txid,
                        height: item.height as u32,
                    });
                }
            }
        }

        let mut merged = items;
        merged.extend(shadow);
        self.history.insert(script_hash, merged);
        self.persist_and_notify();
    }

    // --- Transactions --- //

    fn on_transaction(&mut self, tx: Transaction) {
        if self.state != FsmState::Running {
            return;
        }
        let txid = tx.compute_txid();
        self.pending_transaction_requests.remove(&txid);
        if self.transactions.contains_key(&txid) {
            return;
        }

        let mut events = Vec::new();
        if let Some(event) = self.try_connect_transaction(tx.clone()) {
            events.push(event);
            // Accepting one tx may unblock parked children; iterate to a
            // fixpoint.
            loop {
                let mut progressed = false;
                let parked = std::mem::take(&mut self.pending_transactions);
                for parked_tx in parked {
                    match self.try_connect_transaction(parked_tx.clone()) {
                        Some(event) => {
                            events.push(event);
                            progressed = true;
                        }
                        None => self.pending_transactions.push(parked_tx),
                    }
                }
                if !progressed {
                    break;
                }
            }
        } else {
            debug!("Parking tx {txid} until its parents arrive");
            self.pending_transactions.push(tx);
        }

        self.persist_and_notify();
        for event in events {
            let _ = self
                .events
                .send(WalletEvent::TransactionReceived(event));
        }
    }

    /// Accept `tx` if every input we own has a known parent; returns the
    /// event to publish.
    fn try_connect_transaction(
        &mut self,
        tx: Transaction,
    ) -> Option<TransactionReceived> {
        let delta = self.compute_transaction_delta(&tx)?;
        let txid = tx.compute_txid();
        let wallet_addresses = tx
            .output
            .iter()
            .filter_map(|txout| {
                let sh = ScriptHash::from_script(&txout.script_pubkey);
                let key = self.keyring.lookup(sh)?;
                Some(self.keyring.address(key))
            })
            .collect();
        let depth = self.depth_of(txid);
        self.transactions.insert(txid, tx.clone());
        Some(TransactionReceived {
            tx,
            depth,
            received_sat: delta.received_sat,
            sent_sat: delta.sent_sat,
            fee_sat: delta.fee_sat,
            wallet_addresses,
        })
    }

    pub(crate) fn depth_of(&self, txid: Txid) -> u32 {
        let height = self.heights.get(&txid).copied().unwrap_or(0);
        if height <= 0 {
            return 0;
        }
        match self.chain.height() {
            Some(tip) => tip.saturating_sub(height as u32) + 1,
            None => 0,
        }
    }

    // --- Merkle proofs --- //

    fn on_merkle(&mut self, txid: Txid, height: u32, proof: MerkleProof) {
        if self.state != FsmState::Running {
            return;
        }

        let header = self
            .chain
            .get(height)
            .map(|indexed| indexed.header)
            .or_else(|| self.db.get_header(height));

        let header = match header {
            Some(header) => header,
            None => {
                // Fetch the enclosing chunk, then replay this message.
                let start = height - height % RETARGETING_PERIOD;
                if self
                    .pending_headers_requests
                    .insert((start, RETARGETING_PERIOD))
                {
                    self.port.request(ElectrumRequest::GetHeaders {
                        start,
                        count: RETARGETING_PERIOD,
                    });
                }
                self.pending_merkle_replays.push((txid, height, proof));
                return;
            }
        };

        if proof.expected_root(txid) == header.merkle_root {
            self.proofs.insert(txid, proof);
            self.persist_and_notify();
        } else {
            warn!("Bad Merkle proof for {txid} at {height}; disconnecting");
            self.forget_transaction(txid);
            self.request_disconnect();
        }
    }

    fn forget_transaction(&mut self, txid: Txid) {
        self.transactions.remove(&txid);
        self.heights.remove(&txid);
        self.proofs.remove(&txid);
        self.pending_transactions
            .retain(|tx| tx.compute_txid() != txid);
        for items in self.history.values_mut() {
            items.retain(|item| item.txid != txid);
        }
    }

    // --- Persistence & readiness --- //

    fn snapshot(&self) -> PersistentData {
        PersistentData {
            account_keys_count: self.keyring.key_count(KeyChain::Account),
            change_keys_count: self.keyring.key_count(KeyChain::Change),
            status: self.status.clone(),
            transactions: self.transactions.clone(),
            heights: self.heights.clone(),
            history: self.history.clone(),
            proofs: self.proofs.clone(),
            pending_transactions: self.pending_transactions.clone(),
            locked_outpoints: self.locked_outpoints.clone(),
        }
    }

    /// Whether the wallet has a complete picture of its addresses: no
    /// in-flight history or transaction requests, and at least
    /// `swipe_range * 2` never-used addresses across the status map.
    pub fn is_ready(&self) -> bool {
        let empty_count = self
            .status
            .values()
            .filter(|status| status.is_empty())
            .count() as u32;
        let all_known = self
            .keyring
            .all_script_hashes()
            .iter()
            .all(|sh| self.status.contains_key(sh));
        all_known
            && empty_count >= self.config.swipe_range * 2
            && self.pending_history_requests.is_empty()
            && self.pending_transaction_requests.is_empty()
    }

    /// Persist the current snapshot, then emit [`WalletReady`] if the
    /// ready-set materially changed. Persistence strictly precedes the
    /// event so a crash can never un-announce state.
    fn persist_and_notify(&mut self) {
        self.db.persist(&self.snapshot());

        if self.state != FsmState::Running || !self.is_ready() {
            return;
        }
        let tip = match self.chain.tip() {
            Some(tip) => *tip,
            None => return,
        };
        let balance = self.balance();
        let ready = WalletReady {
            confirmed_sat: balance.confirmed_sat,
            unconfirmed_sat: balance.unconfirmed_sat,
            height: tip.height,
            timestamp: tip.header.time,
        };
        if self.last_ready.as_ref() != Some(&ready) {
            self.last_ready = Some(ready.clone());
            let _ = self.events.send(WalletEvent::Ready(ready));
        }
    }
}

/// Drain the wallet mailbox until shutdown; returns the wallet so callers
/// can inspect or persist final state.
pub fn spawn_wallet_task(
    mut wallet: Wallet,
    mut msg_rx: mpsc::Receiver<WalletMessage>,
    mut shutdown: ShutdownChannel,
) -> LxTask<Wallet> {
    LxTask::spawn_named("spv wallet", async move {
        loop {
            tokio::select! {
                biased;
                () = shutdown.recv() => break,
                maybe_msg = msg_rx.recv() => match maybe_msg {
                    Some(msg) => wallet.handle(msg),
                    None => break,
                },
            }
        }
        info!("spv wallet task shutting down");
        wallet
    })
}
