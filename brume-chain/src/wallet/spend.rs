//! UTXO derivation, balances, coin selection and signing.
//!
//! Fee estimation signs nothing: candidate transactions carry a 71-byte
//! dummy signature per input so their segwit weight matches the final
//! transaction closely, and `fee = weight * fee_rate_per_kw / 1000`.

use std::collections::VecDeque;

use anyhow::Context;
use bitcoin::{
    absolute::LockTime,
    hashes::Hash,
    script::PushBytesBuf,
    secp256k1::Message,
    sighash::{EcdsaSighashType, SighashCache},
    transaction::Version,
    Amount, CompressedPublicKey, OutPoint, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Witness,
};

use crate::{
    electrum::ScriptHash,
    keyring::KeyChain,
    wallet::{Balance, Wallet},
};

/// Dummy signature length used for fee estimation (DER + sighash flag).
const DUMMY_SIG_LEN: usize = 71;

#[derive(Debug, thiserror::Error)]
pub enum SpendError {
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("requested amount is below the dust limit")]
    AmountBelowDustLimit,
    #[error("signing failed: {0}")]
    Signing(#[from] anyhow::Error),
}

/// A spendable output we own.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub script_pubkey: ScriptBuf,
    pub key_chain: KeyChain,
    pub key_index: u32,
    /// Electrum height convention; `<= 0` means unconfirmed.
    pub height: i32,
}

/// A fully signed transaction plus the fee it pays.
#[derive(Clone, Debug)]
pub struct CompletedTx {
    pub tx: Transaction,
    pub fee_sat: u64,
}

/// What a transaction does to us, see
/// [`Wallet::compute_transaction_delta`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TransactionDelta {
    pub received_sat: u64,
    pub sent_sat: u64,
    /// Present iff every input of the transaction is ours.
    pub fee_sat: Option<u64>,
}

impl Wallet {
    // --- UTXOs and balances --- //

    /// Every unspent output paying one of our script hashes: walk each
    /// script hash's history, take outputs paying it, and drop any
    /// outpoint spent by another known transaction.
    pub fn utxos(&self) -> Vec<Utxo> {
        let mut utxos = Vec::new();
        for script_hash in self.history.keys() {
            utxos.extend(self.utxos_of(*script_hash));
        }
        utxos
    }

    fn utxos_of(&self, script_hash: ScriptHash) -> Vec<Utxo> {
        let Some((key_chain, key_index)) = self.keyring.locate(script_hash)
        else {
            return Vec::new();
        };
        let key = match self.keyring.key(key_chain, key_index) {
            Some(key) => key,
            None => return Vec::new(),
        };

        let mut utxos = Vec::new();
        let items = match self.history.get(&script_hash) {
            Some(items) => items,
            None => return Vec::new(),
        };
        for item in items {
            let Some(tx) = self.transactions.get(&item.txid) else {
                continue;
            };
            for (vout, txout) in tx.output.iter().enumerate() {
                if txout.script_pubkey != key.script_pubkey {
                    continue;
                }
                let outpoint = OutPoint {
                    txid: item.txid,
                    vout: vout as u32,
                };
                if self.is_spent(&outpoint) {
                    continue;
                }
                utxos.push(Utxo {
                    outpoint,
                    value: txout.value,
                    script_pubkey: txout.script_pubkey.clone(),
                    key_chain,
                    key_index,
                    height: self
                        .heights
                        .get(&item.txid)
                        .copied()
                        .unwrap_or(0),
                });
            }
        }
        utxos
    }

    fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.transactions.values().any(|tx| {
            tx.input
                .iter()
                .any(|txin| txin.previous_output == *outpoint)
        })
    }

    // --- Outpoint locking --- //

    /// Reserve an outpoint away from ordinary coin selection, e.g. while
    /// a funding transaction that spends it is held unbroadcast. Locked
    /// outpoints still count toward the balance and [`Wallet::spend_all`]
    /// deliberately sweeps them.
    pub fn lock_outpoint(&mut self, outpoint: OutPoint) {
        if self.locked_outpoints.insert(outpoint) {
            self.persist_and_notify();
        }
    }

    /// Release a reservation made with [`Wallet::lock_outpoint`].
    pub fn unlock_outpoint(&mut self, outpoint: OutPoint) {
        if self.locked_outpoints.remove(&outpoint) {
            self.persist_and_notify();
        }
    }

    pub fn is_locked(&self, outpoint: OutPoint) -> bool {
        self.locked_outpoints.contains(&outpoint)
    }

    pub fn balance(&self) -> Balance {
        Self::balance_of_utxos(self.utxos())
    }

    pub fn balance_of(&self, script_hash: ScriptHash) -> Balance {
        Self::balance_of_utxos(self.utxos_of(script_hash))
    }

    fn balance_of_utxos(utxos: Vec<Utxo>) -> Balance {
        let mut balance = Balance::default();
        for utxo in utxos {
            if utxo.height > 0 {
                balance.confirmed_sat += utxo.value.to_sat();
            } else {
                balance.unconfirmed_sat += utxo.value.to_sat();
            }
        }
        balance
    }

    // --- Transaction deltas --- //

    /// How `tx` affects this wallet, or `None` if some input we own has an
    /// unknown parent (the caller should park the tx and retry later).
    pub fn compute_transaction_delta(
        &self,
        tx: &Transaction,
    ) -> Option<TransactionDelta> {
        let our_inputs: Vec<&TxIn> = tx
            .input
            .iter()
            .filter(|txin| self.is_mine_input(txin))
            .collect();

        let mut sent_sat = 0u64;
        for txin in &our_inputs {
            let parent = self.transactions.get(&txin.previous_output.txid)?;
            let txout = parent
                .output
                .get(txin.previous_output.vout as usize)?;
            sent_sat += txout.value.to_sat();
        }

        let received_sat = tx
            .output
            .iter()
            .filter(|txout| {
                let sh = ScriptHash::from_script(&txout.script_pubkey);
                self.keyring.contains(sh)
            })
            .map(|txout| txout.value.to_sat())
            .sum();

        // A fee can only be computed when every input is ours; then every
        // parent is known and the input total is complete.
        let fee_sat = if our_inputs.len() == tx.input.len() {
            let out_total: u64 =
                tx.output.iter().map(|txout| txout.value.to_sat()).sum();
            Some(sent_sat.saturating_sub(out_total))
        } else {
            None
        };

        Some(TransactionDelta {
            received_sat,
            sent_sat,
            fee_sat,
        })
    }

    /// Input ownership is decided from the witness alone: a P2SH-P2WPKH
    /// spend always reveals `(signature, pubkey)`.
    fn is_mine_input(&self, txin: &TxIn) -> bool {
        public_key_from_input(txin)
            .map(|pk| {
                let script =
                    ScriptBuf::new_p2wpkh(&pk.wpubkey_hash()).to_p2sh();
                self.keyring.contains(ScriptHash::from_script(&script))
            })
            .unwrap_or(false)
    }

    pub(crate) fn input_script_hash(
        &self,
        txin: &TxIn,
    ) -> Option<ScriptHash> {
        let pk = public_key_from_input(txin)?;
        let script = ScriptBuf::new_p2wpkh(&pk.wpubkey_hash()).to_p2sh();
        let sh = ScriptHash::from_script(&script);
        self.keyring.contains(sh).then_some(sh)
    }

    // --- Coin selection --- //

    /// Fund and sign a transaction paying `outputs`.
    ///
    /// Unlocked UTXOs are consumed smallest-first until the stable
    /// condition from the selection loop is met; the change output (if
    /// any) goes to the first unused change key. Fails with
    /// [`SpendError::InsufficientFunds`] or, if the requested total
    /// doesn't clear the dust limit,
    /// [`SpendError::AmountBelowDustLimit`].
    pub fn complete_transaction(
        &self,
        outputs: Vec<TxOut>,
        fee_rate_per_kw: u64,
    ) -> Result<CompletedTx, SpendError> {
        let amount: u64 =
            outputs.iter().map(|txout| txout.value.to_sat()).sum();
        if outputs.is_empty() || amount <= self.config.dust_limit_sat {
            return Err(SpendError::AmountBelowDustLimit);
        }

        let mut usable: Vec<Utxo> = self
            .utxos()
            .into_iter()
            .filter(|utxo| !self.locked_outpoints.contains(&utxo.outpoint))
            .filter(|utxo| {
                self.config.allow_spend_unconfirmed || utxo.height > 0
            })
            .collect();
        usable.sort_by_key(|utxo| (utxo.value, utxo.outpoint));
        let mut usable: VecDeque<Utxo> = usable.into();

        let change_script = self.change_script();
        let dust = self.config.dust_limit_sat;
        let mut selected: Vec<Utxo> = Vec::new();

        let change = loop {
            let total: u64 =
                selected.iter().map(|utxo| utxo.value.to_sat()).sum();
            let fee_no_change =
                self.estimate_fee(&selected, &outputs, None, fee_rate_per_kw);

            if total < amount + fee_no_change {
                match usable.pop_front() {
                    None => return Err(SpendError::InsufficientFunds),
                    Some(utxo) => {
                        selected.push(utxo);
                        continue;
                    }
                }
            }

            if total - fee_no_change <= amount + dust {
                // No room for change; the excess goes to fees.
                break None;
            }

            let fee_with_change = self.estimate_fee(
                &selected,
                &outputs,
                Some(&change_script),
                fee_rate_per_kw,
            );
            if total.saturating_sub(fee_with_change) <= amount + dust {
                match usable.pop_front() {
                    None => break None,
                    Some(utxo) => {
                        selected.push(utxo);
                        continue;
                    }
                }
            }

            break Some(TxOut {
                value: Amount::from_sat(total - amount - fee_with_change),
                script_pubkey: change_script.clone(),
            });
        };

        let total: u64 =
            selected.iter().map(|utxo| utxo.value.to_sat()).sum();
        let mut final_outputs = outputs;
        let fee_sat = match change {
            Some(change_txout) => {
                let fee = total - amount - change_txout.value.to_sat();
                final_outputs.push(change_txout);
                fee
            }
            None => total - amount,
        };

        let tx = self.build_and_sign(&selected, final_outputs)?;
        Ok(CompletedTx { tx, fee_sat })
    }

    /// Drain the whole wallet to `script_pubkey`: the single output's
    /// value is the total balance minus the fee. Unlike
    /// [`Wallet::complete_transaction`] this sweeps the entire UTXO set,
    /// unconfirmed coins and locked outpoints included.
    pub fn spend_all(
        &self,
        script_pubkey: ScriptBuf,
        fee_rate_per_kw: u64,
    ) -> Result<CompletedTx, SpendError> {
        let selected = self.utxos();
        if selected.is_empty() {
            return Err(SpendError::InsufficientFunds);
        }
        let total: u64 =
            selected.iter().map(|utxo| utxo.value.to_sat()).sum();

        let outputs = vec![TxOut {
            value: Amount::from_sat(0),
            script_pubkey,
        }];
        let fee_sat =
            self.estimate_fee(&selected, &outputs, None, fee_rate_per_kw);

        let send_sat = total
            .checked_sub(fee_sat)
            .filter(|send| *send > self.config.dust_limit_sat)
            .ok_or(SpendError::AmountBelowDustLimit)?;

        let mut outputs = outputs;
        outputs[0].value = Amount::from_sat(send_sat);
        let tx = self.build_and_sign(&selected, outputs)?;
        Ok(CompletedTx { tx, fee_sat })
    }

    /// Optimistically apply a transaction we just broadcast: every input
    /// and output we own gets an unconfirmed history entry. The server
    /// authoritatively overwrites this within seconds. Reservations on
    /// the consumed outpoints have served their purpose and are
    /// released.
    pub fn commit_transaction(&mut self, tx: Transaction) {
        let txid = tx.compute_txid();
        for txin in &tx.input {
            self.locked_outpoints.remove(&txin.previous_output);
        }

        let mut touched: Vec<ScriptHash> = tx
            .input
            .iter()
            .filter_map(|txin| self.input_script_hash(txin))
            .collect();
        touched.extend(tx.output.iter().filter_map(|txout| {
            let sh = ScriptHash::from_script(&txout.script_pubkey);
            self.keyring.contains(sh).then_some(sh)
        }));

        for script_hash in touched {
            let items = self.history.entry(script_hash).or_default();
            if !items.iter().any(|item| item.txid == txid) {
                items.push(crate::electrum::HistoryItem {
                    txid,
                    height: 0,
                });
            }
        }
        self.heights.insert(txid, 0);
        self.transactions.insert(txid, tx);
        self.persist_and_notify();
    }

    /// Whether some *other* transaction, confirmed at depth >= 2, spends
    /// one of `tx`'s inputs.
    pub fn is_double_spent(&self, tx: &Transaction) -> bool {
        let txid = tx.compute_txid();
        self.transactions.values().any(|known| {
            let known_txid = known.compute_txid();
            known_txid != txid
                && self.depth_of(known_txid) >= 2
                && known.input.iter().any(|known_in| {
                    tx.input.iter().any(|txin| {
                        txin.previous_output == known_in.previous_output
                    })
                })
        })
    }

    // --- Fee estimation and signing --- //

    fn change_script(&self) -> ScriptBuf {
        let change_keys = self.keyring.keys(KeyChain::Change);
        change_keys
            .iter()
            .find(|key| {
                self.status
                    .get(&key.script_hash)
                    .map(|status| status.is_empty())
                    .unwrap_or(true)
            })
            .or_else(|| change_keys.last())
            .map(|key| key.script_pubkey.clone())
            .unwrap_or_default()
    }

    fn estimate_fee(
        &self,
        selected: &[Utxo],
        outputs: &[TxOut],
        change: Option<&ScriptBuf>,
        fee_rate_per_kw: u64,
    ) -> u64 {
        let mut candidate_outputs = outputs.to_vec();
        if let Some(change_script) = change {
            candidate_outputs.push(TxOut {
                value: Amount::from_sat(0),
                script_pubkey: change_script.clone(),
            });
        }
        let candidate = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: selected.iter().map(|utxo| self.dummy_input(utxo)).collect(),
            output: candidate_outputs,
        };
        candidate.weight().to_wu() * fee_rate_per_kw / 1000
    }

    fn dummy_input(&self, utxo: &Utxo) -> TxIn {
        // Unknown keys can't happen for UTXOs we derived ourselves; the
        // fallback only needs the right byte lengths for weight purposes.
        let (script_sig, pubkey_bytes) =
            match self.keyring.key(utxo.key_chain, utxo.key_index) {
                Some(key) => (
                    redeem_script_sig(&key.redeem_script),
                    key.public_key.to_bytes(),
                ),
                None => (
                    redeem_script_sig(&ScriptBuf::from_bytes(vec![0u8; 22])),
                    [0u8; 33],
                ),
            };
        TxIn {
            previous_output: utxo.outpoint,
            script_sig,
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::from_slice(&[
                &vec![0u8; DUMMY_SIG_LEN][..],
                &pubkey_bytes[..],
            ]),
        }
    }

    fn build_and_sign(
        &self,
        selected: &[Utxo],
        outputs: Vec<TxOut>,
    ) -> Result<Transaction, SpendError> {
        let unsigned = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: selected
                .iter()
                .map(|utxo| TxIn {
                    previous_output: utxo.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
                .collect(),
            output: outputs,
        };

        let mut signed = unsigned.clone();
        let mut cache = SighashCache::new(&unsigned);
        for (i, utxo) in selected.iter().enumerate() {
            let key = self
                .keyring
                .key(utxo.key_chain, utxo.key_index)
                .context("Selected a UTXO of an unknown key")?;

            let sighash = cache
                .p2wpkh_signature_hash(
                    i,
                    &key.redeem_script,
                    utxo.value,
                    EcdsaSighashType::All,
                )
                .context("Sighash computation failed")?;
            let msg = Message::from_digest(sighash.to_byte_array());
            let sig =
                self.keyring.secp().sign_ecdsa(&msg, &key.secret_key());

            let mut sig_bytes = sig.serialize_der().to_vec();
            sig_bytes.push(EcdsaSighashType::All.to_u32() as u8);

            signed.input[i].script_sig =
                redeem_script_sig(&key.redeem_script);
            signed.input[i].witness = Witness::from_slice(&[
                sig_bytes.as_slice(),
                &key.public_key.to_bytes(),
            ]);
        }
        Ok(signed)
    }
}

/// The scriptSig of a P2SH-P2WPKH spend: a single push of the redeem
/// (P2WPKH) script.
fn redeem_script_sig(redeem_script: &ScriptBuf) -> ScriptBuf {
    let push = PushBytesBuf::try_from(redeem_script.to_bytes())
        .expect("Invariant: a p2wpkh script is 22 bytes");
    ScriptBuf::builder().push_slice(push).into_script()
}

fn public_key_from_input(txin: &TxIn) -> Option<CompressedPublicKey> {
    if txin.witness.len() != 2 {
        return None;
    }
    let bytes = txin.witness.nth(1)?;
    CompressedPublicKey::from_slice(bytes).ok()
}
