//! Persistence interfaces: the storage layer is an external collaborator
//! reached through [`WalletDb`], a key/value + relational bag.
//!
//! Implementations run their own executor; calls from the wallet state
//! machine are fire-and-forget and must not block.

use std::collections::{HashMap, HashSet};

use bitcoin::{block::Header, OutPoint, Transaction, Txid};
use serde::{Deserialize, Serialize};

use crate::electrum::{HistoryItem, MerkleProof, ScriptHash};

/// Everything the wallet needs to resume after a restart, minus headers
/// (which are stored separately, chunked by start height). Private keys
/// are never persisted; only the derived-key counts are, and the chains
/// are re-derived from the seed on startup.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersistentData {
    pub account_keys_count: u32,
    pub change_keys_count: u32,
    pub status: HashMap<ScriptHash, String>,
    pub transactions: HashMap<Txid, Transaction>,
    pub heights: HashMap<Txid, i32>,
    pub history: HashMap<ScriptHash, Vec<HistoryItem>>,
    pub proofs: HashMap<Txid, MerkleProof>,
    pub pending_transactions: Vec<Transaction>,
    /// Outpoints reserved away from ordinary coin selection, e.g. for a
    /// held funding transaction. Absent in snapshots written before the
    /// field existed.
    #[serde(default)]
    pub locked_outpoints: HashSet<OutPoint>,
}

/// The wallet's storage port.
pub trait WalletDb: Send + Sync {
    /// Read up to `max_count` contiguous headers starting at
    /// `start_height`. Stops at the first gap.
    fn get_headers(&self, start_height: u32, max_count: u32) -> Vec<Header>;

    /// Store a contiguous run of headers starting at `start_height`.
    fn add_headers(&self, start_height: u32, headers: &[Header]);

    fn get_header(&self, height: u32) -> Option<Header>;

    fn read_persistent_data(&self) -> Option<PersistentData>;

    /// Store a full snapshot. Called on every significant transition;
    /// must be cheap for the caller (enqueue, don't write inline).
    fn persist(&self, data: &PersistentData);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn persistent_data_json_roundtrip() {
        let mut data = PersistentData::default();
        data.account_keys_count = 12;
        data.status.insert(
            "00".repeat(32).parse().unwrap(),
            "somedigest".to_owned(),
        );
        data.heights
            .insert("11".repeat(32).parse().unwrap(), -1);

        let json = serde_json::to_string(&data).unwrap();
        let back: PersistentData = serde_json::from_str(&json).unwrap();
        assert_eq!(back.account_keys_count, 12);
        assert_eq!(back.status.len(), 1);
        assert_eq!(
            back.heights.get(&"11".repeat(32).parse::<Txid>().unwrap()),
            Some(&-1),
        );
    }
}
