//! Electrum-style server protocol types, abstracted from the wire.
//!
//! The transport and connection pool live outside this crate. The wallet
//! state machine issues [`ElectrumRequest`]s through an [`ElectrumPort`]
//! and receives typed [`WalletMessage`]s back; both directions are plain
//! messages, never blocking calls.

use std::{fmt, str::FromStr};

use bitcoin::{
    block::Header,
    hashes::{sha256, sha256d, Hash},
    Script, Transaction, TxMerkleNode, Txid,
};
use hex::FromHex;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};

/// The key an Electrum server indexes the UTXO set by: the byte-reversed
/// SHA-256 of an output script.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub struct ScriptHash([u8; 32]);

impl ScriptHash {
    pub fn from_script(script: &Script) -> Self {
        let digest = sha256::Hash::hash(script.as_bytes());
        let mut bytes = digest.to_byte_array();
        bytes.reverse();
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::display(&self.0))
    }
}

impl fmt::Debug for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScriptHash({self})")
    }
}

impl FromStr for ScriptHash {
    type Err = hex::DecodeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <[u8; 32]>::from_hex(s).map(Self)
    }
}

/// One entry of a script hash's confirmed/unconfirmed history.
///
/// `height` follows the Electrum convention: `h > 0` confirmed at block
/// `h`, `0` unconfirmed with confirmed inputs, `-1` unconfirmed with at
/// least one unconfirmed input.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub txid: Txid,
    pub height: i32,
}

/// A server's Merkle proof that a transaction is contained in the block at
/// `block_height`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub block_height: u32,
    pub pos: u32,
    pub merkle: Vec<sha256d::Hash>,
}

impl MerkleProof {
    /// Fold the branch up to the root this proof commits to for `txid`.
    pub fn expected_root(&self, txid: Txid) -> TxMerkleNode {
        let mut current = txid.to_raw_hash();
        for (i, node) in self.merkle.iter().enumerate() {
            let mut concat = Vec::with_capacity(64);
            if (self.pos >> i) & 1 == 1 {
                concat.extend_from_slice(node.as_byte_array());
                concat.extend_from_slice(current.as_byte_array());
            } else {
                concat.extend_from_slice(current.as_byte_array());
                concat.extend_from_slice(node.as_byte_array());
            }
            current = sha256d::Hash::hash(&concat);
        }
        TxMerkleNode::from_raw_hash(current)
    }
}

/// Requests the wallet can issue to a server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ElectrumRequest {
    HeaderSubscription,
    GetHeaders { start: u32, count: u32 },
    ScriptHashSubscription(ScriptHash),
    GetScriptHashHistory(ScriptHash),
    GetTransaction(Txid),
    GetMerkle { txid: Txid, height: u32 },
    BroadcastTransaction(Transaction),
}

/// Messages delivered to the wallet state machine: connection lifecycle,
/// responses, and asynchronous notifications.
#[derive(Clone, Debug)]
pub enum WalletMessage {
    /// The connection pool established (or re-established) a server.
    ServerReady,
    /// The connection was lost; all outstanding requests are void.
    Disconnected,
    /// Header subscription response or notification.
    Tip { height: u32, header: Header },
    /// Response to [`ElectrumRequest::GetHeaders`].
    Headers { start: u32, headers: Vec<Header> },
    /// Subscription response or notification. `status` is opaque except
    /// for the empty-string sentinel meaning "address never used".
    ScriptHashStatus { script_hash: ScriptHash, status: String },
    /// Response to [`ElectrumRequest::GetScriptHashHistory`].
    History {
        script_hash: ScriptHash,
        items: Vec<HistoryItem>,
    },
    /// Response to [`ElectrumRequest::GetTransaction`].
    Transaction { tx: Transaction },
    /// Response to [`ElectrumRequest::GetMerkle`].
    Merkle {
        txid: Txid,
        height: u32,
        proof: MerkleProof,
    },
}

/// The wallet's handle on the server connection. Implementations must not
/// block: requests are queued and answered later via [`WalletMessage`]s.
pub trait ElectrumPort: Send + Sync {
    fn request(&self, req: ElectrumRequest);

    /// Sever the connection. The transport is expected to deliver a
    /// [`WalletMessage::Disconnected`] once done.
    fn disconnect(&self);
}

#[cfg(test)]
mod test {
    use bitcoin::ScriptBuf;
    use common::test_utils::roundtrip;
    use proptest::arbitrary::any;
    use proptest::strategy::Strategy;

    use super::*;

    fn any_script_hash() -> impl Strategy<Value = ScriptHash> {
        any::<[u8; 32]>().prop_map(ScriptHash)
    }

    #[test]
    fn script_hash_serde_roundtrip() {
        roundtrip::json_string_custom(
            any_script_hash(),
            proptest::test_runner::Config::default(),
        );
    }

    #[test]
    fn script_hash_is_reversed_sha256() {
        // sha256(empty script) reversed.
        let script = ScriptBuf::new();
        let sh = ScriptHash::from_script(&script);
        let digest = sha256::Hash::hash(&[]);
        let mut expected = digest.to_byte_array();
        expected.reverse();
        assert_eq!(sh.as_bytes(), &expected);
        assert_eq!(sh.to_string().len(), 64);
    }

    #[test]
    fn merkle_proof_two_leaves() {
        // A two-transaction block: root = H(t0 || t1).
        let t0 = Txid::from_raw_hash(sha256d::Hash::hash(b"t0"));
        let t1 = Txid::from_raw_hash(sha256d::Hash::hash(b"t1"));
        let mut concat = Vec::new();
        concat.extend_from_slice(t0.to_raw_hash().as_byte_array());
        concat.extend_from_slice(t1.to_raw_hash().as_byte_array());
        let root = TxMerkleNode::from_raw_hash(sha256d::Hash::hash(&concat));

        let proof0 = MerkleProof {
            block_height: 1,
            pos: 0,
            merkle: vec![t1.to_raw_hash()],
        };
        let proof1 = MerkleProof {
            block_height: 1,
            pos: 1,
            merkle: vec![t0.to_raw_hash()],
        };
        assert_eq!(proof0.expected_root(t0), root);
        assert_eq!(proof1.expected_root(t1), root);
        assert_ne!(proof0.expected_root(t1), root);
    }
}
