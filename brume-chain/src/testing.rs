//! Shared fixtures for this crate's tests: regtest header mining and
//! recording fakes for the server and storage ports.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
};

use bitcoin::{
    block::{Header, Version},
    constants::genesis_block,
    hashes::Hash,
    BlockHash, Network, TxMerkleNode,
};
use hex::FromHex;

use crate::{
    electrum::{ElectrumPort, ElectrumRequest},
    persist::{PersistentData, WalletDb},
};

/// The BIP39 seed of the standard "abandon .. about" test mnemonic.
pub const TEST_SEED_HEX: &str = "5eb00bbddcf069084889a8ab9155568165f5c453ccb85e70811aaed6f6da5fc19a5ac40b389cd370d086206dec8aa6c43daea6690f20ad3d8d48b2d2ce9e38e4";

pub fn test_seed() -> Vec<u8> {
    <Vec<u8>>::from_hex(TEST_SEED_HEX).unwrap()
}

pub fn regtest_genesis() -> Header {
    genesis_block(Network::Regtest).header
}

/// Grind the nonce until the header satisfies its own target. Instant on
/// regtest, where roughly half of all hashes pass.
pub fn mine_header(
    prev_blockhash: BlockHash,
    merkle_root: TxMerkleNode,
    time: u32,
) -> Header {
    let mut header = Header {
        version: Version::TWO,
        prev_blockhash,
        merkle_root,
        time,
        bits: regtest_genesis().bits,
        nonce: 0,
    };
    while header.validate_pow(header.target()).is_err() {
        header.nonce += 1;
    }
    header
}

/// Mine a regtest child of `parent`. `time_salt` varies the header so that
/// siblings mined off the same parent get distinct hashes.
pub fn mine_child(parent: &Header, time_salt: u32) -> Header {
    mine_header(
        parent.block_hash(),
        TxMerkleNode::all_zeros(),
        parent.time + 1 + time_salt,
    )
}

/// A regtest chain of `n` headers starting at the genesis block.
pub fn mine_chain(n: usize) -> Vec<Header> {
    let mut headers = vec![regtest_genesis()];
    while headers.len() < n {
        let next = mine_child(headers.last().unwrap(), 0);
        headers.push(next);
    }
    headers
}

// --- Recording fakes --- //

/// An [`ElectrumPort`] which records every request.
#[derive(Default)]
pub struct RecordingPort {
    requests: Mutex<Vec<ElectrumRequest>>,
    disconnects: AtomicU32,
}

impl RecordingPort {
    /// Drain and return all recorded requests.
    pub fn take(&self) -> Vec<ElectrumRequest> {
        std::mem::take(&mut self.requests.lock().unwrap())
    }

    pub fn disconnect_count(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl ElectrumPort for RecordingPort {
    fn request(&self, req: ElectrumRequest) {
        self.requests.lock().unwrap().push(req);
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// An in-memory [`WalletDb`].
#[derive(Default)]
pub struct MemoryDb {
    headers: Mutex<BTreeMap<u32, Header>>,
    data: Mutex<Option<PersistentData>>,
}

impl WalletDb for MemoryDb {
    fn get_headers(&self, start_height: u32, max_count: u32) -> Vec<Header> {
        let headers = self.headers.lock().unwrap();
        (start_height..start_height + max_count)
            .map_while(|height| headers.get(&height).copied())
            .collect()
    }

    fn add_headers(&self, start_height: u32, headers: &[Header]) {
        let mut map = self.headers.lock().unwrap();
        for (i, header) in headers.iter().enumerate() {
            map.insert(start_height + i as u32, *header);
        }
    }

    fn get_header(&self, height: u32) -> Option<Header> {
        self.headers.lock().unwrap().get(&height).copied()
    }

    fn read_persistent_data(&self) -> Option<PersistentData> {
        self.data.lock().unwrap().clone()
    }

    fn persist(&self, data: &PersistentData) {
        *self.data.lock().unwrap() = Some(data.clone());
    }
}
