//! An append-only, checkpoint-anchored store of validated block headers.
//!
//! The chain holds a bounded in-memory window of the best chain plus any
//! live fork branches. Once a 2016-header retarget chunk has been sealed
//! by a later chunk, [`HeaderChain::optimize`] hands it back to the caller
//! for persistence and drops it from the window. The window always retains
//! the chunk containing the tip, which is exactly what the next retarget
//! computation needs.

use std::collections::HashMap;

use bitcoin::{
    block::Header,
    consensus::Params,
    constants::genesis_block,
    hashes::Hash,
    BlockHash, CompactTarget, Network, Work,
};

/// Bitcoin's difficulty epoch, in blocks.
pub const RETARGETING_PERIOD: u32 = 2016;

/// Errors produced while validating headers. Any of these coming from data
/// a server sent us is grounds for disconnecting from that server.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ChainError {
    #[error("header at height {height} does not connect to our chain")]
    BadParent { height: u32 },
    #[error("header at height {height} fails its proof of work")]
    BadProofOfWork { height: u32 },
    #[error("header at height {height} has unexpected difficulty bits")]
    BadDifficulty { height: u32 },
    #[error("height {height} is below the earliest checkpoint")]
    BelowCheckpoint { height: u32 },
    #[error("chunk at {start} is not aligned to a retarget boundary")]
    MisalignedChunk { start: u32 },
    #[error("chunk at {start} has unworkable length {len}")]
    BadChunkLength { start: u32, len: usize },
    #[error("chunk at {start} does not match its checkpoint anchor")]
    BadAnchor { start: u32 },
}

/// A trusted anchor: the chunk starting at `height` must link back to
/// `prev_hash` and carry `bits`. `height` is always a retarget boundary.
#[derive(Copy, Clone, Debug)]
pub struct Checkpoint {
    pub height: u32,
    /// Hash of the header at `height - 1`, or all-zeroes for height 0.
    pub prev_hash: BlockHash,
    /// The difficulty bits in force for the chunk starting at `height`.
    pub bits: CompactTarget,
}

impl Checkpoint {
    /// The genesis anchor for `network`. Embedders with a newer trusted
    /// snapshot can append checkpoints after this one.
    pub fn genesis(network: Network) -> Self {
        let genesis = genesis_block(network).header;
        Self {
            height: 0,
            prev_hash: BlockHash::all_zeros(),
            bits: genesis.bits,
        }
    }

    /// The default checkpoint set for `network`.
    pub fn for_network(network: Network) -> Vec<Self> {
        vec![Self::genesis(network)]
    }
}

/// A validated header together with its height and the cumulative chainwork
/// up to and including it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IndexedHeader {
    pub header: Header,
    pub height: u32,
    pub chainwork: Work,
}

impl IndexedHeader {
    pub fn hash(&self) -> BlockHash {
        self.header.block_hash()
    }
}

/// The outcome of [`HeaderChain::add_header`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AddResult {
    /// The header extended the best chain tip.
    Extended,
    /// The header was already known; nothing changed.
    Duplicate,
    /// The header started or extended a fork branch which is not (yet)
    /// heavier than the best chain.
    Forked,
    /// The header completed a fork branch heavier than the best chain;
    /// `depth` headers were detached from the old best chain.
    Reorged { depth: u32 },
}

/// The outcome of [`HeaderChain::add_headers_chunk`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChunkAction {
    /// The chunk was spliced under its checkpoint into the empty window.
    Spliced,
    /// The chunk extended the current tip.
    Extended,
    /// The chunk is older than the window; it was validated in isolation
    /// (internal linkage + proof of work) and NOT added to the window. The
    /// caller should persist it.
    Validated,
    /// The chunk repeats headers already in the window.
    Duplicate,
}

/// A full chunk which fell out of the working window and should be moved
/// to persistent storage, indexed by its start height.
#[derive(Clone, Debug)]
pub struct SealedChunk {
    pub start: u32,
    pub headers: Vec<Header>,
}

pub struct HeaderChain {
    network: Network,
    checkpoints: Vec<Checkpoint>,
    /// Contiguous in-memory window of the best chain, lowest height first.
    best: Vec<IndexedHeader>,
    /// Live fork branches keyed by their tip hash. Each branch is
    /// contiguous and its first header's parent is inside `best`.
    forks: HashMap<BlockHash, Vec<IndexedHeader>>,
}

impl HeaderChain {
    /// `checkpoints` must be non-empty, sorted by height, and aligned to
    /// retarget boundaries.
    pub fn new(network: Network, checkpoints: Vec<Checkpoint>) -> Self {
        debug_assert!(!checkpoints.is_empty());
        debug_assert!(checkpoints
            .iter()
            .all(|cp| cp.height % RETARGETING_PERIOD == 0));
        Self {
            network,
            checkpoints,
            best: Vec::new(),
            forks: HashMap::new(),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn tip(&self) -> Option<&IndexedHeader> {
        self.best.last()
    }

    pub fn height(&self) -> Option<u32> {
        self.tip().map(|tip| tip.height)
    }

    pub fn is_empty(&self) -> bool {
        self.best.is_empty()
    }

    /// The height the next requested chunk should start at.
    pub fn next_chunk_start(&self) -> u32 {
        match self.tip() {
            Some(tip) => tip.height + 1,
            None => self.last_checkpoint().height,
        }
    }

    /// Look up a best-chain header in the in-memory window.
    pub fn get(&self, height: u32) -> Option<&IndexedHeader> {
        let base = self.window_base();
        if height < base {
            return None;
        }
        self.best.get((height - base) as usize)
    }

    fn window_base(&self) -> u32 {
        self.best
            .first()
            .map(|first| first.height)
            .unwrap_or_else(|| self.last_checkpoint().height)
    }

    fn earliest_checkpoint(&self) -> &Checkpoint {
        self.checkpoints.first().expect("Invariant: non-empty")
    }

    fn last_checkpoint(&self) -> &Checkpoint {
        self.checkpoints.last().expect("Invariant: non-empty")
    }

    fn checkpoint_at(&self, height: u32) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|cp| cp.height == height)
    }

    fn params(&self) -> Params {
        Params::new(self.network)
    }

    /// Append a single header. `height` is the height the sender claims for
    /// it; it must be tip + 1 (extension), a known header (idempotent), or
    /// the child of some in-window header (fork).
    pub fn add_header(
        &mut self,
        height: u32,
        header: Header,
    ) -> Result<AddResult, ChainError> {
        if height < self.earliest_checkpoint().height {
            return Err(ChainError::BelowCheckpoint { height });
        }

        if let Some(known) = self.get(height) {
            if known.header == header {
                return Ok(AddResult::Duplicate);
            }
        }

        let tip = match self.tip() {
            // An empty window only accepts anchored chunks.
            None => return Err(ChainError::BadParent { height }),
            Some(tip) => *tip,
        };

        if height == tip.height + 1 && header.prev_blockhash == tip.hash() {
            self.validate_child(&tip, height, &header)?;
            self.best.push(IndexedHeader {
                header,
                height,
                chainwork: tip.chainwork + header.work(),
            });
            return Ok(AddResult::Extended);
        }

        self.add_fork_header(height, header)
    }

    /// Append a contiguous run of headers at the tip.
    pub fn add_headers(
        &mut self,
        start: u32,
        headers: &[Header],
    ) -> Result<(), ChainError> {
        for (i, header) in headers.iter().enumerate() {
            self.add_header(start + i as u32, *header)?;
        }
        Ok(())
    }

    /// Handle a (up to) 2016-header chunk, aligned to a retarget boundary.
    ///
    /// - Into an empty window: spliced under the matching checkpoint.
    /// - At the tip: plain extension.
    /// - Strictly below the window: validated in isolation for persistence.
    pub fn add_headers_chunk(
        &mut self,
        start: u32,
        headers: &[Header],
    ) -> Result<ChunkAction, ChainError> {
        if start % RETARGETING_PERIOD != 0 {
            return Err(ChainError::MisalignedChunk { start });
        }
        let len = headers.len();
        if len == 0 || len > RETARGETING_PERIOD as usize {
            return Err(ChainError::BadChunkLength { start, len });
        }
        if start < self.earliest_checkpoint().height {
            return Err(ChainError::BelowCheckpoint { height: start });
        }

        if self.best.is_empty() {
            return self.splice_anchored_chunk(start, headers);
        }

        let tip_height = self.tip().expect("Invariant: non-empty").height;
        if start == tip_height + 1 {
            self.add_headers(start, headers)?;
            return Ok(ChunkAction::Extended);
        }

        if start + len as u32 <= self.window_base() {
            self.validate_isolated_chunk(start, headers)?;
            return Ok(ChunkAction::Validated);
        }

        // The chunk overlaps the window: accept exact duplicates only.
        let duplicate = headers.iter().enumerate().all(|(i, header)| {
            self.get(start + i as u32)
                .map(|known| known.header == *header)
                .unwrap_or(false)
        });
        if duplicate {
            Ok(ChunkAction::Duplicate)
        } else {
            Err(ChainError::BadParent { height: start })
        }
    }

    /// Seal and return every full chunk below the chunk containing the tip,
    /// dropping it from the in-memory window.
    pub fn optimize(&mut self) -> Vec<SealedChunk> {
        let tip_height = match self.tip() {
            Some(tip) => tip.height,
            None => return Vec::new(),
        };
        let tip_chunk_base = tip_height - tip_height % RETARGETING_PERIOD;
        let base = self.window_base();
        if base >= tip_chunk_base {
            return Vec::new();
        }

        let keep_from = (tip_chunk_base - base) as usize;
        let sealed: Vec<IndexedHeader> =
            self.best.drain(..keep_from).collect();

        // Fork branches rooted below the new window base can no longer be
        // adopted; drop them.
        self.forks
            .retain(|_, branch| branch[0].height > tip_chunk_base);

        let mut chunks: Vec<SealedChunk> = Vec::new();
        for indexed in sealed {
            let chunk_base =
                indexed.height - indexed.height % RETARGETING_PERIOD;
            match chunks.last_mut() {
                Some(chunk) if chunk.start == chunk_base =>
                    chunk.headers.push(indexed.header),
                _ => chunks.push(SealedChunk {
                    start: chunk_base,
                    headers: vec![indexed.header],
                }),
            }
        }
        chunks
    }

    // --- Validation internals --- //

    fn splice_anchored_chunk(
        &mut self,
        start: u32,
        headers: &[Header],
    ) -> Result<ChunkAction, ChainError> {
        let checkpoint = *self
            .checkpoint_at(start)
            .ok_or(ChainError::BadAnchor { start })?;
        let first = &headers[0];
        if first.prev_blockhash != checkpoint.prev_hash {
            return Err(ChainError::BadAnchor { start });
        }
        self.check_chunk_bits(start, headers, Some(checkpoint.bits))?;
        self.check_chunk_linkage_and_pow(start, headers)?;

        let mut chainwork = first.work();
        let mut best = Vec::with_capacity(headers.len());
        for (i, header) in headers.iter().enumerate() {
            if i > 0 {
                chainwork = chainwork + header.work();
            }
            best.push(IndexedHeader {
                header: *header,
                height: start + i as u32,
                chainwork,
            });
        }
        self.best = best;
        Ok(ChunkAction::Spliced)
    }

    fn validate_isolated_chunk(
        &self,
        start: u32,
        headers: &[Header],
    ) -> Result<(), ChainError> {
        // Without surrounding context the absolute target cannot be
        // recomputed; check the strongest properties available.
        if let Some(checkpoint) = self.checkpoint_at(start) {
            if headers[0].prev_blockhash != checkpoint.prev_hash {
                return Err(ChainError::BadAnchor { start });
            }
            self.check_chunk_bits(start, headers, Some(checkpoint.bits))?;
        } else {
            self.check_chunk_bits(start, headers, None)?;
        }
        self.check_chunk_linkage_and_pow(start, headers)
    }

    /// Bits must be constant within a retarget window, except on networks
    /// with the 20-minute minimum-difficulty rule.
    fn check_chunk_bits(
        &self,
        start: u32,
        headers: &[Header],
        expected: Option<CompactTarget>,
    ) -> Result<(), ChainError> {
        let params = self.params();
        if params.allow_min_difficulty_blocks {
            return Ok(());
        }
        let expected = expected.unwrap_or(headers[0].bits);
        for (i, header) in headers.iter().enumerate() {
            if header.bits != expected {
                return Err(ChainError::BadDifficulty {
                    height: start + i as u32,
                });
            }
        }
        Ok(())
    }

    fn check_chunk_linkage_and_pow(
        &self,
        start: u32,
        headers: &[Header],
    ) -> Result<(), ChainError> {
        let mut prev_hash: Option<BlockHash> = None;
        for (i, header) in headers.iter().enumerate() {
            let height = start + i as u32;
            if let Some(prev_hash) = prev_hash {
                if header.prev_blockhash != prev_hash {
                    return Err(ChainError::BadParent { height });
                }
            }
            header
                .validate_pow(header.target())
                .map_err(|_| ChainError::BadProofOfWork { height })?;
            prev_hash = Some(header.block_hash());
        }
        Ok(())
    }

    /// Validate a header against its parent: difficulty bits then PoW.
    fn validate_child(
        &self,
        parent: &IndexedHeader,
        height: u32,
        header: &Header,
    ) -> Result<(), ChainError> {
        let params = self.params();

        let bits_ok = if params.no_pow_retargeting {
            header.bits == parent.header.bits
        } else if height % RETARGETING_PERIOD == 0 {
            match self.checkpoint_at(height) {
                Some(checkpoint) => header.bits == checkpoint.bits,
                None => {
                    let first = self
                        .get(height - RETARGETING_PERIOD)
                        .ok_or(ChainError::BadDifficulty { height })?;
                    let timespan = u64::from(
                        parent.header.time.saturating_sub(first.header.time),
                    );
                    let expected = CompactTarget::from_next_work_required(
                        parent.header.bits,
                        timespan,
                        self.network,
                    );
                    header.bits == expected
                }
            }
        } else if params.allow_min_difficulty_blocks {
            // Testnet's 20-minute rule: a block may fall back to the
            // minimum difficulty, and the next block returns to the
            // window's difficulty. Accept the parent's bits, the floor, or
            // the bits in force at the window start.
            let window_bits = self
                .get(height - height % RETARGETING_PERIOD)
                .map(|first| first.header.bits);
            header.bits == parent.header.bits
                || header.target() == params.max_attainable_target
                || Some(header.bits) == window_bits
        } else {
            header.bits == parent.header.bits
        };

        if !bits_ok {
            return Err(ChainError::BadDifficulty { height });
        }

        header
            .validate_pow(header.target())
            .map_err(|_| ChainError::BadProofOfWork { height })?;
        Ok(())
    }

    // --- Fork handling --- //

    fn add_fork_header(
        &mut self,
        height: u32,
        header: Header,
    ) -> Result<AddResult, ChainError> {
        // Idempotence across branches.
        let hash = header.block_hash();
        if self.forks.contains_key(&hash)
            || self
                .forks
                .values()
                .any(|branch| branch.iter().any(|ih| ih.hash() == hash))
        {
            return Ok(AddResult::Duplicate);
        }

        let branch = if let Some(existing) =
            self.forks.get(&header.prev_blockhash)
        {
            // Extends an existing branch.
            let parent = *existing.last().expect("Invariant: non-empty");
            if height != parent.height + 1 {
                return Err(ChainError::BadParent { height });
            }
            self.validate_child(&parent, height, &header)?;
            let mut branch = self
                .forks
                .remove(&header.prev_blockhash)
                .expect("Invariant: just looked up");
            branch.push(IndexedHeader {
                header,
                height,
                chainwork: parent.chainwork + header.work(),
            });
            branch
        } else {
            // Starts a new branch off some in-window best-chain header.
            let parent = match height
                .checked_sub(1)
                .and_then(|parent_height| self.get(parent_height))
            {
                Some(parent) if parent.hash() == header.prev_blockhash =>
                    *parent,
                _ => return Err(ChainError::BadParent { height }),
            };
            self.validate_child(&parent, height, &header)?;
            vec![IndexedHeader {
                header,
                height,
                chainwork: parent.chainwork + header.work(),
            }]
        };

        let tip_work = self.tip().expect("Invariant: non-empty").chainwork;
        let branch_tip = *branch.last().expect("Invariant: non-empty");
        if branch_tip.chainwork > tip_work {
            let depth = self.adopt_branch(branch);
            Ok(AddResult::Reorged { depth })
        } else {
            self.forks.insert(branch_tip.hash(), branch);
            Ok(AddResult::Forked)
        }
    }

    /// Detach the best chain down to the fork point and adopt `branch`.
    /// Returns the number of detached headers.
    fn adopt_branch(&mut self, branch: Vec<IndexedHeader>) -> u32 {
        let fork_point = branch[0].height - 1;
        let old_tip_height =
            self.tip().expect("Invariant: non-empty").height;
        let base = self.window_base();
        self.best.truncate((fork_point - base + 1) as usize);
        self.best.extend(branch);

        // Branches orphaned by the reorg (rooted above the fork point on
        // the old chain) can never be adopted; drop them. Surviving
        // branches root at or below the fork point.
        let best = &self.best;
        self.forks.retain(|_, other| {
            let root_parent = other[0].height - 1;
            root_parent
                .checked_sub(base)
                .and_then(|i| best.get(i as usize))
                .map(|ih| ih.hash() == other[0].header.prev_blockhash)
                .unwrap_or(false)
        });

        old_tip_height - fork_point
    }
}

#[cfg(test)]
mod test {
    use bitcoin::Network;

    use super::*;
    use crate::testing::{mine_child, mine_chain, regtest_genesis};

    fn regtest_chain() -> HeaderChain {
        HeaderChain::new(
            Network::Regtest,
            Checkpoint::for_network(Network::Regtest),
        )
    }

    #[test]
    fn splice_extend_and_duplicate() {
        let mut chain = regtest_chain();
        let headers = mine_chain(5);
        chain.add_headers_chunk(0, &headers).unwrap();
        assert_eq!(chain.height(), Some(4));

        let next = mine_child(&headers[4], 1000);
        assert_eq!(chain.add_header(5, next).unwrap(), AddResult::Extended);
        // Idempotent on the current tip.
        assert_eq!(chain.add_header(5, next).unwrap(), AddResult::Duplicate);
        assert_eq!(chain.height(), Some(5));
    }

    #[test]
    fn rejects_disconnected_and_bad_bits() {
        let mut chain = regtest_chain();
        let headers = mine_chain(3);
        chain.add_headers_chunk(0, &headers).unwrap();

        // Wrong parent.
        let stranger = mine_child(&headers[0], 7);
        assert_eq!(
            chain.add_header(3, stranger),
            Err(ChainError::BadParent { height: 3 }),
        );

        // Wrong difficulty bits (regtest keeps constant bits).
        let mut bad_bits = mine_child(&headers[2], 8);
        bad_bits.bits = CompactTarget::from_consensus(0x1d00ffff);
        assert_eq!(
            chain.add_header(3, bad_bits),
            Err(ChainError::BadDifficulty { height: 3 }),
        );
    }

    #[test]
    fn heavier_fork_reorgs() {
        let mut chain = regtest_chain();
        let headers = mine_chain(6);
        chain.add_headers_chunk(0, &headers).unwrap();
        let old_tip = chain.tip().unwrap().hash();

        // Fork off height 3 with two headers: same cumulative work as the
        // current tip at first, so no reorg yet.
        let fork1 = mine_child(&headers[3], 50);
        let fork2 = mine_child(&fork1, 51);
        assert_eq!(chain.add_header(4, fork1).unwrap(), AddResult::Forked);
        assert_eq!(chain.add_header(5, fork2).unwrap(), AddResult::Forked);
        assert_eq!(chain.tip().unwrap().hash(), old_tip);

        // One more fork header exceeds the best chain's work.
        let fork3 = mine_child(&fork2, 52);
        assert_eq!(
            chain.add_header(6, fork3).unwrap(),
            AddResult::Reorged { depth: 2 },
        );
        assert_eq!(chain.height(), Some(6));
        assert_eq!(chain.tip().unwrap().hash(), fork3.block_hash());
        // The adopted chain is contiguous.
        assert_eq!(
            chain.get(4).unwrap().hash(),
            chain.get(5).unwrap().header.prev_blockhash,
        );
    }

    #[test]
    fn optimize_seals_full_chunks() {
        let mut chain = regtest_chain();
        let n = (RETARGETING_PERIOD * 2 + 5) as usize;
        let headers = mine_chain(n);

        let period = RETARGETING_PERIOD as usize;
        chain.add_headers_chunk(0, &headers[..period]).unwrap();
        chain
            .add_headers_chunk(RETARGETING_PERIOD, &headers[period..2 * period])
            .unwrap();
        chain
            .add_headers(RETARGETING_PERIOD * 2, &headers[2 * period..])
            .unwrap();

        let sealed = chain.optimize();
        assert_eq!(sealed.len(), 2);
        assert_eq!(sealed[0].start, 0);
        assert_eq!(sealed[0].headers.len(), period);
        assert_eq!(sealed[1].start, RETARGETING_PERIOD);

        // The tip chunk is retained and the chain still extends.
        assert_eq!(chain.height(), Some(RETARGETING_PERIOD * 2 + 4));
        assert!(chain.get(RETARGETING_PERIOD * 2).is_some());
        assert!(chain.get(RETARGETING_PERIOD * 2 - 1).is_none());
        let next = mine_child(&headers[n - 1], 123);
        chain
            .add_header(RETARGETING_PERIOD * 2 + 5, next)
            .unwrap();

        // A second optimize with no new sealed chunk returns nothing.
        assert!(chain.optimize().is_empty());
    }

    #[test]
    fn checkpoint_floor_is_enforced() {
        let headers = mine_chain((RETARGETING_PERIOD + 3) as usize);
        let period = RETARGETING_PERIOD as usize;
        let anchor = headers[period - 1];
        let checkpoint = Checkpoint {
            height: RETARGETING_PERIOD,
            prev_hash: anchor.block_hash(),
            bits: regtest_genesis().bits,
        };
        let mut chain =
            HeaderChain::new(Network::Regtest, vec![checkpoint]);

        // A chunk anchored at the checkpoint splices.
        assert_eq!(
            chain
                .add_headers_chunk(RETARGETING_PERIOD, &headers[period..])
                .unwrap(),
            ChunkAction::Spliced,
        );

        // Headers below the checkpoint are rejected.
        assert_eq!(
            chain.add_header(5, headers[5]),
            Err(ChainError::BelowCheckpoint { height: 5 }),
        );

        // A chunk which does not link to the anchor is rejected.
        let mut chain2 =
            HeaderChain::new(Network::Regtest, vec![checkpoint]);
        assert_eq!(
            chain2.add_headers_chunk(RETARGETING_PERIOD, &headers[..period]),
            Err(ChainError::BadAnchor {
                start: RETARGETING_PERIOD
            }),
        );
    }

    #[test]
    fn misaligned_and_oversized_chunks() {
        let mut chain = regtest_chain();
        let headers = mine_chain(3);
        assert_eq!(
            chain.add_headers_chunk(1, &headers),
            Err(ChainError::MisalignedChunk { start: 1 }),
        );
        assert_eq!(
            chain.add_headers_chunk(0, &[]),
            Err(ChainError::BadChunkLength { start: 0, len: 0 }),
        );
    }
}
