//! A size-bounded memo in front of the preimage table.
//!
//! Lookups hit the preimage table on every relay decision; this memo
//! keeps the hot set in memory. Invalidation is explicit on write;
//! there is no background expiration.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use crate::{
    htlc::{PaymentHash, PaymentPreimage},
    traits::PaymentBag,
};

pub struct PreimageCache {
    bag: Arc<dyn PaymentBag>,
    capacity: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    map: HashMap<PaymentHash, PaymentPreimage>,
    // Insertion order; evicted front-first when over capacity.
    order: VecDeque<PaymentHash>,
}

impl PreimageCache {
    pub fn new(bag: Arc<dyn PaymentBag>, capacity: usize) -> Self {
        Self {
            bag,
            capacity,
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Memoized lookup through to the preimage table.
    pub fn get(&self, hash: PaymentHash) -> Option<PaymentPreimage> {
        if let Some(preimage) = self.inner.lock().unwrap().map.get(&hash) {
            return Some(*preimage);
        }
        let preimage = self.bag.get_preimage(hash)?;
        self.note_written(hash, preimage);
        Some(preimage)
    }

    /// Write a preimage to the table, then update the memo.
    pub fn put(&self, hash: PaymentHash, preimage: PaymentPreimage) {
        self.bag.set_preimage(hash, preimage);
        self.note_written(hash, preimage);
    }

    /// The table was written through some other path (e.g. a combined
    /// storage transaction); keep the memo coherent.
    pub fn note_written(&self, hash: PaymentHash, preimage: PaymentPreimage) {
        let mut inner = self.inner.lock().unwrap();
        if inner.map.insert(hash, preimage).is_none() {
            inner.order.push_back(hash);
        }
        while inner.map.len() > self.capacity {
            match inner.order.pop_front() {
                Some(evicted) => {
                    inner.map.remove(&evicted);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::testing::MemoryBag;

    struct CountingBag {
        inner: MemoryBag,
        lookups: AtomicUsize,
    }

    impl PaymentBag for CountingBag {
        fn get_preimage(&self, hash: PaymentHash) -> Option<PaymentPreimage> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.get_preimage(hash)
        }
        fn set_preimage(&self, hash: PaymentHash, preimage: PaymentPreimage) {
            self.inner.set_preimage(hash, preimage)
        }
        fn payment_info(
            &self,
            hash: PaymentHash,
        ) -> Option<crate::traits::PaymentInfo> {
            self.inner.payment_info(hash)
        }
        fn fulfill_local(
            &self,
            hash: PaymentHash,
            preimage: PaymentPreimage,
            received_msat: u64,
        ) {
            self.inner.fulfill_local(hash, preimage, received_msat)
        }
        fn add_relayed_preimage_info(
            &self,
            tag: &crate::htlc::FullPaymentTag,
            preimage: PaymentPreimage,
            relayed_msat: u64,
            earned_msat: u64,
        ) {
            self.inner.add_relayed_preimage_info(
                tag,
                preimage,
                relayed_msat,
                earned_msat,
            )
        }
    }

    #[test]
    fn memoizes_table_hits() {
        let bag = Arc::new(CountingBag {
            inner: MemoryBag::default(),
            lookups: AtomicUsize::new(0),
        });
        let preimage = PaymentPreimage([9u8; 32]);
        let hash = preimage.payment_hash();
        bag.set_preimage(hash, preimage);

        let cache = PreimageCache::new(bag.clone(), 4);
        assert_eq!(cache.get(hash), Some(preimage));
        assert_eq!(cache.get(hash), Some(preimage));
        assert_eq!(bag.lookups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn misses_are_not_cached_and_writes_are() {
        let bag = Arc::new(CountingBag {
            inner: MemoryBag::default(),
            lookups: AtomicUsize::new(0),
        });
        let cache = PreimageCache::new(bag.clone(), 4);
        let preimage = PaymentPreimage([1u8; 32]);
        let hash = preimage.payment_hash();

        assert_eq!(cache.get(hash), None);
        assert_eq!(cache.get(hash), None);
        assert_eq!(bag.lookups.load(Ordering::SeqCst), 2);

        cache.put(hash, preimage);
        assert_eq!(cache.get(hash), Some(preimage));
        assert_eq!(bag.lookups.load(Ordering::SeqCst), 2);
        // The write went through to the table too.
        assert_eq!(bag.inner.get_preimage(hash), Some(preimage));
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let bag = Arc::new(CountingBag {
            inner: MemoryBag::default(),
            lookups: AtomicUsize::new(0),
        });
        let cache = PreimageCache::new(bag.clone(), 2);

        let preimages: Vec<PaymentPreimage> =
            (0u8..3).map(|i| PaymentPreimage([i; 32])).collect();
        for preimage in &preimages {
            cache.put(preimage.payment_hash(), *preimage);
        }

        // The first preimage fell out of the memo but is still in the
        // table, so a get refetches it.
        assert_eq!(bag.lookups.load(Ordering::SeqCst), 0);
        assert_eq!(
            cache.get(preimages[0].payment_hash()),
            Some(preimages[0]),
        );
        assert_eq!(bag.lookups.load(Ordering::SeqCst), 1);
    }
}
