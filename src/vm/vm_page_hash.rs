//! Object/offset page hash
//!
//! Maps `(object, offset)` to the resident page holding that data. The
//! table is separate from the page arena: buckets hold `PageId`s, never
//! references into the arena, so the arena never moves under it.
//!
//! The bucket count is a power of two. It follows the number of hashed
//! pages: when the load leaves `[1/4, 2]` entries per bucket the table is
//! rebuilt at the next power of two at or above the entry count.

use alloc::vec::Vec;

use crate::vm::vm_object::ObjectId;
use crate::vm::vm_page::{PageId, PAGE_SHIFT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HashEntry {
    object: ObjectId,
    offset: u64,
    page: PageId,
}

/// Chained hash from `(ObjectId, offset)` to `PageId`
#[derive(Debug)]
pub struct PageHash {
    buckets: Vec<Vec<HashEntry>>,
    mask: usize,
    count: usize,
    min_buckets: usize,
    rehashes: u64,
}

impl PageHash {
    /// Create a table with at least `min_buckets` buckets
    pub fn new(min_buckets: usize) -> Self {
        let n = min_buckets.max(1).next_power_of_two();
        Self {
            buckets: (0..n).map(|_| Vec::new()).collect(),
            mask: n - 1,
            count: 0,
            min_buckets: n,
            rehashes: 0,
        }
    }

    #[inline]
    fn bucket(&self, object: ObjectId, offset: u64) -> usize {
        let obj = object.0 as usize;
        ((obj ^ (obj >> 8)).wrapping_mul(0x9e37_79b9) ^ (offset >> PAGE_SHIFT) as usize) & self.mask
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of times the table has been resized
    pub fn rehash_count(&self) -> u64 {
        self.rehashes
    }

    /// Find the page at `(object, offset)`
    pub fn lookup(&self, object: ObjectId, offset: u64) -> Option<PageId> {
        self.buckets[self.bucket(object, offset)]
            .iter()
            .find(|e| e.object == object && e.offset == offset)
            .map(|e| e.page)
    }

    /// Insert a page; the key must not already be present.
    pub fn insert(&mut self, object: ObjectId, offset: u64, page: PageId) {
        debug_assert!(self.lookup(object, offset).is_none(), "duplicate page hash key");
        let b = self.bucket(object, offset);
        self.buckets[b].push(HashEntry { object, offset, page });
        self.count += 1;
        self.maybe_rehash();
    }

    /// Remove the entry for `(object, offset)` if it maps to `page`
    pub fn remove(&mut self, object: ObjectId, offset: u64, page: PageId) -> bool {
        let b = self.bucket(object, offset);
        let bucket = &mut self.buckets[b];
        match bucket
            .iter()
            .position(|e| e.object == object && e.offset == offset && e.page == page)
        {
            Some(pos) => {
                bucket.swap_remove(pos);
                self.count -= 1;
                self.maybe_rehash();
                true
            }
            None => false,
        }
    }

    /// Resize when the load factor leaves `[1/4, 2]`
    fn maybe_rehash(&mut self) {
        let n = self.buckets.len();
        let too_full = self.count > n * 2;
        let too_sparse = n > self.min_buckets && self.count < n / 4;
        if too_full || too_sparse {
            let target = self.count.max(self.min_buckets).next_power_of_two();
            if target != n {
                self.rehash(target);
            }
        }
    }

    fn rehash(&mut self, nbuckets: usize) {
        let old = core::mem::replace(&mut self.buckets, (0..nbuckets).map(|_| Vec::new()).collect());
        self.mask = nbuckets - 1;
        for entry in old.into_iter().flatten() {
            let b = self.bucket(entry.object, entry.offset);
            self.buckets[b].push(entry);
        }
        self.rehashes += 1;
        log::debug!("page hash rehashed to {} buckets ({} pages)", nbuckets, self.count);
    }
}
