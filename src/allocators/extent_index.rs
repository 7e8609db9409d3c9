use anyhow::ensure;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Bound::{Excluded, Unbounded};

use crate::allocators::*;

//-------------------------------------

/// The start of an extent.  The address space allocator keys on `Addr`, the
/// block pool on plain offsets into its private key space.
pub trait ExtentKey: Copy + Ord + fmt::Debug {
    /// Numeric address, used for adjacency tests and error reporting.
    fn addr(self) -> u64;

    /// The key `len` units past this one.
    fn offset(self, len: u64) -> Self;
}

impl ExtentKey for u64 {
    fn addr(self) -> u64 {
        self
    }

    fn offset(self, len: u64) -> Self {
        self + len
    }
}

//-------------------------------------

/// A set of disjoint free extents, indexed both by start address and by
/// length.
///
/// `by_addr` is the primary view.  `by_len` is derived from it and is only
/// ever touched by `link` and `unlink`, so the two cannot drift apart.
///
/// The index itself does not coalesce on `insert`; callers that want the free
/// set kept maximal go through `release`.
#[derive(Clone)]
pub struct FreeExtentIndex<K> {
    by_addr: BTreeMap<K, u64>,
    by_len: BTreeMap<u64, BTreeSet<K>>,
    total: u64,
}

impl<K: ExtentKey> Default for FreeExtentIndex<K> {
    fn default() -> Self {
        Self {
            by_addr: BTreeMap::new(),
            by_len: BTreeMap::new(),
            total: 0,
        }
    }
}

impl<K: ExtentKey> fmt::Debug for FreeExtentIndex<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.by_addr.iter()).finish()
    }
}

impl<K: ExtentKey> FreeExtentIndex<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn link(&mut self, start: K, len: u64) {
        self.by_addr.insert(start, len);
        self.by_len.entry(len).or_default().insert(start);
        self.total += len;
    }

    fn unlink(&mut self, start: K, len: u64) {
        if let Some(starts) = self.by_len.get_mut(&len) {
            starts.remove(&start);
            if starts.is_empty() {
                self.by_len.remove(&len);
            }
        }
        self.by_addr.remove(&start);
        self.total -= len;
    }

    /// True if `[start, start + len)` intersects any free extent.
    pub fn overlaps(&self, start: K, len: u64) -> bool {
        if let Some((&s, &l)) = self.by_addr.range(..=start).next_back() {
            if s.addr() + l > start.addr() {
                return true;
            }
        }

        if let Some((&s, _)) = self.by_addr.range((Excluded(start), Unbounded)).next() {
            if s.addr() < start.addr() + len {
                return true;
            }
        }

        false
    }

    /// Adds a free extent.  The extent must not overlap one already present.
    pub fn insert(&mut self, start: K, len: u64) -> Result<()> {
        if len == 0 {
            return Err(MemErr::BadParams("zero length extent".to_string()));
        }
        if self.overlaps(start, len) {
            return Err(MemErr::BadFree(start.addr()));
        }

        self.link(start, len);
        Ok(())
    }

    /// Removes the smallest extent that is at least `needed` long.  Among
    /// extents of the same length the lowest address wins.
    pub fn remove_best_fit(&mut self, needed: u64) -> Option<(K, u64)> {
        let (&len, starts) = self.by_len.range(needed..).next()?;
        let start = *starts.first()?;
        self.unlink(start, len);
        Some((start, len))
    }

    pub fn remove_exact(&mut self, start: K) -> Option<u64> {
        let len = *self.by_addr.get(&start)?;
        self.unlink(start, len);
        Some(len)
    }

    pub fn find_by_start(&self, start: K) -> Option<u64> {
        self.by_addr.get(&start).copied()
    }

    /// The extent with the highest start strictly below `addr`.
    pub fn find_predecessor(&self, addr: K) -> Option<(K, u64)> {
        self.by_addr
            .range(..addr)
            .next_back()
            .map(|(&s, &l)| (s, l))
    }

    pub fn max_address_extent(&self) -> Option<(K, u64)> {
        self.by_addr.last_key_value().map(|(&s, &l)| (s, l))
    }

    /// Takes `needed` units off the front of the best fitting extent,
    /// returning the remainder to the index.
    pub fn carve(&mut self, needed: u64) -> Option<K> {
        let (start, len) = self.remove_best_fit(needed)?;
        if len > needed {
            self.link(start.offset(needed), len - needed);
        }
        Some(start)
    }

    /// Returns `[start, start + len)` to the free set, merging it with the
    /// extents either side of it if they touch.
    pub fn release(&mut self, start: K, len: u64) -> Result<()> {
        if len == 0 {
            return Err(MemErr::BadParams("cannot free zero length".to_string()));
        }
        if self.overlaps(start, len) {
            return Err(MemErr::BadFree(start.addr()));
        }

        let mut len = len;
        if let Some(succ_len) = self.remove_exact(start.offset(len)) {
            len += succ_len;
        }

        match self.find_predecessor(start) {
            Some((pred, pred_len)) if pred.offset(pred_len) == start => {
                self.unlink(pred, pred_len);
                self.link(pred, pred_len + len);
            }
            _ => self.link(start, len),
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    /// Sum of the lengths of all free extents.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Extents in address order.
    pub fn iter(&self) -> impl Iterator<Item = (K, u64)> + '_ {
        self.by_addr.iter().map(|(&s, &l)| (s, l))
    }

    pub fn clear(&mut self) {
        self.by_addr.clear();
        self.by_len.clear();
        self.total = 0;
    }

    /// Checks both views agree, and that the extents are disjoint and
    /// maximal.
    pub fn check(&self) -> anyhow::Result<()> {
        let mut nr_linked = 0;
        for (&len, starts) in &self.by_len {
            ensure!(!starts.is_empty(), "empty length bucket {}", len);
            for start in starts {
                ensure!(
                    self.by_addr.get(start) == Some(&len),
                    "length view has {:?}+{} but address view disagrees",
                    start,
                    len
                );
                nr_linked += 1;
            }
        }
        ensure!(nr_linked == self.by_addr.len());

        let mut total = 0;
        let mut last_end = None;
        for (&start, &len) in &self.by_addr {
            ensure!(len > 0, "zero length extent at {:?}", start);
            if let Some(end) = last_end {
                ensure!(
                    start.addr() > end,
                    "extent at {:?} overlaps or touches its predecessor",
                    start
                );
            }
            last_end = Some(start.addr() + len);
            total += len;
        }
        ensure!(total == self.total, "total {} != {}", total, self.total);

        Ok(())
    }
}

//-------------------------------------


//-------------------------------------
