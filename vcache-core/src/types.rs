//! Shared value types used across the staging cache: replacement policies,
//! cache purpose/duration, the access-history ring, and the selection
//! contract the storage backends scatter-write against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of timestamps retained in a [`AccessHistory`] ring.
pub const MAX_ACCESS_HISTORY: usize = 1000;

/// Eviction policy a [`crate::config::CacheConfig`] / storage pool is
/// configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplacementPolicy {
    /// Evict the cache whose most recent access timestamp is minimum.
    Lru,
    /// Evict the cache whose first access timestamp is minimum.
    Fifo,
    /// Evict the cache minimizing `(last - first) / count`.
    Lfu,
}

/// What a cache record is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePurpose {
    Read,
    Write,
    ReadWrite,
}

/// Whether a cache record is eligible for eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheDuration {
    /// Pinned for the lifetime of its owner; never evicted.
    Permanent,
    /// Evictable under space pressure.
    Temporal,
}

/// Admission-control mode for [`crate::error::CacheError::OutOfSpace`]
/// handling in `LSM::claim`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimMode {
    /// Fail immediately without side effects if space is unavailable.
    Soft,
    /// Evict temporal caches until space frees up, or fail if that's not
    /// enough.
    Hard,
}

/// Which kind of local storage a pool or backend implementation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    FileMmap,
    Ram,
    Device,
    Global,
}

/// `HDF5_CACHE_STORAGE_SCOPE`: whether the pool is node-local or shared
/// across the cluster via an auxiliary slow-store file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageScope {
    Local,
    Global,
}

/// A ring of up to [`MAX_ACCESS_HISTORY`] access timestamps plus a rolling
/// counter.
///
/// `count` is the lifetime number of accesses recorded (it does not wrap);
/// `timestamps` wraps at `MAX_ACCESS_HISTORY`, overwriting the oldest
/// slot.
#[derive(Debug, Clone)]
pub struct AccessHistory {
    timestamps: Vec<DateTime<Utc>>,
    count: u64,
}

impl AccessHistory {
    /// A fresh ring stamped with one initial access at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            timestamps: vec![now],
            count: 0,
        }
    }

    /// Record an access at `now`, bumping the counter and appending (or
    /// wrapping into) the ring.
    pub fn record(&mut self, now: DateTime<Utc>) {
        self.count += 1;
        let slot = (self.count as usize) % MAX_ACCESS_HISTORY;
        if slot < self.timestamps.len() {
            self.timestamps[slot] = now;
        } else {
            self.timestamps.push(now);
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// The earliest recorded timestamp still held in the ring (used by the
    /// FIFO policy).
    pub fn first(&self) -> DateTime<Utc> {
        self.timestamps[0]
    }

    /// The most recently recorded timestamp (used by the LRU policy).
    pub fn last(&self) -> DateTime<Utc> {
        let slot = (self.count as usize) % MAX_ACCESS_HISTORY;
        if slot < self.timestamps.len() {
            self.timestamps[slot]
        } else {
            *self.timestamps.last().unwrap()
        }
    }

    /// Approximate inverse access frequency used by the LFU policy:
    /// `(last - first) / count`. Returns `f64::INFINITY` for a
    /// single-access cache (never the minimum, so never evicted first).
    pub fn inverse_frequency(&self) -> f64 {
        if self.count == 0 {
            return f64::INFINITY;
        }
        let span = (self.last() - self.first()).num_milliseconds() as f64;
        span / self.count as f64
    }
}

/// One `{offset, length}` run in element units, as produced by walking an
/// abstract multidimensional selection iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionRun {
    pub offset: u64,
    pub length: u64,
}

/// An abstract selection: an ordered set of element-unit runs touched by one
/// I/O call. The storage backends walk this to produce `(offset_in_src,
/// run_length)` pairs for scatter writes/reads; callers are responsible for
/// deriving it from the underlying array-file library's dataspace
/// selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    runs: Vec<SelectionRun>,
}

impl Selection {
    pub fn new(runs: Vec<SelectionRun>) -> Self {
        Self { runs }
    }

    /// A single contiguous run of `count` elements starting at `offset`.
    pub fn contiguous(offset: u64, count: u64) -> Self {
        Self {
            runs: vec![SelectionRun {
                offset,
                length: count,
            }],
        }
    }

    pub fn runs(&self) -> &[SelectionRun] {
        &self.runs
    }

    /// Total element count across all runs.
    pub fn element_count(&self) -> u64 {
        self.runs.iter().map(|r| r.length).sum()
    }

    /// True if this selection is exactly one run (a single regular
    /// hyperslab): the read-mirror fast-path precondition.
    pub fn is_single_contiguous_run(&self) -> bool {
        self.runs.len() == 1
    }

    /// Rewrite this selection to a 1-D contiguous selection of the same
    /// element count, matching how the staged copy is laid out.
    pub fn to_contiguous(&self) -> Self {
        Self::contiguous(0, self.element_count())
    }
}

/// An element/memory type descriptor: just its size, since the core treats
/// datatypes opaquely (their full structure belongs to the array-file
/// library).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub element_size: u64,
}

impl TypeDescriptor {
    pub fn new(element_size: u64) -> Self {
        Self { element_size }
    }

    pub fn size_of(&self, selection: &Selection) -> u64 {
        selection.element_count() * self.element_size
    }
}

/// Transfer properties copied verbatim into a write task; the only
/// property the core itself inspects is whether the transfer is
/// collective, since that affects how drains are scheduled in tests.
#[derive(Debug, Clone, Default)]
pub struct TransferProperties {
    pub collective: bool,
}

/// Round `value` up to the next multiple of `page_size`
/// (`⌈size / page_size⌉ × page_size`).
pub fn round_up_to_page(value: u64, page_size: u64) -> u64 {
    if page_size == 0 {
        return value;
    }
    value.div_ceil(page_size) * page_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_history_wraps_at_ring_size() {
        let mut h = AccessHistory::new(Utc::now());
        for _ in 0..(MAX_ACCESS_HISTORY * 2) {
            h.record(Utc::now());
        }
        assert_eq!(h.count() as usize, MAX_ACCESS_HISTORY * 2);
    }

    #[test]
    fn round_up_page() {
        assert_eq!(round_up_to_page(4097, 4096), 8192);
        assert_eq!(round_up_to_page(4096, 4096), 4096);
        assert_eq!(round_up_to_page(0, 4096), 0);
    }

    #[test]
    fn selection_contiguous_fast_path() {
        let s = Selection::contiguous(0, 128);
        assert!(s.is_single_contiguous_run());
        let multi = Selection::new(vec![
            SelectionRun {
                offset: 0,
                length: 10,
            },
            SelectionRun {
                offset: 20,
                length: 10,
            },
        ]);
        assert!(!multi.is_single_contiguous_run());
        assert_eq!(multi.element_count(), 20);
    }
}
