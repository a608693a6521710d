//! The Read Mirror: a per-dataset distributed cache laid out across
//! ranks, populated by put-on-first-read and served by
//! get-on-subsequent-read.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use vcache_core::{CacheError, Selection, TypeDescriptor};
use vcache_storage::{MirrorHandle, StorageBackend};

use crate::partition::SamplePartition;
use crate::reader::{DatasetHandle, SlowStoreReader};
use crate::window::{fenced_phase, RmaWindow};

/// The backing storage a file-mmap-backed mirror needs to remap itself,
/// handed over by the caller that originally opened the mirror (the File
/// Cache) via [`ReadMirror::enable_remap`].
struct RemapSupport {
    backend: Arc<dyn StorageBackend>,
    handle: MirrorHandle,
    path: PathBuf,
    size: u64,
}

/// An in-flight (or already-completed) slow-store read, same shape as
/// `vcache_pipeline::SlowStoreRequest`: submit once, wait once, never spawn
/// a private worker.
pub struct ReadRequest {
    inner: Box<dyn FnOnce() -> Result<(), String> + Send>,
}

impl ReadRequest {
    pub fn new(op: impl FnOnce() -> Result<(), String> + Send + 'static) -> Self {
        Self { inner: Box::new(op) }
    }

    pub fn wait(self) -> Result<(), CacheError> {
        (self.inner)().map_err(CacheError::SlowStoreError)
    }
}

/// An ordered list of global sample indices touched by one read call, plus
/// whether they form a contiguous hyperslab.
#[derive(Debug, Clone)]
pub struct Batch {
    pub samples: Vec<u64>,
    pub contiguous: bool,
}

impl Batch {
    /// Build a batch from a list of global sample indices, computing the
    /// contiguous-hyperslab flag itself.
    pub fn new(samples: Vec<u64>) -> Self {
        let contiguous = samples.windows(2).all(|w| w[1] == w[0] + 1);
        Self { samples, contiguous }
    }
}

/// Per-dataset mirror state machine: `empty` has never accepted a read;
/// `partially_cached` has cached some but not all of this rank's
/// partition; `fully_cached` means every rank has finished its own
/// partition, confirmed by a collective AND.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorState {
    Empty,
    PartiallyCached,
    FullyCached,
}

/// Sample shape: dimension count plus per-sample geometry.
#[derive(Debug, Clone, Copy)]
pub struct SampleShape {
    pub dims: usize,
    pub elements_per_sample: u64,
    pub bytes_per_element: u64,
}

impl SampleShape {
    pub fn sample_bytes(&self) -> u64 {
        self.elements_per_sample * self.bytes_per_element
    }
}

pub struct ReadMirror {
    dataset: DatasetHandle,
    shape: SampleShape,
    total_samples: u64,
    partition: SamplePartition,
    window: Arc<dyn RmaWindow>,
    samples_cached: AtomicU64,
    state: Mutex<MirrorState>,
    prefetch_block_bytes: u64,
    /// Disabled after a `WindowError`: once tripped, every read falls
    /// through to a plain pass-through by the caller (the Interposing
    /// Shim), not to this mirror.
    disabled: std::sync::atomic::AtomicBool,
    /// Present only for a file-mmap-backed mirror; `None` for every other
    /// backend, and for a file-mmap mirror whose handle was already
    /// reclaimed via `take_remap_handle`.
    remap_support: Mutex<Option<RemapSupport>>,
}

impl ReadMirror {
    pub fn new(
        dataset: DatasetHandle,
        shape: SampleShape,
        total_samples: u64,
        window: Arc<dyn RmaWindow>,
        prefetch_block_bytes: u64,
    ) -> Self {
        let partition = SamplePartition::new(total_samples, window.num_ranks() as u32);
        Self {
            dataset,
            shape,
            total_samples,
            partition,
            window,
            samples_cached: AtomicU64::new(0),
            state: Mutex::new(MirrorState::Empty),
            prefetch_block_bytes,
            disabled: std::sync::atomic::AtomicBool::new(false),
            remap_support: Mutex::new(None),
        }
    }

    pub fn state(&self) -> MirrorState {
        *self.state.lock()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Hand this mirror ownership of its file-mmap backing storage so it
    /// can remap itself later. Only meaningful for a file-mmap-backed
    /// mirror; the File Cache calls this once, right after
    /// `create_read_mirror`, instead of holding the handle itself.
    pub fn enable_remap(&self, backend: Arc<dyn StorageBackend>, handle: MirrorHandle, path: PathBuf, size: u64) {
        *self.remap_support.lock() = Some(RemapSupport {
            backend,
            handle,
            path,
            size,
        });
    }

    /// Unmap the current backing file, drop its page-cache pages, reopen
    /// it at the same size, and remap. Meaningful only for a dataset grown
    /// (or rewritten) on the slow store between reads; every other backend
    /// resizes its buffer in place and has nothing to remap.
    pub fn remap(&self) -> Result<(), CacheError> {
        let mut guard = self.remap_support.lock();
        let support = guard.take().ok_or_else(|| {
            CacheError::MisconfiguredCache(
                "remap requires a file-mmap-backed mirror with enable_remap called".into(),
            )
        })?;
        let fresh = support.backend.remap_read_mirror(support.handle, &support.path, support.size)?;
        *guard = Some(RemapSupport {
            backend: support.backend,
            handle: fresh,
            path: support.path,
            size: support.size,
        });
        Ok(())
    }

    /// Reclaim the backing handle for teardown, leaving this mirror unable
    /// to remap again. Used by the File Cache's `close_dataset` when it
    /// handed the handle over via `enable_remap` instead of keeping it.
    pub fn take_remap_handle(&self) -> Option<(Arc<dyn StorageBackend>, MirrorHandle)> {
        self.remap_support
            .lock()
            .take()
            .map(|support| (support.backend, support.handle))
    }

    fn my_rank(&self) -> u32 {
        self.window.rank() as u32
    }

    /// Split this rank's sample partition into sub-blocks no larger than
    /// `prefetch_block_bytes` and submit one read-then-self-put per block,
    /// `⌈size/block⌉` sub-blocks plus one remainder.
    pub fn prefetch(&self, reader: Arc<dyn SlowStoreReader>) -> Vec<ReadRequest> {
        let range = self.partition.range_of_rank(self.my_rank());
        let sample_bytes = self.shape.sample_bytes();
        let block_samples = (self.prefetch_block_bytes / sample_bytes.max(1)).max(1);

        let mut requests = Vec::new();
        let mut cursor = range.start;
        while cursor < range.end {
            let block_len = block_samples.min(range.end - cursor);
            let block_start = cursor;
            let range_start = range.start;
            let dataset = self.dataset;
            let elem = TypeDescriptor::new(self.shape.bytes_per_element);
            let elements_per_sample = self.shape.elements_per_sample;
            let bytes_per_element = self.shape.bytes_per_element;
            let reader = reader.clone();
            let window = self.window.clone();

            requests.push(ReadRequest::new(move || {
                let file_sel = Selection::contiguous(
                    block_start * elements_per_sample,
                    block_len * elements_per_sample,
                );
                let mut buf = vec![0u8; (block_len * elements_per_sample * bytes_per_element) as usize];
                reader
                    .read(dataset, &file_sel, elem, &mut buf)
                    .map_err(|e| e.to_string())?;
                let byte_offset = (block_start - range_start) * elements_per_sample * bytes_per_element;
                let rank = window.rank();
                window
                    .put(rank, byte_offset, &buf)
                    .map_err(|e| e.to_string())?;
                Ok(())
            }));
            cursor += block_len;
        }
        requests
    }

    /// Wait for every sub-block a prior `prefetch` call returned.
    pub fn prefetch_wait(&self, requests: Vec<ReadRequest>) -> Result<(), CacheError> {
        for r in requests {
            r.wait()?;
        }
        Ok(())
    }

    /// Blocking slow-store read into `dst_buf`, then one-sided-put the
    /// batch to its owners; update `samples_cached`; decide `dataset_cached`
    /// via a collective AND.
    pub fn read_to_cache(
        &self,
        reader: &dyn SlowStoreReader,
        batch: &Batch,
        file_sel: &Selection,
        dst: &mut [u8],
    ) -> Result<(), CacheError> {
        let elem = TypeDescriptor::new(self.shape.bytes_per_element);
        reader.read(self.dataset, file_sel, elem, dst)?;
        self.scatter_batch_to_owners(batch, dst)?;

        self.samples_cached
            .fetch_add(batch.samples.len() as u64, Ordering::SeqCst);
        let locally_done = self.samples_cached.load(Ordering::SeqCst)
            >= self.partition.samples_for_rank(self.my_rank());
        let fully = self.window.allreduce_and(locally_done);

        let mut state = self.state.lock();
        *state = if fully {
            MirrorState::FullyCached
        } else {
            MirrorState::PartiallyCached
        };
        Ok(())
    }

    /// One-sided-get path for a fully (or partially, for already-cached
    /// samples) populated mirror.
    pub fn read_from_cache(&self, batch: &Batch, dst: &mut [u8]) -> Result<(), CacheError> {
        let result = self.read_from_cache_inner(batch, dst);
        if let Err(CacheError::WindowError(err)) = &result {
            tracing::warn!(dataset = self.dataset, error = %err, "read mirror window failed, disabling mirror");
            self.disabled.store(true, Ordering::SeqCst);
        }
        result
    }

    fn read_from_cache_inner(&self, batch: &Batch, dst: &mut [u8]) -> Result<(), CacheError> {
        let sample_bytes = self.shape.sample_bytes();
        let _phase = fenced_phase(self.window.as_ref(), true);

        if batch.contiguous && self.single_owner(batch) {
            let first = batch.samples[0];
            let (owner, local_elem_offset) = self
                .partition
                .owner_and_local_offset(first, self.shape.elements_per_sample);
            let byte_offset = local_elem_offset * self.shape.bytes_per_element;
            let total_bytes = (sample_bytes * batch.samples.len() as u64) as usize;
            self.window
                .get(owner as i32, byte_offset, &mut dst[..total_bytes])?;
        } else {
            for (i, &s) in batch.samples.iter().enumerate() {
                let (owner, local_elem_offset) = self
                    .partition
                    .owner_and_local_offset(s, self.shape.elements_per_sample);
                let byte_offset = local_elem_offset * self.shape.bytes_per_element;
                let start = i * sample_bytes as usize;
                let end = start + sample_bytes as usize;
                self.window
                    .get(owner as i32, byte_offset, &mut dst[start..end])?;
            }
        }
        Ok(())
    }

    fn scatter_batch_to_owners(&self, batch: &Batch, src: &[u8]) -> Result<(), CacheError> {
        let sample_bytes = self.shape.sample_bytes();
        let _phase = fenced_phase(self.window.as_ref(), false);

        if batch.contiguous && self.single_owner(batch) {
            let first = batch.samples[0];
            let (owner, local_elem_offset) = self
                .partition
                .owner_and_local_offset(first, self.shape.elements_per_sample);
            let byte_offset = local_elem_offset * self.shape.bytes_per_element;
            let total_bytes = (sample_bytes * batch.samples.len() as u64) as usize;
            self.window.put(owner as i32, byte_offset, &src[..total_bytes])?;
        } else {
            for (i, &s) in batch.samples.iter().enumerate() {
                let (owner, local_elem_offset) = self
                    .partition
                    .owner_and_local_offset(s, self.shape.elements_per_sample);
                let byte_offset = local_elem_offset * self.shape.bytes_per_element;
                let start = i * sample_bytes as usize;
                let end = start + sample_bytes as usize;
                self.window.put(owner as i32, byte_offset, &src[start..end])?;
            }
        }
        Ok(())
    }

    /// The contiguous-read fast path is only correct when every sample in
    /// the batch is owned by the same rank (verified here before the
    /// caller takes it).
    fn single_owner(&self, batch: &Batch) -> bool {
        match (batch.samples.first(), batch.samples.last()) {
            (Some(&first), Some(&last)) => self.partition.owner_of(first) == self.partition.owner_of(last),
            _ => false,
        }
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn partition(&self) -> SamplePartition {
        self.partition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::tests::PatternReader;
    use crate::window::local::{LocalRmaFabric, LocalRmaWindow};

    fn single_rank_mirror(total_samples: u64, elements_per_sample: u64) -> ReadMirror {
        let shape = SampleShape {
            dims: 1,
            elements_per_sample,
            bytes_per_element: 4,
        };
        let fabric = LocalRmaFabric::new(1, (total_samples * elements_per_sample * 4) as usize);
        let window: Arc<dyn RmaWindow> = Arc::new(LocalRmaWindow::new(fabric, 0));
        ReadMirror::new(1, shape, total_samples, window, 1 << 30)
    }

    #[test]
    fn read_to_cache_then_read_from_cache_round_trips() {
        let mirror = single_rank_mirror(8, 4);
        let reader = PatternReader;
        let batch = Batch::new(vec![0, 1, 2, 3]);
        let file_sel = Selection::contiguous(0, 16);

        let mut via_to_cache = vec![0u8; 64];
        mirror
            .read_to_cache(&reader, &batch, &file_sel, &mut via_to_cache)
            .unwrap();

        let mut via_from_cache = vec![0u8; 64];
        mirror.read_from_cache(&batch, &mut via_from_cache).unwrap();

        assert_eq!(via_to_cache, via_from_cache);
    }

    #[test]
    fn remap_swaps_in_a_fresh_handle_and_reclaims_it_on_teardown() {
        use vcache_storage::FileMmapBackend;

        let mirror = single_rank_mirror(4, 2);
        let backend: Arc<dyn StorageBackend> = Arc::new(FileMmapBackend);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dset-mmap-0.dat");
        let handle = backend.create_read_mirror(&path, 16).unwrap();

        mirror.enable_remap(backend.clone(), handle, path.clone(), 16);
        mirror.remap().unwrap();
        mirror.remap().unwrap();

        let (backend_back, handle_back) = mirror.take_remap_handle().unwrap();
        backend_back.destroy_read_mirror(handle_back).unwrap();
        assert!(mirror.take_remap_handle().is_none());
    }

    #[test]
    fn remap_without_enable_remap_errors() {
        let mirror = single_rank_mirror(4, 2);
        assert!(mirror.remap().is_err());
    }

    #[test]
    fn fully_cached_after_single_rank_reads_entire_partition() {
        let mirror = single_rank_mirror(4, 2);
        let reader = PatternReader;
        let batch = Batch::new(vec![0, 1, 2, 3]);
        let file_sel = Selection::contiguous(0, 8);
        let mut buf = vec![0u8; 32];
        mirror.read_to_cache(&reader, &batch, &file_sel, &mut buf).unwrap();
        assert_eq!(mirror.state(), MirrorState::FullyCached);
    }

    #[test]
    fn partially_cached_before_whole_partition_seen() {
        let mirror = single_rank_mirror(8, 2);
        let reader = PatternReader;
        let batch = Batch::new(vec![0, 1]);
        let file_sel = Selection::contiguous(0, 4);
        let mut buf = vec![0u8; 16];
        mirror.read_to_cache(&reader, &batch, &file_sel, &mut buf).unwrap();
        assert_eq!(mirror.state(), MirrorState::PartiallyCached);
    }

    #[test]
    fn prefetch_splits_into_sub_blocks_above_threshold() {
        let shape = SampleShape {
            dims: 1,
            elements_per_sample: 1,
            bytes_per_element: 1,
        };
        let fabric = LocalRmaFabric::new(1, 100);
        let window: Arc<dyn RmaWindow> = Arc::new(LocalRmaWindow::new(fabric, 0));
        // 10 bytes per sample worth of "1 GiB" threshold shrunk to 4 bytes
        // per block so 10 samples split into 3 sub-blocks (4 + 4 + 2).
        let mirror = ReadMirror::new(1, shape, 10, window, 4);
        let reader: Arc<dyn SlowStoreReader> = Arc::new(PatternReader);
        let requests = mirror.prefetch(reader);
        assert_eq!(requests.len(), 3);
        mirror.prefetch_wait(requests).unwrap();
    }

    #[test]
    fn non_contiguous_batch_falls_back_to_per_sample_puts() {
        let mirror = single_rank_mirror(8, 2);
        let reader = PatternReader;
        let batch = Batch::new(vec![0, 3, 5]);
        assert!(!batch.contiguous);
        let file_sel = Selection::new(vec![
            vcache_core::SelectionRun { offset: 0, length: 2 },
            vcache_core::SelectionRun { offset: 6, length: 2 },
            vcache_core::SelectionRun { offset: 10, length: 2 },
        ]);
        let mut buf = vec![0u8; 24];
        mirror.read_to_cache(&reader, &batch, &file_sel, &mut buf).unwrap();

        let mut out = vec![0u8; 24];
        mirror.read_from_cache(&batch, &mut out).unwrap();
        assert_eq!(buf, out);
    }
}
