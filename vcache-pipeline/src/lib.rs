//! The Write Pipeline: a FIFO of staged writes that a background actor
//! drains to the slow store in enqueue order, with backpressure when the
//! per-rank stage is full.
//!
//! This does *not* spawn its own worker thread: every enqueued task is
//! submitted to a [`SlowStore`]'s async runtime immediately, and the
//! pipeline only ever waits on the handle that comes back. The FIFO
//! itself is a bounded ring, which gives the same ordering, O(1)
//! enqueue/drain, and deterministic memory use.

mod ring;
mod slow_store;
mod task;

pub use ring::TaskRing;
pub use slow_store::{SlowStore, SlowStoreRequest};
pub use task::{TaskId, WriteTask};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};
use vcache_core::{round_up_to_page, CacheError, Selection, TransferProperties, TypeDescriptor};
use vcache_storage::{OpaqueRef, StorageBackend};

const PAGE_SIZE: u64 = 4096;

/// A dataset-scoped handle the Interposing Shim passes into `write`/
/// `flush`; the pipeline never interprets it beyond using it as a grouping
/// key for per-dataset flush.
pub type DatasetHandle = u64;

/// A single rank's FIFO task queue plus the per-rank stage bookkeeping.
pub struct WritePipeline {
    backend: Arc<dyn StorageBackend>,
    stage: Arc<vcache_storage::StageHandle>,
    slow_store: Arc<dyn SlowStore>,
    per_rank_total: u64,
    per_rank_remaining: AtomicU64,
    stage_offset: Mutex<u64>,
    ring: Mutex<TaskRing>,
    next_id: AtomicU64,
    paused: AtomicBool,
    /// Ids currently in flight per dataset, for `flush(dset)` to wait on
    /// exactly its own tasks without touching unrelated ones.
    dataset_tasks: Mutex<HashMap<DatasetHandle, HashSet<TaskId>>>,
    /// A `SlowStoreError` latched from a background drain, surfaced at the
    /// next `flush*` boundary.
    latched_error: Mutex<Option<String>>,
}

impl WritePipeline {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        stage: vcache_storage::StageHandle,
        slow_store: Arc<dyn SlowStore>,
        per_rank_total: u64,
    ) -> Self {
        Self {
            backend,
            stage: Arc::new(stage),
            slow_store,
            per_rank_total,
            per_rank_remaining: AtomicU64::new(per_rank_total),
            stage_offset: Mutex::new(0),
            ring: Mutex::new(TaskRing::new()),
            next_id: AtomicU64::new(1),
            paused: AtomicBool::new(false),
            dataset_tasks: Mutex::new(HashMap::new()),
            latched_error: Mutex::new(None),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Lift the pause hold. Every task enqueued while paused was staged
    /// but never submitted to the slow store; resume submits all of them
    /// now, oldest first, then allows drains to proceed again.
    pub fn resume(&self) {
        let stage = &self.stage;
        let slow_store = &self.slow_store;
        self.ring
            .lock()
            .fill_pending(|task| slow_store.submit_write(task, stage));
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Bytes still free in this rank's stage.
    pub fn bytes_remaining(&self) -> u64 {
        self.per_rank_remaining.load(Ordering::SeqCst)
    }

    pub fn queue_len(&self) -> usize {
        self.ring.lock().len()
    }

    /// Enqueue algorithm: stage the bytes, record the task, submit it to
    /// the slow store. Falls back to a direct synchronous slow-store
    /// write when the stage can never free enough room even once fully
    /// drained.
    pub fn write(
        &self,
        dset: DatasetHandle,
        mem_type: TypeDescriptor,
        mem_sel: Selection,
        file_sel: Selection,
        xfer_props: TransferProperties,
        src: &[u8],
    ) -> Result<TaskId, CacheError> {
        let size = mem_type.size_of(&mem_sel);
        let rounded = round_up_to_page(size, PAGE_SIZE);

        if size > 0 {
            if self.bytes_remaining() < rounded {
                self.drain_until_dry_or(|remaining| remaining >= rounded)?;
            }
            if self.bytes_remaining() < rounded {
                return self.write_direct_fallback(dset, src);
            }
        }

        let mut offset_guard = self.stage_offset.lock();
        if *offset_guard + rounded > self.per_rank_total {
            // Wrap-around: drain enough that nothing live sits past the
            // wrap point, then restart the stage cursor at zero.
            drop(offset_guard);
            self.drain_until_dry_or(|_| false)?;
            offset_guard = self.stage_offset.lock();
            *offset_guard = 0;
        }
        let stage_offset = *offset_guard;

        let opaque: Option<OpaqueRef> = if size == 0 {
            None
        } else {
            self.backend
                .write_into_stage(&self.stage, &mem_sel, mem_type, src, stage_offset)?
        };

        *offset_guard += rounded;
        drop(offset_guard);

        self.per_rank_remaining.fetch_sub(rounded, Ordering::SeqCst);

        let id = TaskId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let paused_at_enqueue = self.paused.load(Ordering::SeqCst);
        let task = WriteTask {
            id,
            dataset: dset,
            mem_type,
            // The staged copy is contiguous: rewrite the memory selection
            // to a 1-D contiguous run of the same element count.
            mem_sel: mem_sel.to_contiguous(),
            file_sel,
            xfer_props,
            stage_offset,
            size,
            rounded_size: rounded,
            opaque,
            paused_at_enqueue,
        };

        self.dataset_tasks
            .lock()
            .entry(dset)
            .or_default()
            .insert(id);

        // While paused, withhold submission: the task sits in the ring with
        // no request until `resume` submits it. This is what keeps a paused
        // pipeline's writes unobserved at the slow store.
        let request = if paused_at_enqueue {
            None
        } else {
            Some(self.slow_store.submit_write(&task, &self.stage))
        };
        self.ring.lock().push(task, request);

        info!(task = id.0, dataset = dset, bytes = size, paused = paused_at_enqueue, "write staged");
        Ok(id)
    }

    /// The queue is empty and the stage still has no room: bypass staging
    /// entirely. A synthetic task id is still consumed so id ordering
    /// stays monotone across both staged and fallback writes.
    fn write_direct_fallback(&self, dset: DatasetHandle, src: &[u8]) -> Result<TaskId, CacheError> {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::SeqCst));
        warn!(
            task = id.0,
            dataset = dset,
            "stage has no room even after a full drain; falling back to a synchronous slow-store write"
        );
        self.slow_store.write_direct(dset, src)?;
        Ok(id)
    }

    /// Block until `dset`'s every outstanding task completes.
    pub fn flush(&self, dset: DatasetHandle) -> Result<(), CacheError> {
        loop {
            let still_pending = self
                .dataset_tasks
                .lock()
                .get(&dset)
                .map(|s| !s.is_empty())
                .unwrap_or(false);
            if !still_pending {
                break;
            }
            if !self.drain_one()? {
                break;
            }
        }
        self.surface_latched_error()
    }

    /// Block until every queued task on this file completes. Idempotent:
    /// calling it with an empty ring is a no-op.
    pub fn flush_all(&self) -> Result<(), CacheError> {
        while self.drain_one()? {}
        self.surface_latched_error()
    }

    fn surface_latched_error(&self) -> Result<(), CacheError> {
        if let Some(msg) = self.latched_error.lock().take() {
            return Err(CacheError::SlowStoreError(msg));
        }
        Ok(())
    }

    /// Drain oldest-first until `done(remaining_bytes)` is true or the ring
    /// is empty.
    fn drain_until_dry_or(&self, done: impl Fn(u64) -> bool) -> Result<(), CacheError> {
        loop {
            if done(self.per_rank_remaining.load(Ordering::SeqCst)) {
                return Ok(());
            }
            if !self.drain_one()? {
                return Ok(());
            }
        }
    }

    /// Wait on the oldest outstanding task, reclaim its stage region, and
    /// advance `current`. Returns `false` if the ring was already empty or
    /// if the pipeline is paused (a paused pipeline's oldest entry may
    /// still be awaiting submission from `resume`, so draining stands down
    /// entirely rather than risk waiting on one that isn't there yet).
    fn drain_one(&self) -> Result<bool, CacheError> {
        if self.paused.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let popped = self.ring.lock().pop();
        let Some((task, request)) = popped else {
            return Ok(false);
        };
        let request = request.expect("unpaused ring entry missing a submitted request");
        if let Err(err) = request.wait() {
            warn!(task = task.id.0, error = %err, "slow-store write failed during drain");
            *self.latched_error.lock() = Some(err);
        }
        self.per_rank_remaining
            .fetch_add(task.rounded_size, Ordering::SeqCst);

        if let Some(set) = self.dataset_tasks.lock().get_mut(&task.dataset) {
            set.remove(&task.id);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slow_store::tests::InstantSlowStore;
    use vcache_core::SelectionRun;
    use vcache_storage::RamBackend;

    fn pipeline(total: u64) -> WritePipeline {
        let backend: Arc<dyn StorageBackend> = Arc::new(RamBackend::default());
        let stage = backend
            .create_write_stage(std::path::Path::new("/unused"), total)
            .unwrap();
        WritePipeline::new(backend, stage, Arc::new(InstantSlowStore), total)
    }

    #[test]
    fn enqueue_returns_without_blocking_on_slow_store() {
        let p = pipeline(4096);
        let elem = TypeDescriptor::new(4);
        let sel = Selection::contiguous(0, 16);
        let src: Vec<u8> = (0u8..64).collect();
        let id = p
            .write(1, elem, sel.clone(), sel, TransferProperties::default(), &src)
            .unwrap();
        assert_eq!(id, TaskId(1));
    }

    #[test]
    fn task_ids_strictly_increase_and_flush_all_is_idempotent() {
        let p = pipeline(1 << 20);
        let elem = TypeDescriptor::new(4);
        let sel = Selection::contiguous(0, 4);
        let src: Vec<u8> = vec![0u8; 16];
        let mut last = 0u64;
        for _ in 0..5 {
            let id = p
                .write(1, elem, sel.clone(), sel.clone(), TransferProperties::default(), &src)
                .unwrap();
            assert!(id.0 > last);
            last = id.0;
        }
        p.flush_all().unwrap();
        p.flush_all().unwrap(); // idempotent on an empty ring
    }

    #[test]
    fn empty_selection_write_still_advances_id_counter() {
        let p = pipeline(4096);
        let elem = TypeDescriptor::new(4);
        let empty = Selection::new(vec![]);
        let id1 = p
            .write(1, elem, empty.clone(), empty.clone(), TransferProperties::default(), &[])
            .unwrap();
        let id2 = p
            .write(1, elem, empty.clone(), empty, TransferProperties::default(), &[])
            .unwrap();
        assert_eq!(id2.0, id1.0 + 1);
    }

    #[test]
    fn drain_reclaims_space_for_wraparound() {
        let p = pipeline(8192);
        let elem = TypeDescriptor::new(4);
        let sel = Selection::new(vec![SelectionRun {
            offset: 0,
            length: 1024,
        }]);
        let src: Vec<u8> = vec![0u8; 4096];
        // Each write rounds to one page (4096 bytes for 1024 * 4-byte
        // elements); three writes exceed 8192 and force a drain + wrap.
        for _ in 0..3 {
            p.write(1, elem, sel.clone(), sel.clone(), TransferProperties::default(), &src)
                .unwrap();
        }
        p.flush_all().unwrap();
        assert_eq!(p.bytes_remaining(), 8192);
    }

    #[test]
    fn pause_withholds_drain_until_resume() {
        let backend: Arc<dyn StorageBackend> = Arc::new(RamBackend::default());
        let total = 1 << 20;
        let stage = backend
            .create_write_stage(std::path::Path::new("/unused"), total)
            .unwrap();
        let store = Arc::new(slow_store::tests::CountingSlowStore::default());
        let p = WritePipeline::new(backend, stage, store.clone(), total);

        p.pause();
        let elem = TypeDescriptor::new(4);
        let sel = Selection::contiguous(0, 4);
        let src: Vec<u8> = vec![0u8; 16];
        for _ in 0..16 {
            p.write(1, elem, sel.clone(), sel.clone(), TransferProperties::default(), &src)
                .unwrap();
        }
        assert_eq!(p.queue_len(), 16);
        // Nothing has landed at the slow store: pause withholds submission
        // itself, so a flush attempt here would have nothing to wait on.
        assert_eq!(store.completed.load(Ordering::SeqCst), 0);

        p.resume();
        p.flush_all().unwrap();
        assert_eq!(p.queue_len(), 0);
        assert_eq!(store.completed.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn stage_overflow_falls_back_to_synchronous_write() {
        // Per-rank stage smaller than a single batch: the batch can never
        // fit even fully drained, so the write must succeed via
        // fallback.
        let p = pipeline(1 << 20);
        let elem = TypeDescriptor::new(4);
        let huge = Selection::contiguous(0, (2 << 20) / 4);
        let src: Vec<u8> = vec![0u8; 2 << 20];
        p.write(1, elem, huge.clone(), huge, TransferProperties::default(), &src)
            .unwrap();
    }
}
