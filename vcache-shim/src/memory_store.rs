//! A reference "slow store": the array-file library plus its underlying
//! file system is treated as an opaque external collaborator, so the
//! demo binary and this crate's own tests need *something* that behaves
//! like one. `InMemorySlowStore` plays that role for both the write side
//! (`vcache_pipeline::SlowStore`) and the read side
//! (`vcache_mirror::SlowStoreReader`), backed by one growable byte buffer
//! per dataset rather than an actual file.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use vcache_core::{CacheError, Selection, TypeDescriptor};
use vcache_mirror::SlowStoreReader;
use vcache_pipeline::{SlowStore, SlowStoreRequest, WriteTask};
use vcache_storage::StageHandle;

pub type DatasetHandle = u64;

/// A flat per-dataset byte buffer standing in for the slow store's actual
/// file content.
#[derive(Default)]
pub struct InMemorySlowStore {
    datasets: DashMap<DatasetHandle, Arc<Mutex<Vec<u8>>>>,
}

impl InMemorySlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A read-only snapshot of `dataset`'s simulated slow-store content,
    /// for tests to assert the final on-disk contents against.
    pub fn dataset_bytes(&self, dataset: DatasetHandle) -> Vec<u8> {
        self.datasets
            .get(&dataset)
            .map(|buf| buf.lock().clone())
            .unwrap_or_default()
    }

    fn read_stage_bytes(stage: &StageHandle, offset: u64, len: u64) -> Vec<u8> {
        let (offset, len) = (offset as usize, len as usize);
        match stage {
            StageHandle::FileMmap { mmap, .. } => mmap.lock()[offset..offset + len].to_vec(),
            StageHandle::Ram { buffer } => buffer.lock()[offset..offset + len].to_vec(),
            StageHandle::Device { buffer } => buffer.lock()[offset..offset + len].to_vec(),
            // The global backend's write_into_stage already pushed bytes
            // straight to the aux slow-store file: there is nothing left
            // staged to read back.
            StageHandle::Global { .. } => Vec::new(),
        }
    }

    fn apply_to_dataset(
        slot: &Mutex<Vec<u8>>,
        file_sel: &Selection,
        elem: TypeDescriptor,
        staged: &[u8],
    ) {
        let mut buf = slot.lock();
        let mut src_pos = 0usize;
        for run in file_sel.runs() {
            let dst_start = (run.offset * elem.element_size) as usize;
            let len = (run.length * elem.element_size) as usize;
            if buf.len() < dst_start + len {
                buf.resize(dst_start + len, 0);
            }
            buf[dst_start..dst_start + len].copy_from_slice(&staged[src_pos..src_pos + len]);
            src_pos += len;
        }
    }
}

impl SlowStore for InMemorySlowStore {
    fn submit_write(&self, task: &WriteTask, stage: &StageHandle) -> SlowStoreRequest {
        let staged = if task.size == 0 {
            Vec::new()
        } else {
            Self::read_stage_bytes(stage, task.stage_offset, task.size)
        };
        let file_sel = task.file_sel.clone();
        let elem = task.mem_type;
        let slot = self
            .datasets
            .entry(task.dataset)
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();

        SlowStoreRequest::new(move || {
            if !staged.is_empty() {
                Self::apply_to_dataset(&slot, &file_sel, elem, &staged);
            }
            Ok(())
        })
    }

    fn write_direct(&self, dataset: u64, bytes: &[u8]) -> Result<(), CacheError> {
        let slot = self
            .datasets
            .entry(dataset)
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();
        *slot.lock() = bytes.to_vec();
        Ok(())
    }
}

impl SlowStoreReader for InMemorySlowStore {
    fn read(
        &self,
        dataset: DatasetHandle,
        file_sel: &Selection,
        elem: TypeDescriptor,
        dst: &mut [u8],
    ) -> Result<(), CacheError> {
        let entry = self.datasets.get(&dataset);
        let mut dst_pos = 0usize;
        for run in file_sel.runs() {
            let start = (run.offset * elem.element_size) as usize;
            let len = (run.length * elem.element_size) as usize;
            match &entry {
                Some(buf) => {
                    let buf = buf.lock();
                    let end = (start + len).min(buf.len());
                    let avail = end.saturating_sub(start);
                    dst[dst_pos..dst_pos + avail].copy_from_slice(&buf[start..start + avail]);
                    for b in &mut dst[dst_pos + avail..dst_pos + len] {
                        *b = 0;
                    }
                }
                None => {
                    for b in &mut dst[dst_pos..dst_pos + len] {
                        *b = 0;
                    }
                }
            }
            dst_pos += len;
        }
        Ok(())
    }
}
