//! The Storage Backend capability interface: a narrow set of operations
//! the write pipeline and read mirror call, polymorphic over
//! {file-mmap, RAM, device, global-shared}.

use std::path::Path;

use vcache_core::{CacheError, Selection, TypeDescriptor};

/// The just-written (or about-to-be-read) contiguous region a backend
/// hands back from `write_into_stage`. `None` for the global backend,
/// whose write already lands in the slow store with nothing further to
/// migrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpaqueRef {
    pub offset: u64,
    pub length: u64,
}

/// A write-stage handle, opaque to callers above this crate. Each variant
/// owns exactly the resources its backend needs to free on
/// `destroy_write_stage`.
pub enum StageHandle {
    FileMmap {
        mmap: parking_lot::Mutex<memmap2::MmapMut>,
        path: std::path::PathBuf,
    },
    Ram {
        buffer: parking_lot::Mutex<Vec<u8>>,
    },
    /// Host-pinned-memory stand-in: no device/GPU crate is available, so
    /// device staging is emulated with a heap buffer behind the same
    /// capability boundary as the other variants.
    Device {
        buffer: parking_lot::Mutex<Vec<u8>>,
    },
    Global {
        file: parking_lot::Mutex<std::fs::File>,
    },
}

/// A read-mirror handle; same shape as [`StageHandle`] since both are
/// "a backing buffer this backend owns", but kept distinct so a mirror
/// can't accidentally be torn down through the write-stage path.
pub enum MirrorHandle {
    FileMmap {
        mmap: parking_lot::Mutex<memmap2::MmapMut>,
        path: std::path::PathBuf,
    },
    Ram {
        buffer: parking_lot::Mutex<Vec<u8>>,
    },
    Device {
        buffer: parking_lot::Mutex<Vec<u8>>,
    },
    Global {
        file: parking_lot::Mutex<std::fs::File>,
    },
}

/// The four-variant capability set every storage tier implements. Every
/// method returns a typed [`CacheError`].
pub trait StorageBackend: Send + Sync {
    fn create_write_stage(&self, path: &Path, capacity: u64) -> Result<StageHandle, CacheError>;

    /// Scatter `src` into `stage` at `stage_offset`, walking `selection`'s
    /// runs and packing them contiguously in the destination.
    fn write_into_stage(
        &self,
        stage: &StageHandle,
        selection: &Selection,
        elem: TypeDescriptor,
        src: &[u8],
        stage_offset: u64,
    ) -> Result<Option<OpaqueRef>, CacheError>;

    fn destroy_write_stage(&self, stage: StageHandle) -> Result<(), CacheError>;

    fn create_read_mirror(&self, path: &Path, size: u64) -> Result<MirrorHandle, CacheError>;

    fn destroy_read_mirror(&self, mirror: MirrorHandle) -> Result<(), CacheError>;

    /// Drop `mirror`'s backing storage and re-establish it at `size` bytes,
    /// returning a fresh handle. Only the file-mmap backend can do this
    /// meaningfully (unmap, drop the page cache, reopen, remap); every
    /// other backend's buffer just resizes in place, so the default here
    /// rejects the call rather than silently reallocating underneath a
    /// caller that expected the unmap/remap cycle.
    fn remap_read_mirror(
        &self,
        _mirror: MirrorHandle,
        _path: &Path,
        _size: u64,
    ) -> Result<MirrorHandle, CacheError> {
        Err(CacheError::MisconfiguredCache(
            "remap is only supported by the file-mmap backend".into(),
        ))
    }

    fn purge_folder(&self, path: &Path) -> Result<(), CacheError>;
}

/// Walk `selection`'s runs, invoking `f(src_byte_offset, dst_relative_byte_offset,
/// run_len_bytes)` for each, packing runs contiguously at the destination:
/// the shared scatter walk every backend's `write_into_stage` uses.
pub fn for_each_run(
    selection: &Selection,
    elem: TypeDescriptor,
    mut f: impl FnMut(u64, u64, u64),
) {
    let mut dst_offset = 0u64;
    for run in selection.runs() {
        let src_byte_offset = run.offset * elem.element_size;
        let len_bytes = run.length * elem.element_size;
        f(src_byte_offset, dst_offset, len_bytes);
        dst_offset += len_bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcache_core::{Selection, SelectionRun};

    #[test]
    fn run_walk_packs_contiguously() {
        let sel = Selection::new(vec![
            SelectionRun {
                offset: 10,
                length: 4,
            },
            SelectionRun {
                offset: 100,
                length: 2,
            },
        ]);
        let elem = TypeDescriptor::new(4);
        let mut seen = Vec::new();
        for_each_run(&sel, elem, |src, dst, len| seen.push((src, dst, len)));
        assert_eq!(seen, vec![(40, 0, 16), (400, 16, 8)]);
    }
}
