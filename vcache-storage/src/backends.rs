//! The four Storage Backend implementations: file-backed mmap, RAM,
//! device (emulated), and global-shared.

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use memmap2::MmapMut;
use parking_lot::Mutex;
use vcache_core::{CacheError, Selection, TypeDescriptor};

use crate::backend::{for_each_run, MirrorHandle, OpaqueRef, StageHandle, StorageBackend};

fn io_err(context: &str, source: std::io::Error) -> CacheError {
    CacheError::StageWriteError {
        context: context.to_string(),
        source,
    }
}

/// Pre-extend `path` to `size` bytes via a single one-byte write at
/// `size - 1`, then map it.
fn create_and_map(path: &Path, size: u64) -> Result<MmapMut, CacheError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err("create stage directory", e))?;
    }
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| io_err("open stage file", e))?;
    if size > 0 {
        file.seek(SeekFrom::Start(size - 1))
            .map_err(|e| io_err("extend stage file", e))?;
        file.write_all(&[0u8])
            .map_err(|e| io_err("extend stage file", e))?;
    }
    // SAFETY: the file is exclusively owned by this stage/mirror for its
    // lifetime; no other process maps the same path concurrently.
    unsafe { MmapMut::map_mut(&file) }.map_err(|e| io_err("mmap stage file", e))
}

/// Reopen an existing mirror file and resize it to `size` bytes without
/// truncating, preserving whatever was already cached there, then map it.
/// Used by `remap_read_mirror`: a plain `create_and_map` would zero the
/// region a grown mirror is meant to keep.
fn extend_and_remap(path: &Path, size: u64) -> Result<MmapMut, CacheError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| io_err("reopen mirror file for remap", e))?;
    file.set_len(size).map_err(|e| io_err("resize mirror file for remap", e))?;
    // SAFETY: same invariant as `create_and_map`, the file is exclusively
    // owned by this mirror for its lifetime.
    unsafe { MmapMut::map_mut(&file) }.map_err(|e| io_err("remap mirror file", e))
}

/// `file-mmap` column: positioned writes into a memory-mapped stage file,
/// unlinked on teardown.
#[derive(Default)]
pub struct FileMmapBackend;

impl StorageBackend for FileMmapBackend {
    fn create_write_stage(&self, path: &Path, capacity: u64) -> Result<StageHandle, CacheError> {
        let mmap = create_and_map(path, capacity)?;
        Ok(StageHandle::FileMmap {
            mmap: Mutex::new(mmap),
            path: path.to_path_buf(),
        })
    }

    fn write_into_stage(
        &self,
        stage: &StageHandle,
        selection: &Selection,
        elem: TypeDescriptor,
        src: &[u8],
        stage_offset: u64,
    ) -> Result<Option<OpaqueRef>, CacheError> {
        let StageHandle::FileMmap { mmap, .. } = stage else {
            return Err(CacheError::MisconfiguredCache(
                "file-mmap backend given a non-file-mmap stage handle".into(),
            ));
        };
        let mut mmap = mmap.lock();
        let mut total = 0u64;
        for_each_run(selection, elem, |src_off, dst_off, len| {
            let start = (stage_offset + dst_off) as usize;
            let end = start + len as usize;
            mmap[start..end].copy_from_slice(&src[src_off as usize..src_off as usize + len as usize]);
            total += len;
        });
        Ok(Some(OpaqueRef {
            offset: stage_offset,
            length: total,
        }))
    }

    fn destroy_write_stage(&self, stage: StageHandle) -> Result<(), CacheError> {
        let StageHandle::FileMmap { path, .. } = &stage else {
            return Err(CacheError::MisconfiguredCache(
                "file-mmap backend given a non-file-mmap stage handle".into(),
            ));
        };
        fs::remove_file(path).map_err(|e| io_err("unlink stage file", e))
    }

    fn create_read_mirror(&self, path: &Path, size: u64) -> Result<MirrorHandle, CacheError> {
        let mmap = create_and_map(path, size)?;
        Ok(MirrorHandle::FileMmap {
            mmap: Mutex::new(mmap),
            path: path.to_path_buf(),
        })
    }

    fn destroy_read_mirror(&self, mirror: MirrorHandle) -> Result<(), CacheError> {
        let MirrorHandle::FileMmap { path, .. } = &mirror else {
            return Err(CacheError::MisconfiguredCache(
                "file-mmap backend given a non-file-mmap mirror handle".into(),
            ));
        };
        fs::remove_file(path).map_err(|e| io_err("unlink mirror file", e))
    }

    fn remap_read_mirror(
        &self,
        mirror: MirrorHandle,
        path: &Path,
        size: u64,
    ) -> Result<MirrorHandle, CacheError> {
        let MirrorHandle::FileMmap { mmap, .. } = &mirror else {
            return Err(CacheError::MisconfiguredCache(
                "file-mmap backend given a non-file-mmap mirror handle".into(),
            ));
        };
        // Best-effort: ask the kernel to drop this mapping's pages before
        // the unmap, so a grown file is read back from disk rather than a
        // stale cached copy. Advisory only, a failure here doesn't block
        // the remap itself.
        if let Err(err) = mmap.lock().advise(memmap2::Advice::DontNeed) {
            tracing::warn!(path = %path.display(), error = %err, "failed to advise page cache drop before remap");
        }
        drop(mirror);
        extend_and_remap(path, size).map(|mmap| MirrorHandle::FileMmap {
            mmap: Mutex::new(mmap),
            path: path.to_path_buf(),
        })
    }

    fn purge_folder(&self, path: &Path) -> Result<(), CacheError> {
        if path.exists() {
            fs::remove_dir_all(path).map_err(|e| io_err("purge cache folder", e))?;
        }
        Ok(())
    }
}

/// `RAM` column: heap-allocated stage/mirror buffers, scatter-copied.
#[derive(Default)]
pub struct RamBackend;

impl StorageBackend for RamBackend {
    fn create_write_stage(&self, _path: &Path, capacity: u64) -> Result<StageHandle, CacheError> {
        Ok(StageHandle::Ram {
            buffer: Mutex::new(vec![0u8; capacity as usize]),
        })
    }

    fn write_into_stage(
        &self,
        stage: &StageHandle,
        selection: &Selection,
        elem: TypeDescriptor,
        src: &[u8],
        stage_offset: u64,
    ) -> Result<Option<OpaqueRef>, CacheError> {
        let StageHandle::Ram { buffer } = stage else {
            return Err(CacheError::MisconfiguredCache(
                "RAM backend given a non-RAM stage handle".into(),
            ));
        };
        let mut buffer = buffer.lock();
        let mut total = 0u64;
        for_each_run(selection, elem, |src_off, dst_off, len| {
            let start = (stage_offset + dst_off) as usize;
            let end = start + len as usize;
            buffer[start..end].copy_from_slice(&src[src_off as usize..src_off as usize + len as usize]);
            total += len;
        });
        Ok(Some(OpaqueRef {
            offset: stage_offset,
            length: total,
        }))
    }

    fn destroy_write_stage(&self, _stage: StageHandle) -> Result<(), CacheError> {
        Ok(())
    }

    fn create_read_mirror(&self, _path: &Path, size: u64) -> Result<MirrorHandle, CacheError> {
        Ok(MirrorHandle::Ram {
            buffer: Mutex::new(vec![0u8; size as usize]),
        })
    }

    fn destroy_read_mirror(&self, _mirror: MirrorHandle) -> Result<(), CacheError> {
        Ok(())
    }

    fn purge_folder(&self, _path: &Path) -> Result<(), CacheError> {
        Ok(())
    }
}

/// `device` column. No device/GPU crate appears anywhere in this corpus's
/// dependency stack, so this backend emulates pinned host memory with a
/// heap buffer; it exists to exercise the capability boundary, not to
/// model actual device transfer.
#[derive(Default)]
pub struct DeviceBackend;

impl StorageBackend for DeviceBackend {
    fn create_write_stage(&self, _path: &Path, capacity: u64) -> Result<StageHandle, CacheError> {
        Ok(StageHandle::Device {
            buffer: Mutex::new(vec![0u8; capacity as usize]),
        })
    }

    fn write_into_stage(
        &self,
        stage: &StageHandle,
        selection: &Selection,
        elem: TypeDescriptor,
        src: &[u8],
        stage_offset: u64,
    ) -> Result<Option<OpaqueRef>, CacheError> {
        let StageHandle::Device { buffer } = stage else {
            return Err(CacheError::MisconfiguredCache(
                "device backend given a non-device stage handle".into(),
            ));
        };
        let mut buffer = buffer.lock();
        let mut total = 0u64;
        for_each_run(selection, elem, |src_off, dst_off, len| {
            let start = (stage_offset + dst_off) as usize;
            let end = start + len as usize;
            buffer[start..end].copy_from_slice(&src[src_off as usize..src_off as usize + len as usize]);
            total += len;
        });
        Ok(Some(OpaqueRef {
            offset: stage_offset,
            length: total,
        }))
    }

    fn destroy_write_stage(&self, _stage: StageHandle) -> Result<(), CacheError> {
        Ok(())
    }

    fn create_read_mirror(&self, _path: &Path, size: u64) -> Result<MirrorHandle, CacheError> {
        Ok(MirrorHandle::Device {
            buffer: Mutex::new(vec![0u8; size as usize]),
        })
    }

    fn destroy_read_mirror(&self, _mirror: MirrorHandle) -> Result<(), CacheError> {
        Ok(())
    }

    fn purge_folder(&self, _path: &Path) -> Result<(), CacheError> {
        Ok(())
    }
}

/// `global (shared file)` column: the cache engine is unchanged, only
/// this backend differs: it writes straight into an auxiliary slow-store
/// file rather than a local scratch region, returning no opaque-ref since
/// there is nothing further to migrate.
#[derive(Default)]
pub struct GlobalBackend;

impl StorageBackend for GlobalBackend {
    fn create_write_stage(&self, path: &Path, capacity: u64) -> Result<StageHandle, CacheError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err("create aux-file directory", e))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| io_err("open aux slow-store file", e))?;
        if capacity > 0 {
            file.set_len(capacity)
                .map_err(|e| io_err("pre-extend aux slow-store file", e))?;
        }
        Ok(StageHandle::Global {
            file: Mutex::new(file),
        })
    }

    fn write_into_stage(
        &self,
        stage: &StageHandle,
        selection: &Selection,
        elem: TypeDescriptor,
        src: &[u8],
        stage_offset: u64,
    ) -> Result<Option<OpaqueRef>, CacheError> {
        let StageHandle::Global { file } = stage else {
            return Err(CacheError::MisconfiguredCache(
                "global backend given a non-global stage handle".into(),
            ));
        };
        let mut file = file.lock();
        let mut first_err: Option<std::io::Error> = None;
        for_each_run(selection, elem, |src_off, dst_off, len| {
            if first_err.is_some() {
                return;
            }
            let result = file
                .seek(SeekFrom::Start(stage_offset + dst_off))
                .and_then(|_| file.write_all(&src[src_off as usize..src_off as usize + len as usize]));
            if let Err(e) = result {
                first_err = Some(e);
            }
        });
        if let Some(e) = first_err {
            return Err(io_err("write into aux slow-store file", e));
        }
        Ok(None)
    }

    fn destroy_write_stage(&self, _stage: StageHandle) -> Result<(), CacheError> {
        // Dropping the handle closes the aux file; the aux file itself is
        // the slow store's data, not scratch, so it is never unlinked here.
        Ok(())
    }

    fn create_read_mirror(&self, path: &Path, _size: u64) -> Result<MirrorHandle, CacheError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| io_err("open aux slow-store file for mirror", e))?;
        Ok(MirrorHandle::Global {
            file: Mutex::new(file),
        })
    }

    fn destroy_read_mirror(&self, _mirror: MirrorHandle) -> Result<(), CacheError> {
        Ok(())
    }

    fn purge_folder(&self, path: &Path) -> Result<(), CacheError> {
        if path.exists() {
            fs::remove_dir_all(path).map_err(|e| io_err("purge aux cache folder", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcache_core::{Selection, SelectionRun};

    #[test]
    fn ram_backend_scatters_into_contiguous_region() {
        let backend = RamBackend::default();
        let stage = backend.create_write_stage(Path::new("/unused"), 64).unwrap();
        let elem = TypeDescriptor::new(4);
        let sel = Selection::new(vec![
            SelectionRun {
                offset: 0,
                length: 2,
            },
            SelectionRun {
                offset: 4,
                length: 2,
            },
        ]);
        let src: Vec<u8> = (0u8..32).collect();
        let opaque = backend
            .write_into_stage(&stage, &sel, elem, &src, 0)
            .unwrap()
            .unwrap();
        assert_eq!(opaque.length, 16);
        let StageHandle::Ram { buffer } = &stage else {
            unreachable!()
        };
        assert_eq!(&buffer.lock()[0..16], &src[0..16]);
    }

    #[test]
    fn file_mmap_backend_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mmap-0.dat");
        let backend = FileMmapBackend::default();
        let stage = backend.create_write_stage(&path, 64).unwrap();
        let elem = TypeDescriptor::new(4);
        let sel = Selection::contiguous(0, 4);
        let src: Vec<u8> = (0u8..16).collect();
        backend.write_into_stage(&stage, &sel, elem, &src, 0).unwrap();
        drop(stage);

        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[0..16], &src[..]);
    }

    #[test]
    fn file_mmap_backend_remap_grows_while_keeping_cached_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror-0.dat");
        let backend = FileMmapBackend::default();
        let mirror = backend.create_read_mirror(&path, 16).unwrap();
        let pattern: Vec<u8> = (0u8..16).collect();
        if let MirrorHandle::FileMmap { mmap, .. } = &mirror {
            mmap.lock()[..].copy_from_slice(&pattern);
        }

        let mirror = backend.remap_read_mirror(mirror, &path, 32).unwrap();
        let MirrorHandle::FileMmap { mmap, .. } = &mirror else {
            unreachable!()
        };
        let remapped = mmap.lock();
        assert_eq!(&remapped[0..16], &pattern[..]);
        assert_eq!(&remapped[16..32], &[0u8; 16]);
    }

    #[test]
    fn other_backends_reject_remap() {
        let ram = RamBackend::default();
        let mirror = ram.create_read_mirror(Path::new("/unused"), 8).unwrap();
        assert!(ram.remap_read_mirror(mirror, Path::new("/unused"), 8).is_err());
    }

    #[test]
    fn global_backend_round_trips_bytes_into_the_aux_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aux-slow-store.dat");
        let backend = GlobalBackend::default();
        let stage = backend.create_write_stage(&path, 64).unwrap();
        let elem = TypeDescriptor::new(4);
        let sel = Selection::contiguous(0, 4);
        let src: Vec<u8> = (0u8..16).collect();
        assert!(backend.write_into_stage(&stage, &sel, elem, &src, 0).unwrap().is_none());
        drop(stage);

        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[0..16], &src[..]);
    }
}
