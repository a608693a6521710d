//! The blocking slow-store read capability the mirror's `read_to_cache`
//! path calls into. The array-file library's actual slow-store read is
//! treated as an opaque external collaborator.

use vcache_core::{CacheError, Selection, TypeDescriptor};

/// Dataset handle shared with `vcache-pipeline::DatasetHandle`'s shape,
/// kept as a bare `u64` here too so the shim can use one id space across
/// both the write pipeline and the read mirror.
pub type DatasetHandle = u64;

/// Performs the actual (slow, blocking) read from the underlying
/// hierarchical array-file library.
pub trait SlowStoreReader: Send + Sync {
    fn read(
        &self,
        dataset: DatasetHandle,
        file_sel: &Selection,
        elem: TypeDescriptor,
        dst: &mut [u8],
    ) -> Result<(), CacheError>;
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// Fills every read with a deterministic pattern derived from the
    /// file-selection offset, so round-trip tests can check the bytes
    /// landed where expected without a real backing file.
    #[derive(Default)]
    pub struct PatternReader;

    impl SlowStoreReader for PatternReader {
        fn read(
            &self,
            _dataset: DatasetHandle,
            file_sel: &Selection,
            elem: TypeDescriptor,
            dst: &mut [u8],
        ) -> Result<(), CacheError> {
            let mut pos = 0usize;
            for run in file_sel.runs() {
                let len_bytes = (run.length * elem.element_size) as usize;
                for (i, byte) in dst[pos..pos + len_bytes].iter_mut().enumerate() {
                    *byte = ((run.offset as usize + i) % 256) as u8;
                }
                pos += len_bytes;
            }
            Ok(())
        }
    }
}
