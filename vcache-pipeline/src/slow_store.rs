//! The `SlowStore` trait stands in for the underlying asynchronous I/O
//! runtime, which the cache layer uses but does not implement. Real
//! deployments plug in whatever async layer sits in front of the
//! array-file library's actual slow-store writes; tests and the demo
//! binary use an in-process stand-in.

use vcache_core::CacheError;
use vcache_storage::StageHandle;

use crate::task::WriteTask;

/// A handle to an in-flight (or already-submitted) slow-store write: the
/// core only ever submits then waits, never spawns its own worker.
pub struct SlowStoreRequest {
    inner: Box<dyn FnOnce() -> Result<(), String> + Send>,
}

impl SlowStoreRequest {
    pub fn new(op: impl FnOnce() -> Result<(), String> + Send + 'static) -> Self {
        Self { inner: Box::new(op) }
    }

    /// Block until the operation completes. Returns the raw slow-store
    /// error message on failure; the caller (the pipeline's drain loop)
    /// decides whether to latch it.
    pub fn wait(self) -> Result<(), String> {
        (self.inner)()
    }
}

/// The capability the Write Pipeline needs from the async I/O runtime:
/// submit a write, get back a handle that can be waited on. Also exposes
/// a direct synchronous write for the stage-overflow fallback.
pub trait SlowStore: Send + Sync {
    /// Submit `task`'s staged bytes asynchronously. Must be called exactly
    /// once per task, in enqueue order. `stage` is the same write-stage
    /// handle `write_into_stage` copied `task`'s bytes into: the async
    /// runtime's migration reads directly from it, the same way the real
    /// slow-store write is handed a pointer into the stage at submission
    /// time rather than a private copy.
    fn submit_write(&self, task: &WriteTask, stage: &StageHandle) -> SlowStoreRequest;

    /// Perform an immediate, blocking write, bypassing the stage entirely.
    /// Used only when the queue is empty and there is still no room.
    fn write_direct(&self, dataset: u64, bytes: &[u8]) -> Result<(), CacheError>;
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// Completes every submitted write immediately; used by
    /// `vcache-pipeline`'s own unit tests and as a default for
    /// integration tests elsewhere in the workspace that don't care about
    /// real slow-store timing.
    #[derive(Default)]
    pub struct InstantSlowStore;

    impl SlowStore for InstantSlowStore {
        fn submit_write(&self, _task: &WriteTask, _stage: &StageHandle) -> SlowStoreRequest {
            SlowStoreRequest::new(|| Ok(()))
        }

        fn write_direct(&self, _dataset: u64, _bytes: &[u8]) -> Result<(), CacheError> {
            Ok(())
        }
    }

    /// Tracks how many writes have actually completed (i.e. had `wait()`
    /// called on their request), distinct from how many have merely been
    /// submitted. Lets a test observe pause's guarantee that a task's
    /// effect isn't visible at the slow store until its request is waited
    /// on.
    #[derive(Default)]
    pub struct CountingSlowStore {
        pub completed: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    impl SlowStore for CountingSlowStore {
        fn submit_write(&self, _task: &WriteTask, _stage: &StageHandle) -> SlowStoreRequest {
            let completed = self.completed.clone();
            SlowStoreRequest::new(move || {
                completed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
        }

        fn write_direct(&self, _dataset: u64, _bytes: &[u8]) -> Result<(), CacheError> {
            self.completed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }
}
