//! The Read Mirror: a per-dataset distributed cache, populated by
//! put-on-first-read and served by one-sided get on every subsequent
//! read.

mod mirror;
mod mpi_backend;
mod partition;
mod reader;
mod topology;
mod window;

pub use mirror::{Batch, MirrorState, ReadMirror, ReadRequest, SampleShape};
pub use mpi_backend::{MpiRmaWindow, MpiWindowFactory};
pub use partition::SamplePartition;
pub use reader::{DatasetHandle, SlowStoreReader};
pub use topology::NodeTopology;
pub use window::{fenced_phase, local, AccessPhase, RmaWindow, WindowFactory};
