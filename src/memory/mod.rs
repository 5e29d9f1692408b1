pub mod heap;
pub mod manager;

mod consistency;

use crate::arena::Key;
use std::fmt;

/// Storage class of a memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Storage {
    /// Ordinary system memory. Never backs a heap.
    System,
    /// Primary video memory.
    Video,
    /// Auxiliary video memory (e.g. an AGP or secondary aperture).
    Auxiliary,
}

/// Generation-checked reference to a chunk inside one of the manager's heaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId {
    pub(crate) heap: usize,
    pub(crate) key: Key,
}

impl ChunkId {
    /// Index of the owning heap in the manager's heap list.
    #[must_use]
    pub const fn heap(&self) -> usize {
        self.heap
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "heap{}:{}", self.heap, self.key)
    }
}

pub use heap::{Chunk, Heap};
pub use manager::{
    ChunkInfo, HardwareLimits, ManagerConfig, ManagerGuard, ManagerState, SurfaceManager,
    SurfaceManagerBuilder,
};
