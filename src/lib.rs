//! Video memory management for surface buffers.
//!
//! A [`SurfaceManager`] carves heaps of video memory into chunks, places surface
//! buffers in them according to their [`Policy`], evicts weaker placements under
//! pressure and keeps each buffer's system and video copies coherent.

pub mod error;
pub mod format;
pub mod hardware;
pub mod listener;
pub mod memory;
pub mod surface;
pub mod sync;
pub mod utils;

mod arena;

pub use error::{VidmemError, VidmemResult};
pub use format::{PixelFormat, Plane, PlaneSpan};
pub use hardware::{HardwareSync, HostVideoMemory, NoHardware, VideoAccess, VideoMemory};
pub use listener::SurfaceListener;
pub use memory::{
    ChunkId, ChunkInfo, HardwareLimits, ManagerConfig, ManagerGuard, ManagerState, Storage,
    SurfaceManager,
};
pub use surface::{BufferId, Health, Location, Policy, SurfaceBuffer, SurfaceDesc};
pub use sync::SoftwareLock;
