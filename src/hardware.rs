//! Collaborator seams towards the accelerator driver.

use crate::memory::Storage;
use crate::surface::BufferId;
use bitflags::bitflags;

bitflags! {
    /// Outstanding accesses to a buffer's video placement.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VideoAccess: u32 {
        const HARDWARE_READ = 1 << 0;
        const HARDWARE_WRITE = 1 << 1;
        const SOFTWARE_READ = 1 << 2;
        const SOFTWARE_WRITE = 1 << 3;

        const HARDWARE = Self::HARDWARE_READ.bits() | Self::HARDWARE_WRITE.bits();
    }
}

/// Hardware synchronization provided by the graphics driver.
///
/// All calls block until the accelerator has caught up.
pub trait HardwareSync: Send {
    /// Wait until the accelerator has finished all queued work.
    fn wait_idle(&mut self);

    /// Wait for the fences of `access` pending on `buffer`.
    fn wait_for_access(&mut self, buffer: BufferId, access: VideoAccess);

    /// Invalidate the accelerator's read cache before the CPU consumes its output.
    fn flush_read_cache(&mut self);
}

/// Sync for stacks without an accelerator: every wait returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHardware;

impl HardwareSync for NoHardware {
    fn wait_idle(&mut self) {}

    fn wait_for_access(&mut self, _buffer: BufferId, _access: VideoAccess) {}

    fn flush_read_cache(&mut self) {}
}

/// CPU mapping of the video memory behind each heap storage kind.
///
/// The returned slice is addressed by absolute heap offsets, i.e. chunk offsets
/// index it directly.
pub trait VideoMemory: Send {
    fn mapping(&mut self, storage: Storage) -> Option<&mut [u8]>;
}

/// Video memory emulated in host RAM.
///
/// Used by software-only stacks and by the tests.
#[derive(Debug, Default)]
pub struct HostVideoMemory {
    video: Vec<u8>,
    auxiliary: Vec<u8>,
}

impl HostVideoMemory {
    #[must_use]
    pub fn new(video_len: usize, auxiliary_len: usize) -> Self {
        Self {
            video: vec![0; video_len],
            auxiliary: vec![0; auxiliary_len],
        }
    }
}

impl VideoMemory for HostVideoMemory {
    fn mapping(&mut self, storage: Storage) -> Option<&mut [u8]> {
        match storage {
            Storage::Video => Some(&mut self.video),
            Storage::Auxiliary => Some(&mut self.auxiliary),
            Storage::System => None,
        }
    }
}
