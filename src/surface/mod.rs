pub mod health;

pub use health::{Health, Location};

use crate::arena::Key;
use crate::error::{VidmemError, VidmemResult};
use crate::format::PixelFormat;
use crate::hardware::VideoAccess;
use crate::memory::ChunkId;
use crate::sync::SoftwareLock;
use std::fmt;

/// System-memory rows are padded to this many bytes.
const SYSTEM_PITCH_ALIGN: usize = 4;

/// Placement preference of a buffer, ordered by priority.
///
/// The order matters: a buffer may only be evicted by a request of equal or
/// higher policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Policy {
    /// Never placed in video memory.
    SystemOnly,
    /// Placed in video memory when there is room, evicted first.
    #[default]
    VideoLow,
    /// Placed in video memory, evicted only by equal or higher priority.
    VideoHigh,
    /// Lives in video memory only and is never evicted.
    VideoOnly,
}

/// Handle of a buffer registered with a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) Key);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Geometry, format and policy of a surface buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceDesc {
    pub width: usize,
    pub height: usize,
    pub min_width: usize,
    pub min_height: usize,
    pub format: PixelFormat,
    pub policy: Policy,
}

impl SurfaceDesc {
    #[must_use]
    pub const fn new(width: usize, height: usize, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            min_width: 0,
            min_height: 0,
            format,
            policy: Policy::VideoLow,
        }
    }

    #[must_use]
    pub const fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Reserve room for at least `min_width` x `min_height` pixels.
    #[must_use]
    pub const fn min_size(mut self, min_width: usize, min_height: usize) -> Self {
        self.min_width = min_width;
        self.min_height = min_height;
        self
    }

    #[must_use]
    pub const fn storage_width(&self) -> usize {
        if self.width > self.min_width {
            self.width
        } else {
            self.min_width
        }
    }

    #[must_use]
    pub const fn storage_height(&self) -> usize {
        if self.height > self.min_height {
            self.height
        } else {
            self.min_height
        }
    }

    pub(crate) fn validate(&self) -> VidmemResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(VidmemError::InvalidArgument(format!(
                "surface size {}x{} is empty",
                self.width, self.height
            )));
        }
        Ok(())
    }

    pub(crate) fn too_large(&self) -> VidmemError {
        VidmemError::InvalidArgument(format!(
            "surface size {}x{} ({:?}) does not fit in memory",
            self.storage_width(),
            self.storage_height(),
            self.format
        ))
    }
}

/// The system-memory copy of a buffer.
#[derive(Debug, Default)]
pub struct SystemStorage {
    health: Health,
    data: Option<Vec<u8>>,
    pitch: usize,
    size: usize,
    pinned: bool,
}

impl SystemStorage {
    fn for_desc(desc: &SurfaceDesc) -> VidmemResult<Self> {
        let pitch = desc
            .format
            .bytes_per_line(desc.storage_width())
            .and_then(|bytes| bytes.checked_next_multiple_of(SYSTEM_PITCH_ALIGN));
        let size = desc
            .format
            .plane_multiply(desc.storage_height())
            .zip(pitch)
            .and_then(|(rows, pitch)| rows.checked_mul(pitch));
        let (Some(pitch), Some(size)) = (pitch, size) else {
            return Err(desc.too_large());
        };

        Ok(Self {
            health: Health::Invalid,
            data: None,
            pitch,
            size,
            pinned: false,
        })
    }

    #[must_use]
    pub const fn health(&self) -> Health {
        self.health
    }

    #[must_use]
    pub const fn pitch(&self) -> usize {
        self.pitch
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn is_pinned(&self) -> bool {
        self.pinned
    }

    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub(crate) fn data_mut(&mut self) -> Option<&mut [u8]> {
        self.data.as_deref_mut()
    }

    /// Allocates zeroed storage; allocation failure is `OutOfMemory`.
    pub(crate) fn create(&mut self) -> VidmemResult<()> {
        let health = self.health.created(Location::System)?;
        let mut data = Vec::new();
        data.try_reserve_exact(self.size)
            .map_err(|_| VidmemError::OutOfMemory)?;
        data.resize(self.size, 0);
        self.data = Some(data);
        self.health = health;
        Ok(())
    }

    pub(crate) fn release(&mut self) {
        self.data = None;
        self.health = self.health.invalidated();
    }

    pub(crate) fn mark_stored(&mut self) -> VidmemResult<()> {
        self.health = self.health.stored(Location::System)?;
        Ok(())
    }

    /// Returns true when a stored copy became stale.
    pub(crate) fn mark_outdated(&mut self) -> bool {
        let before = self.health;
        self.health = before.outdated();
        before != self.health
    }
}

/// The video-memory placement of a buffer.
///
/// `chunk` is set exactly when `health` is not `Invalid`; both change together in
/// [`VideoStorage::place`] and [`VideoStorage::unplace`].
#[derive(Debug, Default)]
pub struct VideoStorage {
    health: Health,
    chunk: Option<ChunkId>,
    offset: usize,
    pitch: usize,
    access: VideoAccess,
    lock: SoftwareLock,
}

impl VideoStorage {
    #[must_use]
    pub const fn health(&self) -> Health {
        self.health
    }

    #[must_use]
    pub const fn chunk(&self) -> Option<ChunkId> {
        self.chunk
    }

    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub const fn pitch(&self) -> usize {
        self.pitch
    }

    #[must_use]
    pub const fn access(&self) -> VideoAccess {
        self.access
    }

    #[must_use]
    pub fn lock_count(&self) -> u32 {
        self.lock.count()
    }

    pub(crate) fn lock(&self) -> &SoftwareLock {
        &self.lock
    }

    pub(crate) fn place(
        &mut self,
        chunk: ChunkId,
        offset: usize,
        pitch: usize,
    ) -> VidmemResult<()> {
        self.health = self.health.created(Location::Video)?;
        self.chunk = Some(chunk);
        self.offset = offset;
        self.pitch = pitch;
        Ok(())
    }

    pub(crate) fn unplace(&mut self) -> Option<ChunkId> {
        self.health = self.health.invalidated();
        self.chunk.take()
    }

    pub(crate) fn mark_stored(&mut self) -> VidmemResult<()> {
        self.health = self.health.stored(Location::Video)?;
        Ok(())
    }

    pub(crate) fn mark_outdated(&mut self) -> bool {
        let before = self.health;
        self.health = before.outdated();
        before != self.health
    }

    pub(crate) fn add_access(&mut self, access: VideoAccess) {
        self.access |= access;
    }

    /// Clears `access` and returns which of those flags were set.
    pub(crate) fn take_access(&mut self, access: VideoAccess) -> VideoAccess {
        let pending = self.access & access;
        self.access.remove(access);
        pending
    }
}

/// A drawable buffer backed by system memory, video memory, or both.
#[derive(Debug)]
pub struct SurfaceBuffer {
    desc: SurfaceDesc,
    written: bool,
    system: SystemStorage,
    video: VideoStorage,
}

impl SurfaceBuffer {
    pub(crate) fn new(desc: SurfaceDesc) -> VidmemResult<Self> {
        desc.validate()?;
        Ok(Self {
            system: SystemStorage::for_desc(&desc)?,
            video: VideoStorage::default(),
            written: false,
            desc,
        })
    }

    #[must_use]
    pub const fn desc(&self) -> &SurfaceDesc {
        &self.desc
    }

    #[must_use]
    pub const fn policy(&self) -> Policy {
        self.desc.policy
    }

    #[must_use]
    pub const fn format(&self) -> PixelFormat {
        self.desc.format
    }

    /// True once any location has been written.
    #[must_use]
    pub const fn is_written(&self) -> bool {
        self.written
    }

    #[must_use]
    pub const fn system(&self) -> &SystemStorage {
        &self.system
    }

    #[must_use]
    pub const fn video(&self) -> &VideoStorage {
        &self.video
    }

    /// Handle to the software lock count of the video placement.
    #[must_use]
    pub fn software_lock(&self) -> SoftwareLock {
        self.video.lock.clone()
    }

    /// Records accelerator work queued against the video placement.
    ///
    /// Deallocation and downloads wait for these fences before touching the memory.
    pub fn note_hardware_access(&mut self, access: VideoAccess) {
        self.video.add_access(access & VideoAccess::HARDWARE);
    }

    /// Marks the system copy as externally owned; thrifty mode never frees it.
    pub fn set_system_pinned(&mut self, pinned: bool) {
        self.system.pinned = pinned;
    }

    pub(crate) fn mark_written(&mut self) {
        self.written = true;
    }

    /// Forgets the contents, e.g. when a video-only placement is dropped.
    pub(crate) fn discard_contents(&mut self) {
        self.written = false;
    }

    pub(crate) fn system_mut(&mut self) -> &mut SystemStorage {
        &mut self.system
    }

    pub(crate) fn video_mut(&mut self) -> &mut VideoStorage {
        &mut self.video
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_priority_order() {
        assert!(Policy::SystemOnly < Policy::VideoLow);
        assert!(Policy::VideoLow < Policy::VideoHigh);
        assert!(Policy::VideoHigh < Policy::VideoOnly);
    }

    #[test]
    fn system_storage_uses_min_size_and_padded_pitch() {
        let desc = SurfaceDesc::new(3, 2, PixelFormat::Rgb24).min_size(5, 4);
        let buffer = SurfaceBuffer::new(desc).unwrap();
        assert_eq!(buffer.system().pitch(), 16);
        assert_eq!(buffer.system().size(), 64);
        assert_eq!(buffer.system().health(), Health::Invalid);
    }

    #[test]
    fn empty_surfaces_are_rejected() {
        let desc = SurfaceDesc::new(0, 10, PixelFormat::Argb);
        assert!(matches!(
            SurfaceBuffer::new(desc),
            Err(VidmemError::InvalidArgument(_))
        ));
    }

    #[test]
    fn oversized_surfaces_are_rejected() {
        let desc = SurfaceDesc::new(usize::MAX / 16, 2, PixelFormat::Argb);
        assert!(matches!(
            SurfaceBuffer::new(desc),
            Err(VidmemError::InvalidArgument(_))
        ));

        let desc = SurfaceDesc::new(16, usize::MAX / 4, PixelFormat::Nv16);
        assert!(matches!(
            SurfaceBuffer::new(desc),
            Err(VidmemError::InvalidArgument(_))
        ));
    }

    #[test]
    fn system_create_and_release() {
        let mut buffer = SurfaceBuffer::new(SurfaceDesc::new(4, 4, PixelFormat::Argb)).unwrap();
        buffer.system_mut().create().unwrap();
        assert_eq!(buffer.system().health(), Health::Restore);
        assert_eq!(buffer.system().data().map(<[u8]>::len), Some(64));

        buffer.system_mut().mark_stored().unwrap();
        assert!(buffer.system_mut().mark_outdated());
        assert!(!buffer.system_mut().mark_outdated());

        buffer.system_mut().release();
        assert_eq!(buffer.system().health(), Health::Invalid);
        assert!(buffer.system().data().is_none());
    }

    #[test]
    fn note_hardware_access_ignores_software_flags() {
        let mut buffer = SurfaceBuffer::new(SurfaceDesc::new(4, 4, PixelFormat::Argb)).unwrap();
        buffer.note_hardware_access(VideoAccess::HARDWARE_READ | VideoAccess::SOFTWARE_WRITE);
        assert_eq!(buffer.video().access(), VideoAccess::HARDWARE_READ);
        assert_eq!(
            buffer.video_mut().take_access(VideoAccess::HARDWARE),
            VideoAccess::HARDWARE_READ
        );
        assert!(buffer.video().access().is_empty());
    }
}
