use super::consistency::check_contents;
use super::heap::{Chunk, Heap};
use super::{ChunkId, Storage};
use crate::arena::Arena;
use crate::error::{VidmemError, VidmemResult};
use crate::hardware::{HardwareSync, NoHardware, VideoAccess, VideoMemory};
use crate::listener::{SurfaceListener, notify};
use crate::surface::{BufferId, Health, Location, Policy, SurfaceBuffer, SurfaceDesc};
use crate::sync::{SharedLock, SoftwareLock};
use crate::utils::{align_up, below_pow2_limits, round_up_pow2};
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{ControlFlow, Deref, DerefMut};

/// Slack after every video placement for copy routines that over-read the last row.
const PLACEMENT_SLACK: usize = 16;

/// Leading iterations of the software-lock wait that spin instead of yielding.
const LOCK_WAIT_SPIN_ITERATIONS: u32 = 16;

/// Alignment and power-of-two constraints of the accelerator.
///
/// An alignment of 0 or 1 means unaligned; a power-of-two limit of 0 disables
/// that rounding step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareLimits {
    pub byteoffset_align: usize,
    pub pixelpitch_align: usize,
    pub bytepitch_align: usize,
    pub max_power_of_two_pixelpitch: usize,
    pub max_power_of_two_bytepitch: usize,
    pub max_power_of_two_height: usize,
}

impl Default for HardwareLimits {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareLimits {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            byteoffset_align: 1,
            pixelpitch_align: 1,
            bytepitch_align: 1,
            max_power_of_two_pixelpitch: 0,
            max_power_of_two_bytepitch: 0,
            max_power_of_two_height: 0,
        }
    }

    #[must_use]
    pub const fn alignments(
        mut self,
        byteoffset: usize,
        pixelpitch: usize,
        bytepitch: usize,
    ) -> Self {
        self.byteoffset_align = byteoffset;
        self.pixelpitch_align = pixelpitch;
        self.bytepitch_align = bytepitch;
        self
    }

    #[must_use]
    pub const fn power_of_two_limits(
        mut self,
        pixelpitch: usize,
        bytepitch: usize,
        height: usize,
    ) -> Self {
        self.max_power_of_two_pixelpitch = pixelpitch;
        self.max_power_of_two_bytepitch = bytepitch;
        self.max_power_of_two_height = height;
        self
    }
}

/// Runtime behaviour switches of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Drop the system copy once video memory holds the current data.
    pub thrifty: bool,
    /// Wait for the accelerator to go idle before CPU uploads into video memory.
    pub sync_uploads: bool,
    /// Bound of the software-lock wait in `deallocate`.
    pub lock_wait_iterations: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            thrifty: false,
            sync_uploads: false,
            lock_wait_iterations: 1000,
        }
    }

    #[must_use]
    pub const fn thrifty(mut self) -> Self {
        self.thrifty = true;
        self
    }

    #[must_use]
    pub const fn sync_uploads(mut self) -> Self {
        self.sync_uploads = true;
        self
    }

    #[must_use]
    pub const fn lock_wait_iterations(mut self, iterations: u32) -> Self {
        self.lock_wait_iterations = iterations;
        self
    }
}

/// Snapshot of one chunk, handed to `enumerate_chunks` callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub id: ChunkId,
    pub storage: Storage,
    pub offset: usize,
    pub length: usize,
    pub owner: Option<BufferId>,
    pub policy: Option<Policy>,
    pub toleration: u8,
}

/// Manager state reachable only through a [`ManagerGuard`].
///
/// Every placement and consistency operation lives here, so holding the guard is
/// what makes a call legal.
pub struct ManagerState {
    pub(super) limits: HardwareLimits,
    pub(super) config: ManagerConfig,
    pub(super) heaps: Vec<Heap>,
    pub(super) buffers: Arena<SurfaceBuffer>,
    pub(super) suspended: bool,
    pub(super) hardware: Box<dyn HardwareSync>,
    pub(super) video_memory: Box<dyn VideoMemory>,
    pub(super) listeners: Vec<Box<dyn SurfaceListener>>,
}

/// The video memory manager: heaps, buffer registry and the lock serializing them.
pub struct SurfaceManager {
    lock: SharedLock,
    state: UnsafeCell<ManagerState>,
}

// The state is only reachable through ManagerGuard, which holds `lock`.
unsafe impl Sync for SurfaceManager {}

/// Builds a [`SurfaceManager`] from limits and collaborators.
pub struct SurfaceManagerBuilder {
    limits: HardwareLimits,
    config: ManagerConfig,
    hardware: Box<dyn HardwareSync>,
    video_memory: Box<dyn VideoMemory>,
    listeners: Vec<Box<dyn SurfaceListener>>,
}

impl SurfaceManagerBuilder {
    #[must_use]
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn hardware(mut self, hardware: impl HardwareSync + 'static) -> Self {
        self.hardware = Box::new(hardware);
        self
    }

    #[must_use]
    pub fn listener(mut self, listener: impl SurfaceListener + 'static) -> Self {
        self.listeners.push(Box::new(listener));
        self
    }

    /// Creates the manager with no heaps.
    ///
    /// # Errors
    /// Fails if the process-shared lock cannot be initialized.
    pub fn build(self) -> VidmemResult<SurfaceManager> {
        let lock = SharedLock::new()?;
        log::debug!(
            "surface manager created: {:?}, {:?}",
            self.limits,
            self.config
        );
        Ok(SurfaceManager {
            lock,
            state: UnsafeCell::new(ManagerState {
                limits: self.limits,
                config: self.config,
                heaps: Vec::new(),
                buffers: Arena::new(),
                suspended: false,
                hardware: self.hardware,
                video_memory: self.video_memory,
                listeners: self.listeners,
            }),
        })
    }
}

impl SurfaceManager {
    #[must_use]
    pub fn builder(
        limits: HardwareLimits,
        video_memory: impl VideoMemory + 'static,
    ) -> SurfaceManagerBuilder {
        SurfaceManagerBuilder {
            limits,
            config: ManagerConfig::default(),
            hardware: Box::new(NoHardware),
            video_memory: Box::new(video_memory),
            listeners: Vec::new(),
        }
    }

    /// Creates a manager with default configuration and no hardware sync.
    ///
    /// # Errors
    /// Fails if the process-shared lock cannot be initialized.
    pub fn create(
        limits: HardwareLimits,
        video_memory: impl VideoMemory + 'static,
    ) -> VidmemResult<Self> {
        Self::builder(limits, video_memory).build()
    }

    /// Acquires the manager lock. The lock is released when the guard drops.
    ///
    /// # Errors
    /// Returns [`VidmemError::Lock`] if the mutex reports an error.
    pub fn lock(&self) -> VidmemResult<ManagerGuard<'_>> {
        self.lock.acquire()?;
        Ok(ManagerGuard {
            manager: self,
            _not_send: PhantomData,
        })
    }

    /// Tears the manager down, dropping every video placement first.
    ///
    /// Contents are not written back; the buffers go away with the manager.
    ///
    /// # Errors
    /// Propagates lock failures and bookkeeping bugs found while freeing chunks.
    pub fn destroy(self) -> VidmemResult<()> {
        let mut guard = self.lock()?;
        for id in guard.buffer_ids() {
            guard.drop_placement(id)?;
        }
        log::debug!("surface manager destroyed");
        Ok(())
    }
}

/// Exclusive access to the manager state while the lock is held.
///
/// The guard must be released on the thread that took it, so it is not `Send`:
///
/// ```compile_fail
/// fn assert_send<T: Send>() {}
/// assert_send::<vidmem_rs::ManagerGuard<'static>>();
/// ```
pub struct ManagerGuard<'a> {
    manager: &'a SurfaceManager,
    _not_send: PhantomData<*const ()>,
}

impl ManagerGuard<'_> {
    /// Releases the lock. Dropping the guard does the same.
    pub fn unlock(self) {}
}

impl Drop for ManagerGuard<'_> {
    fn drop(&mut self) {
        self.manager.lock.release();
    }
}

impl Deref for ManagerGuard<'_> {
    type Target = ManagerState;

    fn deref(&self) -> &ManagerState {
        unsafe { &*self.manager.state.get() }
    }
}

impl DerefMut for ManagerGuard<'_> {
    fn deref_mut(&mut self) -> &mut ManagerState {
        unsafe { &mut *self.manager.state.get() }
    }
}

// ===============================================================================================
// Heap lifecycle
// ===============================================================================================

impl ManagerState {
    #[must_use]
    pub const fn limits(&self) -> &HardwareLimits {
        &self.limits
    }

    #[must_use]
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    #[must_use]
    pub fn heaps(&self) -> &[Heap] {
        &self.heaps
    }

    #[must_use]
    pub const fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn add_listener(&mut self, listener: impl SurfaceListener + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Adds a heap covering `[offset, offset + length)` and returns its index.
    ///
    /// # Errors
    /// `InvalidArgument` unless `storage` is video or auxiliary memory.
    pub fn add_heap(
        &mut self,
        storage: Storage,
        offset: usize,
        length: usize,
    ) -> VidmemResult<usize> {
        let heap = Heap::new(storage, offset, length)?;
        self.heaps
            .try_reserve(1)
            .map_err(|_| VidmemError::OutOfSharedMemory)?;
        self.heaps.push(heap);
        log::debug!(
            "added {storage:?} heap #{} at 0x{offset:x}, {length} bytes",
            self.heaps.len() - 1
        );
        Ok(self.heaps.len() - 1)
    }

    /// Moves the start of the first heap, e.g. after the visible framebuffer grew.
    ///
    /// # Errors
    /// `Busy` when the first chunk is occupied or too small to absorb the shift.
    /// Existing placements are never moved.
    pub fn adjust_heap_offset(&mut self, offset: usize) -> VidmemResult<()> {
        let offset = align_up(offset, self.limits.byteoffset_align).ok_or_else(|| {
            VidmemError::InvalidArgument(format!("heap offset 0x{offset:x} cannot be aligned"))
        })?;
        let Some(heap) = self.heaps.first_mut() else {
            return Err(VidmemError::InvalidArgument("no heap to adjust".into()));
        };

        let old = heap.offset();
        if heap.move_start(offset) {
            log::debug!("heap #0 start moved from 0x{old:x} to 0x{offset:x}");
            return Ok(());
        }

        log::warn!(
            "cannot move heap #0 start from 0x{old:x} to 0x{offset:x}: \
             first chunk is in use or too small"
        );
        Err(VidmemError::Busy(format!(
            "heap start 0x{old:x} cannot move to 0x{offset:x}"
        )))
    }

    /// Writes every evictable placement back to system memory and stops allocation.
    ///
    /// # Errors
    /// Propagates write-back failures; the manager stays active in that case.
    pub fn suspend(&mut self) -> VidmemResult<()> {
        let evictable: Vec<BufferId> = self
            .placed_buffers()
            .into_iter()
            .filter(|&id| {
                self.buffers.get(id.0).is_some_and(|b| {
                    !matches!(b.policy(), Policy::SystemOnly | Policy::VideoOnly)
                })
            })
            .collect();

        for &id in &evictable {
            self.deallocate(id)?;
        }

        self.suspended = true;
        log::debug!(
            "suspended, {} buffers moved out of video memory",
            evictable.len()
        );
        Ok(())
    }

    /// Re-enables allocation. Video memory is refilled lazily by `assure_video`.
    pub fn resume(&mut self) {
        self.suspended = false;
        log::debug!("resumed");
    }

    fn placed_buffers(&self) -> Vec<BufferId> {
        self.heaps
            .iter()
            .flat_map(Heap::chunks)
            .filter_map(Chunk::owner)
            .collect()
    }

    // ===========================================================================================
    // Buffer registry
    // ===========================================================================================

    /// Registers a buffer.
    ///
    /// The system copy is allocated for every policy but VIDEOONLY; a VIDEOONLY
    /// buffer is placed in video memory right away and the registration fails
    /// if that is impossible.
    ///
    /// # Errors
    /// `InvalidArgument` for empty or oversized geometry, `OutOfMemory` when the
    /// system copy cannot be allocated, any `allocate` error for VIDEOONLY buffers.
    pub fn register_buffer(&mut self, desc: SurfaceDesc) -> VidmemResult<BufferId> {
        let mut buffer = SurfaceBuffer::new(desc)?;
        if desc.policy != Policy::SystemOnly {
            self.placement_size(&desc)?;
        }
        if desc.policy != Policy::VideoOnly {
            buffer.system_mut().create()?;
            buffer.system_mut().mark_stored()?;
        }

        let id = BufferId(self.buffers.insert(buffer)?);
        if desc.policy == Policy::VideoOnly {
            if let Err(e) = self.allocate(id) {
                self.buffers.remove(id.0);
                return Err(e);
            }
        }

        log::debug!(
            "registered buffer {id}: {}x{} {:?} {:?}",
            desc.width,
            desc.height,
            desc.format,
            desc.policy
        );
        Ok(id)
    }

    /// Drops a buffer's video placement and removes it from the registry.
    ///
    /// # Errors
    /// `InvalidArgument` for unknown or stale ids.
    pub fn release_buffer(&mut self, id: BufferId) -> VidmemResult<()> {
        self.drop_placement(id)?;
        self.buffers.remove(id.0);
        log::debug!("released buffer {id}");
        Ok(())
    }

    #[must_use]
    pub fn buffer(&self, id: BufferId) -> Option<&SurfaceBuffer> {
        self.buffers.get(id.0)
    }

    pub fn buffer_mut(&mut self, id: BufferId) -> Option<&mut SurfaceBuffer> {
        self.buffers.get_mut(id.0)
    }

    #[must_use]
    pub fn buffer_ids(&self) -> Vec<BufferId> {
        self.buffers.keys().into_iter().map(BufferId).collect()
    }

    pub(super) fn lookup(&self, id: BufferId) -> VidmemResult<&SurfaceBuffer> {
        self.buffers
            .get(id.0)
            .ok_or_else(|| VidmemError::InvalidArgument(format!("unknown buffer {id}")))
    }

    // ===========================================================================================
    // Placement
    // ===========================================================================================

    /// Pitch and length (in bytes) of a video placement for `desc`.
    ///
    /// # Errors
    /// `InvalidArgument` when the placement does not fit in `usize`.
    pub fn placement_size(&self, desc: &SurfaceDesc) -> VidmemResult<(usize, usize)> {
        let limits = &self.limits;
        let height = desc.storage_height();

        let mut pixel_pitch = Some(desc.storage_width());
        if below_pow2_limits(
            desc.storage_width(),
            limits.max_power_of_two_pixelpitch,
            height,
            limits.max_power_of_two_height,
        ) {
            pixel_pitch = pixel_pitch.and_then(round_up_pow2);
        }
        let pixel_pitch = pixel_pitch.and_then(|p| align_up(p, limits.pixelpitch_align));

        let mut pitch = pixel_pitch.and_then(|p| desc.format.bytes_per_line(p));
        if pitch.is_some_and(|p| {
            below_pow2_limits(
                p,
                limits.max_power_of_two_bytepitch,
                height,
                limits.max_power_of_two_height,
            )
        }) {
            pitch = pitch.and_then(round_up_pow2);
        }
        let pitch = pitch
            .and_then(|p| align_up(p, limits.bytepitch_align))
            .ok_or_else(|| desc.too_large())?;

        let length = desc
            .format
            .plane_multiply(height)
            .and_then(|rows| rows.checked_mul(pitch))
            .and_then(|bytes| bytes.checked_add(PLACEMENT_SLACK))
            .and_then(|bytes| align_up(bytes, limits.byteoffset_align))
            .ok_or_else(|| desc.too_large())?;
        Ok((pitch, length))
    }

    /// Places a buffer in video memory, evicting a weaker placement if needed.
    ///
    /// # Errors
    /// `Suspended` while suspended, `NoVideoMemory` when neither a free nor an
    /// evictable chunk is large enough (and always for SYSTEMONLY buffers).
    pub fn allocate(&mut self, id: BufferId) -> VidmemResult<ChunkId> {
        if self.suspended {
            return Err(VidmemError::Suspended);
        }

        let buffer = self.lookup(id)?;
        if let Some(chunk) = buffer.video().chunk() {
            return Ok(chunk);
        }
        let desc = *buffer.desc();
        if desc.policy == Policy::SystemOnly {
            log::debug!("buffer {id} is system-only, not placing it in video memory");
            return Err(VidmemError::NoVideoMemory);
        }

        let (pitch, length) = self.placement_size(&desc)?;

        let free = self.heaps.iter().enumerate().find_map(|(heap, h)| {
            if h.avail() < length {
                return None;
            }
            h.find_free(length).map(|key| ChunkId { heap, key })
        });
        if let Some(chunk) = free {
            return self.occupy(chunk, id, length, pitch);
        }

        let Some(victim) = self.find_victim(length, desc.policy) else {
            log::debug!(
                "no video memory for buffer {id} ({length} bytes, {:?})",
                desc.policy
            );
            return Err(VidmemError::NoVideoMemory);
        };
        self.kick(victim, id, length, pitch)
    }

    /// Ages every occupied chunk of at least `length` bytes and picks the smallest
    /// one a `policy` request may evict (most tolerated on ties).
    ///
    /// Chunks of heaps whose `avail` is below `length` age too, but are never picked.
    fn find_victim(&mut self, length: usize, policy: Policy) -> Option<ChunkId> {
        let mut best: Option<(ChunkId, usize, u8)> = None;

        for (heap_index, heap) in self.heaps.iter_mut().enumerate() {
            let threshold = heap.eviction_threshold();
            let eligible_heap = heap.avail() >= length;

            for key in heap.keys() {
                let Some(chunk) = heap.chunk_mut(key) else {
                    continue;
                };
                let Some(owner) = chunk.owner() else {
                    continue;
                };
                if chunk.length() < length {
                    continue;
                }
                let toleration = chunk.tolerate();
                let chunk_length = chunk.length();
                if !eligible_heap {
                    continue;
                }

                let Some(buffer) = self.buffers.get(owner.0) else {
                    continue;
                };
                let candidate = buffer.policy();
                if buffer.video().lock_count() != 0
                    || candidate > policy
                    || candidate == Policy::VideoOnly
                {
                    continue;
                }
                if policy == candidate && u32::from(toleration) <= threshold {
                    continue;
                }

                let better = best.is_none_or(|(_, best_length, best_toleration)| {
                    chunk_length < best_length
                        || (chunk_length == best_length && toleration > best_toleration)
                });
                if better {
                    let id = ChunkId {
                        heap: heap_index,
                        key,
                    };
                    best = Some((id, chunk_length, toleration));
                }
            }
        }

        best.map(|(chunk, _, _)| chunk)
    }

    /// Evicts the owner of `victim` and gives the freed space to `id`.
    fn kick(
        &mut self,
        victim: ChunkId,
        id: BufferId,
        length: usize,
        pitch: usize,
    ) -> VidmemResult<ChunkId> {
        let owner = self
            .heaps
            .get(victim.heap)
            .and_then(|heap| heap.chunk(victim.key))
            .and_then(Chunk::owner)
            .ok_or_else(|| VidmemError::bug(format!("eviction victim {victim} has no owner")))?;
        log::debug!("evicting buffer {owner} from {victim} for buffer {id}");

        self.assure_system(owner)?;

        let buffer = self.buffers.get_mut(owner.0).ok_or_else(|| {
            VidmemError::bug(format!("chunk {victim} owned by unknown buffer {owner}"))
        })?;
        buffer.video_mut().unplace();
        notify(&self.listeners, owner, Location::Video, Health::Invalid);

        let heap = self
            .heaps
            .get_mut(victim.heap)
            .ok_or_else(|| VidmemError::bug(format!("no heap for {victim}")))?;
        let freed = heap.free(victim.key)?;

        let pending = buffer.video_mut().take_access(VideoAccess::all()) & VideoAccess::HARDWARE;
        if !pending.is_empty() {
            self.hardware.wait_for_access(owner, pending);
        }

        let chunk = ChunkId {
            heap: victim.heap,
            key: freed,
        };
        self.occupy(chunk, id, length, pitch)
    }

    fn occupy(
        &mut self,
        chunk: ChunkId,
        id: BufferId,
        length: usize,
        pitch: usize,
    ) -> VidmemResult<ChunkId> {
        let reserve = self.lookup(id)?.policy() == Policy::VideoOnly;
        let heap = self
            .heaps
            .get_mut(chunk.heap)
            .ok_or_else(|| VidmemError::bug(format!("no heap for {chunk}")))?;
        let offset = heap.occupy(chunk.key, id, length, reserve)?.offset();

        let buffer = self
            .buffers
            .get_mut(id.0)
            .ok_or_else(|| VidmemError::bug(format!("occupy for unknown buffer {id}")))?;
        buffer.video_mut().place(chunk, offset, pitch)?;
        notify(&self.listeners, id, Location::Video, Health::Restore);

        log::debug!(
            "buffer {id} placed at 0x{offset:x} ({length} bytes, pitch {pitch}) in {chunk}"
        );
        Ok(chunk)
    }

    /// Drops a buffer's video placement. A no-op for unplaced buffers.
    ///
    /// Contents that only live in video memory are written back to the system copy
    /// first. VIDEOONLY buffers have no system copy, so their contents are discarded.
    ///
    /// Waits a bounded number of iterations for software locks to be released and
    /// frees the chunk anyway if they are not.
    ///
    /// # Errors
    /// `InvalidArgument` for unknown ids, any `assure_system` error during the
    /// write-back, `Bug` if the heap bookkeeping is broken.
    pub fn deallocate(&mut self, id: BufferId) -> VidmemResult<()> {
        let buffer = self.lookup(id)?;
        if buffer.video().health() == Health::Invalid {
            return Ok(());
        }

        if buffer.policy() == Policy::VideoOnly {
            if let Some(buffer) = self.buffers.get_mut(id.0) {
                buffer.discard_contents();
            }
        } else if buffer.system().health() != Health::Stored {
            self.assure_system(id)?;
        }
        self.drop_placement(id)
    }

    /// Frees the video placement without writing anything back.
    pub(super) fn drop_placement(&mut self, id: BufferId) -> VidmemResult<()> {
        let buffer = self
            .buffers
            .get_mut(id.0)
            .ok_or_else(|| VidmemError::InvalidArgument(format!("unknown buffer {id}")))?;
        if buffer.video().health() == Health::Invalid {
            return Ok(());
        }

        let chunk = buffer
            .video_mut()
            .unplace()
            .ok_or_else(|| VidmemError::bug(format!("buffer {id} is placed without a chunk")))?;
        notify(&self.listeners, id, Location::Video, Health::Invalid);

        wait_for_software_locks(buffer.video().lock(), id, self.config.lock_wait_iterations);

        let pending = buffer.video_mut().take_access(VideoAccess::all()) & VideoAccess::HARDWARE;
        if !pending.is_empty() {
            self.hardware.wait_for_access(id, pending);
        }

        self.heaps
            .get_mut(chunk.heap)
            .ok_or_else(|| VidmemError::bug(format!("no heap for {chunk}")))?
            .free(chunk.key)?;
        log::debug!("buffer {id} removed from {chunk}");
        Ok(())
    }

    // ===========================================================================================
    // Diagnostics
    // ===========================================================================================

    /// Calls `callback` for every chunk of every heap in offset order until it breaks.
    pub fn enumerate_chunks<F>(&self, mut callback: F) -> ControlFlow<()>
    where
        F: FnMut(&ChunkInfo) -> ControlFlow<()>,
    {
        for (heap_index, heap) in self.heaps.iter().enumerate() {
            for (key, chunk) in heap.iter() {
                let info = ChunkInfo {
                    id: ChunkId {
                        heap: heap_index,
                        key,
                    },
                    storage: heap.storage(),
                    offset: chunk.offset(),
                    length: chunk.length(),
                    owner: chunk.owner(),
                    policy: chunk
                        .owner()
                        .and_then(|owner| self.buffers.get(owner.0))
                        .map(SurfaceBuffer::policy),
                    toleration: chunk.toleration(),
                };
                if callback(&info).is_break() {
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }

    /// Checks heap layout and buffer/chunk cross references.
    ///
    /// # Errors
    /// `Bug` describing the first violated invariant.
    pub fn verify_heaps(&self) -> VidmemResult<()> {
        for (heap_index, heap) in self.heaps.iter().enumerate() {
            heap.verify()
                .map_err(|e| VidmemError::bug(format!("heap #{heap_index}: {e}")))?;

            for (key, chunk) in heap.iter() {
                let Some(owner) = chunk.owner() else {
                    continue;
                };
                let id = ChunkId {
                    heap: heap_index,
                    key,
                };
                let placed = self.buffers.get(owner.0).is_some_and(|b| {
                    b.video().chunk() == Some(id) && b.video().offset() == chunk.offset()
                });
                if !placed {
                    return Err(VidmemError::bug(format!(
                        "chunk {id} claims buffer {owner} which is not placed there"
                    )));
                }
            }
        }

        for (key, buffer) in self.buffers.iter() {
            let video = buffer.video();
            if video.chunk().is_some() != video.health().is_valid() {
                return Err(VidmemError::bug(format!(
                    "buffer #{key} video health {:?} with chunk {:?}",
                    video.health(),
                    video.chunk()
                )));
            }
            check_contents(buffer, BufferId(key))?;
            if let Some(chunk) = video.chunk() {
                let owned = self
                    .heaps
                    .get(chunk.heap)
                    .and_then(|h| h.chunk(chunk.key))
                    .and_then(Chunk::owner)
                    == Some(BufferId(key));
                if !owned {
                    return Err(VidmemError::bug(format!(
                        "buffer #{key} points at {chunk} which it does not own"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Bounded wait for a buffer's software locks: a short spin, then yielding.
///
/// Best effort only; the caller frees the placement even if locks remain.
fn wait_for_software_locks(lock: &SoftwareLock, id: BufferId, iterations: u32) {
    for attempt in 0..iterations {
        if !lock.is_locked() {
            return;
        }
        if attempt < LOCK_WAIT_SPIN_ITERATIONS {
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }

    if lock.is_locked() {
        log::warn!(
            "buffer {id} still has {} software locks after {iterations} iterations, \
             freeing its video memory anyway",
            lock.count()
        );
    }
}
