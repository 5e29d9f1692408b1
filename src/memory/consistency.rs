//! Keeping the system and video copies of a buffer coherent.

use super::heap::{Chunk, Heap};
use super::manager::ManagerState;
use super::Storage;
use crate::error::{VidmemError, VidmemResult};
use crate::hardware::VideoAccess;
use crate::listener::notify;
use crate::surface::{BufferId, Health, Location, Policy, SurfaceBuffer, SurfaceDesc};
use std::ops::Range;

impl ManagerState {
    /// Makes the video placement hold the current contents, placing the buffer first
    /// if needed.
    ///
    /// # Errors
    /// Any `allocate` error when the buffer is not placed yet, `Bug` when neither
    /// copy holds the contents of a written buffer.
    pub fn assure_video(&mut self, id: BufferId) -> VidmemResult<()> {
        let buffer = self.lookup(id)?;
        check_contents(buffer, id)?;
        match buffer.video().health() {
            Health::Stored => {
                self.touch(id);
                return Ok(());
            }
            Health::Invalid => {
                self.allocate(id)?;
            }
            Health::Restore => {}
        }

        let buffer = self
            .buffers
            .get_mut(id.0)
            .ok_or_else(|| VidmemError::InvalidArgument(format!("unknown buffer {id}")))?;
        let (storage, region) = video_region(&self.heaps, buffer)?;

        if buffer.is_written() && buffer.system().health() == Health::Stored {
            if self.config.sync_uploads {
                self.hardware.wait_idle();
            }
            let _window = buffer.video().lock().acquire();

            let mapping = self
                .video_memory
                .mapping(storage)
                .ok_or_else(|| VidmemError::bug(format!("no CPU mapping for {storage:?}")))?;
            let target = mapping
                .get_mut(region.clone())
                .ok_or_else(|| outside_mapping(&region, storage))?;
            let source = buffer.system().data().ok_or_else(|| {
                VidmemError::bug(format!("buffer {id} system copy stored without data"))
            })?;
            transfer(
                buffer.desc(),
                source,
                buffer.system().pitch(),
                target,
                buffer.video().pitch(),
            )?;
            log::trace!("uploaded buffer {id} to {storage:?} 0x{:x}", region.start);
        }

        buffer.video_mut().mark_stored()?;
        notify(&self.listeners, id, Location::Video, Health::Stored);

        if self.config.thrifty
            && !buffer.system().is_pinned()
            && buffer.system().health().is_valid()
        {
            buffer.system_mut().release();
            notify(&self.listeners, id, Location::System, Health::Invalid);
            log::trace!("thrifty: dropped system copy of buffer {id}");
        }

        self.touch(id);
        Ok(())
    }

    /// Makes the system copy hold the current contents, downloading from video
    /// memory if that is where they live.
    ///
    /// # Errors
    /// `Bug` for VIDEOONLY buffers and for written buffers whose contents are
    /// lost, `OutOfMemory` if the system copy cannot be allocated.
    pub fn assure_system(&mut self, id: BufferId) -> VidmemResult<()> {
        let buffer = self
            .buffers
            .get_mut(id.0)
            .ok_or_else(|| VidmemError::InvalidArgument(format!("unknown buffer {id}")))?;
        if buffer.policy() == Policy::VideoOnly {
            return Err(VidmemError::bug(format!(
                "buffer {id} is video-only and has no system copy"
            )));
        }
        check_contents(buffer, id)?;

        match buffer.system().health() {
            Health::Stored => return Ok(()),
            Health::Invalid => {
                buffer.system_mut().create()?;
                notify(&self.listeners, id, Location::System, Health::Restore);
            }
            Health::Restore => {}
        }

        if buffer.is_written() && buffer.video().health() == Health::Stored {
            let (storage, region) = video_region(&self.heaps, buffer)?;

            let pending = buffer.video_mut().take_access(VideoAccess::HARDWARE_WRITE);
            if !pending.is_empty() {
                self.hardware.wait_for_access(id, pending);
            }
            self.hardware.flush_read_cache();

            let mapping = self
                .video_memory
                .mapping(storage)
                .ok_or_else(|| VidmemError::bug(format!("no CPU mapping for {storage:?}")))?;
            let source = mapping
                .get(region.clone())
                .ok_or_else(|| outside_mapping(&region, storage))?;

            let desc = *buffer.desc();
            let video_pitch = buffer.video().pitch();
            let system_pitch = buffer.system().pitch();
            let target = buffer
                .system_mut()
                .data_mut()
                .ok_or_else(|| VidmemError::bug(format!("buffer {id} system copy without data")))?;
            transfer(&desc, source, video_pitch, target, system_pitch)?;

            buffer.video_mut().add_access(VideoAccess::SOFTWARE_READ);
            log::trace!("downloaded buffer {id} from {storage:?} 0x{:x}", region.start);
        }

        buffer.system_mut().mark_stored()?;
        notify(&self.listeners, id, Location::System, Health::Stored);
        Ok(())
    }

    /// Runs `f` over the current system copy with its pitch.
    ///
    /// # Errors
    /// Any `assure_system` error.
    pub fn read_system<R>(
        &mut self,
        id: BufferId,
        f: impl FnOnce(&[u8], usize) -> R,
    ) -> VidmemResult<R> {
        self.assure_system(id)?;
        let system = self.lookup(id)?.system();
        let data = system
            .data()
            .ok_or_else(|| VidmemError::bug(format!("buffer {id} system copy without data")))?;
        Ok(f(data, system.pitch()))
    }

    /// Lets `f` write the system copy; the video copy becomes stale.
    ///
    /// # Errors
    /// Any `assure_system` error.
    pub fn write_system<R>(
        &mut self,
        id: BufferId,
        f: impl FnOnce(&mut [u8], usize) -> R,
    ) -> VidmemResult<R> {
        self.assure_system(id)?;
        let buffer = self
            .buffers
            .get_mut(id.0)
            .ok_or_else(|| VidmemError::InvalidArgument(format!("unknown buffer {id}")))?;

        let pitch = buffer.system().pitch();
        let data = buffer
            .system_mut()
            .data_mut()
            .ok_or_else(|| VidmemError::bug(format!("buffer {id} system copy without data")))?;
        let result = f(data, pitch);

        buffer.mark_written();
        if buffer.video_mut().mark_outdated() {
            notify(&self.listeners, id, Location::Video, Health::Restore);
        }
        Ok(result)
    }

    /// Runs `f` over the current video placement with its pitch.
    ///
    /// # Errors
    /// Any `assure_video` error.
    pub fn read_video<R>(
        &mut self,
        id: BufferId,
        f: impl FnOnce(&[u8], usize) -> R,
    ) -> VidmemResult<R> {
        self.assure_video(id)?;
        let buffer = self
            .buffers
            .get_mut(id.0)
            .ok_or_else(|| VidmemError::InvalidArgument(format!("unknown buffer {id}")))?;
        let (storage, region) = video_region(&self.heaps, buffer)?;
        let mapping = self
            .video_memory
            .mapping(storage)
            .ok_or_else(|| VidmemError::bug(format!("no CPU mapping for {storage:?}")))?;
        let data = mapping
            .get(region.clone())
            .ok_or_else(|| outside_mapping(&region, storage))?;

        let result = f(data, buffer.video().pitch());
        buffer.video_mut().add_access(VideoAccess::SOFTWARE_READ);
        Ok(result)
    }

    /// Lets `f` write the video placement; the system copy becomes stale.
    ///
    /// # Errors
    /// Any `assure_video` error.
    pub fn write_video<R>(
        &mut self,
        id: BufferId,
        f: impl FnOnce(&mut [u8], usize) -> R,
    ) -> VidmemResult<R> {
        self.assure_video(id)?;
        let buffer = self
            .buffers
            .get_mut(id.0)
            .ok_or_else(|| VidmemError::InvalidArgument(format!("unknown buffer {id}")))?;
        let (storage, region) = video_region(&self.heaps, buffer)?;
        let mapping = self
            .video_memory
            .mapping(storage)
            .ok_or_else(|| VidmemError::bug(format!("no CPU mapping for {storage:?}")))?;
        let data = mapping
            .get_mut(region.clone())
            .ok_or_else(|| outside_mapping(&region, storage))?;

        let result = f(data, buffer.video().pitch());

        buffer.mark_written();
        buffer.video_mut().add_access(VideoAccess::SOFTWARE_WRITE);
        if buffer.system_mut().mark_outdated() {
            notify(&self.listeners, id, Location::System, Health::Restore);
        }
        Ok(result)
    }

    /// Resets the toleration of the buffer's chunk after a use.
    fn touch(&mut self, id: BufferId) {
        let Some(chunk) = self.buffers.get(id.0).and_then(|b| b.video().chunk()) else {
            return;
        };
        if let Some(chunk) = self
            .heaps
            .get_mut(chunk.heap)
            .and_then(|heap| heap.chunk_mut(chunk.key))
        {
            chunk.reset_toleration();
        }
    }
}

/// `Bug` when a written buffer has neither a stored system copy nor a stored placement.
pub(super) fn check_contents(buffer: &SurfaceBuffer, id: BufferId) -> VidmemResult<()> {
    if buffer.is_written()
        && buffer.system().health() != Health::Stored
        && buffer.video().health() != Health::Stored
    {
        return Err(VidmemError::bug(format!(
            "buffer {id} was written but no location holds its contents"
        )));
    }
    Ok(())
}

fn outside_mapping(region: &Range<usize>, storage: Storage) -> VidmemError {
    VidmemError::bug(format!("placement {region:?} outside {storage:?} mapping"))
}

/// Storage kind and absolute byte range of a buffer's video placement.
fn video_region(
    heaps: &[Heap],
    buffer: &SurfaceBuffer,
) -> VidmemResult<(Storage, Range<usize>)> {
    let video = buffer.video();
    let chunk = video
        .chunk()
        .ok_or_else(|| VidmemError::bug("video access to an unplaced buffer"))?;
    let heap = heaps
        .get(chunk.heap)
        .ok_or_else(|| VidmemError::bug(format!("no heap for {chunk}")))?;
    let length = heap
        .chunk(chunk.key)
        .map(Chunk::length)
        .ok_or_else(|| VidmemError::bug(format!("stale chunk {chunk}")))?;
    Ok((heap.storage(), video.offset()..video.offset() + length))
}

/// Copies the image rows of `desc` between two layouts, plane by plane.
fn transfer(
    desc: &SurfaceDesc,
    source: &[u8],
    source_pitch: usize,
    target: &mut [u8],
    target_pitch: usize,
) -> VidmemResult<()> {
    let (Some(from), Some(to)) = (
        desc.format.planes(desc.width, desc.height, source_pitch),
        desc.format.planes(desc.width, desc.height, target_pitch),
    ) else {
        return Err(VidmemError::bug(format!(
            "plane layout of {}x{} {:?} overflows",
            desc.width, desc.height, desc.format
        )));
    };

    for (src, dst) in from.iter().zip(&to) {
        for row in 0..src.rows {
            let src_start = src.offset + row * src.pitch;
            let dst_start = dst.offset + row * dst.pitch;
            let src_row = source
                .get(src_start..src_start + src.row_bytes)
                .ok_or_else(|| VidmemError::bug(format!("source row {row} out of bounds")))?;
            target
                .get_mut(dst_start..dst_start + src.row_bytes)
                .ok_or_else(|| VidmemError::bug(format!("target row {row} out of bounds")))?
                .copy_from_slice(src_row);
        }
    }
    Ok(())
}
