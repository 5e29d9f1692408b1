use std::sync::{Arc, Mutex};
use vidmem_rs::{
    BufferId, HardwareLimits, HardwareSync, Health, HostVideoMemory, Location, ManagerConfig,
    PixelFormat, Policy, Storage, SurfaceDesc, SurfaceManager, VideoAccess, VidmemError,
};

const HEAP_LENGTH: usize = 1000;

fn manager_with(limits: HardwareLimits, config: ManagerConfig) -> SurfaceManager {
    let _ = env_logger::builder().is_test(true).try_init();
    let manager = SurfaceManager::builder(limits, HostVideoMemory::new(HEAP_LENGTH, 0))
        .config(config)
        .build()
        .unwrap();
    manager
        .lock()
        .unwrap()
        .add_heap(Storage::Video, 0, HEAP_LENGTH)
        .unwrap();
    manager
}

fn fill(data: &mut [u8], seed: u8) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = seed.wrapping_add((i as u8).wrapping_mul(3));
    }
}

/// Image bytes of every plane, padding stripped.
fn image_bytes(desc: &SurfaceDesc, data: &[u8], pitch: usize) -> Vec<u8> {
    let mut bytes = Vec::new();
    for span in desc.format.planes(desc.width, desc.height, pitch).unwrap() {
        for row in 0..span.rows {
            let start = span.offset + row * span.pitch;
            bytes.extend_from_slice(&data[start..start + span.row_bytes]);
        }
    }
    bytes
}

#[test]
fn packed_contents_follow_the_latest_write() {
    let limits = HardwareLimits::new().alignments(1, 1, 32);
    let manager = manager_with(limits, ManagerConfig::new());
    let mut guard = manager.lock().unwrap();
    let desc = SurfaceDesc::new(5, 3, PixelFormat::Argb);
    let id = guard.register_buffer(desc).unwrap();

    let written = guard
        .write_system(id, |data, pitch| {
            assert_eq!(pitch, 20);
            fill(data, 1);
            image_bytes(&desc, data, pitch)
        })
        .unwrap();

    let uploaded = guard
        .read_video(id, |data, pitch| {
            assert_eq!(pitch, 32);
            image_bytes(&desc, data, pitch)
        })
        .unwrap();
    assert_eq!(uploaded, written);

    let rewritten = guard
        .write_video(id, |data, pitch| {
            fill(data, 77);
            image_bytes(&desc, data, pitch)
        })
        .unwrap();
    assert_ne!(rewritten, written);
    assert_eq!(guard.buffer(id).unwrap().system().health(), Health::Restore);

    let downloaded = guard
        .read_system(id, |data, pitch| image_bytes(&desc, data, pitch))
        .unwrap();
    assert_eq!(downloaded, rewritten);
    assert_eq!(guard.buffer(id).unwrap().system().health(), Health::Stored);
    assert!(guard
        .buffer(id)
        .unwrap()
        .video()
        .access()
        .contains(VideoAccess::SOFTWARE_READ | VideoAccess::SOFTWARE_WRITE));
}

fn planar_round_trip(format: PixelFormat) {
    let manager = manager_with(
        HardwareLimits::new().alignments(1, 1, 16),
        ManagerConfig::new().thrifty(),
    );
    let mut guard = manager.lock().unwrap();
    let desc = SurfaceDesc::new(6, 4, format);
    let id = guard.register_buffer(desc).unwrap();

    let written = guard
        .write_system(id, |data, pitch| {
            assert_eq!(pitch, 8);
            fill(data, 9);
            image_bytes(&desc, data, pitch)
        })
        .unwrap();

    let uploaded = guard
        .read_video(id, |data, pitch| {
            assert_eq!(pitch, 16);
            image_bytes(&desc, data, pitch)
        })
        .unwrap();
    assert_eq!(uploaded, written);

    // Thrifty mode dropped the system copy after the upload.
    let buffer = guard.buffer(id).unwrap();
    assert_eq!(buffer.system().health(), Health::Invalid);
    assert!(buffer.system().data().is_none());

    let downloaded = guard
        .read_system(id, |data, pitch| image_bytes(&desc, data, pitch))
        .unwrap();
    assert_eq!(downloaded, written);
}

#[test]
fn yv12_round_trip_through_video_memory() {
    planar_round_trip(PixelFormat::Yv12);
}

#[test]
fn nv12_round_trip_through_video_memory() {
    planar_round_trip(PixelFormat::Nv12);
}

#[test]
fn i420_round_trip_through_video_memory() {
    planar_round_trip(PixelFormat::I420);
}

#[test]
fn nv21_round_trip_through_video_memory() {
    planar_round_trip(PixelFormat::Nv21);
}

#[test]
fn nv16_round_trip_through_video_memory() {
    planar_round_trip(PixelFormat::Nv16);
}

#[test]
fn deallocate_after_thrifty_upload_keeps_contents() {
    let manager = manager_with(HardwareLimits::new(), ManagerConfig::new().thrifty());
    let mut guard = manager.lock().unwrap();
    let desc = SurfaceDesc::new(4, 4, PixelFormat::Argb);
    let id = guard.register_buffer(desc).unwrap();
    guard.write_system(id, |data, _| data.fill(0xab)).unwrap();
    guard.assure_video(id).unwrap();
    assert_eq!(guard.buffer(id).unwrap().system().health(), Health::Invalid);

    guard.deallocate(id).unwrap();
    let buffer = guard.buffer(id).unwrap();
    assert_eq!(buffer.video().health(), Health::Invalid);
    assert_eq!(buffer.system().health(), Health::Stored);
    guard.verify_heaps().unwrap();

    // Another buffer reuses the freed region and scribbles over it.
    let other = guard.register_buffer(desc).unwrap();
    guard.write_video(other, |data, _| data.fill(0x11)).unwrap();
    guard.release_buffer(other).unwrap();

    let contents = guard
        .read_system(id, |data, pitch| image_bytes(&desc, data, pitch))
        .unwrap();
    assert!(contents.iter().all(|&byte| byte == 0xab));

    guard.assure_video(id).unwrap();
    let uploaded = guard
        .read_video(id, |data, pitch| image_bytes(&desc, data, pitch))
        .unwrap();
    assert_eq!(uploaded, contents);
}

#[test]
fn deallocate_downloads_video_written_contents() {
    let manager = manager_with(HardwareLimits::new(), ManagerConfig::new());
    let mut guard = manager.lock().unwrap();
    let desc = SurfaceDesc::new(3, 5, PixelFormat::Rgb24);
    let id = guard.register_buffer(desc).unwrap();
    let written = guard
        .write_video(id, |data, pitch| {
            fill(data, 31);
            image_bytes(&desc, data, pitch)
        })
        .unwrap();
    assert_eq!(guard.buffer(id).unwrap().system().health(), Health::Restore);

    guard.deallocate(id).unwrap();
    assert_eq!(guard.buffer(id).unwrap().system().health(), Health::Stored);
    let kept = guard
        .read_system(id, |data, pitch| image_bytes(&desc, data, pitch))
        .unwrap();
    assert_eq!(kept, written);
    guard.verify_heaps().unwrap();
}

#[test]
fn deallocating_video_only_buffer_discards_contents() {
    let manager = manager_with(HardwareLimits::new(), ManagerConfig::new());
    let mut guard = manager.lock().unwrap();
    let desc = SurfaceDesc::new(4, 4, PixelFormat::Argb).policy(Policy::VideoOnly);
    let id = guard.register_buffer(desc).unwrap();
    guard.write_video(id, |data, _| fill(data, 5)).unwrap();

    guard.deallocate(id).unwrap();
    let buffer = guard.buffer(id).unwrap();
    assert!(!buffer.is_written());
    assert_eq!(buffer.video().health(), Health::Invalid);
    guard.verify_heaps().unwrap();

    // Placing it again starts from empty contents rather than failing.
    guard.assure_video(id).unwrap();
    assert_eq!(guard.buffer(id).unwrap().video().health(), Health::Stored);
}

#[test]
fn pinned_system_copy_survives_thrifty_upload() {
    let manager = manager_with(HardwareLimits::new(), ManagerConfig::new().thrifty());
    let mut guard = manager.lock().unwrap();
    let id = guard
        .register_buffer(SurfaceDesc::new(8, 8, PixelFormat::Rgb16))
        .unwrap();
    guard.buffer_mut(id).unwrap().set_system_pinned(true);
    guard.write_system(id, |data, _| fill(data, 3)).unwrap();
    guard.assure_video(id).unwrap();

    let buffer = guard.buffer(id).unwrap();
    assert_eq!(buffer.video().health(), Health::Stored);
    assert_eq!(buffer.system().health(), Health::Stored);
}

#[test]
fn eviction_downloads_video_written_contents() {
    let manager = manager_with(HardwareLimits::new(), ManagerConfig::new());
    let mut guard = manager.lock().unwrap();
    let desc = SurfaceDesc::new(4, 171, PixelFormat::A8);
    let low = guard.register_buffer(desc).unwrap();
    let written = guard
        .write_video(low, |data, pitch| {
            fill(data, 42);
            image_bytes(&desc, data, pitch)
        })
        .unwrap();

    let high = guard
        .register_buffer(desc.policy(Policy::VideoHigh))
        .unwrap();
    guard.allocate(high).unwrap();

    let buffer = guard.buffer(low).unwrap();
    assert_eq!(buffer.video().health(), Health::Invalid);
    assert_eq!(buffer.system().health(), Health::Stored);
    let kept = image_bytes(&desc, buffer.system().data().unwrap(), buffer.system().pitch());
    assert_eq!(kept, written);
}

#[test]
fn video_only_buffers_have_no_system_copy() {
    let manager = manager_with(HardwareLimits::new(), ManagerConfig::new());
    let mut guard = manager.lock().unwrap();
    let id = guard
        .register_buffer(SurfaceDesc::new(4, 4, PixelFormat::Argb).policy(Policy::VideoOnly))
        .unwrap();
    assert_eq!(guard.buffer(id).unwrap().system().health(), Health::Invalid);

    assert!(matches!(guard.assure_system(id), Err(VidmemError::Bug(_))));
    guard.write_video(id, |data, _| fill(data, 5)).unwrap();
    assert!(matches!(
        guard.read_system(id, |_, _| ()),
        Err(VidmemError::Bug(_))
    ));
}

#[test]
fn writes_mark_the_other_location_stale() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let _ = env_logger::builder().is_test(true).try_init();
    let video_memory = HostVideoMemory::new(HEAP_LENGTH, 0);
    let manager = SurfaceManager::builder(HardwareLimits::new(), video_memory)
        .listener(move |id: BufferId, location: Location, health: Health| {
            sink.lock().unwrap().push((id, location, health));
        })
        .build()
        .unwrap();
    let mut guard = manager.lock().unwrap();
    guard.add_heap(Storage::Video, 0, HEAP_LENGTH).unwrap();

    let id = guard
        .register_buffer(SurfaceDesc::new(4, 4, PixelFormat::Argb))
        .unwrap();
    guard.assure_video(id).unwrap();
    events.lock().unwrap().clear();

    guard.write_system(id, |data, _| fill(data, 1)).unwrap();
    guard.assure_video(id).unwrap();
    guard.write_video(id, |data, _| fill(data, 2)).unwrap();
    guard.assure_system(id).unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            (id, Location::Video, Health::Restore),
            (id, Location::Video, Health::Stored),
            (id, Location::System, Health::Restore),
            (id, Location::System, Health::Stored),
        ]
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HardwareEvent {
    Idle,
    Access(BufferId, VideoAccess),
    Flush,
}

#[derive(Clone, Default)]
struct RecordingHardware(Arc<Mutex<Vec<HardwareEvent>>>);

impl HardwareSync for RecordingHardware {
    fn wait_idle(&mut self) {
        self.0.lock().unwrap().push(HardwareEvent::Idle);
    }

    fn wait_for_access(&mut self, buffer: BufferId, access: VideoAccess) {
        self.0.lock().unwrap().push(HardwareEvent::Access(buffer, access));
    }

    fn flush_read_cache(&mut self) {
        self.0.lock().unwrap().push(HardwareEvent::Flush);
    }
}

#[test]
fn transfers_synchronize_with_the_accelerator() {
    let _ = env_logger::builder().is_test(true).try_init();
    let hardware = RecordingHardware::default();
    let video_memory = HostVideoMemory::new(HEAP_LENGTH, 0);
    let manager = SurfaceManager::builder(HardwareLimits::new(), video_memory)
        .config(ManagerConfig::new().sync_uploads())
        .hardware(hardware.clone())
        .build()
        .unwrap();
    let mut guard = manager.lock().unwrap();
    guard.add_heap(Storage::Video, 0, HEAP_LENGTH).unwrap();

    let id = guard
        .register_buffer(SurfaceDesc::new(4, 4, PixelFormat::Argb))
        .unwrap();

    // Nothing written yet: no upload, no wait.
    guard.assure_video(id).unwrap();
    assert!(hardware.0.lock().unwrap().is_empty());

    guard.write_system(id, |data, _| fill(data, 1)).unwrap();
    guard.assure_video(id).unwrap();
    assert_eq!(*hardware.0.lock().unwrap(), vec![HardwareEvent::Idle]);
    hardware.0.lock().unwrap().clear();

    // The accelerator renders into the buffer, then the CPU reads it back.
    guard.write_video(id, |_, _| ()).unwrap();
    guard
        .buffer_mut(id)
        .unwrap()
        .note_hardware_access(VideoAccess::HARDWARE_WRITE);
    guard.assure_system(id).unwrap();
    assert_eq!(
        *hardware.0.lock().unwrap(),
        vec![
            HardwareEvent::Access(id, VideoAccess::HARDWARE_WRITE),
            HardwareEvent::Flush,
        ]
    );
}
