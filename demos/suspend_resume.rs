use vidmem_rs::{
    BufferId, HardwareLimits, Health, HostVideoMemory, Location, PixelFormat, Policy, Storage,
    SurfaceDesc, SurfaceManager,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("============================================================");
    println!("          Video Memory Manager - Suspend / Resume           ");
    println!("============================================================");

    let manager = SurfaceManager::builder(HardwareLimits::new(), HostVideoMemory::new(1 << 20, 0))
        .listener(|id: BufferId, location: Location, health: Health| {
            println!("    [listener] {id} {location} -> {health:?}");
        })
        .build()?;
    let mut guard = manager.lock()?;
    guard.add_heap(Storage::Video, 0, 1 << 20)?;

    println!("[+] Placing surfaces...");
    let cursor_desc = SurfaceDesc::new(64, 64, PixelFormat::Argb).policy(Policy::VideoOnly);
    let cursor = guard.register_buffer(cursor_desc)?;
    let window_desc = SurfaceDesc::new(256, 256, PixelFormat::Argb).policy(Policy::VideoHigh);
    let window = guard.register_buffer(window_desc)?;
    guard.write_video(window, |data, pitch| {
        for (row, line) in data.chunks_mut(pitch).take(256).enumerate() {
            line[..4].copy_from_slice(&(row as u32).to_le_bytes());
        }
    })?;

    println!("\n[+] Suspending...");
    guard.suspend()?;
    for id in [cursor, window] {
        let buffer = guard.buffer(id).ok_or("buffer vanished")?;
        println!(
            "    {id}: video {:?}, system {:?}",
            buffer.video().health(),
            buffer.system().health()
        );
    }

    println!("\n[+] Resuming...");
    guard.resume();
    let last_row = guard.read_video(window, |data, pitch| {
        let start = 255 * pitch;
        let mut tag = [0; 4];
        tag.copy_from_slice(&data[start..start + 4]);
        u32::from_le_bytes(tag)
    })?;
    println!("    window restored, last row tag {last_row}");

    guard.verify_heaps()?;
    println!("\n[+] Heap invariants hold.");
    Ok(())
}
