use std::ops::ControlFlow;
use vidmem_rs::{
    HardwareLimits, HostVideoMemory, PixelFormat, Policy, Storage, SurfaceDesc, SurfaceManager,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("============================================================");
    println!("              Video Memory Manager - Chunk Map              ");
    println!("============================================================");

    // 1. A 1 MiB video heap behind a 64 KiB visible framebuffer
    let limits = HardwareLimits::new()
        .alignments(64, 8, 64)
        .power_of_two_limits(2048, 8192, 2048);
    let manager = SurfaceManager::create(limits, HostVideoMemory::new(1 << 20, 256 << 10))?;
    let mut guard = manager.lock()?;
    guard.add_heap(Storage::Video, 0, 1 << 20)?;
    guard.add_heap(Storage::Auxiliary, 0, 256 << 10)?;
    guard.adjust_heap_offset(64 << 10)?;

    // 2. Register a mix of surfaces
    println!("[+] Registering surfaces...");
    let surfaces = [
        SurfaceDesc::new(320, 240, PixelFormat::Argb).policy(Policy::VideoHigh),
        SurfaceDesc::new(176, 144, PixelFormat::Yv12),
        SurfaceDesc::new(64, 64, PixelFormat::Rgb16).policy(Policy::VideoOnly),
        SurfaceDesc::new(640, 480, PixelFormat::Nv12),
        SurfaceDesc::new(32, 32, PixelFormat::A8).policy(Policy::SystemOnly),
    ];
    for desc in surfaces {
        let id = guard.register_buffer(desc)?;
        let (pitch, length) = guard.placement_size(&desc)?;
        match guard.assure_video(id) {
            Ok(()) => println!(
                "    {id}: {}x{} {:?} {:?} -> pitch {pitch}, {length} bytes",
                desc.width, desc.height, desc.format, desc.policy
            ),
            Err(e) => println!(
                "    {id}: {}x{} {:?} {:?} stays in system memory ({e})",
                desc.width, desc.height, desc.format, desc.policy
            ),
        }
    }

    // 3. Dump the chunk lists
    println!("\n[+] Chunks:");
    println!(
        "    {:<12} {:<10} {:>10} {:>10}  {:<8} {:<10} {:>4}",
        "id", "storage", "offset", "length", "owner", "policy", "tol"
    );
    let _ = guard.enumerate_chunks(|chunk| {
        println!(
            "    {:<12} {:<10} {:>#10x} {:>10}  {:<8} {:<10} {:>4}",
            chunk.id.to_string(),
            format!("{:?}", chunk.storage),
            chunk.offset,
            chunk.length,
            chunk.owner.map_or_else(|| "-".to_string(), |o| o.to_string()),
            chunk.policy.map_or_else(|| "free".to_string(), |p| format!("{p:?}")),
            chunk.toleration,
        );
        ControlFlow::Continue(())
    });

    for (index, heap) in guard.heaps().iter().enumerate() {
        println!(
            "\n[+] Heap #{index} ({:?}): 0x{:x}+{} bytes, {} available, {} chunks",
            heap.storage(),
            heap.offset(),
            heap.length(),
            heap.avail(),
            heap.chunk_count()
        );
    }

    guard.verify_heaps()?;
    println!("\n[+] Heap invariants hold.");
    drop(guard);

    manager.destroy()?;
    Ok(())
}
