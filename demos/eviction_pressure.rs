use vidmem_rs::{
    HardwareLimits, HostVideoMemory, PixelFormat, Policy, Storage, SurfaceDesc, SurfaceManager,
    VidmemError,
};

const HEAP_LENGTH: usize = 64 << 10;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("============================================================");
    println!("            Video Memory Manager - Eviction Test            ");
    println!("============================================================");

    let video_memory = HostVideoMemory::new(HEAP_LENGTH, 0);
    let manager = SurfaceManager::create(HardwareLimits::new(), video_memory)?;
    let mut guard = manager.lock()?;
    guard.add_heap(Storage::Video, 0, HEAP_LENGTH)?;

    // 1. Fill the heap with low priority surfaces
    println!("[+] Filling a {HEAP_LENGTH} byte heap with VIDEOLOW surfaces...");
    let desc = SurfaceDesc::new(64, 60, PixelFormat::Argb);
    let mut low = Vec::new();
    loop {
        let id = guard.register_buffer(desc)?;
        match guard.allocate(id) {
            Ok(chunk) => {
                guard.write_system(id, |data, _| data.fill(low.len() as u8))?;
                guard.assure_video(id)?;
                println!("    {id} -> {chunk}");
                low.push(id);
            }
            Err(VidmemError::NoVideoMemory) => {
                guard.release_buffer(id)?;
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    println!("    {} surfaces placed", low.len());

    // 2. Equal priority has to wait for toleration to build up
    println!("\n[+] Requesting one more VIDEOLOW surface...");
    let late = guard.register_buffer(desc)?;
    let mut attempts = 1;
    while let Err(VidmemError::NoVideoMemory) = guard.allocate(late) {
        attempts += 1;
    }
    println!(
        "    placed after {attempts} attempts (threshold {})",
        guard.heaps()[0].eviction_threshold()
    );

    // 3. Higher priority evicts right away
    println!("\n[+] Requesting a VIDEOHIGH surface...");
    let high = guard.register_buffer(desc.policy(Policy::VideoHigh))?;
    let chunk = guard.allocate(high)?;
    println!("    placed at {chunk} on the first attempt");

    // 4. Evicted surfaces kept their contents
    let evicted: Vec<_> = low
        .iter()
        .copied()
        .filter(|&id| guard.buffer(id).is_some_and(|b| b.video().chunk().is_none()))
        .collect();
    println!("\n[+] Evicted surfaces: {evicted:?}");
    for id in evicted {
        let first = guard.read_system(id, |data, _| data[0])?;
        println!("    {id} system copy starts with {first}");
    }

    guard.verify_heaps()?;
    println!("\n[+] Heap invariants hold.");
    Ok(())
}
