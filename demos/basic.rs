use std::sync::Arc;

use heapalloc::{
    AllocationFlags, AllocatorConfig, HostMemoryDevice, MemoryKind, MemoryManager, Region,
    RegionRequest,
};

fn log_alloc(region: &Region) {
    println!("Requested {} bytes of memory", region.size());
    println!(
        "Received offset {} in heap {:?} (alignment {})",
        region.offset(),
        region.heap(),
        region.alignment()
    );
}

fn main() -> heapalloc::Result<()> {
    let device = Arc::new(HostMemoryDevice::new());
    let config = AllocatorConfig::default().with_minimum_heap_size(64 * 1024);
    let manager: MemoryManager<_> = MemoryManager::new(Arc::clone(&device), config)?;

    let kind = MemoryKind::HostVisible;
    let flags = AllocationFlags::empty();

    let r1 = manager.try_allocate(kind, 300, 0, flags)?;
    log_alloc(&r1);

    let r2 = manager.try_allocate(kind, 200, 256, flags)?;
    log_alloc(&r2);

    println!("Deallocating r1");
    manager.free(&r1)?;

    let r3 = manager.try_allocate(kind, 100, 0, flags)?;
    println!("Should reuse the first offset: {}", r3.offset());

    // Write through the heap the region lives in.
    manager.with_heap_memory(&r3, |heap| {
        if let Some(ptr) = heap.region_ptr(&r3) {
            unsafe { ptr.as_ptr().write_bytes(0x2A, r3.size() as usize) };
            println!("Filled {} bytes at {:?}", r3.size(), ptr);
        }
    })?;

    let batch = manager.try_allocate_many(
        MemoryKind::DeviceLocal,
        &[RegionRequest::new(4096, 4096), RegionRequest::new(1 << 20, 0)],
        flags,
    )?;
    for region in &batch {
        log_alloc(region);
    }

    println!("{:#?}", manager.statistics());
    println!("Device usage: {} bytes", device.usage());

    for region in batch.iter().chain([&r2, &r3]) {
        manager.free(region)?;
    }

    println!("After freeing everything: {:#?}", manager.statistics());
    Ok(())
}
