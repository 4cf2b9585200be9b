use std::{
    fmt,
    ptr::NonNull,
    sync::{
        OnceLock,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::{
    device::{Budget, MemoryDevice, MemoryKind},
    error::{AllocError, Result},
    region::Region,
};

/// Virtual memory page size of the computer. This is usually 4096, but we
/// only know it at run time.
static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. The device on top of it has nothing to do with the concrete
/// APIs offered by each kernel.
trait PlatformMemory {
    /// Request a memory region of size `len`. It returns a pointer to the
    /// given location or None if the underlying syscall fails.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    unsafe fn return_memory(addr: *mut u8, len: usize);

    /// Returns the virtual memory page size of the computer in bytes.
    unsafe fn page_size() -> usize;

    /// Returns the installed physical memory in bytes, or 0 if unknown.
    unsafe fn physical_memory() -> u64;
}

/// Marker for the platform implementation of [`PlatformMemory`].
struct Kernel;

/// Wrapper to calculate the computer's page size once.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| unsafe { Kernel::page_size() })
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => NonNull::new(addr.cast::<u8>()),
                }
            }
        }

        unsafe fn return_memory(addr: *mut u8, len: usize) {
            unsafe {
                munmap(addr as *mut c_void, len as size_t);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }

        unsafe fn physical_memory() -> u64 {
            let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
            if pages <= 0 {
                return 0;
            }
            (pages as u64).saturating_mul(super::page_size() as u64)
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use super::{Kernel, PlatformMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(addr: *mut u8, _len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }

        unsafe fn physical_memory() -> u64 {
            let mut status = SystemInformation::MEMORYSTATUSEX {
                dwLength: std::mem::size_of::<SystemInformation::MEMORYSTATUSEX>() as u32,
                ..Default::default()
            };

            match unsafe { SystemInformation::GlobalMemoryStatusEx(&mut status) } {
                Ok(()) => status.ullTotalPhys,
                Err(_) => 0,
            }
        }
    }
}

/// Pages mapped from the kernel for one heap.
///
/// The mapping is released when the heap is destroyed through
/// [`HostMemoryDevice`], never on drop.
pub struct HostHeap {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is plain memory owned by the heap; access to its bytes is
// coordinated through the regions handed out for it.
unsafe impl Send for HostHeap {}
unsafe impl Sync for HostHeap {}

impl HostHeap {
    /// Start of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Mapped length, a multiple of the page size.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the first byte of `region`, or `None` when the region does
    /// not lie inside this mapping.
    pub fn region_ptr(&self, region: &Region) -> Option<NonNull<u8>> {
        if region.end() > self.len as u64 {
            return None;
        }
        let offset = usize::try_from(region.offset()).ok()?;

        // SAFETY: `offset + size <= len`, so the result stays inside the mapping.
        Some(unsafe { self.ptr.add(offset) })
    }
}

impl fmt::Debug for HostHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostHeap")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// [`MemoryDevice`] that maps anonymous pages from the operating system.
///
/// Every [`MemoryKind`] is served from the same pool of host memory, so they
/// share one usage counter. The budget defaults to the installed physical
/// memory.
pub struct HostMemoryDevice {
    usage: AtomicU64,
    budget: u64,
}

impl HostMemoryDevice {
    pub fn new() -> Self {
        let physical = unsafe { Kernel::physical_memory() };
        Self {
            usage: AtomicU64::new(0),
            budget: if physical == 0 { u64::MAX } else { physical },
        }
    }

    /// Reports `limit` bytes as the budget instead of the physical memory.
    pub fn with_budget_limit(mut self, limit: u64) -> Self {
        self.budget = limit;
        self
    }

    /// Bytes currently mapped for heaps.
    pub fn usage(&self) -> u64 {
        self.usage.load(Ordering::Relaxed)
    }
}

impl Default for HostMemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostMemoryDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMemoryDevice")
            .field("usage", &self.usage())
            .field("budget", &self.budget)
            .finish()
    }
}

impl MemoryDevice for HostMemoryDevice {
    type Memory = HostHeap;

    fn create_heap(&self, kind: MemoryKind, size: u64) -> Result<HostHeap> {
        let page_size = page_size() as u64;
        let len = size
            .max(1)
            .checked_next_multiple_of(page_size)
            .and_then(|len| usize::try_from(len).ok())
            .ok_or(AllocError::DeviceOutOfMemory { size })?;

        let ptr = unsafe { Kernel::request_memory(len) }.ok_or_else(|| {
            log::warn!("{kind:?}: the kernel refused to map {len} bytes");
            AllocError::DeviceOutOfMemory { size }
        })?;

        self.usage.fetch_add(len as u64, Ordering::Relaxed);
        log::trace!("{kind:?}: mapped {len} bytes at {ptr:?}");

        Ok(HostHeap { ptr, len })
    }

    fn destroy_heap(&self, kind: MemoryKind, memory: HostHeap) {
        unsafe { Kernel::return_memory(memory.as_ptr(), memory.len) };

        self.usage.fetch_sub(memory.len as u64, Ordering::Relaxed);
        log::trace!("{kind:?}: unmapped {} bytes at {:?}", memory.len, memory.ptr);
    }

    fn budget(&self, _kind: MemoryKind) -> Budget {
        Budget::new(self.usage(), self.budget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionOwner;

    #[test]
    fn page_size_is_a_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert_eq!(page_size(), page_size());
    }

    #[test]
    fn heaps_are_page_rounded_and_tracked() {
        let device = HostMemoryDevice::new();
        let heap = device.create_heap(MemoryKind::HostVisible, 100).unwrap();

        assert_eq!(page_size(), heap.len());
        assert_eq!(heap.len() as u64, device.usage());
        assert_eq!(device.usage(), device.budget(MemoryKind::DeviceLocal).usage);

        device.destroy_heap(MemoryKind::HostVisible, heap);
        assert_eq!(0, device.usage());
    }

    #[test]
    fn region_bytes_are_writable() {
        let device = HostMemoryDevice::new();
        let memory = device.create_heap(MemoryKind::HostVisible, 8192).unwrap();

        let mut heap = crate::heap::Heap::new(RegionOwner::standalone(), 8192, Default::default());
        let region = heap.allocate(256, 64).unwrap();
        let ptr = memory.region_ptr(&region).unwrap();

        unsafe {
            ptr.as_ptr().write_bytes(0xAB, region.size() as usize);
            let bytes = std::slice::from_raw_parts(ptr.as_ptr(), region.size() as usize);
            assert!(bytes.iter().all(|&byte| byte == 0xAB));
        }

        heap.free(&region).unwrap();
        device.destroy_heap(MemoryKind::HostVisible, memory);
    }

    #[test]
    fn regions_outside_the_mapping_have_no_address() {
        let device = HostMemoryDevice::new();
        let memory = device.create_heap(MemoryKind::HostCached, 64).unwrap();

        let mut heap = crate::heap::Heap::new(
            RegionOwner::standalone(),
            memory.len() as u64 * 2,
            Default::default(),
        );
        let _first = heap.allocate(memory.len() as u64, 1).unwrap();
        let second = heap.allocate(16, 1).unwrap();

        assert!(memory.region_ptr(&second).is_none());
        device.destroy_heap(MemoryKind::HostCached, memory);
    }

    #[test]
    fn budget_limit_overrides_physical_memory() {
        let device = HostMemoryDevice::new().with_budget_limit(1 << 20);
        assert_eq!(Budget::new(0, 1 << 20), device.budget(MemoryKind::DeviceLocal));
    }
}
