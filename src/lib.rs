//! Sub-allocator for graphics memory.
//!
//! A graphics device is slow at handing out memory and limits how many memory
//! objects may exist at once, so resources are not given memory objects of their
//! own. Instead the allocator asks a [`MemoryDevice`] for a few large heaps and
//! carves them into [`Region`]s:
//!
//! ```text
//!   MemoryManager ──► HeapCollection (one per MemoryKind) ──► Heap ──► Region
//!                              │
//!                              └── MemoryDevice::create_heap / destroy_heap / budget
//! ```
//!
//! * [`Heap`] keeps every span of one heap in offset order and finds the
//!   smallest free span that fits a request (best fit).
//! * [`HeapCollection`] grows by creating heaps on demand and releases empty
//!   ones under a retention policy.
//! * [`MemoryManager`] validates requests, locks the right collection and
//!   aggregates statistics.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use heapalloc::{AllocationFlags, AllocatorConfig, HostMemoryDevice, MemoryKind, MemoryManager};
//!
//! let device = Arc::new(HostMemoryDevice::new());
//! let manager: MemoryManager<_> = MemoryManager::new(device, AllocatorConfig::default())?;
//!
//! let region = manager.try_allocate(MemoryKind::HostVisible, 4096, 256, AllocationFlags::empty())?;
//! manager.free(&region)?;
//! # Ok::<(), heapalloc::AllocError>(())
//! ```

mod collection;
mod config;
mod device;
mod error;
mod flags;
mod freelist;
mod heap;
mod kernel;
mod list;
mod lock;
mod manager;
mod region;
mod stats;
mod utils;

pub use collection::HeapCollection;
pub use config::{AllocatorConfig, CollectionConfig, HeapConfig};
pub use device::{Budget, MemoryDevice, MemoryKind};
pub use error::{AllocError, Result};
pub use flags::AllocationFlags;
pub use heap::{Heap, SubAllocator};
pub use kernel::{HostHeap, HostMemoryDevice, page_size};
pub use manager::{MemoryManager, RegionRequest};
pub use region::{CollectionId, HeapId, Region, RegionOwner};
pub use stats::Statistics;
pub use utils::{DEFAULT_ALIGNMENT, align_up};
