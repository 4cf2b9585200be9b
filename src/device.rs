//! The boundary between the allocator and the graphics device layer.
//!
//! The allocator never talks to a real device itself. It only needs to create
//! and destroy heaps of a given size and to ask how much memory it may still use.

use std::fmt;

use crate::error::Result;

/// Kind of memory a collection hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryKind {
    /// Device local (VRAM), fastest for the GPU
    DeviceLocal,
    /// Host visible, written by the CPU and read by the GPU
    HostVisible,
    /// Host cached, read back by the CPU
    HostCached,
}

impl MemoryKind {
    /// Every kind, in the order the manager keeps its collections.
    pub const ALL: [MemoryKind; 3] = [
        MemoryKind::DeviceLocal,
        MemoryKind::HostVisible,
        MemoryKind::HostCached,
    ];

    pub(crate) const fn index(self) -> usize {
        match self {
            MemoryKind::DeviceLocal => 0,
            MemoryKind::HostVisible => 1,
            MemoryKind::HostCached => 2,
        }
    }

    /// Check if CPU can access this kind of memory
    pub const fn is_cpu_accessible(&self) -> bool {
        matches!(self, MemoryKind::HostVisible | MemoryKind::HostCached)
    }
}

/// Memory usage estimate reported by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Budget {
    /// Bytes the process is estimated to use.
    pub usage: u64,
    /// Bytes the process is estimated to be allowed to use.
    pub budget: u64,
}

impl Budget {
    pub const fn new(usage: u64, budget: u64) -> Self {
        Self { usage, budget }
    }

    /// Headroom left before the budget is reached.
    pub const fn available(&self) -> u64 {
        self.budget.saturating_sub(self.usage)
    }

    pub const fn is_exceeded(&self) -> bool {
        self.usage >= self.budget
    }
}

/// Abstract device that provides heaps to sub-allocate.
///
/// Implementations must be cheap to query: [`MemoryDevice::budget`] is called on
/// every allocation that may grow a collection and on every free that empties a heap.
pub trait MemoryDevice: Send + Sync {
    /// Memory object backing one heap. It has to stay a contiguous range for
    /// as long as it lives.
    type Memory: fmt::Debug + Send + Sync;

    /// Allocates a new memory object of `size` bytes.
    ///
    /// Failing here is an ordinary allocation failure, typically
    /// [`crate::AllocError::DeviceOutOfMemory`].
    fn create_heap(&self, kind: MemoryKind, size: u64) -> Result<Self::Memory>;

    /// Releases a memory object. Only called for heaps without live regions.
    fn destroy_heap(&self, kind: MemoryKind, memory: Self::Memory);

    /// Current usage estimate for `kind`.
    fn budget(&self, kind: MemoryKind) -> Budget;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scriptable device used by the collection and manager tests.

    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    use super::*;
    use crate::error::AllocError;

    #[derive(Debug, PartialEq, Eq)]
    pub struct MockMemory {
        pub id: usize,
        pub size: u64,
    }

    /// Device whose budget and failures are set by the test.
    ///
    /// Unless a fixed usage is set, usage is the sum of live heap sizes.
    #[derive(Debug)]
    pub struct MockDevice {
        next_id: AtomicUsize,
        live_bytes: AtomicU64,
        created: AtomicUsize,
        destroyed: AtomicUsize,
        budget: AtomicU64,
        fixed_usage: AtomicU64,
        use_fixed_usage: AtomicBool,
        fail_creation: AtomicBool,
    }

    impl MockDevice {
        pub fn new() -> Self {
            Self::with_budget(u64::MAX)
        }

        pub fn with_budget(budget: u64) -> Self {
            Self {
                next_id: AtomicUsize::new(0),
                live_bytes: AtomicU64::new(0),
                created: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
                budget: AtomicU64::new(budget),
                fixed_usage: AtomicU64::new(0),
                use_fixed_usage: AtomicBool::new(false),
                fail_creation: AtomicBool::new(false),
            }
        }

        pub fn set_budget(&self, budget: u64) {
            self.budget.store(budget, Ordering::SeqCst);
        }

        /// Reports `usage` regardless of the live heaps.
        pub fn set_usage(&self, usage: u64) {
            self.fixed_usage.store(usage, Ordering::SeqCst);
            self.use_fixed_usage.store(true, Ordering::SeqCst);
        }

        pub fn fail_creation(&self, fail: bool) {
            self.fail_creation.store(fail, Ordering::SeqCst);
        }

        pub fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }

        pub fn destroyed(&self) -> usize {
            self.destroyed.load(Ordering::SeqCst)
        }

        pub fn live_bytes(&self) -> u64 {
            self.live_bytes.load(Ordering::SeqCst)
        }
    }

    impl MemoryDevice for MockDevice {
        type Memory = MockMemory;

        fn create_heap(&self, _kind: MemoryKind, size: u64) -> Result<MockMemory> {
            if self.fail_creation.load(Ordering::SeqCst) {
                return Err(AllocError::DeviceOutOfMemory { size });
            }

            self.created.fetch_add(1, Ordering::SeqCst);
            self.live_bytes.fetch_add(size, Ordering::SeqCst);

            Ok(MockMemory {
                id: self.next_id.fetch_add(1, Ordering::SeqCst),
                size,
            })
        }

        fn destroy_heap(&self, _kind: MemoryKind, memory: MockMemory) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            self.live_bytes.fetch_sub(memory.size, Ordering::SeqCst);
        }

        fn budget(&self, _kind: MemoryKind) -> Budget {
            let usage = if self.use_fixed_usage.load(Ordering::SeqCst) {
                self.fixed_usage.load(Ordering::SeqCst)
            } else {
                self.live_bytes()
            };
            Budget::new(usage, self.budget.load(Ordering::SeqCst))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_headroom() {
        assert_eq!(40, Budget::new(60, 100).available());
        assert_eq!(0, Budget::new(120, 100).available());
        assert!(Budget::new(100, 100).is_exceeded());
        assert!(!Budget::new(99, 100).is_exceeded());
    }

    #[test]
    fn kinds_have_distinct_slots() {
        for (index, kind) in MemoryKind::ALL.iter().enumerate() {
            assert_eq!(index, kind.index());
        }
        assert!(!MemoryKind::DeviceLocal.is_cpu_accessible());
        assert!(MemoryKind::HostVisible.is_cpu_accessible());
    }
}
