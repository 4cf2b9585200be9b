//! Allocator error types.
//!
//! Every failure of the allocator is surfaced as an [`AllocError`]. Invariant
//! violations in the heap bookkeeping are not errors; they are assertions.

use thiserror::Error;

/// Result type for allocator operations.
pub type Result<T> = core::result::Result<T, AllocError>;

/// Errors that can occur while allocating or freeing regions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// A request argument was rejected before anything was mutated.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: &'static str },

    /// The region is not live in the heap or collection it was freed to.
    #[error("region [{offset}, {offset} + {size}) not found")]
    KeyNotFound { offset: u64, size: u64 },

    /// Not enough free space to satisfy the request.
    #[error("out of memory: cannot allocate {size} bytes")]
    OutOfMemory { size: u64 },

    /// Enough free space in total, but no single free region could hold the request.
    #[error("heap too fragmented to allocate {size} bytes")]
    Fragmented { size: u64 },

    /// Growing the collection would exceed the estimated memory budget.
    #[error("allocating {size} bytes would exceed the memory budget (usage {usage} of {budget})")]
    BudgetExceeded { size: u64, usage: u64, budget: u64 },

    /// The collection already holds its maximum number of heaps.
    #[error("heap limit of {maximum} reached")]
    HeapLimitReached { maximum: usize },

    /// The memory device could not create a heap.
    #[error("device failed to create a heap of {size} bytes")]
    DeviceOutOfMemory { size: u64 },
}

impl AllocError {
    /// Tells whether this error means "no memory for this request".
    ///
    /// Resource types map every such error onto their own out-of-memory error.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory { .. }
                | Self::Fragmented { .. }
                | Self::BudgetExceeded { .. }
                | Self::HeapLimitReached { .. }
                | Self::DeviceOutOfMemory { .. }
        )
    }

    pub(crate) fn invalid(reason: &'static str) -> Self {
        Self::InvalidArgument { reason }
    }
}
