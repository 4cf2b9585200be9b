//! Allocator configuration.
//!
//! All settings are passed explicitly when the [`crate::MemoryManager`] is built.
//! [`AllocatorConfig::default`] gives the documented defaults.

use crate::error::{AllocError, Result};

const MIB: u64 = 1024 * 1024;

/// Settings for the whole allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Heaps created eagerly per collection and never released below. Default `0`.
    pub minimum_heap_count_per_collection: usize,
    /// Upper bound on heaps per collection. Default unbounded.
    pub maximum_heap_count_per_collection: usize,
    /// Smallest heap a collection creates. Default 1 MiB.
    pub minimum_heap_size: u64,
    /// Largest heap shared between several allocations. Requests at least this
    /// large get a heap of their own. Default 256 MiB.
    pub maximum_shared_heap_size: u64,
    /// Free bytes kept on both sides of every allocated region. Default `0`.
    pub minimum_allocated_region_margin_size: u64,
    /// Free regions smaller than this are not indexed and never reused until
    /// they coalesce with a neighbour. Default 16 bytes.
    pub minimum_free_region_size_to_register: u64,
    /// The embedder serializes every call itself. Default `false`.
    pub is_externally_synchronized: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            minimum_heap_count_per_collection: 0,
            maximum_heap_count_per_collection: usize::MAX,
            minimum_heap_size: MIB,
            maximum_shared_heap_size: 256 * MIB,
            minimum_allocated_region_margin_size: 0,
            minimum_free_region_size_to_register: 16,
            is_externally_synchronized: false,
        }
    }
}

impl AllocatorConfig {
    /// Sets the minimum heap count per collection.
    pub fn with_minimum_heap_count(mut self, count: usize) -> Self {
        self.minimum_heap_count_per_collection = count;
        self
    }

    /// Sets the maximum heap count per collection.
    pub fn with_maximum_heap_count(mut self, count: usize) -> Self {
        self.maximum_heap_count_per_collection = count;
        self
    }

    /// Sets the minimum heap size.
    pub fn with_minimum_heap_size(mut self, size: u64) -> Self {
        self.minimum_heap_size = size;
        self
    }

    /// Sets the maximum shared heap size.
    pub fn with_maximum_shared_heap_size(mut self, size: u64) -> Self {
        self.maximum_shared_heap_size = size;
        self
    }

    /// Sets the margin kept around allocated regions.
    pub fn with_margin(mut self, margin: u64) -> Self {
        self.minimum_allocated_region_margin_size = margin;
        self
    }

    /// Sets the registration threshold of the free-region index.
    pub fn with_registration_threshold(mut self, threshold: u64) -> Self {
        self.minimum_free_region_size_to_register = threshold;
        self
    }

    /// Opts in or out of internal locking.
    pub fn externally_synchronized(mut self, value: bool) -> Self {
        self.is_externally_synchronized = value;
        self
    }

    /// Rejects settings the allocator cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.minimum_heap_size == 0 {
            return Err(AllocError::invalid("minimum heap size must not be zero"));
        }
        if self.maximum_shared_heap_size == 0 {
            return Err(AllocError::invalid(
                "maximum shared heap size must not be zero",
            ));
        }
        if self.minimum_free_region_size_to_register == 0 {
            return Err(AllocError::invalid(
                "free region registration threshold must not be zero",
            ));
        }
        if self.minimum_heap_size > self.maximum_shared_heap_size {
            return Err(AllocError::invalid(
                "minimum heap size exceeds maximum shared heap size",
            ));
        }
        // A fresh heap's single free region has to be indexed to be found.
        if self.minimum_free_region_size_to_register > self.minimum_heap_size {
            return Err(AllocError::invalid(
                "free region registration threshold exceeds minimum heap size",
            ));
        }
        if self.minimum_heap_count_per_collection > self.maximum_heap_count_per_collection {
            return Err(AllocError::invalid(
                "minimum heap count exceeds maximum heap count",
            ));
        }
        Ok(())
    }

    /// Heap-level projection of the settings.
    pub fn heap(&self) -> HeapConfig {
        HeapConfig {
            margin: self.minimum_allocated_region_margin_size,
            registration_threshold: self.minimum_free_region_size_to_register,
        }
    }

    /// Collection-level projection of the settings.
    pub fn collection(&self) -> CollectionConfig {
        CollectionConfig {
            minimum_heap_count: self.minimum_heap_count_per_collection,
            maximum_heap_count: self.maximum_heap_count_per_collection,
            minimum_heap_size: self.minimum_heap_size,
            maximum_shared_heap_size: self.maximum_shared_heap_size,
            heap: self.heap(),
        }
    }
}

/// Settings one heap needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Free bytes required before and after each allocated region.
    pub margin: u64,
    /// Smallest free region kept in the size index.
    pub registration_threshold: u64,
}

impl Default for HeapConfig {
    fn default() -> Self {
        AllocatorConfig::default().heap()
    }
}

/// Settings one heap collection needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionConfig {
    pub minimum_heap_count: usize,
    pub maximum_heap_count: usize,
    pub minimum_heap_size: u64,
    pub maximum_shared_heap_size: u64,
    pub heap: HeapConfig,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        AllocatorConfig::default().collection()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = AllocatorConfig::default();

        assert_eq!(0, config.minimum_heap_count_per_collection);
        assert_eq!(usize::MAX, config.maximum_heap_count_per_collection);
        assert_eq!(0, config.minimum_allocated_region_margin_size);
        assert!(config.minimum_heap_size > 0);
        assert!(config.maximum_shared_heap_size > 0);
        assert!(config.minimum_free_region_size_to_register > 0);
        assert!(!config.is_externally_synchronized);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn projections_follow_setters() {
        let config = AllocatorConfig::default()
            .with_margin(8)
            .with_registration_threshold(1)
            .with_minimum_heap_count(2)
            .with_maximum_heap_count(4);

        let heap = config.heap();
        assert_eq!(8, heap.margin);
        assert_eq!(1, heap.registration_threshold);

        let collection = config.collection();
        assert_eq!(2, collection.minimum_heap_count);
        assert_eq!(4, collection.maximum_heap_count);
        assert_eq!(heap, collection.heap);
    }

    #[test]
    fn inconsistent_settings_are_rejected() {
        let config = AllocatorConfig::default()
            .with_minimum_heap_count(3)
            .with_maximum_heap_count(2);
        assert!(config.validate().is_err());

        assert!(
            AllocatorConfig::default()
                .with_minimum_heap_size(0)
                .validate()
                .is_err()
        );
        assert!(
            AllocatorConfig::default()
                .with_registration_threshold(0)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn minimum_heap_size_must_fit_under_shared_maximum() {
        let config = AllocatorConfig::default()
            .with_minimum_heap_size(2 * MIB)
            .with_maximum_shared_heap_size(MIB);

        assert!(matches!(
            config.validate(),
            Err(AllocError::InvalidArgument { .. })
        ));
        assert!(config.with_maximum_shared_heap_size(2 * MIB).validate().is_ok());
    }

    #[test]
    fn registration_threshold_must_fit_in_smallest_heap() {
        let config = AllocatorConfig::default()
            .with_minimum_heap_size(64)
            .with_registration_threshold(128);

        assert!(matches!(
            config.validate(),
            Err(AllocError::InvalidArgument { .. })
        ));
        assert!(config.with_registration_threshold(64).validate().is_ok());
    }
}
