//! Usage statistics for heaps, collections and the whole allocator.

use std::ops::{Add, AddAssign};

/// Snapshot of how much memory is reserved and how much of it is in use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Number of heaps
    pub heap_count: usize,
    /// Bytes reserved by those heaps
    pub heap_bytes: u64,
    /// Number of live allocated regions
    pub allocation_count: usize,
    /// Bytes held by live allocated regions
    pub allocation_bytes: u64,
    /// Bytes in free regions
    pub free_bytes: u64,
    /// Number of free regions
    pub free_region_count: usize,
}

impl Statistics {
    /// Share of reserved bytes handed out to allocations (1.0 = fully used).
    pub fn utilization(&self) -> f64 {
        if self.heap_bytes == 0 {
            0.0
        } else {
            self.allocation_bytes as f64 / self.heap_bytes as f64
        }
    }
}

impl AddAssign for Statistics {
    fn add_assign(&mut self, other: Self) {
        self.heap_count += other.heap_count;
        self.heap_bytes += other.heap_bytes;
        self.allocation_count += other.allocation_count;
        self.allocation_bytes += other.allocation_bytes;
        self.free_bytes += other.free_bytes;
        self.free_region_count += other.free_region_count;
    }
}

impl Add for Statistics {
    type Output = Self;

    fn add(mut self, other: Self) -> Self {
        self += other;
        self
    }
}

impl std::iter::Sum for Statistics {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_field_by_field() {
        let a = Statistics {
            heap_count: 1,
            heap_bytes: 1000,
            allocation_count: 2,
            allocation_bytes: 300,
            free_bytes: 700,
            free_region_count: 1,
        };
        let total: Statistics = [a, a].into_iter().sum();

        assert_eq!(2, total.heap_count);
        assert_eq!(2000, total.heap_bytes);
        assert_eq!(4, total.allocation_count);
        assert_eq!(600, total.allocation_bytes);
        assert_eq!(1400, total.free_bytes);
        assert_eq!(2, total.free_region_count);
    }

    #[test]
    fn utilization() {
        assert_eq!(0.0, Statistics::default().utilization());

        let stats = Statistics {
            heap_bytes: 1000,
            allocation_bytes: 250,
            ..Default::default()
        };
        assert_eq!(0.25, stats.utilization());
    }
}
