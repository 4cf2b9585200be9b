//! This file contains the alignment helpers shared by the heap and the collection.
//! These are functions that don't particularly belong to any concrete module of the allocator.

/// Alignment used when a caller asks for an alignment of `0`.
pub const DEFAULT_ALIGNMENT: u64 = 1;

/// It aligns `to_be_aligned` up to the next multiple of `alignment`.
///
/// `alignment` has to be a power of two. This is used to place allocated regions
/// inside a heap.
#[inline]
pub fn align_up(to_be_aligned: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// Tells whether `alignment` is acceptable for a request: either `0` (meaning
/// "don't care") or a power of two.
#[inline]
pub fn is_valid_alignment(alignment: u64) -> bool {
    alignment == 0 || alignment.is_power_of_two()
}

/// Maps the "don't care" alignment `0` onto [`DEFAULT_ALIGNMENT`].
#[inline]
pub fn normalize_alignment(alignment: u64) -> u64 {
    if alignment == 0 {
        DEFAULT_ALIGNMENT
    } else {
        alignment
    }
}
