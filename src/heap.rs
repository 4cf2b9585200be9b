use std::fmt;

use crate::{
    config::HeapConfig,
    error::{AllocError, Result},
    freelist::FreeList,
    list::{List, NodeId},
    region::{Region, RegionNode, RegionOwner},
    stats::Statistics,
    utils::{align_up, is_valid_alignment, normalize_alignment},
};

/// Strategy that carves one fixed-size heap into regions.
///
/// [`crate::HeapCollection`] only talks to heaps through this trait, so a
/// different scheme (buddy, TLSF, ...) can replace the default best-fit [`Heap`]
/// without touching the collection or the manager.
pub trait SubAllocator: fmt::Debug + Send + Sync {
    /// Creates an allocator managing `size` bytes, all of them free.
    fn new(owner: RegionOwner, size: u64, config: HeapConfig) -> Self
    where
        Self: Sized;

    /// Heap and collection the regions of this allocator belong to.
    fn owner(&self) -> RegionOwner;

    /// Total size of the heap.
    fn size(&self) -> u64;

    /// Bytes not covered by allocated regions.
    fn total_free_size(&self) -> u64;

    /// Tells whether no region is allocated.
    fn is_empty(&self) -> bool {
        self.total_free_size() == self.size()
    }

    /// Carves a region of `size` bytes aligned to `alignment` out of the heap.
    fn allocate(&mut self, size: u64, alignment: u64) -> Result<Region>;

    /// Gives `region` back to the heap.
    fn free(&mut self, region: &Region) -> Result<()>;

    /// Frees every region at once.
    fn clear(&mut self);

    fn statistics(&self) -> Statistics;

    /// Checks the internal bookkeeping and panics if it is inconsistent.
    fn validate(&self);
}

/// One fixed-size heap managed with a best-fit free list.
///
/// The heap keeps every span, free or allocated, in an offset-ordered [`List`] of
/// [`RegionNode`]s. The spans cover the heap without gaps and two free spans are
/// never neighbours. Free spans of at least `registration_threshold` bytes are
/// also kept in a [`FreeList`] sorted by size.
///
/// ```text
///  0                                                                      size
///  +--------+--------------------+------+-------------------+---------------+
///  |  free  |     allocated      | free |     allocated     |     free      |
///  +--------+--------------------+------+-------------------+---------------+
///      |                            |                               |
///      +------------- free list (ascending size) --------------------+
/// ```
///
/// Allocating looks up the smallest free span that can hold the request plus
/// its margins, then splits it into up to three spans: leading padding,
/// the allocation and the trailing rest. Freeing merges the span with its free
/// neighbours.
pub struct Heap {
    owner: RegionOwner,
    size: u64,
    config: HeapConfig,
    regions: List<RegionNode>,
    free_list: FreeList,
    free_region_count: usize,
    total_free_size: u64,
}

impl Heap {
    /// Creates a heap of `size` bytes holding a single free region.
    pub fn new(owner: RegionOwner, size: u64, config: HeapConfig) -> Self {
        let mut heap = Self {
            owner,
            size,
            config,
            regions: List::new(),
            free_list: FreeList::new(),
            free_region_count: 0,
            total_free_size: 0,
        };
        heap.reset();
        heap
    }

    fn reset(&mut self) {
        self.regions.clear();
        self.free_list.clear();

        let whole = self.regions.append(RegionNode::free(0, self.size));
        self.register(whole);
        self.free_region_count = 1;
        self.total_free_size = self.size;
    }

    pub fn owner(&self) -> RegionOwner {
        self.owner
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn config(&self) -> HeapConfig {
        self.config
    }

    pub fn total_free_size(&self) -> u64 {
        self.total_free_size
    }

    pub fn free_region_count(&self) -> usize {
        self.free_region_count
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_free_size == self.size
    }

    /// Every span of the heap, free and allocated, in offset order.
    pub fn regions(&self) -> impl Iterator<Item = Region> + '_ {
        let owner = self.owner;
        self.regions.iter().map(move |(_, node)| node.to_region(owner))
    }

    /// Size of the largest free span.
    pub fn largest_free_region(&self) -> u64 {
        // Unregistered spans are all below the threshold, so any indexed span wins.
        match self.free_list.last() {
            Some(node) => self.regions.get(node).size,
            None => self
                .regions
                .iter()
                .filter(|(_, node)| !node.is_allocated)
                .map(|(_, node)| node.size)
                .max()
                .unwrap_or(0),
        }
    }

    /// Adds a free node to the size index if it is large enough to be worth it.
    fn register(&mut self, node: NodeId) {
        if self.regions.get(node).size >= self.config.registration_threshold {
            self.free_list.insert_free_block(node, &self.regions);
        }
    }

    /// Takes a free node out of the size index. Must run before its size changes.
    fn unregister(&mut self, node: NodeId) {
        if self.regions.get(node).size >= self.config.registration_threshold {
            let removed = self.free_list.remove_free_block(node, &self.regions);
            debug_assert!(removed, "free region missing from the size index");
        }
    }

    /// Allocates `size` bytes aligned to `alignment` (`0` means no preference).
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<Region> {
        if size == 0 {
            return Err(AllocError::invalid("allocation size must not be zero"));
        }
        if !is_valid_alignment(alignment) {
            return Err(AllocError::invalid("alignment is not a power of two"));
        }
        let alignment = normalize_alignment(alignment);
        let margin = self.config.margin;

        let size_with_margins = margin
            .checked_mul(2)
            .and_then(|margins| margins.checked_add(size))
            .ok_or(AllocError::OutOfMemory { size })?;

        if self.total_free_size < size_with_margins {
            return Err(AllocError::OutOfMemory { size });
        }

        let start = self.free_list.lower_bound(size_with_margins, &self.regions);

        for index in start..self.free_list.len() {
            let Some(candidate) = self.free_list.get(index) else {
                break;
            };
            let free = *self.regions.get(candidate);

            let offset = align_up(free.offset + margin, alignment);
            let padding_begin = offset - free.offset;

            if padding_begin + size + margin > free.size {
                continue;
            }

            let padding_end = free.size - padding_begin - size;

            self.free_list.remove_at(index);
            self.split(candidate, offset, size, alignment, padding_begin, padding_end);

            log::trace!(
                "heap {:?}: allocated [{}, {}) align {}",
                self.owner.heap,
                offset,
                offset + size,
                alignment
            );
            debug_assert!(self.total_free_size <= self.size);

            return Ok(self.regions.get(candidate).to_region(self.owner));
        }

        Err(AllocError::Fragmented { size })
    }

    /// Turns the free node `node` (already out of the index) into an allocated
    /// region and wraps it in free padding on both sides.
    fn split(
        &mut self,
        node: NodeId,
        offset: u64,
        size: u64,
        alignment: u64,
        padding_begin: u64,
        padding_end: u64,
    ) {
        let free = *self.regions.get(node);

        *self.regions.get_mut(node) = RegionNode {
            offset,
            size,
            alignment,
            is_allocated: true,
        };
        self.free_region_count -= 1;
        self.total_free_size -= free.size;

        if padding_end > 0 {
            let rest = self
                .regions
                .insert_after(node, RegionNode::free(offset + size, padding_end));
            self.register(rest);
            self.free_region_count += 1;
            self.total_free_size += padding_end;
        }

        if padding_begin > 0 {
            let lead = self
                .regions
                .insert_before(node, RegionNode::free(free.offset, padding_begin));
            self.register(lead);
            self.free_region_count += 1;
            self.total_free_size += padding_begin;
        }
    }

    /// Frees `region` and merges it with its free neighbours.
    ///
    /// Fails with [`AllocError::KeyNotFound`] when the region is not allocated
    /// in this heap, e.g. on a double free.
    pub fn free(&mut self, region: &Region) -> Result<()> {
        let not_found = AllocError::KeyNotFound {
            offset: region.offset(),
            size: region.size(),
        };
        if region.owner() != self.owner || !region.is_allocated() {
            return Err(not_found);
        }

        let node = self
            .regions
            .iter()
            .find(|(_, node)| node.matches(region))
            .map(|(id, _)| id)
            .ok_or(not_found)?;

        let freed = self.regions.get_mut(node);
        freed.is_allocated = false;
        freed.alignment = 1;
        self.free_region_count += 1;
        self.total_free_size += region.size();

        let node = self.merge_with_prev(node);
        self.merge_with_next(node);
        self.register(node);

        log::trace!(
            "heap {:?}: freed [{}, {})",
            self.owner.heap,
            region.offset(),
            region.end()
        );
        debug_assert!(self.total_free_size <= self.size);

        Ok(())
    }

    /// Merges the free `node` into its previous node if that one is free too.
    /// The previous node survives, so the merged span keeps the lower node.
    fn merge_with_prev(&mut self, node: NodeId) -> NodeId {
        let Some(prev) = self.regions.prev(node) else {
            return node;
        };
        if self.regions.get(prev).is_allocated {
            return node;
        }

        self.unregister(prev);
        let merged = self.regions.remove(node);
        self.regions.get_mut(prev).size += merged.size;
        self.free_region_count -= 1;

        prev
    }

    /// Absorbs the next node into the free `node` if that one is free too.
    fn merge_with_next(&mut self, node: NodeId) {
        let Some(next) = self.regions.next(node) else {
            return;
        };
        if self.regions.get(next).is_allocated {
            return;
        }

        self.unregister(next);
        let merged = self.regions.remove(next);
        self.regions.get_mut(node).size += merged.size;
        self.free_region_count -= 1;
    }

    /// Frees every region at once without walking them.
    pub fn clear(&mut self) {
        self.reset();
    }

    pub fn statistics(&self) -> Statistics {
        Statistics {
            heap_count: 1,
            heap_bytes: self.size,
            allocation_count: self.regions.len() - self.free_region_count,
            allocation_bytes: self.size - self.total_free_size,
            free_bytes: self.total_free_size,
            free_region_count: self.free_region_count,
        }
    }

    /// Recomputes every counter from scratch and checks the heap invariants.
    ///
    /// # Panics
    ///
    /// Panics when the bookkeeping is corrupted. This is an allocator bug, never
    /// caller misuse.
    pub fn validate(&self) {
        let mut expected_offset = 0;
        let mut free_size = 0;
        let mut free_count = 0;
        let mut registered = 0;
        let mut prev_free = false;

        assert!(!self.regions.is_empty(), "heap has no regions");
        let first = self.regions.first().map(|id| self.regions.get(id));
        let last = self.regions.last().map(|id| self.regions.get(id));
        assert_eq!(Some(0), first.map(|node| node.offset), "first region is not at the start");
        assert_eq!(
            Some(self.size),
            last.map(|node| node.offset + node.size),
            "last region is not at the end"
        );

        for (id, node) in &self.regions {
            assert_eq!(expected_offset, node.offset, "regions are not contiguous");
            assert!(node.size > 0, "empty region at offset {}", node.offset);
            expected_offset += node.size;

            if node.is_allocated {
                assert!(!self.free_list.contains(id), "allocated region is indexed");
                prev_free = false;
                continue;
            }

            assert!(!prev_free, "adjacent free regions at offset {}", node.offset);
            prev_free = true;
            free_size += node.size;
            free_count += 1;

            if node.size >= self.config.registration_threshold {
                assert!(self.free_list.contains(id), "free region is not indexed");
                registered += 1;
            } else {
                assert!(!self.free_list.contains(id), "small free region is indexed");
            }
        }

        assert_eq!(self.size, expected_offset, "regions do not cover the heap");
        assert_eq!(self.total_free_size, free_size, "free size out of sync");
        assert_eq!(self.free_region_count, free_count, "free count out of sync");
        assert_eq!(registered, self.free_list.len(), "size index has stale entries");
        for node in self.free_list.iter() {
            assert!(!self.regions.get(node).is_allocated, "size index holds an allocated region");
        }
        assert!(self.free_list.is_sorted(&self.regions), "size index is not sorted");
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("owner", &self.owner)
            .field("size", &self.size)
            .field("total_free_size", &self.total_free_size)
            .field("free_region_count", &self.free_region_count)
            .field("region_count", &self.regions.len())
            .finish()
    }
}

impl SubAllocator for Heap {
    fn new(owner: RegionOwner, size: u64, config: HeapConfig) -> Self {
        Heap::new(owner, size, config)
    }

    fn owner(&self) -> RegionOwner {
        self.owner
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn total_free_size(&self) -> u64 {
        self.total_free_size
    }

    fn is_empty(&self) -> bool {
        Heap::is_empty(self)
    }

    fn allocate(&mut self, size: u64, alignment: u64) -> Result<Region> {
        Heap::allocate(self, size, alignment)
    }

    fn free(&mut self, region: &Region) -> Result<()> {
        Heap::free(self, region)
    }

    fn clear(&mut self) {
        Heap::clear(self)
    }

    fn statistics(&self) -> Statistics {
        Heap::statistics(self)
    }

    fn validate(&self) {
        Heap::validate(self)
    }
}
