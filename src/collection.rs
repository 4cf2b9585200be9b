use std::{fmt, sync::Arc};

use crate::{
    config::CollectionConfig,
    device::{MemoryDevice, MemoryKind},
    error::{AllocError, Result},
    flags::AllocationFlags,
    heap::{Heap, SubAllocator},
    region::{CollectionId, HeapId, Region, RegionOwner},
    stats::Statistics,
    utils::{is_valid_alignment, normalize_alignment},
};

/// How many times the shared heap size is halved when picking a size for a new heap.
const HEAP_SIZE_HALVINGS: usize = 3;

/// A heap together with the device memory it sub-allocates.
struct HeapEntry<M, A> {
    allocator: A,
    memory: M,
    /// Created for a single request; never scanned for other requests.
    dedicated: bool,
}

impl<M, A: SubAllocator> HeapEntry<M, A> {
    fn id(&self) -> HeapId {
        self.allocator.owner().heap
    }

    fn size(&self) -> u64 {
        self.allocator.size()
    }
}

/// The heaps backing one kind of memory.
///
/// The collection grows by asking the [`MemoryDevice`] for new heaps when no
/// existing heap can hold a request, and shrinks when frees leave heaps empty.
///
/// ```text
///   HeapCollection (DeviceLocal)
///   +-------------------------------------------------------------+
///   |  [ heap 32 MiB ]  [ heap 64 MiB ]  [ heap 128 MiB ]  [ ... ]  |
///   |   fuller heaps first            one empty heap kept as spare  |
///   +-------------------------------------------------------------+
/// ```
///
/// * New shared heaps start small and double toward `maximum_shared_heap_size`.
/// * Requests larger than `maximum_shared_heap_size`, or flagged
///   [`AllocationFlags::DEDICATED_COLLECTION`], get a dedicated heap of exactly
///   their size. Dedicated heaps serve no other request and go away once empty.
/// * At most one empty heap is kept around as a spare; other empty heaps are
///   released as long as `minimum_heap_count` and the minimum size allow it.
pub struct HeapCollection<D: MemoryDevice, A: SubAllocator = Heap> {
    id: CollectionId,
    kind: MemoryKind,
    device: Arc<D>,
    config: CollectionConfig,
    /// Loosely ascending by free space, refreshed after each free.
    heaps: Vec<HeapEntry<D::Memory, A>>,
    minimum_size: u64,
    size: u64,
    /// Empty heap kept as a spare for future allocations.
    empty_heap: Option<HeapId>,
}

impl<D: MemoryDevice, A: SubAllocator> HeapCollection<D, A> {
    /// Creates the collection with its first `minimum_heap_count` heaps.
    pub fn new(device: Arc<D>, kind: MemoryKind, config: CollectionConfig) -> Result<Self> {
        let mut collection = Self {
            id: CollectionId::next(),
            kind,
            device,
            config,
            heaps: Vec::with_capacity(config.minimum_heap_count),
            minimum_size: 0,
            size: 0,
            empty_heap: None,
        };

        for _ in 0..config.minimum_heap_count {
            let size = collection.adjusted_heap_size(config.minimum_heap_size);
            collection.create_heap(size, false)?;
        }

        Ok(collection)
    }

    pub fn id(&self) -> CollectionId {
        self.id
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    /// Sum of the sizes of all heaps.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Size the collection never shrinks below.
    pub fn minimum_size(&self) -> u64 {
        self.minimum_size
    }

    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    /// Heaps in their current scan order.
    pub fn heaps(&self) -> impl Iterator<Item = &A> + '_ {
        self.heaps.iter().map(|entry| &entry.allocator)
    }

    /// Heap currently kept as the empty spare, if any.
    pub fn empty_heap(&self) -> Option<HeapId> {
        self.empty_heap
    }

    /// Device memory backing `heap`.
    pub fn heap_memory(&self, heap: HeapId) -> Option<&D::Memory> {
        self.heaps
            .iter()
            .find(|entry| entry.id() == heap)
            .map(|entry| &entry.memory)
    }

    pub fn statistics(&self) -> Statistics {
        self.heaps
            .iter()
            .map(|entry| entry.allocator.statistics())
            .sum()
    }

    /// Picks the size of the next heap for a request of `requested` bytes.
    ///
    /// Shared heaps ramp up geometrically: starting from the shared maximum, the
    /// size is halved up to three times as long as it stays above the largest
    /// shared heap already present and can hold the request twice. Requests of at
    /// least the shared maximum get a heap of exactly their size.
    pub fn adjusted_heap_size(&self, requested: u64) -> u64 {
        let maximum_shared = self.config.maximum_shared_heap_size;
        if requested >= maximum_shared {
            return requested;
        }

        let largest_shared = self
            .heaps
            .iter()
            .map(HeapEntry::size)
            .filter(|&size| size <= maximum_shared)
            .max()
            .unwrap_or(0);

        let mut size = maximum_shared;
        for _ in 0..HEAP_SIZE_HALVINGS {
            let smaller = size / 2;
            if smaller > largest_shared && smaller >= requested.saturating_mul(2) {
                size = smaller;
            } else {
                break;
            }
        }

        size.max(self.config.minimum_heap_size)
    }

    fn create_heap(&mut self, size: u64, dedicated: bool) -> Result<usize> {
        let memory = self.device.create_heap(self.kind, size).inspect_err(|err| {
            log::warn!(
                "collection {:?} ({:?}): device refused a heap of {} bytes: {}",
                self.id,
                self.kind,
                size,
                err
            );
        })?;

        let owner = RegionOwner {
            heap: HeapId::next(),
            collection: self.id,
        };
        self.heaps.push(HeapEntry {
            allocator: A::new(owner, size, self.config.heap),
            memory,
            dedicated,
        });
        self.size += size;

        log::debug!(
            "collection {:?} ({:?}): created heap {:?} of {} bytes, now {} heaps / {} bytes",
            self.id,
            self.kind,
            owner.heap,
            size,
            self.heaps.len(),
            self.size
        );

        Ok(self.heaps.len() - 1)
    }

    fn remove_heap(&mut self, index: usize) {
        let entry = self.heaps.remove(index);
        debug_assert!(entry.allocator.is_empty(), "removing a heap with live regions");

        let id = entry.id();
        if self.empty_heap == Some(id) {
            self.empty_heap = None;
        }
        self.size -= entry.size();

        log::debug!(
            "collection {:?} ({:?}): released heap {:?} of {} bytes, now {} heaps / {} bytes",
            self.id,
            self.kind,
            id,
            entry.size(),
            self.heaps.len(),
            self.size
        );

        self.device.destroy_heap(self.kind, entry.memory);
    }

    /// Tells whether a heap of `heap_size` bytes may go without breaking the
    /// minimum heap count or the minimum size.
    fn can_remove(&self, heap_size: u64) -> bool {
        self.heaps.len() > self.config.minimum_heap_count
            && self.size - heap_size >= self.minimum_size
    }

    /// Allocates a region of `size` bytes aligned to `alignment`.
    ///
    /// Shared heaps are tried first, fuller ones before emptier ones. When none
    /// fits, a new heap is created unless [`AllocationFlags::EXISTING_COLLECTION`]
    /// is set or the heap limit is reached.
    ///
    /// The device budget only refuses growth when
    /// [`AllocationFlags::WITHIN_BUDGET`] is set; without it the collection
    /// grows past the budget and leaves the decision to the device.
    pub fn allocate(&mut self, size: u64, alignment: u64, flags: AllocationFlags) -> Result<Region> {
        flags.validate()?;
        if size == 0 {
            return Err(AllocError::invalid("allocation size must not be zero"));
        }
        if !is_valid_alignment(alignment) {
            return Err(AllocError::invalid("alignment is not a power of two"));
        }

        let budget = self.device.budget(self.kind);
        let margin = self.config.heap.margin;
        let size_with_margins = margin
            .checked_mul(2)
            .and_then(|margins| margins.checked_add(size))
            .ok_or(AllocError::OutOfMemory { size })?;

        let dedicated = flags.contains(AllocationFlags::DEDICATED_COLLECTION)
            || size > self.config.maximum_shared_heap_size;

        if !dedicated {
            for entry in self.heaps.iter_mut().filter(|entry| !entry.dedicated) {
                match entry.allocator.allocate(size, alignment) {
                    Ok(region) => {
                        if self.empty_heap == Some(region.heap()) {
                            self.empty_heap = None;
                        }
                        return Ok(region);
                    }
                    Err(err) if err.is_out_of_memory() => continue,
                    Err(err) => return Err(err),
                }
            }
        }

        if flags.contains(AllocationFlags::EXISTING_COLLECTION) {
            return Err(AllocError::OutOfMemory { size });
        }
        if self.heaps.len() >= self.config.maximum_heap_count {
            return Err(AllocError::HeapLimitReached {
                maximum: self.config.maximum_heap_count,
            });
        }
        if flags.contains(AllocationFlags::WITHIN_BUDGET) && size_with_margins >= budget.available()
        {
            log::warn!(
                "collection {:?} ({:?}): {} bytes would exceed the budget (usage {} of {})",
                self.id,
                self.kind,
                size,
                budget.usage,
                budget.budget
            );
            return Err(AllocError::BudgetExceeded {
                size,
                usage: budget.usage,
                budget: budget.budget,
            });
        }

        // With margins the first aligned offset may sit past the front margin.
        let required = if margin > 0 {
            size_with_margins.saturating_add(normalize_alignment(alignment) - 1)
        } else {
            size_with_margins
        };
        // The heap's only free region must reach the index to be found.
        let heap_size = if dedicated {
            required.max(self.config.heap.registration_threshold)
        } else {
            self.adjusted_heap_size(required)
        };

        let index = self.create_heap(heap_size, dedicated)?;
        match self.heaps[index].allocator.allocate(size, alignment) {
            Ok(region) => Ok(region),
            Err(err) => {
                self.remove_heap(index);
                Err(err)
            }
        }
    }

    /// Frees `region` and releases its heap if that leaves it empty and the
    /// retention policy allows it.
    pub fn free(&mut self, region: &Region) -> Result<()> {
        let not_found = AllocError::KeyNotFound {
            offset: region.offset(),
            size: region.size(),
        };
        if region.collection() != self.id {
            return Err(not_found);
        }

        let index = self
            .heaps
            .iter()
            .position(|entry| entry.id() == region.heap())
            .ok_or(not_found)?;

        self.heaps[index].allocator.free(region)?;

        if self.heaps[index].allocator.is_empty() {
            self.release_empty_heap(index);
        }
        self.sort_incrementally();

        Ok(())
    }

    /// Keeps at most one empty shared heap around; the larger one wins.
    /// Empty dedicated heaps are released whenever the floors allow it.
    fn release_empty_heap(&mut self, index: usize) {
        let heap_size = self.heaps[index].size();
        if self.heaps[index].dedicated {
            if self.can_remove(heap_size) {
                self.remove_heap(index);
            }
            return;
        }

        let spare = self
            .empty_heap
            .and_then(|spare| self.heaps.iter().position(|entry| entry.id() == spare));

        match spare {
            Some(spare) => {
                let (keep, evict) = if heap_size > self.heaps[spare].size() {
                    (index, spare)
                } else {
                    (spare, index)
                };

                self.empty_heap = Some(self.heaps[keep].id());
                if self.can_remove(self.heaps[evict].size()) {
                    self.remove_heap(evict);
                }
            }
            None => {
                let budget = self.device.budget(self.kind);
                if budget.is_exceeded() && self.can_remove(heap_size) {
                    self.remove_heap(index);
                } else {
                    self.empty_heap = Some(self.heaps[index].id());
                }
            }
        }
    }

    /// One bubble-sort step toward ascending free space, so scans try fuller
    /// heaps first. Stops at the first swap.
    fn sort_incrementally(&mut self) {
        for index in 1..self.heaps.len() {
            let prev = self.heaps[index - 1].allocator.total_free_size();
            let current = self.heaps[index].allocator.total_free_size();

            if prev > current {
                self.heaps.swap(index - 1, index);
                break;
            }
        }
    }

    /// Moves the size floor of the collection.
    ///
    /// Lowering it releases empty heaps from the back. Raising it adds heaps
    /// until the floor is reached; if the heap limit or the device stops that,
    /// the added heaps stay, the previous floor is kept and `false` is returned.
    pub fn try_set_minimum_size(&mut self, minimum_size: u64) -> bool {
        if minimum_size <= self.minimum_size {
            self.minimum_size = minimum_size;

            for index in (0..self.heaps.len()).rev() {
                if self.heaps.len() <= self.config.minimum_heap_count {
                    break;
                }
                let entry = &self.heaps[index];
                if entry.allocator.is_empty() && self.size - entry.size() >= minimum_size {
                    self.remove_heap(index);
                }
            }

            log::debug!(
                "collection {:?} ({:?}): minimum size lowered to {} bytes",
                self.id,
                self.kind,
                minimum_size
            );
            return true;
        }

        while self.size < minimum_size {
            if self.heaps.len() >= self.config.maximum_heap_count {
                log::warn!(
                    "collection {:?} ({:?}): heap limit reached at {} of {} bytes",
                    self.id,
                    self.kind,
                    self.size,
                    minimum_size
                );
                return false;
            }

            let needed = minimum_size - self.size;
            let heap_size = self
                .adjusted_heap_size(needed.min(self.config.maximum_shared_heap_size))
                .min(needed)
                .max(self.config.minimum_heap_size);

            if self.create_heap(heap_size, false).is_err() {
                return false;
            }
        }

        self.minimum_size = minimum_size;
        log::debug!(
            "collection {:?} ({:?}): minimum size raised to {} bytes",
            self.id,
            self.kind,
            minimum_size
        );
        true
    }

    /// Checks every heap and the collection-wide invariants.
    ///
    /// # Panics
    ///
    /// Panics when the bookkeeping is corrupted.
    pub fn validate(&self) {
        let mut size = 0;
        for entry in &self.heaps {
            entry.allocator.validate();
            assert_eq!(self.id, entry.allocator.owner().collection);
            size += entry.size();
        }

        assert_eq!(self.size, size, "collection size out of sync");
        assert!(self.size >= self.minimum_size, "collection below its minimum size");
        assert!(self.heaps.len() >= self.config.minimum_heap_count);
        assert!(self.heaps.len() <= self.config.maximum_heap_count);

        if let Some(spare) = self.empty_heap {
            let entry = self
                .heaps
                .iter()
                .find(|entry| entry.id() == spare)
                .unwrap_or_else(|| panic!("spare heap {spare:?} is gone"));
            assert!(entry.allocator.is_empty(), "spare heap {spare:?} is in use");
            assert!(!entry.dedicated, "spare heap {spare:?} is dedicated");
        }
    }
}

impl<D: MemoryDevice, A: SubAllocator> Drop for HeapCollection<D, A> {
    fn drop(&mut self) {
        for entry in self.heaps.drain(..) {
            if !entry.allocator.is_empty() {
                log::warn!(
                    "collection {:?} ({:?}): heap {:?} dropped with live regions",
                    self.id,
                    self.kind,
                    entry.id()
                );
            }
            self.device.destroy_heap(self.kind, entry.memory);
        }
        self.size = 0;
    }
}

impl<D: MemoryDevice, A: SubAllocator> fmt::Debug for HeapCollection<D, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapCollection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("minimum_size", &self.minimum_size)
            .field("heaps", &self.heaps.iter().map(|entry| &entry.allocator).collect::<Vec<_>>())
            .field("empty_heap", &self.empty_heap)
            .finish()
    }
}
