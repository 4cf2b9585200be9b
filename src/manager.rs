use std::{fmt, sync::Arc};

use crate::{
    collection::HeapCollection,
    config::AllocatorConfig,
    device::{Budget, MemoryDevice, MemoryKind},
    error::{AllocError, Result},
    flags::AllocationFlags,
    heap::{Heap, SubAllocator},
    lock::CollectionLock,
    region::{CollectionId, Region},
    stats::Statistics,
    utils::is_valid_alignment,
};

/// Size and alignment of one region in a batch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionRequest {
    pub size: u64,
    pub alignment: u64,
}

impl RegionRequest {
    pub const fn new(size: u64, alignment: u64) -> Self {
        Self { size, alignment }
    }
}

/// Entry point of the allocator.
///
/// The manager owns one [`HeapCollection`] per [`MemoryKind`], each behind its
/// own lock, and hands out [`Region`]s of heaps created through the
/// [`MemoryDevice`]. Requests are validated here before any collection is
/// touched.
///
/// ```text
///                      MemoryManager
///          +-----------------+-----------------+
///          |                 |                 |
///    DeviceLocal        HostVisible        HostCached
///   [heap][heap]          [heap]          [heap][heap][heap]
/// ```
pub struct MemoryManager<D: MemoryDevice, A: SubAllocator = Heap> {
    device: Arc<D>,
    config: AllocatorConfig,
    /// Indexed by [`MemoryKind::index`].
    collections: [CollectionLock<HeapCollection<D, A>>; 3],
    /// Ids of `collections`, readable without locking.
    ids: [CollectionId; 3],
}

impl<D: MemoryDevice, A: SubAllocator> MemoryManager<D, A> {
    /// Builds a manager and the initial heaps of every collection.
    pub fn new(device: Arc<D>, config: AllocatorConfig) -> Result<Self> {
        config.validate()?;

        let [device_local, host_visible, host_cached] = MemoryKind::ALL
            .map(|kind| HeapCollection::new(Arc::clone(&device), kind, config.collection()));
        let collections = [device_local?, host_visible?, host_cached?];

        let ids = [collections[0].id(), collections[1].id(), collections[2].id()];
        let collections = collections
            .map(|collection| CollectionLock::new(collection, config.is_externally_synchronized));

        log::debug!(
            "memory manager ready: {} heaps per collection at start, shared heaps up to {} bytes",
            config.minimum_heap_count_per_collection,
            config.maximum_shared_heap_size
        );

        Ok(Self {
            device,
            config,
            collections,
            ids,
        })
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    fn collection(&self, kind: MemoryKind) -> &CollectionLock<HeapCollection<D, A>> {
        &self.collections[kind.index()]
    }

    fn owning_collection(&self, region: &Region) -> Option<&CollectionLock<HeapCollection<D, A>>> {
        self.ids
            .iter()
            .position(|&id| id == region.collection())
            .map(|index| &self.collections[index])
    }

    /// Allocates a region of `size` bytes of `kind` memory aligned to `alignment`
    /// (`0` means no requirement).
    pub fn try_allocate(
        &self,
        kind: MemoryKind,
        size: u64,
        alignment: u64,
        flags: AllocationFlags,
    ) -> Result<Region> {
        check_request(size, alignment, flags)?;

        let region = self
            .collection(kind)
            .write()
            .allocate(size, alignment, flags)?;

        log::trace!(
            "{kind:?}: allocated {size} bytes at {} in heap {:?}",
            region.offset(),
            region.heap()
        );
        Ok(region)
    }

    /// Same as [`MemoryManager::try_allocate`] for callers that cannot recover
    /// from a failed allocation.
    ///
    /// # Panics
    ///
    /// Panics with the requested size when the allocation fails.
    pub fn allocate(
        &self,
        kind: MemoryKind,
        size: u64,
        alignment: u64,
        flags: AllocationFlags,
    ) -> Region {
        self.try_allocate(kind, size, alignment, flags)
            .unwrap_or_else(|err| {
                panic!("failed to allocate {size} bytes of {kind:?} memory: {err}")
            })
    }

    /// Allocates every request or none of them.
    ///
    /// The collection stays locked for the whole batch. On the first failure the
    /// regions granted so far are freed again and the error is returned.
    pub fn try_allocate_many(
        &self,
        kind: MemoryKind,
        requests: &[RegionRequest],
        flags: AllocationFlags,
    ) -> Result<Vec<Region>> {
        for request in requests {
            check_request(request.size, request.alignment, flags)?;
        }

        let mut collection = self.collection(kind).write();
        let mut regions = Vec::with_capacity(requests.len());

        for request in requests {
            match collection.allocate(request.size, request.alignment, flags) {
                Ok(region) => regions.push(region),
                Err(err) => {
                    log::debug!(
                        "{kind:?}: batch failed at request {} of {}, rolling back: {err}",
                        regions.len() + 1,
                        requests.len()
                    );
                    for region in regions.iter().rev() {
                        collection.free(region)?;
                    }
                    return Err(err);
                }
            }
        }

        Ok(regions)
    }

    /// Gives `region` back to the collection it came from.
    pub fn free(&self, region: &Region) -> Result<()> {
        let collection = self.owning_collection(region).ok_or(AllocError::KeyNotFound {
            offset: region.offset(),
            size: region.size(),
        })?;

        collection.write().free(region)?;

        log::trace!(
            "freed {} bytes at {} in heap {:?}",
            region.size(),
            region.offset(),
            region.heap()
        );
        Ok(())
    }

    /// Current usage estimate for `kind`, straight from the device.
    pub fn budget(&self, kind: MemoryKind) -> Budget {
        self.device.budget(kind)
    }

    /// Moves the size floor of the `kind` collection.
    ///
    /// See [`HeapCollection::try_set_minimum_size`].
    pub fn try_set_minimum_size(&self, kind: MemoryKind, minimum_size: u64) -> bool {
        self.collection(kind).write().try_set_minimum_size(minimum_size)
    }

    /// Runs `f` with the device memory backing the heap of `region`.
    pub fn with_heap_memory<R>(&self, region: &Region, f: impl FnOnce(&D::Memory) -> R) -> Result<R> {
        let not_found = AllocError::KeyNotFound {
            offset: region.offset(),
            size: region.size(),
        };

        let collection = self.owning_collection(region).ok_or(not_found.clone())?.read();
        let memory = collection.heap_memory(region.heap()).ok_or(not_found)?;

        Ok(f(memory))
    }

    pub fn statistics_for(&self, kind: MemoryKind) -> Statistics {
        self.collection(kind).read().statistics()
    }

    /// Statistics of all collections together.
    pub fn statistics(&self) -> Statistics {
        MemoryKind::ALL
            .iter()
            .map(|&kind| self.statistics_for(kind))
            .sum()
    }

    /// Checks every collection.
    ///
    /// # Panics
    ///
    /// Panics when the bookkeeping is corrupted.
    pub fn validate(&self) {
        for collection in &self.collections {
            collection.read().validate();
        }
    }
}

impl<D: MemoryDevice, A: SubAllocator> fmt::Debug for MemoryManager<D, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("config", &self.config)
            .field("statistics", &self.statistics())
            .finish()
    }
}

/// Top-level argument checks, done before any lock is taken.
fn check_request(size: u64, alignment: u64, flags: AllocationFlags) -> Result<()> {
    flags.validate()?;
    if size == 0 {
        return Err(AllocError::invalid("allocation size must not be zero"));
    }
    if !is_valid_alignment(alignment) {
        return Err(AllocError::invalid("alignment is not a power of two"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockDevice;

    const KIB: u64 = 1024;

    fn config() -> AllocatorConfig {
        AllocatorConfig::default()
            .with_minimum_heap_size(4 * KIB)
            .with_maximum_shared_heap_size(64 * KIB)
            .with_registration_threshold(1)
    }

    fn manager(config: AllocatorConfig) -> (Arc<MockDevice>, MemoryManager<MockDevice>) {
        let device = Arc::new(MockDevice::new());
        let manager = MemoryManager::new(Arc::clone(&device), config).unwrap();
        (device, manager)
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let device = Arc::new(MockDevice::new());
        let config = config().with_minimum_heap_size(0);

        let result = MemoryManager::<MockDevice>::new(device, config);
        assert!(matches!(result, Err(AllocError::InvalidArgument { .. })));
    }

    #[test]
    fn minimum_heap_count_is_created_eagerly() {
        let (device, manager) = manager(config().with_minimum_heap_count(2));

        assert_eq!(6, device.created());
        for kind in MemoryKind::ALL {
            assert_eq!(2, manager.statistics_for(kind).heap_count);
        }
        manager.validate();
    }

    #[test]
    fn dedicated_request_below_default_threshold() {
        let config = AllocatorConfig::default()
            .with_minimum_heap_size(4 * KIB)
            .with_maximum_shared_heap_size(64 * KIB);
        let (device, manager) = manager(config);

        let region = manager
            .try_allocate(
                MemoryKind::DeviceLocal,
                8,
                1,
                AllocationFlags::DEDICATED_COLLECTION,
            )
            .unwrap();
        assert_eq!(1, device.created());
        assert_eq!(0, device.destroyed());
        manager.validate();

        manager.free(&region).unwrap();
        assert_eq!(1, device.destroyed());
        assert_eq!(0, manager.statistics().heap_count);
    }

    #[test]
    fn threshold_above_minimum_heap_size_is_rejected() {
        let device = Arc::new(MockDevice::new());
        let config = config()
            .with_minimum_heap_size(64)
            .with_registration_threshold(128);

        let result = MemoryManager::<MockDevice>::new(Arc::clone(&device), config);
        assert!(matches!(result, Err(AllocError::InvalidArgument { .. })));
        assert_eq!(0, device.created());
    }

    #[test]
    fn invalid_requests_touch_nothing() {
        let (device, manager) = manager(config());
        let kind = MemoryKind::DeviceLocal;

        let invalid = [
            manager.try_allocate(kind, 0, 1, AllocationFlags::empty()),
            manager.try_allocate(kind, 64, 3, AllocationFlags::empty()),
            manager.try_allocate(
                kind,
                64,
                1,
                AllocationFlags::DEDICATED_COLLECTION | AllocationFlags::EXISTING_COLLECTION,
            ),
        ];

        for result in invalid {
            assert!(matches!(result, Err(AllocError::InvalidArgument { .. })));
        }
        assert_eq!(0, device.created());
    }

    #[test]
    fn kinds_use_separate_collections() {
        let (device, manager) = manager(config());

        let regions: Vec<Region> = MemoryKind::ALL
            .iter()
            .map(|&kind| manager.allocate(kind, KIB, 256, AllocationFlags::empty()))
            .collect();

        assert_eq!(3, device.created());
        assert_ne!(regions[0].collection(), regions[1].collection());
        assert_ne!(regions[1].collection(), regions[2].collection());
        assert!(regions.iter().all(|region| region.offset() % 256 == 0));

        let stats = manager.statistics();
        assert_eq!(3, stats.allocation_count);
        assert_eq!(3 * KIB, stats.allocation_bytes);

        for region in &regions {
            manager.free(region).unwrap();
        }
        assert_eq!(0, manager.statistics().allocation_count);
        manager.validate();
    }

    #[test]
    fn foreign_and_double_frees_are_key_not_found() {
        let (_, first) = manager(config());
        let (_, second) = manager(config());

        let region = first.allocate(MemoryKind::HostVisible, 128, 0, AllocationFlags::empty());

        assert!(matches!(second.free(&region), Err(AllocError::KeyNotFound { .. })));
        first.free(&region).unwrap();
        assert!(matches!(first.free(&region), Err(AllocError::KeyNotFound { .. })));
    }

    #[test]
    fn collection_floor_survives_frees() {
        let (_, manager) = manager(config());
        let kind = MemoryKind::HostVisible;

        assert!(manager.try_set_minimum_size(kind, 100 * KIB));

        let regions: Vec<Region> = (0..10)
            .map(|_| manager.allocate(kind, 8 * KIB, 1, AllocationFlags::empty()))
            .collect();
        for region in &regions {
            manager.free(region).unwrap();
        }

        let stats = manager.statistics_for(kind);
        assert!(stats.heap_bytes >= 100 * KIB);
        assert_eq!(0, stats.allocation_count);
        manager.validate();
    }

    #[test]
    fn budget_refusal_needs_the_flag() {
        let (device, manager) = manager(config());
        device.set_budget(KIB * KIB);
        device.set_usage(KIB * KIB);

        let kind = MemoryKind::DeviceLocal;
        assert_eq!(Budget::new(KIB * KIB, KIB * KIB), manager.budget(kind));

        let refused = manager.try_allocate(kind, KIB, 1, AllocationFlags::WITHIN_BUDGET);
        assert!(matches!(refused, Err(AllocError::BudgetExceeded { .. })));
        assert_eq!(0, device.created());

        let region = manager
            .try_allocate(kind, KIB, 1, AllocationFlags::empty())
            .unwrap();
        assert_eq!(1, device.created());
        manager.free(&region).unwrap();
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let (device, manager) = manager(config().with_maximum_heap_count(1));
        let kind = MemoryKind::DeviceLocal;

        let requests = [
            RegionRequest::new(KIB, 1),
            RegionRequest::new(KIB, 1),
            RegionRequest::new(128 * KIB, 1),
        ];
        let result = manager.try_allocate_many(kind, &requests, AllocationFlags::empty());

        assert!(matches!(result, Err(AllocError::HeapLimitReached { maximum: 1 })));
        let stats = manager.statistics_for(kind);
        assert_eq!(0, stats.allocation_count);
        assert_eq!(1, stats.heap_count);
        assert_eq!(1, device.created());
        manager.validate();

        let regions = manager
            .try_allocate_many(kind, &requests[..2], AllocationFlags::empty())
            .unwrap();
        assert_eq!(2, regions.len());
        assert_eq!(2, manager.statistics_for(kind).allocation_count);
    }

    #[test]
    fn invalid_batch_request_rejects_whole_batch() {
        let (device, manager) = manager(config());

        let requests = [RegionRequest::new(KIB, 1), RegionRequest::new(0, 1)];
        let result =
            manager.try_allocate_many(MemoryKind::HostCached, &requests, AllocationFlags::empty());

        assert!(matches!(result, Err(AllocError::InvalidArgument { .. })));
        assert_eq!(0, device.created());
    }

    #[test]
    #[should_panic(expected = "failed to allocate 512 bytes")]
    fn allocate_panics_on_failure() {
        let (_, manager) = manager(config());

        manager.allocate(
            MemoryKind::DeviceLocal,
            512,
            1,
            AllocationFlags::EXISTING_COLLECTION,
        );
    }

    #[test]
    fn heap_memory_of_a_region() {
        let (_, manager) = manager(config());
        let region = manager.allocate(MemoryKind::HostVisible, 2 * KIB, 1, AllocationFlags::empty());

        let size = manager
            .with_heap_memory(&region, |memory| memory.size)
            .unwrap();
        assert!(size >= region.end());

        manager.free(&region).unwrap();
    }

    #[test]
    fn concurrent_allocations() {
        let (_, manager) = manager(config());

        std::thread::scope(|scope| {
            for thread in 0..4u64 {
                let manager = &manager;
                scope.spawn(move || {
                    let kind = MemoryKind::ALL[(thread % 3) as usize];
                    let regions: Vec<Region> = (1..=50u64)
                        .map(|i| {
                            manager.allocate(kind, i * 32 + thread, 16, AllocationFlags::empty())
                        })
                        .collect();
                    for region in &regions {
                        manager.free(region).unwrap();
                    }
                });
            }
        });

        assert_eq!(0, manager.statistics().allocation_count);
        manager.validate();
    }

    #[test]
    fn externally_synchronized_manager() {
        let (_, manager) = manager(config().externally_synchronized(true));
        let kind = MemoryKind::DeviceLocal;

        let first = manager.allocate(kind, 300, 1, AllocationFlags::empty());
        let second = manager.allocate(kind, 200, 1, AllocationFlags::empty());
        assert_eq!(300, second.offset());

        manager.free(&first).unwrap();
        manager.free(&second).unwrap();
        assert_eq!(0, manager.statistics_for(kind).allocation_count);
        manager.validate();
    }
}
