use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of one heap. Unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapId(u64);

/// Identity of one heap collection. Unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionId(u64);

static NEXT_HEAP_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_COLLECTION_ID: AtomicU64 = AtomicU64::new(1);

impl HeapId {
    pub(crate) fn next() -> Self {
        Self(NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl CollectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_COLLECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Heap and collection a region belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionOwner {
    pub heap: HeapId,
    pub collection: CollectionId,
}

impl RegionOwner {
    /// Owner for a heap that is not part of any collection.
    pub fn standalone() -> Self {
        Self {
            heap: HeapId::next(),
            collection: CollectionId::next(),
        }
    }
}

/// One contiguous span `[offset, offset + size)` of a heap.
///
/// Regions handed out by the allocator are plain values; two regions are the
/// same region when every field matches. Callers only read them and give them
/// back to [`crate::MemoryManager::free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    offset: u64,
    size: u64,
    alignment: u64,
    is_allocated: bool,
    owner: RegionOwner,
}

impl Region {
    pub(crate) fn new(
        offset: u64,
        size: u64,
        alignment: u64,
        is_allocated: bool,
        owner: RegionOwner,
    ) -> Self {
        Self {
            offset,
            size,
            alignment,
            is_allocated,
            owner,
        }
    }

    /// Start of the region, relative to the start of its heap.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// One past the last byte of the region.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Alignment the region was allocated with.
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn is_allocated(&self) -> bool {
        self.is_allocated
    }

    pub fn heap(&self) -> HeapId {
        self.owner.heap
    }

    pub fn collection(&self) -> CollectionId {
        self.owner.collection
    }

    pub fn owner(&self) -> RegionOwner {
        self.owner
    }
}

/// Bookkeeping record a heap keeps for every span, free or allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RegionNode {
    pub offset: u64,
    pub size: u64,
    pub alignment: u64,
    pub is_allocated: bool,
}

impl RegionNode {
    pub fn free(offset: u64, size: u64) -> Self {
        Self {
            offset,
            size,
            alignment: 1,
            is_allocated: false,
        }
    }

    /// Tells whether this record describes `region`.
    pub fn matches(&self, region: &Region) -> bool {
        self.offset == region.offset
            && self.size == region.size
            && self.alignment == region.alignment
            && self.is_allocated == region.is_allocated
    }

    pub fn to_region(self, owner: RegionOwner) -> Region {
        Region::new(
            self.offset,
            self.size,
            self.alignment,
            self.is_allocated,
            owner,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(HeapId::next(), HeapId::next());
        assert_ne!(CollectionId::next(), CollectionId::next());
    }

    #[test]
    fn equality_is_structural() {
        let owner = RegionOwner::standalone();
        let a = Region::new(0, 64, 16, true, owner);

        assert_eq!(a, Region::new(0, 64, 16, true, owner));
        assert_ne!(a, Region::new(0, 64, 16, false, owner));
        assert_ne!(a, Region::new(0, 64, 8, true, owner));
        assert_ne!(a, Region::new(0, 64, 16, true, RegionOwner::standalone()));
    }

    #[test]
    fn node_matches_its_region() {
        let owner = RegionOwner::standalone();
        let node = RegionNode {
            offset: 128,
            size: 32,
            alignment: 32,
            is_allocated: true,
        };
        let region = node.to_region(owner);

        assert!(node.matches(&region));
        assert_eq!(160, region.end());
        assert!(!RegionNode::free(128, 32).matches(&region));
    }
}
