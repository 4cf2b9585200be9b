use crate::{
    list::{List, NodeId},
    region::RegionNode,
};

/// Index of free regions sorted by ascending size.
///
/// The index only stores [`NodeId`]s of the heap's region list; sizes are always
/// read from the list itself. That is why every method gets the list, and why a
/// node has to be removed from the index *before* its size changes.
///
/// ```text
///  region list:   [ 0..100 free ] [ 100..300 used ] [ 300..350 free ] [ 350..550 free* ]
///
///  free list:     +------------+------------+-------------+
///                 | 300..350   | 0..100     | 350..550    |     (sizes 50, 100, 200)
///                 +------------+------------+-------------+
/// ```
///
/// (`*` adjacent free regions never exist in a real heap, the picture only shows the ordering.)
///
/// Looking up the smallest region that can hold `n` bytes is a binary search,
/// which is what makes the heap best-fit instead of first-fit.
#[derive(Debug, Default)]
pub(crate) struct FreeList {
    /// Nodes of the region list, ascending by size
    items: Vec<NodeId>,
}

impl FreeList {
    /// Creates a new empty index
    pub const fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn get(&self, index: usize) -> Option<NodeId> {
        self.items.get(index).copied()
    }

    /// Largest indexed region.
    pub fn last(&self) -> Option<NodeId> {
        self.items.last().copied()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.items.contains(&node)
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.items.iter().copied()
    }

    /// Position of the first indexed region whose size is at least `size`.
    pub fn lower_bound(&self, size: u64, regions: &List<RegionNode>) -> usize {
        self.items
            .partition_point(|&node| regions.get(node).size < size)
    }

    /// Inserts `node` keeping the index sorted. Among equal sizes the newest
    /// entry goes last.
    pub fn insert_free_block(&mut self, node: NodeId, regions: &List<RegionNode>) {
        let size = regions.get(node).size;
        let index = self
            .items
            .partition_point(|&other| regions.get(other).size <= size);

        self.items.insert(index, node);
    }

    /// Removes the entry at `index`, as found by [`FreeList::lower_bound`].
    pub fn remove_at(&mut self, index: usize) -> NodeId {
        self.items.remove(index)
    }

    /// Removes `node` from the index. Returns `false` if it was not indexed.
    ///
    /// Several regions can share a size, so the binary search only finds the
    /// run of equal sizes; the run is then scanned for the exact node.
    pub fn remove_free_block(&mut self, node: NodeId, regions: &List<RegionNode>) -> bool {
        let size = regions.get(node).size;
        let start = self.lower_bound(size, regions);

        let position = self.items[start..]
            .iter()
            .take_while(|&&other| regions.get(other).size == size)
            .position(|&other| other == node);

        match position {
            Some(position) => {
                self.items.remove(start + position);
                true
            }
            None => false,
        }
    }

    /// Tells whether the index is sorted by ascending size.
    pub fn is_sorted(&self, regions: &List<RegionNode>) -> bool {
        self.items
            .windows(2)
            .all(|pair| regions.get(pair[0]).size <= regions.get(pair[1]).size)
    }
}
