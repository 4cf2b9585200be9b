/// Handle to a node of a [`List`]. It stays valid until the node is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeId(usize);

/// Optional link to another node of the list.
pub(crate) type Link = Option<NodeId>;

#[derive(Debug)]
pub(crate) struct Node<T> {
    /// Next node of the list
    pub next: Link,
    /// Previous node of the list
    pub prev: Link,
    /// Element of the node
    pub data: T,
}

/// Doubly linked list whose nodes live in an arena.
///
/// Nodes are addressed by [`NodeId`] instead of pointers, so other structures
/// (like the free-region index) can hold on to them without any `unsafe`.
/// Slots of removed nodes are recycled by later insertions.
///
/// ```text
///          head                               tail
///           |                                  |
///  +--------v-+      +----------+      +-------v--+
///  | Node (0) | <--> | Node (3) | <--> | Node (1) |      vacant: [2]
///  +----------+      +----------+      +----------+
/// ```
#[derive(Debug)]
pub(crate) struct List<T> {
    slots: Vec<Option<Node<T>>>,
    vacant: Vec<usize>,
    head: Link,
    tail: Link,
    len: usize,
}

pub(crate) struct Iter<'a, T> {
    list: &'a List<T>,
    current: Link,
    remaining: usize,
}

impl<T> List<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Link {
        self.head
    }

    #[inline]
    pub fn last(&self) -> Link {
        self.tail
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &Node<T> {
        match self.slots.get(id.0) {
            Some(Some(node)) => node,
            _ => panic!("stale list node {id:?}"),
        }
    }

    #[inline]
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node<T> {
        match self.slots.get_mut(id.0) {
            Some(Some(node)) => node,
            _ => panic!("stale list node {id:?}"),
        }
    }

    #[inline]
    pub fn get(&self, id: NodeId) -> &T {
        &self.node(id).data
    }

    #[inline]
    pub fn get_mut(&mut self, id: NodeId) -> &mut T {
        &mut self.node_mut(id).data
    }

    #[inline]
    pub fn next(&self, id: NodeId) -> Link {
        self.node(id).next
    }

    #[inline]
    pub fn prev(&self, id: NodeId) -> Link {
        self.node(id).prev
    }

    fn store(&mut self, node: Node<T>) -> NodeId {
        self.len += 1;

        match self.vacant.pop() {
            Some(index) => {
                self.slots[index] = Some(node);
                NodeId(index)
            }
            None => {
                self.slots.push(Some(node));
                NodeId(self.slots.len() - 1)
            }
        }
    }

    /// Appends a new node at the end of the list.
    pub fn append(&mut self, data: T) -> NodeId {
        let id = self.store(Node {
            next: None,
            prev: self.tail,
            data,
        });

        match self.tail {
            Some(tail) => self.node_mut(tail).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);

        id
    }

    /// Inserts a new node right before `at`.
    pub fn insert_before(&mut self, at: NodeId, data: T) -> NodeId {
        let prev = self.prev(at);
        let id = self.store(Node {
            next: Some(at),
            prev,
            data,
        });

        self.node_mut(at).prev = Some(id);
        match prev {
            Some(prev) => self.node_mut(prev).next = Some(id),
            None => self.head = Some(id),
        }

        id
    }

    /// Inserts a new node right after `at`.
    pub fn insert_after(&mut self, at: NodeId, data: T) -> NodeId {
        let next = self.next(at);
        let id = self.store(Node {
            next,
            prev: Some(at),
            data,
        });

        self.node_mut(at).next = Some(id);
        match next {
            Some(next) => self.node_mut(next).prev = Some(id),
            None => self.tail = Some(id),
        }

        id
    }

    /// Unlinks `id` from the list and hands back its element.
    pub fn remove(&mut self, id: NodeId) -> T {
        let node = match self.slots.get_mut(id.0).and_then(Option::take) {
            Some(node) => node,
            None => panic!("stale list node {id:?}"),
        };

        match node.prev {
            Some(prev) => self.node_mut(prev).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.node_mut(next).prev = node.prev,
            None => self.tail = node.prev,
        }

        self.vacant.push(id.0);
        self.len -= 1;

        node.data
    }

    /// Drops every node at once.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.vacant.clear();
        self.head = None;
        self.tail = None;
        self.len = 0;
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            current: self.head,
            remaining: self.len,
        }
    }
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (NodeId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.current?;
        let node = self.list.node(id);

        self.current = node.next;
        self.remaining -= 1;

        Some((id, &node.data))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, T> IntoIterator for &'a List<T> {
    type Item = (NodeId, &'a T);
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
