//! An unbalanced binary search tree that hands out stable handles to its entries.
//!
//! Entries live in an arena of slots, and a [NodeId] addresses a slot together with the
//!  slot's generation. Removing an entry bumps the generation, so a stale handle never
//!  resolves to an entry that was added later in the same slot.
//!
//! There is no rebalancing. The map is used for indexing socket descriptors, i.e. a small
//!  number of keys that are not under an attacker's control.

use std::cmp::Ordering;
use std::fmt::{Debug, Formatter};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

struct Node<K, V> {
    key: K,
    value: V,
    parent: Option<u32>,
    left: Option<u32>,
    right: Option<u32>,
}

struct Slot<K, V> {
    generation: u32,
    node: Option<Node<K, V>>,
}

pub struct OrderedMap<K, V> {
    slots: Vec<Slot<K, V>>,
    free: Vec<u32>,
    root: Option<u32>,
    len: usize,
    compare: fn(&K, &K) -> Ordering,
}

impl<K: Ord, V> OrderedMap<K, V> {
    pub fn new() -> OrderedMap<K, V> {
        OrderedMap::with_comparator(<K as Ord>::cmp)
    }
}

impl<K: Ord, V> Default for OrderedMap<K, V> {
    fn default() -> Self {
        OrderedMap::new()
    }
}

impl<K, V> OrderedMap<K, V> {
    pub fn with_comparator(compare: fn(&K, &K) -> Ordering) -> OrderedMap<K, V> {
        OrderedMap {
            slots: Vec::new(),
            free: Vec::new(),
            root: None,
            len: 0,
            compare,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts a new entry. If an entry with an equal key exists already, that entry is left
    ///  untouched and its handle is returned as the error; the rejected key and value are dropped.
    pub fn add(&mut self, key: K, value: V) -> Result<NodeId, NodeId> {
        let mut parent = None;
        let mut went_left = false;
        let mut cur = self.root;

        while let Some(idx) = cur {
            let node = self.node(idx);
            match (self.compare)(&key, &node.key) {
                Ordering::Less => {
                    parent = Some(idx);
                    went_left = true;
                    cur = node.left;
                }
                Ordering::Greater => {
                    parent = Some(idx);
                    went_left = false;
                    cur = node.right;
                }
                Ordering::Equal => return Err(self.id_of(idx)),
            }
        }

        let idx = self.alloc_slot(Node { key, value, parent, left: None, right: None });
        match parent {
            None => self.root = Some(idx),
            Some(p) if went_left => self.node_mut(p).left = Some(idx),
            Some(p) => self.node_mut(p).right = Some(idx),
        }
        self.len += 1;
        Ok(self.id_of(idx))
    }

    pub fn find(&self, key: &K) -> Option<NodeId> {
        self.locate(key).map(|idx| self.id_of(idx))
    }

    pub fn get(&self, id: NodeId) -> Option<&V> {
        self.resolve(id).map(|idx| &self.node(idx).value)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut V> {
        self.resolve(id).map(|idx| &mut self.node_mut(idx).value)
    }

    pub fn key(&self, id: NodeId) -> Option<&K> {
        self.resolve(id).map(|idx| &self.node(idx).key)
    }

    /// Removes the entry that `id` refers to, returning it. A stale handle is ignored.
    pub fn del(&mut self, id: NodeId) -> Option<(K, V)> {
        let idx = self.resolve(id)?;

        // the handle must be reachable through the key's search path, otherwise the tree is corrupt
        debug_assert_eq!(self.locate(&self.node(idx).key), Some(idx));

        let (left, right) = {
            let node = self.node(idx);
            (node.left, node.right)
        };

        match (left, right) {
            (None, None) => self.replace_in_parent(idx, None),
            (Some(child), None) | (None, Some(child)) => self.replace_in_parent(idx, Some(child)),
            (Some(l), Some(r)) => {
                // the right subtree is hung below the in-order predecessor, which is the
                //  rightmost node in the left subtree, and the left child takes our place
                let predecessor = self.rightmost(l);
                self.node_mut(predecessor).right = Some(r);
                self.node_mut(r).parent = Some(predecessor);
                self.replace_in_parent(idx, Some(l));
            }
        }

        self.len -= 1;
        let slot = &mut self.slots[idx as usize];
        slot.generation = slot.generation.wrapping_add(1);
        let node = slot.node.take()?;
        self.free.push(idx);
        Some((node.key, node.value))
    }

    /// In-order iteration: `walk(None)` returns the smallest entry, `walk(Some(id))` the entry
    ///  following `id`. Returns `None` after the largest entry, or if `prev` is stale.
    pub fn walk(&self, prev: Option<NodeId>) -> Option<NodeId> {
        let next = match prev {
            None => self.root.map(|r| self.leftmost(r)),
            Some(id) => {
                let idx = self.resolve(id)?;
                self.successor(idx)
            }
        };
        next.map(|idx| self.id_of(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item=(&K, &V)> + '_ {
        let mut cur = self.walk(None);
        std::iter::from_fn(move || {
            let id = cur?;
            cur = self.walk(Some(id));
            let node = self.node(id.index);
            Some((&node.key, &node.value))
        })
    }

    /// Removes all entries, returning their values in key order.
    pub fn drain(&mut self) -> Vec<V> {
        let mut ids = Vec::with_capacity(self.len);
        let mut cur = self.walk(None);
        while let Some(id) = cur {
            ids.push(id);
            cur = self.walk(Some(id));
        }

        let mut result = Vec::with_capacity(ids.len());
        for id in ids.into_iter().rev() {
            if let Some((_, v)) = self.del(id) {
                result.push(v);
            }
        }
        result.reverse();
        result
    }

    fn locate(&self, key: &K) -> Option<u32> {
        let mut cur = self.root;
        while let Some(idx) = cur {
            let node = self.node(idx);
            cur = match (self.compare)(key, &node.key) {
                Ordering::Less => node.left,
                Ordering::Greater => node.right,
                Ordering::Equal => return Some(idx),
            };
        }
        None
    }

    fn successor(&self, idx: u32) -> Option<u32> {
        if let Some(r) = self.node(idx).right {
            return Some(self.leftmost(r));
        }

        let mut child = idx;
        let mut parent = self.node(idx).parent;
        while let Some(p) = parent {
            if self.node(p).left == Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.node(p).parent;
        }
        None
    }

    fn leftmost(&self, mut idx: u32) -> u32 {
        while let Some(l) = self.node(idx).left {
            idx = l;
        }
        idx
    }

    fn rightmost(&self, mut idx: u32) -> u32 {
        while let Some(r) = self.node(idx).right {
            idx = r;
        }
        idx
    }

    fn replace_in_parent(&mut self, idx: u32, replacement: Option<u32>) {
        let parent = self.node(idx).parent;
        match parent {
            None => self.root = replacement,
            Some(p) => {
                let parent_node = self.node_mut(p);
                if parent_node.left == Some(idx) {
                    parent_node.left = replacement;
                }
                else {
                    parent_node.right = replacement;
                }
            }
        }
        if let Some(c) = replacement {
            self.node_mut(c).parent = parent;
        }
    }

    fn alloc_slot(&mut self, node: Node<K, V>) -> u32 {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize].node = Some(node);
                idx
            }
            None => {
                self.slots.push(Slot { generation: 0, node: Some(node) });
                (self.slots.len() - 1) as u32
            }
        }
    }

    fn resolve(&self, id: NodeId) -> Option<u32> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation == id.generation && slot.node.is_some() {
            Some(id.index)
        }
        else {
            None
        }
    }

    fn id_of(&self, idx: u32) -> NodeId {
        NodeId { index: idx, generation: self.slots[idx as usize].generation }
    }

    // internal indices always point to occupied slots
    fn node(&self, idx: u32) -> &Node<K, V> {
        match &self.slots[idx as usize].node {
            Some(n) => n,
            None => unreachable!("dangling link in ordered map"),
        }
    }

    fn node_mut(&mut self, idx: u32) -> &mut Node<K, V> {
        match &mut self.slots[idx as usize].node {
            Some(n) => n,
            None => unreachable!("dangling link in ordered map"),
        }
    }
}

impl<K: Debug, V: Debug> Debug for OrderedMap<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
