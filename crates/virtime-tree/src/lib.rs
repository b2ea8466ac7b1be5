//! Ordered tree used as the scheduler's due-time index.
//!
//! # Design
//!
//! A red-black tree over caller-owned values, ordered by a comparator
//! supplied at construction. Nodes live in a `Vec`-based arena and are
//! addressed by [`NodeId`] indices; freed slots are recycled through a free
//! list. Child edges are the ownership edges; the parent index exists only
//! for rotations, fixup walks, and in-order successor traversal.
//!
//! The balancing bound is the point: the due-time index may absorb very
//! large schedule/cancel volumes, so insert and remove must stay O(log n)
//! with O(log n) rotations per operation.

use std::cmp::Ordering;

/// Total-order predicate over two values of the same type.
pub type Comparator<T> = fn(&T, &T) -> Ordering;

/// Index into the node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

#[derive(Debug)]
struct Node<T> {
    /// `None` only while the slot sits on the free list.
    value: Option<T>,
    parent: Option<NodeId>,
    left: Option<NodeId>,
    right: Option<NodeId>,
    color: Color,
}

/// A red-black tree storing values under a caller-supplied comparator.
///
/// Values that compare equal are rejected on insert, so the tree behaves as
/// an ordered set. Lookups take a probe value compared against stored ones.
#[derive(Debug)]
pub struct RbTree<T> {
    nodes: Vec<Node<T>>,
    free: Vec<u32>,
    root: Option<NodeId>,
    len: usize,
    cmp: Comparator<T>,
}

impl<T> RbTree<T> {
    pub fn new(cmp: Comparator<T>) -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: None,
            len: 0,
            cmp,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn value(&self, id: NodeId) -> &T {
        self.nodes[id.index()]
            .value
            .as_ref()
            .expect("live node has a value")
    }

    fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].parent
    }

    fn left(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].left
    }

    fn right(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].right
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node<T> {
        &mut self.nodes[id.index()]
    }

    fn is_red(&self, id: NodeId) -> bool {
        self.nodes[id.index()].color == Color::Red
    }

    /// A missing child is black.
    fn is_black_or_nil(&self, id: Option<NodeId>) -> bool {
        id.map_or(true, |id| !self.is_red(id))
    }

    fn is_red_or_nil(&self, id: Option<NodeId>) -> bool {
        id.map_or(false, |id| self.is_red(id))
    }

    fn alloc(&mut self, value: T) -> NodeId {
        let node = Node {
            value: Some(value),
            parent: None,
            left: None,
            right: None,
            color: Color::Red,
        };
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot as usize] = node;
                NodeId(slot)
            }
            None => {
                self.nodes.push(node);
                NodeId((self.nodes.len() - 1) as u32)
            }
        }
    }

    fn release(&mut self, id: NodeId) -> T {
        let node = self.node_mut(id);
        node.parent = None;
        node.left = None;
        node.right = None;
        node.color = Color::Black;
        let value = node.value.take().expect("released node has a value");
        self.free.push(id.0);
        value
    }

    fn find_node(&self, probe: &T) -> Option<NodeId> {
        let mut current = self.root;
        while let Some(id) = current {
            current = match (self.cmp)(probe, self.value(id)) {
                Ordering::Less => self.left(id),
                Ordering::Greater => self.right(id),
                Ordering::Equal => return Some(id),
            };
        }
        None
    }

    pub fn get(&self, probe: &T) -> Option<&T> {
        self.find_node(probe).map(|id| self.value(id))
    }

    /// Mutable access to the stored value equal to `probe`.
    ///
    /// The caller must not change the value's position under the tree's
    /// comparator.
    pub fn get_mut(&mut self, probe: &T) -> Option<&mut T> {
        let id = self.find_node(probe)?;
        self.nodes[id.index()].value.as_mut()
    }

    pub fn min(&self) -> Option<&T> {
        self.root.map(|root| self.value(self.subtree_min(root)))
    }

    pub fn max(&self) -> Option<&T> {
        let mut id = self.root?;
        while let Some(right) = self.right(id) {
            id = right;
        }
        Some(self.value(id))
    }

    fn subtree_min(&self, mut id: NodeId) -> NodeId {
        while let Some(left) = self.left(id) {
            id = left;
        }
        id
    }

    /// In-order successor via the parent back-references.
    fn successor(&self, id: NodeId) -> Option<NodeId> {
        if let Some(right) = self.right(id) {
            return Some(self.subtree_min(right));
        }
        let mut child = id;
        let mut parent = self.parent(id);
        while let Some(p) = parent {
            if self.left(p) == Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.parent(p);
        }
        None
    }

    /// Lazy ascending traversal. Each call starts a fresh walk.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            tree: self,
            next: self.root.map(|root| self.subtree_min(root)),
        }
    }

    /// Inserts `value` unless an equal value already exists.
    ///
    /// Returns whether the insertion happened; on `false` the value is
    /// dropped and the tree is unchanged.
    pub fn insert(&mut self, value: T) -> bool {
        let mut parent = None;
        let mut current = self.root;
        let mut went_left = false;
        while let Some(id) = current {
            parent = Some(id);
            match (self.cmp)(&value, self.value(id)) {
                Ordering::Less => {
                    current = self.left(id);
                    went_left = true;
                }
                Ordering::Greater => {
                    current = self.right(id);
                    went_left = false;
                }
                Ordering::Equal => return false,
            }
        }

        let id = self.alloc(value);
        self.node_mut(id).parent = parent;
        match parent {
            Some(p) if went_left => self.node_mut(p).left = Some(id),
            Some(p) => self.node_mut(p).right = Some(id),
            None => self.root = Some(id),
        }
        self.len += 1;
        self.insert_fix(id);
        true
    }

    fn rotate_left(&mut self, node: NodeId) {
        let right = self.right(node).expect("rotate_left needs a right child");

        let right_left = self.left(right);
        self.node_mut(node).right = right_left;
        if let Some(rl) = right_left {
            self.node_mut(rl).parent = Some(node);
        }

        let parent = self.parent(node);
        self.node_mut(right).parent = parent;
        match parent {
            Some(p) if self.left(p) == Some(node) => self.node_mut(p).left = Some(right),
            Some(p) => self.node_mut(p).right = Some(right),
            None => self.root = Some(right),
        }

        self.node_mut(right).left = Some(node);
        self.node_mut(node).parent = Some(right);
    }

    fn rotate_right(&mut self, node: NodeId) {
        let left = self.left(node).expect("rotate_right needs a left child");

        let left_right = self.right(left);
        self.node_mut(node).left = left_right;
        if let Some(lr) = left_right {
            self.node_mut(lr).parent = Some(node);
        }

        let parent = self.parent(node);
        self.node_mut(left).parent = parent;
        match parent {
            Some(p) if self.right(p) == Some(node) => self.node_mut(p).right = Some(left),
            Some(p) => self.node_mut(p).left = Some(left),
            None => self.root = Some(left),
        }

        self.node_mut(left).right = Some(node);
        self.node_mut(node).parent = Some(left);
    }

    fn insert_fix(&mut self, mut node: NodeId) {
        while self.is_red_or_nil(self.parent(node)) {
            let parent = match self.parent(node) {
                Some(p) => p,
                None => break,
            };
            let grandparent = match self.parent(parent) {
                Some(g) => g,
                None => break,
            };

            if Some(parent) == self.left(grandparent) {
                let uncle = self.right(grandparent);
                if self.is_red_or_nil(uncle) {
                    self.node_mut(parent).color = Color::Black;
                    if let Some(u) = uncle {
                        self.node_mut(u).color = Color::Black;
                    }
                    self.node_mut(grandparent).color = Color::Red;
                    node = grandparent;
                } else {
                    if Some(node) == self.right(parent) {
                        node = parent;
                        self.rotate_left(node);
                    }
                    if let Some(parent) = self.parent(node) {
                        self.node_mut(parent).color = Color::Black;
                        if let Some(grandparent) = self.parent(parent) {
                            self.node_mut(grandparent).color = Color::Red;
                            self.rotate_right(grandparent);
                        }
                    }
                }
            } else {
                let uncle = self.left(grandparent);
                if self.is_red_or_nil(uncle) {
                    self.node_mut(parent).color = Color::Black;
                    if let Some(u) = uncle {
                        self.node_mut(u).color = Color::Black;
                    }
                    self.node_mut(grandparent).color = Color::Red;
                    node = grandparent;
                } else {
                    if Some(node) == self.left(parent) {
                        node = parent;
                        self.rotate_right(node);
                    }
                    if let Some(parent) = self.parent(node) {
                        self.node_mut(parent).color = Color::Black;
                        if let Some(grandparent) = self.parent(parent) {
                            self.node_mut(grandparent).color = Color::Red;
                            self.rotate_left(grandparent);
                        }
                    }
                }
            }
        }

        if let Some(root) = self.root {
            self.node_mut(root).color = Color::Black;
        }
    }

    /// Removes the stored value equal to `probe`, returning it.
    pub fn remove(&mut self, probe: &T) -> Option<T> {
        let node = self.find_node(probe)?;
        Some(self.remove_node(node))
    }

    fn remove_node(&mut self, node: NodeId) -> T {
        // A node with two children trades values with its in-order
        // successor, which has no left child and is removed instead.
        let target = if self.left(node).is_some() && self.right(node).is_some() {
            let succ = self.subtree_min(self.right(node).expect("checked above"));
            let succ_value = self.nodes[succ.index()].value.take();
            let doomed = std::mem::replace(&mut self.nodes[node.index()].value, succ_value);
            self.nodes[succ.index()].value = doomed;
            succ
        } else {
            node
        };

        let child = self.left(target).or(self.right(target));
        let parent = self.parent(target);
        self.replace_child(child, target);
        let removed_black = !self.is_red(target);

        self.len -= 1;
        if removed_black {
            self.remove_fix(child, parent);
        }
        self.release(target)
    }

    /// Points `dest`'s parent slot at `source` instead.
    fn replace_child(&mut self, source: Option<NodeId>, dest: NodeId) {
        let parent = self.parent(dest);
        match parent {
            Some(p) if self.left(p) == Some(dest) => self.node_mut(p).left = source,
            Some(p) => self.node_mut(p).right = source,
            None => self.root = source,
        }
        if let Some(s) = source {
            self.node_mut(s).parent = parent;
        }
    }

    /// Restores the black-height invariant after a black node left the tree.
    ///
    /// `node` is the child that took the removed node's place (possibly
    /// absent) and `parent` the position carrying the black deficit. Sibling
    /// color and sibling-children colors pick between recoloring, rotating
    /// then recoloring, and ascending the deficit to the parent.
    fn remove_fix(&mut self, mut node: Option<NodeId>, mut parent: Option<NodeId>) {
        while let Some(p) = parent {
            if !self.is_black_or_nil(node) {
                break;
            }

            if node == self.left(p) {
                let mut sibling = match self.right(p) {
                    Some(s) => s,
                    None => break,
                };
                if self.is_red(sibling) {
                    self.node_mut(sibling).color = Color::Black;
                    self.node_mut(p).color = Color::Red;
                    self.rotate_left(p);
                    sibling = match self.right(p) {
                        Some(s) => s,
                        None => break,
                    };
                }

                if self.is_black_or_nil(self.left(sibling))
                    && self.is_black_or_nil(self.right(sibling))
                {
                    self.node_mut(sibling).color = Color::Red;
                    node = Some(p);
                    parent = self.parent(p);
                } else {
                    if self.is_black_or_nil(self.right(sibling)) {
                        if let Some(sl) = self.left(sibling) {
                            self.node_mut(sl).color = Color::Black;
                        }
                        self.node_mut(sibling).color = Color::Red;
                        self.rotate_right(sibling);
                        sibling = match self.right(p) {
                            Some(s) => s,
                            None => break,
                        };
                    }
                    let parent_color = self.nodes[p.index()].color;
                    self.node_mut(sibling).color = parent_color;
                    self.node_mut(p).color = Color::Black;
                    if let Some(sr) = self.right(sibling) {
                        self.node_mut(sr).color = Color::Black;
                    }
                    self.rotate_left(p);
                    node = self.root;
                    parent = None;
                }
            } else {
                let mut sibling = match self.left(p) {
                    Some(s) => s,
                    None => break,
                };
                if self.is_red(sibling) {
                    self.node_mut(sibling).color = Color::Black;
                    self.node_mut(p).color = Color::Red;
                    self.rotate_right(p);
                    sibling = match self.left(p) {
                        Some(s) => s,
                        None => break,
                    };
                }

                if self.is_black_or_nil(self.left(sibling))
                    && self.is_black_or_nil(self.right(sibling))
                {
                    self.node_mut(sibling).color = Color::Red;
                    node = Some(p);
                    parent = self.parent(p);
                } else {
                    if self.is_black_or_nil(self.left(sibling)) {
                        if let Some(sr) = self.right(sibling) {
                            self.node_mut(sr).color = Color::Black;
                        }
                        self.node_mut(sibling).color = Color::Red;
                        self.rotate_left(sibling);
                        sibling = match self.left(p) {
                            Some(s) => s,
                            None => break,
                        };
                    }
                    let parent_color = self.nodes[p.index()].color;
                    self.node_mut(sibling).color = parent_color;
                    self.node_mut(p).color = Color::Black;
                    if let Some(sl) = self.left(sibling) {
                        self.node_mut(sl).color = Color::Black;
                    }
                    self.rotate_right(p);
                    node = self.root;
                    parent = None;
                }
            }
        }

        if let Some(n) = node {
            self.node_mut(n).color = Color::Black;
        }
    }
}

pub struct Iter<'a, T> {
    tree: &'a RbTree<T>,
    next: Option<NodeId>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        self.next = self.tree.successor(id);
        Some(self.tree.value(id))
    }
}
