//! A randomized balanced binary search tree (treap) over dense slab indices.
//!
//! Every row touched by a given sort key gets exactly one node in that sort
//! key's treap. The treap never stores row data or a comparator itself -
//! callers supply an ordering closure at insert time (built fresh from the
//! owning `SortKey` and the live row slab) so one generic tree implementation
//! serves every sort order without any ambient "current comparator" state.

use std::cmp::Ordering;

#[derive(Clone, Copy, Debug)]
struct Node {
    parent: Option<usize>,
    left: Option<usize>,
    right: Option<usize>,
    priority: u64,
}

/// A treap whose node storage is indexed by the same dense slab index used
/// for rows, so no separate node-id allocator is needed.
#[derive(Debug)]
pub struct Treap {
    nodes: Vec<Option<Node>>,
    root: Option<usize>,
    len: usize,
}

impl Treap {
    pub fn with_capacity(capacity: usize) -> Self {
        Treap {
            nodes: vec![None; capacity],
            root: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn node(&self, idx: usize) -> &Node {
        self.nodes[idx].as_ref().expect("treap: dangling index")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.nodes[idx].as_mut().expect("treap: dangling index")
    }

    fn set_child(&mut self, parent: usize, child: Option<usize>, is_left: bool) {
        if is_left {
            self.node_mut(parent).left = child;
        } else {
            self.node_mut(parent).right = child;
        }
        if let Some(c) = child {
            self.node_mut(c).parent = Some(parent);
        }
    }

    fn replace_in_parent(&mut self, old: usize, new: Option<usize>) {
        match self.node(old).parent {
            None => {
                self.root = new;
                if let Some(n) = new {
                    self.node_mut(n).parent = None;
                }
            }
            Some(p) => {
                let is_left = self.node(p).left == Some(old);
                self.set_child(p, new, is_left);
            }
        }
    }

    /// Right rotation around `idx`'s left child.
    fn rotate_right(&mut self, idx: usize) {
        let left = self.node(idx).left.expect("rotate_right needs a left child");
        let left_right = self.node(left).right;
        self.replace_in_parent(idx, Some(left));
        self.set_child(idx, left_right, true);
        self.set_child(left, Some(idx), false);
    }

    /// Left rotation around `idx`'s right child.
    fn rotate_left(&mut self, idx: usize) {
        let right = self.node(idx).right.expect("rotate_left needs a right child");
        let right_left = self.node(right).left;
        self.replace_in_parent(idx, Some(right));
        self.set_child(idx, right_left, false);
        self.set_child(right, Some(idx), true);
    }

    /// Inserts `idx` with the given priority. `cmp(a, b)` must return the
    /// order of row `a` relative to row `b` under this tree's sort key.
    /// Higher priority values bubble toward the root.
    pub fn insert<F>(&mut self, idx: usize, priority: u64, mut cmp: F)
    where
        F: FnMut(usize, usize) -> Ordering,
    {
        self.nodes[idx] = Some(Node {
            parent: None,
            left: None,
            right: None,
            priority,
        });
        self.len += 1;

        let Some(mut cur) = self.root else {
            self.root = Some(idx);
            return;
        };

        loop {
            match cmp(idx, cur) {
                Ordering::Less => match self.node(cur).left {
                    Some(next) => cur = next,
                    None => {
                        self.set_child(cur, Some(idx), true);
                        break;
                    }
                },
                _ => match self.node(cur).right {
                    Some(next) => cur = next,
                    None => {
                        self.set_child(cur, Some(idx), false);
                        break;
                    }
                },
            }
        }

        // Bubble up while the heap property (parent.priority >= child.priority) is violated.
        while let Some(parent) = self.node(idx).parent {
            if self.node(parent).priority >= self.node(idx).priority {
                break;
            }
            if self.node(parent).left == Some(idx) {
                self.rotate_right(parent);
            } else {
                self.rotate_left(parent);
            }
        }
    }

    /// Removes `idx`, which must currently be a member of this treap.
    pub fn remove(&mut self, idx: usize) {
        loop {
            let left = self.node(idx).left;
            let right = self.node(idx).right;
            match (left, right) {
                (None, None) => {
                    self.replace_in_parent(idx, None);
                    break;
                }
                (Some(l), None) => {
                    self.rotate_right(idx);
                    let _ = l;
                }
                (None, Some(r)) => {
                    self.rotate_left(idx);
                    let _ = r;
                }
                (Some(l), Some(r)) => {
                    if self.node(l).priority >= self.node(r).priority {
                        self.rotate_right(idx);
                    } else {
                        self.rotate_left(idx);
                    }
                }
            }
        }
        self.nodes[idx] = None;
        self.len -= 1;
    }

    pub fn first(&self) -> Option<usize> {
        let mut cur = self.root?;
        while let Some(l) = self.node(cur).left {
            cur = l;
        }
        Some(cur)
    }

    pub fn last(&self) -> Option<usize> {
        let mut cur = self.root?;
        while let Some(r) = self.node(cur).right {
            cur = r;
        }
        Some(cur)
    }

    /// In-order successor of `idx`.
    pub fn next(&self, idx: usize) -> Option<usize> {
        if let Some(mut cur) = self.node(idx).right {
            while let Some(l) = self.node(cur).left {
                cur = l;
            }
            return Some(cur);
        }
        let mut cur = idx;
        let mut parent = self.node(cur).parent;
        while let Some(p) = parent {
            if self.node(p).left == Some(cur) {
                return Some(p);
            }
            cur = p;
            parent = self.node(p).parent;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_matches_insertion_sorted_by_cmp() {
        let values = [5i64, 1, 9, 3, 7, 0, 8, 2, 6, 4];
        let mut t = Treap::with_capacity(values.len());
        for (idx, &v) in values.iter().enumerate() {
            t.insert(idx, (idx as u64) * 2654435761 % 997, |a, b| values[a].cmp(&values[b]));
        }
        let mut out = vec![];
        let mut cur = t.first();
        while let Some(idx) = cur {
            out.push(values[idx]);
            cur = t.next(idx);
        }
        assert_eq!(out, vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn remove_preserves_remaining_order() {
        let values = [5i64, 1, 9, 3, 7];
        let mut t = Treap::with_capacity(values.len());
        for (idx, &v) in values.iter().enumerate() {
            t.insert(idx, (v as u64) * 31 + 7, |a, b| values[a].cmp(&values[b]));
        }
        t.remove(2); // value 9
        let mut out = vec![];
        let mut cur = t.first();
        while let Some(idx) = cur {
            out.push(values[idx]);
            cur = t.next(idx);
        }
        assert_eq!(out, vec![1, 3, 5, 7]);
        assert_eq!(t.len(), 4);
    }
}
