//! FEC-set reassembly forest: a pool of shred-group descriptors linked by
//! merkle-chain parentage, with causally-ordered output as subtrees connect
//! to the global root.
//!
//! The forest never holds native references between descriptors. Every edge
//! (parent, first child, next sibling) is a dense arena index, and every
//! descriptor belongs to exactly one of four keyed sets: *ancestry* (an
//! internal node of the connected tree), *frontier* (a leaf of the connected
//! tree), *orphaned* (disconnected, not the root of its own subtree), or
//! *subtree roots* (disconnected root of an as-yet-unattached subtree).

use std::collections::{HashMap, VecDeque};

pub type MerkleRoot = [u8; 32];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Membership {
    Ancestry,
    Frontier,
    Orphaned,
    SubtreeRoot,
}

/// A single FEC set descriptor. `parent`, `first_child`, and `next_sibling`
/// are arena indices, never native pointers.
#[derive(Clone, Debug)]
pub struct FecDescriptor {
    pub merkle_root: MerkleRoot,
    pub chained_merkle_root: MerkleRoot,
    pub slot: u64,
    pub fec_set_idx: u32,
    pub parent_off: u32,
    pub data_cnt: u32,
    pub data_complete: bool,
    pub slot_complete: bool,
    pub parent: Option<usize>,
    pub first_child: Option<usize>,
    pub next_sibling: Option<usize>,
}

struct Node {
    desc: FecDescriptor,
    membership: Membership,
}

/// A fixed-capacity reassembly forest.
pub struct Reasm {
    arena: Vec<Option<Node>>,
    free: Vec<usize>,
    index: HashMap<MerkleRoot, usize>,
    ancestry: HashMap<MerkleRoot, usize>,
    frontier: HashMap<MerkleRoot, usize>,
    orphaned: HashMap<MerkleRoot, usize>,
    subtree_roots: HashMap<MerkleRoot, usize>,
    root: Option<usize>,
    out: VecDeque<FecDescriptor>,
}

impl Reasm {
    pub fn new(capacity: usize) -> Self {
        Reasm {
            arena: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().collect(),
            index: HashMap::new(),
            ancestry: HashMap::new(),
            frontier: HashMap::new(),
            orphaned: HashMap::new(),
            subtree_roots: HashMap::new(),
            root: None,
            out: VecDeque::new(),
        }
    }

    pub fn query(&self, merkle_root: &MerkleRoot) -> Option<&FecDescriptor> {
        let idx = *self.index.get(merkle_root)?;
        Some(&self.arena[idx].as_ref().unwrap().desc)
    }

    /// Pops the next descriptor in causal order: ancestors before
    /// descendants, unrelated subtrees ordered by when they connected.
    pub fn take_next_ready(&mut self) -> Option<FecDescriptor> {
        self.out.pop_front()
    }

    fn set_for(&mut self, membership: Membership) -> &mut HashMap<MerkleRoot, usize> {
        match membership {
            Membership::Ancestry => &mut self.ancestry,
            Membership::Frontier => &mut self.frontier,
            Membership::Orphaned => &mut self.orphaned,
            Membership::SubtreeRoot => &mut self.subtree_roots,
        }
    }

    fn move_membership(&mut self, idx: usize, to: Membership) {
        let key = self.arena[idx].as_ref().unwrap().desc.merkle_root;
        let from = self.arena[idx].as_ref().unwrap().membership;
        self.set_for(from).remove(&key);
        self.set_for(to).insert(key, idx);
        self.arena[idx].as_mut().unwrap().membership = to;
    }

    fn find_parent(&self, chained_merkle_root: &MerkleRoot) -> Option<(usize, Membership)> {
        for (map, m) in [
            (&self.ancestry, Membership::Ancestry),
            (&self.frontier, Membership::Frontier),
            (&self.orphaned, Membership::Orphaned),
            (&self.subtree_roots, Membership::SubtreeRoot),
        ] {
            if let Some(&idx) = map.get(chained_merkle_root) {
                return Some((idx, m));
            }
        }
        None
    }

    fn append_child(&mut self, parent: usize, child: usize) {
        self.arena[child].as_mut().unwrap().desc.parent = Some(parent);
        match self.arena[parent].as_ref().unwrap().desc.first_child {
            None => self.arena[parent].as_mut().unwrap().desc.first_child = Some(child),
            Some(first) => {
                let mut cur = first;
                loop {
                    let next = self.arena[cur].as_ref().unwrap().desc.next_sibling;
                    match next {
                        Some(n) => cur = n,
                        None => break,
                    }
                }
                self.arena[cur].as_mut().unwrap().desc.next_sibling = Some(child);
            }
        }
    }

    fn children_of(&self, idx: usize) -> Vec<usize> {
        let mut out = vec![];
        let mut cur = self.arena[idx].as_ref().unwrap().desc.first_child;
        while let Some(c) = cur {
            out.push(c);
            cur = self.arena[c].as_ref().unwrap().desc.next_sibling;
        }
        out
    }

    /// BFS from a newly-connected node, promoting any already-linked
    /// disconnected children into the frontier and demoting internal nodes
    /// from frontier to ancestry as they gain children.
    fn connect_subtree(&mut self, start: usize) {
        let mut queue = VecDeque::from([start]);
        while let Some(idx) = queue.pop_front() {
            let children = self.children_of(idx);
            if !children.is_empty() && self.arena[idx].as_ref().unwrap().membership == Membership::Frontier {
                self.move_membership(idx, Membership::Ancestry);
            }
            for child in children {
                let membership = self.arena[child].as_ref().unwrap().membership;
                if membership == Membership::Orphaned || membership == Membership::SubtreeRoot {
                    self.move_membership(child, Membership::Frontier);
                    self.out.push_back(self.arena[child].as_ref().unwrap().desc.clone());
                    queue.push_back(child);
                }
            }
        }
    }

    /// Inserts a new descriptor. Panics on pool exhaustion or a duplicate
    /// `merkle_root` — both are documented programmer errors.
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &mut self,
        merkle_root: MerkleRoot,
        chained_merkle_root: MerkleRoot,
        slot: u64,
        fec_set_idx: u32,
        parent_off: u32,
        data_cnt: u32,
        data_complete: bool,
        slot_complete: bool,
    ) -> &FecDescriptor {
        assert!(
            !self.index.contains_key(&merkle_root),
            "reasm: duplicate merkle_root inserted"
        );
        let idx = self.free.pop().expect("reasm: pool exhausted");

        let desc = FecDescriptor {
            merkle_root,
            chained_merkle_root,
            slot,
            fec_set_idx,
            parent_off,
            data_cnt,
            data_complete,
            slot_complete,
            parent: None,
            first_child: None,
            next_sibling: None,
        };

        // Empty tree: this node becomes the global root.
        if self.root.is_none() {
            self.root = Some(idx);
            self.arena[idx] = Some(Node { desc, membership: Membership::Frontier });
            self.index.insert(merkle_root, idx);
            self.frontier.insert(merkle_root, idx);
            return &self.arena[idx].as_ref().unwrap().desc;
        }

        let parent_hit = self.find_parent(&chained_merkle_root);
        let membership = match parent_hit {
            Some((_, Membership::Ancestry)) | Some((_, Membership::Frontier)) => Membership::Frontier,
            Some((_, Membership::Orphaned)) | Some((_, Membership::SubtreeRoot)) => Membership::Orphaned,
            None => Membership::SubtreeRoot,
        };

        self.arena[idx] = Some(Node { desc, membership });
        self.index.insert(merkle_root, idx);
        self.set_for(membership).insert(merkle_root, idx);

        let connected = membership == Membership::Frontier;
        if connected {
            self.out.push_back(self.arena[idx].as_ref().unwrap().desc.clone());
        }

        if let Some((parent_idx, parent_membership)) = parent_hit {
            self.append_child(parent_idx, idx);
            if parent_membership == Membership::Frontier {
                self.move_membership(parent_idx, Membership::Ancestry);
            }
        }

        // Coalesce: any subtree root whose chained_merkle_root matches this
        // node's merkle_root becomes this node's child.
        let adopted: Vec<usize> = self
            .subtree_roots
            .values()
            .copied()
            .filter(|&root_idx| self.arena[root_idx].as_ref().unwrap().desc.chained_merkle_root == merkle_root)
            .collect();
        for root_idx in adopted {
            log::debug!("reasm: coalescing orphaned subtree onto newly inserted parent");
            self.append_child(idx, root_idx);
            self.move_membership(root_idx, Membership::Orphaned);
        }

        if connected {
            self.connect_subtree(idx);
        }

        &self.arena[idx].as_ref().unwrap().desc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(byte: u8) -> MerkleRoot {
        let mut r = [0u8; 32];
        r[0] = byte;
        r
    }

    fn zero() -> MerkleRoot {
        [0u8; 32]
    }

    #[test]
    fn root_descriptor_is_not_emitted_but_a_child_is() {
        let mut r = Reasm::new(4);
        r.insert(root(1), zero(), 10, 0, 0, 1, true, true);
        assert!(r.take_next_ready().is_none());
        r.insert(root(2), root(1), 11, 1, 0, 1, true, true);
        let got = r.take_next_ready().unwrap();
        assert_eq!(got.merkle_root, root(2));
        assert!(r.take_next_ready().is_none());
    }

    #[test]
    fn query_finds_descriptors_in_every_set() {
        let mut r = Reasm::new(4);
        r.insert(root(1), zero(), 10, 0, 0, 1, true, true);
        // chained to a root that doesn't exist yet -> subtree root, not root()
        r.insert(root(2), root(99), 11, 0, 0, 1, true, true);
        assert!(r.query(&root(1)).is_some());
        assert!(r.query(&root(2)).is_some());
        assert!(r.query(&root(42)).is_none());
    }

    /// The scenario from the reassembly-forest ordering contract: nodes A-I
    /// chained as A (root), B=C, C=A, D=B, I=G, E=D, G=F, F=B, inserted in the
    /// order A, B, C, D, I, E, G, F. Expected causal-order output: C, B, D, E,
    /// F, G, I.
    #[test]
    fn out_order_matches_causal_ordering_contract() {
        let mut r = Reasm::new(16);
        let a = root(b'A');
        let b = root(b'B');
        let c = root(b'C');
        let d = root(b'D');
        let e = root(b'E');
        let f = root(b'F');
        let g = root(b'G');
        let i = root(b'I');

        r.insert(a, zero(), 0, 0, 0, 1, true, true); // m(0,64) = A, root
        r.insert(b, c, 0, 1, 0, 1, true, true); // m(1,32) = B, chained to C
        r.insert(c, a, 0, 2, 0, 1, true, true); // m(1,00) = C, chained to A
        r.insert(d, b, 0, 3, 0, 1, true, true); // m(2,00) = D, chained to B
        r.insert(i, g, 0, 4, 0, 1, true, true); // m(3,64) = I, chained to G
        r.insert(e, d, 0, 5, 0, 1, true, true); // m(2,32) = E, chained to D
        r.insert(g, f, 0, 6, 0, 1, true, true); // m(3,32) = G, chained to F
        r.insert(f, b, 0, 7, 0, 1, true, true); // m(3,00) = F, chained to B

        let mut got = vec![];
        while let Some(desc) = r.take_next_ready() {
            got.push(desc.merkle_root);
        }
        assert_eq!(got, vec![c, b, d, e, f, g, i]);
    }

    #[test]
    #[should_panic]
    fn duplicate_merkle_root_panics() {
        let mut r = Reasm::new(4);
        r.insert(root(1), zero(), 0, 0, 0, 1, true, true);
        r.insert(root(1), zero(), 0, 0, 0, 1, true, true);
    }

    #[test]
    #[should_panic]
    fn pool_exhaustion_panics() {
        let mut r = Reasm::new(1);
        r.insert(root(1), zero(), 0, 0, 0, 1, true, true);
        r.insert(root(2), root(1), 0, 1, 0, 1, true, true);
    }

    #[test]
    fn capacity_one_tree_holds_only_the_root() {
        let mut r = Reasm::new(1);
        r.insert(root(1), zero(), 0, 0, 0, 1, true, true);
        assert_eq!(r.query(&root(1)).unwrap().merkle_root, root(1));
        assert!(r.take_next_ready().is_none());
    }
}
