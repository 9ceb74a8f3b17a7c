//! Structural hashing and equality of subtrees.
//!
//! Hashes are 15-bit values so they fit the per-slot cache alongside its
//! invalid sentinel. The cache is filled lazily the first time a slot's
//! hash is requested and invalidated eagerly whenever the slot's content
//! is overwritten, so repeated table operations on an unchanged subtree
//! never rehash it.

use crate::arena::{GROUP_SIZE, GroupArena};
use crate::node::NodeValue;

const HASH_MASK: u16 = 0x7FFF;

const GROUP_SEED: u16 = 7;
const NODE_SEED: u16 = 13;

/// Distinguishes a branch node's contribution from that of a leaf
/// storing the same 15-bit pattern.
const BRANCH_MARKER: u16 = 0x7FFF;

fn combine(hash: u16, term: u16) -> u16 {
    hash.wrapping_mul(31).wrapping_add(term) & HASH_MASK
}

impl GroupArena {
    /// Returns the structural hash of the subtree rooted at the given
    /// slot, computing and caching it if the cache is invalid.
    pub fn subtree_hash(&mut self, slot: u16) -> u16 {
        if let Some(hash) = self.cached_hash(slot) {
            return hash;
        }
        let mut hash = GROUP_SEED;
        for child in 0..GROUP_SIZE {
            let value = NodeValue::from_raw(self.read(slot, child));
            hash = combine(hash, self.node_hash(value));
        }
        self.set_cached_hash(slot, hash);
        hash
    }

    /// Returns the structural hash of a candidate group that has not
    /// been stored yet.
    pub fn raw_group_hash(&mut self, values: &[i16; GROUP_SIZE]) -> u16 {
        let mut hash = GROUP_SEED;
        for &raw in values {
            hash = combine(hash, self.node_hash(NodeValue::from_raw(raw)));
        }
        hash
    }

    fn node_hash(&mut self, value: NodeValue) -> u16 {
        let mut hash = NODE_SEED;
        if value.is_leaf() {
            hash = combine(hash, (-value.raw()) as u16);
        } else {
            hash = combine(hash, BRANCH_MARKER);
            hash = combine(hash, self.subtree_hash(value.slot()));
        }
        hash
    }

    /// Whether two stored subtrees are structurally equal. Identical
    /// slots short-circuit; distinct slots are compared element-wise,
    /// recursing through branch pointers.
    pub fn subtrees_equal(&self, a: u16, b: u16) -> bool {
        if a == b {
            return true;
        }
        for child in 0..GROUP_SIZE {
            if !self.nodes_equal(self.read(a, child), self.read(b, child)) {
                return false;
            }
        }
        true
    }

    /// Whether a stored subtree is structurally equal to a candidate
    /// group that has not been stored yet.
    pub fn group_matches(&self, slot: u16, values: &[i16; GROUP_SIZE]) -> bool {
        for child in 0..GROUP_SIZE {
            if !self.nodes_equal(self.read(slot, child), values[child]) {
                return false;
            }
        }
        true
    }

    fn nodes_equal(&self, a: i16, b: i16) -> bool {
        if a > 0 && b > 0 {
            self.subtrees_equal(a as u16, b as u16)
        } else {
            // Two leaves must match exactly; a leaf and a branch are
            // never equal.
            a == b
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(values: [i16; GROUP_SIZE]) -> [i16; GROUP_SIZE] {
        values.map(|v| -v.abs())
    }

    #[test]
    fn should_hash_equal_content_equally() {
        let mut arena = GroupArena::new();
        let a = arena.allocate_filled(leaves([1, 2, 3, 4, 5, 6, 7, 8])).unwrap();
        let b = arena.allocate_filled(leaves([1, 2, 3, 4, 5, 6, 7, 8])).unwrap();
        assert_eq!(arena.subtree_hash(a), arena.subtree_hash(b));
        assert_eq!(arena.raw_group_hash(&leaves([1, 2, 3, 4, 5, 6, 7, 8])), arena.subtree_hash(a));
    }

    #[test]
    fn should_hash_nested_content_through_branch_pointers() {
        let mut arena = GroupArena::new();
        let child_a = arena.allocate_filled(leaves([1; GROUP_SIZE])).unwrap();
        let child_b = arena.allocate_filled(leaves([1; GROUP_SIZE])).unwrap();

        let mut group_a = leaves([0; GROUP_SIZE]);
        group_a[3] = child_a as i16;
        let mut group_b = leaves([0; GROUP_SIZE]);
        group_b[3] = child_b as i16;

        let a = arena.allocate_filled(group_a).unwrap();
        let b = arena.allocate_filled(group_b).unwrap();
        assert_eq!(arena.subtree_hash(a), arena.subtree_hash(b));
        assert!(arena.subtrees_equal(a, b));
    }

    #[test]
    fn should_never_equate_a_leaf_with_a_branch_over_the_same_region_content() {
        let mut arena = GroupArena::new();
        let child = arena.allocate_filled(leaves([0; GROUP_SIZE])).unwrap();

        let mut with_branch = leaves([0; GROUP_SIZE]);
        with_branch[0] = child as i16;
        let with_leaf = leaves([0; GROUP_SIZE]);

        let a = arena.allocate_filled(with_branch).unwrap();
        let b = arena.allocate_filled(with_leaf).unwrap();
        assert!(!arena.subtrees_equal(a, b));
    }

    #[test]
    fn should_recompute_hash_after_content_changes() {
        let mut arena = GroupArena::new();
        let slot = arena.allocate_filled(leaves([1, 2, 3, 4, 5, 6, 7, 8])).unwrap();
        let before = arena.subtree_hash(slot);
        assert_eq!(arena.cached_hash(slot), Some(before));

        arena.write(slot, 0, -9);
        assert_eq!(arena.cached_hash(slot), None);
        let after = arena.subtree_hash(slot);
        assert_eq!(after, arena.raw_group_hash(&leaves([9, 2, 3, 4, 5, 6, 7, 8])));
    }

    #[test]
    fn should_match_stored_group_against_raw_candidate() {
        let mut arena = GroupArena::new();
        let slot = arena.allocate_filled(leaves([1, 2, 3, 4, 5, 6, 7, 8])).unwrap();
        assert!(arena.group_matches(slot, &leaves([1, 2, 3, 4, 5, 6, 7, 8])));
        assert!(!arena.group_matches(slot, &leaves([1, 2, 3, 4, 5, 6, 7, 9])));
    }
}
