//! Content addressing of sibling groups.
//!
//! An open-addressed hash table keyed by the structural hash of a
//! group's content, mapping to the group's canonical arena slot and the
//! number of live parent fields referencing it. The table is what makes
//! subtrees shared: before any group is stored, its content is looked up
//! here, and an existing structurally equal group is reused instead.
//!
//! Removal is tombstone-free: the probe run following a removed entry is
//! re-inserted so that lookups never have to skip holes.

use crate::arena::{GROUP_SIZE, GroupArena};
use std::num::NonZeroU16;

const INITIAL_CAPACITY: usize = 64;
const MAX_LOAD_FACTOR: f64 = 0.75;
const GROWTH_FACTOR: f64 = 1.5;

/// Hash table mapping subtree content to `(canonical slot, refcount)`.
#[derive(Clone, Debug)]
pub struct SubtreeInterner {
    buckets: Vec<Bucket>,
    len: usize,
}

#[derive(Clone, Copy, Debug)]
struct Bucket {
    slot: Option<NonZeroU16>,
    refcount: u32,
}

const EMPTY: Bucket = Bucket {
    slot: None,
    refcount: 0,
};

impl SubtreeInterner {
    pub fn new() -> Self {
        Self {
            buckets: vec![EMPTY; INITIAL_CAPACITY],
            len: 0,
        }
    }

    /// The number of canonical entries in the table.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the canonical slot whose content structurally equals the
    /// candidate group, if one exists.
    pub fn lookup(&self, arena: &mut GroupArena, candidate: &[i16; GROUP_SIZE]) -> Option<u16> {
        let mut idx = usize::from(arena.raw_group_hash(candidate)) % self.buckets.len();
        loop {
            let slot = self.buckets[idx].slot?.get();
            if arena.group_matches(slot, candidate) {
                return Some(slot);
            }
            idx = (idx + 1) % self.buckets.len();
        }
    }

    /// Inserts a fresh entry for the given slot, growing the table first
    /// if the load factor would be exceeded. The caller guarantees that
    /// no structurally equal entry exists.
    pub fn insert(&mut self, arena: &mut GroupArena, slot: u16, refcount: u32) {
        debug_assert!(
            {
                let content = arena.group(slot);
                self.lookup(arena, &content).is_none()
            },
            "inserted a subtree whose content is already canonical"
        );
        if self.len as f64 > self.buckets.len() as f64 * MAX_LOAD_FACTOR {
            self.grow(arena);
        }
        let idx = self.probe_for_empty(arena.subtree_hash(slot));
        self.buckets[idx] = Bucket {
            slot: Some(NonZeroU16::new(slot).expect("interned the reserved arena slot")),
            refcount,
        };
        self.len += 1;
    }

    /// Records one more live parent field referencing the slot,
    /// inserting a fresh entry with count 1 if the slot has none.
    pub fn retain(&mut self, arena: &mut GroupArena, slot: u16) {
        match self.bucket_of(arena, slot) {
            Some(idx) => self.buckets[idx].refcount += 1,
            None => self.insert(arena, slot, 1),
        }
    }

    /// Records the loss of one live parent field referencing the slot.
    /// Returns `true` if that was the last reference, in which case the
    /// entry is removed and the caller must return the slot to the
    /// arena's free list (releasing its children in turn).
    ///
    /// # Panics
    /// If the slot has no entry, which means reference-count
    /// bookkeeping has been corrupted.
    pub fn release(&mut self, arena: &mut GroupArena, slot: u16) -> bool {
        let idx = self
            .bucket_of(arena, slot)
            .expect("released a subtree with no canonical entry");
        debug_assert!(self.buckets[idx].refcount > 0);
        if self.buckets[idx].refcount > 1 {
            self.buckets[idx].refcount -= 1;
            false
        } else {
            self.remove_bucket(arena, idx);
            true
        }
    }

    /// Removes the slot's entry wholesale, returning its reference
    /// count. Used by the mutation protocol to stash entries whose
    /// hashes are about to change; they are re-inserted with
    /// [`Self::insert`] once their content settles.
    ///
    /// # Panics
    /// If the slot has no entry.
    pub fn extract(&mut self, arena: &mut GroupArena, slot: u16) -> u32 {
        let idx = self
            .bucket_of(arena, slot)
            .expect("extracted a subtree with no canonical entry");
        let refcount = self.buckets[idx].refcount;
        self.remove_bucket(arena, idx);
        refcount
    }

    /// Returns the reference count recorded for the slot, if it has an
    /// entry.
    pub fn refcount(&self, arena: &mut GroupArena, slot: u16) -> Option<u32> {
        self.bucket_of(arena, slot).map(|idx| self.buckets[idx].refcount)
    }

    /// Iterates over all `(slot, refcount)` entries.
    pub fn entries(&self) -> impl Iterator<Item = (u16, u32)> + '_ {
        self.buckets
            .iter()
            .filter_map(|bucket| bucket.slot.map(|slot| (slot.get(), bucket.refcount)))
    }

    /// Finds the bucket holding the given slot by probing from its
    /// content hash. Entries are keyed by content, but within a probe
    /// run the slot index identifies the entry exactly.
    fn bucket_of(&self, arena: &mut GroupArena, slot: u16) -> Option<usize> {
        let mut idx = usize::from(arena.subtree_hash(slot)) % self.buckets.len();
        loop {
            let occupant = self.buckets[idx].slot?.get();
            if occupant == slot {
                return Some(idx);
            }
            idx = (idx + 1) % self.buckets.len();
        }
    }

    fn probe_for_empty(&self, hash: u16) -> usize {
        let mut idx = usize::from(hash) % self.buckets.len();
        while self.buckets[idx].slot.is_some() {
            idx = (idx + 1) % self.buckets.len();
        }
        idx
    }

    /// Clears the bucket and re-inserts every entry in the probe run
    /// following it, so that open addressing never has to skip holes.
    fn remove_bucket(&mut self, arena: &mut GroupArena, idx: usize) {
        self.buckets[idx] = EMPTY;
        self.len -= 1;

        let mut idx = (idx + 1) % self.buckets.len();
        while let Some(slot) = self.buckets[idx].slot {
            let refcount = self.buckets[idx].refcount;
            self.buckets[idx] = EMPTY;
            let new_idx = self.probe_for_empty(arena.subtree_hash(slot.get()));
            self.buckets[new_idx] = Bucket {
                slot: Some(slot),
                refcount,
            };
            idx = (idx + 1) % self.buckets.len();
        }
    }

    fn grow(&mut self, arena: &mut GroupArena) {
        let capacity = (self.buckets.len() as f64 * GROWTH_FACTOR) as usize;
        log::debug!("Rehashing content-addressing table into {capacity} buckets");
        let old = std::mem::replace(&mut self.buckets, vec![EMPTY; capacity]);
        for bucket in old {
            if let Some(slot) = bucket.slot {
                let idx = self.probe_for_empty(arena.subtree_hash(slot.get()));
                self.buckets[idx] = bucket;
            }
        }
    }
}

impl Default for SubtreeInterner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_for(i: i16) -> [i16; GROUP_SIZE] {
        [-i, -i, -i, -i, -i, -i, -i, -(i + 1)]
    }

    #[test]
    fn should_find_inserted_entries_by_content() {
        let mut arena = GroupArena::new();
        let mut interner = SubtreeInterner::new();

        let slot = arena.allocate_filled(group_for(1)).unwrap();
        interner.insert(&mut arena, slot, 1);

        assert_eq!(interner.lookup(&mut arena, &group_for(1)), Some(slot));
        assert_eq!(interner.lookup(&mut arena, &group_for(2)), None);
    }

    #[test]
    fn should_count_references_up_and_down() {
        let mut arena = GroupArena::new();
        let mut interner = SubtreeInterner::new();

        let slot = arena.allocate_filled(group_for(1)).unwrap();
        interner.retain(&mut arena, slot);
        interner.retain(&mut arena, slot);
        assert_eq!(interner.refcount(&mut arena, slot), Some(2));

        assert!(!interner.release(&mut arena, slot));
        assert_eq!(interner.refcount(&mut arena, slot), Some(1));

        assert!(interner.release(&mut arena, slot));
        assert_eq!(interner.refcount(&mut arena, slot), None);
        assert_eq!(interner.len(), 0);
    }

    #[test]
    fn should_extract_and_readmit_entries() {
        let mut arena = GroupArena::new();
        let mut interner = SubtreeInterner::new();

        let slot = arena.allocate_filled(group_for(3)).unwrap();
        interner.insert(&mut arena, slot, 5);

        assert_eq!(interner.extract(&mut arena, slot), 5);
        assert_eq!(interner.lookup(&mut arena, &group_for(3)), None);

        interner.insert(&mut arena, slot, 5);
        assert_eq!(interner.lookup(&mut arena, &group_for(3)), Some(slot));
        assert_eq!(interner.refcount(&mut arena, slot), Some(5));
    }

    #[test]
    #[should_panic]
    fn should_panic_when_releasing_unknown_entry() {
        let mut arena = GroupArena::new();
        let mut interner = SubtreeInterner::new();
        let slot = arena.allocate_filled(group_for(1)).unwrap();
        interner.release(&mut arena, slot);
    }

    #[test]
    fn should_survive_growth_and_probe_collisions() {
        let mut arena = GroupArena::new();
        let mut interner = SubtreeInterner::new();

        // Enough entries to force several rehashes and long probe runs.
        let slots: Vec<u16> = (0..500)
            .map(|i| {
                let slot = arena.allocate_filled(group_for(i)).unwrap();
                interner.insert(&mut arena, slot, 1);
                slot
            })
            .collect();

        for (i, &slot) in slots.iter().enumerate() {
            assert_eq!(interner.lookup(&mut arena, &group_for(i as i16)), Some(slot));
        }
    }

    #[test]
    fn should_keep_probe_runs_intact_across_removals() {
        let mut arena = GroupArena::new();
        let mut interner = SubtreeInterner::new();

        let slots: Vec<u16> = (0..200)
            .map(|i| {
                let slot = arena.allocate_filled(group_for(i)).unwrap();
                interner.insert(&mut arena, slot, 1);
                slot
            })
            .collect();

        // Remove every third entry, then verify every survivor is still
        // reachable through its probe run.
        for (i, &slot) in slots.iter().enumerate() {
            if i % 3 == 0 {
                assert!(interner.release(&mut arena, slot));
            }
        }
        for (i, &slot) in slots.iter().enumerate() {
            let found = interner.lookup(&mut arena, &group_for(i as i16));
            if i % 3 == 0 {
                assert_eq!(found, None);
            } else {
                assert_eq!(found, Some(slot));
            }
        }
    }
}
