//! The hash-consed sub-octree.

use crate::arena::{GROUP_SIZE, GroupArena};
use crate::interner::SubtreeInterner;
use crate::node::{NodeValue, child_index};
use crate::{Result, VoxelDagError};

/// The default tree depth, covering a 64 × 64 × 64 voxel region.
pub const DEFAULT_DEPTH: u32 = 6;

/// The largest supported tree depth.
pub const MAX_DEPTH: u32 = 8;

const MAX_LEVELS: usize = MAX_DEPTH as usize;

const FINALIZED: &str = "sub-octree mutated after finalization";

/// A fixed-depth octree over a cubic voxel region that deduplicates
/// identical subtrees by content.
///
/// Every sibling group is stored in a flat arena and registered in a
/// content-addressing table mapping subtree content to its canonical,
/// reference-counted slot. Writing a voxel walks the path from the root
/// to the leaf, mutating sole-owned groups in place and copying shared
/// ones, and re-threads canonical pointers back up to the root. After an
/// edit, sibling groups that became homogeneous are collapsed into
/// single leaves, so the stored tree is always minimal.
///
/// Mutation requires `&mut self`; the caller serializes writes. Once
/// [`Self::finalize`] has been called the structure is logically
/// immutable and reads are safe from multiple threads.
#[derive(Clone, Debug)]
pub struct VoxelDag {
    arena: GroupArena,
    interner: Option<SubtreeInterner>,
    root: NodeValue,
    depth: u32,
}

/// One entry of a pre-order tree stream: a branch marker followed by its
/// 8 children, or a leaf with its block type. Byte-level framing of the
/// stream is the responsibility of the load/store collaborators.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PreorderEntry {
    Branch,
    Leaf(u32),
}

/// A step-by-step cursor over the tree, for external traversal
/// consumers.
#[derive(Copy, Clone, Debug)]
pub struct NodeRef<'a> {
    dag: &'a VoxelDag,
    value: NodeValue,
}

/// Per-level record of the path walked by a mutation, from the group
/// holding the edited child up to the root's group.
#[derive(Copy, Clone, Debug, Default)]
struct PathLevel {
    /// The sibling group currently holding this level's child fields.
    group: u16,
    /// The child position selected by this level's coordinate bits.
    child: usize,
    stash: StashState,
}

/// Interning state of the group that occupied a path level when the
/// current edit began.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
enum StashState {
    /// The group's entry is in the table (no edit in progress here).
    #[default]
    Linked,
    /// Freshly subdivided group, not yet linked into the tree.
    Detached,
    /// The entry has been pulled out of the table because the group's
    /// hash may change; its reference count is tracked here until the
    /// content settles and the entry is re-admitted.
    Extracted { slot: u16, count: u32, editable: bool },
    /// The extracted group lost its last reference and was freed.
    Dead,
}

impl VoxelDag {
    /// Creates an empty region (every voxel stores block type 0) at the
    /// default depth.
    pub fn new() -> Self {
        Self::with_depth(DEFAULT_DEPTH)
    }

    /// Creates an empty region covering `2^depth` voxels per axis.
    ///
    /// # Panics
    /// If the depth is zero or exceeds [`MAX_DEPTH`].
    pub fn with_depth(depth: u32) -> Self {
        assert!(
            (1..=MAX_DEPTH).contains(&depth),
            "sub-octree depth must be between 1 and {MAX_DEPTH}"
        );
        Self {
            arena: GroupArena::new(),
            interner: Some(SubtreeInterner::new()),
            root: NodeValue::EMPTY_LEAF,
            depth,
        }
    }

    /// The number of subdivision levels between the root and the voxels.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// The number of voxels along each axis of the region.
    pub fn grid_size(&self) -> usize {
        1 << self.depth
    }

    /// The number of sibling groups currently allocated to live tree
    /// content.
    pub fn live_group_count(&self) -> usize {
        self.arena.live_group_count()
    }

    /// Whether [`Self::finalize`] has been called.
    pub fn is_finalized(&self) -> bool {
        self.interner.is_none()
    }

    /// Discards the content-addressing table and the hash cache to
    /// reclaim memory once no further mutation will occur. Queries
    /// remain valid and are safe from multiple threads afterwards;
    /// mutation becomes a programming defect and panics.
    pub fn finalize(&mut self) {
        log::debug!("Finalizing sub-octree; discarding content-addressing table and hash cache");
        self.interner = None;
        self.arena.discard_hash_cache();
    }

    /// Returns the block type stored for the voxel at the given
    /// coordinates.
    ///
    /// # Panics
    /// If a coordinate is outside the region.
    pub fn get(&self, x: usize, y: usize, z: usize) -> u32 {
        self.assert_in_bounds(x, y, z);
        let mut current = self.root;
        for level in (0..self.depth).rev() {
            if current.is_leaf() {
                break;
            }
            current = NodeValue::from_raw(
                self.arena.read(current.slot(), child_index(x, y, z, level)),
            );
        }
        current.block_type()
    }

    /// Returns the block type for the voxel together with the level of
    /// the leaf that covers it: 0 for an individual voxel, up to the
    /// tree depth for a leaf spanning the whole region.
    ///
    /// # Panics
    /// If a coordinate is outside the region.
    pub fn get_with_level(&self, x: usize, y: usize, z: usize) -> (u32, u32) {
        self.assert_in_bounds(x, y, z);
        let mut current = self.root;
        let mut found_at = self.depth;
        for level in (0..self.depth).rev() {
            if current.is_leaf() {
                break;
            }
            found_at = level;
            current = NodeValue::from_raw(
                self.arena.read(current.slot(), child_index(x, y, z, level)),
            );
        }
        (current.block_type(), found_at)
    }

    /// Returns a cursor positioned at the root node.
    pub fn root_node(&self) -> NodeRef<'_> {
        NodeRef {
            dag: self,
            value: self.root,
        }
    }

    /// Stores a block type for the voxel at the given coordinates.
    ///
    /// Fails with [`VoxelDagError::BlockTypeOutOfRange`] if the type
    /// does not fit the reserved bit width and with
    /// [`VoxelDagError::CapacityExhausted`] if the arena cannot
    /// guarantee enough slots for the edit; both are raised before
    /// anything is modified.
    ///
    /// # Panics
    /// If a coordinate is outside the region or the structure has been
    /// finalized.
    pub fn set(&mut self, block_type: u32, x: usize, y: usize, z: usize) -> Result<()> {
        self.assert_in_bounds(x, y, z);
        assert!(!self.is_finalized(), "{FINALIZED}");

        let leaf = NodeValue::leaf_for_block_type(block_type)?;
        if self.path_already_stores(leaf, x, y, z) {
            return Ok(());
        }
        if !self.arena.can_allocate(worst_case_edit_groups(self.depth)) {
            return Err(VoxelDagError::CapacityExhausted);
        }

        let mut path = self.descend(x, y, z, 0);
        self.perform_edit(&mut path, 0, leaf);
        self.merge_pass(&mut path, 0);
        Ok(())
    }

    /// Builds a region from a pre-order tree stream, deduplicating
    /// sibling groups bottom-up through the same content-addressing
    /// table as incremental writes. Entries remaining in the stream
    /// after the tree is complete are left unconsumed.
    pub fn build_from_preorder(
        depth: u32,
        entries: &mut impl Iterator<Item = PreorderEntry>,
    ) -> Result<Self> {
        let mut dag = Self::with_depth(depth);
        let root = dag.insert_preorder_subtree(entries, depth)?;
        if root.is_branch() {
            let interner = dag.interner.as_mut().expect(FINALIZED);
            interner.retain(&mut dag.arena, root.slot());
        }
        dag.root = root;
        Ok(dag)
    }

    /// Feeds the tree to the given sink as the pre-order stream
    /// [`Self::build_from_preorder`] accepts.
    pub fn write_preorder(&self, sink: &mut impl FnMut(PreorderEntry)) {
        write_preorder_node(self.root_node(), sink);
    }

    /// Replaces the aligned cube of `2^log2_size` voxels per axis at the
    /// given corner with a fully-formed subtree read from a pre-order
    /// stream. The subtree being replaced is released recursively. The
    /// stream is buffered and validated first, so errors leave the
    /// region unmodified.
    ///
    /// # Panics
    /// If the corner is outside the region or not aligned to the cube
    /// size, if the cube is larger than the region, or if the structure
    /// has been finalized.
    pub fn replace_subtree(
        &mut self,
        log2_size: u32,
        x: usize,
        y: usize,
        z: usize,
        entries: &mut impl Iterator<Item = PreorderEntry>,
    ) -> Result<()> {
        self.assert_in_bounds(x, y, z);
        assert!(!self.is_finalized(), "{FINALIZED}");
        assert!(
            log2_size <= self.depth,
            "replaced cube is larger than the region"
        );
        let size = 1usize << log2_size;
        assert!(
            x % size == 0 && y % size == 0 && z % size == 0,
            "replaced cube is not aligned to its size"
        );

        let nodes = collect_preorder_tree(entries, log2_size)?;
        let branch_count = nodes
            .iter()
            .filter(|entry| matches!(entry, PreorderEntry::Branch))
            .count();
        if !self
            .arena
            .can_allocate(branch_count + worst_case_edit_groups(self.depth))
        {
            return Err(VoxelDagError::CapacityExhausted);
        }

        let mut buffered = nodes.into_iter();
        let value = self.insert_preorder_subtree(&mut buffered, log2_size)?;

        if log2_size == self.depth {
            let mut path = [PathLevel::default(); MAX_LEVELS];
            self.write_root_tracked(&mut path, value);
            return Ok(());
        }

        let edit_level = log2_size as usize;
        let mut path = self.descend(x, y, z, edit_level);
        if !self.perform_edit(&mut path, edit_level, value) {
            // The replacement resolved to exactly what is stored; only
            // groups subdivided during the descent need unwinding.
            for level in path.iter_mut() {
                if level.stash == StashState::Detached {
                    self.arena.free(level.group);
                    level.stash = StashState::Linked;
                }
            }
            return Ok(());
        }
        self.merge_pass(&mut path, edit_level);
        Ok(())
    }

    fn assert_in_bounds(&self, x: usize, y: usize, z: usize) {
        let size = self.grid_size();
        assert!(
            x < size && y < size && z < size,
            "voxel coordinate outside the region"
        );
    }

    /// Read-only walk deciding whether a write is a no-op: the leaf the
    /// path ends at (which may cover the whole remaining region) already
    /// stores the value.
    fn path_already_stores(&self, leaf: NodeValue, x: usize, y: usize, z: usize) -> bool {
        let mut current = self.root;
        for level in (0..self.depth).rev() {
            if current.is_leaf() {
                return current == leaf;
            }
            current = NodeValue::from_raw(
                self.arena.read(current.slot(), child_index(x, y, z, level)),
            );
        }
        current == leaf
    }

    /// Walks from the root down to `to_level`, recording the sibling
    /// group and child position per level. Leaves that must branch are
    /// subdivided into detached groups (all 8 children set to the old
    /// leaf value) which get linked in by the following edit's
    /// propagation.
    fn descend(&mut self, x: usize, y: usize, z: usize, to_level: usize) -> [PathLevel; MAX_LEVELS] {
        let mut path = [PathLevel::default(); MAX_LEVELS];
        let mut current = self.root;
        for level in (to_level..self.depth as usize).rev() {
            let (group, stash) = if current.is_branch() {
                (current.slot(), StashState::Linked)
            } else {
                let group = self
                    .arena
                    .allocate_filled([current.raw(); GROUP_SIZE])
                    .expect("arena headroom reserved before edit");
                (group, StashState::Detached)
            };
            let child = child_index(x, y, z, level as u32);
            path[level] = PathLevel { group, child, stash };
            current = NodeValue::from_raw(self.arena.read(group, child));
        }
        path
    }

    /// Writes a new child value at `edit_level` and re-threads canonical
    /// pointers up to the root. Returns `false` if the stored value
    /// already matched and nothing was done.
    fn perform_edit(
        &mut self,
        path: &mut [PathLevel; MAX_LEVELS],
        edit_level: usize,
        new_value: NodeValue,
    ) -> bool {
        let entry = path[edit_level];
        if self.arena.read(entry.group, entry.child) == new_value.raw() {
            return false;
        }

        self.extract_entries(path, edit_level);

        let top = self.depth as usize - 1;
        let mut level = edit_level;
        let mut child_value = new_value;
        loop {
            let group = path[level].group;
            if self.arena.read(group, path[level].child) == child_value.raw() {
                // The resolved child is what this group already stores;
                // nothing above can change.
                break;
            }
            let mut candidate = self.arena.group(group);
            candidate[path[level].child] = child_value.raw();
            let resolved = self.resolve_level(path, level, &candidate);
            path[level].group = resolved;
            if level == top {
                self.write_root_tracked(path, NodeValue::branch(resolved));
                break;
            }
            child_value = NodeValue::branch(resolved);
            level += 1;
        }

        self.readmit_entries(path, edit_level);
        true
    }

    /// Pulls the table entries of every group on the path out of the
    /// table, from the root's group down to the edit level, recording
    /// reference counts and invalidating cached hashes. A level is
    /// editable (may be overwritten in place) only if it is referenced
    /// by exactly one parent field *and* every level above it is
    /// editable; anything below a shared group must be copied, or the
    /// other owners would see the edit.
    fn extract_entries(&mut self, path: &mut [PathLevel; MAX_LEVELS], edit_level: usize) {
        let top = self.depth as usize - 1;
        let mut ancestors_editable = true;
        for level in (edit_level..=top).rev() {
            match path[level].stash {
                StashState::Linked => {
                    let slot = path[level].group;
                    let interner = self.interner.as_mut().expect(FINALIZED);
                    let count = interner.extract(&mut self.arena, slot);
                    self.arena.invalidate_cached_hash(slot);
                    let editable = ancestors_editable && count == 1;
                    ancestors_editable = editable;
                    path[level].stash = StashState::Extracted {
                        slot,
                        count,
                        editable,
                    };
                }
                StashState::Detached => {}
                StashState::Extracted { .. } | StashState::Dead => {
                    unreachable!("path level already extracted")
                }
            }
        }
    }

    /// Re-inserts every extracted entry that survived the edit, under
    /// its freshly computed hash and with its tracked reference count.
    fn readmit_entries(&mut self, path: &mut [PathLevel; MAX_LEVELS], edit_level: usize) {
        let top = self.depth as usize - 1;
        for level in edit_level..=top {
            match path[level].stash {
                StashState::Extracted { slot, count, .. } => {
                    debug_assert!(count > 0);
                    let interner = self.interner.as_mut().expect(FINALIZED);
                    interner.insert(&mut self.arena, slot, count);
                    path[level].stash = StashState::Linked;
                }
                StashState::Dead => path[level].stash = StashState::Linked,
                StashState::Linked => {}
                StashState::Detached => unreachable!("detached group survived an edit unresolved"),
            }
        }
    }

    /// Resolves a candidate group against the content-addressing table:
    /// an existing structurally equal group is reused; otherwise the
    /// candidate is written in place if the level is sole-owned (or
    /// detached), or into a fresh slot if the original is shared.
    fn resolve_level(
        &mut self,
        path: &mut [PathLevel; MAX_LEVELS],
        level: usize,
        candidate: &[i16; GROUP_SIZE],
    ) -> u16 {
        let interner = self.interner.as_mut().expect(FINALIZED);
        if let Some(existing) = interner.lookup(&mut self.arena, candidate) {
            self.discard_if_detached(path, level);
            return existing;
        }
        if let Some(existing) = self.stash_lookup(path, level, candidate) {
            self.discard_if_detached(path, level);
            return existing;
        }

        let PathLevel { group, child, stash } = path[level];
        match stash {
            StashState::Detached => {
                self.write_child_tracked(path, group, child, candidate[child]);
                let interner = self.interner.as_mut().expect(FINALIZED);
                interner.insert(&mut self.arena, group, 0);
                path[level].stash = StashState::Linked;
                group
            }
            StashState::Extracted { editable: true, .. } => {
                self.write_child_tracked(path, group, child, candidate[child]);
                group
            }
            StashState::Extracted { editable: false, .. } => {
                let fresh = self
                    .arena
                    .allocate_filled(*candidate)
                    .expect("arena headroom reserved before edit");
                for &raw in candidate {
                    let value = NodeValue::from_raw(raw);
                    if value.is_branch() {
                        self.retain_tracked(path, value.slot());
                    }
                }
                let interner = self.interner.as_mut().expect(FINALIZED);
                interner.insert(&mut self.arena, fresh, 0);
                fresh
            }
            StashState::Linked | StashState::Dead => {
                unreachable!("resolved a path level that was not prepared for editing")
            }
        }
    }

    /// Finds a candidate match among the stashed path entries. Only
    /// entries whose content is final are eligible: levels below the one
    /// being resolved have settled, and shared levels are never
    /// rewritten. An editable level above the current one may still be
    /// rewritten, so matching it would canonicalize content that is
    /// about to change.
    fn stash_lookup(
        &self,
        path: &[PathLevel; MAX_LEVELS],
        level: usize,
        candidate: &[i16; GROUP_SIZE],
    ) -> Option<u16> {
        for (other, entry) in path.iter().enumerate() {
            if other == level {
                continue;
            }
            if let StashState::Extracted { slot, editable, .. } = entry.stash {
                if (other < level || !editable) && self.arena.group_matches(slot, candidate) {
                    return Some(slot);
                }
            }
        }
        None
    }

    /// Frees a detached group that lost to an existing canonical group.
    /// Its children are all leaves, so there is nothing to release.
    fn discard_if_detached(&mut self, path: &mut [PathLevel; MAX_LEVELS], level: usize) {
        if path[level].stash == StashState::Detached {
            self.arena.free(path[level].group);
            path[level].stash = StashState::Dead;
        }
    }

    /// Overwrites one child field, retaining the new branch value and
    /// releasing the old one. Every reference-count change in the
    /// structure goes through a field write like this one (or the
    /// equivalent root write), which is what keeps the counts equal to
    /// the number of live parent fields.
    fn write_child_tracked(
        &mut self,
        path: &mut [PathLevel; MAX_LEVELS],
        group: u16,
        child: usize,
        raw: i16,
    ) {
        let old = NodeValue::from_raw(self.arena.read(group, child));
        self.arena.write(group, child, raw);
        let new = NodeValue::from_raw(raw);
        if new.is_branch() {
            self.retain_tracked(path, new.slot());
        }
        if old.is_branch() {
            self.release_tracked(path, old.slot());
        }
    }

    /// Points the root at a new node value. The root itself is never
    /// reference-counted (the structure is its only owner), but the
    /// group it references is retained like any other child.
    fn write_root_tracked(&mut self, path: &mut [PathLevel; MAX_LEVELS], value: NodeValue) {
        let old = self.root;
        self.root = value;
        if value.is_branch() {
            self.retain_tracked(path, value.slot());
        }
        if old.is_branch() {
            self.release_tracked(path, old.slot());
        }
    }

    /// Records one more parent field referencing the slot, routing to
    /// the stashed path entry if its table entry is extracted.
    fn retain_tracked(&mut self, path: &mut [PathLevel; MAX_LEVELS], slot: u16) {
        for level in path.iter_mut() {
            if let StashState::Extracted {
                slot: stashed,
                count,
                ..
            } = &mut level.stash
            {
                if *stashed == slot {
                    *count += 1;
                    return;
                }
            }
        }
        let interner = self.interner.as_mut().expect(FINALIZED);
        interner.retain(&mut self.arena, slot);
    }

    /// Records the loss of one parent field referencing the slot. A
    /// group that loses its last reference is returned to the free list
    /// and releases its own branch children in turn.
    fn release_tracked(&mut self, path: &mut [PathLevel; MAX_LEVELS], slot: u16) {
        let freed = 'released: {
            for level in path.iter_mut() {
                if let StashState::Extracted {
                    slot: stashed,
                    count,
                    ..
                } = &mut level.stash
                {
                    if *stashed == slot {
                        debug_assert!(*count > 0);
                        *count -= 1;
                        if *count == 0 {
                            level.stash = StashState::Dead;
                            break 'released true;
                        }
                        break 'released false;
                    }
                }
            }
            let interner = self.interner.as_mut().expect(FINALIZED);
            interner.release(&mut self.arena, slot)
        };
        if freed {
            let fields = self.arena.group(slot);
            self.arena.free(slot);
            for raw in fields {
                let value = NodeValue::from_raw(raw);
                if value.is_branch() {
                    self.release_tracked(path, value.slot());
                }
            }
        }
    }

    /// Collapses sibling groups that became homogeneous after an edit,
    /// starting at the deepest modified level and cascading upward. The
    /// structural inverse of subdivision; without it, overwriting a
    /// region with a uniform type would permanently retain unnecessary
    /// branches.
    fn merge_pass(&mut self, path: &mut [PathLevel; MAX_LEVELS], from_level: usize) {
        let top = self.depth as usize - 1;
        let mut level = from_level;
        loop {
            let group = path[level].group;
            let first = self.arena.read(group, 0);
            if first > 0 {
                // Branch children never merge.
                break;
            }
            if (1..GROUP_SIZE).any(|child| self.arena.read(group, child) != first) {
                break;
            }
            let shared_leaf = NodeValue::from_raw(first);
            log::trace!("Collapsing homogeneous sibling group {group} into a leaf");
            if level == top {
                self.write_root_tracked(path, shared_leaf);
                break;
            }
            if !self.perform_edit(path, level + 1, shared_leaf) {
                break;
            }
            level += 1;
        }
    }

    /// Inserts a subtree read from a pre-order stream, interning each
    /// sibling group bottom-up, and returns the node value for its root.
    fn insert_preorder_subtree<I: Iterator<Item = PreorderEntry>>(
        &mut self,
        entries: &mut I,
        levels_left: u32,
    ) -> Result<NodeValue> {
        match entries.next().ok_or(VoxelDagError::TruncatedNodeStream)? {
            PreorderEntry::Leaf(block_type) => NodeValue::leaf_for_block_type(block_type),
            PreorderEntry::Branch => {
                if levels_left == 0 {
                    return Err(VoxelDagError::BranchBelowLeafLevel);
                }
                let mut candidate = [0; GROUP_SIZE];
                for value in candidate.iter_mut() {
                    *value = self
                        .insert_preorder_subtree(entries, levels_left - 1)?
                        .raw();
                }
                let slot = self.resolve_standalone(&candidate)?;
                Ok(NodeValue::branch(slot))
            }
        }
    }

    /// Resolves a fully-formed candidate group outside any edit: reuse
    /// the canonical group if one exists, otherwise allocate, retain the
    /// branch children, and intern. The fresh entry starts at count 0;
    /// the parent field write that links it accounts for its first
    /// reference.
    fn resolve_standalone(&mut self, candidate: &[i16; GROUP_SIZE]) -> Result<u16> {
        let interner = self.interner.as_mut().expect(FINALIZED);
        if let Some(existing) = interner.lookup(&mut self.arena, candidate) {
            return Ok(existing);
        }
        let fresh = self.arena.allocate_filled(*candidate)?;
        for &raw in candidate {
            let value = NodeValue::from_raw(raw);
            if value.is_branch() {
                let interner = self.interner.as_mut().expect(FINALIZED);
                interner.retain(&mut self.arena, value.slot());
            }
        }
        let interner = self.interner.as_mut().expect(FINALIZED);
        interner.insert(&mut self.arena, fresh, 0);
        Ok(fresh)
    }
}

impl Default for VoxelDag {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> NodeRef<'a> {
    /// Whether this node has children.
    pub fn is_branch(&self) -> bool {
        self.value.is_branch()
    }

    /// The block type stored by this leaf.
    ///
    /// # Panics
    /// If the node is a branch.
    pub fn block_type(&self) -> u32 {
        self.value.block_type()
    }

    /// Returns a cursor at the child with the given position (the x
    /// coordinate bit is the highest of the three index bits, the z bit
    /// the lowest).
    ///
    /// # Panics
    /// If the node is a leaf or the position is out of range.
    pub fn child(&self, child: usize) -> NodeRef<'a> {
        assert!(child < GROUP_SIZE, "sibling position out of range");
        NodeRef {
            dag: self.dag,
            value: NodeValue::from_raw(self.dag.arena.read(self.value.slot(), child)),
        }
    }
}

/// The number of fresh sibling groups one voxel edit can need in the
/// worst case: a subdivision per level, a copy per level while
/// propagating, and a copy per level for each cascading merge.
fn worst_case_edit_groups(depth: u32) -> usize {
    let depth = depth as usize;
    2 * depth + depth * (depth + 1) / 2
}

fn write_preorder_node(node: NodeRef<'_>, sink: &mut impl FnMut(PreorderEntry)) {
    if node.is_branch() {
        sink(PreorderEntry::Branch);
        for child in 0..GROUP_SIZE {
            write_preorder_node(node.child(child), sink);
        }
    } else {
        sink(PreorderEntry::Leaf(node.block_type()));
    }
}

/// Buffers one subtree's worth of entries from a stream, validating
/// completeness, nesting depth and leaf type ranges, so that the
/// subsequent insertion cannot fail partway.
fn collect_preorder_tree(
    entries: &mut impl Iterator<Item = PreorderEntry>,
    levels: u32,
) -> Result<Vec<PreorderEntry>> {
    fn collect_subtree(
        entries: &mut impl Iterator<Item = PreorderEntry>,
        levels_left: u32,
        out: &mut Vec<PreorderEntry>,
    ) -> Result<()> {
        let entry = entries.next().ok_or(VoxelDagError::TruncatedNodeStream)?;
        out.push(entry);
        match entry {
            PreorderEntry::Leaf(block_type) => {
                NodeValue::leaf_for_block_type(block_type)?;
            }
            PreorderEntry::Branch => {
                if levels_left == 0 {
                    return Err(VoxelDagError::BranchBelowLeafLevel);
                }
                for _ in 0..GROUP_SIZE {
                    collect_subtree(entries, levels_left - 1, out)?;
                }
            }
        }
        Ok(())
    }

    let mut nodes = Vec::new();
    collect_subtree(entries, levels, &mut nodes)?;
    Ok(nodes)
}

#[cfg(any(test, feature = "validation"))]
impl VoxelDag {
    /// Validates the sharing invariants by brute force: every live
    /// group's reference count equals the number of live parent fields
    /// resolving to it, every referenced group has a canonical entry,
    /// and no two live groups have structurally equal content. Only
    /// meaningful before finalization, while the table exists.
    pub fn validate_invariants(&self) {
        use std::collections::HashMap;

        let Some(interner) = &self.interner else {
            return;
        };

        let live: HashMap<u16, u32> = interner.entries().collect();

        let mut census: HashMap<u16, u32> = HashMap::new();
        if self.root.is_branch() {
            *census.entry(self.root.slot()).or_default() += 1;
        }
        for &slot in live.keys() {
            for child in 0..GROUP_SIZE {
                let value = NodeValue::from_raw(self.arena.read(slot, child));
                if value.is_branch() {
                    *census.entry(value.slot()).or_default() += 1;
                }
            }
        }

        for (&slot, &count) in &live {
            assert_eq!(
                census.get(&slot).copied().unwrap_or(0),
                count,
                "reference count of group {slot} does not match its live parent fields"
            );
        }
        for slot in census.keys() {
            assert!(
                live.contains_key(slot),
                "group {slot} is referenced but has no canonical entry"
            );
        }

        assert_eq!(
            live.len(),
            self.arena.live_group_count(),
            "arena live-slot count diverges from the content-addressing table"
        );

        let slots: Vec<u16> = live.keys().copied().collect();
        for (i, &a) in slots.iter().enumerate() {
            for &b in &slots[i + 1..] {
                assert!(
                    !self.arena.subtrees_equal(a, b),
                    "live groups {a} and {b} have identical content"
                );
            }
        }
    }
}
