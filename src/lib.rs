//! Hash-consed, structurally shared sub-octree storage for dense voxel
//! grids.
//!
//! A [`VoxelDag`](dag::VoxelDag) covers a fixed-depth cubic region of the
//! voxel grid (64³ voxels at the default depth) and stores one integer
//! block-type code per voxel. Identical subtrees are deduplicated by
//! content: every distinct sibling group is stored exactly once in a flat
//! arena, and a content-addressing table maps subtree content to its
//! canonical, reference-counted slot. Single-voxel writes mutate
//! sole-owned groups in place and transparently copy shared ones, so
//! repetitive geometry (flat ground, walls, uniform fills) costs a small
//! fraction of the dense representation.
//!
//! The structure is a storage back-end, not a renderer: it only stores
//! and retrieves block-type codes and exposes a branch/leaf cursor for
//! external traversal. An outer coordinate-mapping layer decides which
//! instance owns a given region, and bulk load/store collaborators drive
//! the pre-order stream interface.

pub mod arena;
pub mod dag;
pub mod interner;
pub mod node;

mod hashing;

pub use dag::{DEFAULT_DEPTH, MAX_DEPTH, NodeRef, PreorderEntry, VoxelDag};
pub use node::ANY_BLOCK_TYPE;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VoxelDagError>;

/// Errors surfaced by the sub-octree. All of them are raised before any
/// partial mutation is committed, leaving the structure in its previous
/// state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoxelDagError {
    /// The arena cannot address any more sibling groups within the bit
    /// width of a branch value. Callers are expected to fall back to a
    /// different storage encoding.
    #[error("sub-octree arena cannot address any more sibling groups")]
    CapacityExhausted,

    /// A block-type code does not fit in the reserved bit width.
    #[error("block type {block_type} does not fit in {bits} bits", bits = node::BLOCK_TYPE_BITS)]
    BlockTypeOutOfRange { block_type: u32 },

    /// A pre-order node stream ended before the tree was complete.
    #[error("node stream ended before the tree was complete")]
    TruncatedNodeStream,

    /// A pre-order node stream contains a branch marker at a level where
    /// only leaves can exist.
    #[error("node stream contains a branch marker below the leaf level")]
    BranchBelowLeafLevel,
}
