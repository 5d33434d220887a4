//! B+-tree storage, generic over the key type.
//!
//! One tree implementation serves both uses: the clustered table tree
//! (row-ID keys, row-cell payloads) and secondary/unique index trees
//! (value keys, row-ID payloads).  All data lives in the leaves, which are
//! linked through a next-leaf pointer for sequential scans; internal nodes
//! hold separator keys equal to the maximum key of their left subtree.

/// module `header` defines the per-node header shared by every node page.
pub mod header;
/// module `node` defines the leaf/internal node bodies, their space
/// accounting, and their marshal/unmarshal routines.
pub mod node;
/// module `tree` defines descent, insert with split, delete with
/// merge/borrow, and the scan cursors.
pub mod tree;

/// Row identifiers are 64-bit unsigned, assigned per table and never
/// reused within a table's lifetime.
pub type RowId = u64;
