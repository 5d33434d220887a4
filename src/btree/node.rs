//! Leaf and internal node bodies, generic over key and payload types.
//!
//! A node owns an ordered cell array plus the bookkeeping the tree needs
//! for splits and merges: byte-accurate space accounting (cell sizes vary
//! with inline row-ID counts and string lengths, so occupancy is measured
//! in bytes, not cells) and the structural mutators rebalancing uses.

use std::io::Cursor;

use crate::btree::header::{NodeHeader, NODE_HDR_SIZE};
use crate::btree::RowId;
use crate::codec;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::pager::{PageIdx, PAGE_SIZE};
use crate::row::RowData;

/// Bytes available for cells on a node page.
pub const MAX_CELL_SPACE: usize = PAGE_SIZE - NODE_HDR_SIZE;

/// Contract a key type must satisfy for the tree to store it.  The tree
/// never looks past this: composite keys are just another implementation.
pub trait NodeKey: Clone + Ord + std::fmt::Debug {
    fn byte_size(&self) -> usize;
    fn write(&self, buf: &mut Vec<u8>);
    fn read(c: &mut Cursor<&[u8]>) -> Result<Self>;
}

/// Contract for leaf cell payloads.
pub trait NodeVal: Clone + std::fmt::Debug {
    fn byte_size(&self) -> usize;
    fn write(&self, buf: &mut Vec<u8>);
    fn read(c: &mut Cursor<&[u8]>) -> Result<Self>;
}

impl NodeKey for RowId {
    fn byte_size(&self) -> usize {
        8
    }
    fn write(&self, buf: &mut Vec<u8>) {
        codec::write_u64(buf, *self);
    }
    fn read(c: &mut Cursor<&[u8]>) -> Result<RowId> {
        codec::read_u64(c)
    }
}

impl NodeKey for Key {
    fn byte_size(&self) -> usize {
        Key::byte_size(self)
    }
    fn write(&self, buf: &mut Vec<u8>) {
        Key::write(self, buf);
    }
    fn read(c: &mut Cursor<&[u8]>) -> Result<Key> {
        Key::read(c)
    }
}

impl NodeVal for RowData {
    fn byte_size(&self) -> usize {
        4 + self.0.len()
    }
    fn write(&self, buf: &mut Vec<u8>) {
        codec::write_u32(buf, self.0.len() as u32);
        buf.extend_from_slice(&self.0);
    }
    fn read(c: &mut Cursor<&[u8]>) -> Result<RowData> {
        let len = codec::read_u32(c)? as usize;
        Ok(RowData(codec::read_exact(c, len)?))
    }
}

/// Row-ID list of an index cell: a small inline array, spilling into a
/// chained overflow page once `MAX_INLINE_ROW_IDS` is reached.  Unique
/// index cells simply never grow past one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowIdPayload {
    pub row_ids: Vec<RowId>,
    /// Head of the overflow chain, 0 for none.
    pub overflow: PageIdx,
}

impl RowIdPayload {
    pub fn single(row_id: RowId) -> RowIdPayload {
        RowIdPayload {
            row_ids: vec![row_id],
            overflow: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.row_ids.is_empty() && self.overflow == 0
    }

    /// Worst-case payload size: full inline array plus the chain pointer.
    pub fn max_byte_size() -> usize {
        1 + 8 * crate::MAX_INLINE_ROW_IDS + 4
    }
}

impl NodeVal for RowIdPayload {
    fn byte_size(&self) -> usize {
        1 + 8 * self.row_ids.len() + 4
    }
    fn write(&self, buf: &mut Vec<u8>) {
        codec::write_u8(buf, self.row_ids.len() as u8);
        for id in &self.row_ids {
            codec::write_u64(buf, *id);
        }
        codec::write_u32(buf, self.overflow);
    }
    fn read(c: &mut Cursor<&[u8]>) -> Result<RowIdPayload> {
        let n = codec::read_u8(c)? as usize;
        if n > crate::MAX_INLINE_ROW_IDS {
            return Err(Error::corrupt(format!("inline row-id count {} too large", n)));
        }
        let mut row_ids = Vec::with_capacity(n);
        for _ in 0..n {
            row_ids.push(codec::read_u64(c)?);
        }
        let overflow = codec::read_u32(c)?;
        Ok(RowIdPayload { row_ids, overflow })
    }
}

/// A leaf node: ordered `(key, payload)` cells and the next-leaf link.
#[derive(Debug, Clone)]
pub struct LeafNode<K, V> {
    pub hdr: NodeHeader,
    pub cells: Vec<(K, V)>,
    /// Next leaf in key order, 0 at the right edge.
    pub next_leaf: PageIdx,
}

impl<K: NodeKey, V: NodeVal> LeafNode<K, V> {
    pub fn empty_root() -> Self {
        LeafNode {
            hdr: NodeHeader::root(),
            cells: vec![],
            next_leaf: 0,
        }
    }

    pub fn max_space(&self) -> usize {
        MAX_CELL_SPACE
    }

    pub fn taken_space(&self) -> usize {
        self.cells
            .iter()
            .map(|(k, v)| k.byte_size() + v.byte_size())
            .sum()
    }

    pub fn available_space(&self) -> usize {
        self.max_space() - self.taken_space()
    }

    pub fn has_space_for(&self, extra: usize) -> bool {
        self.taken_space() + extra <= self.max_space()
    }

    pub fn at_least_half_full(&self) -> bool {
        self.taken_space() * 2 >= self.max_space()
    }

    /// Would this node still be at least half full after giving up `bytes`?
    pub fn can_donate(&self, bytes: usize) -> bool {
        (self.taken_space() - bytes) * 2 >= self.max_space()
    }

    /// Index of `key`, or the insertion point for it.
    pub fn find(&self, key: &K) -> std::result::Result<usize, usize> {
        self.cells.binary_search_by(|(k, _)| k.cmp(key))
    }

    pub fn max_key(&self) -> Option<&K> {
        self.cells.last().map(|(k, _)| k)
    }

    /// Split so each half holds roughly half the bytes; the separator
    /// promoted upward is the maximum key of the left half.  Returns
    /// `(separator, right_half)`; the caller wires up page links.
    pub fn split(&mut self) -> (K, LeafNode<K, V>) {
        let split_at = split_point(
            self.cells
                .iter()
                .map(|(k, v)| k.byte_size() + v.byte_size()),
        );
        let right_cells = self.cells.split_off(split_at);
        let sep = self
            .cells
            .last()
            .map(|(k, _)| k.clone())
            .expect("split of a node with fewer than two cells");
        let right = LeafNode {
            hdr: NodeHeader::child_of(self.hdr.parent),
            cells: right_cells,
            next_leaf: self.next_leaf,
        };
        (sep, right)
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        self.hdr.write(buf);
        codec::write_u16(buf, self.cells.len() as u16);
        codec::write_u32(buf, self.next_leaf);
        for (k, v) in &self.cells {
            k.write(buf);
            v.write(buf);
        }
    }

    pub fn read(c: &mut Cursor<&[u8]>) -> Result<Self> {
        let hdr = NodeHeader::read(c)?;
        let nkeys = codec::read_u16(c)? as usize;
        let next_leaf = codec::read_u32(c)?;
        let mut cells = Vec::with_capacity(nkeys);
        for _ in 0..nkeys {
            let k = K::read(c)?;
            let v = V::read(c)?;
            cells.push((k, v));
        }
        Ok(LeafNode {
            hdr,
            cells,
            next_leaf,
        })
    }
}

/// An internal node: `(separator, left-child)` entries plus the rightmost
/// child.  Each separator equals the maximum key of its child's subtree.
#[derive(Debug, Clone)]
pub struct InteriorNode<K> {
    pub hdr: NodeHeader,
    pub entries: Vec<(K, PageIdx)>,
    pub rightmost: PageIdx,
}

impl<K: NodeKey> InteriorNode<K> {
    pub fn max_space(&self) -> usize {
        MAX_CELL_SPACE
    }

    pub fn taken_space(&self) -> usize {
        self.entries
            .iter()
            .map(|(k, _)| k.byte_size() + 4)
            .sum()
    }

    pub fn available_space(&self) -> usize {
        self.max_space() - self.taken_space()
    }

    pub fn has_space_for(&self, key: &K) -> bool {
        self.taken_space() + key.byte_size() + 4 <= self.max_space()
    }

    pub fn at_least_half_full(&self) -> bool {
        self.taken_space() * 2 >= self.max_space()
    }

    pub fn can_donate(&self, bytes: usize) -> bool {
        (self.taken_space() - bytes) * 2 >= self.max_space()
    }

    /// Number of children (entries plus the rightmost).
    pub fn child_count(&self) -> usize {
        self.entries.len() + 1
    }

    /// The child page at `slot`, where `slot == entries.len()` is the
    /// rightmost child.
    pub fn child_at(&self, slot: usize) -> PageIdx {
        if slot == self.entries.len() {
            self.rightmost
        } else {
            self.entries[slot].1
        }
    }

    pub fn set_child(&mut self, slot: usize, page: PageIdx) {
        if slot == self.entries.len() {
            self.rightmost = page;
        } else {
            self.entries[slot].1 = page;
        }
    }

    /// Which child slot to descend into for `key`: the first entry whose
    /// separator admits it, else the rightmost.
    pub fn child_slot_for(&self, key: &K) -> usize {
        self.entries.partition_point(|(sep, _)| sep < key)
    }

    /// Split around the median; the median key moves up.  Returns
    /// `(promoted, right_half)`.
    pub fn split(&mut self) -> (K, InteriorNode<K>) {
        let mid = self.entries.len() / 2;
        let right_entries = self.entries.split_off(mid + 1);
        let (promoted, left_rightmost) = self.entries.pop().expect("interior split on tiny node");
        let right = InteriorNode {
            hdr: NodeHeader::child_of(self.hdr.parent),
            entries: right_entries,
            rightmost: self.rightmost,
        };
        self.rightmost = left_rightmost;
        (promoted, right)
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        self.hdr.write(buf);
        codec::write_u16(buf, self.entries.len() as u16);
        codec::write_u32(buf, self.rightmost);
        for (k, child) in &self.entries {
            k.write(buf);
            codec::write_u32(buf, *child);
        }
    }

    pub fn read(c: &mut Cursor<&[u8]>) -> Result<Self> {
        let hdr = NodeHeader::read(c)?;
        let nkeys = codec::read_u16(c)? as usize;
        let rightmost = codec::read_u32(c)?;
        let mut entries = Vec::with_capacity(nkeys);
        for _ in 0..nkeys {
            let k = K::read(c)?;
            let child = codec::read_u32(c)?;
            entries.push((k, child));
        }
        Ok(InteriorNode {
            hdr,
            entries,
            rightmost,
        })
    }
}

/// First index at which the running size reaches half the total, clamped
/// so both halves keep at least one cell.
fn split_point(sizes: impl ExactSizeIterator<Item = usize> + Clone) -> usize {
    let n = sizes.len();
    debug_assert!(n >= 2);
    let total: usize = sizes.clone().sum();
    let mut acc = 0;
    for (i, sz) in sizes.enumerate() {
        acc += sz;
        if acc * 2 >= total {
            return (i + 1).clamp(1, n - 1);
        }
    }
    n - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_with(keys: &[u64]) -> LeafNode<RowId, RowIdPayload> {
        LeafNode {
            hdr: NodeHeader::root(),
            cells: keys
                .iter()
                .map(|k| (*k, RowIdPayload::single(*k * 10)))
                .collect(),
            next_leaf: 0,
        }
    }

    #[test]
    fn test_leaf_marshal_round_trip() {
        let leaf = leaf_with(&[1, 5, 9]);
        let mut buf = vec![];
        leaf.write(&mut buf);
        let mut c = Cursor::new(buf.as_slice());
        let back: LeafNode<RowId, RowIdPayload> = LeafNode::read(&mut c).unwrap();
        assert_eq!(back.cells, leaf.cells);
        assert_eq!(back.next_leaf, leaf.next_leaf);
        assert_eq!(back.hdr, leaf.hdr);
    }

    #[test]
    fn test_interior_marshal_round_trip() {
        let node = InteriorNode {
            hdr: NodeHeader::child_of(3),
            entries: vec![(10_u64, 4), (20, 5)],
            rightmost: 6,
        };
        let mut buf = vec![];
        node.write(&mut buf);
        let mut c = Cursor::new(buf.as_slice());
        let back: InteriorNode<RowId> = InteriorNode::read(&mut c).unwrap();
        assert_eq!(back.entries, node.entries);
        assert_eq!(back.rightmost, node.rightmost);
    }

    #[test]
    fn test_leaf_split_promotes_left_max() {
        let mut leaf = leaf_with(&[1, 2, 3, 4, 5, 6]);
        let before: Vec<u64> = leaf.cells.iter().map(|(k, _)| *k).collect();
        let (sep, right) = leaf.split();
        assert_eq!(sep, *leaf.max_key().unwrap());
        let mut after: Vec<u64> = leaf.cells.iter().map(|(k, _)| *k).collect();
        after.extend(right.cells.iter().map(|(k, _)| *k));
        assert_eq!(after, before);
        assert!(!leaf.cells.is_empty() && !right.cells.is_empty());
    }

    #[test]
    fn test_interior_split_promotes_median() {
        let mut node = InteriorNode {
            hdr: NodeHeader::root(),
            entries: (1..=5_u64).map(|k| (k * 10, k as u32)).collect(),
            rightmost: 9,
        };
        let (promoted, right) = node.split();
        assert_eq!(promoted, 30);
        assert_eq!(node.entries.iter().map(|e| e.0).collect::<Vec<_>>(), vec![10, 20]);
        assert_eq!(node.rightmost, 3);
        assert_eq!(right.entries.iter().map(|e| e.0).collect::<Vec<_>>(), vec![40, 50]);
        assert_eq!(right.rightmost, 9);
    }

    #[test]
    fn test_child_slot_for() {
        let node = InteriorNode {
            hdr: NodeHeader::root(),
            entries: vec![(10_u64, 1), (20, 2)],
            rightmost: 3,
        };
        assert_eq!(node.child_slot_for(&5), 0);
        assert_eq!(node.child_slot_for(&10), 0);
        assert_eq!(node.child_slot_for(&15), 1);
        assert_eq!(node.child_slot_for(&20), 1);
        assert_eq!(node.child_slot_for(&25), 2);
        assert_eq!(node.child_at(2), 3);
    }

    #[test]
    fn test_space_accounting() {
        let leaf = leaf_with(&[1, 2]);
        let cell = 8 + leaf.cells[0].1.byte_size();
        assert_eq!(leaf.taken_space(), 2 * cell);
        assert_eq!(leaf.available_space(), MAX_CELL_SPACE - 2 * cell);
        assert!(!leaf.at_least_half_full());
    }

    #[test]
    fn test_row_id_payload_round_trip() {
        let p = RowIdPayload {
            row_ids: vec![7, 8, 9],
            overflow: 42,
        };
        let mut buf = vec![];
        p.write(&mut buf);
        assert_eq!(buf.len(), p.byte_size());
        let mut c = Cursor::new(buf.as_slice());
        assert_eq!(RowIdPayload::read(&mut c).unwrap(), p);
    }
}
