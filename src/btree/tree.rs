//! The B+-tree proper: descent, point lookup, insert with splits that
//! propagate upward, delete with merge/borrow, and the scan cursors.
//!
//! The tree is generic over a [`TreeKind`], which binds the key/payload
//! types and knows which `Page` variants hold its nodes.  The root page
//! index never changes: when the root splits, both halves move to fresh
//! pages and the root page is rewritten as an internal node in place, so
//! catalog references to root pages stay valid across any edit.
//!
//! Cursors hold no borrows; `next` takes the transaction each call, so a
//! caller can fetch rows or resolve overflow chains between steps.  The
//! tree must not be structurally modified while a cursor is walking it --
//! writers collect matches first, then mutate.

use std::marker::PhantomData;

use crate::btree::header::NodeHeader;
use crate::btree::node::{InteriorNode, LeafNode, NodeKey, NodeVal, RowIdPayload};
use crate::btree::RowId;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::page::Page;
use crate::pager::{PageIdx, Pager};
use crate::row::RowData;
use crate::transaction::Transaction;

/// Binds a key/payload pair to its `Page` variants.
pub trait TreeKind {
    type Key: NodeKey;
    type Val: NodeVal;

    fn leaf(page: &Page) -> Option<&LeafNode<Self::Key, Self::Val>>;
    fn leaf_mut(page: &mut Page) -> Option<&mut LeafNode<Self::Key, Self::Val>>;
    fn into_leaf(page: Page) -> Option<LeafNode<Self::Key, Self::Val>>;
    fn interior(page: &Page) -> Option<&InteriorNode<Self::Key>>;
    fn interior_mut(page: &mut Page) -> Option<&mut InteriorNode<Self::Key>>;
    fn into_interior(page: Page) -> Option<InteriorNode<Self::Key>>;
    fn leaf_page(node: LeafNode<Self::Key, Self::Val>) -> Page;
    fn interior_page(node: InteriorNode<Self::Key>) -> Page;
}

/// The clustered table tree: row-ID keys, row-cell payloads.
pub struct TableTree;

impl TreeKind for TableTree {
    type Key = RowId;
    type Val = RowData;

    fn leaf(page: &Page) -> Option<&LeafNode<RowId, RowData>> {
        page.as_table_leaf()
    }
    fn leaf_mut(page: &mut Page) -> Option<&mut LeafNode<RowId, RowData>> {
        page.as_table_leaf_mut()
    }
    fn into_leaf(page: Page) -> Option<LeafNode<RowId, RowData>> {
        page.into_table_leaf().ok()
    }
    fn interior(page: &Page) -> Option<&InteriorNode<RowId>> {
        page.as_table_interior()
    }
    fn interior_mut(page: &mut Page) -> Option<&mut InteriorNode<RowId>> {
        page.as_table_interior_mut()
    }
    fn into_interior(page: Page) -> Option<InteriorNode<RowId>> {
        page.into_table_interior().ok()
    }
    fn leaf_page(node: LeafNode<RowId, RowData>) -> Page {
        Page::TableLeaf(node)
    }
    fn interior_page(node: InteriorNode<RowId>) -> Page {
        Page::TableInterior(node)
    }
}

/// Index trees: value keys, row-ID list payloads.  Uniqueness is the
/// index layer's concern; the tree just refuses duplicate keys.
pub struct IndexTree;

impl TreeKind for IndexTree {
    type Key = Key;
    type Val = RowIdPayload;

    fn leaf(page: &Page) -> Option<&LeafNode<Key, RowIdPayload>> {
        page.as_index_leaf()
    }
    fn leaf_mut(page: &mut Page) -> Option<&mut LeafNode<Key, RowIdPayload>> {
        page.as_index_leaf_mut()
    }
    fn into_leaf(page: Page) -> Option<LeafNode<Key, RowIdPayload>> {
        page.into_index_leaf().ok()
    }
    fn interior(page: &Page) -> Option<&InteriorNode<Key>> {
        page.as_index_interior()
    }
    fn interior_mut(page: &mut Page) -> Option<&mut InteriorNode<Key>> {
        page.as_index_interior_mut()
    }
    fn into_interior(page: Page) -> Option<InteriorNode<Key>> {
        page.into_index_interior().ok()
    }
    fn leaf_page(node: LeafNode<Key, RowIdPayload>) -> Page {
        Page::IndexLeaf(node)
    }
    fn interior_page(node: InteriorNode<Key>) -> Page {
        Page::IndexInterior(node)
    }
}

enum NodeOwned<T: TreeKind> {
    Leaf(LeafNode<T::Key, T::Val>),
    Interior(InteriorNode<T::Key>),
}

pub struct BTree<'p, T: TreeKind> {
    pager: &'p Pager,
    pub root: PageIdx,
    _kind: PhantomData<T>,
}

impl<'p, T: TreeKind> BTree<'p, T> {
    pub fn new(pager: &'p Pager, root: PageIdx) -> BTree<'p, T> {
        BTree {
            pager,
            root,
            _kind: PhantomData,
        }
    }

    /// Allocate an empty root leaf for a new tree.
    pub fn create_empty(pager: &Pager, tx: &mut Transaction) -> Result<PageIdx> {
        let idx = pager.get_free_page(tx)?;
        pager.put_page(tx, idx, T::leaf_page(LeafNode::empty_root()));
        Ok(idx)
    }

    fn corrupt(&self, idx: PageIdx, what: &str, page: &Page) -> Error {
        Error::CorruptPage {
            page: idx,
            detail: format!("expected {} node, found {} page", what, page.type_name()),
        }
    }

    fn read_leaf(&self, tx: &mut Transaction, idx: PageIdx) -> Result<LeafNode<T::Key, T::Val>> {
        let page = self.pager.read_page(tx, idx)?;
        if T::leaf(&page).is_none() {
            return Err(self.corrupt(idx, "leaf", &page));
        }
        Ok(T::into_leaf(page).expect("checked variant"))
    }

    fn read_interior(&self, tx: &mut Transaction, idx: PageIdx) -> Result<InteriorNode<T::Key>> {
        let page = self.pager.read_page(tx, idx)?;
        if T::interior(&page).is_none() {
            return Err(self.corrupt(idx, "internal", &page));
        }
        Ok(T::into_interior(page).expect("checked variant"))
    }

    fn read_any(&self, tx: &mut Transaction, idx: PageIdx) -> Result<NodeOwned<T>> {
        let page = self.pager.read_page(tx, idx)?;
        if T::leaf(&page).is_some() {
            return Ok(NodeOwned::Leaf(T::into_leaf(page).expect("checked variant")));
        }
        if T::interior(&page).is_some() {
            return Ok(NodeOwned::Interior(
                T::into_interior(page).expect("checked variant"),
            ));
        }
        Err(self.corrupt(idx, "btree", &page))
    }

    fn put_any(&self, tx: &mut Transaction, idx: PageIdx, node: NodeOwned<T>) {
        match node {
            NodeOwned::Leaf(n) => self.pager.put_page(tx, idx, T::leaf_page(n)),
            NodeOwned::Interior(n) => self.pager.put_page(tx, idx, T::interior_page(n)),
        }
    }

    /// Point a child's parent link (and clear its root flag) at `parent`.
    fn set_parent(&self, tx: &mut Transaction, idx: PageIdx, parent: PageIdx) -> Result<()> {
        let mut node = self.read_any(tx, idx)?;
        let hdr = match &mut node {
            NodeOwned::Leaf(n) => &mut n.hdr,
            NodeOwned::Interior(n) => &mut n.hdr,
        };
        *hdr = NodeHeader::child_of(parent);
        self.put_any(tx, idx, node);
        Ok(())
    }

    /// Follow separators from the root down to the leaf that owns `key`.
    /// Returns the internal path as `(page, child-slot)` pairs plus the
    /// leaf itself.
    fn descend(
        &self,
        tx: &mut Transaction,
        key: &T::Key,
    ) -> Result<(Vec<(PageIdx, usize)>, PageIdx, LeafNode<T::Key, T::Val>)> {
        let mut path = vec![];
        let mut cur = self.root;
        loop {
            match self.read_any(tx, cur)? {
                NodeOwned::Leaf(leaf) => return Ok((path, cur, leaf)),
                NodeOwned::Interior(node) => {
                    let slot = node.child_slot_for(key);
                    let child = node.child_at(slot);
                    path.push((cur, slot));
                    cur = child;
                }
            }
        }
    }

    pub fn get(&self, tx: &mut Transaction, key: &T::Key) -> Result<Option<T::Val>> {
        let (_, _, leaf) = self.descend(tx, key)?;
        Ok(match leaf.find(key) {
            Ok(pos) => Some(leaf.cells[pos].1.clone()),
            Err(_) => None,
        })
    }

    /// Insert a new cell.  An existing key fails with `DuplicateKey`
    /// (the index layer grows the payload instead for non-unique keys).
    pub fn insert(&self, tx: &mut Transaction, key: T::Key, val: T::Val) -> Result<()> {
        let cell_size = key.byte_size() + val.byte_size();
        if cell_size > crate::btree::node::MAX_CELL_SPACE {
            return Err(Error::validation(format!(
                "cell of {} bytes cannot fit a page",
                cell_size
            )));
        }
        let (path, leaf_idx, mut leaf) = self.descend(tx, &key)?;
        let pos = match leaf.find(&key) {
            Ok(_) => {
                return Err(Error::DuplicateKey {
                    index: String::new(),
                    key: format!("{:?}", key),
                })
            }
            Err(pos) => pos,
        };
        leaf.cells.insert(pos, (key, val));
        if leaf.taken_space() <= leaf.max_space() {
            self.pager.put_page(tx, leaf_idx, T::leaf_page(leaf));
            return Ok(());
        }
        self.split_leaf(tx, path, leaf_idx, leaf)
    }

    /// Replace the payload of an existing cell, splitting if it no longer
    /// fits its leaf.
    pub fn replace(&self, tx: &mut Transaction, key: &T::Key, val: T::Val) -> Result<()> {
        let cell_size = key.byte_size() + val.byte_size();
        if cell_size > crate::btree::node::MAX_CELL_SPACE {
            return Err(Error::validation(format!(
                "cell of {} bytes cannot fit a page",
                cell_size
            )));
        }
        let (path, leaf_idx, mut leaf) = self.descend(tx, key)?;
        let pos = leaf
            .find(key)
            .map_err(|_| Error::NotFound(format!("key {:?}", key)))?;
        leaf.cells[pos].1 = val;
        if leaf.taken_space() <= leaf.max_space() {
            self.pager.put_page(tx, leaf_idx, T::leaf_page(leaf));
            return Ok(());
        }
        self.split_leaf(tx, path, leaf_idx, leaf)
    }

    fn split_leaf(
        &self,
        tx: &mut Transaction,
        path: Vec<(PageIdx, usize)>,
        leaf_idx: PageIdx,
        mut leaf: LeafNode<T::Key, T::Val>,
    ) -> Result<()> {
        let (sep, mut right) = leaf.split();
        let right_idx = self.pager.get_free_page(tx)?;
        leaf.next_leaf = right_idx;

        if path.is_empty() {
            // Root split: both halves move to fresh pages, the root page
            // is rewritten as an internal node in place.
            let left_idx = self.pager.get_free_page(tx)?;
            leaf.hdr = NodeHeader::child_of(leaf_idx);
            right.hdr = NodeHeader::child_of(leaf_idx);
            let root = InteriorNode {
                hdr: NodeHeader::root(),
                entries: vec![(sep, left_idx)],
                rightmost: right_idx,
            };
            self.pager.put_page(tx, left_idx, T::leaf_page(leaf));
            self.pager.put_page(tx, right_idx, T::leaf_page(right));
            self.pager.put_page(tx, leaf_idx, T::interior_page(root));
            return Ok(());
        }

        self.pager.put_page(tx, leaf_idx, T::leaf_page(leaf));
        self.pager.put_page(tx, right_idx, T::leaf_page(right));
        self.insert_into_parent(tx, path, leaf_idx, sep, right_idx)
    }

    /// After `left_idx` split, hand its parent the new separator and the
    /// fresh right sibling, splitting upward as needed.
    fn insert_into_parent(
        &self,
        tx: &mut Transaction,
        mut path: Vec<(PageIdx, usize)>,
        left_idx: PageIdx,
        sep: T::Key,
        right_idx: PageIdx,
    ) -> Result<()> {
        let (parent_idx, slot) = path.pop().expect("non-root split has a parent");
        let mut parent = self.read_interior(tx, parent_idx)?;

        if slot == parent.entries.len() {
            // Left half was the rightmost child; it gains a separator and
            // the right half becomes the new rightmost.
            parent.entries.push((sep, left_idx));
            parent.rightmost = right_idx;
        } else {
            // The old separator still bounds the right half.
            parent.entries[slot].1 = right_idx;
            parent.entries.insert(slot, (sep, left_idx));
        }

        if parent.taken_space() <= parent.max_space() {
            self.pager.put_page(tx, parent_idx, T::interior_page(parent));
            return Ok(());
        }

        // Internal split: the median key moves up.
        let (promoted, mut right_node) = parent.split();
        let right_node_idx = self.pager.get_free_page(tx)?;
        for s in 0..right_node.child_count() {
            self.set_parent(tx, right_node.child_at(s), right_node_idx)?;
        }

        if path.is_empty() {
            // Splitting the root: same fixed-root dance as for leaves.
            let new_left_idx = self.pager.get_free_page(tx)?;
            parent.hdr = NodeHeader::child_of(parent_idx);
            right_node.hdr = NodeHeader::child_of(parent_idx);
            for s in 0..parent.child_count() {
                self.set_parent(tx, parent.child_at(s), new_left_idx)?;
            }
            let root = InteriorNode {
                hdr: NodeHeader::root(),
                entries: vec![(promoted, new_left_idx)],
                rightmost: right_node_idx,
            };
            self.pager.put_page(tx, new_left_idx, T::interior_page(parent));
            self.pager
                .put_page(tx, right_node_idx, T::interior_page(right_node));
            self.pager.put_page(tx, parent_idx, T::interior_page(root));
            return Ok(());
        }

        right_node.hdr = NodeHeader::child_of(parent.hdr.parent);
        self.pager.put_page(tx, parent_idx, T::interior_page(parent));
        self.pager
            .put_page(tx, right_node_idx, T::interior_page(right_node));
        self.insert_into_parent(tx, path, parent_idx, promoted, right_node_idx)
    }

    /// Remove a cell, rebalancing with borrow/merge on the way up.
    /// Returns the removed payload; a missing key is `NotFound`.
    pub fn delete(&self, tx: &mut Transaction, key: &T::Key) -> Result<T::Val> {
        let (path, leaf_idx, mut leaf) = self.descend(tx, key)?;
        let pos = leaf
            .find(key)
            .map_err(|_| Error::NotFound(format!("key {:?}", key)))?;
        let removed = leaf.cells.remove(pos);

        // I2 upkeep: if the subtree's maximum changed, the nearest
        // ancestor that tracks it via an entry separator must follow.
        if pos == leaf.cells.len() && !leaf.cells.is_empty() {
            let new_max = leaf.max_key().expect("non-empty").clone();
            self.fix_separators(tx, &path, key, new_max)?;
        }
        self.pager.put_page(tx, leaf_idx, T::leaf_page(leaf));
        self.rebalance(tx, path, leaf_idx)?;
        Ok(removed.1)
    }

    /// Walk the descent path bottom-up; the first level that reached us
    /// through an entry (not the rightmost pointer) holds the separator
    /// equal to the old subtree max.
    fn fix_separators(
        &self,
        tx: &mut Transaction,
        path: &[(PageIdx, usize)],
        old_max: &T::Key,
        new_max: T::Key,
    ) -> Result<()> {
        for (page_idx, slot) in path.iter().rev() {
            let mut node = self.read_interior(tx, *page_idx)?;
            if *slot == node.entries.len() {
                continue;
            }
            if node.entries[*slot].0 == *old_max {
                node.entries[*slot].0 = new_max;
                self.pager.put_page(tx, *page_idx, T::interior_page(node));
            }
            return Ok(());
        }
        Ok(())
    }

    fn rebalance(
        &self,
        tx: &mut Transaction,
        mut path: Vec<(PageIdx, usize)>,
        start: PageIdx,
    ) -> Result<()> {
        let mut cur_idx = start;
        loop {
            let underfull = match self.read_any(tx, cur_idx)? {
                NodeOwned::Leaf(n) => !n.hdr.is_root && !n.at_least_half_full(),
                NodeOwned::Interior(n) => !n.hdr.is_root && !n.at_least_half_full(),
            };
            if !underfull {
                break;
            }
            let (parent_idx, slot) = match path.pop() {
                Some(p) => p,
                None => break,
            };
            let merged = match self.read_any(tx, cur_idx)? {
                NodeOwned::Leaf(n) => self.rebalance_leaf(tx, parent_idx, slot, cur_idx, n)?,
                NodeOwned::Interior(n) => {
                    self.rebalance_interior(tx, parent_idx, slot, cur_idx, n)?
                }
            };
            if !merged {
                break;
            }
            cur_idx = parent_idx;
        }
        self.demote_root(tx)
    }

    /// Try borrowing a cell from a sibling; merge when neither sibling can
    /// spare one.  Returns true when a merge removed an entry from the
    /// parent (which must then be rebalanced itself).
    fn rebalance_leaf(
        &self,
        tx: &mut Transaction,
        parent_idx: PageIdx,
        slot: usize,
        cur_idx: PageIdx,
        mut cur: LeafNode<T::Key, T::Val>,
    ) -> Result<bool> {
        let mut parent = self.read_interior(tx, parent_idx)?;

        // Borrow the last cell of the left sibling.
        if slot > 0 {
            let left_idx = parent.child_at(slot - 1);
            let mut left = self.read_leaf(tx, left_idx)?;
            if left.cells.len() > 1 {
                let (k, v) = left.cells.last().expect("non-empty");
                if left.can_donate(k.byte_size() + v.byte_size()) {
                    let cell = left.cells.pop().expect("non-empty");
                    cur.cells.insert(0, cell);
                    parent.entries[slot - 1].0 =
                        left.max_key().expect("donor keeps cells").clone();
                    self.pager.put_page(tx, left_idx, T::leaf_page(left));
                    self.pager.put_page(tx, cur_idx, T::leaf_page(cur));
                    self.pager.put_page(tx, parent_idx, T::interior_page(parent));
                    return Ok(false);
                }
            }
        }

        // Borrow the first cell of the right sibling.
        if slot < parent.entries.len() {
            let right_idx = parent.child_at(slot + 1);
            let mut right = self.read_leaf(tx, right_idx)?;
            if right.cells.len() > 1 {
                let (k, v) = right.cells.first().expect("non-empty");
                if right.can_donate(k.byte_size() + v.byte_size()) {
                    let cell = right.cells.remove(0);
                    cur.cells.push(cell);
                    parent.entries[slot].0 = cur.max_key().expect("non-empty").clone();
                    self.pager.put_page(tx, right_idx, T::leaf_page(right));
                    self.pager.put_page(tx, cur_idx, T::leaf_page(cur));
                    self.pager.put_page(tx, parent_idx, T::interior_page(parent));
                    return Ok(false);
                }
            }
        }

        // Merge with the left sibling, else pull the right one in.
        if slot > 0 {
            let left_idx = parent.child_at(slot - 1);
            let mut left = self.read_leaf(tx, left_idx)?;
            if left.taken_space() + cur.taken_space() > cur.max_space() {
                return Ok(false);
            }
            left.cells.append(&mut cur.cells);
            left.next_leaf = cur.next_leaf;
            if slot == parent.entries.len() {
                parent.rightmost = left_idx;
            } else {
                parent.entries[slot].1 = left_idx;
            }
            parent.entries.remove(slot - 1);
            // The surviving entry describes the merged leaf now; keep its
            // separator equal to the actual maximum (the merged-away node
            // may have been emptied by the delete).
            if slot - 1 < parent.entries.len() {
                if let Some(m) = left.max_key() {
                    parent.entries[slot - 1].0 = m.clone();
                }
            }
            self.pager.put_page(tx, left_idx, T::leaf_page(left));
            self.pager.put_page(tx, parent_idx, T::interior_page(parent));
            self.pager.release_page(tx, cur_idx)?;
        } else {
            let right_idx = parent.child_at(1);
            let mut right = self.read_leaf(tx, right_idx)?;
            if right.taken_space() + cur.taken_space() > cur.max_space() {
                return Ok(false);
            }
            cur.cells.append(&mut right.cells);
            cur.next_leaf = right.next_leaf;
            if 1 == parent.entries.len() {
                parent.rightmost = cur_idx;
            } else {
                parent.entries[1].1 = cur_idx;
            }
            parent.entries.remove(0);
            self.pager.put_page(tx, cur_idx, T::leaf_page(cur));
            self.pager.put_page(tx, parent_idx, T::interior_page(parent));
            self.pager.release_page(tx, right_idx)?;
        }
        Ok(true)
    }

    fn rebalance_interior(
        &self,
        tx: &mut Transaction,
        parent_idx: PageIdx,
        slot: usize,
        cur_idx: PageIdx,
        mut cur: InteriorNode<T::Key>,
    ) -> Result<bool> {
        let mut parent = self.read_interior(tx, parent_idx)?;

        // Rotate the last child of the left sibling through the parent.
        if slot > 0 {
            let left_idx = parent.child_at(slot - 1);
            let mut left = self.read_interior(tx, left_idx)?;
            if !left.entries.is_empty() {
                let donated = left.entries.last().expect("non-empty").0.byte_size() + 4;
                if left.can_donate(donated) {
                    let sep_left = parent.entries[slot - 1].0.clone();
                    let (new_sep, new_rightmost) = left.entries.pop().expect("non-empty");
                    let moved_child = left.rightmost;
                    left.rightmost = new_rightmost;
                    cur.entries.insert(0, (sep_left, moved_child));
                    parent.entries[slot - 1].0 = new_sep;
                    self.set_parent(tx, moved_child, cur_idx)?;
                    self.pager.put_page(tx, left_idx, T::interior_page(left));
                    self.pager.put_page(tx, cur_idx, T::interior_page(cur));
                    self.pager.put_page(tx, parent_idx, T::interior_page(parent));
                    return Ok(false);
                }
            }
        }

        // Rotate the first child of the right sibling through the parent.
        if slot < parent.entries.len() {
            let right_idx = parent.child_at(slot + 1);
            let mut right = self.read_interior(tx, right_idx)?;
            if !right.entries.is_empty() {
                let donated = right.entries.first().expect("non-empty").0.byte_size() + 4;
                if right.can_donate(donated) {
                    let sep_cur = parent.entries[slot].0.clone();
                    let (k0, c0) = right.entries.remove(0);
                    cur.entries.push((sep_cur, cur.rightmost));
                    cur.rightmost = c0;
                    parent.entries[slot].0 = k0;
                    self.set_parent(tx, c0, cur_idx)?;
                    self.pager.put_page(tx, right_idx, T::interior_page(right));
                    self.pager.put_page(tx, cur_idx, T::interior_page(cur));
                    self.pager.put_page(tx, parent_idx, T::interior_page(parent));
                    return Ok(false);
                }
            }
        }

        // Merge, pulling the separator down from the parent.
        if slot > 0 {
            let left_idx = parent.child_at(slot - 1);
            let mut left = self.read_interior(tx, left_idx)?;
            let sep_left = parent.entries[slot - 1].0.clone();
            let extra = sep_left.byte_size() + 4;
            if left.taken_space() + cur.taken_space() + extra > cur.max_space() {
                return Ok(false);
            }
            left.entries.push((sep_left, left.rightmost));
            for s in 0..cur.child_count() {
                self.set_parent(tx, cur.child_at(s), left_idx)?;
            }
            left.entries.append(&mut cur.entries);
            left.rightmost = cur.rightmost;
            if slot == parent.entries.len() {
                parent.rightmost = left_idx;
            } else {
                parent.entries[slot].1 = left_idx;
            }
            parent.entries.remove(slot - 1);
            self.pager.put_page(tx, left_idx, T::interior_page(left));
            self.pager.put_page(tx, parent_idx, T::interior_page(parent));
            self.pager.release_page(tx, cur_idx)?;
        } else {
            let right_idx = parent.child_at(1);
            let mut right = self.read_interior(tx, right_idx)?;
            let sep_cur = parent.entries[0].0.clone();
            let extra = sep_cur.byte_size() + 4;
            if right.taken_space() + cur.taken_space() + extra > cur.max_space() {
                return Ok(false);
            }
            cur.entries.push((sep_cur, cur.rightmost));
            for s in 0..right.child_count() {
                self.set_parent(tx, right.child_at(s), cur_idx)?;
            }
            cur.entries.append(&mut right.entries);
            cur.rightmost = right.rightmost;
            if 1 == parent.entries.len() {
                parent.rightmost = cur_idx;
            } else {
                parent.entries[1].1 = cur_idx;
            }
            parent.entries.remove(0);
            self.pager.put_page(tx, cur_idx, T::interior_page(cur));
            self.pager.put_page(tx, parent_idx, T::interior_page(parent));
            self.pager.release_page(tx, right_idx)?;
        }
        Ok(true)
    }

    /// When merging leaves the root as an internal node with a single
    /// child, pull that child's content up into the root page.
    fn demote_root(&self, tx: &mut Transaction) -> Result<()> {
        loop {
            let root = match self.read_any(tx, self.root)? {
                NodeOwned::Interior(n) if n.entries.is_empty() => n,
                _ => return Ok(()),
            };
            let child_idx = root.rightmost;
            match self.read_any(tx, child_idx)? {
                NodeOwned::Leaf(mut child) => {
                    child.hdr = NodeHeader::root();
                    self.pager.put_page(tx, self.root, T::leaf_page(child));
                    self.pager.release_page(tx, child_idx)?;
                    return Ok(());
                }
                NodeOwned::Interior(mut child) => {
                    child.hdr = NodeHeader::root();
                    for s in 0..child.child_count() {
                        self.set_parent(tx, child.child_at(s), self.root)?;
                    }
                    self.pager.put_page(tx, self.root, T::interior_page(child));
                    self.pager.release_page(tx, child_idx)?;
                }
            }
        }
    }

    /// Largest key in the tree; drives autoincrement and row-ID seeding.
    pub fn seek_last_key(&self, tx: &mut Transaction) -> Result<Option<T::Key>> {
        let mut cur = self.root;
        loop {
            match self.read_any(tx, cur)? {
                NodeOwned::Leaf(leaf) => return Ok(leaf.max_key().cloned()),
                NodeOwned::Interior(node) => cur = node.rightmost,
            }
        }
    }

    /// Forward cursor over `[lower, upper]` (each bound optional).
    pub fn scan_forward(
        &self,
        tx: &mut Transaction,
        lower: Option<(T::Key, bool)>,
        upper: Option<(T::Key, bool)>,
    ) -> Result<ScanCursor<T>> {
        let leaf = match &lower {
            None => {
                let mut cur = self.root;
                loop {
                    match self.read_any(tx, cur)? {
                        NodeOwned::Leaf(leaf) => break leaf,
                        NodeOwned::Interior(node) => cur = node.child_at(0),
                    }
                }
            }
            Some((key, _)) => self.descend(tx, key)?.2,
        };
        let mut buf = leaf.cells;
        if let Some((key, inclusive)) = &lower {
            let skip = buf.partition_point(|(k, _)| {
                if *inclusive {
                    k < key
                } else {
                    k <= key
                }
            });
            buf.drain(..skip);
        }
        Ok(ScanCursor {
            buf: buf.into_iter(),
            next_leaf: leaf.next_leaf,
            upper,
            done: false,
        })
    }

    /// Reverse cursor from the upper bound (or the right edge) down to the
    /// lower bound.  Walks an explicit descent stack since leaves only
    /// link forward.
    pub fn scan_reverse(
        &self,
        tx: &mut Transaction,
        lower: Option<(T::Key, bool)>,
        upper: Option<(T::Key, bool)>,
    ) -> Result<RevScanCursor<T>> {
        let mut stack = vec![];
        let mut cur = self.root;
        let leaf = loop {
            match self.read_any(tx, cur)? {
                NodeOwned::Leaf(leaf) => break leaf,
                NodeOwned::Interior(node) => {
                    let slot = match &upper {
                        None => node.entries.len(),
                        Some((key, _)) => node.child_slot_for(key),
                    };
                    let child = node.child_at(slot);
                    stack.push((cur, slot));
                    cur = child;
                }
            }
        };
        let mut buf = leaf.cells;
        if let Some((key, inclusive)) = &upper {
            let keep = buf.partition_point(|(k, _)| {
                if *inclusive {
                    k <= key
                } else {
                    k < key
                }
            });
            buf.truncate(keep);
        }
        Ok(RevScanCursor {
            stack,
            buf,
            lower,
            done: false,
        })
    }
}

/// Forward scan state.  Holds decoded cells of the current leaf and the
/// next-leaf link; no borrows into the pager.
pub struct ScanCursor<T: TreeKind> {
    buf: std::vec::IntoIter<(T::Key, T::Val)>,
    next_leaf: PageIdx,
    upper: Option<(T::Key, bool)>,
    done: bool,
}

impl<T: TreeKind> ScanCursor<T> {
    pub fn next(
        &mut self,
        tree: &BTree<T>,
        tx: &mut Transaction,
    ) -> Result<Option<(T::Key, T::Val)>> {
        loop {
            if self.done {
                return Ok(None);
            }
            if let Some((k, v)) = self.buf.next() {
                if let Some((bound, inclusive)) = &self.upper {
                    let past = if *inclusive { k > *bound } else { k >= *bound };
                    if past {
                        self.done = true;
                        return Ok(None);
                    }
                }
                return Ok(Some((k, v)));
            }
            if self.next_leaf == 0 {
                self.done = true;
                return Ok(None);
            }
            let leaf = tree.read_leaf(tx, self.next_leaf)?;
            self.buf = leaf.cells.into_iter();
            self.next_leaf = leaf.next_leaf;
        }
    }
}

/// Reverse scan state: the descent stack plus the current leaf's cells,
/// consumed from the back.
pub struct RevScanCursor<T: TreeKind> {
    stack: Vec<(PageIdx, usize)>,
    buf: Vec<(T::Key, T::Val)>,
    lower: Option<(T::Key, bool)>,
    done: bool,
}

impl<T: TreeKind> RevScanCursor<T> {
    pub fn next(
        &mut self,
        tree: &BTree<T>,
        tx: &mut Transaction,
    ) -> Result<Option<(T::Key, T::Val)>> {
        loop {
            if self.done {
                return Ok(None);
            }
            if let Some((k, v)) = self.buf.pop() {
                if let Some((bound, inclusive)) = &self.lower {
                    let past = if *inclusive { k < *bound } else { k <= *bound };
                    if past {
                        self.done = true;
                        return Ok(None);
                    }
                }
                return Ok(Some((k, v)));
            }
            // Ascend to the nearest ancestor with an unvisited left child,
            // then descend to the rightmost leaf under it.
            let mut descend_from = None;
            while let Some((idx, slot)) = self.stack.pop() {
                if slot > 0 {
                    self.stack.push((idx, slot - 1));
                    descend_from = Some(idx);
                    break;
                }
            }
            let from = match descend_from {
                None => {
                    self.done = true;
                    return Ok(None);
                }
                Some(idx) => idx,
            };
            let (_, slot) = *self.stack.last().expect("just pushed");
            let node = tree.read_interior(tx, from)?;
            let mut cur = node.child_at(slot);
            loop {
                match tree.read_any(tx, cur)? {
                    NodeOwned::Leaf(leaf) => {
                        self.buf = leaf.cells;
                        break;
                    }
                    NodeOwned::Interior(node) => {
                        let slot = node.entries.len();
                        let child = node.child_at(slot);
                        self.stack.push((cur, slot));
                        cur = child;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionManager;

    fn setup() -> (tempfile::TempDir, Pager, TransactionManager) {
        let dir = tempfile::tempdir().unwrap();
        let pager = Pager::open(&dir.path().join("t.db"), 500).unwrap();
        (dir, pager, TransactionManager::new())
    }

    fn index_tree<'p>(pager: &'p Pager, tx: &mut Transaction) -> BTree<'p, IndexTree> {
        let root = BTree::<IndexTree>::create_empty(pager, tx).unwrap();
        BTree::new(pager, root)
    }

    fn collect_keys(
        tree: &BTree<IndexTree>,
        tx: &mut Transaction,
        reverse: bool,
    ) -> Vec<i64> {
        let mut out = vec![];
        if reverse {
            let mut c = tree.scan_reverse(tx, None, None).unwrap();
            while let Some((k, _)) = c.next(tree, tx).unwrap() {
                out.push(*k.as_int8().unwrap());
            }
        } else {
            let mut c = tree.scan_forward(tx, None, None).unwrap();
            while let Some((k, _)) = c.next(tree, tx).unwrap() {
                out.push(*k.as_int8().unwrap());
            }
        }
        out
    }

    #[test]
    fn test_insert_get_and_ordered_scan() {
        let (_dir, pager, mgr) = setup();
        let mut tx = mgr.begin();
        let tree = index_tree(&pager, &mut tx);

        // Enough keys, inserted shuffled, to force several splits.
        let mut keys: Vec<i64> = (0..500).collect();
        let len = keys.len();
        for i in 0..len {
            keys.swap(i, (i * 7919) % len);
        }
        for k in &keys {
            tree.insert(&mut tx, Key::Int8(*k), RowIdPayload::single(*k as u64))
                .unwrap();
        }

        for k in &keys {
            let payload = tree.get(&mut tx, &Key::Int8(*k)).unwrap().unwrap();
            assert_eq!(payload.row_ids, vec![*k as u64]);
        }
        assert!(tree.get(&mut tx, &Key::Int8(10_000)).unwrap().is_none());

        let forward = collect_keys(&tree, &mut tx, false);
        assert_eq!(forward, (0..500).collect::<Vec<_>>());
        let reverse = collect_keys(&tree, &mut tx, true);
        assert_eq!(reverse, (0..500).rev().collect::<Vec<_>>());
        assert_eq!(
            tree.seek_last_key(&mut tx).unwrap().unwrap(),
            Key::Int8(499)
        );
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let (_dir, pager, mgr) = setup();
        let mut tx = mgr.begin();
        let tree = index_tree(&pager, &mut tx);
        tree.insert(&mut tx, Key::Int8(1), RowIdPayload::single(1))
            .unwrap();
        assert!(matches!(
            tree.insert(&mut tx, Key::Int8(1), RowIdPayload::single(2)),
            Err(Error::DuplicateKey { .. })
        ));
    }

    #[test]
    fn test_range_scan_bounds() {
        let (_dir, pager, mgr) = setup();
        let mut tx = mgr.begin();
        let tree = index_tree(&pager, &mut tx);
        for k in 0..100_i64 {
            tree.insert(&mut tx, Key::Int8(k), RowIdPayload::single(k as u64))
                .unwrap();
        }
        let mut c = tree
            .scan_forward(
                &mut tx,
                Some((Key::Int8(10), false)),
                Some((Key::Int8(20), true)),
            )
            .unwrap();
        let mut got = vec![];
        while let Some((k, _)) = c.next(&tree, &mut tx).unwrap() {
            got.push(*k.as_int8().unwrap());
        }
        assert_eq!(got, (11..=20).collect::<Vec<_>>());

        let mut c = tree
            .scan_reverse(
                &mut tx,
                Some((Key::Int8(95), true)),
                None,
            )
            .unwrap();
        let mut got = vec![];
        while let Some((k, _)) = c.next(&tree, &mut tx).unwrap() {
            got.push(*k.as_int8().unwrap());
        }
        assert_eq!(got, (95..100).rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_delete_rebalances_and_shrinks() {
        let (_dir, pager, mgr) = setup();
        let mut tx = mgr.begin();
        let tree = index_tree(&pager, &mut tx);
        for k in 0..400_i64 {
            tree.insert(&mut tx, Key::Int8(k), RowIdPayload::single(k as u64))
                .unwrap();
        }
        // Delete everything but a handful, in a mixed order.
        for k in (0..400_i64).step_by(2) {
            tree.delete(&mut tx, &Key::Int8(k)).unwrap();
        }
        for k in (1..395_i64).step_by(2) {
            tree.delete(&mut tx, &Key::Int8(k)).unwrap();
        }
        let left = collect_keys(&tree, &mut tx, false);
        assert_eq!(left, vec![395, 397, 399]);
        // The shrunken tree must still answer point lookups.
        assert!(tree.get(&mut tx, &Key::Int8(397)).unwrap().is_some());
        assert!(tree.get(&mut tx, &Key::Int8(2)).unwrap().is_none());
        assert!(matches!(
            tree.delete(&mut tx, &Key::Int8(2)),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_everything_leaves_empty_root() {
        let (_dir, pager, mgr) = setup();
        let mut tx = mgr.begin();
        let tree = index_tree(&pager, &mut tx);
        for k in 0..300_i64 {
            tree.insert(&mut tx, Key::Int8(k), RowIdPayload::single(k as u64))
                .unwrap();
        }
        for k in 0..300_i64 {
            tree.delete(&mut tx, &Key::Int8(k)).unwrap();
        }
        assert_eq!(collect_keys(&tree, &mut tx, false), Vec::<i64>::new());
        assert!(tree.seek_last_key(&mut tx).unwrap().is_none());
        // And it can be refilled.
        tree.insert(&mut tx, Key::Int8(7), RowIdPayload::single(7))
            .unwrap();
        assert_eq!(collect_keys(&tree, &mut tx, false), vec![7]);
    }

    #[test]
    fn test_string_keys_split_and_scan() {
        let (_dir, pager, mgr) = setup();
        let mut tx = mgr.begin();
        let tree = index_tree(&pager, &mut tx);
        let mut words: Vec<String> = (0..300).map(|i| format!("user_{:05}@example.com", i * 13 % 300)).collect();
        words.sort();
        words.dedup();
        for (i, w) in words.iter().enumerate() {
            tree.insert(&mut tx, Key::Str(w.clone()), RowIdPayload::single(i as u64))
                .unwrap();
        }
        let mut c = tree.scan_forward(&mut tx, None, None).unwrap();
        let mut got = vec![];
        while let Some((k, _)) = c.next(&tree, &mut tx).unwrap() {
            got.push(k.as_str().unwrap().clone());
        }
        assert_eq!(got, words);
    }

    #[test]
    fn test_replace_grows_payload() {
        let (_dir, pager, mgr) = setup();
        let mut tx = mgr.begin();
        let tree = index_tree(&pager, &mut tx);
        tree.insert(&mut tx, Key::Int8(1), RowIdPayload::single(1))
            .unwrap();
        let grown = RowIdPayload {
            row_ids: vec![1, 2, 3, 4],
            overflow: 0,
        };
        tree.replace(&mut tx, &Key::Int8(1), grown.clone()).unwrap();
        assert_eq!(tree.get(&mut tx, &Key::Int8(1)).unwrap().unwrap(), grown);
        assert!(matches!(
            tree.replace(&mut tx, &Key::Int8(9), grown),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_table_tree_round_trip() {
        let (_dir, pager, mgr) = setup();
        let mut tx = mgr.begin();
        let root = BTree::<TableTree>::create_empty(&pager, &mut tx).unwrap();
        let tree: BTree<TableTree> = BTree::new(&pager, root);
        for id in 1..=200_u64 {
            tree.insert(&mut tx, id, RowData(vec![id as u8; 40])).unwrap();
        }
        assert_eq!(tree.seek_last_key(&mut tx).unwrap(), Some(200));
        let got = tree.get(&mut tx, &77).unwrap().unwrap();
        assert_eq!(got.0, vec![77_u8; 40]);
        let mut c = tree.scan_forward(&mut tx, None, None).unwrap();
        let mut n = 0;
        let mut prev = 0;
        while let Some((k, _)) = c.next(&tree, &mut tx).unwrap() {
            assert!(k > prev);
            prev = k;
            n += 1;
        }
        assert_eq!(n, 200);
    }
}
