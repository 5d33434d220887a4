//! Index maintenance: casting row values into tree keys and keeping the
//! unique / non-unique row-ID payloads in shape.
//!
//! Unique (and primary-key) cells carry exactly one row-ID.  Non-unique
//! cells carry a small inline array that spills into a chained overflow
//! page when full; `find_row_ids` returns inline then chain, preserving
//! insertion order.  NULL handling follows SQL: a unique index simply
//! skips rows with any NULL indexed column, a non-unique index stores
//! NULL as a distinct key.

use crate::btree::node::RowIdPayload;
use crate::btree::tree::{BTree, IndexTree};
use crate::btree::RowId;
use crate::catalog::{IndexDef, IndexKind, TableSchema};
use crate::error::{Error, Result};
use crate::key::{CompositeKey, Key};
use crate::overflow;
use crate::pager::Pager;
use crate::sql_value::SqlValue;
use crate::transaction::Transaction;

/// Runtime handle for one index.
pub struct Index<'p> {
    pub def: IndexDef,
    pager: &'p Pager,
}

impl<'p> Index<'p> {
    pub fn new(pager: &'p Pager, def: IndexDef) -> Index<'p> {
        Index { def, pager }
    }

    pub fn tree(&self) -> BTree<'p, IndexTree> {
        BTree::new(self.pager, self.def.root)
    }

    fn duplicate(&self, key: &Key) -> Error {
        Error::DuplicateKey {
            index: self.def.name.clone(),
            key: format!("{:?}", key),
        }
    }

    /// Build this index's key for a row, or `None` when the row is not
    /// indexed (unique index with a NULL column).
    pub fn key_for_row(&self, schema: &TableSchema, values: &[SqlValue]) -> Result<Option<Key>> {
        let mut fields = Vec::with_capacity(self.def.columns.len());
        for col in &self.def.columns {
            let pos = schema.column_index(col)?;
            let field = Key::from_value(&values[pos]);
            if field.is_null() && self.def.kind != IndexKind::Secondary {
                return Ok(None);
            }
            fields.push(field);
        }
        let key = if fields.len() == 1 {
            fields.pop().expect("one field")
        } else {
            Key::Composite(CompositeKey::new(fields))
        };
        if key.byte_size() > crate::MAX_INDEX_KEY_SIZE {
            return Err(Error::validation(format!(
                "key for index {} is {} bytes, limit {}",
                self.def.name,
                key.byte_size(),
                crate::MAX_INDEX_KEY_SIZE
            )));
        }
        Ok(Some(key))
    }

    /// Add `(key, row_id)`.  Duplicate keys fail unique indexes and grow
    /// the row-ID list of non-unique ones.
    pub fn insert_entry(&self, tx: &mut Transaction, key: &Key, row_id: RowId) -> Result<()> {
        let tree = self.tree();
        if self.def.kind != IndexKind::Secondary {
            return tree
                .insert(tx, key.clone(), RowIdPayload::single(row_id))
                .map_err(|e| match e {
                    Error::DuplicateKey { .. } => self.duplicate(key),
                    other => other,
                });
        }
        match tree.get(tx, key)? {
            None => tree.insert(tx, key.clone(), RowIdPayload::single(row_id)),
            Some(mut payload) => {
                if payload.overflow != 0 {
                    // Inline slots stay frozen once a chain exists, so the
                    // concatenated order stays the insertion order.
                    overflow::append_row_id(self.pager, tx, payload.overflow, row_id)?;
                    Ok(())
                } else if payload.row_ids.len() < crate::MAX_INLINE_ROW_IDS {
                    payload.row_ids.push(row_id);
                    tree.replace(tx, key, payload)
                } else {
                    payload.overflow = overflow::new_rowid_chain(self.pager, tx, row_id)?;
                    tree.replace(tx, key, payload)
                }
            }
        }
    }

    /// Remove one `(key, row_id)` pairing; the cell goes away with its
    /// last row-ID.
    pub fn delete_entry(&self, tx: &mut Transaction, key: &Key, row_id: RowId) -> Result<()> {
        let tree = self.tree();
        let mut payload = tree
            .get(tx, key)?
            .ok_or_else(|| Error::NotFound(format!("key {:?} in index {}", key, self.def.name)))?;

        if let Some(pos) = payload.row_ids.iter().position(|id| *id == row_id) {
            payload.row_ids.remove(pos);
        } else if payload.overflow != 0 {
            let (new_head, found) =
                overflow::remove_row_id(self.pager, tx, payload.overflow, row_id)?;
            if !found {
                return Err(Error::NotFound(format!(
                    "row {} under key {:?} in index {}",
                    row_id, key, self.def.name
                )));
            }
            payload.overflow = new_head;
        } else {
            return Err(Error::NotFound(format!(
                "row {} under key {:?} in index {}",
                row_id, key, self.def.name
            )));
        }

        if payload.is_empty() {
            tree.delete(tx, key)?;
        } else {
            tree.replace(tx, key, payload)?;
        }
        Ok(())
    }

    /// All row-IDs under `key`, inline first then the overflow chain.
    /// A missing key is `NotFound`; point-scan callers recover by
    /// skipping it.
    pub fn find_row_ids(&self, tx: &mut Transaction, key: &Key) -> Result<Vec<RowId>> {
        let tree = self.tree();
        let payload = tree
            .get(tx, key)?
            .ok_or_else(|| Error::NotFound(format!("key {:?} in index {}", key, self.def.name)))?;
        self.row_ids_of(tx, &payload)
    }

    /// Expand a cell payload into its full row-ID list.
    pub fn row_ids_of(&self, tx: &mut Transaction, payload: &RowIdPayload) -> Result<Vec<RowId>> {
        let mut ids = payload.row_ids.clone();
        if payload.overflow != 0 {
            ids.extend(overflow::collect_row_ids(self.pager, tx, payload.overflow)?);
        }
        Ok(ids)
    }

    /// Release the index's pages: every overflow chain, then the tree.
    pub fn free_storage(&self, tx: &mut Transaction) -> Result<()> {
        let tree = self.tree();
        let mut heads = vec![];
        let mut cursor = tree.scan_forward(tx, None, None)?;
        while let Some((_, payload)) = cursor.next(&tree, tx)? {
            if payload.overflow != 0 {
                heads.push(payload.overflow);
            }
        }
        for head in heads {
            overflow::free_rowid_chain(self.pager, tx, head)?;
        }
        free_tree_pages(self.pager, tx, self.def.root)
    }
}

/// Release every node page of a tree, the root included.
pub fn free_tree_pages(pager: &Pager, tx: &mut Transaction, root: u32) -> Result<()> {
    let mut stack = vec![root];
    while let Some(idx) = stack.pop() {
        let page = pager.read_page(tx, idx)?;
        match &page {
            crate::page::Page::TableInterior(n) => {
                for s in 0..n.child_count() {
                    stack.push(n.child_at(s));
                }
            }
            crate::page::Page::IndexInterior(n) => {
                for s in 0..n.child_count() {
                    stack.push(n.child_at(s));
                }
            }
            crate::page::Page::TableLeaf(_) | crate::page::Page::IndexLeaf(_) => {}
            other => {
                return Err(Error::CorruptPage {
                    page: idx,
                    detail: format!("{} page inside a btree", other.type_name()),
                })
            }
        }
        pager.release_page(tx, idx)?;
    }
    Ok(())
}
