//! Overflow chains: extra row-IDs for non-unique index cells and long
//! text payloads.
//!
//! Both page kinds share the shape `{next-page, count/size, items…}` and
//! are walked one page at a time through the pager, so chain length is
//! bounded only by the free space in the file.

use log::trace;

use crate::btree::RowId;
use crate::error::{Error, Result};
use crate::page::Page;
use crate::pager::{PageIdx, Pager, PAGE_SIZE};
use crate::transaction::Transaction;

/// Row-IDs per index-overflow page: the page minus tag, next pointer and
/// count.
pub const MAX_OVERFLOW_ROW_IDS_PER_PAGE: usize = (PAGE_SIZE - 1 - 4 - 4) / 8;

/// Text bytes per text-overflow page: the page minus tag, next pointer and
/// size field.
pub const MAX_TEXT_PER_PAGE: usize = PAGE_SIZE - 1 - 4 - 4;

/// `{next-page, count, row-IDs…}`, filled in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RowIdOverflow {
    pub next: PageIdx,
    pub row_ids: Vec<RowId>,
}

/// `{next-page, data-size, bytes…}` holding a slice of one text value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextOverflow {
    pub next: PageIdx,
    pub data: Vec<u8>,
}

/// Allocate a chain holding `bytes` and return its head page index.
/// `ceil(len / MAX_TEXT_PER_PAGE)` pages, exactly `len` bytes in total;
/// the empty string needs no pages and yields head 0.
pub fn alloc_text_chain(pager: &Pager, tx: &mut Transaction, bytes: &[u8]) -> Result<PageIdx> {
    let mut next = 0;
    // Build back to front so each page already knows its successor.
    for chunk in bytes.chunks(MAX_TEXT_PER_PAGE).rev() {
        let idx = pager.get_free_page(tx)?;
        pager.put_page(
            tx,
            idx,
            Page::TextOverflow(TextOverflow {
                next,
                data: chunk.to_vec(),
            }),
        );
        next = idx;
    }
    trace!("text chain of {} bytes starts at page {}", bytes.len(), next);
    Ok(next)
}

/// Read a whole text chain back.  The stored byte count must equal `len`.
pub fn read_text_chain(
    pager: &Pager,
    tx: &mut Transaction,
    first: PageIdx,
    len: u32,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len as usize);
    let mut cur = first;
    let max_pages = (len as usize).div_ceil(MAX_TEXT_PER_PAGE) + 1;
    let mut seen = 0;
    while cur != 0 {
        seen += 1;
        if seen > max_pages {
            return Err(Error::CorruptPage {
                page: cur,
                detail: String::from("text overflow chain longer than its length field"),
            });
        }
        let page = pager.read_page(tx, cur)?;
        let node = page.as_text_overflow().ok_or_else(|| Error::CorruptPage {
            page: cur,
            detail: String::from("expected text overflow page"),
        })?;
        out.extend_from_slice(&node.data);
        cur = node.next;
    }
    if out.len() != len as usize {
        return Err(Error::CorruptPage {
            page: first,
            detail: format!("text chain held {} bytes, expected {}", out.len(), len),
        });
    }
    Ok(out)
}

/// Release every page of a text chain to the free list.
pub fn free_text_chain(pager: &Pager, tx: &mut Transaction, first: PageIdx) -> Result<()> {
    let mut cur = first;
    while cur != 0 {
        let page = pager.read_page(tx, cur)?;
        let next = page
            .as_text_overflow()
            .ok_or_else(|| Error::CorruptPage {
                page: cur,
                detail: String::from("expected text overflow page"),
            })?
            .next;
        pager.release_page(tx, cur)?;
        cur = next;
    }
    Ok(())
}

fn read_rowid_page(pager: &Pager, tx: &mut Transaction, idx: PageIdx) -> Result<RowIdOverflow> {
    let page = pager.read_page(tx, idx)?;
    page.as_index_overflow()
        .cloned()
        .ok_or_else(|| Error::CorruptPage {
            page: idx,
            detail: String::from("expected index overflow page"),
        })
}

/// Append one row-ID to the chain starting at `head`, chaining a fresh
/// page when the tail is full.
pub fn append_row_id(
    pager: &Pager,
    tx: &mut Transaction,
    head: PageIdx,
    row_id: RowId,
) -> Result<()> {
    let mut cur = head;
    loop {
        let mut node = read_rowid_page(pager, tx, cur)?;
        if node.next != 0 {
            cur = node.next;
            continue;
        }
        if node.row_ids.len() < MAX_OVERFLOW_ROW_IDS_PER_PAGE {
            node.row_ids.push(row_id);
            pager.put_page(tx, cur, Page::IndexOverflow(node));
            return Ok(());
        }
        let fresh = pager.get_free_page(tx)?;
        pager.put_page(
            tx,
            fresh,
            Page::IndexOverflow(RowIdOverflow {
                next: 0,
                row_ids: vec![row_id],
            }),
        );
        node.next = fresh;
        pager.put_page(tx, cur, Page::IndexOverflow(node));
        return Ok(());
    }
}

/// Start a new chain holding a single row-ID; returns its head.
pub fn new_rowid_chain(pager: &Pager, tx: &mut Transaction, row_id: RowId) -> Result<PageIdx> {
    let idx = pager.get_free_page(tx)?;
    pager.put_page(
        tx,
        idx,
        Page::IndexOverflow(RowIdOverflow {
            next: 0,
            row_ids: vec![row_id],
        }),
    );
    Ok(idx)
}

/// All row-IDs of the chain, in insertion order.
pub fn collect_row_ids(pager: &Pager, tx: &mut Transaction, head: PageIdx) -> Result<Vec<RowId>> {
    let mut out = vec![];
    let mut cur = head;
    while cur != 0 {
        let node = read_rowid_page(pager, tx, cur)?;
        out.extend_from_slice(&node.row_ids);
        cur = node.next;
    }
    Ok(out)
}

/// Remove one row-ID from the chain.  Pages that empty out are unlinked
/// and released.  Returns the new head (0 once the chain is gone) and
/// whether the id was found.
pub fn remove_row_id(
    pager: &Pager,
    tx: &mut Transaction,
    head: PageIdx,
    row_id: RowId,
) -> Result<(PageIdx, bool)> {
    let mut prev: Option<PageIdx> = None;
    let mut cur = head;
    while cur != 0 {
        let mut node = read_rowid_page(pager, tx, cur)?;
        if let Some(pos) = node.row_ids.iter().position(|id| *id == row_id) {
            node.row_ids.remove(pos);
            if node.row_ids.is_empty() {
                let next = node.next;
                pager.release_page(tx, cur)?;
                match prev {
                    None => return Ok((next, true)),
                    Some(p) => {
                        let mut prev_node = read_rowid_page(pager, tx, p)?;
                        prev_node.next = next;
                        pager.put_page(tx, p, Page::IndexOverflow(prev_node));
                        return Ok((head, true));
                    }
                }
            }
            pager.put_page(tx, cur, Page::IndexOverflow(node));
            return Ok((head, true));
        }
        prev = Some(cur);
        cur = node.next;
    }
    Ok((head, false))
}

/// Release every page of a row-ID chain.
pub fn free_rowid_chain(pager: &Pager, tx: &mut Transaction, head: PageIdx) -> Result<()> {
    let mut cur = head;
    while cur != 0 {
        let node = read_rowid_page(pager, tx, cur)?;
        pager.release_page(tx, cur)?;
        cur = node.next;
    }
    Ok(())
}
