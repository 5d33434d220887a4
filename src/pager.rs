//! Maps page indexes to typed pages through a bounded in-memory cache.
//!
//! The pager owns the database file and the committed state: the decoded
//! page cache (LRU, bounded by `max_cached_pages`), the committed header,
//! and the per-page commit versions used for conflict validation.  Pages a
//! transaction modifies never live here -- they sit in the transaction's
//! write-set until commit, so eviction never has anything to write back.
//!
//! Allocation pops the free-list head or extends the file; release pushes
//! onto the free list.  Both go through the transaction's header copy, so
//! an abort forgets them along with everything else.

use log::{debug, trace};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::dbheader::DbHeader;
use crate::error::{Error, Result};
use crate::page::Page;
use crate::transaction::Transaction;

/// Page indexes are 0-based; page 0 is the database header.
pub type PageIdx = u32;

pub const PAGE_SIZE: usize = 4096;

struct CacheEntry {
    page: Page,
    last_used: u64,
}

struct PageCache {
    map: HashMap<PageIdx, CacheEntry>,
    capacity: usize,
    tick: u64,
}

impl PageCache {
    fn touch(&mut self, idx: PageIdx) -> Option<Page> {
        self.tick += 1;
        let tick = self.tick;
        self.map.get_mut(&idx).map(|e| {
            e.last_used = tick;
            e.page.clone()
        })
    }

    fn insert(&mut self, idx: PageIdx, page: Page) {
        self.tick += 1;
        let tick = self.tick;
        self.map.insert(
            idx,
            CacheEntry {
                page,
                last_used: tick,
            },
        );
        // Cached pages are always clean, so eviction is just forgetting.
        while self.map.len() > self.capacity {
            let oldest = self
                .map
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(idx, _)| *idx)
                .expect("non-empty cache");
            trace!("evicting page {} from cache", oldest);
            self.map.remove(&oldest);
        }
    }
}

/// One pager per open database file.
pub struct Pager {
    file: RefCell<File>,
    cache: RefCell<PageCache>,
    /// Commit version that last wrote each page; absent means untouched
    /// since open, which both sides of a validation see as 0.
    versions: RefCell<HashMap<PageIdx, u64>>,
    header: RefCell<DbHeader>,
}

impl Pager {
    /// Open or create the database file.  A zero-length file is
    /// bootstrapped with a fresh header and an empty catalog root.
    pub fn open(path: &Path, max_cached_pages: usize) -> Result<Pager> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        let header = if len == 0 {
            debug!("creating database at {}", path.display());
            let header = DbHeader::fresh();
            file.write_all(&header.marshal())?;
            let catalog_root = Page::TableLeaf(crate::btree::node::LeafNode::empty_root());
            file.write_all(&catalog_root.marshal()?)?;
            file.sync_all()?;
            header
        } else {
            let mut buf = vec![0_u8; PAGE_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            DbHeader::unmarshal(&buf).map_err(|e| e.at_page(0))?
        };
        Ok(Pager {
            file: RefCell::new(file),
            cache: RefCell::new(PageCache {
                map: HashMap::new(),
                capacity: max_cached_pages.max(1),
                tick: 0,
            }),
            versions: RefCell::new(HashMap::new()),
            header: RefCell::new(header),
        })
    }

    /// The transaction's view of a page: its own modified copy if present,
    /// else the committed copy (recording a read-version).
    pub fn read_page(&self, tx: &mut Transaction, idx: PageIdx) -> Result<Page> {
        tx.check_cancelled()?;
        if idx == 0 {
            return Err(Error::internal("page 0 read as a node page"));
        }
        if let Some(page) = tx.get_written(idx) {
            return Ok(page.clone());
        }
        if let Some(page) = self.cache.borrow_mut().touch(idx) {
            tx.record_read(idx, self.current_version(idx));
            return Ok(page);
        }
        let page = self.read_page_from_file(idx)?;
        debug!("page {} read from file ({})", idx, page.type_name());
        self.cache.borrow_mut().insert(idx, page.clone());
        tx.record_read(idx, self.current_version(idx));
        Ok(page)
    }

    /// Record a modified copy in the transaction's write-set.  The first
    /// call for a page index is what copies it out of the shared state.
    pub fn put_page(&self, tx: &mut Transaction, idx: PageIdx, page: Page) {
        tx.record_write(idx, page);
    }

    /// Pop the free-list head, or extend the file.  The returned index has
    /// no content yet; the caller decides the page type with `put_page`.
    pub fn get_free_page(&self, tx: &mut Transaction) -> Result<PageIdx> {
        tx.check_cancelled()?;
        let mut h = self.header_for(tx);
        if h.free_list_head != 0 {
            let idx = h.free_list_head;
            let page = self.read_page(tx, idx)?;
            let free = page.as_free().ok_or_else(|| Error::CorruptPage {
                page: idx,
                detail: format!("free-list head is a {} page", page.type_name()),
            })?;
            h.free_list_head = free.next_free;
            tx.set_header(h);
            trace!("allocated page {} from free list", idx);
            return Ok(idx);
        }
        let idx = h.page_count;
        h.page_count += 1;
        tx.set_header(h);
        trace!("allocated page {} by extending the file", idx);
        Ok(idx)
    }

    /// Push a page onto the free list.
    pub fn release_page(&self, tx: &mut Transaction, idx: PageIdx) -> Result<()> {
        let mut h = self.header_for(tx);
        self.put_page(
            tx,
            idx,
            Page::Free(crate::page::FreePage {
                next_free: h.free_list_head,
            }),
        );
        h.free_list_head = idx;
        tx.set_header(h);
        trace!("released page {} to free list", idx);
        Ok(())
    }

    /// The transaction's view of the database header, recording the header
    /// read-version on first access.
    pub fn header_for(&self, tx: &mut Transaction) -> DbHeader {
        if let Some(h) = tx.header_override() {
            return h.clone();
        }
        let committed = self.header.borrow().clone();
        tx.record_header_read(committed.commit_version);
        committed
    }

    pub(crate) fn committed_header(&self) -> DbHeader {
        self.header.borrow().clone()
    }

    pub(crate) fn current_version(&self, idx: PageIdx) -> u64 {
        self.versions.borrow().get(&idx).copied().unwrap_or(0)
    }

    /// Raw on-disk bytes of a page, for journal pre-images.  Page indexes
    /// at or beyond the current file tail have no pre-image.
    pub(crate) fn read_page_raw(&self, idx: PageIdx) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; PAGE_SIZE];
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(idx as u64 * PAGE_SIZE as u64))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_page_from_file(&self, idx: PageIdx) -> Result<Page> {
        if idx >= self.header.borrow().page_count {
            return Err(Error::internal(format!(
                "page {} beyond the {}-page file",
                idx,
                self.header.borrow().page_count
            )));
        }
        let buf = self.read_page_raw(idx)?;
        Page::unmarshal(&buf).map_err(|e| e.at_page(idx))
    }

    /// Write a validated commit: every page of the write-set in index
    /// order, then the new header; fsync once.  Updates the cache, the
    /// per-page versions and the committed header.
    pub(crate) fn apply_commit(
        &self,
        pages: &std::collections::BTreeMap<PageIdx, Page>,
        header: &DbHeader,
    ) -> Result<()> {
        {
            let mut file = self.file.borrow_mut();
            for (idx, page) in pages {
                let buf = page.marshal()?;
                file.seek(SeekFrom::Start(*idx as u64 * PAGE_SIZE as u64))?;
                file.write_all(&buf)?;
            }
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&header.marshal())?;
            file.sync_all()?;
        }
        let mut cache = self.cache.borrow_mut();
        let mut versions = self.versions.borrow_mut();
        for (idx, page) in pages {
            cache.insert(*idx, page.clone());
            versions.insert(*idx, header.commit_version);
        }
        *self.header.borrow_mut() = header.clone();
        Ok(())
    }
}
