//! Transactions: read-version sets, write-sets, and the commit protocol.
//!
//! A transaction accumulates page copies in its write-set and the versions
//! it observed in its read-set.  Commit validates the read-set against the
//! current committed versions, journals pre-images, applies the write-set
//! in index order, then truncates the journal and bumps the committed
//! version counter.  Abort is free: the write-set is just dropped.
//!
//! Scheduling is single-threaded cooperative per database handle; at most
//! one writer is active at a time, enforced when a statement first claims
//! the writer slot.

use log::debug;
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::dbheader::DbHeader;
use crate::error::{Error, Result};
use crate::journal::Journal;
use crate::page::Page;
use crate::pager::{PageIdx, Pager};

/// Context token checked at every suspension point (page reads, row
/// emission, journal writes).  Cancelling aborts the surrounding
/// transaction and surfaces [`Error::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Active,
    Committed,
    Aborted,
}

/// State shared by every transaction of one database handle.
#[derive(Debug, Default)]
struct TxShared {
    next_id: Cell<u64>,
    /// Transaction id currently holding the writer slot, if any.
    writer: Cell<Option<u64>>,
}

/// Hands out transactions and enforces the single-writer rule.
#[derive(Default)]
pub struct TransactionManager {
    shared: Rc<TxShared>,
}

impl TransactionManager {
    pub fn new() -> TransactionManager {
        TransactionManager::default()
    }

    pub fn begin(&self) -> Transaction {
        self.begin_with(CancelToken::new())
    }

    pub fn begin_with(&self, cancel: CancelToken) -> Transaction {
        let id = self.shared.next_id.get() + 1;
        self.shared.next_id.set(id);
        Transaction {
            id,
            status: TxStatus::Active,
            read_set: HashMap::new(),
            write_set: BTreeMap::new(),
            header_read: None,
            header_write: None,
            cancel,
            shared: Rc::clone(&self.shared),
        }
    }
}

/// A snapshot of a transaction's mutable state, for statement-level
/// rollback inside an explicit transaction.
pub struct Savepoint {
    read_set: HashMap<PageIdx, u64>,
    write_set: BTreeMap<PageIdx, Page>,
    header_read: Option<u64>,
    header_write: Option<DbHeader>,
}

pub struct Transaction {
    pub(crate) id: u64,
    status: TxStatus,
    /// Page index -> commit version observed at first read.
    read_set: HashMap<PageIdx, u64>,
    /// Page index -> this transaction's modified copy.
    write_set: BTreeMap<PageIdx, Page>,
    header_read: Option<u64>,
    header_write: Option<DbHeader>,
    cancel: CancelToken,
    shared: Rc<TxShared>,
}

impl Transaction {
    pub fn status(&self) -> TxStatus {
        self.status
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn check_cancelled(&self) -> Result<()> {
        self.cancel.check()
    }

    pub(crate) fn record_read(&mut self, idx: PageIdx, version: u64) {
        self.read_set.entry(idx).or_insert(version);
    }

    pub(crate) fn record_write(&mut self, idx: PageIdx, page: Page) {
        self.write_set.insert(idx, page);
    }

    pub(crate) fn get_written(&self, idx: PageIdx) -> Option<&Page> {
        self.write_set.get(&idx)
    }

    pub(crate) fn header_override(&self) -> Option<&DbHeader> {
        self.header_write.as_ref()
    }

    pub(crate) fn set_header(&mut self, h: DbHeader) {
        self.header_write = Some(h);
    }

    pub(crate) fn record_header_read(&mut self, version: u64) {
        self.header_read.get_or_insert(version);
    }

    pub fn is_read_only(&self) -> bool {
        self.write_set.is_empty() && self.header_write.is_none()
    }

    /// Claim the single writer slot for this transaction.  Called before a
    /// mutating statement runs; fails with `Conflict` if another active
    /// transaction already writes.
    pub fn claim_writer(&mut self) -> Result<()> {
        match self.shared.writer.get() {
            Some(id) if id == self.id => Ok(()),
            Some(id) => Err(Error::Conflict(format!(
                "transaction {} already holds the writer slot",
                id
            ))),
            None => {
                self.shared.writer.set(Some(self.id));
                Ok(())
            }
        }
    }

    fn release_writer(&mut self) {
        if self.shared.writer.get() == Some(self.id) {
            self.shared.writer.set(None);
        }
    }

    /// Snapshot for statement-level rollback.
    pub fn savepoint(&self) -> Savepoint {
        Savepoint {
            read_set: self.read_set.clone(),
            write_set: self.write_set.clone(),
            header_read: self.header_read,
            header_write: self.header_write.clone(),
        }
    }

    /// Roll back to a savepoint, undoing everything the statement staged.
    pub fn rollback_to(&mut self, sp: Savepoint) {
        self.read_set = sp.read_set;
        self.write_set = sp.write_set;
        self.header_read = sp.header_read;
        self.header_write = sp.header_write;
    }

    /// The commit protocol of the engine: validate, journal, apply,
    /// truncate.  On validation failure the transaction aborts and the
    /// database is untouched.
    pub fn commit(&mut self, pager: &Pager, journal: &Journal) -> Result<()> {
        if self.status != TxStatus::Active {
            return Err(Error::internal("commit of a finished transaction"));
        }
        if let Err(e) = self.check_cancelled() {
            self.abort();
            return Err(e);
        }
        if self.is_read_only() {
            self.status = TxStatus::Committed;
            self.release_writer();
            return Ok(());
        }

        // 1. Validate: every page (and the header) must still be at the
        //    version this transaction observed.
        let committed = pager.committed_header();
        if let Some(hv) = self.header_read {
            if committed.commit_version != hv {
                self.abort();
                return Err(Error::Conflict(format!(
                    "header moved from version {} to {}",
                    hv, committed.commit_version
                )));
            }
        }
        let mut conflict: Option<(PageIdx, u64, u64)> = None;
        for (idx, v) in &self.read_set {
            let cur = pager.current_version(*idx);
            if cur != *v {
                conflict = Some((*idx, *v, cur));
                break;
            }
        }
        if let Some((idx, v, cur)) = conflict {
            self.abort();
            return Err(Error::Conflict(format!(
                "page {} moved from version {} to {}",
                idx, v, cur
            )));
        }

        // 2. Journal pre-images of every page that exists on disk today.
        let pre_images: Vec<(PageIdx, Vec<u8>)> = self
            .write_set
            .keys()
            .filter(|idx| **idx < committed.page_count)
            .map(|idx| pager.read_page_raw(*idx).map(|b| (*idx, b)))
            .collect::<Result<_>>()?;
        journal.write_commit(&committed.marshal(), &pre_images)?;

        // 3. Apply the write-set and the bumped header.
        let mut header = self.header_write.take().unwrap_or_else(|| committed.clone());
        header.commit_version = committed.commit_version + 1;
        pager.apply_commit(&self.write_set, &header)?;

        // 4. Done; the journal is no longer needed.
        journal.truncate()?;
        debug!(
            "transaction {} committed {} pages at version {}",
            self.id,
            self.write_set.len(),
            header.commit_version
        );
        self.write_set.clear();
        self.read_set.clear();
        self.status = TxStatus::Committed;
        self.release_writer();
        Ok(())
    }

    /// Discard everything.  No disk I/O.
    pub fn abort(&mut self) {
        self.write_set.clear();
        self.read_set.clear();
        self.header_write = None;
        self.header_read = None;
        self.status = TxStatus::Aborted;
        self.release_writer();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.release_writer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::FreePage;

    fn setup() -> (tempfile::TempDir, Pager, Journal, TransactionManager) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let pager = Pager::open(&path, 100).unwrap();
        let journal = Journal::new(&path, true);
        (dir, pager, journal, TransactionManager::new())
    }

    #[test]
    fn test_commit_bumps_version_and_is_visible() {
        let (_dir, pager, journal, mgr) = setup();
        let mut tx = mgr.begin();
        let idx = pager.get_free_page(&mut tx).unwrap();
        pager.put_page(&mut tx, idx, Page::Free(FreePage { next_free: 0 }));
        tx.commit(&pager, &journal).unwrap();
        assert_eq!(tx.status(), TxStatus::Committed);
        assert_eq!(pager.committed_header().commit_version, 1);
        assert_eq!(pager.current_version(idx), 1);

        let mut tx2 = mgr.begin();
        let page = pager.read_page(&mut tx2, idx).unwrap();
        assert!(page.as_free().is_some());
    }

    #[test]
    fn test_conflicting_read_fails_commit() {
        let (_dir, pager, journal, mgr) = setup();

        // t1 reads page 1, then t2 rewrites it and commits first.
        let mut t1 = mgr.begin();
        let _ = pager.read_page(&mut t1, 1).unwrap();

        let mut t2 = mgr.begin();
        let page = pager.read_page(&mut t2, 1).unwrap();
        pager.put_page(&mut t2, 1, page);
        t2.commit(&pager, &journal).unwrap();

        // t1 only conflicts if it writes something; mark it dirty.
        pager.put_page(&mut t1, 2, Page::Free(FreePage { next_free: 0 }));
        let err = t1.commit(&pager, &journal).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(t1.status(), TxStatus::Aborted);
        // t2's commit is still the committed state.
        assert_eq!(pager.committed_header().commit_version, 1);
    }

    #[test]
    fn test_read_only_commit_never_conflicts() {
        let (_dir, pager, journal, mgr) = setup();
        let mut t1 = mgr.begin();
        let _ = pager.read_page(&mut t1, 1).unwrap();

        let mut t2 = mgr.begin();
        let page = pager.read_page(&mut t2, 1).unwrap();
        pager.put_page(&mut t2, 1, page);
        t2.commit(&pager, &journal).unwrap();

        t1.commit(&pager, &journal).unwrap();
        assert_eq!(t1.status(), TxStatus::Committed);
    }

    #[test]
    fn test_abort_discards_everything() {
        let (_dir, pager, journal, mgr) = setup();
        let before = pager.committed_header();
        let mut tx = mgr.begin();
        let idx = pager.get_free_page(&mut tx).unwrap();
        pager.put_page(&mut tx, idx, Page::Free(FreePage { next_free: 0 }));
        tx.abort();
        assert_eq!(pager.committed_header(), before);

        let mut tx2 = mgr.begin();
        let fresh = pager.get_free_page(&mut tx2).unwrap();
        assert_eq!(fresh, idx, "aborted allocation must not leak");
        drop(tx2);
        let _ = journal;
    }

    #[test]
    fn test_single_writer_slot() {
        let (_dir, _pager, _journal, mgr) = setup();
        let mut t1 = mgr.begin();
        let mut t2 = mgr.begin();
        t1.claim_writer().unwrap();
        assert!(matches!(t2.claim_writer(), Err(Error::Conflict(_))));
        t1.abort();
        t2.claim_writer().unwrap();
    }

    #[test]
    fn test_cancelled_commit_aborts() {
        let (_dir, pager, journal, mgr) = setup();
        let mut tx = mgr.begin();
        pager.put_page(&mut tx, 1, Page::Free(FreePage { next_free: 0 }));
        tx.cancel_token().cancel();
        assert!(matches!(
            tx.commit(&pager, &journal),
            Err(Error::Cancelled)
        ));
        assert_eq!(tx.status(), TxStatus::Aborted);
    }

    #[test]
    fn test_savepoint_rolls_back_statement() {
        let (_dir, pager, journal, mgr) = setup();
        let mut tx = mgr.begin();
        pager.put_page(&mut tx, 1, Page::Free(FreePage { next_free: 7 }));
        let sp = tx.savepoint();
        pager.put_page(&mut tx, 2, Page::Free(FreePage { next_free: 8 }));
        tx.rollback_to(sp);
        assert!(tx.get_written(1).is_some());
        assert!(tx.get_written(2).is_none());
        tx.commit(&pager, &journal).unwrap();
    }
}
