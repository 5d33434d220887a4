//! Write-ahead journal for crash recovery.
//!
//! Before a commit touches the database file, the pre-image of every page
//! it will overwrite (and of the header) is written to the sibling
//! `<db>.journal` file and fsynced.  After the commit lands, the journal
//! is truncated.  On startup a complete journal is replayed -- the
//! interrupted commit is rolled back -- and an incomplete one (no valid
//! trailer) is discarded, since the database file was not yet touched.
//!
//! Layout: `magic[8] | count[4] | header page | (idx[4] | page)*count |
//! trailer_magic[8] | length[8]`, where `length` covers everything before
//! the trailer.

use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::codec;
use crate::error::Result;
use crate::pager::{PageIdx, PAGE_SIZE};

const MAGIC: &[u8; 8] = b"msqljnl1";
const TRAILER: &[u8; 8] = b"msqljend";

pub struct Journal {
    path: PathBuf,
    enabled: bool,
}

pub fn journal_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(".journal");
    PathBuf::from(name)
}

fn sync_parent_dir(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            File::open(dir)?.sync_all()?;
        }
    }
    Ok(())
}

impl Journal {
    pub fn new(db_path: &Path, enabled: bool) -> Journal {
        Journal {
            path: journal_path(db_path),
            enabled,
        }
    }

    /// Write one commit's pre-images and fsync them down before the
    /// database file is touched.
    pub fn write_commit(
        &self,
        header_pre_image: &[u8],
        pre_images: &[(PageIdx, Vec<u8>)],
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut buf = Vec::with_capacity((pre_images.len() + 2) * PAGE_SIZE);
        buf.extend_from_slice(MAGIC);
        codec::write_u32(&mut buf, pre_images.len() as u32);
        buf.extend_from_slice(header_pre_image);
        for (idx, bytes) in pre_images {
            codec::write_u32(&mut buf, *idx);
            buf.extend_from_slice(bytes);
        }
        let body_len = buf.len() as u64;
        buf.extend_from_slice(TRAILER);
        codec::write_u64(&mut buf, body_len);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        sync_parent_dir(&self.path)?;
        debug!(
            "journal holds {} pre-images ({} bytes)",
            pre_images.len(),
            buf.len()
        );
        Ok(())
    }

    /// Truncate after a durable commit (or at clean shutdown).
    pub fn truncate(&self) -> Result<()> {
        if !self.enabled || !self.path.exists() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.sync_all()?;
        sync_parent_dir(&self.path)?;
        Ok(())
    }
}

/// Parsed journal contents: the header pre-image and the page pre-images.
struct JournalRecord {
    header: Vec<u8>,
    pages: Vec<(PageIdx, Vec<u8>)>,
}

fn parse(buf: &[u8]) -> Option<JournalRecord> {
    if buf.len() < 8 + 4 + PAGE_SIZE + 8 + 8 {
        return None;
    }
    if &buf[..8] != MAGIC {
        return None;
    }
    let count = u32::from_le_bytes(buf[8..12].try_into().ok()?) as usize;
    let body_len = 8 + 4 + PAGE_SIZE + count * (4 + PAGE_SIZE);
    if buf.len() != body_len + 8 + 8 {
        return None;
    }
    if &buf[body_len..body_len + 8] != TRAILER {
        return None;
    }
    let recorded = u64::from_le_bytes(buf[body_len + 8..body_len + 16].try_into().ok()?);
    if recorded != body_len as u64 {
        return None;
    }
    let header = buf[12..12 + PAGE_SIZE].to_vec();
    let mut pages = Vec::with_capacity(count);
    let mut off = 12 + PAGE_SIZE;
    for _ in 0..count {
        let idx = u32::from_le_bytes(buf[off..off + 4].try_into().ok()?);
        pages.push((idx, buf[off + 4..off + 4 + PAGE_SIZE].to_vec()));
        off += 4 + PAGE_SIZE;
    }
    Some(JournalRecord { header, pages })
}

/// Run before any other I/O on the database: replay a complete journal,
/// discard an incomplete one.  Returns whether a replay happened.
pub fn recover(db_path: &Path) -> Result<bool> {
    let jpath = journal_path(db_path);
    let buf = match std::fs::read(&jpath) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if buf.is_empty() {
        return Ok(false);
    }
    let record = match parse(&buf) {
        Some(r) => r,
        None => {
            // The in-flight commit never finished journalling, so the
            // database file is untouched; drop the torn journal.
            warn!("discarding incomplete journal {}", jpath.display());
            let file = OpenOptions::new().write(true).truncate(true).open(&jpath)?;
            file.sync_all()?;
            return Ok(false);
        }
    };
    debug!(
        "replaying journal: header + {} pages into {}",
        record.pages.len(),
        db_path.display()
    );
    let mut db = OpenOptions::new().read(true).write(true).open(db_path)?;
    for (idx, bytes) in &record.pages {
        db.seek(SeekFrom::Start(*idx as u64 * PAGE_SIZE as u64))?;
        db.write_all(bytes)?;
    }
    db.seek(SeekFrom::Start(0))?;
    db.write_all(&record.header)?;
    db.sync_all()?;
    let file = OpenOptions::new().write(true).truncate(true).open(&jpath)?;
    file.sync_all()?;
    sync_parent_dir(&jpath)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_of(byte: u8) -> Vec<u8> {
        vec![byte; PAGE_SIZE]
    }

    #[test]
    fn test_complete_journal_replays() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("x.db");
        std::fs::write(&db_path, [page_of(0xAA), page_of(0xBB)].concat()).unwrap();

        let journal = Journal::new(&db_path, true);
        journal
            .write_commit(&page_of(0x11), &[(1, page_of(0x22))])
            .unwrap();

        // Simulate the crash: the commit overwrote the file but never
        // truncated the journal.
        std::fs::write(&db_path, [page_of(0xFF), page_of(0xFF)].concat()).unwrap();

        assert!(recover(&db_path).unwrap());
        let bytes = std::fs::read(&db_path).unwrap();
        assert_eq!(&bytes[..PAGE_SIZE], page_of(0x11).as_slice());
        assert_eq!(&bytes[PAGE_SIZE..], page_of(0x22).as_slice());
        assert_eq!(std::fs::metadata(journal_path(&db_path)).unwrap().len(), 0);
    }

    #[test]
    fn test_torn_journal_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("x.db");
        std::fs::write(&db_path, page_of(0xAA)).unwrap();

        let journal = Journal::new(&db_path, true);
        journal
            .write_commit(&page_of(0x11), &[(1, page_of(0x22))])
            .unwrap();
        // Chop the trailer off.
        let jpath = journal_path(&db_path);
        let full = std::fs::read(&jpath).unwrap();
        std::fs::write(&jpath, &full[..full.len() - 10]).unwrap();

        assert!(!recover(&db_path).unwrap());
        // Database untouched, journal emptied.
        assert_eq!(std::fs::read(&db_path).unwrap(), page_of(0xAA));
        assert_eq!(std::fs::metadata(&jpath).unwrap().len(), 0);
    }

    #[test]
    fn test_empty_or_missing_journal_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("x.db");
        std::fs::write(&db_path, page_of(0xAA)).unwrap();
        assert!(!recover(&db_path).unwrap());
        std::fs::write(journal_path(&db_path), b"").unwrap();
        assert!(!recover(&db_path).unwrap());
    }
}
