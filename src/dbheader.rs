//! The database header stored in page 0.
//!
//! Layout (little-endian):
//! `magic[8] | version[4] | page_size[4] | page_count[4] |
//!  free_list_head[4] | commit_version[8] | catalog_root[4] | reserved…`
//!
//! The file records its page size; this build only accepts files whose
//! recorded size matches the compile-time constant.

use std::io::Cursor;

use crate::codec;
use crate::error::{Error, Result};
use crate::pager::{PageIdx, PAGE_SIZE};

pub const MAGIC: &[u8; 8] = b"minisql1";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbHeader {
    pub page_size: u32,
    pub page_count: u32,
    /// Head of the free-page list, 0 for none.
    pub free_list_head: PageIdx,
    /// Bumped once per successful commit; also the version stamped onto
    /// every page a commit writes.
    pub commit_version: u64,
    /// Root page of the `minisql_master` btree.
    pub catalog_root: PageIdx,
}

impl DbHeader {
    /// Header of a freshly created database: page 0 is this header, page 1
    /// the empty catalog root.
    pub fn fresh() -> DbHeader {
        DbHeader {
            page_size: PAGE_SIZE as u32,
            page_count: 2,
            free_list_head: 0,
            commit_version: 0,
            catalog_root: 1,
        }
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PAGE_SIZE);
        buf.extend_from_slice(MAGIC);
        codec::write_u32(&mut buf, FORMAT_VERSION);
        codec::write_u32(&mut buf, self.page_size);
        codec::write_u32(&mut buf, self.page_count);
        codec::write_u32(&mut buf, self.free_list_head);
        codec::write_u64(&mut buf, self.commit_version);
        codec::write_u32(&mut buf, self.catalog_root);
        buf.resize(PAGE_SIZE, 0);
        buf
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<DbHeader> {
        if bytes.len() < 36 {
            return Err(Error::corrupt("database header page too short"));
        }
        if &bytes[..8] != MAGIC {
            return Err(Error::corrupt(format!(
                "bad magic {}",
                hex::encode(&bytes[..8])
            )));
        }
        let mut c = Cursor::new(&bytes[8..]);
        let version = codec::read_u32(&mut c)?;
        if version != FORMAT_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported format version {}",
                version
            )));
        }
        let page_size = codec::read_u32(&mut c)?;
        if page_size != PAGE_SIZE as u32 {
            return Err(Error::corrupt(format!(
                "file has {}-byte pages, this build uses {}",
                page_size, PAGE_SIZE
            )));
        }
        let page_count = codec::read_u32(&mut c)?;
        let free_list_head = codec::read_u32(&mut c)?;
        let commit_version = codec::read_u64(&mut c)?;
        let catalog_root = codec::read_u32(&mut c)?;
        if page_count < 2 || catalog_root == 0 || catalog_root >= page_count {
            return Err(Error::corrupt("inconsistent header counts"));
        }
        if free_list_head >= page_count {
            return Err(Error::corrupt("free list head beyond file"));
        }
        Ok(DbHeader {
            page_size,
            page_count,
            free_list_head,
            commit_version,
            catalog_root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let hdr = DbHeader {
            page_size: PAGE_SIZE as u32,
            page_count: 17,
            free_list_head: 9,
            commit_version: 42,
            catalog_root: 1,
        };
        let buf = hdr.marshal();
        assert_eq!(buf.len(), PAGE_SIZE);
        assert_eq!(DbHeader::unmarshal(&buf).unwrap(), hdr);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut buf = DbHeader::fresh().marshal();
        buf[0] = b'X';
        assert!(matches!(
            DbHeader::unmarshal(&buf),
            Err(Error::CorruptPage { .. })
        ));
    }

    #[test]
    fn test_wrong_page_size_rejected() {
        let mut hdr = DbHeader::fresh();
        hdr.page_size = 8192;
        assert!(DbHeader::unmarshal(&hdr.marshal()).is_err());
    }
}
