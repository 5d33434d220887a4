//! The typed page model: every non-free page begins with a one-byte type
//! tag, and the remainder decodes into one of these variants.
//!
//! The pager deals in `Page` values; marshal/unmarshal to the fixed-size
//! on-disk buffer happens here, dispatching on the tag byte.

use enum_as_inner::EnumAsInner;
use std::io::Cursor;

use crate::btree::node::{InteriorNode, LeafNode, RowIdPayload};
use crate::btree::RowId;
use crate::codec;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::overflow::{RowIdOverflow, TextOverflow};
use crate::pager::{PageIdx, PAGE_SIZE};
use crate::row::RowData;

pub const TAG_TABLE_LEAF: u8 = 1;
pub const TAG_TABLE_INTERIOR: u8 = 2;
pub const TAG_INDEX_LEAF: u8 = 3;
pub const TAG_INDEX_INTERIOR: u8 = 4;
pub const TAG_INDEX_OVERFLOW: u8 = 5;
pub const TAG_TEXT_OVERFLOW: u8 = 6;
pub const TAG_FREE: u8 = 7;

/// A free page holds nothing but the next link of the free list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FreePage {
    pub next_free: PageIdx,
}

#[derive(Debug, Clone, EnumAsInner)]
pub enum Page {
    TableLeaf(LeafNode<RowId, RowData>),
    TableInterior(InteriorNode<RowId>),
    IndexLeaf(LeafNode<Key, RowIdPayload>),
    IndexInterior(InteriorNode<Key>),
    IndexOverflow(RowIdOverflow),
    TextOverflow(TextOverflow),
    Free(FreePage),
}

impl Page {
    pub fn type_name(&self) -> &'static str {
        match self {
            Page::TableLeaf(_) => "table-leaf",
            Page::TableInterior(_) => "table-internal",
            Page::IndexLeaf(_) => "index-leaf",
            Page::IndexInterior(_) => "index-internal",
            Page::IndexOverflow(_) => "index-overflow",
            Page::TextOverflow(_) => "text-overflow",
            Page::Free(_) => "free",
        }
    }

    /// Serialize into a full page buffer, zero-padded.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(PAGE_SIZE);
        match self {
            Page::TableLeaf(n) => {
                codec::write_u8(&mut buf, TAG_TABLE_LEAF);
                n.write(&mut buf);
            }
            Page::TableInterior(n) => {
                codec::write_u8(&mut buf, TAG_TABLE_INTERIOR);
                n.write(&mut buf);
            }
            Page::IndexLeaf(n) => {
                codec::write_u8(&mut buf, TAG_INDEX_LEAF);
                n.write(&mut buf);
            }
            Page::IndexInterior(n) => {
                codec::write_u8(&mut buf, TAG_INDEX_INTERIOR);
                n.write(&mut buf);
            }
            Page::IndexOverflow(o) => {
                codec::write_u8(&mut buf, TAG_INDEX_OVERFLOW);
                codec::write_u32(&mut buf, o.next);
                codec::write_u32(&mut buf, o.row_ids.len() as u32);
                for id in &o.row_ids {
                    codec::write_u64(&mut buf, *id);
                }
            }
            Page::TextOverflow(o) => {
                codec::write_u8(&mut buf, TAG_TEXT_OVERFLOW);
                codec::write_u32(&mut buf, o.next);
                codec::write_u32(&mut buf, o.data.len() as u32);
                buf.extend_from_slice(&o.data);
            }
            Page::Free(f) => {
                codec::write_u8(&mut buf, TAG_FREE);
                codec::write_u32(&mut buf, f.next_free);
            }
        }
        if buf.len() > PAGE_SIZE {
            return Err(Error::internal(format!(
                "{} page serialized to {} bytes",
                self.type_name(),
                buf.len()
            )));
        }
        buf.resize(PAGE_SIZE, 0);
        Ok(buf)
    }

    /// Decode a page buffer; the tag byte picks the variant.
    pub fn unmarshal(bytes: &[u8]) -> Result<Page> {
        let mut c = Cursor::new(bytes);
        let tag = codec::read_u8(&mut c)?;
        Ok(match tag {
            TAG_TABLE_LEAF => Page::TableLeaf(LeafNode::read(&mut c)?),
            TAG_TABLE_INTERIOR => Page::TableInterior(InteriorNode::read(&mut c)?),
            TAG_INDEX_LEAF => Page::IndexLeaf(LeafNode::read(&mut c)?),
            TAG_INDEX_INTERIOR => Page::IndexInterior(InteriorNode::read(&mut c)?),
            TAG_INDEX_OVERFLOW => {
                let next = codec::read_u32(&mut c)?;
                let count = codec::read_u32(&mut c)? as usize;
                if count > crate::overflow::MAX_OVERFLOW_ROW_IDS_PER_PAGE {
                    return Err(Error::corrupt(format!(
                        "overflow row-id count {} exceeds page capacity",
                        count
                    )));
                }
                let mut row_ids = Vec::with_capacity(count);
                for _ in 0..count {
                    row_ids.push(codec::read_u64(&mut c)?);
                }
                Page::IndexOverflow(RowIdOverflow { next, row_ids })
            }
            TAG_TEXT_OVERFLOW => {
                let next = codec::read_u32(&mut c)?;
                let size = codec::read_u32(&mut c)? as usize;
                if size > crate::overflow::MAX_TEXT_PER_PAGE {
                    return Err(Error::corrupt(format!(
                        "text overflow size {} exceeds page capacity",
                        size
                    )));
                }
                let data = codec::read_exact(&mut c, size)?;
                Page::TextOverflow(TextOverflow { next, data })
            }
            TAG_FREE => Page::Free(FreePage {
                next_free: codec::read_u32(&mut c)?,
            }),
            other => {
                return Err(Error::corrupt(format!(
                    "bad page type tag 0x{}",
                    hex::encode([other])
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::header::NodeHeader;

    #[test]
    fn test_page_round_trips() {
        let pages = vec![
            Page::TableLeaf(LeafNode {
                hdr: NodeHeader::root(),
                cells: vec![(1_u64, RowData(vec![0, 1, 2])), (2, RowData(vec![]))],
                next_leaf: 0,
            }),
            Page::IndexInterior(InteriorNode {
                hdr: NodeHeader::child_of(1),
                entries: vec![(Key::Str(String::from("m")), 4)],
                rightmost: 5,
            }),
            Page::IndexOverflow(RowIdOverflow {
                next: 9,
                row_ids: vec![100, 101],
            }),
            Page::TextOverflow(TextOverflow {
                next: 0,
                data: b"hello overflow".to_vec(),
            }),
            Page::Free(FreePage { next_free: 3 }),
        ];
        for page in pages {
            let buf = page.marshal().unwrap();
            assert_eq!(buf.len(), PAGE_SIZE);
            let back = Page::unmarshal(&buf).unwrap();
            // Marshalling again must be byte-identical.
            assert_eq!(back.marshal().unwrap(), buf);
        }
    }

    #[test]
    fn test_bad_tag_is_corrupt() {
        let mut buf = vec![0_u8; PAGE_SIZE];
        buf[0] = 0xEE;
        match Page::unmarshal(&buf) {
            Err(Error::CorruptPage { detail, .. }) => assert!(detail.contains("ee")),
            other => panic!("expected corrupt page, got {:?}", other.map(|p| p.type_name())),
        }
    }
}
