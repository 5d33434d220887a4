//! The fixed-size header at the front of every btree node page.
//!
//! Layout after the one-byte page type tag:
//! `flags[1] | parent[4] | nkeys[2] | special[4]`
//! where `special` is the rightmost-child page for internal nodes and the
//! next-leaf page for leaves.  12 bytes in all, tag included.

use std::io::Cursor;

use crate::codec;
use crate::error::Result;
use crate::pager::PageIdx;

/// Bytes from the start of the page to the first cell, type tag included.
pub const NODE_HDR_SIZE: usize = 12;

const FLAG_ROOT: u8 = 0b0000_0001;

/// The parts of a node header that are not derived from the cell array.
/// `parent` is 0 for the root; pages reference each other by index, never
/// by pointer, since the pager owns them all.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeHeader {
    pub is_root: bool,
    pub parent: PageIdx,
}

impl NodeHeader {
    pub fn root() -> NodeHeader {
        NodeHeader {
            is_root: true,
            parent: 0,
        }
    }

    pub fn child_of(parent: PageIdx) -> NodeHeader {
        NodeHeader {
            is_root: false,
            parent,
        }
    }

    /// Write `flags | parent` (the caller has already written the type tag
    /// and will append `nkeys | special` from the node body).
    pub fn write(&self, buf: &mut Vec<u8>) {
        let mut flags = 0_u8;
        if self.is_root {
            flags |= FLAG_ROOT;
        }
        codec::write_u8(buf, flags);
        codec::write_u32(buf, self.parent);
    }

    pub fn read(c: &mut Cursor<&[u8]>) -> Result<NodeHeader> {
        let flags = codec::read_u8(c)?;
        let parent = codec::read_u32(c)?;
        Ok(NodeHeader {
            is_root: flags & FLAG_ROOT != 0,
            parent,
        })
    }
}

#[test]
fn test_header_round_trip() {
    for hdr in [NodeHeader::root(), NodeHeader::child_of(17)] {
        let mut buf = vec![];
        hdr.write(&mut buf);
        let mut c = Cursor::new(buf.as_slice());
        assert_eq!(NodeHeader::read(&mut c).unwrap(), hdr);
    }
}
