//! In-memory decoded representation of a B+ tree page, and its byte
//! encoding (spec §3 "B+ tree node", §4.B).
//!
//! Pages are decoded into this representation, mutated as plain `Vec`s, and
//! re-encoded at the arena boundary. This trades the teacher's raw
//! pointer/two-array-trailer page layout (`crab-dads::page`) for a safe
//! decode-mutate-reencode pattern; the trailer-style header byte layout
//! (page type + counts up front) is kept for the same reason the teacher
//! keeps one: a page's type must be identifiable without decoding its body.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::page::PageNo;

pub const PAGE_TYPE_BRANCH: u8 = 0;
pub const PAGE_TYPE_LEAF: u8 = 1;

const FLAG_DUPSORT: u8 = 1;
const HEADER_LEN: usize = 4; // page_type:u8, flags:u8, count:u16

const VAL_INLINE: u8 = 0;
const VAL_OVERFLOW: u8 = 1;
const VAL_DUP: u8 = 2;

/// The maximum length of an inline (non-overflow) value (spec §4.B: "up to
/// UINT16_MAX").
pub const MAX_INLINE_VALUE: usize = u16::MAX as usize;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CellValue {
    Inline(Vec<u8>),
    /// Head page of an overflow chain, plus the total value length.
    Overflow { head: PageNo, len: u64 },
    /// Values for one key in a dupsort DBI, kept sorted by the DBI's value
    /// comparator. Each value is unique within the group.
    Dup(Vec<Vec<u8>>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafCell {
    pub key: Vec<u8>,
    pub value: CellValue,
}

#[derive(Clone, Debug, Default)]
pub struct LeafNode {
    pub cells: Vec<LeafCell>,
}

#[derive(Clone, Debug, Default)]
pub struct BranchNode {
    /// `children.len() == keys.len() + 1`.
    pub children: Vec<u32>,
    pub keys: Vec<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub enum PageBody {
    Branch(BranchNode),
    Leaf(LeafNode),
}

impl PageBody {
    pub fn is_leaf(&self) -> bool {
        matches!(self, PageBody::Leaf(_))
    }

    pub fn empty_leaf() -> Self {
        PageBody::Leaf(LeafNode::default())
    }

    pub fn dupsort_flag(dupsort: bool) -> u8 {
        if dupsort {
            FLAG_DUPSORT
        } else {
            0
        }
    }

    /// Encode this node into a page-sized buffer. Errors with [`Error::Full`]
    /// if the encoding does not fit in `page_size` bytes.
    pub fn encode(&self, page_size: usize, dupsort: bool) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(page_size);
        match self {
            PageBody::Branch(b) => {
                buf.push(PAGE_TYPE_BRANCH);
                buf.push(0);
                let mut count_buf = [0u8; 2];
                BigEndian::write_u16(&mut count_buf, b.keys.len() as u16);
                buf.extend_from_slice(&count_buf);
                let mut child_buf = [0u8; 4];
                BigEndian::write_u32(&mut child_buf, b.children[0]);
                buf.extend_from_slice(&child_buf);
                for (key, child) in b.keys.iter().zip(b.children.iter().skip(1)) {
                    write_key(&mut buf, key)?;
                    let mut cbuf = [0u8; 4];
                    BigEndian::write_u32(&mut cbuf, *child);
                    buf.extend_from_slice(&cbuf);
                }
            }
            PageBody::Leaf(l) => {
                buf.push(PAGE_TYPE_LEAF);
                buf.push(Self::dupsort_flag(dupsort));
                let mut count_buf = [0u8; 2];
                BigEndian::write_u16(&mut count_buf, l.cells.len() as u16);
                buf.extend_from_slice(&count_buf);
                for cell in &l.cells {
                    write_key(&mut buf, &cell.key)?;
                    match &cell.value {
                        CellValue::Inline(v) => {
                            buf.push(VAL_INLINE);
                            let mut len_buf = [0u8; 4];
                            BigEndian::write_u32(&mut len_buf, v.len() as u32);
                            buf.extend_from_slice(&len_buf);
                            buf.extend_from_slice(v);
                        }
                        CellValue::Overflow { head, len } => {
                            buf.push(VAL_OVERFLOW);
                            let mut head_buf = [0u8; 4];
                            BigEndian::write_u32(&mut head_buf, head.get());
                            buf.extend_from_slice(&head_buf);
                            let mut len_buf = [0u8; 8];
                            BigEndian::write_u64(&mut len_buf, *len);
                            buf.extend_from_slice(&len_buf);
                        }
                        CellValue::Dup(dups) => {
                            buf.push(VAL_DUP);
                            let mut n_buf = [0u8; 4];
                            BigEndian::write_u32(&mut n_buf, dups.len() as u32);
                            buf.extend_from_slice(&n_buf);
                            for dv in dups {
                                let mut dvlen = [0u8; 4];
                                BigEndian::write_u32(&mut dvlen, dv.len() as u32);
                                buf.extend_from_slice(&dvlen);
                                buf.extend_from_slice(dv);
                            }
                        }
                    }
                }
            }
        }
        if buf.len() > page_size {
            return Err(Error::Full);
        }
        buf.resize(page_size, 0);
        Ok(buf)
    }

    pub fn decode(page: &[u8]) -> Result<(Self, bool)> {
        if page.len() < HEADER_LEN {
            return Err(Error::Corrupt);
        }
        let page_type = page[0];
        let dupsort = page[1] & FLAG_DUPSORT != 0;
        let count = BigEndian::read_u16(&page[2..4]) as usize;
        let mut pos = HEADER_LEN;
        match page_type {
            PAGE_TYPE_BRANCH => {
                if pos + 4 > page.len() {
                    return Err(Error::Corrupt);
                }
                let mut children = vec![BigEndian::read_u32(&page[pos..pos + 4])];
                pos += 4;
                let mut keys = Vec::with_capacity(count);
                for _ in 0..count {
                    let (key, new_pos) = read_key(page, pos)?;
                    pos = new_pos;
                    if pos + 4 > page.len() {
                        return Err(Error::Corrupt);
                    }
                    children.push(BigEndian::read_u32(&page[pos..pos + 4]));
                    pos += 4;
                    keys.push(key);
                }
                Ok((PageBody::Branch(BranchNode { children, keys }), dupsort))
            }
            PAGE_TYPE_LEAF => {
                let mut cells = Vec::with_capacity(count);
                for _ in 0..count {
                    let (key, new_pos) = read_key(page, pos)?;
                    pos = new_pos;
                    if pos >= page.len() {
                        return Err(Error::Corrupt);
                    }
                    let tag = page[pos];
                    pos += 1;
                    let value = match tag {
                        VAL_INLINE => {
                            if pos + 4 > page.len() {
                                return Err(Error::Corrupt);
                            }
                            let len = BigEndian::read_u32(&page[pos..pos + 4]) as usize;
                            pos += 4;
                            let bytes = page
                                .get(pos..pos + len)
                                .ok_or(Error::Corrupt)?
                                .to_vec();
                            pos += len;
                            CellValue::Inline(bytes)
                        }
                        VAL_OVERFLOW => {
                            if pos + 12 > page.len() {
                                return Err(Error::Corrupt);
                            }
                            let head = BigEndian::read_u32(&page[pos..pos + 4]);
                            pos += 4;
                            let len = BigEndian::read_u64(&page[pos..pos + 8]);
                            pos += 8;
                            let head = PageNo::new(head).ok_or(Error::Corrupt)?;
                            CellValue::Overflow { head, len }
                        }
                        VAL_DUP => {
                            if pos + 4 > page.len() {
                                return Err(Error::Corrupt);
                            }
                            let n = BigEndian::read_u32(&page[pos..pos + 4]) as usize;
                            pos += 4;
                            let mut dups = Vec::with_capacity(n);
                            for _ in 0..n {
                                if pos + 4 > page.len() {
                                    return Err(Error::Corrupt);
                                }
                                let dvlen = BigEndian::read_u32(&page[pos..pos + 4]) as usize;
                                pos += 4;
                                let dv = page
                                    .get(pos..pos + dvlen)
                                    .ok_or(Error::Corrupt)?
                                    .to_vec();
                                pos += dvlen;
                                dups.push(dv);
                            }
                            CellValue::Dup(dups)
                        }
                        _ => return Err(Error::Corrupt),
                    };
                    cells.push(LeafCell { key, value });
                }
                Ok((PageBody::Leaf(LeafNode { cells }), dupsort))
            }
            _ => Err(Error::Corrupt),
        }
    }
}

fn write_key(buf: &mut Vec<u8>, key: &[u8]) -> Result<()> {
    if key.len() > u16::MAX as usize {
        return Err(Error::Full);
    }
    let mut len_buf = [0u8; 2];
    BigEndian::write_u16(&mut len_buf, key.len() as u16);
    buf.extend_from_slice(&len_buf);
    buf.extend_from_slice(key);
    Ok(())
}

fn read_key(page: &[u8], pos: usize) -> Result<(Vec<u8>, usize)> {
    if pos + 2 > page.len() {
        return Err(Error::Corrupt);
    }
    let len = BigEndian::read_u16(&page[pos..pos + 2]) as usize;
    let start = pos + 2;
    let key = page.get(start..start + len).ok_or(Error::Corrupt)?.to_vec();
    Ok((key, start + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_roundtrip() {
        let node = PageBody::Leaf(LeafNode {
            cells: vec![
                LeafCell {
                    key: b"a".to_vec(),
                    value: CellValue::Inline(b"1".to_vec()),
                },
                LeafCell {
                    key: b"b".to_vec(),
                    value: CellValue::Inline(b"2".to_vec()),
                },
            ],
        });
        let encoded = node.encode(4096, false).unwrap();
        let (decoded, dupsort) = PageBody::decode(&encoded).unwrap();
        assert!(!dupsort);
        match decoded {
            PageBody::Leaf(l) => assert_eq!(l.cells.len(), 2),
            _ => panic!("expected leaf"),
        }
    }

    #[test]
    fn branch_roundtrip() {
        let node = PageBody::Branch(BranchNode {
            children: vec![1, 2, 3],
            keys: vec![b"m".to_vec(), b"z".to_vec()],
        });
        let encoded = node.encode(4096, false).unwrap();
        let (decoded, _) = PageBody::decode(&encoded).unwrap();
        match decoded {
            PageBody::Branch(b) => {
                assert_eq!(b.children, vec![1, 2, 3]);
                assert_eq!(b.keys.len(), 2);
            }
            _ => panic!("expected branch"),
        }
    }
}
