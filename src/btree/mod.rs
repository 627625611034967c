//! B+ tree over arena pages, one instance per DBI (spec §4.B).
//!
//! Grounded in `crab-dads::btree` (teacher: `reader.rs`/`writer.rs` split
//! between read-only descent and copy-on-write mutation) but implemented
//! with a decode-mutate-reencode cycle through [`node::PageBody`] instead of
//! raw pointer arithmetic over a memory-mapped page. Delete does not
//! rebalance siblings, matching the spec's explicit leniency ("may merge
//! with a sibling but is not required to rebalance aggressively").

pub mod cursor;
pub mod node;

use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use crate::arena::Arena;
use crate::error::{Error, Result};
use crate::page::PageNo;
use node::{BranchNode, CellValue, LeafCell, LeafNode, PageBody, MAX_INLINE_VALUE};

pub use cursor::Cursor;

/// Total-order comparator over raw bytes.
pub type Cmp = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

pub fn lexicographic_cmp() -> Cmp {
    Arc::new(|a: &[u8], b: &[u8]| a.cmp(b))
}

/// Put flags (spec §4.B): `NOOVERWRITE` fails with `EXISTS` if the key is
/// already present; `RESERVE` forbids spilling the value to an overflow
/// chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PutFlags(u8);

impl PutFlags {
    pub const NOOVERWRITE: PutFlags = PutFlags(0b01);
    pub const RESERVE: PutFlags = PutFlags(0b10);

    pub const fn empty() -> Self {
        PutFlags(0)
    }

    pub fn contains(self, flag: PutFlags) -> bool {
        self.0 & flag.0 == flag.0
    }
}

impl std::ops::BitOr for PutFlags {
    type Output = PutFlags;
    fn bitor(self, rhs: PutFlags) -> PutFlags {
        PutFlags(self.0 | rhs.0)
    }
}

/// Per-DBI root page, entry count, and tree depth (spec §3 "DBI record").
#[derive(Clone, Debug)]
pub struct DbiMeta {
    pub root: Option<PageNo>,
    pub count: u64,
    pub depth: u32,
    pub dupsort: bool,
}

impl DbiMeta {
    pub fn new(dupsort: bool) -> Self {
        Self {
            root: None,
            count: 0,
            depth: 0,
            dupsort,
        }
    }
}

/// Bundled comparators and layout config for one DBI's tree operations.
pub struct TreeCtx<'a> {
    pub arena: &'a Arena,
    pub keycmp: &'a Cmp,
    pub vcmp: Option<&'a Cmp>,
}

enum PutOutcome {
    NoSplit(PageNo),
    Split {
        left: PageNo,
        sep: Vec<u8>,
        right: PageNo,
    },
}

enum DelOutcome {
    NotFound,
    /// The new page and the number of `(key, value)` entries actually
    /// removed — 1 normally, or the whole duplicate-group size when a
    /// dupsort cell is removed wholesale (`dup_val == None`).
    Deleted(PageNo, u64),
}

fn alloc_encoded(ctx: &TreeCtx, body: &PageBody, dupsort: bool) -> Result<PageNo> {
    let bytes = body.encode(ctx.arena.page_size(), dupsort)?;
    let (pgno, _) = ctx.arena.alloc_page()?;
    ctx.arena.write_page(pgno, Arc::from(bytes.into_boxed_slice()))?;
    Ok(pgno)
}

fn decode_page(ctx: &TreeCtx, pgno: PageNo) -> Result<(PageBody, bool)> {
    let bytes = ctx.arena.resolve(pgno)?;
    match PageBody::decode(&bytes) {
        Ok(v) => Ok(v),
        Err(e) => {
            ctx.arena.counters.bump_decode_failure();
            Err(e)
        }
    }
}

/// Choose the child index a key descends into for a branch node.
fn child_index(branch: &BranchNode, key: &[u8], keycmp: &Cmp) -> usize {
    // children[i] covers keys in [keys[i-1], keys[i]) using keys[-1] = -inf.
    let mut idx = branch.keys.len();
    for (i, k) in branch.keys.iter().enumerate() {
        if keycmp(key, k) == Ordering::Less {
            idx = i;
            break;
        }
    }
    idx
}

fn make_value(
    ctx: &TreeCtx,
    val: &[u8],
    flags: PutFlags,
) -> Result<CellValue> {
    if val.len() > MAX_INLINE_VALUE {
        if flags.contains(PutFlags::RESERVE) {
            return Err(Error::Error("RESERVE put cannot overflow"));
        }
        let head = write_overflow_chain(ctx.arena, val)?;
        Ok(CellValue::Overflow {
            head,
            len: val.len() as u64,
        })
    } else {
        Ok(CellValue::Inline(val.to_vec()))
    }
}

fn write_overflow_chain(arena: &Arena, data: &[u8]) -> Result<PageNo> {
    let page_size = arena.page_size();
    let chunk_cap = page_size - 4;
    let mut pgnos = Vec::new();
    let mut offset = 0;
    if data.is_empty() {
        let (pgno, _) = arena.alloc_page()?;
        let buf = vec![0u8; page_size];
        arena.write_page(pgno, Arc::from(buf.into_boxed_slice()))?;
        return Ok(pgno);
    }
    while offset < data.len() {
        let end = (offset + chunk_cap).min(data.len());
        let (pgno, _) = arena.alloc_page()?;
        pgnos.push((pgno, offset, end));
        offset = end;
    }
    // Link them back to front so each page's "next" field is known before
    // it is written.
    let mut next: u32 = 0;
    for (pgno, start, end) in pgnos.iter().rev() {
        let mut buf = vec![0u8; page_size];
        BigEndian::write_u32(&mut buf[0..4], next);
        buf[4..4 + (end - start)].copy_from_slice(&data[*start..*end]);
        arena.write_page(*pgno, Arc::from(buf.into_boxed_slice()))?;
        next = pgno.get();
    }
    Ok(pgnos[0].0)
}

fn read_overflow_chain(arena: &Arena, head: PageNo, total_len: u64) -> Result<Vec<u8>> {
    let page_size = arena.page_size();
    let chunk_cap = page_size - 4;
    let mut out = Vec::with_capacity(total_len as usize);
    let mut cur = Some(head);
    while let Some(pgno) = cur {
        if out.len() as u64 >= total_len {
            break;
        }
        let page = arena.resolve(pgno)?;
        if page.len() < 4 {
            return Err(Error::Corrupt);
        }
        let next = BigEndian::read_u32(&page[0..4]);
        let remaining = (total_len - out.len() as u64) as usize;
        let take = remaining.min(chunk_cap);
        out.extend_from_slice(&page[4..4 + take]);
        cur = PageNo::new(next);
    }
    if out.len() as u64 != total_len {
        return Err(Error::Corrupt);
    }
    Ok(out)
}

pub fn resolve_value(ctx: &TreeCtx, value: &CellValue) -> Result<Vec<u8>> {
    match value {
        CellValue::Inline(v) => Ok(v.clone()),
        CellValue::Overflow { head, len } => read_overflow_chain(ctx.arena, *head, *len),
        CellValue::Dup(dups) => {
            // Non-cursor get() on a dupsort key returns the smallest dup value.
            dups.first().cloned().ok_or(Error::NotFound)
        }
    }
}

/// Read a key's value (spec §4.B `get`).
pub fn get(ctx: &TreeCtx, root: Option<PageNo>, key: &[u8]) -> Result<Vec<u8>> {
    let Some(root) = root else {
        return Err(Error::NotFound);
    };
    let mut pgno = root;
    loop {
        let (body, _) = decode_page(ctx, pgno)?;
        match body {
            PageBody::Branch(b) => {
                let idx = child_index(&b, key, ctx.keycmp);
                pgno = PageNo::new(b.children[idx]).ok_or(Error::Corrupt)?;
            }
            PageBody::Leaf(l) => {
                let found = l
                    .cells
                    .iter()
                    .find(|c| (ctx.keycmp)(&c.key, key) == Ordering::Equal);
                return match found {
                    Some(cell) => resolve_value(ctx, &cell.value),
                    None => Err(Error::NotFound),
                };
            }
        }
    }
}

fn put_rec(
    ctx: &TreeCtx,
    pgno: PageNo,
    key: &[u8],
    new_value: CellValue,
    flags: PutFlags,
    dupsort: bool,
    inserted: &mut bool,
) -> Result<PutOutcome> {
    let (body, _) = decode_page(ctx, pgno)?;
    match body {
        PageBody::Branch(mut b) => {
            let idx = child_index(&b, key, ctx.keycmp);
            let child = PageNo::new(b.children[idx]).ok_or(Error::Corrupt)?;
            let outcome = put_rec(ctx, child, key, new_value, flags, dupsort, inserted)?;
            match outcome {
                PutOutcome::NoSplit(new_child) => {
                    b.children[idx] = new_child.get();
                    let new_pgno = alloc_encoded(ctx, &PageBody::Branch(b), dupsort)?;
                    Ok(PutOutcome::NoSplit(new_pgno))
                }
                PutOutcome::Split { left, sep, right } => {
                    b.children[idx] = left.get();
                    b.children.insert(idx + 1, right.get());
                    b.keys.insert(idx, sep);
                    split_or_keep_branch(ctx, b, dupsort)
                }
            }
        }
        PageBody::Leaf(mut l) => {
            let pos = l
                .cells
                .iter()
                .position(|c| (ctx.keycmp)(&c.key, key) == Ordering::Equal);
            match pos {
                Some(i) => {
                    if dupsort {
                        let CellValue::Dup(dups) = &mut l.cells[i].value else {
                            return Err(Error::Corrupt);
                        };
                        let CellValue::Dup(mut new_dups) = new_value else {
                            return Err(Error::Corrupt);
                        };
                        let dv = new_dups
                            .pop()
                            .ok_or(Error::Error("empty dup insert"))?;
                        let vcmp = ctx.vcmp.ok_or(Error::Error("dupsort DBI missing value comparator"))?;
                        match dups.binary_search_by(|existing| vcmp(existing, &dv)) {
                            Ok(_) => return Err(Error::Exists),
                            Err(at) => {
                                dups.insert(at, dv);
                                *inserted = true;
                            }
                        }
                    } else if flags.contains(PutFlags::NOOVERWRITE) {
                        return Err(Error::Exists);
                    } else {
                        // Overwriting an existing key's value is not a new
                        // entry; `inserted` must stay false so `count` isn't
                        // inflated.
                        l.cells[i].value = new_value;
                    }
                }
                None => {
                    let idx = l
                        .cells
                        .iter()
                        .position(|c| (ctx.keycmp)(&c.key, key) == Ordering::Greater)
                        .unwrap_or(l.cells.len());
                    l.cells.insert(
                        idx,
                        LeafCell {
                            key: key.to_vec(),
                            value: new_value,
                        },
                    );
                    *inserted = true;
                }
            }
            split_or_keep_leaf(ctx, l, dupsort)
        }
    }
}

fn split_or_keep_leaf(ctx: &TreeCtx, leaf: LeafNode, dupsort: bool) -> Result<PutOutcome> {
    let body = PageBody::Leaf(leaf);
    match body.encode(ctx.arena.page_size(), dupsort) {
        Ok(_) => {
            let pgno = alloc_encoded(ctx, &body, dupsort)?;
            Ok(PutOutcome::NoSplit(pgno))
        }
        Err(_) => {
            let PageBody::Leaf(leaf) = body else {
                unreachable!()
            };
            if leaf.cells.len() < 2 {
                return Err(Error::Full);
            }
            let mid = leaf.cells.len() / 2;
            let right_cells = leaf.cells[mid..].to_vec();
            let left_cells = leaf.cells[..mid].to_vec();
            let sep = right_cells[0].key.clone();
            let left = alloc_encoded(ctx, &PageBody::Leaf(LeafNode { cells: left_cells }), dupsort)?;
            let right = alloc_encoded(ctx, &PageBody::Leaf(LeafNode { cells: right_cells }), dupsort)?;
            Ok(PutOutcome::Split { left, sep, right })
        }
    }
}

fn split_or_keep_branch(ctx: &TreeCtx, branch: BranchNode, dupsort: bool) -> Result<PutOutcome> {
    let body = PageBody::Branch(branch);
    match body.encode(ctx.arena.page_size(), false) {
        Ok(_) => {
            let pgno = alloc_encoded(ctx, &body, dupsort)?;
            Ok(PutOutcome::NoSplit(pgno))
        }
        Err(_) => {
            let PageBody::Branch(branch) = body else {
                unreachable!()
            };
            if branch.keys.len() < 2 {
                return Err(Error::Full);
            }
            let mid = branch.keys.len() / 2;
            let sep = branch.keys[mid].clone();
            let left_keys = branch.keys[..mid].to_vec();
            let right_keys = branch.keys[mid + 1..].to_vec();
            let left_children = branch.children[..=mid].to_vec();
            let right_children = branch.children[mid + 1..].to_vec();
            let left = alloc_encoded(
                ctx,
                &PageBody::Branch(BranchNode {
                    children: left_children,
                    keys: left_keys,
                }),
                dupsort,
            )?;
            let right = alloc_encoded(
                ctx,
                &PageBody::Branch(BranchNode {
                    children: right_children,
                    keys: right_keys,
                }),
                dupsort,
            )?;
            Ok(PutOutcome::Split { left, sep, right })
        }
    }
}

/// Insert or replace a key (spec §4.B `put`).
pub fn put(ctx: &TreeCtx, meta: &mut DbiMeta, key: &[u8], val: &[u8], flags: PutFlags) -> Result<()> {
    if meta.dupsort && flags.contains(PutFlags::RESERVE) {
        return Err(Error::Error("RESERVE is not allowed for dupsort DBIs"));
    }
    let new_value = if meta.dupsort {
        CellValue::Dup(vec![val.to_vec()])
    } else {
        make_value(ctx, val, flags)?
    };
    let mut inserted = false;
    let outcome = match meta.root {
        Some(root) => put_rec(ctx, root, key, new_value, flags, meta.dupsort, &mut inserted)?,
        None => {
            let leaf = if meta.dupsort {
                LeafNode {
                    cells: vec![LeafCell {
                        key: key.to_vec(),
                        value: CellValue::Dup(vec![val.to_vec()]),
                    }],
                }
            } else {
                LeafNode {
                    cells: vec![LeafCell {
                        key: key.to_vec(),
                        value: make_value(ctx, val, flags)?,
                    }],
                }
            };
            inserted = true;
            PutOutcome::NoSplit(alloc_encoded(ctx, &PageBody::Leaf(leaf), meta.dupsort)?)
        }
    };
    match outcome {
        PutOutcome::NoSplit(pgno) => {
            meta.root = Some(pgno);
        }
        PutOutcome::Split { left, sep, right } => {
            let new_root = BranchNode {
                children: vec![left.get(), right.get()],
                keys: vec![sep],
            };
            meta.root = Some(alloc_encoded(ctx, &PageBody::Branch(new_root), meta.dupsort)?);
            meta.depth += 1;
        }
    }
    if inserted {
        meta.count += 1;
    }
    Ok(())
}

/// Compare-and-swap put (spec §4.B `put_if`).
pub fn put_if(
    ctx: &TreeCtx,
    meta: &mut DbiMeta,
    key: &[u8],
    new: &[u8],
    expected: Option<&[u8]>,
) -> Result<()> {
    if meta.dupsort {
        return Err(Error::Error("CAS is not supported for dupsort DBIs"));
    }
    let current = match get(ctx, meta.root, key) {
        Ok(v) => Some(v),
        Err(Error::NotFound) => None,
        Err(e) => return Err(e),
    };
    match (current.as_deref(), expected) {
        (None, None) => put(ctx, meta, key, new, PutFlags::empty()),
        (Some(cur), Some(exp)) if cur == exp => put(ctx, meta, key, new, PutFlags::empty()),
        (None, Some(_)) => Err(Error::NotFound),
        (Some(_), None) | (Some(_), Some(_)) => Err(Error::Conflict),
    }
}

fn del_rec(ctx: &TreeCtx, pgno: PageNo, key: &[u8], dup_val: Option<&[u8]>) -> Result<DelOutcome> {
    let (body, dupsort) = decode_page(ctx, pgno)?;
    match body {
        PageBody::Branch(mut b) => {
            let idx = child_index(&b, key, ctx.keycmp);
            let child = PageNo::new(b.children[idx]).ok_or(Error::Corrupt)?;
            match del_rec(ctx, child, key, dup_val)? {
                DelOutcome::NotFound => Ok(DelOutcome::NotFound),
                DelOutcome::Deleted(new_child, removed) => {
                    b.children[idx] = new_child.get();
                    let new_pgno = alloc_encoded(ctx, &PageBody::Branch(b), dupsort)?;
                    Ok(DelOutcome::Deleted(new_pgno, removed))
                }
            }
        }
        PageBody::Leaf(mut l) => {
            let pos = l
                .cells
                .iter()
                .position(|c| (ctx.keycmp)(&c.key, key) == Ordering::Equal);
            let Some(i) = pos else {
                return Ok(DelOutcome::NotFound);
            };
            let removed: u64 = match dup_val {
                None => {
                    // Wholesale removal of a dupsort cell drops every
                    // duplicate value it held, not just one entry.
                    let removed = match &l.cells[i].value {
                        CellValue::Dup(dups) => dups.len() as u64,
                        _ => 1,
                    };
                    l.cells.remove(i);
                    removed
                }
                Some(dv) => {
                    let CellValue::Dup(dups) = &mut l.cells[i].value else {
                        return Err(Error::Corrupt);
                    };
                    let vcmp = ctx.vcmp.ok_or(Error::Error("dupsort DBI missing value comparator"))?;
                    match dups.binary_search_by(|existing| vcmp(existing, dv)) {
                        Ok(at) => {
                            dups.remove(at);
                            if dups.is_empty() {
                                l.cells.remove(i);
                            }
                            1
                        }
                        Err(_) => return Ok(DelOutcome::NotFound),
                    }
                }
            };
            let new_pgno = alloc_encoded(ctx, &PageBody::Leaf(l), dupsort)?;
            Ok(DelOutcome::Deleted(new_pgno, removed))
        }
    }
}

/// Delete a key (spec §4.B `del`, and `del_dup` when `dup_val` is set).
pub fn del(ctx: &TreeCtx, meta: &mut DbiMeta, key: &[u8], dup_val: Option<&[u8]>) -> Result<()> {
    let Some(root) = meta.root else {
        return Err(Error::NotFound);
    };
    match del_rec(ctx, root, key, dup_val)? {
        DelOutcome::NotFound => Err(Error::NotFound),
        DelOutcome::Deleted(new_root, removed) => {
            meta.root = Some(new_root);
            meta.count = meta.count.saturating_sub(removed);
            Ok(())
        }
    }
}

/// Delete every key in `[lo, hi]`, returning the number of rows removed
/// (spec §4.B `del_range`).
pub fn del_range(ctx: &TreeCtx, meta: &mut DbiMeta, lo: &[u8], hi: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut deleted = Vec::new();
    loop {
        let Some(root) = meta.root else { break };
        let mut cur = cursor::Cursor::new(root, meta.dupsort);
        if cur.seek(ctx, lo)?.is_none() {
            break;
        }
        let Some((k, _)) = cur.get(ctx)? else { break };
        if (ctx.keycmp)(&k, hi) == Ordering::Greater {
            break;
        }
        del(ctx, meta, &k, None)?;
        deleted.push(k);
    }
    Ok(deleted)
}

/// Count keys within `[lo, hi]` (spec §4.B `count_range`).
pub fn count_range(ctx: &TreeCtx, meta: &DbiMeta, lo: &[u8], hi: &[u8]) -> Result<u64> {
    let Some(root) = meta.root else { return Ok(0) };
    let mut cur = cursor::Cursor::new(root, meta.dupsort);
    if cur.seek(ctx, lo)?.is_none() {
        return Ok(0);
    }
    let mut count = 0u64;
    loop {
        let Some((k, _)) = cur.get(ctx)? else { break };
        if (ctx.keycmp)(&k, hi) == Ordering::Greater {
            break;
        }
        count += 1;
        if cur.next(ctx)?.is_none() {
            break;
        }
    }
    Ok(count)
}

/// Bulk-ingest pre-sorted `(key, value)` pairs (spec §4.B `load_sorted`).
pub fn load_sorted(ctx: &TreeCtx, meta: &mut DbiMeta, pairs: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
    for (k, v) in pairs {
        if meta.dupsort {
            put(ctx, meta, k, v, PutFlags::empty())?;
        } else {
            put(ctx, meta, k, v, PutFlags::NOOVERWRITE)?;
        }
    }
    Ok(())
}

/// Read-modify-write a value via a caller callback (spec §4.B `merge`).
///
/// The callback receives the current value (`None` if absent) and the
/// operand, and writes the new value into `out`, returning the number of
/// bytes written. If `out` is too small the callback returns
/// `Err(required_len)`; `merge` retries once with a buffer of that size.
pub fn merge<F>(
    ctx: &TreeCtx,
    meta: &mut DbiMeta,
    key: &[u8],
    operand: &[u8],
    mut callback: F,
) -> Result<()>
where
    F: FnMut(Option<&[u8]>, &[u8], &mut [u8]) -> std::result::Result<usize, u16>,
{
    let current = match get(ctx, meta.root, key) {
        Ok(v) => Some(v),
        Err(Error::NotFound) => None,
        Err(e) => return Err(e),
    };
    let mut cap: usize = 256;
    loop {
        let mut out = vec![0u8; cap];
        match callback(current.as_deref(), operand, &mut out) {
            Ok(len) => {
                out.truncate(len);
                return put(ctx, meta, key, &out, PutFlags::empty());
            }
            Err(required) if cap < required as usize && cap == 256 => {
                cap = required as usize;
                continue;
            }
            Err(_) => return Err(Error::Full),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{Arena, Backing};

    fn ctx_fixture() -> (Arena, Cmp) {
        (
            Arena::new(4096, Backing::Malloc).unwrap(),
            lexicographic_cmp(),
        )
    }

    #[test]
    fn put_get_roundtrip() {
        let (arena, keycmp) = ctx_fixture();
        let ctx = TreeCtx {
            arena: &arena,
            keycmp: &keycmp,
            vcmp: None,
        };
        let mut meta = DbiMeta::new(false);
        put(&ctx, &mut meta, b"a", b"1", PutFlags::empty()).unwrap();
        put(&ctx, &mut meta, b"b", b"2", PutFlags::empty()).unwrap();
        assert_eq!(get(&ctx, meta.root, b"a").unwrap(), b"1");
        assert_eq!(get(&ctx, meta.root, b"b").unwrap(), b"2");
        assert_eq!(meta.count, 2);
    }

    #[test]
    fn delete_then_not_found() {
        let (arena, keycmp) = ctx_fixture();
        let ctx = TreeCtx {
            arena: &arena,
            keycmp: &keycmp,
            vcmp: None,
        };
        let mut meta = DbiMeta::new(false);
        put(&ctx, &mut meta, b"a", b"1", PutFlags::empty()).unwrap();
        del(&ctx, &mut meta, b"a", None).unwrap();
        assert!(matches!(get(&ctx, meta.root, b"a"), Err(Error::NotFound)));
    }

    #[test]
    fn noverwrite_rejects_existing() {
        let (arena, keycmp) = ctx_fixture();
        let ctx = TreeCtx {
            arena: &arena,
            keycmp: &keycmp,
            vcmp: None,
        };
        let mut meta = DbiMeta::new(false);
        put(&ctx, &mut meta, b"a", b"1", PutFlags::empty()).unwrap();
        let err = put(&ctx, &mut meta, b"a", b"2", PutFlags::NOOVERWRITE).unwrap_err();
        assert!(matches!(err, Error::Exists));
    }

    #[test]
    fn put_if_cas_semantics() {
        let (arena, keycmp) = ctx_fixture();
        let ctx = TreeCtx {
            arena: &arena,
            keycmp: &keycmp,
            vcmp: None,
        };
        let mut meta = DbiMeta::new(false);
        put_if(&ctx, &mut meta, b"k", b"held", None).unwrap();
        let err = put_if(&ctx, &mut meta, b"k", b"held2", None).unwrap_err();
        assert!(matches!(err, Error::Conflict));
        assert_eq!(get(&ctx, meta.root, b"k").unwrap(), b"held");
    }

    #[test]
    fn split_under_many_inserts() {
        let (arena, keycmp) = ctx_fixture();
        let ctx = TreeCtx {
            arena: &arena,
            keycmp: &keycmp,
            vcmp: None,
        };
        let mut meta = DbiMeta::new(false);
        for i in 0..2000u32 {
            let k = i.to_be_bytes();
            put(&ctx, &mut meta, &k, b"v", PutFlags::empty()).unwrap();
        }
        assert_eq!(meta.count, 2000);
        for i in 0..2000u32 {
            let k = i.to_be_bytes();
            assert_eq!(get(&ctx, meta.root, &k).unwrap(), b"v");
        }
        assert!(meta.depth > 0);
    }

    #[test]
    fn overflow_value_roundtrip() {
        let (arena, keycmp) = ctx_fixture();
        let ctx = TreeCtx {
            arena: &arena,
            keycmp: &keycmp,
            vcmp: None,
        };
        let mut meta = DbiMeta::new(false);
        let big = vec![0xABu8; 70_000];
        put(&ctx, &mut meta, b"big", &big, PutFlags::empty()).unwrap();
        assert_eq!(get(&ctx, meta.root, b"big").unwrap(), big);
    }
}
