//! Cursor state machine over a B+ tree (spec §4.B):
//! `closed -> (open|renew) -> positioned`.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::page::PageNo;

use super::node::{BranchNode, CellValue, LeafNode, PageBody};
use super::{put, put_if, resolve_value, DbiMeta, PutFlags, TreeCtx};

struct BranchFrame {
    pgno: PageNo,
    branch: BranchNode,
    child_idx: usize,
}

struct LeafFrame {
    pgno: PageNo,
    leaf: LeafNode,
    cell_idx: usize,
}

/// A cursor over one DBI's tree. Not positioned until `first`, `last`, or
/// `seek` is called.
pub struct Cursor {
    root: PageNo,
    dupsort: bool,
    path: Vec<BranchFrame>,
    leaf: Option<LeafFrame>,
    dup_idx: usize,
}

impl Cursor {
    pub fn new(root: PageNo, dupsort: bool) -> Self {
        Self {
            root,
            dupsort,
            path: Vec::new(),
            leaf: None,
            dup_idx: 0,
        }
    }

    /// Reposition this cursor onto a different (possibly newer) root, e.g.
    /// after a write changed the tree shape underneath it.
    pub fn renew(&mut self, root: PageNo) {
        self.root = root;
        self.path.clear();
        self.leaf = None;
        self.dup_idx = 0;
    }

    fn descend_leftmost(&mut self, ctx: &TreeCtx, mut pgno: PageNo) -> Result<()> {
        loop {
            let (body, _) = super_decode(ctx, pgno)?;
            match body {
                PageBody::Branch(b) => {
                    let child = PageNo::new(b.children[0]).ok_or(Error::Corrupt)?;
                    self.path.push(BranchFrame {
                        pgno,
                        branch: b,
                        child_idx: 0,
                    });
                    pgno = child;
                }
                PageBody::Leaf(l) => {
                    self.leaf = Some(LeafFrame {
                        pgno,
                        leaf: l,
                        cell_idx: 0,
                    });
                    self.dup_idx = 0;
                    return Ok(());
                }
            }
        }
    }

    fn descend_rightmost(&mut self, ctx: &TreeCtx, mut pgno: PageNo) -> Result<()> {
        loop {
            let (body, _) = super_decode(ctx, pgno)?;
            match body {
                PageBody::Branch(b) => {
                    let idx = b.children.len() - 1;
                    let child = PageNo::new(b.children[idx]).ok_or(Error::Corrupt)?;
                    self.path.push(BranchFrame {
                        pgno,
                        branch: b,
                        child_idx: idx,
                    });
                    pgno = child;
                }
                PageBody::Leaf(l) => {
                    let cell_idx = l.cells.len().saturating_sub(1);
                    self.dup_idx = match &l.cells.get(cell_idx) {
                        Some(c) => match &c.value {
                            CellValue::Dup(d) => d.len().saturating_sub(1),
                            _ => 0,
                        },
                        None => 0,
                    };
                    self.leaf = Some(LeafFrame {
                        pgno,
                        leaf: l,
                        cell_idx,
                    });
                    return Ok(());
                }
            }
        }
    }

    /// Position on the first key (spec: `first`).
    pub fn first(&mut self, ctx: &TreeCtx) -> Result<Option<()>> {
        self.path.clear();
        self.leaf = None;
        self.descend_leftmost(ctx, self.root)?;
        if self.current_leaf()?.leaf.cells.is_empty() {
            self.leaf = None;
            return Ok(None);
        }
        Ok(Some(()))
    }

    /// Position on the last key (spec: `last`).
    pub fn last(&mut self, ctx: &TreeCtx) -> Result<Option<()>> {
        self.path.clear();
        self.leaf = None;
        self.descend_rightmost(ctx, self.root)?;
        if self.current_leaf()?.leaf.cells.is_empty() {
            self.leaf = None;
            return Ok(None);
        }
        Ok(Some(()))
    }

    /// Position on the first key `>= target` (spec: `seek`).
    pub fn seek(&mut self, ctx: &TreeCtx, target: &[u8]) -> Result<Option<()>> {
        self.path.clear();
        self.leaf = None;
        let mut pgno = self.root;
        loop {
            let (body, _) = super_decode(ctx, pgno)?;
            match body {
                PageBody::Branch(b) => {
                    let mut idx = b.keys.len();
                    for (i, k) in b.keys.iter().enumerate() {
                        if (ctx.keycmp)(target, k) == Ordering::Less {
                            idx = i;
                            break;
                        }
                    }
                    let child = PageNo::new(b.children[idx]).ok_or(Error::Corrupt)?;
                    self.path.push(BranchFrame {
                        pgno,
                        branch: b,
                        child_idx: idx,
                    });
                    pgno = child;
                }
                PageBody::Leaf(l) => {
                    let cell_idx = l
                        .cells
                        .iter()
                        .position(|c| (ctx.keycmp)(&c.key, target) != Ordering::Less);
                    self.dup_idx = 0;
                    match cell_idx {
                        Some(idx) => {
                            self.leaf = Some(LeafFrame {
                                pgno,
                                leaf: l,
                                cell_idx: idx,
                            });
                            return Ok(Some(()));
                        }
                        None => {
                            self.leaf = Some(LeafFrame {
                                pgno,
                                leaf: l,
                                cell_idx: 0,
                            });
                            // Every key in this leaf is below target; advance
                            // to the next leaf, if any.
                            return self.next_leaf(ctx).map(|ok| ok.then_some(()));
                        }
                    }
                }
            }
        }
    }

    fn current_leaf(&self) -> Result<&LeafFrame> {
        self.leaf.as_ref().ok_or(Error::NotFound)
    }

    fn advance_to_next_leaf_from_path(&mut self, ctx: &TreeCtx) -> Result<bool> {
        while let Some(frame) = self.path.last_mut() {
            if frame.child_idx + 1 < frame.branch.children.len() {
                frame.child_idx += 1;
                let child = PageNo::new(frame.branch.children[frame.child_idx]).ok_or(Error::Corrupt)?;
                self.descend_leftmost(ctx, child)?;
                return Ok(true);
            }
            self.path.pop();
        }
        self.leaf = None;
        Ok(false)
    }

    fn advance_to_prev_leaf_from_path(&mut self, ctx: &TreeCtx) -> Result<bool> {
        while let Some(frame) = self.path.last_mut() {
            if frame.child_idx > 0 {
                frame.child_idx -= 1;
                let child = PageNo::new(frame.branch.children[frame.child_idx]).ok_or(Error::Corrupt)?;
                self.descend_rightmost(ctx, child)?;
                return Ok(true);
            }
            self.path.pop();
        }
        self.leaf = None;
        Ok(false)
    }

    fn next_leaf(&mut self, ctx: &TreeCtx) -> Result<bool> {
        self.advance_to_next_leaf_from_path(ctx)
    }

    /// Move to the next key (spec: `next`). Returns `None` at the end.
    pub fn next(&mut self, ctx: &TreeCtx) -> Result<Option<()>> {
        let frame = self.current_leaf()?;
        if frame.cell_idx + 1 < frame.leaf.cells.len() {
            self.leaf.as_mut().unwrap().cell_idx += 1;
            self.dup_idx = 0;
            return Ok(Some(()));
        }
        if self.advance_to_next_leaf_from_path(ctx)? {
            if self.current_leaf()?.leaf.cells.is_empty() {
                return self.next(ctx);
            }
            Ok(Some(()))
        } else {
            Ok(None)
        }
    }

    /// Move to the previous key (spec: `prev`). Returns `None` at the start.
    pub fn prev(&mut self, ctx: &TreeCtx) -> Result<Option<()>> {
        let frame = self.current_leaf()?;
        if frame.cell_idx > 0 {
            self.leaf.as_mut().unwrap().cell_idx -= 1;
            self.dup_idx = 0;
            return Ok(Some(()));
        }
        if self.advance_to_prev_leaf_from_path(ctx)? {
            if self.current_leaf()?.leaf.cells.is_empty() {
                return self.prev(ctx);
            }
            Ok(Some(()))
        } else {
            Ok(None)
        }
    }

    /// Read the current `(key, value)` pair (spec: `get`). For a dupsort
    /// DBI this returns the value at the cursor's current duplicate index.
    pub fn get(&self, ctx: &TreeCtx) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let Some(frame) = self.leaf.as_ref() else {
            return Ok(None);
        };
        let Some(cell) = frame.leaf.cells.get(frame.cell_idx) else {
            return Ok(None);
        };
        let value = if self.dupsort {
            match &cell.value {
                CellValue::Dup(dups) => dups
                    .get(self.dup_idx)
                    .cloned()
                    .ok_or(Error::Corrupt)?,
                _ => return Err(Error::Corrupt),
            }
        } else {
            resolve_value(ctx, &cell.value)?
        };
        Ok(Some((cell.key.clone(), value)))
    }

    /// Move to the first duplicate of the current key.
    pub fn first_dup(&mut self) -> Result<Option<()>> {
        self.current_leaf()?;
        self.dup_idx = 0;
        Ok(Some(()))
    }

    /// Move to the last duplicate of the current key.
    pub fn last_dup(&mut self) -> Result<Option<()>> {
        let frame = self.current_leaf()?;
        let cell = frame
            .leaf
            .cells
            .get(frame.cell_idx)
            .ok_or(Error::Corrupt)?;
        let CellValue::Dup(dups) = &cell.value else {
            return Err(Error::Corrupt);
        };
        self.dup_idx = dups.len().saturating_sub(1);
        Ok(Some(()))
    }

    /// Move to the next duplicate of the current key.
    pub fn next_dup(&mut self) -> Result<Option<()>> {
        let frame = self.current_leaf()?;
        let cell = frame
            .leaf
            .cells
            .get(frame.cell_idx)
            .ok_or(Error::Corrupt)?;
        let CellValue::Dup(dups) = &cell.value else {
            return Err(Error::Corrupt);
        };
        if self.dup_idx + 1 < dups.len() {
            self.dup_idx += 1;
            Ok(Some(()))
        } else {
            Ok(None)
        }
    }

    /// Move to the previous duplicate of the current key.
    pub fn prev_dup(&mut self) -> Result<Option<()>> {
        self.current_leaf()?;
        if self.dup_idx > 0 {
            self.dup_idx -= 1;
            Ok(Some(()))
        } else {
            Ok(None)
        }
    }

    /// Count duplicates for the current key.
    pub fn count_dup(&self) -> Result<usize> {
        let frame = self.current_leaf()?;
        let cell = frame
            .leaf
            .cells
            .get(frame.cell_idx)
            .ok_or(Error::Corrupt)?;
        match &cell.value {
            CellValue::Dup(dups) => Ok(dups.len()),
            _ => Err(Error::Corrupt),
        }
    }

    /// Replace the value at the current position in place (non-dupsort
    /// only; spec: cursor `put` with `flags == 0`).
    pub fn put(&mut self, ctx: &TreeCtx, meta: &mut DbiMeta, val: &[u8]) -> Result<()> {
        let key = self.current_leaf()?.leaf.cells
            [self.current_leaf()?.cell_idx]
            .key
            .clone();
        put(ctx, meta, &key, val, PutFlags::empty())?;
        let root = meta.root.ok_or(Error::Corrupt)?;
        self.renew(root);
        self.seek(ctx, &key)?;
        Ok(())
    }

    /// Delete the current row, leaving the cursor on the next key or
    /// invalid (spec: cursor `del`).
    pub fn del(&mut self, ctx: &TreeCtx, meta: &mut DbiMeta) -> Result<()> {
        let frame = self.current_leaf()?;
        let cell = &frame.leaf.cells[frame.cell_idx];
        let key = cell.key.clone();
        let dup_val = match (&cell.value, self.dupsort) {
            (CellValue::Dup(dups), true) => dups.get(self.dup_idx).cloned(),
            _ => None,
        };
        super::del(ctx, meta, &key, dup_val.as_deref())?;
        match meta.root {
            Some(root) => {
                self.renew(root);
                self.seek(ctx, &key)?;
            }
            None => {
                self.leaf = None;
                self.path.clear();
            }
        }
        Ok(())
    }

    /// Compare-and-swap at the current key (delegates to [`put_if`]).
    pub fn put_if(
        &mut self,
        ctx: &TreeCtx,
        meta: &mut DbiMeta,
        new: &[u8],
        expected: Option<&[u8]>,
    ) -> Result<()> {
        let key = self.current_leaf()?.leaf.cells
            [self.current_leaf()?.cell_idx]
            .key
            .clone();
        put_if(ctx, meta, &key, new, expected)?;
        let root = meta.root.ok_or(Error::Corrupt)?;
        self.renew(root);
        self.seek(ctx, &key)?;
        Ok(())
    }
}

fn super_decode(ctx: &TreeCtx, pgno: PageNo) -> Result<(PageBody, bool)> {
    let bytes = ctx.arena.resolve(pgno)?;
    match PageBody::decode(&bytes) {
        Ok(v) => Ok(v),
        Err(e) => {
            ctx.arena.counters.bump_decode_failure();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{Arena, Backing};
    use crate::btree::{lexicographic_cmp, put, Cmp, DbiMeta};

    fn fixture() -> (Arena, Cmp) {
        (Arena::new(4096, Backing::Malloc).unwrap(), lexicographic_cmp())
    }

    #[test]
    fn first_next_last_prev() {
        let (arena, keycmp) = fixture();
        let ctx = TreeCtx {
            arena: &arena,
            keycmp: &keycmp,
            vcmp: None,
        };
        let mut meta = DbiMeta::new(false);
        for k in [b"a", b"b", b"c"] {
            put(&ctx, &mut meta, k, b"v", PutFlags::empty()).unwrap();
        }
        let root = meta.root.unwrap();
        let mut cur = Cursor::new(root, false);
        cur.first(&ctx).unwrap();
        assert_eq!(cur.get(&ctx).unwrap().unwrap().0, b"a");
        cur.next(&ctx).unwrap();
        assert_eq!(cur.get(&ctx).unwrap().unwrap().0, b"b");
        cur.last(&ctx).unwrap();
        assert_eq!(cur.get(&ctx).unwrap().unwrap().0, b"c");
        cur.prev(&ctx).unwrap();
        assert_eq!(cur.get(&ctx).unwrap().unwrap().0, b"b");
    }

    #[test]
    fn seek_lands_on_ceiling() {
        let (arena, keycmp) = fixture();
        let ctx = TreeCtx {
            arena: &arena,
            keycmp: &keycmp,
            vcmp: None,
        };
        let mut meta = DbiMeta::new(false);
        for k in [b"a", b"c", b"e"] {
            put(&ctx, &mut meta, k, b"v", PutFlags::empty()).unwrap();
        }
        let root = meta.root.unwrap();
        let mut cur = Cursor::new(root, false);
        cur.seek(&ctx, b"b").unwrap();
        assert_eq!(cur.get(&ctx).unwrap().unwrap().0, b"c");
    }
}
