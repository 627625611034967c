//! Transaction manager (spec §4.D): top-level and nested transactions,
//! snapshot reads, single-writer serialization, commit/abort.
//!
//! Grounded in the teacher's `ReadUnit`/`WriteUnit`/`WriteTxn` split
//! (`src/lib.rs`), but nesting is modeled as an explicit frame stack
//! rather than separate child structs: `begin_nested`/`abort_top`/
//! `commit_top` push and pop a clone of the current DBI-root snapshot,
//! which is exactly "a child commit grafts its shadow roots into the
//! parent, a child abort discards them" (spec §3) without needing parent
//! pointers.

use std::collections::HashMap;
use std::sync::MutexGuard;

use crate::arena::ScratchAllocator;
use crate::btree::{self, cursor::Cursor, DbiMeta, PutFlags, TreeCtx};
use crate::env::{DbiConfig, Environment, TxnStat};
use crate::error::{Error, Result};

fn ctx_for<'a>(env: &'a Environment, cfg: &'a DbiConfig) -> TreeCtx<'a> {
    TreeCtx {
        arena: env.arena(),
        keycmp: &cfg.keycmp,
        vcmp: cfg.valcmp.as_ref(),
    }
}

/// A read-only snapshot transaction (spec §4.D, §3 "Readers see the DBI
/// roots recorded at begin").
pub struct ReadTxn<'env> {
    env: &'env Environment,
    roots: HashMap<u32, DbiMeta>,
    txn_id: u64,
}

impl Drop for ReadTxn<'_> {
    fn drop(&mut self) {
        self.env
            .0
            .active_readers
            .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
    }
}

impl<'env> ReadTxn<'env> {
    pub fn txn_id(&self) -> u64 {
        self.txn_id
    }

    /// Transaction-scoped view of environment statistics (spec §4.C
    /// `txn_stat`): same numbers as [`Environment::stat`], stamped with
    /// this transaction's id.
    pub fn txn_stat(&self) -> TxnStat {
        let stat = self.env.stat();
        TxnStat {
            txn_id: self.txn_id,
            page_size: stat.page_size,
            page_count: stat.page_count,
            write_txn_active: stat.write_txn_active,
        }
    }

    fn meta(&self, dbi: u32) -> Result<&DbiMeta> {
        self.roots.get(&dbi).ok_or(Error::NotFound)
    }

    pub fn get(&self, dbi: u32, key: &[u8]) -> Result<Vec<u8>> {
        let cfg = self.env.dbi_config(dbi)?;
        let ctx = ctx_for(self.env, &cfg);
        btree::get(&ctx, self.meta(dbi)?.root, key)
    }

    pub fn count_range(&self, dbi: u32, lo: &[u8], hi: &[u8]) -> Result<u64> {
        let cfg = self.env.dbi_config(dbi)?;
        let ctx = ctx_for(self.env, &cfg);
        btree::count_range(&ctx, self.meta(dbi)?, lo, hi)
    }

    pub fn cursor(&self, dbi: u32) -> Result<Cursor> {
        let meta = self.meta(dbi)?;
        let root = meta.root.ok_or(Error::NotFound)?;
        Ok(Cursor::new(root, meta.dupsort))
    }

    pub fn cursor_seek(&self, dbi: u32, cur: &mut Cursor, key: &[u8]) -> Result<Option<()>> {
        let cfg = self.env.dbi_config(dbi)?;
        let ctx = ctx_for(self.env, &cfg);
        cur.seek(&ctx, key)
    }

    pub fn cursor_first(&self, dbi: u32, cur: &mut Cursor) -> Result<Option<()>> {
        let cfg = self.env.dbi_config(dbi)?;
        let ctx = ctx_for(self.env, &cfg);
        cur.first(&ctx)
    }

    pub fn cursor_next(&self, dbi: u32, cur: &mut Cursor) -> Result<Option<()>> {
        let cfg = self.env.dbi_config(dbi)?;
        let ctx = ctx_for(self.env, &cfg);
        cur.next(&ctx)
    }

    pub fn cursor_get(&self, dbi: u32, cur: &Cursor) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let cfg = self.env.dbi_config(dbi)?;
        let ctx = ctx_for(self.env, &cfg);
        cur.get(&ctx)
    }
}

type WriteLog = Vec<(u32, Vec<u8>, Option<Vec<u8>>)>;

/// A read-write transaction, possibly with nested child frames (spec
/// §4.D, §3). Only the outermost frame holds the process-wide writer
/// slot; nested frames are purely local bookkeeping.
pub struct WriteTxn<'env> {
    env: &'env Environment,
    _guard: MutexGuard<'env, ()>,
    stack: Vec<HashMap<u32, DbiMeta>>,
    log: WriteLog,
    log_checkpoints: Vec<usize>,
    scratch: ScratchAllocator,
    txn_id: u64,
}

impl<'env> WriteTxn<'env> {
    pub fn txn_id(&self) -> u64 {
        self.txn_id
    }

    /// Current nesting depth; `1` means no nested frame is open.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Transaction-scoped view of environment statistics (spec §4.C
    /// `txn_stat`). `write_txn_active` is always `true` here, since holding
    /// a [`WriteTxn`] implies the writer slot is taken.
    pub fn txn_stat(&self) -> TxnStat {
        TxnStat {
            txn_id: self.txn_id,
            page_size: self.env.0.page_size,
            page_count: self.env.arena().page_count(),
            write_txn_active: true,
        }
    }

    fn top(&self) -> &HashMap<u32, DbiMeta> {
        self.stack.last().expect("write-txn frame stack is never empty")
    }

    fn top_mut(&mut self) -> &mut HashMap<u32, DbiMeta> {
        self.stack.last_mut().expect("write-txn frame stack is never empty")
    }

    fn meta_mut(&mut self, dbi: u32) -> Result<&mut DbiMeta> {
        self.top_mut().get_mut(&dbi).ok_or(Error::NotFound)
    }

    pub fn meta(&self, dbi: u32) -> Result<&DbiMeta> {
        self.top().get(&dbi).ok_or(Error::NotFound)
    }

    /// Open a nested frame (spec §3 "Nested write-txn children start from
    /// the parent's working view").
    pub fn begin_nested(&mut self) {
        let clone = self.top().clone();
        self.stack.push(clone);
        self.log_checkpoints.push(self.log.len());
        for hook in self.env.subsystems() {
            hook.on_begin();
        }
    }

    /// Discard the current nested frame, reverting to its parent's view.
    pub fn abort_top(&mut self) -> Result<()> {
        if self.stack.len() < 2 {
            return Err(Error::Error("no nested frame to abort"));
        }
        self.stack.pop();
        let checkpoint = self.log_checkpoints.pop().unwrap();
        self.log.truncate(checkpoint);
        for hook in self.env.subsystems() {
            hook.on_abort();
        }
        Ok(())
    }

    /// Graft the current nested frame's shadow roots into its parent.
    pub fn commit_top(&mut self) -> Result<()> {
        if self.stack.len() < 2 {
            return Err(Error::Error("no nested frame to commit"));
        }
        let child = self.stack.pop().unwrap();
        *self.top_mut() = child;
        self.log_checkpoints.pop();
        for hook in self.env.subsystems() {
            hook.on_commit();
        }
        Ok(())
    }

    pub fn get(&mut self, dbi: u32, key: &[u8]) -> Result<Vec<u8>> {
        let cfg = self.env.dbi_config(dbi)?;
        let ctx = ctx_for(self.env, &cfg);
        let root = self.meta(dbi)?.root;
        btree::get(&ctx, root, key)
    }

    pub fn put(&mut self, dbi: u32, key: &[u8], val: &[u8], flags: PutFlags) -> Result<()> {
        let cfg = self.env.dbi_config(dbi)?;
        let ctx = ctx_for(self.env, &cfg);
        let meta = self.meta_mut(dbi)?;
        btree::put(&ctx, meta, key, val, flags)?;
        self.log.push((dbi, key.to_vec(), Some(val.to_vec())));
        Ok(())
    }

    pub fn put_if(&mut self, dbi: u32, key: &[u8], new: &[u8], expected: Option<&[u8]>) -> Result<()> {
        let cfg = self.env.dbi_config(dbi)?;
        let ctx = ctx_for(self.env, &cfg);
        let meta = self.meta_mut(dbi)?;
        btree::put_if(&ctx, meta, key, new, expected)?;
        self.log.push((dbi, key.to_vec(), Some(new.to_vec())));
        Ok(())
    }

    pub fn del(&mut self, dbi: u32, key: &[u8]) -> Result<()> {
        let cfg = self.env.dbi_config(dbi)?;
        let ctx = ctx_for(self.env, &cfg);
        let meta = self.meta_mut(dbi)?;
        btree::del(&ctx, meta, key, None)?;
        self.log.push((dbi, key.to_vec(), None));
        Ok(())
    }

    pub fn del_dup(&mut self, dbi: u32, key: &[u8], val: &[u8]) -> Result<()> {
        let cfg = self.env.dbi_config(dbi)?;
        let ctx = ctx_for(self.env, &cfg);
        let meta = self.meta_mut(dbi)?;
        btree::del(&ctx, meta, key, Some(val))?;
        self.log.push((dbi, key.to_vec(), None));
        Ok(())
    }

    pub fn del_range(&mut self, dbi: u32, lo: &[u8], hi: &[u8]) -> Result<u64> {
        let cfg = self.env.dbi_config(dbi)?;
        let ctx = ctx_for(self.env, &cfg);
        let meta = self.meta_mut(dbi)?;
        let deleted = btree::del_range(&ctx, meta, lo, hi)?;
        for key in &deleted {
            self.log.push((dbi, key.clone(), None));
        }
        Ok(deleted.len() as u64)
    }

    pub fn count_range(&self, dbi: u32, lo: &[u8], hi: &[u8]) -> Result<u64> {
        let cfg = self.env.dbi_config(dbi)?;
        let ctx = ctx_for(self.env, &cfg);
        btree::count_range(&ctx, self.meta(dbi)?, lo, hi)
    }

    pub fn load_sorted(&mut self, dbi: u32, pairs: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let cfg = self.env.dbi_config(dbi)?;
        let ctx = ctx_for(self.env, &cfg);
        let meta = self.meta_mut(dbi)?;
        btree::load_sorted(&ctx, meta, pairs)
    }

    pub fn merge<F>(&mut self, dbi: u32, key: &[u8], operand: &[u8], callback: F) -> Result<()>
    where
        F: FnMut(Option<&[u8]>, &[u8], &mut [u8]) -> std::result::Result<usize, u16>,
    {
        let cfg = self.env.dbi_config(dbi)?;
        let ctx = ctx_for(self.env, &cfg);
        let meta = self.meta_mut(dbi)?;
        btree::merge(&ctx, meta, key, operand, callback)
    }

    pub fn cursor(&self, dbi: u32) -> Result<Cursor> {
        let meta = self.meta(dbi)?;
        let root = meta.root.ok_or(Error::NotFound)?;
        Ok(Cursor::new(root, meta.dupsort))
    }

    pub fn cursor_seek(&self, dbi: u32, cur: &mut Cursor, key: &[u8]) -> Result<Option<()>> {
        let cfg = self.env.dbi_config(dbi)?;
        let ctx = ctx_for(self.env, &cfg);
        cur.seek(&ctx, key)
    }

    pub fn cursor_first(&self, dbi: u32, cur: &mut Cursor) -> Result<Option<()>> {
        let cfg = self.env.dbi_config(dbi)?;
        let ctx = ctx_for(self.env, &cfg);
        cur.first(&ctx)
    }

    pub fn cursor_next(&self, dbi: u32, cur: &mut Cursor) -> Result<Option<()>> {
        let cfg = self.env.dbi_config(dbi)?;
        let ctx = ctx_for(self.env, &cfg);
        cur.next(&ctx)
    }

    pub fn cursor_get(&self, dbi: u32, cur: &Cursor) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let cfg = self.env.dbi_config(dbi)?;
        let ctx = ctx_for(self.env, &cfg);
        cur.get(&ctx)
    }

    pub fn cursor_put(&mut self, dbi: u32, cur: &mut Cursor, val: &[u8]) -> Result<()> {
        let cfg = self.env.dbi_config(dbi)?;
        let ctx = ctx_for(self.env, &cfg);
        let meta = self.meta_mut(dbi)?;
        cur.put(&ctx, meta, val)
    }

    pub fn cursor_del(&mut self, dbi: u32, cur: &mut Cursor) -> Result<()> {
        let cfg = self.env.dbi_config(dbi)?;
        let ctx = ctx_for(self.env, &cfg);
        let meta = self.meta_mut(dbi)?;
        cur.del(&ctx, meta)
    }

    /// Allocate transaction-scoped scratch bytes (spec §3 "a scratch bump
    /// allocator on a single page").
    pub fn scratch_alloc(&mut self, len: usize) -> Result<usize> {
        self.scratch.alloc(len)
    }

    /// Commit the outermost frame: fires subsystem `on_commit` hooks in
    /// registration order, grafts the committed roots, and flushes watch
    /// notifications (spec §4.D).
    pub fn commit(self) -> Result<()> {
        if self.stack.len() != 1 {
            return Err(Error::Error("commit called with a nested frame still open"));
        }
        log::debug!(target: "sapling::txn", "committing txn {}", self.txn_id);
        for hook in self.env.subsystems() {
            hook.on_commit();
        }
        {
            let mut roots = self.env.0.roots.lock().unwrap();
            *roots = self.stack.into_iter().next().unwrap();
        }
        self.env.watchers().lock().unwrap().dispatch(&self.log);
        Ok(())
    }

    /// Abort the whole transaction, discarding every staged frame (spec
    /// §4.D).
    pub fn abort(self) {
        log::debug!(target: "sapling::txn", "aborting txn {}", self.txn_id);
        for hook in self.env.subsystems() {
            hook.on_abort();
        }
    }
}

impl Environment {
    /// Begin a read-only snapshot transaction (spec §4.D `begin`, flag
    /// `RDONLY`).
    pub fn begin_read(&self) -> ReadTxn<'_> {
        self.0
            .active_readers
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        ReadTxn {
            env: self,
            roots: self.snapshot_roots(),
            txn_id: self.next_txn_id(),
        }
    }

    /// Begin a top-level write transaction. Returns `Busy` if another
    /// top-level write-txn is already active (spec §3, §4.D).
    pub fn begin_write(&self) -> Result<WriteTxn<'_>> {
        let guard = self
            .0
            .writer_lock
            .try_lock()
            .map_err(|_| Error::Busy)?;
        for hook in self.subsystems() {
            hook.on_begin();
        }
        Ok(WriteTxn {
            env: self,
            _guard: guard,
            stack: vec![self.snapshot_roots()],
            log: Vec::new(),
            log_checkpoints: Vec::new(),
            scratch: ScratchAllocator::new(self.0.page_size),
            txn_id: self.next_txn_id(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Config, DbiFlags};

    fn fixture() -> Environment {
        let env = Environment::open(Config::default()).unwrap();
        env.dbi_open(0, None, DbiFlags::empty()).unwrap();
        env
    }

    #[test]
    fn read_your_write_within_txn() {
        let env = fixture();
        let mut txn = env.begin_write().unwrap();
        txn.put(0, b"a", b"1", PutFlags::empty()).unwrap();
        assert_eq!(txn.get(0, b"a").unwrap(), b"1");
        txn.commit().unwrap();
        let read = env.begin_read();
        assert_eq!(read.get(0, b"a").unwrap(), b"1");
    }

    #[test]
    fn second_top_level_writer_is_busy() {
        let env = fixture();
        let _first = env.begin_write().unwrap();
        assert!(matches!(env.begin_write(), Err(Error::Busy)));
    }

    #[test]
    fn txn_stat_reports_txn_id_and_write_activity() {
        let env = fixture();
        let read = env.begin_read();
        let read_stat = read.txn_stat();
        assert_eq!(read_stat.txn_id, read.txn_id());
        assert!(!read_stat.write_txn_active);
        drop(read);

        let txn = env.begin_write().unwrap();
        let write_stat = txn.txn_stat();
        assert_eq!(write_stat.txn_id, txn.txn_id());
        assert!(write_stat.write_txn_active);
        assert_eq!(write_stat.page_size, env.stat().page_size);
    }

    #[test]
    fn nested_abort_discards_child_only() {
        let env = fixture();
        let mut txn = env.begin_write().unwrap();
        txn.put(0, b"a", b"1", PutFlags::empty()).unwrap();
        txn.begin_nested();
        txn.put(0, b"b", b"2", PutFlags::empty()).unwrap();
        txn.abort_top().unwrap();
        assert_eq!(txn.get(0, b"a").unwrap(), b"1");
        assert!(matches!(txn.get(0, b"b"), Err(Error::NotFound)));

        txn.begin_nested();
        txn.put(0, b"b", b"3", PutFlags::empty()).unwrap();
        txn.commit_top().unwrap();
        txn.commit().unwrap();

        let read = env.begin_read();
        assert_eq!(read.get(0, b"a").unwrap(), b"1");
        assert_eq!(read.get(0, b"b").unwrap(), b"3");
    }
}
