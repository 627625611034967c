//! Environment & DBI registry (spec §4.C).
//!
//! Grounded in the teacher's `DbCore`/`OpenOptions` split (`src/lib.rs`):
//! one `Arc`-shared core holds the arena, the committed DBI roots, and the
//! writer slot; `Environment` itself is a cheap `Arc` handle, cloneable the
//! same way the teacher's `ReadUnit` is.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::arena::{Arena, Backing, CorruptionCounters};
use crate::btree::{lexicographic_cmp, Cmp, DbiMeta};
use crate::error::{Error, Result};
use crate::page::DEFAULT_PAGE_SIZE;
use crate::watch::{WatchFn, WatcherRegistry};

/// Maximum DBI id (spec §3: "MAX_DBI ≥ 32").
pub const MAX_DBI: u32 = 64;

/// Per-subsystem transactional state slots (spec §4.D).
pub const SAP_MAX_SUBSYSTEMS: usize = 8;

/// Flags a DBI is opened with (spec §3).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DbiFlags(u8);

impl DbiFlags {
    pub const DUPSORT: DbiFlags = DbiFlags(0b01);
    pub const TTL_META: DbiFlags = DbiFlags(0b10);

    pub const fn empty() -> Self {
        DbiFlags(0)
    }

    pub fn contains(self, flag: DbiFlags) -> bool {
        self.0 & flag.0 == flag.0
    }
}

impl std::ops::BitOr for DbiFlags {
    type Output = DbiFlags;
    fn bitor(self, rhs: DbiFlags) -> DbiFlags {
        DbiFlags(self.0 | rhs.0)
    }
}

/// Per-DBI comparators and flags, fixed once opened.
#[derive(Clone)]
pub struct DbiConfig {
    pub keycmp: Cmp,
    pub valcmp: Option<Cmp>,
    pub flags: DbiFlags,
}

/// Configuration for opening an [`Environment`] (ambient: mirrors the
/// teacher's `OpenOptions` builder, spec §4.C `open(page_size, cmp, ctx)`).
#[derive(Clone)]
pub struct Config {
    pub page_size: usize,
    pub backing: BackingKind,
    pub default_keycmp: Cmp,
}

/// Which page backing a fresh [`Environment`] should use. A thin wrapper
/// around [`Backing`] so callers needn't import the arena module directly.
#[derive(Clone)]
pub enum BackingKind {
    Malloc,
    Mmap,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            backing: BackingKind::Malloc,
            default_keycmp: lexicographic_cmp(),
        }
    }
}

/// Environment-wide statistics (spec §4.C `stat`; ambient: named struct
/// rather than a tuple, matching the teacher's preference for named
/// fields over positional returns, e.g. `RootHeader`).
#[derive(Clone, Debug)]
pub struct EnvStat {
    pub page_size: usize,
    pub page_count: usize,
    pub dbi_count: usize,
    pub write_txn_active: bool,
}

/// Per-DBI statistics (spec §4.C `dbi_stat`).
#[derive(Clone, Debug)]
pub struct DbiStat {
    pub count: u64,
    pub depth: u32,
    pub dupsort: bool,
}

/// Per-transaction statistics (spec §4.C `txn_stat`): the same
/// environment-wide numbers as [`EnvStat`], plus the transaction's own id.
#[derive(Clone, Debug)]
pub struct TxnStat {
    pub txn_id: u64,
    pub page_size: usize,
    pub page_count: usize,
    pub write_txn_active: bool,
}

/// Hooks a subsystem can attach to transaction boundaries (spec §4.D:
/// "Per-subsystem state slots ... allow ... modules to attach
/// transactional state via `{on_begin, on_commit, on_abort,
/// on_env_destroy}`").
pub trait SubsystemHooks: Send + Sync {
    fn on_begin(&self) {}
    fn on_commit(&self) {}
    fn on_abort(&self) {}
    fn on_env_destroy(&self) {}
}

pub(crate) struct EnvInner {
    pub(crate) arena: Arena,
    pub(crate) page_size: usize,
    pub(crate) dbis: RwLock<HashMap<u32, DbiConfig>>,
    pub(crate) roots: Mutex<HashMap<u32, DbiMeta>>,
    pub(crate) writer_lock: Mutex<()>,
    pub(crate) active_readers: AtomicUsize,
    pub(crate) next_txn_id: AtomicU64,
    pub(crate) watchers: Mutex<WatcherRegistry>,
    pub(crate) subsystems: Mutex<Vec<Arc<dyn SubsystemHooks>>>,
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        for hook in self.subsystems.lock().unwrap().iter() {
            hook.on_env_destroy();
        }
    }
}

/// A cheap, `Arc`-backed handle to one storage environment (spec §4.C).
#[derive(Clone)]
pub struct Environment(pub(crate) Arc<EnvInner>);

impl Environment {
    /// Open a fresh in-memory environment (spec §4.C `open`).
    pub fn open(config: Config) -> Result<Environment> {
        let backing = match config.backing {
            BackingKind::Malloc => Backing::Malloc,
            BackingKind::Mmap => Backing::Mmap,
        };
        let arena = Arena::new(config.page_size, backing)?;
        Ok(Environment(Arc::new(EnvInner {
            page_size: config.page_size,
            arena,
            dbis: RwLock::new(HashMap::new()),
            roots: Mutex::new(HashMap::new()),
            writer_lock: Mutex::new(()),
            active_readers: AtomicUsize::new(0),
            next_txn_id: AtomicU64::new(1),
            watchers: Mutex::new(WatcherRegistry::default()),
            subsystems: Mutex::new(Vec::new()),
        })))
    }

    pub(crate) fn arena(&self) -> &Arena {
        &self.0.arena
    }

    pub(crate) fn counters(&self) -> &Arc<CorruptionCounters> {
        &self.0.arena.counters
    }

    fn no_active_txns(&self) -> bool {
        self.0.active_readers.load(Ordering::SeqCst) == 0 && self.0.writer_lock.try_lock().is_ok()
    }

    /// Open (or reconfigure the flags of) a DBI. Requires no active
    /// transactions (spec §4.C).
    pub fn dbi_open(&self, dbi: u32, keycmp: Option<Cmp>, flags: DbiFlags) -> Result<()> {
        if dbi >= MAX_DBI {
            return Err(Error::Range);
        }
        if !self.no_active_txns() {
            return Err(Error::Busy);
        }
        let mut dbis = self.0.dbis.write().unwrap();
        let keycmp = keycmp.unwrap_or_else(|| dbis.get(&dbi).map(|c| c.keycmp.clone())
            .unwrap_or_else(lexicographic_cmp));
        let valcmp = dbis.get(&dbi).and_then(|c| c.valcmp.clone());
        dbis.insert(
            dbi,
            DbiConfig {
                keycmp,
                valcmp,
                flags,
            },
        );
        drop(dbis);
        let mut roots = self.0.roots.lock().unwrap();
        roots
            .entry(dbi)
            .or_insert_with(|| DbiMeta::new(flags.contains(DbiFlags::DUPSORT)));
        Ok(())
    }

    /// Mark a DBI as dupsort with the given value comparator (spec §4.C
    /// `dbi_set_dupsort`). Requires no active transactions.
    pub fn dbi_set_dupsort(&self, dbi: u32, valcmp: Cmp) -> Result<()> {
        if !self.no_active_txns() {
            return Err(Error::Busy);
        }
        let mut dbis = self.0.dbis.write().unwrap();
        let cfg = dbis.get_mut(&dbi).ok_or(Error::NotFound)?;
        cfg.valcmp = Some(valcmp);
        cfg.flags = cfg.flags | DbiFlags::DUPSORT;
        drop(dbis);
        let mut roots = self.0.roots.lock().unwrap();
        if let Some(meta) = roots.get_mut(&dbi) {
            meta.dupsort = true;
        }
        Ok(())
    }

    pub(crate) fn dbi_config(&self, dbi: u32) -> Result<DbiConfig> {
        self.0
            .dbis
            .read()
            .unwrap()
            .get(&dbi)
            .cloned()
            .ok_or(Error::NotFound)
    }

    pub fn register_subsystem(&self, hooks: Arc<dyn SubsystemHooks>) {
        self.0.subsystems.lock().unwrap().push(hooks);
    }

    pub(crate) fn subsystems(&self) -> Vec<Arc<dyn SubsystemHooks>> {
        self.0.subsystems.lock().unwrap().clone()
    }

    pub(crate) fn watchers(&self) -> &Mutex<WatcherRegistry> {
        &self.0.watchers
    }

    pub(crate) fn next_txn_id(&self) -> u64 {
        self.0.next_txn_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn snapshot_roots(&self) -> HashMap<u32, DbiMeta> {
        self.0.roots.lock().unwrap().clone()
    }

    pub fn stat(&self) -> EnvStat {
        EnvStat {
            page_size: self.0.page_size,
            page_count: self.0.arena.page_count(),
            dbi_count: self.0.dbis.read().unwrap().len(),
            write_txn_active: self.0.writer_lock.try_lock().is_err(),
        }
    }

    pub fn dbi_stat(&self, dbi: u32) -> Result<DbiStat> {
        let roots = self.0.roots.lock().unwrap();
        let meta = roots.get(&dbi).ok_or(Error::NotFound)?;
        Ok(DbiStat {
            count: meta.count,
            depth: meta.depth,
            dupsort: meta.dupsort,
        })
    }

    /// Register a commit-time watch on `(dbi, prefix)`. Requires no active
    /// transactions and rejects a dupsort DBI (spec §4.E).
    pub fn register_watch(
        &self,
        dbi: u32,
        prefix: &[u8],
        identity: usize,
        callback: WatchFn,
        ctx: Arc<dyn std::any::Any + Send + Sync>,
    ) -> Result<()> {
        if !self.no_active_txns() {
            return Err(Error::Busy);
        }
        let dupsort = self
            .0
            .dbis
            .read()
            .unwrap()
            .get(&dbi)
            .ok_or(Error::NotFound)?
            .flags
            .contains(DbiFlags::DUPSORT);
        if dupsort {
            return Err(Error::InvalidData("dupsort DBIs may not be watched"));
        }
        self.0.watchers.lock().unwrap().register(dbi, prefix, identity, callback, ctx)
    }

    /// Unregister a watch previously added with [`register_watch`].
    /// Requires no active transactions (spec §4.E).
    pub fn unregister_watch(&self, dbi: u32, prefix: &[u8], identity: usize) -> Result<()> {
        if !self.no_active_txns() {
            return Err(Error::Busy);
        }
        self.0.watchers.lock().unwrap().unregister(dbi, prefix, identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dbi_open_seeds_default_meta() {
        let env = Environment::open(Config::default()).unwrap();
        env.dbi_open(0, None, DbiFlags::empty()).unwrap();
        let stat = env.dbi_stat(0).unwrap();
        assert_eq!(stat.count, 0);
        assert!(!stat.dupsort);
    }

    #[test]
    fn dbi_open_rejects_out_of_range_id() {
        let env = Environment::open(Config::default()).unwrap();
        assert!(matches!(
            env.dbi_open(MAX_DBI, None, DbiFlags::empty()),
            Err(Error::Range)
        ));
    }

    #[test]
    fn dbi_set_dupsort_requires_open_dbi() {
        let env = Environment::open(Config::default()).unwrap();
        assert!(matches!(
            env.dbi_set_dupsort(1, lexicographic_cmp()),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn register_watch_rejects_dupsort_dbi() {
        let env = Environment::open(Config::default()).unwrap();
        env.dbi_open(0, None, DbiFlags::DUPSORT).unwrap();
        env.dbi_set_dupsort(0, lexicographic_cmp()).unwrap();
        let cb: WatchFn = Arc::new(|_, _, _, _| {});
        assert!(matches!(
            env.register_watch(0, b"a", 1, cb, Arc::new(())),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn register_watch_busy_with_open_write_txn() {
        let env = Environment::open(Config::default()).unwrap();
        env.dbi_open(0, None, DbiFlags::empty()).unwrap();
        let _txn = env.begin_write().unwrap();
        let cb: WatchFn = Arc::new(|_, _, _, _| {});
        assert!(matches!(
            env.register_watch(0, b"a", 1, cb, Arc::new(())),
            Err(Error::Busy)
        ));
    }
}
