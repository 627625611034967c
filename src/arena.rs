//! Page arena (spec §4.A): a fixed-size page allocator with pluggable
//! backing hooks. Resolves stable page numbers to page contents and never
//! calls back out to the OS within a page's lifetime once a backing is
//! chosen at `Environment` construction.
//!
//! Grounded in `crab-db-alloc`'s `StorageInner`/`RawMemory` split (teacher
//! `src/storage.rs`, `src/lib.rs`): one piece owns the actual bytes behind a
//! lock, another hands out cheap read-only clones. Unlike the teacher, pages
//! here are plain `Arc<[u8]>` slots in a growable vector rather than raw
//! pointers into a memory map, which keeps the arena entirely safe code
//! while preserving the same allocate/free/resolve contract.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use memmap2::MmapMut;

use crate::error::{Error, Result};
use crate::page::{PageNo, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};

/// Caller-supplied allocation hooks for a fully custom backing (spec §4.A:
/// "or fully custom (caller-supplied page alloc/free callbacks) option").
pub trait PageBacking: Send + Sync {
    /// Produce a zeroed buffer of exactly `page_size` bytes.
    fn alloc(&self, page_size: usize) -> Result<Vec<u8>>;
    /// Release a previously allocated buffer. Default is a no-op; most
    /// custom backings only need to track bookkeeping, not actually free
    /// memory, since the arena keeps the bytes around regardless.
    fn free(&self, _page: Vec<u8>) {}
}

/// Plain heap allocation, zero-filled.
struct MallocBacking;

impl PageBacking for MallocBacking {
    fn alloc(&self, page_size: usize) -> Result<Vec<u8>> {
        Ok(vec![0u8; page_size])
    }
}

/// Anonymous-mmap-backed allocation. Each page gets its own small mapping;
/// this exists to exercise the same `memmap2` dependency the teacher uses
/// for its backing store, scoped down to per-page granularity since this
/// arena does not memory-map a single growable file (spec out-of-scope:
/// "multi-process shared storage").
struct MmapBacking;

impl PageBacking for MmapBacking {
    fn alloc(&self, page_size: usize) -> Result<Vec<u8>> {
        let map = MmapMut::map_anon(page_size).map_err(Error::Io)?;
        Ok(map.to_vec())
    }
}

/// Which backing a freshly opened [`Arena`] uses.
pub enum Backing {
    Malloc,
    Mmap,
    Custom(Arc<dyn PageBacking>),
}

impl Backing {
    fn hooks(&self) -> Arc<dyn PageBacking> {
        match self {
            Backing::Malloc => Arc::new(MallocBacking),
            Backing::Mmap => Arc::new(MmapBacking),
            Backing::Custom(hooks) => hooks.clone(),
        }
    }
}

/// Corruption-guard counters (spec §3 "Corruption-guard counters are
/// monotonically increasing", spec §4.A hardening note).
#[derive(Default)]
pub struct CorruptionCounters {
    pub free_list_head_reset: AtomicU64,
    pub decode_failures: AtomicU64,
}

impl CorruptionCounters {
    fn bump_free_list_reset(&self) {
        self.free_list_head_reset.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }
}

struct ArenaInner {
    /// Slot 0 is the reserved null page and is always `None`.
    pages: Vec<Option<Arc<[u8]>>>,
    free_list: Vec<u32>,
    backing: Arc<dyn PageBacking>,
}

/// The page arena for one environment. A single page size is fixed at
/// construction and never changes (spec §4.A).
pub struct Arena {
    page_size: usize,
    inner: RwLock<ArenaInner>,
    /// Serializes allocation bookkeeping; only the writer ever allocates, but
    /// the lock also protects the free list from concurrent corruption-guard
    /// resets.
    alloc_lock: Mutex<()>,
    pub counters: Arc<CorruptionCounters>,
}

impl Arena {
    pub fn new(page_size: usize, backing: Backing) -> Result<Self> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(Error::Range);
        }
        Ok(Self {
            page_size,
            inner: RwLock::new(ArenaInner {
                pages: vec![None],
                free_list: Vec::new(),
                backing: backing.hooks(),
            }),
            alloc_lock: Mutex::new(()),
            counters: Arc::new(CorruptionCounters::default()),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> usize {
        self.inner.read().unwrap().pages.len().saturating_sub(1)
    }

    /// Allocate a page, reusing a freed slot if the free list has one,
    /// otherwise extending the arena. Returns the new page number and its
    /// (zeroed) content.
    pub fn alloc_page(&self) -> Result<(PageNo, Arc<[u8]>)> {
        let _guard = self.alloc_lock.lock().unwrap();
        let mut inner = self.inner.write().unwrap();
        let fresh: Arc<[u8]> = inner.backing.alloc(self.page_size)?.into();

        while let Some(pgno) = inner.free_list.pop() {
            match inner.pages.get(pgno as usize) {
                Some(None) => {
                    inner.pages[pgno as usize] = Some(fresh.clone());
                    let pgno = PageNo::new(pgno).ok_or(Error::Corrupt)?;
                    return Ok((pgno, fresh));
                }
                _ => {
                    // Free-list entry pointed at a page that's not actually
                    // free (or out of range): reset rather than trust it.
                    inner.free_list.clear();
                    self.counters.bump_free_list_reset();
                    break;
                }
            }
        }

        let pgno = inner.pages.len() as u32;
        inner.pages.push(Some(fresh.clone()));
        let pgno = PageNo::new(pgno).ok_or(Error::Corrupt)?;
        Ok((pgno, fresh))
    }

    /// Release a page back to the free list. Callers in the B+ tree's
    /// copy-on-write write path deliberately do NOT call this for
    /// replaced node versions (spec §9 open question: COW-replaced pages
    /// are not reclaimed within a process lifetime); this exists as a
    /// general primitive used for truly dead pages (e.g. a whole DBI being
    /// dropped) and is exercised directly by arena-level tests.
    pub fn free_page(&self, pgno: PageNo) {
        let _guard = self.alloc_lock.lock().unwrap();
        let mut inner = self.inner.write().unwrap();
        let idx = pgno.get() as usize;
        if let Some(slot) = inner.pages.get_mut(idx) {
            if let Some(old) = slot.take() {
                if let Ok(owned) = Arc::try_unwrap(old) {
                    inner.backing.free(owned.into_vec());
                }
            }
            inner.free_list.push(pgno.get());
        }
    }

    /// Resolve a page number to its current contents.
    pub fn resolve(&self, pgno: PageNo) -> Result<Arc<[u8]>> {
        let inner = self.inner.read().unwrap();
        match inner.pages.get(pgno.get() as usize) {
            Some(Some(page)) => Ok(page.clone()),
            _ => Err(Error::Corrupt),
        }
    }

    /// Commit a newly produced page contents under a page number that was
    /// previously returned by [`Arena::alloc_page`]. Used by the
    /// transaction manager when a write-txn's scratch pages graft into the
    /// arena at commit.
    pub fn write_page(&self, pgno: PageNo, content: Arc<[u8]>) -> Result<()> {
        debug_assert_eq!(content.len(), self.page_size);
        let mut inner = self.inner.write().unwrap();
        let idx = pgno.get() as usize;
        let slot = inner.pages.get_mut(idx).ok_or(Error::Corrupt)?;
        *slot = Some(content);
        Ok(())
    }
}

/// A bump allocator scoped to a single scratch page for transaction-local
/// allocation (spec §3: "a scratch bump allocator on a single page").
pub struct ScratchAllocator {
    buf: Vec<u8>,
    used: usize,
}

impl ScratchAllocator {
    pub fn new(page_size: usize) -> Self {
        Self {
            buf: vec![0u8; page_size],
            used: 0,
        }
    }

    /// Allocate `len` bytes from the scratch page, returning their offset.
    pub fn alloc(&mut self, len: usize) -> Result<usize> {
        if self.used + len > self.buf.len() {
            return Err(Error::Oom);
        }
        let off = self.used;
        self.used += len;
        Ok(off)
    }

    pub fn slice(&self, off: usize, len: usize) -> &[u8] {
        &self.buf[off..off + len]
    }

    pub fn slice_mut(&mut self, off: usize, len: usize) -> &mut [u8] {
        &mut self.buf[off..off + len]
    }

    pub fn reset(&mut self) {
        self.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_resolve_roundtrip() {
        let arena = Arena::new(DEFAULT_PAGE_SIZE, Backing::Malloc).unwrap();
        let (pgno, content) = arena.alloc_page().unwrap();
        assert_eq!(content.len(), DEFAULT_PAGE_SIZE);
        let resolved = arena.resolve(pgno).unwrap();
        assert_eq!(&*resolved, &*content);
    }

    #[test]
    fn free_list_reuse() {
        let arena = Arena::new(DEFAULT_PAGE_SIZE, Backing::Malloc).unwrap();
        let (pgno_a, _) = arena.alloc_page().unwrap();
        arena.free_page(pgno_a);
        let (pgno_b, _) = arena.alloc_page().unwrap();
        assert_eq!(pgno_a, pgno_b);
    }

    #[test]
    fn corrupt_free_list_entry_resets_head() {
        let arena = Arena::new(DEFAULT_PAGE_SIZE, Backing::Malloc).unwrap();
        {
            let mut inner = arena.inner.write().unwrap();
            inner.free_list.push(9999);
        }
        let before = arena.counters.free_list_head_reset.load(Ordering::Relaxed);
        let _ = arena.alloc_page().unwrap();
        let after = arena.counters.free_list_head_reset.load(Ordering::Relaxed);
        assert_eq!(after, before + 1);
    }

    #[test]
    fn rejects_out_of_range_page_size() {
        assert!(Arena::new(32, Backing::Malloc).is_err());
        assert!(Arena::new(1 << 20, Backing::Malloc).is_err());
    }
}
