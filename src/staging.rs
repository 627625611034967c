//! Per-attempt staging context: a read set, a write set, and an intent
//! buffer layered over a snapshot read transaction, with a nested frame
//! stack so an atomic function can open and discard sub-scopes of its own
//! staged work without touching the outer frame.

use crate::error::{Error, Result};
use crate::txn::{ReadTxn, WriteTxn};

/// One observed read, recorded the first time a key is touched so a later
/// validation pass can detect whether the live store has since diverged.
#[derive(Clone, Debug)]
pub struct ReadEntry {
    pub dbi: u32,
    pub key: Vec<u8>,
    pub exists: bool,
    pub val: Option<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteKind {
    Put,
    Del,
}

#[derive(Clone, Debug)]
pub struct WriteEntry {
    pub dbi: u32,
    pub key: Vec<u8>,
    pub kind: WriteKind,
    pub val: Option<Vec<u8>>,
}

#[derive(Clone, Default)]
struct Frame {
    reads: Vec<ReadEntry>,
    writes: Vec<WriteEntry>,
    intents: Vec<Vec<u8>>,
}

fn coalesce_write(writes: &mut Vec<WriteEntry>, dbi: u32, key: &[u8], kind: WriteKind, val: Option<Vec<u8>>) {
    if let Some(existing) = writes.iter_mut().find(|w| w.dbi == dbi && w.key == key) {
        existing.kind = kind;
        existing.val = val;
        return;
    }
    writes.push(WriteEntry {
        dbi,
        key: key.to_vec(),
        kind,
        val,
    });
}

fn merge_read(reads: &mut Vec<ReadEntry>, entry: ReadEntry) {
    if reads.iter().any(|r| r.dbi == entry.dbi && r.key == entry.key) {
        return;
    }
    reads.push(entry);
}

/// The staged state for one attempt: read set, write set, and intent
/// buffer, with a push/abort/commit frame stack for nested scopes.
pub struct TxnStage {
    frames: Vec<Frame>,
}

impl Default for TxnStage {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnStage {
    pub fn new() -> Self {
        Self {
            frames: vec![Frame::default()],
        }
    }

    /// Reset to a single empty frame, for reuse across attempts.
    pub fn reset(&mut self) {
        self.frames.clear();
        self.frames.push(Frame::default());
    }

    fn top(&self) -> &Frame {
        self.frames.last().expect("staging frame stack is never empty")
    }

    fn top_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("staging frame stack is never empty")
    }

    /// Open a nested frame, inheriting the parent's current write set so
    /// read-your-write sees through to it.
    pub fn push(&mut self) {
        let writes = self.top().writes.clone();
        self.frames.push(Frame {
            reads: Vec::new(),
            writes,
            intents: Vec::new(),
        });
    }

    /// Discard the top frame's staged reads, writes, and intents.
    pub fn abort_top(&mut self) -> Result<()> {
        if self.frames.len() < 2 {
            return Err(Error::Error("no nested staging frame to abort"));
        }
        self.frames.pop();
        Ok(())
    }

    /// Merge the top frame's reads, writes, and intents into its parent.
    pub fn commit_top(&mut self) -> Result<()> {
        if self.frames.len() < 2 {
            return Err(Error::Error("no nested staging frame to commit"));
        }
        let child = self.frames.pop().unwrap();
        let parent = self.top_mut();
        for read in child.reads {
            merge_read(&mut parent.reads, read);
        }
        parent.writes = child.writes;
        parent.intents.extend(child.intents);
        Ok(())
    }

    /// Read a key, checking the staged write set first (read-your-write),
    /// then the read set cache, falling through to the snapshot
    /// transaction and recording the observation on first access.
    pub fn read(&mut self, txn: &ReadTxn<'_>, dbi: u32, key: &[u8]) -> Result<Vec<u8>> {
        if let Some(write) = self.top().writes.iter().find(|w| w.dbi == dbi && w.key == key) {
            return match write.kind {
                WriteKind::Put => Ok(write.val.clone().unwrap_or_default()),
                WriteKind::Del => Err(Error::NotFound),
            };
        }
        if let Some(read) = self.top().reads.iter().find(|r| r.dbi == dbi && r.key == key) {
            return match &read.val {
                Some(v) => Ok(v.clone()),
                None => Err(Error::NotFound),
            };
        }
        let result = txn.get(dbi, key);
        let entry = match &result {
            Ok(v) => ReadEntry {
                dbi,
                key: key.to_vec(),
                exists: true,
                val: Some(v.clone()),
            },
            Err(Error::NotFound) => ReadEntry {
                dbi,
                key: key.to_vec(),
                exists: false,
                val: None,
            },
            Err(_) => return result,
        };
        self.top_mut().reads.push(entry);
        result
    }

    pub fn stage_put(&mut self, dbi: u32, key: &[u8], val: &[u8]) {
        coalesce_write(&mut self.top_mut().writes, dbi, key, WriteKind::Put, Some(val.to_vec()));
    }

    pub fn stage_del(&mut self, dbi: u32, key: &[u8]) {
        coalesce_write(&mut self.top_mut().writes, dbi, key, WriteKind::Del, None);
    }

    pub fn push_intent(&mut self, frame: Vec<u8>) {
        self.top_mut().intents.push(frame);
    }

    pub fn writes(&self) -> &[WriteEntry] {
        &self.top().writes
    }

    pub fn intents(&self) -> &[Vec<u8>] {
        &self.top().intents
    }

    /// Re-read every recorded observation against the live write
    /// transaction; any divergence in existence or bytes is a conflict.
    pub fn validate(&self, txn: &mut WriteTxn<'_>) -> Result<()> {
        for entry in &self.top().reads {
            let live = txn.get(entry.dbi, &entry.key);
            match (&entry.val, live) {
                (Some(expected), Ok(actual)) if expected == &actual => {}
                (None, Err(Error::NotFound)) => {}
                (_, Err(Error::NotFound)) if entry.exists => return Err(Error::Conflict),
                (_, Ok(_)) if !entry.exists => return Err(Error::Conflict),
                (_, Ok(_)) => return Err(Error::Conflict),
                (_, Err(e)) => return Err(e),
            }
        }
        Ok(())
    }

    /// Issue every staged write against the live write transaction, in
    /// insertion order.
    pub fn apply(&self, txn: &mut WriteTxn<'_>) -> Result<()> {
        for entry in &self.top().writes {
            match entry.kind {
                WriteKind::Put => {
                    txn.put(entry.dbi, &entry.key, entry.val.as_deref().unwrap_or(&[]), crate::btree::PutFlags::empty())?;
                }
                WriteKind::Del => match txn.del(entry.dbi, &entry.key) {
                    Ok(()) | Err(Error::NotFound) => {}
                    Err(e) => return Err(e),
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Config, DbiFlags, Environment};

    fn fixture() -> Environment {
        let env = Environment::open(Config::default()).unwrap();
        env.dbi_open(0, None, DbiFlags::empty()).unwrap();
        env
    }

    #[test]
    fn read_your_write_sees_staged_put() {
        let env = fixture();
        let read = env.begin_read();
        let mut stage = TxnStage::new();
        stage.stage_put(0, b"a", b"1");
        assert_eq!(stage.read(&read, 0, b"a").unwrap(), b"1");
    }

    #[test]
    fn read_your_write_sees_staged_del() {
        let env = fixture();
        {
            let mut txn = env.begin_write().unwrap();
            txn.put(0, b"a", b"1", crate::btree::PutFlags::empty()).unwrap();
            txn.commit().unwrap();
        }
        let read = env.begin_read();
        let mut stage = TxnStage::new();
        stage.stage_del(0, b"a");
        assert!(matches!(stage.read(&read, 0, b"a"), Err(Error::NotFound)));
    }

    #[test]
    fn nested_commit_merges_into_parent() {
        let env = fixture();
        let read = env.begin_read();
        let mut stage = TxnStage::new();
        stage.push();
        stage.stage_put(0, b"b", b"2");
        stage.push_intent(vec![1, 2, 3]);
        stage.commit_top().unwrap();
        assert_eq!(stage.read(&read, 0, b"b").unwrap(), b"2");
        assert_eq!(stage.intents().len(), 1);
    }

    #[test]
    fn nested_abort_discards_child() {
        let env = fixture();
        let read = env.begin_read();
        let mut stage = TxnStage::new();
        stage.push();
        stage.stage_put(0, b"b", b"2");
        stage.abort_top().unwrap();
        assert!(matches!(stage.read(&read, 0, b"b"), Err(Error::NotFound)));
    }

    #[test]
    fn validate_detects_conflicting_write() {
        let env = fixture();
        let mut stage = TxnStage::new();
        {
            let read = env.begin_read();
            assert!(matches!(stage.read(&read, 0, b"a"), Err(Error::NotFound)));
        }
        {
            let mut writer = env.begin_write().unwrap();
            writer.put(0, b"a", b"concurrent", crate::btree::PutFlags::empty()).unwrap();
            writer.commit().unwrap();
        }
        let mut txn = env.begin_write().unwrap();
        assert!(matches!(stage.validate(&mut txn), Err(Error::Conflict)));
        txn.abort();
    }
}
