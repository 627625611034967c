//! Outbox and timer publishers: DBI-backed durable queues keyed by
//! sequence, and by `(due-ts, seq)` respectively, with a drain loop that
//! hands frames to a caller handler outside of any transaction and only
//! removes them once the handler has seen them.

use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{BigEndian, ByteOrder};

use crate::btree::PutFlags;
use crate::codec::{Intent, IntentKind};
use crate::env::Environment;
use crate::error::{Error, Result};

/// Big-endian `u64` sequence key for the outbox DBI.
pub fn outbox_key(seq: u64) -> [u8; 8] {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, seq);
    buf
}

/// `flip-signed-bit(due_ts) || seq`, both big-endian, so byte order is
/// chronological then FIFO (spec §4.J).
pub fn timer_key(due_ts: i64, seq: u64) -> [u8; 16] {
    let mut buf = [0u8; 16];
    let flipped = (due_ts as u64) ^ (1u64 << 63);
    BigEndian::write_u64(&mut buf[0..8], flipped);
    BigEndian::write_u64(&mut buf[8..16], seq);
    buf
}

/// Append one frame under a fresh key, failing `EXISTS` if the key is
/// somehow already taken (spec §4.J `append_frame`).
pub fn append_frame(env: &Environment, dbi: u32, key: &[u8], frame: &[u8]) -> Result<()> {
    let mut txn = env.begin_write()?;
    txn.put(dbi, key, frame, PutFlags::NOOVERWRITE)?;
    txn.commit()
}

/// Drain up to `limit` frames from `dbi` in ascending key order, handing
/// each to `handler` outside of a transaction, then deleting it in a
/// short write-txn that first verifies the row is unchanged (spec §4.J
/// `drain`). A concurrent mutation of the row stops the drain early
/// without treating it as an error; a handler error stops the drain and
/// is surfaced to the caller.
pub fn drain<F>(env: &Environment, dbi: u32, limit: u32, mut handler: F) -> Result<u32>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    let mut processed = 0u32;
    while processed < limit {
        let next = {
            let read = env.begin_read();
            let mut cur = match read.cursor(dbi) {
                Ok(c) => c,
                Err(Error::NotFound) => break,
                Err(e) => return Err(e),
            };
            if read.cursor_first(dbi, &mut cur)?.is_none() {
                break;
            }
            read.cursor_get(dbi, &cur)?
        };
        let Some((key, val)) = next else { break };

        handler(&val)?;

        let mut txn = env.begin_write()?;
        match txn.get(dbi, &key) {
            Ok(current) if current == val => {
                txn.del(dbi, &key)?;
                txn.commit()?;
                processed += 1;
            }
            Ok(_) | Err(Error::NotFound) => {
                txn.abort();
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(processed)
}

/// Reads a single frame back by sequence, for tests and operational
/// inspection (`outbox_get` in spec §8 scenario S2).
pub fn get_by_seq(env: &Environment, dbi: u32, seq: u64) -> Result<Vec<u8>> {
    env.begin_read().get(dbi, &outbox_key(seq))
}

/// Publishes `OUTBOX_EMIT` intents into the outbox DBI, keyed by a
/// monotonically increasing sequence (spec §4.J, §4.L).
pub struct OutboxPublisher {
    env: Environment,
    dbi: u32,
    next_seq: AtomicU64,
}

impl OutboxPublisher {
    pub fn new(env: Environment, dbi: u32, initial_seq: u64) -> Self {
        Self {
            env,
            dbi,
            next_seq: AtomicU64::new(initial_seq),
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst)
    }

    pub fn publish(&self, intent: &Intent<'_>) -> Result<()> {
        if intent.kind != IntentKind::OutboxEmit {
            return Err(Error::InvalidData("outbox publisher received a non-outbox intent"));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        append_frame(&self.env, self.dbi, &outbox_key(seq), intent.message)
    }

    pub fn drain<F>(&self, limit: u32, handler: F) -> Result<u32>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        drain(&self.env, self.dbi, limit, handler)
    }
}

/// Publishes `TIMER_ARM` intents into the timer DBI, keyed by
/// `(due-ts, seq)` (spec §4.J, §4.L).
pub struct TimerPublisher {
    env: Environment,
    dbi: u32,
    next_seq: AtomicU64,
}

impl TimerPublisher {
    pub fn new(env: Environment, dbi: u32, initial_seq: u64) -> Self {
        Self {
            env,
            dbi,
            next_seq: AtomicU64::new(initial_seq),
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst)
    }

    pub fn publish(&self, intent: &Intent<'_>) -> Result<()> {
        if intent.kind != IntentKind::TimerArm {
            return Err(Error::InvalidData("timer publisher received a non-timer intent"));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        append_frame(&self.env, self.dbi, &timer_key(intent.due_ts, seq), intent.message)
    }

    /// Drain entries with `due-ts <= now`, ascending `(due-ts, seq)` (spec
    /// §5, §8 property 7). Stops without consuming the next row once a row
    /// with a later due-ts is reached.
    pub fn drain_due<F>(&self, now: i64, limit: u32, mut handler: F) -> Result<u32>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        let now_flipped = (now as u64) ^ (1u64 << 63);
        let mut processed = 0u32;
        while processed < limit {
            let next = {
                let read = self.env.begin_read();
                let mut cur = match read.cursor(self.dbi) {
                    Ok(c) => c,
                    Err(Error::NotFound) => break,
                    Err(e) => return Err(e),
                };
                if read.cursor_first(self.dbi, &mut cur)?.is_none() {
                    break;
                }
                read.cursor_get(self.dbi, &cur)?
            };
            let Some((key, val)) = next else { break };
            if key.len() < 8 || BigEndian::read_u64(&key[0..8]) > now_flipped {
                break;
            }

            handler(&val)?;

            let mut txn = self.env.begin_write()?;
            match txn.get(self.dbi, &key) {
                Ok(current) if current == val => {
                    txn.del(self.dbi, &key)?;
                    txn.commit()?;
                    processed += 1;
                }
                Ok(_) | Err(Error::NotFound) => {
                    txn.abort();
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(processed)
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
    fn outbox_publish_and_drain_is_fifo() {
        let env = fixture();
        let pub_ = OutboxPublisher::new(env.clone(), 0, 100);
        for payload in [b"a".as_slice(), b"b", b"c"] {
            let intent = Intent {
                kind: IntentKind::OutboxEmit,
                flags: Default::default(),
                due_ts: 0,
                message: payload,
            };
            pub_.publish(&intent).unwrap();
        }
        assert_eq!(get_by_seq(&env, 0, 100).unwrap(), b"a");
        let mut seen = Vec::new();
        let processed = pub_.drain(10, |frame| {
            seen.push(frame.to_vec());
            Ok(())
        }).unwrap();
        assert_eq!(processed, 3);
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn timer_drain_respects_due_ts_then_seq() {
        let env = fixture();
        let pub_ = TimerPublisher::new(env.clone(), 0, 0);
        for (due, payload) in [(20i64, b"late".as_slice()), (10, b"early")] {
            let intent = Intent {
                kind: IntentKind::TimerArm,
                flags: crate::codec::IntentFlags::HAS_DUE_TS,
                due_ts: due,
                message: payload,
            };
            pub_.publish(&intent).unwrap();
        }
        let mut seen = Vec::new();
        pub_.drain_due(15, 10, |frame| {
            seen.push(frame.to_vec());
            Ok(())
        }).unwrap();
        assert_eq!(seen, vec![b"early".to_vec()]);
    }
}
