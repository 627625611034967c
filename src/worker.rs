//! Worker runtime (spec §4.K): an inbox queue per worker, message decode,
//! attempt dispatch, dedupe, and an optional background loop with idle
//! backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};

use crate::attempt::{self, AttemptStats, RetryPolicy};
use crate::btree::PutFlags;
use crate::codec::{self, Message, MessageKind};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::intent::IntentSink;
use crate::staging::TxnStage;
use crate::txn::ReadTxn;

/// A message decoded out of its wire frame, owned so it can be handed to
/// an attempt across the lifetime of a staged transaction context
/// without borrowing the original inbox row.
#[derive(Clone, Debug)]
pub struct DecodedMessage {
    pub kind: MessageKind,
    pub to_worker: i64,
    pub route_worker: i64,
    pub route_timestamp: i64,
    pub from_worker: i64,
    pub message_id: Vec<u8>,
    pub trace_id: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl DecodedMessage {
    fn from_wire(msg: &Message<'_>) -> Self {
        Self {
            kind: msg.kind,
            to_worker: msg.to_worker,
            route_worker: msg.route_worker,
            route_timestamp: msg.route_timestamp,
            from_worker: msg.from_worker,
            message_id: msg.message_id.to_vec(),
            trace_id: msg.trace_id.map(|t| t.to_vec()),
            payload: msg.payload.to_vec(),
        }
    }
}

/// A worker's atomic business logic, run once per non-deduped inbox
/// message under the attempt engine.
pub trait AttemptHandler: Send {
    fn handle(&mut self, stage: &mut TxnStage, read_txn: &ReadTxn<'_>, msg: &DecodedMessage) -> Result<()>;
}

impl<F> AttemptHandler for F
where
    F: FnMut(&mut TxnStage, &ReadTxn<'_>, &DecodedMessage) -> Result<()> + Send,
{
    fn handle(&mut self, stage: &mut TxnStage, read_txn: &ReadTxn<'_>, msg: &DecodedMessage) -> Result<()> {
        self(stage, read_txn, msg)
    }
}

/// Which DBIs a [`Worker`] reads and writes (spec §6).
#[derive(Clone, Copy, Debug)]
pub struct WorkerDbis {
    pub inbox: u32,
    pub dedupe: u32,
    pub schema: u32,
}

/// Running totals for a worker's processed ticks, layered on top of the
/// attempt engine's own [`AttemptStats`].
#[derive(Clone, Debug, Default)]
pub struct WorkerStats {
    pub processed: u64,
    pub dedupe_hits: u64,
    pub attempts: u64,
    pub retries: u64,
    pub conflict_retries: u64,
}

impl WorkerStats {
    fn record_attempt(&mut self, stats: &AttemptStats) {
        self.attempts += stats.attempts as u64;
        self.retries += stats.retries as u64;
        self.conflict_retries += stats.conflict_retries as u64;
        self.processed += 1;
    }
}

/// One worker's identity, bootstrap schema, and inbox cursor (spec
/// §4.K).
pub struct Worker {
    pub worker_id: u32,
    pub schema: (u16, u16),
    pub dbis: WorkerDbis,
    pub max_batch: u32,
    pub handler: Box<dyn AttemptHandler>,
    pub last_error: Option<Error>,
    pub stats: WorkerStats,
}

impl Worker {
    pub fn new(worker_id: u32, schema: (u16, u16), dbis: WorkerDbis, max_batch: u32, handler: Box<dyn AttemptHandler>) -> Self {
        Self {
            worker_id,
            schema,
            dbis,
            max_batch,
            handler,
            last_error: None,
            stats: WorkerStats::default(),
        }
    }
}

const SCHEMA_KEY: &[u8] = b"schema";

fn encode_schema(major: u16, minor: u16) -> [u8; 4] {
    let mut buf = [0u8; 4];
    BigEndian::write_u16(&mut buf[0..2], major);
    BigEndian::write_u16(&mut buf[2..4], minor);
    buf
}

fn decode_schema(raw: &[u8]) -> Result<(u16, u16)> {
    if raw.len() != 4 {
        return Err(Error::Corrupt);
    }
    Ok((BigEndian::read_u16(&raw[0..2]), BigEndian::read_u16(&raw[2..4])))
}

/// Ensure the schema row is present and matches this worker's (major,
/// minor); mismatch is `InvalidData` (spec §4.K bootstrap).
fn ensure_schema(env: &Environment, schema_dbi: u32, want: (u16, u16)) -> Result<()> {
    match env.begin_read().get(schema_dbi, SCHEMA_KEY) {
        Ok(raw) => {
            let have = decode_schema(&raw)?;
            if have != want {
                return Err(Error::InvalidData("schema version mismatch"));
            }
            Ok(())
        }
        Err(Error::NotFound) => {
            let mut txn = env.begin_write()?;
            txn.put(schema_dbi, SCHEMA_KEY, &encode_schema(want.0, want.1), PutFlags::empty())?;
            txn.commit()
        }
        Err(e) => Err(e),
    }
}

fn inbox_prefix(worker_id: u32) -> [u8; 4] {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, worker_id);
    buf
}

/// Inbox key: `worker_id (BE u32) || seq (BE u64)` (spec §6).
pub fn inbox_key(worker_id: u32, seq: u64) -> [u8; 12] {
    let mut buf = [0u8; 12];
    BigEndian::write_u32(&mut buf[0..4], worker_id);
    BigEndian::write_u64(&mut buf[4..12], seq);
    buf
}

/// Idempotent insert into the inbox DBI (spec §4.K `inbox_put`).
pub fn inbox_put(env: &Environment, inbox_dbi: u32, worker_id: u32, seq: u64, frame: &[u8]) -> Result<()> {
    let mut txn = env.begin_write()?;
    match txn.put(inbox_dbi, &inbox_key(worker_id, seq), frame, PutFlags::NOOVERWRITE) {
        Ok(()) => txn.commit(),
        Err(Error::Exists) => {
            txn.abort();
            Ok(())
        }
        Err(e) => {
            txn.abort();
            Err(e)
        }
    }
}

fn collect_batch(env: &Environment, inbox_dbi: u32, worker_id: u32, max_batch: u32) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let prefix = inbox_prefix(worker_id);
    let read = env.begin_read();
    let mut cur = match read.cursor(inbox_dbi) {
        Ok(c) => c,
        Err(Error::NotFound) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    if read.cursor_seek(inbox_dbi, &mut cur, &prefix)?.is_none() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    loop {
        if out.len() as u32 >= max_batch {
            break;
        }
        let Some((key, val)) = read.cursor_get(inbox_dbi, &cur)? else {
            break;
        };
        if !key.starts_with(&prefix) {
            break;
        }
        out.push((key, val));
        if read.cursor_next(inbox_dbi, &mut cur)?.is_none() {
            break;
        }
    }
    Ok(out)
}

fn dedupe_already_accepted(env: &Environment, dedupe_dbi: u32, message_id: &[u8]) -> Result<bool> {
    match env.begin_read().get(dedupe_dbi, message_id) {
        Ok(raw) => Ok(raw.first().copied().unwrap_or(0) != 0),
        Err(Error::NotFound) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Dedupe record: `accepted:u8, last_seen_ms:i64, checksum_offset:u32,
/// checksum_length:u32, checksum bytes` (spec §4.K). The checksum is an
/// xxh3-64 digest of the payload, stored as the checksum bytes.
fn encode_dedupe_record(last_seen_ms: i64, payload: &[u8]) -> Vec<u8> {
    let checksum = xxhash_rust::xxh3::xxh3_64(payload).to_be_bytes();
    let mut out = Vec::with_capacity(1 + 8 + 4 + 4 + checksum.len());
    out.push(1u8);
    out.extend_from_slice(&last_seen_ms.to_be_bytes());
    out.extend_from_slice(&17u32.to_be_bytes());
    out.extend_from_slice(&(checksum.len() as u32).to_be_bytes());
    out.extend_from_slice(&checksum);
    out
}

/// Process up to `worker.max_batch` inbox frames: decode, dedupe-check,
/// run the attempt engine, and remove the inbox row on success (spec
/// §4.K `worker_tick`). Stops on the first non-retryable error, recording
/// it in `worker.last_error`. Returns the number of messages fully
/// processed in this tick (including dedupe hits).
pub fn worker_tick(worker: &mut Worker, env: &Environment, policy: &RetryPolicy, sink: &mut dyn IntentSink) -> Result<u32> {
    ensure_schema(env, worker.dbis.schema, worker.schema)?;

    let batch = collect_batch(env, worker.dbis.inbox, worker.worker_id, worker.max_batch)?;
    let mut processed = 0u32;
    let mut stage = TxnStage::new();

    for (inbox_row_key, frame) in batch {
        let decoded = match codec::Message::decode(&frame) {
            Ok(wire) => DecodedMessage::from_wire(&wire),
            Err(_) => {
                worker.last_error = Some(Error::InvalidData("malformed inbox frame"));
                log::warn!(target: "sapling::worker", "worker {} dropped a malformed inbox frame", worker.worker_id);
                return Ok(processed);
            }
        };

        if dedupe_already_accepted(env, worker.dbis.dedupe, &decoded.message_id)? {
            let mut txn = env.begin_write()?;
            txn.del(worker.dbis.inbox, &inbox_row_key)?;
            txn.commit()?;
            worker.stats.dedupe_hits += 1;
            processed += 1;
            continue;
        }

        let dedupe_dbi = worker.dbis.dedupe;
        let inbox_dbi = worker.dbis.inbox;
        let row_key = inbox_row_key.clone();
        let handler = &mut worker.handler;
        let atomic_fn = |stage: &mut TxnStage, read_txn: &ReadTxn<'_>, msg: &DecodedMessage| -> Result<()> {
            handler.handle(stage, read_txn, msg)?;
            let record = encode_dedupe_record(msg.route_timestamp, &msg.payload);
            stage.stage_put(dedupe_dbi, &msg.message_id, &record);
            stage.stage_del(inbox_dbi, &row_key);
            Ok(())
        };

        match attempt::run(env, policy, atomic_fn, &mut stage, &decoded, sink) {
            Ok(stats) => {
                worker.stats.record_attempt(&stats);
                processed += 1;
            }
            Err(e) => {
                worker.last_error = Some(e);
                log::warn!(target: "sapling::worker", "worker {} stopped on a non-retryable error", worker.worker_id);
                return Ok(processed);
            }
        }
    }

    Ok(processed)
}

/// Process-wide mutex that serializes the critical sections opening a
/// top-level write-txn across worker threads, distinct from the
/// environment's own non-blocking writer slot: a background loop blocks
/// on this gate instead of busy-retrying `BUSY` (spec §5).
#[derive(Clone)]
pub struct WriterGate(Arc<Mutex<()>>);

impl Default for WriterGate {
    fn default() -> Self {
        Self::new()
    }
}

impl WriterGate {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(())))
    }

    fn with_lock<T>(&self, f: impl FnOnce() -> T) -> T {
        let _held = self.0.lock().unwrap();
        f()
    }
}

/// A worker's background loop handle (spec §4.K `worker_start`).
pub struct WorkerHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Signal the background loop to stop after its current tick.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Block until the background loop has exited.
    pub fn join(mut self) {
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }

    /// Request a stop and block until the loop has exited (spec §4.K
    /// `shutdown`).
    pub fn shutdown(self) {
        self.request_stop();
        self.join();
    }
}

/// Spawn a background thread that calls [`worker_tick`] in a loop, taking
/// `gate` before opening the tick's write transactions and sleeping
/// `idle_ms` whenever a tick processes nothing (spec §4.K, §5).
pub fn worker_start(
    mut worker: Worker,
    env: Environment,
    gate: WriterGate,
    policy: RetryPolicy,
    mut sink: Box<dyn IntentSink + Send>,
    idle_ms: u64,
) -> WorkerHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let join = std::thread::spawn(move || loop {
        if stop_flag.load(Ordering::SeqCst) {
            return;
        }
        let outcome = gate.with_lock(|| worker_tick(&mut worker, &env, &policy, sink.as_mut()));
        match outcome {
            Ok(0) => std::thread::sleep(Duration::from_millis(idle_ms)),
            Ok(_) => {}
            Err(e) => {
                log::error!(target: "sapling::worker", "worker {} tick failed: {e}", worker.worker_id);
                return;
            }
        }
    });
    WorkerHandle {
        stop,
        join: Some(join),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Message, MessageFlags};
    use crate::env::{Config, DbiFlags, Environment};
    use crate::intent::IntentSink;

    struct NullSink;
    impl IntentSink for NullSink {
        fn publish(&mut self, _frame: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn fixture() -> (Environment, WorkerDbis) {
        let env = Environment::open(Config::default()).unwrap();
        let dbis = WorkerDbis {
            inbox: 0,
            dedupe: 1,
            schema: 2,
        };
        env.dbi_open(dbis.inbox, None, DbiFlags::empty()).unwrap();
        env.dbi_open(dbis.dedupe, None, DbiFlags::empty()).unwrap();
        env.dbi_open(dbis.schema, None, DbiFlags::empty()).unwrap();
        env.dbi_open(10, None, DbiFlags::empty()).unwrap();
        (env, dbis)
    }

    fn encode_command(message_id: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        Message {
            kind: MessageKind::Command,
            flags: MessageFlags::empty(),
            to_worker: 1,
            route_worker: 0,
            route_timestamp: 0,
            from_worker: 0,
            message_id,
            trace_id: None,
            payload,
        }
        .encode(&mut buf)
        .unwrap();
        buf
    }

    #[test]
    fn processes_a_message_and_removes_it_from_the_inbox() {
        let (env, dbis) = fixture();
        inbox_put(&env, dbis.inbox, 1, 0, &encode_command(b"m-1", b"hello")).unwrap();

        let handler = Box::new(|stage: &mut TxnStage, _read: &ReadTxn<'_>, msg: &DecodedMessage| {
            stage.stage_put(10, b"counter", &msg.payload);
            Ok(())
        });
        let mut worker = Worker::new(1, (1, 0), dbis, 8, handler);
        let mut sink = NullSink;
        let processed = worker_tick(&mut worker, &env, &RetryPolicy::default(), &mut sink).unwrap();

        assert_eq!(processed, 1);
        assert!(worker.last_error.is_none());
        assert_eq!(env.begin_read().get(10, b"counter").unwrap(), b"hello");
        assert!(matches!(
            env.begin_read().get(dbis.inbox, &inbox_key(1, 0)),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn dedupe_hit_skips_the_handler() {
        let (env, dbis) = fixture();
        inbox_put(&env, dbis.inbox, 1, 0, &encode_command(b"m-1", b"first")).unwrap();
        inbox_put(&env, dbis.inbox, 1, 1, &encode_command(b"m-1", b"second")).unwrap();

        let calls = Arc::new(Mutex::new(0u32));
        let calls_handle = calls.clone();
        let handler = Box::new(move |stage: &mut TxnStage, _read: &ReadTxn<'_>, msg: &DecodedMessage| {
            *calls_handle.lock().unwrap() += 1;
            stage.stage_put(10, b"last", &msg.payload);
            Ok(())
        });
        let mut worker = Worker::new(1, (1, 0), dbis, 8, handler);
        let mut sink = NullSink;
        let processed = worker_tick(&mut worker, &env, &RetryPolicy::default(), &mut sink).unwrap();

        assert_eq!(processed, 2);
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(worker.stats.dedupe_hits, 1);
        assert_eq!(env.begin_read().get(10, b"last").unwrap(), b"first");
    }

    #[test]
    fn schema_mismatch_is_invalid_data() {
        let (env, dbis) = fixture();
        ensure_schema(&env, dbis.schema, (1, 0)).unwrap();
        let handler = Box::new(|_s: &mut TxnStage, _r: &ReadTxn<'_>, _m: &DecodedMessage| Ok(()));
        let mut worker = Worker::new(1, (2, 0), dbis, 8, handler);
        let mut sink = NullSink;
        assert!(matches!(
            worker_tick(&mut worker, &env, &RetryPolicy::default(), &mut sink),
            Err(Error::InvalidData(_))
        ));
    }
}
