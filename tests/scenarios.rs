//! End-to-end scenarios from the spec's testable-properties section
//! (S1-S6): CAS lease, outbox/timer round-trip, a threaded worker
//! pipeline, message codec validation, TTL sweep with a resumable
//! checkpoint, and nested transaction semantics.

use sapling::attempt::{self, RetryPolicy};
use sapling::btree::PutFlags;
use sapling::codec::{CodecError, Intent, IntentFlags, IntentKind, Message, MessageFlags, MessageKind};
use sapling::intent::IntentSink;
use sapling::publish::{self, OutboxPublisher, TimerPublisher};
use sapling::staging::TxnStage;
use sapling::ttl;
use sapling::txn::ReadTxn;
use sapling::worker::{inbox_key, inbox_put, Worker, WorkerDbis};
use sapling::{BackingKind, Config, DbiFlags, Environment, Error};

fn fixture() -> Environment {
    Environment::open(Config {
        backing: BackingKind::Malloc,
        ..Config::default()
    })
    .unwrap()
}

// S1 - CAS lease: W1 claims an absent key, W2's claim of the same key
// conflicts, W1 reads back its own value.
#[test]
fn s1_cas_lease() {
    let env = fixture();
    env.dbi_open(10, None, DbiFlags::empty()).unwrap();

    let mut w1 = env.begin_write().unwrap();
    w1.put_if(10, b"k", b"held", None).unwrap();
    w1.commit().unwrap();

    let mut w2 = env.begin_write().unwrap();
    let err = w2.put_if(10, b"k", b"held", None).unwrap_err();
    assert!(matches!(err, Error::Conflict));
    w2.abort();

    let read = env.begin_read();
    assert_eq!(read.get(10, b"k").unwrap(), b"held");
}

// S2 - Outbox round-trip: an attempt stages an OUTBOX_EMIT intent; after
// commit the frame is readable by sequence and the publisher's next-seq
// has advanced. A second attempt stages a TIMER_ARM intent, which lands
// in the timer DBI instead and advances the timer publisher's own seq.
struct TestSink {
    outbox: OutboxPublisher,
    timer: TimerPublisher,
}

impl IntentSink for TestSink {
    fn publish(&mut self, frame: &[u8]) -> sapling::Result<()> {
        let intent = Intent::decode(frame).map_err(|_| Error::InvalidData("malformed intent frame"))?;
        match intent.kind {
            IntentKind::OutboxEmit => self.outbox.publish(&intent),
            IntentKind::TimerArm => self.timer.publish(&intent),
        }
    }
}

#[test]
fn s2_outbox_and_timer_round_trip() {
    let env = fixture();
    env.dbi_open(0, None, DbiFlags::empty()).unwrap(); // outbox
    env.dbi_open(1, None, DbiFlags::empty()).unwrap(); // timer

    let mut sink = TestSink {
        outbox: OutboxPublisher::new(env.clone(), 0, 100),
        timer: TimerPublisher::new(env.clone(), 1, 0),
    };
    let mut stage = TxnStage::new();

    let mut outbox_frame = Vec::new();
    Intent {
        kind: IntentKind::OutboxEmit,
        flags: IntentFlags::empty(),
        due_ts: 0,
        message: b"evt",
    }
    .encode(&mut outbox_frame)
    .unwrap();

    let stats = attempt::run(
        &env,
        &RetryPolicy::default(),
        |stage, _read, _ctx: &()| {
            stage.push_intent(outbox_frame.clone());
            Ok(())
        },
        &mut stage,
        &(),
        &mut sink,
    )
    .unwrap();
    assert_eq!(stats.attempts, 1);
    assert_eq!(publish::get_by_seq(&env, 0, 100).unwrap(), b"evt");
    assert_eq!(sink.outbox.next_seq(), 101);

    let mut timer_frame = Vec::new();
    Intent {
        kind: IntentKind::TimerArm,
        flags: IntentFlags::HAS_DUE_TS,
        due_ts: 500,
        message: b"fire",
    }
    .encode(&mut timer_frame)
    .unwrap();

    attempt::run(
        &env,
        &RetryPolicy::default(),
        |stage, _read, _ctx: &()| {
            stage.push_intent(timer_frame.clone());
            Ok(())
        },
        &mut stage,
        &(),
        &mut sink,
    )
    .unwrap();
    assert_eq!(sink.timer.next_seq(), 1);

    let mut seen = Vec::new();
    let drained = sink
        .timer
        .drain_due(1000, 10, |frame| {
            seen.push(frame.to_vec());
            Ok(())
        })
        .unwrap();
    assert_eq!(drained, 1);
    assert_eq!(seen, vec![b"fire".to_vec()]);
}

// S3 - Threaded pipeline: 64 orders enter worker 101's inbox and flow
// through workers 101 -> 102 -> 103 -> 104 in sequence. Each stage bumps
// its own counter and forwards a freshly keyed message to the next
// worker's inbox; every stage counter should land on 64.
const COUNTER_DBI: u32 = 9;

fn counter_key(worker_id: u32) -> [u8; 4] {
    worker_id.to_be_bytes()
}

fn make_stage_handler(
    worker_id: u32,
    next_worker: Option<u32>,
) -> Box<dyn sapling::worker::AttemptHandler> {
    Box::new(
        move |stage: &mut TxnStage, read: &ReadTxn<'_>, msg: &sapling::worker::DecodedMessage| {
            let key = counter_key(worker_id);
            let current = match stage.read(read, COUNTER_DBI, &key) {
                Ok(bytes) => u64::from_be_bytes(bytes.try_into().map_err(|_| Error::Corrupt)?),
                Err(Error::NotFound) => 0,
                Err(e) => return Err(e),
            };
            stage.stage_put(COUNTER_DBI, &key, &(current + 1).to_be_bytes());

            if let Some(next) = next_worker {
                let order_idx = u32::from_be_bytes(
                    msg.payload[0..4].try_into().map_err(|_| Error::Corrupt)?,
                );
                let message_id = format!("order-{order_idx}-w{next}");
                let mut frame = Vec::new();
                Message {
                    kind: MessageKind::Event,
                    flags: MessageFlags::empty(),
                    to_worker: next as i64,
                    route_worker: worker_id as i64,
                    route_timestamp: 0,
                    from_worker: 0,
                    message_id: message_id.as_bytes(),
                    trace_id: None,
                    payload: &msg.payload,
                }
                .encode(&mut frame)
                .map_err(|_| Error::InvalidData("failed to encode forwarded event"))?;
                stage.stage_put(0, &inbox_key(next, order_idx as u64), &frame);
            }
            Ok(())
        },
    )
}

#[test]
fn s3_threaded_pipeline() {
    const ORDERS: u32 = 64;
    let env = fixture();
    env.dbi_open(0, None, DbiFlags::empty()).unwrap(); // shared inbox
    for dbi in [1, 2, 3, 4, 5, 6, 7, 8, COUNTER_DBI] {
        env.dbi_open(dbi, None, DbiFlags::empty()).unwrap();
    }

    for i in 0..ORDERS {
        let message_id = format!("order-{i}-w101");
        let mut frame = Vec::new();
        Message {
            kind: MessageKind::Command,
            flags: MessageFlags::empty(),
            to_worker: 101,
            route_worker: 0,
            route_timestamp: 0,
            from_worker: 0,
            message_id: message_id.as_bytes(),
            trace_id: None,
            payload: &i.to_be_bytes(),
        }
        .encode(&mut frame)
        .unwrap();
        inbox_put(&env, 0, 101, i as u64, &frame).unwrap();
    }

    let stage_defs = [
        (101u32, WorkerDbis { inbox: 0, dedupe: 1, schema: 2 }, Some(102u32)),
        (102, WorkerDbis { inbox: 0, dedupe: 3, schema: 4 }, Some(103)),
        (103, WorkerDbis { inbox: 0, dedupe: 5, schema: 6 }, Some(104)),
        (104, WorkerDbis { inbox: 0, dedupe: 7, schema: 8 }, None),
    ];

    struct NullSink;
    impl IntentSink for NullSink {
        fn publish(&mut self, _frame: &[u8]) -> sapling::Result<()> {
            Ok(())
        }
    }
    let mut sink = NullSink;
    let policy = RetryPolicy::default();

    for (worker_id, dbis, next) in stage_defs {
        let handler = make_stage_handler(worker_id, next);
        let mut worker = Worker::new(worker_id, (1, 0), dbis, ORDERS, handler);
        let processed = sapling::worker::worker_tick(&mut worker, &env, &policy, &mut sink).unwrap();
        assert_eq!(processed, ORDERS, "worker {worker_id} should drain its whole seeded batch");
        assert!(worker.last_error.is_none());

        let read = env.begin_read();
        let count = u64::from_be_bytes(read.get(COUNTER_DBI, &counter_key(worker_id)).unwrap().try_into().unwrap());
        assert_eq!(count, ORDERS as u64);
    }
}

// S4 - Message codec: exact frame size/magic, and the four validation
// failure modes (truncation, bad magic, version mismatch).
#[test]
fn s4_message_codec() {
    let msg = Message {
        kind: MessageKind::Command,
        flags: MessageFlags::empty(),
        to_worker: 42,
        route_worker: 0,
        route_timestamp: 0,
        from_worker: 0,
        message_id: b"ex-1",
        trace_id: None,
        payload: b"native-v0",
    };
    let mut buf = Vec::new();
    msg.encode(&mut buf).unwrap();
    assert_eq!(buf.len(), 73);
    assert_eq!(&buf[0..4], b"LMSG");
    assert_eq!(Message::decode(&buf).unwrap(), msg);

    let mut truncated = buf.clone();
    truncated.pop();
    assert!(matches!(Message::decode(&truncated), Err(CodecError::Etrunc)));

    let mut bad_magic = buf.clone();
    bad_magic[0] = b'X';
    assert!(matches!(Message::decode(&bad_magic), Err(CodecError::Eformat)));

    let mut bad_version = buf.clone();
    bad_version[7] = 1;
    assert!(matches!(Message::decode(&bad_version), Err(CodecError::Eversion)));
}

// S5 - TTL sweep: rows expiring at {10, 20, 30}; sweep(now=25, limit=2)
// deletes exactly the two earliest and reports 2; a checkpoint seeded
// from that sweep resumes and deletes the third at (now=40, limit=2),
// reporting 1.
#[test]
fn s5_ttl_sweep_resumes_from_checkpoint() {
    let env = fixture();
    env.dbi_open(0, None, DbiFlags::empty()).unwrap(); // data
    env.dbi_open(1, None, DbiFlags::empty()).unwrap(); // ttl meta

    let mut txn = env.begin_write().unwrap();
    ttl::put_ttl(&mut txn, 0, 1, b"a", b"1", 10).unwrap();
    ttl::put_ttl(&mut txn, 0, 1, b"b", b"2", 20).unwrap();
    ttl::put_ttl(&mut txn, 0, 1, b"c", b"3", 30).unwrap();

    let first = ttl::sweep(&mut txn, 0, 1, 2, 25, None).unwrap();
    assert_eq!(first.deleted, 2);
    assert!(matches!(txn.get(0, b"a"), Err(Error::NotFound)));
    assert!(matches!(txn.get(0, b"b"), Err(Error::NotFound)));
    assert_eq!(txn.get(0, b"c").unwrap(), b"3");

    let second = ttl::sweep(&mut txn, 0, 1, 2, 40, None).unwrap();
    assert_eq!(second.deleted, 1);
    assert!(matches!(txn.get(0, b"c"), Err(Error::NotFound)));
    txn.commit().unwrap();
}

// S6 - Nested transaction semantics: a child abort discards only its own
// writes; a subsequent child commit grafts into the parent, and a fresh
// reader sees the final values after the outer commit.
#[test]
fn s6_nested_transaction_semantics() {
    let env = fixture();
    env.dbi_open(0, None, DbiFlags::empty()).unwrap();

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
