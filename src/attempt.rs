//! Attempt engine (spec §4.I): runs a user atomic function against a
//! staged transaction context, validates its read set, commits its write
//! set in a short write transaction, and publishes buffered intents
//! through a sink. Retries `BUSY`/`CONFLICT` outcomes with backoff.

use std::sync::Arc;

use crate::env::Environment;
use crate::error::{Error, ErrorCode, Result};
use crate::intent::IntentSink;
use crate::staging::TxnStage;

/// Retry and backoff policy for one [`run`] call.
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_us: u64,
    pub max_backoff_us: u64,
    /// Caller-supplied sleep, invoked with the current backoff in
    /// microseconds between retries. `None` skips sleeping entirely,
    /// useful in tests that want retries to run back-to-back.
    pub sleep: Option<Arc<dyn Fn(u64) + Send + Sync>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_us: 1_000,
            max_backoff_us: 50_000,
            sleep: None,
        }
    }
}

/// Outcome counters for one [`run`] call (spec §4.I).
#[derive(Clone, Debug, Default)]
pub struct AttemptStats {
    pub attempts: u32,
    pub retries: u32,
    pub conflict_retries: u32,
    pub last_rc: Option<ErrorCode>,
}

fn backoff_and_sleep(policy: &RetryPolicy, backoff_us: u64) -> u64 {
    if let Some(sleep) = &policy.sleep {
        sleep(backoff_us);
    }
    (backoff_us * 2).min(policy.max_backoff_us)
}

/// Run `atomic_fn` to completion under `policy`, retrying `BUSY`/
/// `CONFLICT` outcomes up to `max_retries` times with exponential
/// backoff. `atomic_fn` must only stage reads/writes/intents through
/// `stage`; on success its staged writes are validated and applied in a
/// short write transaction, then its staged intents are published via
/// `sink`.
pub fn run<F, C>(
    env: &Environment,
    policy: &RetryPolicy,
    mut atomic_fn: F,
    stage: &mut TxnStage,
    ctx: &C,
    sink: &mut dyn IntentSink,
) -> Result<AttemptStats>
where
    F: FnMut(&mut TxnStage, &crate::txn::ReadTxn<'_>, &C) -> Result<()>,
{
    let mut stats = AttemptStats::default();
    let mut backoff = policy.initial_backoff_us;

    loop {
        stats.attempts += 1;
        stage.reset();

        let read_txn = env.begin_read();
        let fn_result = atomic_fn(stage, &read_txn, ctx);
        drop(read_txn);

        match fn_result {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                stats.last_rc = Some(e.code());
                bump_retry_counter(&mut stats, &e);
                if stats.attempts > policy.max_retries {
                    return Err(e);
                }
                backoff = backoff_and_sleep(policy, backoff);
                continue;
            }
            Err(e) => {
                stats.last_rc = Some(e.code());
                return Err(e);
            }
        }

        let mut write_txn = match env.begin_write() {
            Ok(txn) => txn,
            Err(e) if e.is_retryable() => {
                stats.last_rc = Some(e.code());
                bump_retry_counter(&mut stats, &e);
                if stats.attempts > policy.max_retries {
                    return Err(e);
                }
                backoff = backoff_and_sleep(policy, backoff);
                continue;
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = stage.validate(&mut write_txn) {
            write_txn.abort();
            stats.last_rc = Some(e.code());
            if !e.is_retryable() {
                return Err(e);
            }
            bump_retry_counter(&mut stats, &e);
            if stats.attempts > policy.max_retries {
                return Err(e);
            }
            backoff = backoff_and_sleep(policy, backoff);
            continue;
        }

        if let Err(e) = stage.apply(&mut write_txn) {
            write_txn.abort();
            stats.last_rc = Some(e.code());
            return Err(e);
        }

        match write_txn.commit() {
            Ok(()) => {}
            Err(e) => {
                stats.last_rc = Some(e.code());
                if !e.is_retryable() {
                    return Err(e);
                }
                bump_retry_counter(&mut stats, &e);
                if stats.attempts > policy.max_retries {
                    return Err(e);
                }
                backoff = backoff_and_sleep(policy, backoff);
                continue;
            }
        }

        for frame in stage.intents() {
            if let Err(e) = sink.publish(frame) {
                stats.last_rc = Some(e.code());
                log::warn!(target: "sapling::attempt", "intent publish failed after commit: {e}");
                return Err(e);
            }
        }

        stats.last_rc = Some(ErrorCode::Ok);
        return Ok(stats);
    }
}

fn bump_retry_counter(stats: &mut AttemptStats, e: &Error) {
    if matches!(e, Error::Conflict) {
        stats.conflict_retries += 1;
    } else {
        stats.retries += 1;
    }
}
