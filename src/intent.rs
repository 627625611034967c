//! Intent sink (spec §4.L): dispatches decoded intent frames, captured
//! during an attempt, to the publisher that owns their DBI.

use crate::codec::{Intent, IntentKind};
use crate::error::{Error, Result};
use crate::publish::{OutboxPublisher, TimerPublisher};

/// A destination for buffered intent frames, called once per frame after
/// a successful commit (spec §4.I step 4). A publish error is surfaced to
/// the caller without re-running the atomic function: the write is
/// already durable.
pub trait IntentSink {
    fn publish(&mut self, frame: &[u8]) -> Result<()>;
}

/// The concrete sink used by worker runtimes: decodes the intent header
/// and routes `OUTBOX_EMIT` / `TIMER_ARM` to their respective publishers.
pub struct Dispatcher {
    outbox: OutboxPublisher,
    timer: TimerPublisher,
}

impl Dispatcher {
    pub fn new(outbox: OutboxPublisher, timer: TimerPublisher) -> Self {
        Self { outbox, timer }
    }
}

impl IntentSink for Dispatcher {
    fn publish(&mut self, frame: &[u8]) -> Result<()> {
        let intent = Intent::decode(frame).map_err(|_| Error::InvalidData("malformed intent frame"))?;
        match intent.kind {
            IntentKind::OutboxEmit => self.outbox.publish(&intent),
            IntentKind::TimerArm => self.timer.publish(&intent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::IntentFlags;
    use crate::env::{Config, DbiFlags, Environment};

    #[test]
    fn dispatches_by_intent_kind() {
        let env = Environment::open(Config::default()).unwrap();
        env.dbi_open(0, None, DbiFlags::empty()).unwrap();
        env.dbi_open(1, None, DbiFlags::empty()).unwrap();
        let mut dispatcher = Dispatcher::new(
            OutboxPublisher::new(env.clone(), 0, 100),
            TimerPublisher::new(env.clone(), 1, 0),
        );

        let mut buf = Vec::new();
        Intent {
            kind: IntentKind::OutboxEmit,
            flags: IntentFlags::empty(),
            due_ts: 0,
            message: b"evt",
        }
        .encode(&mut buf)
        .unwrap();
        dispatcher.publish(&buf).unwrap();

        assert_eq!(crate::publish::get_by_seq(&env, 0, 100).unwrap(), b"evt");
        assert_eq!(dispatcher.outbox.next_seq(), 101);
    }
}
