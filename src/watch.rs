//! Commit-time watch notifications (spec §4.E).
//!
//! Registration identity is `(dbi, prefix, callback-identity)`. Delivery
//! order within a commit is unspecified (spec §9 open question) — this
//! registry dispatches in registration order but callers must not depend
//! on that.

use std::sync::Arc;

use crate::error::{Error, Result};

/// A watch callback. `ctx` is opaque caller state threaded through
/// unchanged; callbacks must not call back into the environment for write
/// operations (spec §4.E).
pub type WatchFn = Arc<dyn Fn(u32, &[u8], &[u8], &dyn std::any::Any) + Send + Sync>;

struct Registration {
    dbi: u32,
    prefix: Vec<u8>,
    identity: usize,
    callback: WatchFn,
    ctx: Arc<dyn std::any::Any + Send + Sync>,
}

/// Registered watches for one environment. DUPSORT DBIs may not be
/// watched (spec §4.E); callers must check that themselves via the DBI
/// registry before registering, since this registry has no DBI config
/// visibility.
#[derive(Default)]
pub struct WatcherRegistry {
    registrations: Vec<Registration>,
}

impl WatcherRegistry {
    /// Register `(dbi, prefix, callback, ctx)`. Duplicate registration
    /// (same dbi, prefix, and callback identity) returns `EXISTS`.
    pub fn register(
        &mut self,
        dbi: u32,
        prefix: &[u8],
        identity: usize,
        callback: WatchFn,
        ctx: Arc<dyn std::any::Any + Send + Sync>,
    ) -> Result<()> {
        if self
            .registrations
            .iter()
            .any(|r| r.dbi == dbi && r.prefix == prefix && r.identity == identity)
        {
            return Err(Error::Exists);
        }
        self.registrations.push(Registration {
            dbi,
            prefix: prefix.to_vec(),
            identity,
            callback,
            ctx,
        });
        Ok(())
    }

    /// Unregister a previously registered watch. Returns `NotFound` if no
    /// matching registration exists.
    pub fn unregister(&mut self, dbi: u32, prefix: &[u8], identity: usize) -> Result<()> {
        let before = self.registrations.len();
        self.registrations
            .retain(|r| !(r.dbi == dbi && r.prefix == prefix && r.identity == identity));
        if self.registrations.len() == before {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    /// Dispatch every registration whose prefix matches a written key, for
    /// each `(dbi, key, new_value)` touched by a just-committed write-txn.
    /// `new_value` is `None` for a deletion; spec §4.E only says
    /// "new-value" is part of the identity, so deletions still dispatch
    /// with an empty payload.
    pub fn dispatch(&self, writes: &[(u32, Vec<u8>, Option<Vec<u8>>)]) {
        for (dbi, key, value) in writes {
            let value = value.as_deref().unwrap_or(&[]);
            for reg in &self.registrations {
                if reg.dbi == *dbi && key.starts_with(&reg.prefix) {
                    (reg.callback)(*dbi, key, value, reg.ctx.as_ref());
                }
            }
        }
    }
}
