//! Sapling: an embedded storage and execution substrate for small,
//! deterministic workers that coordinate through durable state and
//! messages.
//!
//! The crate is built from two layers. The storage layer (`arena`,
//! `page`, `btree`, `env`, `txn`, `watch`, `ttl`) is a single-writer,
//! multi-reader key-value store with named sub-databases, nested
//! transactions, and commit-time watch notifications. The runner layer
//! (`staging`, `attempt`, `codec`, `intent`, `publish`, `worker`) executes
//! a user atomic function against a staged transaction context, validates
//! and commits it in a short write transaction, and publishes its
//! side-effects as durable messages.

pub mod arena;
pub mod attempt;
pub mod btree;
pub mod codec;
pub mod env;
pub mod error;
pub mod intent;
pub mod page;
pub mod publish;
pub mod staging;
pub mod ttl;
pub mod txn;
pub mod watch;
pub mod worker;

pub use env::{BackingKind, Config, DbiFlags, DbiStat, EnvStat, Environment, TxnStat};
pub use error::{CodecError, Error, ErrorCode, Result};
