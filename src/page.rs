//! Fixed-size page identifiers (spec §3, §4.A).

use std::num::NonZeroU32;

/// Minimum and maximum configurable page size (spec §3).
pub const MIN_PAGE_SIZE: usize = 256;
pub const MAX_PAGE_SIZE: usize = 65535;
/// Default page size, matching common architecture page sizes.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// A page number. Page 0 is the reserved null sentinel and is never handed
/// out by the arena.
pub type PageNo = NonZeroU32;

/// A node reference into the arena's inner allocations (spec §3, §4.A).
/// Null (0) is reserved, mirroring [`PageNo`].
pub type NodeRef = NonZeroU32;
