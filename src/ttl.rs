//! TTL helper (spec §4.F): a companion-DBI scheme for expiring keys, with
//! lazy eviction on read and a bounded, resumable sweep.
//!
//! Grounded in the same page/B+-tree machinery as the rest of the crate;
//! the record layout below is new (the teacher has no TTL concept), built
//! the way the teacher lays out its own fixed binary records
//! (`RootHeader` in `src/lib.rs`): explicit byte offsets, big-endian where
//! order must be comparable, native-endian where it need not be.

use byteorder::{BigEndian, ByteOrder, NativeEndian};

use crate::btree::PutFlags;
use crate::error::{Error, Result};
use crate::txn::WriteTxn;

const LOOKUP_TAG: u8 = 0x00;
const INDEX_TAG: u8 = 0x01;

/// Maximum user key length under the TTL scheme (spec §4.F: `key_len <=
/// UINT16_MAX - 9`).
pub const MAX_TTL_KEY_LEN: usize = u16::MAX as usize - 9;

fn lookup_key(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.len());
    out.push(LOOKUP_TAG);
    out.extend_from_slice(key);
    out
}

fn index_key(expires_at_ms: u64, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 8 + key.len());
    out.push(INDEX_TAG);
    let mut ts = [0u8; 8];
    BigEndian::write_u64(&mut ts, expires_at_ms);
    out.extend_from_slice(&ts);
    out.extend_from_slice(key);
    out
}

fn decode_index_key(index_key: &[u8]) -> Result<(u64, Vec<u8>)> {
    if index_key.len() < 9 || index_key[0] != INDEX_TAG {
        return Err(Error::Corrupt);
    }
    let ts = BigEndian::read_u64(&index_key[1..9]);
    Ok((ts, index_key[9..].to_vec()))
}

/// Whether [`get_ttl`]/[`cursor_get_ttl`] should delete an expired row
/// immediately on read (spec §4.F `LAZY_DELETE`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LazyDelete {
    Disabled,
    Enabled,
}

/// Write a value together with its TTL lookup and index rows (spec §4.F
/// `put_ttl`).
pub fn put_ttl(
    txn: &mut WriteTxn<'_>,
    data_dbi: u32,
    meta_dbi: u32,
    key: &[u8],
    val: &[u8],
    expires_at_ms: u64,
) -> Result<()> {
    if key.len() > MAX_TTL_KEY_LEN {
        return Err(Error::Full);
    }
    txn.put(data_dbi, key, val, PutFlags::empty())?;
    let mut native = [0u8; 8];
    NativeEndian::write_u64(&mut native, expires_at_ms);
    txn.put(meta_dbi, &lookup_key(key), &native, PutFlags::empty())?;
    txn.put(meta_dbi, &index_key(expires_at_ms, key), &[], PutFlags::empty())?;
    Ok(())
}

fn expiry_of(txn: &mut WriteTxn<'_>, meta_dbi: u32, key: &[u8]) -> Result<u64> {
    let raw = txn.get(meta_dbi, &lookup_key(key))?;
    if raw.len() != 8 {
        return Err(Error::Corrupt);
    }
    Ok(NativeEndian::read_u64(&raw))
}

fn delete_ttl_rows(txn: &mut WriteTxn<'_>, data_dbi: u32, meta_dbi: u32, key: &[u8], expires_at_ms: u64) -> Result<()> {
    txn.del(data_dbi, key)?;
    txn.del(meta_dbi, &lookup_key(key))?;
    txn.del(meta_dbi, &index_key(expires_at_ms, key))?;
    Ok(())
}

/// Read a TTL-managed value (spec §4.F `get_ttl`). Returns `NotFound` if
/// the key was never `put_ttl`'d, or if its lookup row indicates expiry
/// at or before `now`. With `LazyDelete::Enabled`, an expired row is
/// deleted from both DBIs as part of this call.
pub fn get_ttl(
    txn: &mut WriteTxn<'_>,
    data_dbi: u32,
    meta_dbi: u32,
    key: &[u8],
    now_ms: u64,
    lazy: LazyDelete,
) -> Result<Vec<u8>> {
    let expires_at_ms = match expiry_of(txn, meta_dbi, key) {
        Ok(v) => v,
        Err(Error::NotFound) => return Err(Error::NotFound),
        Err(e) => return Err(e),
    };
    if expires_at_ms <= now_ms {
        if lazy == LazyDelete::Enabled {
            delete_ttl_rows(txn, data_dbi, meta_dbi, key, expires_at_ms)?;
        }
        return Err(Error::NotFound);
    }
    txn.get(data_dbi, key)
}

/// Same as [`get_ttl`] but reads the key at the cursor's current position
/// on `data_dbi` (spec §4.F `cursor_get_ttl`).
pub fn cursor_get_ttl(
    txn: &mut WriteTxn<'_>,
    data_dbi: u32,
    meta_dbi: u32,
    cur: &crate::btree::cursor::Cursor,
    now_ms: u64,
    lazy: LazyDelete,
) -> Result<Vec<u8>> {
    let Some((key, val)) = txn.cursor_get(data_dbi, cur)? else {
        return Err(Error::NotFound);
    };
    let expires_at_ms = expiry_of(txn, meta_dbi, &key)?;
    if expires_at_ms <= now_ms {
        if lazy == LazyDelete::Enabled {
            delete_ttl_rows(txn, data_dbi, meta_dbi, &key, expires_at_ms)?;
        }
        return Err(Error::NotFound);
    }
    Ok(val)
}

/// Result of one [`sweep`] call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SweepResult {
    pub deleted: u64,
    /// Opaque checkpoint to resume a subsequent sweep; `None` means the
    /// whole `(.., now]` range was exhausted.
    pub checkpoint: Option<Vec<u8>>,
}

/// Scan the TTL index for rows expiring at or before `now`, deleting at
/// most `limit` of them from both DBIs (spec §4.F `sweep`). `checkpoint`
/// resumes a prior sweep that stopped mid-range due to hitting `limit`.
pub fn sweep(
    txn: &mut WriteTxn<'_>,
    data_dbi: u32,
    meta_dbi: u32,
    limit: u32,
    now_ms: u64,
    checkpoint: Option<Vec<u8>>,
) -> Result<SweepResult> {
    let start = checkpoint.unwrap_or_else(|| vec![INDEX_TAG]);
    let mut cur = match txn.cursor(meta_dbi) {
        Ok(c) => c,
        Err(Error::NotFound) => {
            return Ok(SweepResult {
                deleted: 0,
                checkpoint: None,
            })
        }
        Err(e) => return Err(e),
    };
    if txn.cursor_seek(meta_dbi, &mut cur, &start)?.is_none() {
        return Ok(SweepResult {
            deleted: 0,
            checkpoint: None,
        });
    }

    let mut deleted = 0u64;
    loop {
        let Some((ikey, _)) = txn.cursor_get(meta_dbi, &cur)? else {
            return Ok(SweepResult {
                deleted,
                checkpoint: None,
            });
        };
        if ikey.is_empty() || ikey[0] != INDEX_TAG {
            // Ran past the index family entirely.
            return Ok(SweepResult {
                deleted,
                checkpoint: None,
            });
        }
        let (ts, key) = decode_index_key(&ikey)?;
        if ts > now_ms {
            return Ok(SweepResult {
                deleted,
                checkpoint: None,
            });
        }
        if deleted >= limit as u64 {
            return Ok(SweepResult {
                deleted,
                checkpoint: Some(ikey),
            });
        }
        // Advance past this row before deleting it out from under the
        // cursor (deletion re-seeks, which would otherwise skip ahead
        // twice).
        let advanced = txn.cursor_next(meta_dbi, &mut cur)?;
        delete_ttl_rows(txn, data_dbi, meta_dbi, &key, ts)?;
        deleted += 1;
        if advanced.is_none() {
            return Ok(SweepResult {
                deleted,
                checkpoint: None,
            });
        }
    }
}
