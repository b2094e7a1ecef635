use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::DatabaseResult;

/// Generate a schema-encoding bitmask from a partial column vector: bit `i`
/// is set iff column `i` carries a value.
pub fn update_mask(columns: &[Option<i64>]) -> i64 {
    let mut mask: i64 = 0;

    for (index, value) in columns.iter().enumerate() {
        if value.is_some() {
            mask |= 1 << index;
        }
    }

    mask
}

/// Current wall-clock time in whole seconds, as stored in the
/// TIMESTAMP column.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// Little-endian framing helpers for the binary meta files. Field widths
// match the on-disk layout: i32 for counts and indices, i64 for RIDs.

pub fn write_i32<W: Write>(w: &mut W, value: i32) -> DatabaseResult<()> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn write_i64<W: Write>(w: &mut W, value: i64) -> DatabaseResult<()> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn read_i32<R: Read>(r: &mut R) -> DatabaseResult<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub fn read_i64<R: Read>(r: &mut R) -> DatabaseResult<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}
