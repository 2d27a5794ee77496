//! Bounds-checked readers and writers for message bodies
//!
//! All integers are big-endian. Variable-length fields carry a 4-byte count,
//! or a 2-byte count for short metadata.

use std::collections::BTreeSet;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hostmesh_core::types::HsId;

use crate::{WireError, WireResult};

fn ensure(buf: &Bytes, needed: usize) -> WireResult<()> {
    if buf.remaining() < needed {
        return Err(WireError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub fn get_u8(buf: &mut Bytes) -> WireResult<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_bool(buf: &mut Bytes) -> WireResult<bool> {
    Ok(get_u8(buf)? != 0)
}

pub fn get_u16(buf: &mut Bytes) -> WireResult<u16> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn get_i32(buf: &mut Bytes) -> WireResult<i32> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub fn get_i64(buf: &mut Bytes) -> WireResult<i64> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

/// Read a 4-byte element count and check that `elem_size * count` bytes follow
pub fn get_count(buf: &mut Bytes, elem_size: usize) -> WireResult<usize> {
    let count = get_i32(buf)?;
    if count < 0 {
        return Err(WireError::InvalidLength(count as i64));
    }
    let count = count as usize;
    ensure(buf, count.saturating_mul(elem_size))?;
    Ok(count)
}

/// Bytes preceded by a 4-byte length
pub fn get_bytes_u32(buf: &mut Bytes) -> WireResult<Bytes> {
    let len = get_count(buf, 1)?;
    Ok(buf.split_to(len))
}

/// Bytes preceded by a 2-byte length
pub fn get_bytes_u16(buf: &mut Bytes) -> WireResult<Bytes> {
    let len = get_u16(buf)? as usize;
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

/// UTF-8 string preceded by a 4-byte length
pub fn get_string(buf: &mut Bytes, field: &'static str) -> WireResult<String> {
    let raw = get_bytes_u32(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8(field))
}

pub fn get_hsid_set(buf: &mut Bytes) -> WireResult<BTreeSet<HsId>> {
    let count = get_count(buf, 8)?;
    let mut set = BTreeSet::new();
    for _ in 0..count {
        set.insert(buf.get_i64());
    }
    Ok(set)
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

pub fn put_bytes_u32(buf: &mut BytesMut, data: &[u8]) {
    buf.put_i32(data.len() as i32);
    buf.put_slice(data);
}

pub fn put_bytes_u16(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
}

pub fn put_string(buf: &mut BytesMut, value: &str) {
    put_bytes_u32(buf, value.as_bytes());
}

pub fn put_hsid_set(buf: &mut BytesMut, set: &BTreeSet<HsId>) {
    buf.put_i32(set.len() as i32);
    for hsid in set {
        buf.put_i64(*hsid);
    }
}

pub fn hsid_set_len(set: &BTreeSet<HsId>) -> usize {
    4 + set.len() * 8
}
