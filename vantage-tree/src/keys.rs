//! Binary key grammar
//!
//! Every key is the tree name followed by a one-byte subkey tag:
//!
//! ```text
//! key     = name subkey
//! subkey  = 0x01 id ival          data store (item body)
//!         | 0x02 ival             i index (ival -> head key)
//!         | 0x03 id version       head index (-> opts byte + ival)
//!         | 0x04 version          version index (-> data store key)
//!         | 0x05 string           user store (arbitrary bytes)
//!
//! string  = len byte* 0x00        len counts the bytes incl. trailing NUL
//! lbeint  = len byte*             1..254 big-endian unsigned bytes
//! ```
//!
//! `name` is ASCII without NUL; ids are opaque NUL-free bytes. Because every
//! numeric field is length-prefixed big-endian, lexicographic byte order in
//! the store equals numeric order, which makes range scans the only
//! primitive the tree needs.

use thiserror::Error;

use vantage_model::MAX_ID_SIZE;

/// Subkey tags.
pub const SUBKEY_DS: u8 = 0x01;
pub const SUBKEY_I: u8 = 0x02;
pub const SUBKEY_HEAD: u8 = 0x03;
pub const SUBKEY_V: u8 = 0x04;
pub const SUBKEY_US: u8 = 0x05;

/// Head index value flag: the head is in conflict.
pub const HEAD_OPT_CONFLICT: u8 = 0x01;

/// Errors from key encoding and decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("name must be 1..={MAX_ID_SIZE} ASCII bytes without NUL")]
    InvalidName,

    #[error("id must be 1..={MAX_ID_SIZE} bytes without NUL")]
    InvalidId,

    #[error("user key must be 1..={MAX_ID_SIZE} bytes without NUL")]
    InvalidUserKey,

    #[error("integer does not fit the length-prefixed encoding")]
    IntTooWide,

    #[error("malformed key: {0}")]
    Malformed(&'static str),
}

fn validate_name(name: &str) -> Result<(), KeyError> {
    let bytes = name.as_bytes();
    if bytes.is_empty()
        || bytes.len() > MAX_ID_SIZE
        || !bytes.iter().all(|b| b.is_ascii() && *b != 0)
    {
        return Err(KeyError::InvalidName);
    }
    Ok(())
}

fn validate_id(id: &[u8]) -> Result<(), KeyError> {
    if id.is_empty() || id.len() > MAX_ID_SIZE || id.contains(&0) {
        return Err(KeyError::InvalidId);
    }
    Ok(())
}

/// Append a length-prefixed NUL-terminated string.
fn push_string(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push((bytes.len() + 1) as u8);
    out.extend_from_slice(bytes);
    out.push(0);
}

/// Append a length-prefixed big-endian unsigned integer.
///
/// Minimal-width encoding: shorter integers sort before longer ones and
/// equal-width integers compare bytewise, so byte order is numeric order.
pub fn push_lbeint(out: &mut Vec<u8>, value: u64) {
    let be = value.to_be_bytes();
    let skip = be.iter().take_while(|b| **b == 0).count().min(7);
    let body = &be[skip..];
    out.push(body.len() as u8);
    out.extend_from_slice(body);
}

/// Decode a length-prefixed big-endian unsigned integer; returns the value
/// and the number of bytes consumed.
pub fn take_lbeint(bytes: &[u8]) -> Result<(u64, usize), KeyError> {
    let len = *bytes.first().ok_or(KeyError::Malformed("empty lbeint"))? as usize;
    if len == 0 || len > 8 || bytes.len() < 1 + len {
        return Err(KeyError::Malformed("bad lbeint length"));
    }
    let mut value: u64 = 0;
    for b in &bytes[1..1 + len] {
        value = (value << 8) | u64::from(*b);
    }
    Ok((value, 1 + len))
}

fn take_string(bytes: &[u8]) -> Result<(&[u8], usize), KeyError> {
    let len = *bytes.first().ok_or(KeyError::Malformed("empty string"))? as usize;
    if len == 0 || bytes.len() < 1 + len {
        return Err(KeyError::Malformed("bad string length"));
    }
    if bytes[len] != 0 {
        return Err(KeyError::Malformed("string missing terminator"));
    }
    Ok((&bytes[1..len], 1 + len))
}

fn name_prefix(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 2);
    push_string(&mut out, name.as_bytes());
    out
}

/// Data-store key: `name 0x01 id ival`.
pub fn ds_key(name: &str, id: &[u8], i: u64) -> Result<Vec<u8>, KeyError> {
    validate_name(name)?;
    validate_id(id)?;
    let mut out = name_prefix(name);
    out.push(SUBKEY_DS);
    push_string(&mut out, id);
    push_lbeint(&mut out, i);
    Ok(out)
}

/// Prefix of all data-store keys of one id (per-id insertion-order scans).
pub fn ds_prefix(name: &str, id: &[u8]) -> Result<Vec<u8>, KeyError> {
    validate_name(name)?;
    validate_id(id)?;
    let mut out = name_prefix(name);
    out.push(SUBKEY_DS);
    push_string(&mut out, id);
    Ok(out)
}

/// Insertion-order key: `name 0x02 ival`.
pub fn i_key(name: &str, i: u64) -> Result<Vec<u8>, KeyError> {
    validate_name(name)?;
    let mut out = name_prefix(name);
    out.push(SUBKEY_I);
    push_lbeint(&mut out, i);
    Ok(out)
}

/// Prefix of all insertion-order keys (global insertion-order scans).
pub fn i_prefix(name: &str) -> Result<Vec<u8>, KeyError> {
    validate_name(name)?;
    let mut out = name_prefix(name);
    out.push(SUBKEY_I);
    Ok(out)
}

/// Head-index key: `name 0x03 id version`.
pub fn head_key(name: &str, id: &[u8], version: &[u8]) -> Result<Vec<u8>, KeyError> {
    let mut out = head_prefix(name, id)?;
    out.push(version.len() as u8);
    out.extend_from_slice(version);
    Ok(out)
}

/// Prefix of all head-index keys of one id.
pub fn head_prefix(name: &str, id: &[u8]) -> Result<Vec<u8>, KeyError> {
    validate_name(name)?;
    validate_id(id)?;
    let mut out = name_prefix(name);
    out.push(SUBKEY_HEAD);
    push_string(&mut out, id);
    Ok(out)
}

/// Version-index key: `name 0x04 version`.
pub fn v_key(name: &str, version: &[u8]) -> Result<Vec<u8>, KeyError> {
    validate_name(name)?;
    let mut out = name_prefix(name);
    out.push(SUBKEY_V);
    out.push(version.len() as u8);
    out.extend_from_slice(version);
    Ok(out)
}

/// User-store key: `name 0x05 string`.
pub fn us_key(name: &str, user: &[u8]) -> Result<Vec<u8>, KeyError> {
    validate_name(name)?;
    if user.is_empty() || user.len() > MAX_ID_SIZE || user.contains(&0) {
        return Err(KeyError::InvalidUserKey);
    }
    let mut out = name_prefix(name);
    out.push(SUBKEY_US);
    push_string(&mut out, user);
    Ok(out)
}

/// Head-index value: opts byte followed by the insertion index.
pub fn head_value(conflict: bool, i: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.push(if conflict { HEAD_OPT_CONFLICT } else { 0 });
    push_lbeint(&mut out, i);
    out
}

/// Decode a head-index value into (conflict, insertion index).
pub fn parse_head_value(bytes: &[u8]) -> Result<(bool, u64), KeyError> {
    let opts = *bytes.first().ok_or(KeyError::Malformed("empty head value"))?;
    let (i, _) = take_lbeint(&bytes[1..])?;
    Ok((opts & HEAD_OPT_CONFLICT != 0, i))
}

/// Smallest byte string strictly greater than every key with this prefix,
/// for use as an exclusive range end. `None` when the prefix is all 0xff.
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Some(out);
        }
        out.pop();
    }
    None
}

/// A decoded key, used by diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedKey {
    Ds { name: String, id: Vec<u8>, i: u64 },
    I { name: String, i: u64 },
    Head { name: String, id: Vec<u8>, version: Vec<u8> },
    V { name: String, version: Vec<u8> },
    Us { name: String, key: Vec<u8> },
}

impl ParsedKey {
    pub fn parse(bytes: &[u8]) -> Result<Self, KeyError> {
        let (name_bytes, used) = take_string(bytes)?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| KeyError::Malformed("name not ASCII"))?
            .to_string();
        let rest = &bytes[used..];
        let tag = *rest.first().ok_or(KeyError::Malformed("missing subkey tag"))?;
        let rest = &rest[1..];
        match tag {
            SUBKEY_DS => {
                let (id, used) = take_string(rest)?;
                let (i, _) = take_lbeint(&rest[used..])?;
                Ok(ParsedKey::Ds { name, id: id.to_vec(), i })
            }
            SUBKEY_I => {
                let (i, _) = take_lbeint(rest)?;
                Ok(ParsedKey::I { name, i })
            }
            SUBKEY_HEAD => {
                let (id, used) = take_string(rest)?;
                let v = &rest[used..];
                let len = *v.first().ok_or(KeyError::Malformed("missing version"))? as usize;
                if v.len() < 1 + len {
                    return Err(KeyError::Malformed("bad version length"));
                }
                Ok(ParsedKey::Head {
                    name,
                    id: id.to_vec(),
                    version: v[1..1 + len].to_vec(),
                })
            }
            SUBKEY_V => {
                let len = *rest.first().ok_or(KeyError::Malformed("missing version"))? as usize;
                if rest.len() < 1 + len {
                    return Err(KeyError::Malformed("bad version length"));
                }
                Ok(ParsedKey::V { name, version: rest[1..1 + len].to_vec() })
            }
            SUBKEY_US => {
                let (key, _) = take_string(rest)?;
                Ok(ParsedKey::Us { name, key: key.to_vec() })
            }
            _ => Err(KeyError::Malformed("unknown subkey tag")),
        }
    }
}
