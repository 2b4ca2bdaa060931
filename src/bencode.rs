//! A small hand-written bencode decoder and encoder.
//!
//! Metainfo parsing keeps using `serde_bencode` (see `metainfo.rs`), since
//! that already exists in the teacher crate and is a separate, out-of-scope
//! concern. This module exists only for the two hot, small payloads the
//! peer protocol engine itself must speak: the LTEP extension handshake and
//! the µTorrent PEX message, per the design note that these are the only
//! bencode hot paths worth a bespoke decoder for.

use std::collections::BTreeMap;
use std::convert::TryFrom;

use crate::error::{Error, Result};

/// A bencoded value. Dictionary keys are kept as raw byte strings (LTEP/PEX
/// keys happen to always be ASCII, but bencode itself makes no such
/// promise) in a `BTreeMap` so that round-trip encoding is deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }
}

/// Decodes a single bencoded value from the start of `buf`, returning the
/// value and the number of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(Value, usize)> {
    decode_at(buf, 0).map(|(v, pos)| (v, pos))
}

fn decode_at(buf: &[u8], pos: usize) -> Result<(Value, usize)> {
    match buf.get(pos) {
        Some(b'i') => decode_int(buf, pos),
        Some(b'l') => decode_list(buf, pos),
        Some(b'd') => decode_dict(buf, pos),
        Some(b'0'..=b'9') => decode_bytes(buf, pos),
        _ => Err(Error::InvalidBencode),
    }
}

fn decode_int(buf: &[u8], pos: usize) -> Result<(Value, usize)> {
    let end = find(buf, pos + 1, b'e')?;
    let s = std::str::from_utf8(&buf[pos + 1..end])
        .map_err(|_| Error::InvalidBencode)?;
    let n: i64 = s.parse().map_err(|_| Error::InvalidBencode)?;
    Ok((Value::Int(n), end + 1))
}

fn decode_bytes(buf: &[u8], pos: usize) -> Result<(Value, usize)> {
    let colon = find(buf, pos, b':')?;
    let len_str = std::str::from_utf8(&buf[pos..colon])
        .map_err(|_| Error::InvalidBencode)?;
    let len: usize = len_str.parse().map_err(|_| Error::InvalidBencode)?;
    let start = colon + 1;
    let end = start.checked_add(len).ok_or(Error::InvalidBencode)?;
    let bytes = buf.get(start..end).ok_or(Error::InvalidBencode)?;
    Ok((Value::Bytes(bytes.to_vec()), end))
}

fn decode_list(buf: &[u8], pos: usize) -> Result<(Value, usize)> {
    let mut items = Vec::new();
    let mut cursor = pos + 1;
    loop {
        match buf.get(cursor) {
            Some(b'e') => return Ok((Value::List(items), cursor + 1)),
            Some(_) => {
                let (v, next) = decode_at(buf, cursor)?;
                items.push(v);
                cursor = next;
            }
            None => return Err(Error::InvalidBencode),
        }
    }
}

fn decode_dict(buf: &[u8], pos: usize) -> Result<(Value, usize)> {
    let mut map = BTreeMap::new();
    let mut cursor = pos + 1;
    loop {
        match buf.get(cursor) {
            Some(b'e') => return Ok((Value::Dict(map), cursor + 1)),
            Some(_) => {
                let (key, next) = decode_bytes(buf, cursor)?;
                let key = match key {
                    Value::Bytes(b) => b,
                    _ => unreachable!(),
                };
                let (value, next) = decode_at(buf, next)?;
                map.insert(key, value);
                cursor = next;
            }
            None => return Err(Error::InvalidBencode),
        }
    }
}

fn find(buf: &[u8], from: usize, needle: u8) -> Result<usize> {
    buf[from..]
        .iter()
        .position(|&b| b == needle)
        .map(|i| from + i)
        .ok_or(Error::InvalidBencode)
}

/// Appends the bencoded form of `value` to `out`.
pub fn encode(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(map) => {
            out.push(b'd');
            // BTreeMap iterates in sorted key order already, which is what
            // the bencode spec requires for canonical dict encoding.
            for (k, v) in map {
                encode(&Value::Bytes(k.clone()), out);
                encode(v, out);
            }
            out.push(b'e');
        }
    }
}

pub fn encode_to_vec(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode(value, &mut out);
    out
}

/// Convenience for building a `Value::Bytes` from a string literal.
pub fn bytes(s: impl Into<Vec<u8>>) -> Value {
    Value::Bytes(s.into())
}

impl TryFrom<i64> for Value {
    type Error = std::convert::Infallible;
    fn try_from(n: i64) -> std::result::Result<Self, Self::Error> {
        Ok(Value::Int(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_int() {
        let v = Value::Int(-42);
        let encoded = encode_to_vec(&v);
        let (decoded, used) = decode(&encoded).unwrap();
        assert_eq!(used, encoded.len());
        assert_eq!(decoded, v);
    }

    #[test]
    fn round_trips_bytes() {
        let v = bytes("ut_pex");
        let encoded = encode_to_vec(&v);
        assert_eq!(encoded, b"6:ut_pex");
        let (decoded, _) = decode(&encoded).unwrap();
        assert_eq!(decoded, v);
    }

    #[test]
    fn round_trips_nested_dict() {
        let mut m_dict = BTreeMap::new();
        m_dict.insert(b"ut_pex".to_vec(), Value::Int(1));
        let mut top = BTreeMap::new();
        top.insert(b"m".to_vec(), Value::Dict(m_dict));
        top.insert(b"p".to_vec(), Value::Int(6881));
        top.insert(b"v".to_vec(), bytes("peerwire 0.1"));
        let v = Value::Dict(top);

        let encoded = encode_to_vec(&v);
        let (decoded, used) = decode(&encoded).unwrap();
        assert_eq!(used, encoded.len());
        assert_eq!(decoded, v);
    }

    #[test]
    fn decode_errors_on_truncated_input() {
        assert!(decode(b"5:ab").is_err());
    }

    #[test]
    fn dict_keys_are_emitted_sorted() {
        let mut map = BTreeMap::new();
        map.insert(b"z".to_vec(), Value::Int(1));
        map.insert(b"a".to_vec(), Value::Int(2));
        let encoded = encode_to_vec(&Value::Dict(map));
        assert_eq!(encoded, b"d1:ai2e1:zi1ee");
    }
}
