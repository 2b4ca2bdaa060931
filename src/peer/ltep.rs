//! BEP 10 (Libtorrent Extension Protocol) handshake and the µTorrent PEX
//! extension (`ut_pex`) payload built on top of it.

use std::convert::TryFrom;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::bencode::{self, Value};
use crate::error::{Error, Result};

/// The sub-message id reserved for the extension handshake itself.
pub(crate) const LTEP_HANDSHAKE_SUB_ID: u8 = 0;

/// Our locally assigned sub-id for `ut_pex` messages, advertised to peers
/// in our own extension handshake `m` dictionary.
pub(crate) const UT_PEX_LOCAL_ID: i64 = 1;

/// The decoded contents of an extension handshake payload.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExtendedHandshake {
    /// The peer's sub-id for `ut_pex`, if it supports the extension.
    pub(crate) ut_pex_id: Option<u8>,
    pub(crate) listen_port: Option<u16>,
    pub(crate) client_version: Option<String>,
}

/// Builds our own extension handshake payload.
pub(crate) fn encode_handshake(
    listen_port: Option<u16>,
    client_version: &str,
) -> Vec<u8> {
    let mut m = std::collections::BTreeMap::new();
    m.insert(b"ut_pex".to_vec(), Value::Int(UT_PEX_LOCAL_ID));

    let mut top = std::collections::BTreeMap::new();
    top.insert(b"m".to_vec(), Value::Dict(m));
    if let Some(port) = listen_port {
        top.insert(b"p".to_vec(), Value::Int(port as i64));
    }
    top.insert(
        b"v".to_vec(),
        bencode::bytes(client_version.to_string()),
    );

    bencode::encode_to_vec(&Value::Dict(top))
}

/// Parses a peer's extension handshake payload.
pub(crate) fn decode_handshake(payload: &[u8]) -> Result<ExtendedHandshake> {
    let (value, _) = bencode::decode(payload)?;
    let dict = value.as_dict().ok_or(Error::InvalidLtepPayload)?;

    let ut_pex_id = dict
        .get(b"m".as_slice())
        .and_then(Value::as_dict)
        .and_then(|m| m.get(b"ut_pex".as_slice()))
        .and_then(Value::as_int)
        .and_then(|id| u8::try_from(id).ok());

    let listen_port = dict
        .get(b"p".as_slice())
        .and_then(Value::as_int)
        .and_then(|p| u16::try_from(p).ok());

    let client_version = dict
        .get(b"v".as_slice())
        .and_then(Value::as_bytes)
        .map(|b| String::from_utf8_lossy(b).into_owned());

    Ok(ExtendedHandshake {
        ut_pex_id,
        listen_port,
        client_version,
    })
}

/// A decoded `ut_pex` payload.
#[derive(Debug, Clone, Default)]
pub(crate) struct PexMessage {
    /// Newly advertised peers and their per-peer flag byte (`added.f`).
    pub(crate) added: Vec<(SocketAddr, u8)>,
    pub(crate) dropped: Vec<SocketAddr>,
}

/// Encodes a PEX diff into a `ut_pex` payload, capping each list at 50
/// entries per the periodic PEX tick's diff-size cap.
pub(crate) fn encode_pex(
    added: &[(SocketAddr, u8)],
    dropped: &[SocketAddr],
) -> Vec<u8> {
    const MAX_ENTRIES: usize = 50;

    let mut added_bytes = Vec::new();
    let mut added_flags = Vec::new();
    for (addr, flags) in added.iter().take(MAX_ENTRIES) {
        if let SocketAddr::V4(v4) = addr {
            added_bytes.extend_from_slice(&v4.ip().octets());
            added_bytes.extend_from_slice(&v4.port().to_be_bytes());
            added_flags.push(*flags);
        }
    }

    let mut dropped_bytes = Vec::new();
    for addr in dropped.iter().take(MAX_ENTRIES) {
        if let SocketAddr::V4(v4) = addr {
            dropped_bytes.extend_from_slice(&v4.ip().octets());
            dropped_bytes.extend_from_slice(&v4.port().to_be_bytes());
        }
    }

    let mut dict = std::collections::BTreeMap::new();
    dict.insert(b"added".to_vec(), Value::Bytes(added_bytes));
    dict.insert(b"added.f".to_vec(), Value::Bytes(added_flags));
    dict.insert(b"dropped".to_vec(), Value::Bytes(dropped_bytes));

    bencode::encode_to_vec(&Value::Dict(dict))
}

pub(crate) fn decode_pex(payload: &[u8]) -> Result<PexMessage> {
    let (value, _) = bencode::decode(payload)?;
    let dict = value.as_dict().ok_or(Error::InvalidPexPayload)?;

    let added_bytes = dict
        .get(b"added".as_slice())
        .and_then(Value::as_bytes)
        .unwrap_or(&[]);
    let added_flags = dict
        .get(b"added.f".as_slice())
        .and_then(Value::as_bytes)
        .unwrap_or(&[]);
    let dropped_bytes = dict
        .get(b"dropped".as_slice())
        .and_then(Value::as_bytes)
        .unwrap_or(&[]);

    Ok(PexMessage {
        added: decode_compact_with_flags(added_bytes, added_flags)?,
        dropped: decode_compact(dropped_bytes)?
            .into_iter()
            .map(|(addr, _)| addr)
            .collect(),
    })
}

/// Decodes a compact 6-bytes-per-peer `ipv4:port` list, as used both by
/// PEX and by tracker peer lists.
pub(crate) fn decode_compact(bytes: &[u8]) -> Result<Vec<(SocketAddr, u8)>> {
    decode_compact_with_flags(bytes, &[])
}

fn decode_compact_with_flags(
    bytes: &[u8],
    flags: &[u8],
) -> Result<Vec<(SocketAddr, u8)>> {
    if bytes.len() % 6 != 0 {
        return Err(Error::InvalidPexPayload);
    }
    let mut out = Vec::with_capacity(bytes.len() / 6);
    for (i, chunk) in bytes.chunks(6).enumerate() {
        let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
        let port = u16::from_be_bytes([chunk[4], chunk[5]]);
        let flag = flags.get(i).copied().unwrap_or(0);
        out.push((SocketAddr::V4(SocketAddrV4::new(ip, port)), flag));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let encoded = encode_handshake(Some(6881), "peerwire 0.1");
        let decoded = decode_handshake(&encoded).unwrap();
        assert_eq!(decoded.ut_pex_id, Some(UT_PEX_LOCAL_ID as u8));
        assert_eq!(decoded.listen_port, Some(6881));
        assert_eq!(decoded.client_version.as_deref(), Some("peerwire 0.1"));
    }

    #[test]
    fn pex_round_trips() {
        let a: SocketAddr = "10.0.0.1:111".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:222".parse().unwrap();
        let c: SocketAddr = "10.0.0.3:333".parse().unwrap();

        let encoded = encode_pex(&[(a, 0x01), (b, 0x00)], &[c]);
        let decoded = decode_pex(&encoded).unwrap();

        assert_eq!(decoded.added, vec![(a, 0x01), (b, 0x00)]);
        assert_eq!(decoded.dropped, vec![c]);
    }

    #[test]
    fn pex_encode_caps_entries_at_fifty() {
        let many: Vec<(SocketAddr, u8)> = (0..200)
            .map(|i| {
                (
                    SocketAddr::V4(SocketAddrV4::new(
                        Ipv4Addr::new(10, 0, (i / 256) as u8, (i % 256) as u8),
                        1000,
                    )),
                    0,
                )
            })
            .collect();
        let encoded = encode_pex(&many, &[]);
        let decoded = decode_pex(&encoded).unwrap();
        assert_eq!(decoded.added.len(), 50);
    }

    #[test]
    fn rejects_compact_list_not_a_multiple_of_six() {
        assert!(decode_compact(&[1, 2, 3]).is_err());
    }
}
