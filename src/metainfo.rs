//! Parses and hashes `.torrent` metainfo files (BEP 3 §"Metainfo File
//! Structure") into the normalized shape the rest of the crate consumes.

use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::storage_info::{FileInfo, FsStructure};
use crate::Sha1Hash;

#[derive(Debug, Deserialize)]
struct RawMetainfo {
    info: RawInfo,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawInfo {
    name: String,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    piece_length: u32,
    length: Option<u64>,
    files: Option<Vec<RawFile>>,
    private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFile {
    path: Vec<String>,
    length: u64,
}

/// A parsed `.torrent` file, with the nominal piece length, expected piece
/// hashes, and on-disk layout normalized into [`FsStructure`].
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub name: String,
    pub piece_len: u32,
    pub piece_hashes: Vec<Sha1Hash>,
    pub private: bool,
    pub structure: FsStructure,
    info_hash: Sha1Hash,
}

impl Metainfo {
    /// Parses and hashes a raw `.torrent` file's bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;
        let info_hash = hash_info_dict(&raw.info)?;

        if raw.info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo);
        }
        let piece_hashes = raw
            .info
            .pieces
            .chunks(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let structure = match raw.info.files {
            Some(files) => {
                let mut torrent_offset = 0u64;
                let mut out = Vec::with_capacity(files.len());
                for file in files {
                    let path: PathBuf = file.path.iter().collect();
                    out.push(FileInfo {
                        path,
                        len: file.length,
                        torrent_offset,
                    });
                    torrent_offset += file.length;
                }
                FsStructure::Archive { files: out }
            }
            None => {
                let len = raw.info.length.ok_or(Error::InvalidMetainfo)?;
                FsStructure::File(FileInfo {
                    path: PathBuf::from(&raw.info.name),
                    len,
                    torrent_offset: 0,
                })
            }
        };

        Ok(Self {
            name: raw.info.name,
            piece_len: raw.info.piece_length,
            piece_hashes,
            private: raw.info.private.unwrap_or(0) != 0,
            structure,
            info_hash,
        })
    }

    pub fn info_hash(&self) -> Sha1Hash {
        self.info_hash
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }
}

/// The info hash is the SHA-1 of the bencoded `info` dictionary exactly as
/// it appeared in the file, so this re-serializes the parsed struct rather
/// than hashing some other representation.
fn hash_info_dict(info: &RawInfo) -> Result<Sha1Hash> {
    let bytes = serde_bencode::to_bytes(info)?;
    let digest = Sha1::digest(&bytes);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&digest);
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{self, Value};
    use std::collections::BTreeMap;

    fn sample_bytes(private: bool) -> Vec<u8> {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), bencode::bytes("sample".to_string()));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![7u8; 20]));
        info.insert(b"piece length".to_vec(), Value::Int(16384));
        info.insert(b"length".to_vec(), Value::Int(16384));
        if private {
            info.insert(b"private".to_vec(), Value::Int(1));
        }
        let mut top = BTreeMap::new();
        top.insert(b"info".to_vec(), Value::Dict(info));
        bencode::encode_to_vec(&Value::Dict(top))
    }

    #[test]
    fn parses_single_file_torrent() {
        let metainfo = Metainfo::from_bytes(&sample_bytes(false)).unwrap();
        assert_eq!(metainfo.name, "sample");
        assert_eq!(metainfo.piece_count(), 1);
        assert!(!metainfo.private);
        assert!(matches!(metainfo.structure, FsStructure::File(_)));
    }

    #[test]
    fn private_flag_is_surfaced() {
        let metainfo = Metainfo::from_bytes(&sample_bytes(true)).unwrap();
        assert!(metainfo.private);
    }

    #[test]
    fn rejects_pieces_not_a_multiple_of_twenty() {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), bencode::bytes("bad".to_string()));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![1u8; 19]));
        info.insert(b"piece length".to_vec(), Value::Int(16384));
        info.insert(b"length".to_vec(), Value::Int(16384));
        let mut top = BTreeMap::new();
        top.insert(b"info".to_vec(), Value::Dict(info));
        let bytes = bencode::encode_to_vec(&Value::Dict(top));
        assert!(Metainfo::from_bytes(&bytes).is_err());
    }

    #[test]
    fn info_hash_is_stable_for_identical_input() {
        let bytes = sample_bytes(false);
        let a = Metainfo::from_bytes(&bytes).unwrap();
        let b = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(a.info_hash(), b.info_hash());
    }
}
