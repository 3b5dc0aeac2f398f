//! Parses a bencoded metainfo (`.torrent`) file into a [`TorrentDescriptor`],
//! the immutable, pre-parsed torrent description the rest of the engine
//! consumes.
//!
//! Bencoding grammar: integers `i<d>e`, byte strings `<len>:<bytes>`, lists
//! `l…e`, dicts `d…e`. `info_hash` is the SHA-1 of the bencoded `info`
//! sub-dictionary, preserving its exact byte form — this is why `Info` is
//! deserialized as a nested struct rather than flattened, and why we
//! re-serialize it to recompute the hash rather than hashing a slice of the
//! original input.

use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::error::MetainfoError;
use crate::Sha1Hash;

/// The raw bencoded shape of a `.torrent` file.
#[derive(Debug, Deserialize)]
struct Metainfo {
    announce: String,
    info: Info,
}

#[derive(Debug, Serialize, Deserialize)]
struct Info {
    name: String,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    piece_length: u32,
    length: Option<u64>,
    files: Option<Vec<RawFile>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFile {
    path: Vec<String>,
    length: u64,
}

/// A torrent's files are immutable, ordered and known up front: the engine
/// never discovers new files mid-download.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TorrentFile {
    /// The file's path, relative to the torrent's download directory.
    pub path: PathBuf,
    /// The file's length in bytes.
    pub length: u64,
}

/// An immutable, pre-parsed description of a torrent, as consumed by the
/// download engine. Everything here is derived once from a `.torrent` file
/// and never changes for the lifetime of a download.
#[derive(Clone, Debug)]
pub struct TorrentDescriptor {
    /// SHA-1 of the bencoded `info` dictionary, byte-for-byte.
    pub info_hash: Sha1Hash,
    /// Bytes per piece; the last piece may be shorter.
    pub piece_length: u32,
    /// One SHA-1 hash per piece, in piece order.
    pub piece_hashes: Vec<Sha1Hash>,
    /// Ordered files that make up the torrent's payload.
    pub files: Vec<TorrentFile>,
    /// The tracker's announce URL.
    pub announce: String,
}

impl TorrentDescriptor {
    /// Parses a bencoded metainfo file into a torrent descriptor.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, MetainfoError> {
        let metainfo: Metainfo = serde_bencode::from_bytes(buf)?;
        Self::from_metainfo(metainfo)
    }

    fn from_metainfo(metainfo: Metainfo) -> Result<Self, MetainfoError> {
        let info_hash = hash_info(&metainfo.info)?;

        if metainfo.info.pieces.len() % 20 != 0 {
            return Err(MetainfoError::MalformedPieceHashes);
        }
        let piece_hashes = metainfo
            .info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let files = match metainfo.info.files {
            Some(raw_files) => raw_files
                .into_iter()
                .map(|f| TorrentFile {
                    path: f.path.iter().collect(),
                    length: f.length,
                })
                .collect(),
            None => {
                let length = metainfo.info.length.ok_or(MetainfoError::MissingFiles)?;
                vec![TorrentFile {
                    path: PathBuf::from(&metainfo.info.name),
                    length,
                }]
            }
        };

        Ok(Self {
            info_hash,
            piece_length: metainfo.info.piece_length,
            piece_hashes,
            files,
            announce: metainfo.announce,
        })
    }

    /// The sum of the lengths of all files in the torrent.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Returns the length of the piece at `index`, accounting for the final
    /// (possibly shorter) piece.
    pub fn piece_len(&self, index: crate::PieceIndex) -> u32 {
        if index == self.piece_count() - 1 {
            let full = self.piece_length as u64 * (self.piece_count() - 1) as u64;
            (self.total_size() - full) as u32
        } else {
            self.piece_length
        }
    }
}

fn hash_info(info: &Info) -> Result<Sha1Hash, MetainfoError> {
    let bytes = serde_bencode::to_bytes(info)?;
    let digest = Sha1::digest(&bytes);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&digest);
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_file_torrent() {
        let mut pieces = Vec::new();
        pieces.extend_from_slice(&[1u8; 20]);
        pieces.extend_from_slice(&[2u8; 20]);

        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce20:http://tracker.test4:infod6:lengthi20e4:name8:file.bin12:piece lengthi10e6:pieces");
        buf.extend_from_slice(format!("{}:", pieces.len()).as_bytes());
        buf.extend_from_slice(&pieces);
        buf.extend_from_slice(b"ee");

        let descriptor = TorrentDescriptor::from_bytes(&buf).unwrap();
        assert_eq!(descriptor.announce, "http://tracker.test");
        assert_eq!(descriptor.piece_length, 10);
        assert_eq!(descriptor.piece_count(), 2);
        assert_eq!(descriptor.total_size(), 20);
        assert_eq!(descriptor.files.len(), 1);
        assert_eq!(descriptor.files[0].path, PathBuf::from("file.bin"));
        assert_eq!(descriptor.piece_len(0), 10);
        assert_eq!(descriptor.piece_len(1), 10);
    }

    #[test]
    fn test_parse_multi_file_torrent() {
        let mut pieces = Vec::new();
        pieces.extend_from_slice(&[3u8; 20]);

        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce20:http://tracker.test4:infod5:filesld6:lengthi4e4:pathl1:a1:be ed6:lengthi6e4:pathl1:ceee4:name4:root12:piece lengthi10e6:pieces");
        buf.extend_from_slice(format!("{}:", pieces.len()).as_bytes());
        buf.extend_from_slice(&pieces);
        buf.extend_from_slice(b"ee");

        let descriptor = TorrentDescriptor::from_bytes(&buf).unwrap();
        assert_eq!(descriptor.files.len(), 2);
        assert_eq!(descriptor.files[0].path, PathBuf::from("a/b"));
        assert_eq!(descriptor.files[0].length, 4);
        assert_eq!(descriptor.files[1].path, PathBuf::from("c"));
        assert_eq!(descriptor.files[1].length, 6);
        assert_eq!(descriptor.total_size(), 10);
        // 10 byte piece length, 10 byte total: exactly one (last) piece
        assert_eq!(descriptor.piece_len(0), 10);
    }

    #[test]
    fn test_malformed_piece_hashes_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce4:test4:infod6:lengthi1e4:name1:a12:piece lengthi1e6:pieces5:abcdee");
        let err = TorrentDescriptor::from_bytes(&buf).unwrap_err();
        assert!(matches!(err, MetainfoError::MalformedPieceHashes));
    }
}
