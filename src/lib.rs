//! `leech` is a concurrent, leech-only BitTorrent V1 download engine.
//!
//! It owns the peer-wire protocol, the piece-selection and verification
//! strategy, and the coordinator that drives a bounded pool of peer sessions
//! to completion. Seeding, DHT, PEX, magnet links, MSE and UDP trackers are
//! explicitly out of scope.

#![recursion_limit = "256"]

#[macro_use]
extern crate serde_derive;

pub mod conf;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod piece_manager;
pub mod storage_info;
pub mod tracker;

use bitvec::prelude::{BitVec, Msb0};

pub use conf::Conf;
pub use engine::Engine;
pub use error::Error;
pub use metainfo::TorrentDescriptor;
pub use storage_info::FileInfo;

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in
/// the source code we use `usize` to be consistent with other index types in
/// Rust.
pub type PieceIndex = usize;

/// The type of a file's index within a (possibly multi-file) torrent.
pub type FileIndex = usize;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector from most significant to least significant
/// bits, that is, where the first highest bit represents the first piece,
/// the second highest bit the second piece, and so on (e.g. `0b1100_0001`
/// would mean that the peer has pieces 0, 1 and 7). A truthy value at a
/// piece's position means the peer has the piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// The only block length we deal with, except for possibly the last block of
/// the last piece. It is the widely used and accepted 16 KiB.
pub const BLOCK_LEN: u32 = 0x4000;

/// The number of peer sessions the coordinator keeps in its pool.
pub const MAX_PEER_COUNT: usize = 20;

/// How long a dispatched but unanswered request is allowed to sit in the
/// pending queue before it becomes eligible for reclamation by another peer.
pub const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);

/// How long the coordinator sleeps between announce-eligibility checks when
/// it isn't yet time to reannounce.
pub const ANNOUNCE_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Downloading happens at this block-level granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes. Always 16 KiB, except possibly for the
    /// last block of the last piece.
    pub len: u32,
}

impl BlockInfo {
    /// Returns the index of this block within its piece, assuming the
    /// default block length of 16 KiB.
    pub fn index_in_piece(&self) -> usize {
        (self.offset / BLOCK_LEN) as usize
    }
}

/// Returns the length of the block at `index` within a piece of length
/// `piece_len`.
///
/// If the piece length is not a multiple of [`BLOCK_LEN`], the last block is
/// shorter than the others.
///
/// # Panics
///
/// Panics if `index * BLOCK_LEN` would exceed `piece_len`.
pub fn block_len(piece_len: u32, index: usize) -> u32 {
    let index = index as u32;
    let block_offset = index * BLOCK_LEN;
    assert!(piece_len > block_offset);
    std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}

/// Returns the number of blocks that tile a piece of the given length.
pub fn block_count(piece_len: u32) -> usize {
    // all but the last piece are a multiple of the block length, but the
    // last piece may be shorter, so round up before dividing
    (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}
