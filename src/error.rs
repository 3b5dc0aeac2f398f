//! Error types for every layer of the engine, per the three strata in the
//! design: protocol errors and transport errors terminate a single peer
//! session, while engine-fatal errors propagate to the coordinator and are
//! surfaced to the caller of [`crate::Engine::run`].

use std::{fmt, io};

/// Errors that can terminate a single peer session (protocol and transport
/// strata). These never escape the session: the coordinator logs them and
/// frees the session's slot for another peer.
#[derive(Debug)]
pub enum PeerError {
    Io(io::Error),
    /// The handshake's pstrlen byte or protocol string didn't match.
    IncorrectProtocol,
    /// The peer's handshake advertised a different info hash than ours.
    InvalidInfoHash,
    /// A framed message carried an id outside 0..=8.
    InvalidMessageId(u8),
    /// A bitfield message arrived outside the post-handshake availability
    /// exchange, or a second bitfield arrived after the first.
    UnexpectedBitfield,
    /// The remote closed the connection or reset it.
    ConnectionClosed,
    /// A received block could not be verified or written to disk.
    Disk(DiskError),
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "peer io error: {}", e),
            Self::IncorrectProtocol => write!(f, "handshake protocol mismatch"),
            Self::InvalidInfoHash => write!(f, "handshake info hash mismatch"),
            Self::InvalidMessageId(id) => write!(f, "invalid message id: {}", id),
            Self::UnexpectedBitfield => write!(f, "bitfield not directly after handshake"),
            Self::ConnectionClosed => write!(f, "peer connection closed"),
            Self::Disk(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for PeerError {}

impl From<io::Error> for PeerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<DiskError> for PeerError {
    fn from(e: DiskError) -> Self {
        Self::Disk(e)
    }
}

/// Errors produced while parsing a metainfo (`.torrent`) file into a
/// [`crate::TorrentDescriptor`].
#[derive(Debug)]
pub enum MetainfoError {
    Io(io::Error),
    Bencode(serde_bencode::Error),
    /// Neither `length` nor `files` was present in the `info` dictionary.
    MissingFiles,
    /// `pieces` length was not a multiple of 20.
    MalformedPieceHashes,
}

impl fmt::Display for MetainfoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "metainfo io error: {}", e),
            Self::Bencode(e) => write!(f, "metainfo bencode error: {}", e),
            Self::MissingFiles => write!(f, "info dict has neither `length` nor `files`"),
            Self::MalformedPieceHashes => {
                write!(f, "`pieces` length is not a multiple of 20")
            }
        }
    }
}

impl std::error::Error for MetainfoError {}

impl From<io::Error> for MetainfoError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_bencode::Error> for MetainfoError {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

/// Errors from announcing to the tracker.
#[derive(Debug)]
pub enum TrackerError {
    Http(reqwest::Error),
    Bencode(serde_bencode::Error),
    /// The tracker's response body contained a `failure reason`-shaped
    /// message, detected heuristically (attempt a UTF-8 decode and look for
    /// "failure").
    Failure(String),
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(e) => write!(f, "tracker http error: {}", e),
            Self::Bencode(e) => write!(f, "tracker response bencode error: {}", e),
            Self::Failure(msg) => write!(f, "tracker reported failure: {}", msg),
        }
    }
}

impl std::error::Error for TrackerError {}

impl From<reqwest::Error> for TrackerError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

impl From<serde_bencode::Error> for TrackerError {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

/// Errors from the piece manager's disk writer. A write failure is
/// engine-fatal (stratum 3): it propagates up through `block_received` to
/// the coordinator rather than being swallowed, since we have no retry
/// strategy for a broken download directory.
#[derive(Debug)]
pub enum DiskError {
    Io(io::Error),
    InvalidPieceIndex,
}

impl fmt::Display for DiskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "disk io error: {}", e),
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
        }
    }
}

impl std::error::Error for DiskError {}

impl From<io::Error> for DiskError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// The top-level, engine-fatal error returned by [`crate::Engine::run`].
#[derive(Debug)]
pub enum Error {
    Metainfo(MetainfoError),
    /// Every announce attempt of a cycle failed to reach the tracker.
    Tracker(TrackerError),
    Disk(DiskError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metainfo(e) => write!(f, "{}", e),
            Self::Tracker(e) => write!(f, "{}", e),
            Self::Disk(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<MetainfoError> for Error {
    fn from(e: MetainfoError) -> Self {
        Self::Metainfo(e)
    }
}

impl From<TrackerError> for Error {
    fn from(e: TrackerError) -> Self {
        Self::Tracker(e)
    }
}

impl From<DiskError> for Error {
    fn from(e: DiskError) -> Self {
        Self::Disk(e)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
