//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use rand::Rng;

use crate::{PeerId, ANNOUNCE_POLL_INTERVAL, MAX_PEER_COUNT, REQUEST_TIMEOUT};

/// Generates a fresh Azureus-style peer id: the fixed prefix `-PC0001-`
/// followed by 12 random ASCII digits, per BEP 20.
pub fn random_client_id() -> PeerId {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(b"-PC0001-");
    let mut rng = rand::thread_rng();
    for byte in &mut id[8..] {
        *byte = b'0' + rng.gen_range(0..10);
    }
    id
}

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the engine configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. Generates a fresh random client id.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: random_client_id(),
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent download.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download.
    pub download_dir: PathBuf,

    /// The size of the peer session pool the coordinator maintains.
    pub max_peer_count: usize,

    /// If the tracker doesn't provide an announce interval, fall back to
    /// this one.
    pub default_announce_interval: Duration,

    /// How long the coordinator waits before polling again when it isn't
    /// yet time to reannounce.
    pub announce_poll_interval: Duration,

    /// How long a dispatched request may sit unanswered before another peer
    /// may reclaim it.
    pub request_timeout: Duration,

    /// After this many consecutive failed announce cycles, the engine gives
    /// up and surfaces a fatal error.
    pub tracker_error_threshold: usize,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except
    /// for the download directory, as it is not sensible to guess that for
    /// the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            max_peer_count: MAX_PEER_COUNT,
            default_announce_interval: Duration::from_secs(60 * 60),
            announce_poll_interval: ANNOUNCE_POLL_INTERVAL,
            request_timeout: REQUEST_TIMEOUT,
            tracker_error_threshold: 15,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_client_id_prefix_and_length() {
        let id = random_client_id();
        assert_eq!(&id[..8], b"-PC0001-");
        assert_eq!(id.len(), 20);
        assert!(id[8..].iter().all(|b| b.is_ascii_digit()));
    }
}
