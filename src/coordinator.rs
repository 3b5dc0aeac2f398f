//! Drives the download to completion: maintains a bounded pool of peer
//! sessions, periodically announces to the tracker to keep the pool fed with
//! addresses, and stops everything once every piece is verified.
//!
//! A peer address list refilled by periodic tracker announces feeds a fixed
//! pool of session slots. This engine never accepts inbound connections
//! (leech-only), so the loop is simple: poll for completion, reannounce
//! when due, otherwise sleep.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::conf::Conf;
use crate::error::Error;
use crate::peer::PeerSession;
use crate::piece_manager::PieceManager;
use crate::tracker::{AnnounceStats, Tracker};
use crate::TorrentDescriptor;

/// A queue of known, not-yet-connected peer addresses, shared by the
/// coordinator (which refills it on each announce) and the peer session
/// slots (which each pop one address at a time).
type AvailablePeers = Arc<Mutex<VecDeque<SocketAddr>>>;

pub struct Coordinator {
    descriptor: TorrentDescriptor,
    conf: Conf,
    piece_manager: Arc<Mutex<PieceManager>>,
    tracker: Tracker,
    available_peers: AvailablePeers,
}

impl Coordinator {
    pub fn new(descriptor: TorrentDescriptor, conf: Conf) -> Self {
        let piece_manager = PieceManager::new(
            descriptor.clone(),
            conf.torrent.download_dir.clone(),
            conf.torrent.request_timeout,
        );
        let tracker = Tracker::new(
            descriptor.announce.clone(),
            descriptor.info_hash,
            conf.engine.client_id,
        );
        Self {
            descriptor,
            conf,
            piece_manager: Arc::new(Mutex::new(piece_manager)),
            tracker,
            available_peers: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Runs the download to completion or to an unrecoverable tracker
    /// error.
    pub async fn run(&mut self) -> Result<(), Error> {
        let left = self.descriptor.total_size();
        let response = self
            .tracker
            .announce(AnnounceStats { uploaded: 0, downloaded: 0, left })
            .await?;
        let mut next_announce_at = Instant::now() + response.interval;
        self.refill(response.peers).await;

        let slots: Vec<JoinHandle<()>> = (0..self.conf.torrent.max_peer_count)
            .map(|_| self.spawn_slot())
            .collect();

        let mut consecutive_failures = 0usize;
        loop {
            if self.piece_manager.lock().await.is_complete() {
                log::info!("Download complete");
                break;
            }

            if Instant::now() >= next_announce_at {
                let left = self.remaining_bytes().await;
                match self
                    .tracker
                    .announce(AnnounceStats { uploaded: 0, downloaded: 0, left })
                    .await
                {
                    Ok(response) => {
                        consecutive_failures = 0;
                        next_announce_at = Instant::now() + response.interval;
                        self.refill(response.peers).await;
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        log::warn!(
                            "Tracker announce failed ({}/{}): {}",
                            consecutive_failures,
                            self.conf.torrent.tracker_error_threshold,
                            e
                        );
                        if consecutive_failures >= self.conf.torrent.tracker_error_threshold {
                            log::error!(
                                "Tracker unreachable after {} consecutive announce attempts, giving up",
                                consecutive_failures
                            );
                            self.stop(slots).await;
                            return Err(Error::Tracker(e));
                        }
                        next_announce_at =
                            Instant::now() + self.conf.torrent.default_announce_interval;
                    }
                }
            } else {
                tokio::time::sleep(self.conf.torrent.announce_poll_interval).await;
            }
        }

        self.stop(slots).await;
        Ok(())
    }

    async fn remaining_bytes(&self) -> u64 {
        let piece_manager = self.piece_manager.lock().await;
        self.descriptor.total_size().saturating_sub(piece_manager.bytes_downloaded)
    }

    async fn refill(&self, peers: Vec<SocketAddr>) {
        let mut available = self.available_peers.lock().await;
        available.clear();
        for addr in peers {
            if !available.contains(&addr) {
                available.push_back(addr);
            }
        }
    }

    /// Spawns one of the fixed `max_peer_count` session slots. A slot
    /// repeatedly pops an address from `available_peers` and runs a peer
    /// session against it; when the session ends (peer disconnects, or a
    /// session-fatal protocol/transport error occurs) the slot waits for
    /// another address and tries again.
    fn spawn_slot(&self) -> JoinHandle<()> {
        let available_peers = Arc::clone(&self.available_peers);
        let piece_manager = Arc::clone(&self.piece_manager);
        let info_hash = self.descriptor.info_hash;
        let client_id = self.conf.engine.client_id;
        let piece_count = self.descriptor.piece_count();
        let poll_interval = self.conf.torrent.announce_poll_interval;
        let request_timeout = self.conf.torrent.request_timeout;

        tokio::spawn(async move {
            loop {
                let addr = {
                    let mut available = available_peers.lock().await;
                    available.pop_front()
                };
                let Some(addr) = addr else {
                    tokio::time::sleep(poll_interval).await;
                    continue;
                };

                let mut session = PeerSession::new(
                    addr,
                    info_hash,
                    client_id,
                    piece_count,
                    Arc::clone(&piece_manager),
                    request_timeout,
                );
                if let Err(e) = session.run().await {
                    log::debug!("Peer session with {} ended: {}", addr, e);
                }
            }
        })
    }

    async fn stop(&mut self, slots: Vec<JoinHandle<()>>) {
        for slot in slots {
            slot.abort();
        }
        let left = self.remaining_bytes().await;
        if let Err(e) = self
            .tracker
            .final_announce(AnnounceStats { uploaded: 0, downloaded: 0, left })
            .await
        {
            log::debug!("Final tracker announce failed: {}", e);
        }
        self.piece_manager.lock().await.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn descriptor() -> TorrentDescriptor {
        TorrentDescriptor {
            info_hash: [0; 20],
            piece_length: 16,
            piece_hashes: vec![[0; 20]],
            files: vec![crate::metainfo::TorrentFile { path: PathBuf::from("f"), length: 16 }],
            announce: "http://127.0.0.1:1/announce".into(),
        }
    }

    #[tokio::test]
    async fn test_refill_deduplicates_addresses() {
        let coordinator = Coordinator::new(descriptor(), Conf::new(std::env::temp_dir()));
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        coordinator.refill(vec![addr, addr]).await;
        let available = coordinator.available_peers.lock().await;
        assert_eq!(available.len(), 1);
    }

    #[tokio::test]
    async fn test_refill_drains_stale_addresses_from_the_prior_interval() {
        let coordinator = Coordinator::new(descriptor(), Conf::new(std::env::temp_dir()));
        let stale: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        coordinator.refill(vec![stale]).await;

        let fresh: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        coordinator.refill(vec![fresh]).await;

        let available = coordinator.available_peers.lock().await;
        assert_eq!(available.len(), 1);
        assert_eq!(available[0], fresh);
    }
}
