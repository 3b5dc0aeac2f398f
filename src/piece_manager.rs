//! Tracks piece and block state across the whole download, decides what to
//! request next, verifies completed pieces and writes them to disk.
//!
//! Piece and block bookkeeping and disk writing live in a single type with
//! no separate disk-actor task: verification and writing happen inline in
//! [`PieceManager::block_received`], guarded by the `tokio::sync::Mutex` the
//! coordinator wraps it in.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::Instant;

use sha1::{Digest, Sha1};

use crate::error::DiskError;
use crate::storage_info::FileLayout;
use crate::{block_count, block_len, Bitfield, BlockInfo, PeerId, PieceIndex, TorrentDescriptor};

#[derive(Debug)]
enum BlockState {
    Missing,
    Pending { dispatched_at: Instant },
    Retrieved { bytes: Vec<u8> },
}

#[derive(Debug)]
enum PieceState {
    Missing,
    Ongoing(Vec<BlockState>),
    Have,
}

/// The piece manager: owns piece/block state, the next-request scheduling
/// algorithm, hash verification and disk writes for a single torrent.
pub struct PieceManager {
    descriptor: TorrentDescriptor,
    download_dir: PathBuf,
    layout: FileLayout,
    pieces: Vec<PieceState>,
    /// Piece availability reported by every currently connected peer, keyed
    /// by the 20-byte peer id learned at handshake.
    peers: HashMap<PeerId, Bitfield>,
    open_files: HashMap<usize, File>,
    request_timeout: std::time::Duration,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
}

impl PieceManager {
    pub fn new(
        descriptor: TorrentDescriptor,
        download_dir: PathBuf,
        request_timeout: std::time::Duration,
    ) -> Self {
        let layout = FileLayout::new(&descriptor);
        let piece_count = descriptor.piece_count();
        Self {
            descriptor,
            download_dir,
            layout,
            pieces: (0..piece_count).map(|_| PieceState::Missing).collect(),
            peers: HashMap::new(),
            open_files: HashMap::new(),
            request_timeout,
            bytes_downloaded: 0,
            bytes_uploaded: 0,
        }
    }

    /// Whether every piece has been downloaded and verified.
    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(|p| matches!(p, PieceState::Have))
    }

    /// Registers a newly connected peer's reported piece availability.
    pub fn add_peer(&mut self, remote_id: PeerId, mut bitfield: Bitfield) {
        bitfield.resize(self.pieces.len(), false);
        self.peers.insert(remote_id, bitfield);
    }

    /// Records a single HAVE from an already-registered peer. A HAVE for a
    /// piece index already set, or for an unknown peer, is a no-op.
    pub fn update_peer(&mut self, remote_id: PeerId, piece_index: PieceIndex) {
        if let Some(bitfield) = self.peers.get_mut(&remote_id) {
            if piece_index < bitfield.len() {
                bitfield.set(piece_index, true);
            }
        }
    }

    /// Drops a peer's registered availability on disconnect.
    pub fn remove_peer(&mut self, remote_id: PeerId) {
        self.peers.remove(&remote_id);
    }

    /// Flushes and closes every open output file. Called once, when the
    /// engine stops.
    pub fn close(&mut self) {
        for (_, mut file) in self.open_files.drain() {
            let _ = file.flush();
        }
    }

    /// Picks the next block to request from `remote_id`, using its last
    /// reported piece availability. Returns `None` if the peer is unknown or
    /// holds nothing we still need.
    ///
    /// Implements the scheduling algorithm: prefer continuing a piece
    /// already in progress that the peer can serve; failing that, reclaim a
    /// pending block whose request has timed out; failing that, start a new
    /// missing piece the peer has; otherwise there is nothing left to
    /// request from this peer right now.
    pub fn next_request(&mut self, remote_id: PeerId) -> Option<BlockInfo> {
        let peer_pieces = self.peers.get(&remote_id)?.clone();
        let peer_pieces = &peer_pieces;
        let request_timeout = self.request_timeout;

        // 1. continue an ongoing piece the peer has
        let mut found = None;
        for (index, piece) in self.pieces.iter_mut().enumerate() {
            if let PieceState::Ongoing(blocks) = piece {
                if !peer_has(peer_pieces, index) {
                    continue;
                }
                if let Some(block_index) = blocks
                    .iter()
                    .position(|b| matches!(b, BlockState::Missing))
                {
                    blocks[block_index] = BlockState::Pending { dispatched_at: Instant::now() };
                    found = Some((index, block_index));
                    break;
                }
            }
        }

        // 2. reclaim a timed-out pending block from an ongoing piece the
        //    peer has
        if found.is_none() {
            for (index, piece) in self.pieces.iter_mut().enumerate() {
                if let PieceState::Ongoing(blocks) = piece {
                    if !peer_has(peer_pieces, index) {
                        continue;
                    }
                    if let Some(block_index) = blocks.iter().position(|b| match b {
                        BlockState::Pending { dispatched_at } => {
                            dispatched_at.elapsed() >= request_timeout
                        }
                        _ => false,
                    }) {
                        blocks[block_index] =
                            BlockState::Pending { dispatched_at: Instant::now() };
                        found = Some((index, block_index));
                        break;
                    }
                }
            }
        }

        if let Some((index, block_index)) = found {
            return Some(self.block_info(index, block_index));
        }

        // 3. start a new missing piece the peer has
        if let Some(index) = self
            .pieces
            .iter()
            .enumerate()
            .position(|(index, piece)| matches!(piece, PieceState::Missing) && peer_has(peer_pieces, index))
        {
            let piece_len = self.descriptor.piece_len(index);
            let mut blocks: Vec<BlockState> =
                (0..block_count(piece_len)).map(|_| BlockState::Missing).collect();
            blocks[0] = BlockState::Pending { dispatched_at: Instant::now() };
            self.pieces[index] = PieceState::Ongoing(blocks);
            return Some(self.block_info(index, 0));
        }

        None
    }

    fn block_info(&self, piece_index: PieceIndex, block_index: usize) -> BlockInfo {
        let piece_len = self.descriptor.piece_len(piece_index);
        BlockInfo {
            piece_index,
            offset: block_index as u32 * crate::BLOCK_LEN,
            len: block_len(piece_len, block_index),
        }
    }

    /// Registers a received block. Returns `Ok(true)` if this completed and
    /// verified its piece (the peer session should announce it with `Have`
    /// to the coordinator so other sessions can stop requesting it).
    ///
    /// If the piece fails hash verification, all of its blocks are demoted
    /// back to `Missing` so the piece can be re-downloaded, and `Ok(false)`
    /// is returned.
    pub fn block_received(
        &mut self,
        block: BlockInfo,
        data: Vec<u8>,
    ) -> Result<bool, DiskError> {
        let piece_index = block.piece_index;
        if piece_index >= self.pieces.len() {
            return Err(DiskError::InvalidPieceIndex);
        }

        let block_index = block.index_in_piece();
        let blocks = match &mut self.pieces[piece_index] {
            PieceState::Ongoing(blocks) => blocks,
            // block for a piece we don't consider ongoing (already have it,
            // or a stale/duplicate response); ignore
            _ => return Ok(false),
        };
        if block_index >= blocks.len() {
            return Err(DiskError::InvalidPieceIndex);
        }

        match blocks[block_index] {
            BlockState::Pending { .. } => {}
            // a duplicate delivery of an already-retrieved block, or a block
            // we never requested: tolerated, but must not double-count bytes
            _ => return Ok(false),
        }

        self.bytes_downloaded += data.len() as u64;
        blocks[block_index] = BlockState::Retrieved { bytes: data };

        if blocks.iter().any(|b| !matches!(b, BlockState::Retrieved { .. })) {
            return Ok(false);
        }

        // every block is in, assemble and verify
        let mut piece_bytes = Vec::with_capacity(self.descriptor.piece_len(piece_index) as usize);
        for block in blocks.iter() {
            match block {
                BlockState::Retrieved { bytes } => piece_bytes.extend_from_slice(bytes),
                _ => unreachable!("checked above"),
            }
        }

        let digest = Sha1::digest(&piece_bytes);
        if digest.as_slice() != self.descriptor.piece_hashes[piece_index] {
            log::warn!("Piece {} failed hash verification, discarding", piece_index);
            let piece_len = self.descriptor.piece_len(piece_index);
            let fresh: Vec<BlockState> =
                (0..block_count(piece_len)).map(|_| BlockState::Missing).collect();
            self.pieces[piece_index] = PieceState::Ongoing(fresh);
            return Ok(false);
        }

        self.write_piece(piece_index, &piece_bytes)?;
        self.pieces[piece_index] = PieceState::Have;
        log::info!("Piece {} verified and written to disk", piece_index);
        Ok(true)
    }

    fn write_piece(&mut self, index: PieceIndex, bytes: &[u8]) -> Result<(), DiskError> {
        let piece_length = self.descriptor.piece_length;
        let piece_len = self.descriptor.piece_len(index);
        let file_range = self.layout.files_intersecting_piece(index, piece_length, piece_len);
        let torrent_offset = index as u64 * piece_length as u64;

        let mut written = 0usize;
        for file_index in file_range {
            let file_info = self.layout.files()[file_index].clone();
            let slice = file_info.slice(torrent_offset + written as u64, bytes.len() as u64 - written as u64);
            if slice.len == 0 {
                continue;
            }

            let file = self.open_file(file_index)?;
            file.seek(SeekFrom::Start(slice.offset))?;
            file.write_all(&bytes[written..written + slice.len as usize])?;
            written += slice.len as usize;
        }

        Ok(())
    }

    fn open_file(&mut self, index: usize) -> Result<&mut File, DiskError> {
        if !self.open_files.contains_key(&index) {
            let file_info = &self.layout.files()[index];
            let path = self.download_dir.join(&file_info.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .open(&path)?;
            file.set_len(file_info.len)?;
            self.open_files.insert(index, file);
        }
        Ok(self.open_files.get_mut(&index).expect("just inserted"))
    }
}

fn peer_has(peer_pieces: &Bitfield, index: usize) -> bool {
    peer_pieces.get(index).map(|b| *b).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn descriptor_with_piece(piece_len: u32, payload: &[u8]) -> TorrentDescriptor {
        let digest = Sha1::digest(payload);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        TorrentDescriptor {
            info_hash: [0; 20],
            piece_length: piece_len,
            piece_hashes: vec![hash],
            files: vec![crate::metainfo::TorrentFile {
                path: PathBuf::from("f.bin"),
                length: payload.len() as u64,
            }],
            announce: "http://test".into(),
        }
    }

    fn full_bitfield(n: usize) -> Bitfield {
        let mut b = Bitfield::repeat(false, n.max(8));
        for i in 0..n {
            b.set(i, true);
        }
        b
    }

    #[test]
    fn test_next_request_starts_new_piece_then_continues_it() {
        let payload = vec![7u8; crate::BLOCK_LEN as usize];
        let descriptor = descriptor_with_piece(crate::BLOCK_LEN, &payload);
        let dir = std::env::temp_dir().join("leech-test-next-request");
        let mut pm = PieceManager::new(descriptor, dir, std::time::Duration::from_secs(300));
        let remote_id = [1u8; 20];
        pm.add_peer(remote_id, full_bitfield(1));

        let first = pm.next_request(remote_id).unwrap();
        assert_eq!(first.piece_index, 0);
        assert_eq!(first.offset, 0);

        // single-block piece with the only block pending: nothing else to
        // request from this peer until it times out
        assert!(pm.next_request(remote_id).is_none());
    }

    #[test]
    fn test_next_request_unknown_peer_returns_none() {
        let payload = vec![7u8; crate::BLOCK_LEN as usize];
        let descriptor = descriptor_with_piece(crate::BLOCK_LEN, &payload);
        let dir = std::env::temp_dir().join("leech-test-unknown-peer");
        let mut pm = PieceManager::new(descriptor, dir, std::time::Duration::from_secs(300));

        assert!(pm.next_request([9u8; 20]).is_none());
    }

    #[test]
    fn test_next_request_skips_pieces_peer_lacks() {
        let payload = vec![1u8; crate::BLOCK_LEN as usize * 2];
        let descriptor = TorrentDescriptor {
            piece_hashes: vec![
                {
                    let d = Sha1::digest(&payload[..crate::BLOCK_LEN as usize]);
                    let mut h = [0u8; 20];
                    h.copy_from_slice(&d);
                    h
                },
                {
                    let d = Sha1::digest(&payload[crate::BLOCK_LEN as usize..]);
                    let mut h = [0u8; 20];
                    h.copy_from_slice(&d);
                    h
                },
            ],
            ..descriptor_with_piece(crate::BLOCK_LEN, &payload[..crate::BLOCK_LEN as usize])
        };
        let dir = std::env::temp_dir().join("leech-test-skip");
        let mut pm = PieceManager::new(descriptor, dir, std::time::Duration::from_secs(300));

        let mut peer_pieces = Bitfield::repeat(false, 8);
        peer_pieces.set(1, true);
        let remote_id = [2u8; 20];
        pm.add_peer(remote_id, peer_pieces);

        let req = pm.next_request(remote_id).unwrap();
        assert_eq!(req.piece_index, 1);
    }

    #[test]
    fn test_next_request_reclaims_timed_out_pending_block() {
        let payload = vec![3u8; crate::BLOCK_LEN as usize];
        let descriptor = descriptor_with_piece(crate::BLOCK_LEN, &payload);
        let dir = std::env::temp_dir().join(format!("leech-test-timeout-{}", std::process::id()));
        let mut pm = PieceManager::new(descriptor, dir.clone(), std::time::Duration::from_millis(1));
        let remote_id = [3u8; 20];
        pm.add_peer(remote_id, full_bitfield(1));

        let first = pm.next_request(remote_id).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));

        // nothing else to request except the now-timed-out pending block
        let reclaimed = pm.next_request(remote_id).unwrap();
        assert_eq!(reclaimed, first);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_update_peer_and_remove_peer() {
        let payload = vec![4u8; crate::BLOCK_LEN as usize * 2];
        let descriptor = TorrentDescriptor {
            piece_hashes: vec![[0; 20], [0; 20]],
            ..descriptor_with_piece(crate::BLOCK_LEN, &payload[..crate::BLOCK_LEN as usize])
        };
        let dir = std::env::temp_dir().join("leech-test-update-remove-peer");
        let mut pm = PieceManager::new(descriptor, dir, std::time::Duration::from_secs(300));
        let remote_id = [5u8; 20];

        pm.add_peer(remote_id, Bitfield::repeat(false, 8));
        assert!(pm.next_request(remote_id).is_none());

        pm.update_peer(remote_id, 1);
        let req = pm.next_request(remote_id).unwrap();
        assert_eq!(req.piece_index, 1);

        pm.remove_peer(remote_id);
        assert!(pm.next_request(remote_id).is_none());
    }

    #[test]
    fn test_block_received_completes_and_verifies_piece() {
        let payload = vec![42u8; crate::BLOCK_LEN as usize];
        let descriptor = descriptor_with_piece(crate::BLOCK_LEN, &payload);
        let dir = std::env::temp_dir().join(format!("leech-test-{}", std::process::id()));
        let mut pm = PieceManager::new(descriptor, dir.clone(), std::time::Duration::from_secs(300));
        let remote_id = [6u8; 20];
        pm.add_peer(remote_id, full_bitfield(1));

        let block = pm.next_request(remote_id).unwrap();
        let completed = pm.block_received(block, payload.clone()).unwrap();
        assert!(completed);
        assert!(pm.is_complete());

        let written = fs::read(dir.join("f.bin")).unwrap();
        assert_eq!(written, payload);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_block_received_rejects_bad_hash() {
        let payload = vec![42u8; crate::BLOCK_LEN as usize];
        let descriptor = descriptor_with_piece(crate::BLOCK_LEN, &payload);
        let dir = std::env::temp_dir().join(format!("leech-test-bad-{}", std::process::id()));
        let mut pm = PieceManager::new(descriptor, dir.clone(), std::time::Duration::from_secs(300));
        let remote_id = [7u8; 20];
        pm.add_peer(remote_id, full_bitfield(1));

        let block = pm.next_request(remote_id).unwrap();
        let wrong_payload = vec![0u8; crate::BLOCK_LEN as usize];
        let completed = pm.block_received(block, wrong_payload).unwrap();
        assert!(!completed);
        assert!(!pm.is_complete());

        // piece reset to missing blocks, can be requested again
        let again = pm.next_request(remote_id).unwrap();
        assert_eq!(again.piece_index, 0);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_block_received_ignores_duplicate_or_unsolicited_blocks() {
        let payload = vec![9u8; crate::BLOCK_LEN as usize * 2];
        let descriptor = descriptor_with_piece(crate::BLOCK_LEN * 2, &payload);
        let dir = std::env::temp_dir().join(format!("leech-test-dup-{}", std::process::id()));
        let mut pm = PieceManager::new(descriptor, dir.clone(), std::time::Duration::from_secs(300));
        let remote_id = [8u8; 20];
        pm.add_peer(remote_id, full_bitfield(1));

        let first = pm.next_request(remote_id).unwrap();
        let first_data = payload[..crate::BLOCK_LEN as usize].to_vec();
        assert!(!pm.block_received(first, first_data.clone()).unwrap());
        assert_eq!(pm.bytes_downloaded, crate::BLOCK_LEN as u64);

        // redeliver the very same block: must be dropped without
        // double-counting bytes_downloaded
        assert!(!pm.block_received(first, first_data).unwrap());
        assert_eq!(pm.bytes_downloaded, crate::BLOCK_LEN as u64);

        // finish the piece, then redeliver its first block again: now the
        // piece isn't Ongoing at all (it's Have), so the block is dropped
        // the same way
        let second = pm.next_request(remote_id).unwrap();
        let second_data = payload[crate::BLOCK_LEN as usize..].to_vec();
        assert!(pm.block_received(second, second_data).unwrap());
        assert!(pm.is_complete());

        assert!(!pm.block_received(first, vec![1u8; crate::BLOCK_LEN as usize]).unwrap());
        assert_eq!(pm.bytes_downloaded, payload.len() as u64);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_end_to_end_out_of_order_with_corrupted_piece() {
        let block_len = crate::BLOCK_LEN as usize;
        let piece_len = (block_len * 3) as u32;
        let piece_count = 4usize;

        let mut payload = Vec::with_capacity(block_len * 3 * piece_count);
        for i in 0..(3 * piece_count) {
            payload.extend(std::iter::repeat((i % 256) as u8).take(block_len));
        }

        let piece_hashes: Vec<[u8; 20]> = (0..piece_count)
            .map(|p| {
                let start = p * piece_len as usize;
                let digest = Sha1::digest(&payload[start..start + piece_len as usize]);
                let mut h = [0u8; 20];
                h.copy_from_slice(&digest);
                h
            })
            .collect();

        let descriptor = TorrentDescriptor {
            info_hash: [0; 20],
            piece_length: piece_len,
            piece_hashes,
            files: vec![crate::metainfo::TorrentFile {
                path: PathBuf::from("e2e.bin"),
                length: payload.len() as u64,
            }],
            announce: "http://test".into(),
        };
        let dir = std::env::temp_dir().join(format!("leech-test-e2e-{}", std::process::id()));
        let mut pm = PieceManager::new(descriptor, dir.clone(), std::time::Duration::from_secs(300));
        let remote_id = [9u8; 20];
        pm.add_peer(remote_id, full_bitfield(piece_count));

        let mut piece2_corrupted = false;

        // drive the download to completion, requesting a whole batch of
        // blocks before delivering any of them in reverse (out-of-order)
        // order, corrupting exactly one of piece 2's blocks on its first
        // delivery
        loop {
            if pm.is_complete() {
                break;
            }

            let mut batch = Vec::new();
            while let Some(block) = pm.next_request(remote_id) {
                batch.push(block);
            }
            assert!(!batch.is_empty(), "download stalled before completion");

            for block in batch.into_iter().rev() {
                let start = block.piece_index * piece_len as usize + block.offset as usize;
                let mut data = payload[start..start + block.len as usize].to_vec();
                if block.piece_index == 2 && !piece2_corrupted {
                    data[0] ^= 0xff;
                    piece2_corrupted = true;
                }
                pm.block_received(block, data).unwrap();
            }
        }

        assert!(pm.is_complete());
        let written = fs::read(dir.join("e2e.bin")).unwrap();
        assert_eq!(written, payload);
        let _ = fs::remove_dir_all(&dir);
    }
}
