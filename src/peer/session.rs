//! A single peer session: connects out to a peer, performs the handshake,
//! exchanges piece availability, and then loops requesting and receiving
//! blocks on behalf of the shared [`PieceManager`](crate::piece_manager::PieceManager).
//!
//! Pending requests and downloaded blocks live in the shared piece manager
//! rather than per-session state, so every session reads and writes through
//! the same `next_request`/`block_received` critical section. A session's
//! own piece availability bookkeeping is likewise delegated to the piece
//! manager's peer registry, keyed by the 20-byte peer id learned at
//! handshake.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, FramedParts};

use crate::error::PeerError;
use crate::piece_manager::PieceManager;
use crate::{BlockInfo, Bitfield, PeerId, Sha1Hash};

use super::codec::{Handshake, HandshakeCodec, Message, PeerCodec};

/// At any given time, a peer session is in one of these states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Connecting,
    Handshaking,
    /// Waiting for the peer's bitfield, which must arrive (if at all)
    /// directly after the handshake.
    AvailabilityExchange,
    Connected,
    Terminated,
}

/// Bit-flags describing the choke/interest relationship between us and the
/// peer. Both sides start choked and uninterested.
#[derive(Clone, Copy, Debug)]
struct Status {
    state: State,
    is_choked: bool,
    is_interested: bool,
    is_peer_choked: bool,
    is_peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::Connecting,
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
        }
    }
}

/// A single outbound connection to a peer.
pub struct PeerSession {
    addr: SocketAddr,
    info_hash: Sha1Hash,
    client_id: PeerId,
    piece_count: usize,
    piece_manager: Arc<Mutex<PieceManager>>,
    status: Status,
    /// The peer's id, learned at handshake; also the key this session
    /// registers under in the piece manager's peer registry.
    remote_id: Option<PeerId>,
    /// The single outstanding request this session has in flight, and when
    /// it was dispatched. Cleared on receipt of the matching PIECE, or once
    /// `request_timeout` has elapsed — never implicitly on CHOKE, so a choke
    /// can never silently drop this session's own claim on the block (the
    /// piece manager's shared pending-block state follows the same rule).
    pending_request: Option<(BlockInfo, Instant)>,
    request_timeout: Duration,
}

impl PeerSession {
    pub fn new(
        addr: SocketAddr,
        info_hash: Sha1Hash,
        client_id: PeerId,
        piece_count: usize,
        piece_manager: Arc<Mutex<PieceManager>>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            addr,
            info_hash,
            client_id,
            piece_count,
            piece_manager,
            status: Status::default(),
            remote_id: None,
            pending_request: None,
            request_timeout,
        }
    }

    /// Connects to the peer, performs the handshake and runs the session's
    /// message loop until the connection ends or an unrecoverable protocol
    /// or transport error occurs.
    ///
    /// Errors returned here are session-fatal only (per the engine's error
    /// strata); the coordinator logs them and frees this session's slot.
    pub async fn run(&mut self) -> Result<(), PeerError> {
        log::info!("Connecting to peer {}", self.addr);
        self.status.state = State::Connecting;
        let socket = TcpStream::connect(self.addr).await?;

        self.status.state = State::Handshaking;
        let mut socket = Framed::new(socket, HandshakeCodec);
        let handshake = Handshake::new(self.info_hash, self.client_id);
        socket.send(handshake).await?;

        let peer_handshake = match socket.next().await {
            Some(handshake) => handshake?,
            None => return Err(PeerError::ConnectionClosed),
        };
        if peer_handshake.info_hash != self.info_hash {
            return Err(PeerError::InvalidInfoHash);
        }
        self.remote_id = Some(peer_handshake.peer_id);

        let parts = socket.into_parts();
        let mut new_parts = FramedParts::new(parts.io, PeerCodec);
        new_parts.read_buf = parts.read_buf;
        new_parts.write_buf = parts.write_buf;
        let mut socket = Framed::from_parts(new_parts);

        self.status.state = State::AvailabilityExchange;
        log::info!("Peer {} handshake complete", self.addr);

        // INTERESTED is sent unconditionally right after the handshake: the
        // bitfield is optional on the wire, and whether it ever arrives must
        // not gate this.
        self.status.is_interested = true;
        socket.send(Message::Interested).await?;

        let result = self.message_loop(socket).await;
        self.status.state = State::Terminated;
        if let Some(remote_id) = self.remote_id {
            self.piece_manager.lock().await.remove_peer(remote_id);
        }
        result
    }

    async fn message_loop(
        &mut self,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<(), PeerError> {
        let (mut sink, mut stream) = socket.split();

        while let Some(msg) = stream.next().await {
            let msg = msg?;

            if self.status.state == State::AvailabilityExchange {
                match msg {
                    Message::Bitfield(bitfield) => self.register_peer(bitfield).await,
                    other => {
                        // no bitfield arrived; peer has nothing to report.
                        // register an empty bitfield and process the message
                        // normally going forward.
                        self.register_peer(Bitfield::repeat(false, self.piece_count)).await;
                        self.handle_message(&mut sink, other).await?;
                    }
                }
                self.status.state = State::Connected;
            } else {
                self.handle_message(&mut sink, msg).await?;
            }

            self.request_next_block(&mut sink).await?;
        }

        Ok(())
    }

    async fn register_peer(&mut self, mut bitfield: Bitfield) {
        bitfield.resize(self.piece_count, false);
        if let Some(remote_id) = self.remote_id {
            self.piece_manager.lock().await.add_peer(remote_id, bitfield);
        }
    }

    async fn handle_message<S>(&mut self, sink: &mut S, msg: Message) -> Result<(), PeerError>
    where
        S: futures::Sink<Message, Error = PeerError> + Unpin,
    {
        match msg {
            Message::Bitfield(_) => return Err(PeerError::UnexpectedBitfield),
            Message::KeepAlive => {}
            Message::Choke => {
                // never clears pending_request: the shared, piece-manager-
                // owned pending state for this block is unaffected by a
                // choke, and so is our own local bookkeeping for it.
                self.status.is_choked = true;
            }
            Message::Unchoke => {
                self.status.is_choked = false;
            }
            Message::Interested => self.status.is_peer_interested = true,
            Message::NotInterested => self.status.is_peer_interested = false,
            Message::Have { piece_index } => {
                if let Some(remote_id) = self.remote_id {
                    self.piece_manager.lock().await.update_peer(remote_id, piece_index);
                }
            }
            Message::Piece { piece_index, offset, data } => {
                self.pending_request = None;
                let block = BlockInfo { piece_index, offset, len: data.len() as u32 };
                let mut piece_manager = self.piece_manager.lock().await;
                let completed = piece_manager.block_received(block, data)?;
                drop(piece_manager);
                if completed {
                    log::info!("Peer {} completed piece {}", self.addr, piece_index);
                }
            }
            // this engine never seeds, so requests and cancels from peers
            // have nothing to serve
            Message::Request(_) | Message::Cancel(_) => {
                log::debug!("Ignoring seed-only message from peer {}", self.addr);
            }
        }
        Ok(sink.flush().await?)
    }

    /// Implements the guard `¬choked ∧ interested ∧ ¬pending_request`: if it
    /// holds, asks the piece manager for the next block and dispatches a
    /// REQUEST for it. A no-op otherwise. Also reclaims this session's own
    /// pending-request slot once `request_timeout` has elapsed, mirroring
    /// the piece manager's own timeout-based reclamation.
    async fn request_next_block<S>(&mut self, sink: &mut S) -> Result<(), PeerError>
    where
        S: futures::Sink<Message, Error = PeerError> + Unpin,
    {
        if let Some((_, dispatched_at)) = self.pending_request {
            if dispatched_at.elapsed() >= self.request_timeout {
                self.pending_request = None;
            }
        }

        if self.status.is_choked || !self.status.is_interested || self.pending_request.is_some() {
            return Ok(());
        }
        let Some(remote_id) = self.remote_id else { return Ok(()) };

        let block = {
            let mut piece_manager = self.piece_manager.lock().await;
            piece_manager.next_request(remote_id)
        };
        let Some(block) = block else { return Ok(()) };

        sink.send(Message::Request(block)).await?;
        self.pending_request = Some((block, Instant::now()));
        Ok(())
    }
}
