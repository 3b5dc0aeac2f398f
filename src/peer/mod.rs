//! The peer-wire protocol and the session that drives a single peer
//! connection.

pub mod codec;
pub mod session;

pub use codec::{Handshake, HandshakeCodec, Message, PeerCodec};
pub use session::{PeerSession, State};
