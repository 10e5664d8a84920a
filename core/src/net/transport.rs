//! Peer transport contract
//!
//! The netplay core only needs an ordered, reliable, message-oriented channel
//! to each peer. Connection setup (signaling, ICE, sockets) lives behind this
//! trait; the core sees framed byte payloads and connect/disconnect events.

use std::time::Instant;

use thiserror::Error;

use crate::input::PlayerId;

/// Errors raised by a transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No channel to that peer
    #[error("unknown peer {0}")]
    UnknownPeer(PlayerId),
    /// Channel to that peer was closed
    #[error("channel to peer {0} is closed")]
    Closed(PlayerId),
    /// Underlying channel failure
    #[error("transport failure: {0}")]
    Io(String),
}

/// Something that happened on the transport since the last poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A channel to `peer` opened
    Connected(PlayerId),
    /// The channel to `peer` closed
    Disconnected(PlayerId),
    /// A framed payload arrived from `peer`
    Message { from: PlayerId, payload: Vec<u8> },
}

/// Ordered, reliable, message-oriented channel per peer.
///
/// A host holds one channel per client; a client holds a single channel to
/// the host and addresses it by the host's player id.
pub trait Transport {
    /// Send a payload to one peer
    fn send_to(&mut self, peer: PlayerId, payload: &[u8]) -> Result<(), TransportError>;

    /// Send a payload to every connected peer
    fn broadcast(&mut self, payload: &[u8]) -> Result<(), TransportError>;

    /// Drain events that became available by `now`
    fn poll(&mut self, now: Instant) -> Vec<TransportEvent>;

    /// Close the channel to one peer
    fn disconnect(&mut self, peer: PlayerId);

    /// Close every channel
    fn close_all(&mut self);

    /// Currently connected peers
    fn peers(&self) -> Vec<PlayerId>;
}
