//! The abstract capability set the bridge needs from whatever transport
//! carries Guacamole instructions to the browser. The core never assumes
//! a concrete transport; [`crate::transport::ws`] supplies one
//! realization over a raw WebSocket.

use async_trait::async_trait;

/// Why a [`ClientLink`] was closed, reported to the transport so it can
/// pick an appropriate close code/status if it has one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The session ended cleanly (the upstream or the client hung up
    /// with no error).
    Normal,
    /// The session ended because of a typed failure; carries the
    /// taxonomy kind's category so transports that have a notion of
    /// close codes (e.g. WebSocket) can choose one.
    Failure(crate::error::Category),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Open,
    Closed,
}

/// One client-facing connection, message-oriented: complete Guacamole
/// wire frames in, complete wire frames out. Implementations own their
/// own framing (WebSocket text/binary frames, a raw TCP stream, an
/// in-memory duplex for tests, ...).
#[async_trait]
pub trait ClientLink: Send {
    /// Sends one complete, already-encoded wire frame to the client.
    /// Returns `Ok(())` if accepted, or `Err` if the link is already
    /// closed.
    async fn send(&mut self, frame: &[u8]) -> Result<(), LinkClosed>;

    /// Waits for the next complete message from the client. Returns
    /// `None` on clean EOF/close.
    async fn receive(&mut self) -> Option<Vec<u8>>;

    /// Closes the link, if still open. Idempotent.
    async fn close(&mut self, reason: CloseReason);

    fn state(&self) -> LinkState;
}

/// Returned by [`ClientLink::send`] when the link was already closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkClosed;

impl std::fmt::Display for LinkClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client link is closed")
    }
}
impl std::error::Error for LinkClosed {}
