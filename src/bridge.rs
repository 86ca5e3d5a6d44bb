//! Couples one [`ClientLink`] to one [`UpstreamClient`] and drives the
//! bidirectional exchange for the lifetime of a session.

use tracing::{debug, error, instrument, warn};

use crate::client_link::{ClientLink, CloseReason, LinkState};
use crate::config::ConnectionConfig;
use crate::error::GuacError;
use crate::filter::FilterChain;
use crate::instruction::Instruction;
use crate::upstream::UpstreamClient;

/// `SessionBridge`'s lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Starting,
    Live,
    Draining,
    Closed,
}

/// How a session ended: cleanly, or with a failure that should be
/// reported to the client and logged.
#[derive(Debug)]
pub enum SessionOutcome {
    Clean,
    Failed(GuacError),
}

/// Orchestrates one session: the handshake, the live exchange, and
/// drain-and-close. One `SessionBridge` is created per accepted client.
pub struct SessionBridge {
    state: BridgeState,
    filters: FilterChain,
}

impl SessionBridge {
    pub fn new(filters: FilterChain) -> Self {
        SessionBridge {
            state: BridgeState::Starting,
            filters,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Runs one session start to finish: connects
    /// upstream, runs the handshake, then the live exchange, then
    /// drain-and-close. Always leaves `self` in `Closed` state and both
    /// the upstream client and the client link closed.
    #[instrument(skip_all)]
    pub async fn start(
        &mut self,
        host: &str,
        port: u16,
        connection_config: &ConnectionConfig,
        mut upstream: UpstreamClient,
        client_link: &mut dyn ClientLink,
    ) -> SessionOutcome {
        if let Err(e) = upstream.connect(host, port, connection_config).await {
            warn!(error = %e, "guacd handshake failed");
            self.send_synthesized_error(client_link, &e).await;
            client_link.close(CloseReason::Failure(e.kind().category())).await;
            self.state = BridgeState::Closed;
            return SessionOutcome::Failed(e);
        }

        self.state = BridgeState::Live;
        let outcome = self.run(&mut upstream, client_link).await;

        self.state = BridgeState::Draining;
        upstream.close().await;
        let close_reason = match &outcome {
            SessionOutcome::Clean => CloseReason::Normal,
            SessionOutcome::Failed(e) => CloseReason::Failure(e.kind().category()),
        };
        client_link.close(close_reason).await;
        self.state = BridgeState::Closed;

        if let SessionOutcome::Failed(ref e) = outcome {
            error!(kind = ?e.kind(), error_code = e.error_code(), "session terminated");
        }
        outcome
    }

    /// The `Live`-state exchange. `UpstreamReader`
    /// and `DownstreamReader` are realized as the two branches of a
    /// single `tokio::select!` loop rather than two spawned tasks — a
    /// cooperative task runtime is one of the concurrency models the
    /// design notes explicitly allow, and it keeps the single
    /// upstream-writer invariant intact with no extra lock, since
    /// `UpstreamClient::send_raw` already funnels every write through its
    /// own writer-actor channel. Either branch ending the loop covers
    /// the "either task finishing triggers drain-and-close" rule; the
    /// branch not taken is simply dropped by `select!`, which is safe
    /// here because neither a pending socket read nor a pending
    /// `ClientLink::receive` consumes data until it actually completes.
    async fn run(
        &mut self,
        upstream: &mut UpstreamClient,
        client_link: &mut dyn ClientLink,
    ) -> SessionOutcome {
        loop {
            tokio::select! {
                frame = upstream.next_frame() => {
                    match frame {
                        Ok(Some(f)) => {
                            match self.filters.apply(f.instruction.clone()) {
                                Ok(Some(kept)) => {
                                    if client_link.send(&f.raw).await.is_err() {
                                        debug!("client link closed mid-forward");
                                        return SessionOutcome::Clean;
                                    }
                                    // Sync reply ordering: the echo is only
                                    // ever sent after the original sync has
                                    // already been forwarded above, so
                                    // timestamp causality holds.
                                    if kept.opcode() == Some("sync") {
                                        if let Some(timestamp) = kept.arg(1) {
                                            let echo = [
                                                "sync".to_string(),
                                                timestamp.to_string(),
                                            ];
                                            if let Err(e) = upstream.send_instruction(&echo).await {
                                                return SessionOutcome::Failed(e);
                                            }
                                        }
                                    }
                                }
                                Ok(None) => {
                                    // Filter dropped the instruction; nothing forwarded.
                                }
                                Err(e) => {
                                    self.send_synthesized_error(client_link, &e).await;
                                    return SessionOutcome::Failed(e);
                                }
                            }
                        }
                        Ok(None) => return SessionOutcome::Clean,
                        Err(e) => {
                            self.send_synthesized_error(client_link, &e).await;
                            return SessionOutcome::Failed(e);
                        }
                    }
                }
                msg = client_link.receive() => {
                    match msg {
                        Some(bytes) => {
                            // Filters are not applied to client→upstream
                            // traffic; the WS client already speaks
                            // framed Guacamole, so the bytes forward verbatim.
                            if let Err(e) = upstream.send_raw(bytes).await {
                                return SessionOutcome::Failed(e);
                            }
                        }
                        None => return SessionOutcome::Clean,
                    }
                }
            }
        }
    }

    /// Builds and sends the synthesized error frame if the client
    /// link is still open; swallows a send failure since the session is
    /// already ending.
    async fn send_synthesized_error(&self, client_link: &mut dyn ClientLink, err: &GuacError) {
        if client_link.state() != LinkState::Open {
            return;
        }
        let code = err.guacd_status_code().unwrap_or(0);
        let frame = Instruction::new(["error".to_string(), err.to_string(), code.to_string()]).encode();
        let _ = client_link.send(&frame).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, Display, Protocol};
    use crate::error::Category;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// An in-memory `ClientLink` test double. `inbound` is a real channel
    /// rather than a plain queue: an empty-but-open channel must make
    /// `receive` suspend instead of resolving immediately, or it would
    /// always win a `tokio::select!` race against a socket read that
    /// hasn't completed yet.
    struct FakeClientLink {
        outbound: Vec<Vec<u8>>,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        state: LinkState,
        closed_with: Option<CloseReason>,
    }

    impl FakeClientLink {
        fn new(inbound: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
            FakeClientLink {
                outbound: Vec::new(),
                inbound,
                state: LinkState::Open,
                closed_with: None,
            }
        }
    }

    #[async_trait]
    impl ClientLink for FakeClientLink {
        async fn send(&mut self, frame: &[u8]) -> Result<(), crate::client_link::LinkClosed> {
            if self.state == LinkState::Closed {
                return Err(crate::client_link::LinkClosed);
            }
            self.outbound.push(frame.to_vec());
            Ok(())
        }

        async fn receive(&mut self) -> Option<Vec<u8>> {
            match self.inbound.recv().await {
                Some(bytes) => Some(bytes),
                None => {
                    self.state = LinkState::Closed;
                    None
                }
            }
        }

        async fn close(&mut self, reason: CloseReason) {
            self.state = LinkState::Closed;
            self.closed_with = Some(reason);
        }

        fn state(&self) -> LinkState {
            self.state
        }
    }

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            protocol: Protocol::Rdp,
            settings: HashMap::new(),
            display: Display::default(),
        }
    }

    async fn fake_guacd(listener: TcpListener, after_ready: Vec<&'static [u8]>) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = socket.read(&mut buf).await.unwrap(); // select
        socket.write_all(b"4.args,2.v1;").await.unwrap();
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if buf[..n].windows(7).any(|w| w == b"connect") {
                break;
            }
        }
        socket.write_all(b"5.ready,4.conn;").await.unwrap();
        for frame in after_ready {
            socket.write_all(frame).await.unwrap();
        }
        // Keep the socket around long enough for the bridge to read
        // everything queued above before the listener task exits.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn happy_sync_forwards_then_echoes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(b"4.args,2.v1;").await.unwrap();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if buf[..n].windows(7).any(|w| w == b"connect") {
                    break;
                }
            }
            socket.write_all(b"5.ready,4.conn;").await.unwrap();
            socket.write_all(b"4.sync,4.1234;").await.unwrap();
            // Read back the echoed sync before the client link closes.
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"4.sync,4.1234;");
        });

        let upstream = UpstreamClient::new(
            std::time::Duration::from_secs(5),
            std::time::Duration::from_secs(5),
            None,
            crate::instruction::DEFAULT_MAX_FRAME_BYTES,
        );
        // Held for the whole test so `receive` suspends instead of
        // immediately reporting the link closed.
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut link = FakeClientLink::new(rx);
        let mut bridge = SessionBridge::new(FilterChain::new());
        let outcome = bridge
            .start(
                &addr.ip().to_string(),
                addr.port(),
                &test_config(),
                upstream,
                &mut link,
            )
            .await;

        assert!(matches!(outcome, SessionOutcome::Clean));
        assert_eq!(link.outbound, vec![b"4.sync,4.1234;".to_vec()]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unauthorized_upstream_synthesizes_error_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(fake_guacd(listener, vec![b"5.error,6.denied,3.769;"]));

        let upstream = UpstreamClient::new(
            std::time::Duration::from_secs(5),
            std::time::Duration::from_secs(5),
            None,
            crate::instruction::DEFAULT_MAX_FRAME_BYTES,
        );
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut link = FakeClientLink::new(rx);
        let mut bridge = SessionBridge::new({
            let mut chain = FilterChain::new();
            chain.push(crate::filter::ErrorFilter);
            chain
        });
        let outcome = bridge
            .start(
                &addr.ip().to_string(),
                addr.port(),
                &test_config(),
                upstream,
                &mut link,
            )
            .await;

        match outcome {
            SessionOutcome::Failed(e) => {
                assert_eq!(e.kind(), crate::error::GuacErrorKind::Unauthorized);
                assert_eq!(e.guacd_status_code(), Some(769));
            }
            SessionOutcome::Clean => panic!("expected a failed session"),
        }
        assert_eq!(link.outbound.len(), 1);
        assert!(std::str::from_utf8(&link.outbound[0])
            .unwrap()
            .contains("denied"));
        assert_eq!(link.closed_with, Some(CloseReason::Failure(Category::ProtocolParsing)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_error_code_is_protocol_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(fake_guacd(listener, vec![b"5.error,3.???,3.999;"]));

        let upstream = UpstreamClient::new(
            std::time::Duration::from_secs(5),
            std::time::Duration::from_secs(5),
            None,
            crate::instruction::DEFAULT_MAX_FRAME_BYTES,
        );
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut link = FakeClientLink::new(rx);
        let mut bridge = SessionBridge::new({
            let mut chain = FilterChain::new();
            chain.push(crate::filter::ErrorFilter);
            chain
        });
        let outcome = bridge
            .start(
                &addr.ip().to_string(),
                addr.port(),
                &test_config(),
                upstream,
                &mut link,
            )
            .await;

        match outcome {
            SessionOutcome::Failed(e) => {
                assert_eq!(e.kind(), crate::error::GuacErrorKind::ProtocolFailure);
                assert_eq!(e.guacd_status_code(), Some(999));
            }
            SessionOutcome::Clean => panic!("expected a failed session"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_close_ends_session_cleanly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(b"4.args,2.v1;").await.unwrap();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if buf[..n].windows(7).any(|w| w == b"connect") {
                    break;
                }
            }
            socket.write_all(b"5.ready,4.conn;").await.unwrap();
            // No further data; upstream sits mid-read while the client
            // link closes on its own.
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        });

        let upstream = UpstreamClient::new(
            std::time::Duration::from_secs(5),
            std::time::Duration::from_secs(5),
            None,
            crate::instruction::DEFAULT_MAX_FRAME_BYTES,
        );
        // Sender dropped immediately: `receive` reports the link closed
        // right away, racing the upstream's still-pending read.
        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        drop(tx);
        let mut link = FakeClientLink::new(rx);
        let mut bridge = SessionBridge::new(FilterChain::new());
        let outcome = bridge
            .start(
                &addr.ip().to_string(),
                addr.port(),
                &test_config(),
                upstream,
                &mut link,
            )
            .await;

        assert!(matches!(outcome, SessionOutcome::Clean));
        server.abort();
    }
}
