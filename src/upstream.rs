//! Manages one TCP connection to `guacd`: connecting, driving the
//! five-phase handshake, and streaming framed instructions once the
//! session is live.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use crate::config::ConnectionConfig;
use crate::error::GuacError;
use crate::instruction::{DecodedFrame, Instruction, StreamDecoder};

/// `UpstreamClient`'s lifecycle state. Stored as an `AtomicU8` so
/// [`UpstreamState::Closed`] can be observed from outside without
/// locking (e.g. by `SessionBridge` after cancelling the reader task).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UpstreamState {
    Opening = 0,
    Open = 1,
    Closed = 2,
}

impl From<u8> for UpstreamState {
    fn from(v: u8) -> Self {
        match v {
            0 => UpstreamState::Opening,
            1 => UpstreamState::Open,
            _ => UpstreamState::Closed,
        }
    }
}

const READ_CHUNK_SIZE: usize = 4096;

/// How many raw-byte writes the writer-actor task will buffer before
/// `send_raw` starts to apply backpressure.
const WRITER_CHANNEL_CAPACITY: usize = 64;

/// A single TCP connection to `guacd`, carrying the wire protocol.
/// Created per session, connected once, discarded once closed.
pub struct UpstreamClient {
    state: Arc<AtomicU8>,
    reader: Option<BufReader<OwnedReadHalf>>,
    writer_tx: Option<mpsc::Sender<Vec<u8>>>,
    writer_task: Option<tokio::task::JoinHandle<()>>,
    decoder: StreamDecoder,
    /// Frames decoded but not yet consumed — the handshake only ever
    /// needs one at a time, but a single socket read can yield more than
    /// one frame, so any extra must be kept (raw bytes included) for the
    /// data-phase loop.
    pending: VecDeque<DecodedFrame>,
    last_activity: Instant,
    connection_id: Option<String>,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    inactivity_timeout: Option<Duration>,
}

impl UpstreamClient {
    pub fn new(
        connect_timeout: Duration,
        handshake_timeout: Duration,
        inactivity_timeout: Option<Duration>,
        max_frame_bytes: usize,
    ) -> Self {
        UpstreamClient {
            state: Arc::new(AtomicU8::new(UpstreamState::Opening as u8)),
            reader: None,
            writer_tx: None,
            writer_task: None,
            decoder: StreamDecoder::with_capacity(max_frame_bytes),
            pending: VecDeque::new(),
            last_activity: Instant::now(),
            connection_id: None,
            connect_timeout,
            handshake_timeout,
            inactivity_timeout,
        }
    }

    pub fn state(&self) -> UpstreamState {
        UpstreamState::from(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: UpstreamState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    /// Monotonic timestamp of the last successful read or write,
    /// exposed for callers that want to report idle sessions alongside
    /// the built-in inactivity timeout.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Opens the TCP socket and runs the handshake. On
    /// any failure the client ends in [`UpstreamState::Closed`] and the
    /// error is returned; on success it ends in [`UpstreamState::Open`].
    #[instrument(skip(self, config), fields(host = %host, port = port))]
    pub async fn connect(
        &mut self,
        host: &str,
        port: u16,
        config: &ConnectionConfig,
    ) -> Result<(), GuacError> {
        self.set_state(UpstreamState::Opening);

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                GuacError::timeout(
                    format!("connecting to guacd at {host}:{port} timed out"),
                    self.connect_timeout.as_secs(),
                    "connect",
                )
            })?
            .map_err(|e| GuacError::connection(format!("failed to connect to guacd: {e}"), host, port))?;

        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        self.reader = Some(BufReader::new(read_half));

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(WRITER_CHANNEL_CAPACITY);
        let writer_task = tokio::spawn(async move {
            let mut write_half = write_half;
            while let Some(bytes) = rx.recv().await {
                if let Err(e) = write_half.write_all(&bytes).await {
                    debug!(error = %e, "guacd writer task stopped: write failed");
                    break;
                }
                if let Err(e) = write_half.flush().await {
                    debug!(error = %e, "guacd writer task stopped: flush failed");
                    break;
                }
            }
        });
        self.writer_tx = Some(tx);
        self.writer_task = Some(writer_task);

        match tokio::time::timeout(self.handshake_timeout, self.run_handshake(config)).await {
            Ok(Ok(())) => {
                self.set_state(UpstreamState::Open);
                Ok(())
            }
            Ok(Err(e)) => {
                self.set_state(UpstreamState::Closed);
                self.teardown().await;
                Err(e)
            }
            Err(_) => {
                self.set_state(UpstreamState::Closed);
                self.teardown().await;
                Err(GuacError::timeout(
                    "guacd handshake timed out",
                    self.handshake_timeout.as_secs(),
                    "handshake",
                ))
            }
        }
    }

    /// Runs the five ordered handshake phases against an already-open
    /// socket.
    async fn run_handshake(&mut self, config: &ConnectionConfig) -> Result<(), GuacError> {
        // Phase 1: select.
        self.send_instruction(&["select".to_string(), config.protocol.as_wire_str().to_string()])
            .await?;

        // Phase 2: args.
        let args = self.receive_instruction("args").await?;
        if args.opcode() != Some("args") {
            return Err(GuacError::handshake(
                format!(
                    "expected 'args' instruction, got '{}'",
                    args.opcode().unwrap_or("")
                ),
                "args",
            )
            .with_detail("expected_opcode", "args")
            .with_detail("received_opcode", args.opcode().unwrap_or("").to_string()));
        }
        let version = args.arg(1).unwrap_or("").to_string();
        let param_names: Vec<String> = args.0.iter().skip(2).cloned().collect();
        trace!(version = %version, params = param_names.len(), "received args");

        // Phase 3: display/media.
        let display = config.display;
        self.send_instruction(&[
            "size".to_string(),
            display.width.to_string(),
            display.height.to_string(),
            display.dpi.to_string(),
        ])
        .await?;
        self.send_instruction(&["audio".to_string(), "audio/L16".to_string()])
            .await?;
        self.send_instruction(&["video".to_string()]).await?;
        self.send_instruction(&[
            "image".to_string(),
            "image/png".to_string(),
            "image/jpeg".to_string(),
        ])
        .await?;

        // Phase 4: connect.
        let mut connect_parts = vec!["connect".to_string(), version];
        for name in &param_names {
            connect_parts.push(config.setting(name).render());
        }
        self.send_instruction(&connect_parts).await?;

        // Phase 5: ready.
        let ready = self.receive_instruction("ready").await?;
        if ready.opcode() == Some("error") {
            let message = ready.arg(1).unwrap_or("Unknown error");
            return Err(GuacError::handshake(
                format!("guacd error: {message}"),
                "ready",
            )
            .with_detail("expected_opcode", "ready")
            .with_detail("received_opcode", "error"));
        }
        if ready.opcode() != Some("ready") {
            return Err(GuacError::handshake(
                format!(
                    "expected 'ready' instruction, got '{}'",
                    ready.opcode().unwrap_or("")
                ),
                "ready",
            )
            .with_detail("expected_opcode", "ready")
            .with_detail("received_opcode", ready.opcode().unwrap_or("").to_string()));
        }
        self.connection_id = Some(ready.arg(1).unwrap_or("unknown").to_string());
        Ok(())
    }

    /// Encodes and sends one instruction.
    pub async fn send_instruction(&mut self, parts: &[String]) -> Result<(), GuacError> {
        let bytes = Instruction::new(parts.iter().cloned()).encode();
        self.send_raw(bytes).await
    }

    /// Sends already-encoded bytes verbatim — used by
    /// [`crate::bridge::SessionBridge`] to forward a client-originated
    /// wire frame without re-encoding it.
    pub async fn send_raw(&mut self, bytes: Vec<u8>) -> Result<(), GuacError> {
        let tx = self
            .writer_tx
            .as_ref()
            .ok_or_else(|| GuacError::connection("not connected to guacd", "", 0))?;
        tx.send(bytes)
            .await
            .map_err(|_| GuacError::connection("guacd connection is closed", "", 0))?;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Reads from the socket until one instruction is available,
    /// labeling any error with the handshake phase it occurred in.
    async fn receive_instruction(&mut self, phase: &'static str) -> Result<Instruction, GuacError> {
        match self.next_instruction().await? {
            Some(instr) => Ok(instr),
            None => Err(GuacError::handshake(
                format!("guacd closed the connection during the '{phase}' phase"),
                phase,
            )),
        }
    }

    /// Pulls the next decoded instruction off the wire, reading more
    /// bytes as needed. Returns `Ok(None)` on clean EOF. Used by both the
    /// handshake and the data-phase loop ([`UpstreamClient::next_frame`]).
    async fn next_instruction(&mut self) -> Result<Option<Instruction>, GuacError> {
        self.next_frame().await.map(|f| f.map(|f| f.instruction))
    }

    /// The data-phase read loop's single step: returns the
    /// next complete frame (raw bytes plus decoded instruction), or
    /// `Ok(None)` on clean EOF/closed link. An inactivity timeout (if
    /// configured) applies to each individual socket read.
    pub async fn next_frame(&mut self) -> Result<Option<DecodedFrame>, GuacError> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }

            let Some(reader) = self.reader.as_mut() else {
                return Ok(None);
            };

            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            let read_result = match self.inactivity_timeout {
                Some(timeout) => tokio::time::timeout(timeout, reader.read(&mut buf))
                    .await
                    .map_err(|_| {
                        GuacError::timeout(
                            "no data received from guacd within the inactivity window",
                            timeout.as_secs(),
                            "read",
                        )
                    })?,
                None => reader.read(&mut buf).await,
            };

            let n = match read_result {
                Ok(0) => return Ok(None),
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "guacd read failed, ending session");
                    return Ok(None);
                }
            };
            self.last_activity = Instant::now();

            let text = String::from_utf8_lossy(&buf[..n]);
            let mut frames = self.decoder.push(&text)?;
            if frames.is_empty() {
                continue;
            }
            let first = frames.remove(0);
            for rest in frames {
                self.pending.push_back(rest);
            }
            return Ok(Some(first));
        }
    }

    async fn teardown(&mut self) {
        self.writer_tx = None;
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
        self.reader = None;
    }

    /// Closes the connection. Idempotent.
    pub async fn close(&mut self) {
        if self.state() == UpstreamState::Closed {
            return;
        }
        self.set_state(UpstreamState::Closed);
        self.teardown().await;
    }
}
