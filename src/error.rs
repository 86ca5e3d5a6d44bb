//! The closed taxonomy of failures the bridge can raise. Every fallible
//! operation in this crate returns a [`GuacError`] rather than a bare
//! `std::io::Error`, so that a `SessionBridge` can always decide what to
//! tell the client and what to log without downcasting.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// High-level category a [`GuacErrorKind`] belongs to: crypto /
/// connection / protocol / configuration / timeout, flattened into a tag
/// instead of a class hierarchy. Every variant here has at least one
/// [`GuacErrorKind`] that maps to it via [`GuacErrorKind::category`];
/// `connection`'s `websocket` subkind and a standalone `authentication`
/// category from the original hierarchy are not reproduced because
/// nothing in this crate's taxonomy produces them — `Unauthorized` is
/// itself one of the `guacd`-status-mapped kinds and falls under
/// `ProtocolParsing`, and client-link failures surface as `LinkClosed`,
/// never as a `GuacError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Crypto,
    ConnectionGuacd,
    ProtocolParsing,
    ProtocolHandshake,
    Configuration,
    Timeout,
}

/// The closed set of typed failure kinds. New variants mapped from the
/// `guacd` numeric status table live alongside the generic kinds; this
/// enum is `#[non_exhaustive]` so that extending the map later doesn't
/// break downstream matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum GuacErrorKind {
    /// 0x0100 — guacd does not support the requested operation.
    Unsupported,
    /// 0x0201 — guacd is busy and cannot accept the connection.
    ServerBusy,
    /// 0x0202 — the upstream (display protocol) server did not respond in time.
    UpstreamTimeout,
    /// 0x0203 — a generic error occurred on the upstream display protocol server.
    Upstream,
    /// 0x0204 — the requested resource does not exist.
    ResourceNotFound,
    /// 0x0205 — the requested resource is already in use.
    ResourceConflict,
    /// 0x0209 — the requested connection is already in use.
    SessionConflict,
    /// 0x020A — the requested connection has timed out.
    SessionTimeout,
    /// 0x020B — the requested connection has been closed.
    SessionClosed,
    /// 0x0300 — the request was malformed.
    ClientBadRequest,
    /// 0x0301 / 0x0303 — the client is not authorized.
    Unauthorized,
    /// 0x031D — the client issued too many concurrent connections.
    ClientTooMany,
    /// Fallback for any `error` opcode whose status code isn't in the map
    /// above, and for malformed/unparseable wire data in general.
    ProtocolFailure,
    /// A deviation from the five-phase handshake protocol.
    Handshake,
    /// A TCP-level connection failure talking to `guacd` or the client link.
    Connection,
    /// A problem with the bridge's own configuration (bad host/port, bad
    /// settings map, ...).
    Configuration,
    /// Token decryption/encryption failed (left as a typed hook; this
    /// crate does not implement real token crypto).
    Crypto,
    /// A connect/handshake/read operation exceeded its configured budget.
    Timeout,
}

impl GuacErrorKind {
    /// Maps a `guacd` numeric status code to its typed kind.
    /// Unknown codes fall back to [`GuacErrorKind::ProtocolFailure`].
    pub fn from_guacd_code(code: u32) -> Self {
        match code {
            0x0100 => GuacErrorKind::Unsupported,
            0x0201 => GuacErrorKind::ServerBusy,
            0x0202 => GuacErrorKind::UpstreamTimeout,
            0x0203 => GuacErrorKind::Upstream,
            0x0204 => GuacErrorKind::ResourceNotFound,
            0x0205 => GuacErrorKind::ResourceConflict,
            0x0209 => GuacErrorKind::SessionConflict,
            0x020A => GuacErrorKind::SessionTimeout,
            0x020B => GuacErrorKind::SessionClosed,
            0x0300 => GuacErrorKind::ClientBadRequest,
            0x0301 | 0x0303 => GuacErrorKind::Unauthorized,
            0x031D => GuacErrorKind::ClientTooMany,
            _ => GuacErrorKind::ProtocolFailure,
        }
    }

    /// The two-level hierarchy tag this kind falls under (crypto /
    /// connection / protocol / configuration / authentication / timeout),
    /// used by transports that want to pick a close code from a broad
    /// category rather than matching every individual kind.
    pub fn category(self) -> Category {
        use GuacErrorKind::*;
        match self {
            Crypto => Category::Crypto,
            Connection => Category::ConnectionGuacd,
            Handshake => Category::ProtocolHandshake,
            ProtocolFailure | Unsupported | ServerBusy | UpstreamTimeout | Upstream
            | ResourceNotFound | ResourceConflict | SessionConflict | SessionTimeout
            | SessionClosed | ClientBadRequest | Unauthorized | ClientTooMany => {
                Category::ProtocolParsing
            }
            Configuration => Category::Configuration,
            Timeout => Category::Timeout,
        }
    }
}

impl fmt::Display for GuacErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A single value inside a [`GuacError`]'s `details` map. Kept small and
/// `Display`-able rather than `serde_json::Value` since this crate never
/// needs to round-trip details through JSON, only log or surface them.
#[derive(Debug, Clone, PartialEq)]
pub enum DetailValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl fmt::Display for DetailValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetailValue::Str(s) => write!(f, "{s}"),
            DetailValue::Int(i) => write!(f, "{i}"),
            DetailValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for DetailValue {
    fn from(s: &str) -> Self {
        DetailValue::Str(s.to_string())
    }
}
impl From<String> for DetailValue {
    fn from(s: String) -> Self {
        DetailValue::Str(s)
    }
}
impl From<i64> for DetailValue {
    fn from(i: i64) -> Self {
        DetailValue::Int(i)
    }
}
impl From<u32> for DetailValue {
    fn from(i: u32) -> Self {
        DetailValue::Int(i as i64)
    }
}
impl From<u64> for DetailValue {
    fn from(i: u64) -> Self {
        DetailValue::Int(i as i64)
    }
}
impl From<bool> for DetailValue {
    fn from(b: bool) -> Self {
        DetailValue::Bool(b)
    }
}

/// Keys that must never make it into a `details` map. Applied
/// unconditionally here instead of per call site.
const REDACTED_KEYS: &[&str] = &["password", "token", "secret"];

/// The common error envelope. This is the only error
/// type this crate's public API returns.
#[derive(Debug, Error, Clone)]
#[error("{message}")]
pub struct GuacError {
    kind: GuacErrorKind,
    message: String,
    error_code: Option<&'static str>,
    details: BTreeMap<String, DetailValue>,
}

impl GuacError {
    pub fn new(kind: GuacErrorKind, message: impl Into<String>) -> Self {
        GuacError {
            kind,
            message: message.into(),
            error_code: None,
            details: BTreeMap::new(),
        }
    }

    pub fn with_code(mut self, error_code: &'static str) -> Self {
        self.error_code = Some(error_code);
        self
    }

    /// Insert a detail, silently dropping it if its key names a secret.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<DetailValue>) -> Self {
        let key = key.into();
        if REDACTED_KEYS.iter().any(|r| *r == key) {
            return self;
        }
        self.details.insert(key, value.into());
        self
    }

    pub fn kind(&self) -> GuacErrorKind {
        self.kind
    }

    pub fn error_code(&self) -> Option<&'static str> {
        self.error_code
    }

    pub fn details(&self) -> &BTreeMap<String, DetailValue> {
        &self.details
    }

    /// The numeric `guacd` status code this error carries, if it was
    /// raised from an upstream `error` instruction.
    pub fn guacd_status_code(&self) -> Option<u32> {
        match self.details.get("guacd_status_code") {
            Some(DetailValue::Int(i)) => Some(*i as u32),
            _ => None,
        }
    }

    // --- Constructors for each taxonomy kind, mirroring the original's
    // per-exception-class constructors. ---

    pub fn protocol_parsing(message: impl Into<String>) -> Self {
        GuacError::new(GuacErrorKind::ProtocolFailure, message).with_code("PROTOCOL_PARSE_ERROR")
    }

    pub fn handshake(message: impl Into<String>, phase: &'static str) -> Self {
        GuacError::new(GuacErrorKind::Handshake, message)
            .with_code("HANDSHAKE_FAILED")
            .with_detail("handshake_phase", phase)
    }

    pub fn connection(message: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        GuacError::new(GuacErrorKind::Connection, message)
            .with_code("GUACD_CONNECTION_FAILED")
            .with_detail("host", host.into())
            .with_detail("port", port as i64)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        GuacError::new(GuacErrorKind::Configuration, message).with_code("CONFIGURATION_ERROR")
    }

    pub fn timeout(message: impl Into<String>, timeout_seconds: u64, operation: &'static str) -> Self {
        GuacError::new(GuacErrorKind::Timeout, message)
            .with_code("OPERATION_TIMEOUT")
            .with_detail("timeout_seconds", timeout_seconds as i64)
            .with_detail("operation", operation)
    }

    /// Builds the error an [`crate::filter::ErrorFilter`] raises for an
    /// upstream `error` instruction.
    pub fn from_guacd_error(message: &str, status_code: u32) -> Self {
        let kind = GuacErrorKind::from_guacd_code(status_code);
        GuacError::new(kind, format!("guacd error: {message}"))
            .with_detail("guacd_status_code", status_code)
    }
}
