//! Guacamole protocol engine and session bridge: frames and parses the
//! wire format, drives the `guacd` handshake, filters upstream
//! instructions for typed failures, and bridges a client link to a
//! `guacd` connection for the life of a session.

pub mod bridge;
pub mod client_link;
pub mod config;
pub mod error;
pub mod filter;
pub mod instruction;
pub mod transport;
pub mod upstream;

pub use bridge::{BridgeState, SessionBridge, SessionOutcome};
pub use client_link::{ClientLink, CloseReason, LinkState};
pub use config::{BridgeConfig, ConnectionConfig, Display, Protocol, SettingValue};
pub use error::{Category, GuacError, GuacErrorKind};
pub use filter::{ErrorFilter, Filter, FilterChain, FilterOutcome};
pub use instruction::{DecodedFrame, Instruction, StreamDecoder};
pub use upstream::{UpstreamClient, UpstreamState};
