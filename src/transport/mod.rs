//! Concrete [`crate::client_link::ClientLink`] realizations. The core
//! library never names a transport directly; this module is what makes
//! `bin/guacd-bridge` a runnable end-to-end program.

pub mod ws;

pub use ws::{accept, WsClientLink, WsHandshakeError};
