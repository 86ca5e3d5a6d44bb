//! The configuration surface the core accepts from its caller.
//! `ConnectionConfig` is supplied per-session by whoever decrypted the
//! client's token (out of scope here; `BridgeConfig` is the
//! ambient, process-wide configuration loaded by the `guacd-bridge`
//! binary at startup.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::GuacError;

/// The display protocol `guacd` should speak to the remote host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Rdp,
    Vnc,
    Ssh,
    Telnet,
    Kubernetes,
}

impl Protocol {
    /// The string `guacd` expects in the `select` instruction.
    pub fn as_wire_str(self) -> &'static str {
        match self {
            Protocol::Rdp => "rdp",
            Protocol::Vnc => "vnc",
            Protocol::Ssh => "ssh",
            Protocol::Telnet => "telnet",
            Protocol::Kubernetes => "kubernetes",
        }
    }
}

/// A single connection-parameter value, as it would arrive from a
/// decrypted client token. Kept as a small closed enum rather than
/// `serde_json::Value` since only these three shapes are ever valid
/// Guacamole connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Str(String),
    Bool(bool),
    Int(i64),
    Null,
}

impl SettingValue {
    /// Render this value the way `guacd`'s `connect` instruction expects
    /// it: `true`/`false` for booleans, empty string for
    /// null/missing, decimal for numbers.
    pub fn render(&self) -> String {
        match self {
            SettingValue::Str(s) => s.clone(),
            SettingValue::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            SettingValue::Int(i) => i.to_string(),
            SettingValue::Null => String::new(),
        }
    }
}

/// The screen geometry `guacd` renders into.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Display {
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
}

impl Default for Display {
    fn default() -> Self {
        Display {
            width: 1024,
            height: 768,
            dpi: 96,
        }
    }
}

/// Everything needed to drive one `guacd` handshake and session: the
/// display protocol, its parameters, and the screen geometry. This
/// is the data a real deployment would build from a decrypted client
/// token; this crate never implements that decryption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub protocol: Protocol,
    /// Keyed by the kebab-case parameter name exactly as `guacd` sends it
    /// in the `args` instruction (e.g. `"ignore-cert"`), so the handshake
    /// never needs a separate kebab→snake translation step.
    pub settings: HashMap<String, SettingValue>,
    pub display: Display,
}

impl ConnectionConfig {
    /// Looks up the value `guacd` should receive for a parameter name it
    /// asked for in the `args` instruction. Missing parameters render as
    /// the empty string, matching `getattr(settings, attr, "")` in the
    /// original.
    pub fn setting(&self, param_name: &str) -> SettingValue {
        self.settings
            .get(param_name)
            .cloned()
            .unwrap_or(SettingValue::Null)
    }
}

/// The ambient, process-wide configuration for the bridge binary. Not part of the original distilled data
/// model — this is the bridge's own startup configuration, not anything
/// supplied per-session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub guacd_host: String,
    pub guacd_port: u16,
    #[serde(default = "default_connect_timeout_s")]
    pub connect_timeout_s: u64,
    #[serde(default = "default_handshake_timeout_s")]
    pub handshake_timeout_s: u64,
    #[serde(default)]
    pub inactivity_timeout_s: Option<u64>,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

fn default_connect_timeout_s() -> u64 {
    10
}
fn default_handshake_timeout_s() -> u64 {
    15
}
fn default_max_frame_bytes() -> usize {
    crate::instruction::DEFAULT_MAX_FRAME_BYTES
}
fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:4822".parse().unwrap()
}

impl BridgeConfig {
    /// Parses a `BridgeConfig` from TOML text, then applies
    /// `GUACD_BRIDGE_*`-prefixed environment overrides on top — the
    /// layering this crate's ambient config stack always does,
    /// regardless of how small the TOML file is.
    pub fn from_toml_str(text: &str) -> Result<Self, GuacError> {
        let mut config: BridgeConfig = toml::from_str(text)
            .map_err(|e| GuacError::configuration(format!("invalid bridge config: {e}")))?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GUACD_BRIDGE_GUACD_HOST") {
            self.guacd_host = v;
        }
        if let Ok(v) = std::env::var("GUACD_BRIDGE_GUACD_PORT") {
            if let Ok(port) = v.parse() {
                self.guacd_port = port;
            }
        }
        if let Ok(v) = std::env::var("GUACD_BRIDGE_LISTEN_ADDR") {
            if let Ok(addr) = v.parse() {
                self.listen_addr = addr;
            }
        }
    }
}
