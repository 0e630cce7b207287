//! ovpn-engine - OpenVPN-compatible client protocol engine
//!
//! This crate negotiates and runs OpenVPN sessions over a caller-supplied
//! link (UDP or TCP transport to the server) and tunnel (local packet
//! source and sink, usually a TUN device).
//!
//! ## What This Crate Provides
//! - Control channel framing, including `tls-auth` and `tls-crypt` wrapping
//! - Reliable control delivery with acknowledgements and retransmission
//! - TLS handshake, key-method 2 authentication and PUSH_REPLY handling
//! - Key derivation and the AEAD data channel, with rekeying
//! - Keepalive, ping timeout and the OCC exit notification
//! - XOR obfuscation and TCP stream framing
//! - Configuration parsing and validation (TOML format)
//!
//! ## What Your Application Must Implement
//! - The TUN device behind the [`tunnel::Tunnel`] trait
//! - Routing and DNS from the pushed [`protocol::push_reply::PushOptions`]
//! - Reconnection policy, driven by [`SessionDelegate::session_did_stop`]
//!
//! ## Layout
//! The protocol layers are sans-IO: [`protocol::negotiator::Negotiator`] and
//! [`session::SessionCore`] take the current time and return actions.
//! With the default `tokio-runtime` feature, [`Session`] drives a core on a
//! tokio task against [`tunnel::udp::UdpLink`] or [`tunnel::tcp::TcpLink`].

pub mod config;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod session;
pub mod tunnel;

// Re-export core types
pub use config::{Configuration, Credentials, SessionOptions};
pub use error::{Result, VpnError};
pub use protocol::push_reply::{PushOptions, PushReply};
pub use session::{Capabilities, DataCount, SessionAction, SessionCore, SessionState};
#[cfg(feature = "tokio-runtime")]
pub use session::runner::{Session, SessionDelegate};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
