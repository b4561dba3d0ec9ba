//! rtcproxy
//!
//! A SOCKS5 proxy whose forwarding transport is a peer-to-peer WebRTC data
//! channel negotiated over an out-of-band signaling bus. A local SOCKS client
//! names `host:port`; the proxy multiplexes each session as a logical channel
//! over a peer connection shared per remote user, and the remote peer
//! completes the TCP connection on the client's behalf.

pub mod channel;
pub mod config;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod server;
pub mod signaling;
pub mod utils;

pub use error::{Error, ErrorKind, Result};

/// Version of rtcproxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of rtcproxy
pub const NAME: &str = env!("CARGO_PKG_NAME");
