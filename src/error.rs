//! Error types for rtcproxy
//!
//! `Error` is the crate-wide error carried through `Result`. `ErrorKind` is
//! the canonical taxonomy shared by the reply frame on the data channel and
//! the local SOCKS5 reply byte.

use std::{fmt, io, result};

use thiserror::Error;

/// Result type
pub type Result<T> = result::Result<T, Error>;

/// Error type
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// TOML error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebRTC error
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// Signaling error
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Channel error
    #[error("Channel error: {0}")]
    Channel(String),

    /// Malformed request or reply frame
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Required configuration is missing
    #[error("Missing configuration: {0}")]
    ConfigurationMissing(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::WebRtc(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Signaling(e.to_string())
    }
}

/// Canonical error kinds surfaced uniformly from all components.
///
/// The numeric codes double as both the `rep` byte of the reply frame and the
/// SOCKS5 REP byte sent to the local client. `SignalDisconnected` is local
/// only and never crosses the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Not an error; reserved for reply codes
    Success,
    /// Anything else, including transport engine errors
    Unknown,
    /// Policy denial, local or remote
    NotAllowedConnection,
    /// Data channel could not open or signaling unreachable
    NetworkUnreachable,
    /// DNS failure on the responder side
    HostNotFound,
    /// Remote responder actively refused, or reply was non-success
    ConnectionRefused,
    /// Signaling or connect timeout
    Timeout,
    /// Signaling bus dropped before forwarding
    SignalDisconnected,
}

impl ErrorKind {
    /// Wire code for the reply frame and the SOCKS5 REP byte.
    pub fn code(self) -> u8 {
        match self {
            ErrorKind::Success => 0,
            ErrorKind::Unknown => 1,
            ErrorKind::NotAllowedConnection => 2,
            ErrorKind::NetworkUnreachable => 3,
            ErrorKind::HostNotFound => 4,
            ErrorKind::ConnectionRefused => 5,
            ErrorKind::Timeout => 6,
            ErrorKind::SignalDisconnected => 1,
        }
    }

    /// Decode a wire code; unrecognized codes collapse to `Unknown`.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => ErrorKind::Success,
            2 => ErrorKind::NotAllowedConnection,
            3 => ErrorKind::NetworkUnreachable,
            4 => ErrorKind::HostNotFound,
            5 => ErrorKind::ConnectionRefused,
            6 => ErrorKind::Timeout,
            _ => ErrorKind::Unknown,
        }
    }

    /// Map an OS socket error from the responder's outbound connect.
    pub fn from_io(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
            io::ErrorKind::PermissionDenied => ErrorKind::NotAllowedConnection,
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::NotFound => ErrorKind::HostNotFound,
            _ => ErrorKind::Unknown,
        }
    }

    pub fn is_success(self) -> bool {
        self == ErrorKind::Success
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Success => "success",
            ErrorKind::Unknown => "unknown error",
            ErrorKind::NotAllowedConnection => "connection not allowed",
            ErrorKind::NetworkUnreachable => "network unreachable",
            ErrorKind::HostNotFound => "host not found",
            ErrorKind::ConnectionRefused => "connection refused",
            ErrorKind::Timeout => "timeout",
            ErrorKind::SignalDisconnected => "signal disconnected",
        };
        write!(f, "{}", s)
    }
}
