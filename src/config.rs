//! Configuration for rtcproxy
//!
//! Loaded from a TOML file; every field has a default so a minimal file only
//! needs `[signal] user` and whatever ICE endpoints the deployment uses.

use std::{fs::File, io::Read, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::{Error, Result};

/// Signaling bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Our user id on the signaling bus
    #[serde(default)]
    pub user: String,
    /// The remote peer that terminates proxied connections for us
    #[serde(default)]
    pub peer_user: Option<String>,
    /// Signaling server URL
    #[serde(default = "default_signal_server")]
    pub server: String,
    /// Connect attempts before giving up at startup
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    /// Delay between connect attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

/// ICE server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server host
    #[serde(default)]
    pub stun_host: Option<String>,
    /// STUN server port
    #[serde(default = "default_ice_port")]
    pub stun_port: u16,
    /// TURN server host
    #[serde(default)]
    pub turn_host: Option<String>,
    /// TURN server port
    #[serde(default = "default_ice_port")]
    pub turn_port: u16,
    /// TURN username
    #[serde(default)]
    pub turn_user: Option<String>,
    /// TURN credential
    #[serde(default)]
    pub turn_password: Option<String>,
    /// Gather loopback host candidates (useful for same-host testing)
    #[serde(default)]
    pub include_loopback: bool,
}

/// Local SOCKS5 listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Listen address
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Listen port
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Overall deadline for a channel to reach forwarding, in seconds
    #[serde(default = "default_establish_timeout")]
    pub establish_secs: u64,
    /// Responder-side outbound TCP connect timeout, in seconds
    #[serde(default = "default_tcp_connect_timeout")]
    pub tcp_connect_secs: u64,
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Signaling configuration
    #[serde(default)]
    pub signal: SignalConfig,
    /// ICE configuration
    #[serde(default)]
    pub ice: IceConfig,
    /// Local listener configuration
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            peer_user: None,
            server: default_signal_server(),
            connect_retries: default_connect_retries(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_host: None,
            stun_port: default_ice_port(),
            turn_host: None,
            turn_port: default_ice_port(),
            turn_user: None,
            turn_password: None,
            include_loopback: false,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            listen_port: default_listen_port(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            establish_secs: default_establish_timeout(),
            tcp_connect_secs: default_tcp_connect_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signal: SignalConfig::default(),
            ice: IceConfig::default(),
            proxy: ProxyConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl IceConfig {
    /// Build the ordered ICE server list. A server is included only when its
    /// host is configured and its port is nonzero.
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers = Vec::new();
        if let Some(host) = self.stun_host.as_deref().filter(|h| !h.is_empty()) {
            if self.stun_port != 0 {
                servers.push(RTCIceServer {
                    urls: vec![format!("stun:{}:{}", host, self.stun_port)],
                    ..Default::default()
                });
            }
        }
        if let Some(host) = self.turn_host.as_deref().filter(|h| !h.is_empty()) {
            if self.turn_port != 0 {
                servers.push(RTCIceServer {
                    urls: vec![format!("turn:{}:{}", host, self.turn_port)],
                    username: self.turn_user.clone().unwrap_or_default(),
                    credential: self.turn_password.clone().unwrap_or_default(),
                    ..Default::default()
                });
            }
        }
        servers
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Check the required fields
    pub fn validate(&self) -> Result<()> {
        if self.signal.user.is_empty() {
            return Err(Error::ConfigurationMissing("signal.user".into()));
        }
        if self.proxy.listen_address.is_empty() {
            return Err(Error::ConfigurationMissing("proxy.listen_address".into()));
        }
        Ok(())
    }

    /// Get the local SOCKS listen address
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.proxy.listen_address, self.proxy.listen_port)
    }

    /// Get the channel establish deadline
    pub fn establish_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.establish_secs)
    }

    /// Get the responder-side outbound connect timeout
    pub fn tcp_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.tcp_connect_secs)
    }

    /// Get the delay between signaling connect attempts
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.signal.retry_delay_secs)
    }
}

// Default values
fn default_signal_server() -> String {
    "ws://127.0.0.1:9002/signal".to_string()
}

fn default_connect_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    2
}

fn default_ice_port() -> u16 {
    3478
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    1080
}

fn default_establish_timeout() -> u64 {
    30
}

fn default_tcp_connect_timeout() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_usable() {
        let config = Config::default();
        assert_eq!(config.proxy.listen_port, 1080);
        assert_eq!(config.timeouts.establish_secs, 30);
        assert!(config.ice.ice_servers().is_empty());
        // Missing signal.user must fail validation
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_minimal_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "[signal]\nuser = \"alice\"\npeer_user = \"bob\"\n\n[proxy]\nlisten_port = 1085\n"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.signal.user, "alice");
        assert_eq!(config.signal.peer_user.as_deref(), Some("bob"));
        assert_eq!(config.proxy.listen_port, 1085);
        assert_eq!(config.listen_address(), "127.0.0.1:1085");
        // Unset sections keep their defaults
        assert_eq!(config.signal.connect_retries, 3);
    }

    #[test]
    fn builds_ice_server_list_in_order() {
        let ice = IceConfig {
            stun_host: Some("stun.example.org".into()),
            stun_port: 19302,
            turn_host: Some("turn.example.org".into()),
            turn_port: 3478,
            turn_user: Some("user".into()),
            turn_password: Some("secret".into()),
            include_loopback: false,
        };
        let servers = ice.ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.org:19302"]);
        assert_eq!(servers[1].urls, vec!["turn:turn.example.org:3478"]);
        assert_eq!(servers[1].username, "user");
        assert_eq!(servers[1].credential, "secret");
    }

    #[test]
    fn skips_servers_without_host_or_port() {
        let mut ice = IceConfig::default();
        assert!(ice.ice_servers().is_empty());

        ice.stun_host = Some("stun.example.org".into());
        ice.stun_port = 0;
        assert!(ice.ice_servers().is_empty());
    }
}
