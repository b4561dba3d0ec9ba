//! Local SOCKS5 surface
//!
//! `ProxyServer` accepts local TCP sockets speaking SOCKS5 CONNECT and hands
//! each one to a `Connector`, which drives a channel from CONNECT to
//! forwarding and then relays bytes between the socket and the channel. A
//! failure before forwarding becomes the SOCKS reply code; after forwarding
//! it becomes a socket close.

use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, info, warn};

use crate::{
    channel::{ChannelHandle, ChannelNotice},
    config::Config,
    error::{Error, ErrorKind, Result},
    manager::PeerManager,
};

const SOCKS_VERSION: u8 = 5;
const METHOD_NO_AUTH: u8 = 0;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 1;
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;
const REP_COMMAND_NOT_SUPPORTED: u8 = 7;
const REP_ADDRESS_NOT_SUPPORTED: u8 = 8;

/// Drives one channel from a local CONNECT to the forwarding state.
pub struct Connector {
    handle: ChannelHandle,
    bound_host: Option<String>,
    bound_port: u16,
}

impl Connector {
    /// Open a channel for `host:port`. Requires the signaling bus to be
    /// connected and a peer user to be configured; returns before the channel
    /// is established — completion arrives through [`Connector::wait_connected`].
    pub async fn connect(
        manager: &PeerManager,
        peer_user: Option<&str>,
        host: &str,
        port: u16,
    ) -> Result<Self> {
        if !manager.signal_is_open() {
            return Err(Error::Signaling("signaling bus is not connected".into()));
        }
        let peer_user = peer_user
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::ConfigurationMissing("signal.peer_user".into()))?;
        let handle = manager.open_channel(host, port, peer_user).await?;
        Ok(Self {
            handle,
            bound_host: None,
            bound_port: 0,
        })
    }

    /// Wait for the channel to reach forwarding. The channel enforces its own
    /// establish deadline, so this resolves in bounded time.
    pub async fn wait_connected(&mut self) -> std::result::Result<(), (ErrorKind, String)> {
        while let Some(notice) = self.handle.next_notice().await {
            match notice {
                ChannelNotice::Connected {
                    bound_host,
                    bound_port,
                } => {
                    self.bound_host = Some(bound_host);
                    self.bound_port = bound_port;
                    return Ok(());
                }
                ChannelNotice::Errored { kind, message } => return Err((kind, message)),
                ChannelNotice::Closed => {
                    return Err((
                        ErrorKind::NetworkUnreachable,
                        "channel closed during setup".into(),
                    ))
                }
                ChannelNotice::Data(_) => {}
            }
        }
        Err((ErrorKind::Unknown, "channel task terminated".into()))
    }

    /// Remote peer's view of its outgoing socket; valid after connect.
    pub fn local_address(&self) -> Option<&str> {
        self.bound_host.as_deref()
    }

    pub fn local_port(&self) -> u16 {
        self.bound_port
    }

    pub async fn write(&self, data: Bytes) -> Result<()> {
        self.handle.write(data).await
    }

    pub async fn next_notice(&mut self) -> Option<ChannelNotice> {
        self.handle.next_notice().await
    }

    pub async fn close(&self) {
        self.handle.close().await;
    }
}

/// Local SOCKS5 CONNECT listener
pub struct ProxyServer {
    listener: TcpListener,
    manager: PeerManager,
    peer_user: Option<String>,
}

impl ProxyServer {
    /// Bind the local listener. A bind failure is fatal for the process.
    pub async fn bind(config: &Config, manager: PeerManager) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_address()).await?;
        info!("SOCKS5 listener on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            manager,
            peer_user: config.signal.peer_user.clone(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop; one task per client socket.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, client_addr) = self.listener.accept().await?;
            debug!(%client_addr, "accepted SOCKS client");
            let manager = self.manager.clone();
            let peer_user = self.peer_user.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_client(stream, manager, peer_user).await {
                    debug!(%client_addr, "client session ended: {}", e);
                }
            });
        }
    }
}

async fn handle_client(
    mut stream: TcpStream,
    manager: PeerManager,
    peer_user: Option<String>,
) -> Result<()> {
    let (host, port) = match socks_handshake(&mut stream).await {
        Ok(target) => target,
        Err(e) => {
            debug!("SOCKS handshake failed: {}", e);
            return Err(e);
        }
    };
    debug!(%host, port, "SOCKS CONNECT");

    let mut connector = match Connector::connect(&manager, peer_user.as_deref(), &host, port).await
    {
        Ok(connector) => connector,
        Err(e) => {
            let rep = match &e {
                Error::ConfigurationMissing(_) => {
                    warn!("rejecting CONNECT: {}", e);
                    ErrorKind::Unknown.code()
                }
                Error::Signaling(_) => ErrorKind::NetworkUnreachable.code(),
                _ => ErrorKind::Unknown.code(),
            };
            write_socks_reply(&mut stream, rep, None, 0).await?;
            return Err(e);
        }
    };

    if let Err((kind, message)) = connector.wait_connected().await {
        warn!(%host, port, %kind, "connect failed: {}", message);
        write_socks_reply(&mut stream, kind.code(), None, 0).await?;
        return Ok(());
    }

    let bound_host = connector.local_address().map(str::to_string);
    let bound_port = connector.local_port();
    if let Err(e) = write_socks_reply(
        &mut stream,
        ErrorKind::Success.code(),
        bound_host.as_deref(),
        bound_port,
    )
    .await
    {
        connector.close().await;
        return Err(e);
    }

    relay_client(stream, connector).await;
    Ok(())
}

/// Shuttle bytes between the local socket and the channel until either side
/// goes away.
async fn relay_client(stream: TcpStream, mut connector: Connector) {
    let (mut rd, mut wr) = stream.into_split();
    let mut rbuf = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            read = rd.read(&mut rbuf) => {
                match read {
                    Ok(0) | Err(_) => {
                        connector.close().await;
                        break;
                    }
                    Ok(n) => {
                        if connector.write(Bytes::copy_from_slice(&rbuf[..n])).await.is_err() {
                            break;
                        }
                    }
                }
            }
            notice = connector.next_notice() => {
                match notice {
                    Some(ChannelNotice::Data(data)) => {
                        if wr.write_all(&data).await.is_err() {
                            connector.close().await;
                            break;
                        }
                    }
                    Some(ChannelNotice::Errored { kind, message }) => {
                        debug!(%kind, "channel errored while forwarding: {}", message);
                        break;
                    }
                    Some(ChannelNotice::Closed) | None => break,
                    Some(ChannelNotice::Connected { .. }) => {}
                }
            }
        }
    }
}

/// Minimal SOCKS5 CONNECT negotiation; returns the requested target.
async fn socks_handshake<S>(stream: &mut S) -> Result<(String, u16)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: VER NMETHODS METHODS...
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(Error::Other(format!("unsupported SOCKS version: {}", head[0])));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])
            .await?;
        return Err(Error::Other("no acceptable auth method".into()));
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request: VER CMD RSV ATYP DST.ADDR DST.PORT
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Err(Error::Other(format!("unsupported SOCKS version: {}", request[0])));
    }
    if request[1] != CMD_CONNECT {
        write_socks_reply(stream, REP_COMMAND_NOT_SUPPORTED, None, 0).await?;
        return Err(Error::Other(format!("unsupported command: {}", request[1])));
    }
    let host = match request[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            IpAddr::from(addr).to_string()
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            IpAddr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| Error::Other("invalid domain name".into()))?
        }
        other => {
            write_socks_reply(stream, REP_ADDRESS_NOT_SUPPORTED, None, 0).await?;
            return Err(Error::Other(format!("unsupported address type: {}", other)));
        }
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok((host, u16::from_be_bytes(port)))
}

/// Write a SOCKS5 reply. The bound address comes from the responder's reply
/// frame; failure replies carry 0.0.0.0:0.
async fn write_socks_reply<S>(
    stream: &mut S,
    rep: u8,
    bound_host: Option<&str>,
    bound_port: u16,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut reply = vec![SOCKS_VERSION, rep, 0];
    match bound_host.and_then(|h| h.parse::<IpAddr>().ok()) {
        Some(IpAddr::V4(v4)) => {
            reply.push(ATYP_IPV4);
            reply.extend_from_slice(&v4.octets());
        }
        Some(IpAddr::V6(v6)) => {
            reply.push(ATYP_IPV6);
            reply.extend_from_slice(&v6.octets());
        }
        None => match bound_host {
            Some(name) if !name.is_empty() && name.len() <= 255 => {
                reply.push(ATYP_DOMAIN);
                reply.push(name.len() as u8);
                reply.extend_from_slice(name.as_bytes());
            }
            _ => {
                reply.push(ATYP_IPV4);
                reply.extend_from_slice(&[0, 0, 0, 0]);
            }
        },
    }
    reply.extend_from_slice(&bound_port.to_be_bytes());
    stream.write_all(&reply).await?;
    Ok(())
}
