//! Per-stream channel state machine
//!
//! A `Channel` is one logical end-to-end stream: one SOCKS session, one
//! WebRTC data channel, labeled with the channel id. Engine callbacks never
//! touch channel state directly; they enqueue [`ChannelEvent`]s onto the
//! channel's mailbox and a single task owns the state machine:
//!
//! `New → Signaling → Opening → Forwarding → Closed`, with `Errored`
//! reachable from any non-terminal state.
//!
//! The initiator sends the connect request exactly once when the transport
//! opens, then buffers inbound bytes until a complete reply parses; only a
//! success reply moves it to forwarding. The responder parses the request,
//! performs the outbound TCP connect itself and relays bytes between the
//! socket and the data channel for the rest of its life.

use std::{sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::{sleep_until, Instant},
};
use tracing::{debug, info, warn};
use webrtc::data_channel::RTCDataChannel;

use crate::{
    error::{Error, ErrorKind, Result},
    manager::PeerManager,
    protocol::{ConnectReply, ConnectRequest},
};

/// Opaque channel identifier; doubles as the data-channel label
pub type ChannelId = String;

/// Channel lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    New,
    Signaling,
    Opening,
    Forwarding,
    Closed,
    Errored,
}

/// Events delivered to a channel's mailbox
pub enum ChannelEvent {
    /// The data channel for this channel id arrived (responder side)
    Attach(Arc<RTCDataChannel>),
    /// Transport reported open
    Open,
    /// Inbound bytes from the transport
    Message(Bytes),
    /// Transport closed by the remote
    TransportClosed,
    /// Transport-level error
    TransportError(String),
    /// The signaling bus dropped
    SignalLost,
    /// Outbound application bytes (initiator side)
    Send(Bytes),
    /// Local close request; idempotent
    Shutdown,
}

impl std::fmt::Debug for ChannelEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelEvent::Attach(_) => f.debug_tuple("Attach").field(&"<RTCDataChannel>").finish(),
            ChannelEvent::Open => write!(f, "Open"),
            ChannelEvent::Message(data) => f.debug_tuple("Message").field(data).finish(),
            ChannelEvent::TransportClosed => write!(f, "TransportClosed"),
            ChannelEvent::TransportError(e) => f.debug_tuple("TransportError").field(e).finish(),
            ChannelEvent::SignalLost => write!(f, "SignalLost"),
            ChannelEvent::Send(data) => f.debug_tuple("Send").field(data).finish(),
            ChannelEvent::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Notifications from an initiator channel to its owner
#[derive(Debug)]
pub enum ChannelNotice {
    /// The reply frame parsed successfully; forwarding is active
    Connected { bound_host: String, bound_port: u16 },
    /// Forwarded application bytes
    Data(Bytes),
    /// Terminal failure
    Errored { kind: ErrorKind, message: String },
    /// Clean close
    Closed,
}

/// Owner-side handle for an initiator channel
pub struct ChannelHandle {
    id: ChannelId,
    events: mpsc::Sender<ChannelEvent>,
    notices: mpsc::Receiver<ChannelNotice>,
}

impl ChannelHandle {
    pub(crate) fn new(
        id: ChannelId,
        events: mpsc::Sender<ChannelEvent>,
        notices: mpsc::Receiver<ChannelNotice>,
    ) -> Self {
        Self {
            id,
            events,
            notices,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue application bytes for the remote peer. Valid once forwarding.
    pub async fn write(&self, data: Bytes) -> Result<()> {
        self.events
            .send(ChannelEvent::Send(data))
            .await
            .map_err(|_| Error::Channel("channel task is gone".into()))
    }

    /// Receive the next notice; `None` once the channel task has exited.
    pub async fn next_notice(&mut self) -> Option<ChannelNotice> {
        self.notices.recv().await
    }

    /// Request a close; safe to call in any state.
    pub async fn close(&self) {
        let _ = self.events.send(ChannelEvent::Shutdown).await;
    }
}

/// Install transport callbacks that forward into the channel mailbox.
pub(crate) fn attach_data_channel(dc: &Arc<RTCDataChannel>, tx: mpsc::Sender<ChannelEvent>) {
    let on_open = tx.clone();
    dc.on_open(Box::new(move || {
        let tx = on_open.clone();
        Box::pin(async move {
            let _ = tx.send(ChannelEvent::Open).await;
        })
    }));

    let on_close = tx.clone();
    dc.on_close(Box::new(move || {
        let tx = on_close.clone();
        Box::pin(async move {
            let _ = tx.send(ChannelEvent::TransportClosed).await;
        })
    }));

    let on_error = tx.clone();
    dc.on_error(Box::new(move |e| {
        let tx = on_error.clone();
        Box::pin(async move {
            let _ = tx.send(ChannelEvent::TransportError(e.to_string())).await;
        })
    }));

    let on_message = tx;
    dc.on_message(Box::new(move |msg| {
        let tx = on_message.clone();
        Box::pin(async move {
            let _ = tx.send(ChannelEvent::Message(msg.data)).await;
        })
    }));
}

/// Initiator-side channel task parameters
pub(crate) struct InitiatorChannel {
    pub id: ChannelId,
    pub peer_user: String,
    pub host: String,
    pub port: u16,
    pub dc: Arc<RTCDataChannel>,
    pub manager: PeerManager,
    pub events: mpsc::Receiver<ChannelEvent>,
    pub notices: mpsc::Sender<ChannelNotice>,
    pub establish_timeout: Duration,
}

/// Responder-side channel task parameters
pub(crate) struct ResponderChannel {
    pub id: ChannelId,
    pub peer_user: String,
    pub dc: Option<Arc<RTCDataChannel>>,
    pub manager: PeerManager,
    pub events: mpsc::Receiver<ChannelEvent>,
    pub establish_timeout: Duration,
    pub tcp_connect_timeout: Duration,
}

/// Drive an initiator channel to forwarding and relay until it ends.
pub(crate) async fn run_initiator(mut ch: InitiatorChannel) {
    let deadline = Instant::now() + ch.establish_timeout;
    let mut state = ChannelState::Signaling;
    let mut buf = BytesMut::new();
    let mut failure: Option<(ErrorKind, String)> = None;
    debug!(id = %ch.id, peer = %ch.peer_user, "initiator channel signaling");

    'run: loop {
        tokio::select! {
            _ = sleep_until(deadline), if state != ChannelState::Forwarding => {
                failure = Some((
                    ErrorKind::Timeout,
                    "channel did not reach forwarding before the deadline".into(),
                ));
                break 'run;
            }
            event = ch.events.recv() => {
                let Some(event) = event else { break 'run };
                match event {
                    ChannelEvent::Open => {
                        if state != ChannelState::Signaling {
                            continue;
                        }
                        state = ChannelState::Opening;
                        let frame = match ConnectRequest::new(ch.host.clone(), ch.port).encode() {
                            Ok(frame) => frame,
                            Err(e) => {
                                failure = Some((ErrorKind::Unknown, e.to_string()));
                                break 'run;
                            }
                        };
                        if let Err(e) = ch.dc.send(&frame).await {
                            failure = Some((
                                ErrorKind::NetworkUnreachable,
                                format!("request send failed: {}", e),
                            ));
                            break 'run;
                        }
                        debug!(id = %ch.id, host = %ch.host, port = ch.port, "sent connect request");
                    }
                    ChannelEvent::Message(data) => match state {
                        ChannelState::Opening => {
                            buf.extend_from_slice(&data);
                            match ConnectReply::decode(&mut buf) {
                                Ok(None) => {}
                                Ok(Some(reply)) if reply.kind.is_success() => {
                                    state = ChannelState::Forwarding;
                                    info!(
                                        id = %ch.id,
                                        bound = %format!("{}:{}", reply.host, reply.port),
                                        "channel forwarding"
                                    );
                                    let connected = ChannelNotice::Connected {
                                        bound_host: reply.host,
                                        bound_port: reply.port,
                                    };
                                    if ch.notices.send(connected).await.is_err() {
                                        break 'run;
                                    }
                                    if !buf.is_empty() {
                                        let rest = buf.split().freeze();
                                        if ch.notices.send(ChannelNotice::Data(rest)).await.is_err() {
                                            break 'run;
                                        }
                                    }
                                }
                                Ok(Some(reply)) => {
                                    failure = Some((
                                        reply.kind,
                                        format!("peer rejected connect: {}", reply.kind),
                                    ));
                                    break 'run;
                                }
                                Err(e) => {
                                    failure = Some((
                                        ErrorKind::Unknown,
                                        format!("malformed reply: {}", e),
                                    ));
                                    break 'run;
                                }
                            }
                        }
                        ChannelState::Forwarding => {
                            if ch.notices.send(ChannelNotice::Data(data)).await.is_err() {
                                break 'run;
                            }
                        }
                        _ => debug!(id = %ch.id, ?state, "dropping early transport bytes"),
                    },
                    ChannelEvent::Send(data) => {
                        if state != ChannelState::Forwarding {
                            warn!(id = %ch.id, ?state, "dropping write before forwarding");
                            continue;
                        }
                        if let Err(e) = ch.dc.send(&data).await {
                            failure = Some((ErrorKind::Unknown, format!("send failed: {}", e)));
                            break 'run;
                        }
                    }
                    ChannelEvent::TransportClosed => {
                        if state != ChannelState::Forwarding {
                            failure = Some((
                                ErrorKind::NetworkUnreachable,
                                "data channel closed before forwarding".into(),
                            ));
                        }
                        break 'run;
                    }
                    ChannelEvent::TransportError(message) => {
                        failure = Some((ErrorKind::Unknown, message));
                        break 'run;
                    }
                    ChannelEvent::SignalLost => {
                        // A forwarding channel is self-sustaining over ICE
                        if state != ChannelState::Forwarding {
                            failure = Some((
                                ErrorKind::SignalDisconnected,
                                "signaling dropped during setup".into(),
                            ));
                            break 'run;
                        }
                    }
                    ChannelEvent::Shutdown => break 'run,
                    ChannelEvent::Attach(_) => {}
                }
            }
        }
    }

    match failure {
        Some((kind, message)) => {
            warn!(id = %ch.id, %kind, "channel errored: {}", message);
            let _ = ch
                .notices
                .send(ChannelNotice::Errored { kind, message })
                .await;
        }
        None => {
            let _ = ch.notices.send(ChannelNotice::Closed).await;
        }
    }
    let _ = ch.dc.close().await;
    ch.manager.close_data_channel(&ch.id, &ch.peer_user).await;
    debug!(id = %ch.id, "initiator channel finished");
}

/// Drive a responder channel: parse the request, connect out, reply, relay.
pub(crate) async fn run_responder(mut ch: ResponderChannel) {
    let deadline = Instant::now() + ch.establish_timeout;
    let mut state = ChannelState::Signaling;
    let mut buf = BytesMut::new();
    let mut stream: Option<TcpStream> = None;
    let mut leftover = Bytes::new();
    debug!(id = %ch.id, peer = %ch.peer_user, "responder channel signaling");

    'setup: loop {
        tokio::select! {
            _ = sleep_until(deadline) => {
                warn!(id = %ch.id, "responder channel timed out before forwarding");
                break 'setup;
            }
            event = ch.events.recv() => {
                let Some(event) = event else { break 'setup };
                match event {
                    ChannelEvent::Attach(dc) => ch.dc = Some(dc),
                    ChannelEvent::Open => {
                        if state == ChannelState::Signaling {
                            state = ChannelState::Opening;
                        }
                    }
                    ChannelEvent::Message(data) => {
                        buf.extend_from_slice(&data);
                        let request = match ConnectRequest::decode(&mut buf) {
                            Ok(None) => continue,
                            Ok(Some(request)) => request,
                            Err(e) => {
                                warn!(id = %ch.id, "rejecting malformed request: {}", e);
                                send_reply(&ch.dc, ConnectReply::failure(ErrorKind::ConnectionRefused)).await;
                                break 'setup;
                            }
                        };
                        leftover = buf.split().freeze();
                        match connect_target(&request.host, request.port, ch.tcp_connect_timeout).await {
                            Ok(tcp) => {
                                let reply = match tcp.local_addr() {
                                    Ok(addr) => ConnectReply::success(addr.ip().to_string(), addr.port()),
                                    Err(e) => {
                                        warn!(id = %ch.id, "local_addr failed: {}", e);
                                        send_reply(&ch.dc, ConnectReply::failure(ErrorKind::Unknown)).await;
                                        break 'setup;
                                    }
                                };
                                info!(
                                    id = %ch.id,
                                    target = %format!("{}:{}", request.host, request.port),
                                    bound = %format!("{}:{}", reply.host, reply.port),
                                    "responder connected"
                                );
                                if !send_reply(&ch.dc, reply).await {
                                    break 'setup;
                                }
                                state = ChannelState::Forwarding;
                                stream = Some(tcp);
                                break 'setup;
                            }
                            Err((kind, message)) => {
                                warn!(id = %ch.id, %kind, "responder connect failed: {}", message);
                                send_reply(&ch.dc, ConnectReply::failure(kind)).await;
                                break 'setup;
                            }
                        }
                    }
                    ChannelEvent::TransportClosed
                    | ChannelEvent::TransportError(_)
                    | ChannelEvent::SignalLost
                    | ChannelEvent::Shutdown => break 'setup,
                    ChannelEvent::Send(_) => {}
                }
            }
        }
    }

    if state == ChannelState::Forwarding {
        if let (Some(tcp), Some(dc)) = (stream, ch.dc.clone()) {
            relay_responder(&ch.id, tcp, dc, &mut ch.events, leftover).await;
        }
    }

    if let Some(dc) = ch.dc.as_ref() {
        let _ = dc.close().await;
    }
    ch.manager.close_data_channel(&ch.id, &ch.peer_user).await;
    debug!(id = %ch.id, "responder channel finished");
}

/// Relay bytes between the outbound socket and the data channel until either
/// side goes away.
async fn relay_responder(
    id: &str,
    mut tcp: TcpStream,
    dc: Arc<RTCDataChannel>,
    events: &mut mpsc::Receiver<ChannelEvent>,
    leftover: Bytes,
) {
    if !leftover.is_empty() {
        if tcp.write_all(&leftover).await.is_err() {
            return;
        }
    }
    let (mut rd, mut wr) = tcp.split();
    let mut rbuf = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ChannelEvent::Message(data) => {
                        if let Err(e) = wr.write_all(&data).await {
                            debug!(id, "target write failed: {}", e);
                            break;
                        }
                    }
                    ChannelEvent::TransportClosed | ChannelEvent::Shutdown => break,
                    ChannelEvent::TransportError(e) => {
                        debug!(id, "transport error while forwarding: {}", e);
                        break;
                    }
                    // Signaling is no longer needed once forwarding
                    ChannelEvent::SignalLost => {}
                    ChannelEvent::Open | ChannelEvent::Send(_) | ChannelEvent::Attach(_) => {}
                }
            }
            read = rd.read(&mut rbuf) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = dc.send(&Bytes::copy_from_slice(&rbuf[..n])).await {
                            debug!(id, "data channel send failed: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(id, "target read failed: {}", e);
                        break;
                    }
                }
            }
        }
    }
}

async fn send_reply(dc: &Option<Arc<RTCDataChannel>>, reply: ConnectReply) -> bool {
    let Some(dc) = dc.as_ref() else {
        return false;
    };
    let frame = match reply.encode() {
        Ok(frame) => frame,
        Err(e) => {
            warn!("failed to encode reply: {}", e);
            return false;
        }
    };
    match dc.send(&frame).await {
        Ok(_) => true,
        Err(e) => {
            debug!("reply send failed: {}", e);
            false
        }
    }
}

/// Resolve and connect to the requested target, mapping socket errors onto
/// the canonical taxonomy.
async fn connect_target(
    host: &str,
    port: u16,
    timeout: Duration,
) -> std::result::Result<TcpStream, (ErrorKind, String)> {
    let mut addrs = match tokio::net::lookup_host((host, port)).await {
        Ok(addrs) => addrs,
        Err(e) => return Err((ErrorKind::HostNotFound, format!("resolve {}: {}", host, e))),
    };
    let Some(addr) = addrs.next() else {
        return Err((ErrorKind::HostNotFound, format!("no addresses for {}", host)));
    };
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err((ErrorKind::from_io(&e), format!("connect {}: {}", addr, e))),
        Err(_) => Err((ErrorKind::Timeout, format!("connect {}: timed out", addr))),
    }
}
