//! Peer-connection manager
//!
//! Owns the shared `peer_user → (peer connection, refcount)` registry and
//! demultiplexes signaling traffic and inbound data channels onto logical
//! channels. A peer connection is created lazily by the first channel naming
//! that peer and closed when the last channel referencing it goes away.
//!
//! Engine callbacks run on webrtc-owned tasks; they only clone handles and
//! enqueue work. The registry mutex is never held across an engine call that
//! can re-enter.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine,
        setting_engine::SettingEngine, APIBuilder, API,
    },
    data_channel::{
        data_channel_init::RTCDataChannelInit, data_channel_state::RTCDataChannelState,
        RTCDataChannel,
    },
    ice::mdns::MulticastDnsMode,
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration,
        sdp::session_description::RTCSessionDescription,
        RTCPeerConnection,
    },
};

use crate::{
    channel::{self, ChannelEvent, ChannelHandle, ChannelId},
    config::Config,
    error::{Error, Result},
    signaling::{SdpKind, SignalEvent, SignalSender},
    utils,
};

/// Buffered candidates per remote user before the matching entry exists
const PENDING_CANDIDATE_LIMIT: usize = 32;
/// How long a buffered candidate stays useful
const PENDING_CANDIDATE_TTL: Duration = Duration::from_secs(30);

/// One peer connection shared by every channel to the same remote user
struct PeerEntry {
    pc: Arc<RTCPeerConnection>,
    refcount: u32,
}

/// Routing entry for a live channel
struct ChannelEntry {
    events: mpsc::Sender<ChannelEvent>,
    peer_user: String,
}

/// Candidate that arrived before its peer connection existed
struct PendingCandidate {
    channel_id: String,
    mid: String,
    sdp: String,
    received_at: Instant,
}

struct ManagerInner {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    signal: SignalSender,
    peers: Mutex<HashMap<String, PeerEntry>>,
    channels: DashMap<ChannelId, ChannelEntry>,
    pending_candidates: std::sync::Mutex<HashMap<String, Vec<PendingCandidate>>>,
    establish_timeout: Duration,
    tcp_connect_timeout: Duration,
}

/// Peer-connection manager handle; cheap to clone
#[derive(Clone)]
pub struct PeerManager {
    inner: Arc<ManagerInner>,
}

impl PeerManager {
    /// Create a new manager. Builds the webrtc API once; individual peer
    /// connections are created on demand.
    pub fn new(config: &Config, signal: SignalSender) -> Result<Self> {
        let api = build_api(config.ice.include_loopback)?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                api,
                ice_servers: config.ice.ice_servers(),
                signal,
                peers: Mutex::new(HashMap::new()),
                channels: DashMap::new(),
                pending_candidates: std::sync::Mutex::new(HashMap::new()),
                establish_timeout: config.establish_timeout(),
                tcp_connect_timeout: config.tcp_connect_timeout(),
            }),
        })
    }

    /// Whether the signaling bus is currently connected
    pub fn signal_is_open(&self) -> bool {
        self.inner.signal.is_open()
    }

    /// Number of live peer-connection entries
    pub async fn peer_count(&self) -> usize {
        self.inner.peers.lock().await.len()
    }

    /// Number of live channels
    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    #[cfg(test)]
    pub(crate) async fn refcount(&self, peer_user: &str) -> Option<u32> {
        self.inner
            .peers
            .lock()
            .await
            .get(peer_user)
            .map(|e| e.refcount)
    }

    #[cfg(test)]
    pub(crate) fn pending_candidate_count(&self, peer_user: &str) -> usize {
        self.inner
            .pending_candidates
            .lock()
            .unwrap()
            .get(peer_user)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Consume the signaling event stream. Runs until the stream ends.
    pub async fn run(self, mut events: mpsc::Receiver<SignalEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                SignalEvent::Connected => info!("signaling bus connected"),
                SignalEvent::Disconnected => {
                    warn!("signaling bus disconnected");
                    self.handle_signal_lost().await;
                }
                SignalEvent::Error { code, message } => {
                    warn!(code, "signaling bus error: {}", message);
                }
                SignalEvent::Description {
                    from,
                    channel_id,
                    kind,
                    sdp,
                } => {
                    if let Err(e) = self.handle_description(&from, &channel_id, kind, sdp).await {
                        warn!(%from, %channel_id, "failed to apply description: {}", e);
                    }
                }
                SignalEvent::Candidate {
                    from,
                    channel_id,
                    mid,
                    sdp,
                } => {
                    if let Err(e) = self.handle_candidate(&from, &channel_id, mid, sdp).await {
                        warn!(%from, %channel_id, "failed to apply candidate: {}", e);
                    }
                }
            }
        }
        debug!("signaling event stream ended");
    }

    /// Open an initiator channel to `host:port` through `peer_user`.
    ///
    /// Creates the peer connection if this is the first channel to that user,
    /// creates the outbound data channel labeled with a fresh channel id, and
    /// sends the offer when negotiation is needed. Success or failure is
    /// reported later through the returned handle's notices.
    pub async fn open_channel(
        &self,
        host: &str,
        port: u16,
        peer_user: &str,
    ) -> Result<ChannelHandle> {
        let channel_id = utils::generate_channel_id();
        let (pc, created) = self.get_peer_connection(peer_user, &channel_id).await?;

        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = pc.create_data_channel(&channel_id, Some(init)).await?;

        let (events_tx, events_rx) = mpsc::channel::<ChannelEvent>(64);
        let (notices_tx, notices_rx) = mpsc::channel(64);
        channel::attach_data_channel(&dc, events_tx.clone());
        self.add_data_channel(&channel_id, peer_user, events_tx.clone())
            .await?;

        tokio::spawn(channel::run_initiator(channel::InitiatorChannel {
            id: channel_id.clone(),
            peer_user: peer_user.to_string(),
            host: host.to_string(),
            port,
            dc,
            manager: self.clone(),
            events: events_rx,
            notices: notices_tx,
            establish_timeout: self.inner.establish_timeout,
        }));

        if created {
            if let Err(e) = self.send_offer(&pc, peer_user, &channel_id).await {
                let _ = events_tx.send(ChannelEvent::Shutdown).await;
                return Err(e);
            }
        }

        debug!(id = %channel_id, peer = %peer_user, created, "opened initiator channel");
        Ok(ChannelHandle::new(channel_id, events_tx, notices_rx))
    }

    /// Atomic lookup-or-create of the peer connection for `peer_user`.
    /// Returns the handle and whether it was created by this call. Does not
    /// touch the refcount; that belongs to `add_data_channel`.
    async fn get_peer_connection(
        &self,
        peer_user: &str,
        channel_id: &str,
    ) -> Result<(Arc<RTCPeerConnection>, bool)> {
        let mut peers = self.inner.peers.lock().await;
        if let Some(entry) = peers.get(peer_user) {
            return Ok((entry.pc.clone(), false));
        }

        let rtc_config = RTCConfiguration {
            ice_servers: self.inner.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.inner.api.new_peer_connection(rtc_config).await?);
        self.install_pc_handlers(&pc, peer_user, channel_id);
        peers.insert(
            peer_user.to_string(),
            PeerEntry {
                pc: pc.clone(),
                refcount: 0,
            },
        );
        info!(peer = %peer_user, "created peer connection");
        Ok((pc, true))
    }

    /// Register a channel and count it against its peer entry.
    async fn add_data_channel(
        &self,
        channel_id: &str,
        peer_user: &str,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Result<()> {
        if self.inner.channels.contains_key(channel_id) {
            return Err(Error::Channel(format!(
                "channel already registered: {}",
                channel_id
            )));
        }
        self.inner.channels.insert(
            channel_id.to_string(),
            ChannelEntry {
                events,
                peer_user: peer_user.to_string(),
            },
        );
        let mut peers = self.inner.peers.lock().await;
        match peers.get_mut(peer_user) {
            Some(entry) => {
                entry.refcount += 1;
                trace!(peer = %peer_user, refcount = entry.refcount, "channel registered");
                Ok(())
            }
            None => {
                self.inner.channels.remove(channel_id);
                Err(Error::Channel(format!(
                    "no peer connection for {}",
                    peer_user
                )))
            }
        }
    }

    /// Deregister a channel; closes and removes the peer entry when its last
    /// channel goes away. Idempotent. The entry is removed under the mutex,
    /// the engine close happens after it is released.
    pub(crate) async fn close_data_channel(&self, channel_id: &str, peer_user: &str) {
        if self.inner.channels.remove(channel_id).is_none() {
            return;
        }
        let closing = {
            let mut peers = self.inner.peers.lock().await;
            match peers.get_mut(peer_user) {
                Some(entry) => {
                    entry.refcount = entry.refcount.saturating_sub(1);
                    trace!(peer = %peer_user, refcount = entry.refcount, "channel deregistered");
                    if entry.refcount == 0 {
                        peers.remove(peer_user).map(|e| e.pc)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(pc) = closing {
            info!(peer = %peer_user, "closing peer connection");
            if let Err(e) = pc.close().await {
                debug!(peer = %peer_user, "peer connection close failed: {}", e);
            }
        }
    }

    /// Create and send our offer for a freshly created peer connection.
    async fn send_offer(
        &self,
        pc: &Arc<RTCPeerConnection>,
        peer_user: &str,
        channel_id: &str,
    ) -> Result<()> {
        let offer = pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        pc.set_local_description(offer).await?;
        self.inner
            .signal
            .send_description(peer_user, channel_id, SdpKind::Offer, sdp)
            .await?;
        debug!(peer = %peer_user, id = %channel_id, "sent offer");
        Ok(())
    }

    /// Apply a remote description.
    ///
    /// An Offer from an unknown user creates the entry and a responder
    /// channel bound to the offer's channel id before applying. A duplicate
    /// Offer for a known channel id is re-applied idempotently (and
    /// re-answered; the previous answer may have been lost). An Answer for an
    /// unknown user is dropped.
    async fn handle_description(
        &self,
        from: &str,
        channel_id: &str,
        kind: SdpKind,
        sdp: String,
    ) -> Result<()> {
        match kind {
            SdpKind::Offer => {
                let (pc, _created) = self.get_peer_connection(from, channel_id).await?;
                if !self.inner.channels.contains_key(channel_id) {
                    self.spawn_responder(from, channel_id, None).await?;
                }
                pc.set_remote_description(RTCSessionDescription::offer(sdp)?)
                    .await?;
                self.flush_pending_candidates(from, &pc).await;

                let answer = pc.create_answer(None).await?;
                let answer_sdp = answer.sdp.clone();
                pc.set_local_description(answer).await?;
                self.inner
                    .signal
                    .send_description(from, channel_id, SdpKind::Answer, answer_sdp)
                    .await?;
                debug!(peer = %from, id = %channel_id, "answered offer");
            }
            SdpKind::Answer => {
                let pc = {
                    let peers = self.inner.peers.lock().await;
                    peers.get(from).map(|e| e.pc.clone())
                };
                let Some(pc) = pc else {
                    debug!(peer = %from, "dropping answer from unknown peer");
                    return Ok(());
                };
                pc.set_remote_description(RTCSessionDescription::answer(sdp)?)
                    .await?;
                self.flush_pending_candidates(from, &pc).await;
                debug!(peer = %from, id = %channel_id, "applied answer");
            }
        }
        Ok(())
    }

    /// Apply a remote candidate, or buffer it until the sender's peer
    /// connection exists and has a remote description.
    async fn handle_candidate(
        &self,
        from: &str,
        channel_id: &str,
        mid: String,
        sdp: String,
    ) -> Result<()> {
        let pc = {
            let peers = self.inner.peers.lock().await;
            peers.get(from).map(|e| e.pc.clone())
        };
        if let Some(pc) = pc {
            // A candidate can outrun the description it belongs to; park it
            // until the remote description lands
            if pc.remote_description().await.is_some() {
                let init = RTCIceCandidateInit {
                    candidate: sdp,
                    sdp_mid: Some(mid),
                    sdp_mline_index: None,
                    username_fragment: None,
                };
                pc.add_ice_candidate(init).await?;
                trace!(peer = %from, id = %channel_id, "applied candidate");
                return Ok(());
            }
        }
        self.buffer_candidate(from, channel_id, mid, sdp);
        Ok(())
    }

    fn buffer_candidate(&self, from: &str, channel_id: &str, mid: String, sdp: String) {
        let mut pending = self.inner.pending_candidates.lock().unwrap();
        let queue = pending.entry(from.to_string()).or_default();
        queue.retain(|c| c.received_at.elapsed() < PENDING_CANDIDATE_TTL);
        if queue.len() >= PENDING_CANDIDATE_LIMIT {
            warn!(peer = %from, "pending candidate queue full, dropping candidate");
            return;
        }
        debug!(peer = %from, id = %channel_id, "buffering candidate for unknown peer");
        queue.push(PendingCandidate {
            channel_id: channel_id.to_string(),
            mid,
            sdp,
            received_at: Instant::now(),
        });
    }

    /// Apply buffered candidates now that `from` has a peer connection.
    async fn flush_pending_candidates(&self, from: &str, pc: &Arc<RTCPeerConnection>) {
        let queued = {
            let mut pending = self.inner.pending_candidates.lock().unwrap();
            pending.remove(from).unwrap_or_default()
        };
        for candidate in queued {
            if candidate.received_at.elapsed() >= PENDING_CANDIDATE_TTL {
                continue;
            }
            let init = RTCIceCandidateInit {
                candidate: candidate.sdp,
                sdp_mid: Some(candidate.mid),
                sdp_mline_index: None,
                username_fragment: None,
            };
            if let Err(e) = pc.add_ice_candidate(init).await {
                warn!(peer = %from, id = %candidate.channel_id, "buffered candidate rejected: {}", e);
            }
        }
    }

    /// Route an inbound data channel to its logical channel by label,
    /// creating a responder channel when none exists yet.
    async fn accept_data_channel(&self, peer_user: String, dc: Arc<RTCDataChannel>) {
        let label = dc.label().to_string();
        debug!(peer = %peer_user, id = %label, "inbound data channel");

        let events = self
            .inner
            .channels
            .get(&label)
            .map(|entry| entry.events.clone());
        match events {
            Some(events) => {
                // Attach must land in the mailbox before transport callbacks
                // can enqueue anything behind it
                let _ = events.send(ChannelEvent::Attach(dc.clone())).await;
                channel::attach_data_channel(&dc, events.clone());
                if dc.ready_state() == RTCDataChannelState::Open {
                    let _ = events.send(ChannelEvent::Open).await;
                }
            }
            None => {
                if let Err(e) = self.spawn_responder(&peer_user, &label, Some(dc)).await {
                    warn!(peer = %peer_user, id = %label, "failed to create responder channel: {}", e);
                }
            }
        }
    }

    /// Create a Manager-owned responder channel bound to `channel_id`.
    async fn spawn_responder(
        &self,
        peer_user: &str,
        channel_id: &str,
        dc: Option<Arc<RTCDataChannel>>,
    ) -> Result<()> {
        let (events_tx, events_rx) = mpsc::channel::<ChannelEvent>(64);
        self.add_data_channel(channel_id, peer_user, events_tx.clone())
            .await?;
        let attached = dc.map(|dc| {
            channel::attach_data_channel(&dc, events_tx.clone());
            dc
        });
        let already_open = attached
            .as_ref()
            .map(|dc| dc.ready_state() == RTCDataChannelState::Open)
            .unwrap_or(false);

        tokio::spawn(channel::run_responder(channel::ResponderChannel {
            id: channel_id.to_string(),
            peer_user: peer_user.to_string(),
            dc: attached,
            manager: self.clone(),
            events: events_rx,
            establish_timeout: self.inner.establish_timeout,
            tcp_connect_timeout: self.inner.tcp_connect_timeout,
        }));
        if already_open {
            let _ = events_tx.send(ChannelEvent::Open).await;
        }
        info!(peer = %peer_user, id = %channel_id, "created responder channel");
        Ok(())
    }

    /// Tell every channel the bus dropped; channels not yet forwarding error
    /// out, forwarding ones keep running over ICE.
    async fn handle_signal_lost(&self) {
        let targets: Vec<mpsc::Sender<ChannelEvent>> = self
            .inner
            .channels
            .iter()
            .map(|entry| entry.events.clone())
            .collect();
        for events in targets {
            let _ = events.send(ChannelEvent::SignalLost).await;
        }
    }

    /// Wire engine callbacks for a freshly created peer connection. Local
    /// descriptions are sent explicitly by the negotiation paths; candidates
    /// trickle from here, stamped with the initiating channel's id.
    fn install_pc_handlers(&self, pc: &Arc<RTCPeerConnection>, peer_user: &str, channel_id: &str) {
        let signal = self.inner.signal.clone();
        let peer = peer_user.to_string();
        let id = channel_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let signal = signal.clone();
            let peer = peer.clone();
            let id = id.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let mid = init.sdp_mid.unwrap_or_default();
                        if let Err(e) = signal.send_candidate(&peer, &id, mid, init.candidate).await
                        {
                            warn!(peer = %peer, "failed to send candidate: {}", e);
                        }
                    }
                    Err(e) => warn!(peer = %peer, "failed to serialize candidate: {}", e),
                }
            })
        }));

        let peer = peer_user.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            trace!(peer = %peer, ?state, "peer connection state");
            Box::pin(async {})
        }));

        let peer = peer_user.to_string();
        pc.on_ice_gathering_state_change(Box::new(move |state| {
            trace!(peer = %peer, ?state, "gathering state");
            Box::pin(async {})
        }));

        let manager = self.clone();
        let peer = peer_user.to_string();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let manager = manager.clone();
            let peer = peer.clone();
            Box::pin(async move {
                manager.accept_data_channel(peer, dc).await;
            })
        }));
    }
}

/// Build the webrtc API shared by every peer connection.
fn build_api(include_loopback: bool) -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    // mdns candidates flood the local network and never help here
    let mut setting_engine = SettingEngine::default();
    setting_engine.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);
    if include_loopback {
        setting_engine.set_include_loopback_candidate(true);
    }

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelNotice;
    use crate::error::ErrorKind;
    use crate::signaling::SignalCommand;
    use std::sync::atomic::AtomicBool;

    fn test_manager(user: &str) -> (PeerManager, mpsc::Receiver<SignalCommand>) {
        let (tx, rx) = mpsc::channel(256);
        let sender = SignalSender::new(user.to_string(), tx, Arc::new(AtomicBool::new(true)));
        let manager = PeerManager::new(&Config::default(), sender).unwrap();
        (manager, rx)
    }

    async fn wait_until<F, Fut>(condition: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    /// Pull commands until a Description shows up (candidates may interleave).
    async fn next_description(
        rx: &mut mpsc::Receiver<SignalCommand>,
    ) -> (String, String, SdpKind, String) {
        loop {
            let cmd = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for a description")
                .expect("signal stream closed");
            if let SignalCommand::Description {
                to,
                channel_id,
                kind,
                sdp,
            } = cmd
            {
                return (to, channel_id, kind, sdp);
            }
        }
    }

    #[tokio::test]
    async fn channels_to_same_peer_share_one_connection() {
        let (manager, mut rx) = test_manager("alice");

        let h1 = manager.open_channel("example.org", 80, "bob").await.unwrap();
        let h2 = manager.open_channel("example.org", 81, "bob").await.unwrap();
        assert_ne!(h1.id(), h2.id());
        assert_eq!(manager.peer_count().await, 1);
        assert_eq!(manager.refcount("bob").await, Some(2));
        assert_eq!(manager.channel_count(), 2);

        // Only the first channel triggers an offer
        let (to, channel_id, kind, _) = next_description(&mut rx).await;
        assert_eq!(to, "bob");
        assert_eq!(channel_id, h1.id());
        assert_eq!(kind, SdpKind::Offer);

        // Closing one keeps the shared connection alive
        h1.close().await;
        wait_until(|| {
            let m = manager.clone();
            async move { m.refcount("bob").await == Some(1) }
        })
        .await;
        assert_eq!(manager.peer_count().await, 1);

        // Closing the last reference removes the entry
        h2.close().await;
        wait_until(|| {
            let m = manager.clone();
            async move { m.peer_count().await == 0 }
        })
        .await;
        assert_eq!(manager.channel_count(), 0);
    }

    #[tokio::test]
    async fn offer_creates_responder_and_duplicate_is_idempotent() {
        let (alice, mut alice_rx) = test_manager("alice");
        let (bob, mut bob_rx) = test_manager("bob");

        // A real offer, produced by alice's stack
        let _handle = alice.open_channel("example.org", 80, "bob").await.unwrap();
        let (_, channel_id, kind, offer_sdp) = next_description(&mut alice_rx).await;
        assert_eq!(kind, SdpKind::Offer);

        bob.handle_description("alice", &channel_id, SdpKind::Offer, offer_sdp.clone())
            .await
            .unwrap();
        assert_eq!(bob.peer_count().await, 1);
        assert_eq!(bob.channel_count(), 1);
        assert_eq!(bob.refcount("alice").await, Some(1));

        let (to, answered_id, kind, _) = next_description(&mut bob_rx).await;
        assert_eq!(to, "alice");
        assert_eq!(answered_id, channel_id);
        assert_eq!(kind, SdpKind::Answer);

        // The same offer again: no second channel, no extra refcount
        bob.handle_description("alice", &channel_id, SdpKind::Offer, offer_sdp)
            .await
            .unwrap();
        assert_eq!(bob.peer_count().await, 1);
        assert_eq!(bob.channel_count(), 1);
        assert_eq!(bob.refcount("alice").await, Some(1));
    }

    #[tokio::test]
    async fn answer_from_unknown_peer_is_dropped() {
        let (manager, _rx) = test_manager("alice");
        manager
            .handle_description("stranger", "c1", SdpKind::Answer, "v=0".into())
            .await
            .unwrap();
        assert_eq!(manager.peer_count().await, 0);
    }

    #[tokio::test]
    async fn signal_loss_errors_channels_before_forwarding() {
        let (manager, _rx) = test_manager("alice");
        let mut handle = manager.open_channel("example.org", 80, "bob").await.unwrap();

        manager.handle_signal_lost().await;

        let notice = tokio::time::timeout(Duration::from_secs(5), handle.next_notice())
            .await
            .unwrap()
            .unwrap();
        match notice {
            ChannelNotice::Errored { kind, .. } => {
                assert_eq!(kind, ErrorKind::SignalDisconnected)
            }
            other => panic!("unexpected notice: {:?}", other),
        }

        wait_until(|| {
            let m = manager.clone();
            async move { m.peer_count().await == 0 }
        })
        .await;
    }

    #[tokio::test]
    async fn candidates_for_unknown_peers_are_buffered_and_flushed() {
        let (alice, mut alice_rx) = test_manager("alice");
        let (bob, _bob_rx) = test_manager("bob");

        bob.handle_candidate("alice", "c1", "0".into(), "candidate:bogus".into())
            .await
            .unwrap();
        assert_eq!(bob.pending_candidate_count("alice"), 1);

        // The entry appears with alice's offer; the buffer drains into it
        let _handle = alice.open_channel("example.org", 80, "bob").await.unwrap();
        let (_, channel_id, _, offer_sdp) = next_description(&mut alice_rx).await;
        bob.handle_description("alice", &channel_id, SdpKind::Offer, offer_sdp)
            .await
            .unwrap();
        assert_eq!(bob.pending_candidate_count("alice"), 0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        /// Invariant 1: at every quiescent point the entry count equals the
        /// number of peers with live channels and each refcount equals that
        /// peer's live-channel count.
        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 8, .. ProptestConfig::default()
            })]
            #[test]
            fn refcounts_track_live_channels(
                ops in proptest::collection::vec((0usize..2, any::<bool>()), 1..10)
            ) {
                let rt = tokio::runtime::Runtime::new().unwrap();
                rt.block_on(async move {
                    let peers = ["bob", "carol"];
                    let (manager, _rx) = test_manager("alice");
                    let mut open: Vec<Vec<ChannelHandle>> = vec![Vec::new(), Vec::new()];

                    for (peer_idx, is_open) in ops {
                        if is_open {
                            let handle = manager
                                .open_channel("example.org", 80, peers[peer_idx])
                                .await
                                .unwrap();
                            open[peer_idx].push(handle);
                        } else if let Some(handle) = open[peer_idx].pop() {
                            handle.close().await;
                            let expected = open[peer_idx].len() as u32;
                            let manager = manager.clone();
                            let peer = peers[peer_idx];
                            wait_until(move || {
                                let m = manager.clone();
                                async move {
                                    match m.refcount(peer).await {
                                        Some(count) => count == expected,
                                        None => expected == 0,
                                    }
                                }
                            })
                            .await;
                        }
                    }

                    let live_peers = open.iter().filter(|v| !v.is_empty()).count();
                    assert_eq!(manager.peer_count().await, live_peers);
                    for (peer_idx, handles) in open.iter().enumerate() {
                        let expected = if handles.is_empty() {
                            None
                        } else {
                            Some(handles.len() as u32)
                        };
                        assert_eq!(manager.refcount(peers[peer_idx]).await, expected);
                    }
                });
            }
        }
    }
}
