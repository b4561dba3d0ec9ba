//! Signaling client
//!
//! WebSocket client for the out-of-band signaling bus. Descriptions and ICE
//! candidates travel as JSON envelopes routed by the bus on `toUser`; the
//! `channelId` field is opaque to the bus and demultiplexed by the
//! peer-connection manager on this side.
//!
//! Events are delivered exactly once, in arrival order, over a single mpsc
//! stream. Envelopes not addressed to the local user are dropped at ingress.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// SDP description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Wire envelope carried by the signaling bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Envelope {
    /// Announce our user id to the bus
    #[serde(rename_all = "camelCase")]
    Register { user: String },
    /// SDP description
    #[serde(rename_all = "camelCase")]
    Description {
        from_user: String,
        to_user: String,
        channel_id: String,
        #[serde(rename = "type")]
        kind: SdpKind,
        sdp: String,
    },
    /// ICE candidate
    #[serde(rename_all = "camelCase")]
    Candidate {
        from_user: String,
        to_user: String,
        channel_id: String,
        mid: String,
        sdp: String,
    },
    /// Bus-level error
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default)]
        code: i32,
        message: String,
    },
}

/// Event emitted by the signal client, in bus arrival order
#[derive(Debug, Clone)]
pub enum SignalEvent {
    /// The bus connection is up
    Connected,
    /// The bus connection dropped
    Disconnected,
    /// Bus-level error
    Error { code: i32, message: String },
    /// Remote description addressed to us
    Description {
        from: String,
        channel_id: String,
        kind: SdpKind,
        sdp: String,
    },
    /// Remote candidate addressed to us
    Candidate {
        from: String,
        channel_id: String,
        mid: String,
        sdp: String,
    },
}

/// Outbound signaling traffic handed to the writer task
#[derive(Debug)]
pub enum SignalCommand {
    Description {
        to: String,
        channel_id: String,
        kind: SdpKind,
        sdp: String,
    },
    Candidate {
        to: String,
        channel_id: String,
        mid: String,
        sdp: String,
    },
    Close,
}

/// Clonable capability handle for sending on the bus.
///
/// Components hold this instead of the client itself; it stays valid for the
/// lifetime of the connection and reports `is_open() == false` once the bus
/// drops.
#[derive(Clone)]
pub struct SignalSender {
    local_user: String,
    tx: mpsc::Sender<SignalCommand>,
    open: Arc<AtomicBool>,
}

impl SignalSender {
    pub(crate) fn new(
        local_user: String,
        tx: mpsc::Sender<SignalCommand>,
        open: Arc<AtomicBool>,
    ) -> Self {
        Self {
            local_user,
            tx,
            open,
        }
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Send a description to `to`, stamped with `channel_id`.
    pub async fn send_description(
        &self,
        to: &str,
        channel_id: &str,
        kind: SdpKind,
        sdp: String,
    ) -> Result<()> {
        self.tx
            .send(SignalCommand::Description {
                to: to.to_string(),
                channel_id: channel_id.to_string(),
                kind,
                sdp,
            })
            .await
            .map_err(|_| Error::Signaling("signal writer is gone".into()))
    }

    /// Send a candidate to `to`, stamped with `channel_id`.
    pub async fn send_candidate(
        &self,
        to: &str,
        channel_id: &str,
        mid: String,
        sdp: String,
    ) -> Result<()> {
        self.tx
            .send(SignalCommand::Candidate {
                to: to.to_string(),
                channel_id: channel_id.to_string(),
                mid,
                sdp,
            })
            .await
            .map_err(|_| Error::Signaling("signal writer is gone".into()))
    }
}

/// Signal client
pub struct SignalClient {
    sender: SignalSender,
}

impl SignalClient {
    /// Connect to the signaling bus and register.
    ///
    /// Returns the client and the ordered event stream. The stream yields
    /// `Connected` first and `Disconnected` last; between the two, every
    /// envelope addressed to `local_user` arrives exactly once.
    pub async fn connect(url: &str, local_user: &str) -> Result<(Self, mpsc::Receiver<SignalEvent>)> {
        let (ws, _) = connect_async(url).await?;
        info!("signaling connected: {}", url);
        let (mut sink, mut stream) = ws.split();

        let register = Envelope::Register {
            user: local_user.to_string(),
        };
        sink.send(Message::Text(serde_json::to_string(&register)?))
            .await?;

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<SignalCommand>(64);
        let (event_tx, event_rx) = mpsc::channel::<SignalEvent>(256);
        let open = Arc::new(AtomicBool::new(true));

        // Writer task: serialize commands into envelopes
        let writer_user = local_user.to_string();
        let writer_open = open.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                let envelope = match cmd {
                    SignalCommand::Description {
                        to,
                        channel_id,
                        kind,
                        sdp,
                    } => Envelope::Description {
                        from_user: writer_user.clone(),
                        to_user: to,
                        channel_id,
                        kind,
                        sdp,
                    },
                    SignalCommand::Candidate {
                        to,
                        channel_id,
                        mid,
                        sdp,
                    } => Envelope::Candidate {
                        from_user: writer_user.clone(),
                        to_user: to,
                        channel_id,
                        mid,
                        sdp,
                    },
                    SignalCommand::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                let json = match serde_json::to_string(&envelope) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("failed to serialize envelope: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json)).await {
                    warn!("signaling send failed: {}", e);
                    break;
                }
            }
            writer_open.store(false, Ordering::Release);
        });

        // Reader task: parse, filter on toUser, forward in order
        let reader_user = local_user.to_string();
        let reader_open = open.clone();
        tokio::spawn(async move {
            let _ = event_tx.send(SignalEvent::Connected).await;
            while let Some(msg) = stream.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("signaling receive failed: {}", e);
                        break;
                    }
                };
                let envelope: Envelope = match serde_json::from_str(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!("dropping malformed envelope: {}", e);
                        continue;
                    }
                };
                let event = match envelope {
                    Envelope::Description {
                        from_user,
                        to_user,
                        channel_id,
                        kind,
                        sdp,
                    } => {
                        if to_user != reader_user {
                            debug!("dropping description addressed to {}", to_user);
                            continue;
                        }
                        SignalEvent::Description {
                            from: from_user,
                            channel_id,
                            kind,
                            sdp,
                        }
                    }
                    Envelope::Candidate {
                        from_user,
                        to_user,
                        channel_id,
                        mid,
                        sdp,
                    } => {
                        if to_user != reader_user {
                            debug!("dropping candidate addressed to {}", to_user);
                            continue;
                        }
                        SignalEvent::Candidate {
                            from: from_user,
                            channel_id,
                            mid,
                            sdp,
                        }
                    }
                    Envelope::Error { code, message } => SignalEvent::Error { code, message },
                    Envelope::Register { .. } => continue,
                };
                if event_tx.send(event).await.is_err() {
                    break;
                }
            }
            reader_open.store(false, Ordering::Release);
            let _ = event_tx.send(SignalEvent::Disconnected).await;
            info!("signaling disconnected");
        });

        let sender = SignalSender::new(local_user.to_string(), cmd_tx, open);
        Ok((Self { sender }, event_rx))
    }

    /// Get a clonable sender handle
    pub fn sender(&self) -> SignalSender {
        self.sender.clone()
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_open()
    }

    /// Close the bus connection
    pub async fn close(&self) {
        let _ = self.sender.tx.send(SignalCommand::Close).await;
    }
}
