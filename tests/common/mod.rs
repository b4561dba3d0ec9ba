//! Loopback signaling bus for integration tests
//!
//! A minimal WebSocket bus: clients announce themselves with a `register`
//! envelope, every other envelope is routed to the connection registered
//! under its `toUser` field. The envelope payload itself is opaque here,
//! exactly as it is to a production bus.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::tungstenite::Message;

type PeerMap = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>>;

/// Start the bus on an ephemeral port and return its address.
pub async fn spawn_bus() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let peers: PeerMap = Arc::new(Mutex::new(HashMap::new()));

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(handle_connection(stream, peers.clone()));
        }
    });

    addr
}

async fn handle_connection(stream: TcpStream, peers: PeerMap) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(_) => return,
    };
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut registered = None;
    while let Some(Ok(msg)) = stream.next().await {
        let Message::Text(text) = msg else { continue };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
            continue;
        };
        match value["action"].as_str() {
            Some("register") => {
                if let Some(user) = value["user"].as_str() {
                    peers.lock().unwrap().insert(user.to_string(), tx.clone());
                    registered = Some(user.to_string());
                }
            }
            Some(_) => {
                if let Some(to) = value["toUser"].as_str() {
                    let target = peers.lock().unwrap().get(to).cloned();
                    if let Some(target) = target {
                        let _ = target.send(Message::Text(text));
                    }
                }
            }
            None => {}
        }
    }

    if let Some(user) = registered {
        peers.lock().unwrap().remove(&user);
    }
}
