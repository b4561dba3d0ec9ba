//! End-to-end tests: a SOCKS client on one side, a TCP target on the other,
//! two full stacks in between, wired through the loopback signaling bus.
//! The peer connections do real ICE over loopback host candidates.

mod common;

use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use rtcproxy::{
    config::Config, manager::PeerManager, server::ProxyServer, signaling::SignalClient,
};

fn stack_config(user: &str, peer: Option<&str>, url: &str) -> Config {
    let mut config = Config::default();
    config.signal.user = user.to_string();
    config.signal.peer_user = peer.map(str::to_string);
    config.signal.server = url.to_string();
    config.ice.include_loopback = true;
    config.proxy.listen_port = 0;
    config
}

async fn start_stack(url: &str, user: &str, peer: Option<&str>) -> (PeerManager, SignalClient) {
    let config = stack_config(user, peer, url);
    let (client, events) = SignalClient::connect(url, user).await.unwrap();
    let manager = PeerManager::new(&config, client.sender()).unwrap();
    tokio::spawn(manager.clone().run(events));
    (manager, client)
}

async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

/// Run the SOCKS5 greeting and CONNECT request, returning the reply code.
async fn socks_connect(socks: &mut TcpStream, port: u16) -> u8 {
    socks.write_all(&[5, 1, 0]).await.unwrap();
    let mut method = [0u8; 2];
    socks.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [5, 0]);

    let mut request = vec![5, 1, 0, 1, 127, 0, 0, 1];
    request.extend_from_slice(&port.to_be_bytes());
    socks.write_all(&request).await.unwrap();

    let mut head = [0u8; 4];
    socks.read_exact(&mut head).await.unwrap();
    assert_eq!(head[0], 5);
    // Consume BND.ADDR + BND.PORT
    match head[3] {
        1 => {
            let mut rest = [0u8; 6];
            socks.read_exact(&mut rest).await.unwrap();
        }
        4 => {
            let mut rest = [0u8; 18];
            socks.read_exact(&mut rest).await.unwrap();
        }
        3 => {
            let mut len = [0u8; 1];
            socks.read_exact(&mut len).await.unwrap();
            let mut rest = vec![0u8; len[0] as usize + 2];
            socks.read_exact(&mut rest).await.unwrap();
        }
        other => panic!("unexpected address type {}", other),
    }
    head[1]
}

#[tokio::test(flavor = "multi_thread")]
async fn socks_connect_forwards_bytes_end_to_end() {
    tokio::time::timeout(Duration::from_secs(60), async {
        let bus_addr = common::spawn_bus().await;
        let url = format!("ws://{}/", bus_addr);
        let echo_port = spawn_echo_server().await;

        let (_bob_manager, _bob_client) = start_stack(&url, "bob", None).await;
        let (alice_manager, _alice_client) = start_stack(&url, "alice", Some("bob")).await;

        let proxy_config = stack_config("alice", Some("bob"), &url);
        let proxy = ProxyServer::bind(&proxy_config, alice_manager.clone())
            .await
            .unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        tokio::spawn(proxy.run());

        let mut socks = TcpStream::connect(proxy_addr).await.unwrap();
        let rep = socks_connect(&mut socks, echo_port).await;
        assert_eq!(rep, 0, "CONNECT should succeed");

        // Bytes round-trip verbatim through both stacks
        let payload = b"GET / HTTP/1.0\r\n\r\n";
        socks.write_all(payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        socks.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, payload);

        // A second session to the same peer shares the peer connection
        let mut socks2 = TcpStream::connect(proxy_addr).await.unwrap();
        let rep2 = socks_connect(&mut socks2, echo_port).await;
        assert_eq!(rep2, 0);
        socks2.write_all(b"second").await.unwrap();
        let mut echoed2 = [0u8; 6];
        socks2.read_exact(&mut echoed2).await.unwrap();
        assert_eq!(&echoed2, b"second");
        assert_eq!(alice_manager.peer_count().await, 1);
        assert_eq!(alice_manager.channel_count(), 2);

        // Closing both sockets tears everything down on the client side
        drop(socks);
        drop(socks2);
        for _ in 0..200 {
            if alice_manager.peer_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(alice_manager.peer_count().await, 0);
        assert_eq!(alice_manager.channel_count(), 0);
    })
    .await
    .expect("end-to-end test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_target_surfaces_socks_connection_refused() {
    tokio::time::timeout(Duration::from_secs(60), async {
        let bus_addr = common::spawn_bus().await;
        let url = format!("ws://{}/", bus_addr);

        // Bind then drop to get a port that refuses connections
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = listener.local_addr().unwrap().port();
        drop(listener);

        let (_bob_manager, _bob_client) = start_stack(&url, "bob", None).await;
        let (alice_manager, _alice_client) = start_stack(&url, "alice", Some("bob")).await;

        let proxy_config = stack_config("alice", Some("bob"), &url);
        let proxy = ProxyServer::bind(&proxy_config, alice_manager.clone())
            .await
            .unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        tokio::spawn(proxy.run());

        let mut socks = TcpStream::connect(proxy_addr).await.unwrap();
        let rep = socks_connect(&mut socks, dead_port).await;
        assert_eq!(rep, 5, "refused connect must map to SOCKS REP 5");

        // The failed channel must not leak its peer-connection reference
        for _ in 0..200 {
            if alice_manager.peer_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(alice_manager.peer_count().await, 0);
    })
    .await
    .expect("end-to-end test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_without_peer_user_fails_cleanly() {
    let bus_addr = common::spawn_bus().await;
    let url = format!("ws://{}/", bus_addr);

    let (manager, _client) = start_stack(&url, "alice", None).await;
    let proxy_config = stack_config("alice", None, &url);
    let proxy = ProxyServer::bind(&proxy_config, manager).await.unwrap();
    let proxy_addr = proxy.local_addr().unwrap();
    tokio::spawn(proxy.run());

    let mut socks = TcpStream::connect(proxy_addr).await.unwrap();
    let rep = socks_connect(&mut socks, 80).await;
    assert_eq!(rep, 1, "missing peer user is a general failure");
}
