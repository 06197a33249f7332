//! End-to-end routing scenarios over loopback sockets.

use std::sync::Arc;
use std::time::Duration;

use rudder_inbound::{http, socks5};
use rudder_tunnel::{Subscription, Tunnel, TunnelOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Echo server on a loopback port.
async fn spawn_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if sock.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

fn router(rules: &str) -> Arc<Tunnel> {
    let tunnel = Tunnel::new(TunnelOptions::default());
    tunnel
        .apply_config(&rudder_config::parse(rules).unwrap())
        .unwrap();
    tunnel
}

async fn spawn_socks(tunnel: Arc<Tunnel>) -> (u16, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let shutdown = CancellationToken::new();
    tokio::spawn(socks5::serve(listener, tunnel, shutdown.clone()));
    (port, shutdown)
}

async fn spawn_http(tunnel: Arc<Tunnel>) -> (u16, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let shutdown = CancellationToken::new();
    tokio::spawn(http::serve(listener, tunnel, shutdown.clone()));
    (port, shutdown)
}

/// SOCKS5 handshake + CONNECT to an IPv4 destination.
async fn socks_connect_ipv4(proxy_port: u16, ip: [u8; 4], port: u16) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&ip);
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00, "expected SOCKS5 success reply");
    stream
}

/// SOCKS5 handshake + CONNECT to a domain destination.
async fn socks_connect_domain(proxy_port: u16, host: &str, port: u16) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);
    stream
}

/// Wait for a log record containing `needle`.
async fn expect_log(sub: &mut Subscription, needle: &str) {
    let deadline = tokio::time::sleep(Duration::from_secs(5));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            record = sub.recv() => {
                let record = record.expect("log bus closed early");
                if record.message.contains(needle) {
                    return;
                }
            }
            _ = &mut deadline => panic!("no log record containing {needle:?}"),
        }
    }
}

#[tokio::test]
async fn socks5_cidr_match_goes_direct() {
    let echo = spawn_echo().await;
    let tunnel = router("[Rule]\nIP-CIDR,127.0.0.0/8,DIRECT\nFINAL,,REJECT\n");
    let (mut sub, _) = tunnel.log().subscribe().unwrap();
    let (proxy, _guard) = spawn_socks(tunnel.clone()).await;

    let mut client = socks_connect_ipv4(proxy, [127, 0, 0, 1], echo).await;
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    expect_log(&mut sub, "match IPCIDR using DIRECT").await;

    // Traffic flowed through the meter in both directions.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let snap = tunnel.traffic().snapshot();
    assert!(snap.up_total >= 4);
    assert!(snap.down_total >= 4);
}

#[tokio::test]
async fn http_connect_to_blocked_domain_is_rejected() {
    let tunnel = router("[Rule]\nDOMAIN-SUFFIX,blocked.test,REJECT\nFINAL,,DIRECT\n");
    let (proxy, _guard) = spawn_http(tunnel).await;

    let mut client = TcpStream::connect(("127.0.0.1", proxy)).await.unwrap();
    client
        .write_all(b"CONNECT blocked.test:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let mut reply = [0u8; 19];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"HTTP/1.1 200 OK\r\n\r\n");

    // The rejected outbound yields EOF immediately.
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn domain_suffix_takes_precedence_over_final() {
    let echo = spawn_echo().await;
    let tunnel = router("[Rule]\nDOMAIN-SUFFIX,example.com,REJECT\nFINAL,,DIRECT\n");
    let (proxy, _guard) = spawn_socks(tunnel).await;

    // A subdomain of the suffix is rejected without any dial.
    let mut rejected = socks_connect_domain(proxy, "api.example.com", 80).await;
    let mut buf = [0u8; 16];
    assert_eq!(rejected.read(&mut buf).await.unwrap(), 0);

    // A non-matching domain falls through to DIRECT.
    let mut direct = socks_connect_domain(proxy, "localhost", echo).await;
    direct.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    direct.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
}

#[tokio::test]
async fn hot_reload_spares_inflight_connections() {
    let echo = spawn_echo().await;
    let tunnel = router("[Rule]\nFINAL,,DIRECT\n");
    let (proxy, _guard) = spawn_socks(tunnel.clone()).await;

    let mut inflight = socks_connect_ipv4(proxy, [127, 0, 0, 1], echo).await;
    inflight.write_all(b"before").await.unwrap();
    let mut buf = [0u8; 6];
    inflight.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"before");

    tunnel
        .apply_config(&rudder_config::parse("[Rule]\nFINAL,,REJECT\n").unwrap())
        .unwrap();

    // The in-flight connection keeps transferring bytes.
    inflight.write_all(b"after!").await.unwrap();
    inflight.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"after!");

    // A new connection sees the new policy.
    let mut fresh = socks_connect_ipv4(proxy, [127, 0, 0, 1], echo).await;
    let mut buf = [0u8; 16];
    assert_eq!(fresh.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn unknown_adapter_falls_through_and_still_connects() {
    let echo = spawn_echo().await;
    let tunnel = router("[Rule]\nIP-CIDR,127.0.0.0/8,NONEXISTENT\nFINAL,,DIRECT\n");
    let (mut sub, _) = tunnel.log().subscribe().unwrap();
    let (proxy, _guard) = spawn_socks(tunnel).await;

    let mut client = socks_connect_ipv4(proxy, [127, 0, 0, 1], echo).await;
    client.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still here");

    expect_log(&mut sub, "adapter NONEXISTENT is missing").await;
}

/// Minimal origin server answering every connection with one canned
/// response after the request head arrives.
async fn spawn_origin(response: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    match sock.read(&mut byte).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => head.push(byte[0]),
                    }
                }
                let _ = sock.write_all(response.as_bytes()).await;
            });
        }
    });
    port
}

#[tokio::test]
async fn http_forward_mode_round_trips() {
    let origin =
        spawn_origin("HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
            .await;
    let tunnel = router("[Rule]\nFINAL,,DIRECT\n");
    let (proxy, _guard) = spawn_http(tunnel).await;

    let mut client = TcpStream::connect(("127.0.0.1", proxy)).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{origin}/ HTTP/1.1\r\nHost: 127.0.0.1:{origin}\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8(response).unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Content-Length: 5"));
    assert!(response.ends_with("\r\n\r\nhello"));
    // The hop-by-hop header did not leak through.
    assert!(!response.contains("Connection: close"));
}

#[tokio::test]
async fn http_forward_chunked_response_and_reuse() {
    let origin = spawn_origin(
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
    )
    .await;
    let tunnel = router("[Rule]\nFINAL,,DIRECT\n");
    let (proxy, _guard) = spawn_http(tunnel).await;

    let mut client = TcpStream::connect(("127.0.0.1", proxy)).await.unwrap();

    for _ in 0..2 {
        let request = format!(
            "GET http://127.0.0.1:{origin}/ HTTP/1.1\r\nHost: 127.0.0.1:{origin}\r\n\r\n"
        );
        client.write_all(request.as_bytes()).await.unwrap();

        // Read until the terminal chunk arrives.
        let mut response = Vec::new();
        let mut buf = [0u8; 1024];
        while !response.ends_with(b"0\r\n\r\n") {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before terminal chunk");
            response.extend_from_slice(&buf[..n]);
        }
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Transfer-Encoding: chunked"));
        assert!(response.contains("4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n"));
    }
    // Two round trips on one client connection: forward mode reuses the
    // client side while dispatching each request independently.
}

#[tokio::test]
async fn http_forward_head_request_has_no_body_and_reuses() {
    // A HEAD response advertises the length of the body a GET would get,
    // but carries none.
    let origin = spawn_origin("HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n").await;
    let tunnel = router("[Rule]\nFINAL,,DIRECT\n");
    let (proxy, _guard) = spawn_http(tunnel).await;

    let mut client = TcpStream::connect(("127.0.0.1", proxy)).await.unwrap();

    for _ in 0..2 {
        let request = format!(
            "HEAD http://127.0.0.1:{origin}/ HTTP/1.1\r\nHost: 127.0.0.1:{origin}\r\n\r\n"
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        let mut buf = [0u8; 256];
        while !response.ends_with(b"\r\n\r\n") {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before the response head");
            response.extend_from_slice(&buf[..n]);
        }
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Length: 1234"));
    }
    // Two HEAD round trips on one client connection: the advertised body
    // length was not read, so the exchange stayed clean and reusable.
}

#[tokio::test]
async fn http_forward_no_content_response_reuses() {
    let origin = spawn_origin("HTTP/1.1 204 No Content\r\n\r\n").await;
    let tunnel = router("[Rule]\nFINAL,,DIRECT\n");
    let (proxy, _guard) = spawn_http(tunnel).await;

    let mut client = TcpStream::connect(("127.0.0.1", proxy)).await.unwrap();

    for _ in 0..2 {
        let request = format!(
            "GET http://127.0.0.1:{origin}/ HTTP/1.1\r\nHost: 127.0.0.1:{origin}\r\n\r\n"
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        let mut buf = [0u8; 256];
        while !response.ends_with(b"\r\n\r\n") {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before the response head");
            response.extend_from_slice(&buf[..n]);
        }
        assert!(response.starts_with(b"HTTP/1.1 204 No Content\r\n"));
    }
}

#[tokio::test]
async fn socks5_unsupported_command_is_refused() {
    let tunnel = router("[Rule]\nFINAL,,DIRECT\n");
    let (proxy, _guard) = spawn_socks(tunnel).await;

    let mut client = TcpStream::connect(("127.0.0.1", proxy)).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();

    // UDP ASSOCIATE
    client
        .write_all(&[0x05, 0x03, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x07);
}

#[tokio::test]
async fn listener_shutdown_stops_accepting() {
    let tunnel = router("[Rule]\nFINAL,,DIRECT\n");
    let (proxy, shutdown) = spawn_socks(tunnel).await;

    // Listener is alive first.
    let probe = TcpStream::connect(("127.0.0.1", proxy)).await;
    assert!(probe.is_ok());

    shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;
    // The socket is gone once the accept loop returns.
    let probe = TcpStream::connect(("127.0.0.1", proxy)).await;
    assert!(probe.is_err());
}
