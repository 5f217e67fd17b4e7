//! End-to-end tests for the proxied HTTP client, against an in-process
//! mock SOCKS5 proxy.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use futures::io::{AsyncReadExt, AsyncWriteExt};
use futures::StreamExt;
use futures::task::SpawnExt;
use tor_rtcompat::{NetStreamListener, NetStreamProvider, Runtime};

use nightjar_socks::{HttpClient, ProxyUrl, Request};

/// Read from `stream` until the end of an HTTP request head, returning
/// everything read.
async fn read_http_request<S: futures::io::AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    buf
}

/// Run a one-shot mock SOCKS5 proxy on localhost.
///
/// Accepts a single connection, performs the no-auth handshake, records
/// the CONNECT payload, then answers any HTTP request with `reply`.
async fn mock_proxy<R: Runtime>(
    rt: &R,
    reply: &'static [u8],
) -> (std::net::SocketAddr, futures::channel::oneshot::Receiver<(Vec<u8>, Vec<u8>)>) {
    let listener = rt
        .listen(&"127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = futures::channel::oneshot::channel();

    rt.spawn({
        async move {
            let mut incoming = listener.incoming();
            let (mut stream, _peer) = incoming.next().await.unwrap().unwrap();

            // Greeting: VER NMETHODS METHODS…
            let mut greeting = [0_u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting[0], 0x05);
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            // CONNECT head, then the variable-length address.
            let mut head = [0_u8; 4];
            stream.read_exact(&mut head).await.unwrap();
            let mut connect = head.to_vec();
            match head[3] {
                0x01 => {
                    let mut rest = [0_u8; 4 + 2];
                    stream.read_exact(&mut rest).await.unwrap();
                    connect.extend_from_slice(&rest);
                }
                0x03 => {
                    let mut len = [0_u8; 1];
                    stream.read_exact(&mut len).await.unwrap();
                    connect.push(len[0]);
                    let mut rest = vec![0_u8; len[0] as usize + 2];
                    stream.read_exact(&mut rest).await.unwrap();
                    connect.extend_from_slice(&rest);
                }
                other => panic!("unexpected atyp {other}"),
            }
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            let request = read_http_request(&mut stream).await;
            stream.write_all(reply).await.unwrap();
            stream.flush().await.unwrap();
            stream.close().await.unwrap();
            let _ = tx.send((connect, request));
        }
    })
    .unwrap();

    (addr, rx)
}

#[test]
fn fetch_through_socks5h() {
    tor_rtcompat::test_with_one_runtime!(|rt| async move {
        let (addr, seen) = mock_proxy(
            &rt,
            b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nok!",
        )
        .await;

        let proxy: ProxyUrl = format!("socks5h://{addr}").parse().unwrap();
        let client = HttpClient::new(rt.clone());
        let request = Request::post(
            "http://abcdefghijklmnop.onion/onion/ingest",
            b"{\"x\":1}".to_vec(),
        )
        .unwrap()
        .header("Content-Type", "application/json")
        .timeout(Duration::from_secs(5))
        .via(proxy);

        let response = client.fetch(request).await.unwrap();
        assert_eq!(response.status, 200);
        assert!(response.is_success());
        assert_eq!(response.body, b"ok!");

        let (connect, http_request) = seen.await.unwrap();
        // Domain ATYP carrying the onion name, untouched.
        assert_eq!(connect[3], 0x03);
        let name_len = connect[4] as usize;
        assert_eq!(&connect[5..5 + name_len], b"abcdefghijklmnop.onion");

        let text = String::from_utf8_lossy(&http_request);
        assert!(text.starts_with("POST /onion/ingest HTTP/1.1\r\n"));
        assert!(text.contains("Host: abcdefghijklmnop.onion\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("{\"x\":1}"));
    });
}

#[test]
fn unreachable_proxy_is_classified() {
    tor_rtcompat::test_with_one_runtime!(|rt| async move {
        // Grab a port that nothing is listening on.
        let listener = rt.listen(&"127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let proxy: ProxyUrl = format!("socks5://{addr}").parse().unwrap();
        let client = HttpClient::new(rt.clone());
        let request = Request::get("http://93.184.216.34/")
            .unwrap()
            .timeout(Duration::from_secs(5))
            .via(proxy);

        let err = client.fetch(request).await.unwrap_err();
        assert_eq!(err.code(), "proxy_unreachable");
    });
}

#[test]
fn overall_deadline_fires() {
    tor_rtcompat::test_with_one_runtime!(|rt| async move {
        // A proxy that accepts and then says nothing.
        let listener = rt.listen(&"127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        rt.spawn(async move {
            let mut incoming = listener.incoming();
            let (stream, _) = incoming.next().await.unwrap().unwrap();
            // Hold the connection open, replying to nothing.
            futures::future::pending::<()>().await;
            drop(stream);
        })
        .unwrap();

        let proxy: ProxyUrl = format!("socks5://{addr}").parse().unwrap();
        let client = HttpClient::new(rt.clone());
        let request = Request::get("http://93.184.216.34/")
            .unwrap()
            .timeout(Duration::from_millis(250))
            .via(proxy);

        let err = client.fetch(request).await.unwrap_err();
        assert_eq!(err.code(), "timeout");
    });
}
