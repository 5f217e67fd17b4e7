//! End-to-end tests for the local onion controller, over real localhost
//! sockets.

#![allow(clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::io::{AsyncReadExt, AsyncWriteExt};
use futures::task::SpawnExt;
use futures::StreamExt;
use serde_json::{json, Value};
use tor_rtcompat::{NetStreamListener, NetStreamProvider, Runtime};

use nightjar_ctrl::{ControllerConfig, EndpointInfo, LocalOnionController, ProxyDirectory};
use nightjar_socks::{HttpClient, ProxyUrl, Request};

/// A proxy directory with fixed contents.
struct StaticDirectory {
    tor: EndpointInfo,
    lokinet: EndpointInfo,
}

impl StaticDirectory {
    fn none() -> Self {
        StaticDirectory {
            tor: EndpointInfo::default(),
            lokinet: EndpointInfo::default(),
        }
    }
}

impl ProxyDirectory for StaticDirectory {
    fn tor(&self) -> EndpointInfo {
        self.tor.clone()
    }
    fn lokinet(&self) -> EndpointInfo {
        self.lokinet.clone()
    }
}

async fn launch<R: Runtime>(
    rt: &R,
    directory: StaticDirectory,
) -> (nightjar_ctrl::ControllerHandle, SocketAddr) {
    let controller = LocalOnionController::new(
        rt.clone(),
        ControllerConfig::default(),
        HttpClient::new(rt.clone()),
        Arc::new(directory),
    );
    let handle = controller.launch().await.unwrap();
    let addr = handle.local_addr();
    (handle, addr)
}

async fn post_json<R: Runtime>(rt: &R, addr: SocketAddr, path: &str, body: Value) -> (u16, Value) {
    let client = HttpClient::new(rt.clone());
    let request = Request::post(
        &format!("http://{addr}{path}"),
        serde_json::to_vec(&body).unwrap(),
    )
    .unwrap()
    .header("Content-Type", "application/json")
    .timeout(Duration::from_secs(10));
    let response = client.fetch(request).await.unwrap();
    let value = serde_json::from_slice(&response.body).unwrap_or(Value::Null);
    (response.status, value)
}

async fn get_json<R: Runtime>(rt: &R, addr: SocketAddr, path: &str) -> (u16, Value) {
    let client = HttpClient::new(rt.clone());
    let request = Request::get(&format!("http://{addr}{path}"))
        .unwrap()
        .timeout(Duration::from_secs(10));
    let response = client.fetch(request).await.unwrap();
    let value = serde_json::from_slice(&response.body).unwrap_or(Value::Null);
    (response.status, value)
}

#[test]
fn legacy_local_enqueue_and_inbox_cursor() {
    tor_rtcompat::test_with_one_runtime!(|rt| async move {
        let (_handle, addr) = launch(&rt, StaticDirectory::none()).await;

        // Legacy field names, no route: local enqueue.
        let (status, body) =
            post_json(&rt, addr, "/onion/send", json!({"to": "dev-1", "envelope": "E"})).await;
        assert_eq!(status, 200);
        assert_eq!(body["ok"], true);
        assert_eq!(body["forwarded"], false);
        assert!(body["msgId"].is_string());

        let (status, inbox) = get_json(&rt, addr, "/onion/inbox?deviceId=dev-1").await;
        assert_eq!(status, 200);
        let items = inbox["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["envelope"], "E");
        let next = inbox["nextAfter"].as_str().unwrap().to_owned();

        // Cursor advances monotonically; nothing repeats.
        let (_, inbox2) =
            get_json(&rt, addr, &format!("/onion/inbox?deviceId=dev-1&after={next}")).await;
        assert!(inbox2["items"].as_array().unwrap().is_empty());
        assert!(inbox2["nextAfter"].is_null());
    });
}

#[test]
fn ingest_matches_send_enqueue_semantics() {
    tor_rtcompat::test_with_one_runtime!(|rt| async move {
        let (_handle, addr) = launch(&rt, StaticDirectory::none()).await;

        let (status, body) = post_json(
            &rt,
            addr,
            "/onion/ingest",
            json!({"toDeviceId": "dev-9", "from": "remote", "envelope": {"v": 1}, "id": "rid-1"}),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["forwarded"], false);
        // The sender-supplied id is preserved.
        assert_eq!(body["msgId"], "rid-1");

        let (_, inbox) = get_json(&rt, addr, "/onion/inbox?deviceId=dev-9&after=-1&limit=5").await;
        let items = inbox["items"].as_array().unwrap();
        assert_eq!(items[0]["id"], "rid-1");
        assert_eq!(items[0]["from"], "remote");
    });
}

#[test]
fn missing_fields_and_unknown_route() {
    tor_rtcompat::test_with_one_runtime!(|rt| async move {
        let (_handle, addr) = launch(&rt, StaticDirectory::none()).await;

        // Missing envelope.
        let (status, body) =
            post_json(&rt, addr, "/onion/send", json!({"toDeviceId": "d1"})).await;
        assert_eq!(status, 400);
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"], "missing-fields");

        // Missing destination.
        let (status, body) = post_json(&rt, addr, "/onion/send", json!({"envelope": "E"})).await;
        assert_eq!(status, 400);
        assert_eq!(body["error"], "missing-to-device");

        // Unknown route.
        let (status, _) = get_json(&rt, addr, "/onion/nope").await;
        assert_eq!(status, 404);
    });
}

#[test]
fn invalid_json_and_oversized_body() {
    tor_rtcompat::test_with_one_runtime!(|rt| async move {
        let (_handle, addr) = launch(&rt, StaticDirectory::none()).await;

        // Raw socket, garbage body.
        let mut stream = rt.connect(&addr).await.unwrap();
        let body = b"{not json";
        let head = format!(
            "POST /onion/send HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.write_all(body).await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        let reply = String::from_utf8_lossy(&reply);
        assert!(reply.starts_with("HTTP/1.1 400"), "{reply}");
        assert!(reply.contains("invalid-json"));

        // Declared oversized body.
        let mut stream = rt.connect(&addr).await.unwrap();
        let head = "POST /onion/send HTTP/1.1\r\nHost: x\r\nContent-Length: 500000\r\n\r\n";
        stream.write_all(head.as_bytes()).await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        let reply = String::from_utf8_lossy(&reply);
        assert!(reply.starts_with("HTTP/1.1 413"), "{reply}");
        assert!(reply.contains("body-too-large"));
    });
}

#[test]
fn health_reports_both_networks() {
    tor_rtcompat::test_with_one_runtime!(|rt| async move {
        let directory = StaticDirectory {
            tor: EndpointInfo {
                active: true,
                proxy: Some("socks5h://127.0.0.1:9250".parse().unwrap()),
                address: Some("me.onion".into()),
                details: "ready".into(),
            },
            lokinet: EndpointInfo::default(),
        };
        let (_handle, addr) = launch(&rt, directory).await;

        let (status, health) = get_json(&rt, addr, "/onion/health").await;
        assert_eq!(status, 200);
        assert_eq!(health["ok"], true);
        assert_eq!(health["network"], "tor");
        assert_eq!(health["tor"]["active"], true);
        assert_eq!(health["tor"]["socksProxy"], "socks5h://127.0.0.1:9250");
        assert_eq!(health["lokinet"]["active"], false);

        let (_, address) = get_json(&rt, addr, "/onion/address").await;
        assert_eq!(address["torOnion"], "me.onion");
        assert!(address["lokinet"].is_null());
    });
}

/// A mock SOCKS5 proxy that accepts any CONNECT and then answers any
/// HTTP request with 200.  Records the CONNECT target names it saw.
async fn mock_proxy_accepting<R: Runtime>(rt: &R) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let listener = rt.listen(&"127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);
    rt.spawn(async move {
        let mut incoming = listener.incoming();
        while let Some(Ok((mut stream, _))) = incoming.next().await {
            let seen = Arc::clone(&seen2);
            // One connection at a time is fine for tests.
            let mut greeting = [0_u8; 3];
            if stream.read_exact(&mut greeting).await.is_err() {
                continue;
            }
            let _ = stream.write_all(&[0x05, 0x00]).await;
            let mut head = [0_u8; 4];
            if stream.read_exact(&mut head).await.is_err() {
                continue;
            }
            let mut target = String::new();
            if head[3] == 0x03 {
                let mut len = [0_u8; 1];
                let _ = stream.read_exact(&mut len).await;
                let mut name = vec![0_u8; len[0] as usize];
                let _ = stream.read_exact(&mut name).await;
                target = String::from_utf8_lossy(&name).into_owned();
                let mut port = [0_u8; 2];
                let _ = stream.read_exact(&mut port).await;
            }
            seen.lock().unwrap().push(target);
            let _ = stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await;
            // Consume the HTTP request head, then answer 200.
            let mut buf = [0_u8; 4096];
            let mut got = Vec::new();
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        got.extend_from_slice(&buf[..n]);
                        if got.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                }
            }
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\n{\"ok\":true}")
                .await;
            let _ = stream.close().await;
        }
    })
    .unwrap();
    (addr, seen)
}

#[test]
fn auto_mode_fails_over_from_lokinet_to_tor() {
    tor_rtcompat::test_with_one_runtime!(|rt| async move {
        // Lokinet proxy: a port with nothing listening.
        let dead = rt.listen(&"127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap()).await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);
        // Tor proxy: a healthy mock.
        let (tor_addr, seen) = mock_proxy_accepting(&rt).await;

        let directory = StaticDirectory {
            tor: EndpointInfo {
                active: true,
                proxy: Some(format!("socks5h://{tor_addr}").parse::<ProxyUrl>().unwrap()),
                address: None,
                details: String::new(),
            },
            lokinet: EndpointInfo {
                active: true,
                proxy: Some(format!("socks5h://{dead_addr}").parse::<ProxyUrl>().unwrap()),
                address: None,
                details: String::new(),
            },
        };
        let (_handle, addr) = launch(&rt, directory).await;

        let (status, body) = post_json(
            &rt,
            addr,
            "/onion/send",
            json!({
                "toDeviceId": "dev-1",
                "envelope": "E",
                "route": {"mode": "auto", "lokinet": "l.lok", "torOnion": "x.onion"},
            }),
        )
        .await;
        assert_eq!(status, 200, "{body}");
        assert_eq!(body["ok"], true);
        assert_eq!(body["forwarded"], true);
        assert_eq!(body["route"], "tor");

        // The healthy proxy saw exactly the tor target.
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, vec!["x.onion".to_owned()]);
    });
}

#[test]
fn prefer_lokinet_never_falls_back() {
    tor_rtcompat::test_with_one_runtime!(|rt| async move {
        let dead = rt.listen(&"127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap()).await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);
        let (tor_addr, seen) = mock_proxy_accepting(&rt).await;

        let directory = StaticDirectory {
            tor: EndpointInfo {
                active: true,
                proxy: Some(format!("socks5h://{tor_addr}").parse::<ProxyUrl>().unwrap()),
                address: None,
                details: String::new(),
            },
            lokinet: EndpointInfo {
                active: true,
                proxy: Some(format!("socks5h://{dead_addr}").parse::<ProxyUrl>().unwrap()),
                address: None,
                details: String::new(),
            },
        };
        let (_handle, addr) = launch(&rt, directory).await;

        let (status, body) = post_json(
            &rt,
            addr,
            "/onion/send",
            json!({
                "toDeviceId": "dev-1",
                "envelope": "E",
                "route": {"mode": "preferLokinet", "lokinet": "l.lok", "torOnion": "x.onion"},
            }),
        )
        .await;
        assert_eq!(status, 502, "{body}");
        assert_eq!(body["ok"], false);
        let error = body["error"].as_str().unwrap();
        assert!(error.starts_with("forward_failed:"), "{error}");

        // Tor was never consulted.
        assert!(seen.lock().unwrap().is_empty());
    });
}

#[test]
fn forward_without_proxy_or_targets() {
    tor_rtcompat::test_with_one_runtime!(|rt| async move {
        let (_handle, addr) = launch(&rt, StaticDirectory::none()).await;

        // A tor target with no tor proxy configured.
        let (status, body) = post_json(
            &rt,
            addr,
            "/onion/send",
            json!({
                "toDeviceId": "dev-1",
                "envelope": "E",
                "route": {"mode": "preferTor", "torOnion": "x.onion"},
            }),
        )
        .await;
        assert_eq!(status, 502);
        assert_eq!(body["error"], "forward_failed:no_proxy");

        // Route object present but no usable targets.
        let (status, body) = post_json(
            &rt,
            addr,
            "/onion/send",
            json!({
                "toDeviceId": "dev-1",
                "envelope": "E",
                "route": {"mode": "auto"},
            }),
        )
        .await;
        assert_eq!(status, 400);
        assert_eq!(body["error"], "forward_failed:no_route");
    });
}
