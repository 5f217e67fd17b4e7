//! The controller's HTTP/1.1 server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use futures::task::SpawnExt;
use futures::{select_biased, FutureExt, StreamExt};
use oneshot_fused_workaround as oneshot;
use serde_json::{json, Value};
use tor_rtcompat::{NetStreamListener, NetStreamProvider, Runtime, SleepProvider};
use tracing::{debug, info, warn};

use nightjar_envelope::EventId;
use nightjar_socks::HttpClient;

use crate::forward::{self, ForwardOutcome, ProxyDirectory};
use crate::msgs::SendBody;
use crate::queues::{InboxItem, InboxQueues, DEFAULT_TTL_MS};

/// Default listen port; ephemeral fallback when taken.
const DEFAULT_PORT: u16 = 3210;

/// Request body cap.
const BODY_CAP: usize = 256 * 1024;

/// Request head cap.
const HEAD_CAP: usize = 16 * 1024;

/// Interval between TTL sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default page size for `/onion/inbox`.
const DEFAULT_LIMIT: usize = 50;

/// Controller tunables.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Port to try first on 127.0.0.1.
    pub preferred_port: u16,
    /// Default TTL for queued items.
    pub default_ttl_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            preferred_port: DEFAULT_PORT,
            default_ttl_ms: DEFAULT_TTL_MS,
        }
    }
}

/// Handle to a launched controller.
///
/// Dropping the handle shuts the controller down.
pub struct ControllerHandle {
    /// Where the controller is listening.
    local_addr: SocketAddr,
    /// Dropped (or fired) to stop the accept loop and sweep task.
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ControllerHandle {
    /// The controller's bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the controller.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// The local store-and-forward controller.
pub struct LocalOnionController<R: Runtime> {
    /// Runtime for listeners, timers, and spawning.
    runtime: R,
    /// Tunables.
    config: ControllerConfig,
    /// The per-device queues.
    queues: Arc<InboxQueues>,
    /// Client used for SOCKS-proxied forwarding.
    client: HttpClient<R>,
    /// Live view of tor/lokinet.
    directory: Arc<dyn ProxyDirectory>,
}

impl<R: Runtime> LocalOnionController<R> {
    /// Construct a controller.
    pub fn new(
        runtime: R,
        config: ControllerConfig,
        client: HttpClient<R>,
        directory: Arc<dyn ProxyDirectory>,
    ) -> Self {
        LocalOnionController {
            runtime,
            config,
            queues: Arc::new(InboxQueues::new()),
            client,
            directory,
        }
    }

    /// Shared access to the queues (the daemon wires ingress pollers to
    /// this).
    pub fn queues(&self) -> Arc<InboxQueues> {
        Arc::clone(&self.queues)
    }

    /// Bind, spawn the accept loop and the sweep task, and return the
    /// handle.
    pub async fn launch(self) -> std::io::Result<ControllerHandle> {
        let preferred: SocketAddr = ([127, 0, 0, 1], self.config.preferred_port).into();
        let listener = match self.runtime.listen(&preferred).await {
            Ok(l) => l,
            Err(e) => {
                debug!(
                    "port {} unavailable ({}); binding ephemeral",
                    self.config.preferred_port, e
                );
                self.runtime
                    .listen(&"127.0.0.1:0".parse::<SocketAddr>().expect("static addr parses"))
                    .await?
            }
        };
        let local_addr = listener.local_addr()?;
        info!("onion controller listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let shutdown_rx = shutdown_rx.shared();

        let this = Arc::new(self);

        // TTL sweep task.
        {
            let this = Arc::clone(&this);
            let mut shutdown = shutdown_rx.clone().fuse();
            this.runtime
                .clone()
                .spawn(async move {
                    loop {
                        select_biased! {
                            _ = shutdown => break,
                            _ = this.runtime.sleep(SWEEP_INTERVAL).fuse() => {
                                this.queues.sweep(now_ms(&this.runtime));
                            }
                        }
                    }
                })
                .map_err(std::io::Error::other)?;
        }

        // Accept loop.
        {
            let this = Arc::clone(&this);
            let runtime = this.runtime.clone();
            let mut shutdown = shutdown_rx.fuse();
            let accept_loop = runtime.clone();
            accept_loop.spawn(async move {
                let mut incoming = listener.incoming().fuse();
                loop {
                    let stream = select_biased! {
                        _ = shutdown => break,
                        stream = incoming.next() => stream,
                    };
                    let (stream, peer) = match stream {
                        Some(Ok(pair)) => pair,
                        Some(Err(e)) => {
                            warn!("controller accept failed: {}", e);
                            continue;
                        }
                        None => break,
                    };
                    debug!("controller connection from {}", peer);
                    let this = Arc::clone(&this);
                    if let Err(e) = runtime.spawn(async move {
                        if let Err(e) = this.handle_connection(stream).await {
                            debug!("controller connection error: {}", e);
                        }
                    }) {
                        warn!("could not spawn connection handler: {}", e);
                    }
                }
                debug!("controller accept loop exiting");
            })
            .map_err(std::io::Error::other)?;
        }

        Ok(ControllerHandle {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Serve one connection: one request, one response, close.
    async fn handle_connection<S>(&self, mut stream: S) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let request = match read_request(&mut stream).await {
            Ok(r) => r,
            Err(RequestReadError::TooLarge) => {
                return respond(
                    &mut stream,
                    413,
                    "Payload Too Large",
                    &json!({"ok": false, "error": "body-too-large"}),
                )
                .await;
            }
            Err(RequestReadError::Malformed(detail)) => {
                debug!("malformed request: {}", detail);
                return respond(
                    &mut stream,
                    400,
                    "Bad Request",
                    &json!({"ok": false, "error": "invalid-json"}),
                )
                .await;
            }
            Err(RequestReadError::Io(e)) => return Err(e),
        };

        let (status, reason, body) = self.dispatch(&request).await;
        respond(&mut stream, status, reason, &body).await
    }

    /// Route one parsed request.
    async fn dispatch(&self, request: &HttpRequest) -> (u16, &'static str, Value) {
        let path = request.path.split('?').next().unwrap_or("");
        match (request.method.as_str(), path) {
            ("OPTIONS", _) => (204, "No Content", Value::Null),
            ("GET", "/onion/health") => (200, "OK", self.health()),
            ("GET", "/onion/address") => (200, "OK", self.address()),
            ("GET", "/onion/inbox") => self.inbox(&request.path),
            ("POST", "/onion/send") => self.send(request, true).await,
            ("POST", "/onion/ingest") => self.send(request, false).await,
            _ => (
                404,
                "Not Found",
                json!({"ok": false, "error": "unknown-route"}),
            ),
        }
    }

    /// `GET /onion/health`.
    fn health(&self) -> Value {
        let tor = self.directory.tor();
        let lokinet = self.directory.lokinet();
        let selected = self.directory.selected();
        let network = if selected == "lokinet" && lokinet.active {
            "lokinet"
        } else if tor.active {
            "tor"
        } else if lokinet.active {
            "lokinet"
        } else {
            "none"
        };
        json!({
            "ok": true,
            "network": network,
            "details": format!("selected={selected}"),
            "tor": {
                "active": tor.active,
                "socksProxy": tor.proxy.map(|p| p.to_string()),
                "address": tor.address,
                "details": tor.details,
            },
            "lokinet": {
                "active": lokinet.active,
                "proxyUrl": lokinet.proxy.map(|p| p.to_string()),
                "address": lokinet.address,
                "details": lokinet.details,
            },
        })
    }

    /// `GET /onion/address`.
    fn address(&self) -> Value {
        let tor = self.directory.tor();
        let lokinet = self.directory.lokinet();
        let missing = tor.address.is_none() && lokinet.address.is_none();
        json!({
            "ok": true,
            "torOnion": tor.address,
            "lokinet": lokinet.address,
            "details": if missing { Some("no hidden service published") } else { None },
        })
    }

    /// `GET /onion/inbox?deviceId=…&after=…&limit=…`.
    fn inbox(&self, path: &str) -> (u16, &'static str, Value) {
        let query = parse_query(path);
        let Some(device) = query.get("deviceId").filter(|d| !d.is_empty()) else {
            return (
                400,
                "Bad Request",
                json!({"ok": false, "error": "missing-fields"}),
            );
        };
        let after: i64 = query
            .get("after")
            .and_then(|a| a.parse().ok())
            .unwrap_or(-1);
        let limit: usize = query
            .get("limit")
            .and_then(|l| l.parse().ok())
            .unwrap_or(DEFAULT_LIMIT);

        let (items, next_after) = self.queues.query(device, after, limit);
        let items: Vec<Value> = items
            .into_iter()
            .map(|i| {
                json!({
                    "id": i.id,
                    "ts": i.ts,
                    "from": i.from,
                    "envelope": i.envelope,
                })
            })
            .collect();
        (
            200,
            "OK",
            json!({
                "ok": true,
                "items": items,
                "nextAfter": next_after.map(|n| n.to_string()),
            }),
        )
    }

    /// `POST /onion/send` and `POST /onion/ingest`.
    ///
    /// With route hints (send only) the envelope is forwarded through a
    /// SOCKS proxy; otherwise it is queued locally for its recipient.
    async fn send(&self, request: &HttpRequest, allow_forward: bool) -> (u16, &'static str, Value) {
        let body: SendBody = match serde_json::from_slice(&request.body) {
            Ok(b) => b,
            Err(e) => {
                debug!("unparseable send body: {}", e);
                return (
                    400,
                    "Bad Request",
                    json!({"ok": false, "error": "invalid-json"}),
                );
            }
        };

        let Some(envelope) = body.envelope.clone() else {
            return (
                400,
                "Bad Request",
                json!({"ok": false, "error": "missing-fields"}),
            );
        };
        let Some(to_device) = body.to_device_id.clone().filter(|d| !d.is_empty()) else {
            return (
                400,
                "Bad Request",
                json!({"ok": false, "error": "missing-to-device"}),
            );
        };

        let now = now_ms(&self.runtime);
        let msg_id = body
            .id
            .clone()
            .unwrap_or_else(|| EventId::generate(&mut rand::rng()).to_string());

        // Any route hint at all selects the forwarding path.
        if allow_forward {
            if let Some(route) = body.route.as_ref().filter(|r| r.any()) {
                return match forward::forward(
                    &self.client,
                    self.directory.as_ref(),
                    &body,
                    route,
                    &msg_id,
                    now,
                )
                .await
                {
                    ForwardOutcome::Forwarded { route } => (
                        200,
                        "OK",
                        json!({
                            "ok": true,
                            "msgId": msg_id,
                            "forwarded": true,
                            "route": route,
                        }),
                    ),
                    ForwardOutcome::Failed { error, status } => {
                        let reason = if status == 400 { "Bad Request" } else { "Bad Gateway" };
                        (status, reason, json!({"ok": false, "error": error}))
                    }
                };
            }
        }

        let ttl = body.ttl_ms.unwrap_or(self.config.default_ttl_ms);
        let item = InboxItem {
            id: msg_id.clone(),
            ts: body.ts.unwrap_or(now),
            from: body.from_device_id.clone(),
            envelope,
            expires_at: now + ttl,
        };
        self.queues.enqueue(&to_device, item);
        debug!("queued {} for {}", msg_id, safelog::sensitive(&to_device));
        (
            200,
            "OK",
            json!({"ok": true, "msgId": msg_id, "forwarded": false}),
        )
    }
}

/// A parsed inbound request.
#[derive(Debug)]
struct HttpRequest {
    /// Request method.
    method: String,
    /// Path plus query string.
    path: String,
    /// Request body.
    body: Vec<u8>,
}

/// Why reading a request failed.
enum RequestReadError {
    /// Declared or observed body beyond the cap.
    TooLarge,
    /// Not parseable HTTP.
    Malformed(String),
    /// Transport problem.
    Io(std::io::Error),
}

impl From<std::io::Error> for RequestReadError {
    fn from(e: std::io::Error) -> Self {
        RequestReadError::Io(e)
    }
}

/// Read one HTTP/1.1 request (head + body) from `stream`.
async fn read_request<S>(stream: &mut S) -> Result<HttpRequest, RequestReadError>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0_u8; 2048];

    // Head.
    let (head_len, method, path, content_length) = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(RequestReadError::Malformed(
                "connection closed before request head".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut parsed = httparse::Request::new(&mut headers);
        match parsed.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let method = parsed.method.unwrap_or("").to_owned();
                let path = parsed.path.unwrap_or("").to_owned();
                let content_length = parsed
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                    .and_then(|h| std::str::from_utf8(h.value).ok())
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                break (head_len, method, path, content_length);
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > HEAD_CAP {
                    return Err(RequestReadError::Malformed("request head too large".into()));
                }
            }
            Err(e) => return Err(RequestReadError::Malformed(e.to_string())),
        }
    };

    if content_length > BODY_CAP {
        return Err(RequestReadError::TooLarge);
    }

    // Body.
    let mut body = buf[head_len..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(RequestReadError::Malformed(
                "connection closed mid-body".into(),
            ));
        }
        body.extend_from_slice(&chunk[..n]);
        if body.len() > BODY_CAP {
            return Err(RequestReadError::TooLarge);
        }
    }
    body.truncate(content_length);

    Ok(HttpRequest { method, path, body })
}

/// Write a JSON response with the controller's standard headers.
async fn respond<S>(
    stream: &mut S,
    status: u16,
    reason: &str,
    body: &Value,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let body = if body.is_null() {
        Vec::new()
    } else {
        serde_json::to_vec(body).unwrap_or_default()
    };
    // Local-only service; any origin may talk to it.
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: application/json; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Connection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    if !body.is_empty() {
        stream.write_all(&body).await?;
    }
    stream.flush().await?;
    stream.close().await
}

/// Split the query string of `path` into key/value pairs.
fn parse_query(path: &str) -> std::collections::HashMap<String, String> {
    let mut out = std::collections::HashMap::new();
    if let Some((_, query)) = path.split_once('?') {
        for pair in query.split('&') {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            out.insert(k.to_owned(), v.to_owned());
        }
    }
    out
}

/// Wall-clock ms since the epoch, per the runtime.
fn now_ms<R: SleepProvider>(runtime: &R) -> u64 {
    runtime
        .wallclock()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
