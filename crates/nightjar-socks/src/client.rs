//! The proxied HTTP client.

use std::io::Write;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use futures::io::{AsyncRead, AsyncWrite};
use tor_error::HasRetryTime;
use tor_rtcompat::tls::TlsConnector;
use tor_rtcompat::{NetStreamProvider, Runtime, SleepProviderExt, TlsProvider};
use tracing::{debug, trace};
use url::Url;

use crate::err::FetchError;
use crate::gate::InflightGate;
use crate::http;
use crate::proxy::ProxyUrl;
use crate::socks5::{self, ConnectTarget};
use crate::{EgressGate, RequestClass, Result};

/// Default number of attempts per fetch.
const DEFAULT_ATTEMPTS: u32 = 2;
/// Base delay between attempts; the delay grows linearly.
const RETRY_BASE: Duration = Duration::from_millis(200);
/// Default per-call deadline when the caller does not set one.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default inflight cap.
const DEFAULT_INFLIGHT: usize = 8;

/// Configuration for an [`HttpClient`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct HttpClientConfig {
    /// Maximum concurrent requests; extra callers queue FIFO.
    pub max_inflight: usize,
    /// Hard cap on in-memory response bodies, in bytes.
    pub body_cap: usize,
    /// Attempts per fetch (1 = no retry).
    pub attempts: u32,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        HttpClientConfig {
            max_inflight: DEFAULT_INFLIGHT,
            body_cap: http::BODY_CAP,
            attempts: DEFAULT_ATTEMPTS,
        }
    }
}

/// HTTP request methods the delivery plane uses.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
}

impl Method {
    /// The wire form of this method.
    fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

/// A single HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    /// Method.
    method: Method,
    /// Full target URL (`http` or `https`).
    url: Url,
    /// Extra headers beyond Host/Connection/Content-Length.
    headers: Vec<(String, String)>,
    /// Request body.
    body: Option<Vec<u8>>,
    /// Overall deadline for the whole call, retries included.
    timeout: Duration,
    /// Proxy to tunnel through, if any.
    proxy: Option<ProxyUrl>,
    /// What this request is for; consulted by the egress gate.
    class: RequestClass,
}

impl Request {
    /// Start building a GET request.
    pub fn get(url: &str) -> Result<Self> {
        Self::new(Method::Get, url)
    }

    /// Start building a POST request with a body.
    pub fn post(url: &str, body: Vec<u8>) -> Result<Self> {
        let mut r = Self::new(Method::Post, url)?;
        r.body = Some(body);
        Ok(r)
    }

    /// Construct a request for `url`.
    fn new(method: Method, url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| FetchError::upstream(format!("invalid request URL: {e}")))?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(FetchError::upstream(format!(
                    "unsupported request scheme: {other}"
                )));
            }
        }
        if url.host_str().is_none() {
            return Err(FetchError::upstream("request URL has no host"));
        }
        Ok(Request {
            method,
            url,
            headers: Vec::new(),
            body: None,
            timeout: DEFAULT_TIMEOUT,
            proxy: None,
            class: RequestClass::Messaging,
        })
    }

    /// Add a header.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    /// Set the overall deadline for the call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Tunnel through `proxy`.
    pub fn via(mut self, proxy: ProxyUrl) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Classify the request for egress gating.
    pub fn class(mut self, class: RequestClass) -> Self {
        self.class = class;
        self
    }

    /// The host:port pair this request connects to.
    fn target(&self) -> ConnectTarget {
        let host = self.url.host_str().unwrap_or_default().to_owned();
        let port = self
            .url
            .port_or_known_default()
            .unwrap_or(80);
        ConnectTarget { host, port }
    }

    /// The value for the `Host` header.
    fn host_header(&self) -> String {
        let target = self.target();
        match self.url.port() {
            Some(p) if Some(p) != default_port(self.url.scheme()) => {
                format!("{}:{}", target.host, p)
            }
            _ => target.host,
        }
    }

    /// Path plus query string.
    fn path_and_query(&self) -> String {
        match self.url.query() {
            Some(q) => format!("{}?{}", self.url.path(), q),
            None => self.url.path().to_owned(),
        }
    }
}

/// Default port for a scheme.
fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

/// The response to a [`Request`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// Reason phrase, if any.
    pub reason: Option<String>,
    /// Response headers in wire order.
    pub headers: Vec<(String, String)>,
    /// Response body (empty for streamed fetches).
    pub body: Vec<u8>,
}

impl Response {
    /// True for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive single-header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The body as UTF-8, lossily.
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// An HTTP/1.1 client that can tunnel through SOCKS5 proxies.
///
/// Cheap to clone; clones share the inflight gate and egress policy, so
/// one of these per process gives the process-wide concurrency bound.
#[derive(Clone)]
pub struct HttpClient<R: Runtime> {
    /// Runtime for sockets, TLS, and timers.
    runtime: R,
    /// FIFO concurrency bound.
    gate: Arc<InflightGate>,
    /// Client configuration.
    config: HttpClientConfig,
    /// Optional egress policy hook.
    egress: Option<Arc<dyn EgressGate>>,
}

impl<R: Runtime> HttpClient<R> {
    /// Construct a client with default configuration.
    pub fn new(runtime: R) -> Self {
        Self::with_config(runtime, HttpClientConfig::default())
    }

    /// Construct a client with explicit configuration.
    pub fn with_config(runtime: R, config: HttpClientConfig) -> Self {
        HttpClient {
            runtime,
            gate: InflightGate::new(config.max_inflight),
            config,
            egress: None,
        }
    }

    /// Install an egress policy gate.
    pub fn set_egress_gate(&mut self, gate: Arc<dyn EgressGate>) {
        self.egress = Some(gate);
    }

    /// Perform a request, buffering the response body in memory (subject
    /// to the body cap).
    pub async fn fetch(&self, request: Request) -> Result<Response> {
        self.check_egress(&request)?;
        let timeout = request.timeout;
        let fut = self.fetch_with_retries::<std::io::Sink>(&request, None);
        match self.runtime.timeout(timeout, fut).await {
            Ok(res) => res.map(|(response, _)| response),
            Err(_timeout) => Err(FetchError::Timeout),
        }
    }

    /// Perform a request, streaming the body into `sink` with no cap.
    ///
    /// Returns the response head (with an empty body) and the number of
    /// body bytes written.  Used for artifact downloads.
    pub async fn fetch_to_writer<W: Write + Send>(
        &self,
        request: Request,
        sink: &mut W,
    ) -> Result<(Response, u64)> {
        self.check_egress(&request)?;
        let timeout = request.timeout;
        let fut = self.fetch_with_retries(&request, Some(sink));
        match self.runtime.timeout(timeout, fut).await {
            Ok(res) => res,
            Err(_timeout) => Err(FetchError::Timeout),
        }
    }

    /// Refuse requests the egress policy forbids.
    fn check_egress(&self, request: &Request) -> Result<()> {
        if let Some(gate) = &self.egress {
            if !gate.allow(request.class) {
                return Err(FetchError::EgressBlocked {
                    class: request.class,
                });
            }
        }
        Ok(())
    }

    /// Attempt loop with linear backoff.
    ///
    /// Streamed requests are never retried after body bytes may have been
    /// written; the caller's sink is not rewindable.
    async fn fetch_with_retries<W: Write + Send>(
        &self,
        request: &Request,
        mut sink: Option<&mut W>,
    ) -> Result<(Response, u64)> {
        let attempts = if sink.is_some() {
            // A partially written sink cannot be rewound.
            1
        } else {
            self.config.attempts.max(1)
        };
        let mut last_err = None;
        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = RETRY_BASE * (attempt - 1);
                trace!("retrying fetch in {:?} (attempt {attempt})", delay);
                self.runtime.sleep(delay).await;
            }
            let streaming = sink.as_deref_mut();
            match self.attempt(request, streaming).await {
                Ok(out) => return Ok(out),
                Err(e) => {
                    debug!("fetch attempt {attempt} failed: {e}");
                    if matches!(e.retry_time(), tor_error::RetryTime::Never) {
                        return Err(e);
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| FetchError::upstream("no attempts made")))
    }

    /// One connection, one request, one response.
    async fn attempt<W: Write + Send>(
        &self,
        request: &Request,
        sink: Option<&mut W>,
    ) -> Result<(Response, u64)> {
        let _permit = self.gate.acquire().await;
        let target = request.target();

        // Connect: either to the proxy, or straight to the target.
        let addr = match &request.proxy {
            Some(proxy) => proxy
                .to_socket_addr()
                .map_err(|e| FetchError::unreachable("resolving proxy", e))?,
            None => resolve_direct(&target)?,
        };
        let mut stream = self
            .runtime
            .connect(&addr)
            .await
            .map_err(|e| FetchError::unreachable("connecting", e))?;

        if let Some(proxy) = &request.proxy {
            socks5::connect_through(&mut stream, proxy, &target).await?;
        }

        if request.url.scheme() == "https" {
            let connector =
                <R as TlsProvider<<R as NetStreamProvider<SocketAddr>>::Stream>>::tls_connector(
                    &self.runtime,
                );
            let tls = connector
                .negotiate_unvalidated(stream, &target.host)
                .await
                .map_err(|e| FetchError::upstream(format!("TLS negotiation: {e}")))?;
            self.exchange(tls, request, sink).await
        } else {
            self.exchange(stream, request, sink).await
        }
    }

    /// Write the request and consume the response on `stream`.
    async fn exchange<S, W>(
        &self,
        mut stream: S,
        request: &Request,
        sink: Option<&mut W>,
    ) -> Result<(Response, u64)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        W: Write + Send,
    {
        http::write_request(
            &mut stream,
            request.method.as_str(),
            &request.host_header(),
            &request.path_and_query(),
            &request.headers,
            request.body.as_deref(),
        )
        .await?;

        let (head, leftover) = http::read_head(&mut stream).await?;
        let (body, n) = match sink {
            Some(sink) => {
                let n = http::stream_body(&mut stream, &head, leftover, sink).await?;
                (Vec::new(), n)
            }
            None => {
                let body =
                    http::read_body(&mut stream, &head, leftover, self.config.body_cap).await?;
                let n = body.len() as u64;
                (body, n)
            }
        };
        // One request per socket: the connection is dropped here.
        Ok((
            Response {
                status: head.status,
                reason: head.reason,
                headers: head.headers,
                body,
            },
            n,
        ))
    }
}

/// Resolve a direct (unproxied) target.
fn resolve_direct(target: &ConnectTarget) -> Result<SocketAddr> {
    if let Ok(ip) = target.host.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, target.port));
    }
    (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|e| FetchError::unreachable("resolving host", e))?
        .next()
        .ok_or_else(|| {
            FetchError::unreachable(
                "resolving host",
                std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
            )
        })
}

