//! The shared transport of a run.
//!
//! One [`Transport`] is built per run and shared by every worker. It owns
//! the TLS configuration, the proxy target and the connections. An HTTP/1.1
//! request checks a connection out of the idle pool for its exclusive use,
//! so the write and first-byte marks observed on the socket belong to that
//! request alone. HTTP/2 connections are shared: every worker opens its
//! streams on the one connection of a host.

use crate::config::RunConfig;
use crate::error::{Error, TransportError};
use crate::request::PreparedRequest;
use crate::tls::{self, Protocol, TlsOptions};
use crate::trace::{PhaseClock, TracedStream, Tracer};
use crate::types::Phases;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use hyper::body::HttpBody;
use hyper::client::conn::{http1, http2};
use hyper::header::{
    HeaderValue, ACCEPT_ENCODING, AUTHORIZATION, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE,
    HOST, LOCATION, WWW_AUTHENTICATE,
};
use hyper::rt::Executor;
use hyper::{Body, HeaderMap, Method, Request, Response, StatusCode, Uri, Version};
use log::{debug, warn};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use url::{Host, Position, Url};

const MAX_REDIRECTS: usize = 10;
const MAX_TUNNEL_RESPONSE: usize = 8192;

/// Result of issuing one request through the transport.
#[derive(Debug)]
pub struct Exchange {
    pub outcome: Result<StatusCode, TransportError>,
    pub phases: Phases,
    pub bytes: u64,
}

impl Exchange {
    pub fn failed(err: TransportError) -> Self {
        Self {
            outcome: Err(err),
            phases: Phases::default(),
            bytes: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    secure: bool,
    host: String,
    port: u16,
}

impl PoolKey {
    fn for_url(url: &Url) -> Result<Self, TransportError> {
        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => {
                return Err(TransportError::InvalidRequest(format!(
                    "url {} has no host",
                    url
                )))
            }
        };
        let port = url.port_or_known_default().ok_or_else(|| {
            TransportError::InvalidRequest(format!("url {} has no port", url))
        })?;
        Ok(Self {
            secure: url.scheme() == "https",
            host,
            port,
        })
    }

    fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(&mut **s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(&mut **s).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            Stream::Tls(s) => Pin::new(&mut **s).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Stream::Plain(s) => s.is_write_vectored(),
            Stream::Tls(s) => s.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(&mut **s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(&mut **s).poll_shutdown(cx),
        }
    }
}

/// Runs HTTP/2 connection tasks on the tokio runtime.
#[derive(Debug, Clone, Copy)]
struct TokioExecutor;

impl<F> Executor<F> for TokioExecutor
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, future: F) {
        tokio::spawn(future);
    }
}

/// An HTTP/1.1 connection, used by one request at a time. The clock sits
/// on the plaintext side of TLS.
struct Connection {
    sender: http1::SendRequest<Body>,
    clock: Arc<PhaseClock>,
}

enum Dialed {
    Http1(Connection),
    Http2(http2::SendRequest<Body>),
}

/// The connection one request runs on.
enum Lease {
    Exclusive(Connection),
    Shared(http2::SendRequest<Body>),
}

impl Lease {
    fn protocol(&self) -> Protocol {
        match self {
            Lease::Exclusive(_) => Protocol::Http1,
            Lease::Shared(_) => Protocol::Http2,
        }
    }
}

impl From<Dialed> for Lease {
    fn from(dialed: Dialed) -> Self {
        match dialed {
            Dialed::Http1(conn) => Lease::Exclusive(conn),
            Dialed::Http2(sender) => Lease::Shared(sender),
        }
    }
}

/// HTTP/2 state of one host.
#[derive(Default)]
enum Multiplex {
    #[default]
    Unknown,
    Ready(http2::SendRequest<Body>),
    /// h2 was not negotiated; the host is served from the HTTP/1.1 pool.
    Unsupported,
}

/// What came back for one hop.
struct Received {
    status: StatusCode,
    location: Option<HeaderValue>,
    reusable: bool,
    bytes: u64,
    body: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct Hop {
    phases: Phases,
    bytes: u64,
}

pub struct Transport {
    tls: TlsConnector,
    proxy: Option<PoolKey>,
    http2: bool,
    keep_alive: bool,
    compression: bool,
    follow_redirects: bool,
    timeout: Option<Duration>,
    max_idle_per_host: usize,
    response_checks: Vec<String>,
    idle: Mutex<HashMap<PoolKey, Vec<Connection>>>,
    multiplexed: Mutex<HashMap<PoolKey, Arc<AsyncMutex<Multiplex>>>>,
    downgrade_logged: AtomicBool,
}

impl Transport {
    pub fn build(config: &RunConfig) -> Result<Self, Error> {
        let tls = tls::client_config(&TlsOptions {
            insecure: config.insecure,
            cert_file: config.cert_file.as_deref(),
            key_file: config.key_file.as_deref(),
            http2: config.http2,
        })?;
        let proxy = config
            .proxy
            .as_ref()
            .map(PoolKey::for_url)
            .transpose()
            .map_err(|e| Error::Config(format!("invalid proxy: {}", e)))?;

        Ok(Self {
            tls: TlsConnector::from(tls),
            proxy,
            http2: config.http2,
            keep_alive: !config.disable_keep_alives,
            compression: !config.disable_compression,
            follow_redirects: !config.disable_redirects,
            timeout: config.timeout.filter(|t| !t.is_zero()),
            max_idle_per_host: config.max_idle_per_host(),
            response_checks: config.response_checks.clone(),
            idle: Mutex::new(HashMap::new()),
            multiplexed: Mutex::new(HashMap::new()),
            downgrade_logged: AtomicBool::new(false),
        })
    }

    /// Issues `request`, following redirects when enabled, and drains the
    /// response body. Never fails: errors land in the returned outcome.
    pub async fn execute(&self, request: PreparedRequest) -> Exchange {
        let mut hop = Hop::default();
        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.follow(request, &mut hop)).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(TransportError::Timeout(limit)),
            },
            None => self.follow(request, &mut hop).await,
        };
        Exchange {
            outcome,
            phases: hop.phases,
            bytes: hop.bytes,
        }
    }

    async fn follow(
        &self,
        mut request: PreparedRequest,
        hop: &mut Hop,
    ) -> Result<StatusCode, TransportError> {
        let capture = !self.response_checks.is_empty();
        let mut redirects = 0;
        loop {
            let received = self.round_trip(&request, hop, capture).await?;
            if self.follow_redirects {
                if let Some(next) = redirect(&request, received.status, received.location.as_ref())
                {
                    redirects += 1;
                    if redirects > MAX_REDIRECTS {
                        return Err(TransportError::TooManyRedirects(MAX_REDIRECTS));
                    }
                    request = next;
                    continue;
                }
            }
            if let Some(body) = &received.body {
                self.check_body(body)?;
            }
            return Ok(received.status);
        }
    }

    async fn round_trip(
        &self,
        request: &PreparedRequest,
        hop: &mut Hop,
        capture: bool,
    ) -> Result<Received, TransportError> {
        let key = PoolKey::for_url(&request.url)?;
        let mut fresh = false;

        loop {
            let mut tracer = Tracer::new();
            tracer.get_conn();

            let acquired = self
                .acquire(&key, request.host.as_deref(), &mut tracer, fresh)
                .await;
            let (lease, reused) = match acquired {
                Ok(acquired) => acquired,
                Err(err) => {
                    hop.phases = tracer.phases(Instant::now());
                    return Err(err);
                }
            };

            let outgoing = self.outgoing(request, &key, lease.protocol())?;
            let received = match lease {
                Lease::Exclusive(mut conn) => {
                    let received = exchange(&mut conn, outgoing, capture).await;
                    tracer.observe(&conn.clock);
                    if matches!(&received, Ok(r) if r.reusable && self.keep_alive) {
                        self.checkin(key.clone(), conn);
                    }
                    received
                }
                // Streams share the socket, so marks are taken per stream.
                Lease::Shared(mut sender) => {
                    tracer.wrote_request();
                    match sender.send_request(outgoing).await {
                        Ok(response) => {
                            tracer.got_first_response_byte();
                            receive(response, capture).await
                        }
                        Err(err) => Err(err.into()),
                    }
                }
            };
            hop.phases = tracer.phases(Instant::now());

            match received {
                // The server closed a pooled connection under us; retry once
                // on a fresh one.
                Err(TransportError::Http(err))
                    if reused
                        && !fresh
                        && (err.is_canceled() || err.is_closed() || err.is_incomplete_message()) =>
                {
                    debug!("stale connection to {}: {}", key.authority(), err);
                    fresh = true;
                }
                Err(err) => return Err(err),
                Ok(received) => {
                    hop.bytes = received.bytes;
                    return Ok(received);
                }
            }
        }
    }

    /// Finds a connection for `key`. `fresh` skips every reusable one.
    /// Returns the lease and whether it was reused.
    async fn acquire(
        &self,
        key: &PoolKey,
        host_override: Option<&str>,
        tracer: &mut Tracer,
        fresh: bool,
    ) -> Result<(Lease, bool), TransportError> {
        if self.multiplexes(key) {
            if let Some(acquired) = self.acquire_shared(key, host_override, tracer, fresh).await? {
                return Ok(acquired);
            }
        }
        if !fresh {
            if let Some(conn) = self.checkout(key).await {
                tracer.got_conn(true);
                return Ok((Lease::Exclusive(conn), true));
            }
        }
        let dialed = self.dial(key, host_override, tracer).await;
        tracer.got_conn(false);
        Ok((dialed?.into(), false))
    }

    fn multiplexes(&self, key: &PoolKey) -> bool {
        self.http2 && self.keep_alive && key.secure
    }

    /// The shared HTTP/2 connection of `key`. Dialing happens under the
    /// host's lock, so concurrent workers wait for one connection instead
    /// of opening their own. None when the host only speaks HTTP/1.1.
    async fn acquire_shared(
        &self,
        key: &PoolKey,
        host_override: Option<&str>,
        tracer: &mut Tracer,
        fresh: bool,
    ) -> Result<Option<(Lease, bool)>, TransportError> {
        let cell = lock(&self.multiplexed).entry(key.clone()).or_default().clone();
        let mut state = cell.lock().await;
        match &mut *state {
            Multiplex::Unsupported => return Ok(None),
            Multiplex::Ready(sender) if !fresh => {
                if sender.ready().await.is_ok() {
                    tracer.got_conn(true);
                    return Ok(Some((Lease::Shared(sender.clone()), true)));
                }
                debug!("shared connection to {} closed", key.authority());
            }
            _ => {}
        }

        let dialed = self.dial(key, host_override, tracer).await;
        tracer.got_conn(false);
        let lease = match dialed? {
            Dialed::Http2(sender) => {
                *state = Multiplex::Ready(sender.clone());
                Lease::Shared(sender)
            }
            Dialed::Http1(conn) => {
                *state = Multiplex::Unsupported;
                Lease::Exclusive(conn)
            }
        };
        Ok(Some((lease, false)))
    }

    async fn checkout(&self, key: &PoolKey) -> Option<Connection> {
        loop {
            let mut conn = lock(&self.idle).get_mut(key).and_then(Vec::pop)?;
            match conn.sender.ready().await {
                Ok(()) => return Some(conn),
                Err(err) => debug!("discarding idle connection to {}: {}", key.authority(), err),
            }
        }
    }

    fn checkin(&self, key: PoolKey, conn: Connection) {
        let mut pool = lock(&self.idle);
        let idle = pool.entry(key).or_default();
        if idle.len() < self.max_idle_per_host {
            idle.push(conn);
        }
    }

    async fn dial(
        &self,
        key: &PoolKey,
        host_override: Option<&str>,
        tracer: &mut Tracer,
    ) -> Result<Dialed, TransportError> {
        let target = self.proxy.as_ref().unwrap_or(key);
        let addrs = resolve(target, tracer).await?;
        let mut tcp = connect(&addrs).await?;
        if let Err(err) = tcp.set_nodelay(true) {
            debug!("could not disable Nagle on {}: {}", key.authority(), err);
        }

        let (stream, protocol) = if key.secure {
            if self.proxy.is_some() {
                tunnel(&mut tcp, &key.authority()).await?;
            }
            let sni = sni_host(host_override.unwrap_or(&key.host));
            let name =
                tls::server_name(sni).ok_or_else(|| TransportError::ServerName(sni.to_string()))?;
            let tls = self.tls.connect(name, tcp).await.map_err(TransportError::Tls)?;
            let alpn = tls.get_ref().1.alpn_protocol();
            let protocol = match tls::negotiated_protocol(alpn, self.http2) {
                Ok(protocol) => protocol,
                Err(err) => {
                    if !self.downgrade_logged.swap(true, Ordering::Relaxed) {
                        warn!("{}, falling back to HTTP/1.1", err);
                    }
                    Protocol::Http1
                }
            };
            (Stream::Tls(Box::new(tls)), protocol)
        } else {
            (Stream::Plain(tcp), Protocol::Http1)
        };

        match protocol {
            Protocol::Http2 => {
                let (sender, connection) = http2::Builder::new(TokioExecutor)
                    .handshake(stream)
                    .await?;
                drive(key.authority(), connection);
                Ok(Dialed::Http2(sender))
            }
            Protocol::Http1 => {
                let clock = Arc::new(PhaseClock::default());
                let io = TracedStream::new(stream, clock.clone());
                let (sender, connection) = http1::Builder::new().handshake(io).await?;
                drive(key.authority(), connection);
                Ok(Dialed::Http1(Connection { sender, clock }))
            }
        }
    }

    /// Builds the wire request for one hop.
    fn outgoing(
        &self,
        request: &PreparedRequest,
        key: &PoolKey,
        protocol: Protocol,
    ) -> Result<Request<Body>, TransportError> {
        let authority = request
            .host
            .clone()
            .unwrap_or_else(|| url_authority(&request.url));
        let target = match protocol {
            Protocol::Http2 => format!(
                "{}://{}{}",
                request.url.scheme(),
                authority,
                &request.url[Position::BeforePath..Position::AfterQuery]
            ),
            Protocol::Http1 if self.proxy.is_some() && !key.secure => {
                request.url[..Position::AfterQuery].to_string()
            }
            Protocol::Http1 => request.url[Position::BeforePath..Position::AfterQuery].to_string(),
        };
        let uri: Uri = target
            .parse()
            .map_err(|e| TransportError::InvalidRequest(format!("{}: {}", target, e)))?;

        let mut headers = request.headers.clone();
        match protocol {
            Protocol::Http1 => {
                headers.insert(HOST, header_value(&authority)?);
                if !self.keep_alive {
                    headers.insert(CONNECTION, HeaderValue::from_static("close"));
                }
            }
            Protocol::Http2 => {
                headers.remove(HOST);
                headers.remove(CONNECTION);
            }
        }
        if self.compression && !headers.contains_key(ACCEPT_ENCODING) {
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        }
        if let Some((username, password)) = &request.basic_auth {
            let token = BASE64.encode(format!("{}:{}", username, password));
            headers.insert(AUTHORIZATION, header_value(&format!("Basic {}", token))?);
        }

        let mut outgoing = Request::new(Body::from(request.body.clone()));
        *outgoing.method_mut() = request.method.clone();
        *outgoing.uri_mut() = uri;
        *outgoing.headers_mut() = headers;
        *outgoing.version_mut() = match protocol {
            Protocol::Http1 => Version::HTTP_11,
            Protocol::Http2 => Version::HTTP_2,
        };
        Ok(outgoing)
    }

    fn check_body(&self, body: &[u8]) -> Result<(), TransportError> {
        let text = String::from_utf8_lossy(body);
        match self
            .response_checks
            .iter()
            .find(|check| !text.contains(check.as_str()))
        {
            Some(missing) => Err(TransportError::ResponseCheck(missing.clone())),
            None => Ok(()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs a connection's I/O task until the connection closes.
fn drive<F>(authority: String, connection: F)
where
    F: Future<Output = hyper::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!("connection to {} closed: {}", authority, err);
        }
    });
}

/// One request on an exclusive HTTP/1.1 connection, clock armed.
async fn exchange(
    conn: &mut Connection,
    request: Request<Body>,
    capture: bool,
) -> Result<Received, TransportError> {
    conn.sender.ready().await?;
    conn.clock.arm();
    let response = conn.sender.send_request(request).await?;
    receive(response, capture).await
}

async fn receive(response: Response<Body>, capture: bool) -> Result<Received, TransportError> {
    let status = response.status();
    let location = response.headers().get(LOCATION).cloned();
    let reusable = !closes(response.headers());
    // Draining the body is what lets the connection be reused.
    let (bytes, body) = drain(response.into_body(), capture).await?;
    Ok(Received {
        status,
        location,
        reusable,
        bytes,
        body,
    })
}

async fn drain(mut body: Body, capture: bool) -> Result<(u64, Option<Vec<u8>>), hyper::Error> {
    let mut read = 0u64;
    let mut kept = capture.then(Vec::new);
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        read += chunk.len() as u64;
        if let Some(kept) = kept.as_mut() {
            kept.extend_from_slice(&chunk);
        }
    }
    Ok((read, kept))
}

async fn resolve(target: &PoolKey, tracer: &mut Tracer) -> Result<Vec<SocketAddr>, TransportError> {
    if let Ok(ip) = target.host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, target.port)]);
    }
    tracer.dns_start();
    let resolved = tokio::net::lookup_host((target.host.as_str(), target.port)).await;
    tracer.dns_done();
    let addrs: Vec<SocketAddr> = resolved
        .map_err(|source| TransportError::Dns {
            host: target.host.clone(),
            source,
        })?
        .collect();
    if addrs.is_empty() {
        return Err(TransportError::NoAddress(target.host.clone()));
    }
    Ok(addrs)
}

async fn connect(addrs: &[SocketAddr]) -> Result<TcpStream, TransportError> {
    let mut last = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(source) => {
                last = Some(TransportError::Connect {
                    addr: addr.to_string(),
                    source,
                })
            }
        }
    }
    Err(last.unwrap_or_else(|| TransportError::NoAddress(String::new())))
}

/// Opens a CONNECT tunnel through an HTTP proxy.
async fn tunnel<S>(io: &mut S, authority: &str) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let proxy_err = |e: io::Error| TransportError::Proxy(e.to_string());
    let connect = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", authority);
    io.write_all(connect.as_bytes()).await.map_err(proxy_err)?;

    let mut response = Vec::with_capacity(256);
    let mut buf = [0u8; 512];
    while !response.windows(4).any(|w| w == b"\r\n\r\n") {
        if response.len() > MAX_TUNNEL_RESPONSE {
            return Err(TransportError::Proxy("oversized CONNECT response".into()));
        }
        let n = io.read(&mut buf).await.map_err(proxy_err)?;
        if n == 0 {
            return Err(TransportError::Proxy("proxy closed the connection".into()));
        }
        response.extend_from_slice(&buf[..n]);
    }

    let head = String::from_utf8_lossy(&response);
    match head.split_whitespace().nth(1) {
        Some("200") => Ok(()),
        _ => Err(TransportError::Proxy(format!(
            "proxy refused tunnel: {}",
            head.lines().next().unwrap_or_default()
        ))),
    }
}

/// Next request of a redirect chain, or None when `status` does not
/// redirect.
fn redirect(
    request: &PreparedRequest,
    status: StatusCode,
    location: Option<&HeaderValue>,
) -> Option<PreparedRequest> {
    let (method, keep_body) = match status {
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER => {
            let method = if request.method == Method::GET || request.method == Method::HEAD {
                request.method.clone()
            } else {
                Method::GET
            };
            (method, false)
        }
        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => {
            (request.method.clone(), true)
        }
        _ => return None,
    };

    let url = request.url.join(location?.to_str().ok()?).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    let mut next = request.clone();
    next.method = method;
    if !keep_body {
        next.body = Bytes::new();
        next.headers.remove(CONTENT_TYPE);
        next.headers.remove(CONTENT_LENGTH);
    }
    if url.host_str() != request.url.host_str() {
        next.host = None;
    }
    if !within_domain(url.host_str(), request.url.host_str()) {
        next.basic_auth = None;
        for name in [AUTHORIZATION, WWW_AUTHENTICATE, COOKIE] {
            next.headers.remove(name);
        }
    }
    next.url = url;
    Some(next)
}

/// Whether `host` is `domain` or one of its subdomains.
fn within_domain(host: Option<&str>, domain: Option<&str>) -> bool {
    match (host, domain) {
        (Some(host), Some(domain)) => {
            host == domain
                || host
                    .strip_suffix(domain)
                    .is_some_and(|prefix| prefix.ends_with('.'))
        }
        _ => false,
    }
}

fn closes(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
}

/// `host[:port]` as it should appear in a Host header.
fn url_authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// Strips a port from a `host[:port]` string.
fn sni_host(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.parse::<u16>().is_ok() => name,
        _ => host,
    }
}

fn header_value(value: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(value)
        .map_err(|_| TransportError::InvalidRequest(format!("invalid header value {:?}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestTemplate;

    fn transport(config: RunConfig) -> Transport {
        Transport::build(&config).unwrap()
    }

    fn prepared(method: &str, url: &str) -> PreparedRequest {
        RequestTemplate::builder(method, url)
            .body("payload")
            .content_type("text/plain")
            .build()
            .unwrap()
            .instantiate()
    }

    #[test]
    fn test_pool_key_for_url() {
        let key = PoolKey::for_url(&Url::parse("https://example.com/a").unwrap()).unwrap();
        assert!(key.secure);
        assert_eq!(key.authority(), "example.com:443");

        let key = PoolKey::for_url(&Url::parse("http://[::1]:8080/").unwrap()).unwrap();
        assert_eq!(key.host, "::1");
        assert_eq!(key.authority(), "[::1]:8080");
    }

    #[test]
    fn test_http1_request_uses_origin_form_and_host() {
        let t = transport(RunConfig::default());
        let req = prepared("GET", "http://example.com:8080/items?id=1#frag");
        let key = PoolKey::for_url(&req.url).unwrap();
        let out = t.outgoing(&req, &key, Protocol::Http1).unwrap();

        assert_eq!(out.uri(), "/items?id=1");
        assert_eq!(out.headers()[HOST], "example.com:8080");
        assert_eq!(out.headers()[ACCEPT_ENCODING], "gzip");
        assert!(out.headers().get(CONNECTION).is_none());
        assert_eq!(out.version(), Version::HTTP_11);
    }

    #[test]
    fn test_host_override_and_basic_auth() {
        let t = transport(RunConfig::default());
        let template = RequestTemplate::builder("GET", "http://10.0.0.1/")
            .host("api.internal")
            .basic_auth("user", "secret")
            .build()
            .unwrap();
        let req = template.instantiate();
        let key = PoolKey::for_url(&req.url).unwrap();
        let out = t.outgoing(&req, &key, Protocol::Http1).unwrap();

        assert_eq!(out.headers()[HOST], "api.internal");
        assert_eq!(out.headers()[AUTHORIZATION], "Basic dXNlcjpzZWNyZXQ=");
    }

    #[test]
    fn test_keep_alive_and_compression_toggles() {
        let t = transport(RunConfig {
            disable_keep_alives: true,
            disable_compression: true,
            ..RunConfig::default()
        });
        let req = prepared("GET", "http://example.com/");
        let key = PoolKey::for_url(&req.url).unwrap();
        let out = t.outgoing(&req, &key, Protocol::Http1).unwrap();

        assert_eq!(out.headers()[CONNECTION], "close");
        assert!(out.headers().get(ACCEPT_ENCODING).is_none());
    }

    #[test]
    fn test_proxied_plain_request_uses_absolute_form() {
        let t = transport(RunConfig {
            proxy: Some(Url::parse("http://127.0.0.1:3128").unwrap()),
            ..RunConfig::default()
        });
        let req = prepared("GET", "http://example.com/a?b=c");
        let key = PoolKey::for_url(&req.url).unwrap();
        let out = t.outgoing(&req, &key, Protocol::Http1).unwrap();
        assert_eq!(out.uri(), "http://example.com/a?b=c");
    }

    #[test]
    fn test_http2_request_carries_authority() {
        let t = transport(RunConfig::default());
        let req = prepared("GET", "https://example.com/a");
        let key = PoolKey::for_url(&req.url).unwrap();
        let out = t.outgoing(&req, &key, Protocol::Http2).unwrap();

        assert_eq!(out.uri(), "https://example.com/a");
        assert!(out.headers().get(HOST).is_none());
        assert_eq!(out.version(), Version::HTTP_2);
    }

    #[test]
    fn test_redirect_rules() {
        let post = prepared("POST", "http://example.com/form");
        let location = HeaderValue::from_static("/done");

        let next = redirect(&post, StatusCode::FOUND, Some(&location)).unwrap();
        assert_eq!(next.method, Method::GET);
        assert!(next.body.is_empty());
        assert!(next.headers.get(CONTENT_TYPE).is_none());
        assert_eq!(next.url.as_str(), "http://example.com/done");

        let next = redirect(&post, StatusCode::TEMPORARY_REDIRECT, Some(&location)).unwrap();
        assert_eq!(next.method, Method::POST);
        assert_eq!(&next.body[..], b"payload");

        let put = prepared("PUT", "http://example.com/form");
        let next = redirect(&put, StatusCode::SEE_OTHER, Some(&location)).unwrap();
        assert_eq!(next.method, Method::GET);

        let next = redirect(&put, StatusCode::MOVED_PERMANENTLY, Some(&location)).unwrap();
        assert_eq!(next.method, Method::GET);
        assert!(next.body.is_empty());

        let delete = prepared("DELETE", "http://example.com/form");
        let next = redirect(&delete, StatusCode::FOUND, Some(&location)).unwrap();
        assert_eq!(next.method, Method::GET);

        let head = prepared("HEAD", "http://example.com/form");
        let next = redirect(&head, StatusCode::MOVED_PERMANENTLY, Some(&location)).unwrap();
        assert_eq!(next.method, Method::HEAD);

        let next = redirect(&put, StatusCode::PERMANENT_REDIRECT, Some(&location)).unwrap();
        assert_eq!(next.method, Method::PUT);
        assert_eq!(&next.body[..], b"payload");

        assert!(redirect(&post, StatusCode::OK, Some(&location)).is_none());
        assert!(redirect(&post, StatusCode::FOUND, None).is_none());
    }

    #[test]
    fn test_redirect_to_other_host_drops_override() {
        let mut req = prepared("GET", "http://example.com/");
        req.host = Some("front.example.com".into());
        let location = HeaderValue::from_static("http://other.example.com/x");
        let next = redirect(&req, StatusCode::MOVED_PERMANENTLY, Some(&location)).unwrap();
        assert_eq!(next.host, None);
    }

    fn with_credentials(url: &str) -> PreparedRequest {
        let mut req = RequestTemplate::builder("GET", url)
            .basic_auth("user", "secret")
            .build()
            .unwrap()
            .instantiate();
        req.headers
            .insert(COOKIE, HeaderValue::from_static("session=abc"));
        req.headers
            .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Basic"));
        req
    }

    #[test]
    fn test_redirect_off_domain_drops_credentials() {
        let t = transport(RunConfig::default());
        let req = with_credentials("http://example.com/login");
        let location = HeaderValue::from_static("http://elsewhere.example.net/x");
        let next = redirect(&req, StatusCode::FOUND, Some(&location)).unwrap();

        assert_eq!(next.basic_auth, None);
        assert!(next.headers.get(COOKIE).is_none());
        assert!(next.headers.get(WWW_AUTHENTICATE).is_none());

        let key = PoolKey::for_url(&next.url).unwrap();
        let out = t.outgoing(&next, &key, Protocol::Http1).unwrap();
        assert_eq!(out.headers()[HOST], "elsewhere.example.net");
        assert!(out.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_redirect_within_domain_keeps_credentials() {
        let req = with_credentials("http://example.com/login");

        let same = HeaderValue::from_static("/home");
        let next = redirect(&req, StatusCode::FOUND, Some(&same)).unwrap();
        assert!(next.basic_auth.is_some());
        assert_eq!(next.headers[COOKIE], "session=abc");

        let sub = HeaderValue::from_static("http://api.example.com/home");
        let next = redirect(&req, StatusCode::FOUND, Some(&sub)).unwrap();
        assert!(next.basic_auth.is_some());
        assert_eq!(next.headers[COOKIE], "session=abc");
    }

    #[test]
    fn test_within_domain() {
        assert!(within_domain(Some("example.com"), Some("example.com")));
        assert!(within_domain(Some("a.b.example.com"), Some("example.com")));
        assert!(!within_domain(Some("badexample.com"), Some("example.com")));
        assert!(!within_domain(Some("example.com"), Some("api.example.com")));
        assert!(!within_domain(None, Some("example.com")));
    }

    #[test]
    fn test_only_secure_keep_alive_http2_multiplexes() {
        let plain = PoolKey::for_url(&Url::parse("http://example.com/").unwrap()).unwrap();
        let secure = PoolKey::for_url(&Url::parse("https://example.com/").unwrap()).unwrap();

        let t = transport(RunConfig {
            http2: true,
            ..RunConfig::default()
        });
        assert!(t.multiplexes(&secure));
        assert!(!t.multiplexes(&plain));

        let t = transport(RunConfig {
            http2: true,
            disable_keep_alives: true,
            ..RunConfig::default()
        });
        assert!(!t.multiplexes(&secure));
        assert!(!transport(RunConfig::default()).multiplexes(&secure));
    }

    #[test]
    fn test_response_checks() {
        let t = transport(RunConfig {
            response_checks: vec!["\"code\":201".into(), "good".into()],
            ..RunConfig::default()
        });
        assert!(t.check_body(br#"{"code":201,"msg":"good"}"#).is_ok());
        assert!(matches!(
            t.check_body(br#"{"code":500}"#),
            Err(TransportError::ResponseCheck(missing)) if missing == "\"code\":201"
        ));
    }

    #[test]
    fn test_connection_close_detection() {
        let mut headers = HeaderMap::new();
        assert!(!closes(&headers));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Close"));
        assert!(closes(&headers));
    }

    #[test]
    fn test_sni_host() {
        assert_eq!(sni_host("example.com"), "example.com");
        assert_eq!(sni_host("example.com:8443"), "example.com");
        assert_eq!(sni_host("[::1]:443"), "::1");
        assert_eq!(sni_host("::1"), "::1");
    }

    #[tokio::test]
    async fn test_tunnel_accepts_200() {
        let (mut client, mut proxy) = tokio::io::duplex(1024);
        let server = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let n = proxy.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            proxy
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            request
        });
        tunnel(&mut client, "example.com:443").await.unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn test_tunnel_rejects_refusal() {
        let (mut client, mut proxy) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let _ = proxy.read(&mut buf).await;
            let _ = proxy
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await;
        });
        assert!(matches!(
            tunnel(&mut client, "example.com:443").await,
            Err(TransportError::Proxy(_))
        ));
    }
}
