//! Local Loopback Proxy
//!
//! HTTP/HTTPS proxy on `127.0.0.1:9090`. The PAC script sends whitelisted
//! hosts here, and the proxy connects to them directly so they bypass
//! the tunnel.
//!
//! ```text
//! Browser ─▶ PAC ─┬─ whitelisted ─▶ Proxy (127.0.0.1:9090) ─▶ Internet (direct)
//!                 └─ other ───────▶ IKEv2 tunnel
//! ```
//!
//! # Lifecycle
//!
//! `ProxyLifecycle::start` and `ProxyLifecycle::stop` run inside one
//! async mutex. Concurrent starts collapse into one listener, and a start
//! issued while a stop is in flight waits for the stop to finish. `stop`
//! returns only after the accept task has exited and the listening socket
//! is closed, so an immediate `start` can re-bind the same port.

use crate::config::ProxyEndpoint;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{oneshot, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Largest request head accepted before the request is rejected
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Listen backlog
const BACKLOG: u32 = 1024;

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listen address (loopback)
    pub listen_addr: SocketAddr,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Upstream connect timeout (seconds)
    pub timeout_secs: u64,
}

impl ProxyConfig {
    /// Configuration for an endpoint with default limits
    pub fn for_endpoint(endpoint: &ProxyEndpoint) -> Self {
        Self {
            listen_addr: endpoint.socket_addr(),
            ..Self::default()
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: ProxyEndpoint::default().socket_addr(),
            max_connections: 256,
            timeout_secs: 15,
        }
    }
}

/// A bound listener and its accept task
struct RunningProxy {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Starts and stops the local proxy, one operation at a time
pub struct ProxyLifecycle {
    config: ProxyConfig,
    /// Critical section guarding start/stop
    running: Mutex<Option<RunningProxy>>,
    /// Mirror of `running.is_some()` readable without the lock
    active: Arc<AtomicBool>,
    /// Connections currently relayed
    active_connections: Arc<AtomicU64>,
}

impl ProxyLifecycle {
    /// Create a stopped proxy
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            running: Mutex::new(None),
            active: Arc::new(AtomicBool::new(false)),
            active_connections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create for an endpoint with default limits
    pub fn for_endpoint(endpoint: &ProxyEndpoint) -> Self {
        Self::new(ProxyConfig::for_endpoint(endpoint))
    }

    /// Is the listener up?
    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Number of relayed connections
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Configured listen address
    pub fn listen_addr(&self) -> SocketAddr {
        self.config.listen_addr
    }

    /// Address actually bound (differs from the configured one for port 0)
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Start the proxy. Idempotent.
    pub async fn start(&self) -> Result<(), ProxyError> {
        let mut running = self.running.lock().await;

        if let Some(current) = running.as_ref() {
            if !current.task.is_finished() {
                return Ok(());
            }
            warn!("Proxy accept task exited unexpectedly, restarting");
            self.active.store(false, Ordering::Release);
            if let Some(dead) = running.take() {
                let _ = dead.task.await;
            }
        }

        let listener = bind(self.config.listen_addr)
            .map_err(|e| ProxyError::Bind(self.config.listen_addr, e.to_string()))?;
        let local_addr = listener.local_addr()?;

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            listener,
            shutdown_rx,
            Arc::new(Semaphore::new(self.config.max_connections)),
            self.active_connections.clone(),
            Duration::from_secs(self.config.timeout_secs),
        ));

        *running = Some(RunningProxy {
            local_addr,
            shutdown,
            task,
        });
        self.active.store(true, Ordering::Release);

        info!("Local proxy listening on {}", local_addr);
        Ok(())
    }

    /// Stop the proxy and release the listening socket. Idempotent.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;

        let Some(current) = running.take() else {
            return;
        };

        info!("Stopping local proxy on {}", current.local_addr);
        let _ = current.shutdown.send(());
        if let Err(e) = current.task.await {
            warn!("Proxy accept task ended abnormally: {}", e);
        }
        self.active.store(false, Ordering::Release);
    }
}

fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(BACKLOG)
}

/// Counts a relayed connection for as long as its task lives, including
/// tasks aborted on shutdown
struct ConnectionGuard {
    active: Arc<AtomicU64>,
    _permit: OwnedSemaphorePermit,
}

impl ConnectionGuard {
    fn new(active: Arc<AtomicU64>, permit: OwnedSemaphorePermit) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self {
            active,
            _permit: permit,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Accept connections until shutdown. Dropping the `JoinSet` on exit
/// aborts in-flight relays together with the listener.
async fn accept_loop(
    listener: TcpListener,
    mut shutdown: oneshot::Receiver<()>,
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicU64>,
    connect_timeout: Duration,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        continue;
                    }
                };

                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    debug!("Connection limit reached, dropping {}", peer);
                    continue;
                };

                let guard = ConnectionGuard::new(active.clone(), permit);
                connections.spawn(async move {
                    let _guard = guard;
                    if let Err(e) = handle_connection(stream, connect_timeout).await {
                        debug!("Proxy connection from {} failed: {}", peer, e);
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    connections.shutdown().await;
    debug!("Proxy accept loop exited");
}

/// Parsed request line
#[derive(Debug, PartialEq, Eq)]
struct RequestTarget {
    /// `host:port` to connect to
    authority: String,
    /// Bytes to send upstream before relaying (empty for CONNECT)
    upstream_head: Vec<u8>,
    /// CONNECT tunnel (needs a 200 reply)
    is_connect: bool,
}

/// Handle a single proxied connection
async fn handle_connection(mut client: TcpStream, connect_timeout: Duration) -> Result<(), ProxyError> {
    let (head, rest) = read_head(&mut client).await?;
    let target = match parse_request(&head) {
        Ok(target) => target,
        Err(e) => {
            client.write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n").await?;
            return Err(e);
        }
    };

    debug!("Proxy request to {}", target.authority);

    let upstream = tokio::time::timeout(connect_timeout, TcpStream::connect(&target.authority)).await;
    let mut upstream = match upstream {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            client.write_all(b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\n\r\n").await?;
            return Err(ProxyError::ConnectionFailed(target.authority, e.to_string()));
        }
        Err(_) => {
            client.write_all(b"HTTP/1.1 504 Gateway Timeout\r\nConnection: close\r\n\r\n").await?;
            return Err(ProxyError::ConnectionFailed(target.authority, "timed out".into()));
        }
    };

    if target.is_connect {
        client.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
    } else {
        upstream.write_all(&target.upstream_head).await?;
    }
    if !rest.is_empty() {
        upstream.write_all(&rest).await?;
    }

    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    Ok(())
}

/// Read until the end of the request head. Returns (head, bytes after head).
async fn read_head(stream: &mut TcpStream) -> Result<(Vec<u8>, Vec<u8>), ProxyError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::InvalidRequest("connection closed before request head".into()));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(ProxyError::InvalidRequest("request head too large".into()));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse the request line and build what goes upstream
fn parse_request(head: &[u8]) -> Result<RequestTarget, ProxyError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| ProxyError::InvalidRequest("request head is not UTF-8".into()))?;
    let (request_line, headers) = text
        .split_once("\r\n")
        .ok_or_else(|| ProxyError::InvalidRequest("missing request line".into()))?;

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ProxyError::InvalidRequest(format!("malformed request line {:?}", request_line)));
    };

    if method.eq_ignore_ascii_case("CONNECT") {
        if !target.contains(':') {
            return Err(ProxyError::InvalidRequest(format!("CONNECT target without port: {}", target)));
        }
        return Ok(RequestTarget {
            authority: target.to_string(),
            upstream_head: Vec::new(),
            is_connect: true,
        });
    }

    // Absolute-form request: rewrite to origin-form for the upstream server
    let url = url::Url::parse(target)
        .map_err(|e| ProxyError::InvalidRequest(format!("{}: {}", target, e)))?;
    if url.scheme() != "http" {
        return Err(ProxyError::InvalidRequest(format!("unsupported scheme {}", url.scheme())));
    }
    let host = url
        .host_str()
        .ok_or_else(|| ProxyError::InvalidRequest(format!("no host in {}", target)))?;
    let port = url.port_or_known_default().unwrap_or(80);

    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    let mut upstream_head = format!("{} {} {}\r\n", method, path, version);
    for line in headers.split("\r\n").filter(|line| !line.is_empty()) {
        if line.to_ascii_lowercase().starts_with("proxy-connection:") {
            continue;
        }
        upstream_head.push_str(line);
        upstream_head.push_str("\r\n");
    }
    upstream_head.push_str("\r\n");

    Ok(RequestTarget {
        authority: format!("{}:{}", host, port),
        upstream_head: upstream_head.into_bytes(),
        is_connect: false,
    })
}

/// Proxy errors
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Failed to bind {0}: {1}")]
    Bind(SocketAddr, String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Connection to {0} failed: {1}")]
    ConnectionFailed(String, String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn lifecycle(port: u16) -> ProxyLifecycle {
        ProxyLifecycle::new(ProxyConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            ..ProxyConfig::default()
        })
    }

    #[test]
    fn test_proxy_config_default() {
        let config = ProxyConfig::default();
        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:9090");
    }

    #[test]
    fn test_parse_connect() {
        let target = parse_request(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n").unwrap();
        assert!(target.is_connect);
        assert_eq!(target.authority, "example.com:443");
        assert!(target.upstream_head.is_empty());
    }

    #[test]
    fn test_parse_absolute_form() {
        let head = b"GET http://example.com/a/b?x=1 HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\n\r\n";
        let target = parse_request(head).unwrap();

        assert!(!target.is_connect);
        assert_eq!(target.authority, "example.com:80");
        assert_eq!(
            String::from_utf8(target.upstream_head).unwrap(),
            "GET /a/b?x=1 HTTP/1.1\r\nHost: example.com\r\n\r\n"
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_request(b"HELLO\r\n\r\n").is_err());
        assert!(parse_request(b"CONNECT example.com HTTP/1.1\r\n\r\n").is_err());
        assert!(parse_request(b"GET /relative HTTP/1.1\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let proxy = lifecycle(0);

        let (a, b) = tokio::join!(proxy.start(), proxy.start());
        a.unwrap();
        b.unwrap();
        let addr = proxy.local_addr().await.unwrap();

        proxy.start().await.unwrap();
        assert_eq!(proxy.local_addr().await, Some(addr));
        assert!(proxy.is_running());

        proxy.stop().await;
        proxy.stop().await;
        assert!(!proxy.is_running());
    }

    #[tokio::test]
    async fn test_stop_then_start_rebinds_same_port() {
        let port = free_port();
        let proxy = Arc::new(lifecycle(port));
        proxy.start().await.unwrap();

        for _ in 0..20 {
            let (stop, start) = (proxy.clone(), proxy.clone());
            let stopping = tokio::spawn(async move { stop.stop().await });
            let starting = tokio::spawn(async move { start.start().await });
            stopping.await.unwrap();
            starting.await.unwrap().unwrap();

            proxy.stop().await;
            proxy.start().await.unwrap();
        }

        assert_eq!(proxy.local_addr().await.unwrap().port(), port);
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_recoverable() {
        let squatter = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = squatter.local_addr().unwrap().port();
        let proxy = lifecycle(port);

        let err = proxy.start().await.unwrap_err();
        assert!(matches!(err, ProxyError::Bind(_, _)));
        assert!(!proxy.is_running());

        drop(squatter);
        proxy.start().await.unwrap();
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_dead_task_with_bind_failure_reports_stopped() {
        let squatter = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = squatter.local_addr().unwrap();
        let proxy = lifecycle(addr.port());

        // Accept task that already exited while the flag still says running
        let task = tokio::spawn(async {});
        while !task.is_finished() {
            tokio::task::yield_now().await;
        }
        *proxy.running.lock().await = Some(RunningProxy {
            local_addr: addr,
            shutdown: oneshot::channel().0,
            task,
        });
        proxy.active.store(true, Ordering::Release);

        let err = proxy.start().await.unwrap_err();
        assert!(matches!(err, ProxyError::Bind(_, _)));
        assert!(!proxy.is_running());
        assert_eq!(proxy.local_addr().await, None);
    }

    #[tokio::test]
    async fn test_connect_relay() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let proxy = lifecycle(0);
        proxy.start().await.unwrap();
        let proxy_addr = proxy.local_addr().await.unwrap();

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\nping", echo_addr).as_bytes())
            .await
            .unwrap();

        let expected = b"HTTP/1.1 200 Connection Established\r\n\r\nping";
        let mut reply = vec![0u8; expected.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..], &expected[..]);
        assert_eq!(proxy.active_connections(), 1);

        // Relay still open: stopping aborts it and the count returns to zero
        proxy.stop().await;
        assert_eq!(proxy.active_connections(), 0);
    }
}
