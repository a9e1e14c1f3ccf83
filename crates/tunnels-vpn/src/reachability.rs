//! Reachability Gate
//!
//! Interface state is not enough: a captive portal or a dead uplink still
//! shows an active interface. Reachability here means a live HTTPS request
//! came back with `200 OK`.
//!
//! ```text
//! GET https://www.apple.com/?<random> ──▶ 200 ──▶ reachable
//!                                     └─▶ anything else / timeout ──▶ unreachable
//! ```

use crate::config::ReachabilityConfig;
use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HOST, USER_AGENT};
use hyper::{Request, StatusCode};
use rustls::ClientConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Is the network actually usable right now?
#[async_trait]
pub trait ReachabilityGate: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Live HTTP(S) probe
pub struct HttpProbe {
    url: url::Url,
    timeout: Duration,
    tls: TlsConnector,
}

impl HttpProbe {
    pub fn new(config: &ReachabilityConfig) -> Result<Self, ProbeError> {
        let url = url::Url::parse(&config.probe_url)
            .map_err(|e| ProbeError::InvalidUrl(format!("{}: {}", config.probe_url, e)))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(ProbeError::InvalidUrl(config.probe_url.clone()));
        }

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self {
            url,
            timeout: config.probe_timeout(),
            tls: TlsConnector::from(Arc::new(tls_config)),
        })
    }

    /// Probe target with a cache-busting query
    fn target(&self) -> url::Url {
        let mut url = self.url.clone();
        url.set_query(Some(&rand::random::<u32>().to_string()));
        url
    }

    /// One probe; returns the HTTP status
    pub async fn probe(&self) -> Result<StatusCode, ProbeError> {
        tokio::time::timeout(self.timeout, self.fetch(self.target()))
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout.as_secs()))?
    }

    async fn fetch(&self, url: url::Url) -> Result<StatusCode, ProbeError> {
        let host = url
            .host_str()
            .ok_or_else(|| ProbeError::InvalidUrl(url.to_string()))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(443);
        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        let request = Request::builder()
            .uri(path)
            .header(HOST, host.as_str())
            .header(USER_AGENT, concat!("tunnels/", env!("CARGO_PKG_VERSION")))
            .body(Full::new(Bytes::new()))
            .map_err(|e| ProbeError::Http(e.to_string()))?;

        let stream = tokio::net::TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| ProbeError::Connect(e.to_string()))?;

        let response = if url.scheme() == "https" {
            let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|_| ProbeError::Tls(format!("invalid server name {}", host)))?;
            let tls_stream = self
                .tls
                .connect(server_name, stream)
                .await
                .map_err(|e| ProbeError::Tls(e.to_string()))?;
            send(hyper_util::rt::TokioIo::new(tls_stream), request).await?
        } else {
            send(hyper_util::rt::TokioIo::new(stream), request).await?
        };

        Ok(response)
    }
}

async fn send<T>(io: T, request: Request<Full<Bytes>>) -> Result<StatusCode, ProbeError>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| ProbeError::Http(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Probe connection closed: {}", e);
        }
    });

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| ProbeError::Http(e.to_string()))?;
    Ok(response.status())
}

#[async_trait]
impl ReachabilityGate for HttpProbe {
    async fn is_reachable(&self) -> bool {
        match self.probe().await {
            Ok(status) if status == StatusCode::OK => true,
            Ok(status) => {
                debug!("Reachability probe returned {}", status);
                false
            }
            Err(e) => {
                debug!("Reachability probe failed: {}", e);
                false
            }
        }
    }
}

/// Reachability set by hand (tests, simulation)
#[derive(Debug)]
pub struct ManualReachability {
    reachable: AtomicBool,
}

impl ManualReachability {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
        }
    }

    pub fn set(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Relaxed);
    }
}

#[async_trait]
impl ReachabilityGate for ManualReachability {
    async fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Relaxed)
    }
}

/// Poll `gate` and call `on_restored` on every unreachable → reachable edge.
/// Runs until the task is aborted.
pub async fn watch_edges<F>(gate: Arc<dyn ReachabilityGate>, every: Duration, mut on_restored: F)
where
    F: FnMut() + Send,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut was_reachable = None;

    loop {
        ticker.tick().await;
        let reachable = gate.is_reachable().await;

        match (was_reachable, reachable) {
            (Some(false), true) => {
                debug!("Network reachable again");
                on_restored();
            }
            (Some(true), false) => warn!("Network became unreachable"),
            _ => {}
        }
        was_reachable = Some(reachable);
    }
}

/// Probe errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProbeError {
    #[error("Invalid probe URL: {0}")]
    InvalidUrl(String),

    #[error("Probe connect failed: {0}")]
    Connect(String),

    #[error("Probe TLS error: {0}")]
    Tls(String),

    #[error("Probe HTTP error: {0}")]
    Http(String),

    #[error("Probe timed out after {0}s")]
    Timeout(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_probe_rejects_bad_url() {
        let config = ReachabilityConfig {
            probe_url: "ftp://example.com".into(),
            ..ReachabilityConfig::default()
        };
        assert!(matches!(HttpProbe::new(&config), Err(ProbeError::InvalidUrl(_))));
    }

    #[test]
    fn test_probe_target_is_cache_busted() {
        let probe = HttpProbe::new(&ReachabilityConfig::default()).unwrap();
        let target = probe.target();

        assert_eq!(target.host_str(), Some("www.apple.com"));
        assert!(target.query().is_some_and(|q| q.parse::<u32>().is_ok()));
    }

    async fn local_server(reply: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(reply.as_bytes()).await;
            }
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_probe_ok_is_reachable() {
        let url = local_server("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        let probe = HttpProbe::new(&ReachabilityConfig {
            probe_url: url,
            probe_timeout_secs: 5,
        })
        .unwrap();

        assert!(probe.is_reachable().await);
    }

    #[tokio::test]
    async fn test_probe_non_200_is_unreachable() {
        let url = local_server("HTTP/1.1 302 Found\r\nContent-Length: 0\r\n\r\n").await;
        let probe = HttpProbe::new(&ReachabilityConfig {
            probe_url: url,
            probe_timeout_secs: 5,
        })
        .unwrap();

        assert!(!probe.is_reachable().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_edges_fires_on_restore_only() {
        let gate = Arc::new(ManualReachability::new(true));
        let restored = Arc::new(AtomicUsize::new(0));

        let counter = restored.clone();
        let watcher = tokio::spawn(watch_edges(gate.clone(), Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(restored.load(Ordering::SeqCst), 0);

        gate.set(false);
        tokio::time::sleep(Duration::from_secs(5)).await;
        gate.set(true);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(restored.load(Ordering::SeqCst), 1);

        watcher.abort();
    }
}
