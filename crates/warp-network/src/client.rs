//! HTTP client over a ranked set of untrusted peers.
//!
//! Requests go to the primary peer first. Before every send the host's
//! token bucket is consulted and the call waits for a token, bounded by
//! the request deadline. A 429 slows the host down and is reported as
//! [`ClientError::RateLimited`]; a 5xx is retried on the same host a few
//! times; anything else that is not a success fails the attempt. When the
//! primary fails and failover is enabled, the same request is replayed
//! against each ranked peer in turn and the primary's error is surfaced if
//! none of them succeeds.

use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::future::Future;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warp_core::types::{Base64Url, Block, NetworkInfo, Transaction};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::peer_ranking::PeerProbe;
use crate::rate_limiter::RateLimiter;

/// Whether a response status is worth an immediate retry on the same host.
///
/// Only server errors qualify. A 429 is deliberately excluded: the host
/// has already been slowed down and the caller's own loop decides when to
/// come back.
pub fn retry_condition(status: u16) -> bool {
    (500..600).contains(&status)
}

/// Shared state guarded by one mutex: the ranked list, the per-host
/// buckets and the connection pool.
#[derive(Debug)]
struct PeerSet {
    peers: Vec<Url>,
    limiter: RateLimiter,
    http: reqwest::Client,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Body {
    Json,
    Any,
}

#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    primary: Url,
    token: CancellationToken,
    state: Mutex<PeerSet>,
}

impl Client {
    /// Build a client. In-flight requests abort with
    /// [`ClientError::Cancelled`] once `token` fires.
    pub fn new(config: ClientConfig, token: CancellationToken) -> Result<Self, ClientError> {
        let primary = parse_peer(&config.primary)?;
        let peers = parse_peers(&config.peers);
        let http = build_http(&config)?;
        let limiter = RateLimiter::new(config.rate_limit.clone());

        Ok(Self {
            config,
            primary,
            token,
            state: Mutex::new(PeerSet { peers, limiter, http }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn primary(&self) -> &Url {
        &self.primary
    }

    /// Current ranked failover list.
    pub fn peers(&self) -> Vec<Url> {
        self.state.lock().peers.clone()
    }

    /// Current token rate of `peer`'s host, if it has been contacted.
    pub fn rate(&self, peer: &Url) -> Option<f64> {
        self.state.lock().limiter.rate(&host_key(peer))
    }

    /// Replace the ranked list. Malformed entries are skipped.
    ///
    /// The connection pool is rebuilt so sockets to peers that fell out of
    /// the list are not reused, and buckets of hosts no longer contacted are
    /// dropped. Returns how many peers were accepted.
    pub fn set_peers<S: AsRef<str>>(&self, peers: &[S]) -> usize {
        let parsed = parse_peers(peers);
        let mut keep: HashSet<String> = parsed.iter().map(host_key).collect();
        keep.insert(host_key(&self.primary));
        let http = build_http(&self.config);

        let mut state = self.state.lock();
        match http {
            Ok(http) => state.http = http,
            Err(e) => warn!(error = %e, "client: keeping old connection pool"),
        }
        state.limiter.retain_hosts(|host| keep.contains(host));
        state.peers = parsed;
        info!(peers = state.peers.len(), "client: peer list replaced");
        state.peers.len()
    }

    /// Drop every pooled connection.
    pub fn reset_connections(&self) {
        match build_http(&self.config) {
            Ok(http) => {
                self.state.lock().http = http;
                debug!("client: connection pool reset");
            }
            Err(e) => warn!(error = %e, "client: connection pool reset failed"),
        }
    }

    // ------------------------------------------------------------------
    // Endpoints
    // ------------------------------------------------------------------

    pub async fn get_network_info(&self) -> Result<NetworkInfo, ClientError> {
        self.with_failover(move |peer| async move { self.get_json(&peer, "/info").await })
            .await
    }

    /// `/info` from one specific peer, without failover.
    pub async fn get_network_info_from(&self, peer: &Url) -> Result<NetworkInfo, ClientError> {
        self.get_json(peer, "/info").await
    }

    /// Raw `host:port` entries advertised by the primary.
    pub async fn get_peer_list(&self) -> Result<Vec<String>, ClientError> {
        self.with_failover(move |peer| async move { self.get_json(&peer, "/peers").await })
            .await
    }

    pub async fn get_block_by_height(&self, height: u64) -> Result<Block, ClientError> {
        let path = format!("/block/height/{height}");
        let path = path.as_str();
        self.with_failover(move |peer| async move { self.get_json(&peer, path).await })
            .await
    }

    pub async fn get_transaction_by_id(&self, id: &Base64Url) -> Result<Transaction, ClientError> {
        let path = format!("/tx/{id}");
        let path = path.as_str();
        self.with_failover(move |peer| async move { self.get_json(&peer, path).await })
            .await
    }

    /// Payload of a transaction that was not inlined in its record.
    pub async fn get_transaction_data(&self, id: &Base64Url) -> Result<Vec<u8>, ClientError> {
        let path = format!("/tx/{id}/data");
        let path = path.as_str();
        self.with_failover(move |peer| async move {
            let (host, body) = self.fetch(&peer, path, Body::Any).await?;
            let text = String::from_utf8(body).map_err(|e| ClientError::Decode {
                peer: host.clone(),
                reason: e.to_string(),
            })?;
            Base64Url::decode(text.trim())
                .map(|b| b.0)
                .map_err(|e| ClientError::Decode {
                    peer: host,
                    reason: e.to_string(),
                })
        })
        .await
    }

    /// Time a `/info` round trip to `peer` and report its height.
    pub async fn check_peer_latency(&self, peer: &Url) -> Result<PeerProbe, ClientError> {
        let started = Instant::now();
        let info = self.get_network_info_from(peer).await?;
        Ok(PeerProbe {
            url: peer.clone(),
            height: info.height,
            latency: started.elapsed(),
        })
    }

    // ------------------------------------------------------------------
    // Request plumbing
    // ------------------------------------------------------------------

    async fn with_failover<T, F, Fut>(&self, mut request: F) -> Result<T, ClientError>
    where
        F: FnMut(Url) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let original = match request(self.primary.clone()).await {
            Ok(value) => return Ok(value),
            Err(e) if !self.config.failover || !e.should_fail_over() => return Err(e),
            Err(e) => e,
        };

        let peers = self.peers();
        debug!(error = %original, candidates = peers.len(), "client: primary failed, trying peers");
        for peer in peers.into_iter().filter(|p| *p != self.primary) {
            match request(peer.clone()).await {
                Ok(value) => {
                    debug!(peer = %peer, "client: failover succeeded");
                    return Ok(value);
                }
                Err(ClientError::Cancelled) => return Err(ClientError::Cancelled),
                Err(e) => debug!(peer = %peer, error = %e, "client: failover attempt failed"),
            }
        }
        Err(original)
    }

    async fn get_json<T: DeserializeOwned>(&self, peer: &Url, path: &str) -> Result<T, ClientError> {
        let (host, body) = self.fetch(peer, path, Body::Json).await?;
        serde_json::from_slice(&body).map_err(|e| ClientError::Decode {
            peer: host,
            reason: e.to_string(),
        })
    }

    /// One logical request against one peer. Returns the host key and body.
    async fn fetch(&self, peer: &Url, path: &str, expect: Body) -> Result<(String, Vec<u8>), ClientError> {
        let url = endpoint(peer, path)?;
        let host = host_key(peer);
        let deadline = Instant::now() + self.config.request_timeout;
        let mut server_errors = 0;

        loop {
            self.acquire(&host, deadline).await?;
            let http = self.state.lock().http.clone();

            let response = tokio::select! {
                _ = self.token.cancelled() => return Err(ClientError::Cancelled),
                res = http.get(url.clone()).send() => res.map_err(|e| transport_error(&host, e))?,
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                let rate = self.state.lock().limiter.decay(&host);
                warn!(peer = %host, rate, "client: rate limited, host slowed down");
                return Err(ClientError::RateLimited { peer: host });
            }
            if retry_condition(status.as_u16()) && server_errors < self.config.server_error_retries {
                server_errors += 1;
                debug!(peer = %host, %status, attempt = server_errors, "client: server error, retrying");
                continue;
            }
            if !status.is_success() {
                return Err(ClientError::Status {
                    peer: host,
                    status: status.as_u16(),
                });
            }

            if expect == Body::Json {
                let content_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default();
                if !content_type.starts_with("application/json") {
                    return Err(ClientError::Decode {
                        peer: host,
                        reason: format!("unexpected content type {content_type:?}"),
                    });
                }
            }

            let body = tokio::select! {
                _ = self.token.cancelled() => return Err(ClientError::Cancelled),
                res = response.bytes() => res.map_err(|e| transport_error(&host, e))?,
            };
            return Ok((host, body.to_vec()));
        }
    }

    /// Wait for a token on `host` unless the deadline or cancellation comes first.
    async fn acquire(&self, host: &str, deadline: Instant) -> Result<(), ClientError> {
        loop {
            let acquired = self.state.lock().limiter.try_acquire(host, Instant::now());
            let wait = match acquired {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };
            if Instant::now() + wait > deadline {
                return Err(ClientError::Timeout {
                    peer: host.to_string(),
                });
            }
            tokio::select! {
                _ = self.token.cancelled() => return Err(ClientError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

fn build_http(config: &ClientConfig) -> Result<reqwest::Client, ClientError> {
    reqwest::Client::builder()
        .timeout(config.request_timeout)
        .connect_timeout(config.connect_timeout)
        .build()
        .map_err(|e| ClientError::Setup(e.to_string()))
}

fn transport_error(host: &str, e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        ClientError::Timeout {
            peer: host.to_string(),
        }
    } else {
        ClientError::Transport {
            peer: host.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Rate limiting key: `host:port`.
pub(crate) fn host_key(url: &Url) -> String {
    match (url.host_str(), url.port_or_known_default()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        _ => url.as_str().to_string(),
    }
}

fn endpoint(peer: &Url, path: &str) -> Result<Url, ClientError> {
    let joined = format!("{}{}", peer.as_str().trim_end_matches('/'), path);
    Url::parse(&joined).map_err(|_| ClientError::InvalidUrl(joined))
}

/// Accepts full URLs and the bare `host:port` form `/peers` returns.
pub(crate) fn parse_peer(raw: &str) -> Result<Url, ClientError> {
    let raw = raw.trim();
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };
    match Url::parse(&candidate) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => Ok(url),
        _ => Err(ClientError::InvalidUrl(raw.to_string())),
    }
}

fn parse_peers<S: AsRef<str>>(raw: &[S]) -> Vec<Url> {
    let mut seen = HashSet::new();
    raw.iter()
        .filter_map(|p| match parse_peer(p.as_ref()) {
            Ok(url) => Some(url),
            Err(e) => {
                debug!(error = %e, "client: skipping malformed peer");
                None
            }
        })
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use axum::Json;
    use axum::Router;
    use axum::http::StatusCode as HttpStatus;
    use axum::routing::get;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    async fn serve(app: Router) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{addr}")).unwrap()
    }

    fn info_router(height: u64) -> Router {
        Router::new().route("/info", get(move || async move { Json(json!({ "height": height })) }))
    }

    fn config(primary: &Url, peers: &[Url]) -> ClientConfig {
        ClientConfig {
            primary: primary.to_string(),
            peers: peers.iter().map(Url::to_string).collect(),
            request_timeout: Duration::from_secs(5),
            rate_limit: RateLimitConfig {
                requests_per_second: 100.0,
                burst: 10,
                ..RateLimitConfig::default()
            },
            ..ClientConfig::default()
        }
    }

    fn client(cfg: ClientConfig) -> Client {
        Client::new(cfg, CancellationToken::new()).unwrap()
    }

    // --- Helpers ---

    #[test]
    fn retry_condition_only_for_server_errors() {
        assert!(retry_condition(500));
        assert!(retry_condition(503));
        assert!(!retry_condition(429));
        assert!(!retry_condition(404));
        assert!(!retry_condition(200));
    }

    #[test]
    fn parse_peer_accepts_bare_host_port() {
        let url = parse_peer("10.0.0.1:1984").unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.1:1984/");
        assert_eq!(host_key(&url), "10.0.0.1:1984");
    }

    #[test]
    fn parse_peer_rejects_garbage() {
        assert!(parse_peer("").is_err());
        assert!(parse_peer("ftp://files.example").is_err());
        assert!(parse_peer("http://").is_err());
    }

    #[test]
    fn host_key_uses_default_port() {
        let url = Url::parse("https://arweave.net").unwrap();
        assert_eq!(host_key(&url), "arweave.net:443");
    }

    #[test]
    fn invalid_primary_is_rejected() {
        let cfg = ClientConfig {
            primary: "::not a url::".into(),
            ..ClientConfig::default()
        };
        let err = Client::new(cfg, CancellationToken::new()).unwrap_err();
        assert!(matches!(err, ClientError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn set_peers_filters_malformed() {
        let primary = Url::parse("http://127.0.0.1:1").unwrap();
        let c = client(config(&primary, &[]));
        let accepted = c.set_peers(&["10.0.0.1:1984", "", "gopher://x", "10.0.0.1:1984", "http://10.0.0.2:1984"]);
        assert_eq!(accepted, 2);
        assert_eq!(c.peers().len(), 2);
    }

    // --- Requests ---

    #[tokio::test]
    async fn fetches_network_info() {
        let primary = serve(info_router(1234)).await;
        let c = client(config(&primary, &[]));
        assert_eq!(c.get_network_info().await.unwrap().height, 1234);
    }

    #[tokio::test]
    async fn rate_limited_response_decays_host() {
        let app = Router::new().route("/info", get(|| async { (HttpStatus::TOO_MANY_REQUESTS, "slow down") }));
        let primary = serve(app).await;
        let mut cfg = config(&primary, &[]);
        cfg.failover = false;
        let c = client(cfg);

        let err = c.get_network_info().await.unwrap_err();
        assert!(matches!(err, ClientError::RateLimited { .. }));
        assert!(!retry_condition(429));
        let rate = c.rate(&primary).unwrap();
        assert!((rate - 90.0).abs() < 1e-9, "rate was {rate}");
    }

    #[tokio::test]
    async fn server_error_retried_on_same_host() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let app = Router::new().route(
            "/info",
            get(move || {
                let h = h.clone();
                async move {
                    if h.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(HttpStatus::BAD_GATEWAY)
                    } else {
                        Ok(Json(json!({ "height": 7 })))
                    }
                }
            }),
        );
        let primary = serve(app).await;
        let mut cfg = config(&primary, &[]);
        cfg.failover = false;
        let c = client(cfg);

        assert_eq!(c.get_network_info().await.unwrap().height, 7);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_error_is_terminal_for_attempt() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let app = Router::new().route(
            "/info",
            get(move || {
                h.fetch_add(1, Ordering::SeqCst);
                async { HttpStatus::BAD_REQUEST }
            }),
        );
        let primary = serve(app).await;
        let mut cfg = config(&primary, &[]);
        cfg.failover = false;
        let c = client(cfg);

        let err = c.get_network_info().await.unwrap_err();
        assert_eq!(err, ClientError::Status { peer: host_key(&primary), status: 400 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_json_content_type_rejected() {
        let app = Router::new().route("/info", get(|| async { "{\"height\": 1}" }));
        let primary = serve(app).await;
        let mut cfg = config(&primary, &[]);
        cfg.failover = false;
        let c = client(cfg);

        let err = c.get_network_info().await.unwrap_err();
        assert!(matches!(err, ClientError::Decode { .. }));
    }

    #[tokio::test]
    async fn fails_over_to_ranked_peer() {
        let primary = serve(Router::new().route("/info", get(|| async { HttpStatus::SERVICE_UNAVAILABLE }))).await;
        let backup = serve(info_router(99)).await;
        let c = client(config(&primary, &[backup]));

        assert_eq!(c.get_network_info().await.unwrap().height, 99);
    }

    #[tokio::test]
    async fn surfaces_primary_error_when_all_peers_fail() {
        let primary = serve(Router::new().route("/info", get(|| async { HttpStatus::NOT_FOUND }))).await;
        let backup = serve(Router::new().route("/info", get(|| async { HttpStatus::GONE }))).await;
        let c = client(config(&primary, &[backup]));

        let err = c.get_network_info().await.unwrap_err();
        assert_eq!(err, ClientError::Status { peer: host_key(&primary), status: 404 });
    }

    #[tokio::test]
    async fn redirected_request_skips_failover() {
        let primary = serve(info_router(1)).await;
        let broken = serve(Router::new().route("/info", get(|| async { HttpStatus::SERVICE_UNAVAILABLE }))).await;
        let c = client(config(&primary, &[]));

        let err = c.get_network_info_from(&broken).await.unwrap_err();
        assert!(matches!(err, ClientError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn fetches_external_data() {
        let app = Router::new().route("/tx/:id/data", get(|| async { "aGVsbG8" }));
        let primary = serve(app).await;
        let c = client(config(&primary, &[]));

        let id = Base64Url(vec![1; 32]);
        assert_eq!(c.get_transaction_data(&id).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn latency_probe_reports_height() {
        let primary = serve(info_router(5)).await;
        let c = client(config(&primary, &[]));
        let probe = c.check_peer_latency(&primary).await.unwrap();
        assert_eq!(probe.height, 5);
        assert_eq!(probe.url, primary);
    }

    #[tokio::test]
    async fn rate_limit_wait_past_deadline_times_out() {
        let primary = serve(info_router(5)).await;
        let mut cfg = config(&primary, &[]);
        cfg.failover = false;
        cfg.request_timeout = Duration::from_millis(200);
        cfg.rate_limit = RateLimitConfig::default();
        let c = client(cfg);

        c.get_network_info().await.unwrap();
        let err = c.get_network_info().await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout { .. }));
    }

    #[tokio::test]
    async fn cancellation_aborts_rate_limit_wait() {
        let primary = serve(info_router(5)).await;
        let token = CancellationToken::new();
        let mut cfg = config(&primary, &[]);
        cfg.rate_limit = RateLimitConfig::default();
        let c = Client::new(cfg, token.clone()).unwrap();

        c.get_network_info().await.unwrap();
        token.cancel();
        assert_eq!(c.get_network_info().await.unwrap_err(), ClientError::Cancelled);
    }
}
