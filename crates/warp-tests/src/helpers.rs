//! Shared helpers: sealed blocks, signed transactions and a mock peer.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use parking_lot::Mutex;
use reqwest::Url;
use serde_json::json;
use warp_core::crypto::{KeyPair, sign_transaction};
use warp_core::types::{Base64Url, Block, Decimal, ProofOfAccess, RewardAddr, Tag, Transaction};
use warp_sync::{FilterConfig, SyncerConfig};

/// A transaction signed by a fresh key, carrying `tags`.
pub fn signed_tx(tags: &[(&str, &str)]) -> Transaction {
    let mut tx = Transaction {
        format: 2,
        id: Base64Url::default(),
        last_tx: Base64Url(vec![3; 32]),
        owner: Base64Url::default(),
        tags: tags.iter().map(|(n, v)| Tag::new(n, v)).collect(),
        target: Base64Url::default(),
        quantity: Decimal::default(),
        data: Base64Url::default(),
        data_size: Decimal::default(),
        data_root: Base64Url::default(),
        reward: Decimal::from(1_000u64),
        signature: Base64Url::default(),
    };
    sign_transaction(&mut tx, &KeyPair::generate());
    tx
}

/// `tx` with a tag appended after signing, so its signature no longer verifies.
pub fn tampered(mut tx: Transaction) -> Transaction {
    tx.tags.push(Tag::new("Injected", "1"));
    tx
}

/// A sealed block at `height` whose parent is `previous`.
pub fn sealed_block(height: u64, previous: &Base64Url, txs: Vec<Base64Url>) -> Block {
    let mut block = Block {
        nonce: Base64Url(height.to_le_bytes().to_vec()),
        previous_block: previous.clone(),
        timestamp: 1_650_000_000 + height * 120,
        last_retarget: 1_650_000_000,
        diff: Decimal::from(1u64 << 40),
        height,
        hash: Base64Url(vec![height as u8; 48]),
        indep_hash: Base64Url::default(),
        txs,
        tx_root: Base64Url::default(),
        wallet_list: Base64Url(vec![1; 48]),
        reward_addr: RewardAddr::Unclaimed,
        tags: Vec::new(),
        reward_pool: Decimal::from(0u64),
        weave_size: Decimal::from(height * 1_000),
        block_size: Decimal::from(0u64),
        cumulative_diff: Decimal::from(height),
        hash_list_merkle: Base64Url(vec![2; 48]),
        poa: ProofOfAccess::default(),
        usd_to_ar_rate: None,
        scheduled_usd_to_ar_rate: None,
    };
    block.seal();
    block
}

/// Blocks `after+1 ..= after+count`, each carrying the given transactions
/// and linked to its predecessor.
pub fn sealed_chain(after: u64, hash: &Base64Url, txs_per_block: Vec<Vec<Base64Url>>) -> Vec<Block> {
    let mut previous = hash.clone();
    txs_per_block
        .into_iter()
        .enumerate()
        .map(|(i, txs)| {
            let block = sealed_block(after + 1 + i as u64, &previous, txs);
            previous = block.indep_hash.clone();
            block
        })
        .collect()
}

#[derive(Default)]
struct PeerState {
    height: AtomicU64,
    blocks: Mutex<HashMap<u64, Block>>,
    /// Served once each, before the honest block at that height.
    forged: Mutex<HashMap<u64, VecDeque<Block>>>,
    txs: Mutex<HashMap<String, Transaction>>,
    data: Mutex<HashMap<String, Vec<u8>>>,
    peers: Mutex<Vec<String>>,
    block_requests: Mutex<Vec<u64>>,
    /// Requests still to be answered with 429.
    throttled: AtomicU32,
    hits: AtomicU64,
}

/// An in-process ledger peer answering the endpoints the client uses.
#[derive(Clone)]
pub struct MockPeer {
    state: Arc<PeerState>,
    url: Url,
}

impl MockPeer {
    /// Bind to an ephemeral local port and start serving.
    pub async fn spawn() -> Self {
        let state = Arc::new(PeerState::default());
        let app = Router::new()
            .route("/info", get(info))
            .route("/peers", get(peers))
            .route("/block/height/:height", get(block_by_height))
            .route("/tx/:id", get(transaction))
            .route("/tx/:id/data", get(transaction_data))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let url = Url::parse(&format!("http://{addr}")).unwrap();
        Self { state, url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// `host:port` as advertised in `/peers` lists.
    pub fn address(&self) -> String {
        format!("{}:{}", self.url.host_str().unwrap(), self.url.port().unwrap())
    }

    pub fn set_height(&self, height: u64) {
        self.state.height.store(height, Ordering::SeqCst);
    }

    pub fn add_blocks(&self, blocks: &[Block]) {
        let mut stored = self.state.blocks.lock();
        for block in blocks {
            stored.insert(block.height, block.clone());
        }
    }

    /// Serve `block` once at its height before the honest one.
    pub fn add_forged_block(&self, block: Block) {
        self.state.forged.lock().entry(block.height).or_default().push_back(block);
    }

    pub fn add_txs(&self, txs: &[Transaction]) {
        let mut stored = self.state.txs.lock();
        for tx in txs {
            stored.insert(tx.id.to_string(), tx.clone());
        }
    }

    pub fn add_data(&self, id: &Base64Url, data: &[u8]) {
        self.state.data.lock().insert(id.to_string(), data.to_vec());
    }

    pub fn set_peers(&self, peers: &[String]) {
        *self.state.peers.lock() = peers.to_vec();
    }

    /// Answer the next `n` requests with 429.
    pub fn throttle_next(&self, n: u32) {
        self.state.throttled.store(n, Ordering::SeqCst);
    }

    pub fn block_requests(&self) -> Vec<u64> {
        self.state.block_requests.lock().clone()
    }

    /// Requests received on any endpoint.
    pub fn hits(&self) -> u64 {
        self.state.hits.load(Ordering::SeqCst)
    }
}

fn throttled(state: &PeerState) -> bool {
    state.hits.fetch_add(1, Ordering::SeqCst);
    state
        .throttled
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

async fn info(State(state): State<Arc<PeerState>>) -> Response {
    if throttled(&state) {
        return (StatusCode::TOO_MANY_REQUESTS, "slow down").into_response();
    }
    let height = state.height.load(Ordering::SeqCst);
    Json(json!({ "network": "mock", "height": height, "blocks": height + 1 })).into_response()
}

async fn peers(State(state): State<Arc<PeerState>>) -> Response {
    if throttled(&state) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    Json(state.peers.lock().clone()).into_response()
}

async fn block_by_height(State(state): State<Arc<PeerState>>, UrlPath(height): UrlPath<u64>) -> Response {
    if throttled(&state) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    state.block_requests.lock().push(height);
    if let Some(forged) = state.forged.lock().get_mut(&height).and_then(VecDeque::pop_front) {
        return Json(forged).into_response();
    }
    match state.blocks.lock().get(&height) {
        Some(block) => Json(block.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn transaction(State(state): State<Arc<PeerState>>, UrlPath(id): UrlPath<String>) -> Response {
    if throttled(&state) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    match state.txs.lock().get(&id) {
        Some(tx) => Json(tx.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn transaction_data(State(state): State<Arc<PeerState>>, UrlPath(id): UrlPath<String>) -> Response {
    if throttled(&state) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    match state.data.lock().get(&id) {
        Some(data) => Base64Url(data.clone()).to_string().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Syncer settings for a single local peer with short timers.
pub fn syncer_config(primary: &Url, data_dir: &Path) -> SyncerConfig {
    let mut config = SyncerConfig {
        data_dir: data_dir.to_path_buf(),
        filter: FilterConfig::AcceptAll,
        ..SyncerConfig::default()
    };
    config.client.primary = primary.to_string();
    config.client.peers = Vec::new();
    config.client.failover = false;
    config.client.request_timeout_ms = 2_000;
    config.client.requests_per_second = 200.0;
    config.client.burst = 200;
    config.peer_monitor.enabled = false;
    config.monitor.interval = Duration::from_millis(100);
    config.monitor.confirmation_depth = 2;
    config.blocks.retry_delay = Duration::from_millis(50);
    config.blocks.validation_cooldown = Duration::from_millis(50);
    config.transactions.workers = 8;
    config.transactions.queue_capacity = 8;
    config.transactions.initial_interval = Duration::from_millis(20);
    config.transactions.max_interval = Duration::from_millis(50);
    config.transactions.max_elapsed = Duration::from_millis(300);
    config.transactions.not_found_delay = Duration::from_millis(50);
    config.sink.max_time_in_queue = Duration::from_millis(100);
    config.watchdog.check_interval = Duration::from_millis(500);
    config.watchdog.rebuild_delay = Duration::from_millis(50);
    config.watchdog.stop_timeout = Duration::from_secs(5);
    config
}

/// Poll `condition` every 25ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
