//! The supervised syncer rebuilds a failing generation and recovers once
//! the peer starts serving again.

use std::sync::Arc;
use std::time::Duration;

use warp_core::types::{Base64Url, Checkpoint};
use warp_sync::{RocksStore, Store, Syncer};
use warp_tests::helpers::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_generation_is_rebuilt_then_recovers() {
    let peer = MockPeer::spawn().await;
    peer.set_height(105);

    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(dir.path().join("syncdata")).unwrap();
    let genesis = Checkpoint {
        height: 100,
        hash: Base64Url(vec![0x11; 48]),
    };
    store.persist("interactions", &[], Some(&genesis)).unwrap();
    let store = Arc::new(store);

    let mut config = syncer_config(peer.url(), dir.path());
    config.watchdog.tolerance = 3;
    let syncer = Syncer::from_config(config, store.clone());
    syncer.task().start().unwrap();

    // block 101 is missing: every attempt is a download error
    assert!(wait_until(Duration::from_secs(10), || syncer.restarts() >= 1).await, "never restarted");
    assert!(store.interactions().unwrap().is_empty());

    let txs: Vec<_> = (0..3).map(|_| signed_tx(&[("Contract", "c")])).collect();
    let chain = sealed_chain(100, &genesis.hash, txs.iter().map(|t| vec![t.id.clone()]).collect());
    peer.add_blocks(&chain);
    peer.add_txs(&txs);

    let synced = wait_until(Duration::from_secs(15), || {
        store.last_checkpoint("interactions").unwrap().map(|c| c.height) == Some(103)
    })
    .await;
    assert!(synced, "syncer did not recover");
    syncer.task().stop_wait().await.unwrap();

    assert_eq!(store.interactions().unwrap().len(), 3);
    assert!(syncer.task().is_finished());
}
