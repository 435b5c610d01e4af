//! End-to-end test suite for the Warp syncer.
//!
//! Tests drive the real client, pipeline and RocksDB store against mock
//! peers served over HTTP, including peers that serve forged blocks,
//! tampered transactions or throttle every request.

pub mod helpers;
