//! Periodic refresh of the client's ranked peer list.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};
use warp_task::{Task, TaskError, TaskSpec, periodic};

use crate::client::{Client, parse_peer};
use crate::config::PeerMonitorConfig;
use crate::error::ClientError;
use crate::peer_ranking::select_peers;

/// Fetch `/peers`, probe every entry and hand the ranked survivors to the client.
///
/// Peers that fail the probe are dropped. An empty probe result leaves the
/// current list untouched. Returns the number of peers installed.
pub async fn refresh_peers(client: &Client, config: &PeerMonitorConfig) -> Result<usize, ClientError> {
    let advertised = client.get_peer_list().await?;
    debug!(advertised = advertised.len(), "peer_monitor: probing peers");

    let candidates: Vec<_> = advertised.iter().filter_map(|p| parse_peer(p).ok()).collect();
    let probes: Vec<_> = stream::iter(candidates)
        .map(move |peer| async move { client.check_peer_latency(&peer).await })
        .buffer_unordered(config.probe_concurrency.max(1))
        .filter_map(|res| async move {
            match res {
                Ok(probe) => Some(probe),
                Err(e) => {
                    debug!(error = %e, "peer_monitor: probe failed");
                    None
                }
            }
        })
        .collect()
        .await;

    if probes.is_empty() {
        warn!("peer_monitor: no peer answered, keeping current list");
        return Ok(client.peers().len());
    }

    let ranked = select_peers(probes, config.max_height_lag, config.max_peers);
    let ranked: Vec<String> = ranked.iter().map(ToString::to_string).collect();
    Ok(client.set_peers(&ranked))
}

/// A task running [`refresh_peers`] every `config.interval`.
///
/// Refresh failures are logged and retried on the next tick.
pub fn peer_monitor_task(client: Arc<Client>, config: PeerMonitorConfig) -> Task {
    let interval = config.interval;
    Task::new(TaskSpec {
        periodic: vec![periodic(interval, move |_ctx| {
            let client = client.clone();
            let config = config.clone();
            async move {
                match refresh_peers(&client, &config).await {
                    Ok(count) => info!(peers = count, "peer_monitor: peers refreshed"),
                    Err(ClientError::Cancelled) => return Err(TaskError::Cancelled),
                    Err(e) => warn!(error = %e, "peer_monitor: refresh failed"),
                }
                Ok(())
            }
        })],
        ..TaskSpec::new("peer-monitor")
    })
}
