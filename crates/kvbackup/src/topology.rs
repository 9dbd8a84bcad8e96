//! Topology change detection.
//!
//! A background task polls membership and compares each snapshot with the
//! previous one. Any change that affects where backup work can run (a live
//! node joining or leaving, a node restarting, a node changing liveness)
//! produces a `RetryAll` signal so the controller redistributes the
//! remaining work against fresh membership.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::ClusterMembership;
use crate::types::{NodeId, NodeInfo, RetrySignal};

/// The parts of a node descriptor that matter for work placement.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NodeFingerprint {
    live: bool,
    start_timestamp: i64,
    address: String,
}

type TopologySnapshot = BTreeMap<NodeId, NodeFingerprint>;

/// A change worth restarting the round for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChange {
    Joined(NodeId),
    Left(NodeId),
    Restarted(NodeId),
    LivenessChanged { node_id: NodeId, live: bool },
    AddressChanged(NodeId),
}

fn snapshot(nodes: &[NodeInfo]) -> TopologySnapshot {
    nodes
        .iter()
        .map(|node| {
            (
                node.id,
                NodeFingerprint {
                    live: node.is_live(),
                    start_timestamp: node.start_timestamp,
                    address: node.address.clone(),
                },
            )
        })
        .collect()
}

/// First relevant difference between two membership snapshots.
fn detect_change(prev: &TopologySnapshot, next: &TopologySnapshot) -> Option<TopologyChange> {
    for (node_id, now) in next {
        match prev.get(node_id) {
            None if now.live => return Some(TopologyChange::Joined(*node_id)),
            None => {}
            Some(before) if before.live != now.live => {
                return Some(TopologyChange::LivenessChanged {
                    node_id: *node_id,
                    live: now.live,
                })
            }
            Some(before) if before.start_timestamp != now.start_timestamp => {
                return Some(TopologyChange::Restarted(*node_id))
            }
            Some(before) if before.address != now.address => {
                return Some(TopologyChange::AddressChanged(*node_id))
            }
            Some(_) => {}
        }
    }
    prev.iter()
        .find(|(node_id, before)| before.live && !next.contains_key(*node_id))
        .map(|(node_id, _)| TopologyChange::Left(*node_id))
}

/// Spawn the watcher. It stops when `cancel` fires or the signal channel
/// closes.
pub fn spawn_topology_watcher(
    membership: Arc<dyn ClusterMembership>,
    notify: mpsc::Sender<RetrySignal>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last: Option<TopologySnapshot> = None;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let nodes = match membership.nodes().await {
                Ok(nodes) => nodes,
                Err(err) => {
                    tracing::warn!(error = ?err, "topology watcher failed to list nodes");
                    continue;
                }
            };
            let current = snapshot(&nodes);
            let change = last.as_ref().and_then(|prev| detect_change(prev, &current));
            last = Some(current);
            let Some(change) = change else {
                continue;
            };
            tracing::info!(?change, "cluster topology changed, retrying all nodes");
            tokio::select! {
                () = cancel.cancelled() => break,
                res = notify.send(RetrySignal::RetryAll) => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("topology watcher stopped");
    })
}
