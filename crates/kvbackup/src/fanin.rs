//! Fan-in of per-node result queues.
//!
//! The set of producers changes while a round runs: a producer whose node is
//! retried is replaced, and a producer whose queue closes drops out. The
//! collector keeps producers in a registry keyed by node id and waits on all
//! of them at once. To change the set, the controller stops the collector,
//! takes the registry back, edits it and starts a new collector over it.

use std::collections::BTreeMap;

use futures_util::future::select_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::types::{NodeId, NodeResult};

/// Capacity of the collector's output queue.
pub const COLLECTOR_QUEUE_CAPACITY: usize = 1;

/// One registered producer: a worker's queue and the token that stops it.
#[derive(Debug)]
pub struct Producer {
    pub rx: mpsc::Receiver<NodeResult>,
    pub cancel: CancellationToken,
}

/// Live producers keyed by node id.
#[derive(Debug, Default)]
pub struct ProducerRegistry {
    producers: BTreeMap<NodeId, Producer>,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `producer` for `node_id`, stopping any producer it replaces.
    pub fn insert(&mut self, node_id: NodeId, producer: Producer) {
        if let Some(old) = self.producers.insert(node_id, producer) {
            old.cancel.cancel();
        }
    }

    /// Remove and stop the producer for `node_id`.
    pub fn remove(&mut self, node_id: NodeId) -> bool {
        match self.producers.remove(&node_id) {
            Some(old) => {
                old.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.producers.contains_key(&node_id)
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.producers.keys().copied().collect()
    }

    /// Wait for the next item from any producer. Closed producers are
    /// removed; returns `None` once no producer is left.
    async fn next(&mut self) -> Option<NodeResult> {
        loop {
            if self.producers.is_empty() {
                return None;
            }
            let (node_id, item) = {
                let waits = self.producers.iter_mut().map(|(node_id, producer)| {
                    let node_id = *node_id;
                    Box::pin(async move { (node_id, producer.rx.recv().await) })
                });
                let (next, _, _) = select_all(waits).await;
                next
            };
            match item {
                Some(item) => return Some(item),
                None => {
                    self.producers.remove(&node_id);
                    tracing::debug!(node_id, remaining = self.producers.len(), "producer closed");
                }
            }
        }
    }
}

/// Merges a registry's queues into one output queue.
pub struct FanInCollector {
    rx: mpsc::Receiver<NodeResult>,
    cancel: CancellationToken,
    task: JoinHandle<ProducerRegistry>,
}

impl FanInCollector {
    /// Start merging `registry`; `cancel` is the draining scope.
    pub fn start(registry: ProducerRegistry, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(COLLECTOR_QUEUE_CAPACITY);
        let task = tokio::spawn(collect(registry, tx, cancel.clone()));
        Self { rx, cancel, task }
    }

    /// Next merged item; `None` once every producer has closed (or the
    /// collector was cancelled).
    pub async fn recv(&mut self) -> Option<NodeResult> {
        self.rx.recv().await
    }

    /// Stop merging and take the registry back. Producers keep running.
    ///
    /// An item the collector had already taken from a producer but not yet
    /// delivered is dropped; the range it covered stays incomplete and is
    /// requested again by a later round.
    pub async fn stop(self) -> ProducerRegistry {
        self.cancel.cancel();
        drop(self.rx);
        match self.task.await {
            Ok(registry) => registry,
            Err(err) => {
                tracing::warn!(error = ?err, "fan-in collector task failed");
                ProducerRegistry::new()
            }
        }
    }
}

async fn collect(
    mut registry: ProducerRegistry,
    tx: mpsc::Sender<NodeResult>,
    cancel: CancellationToken,
) -> ProducerRegistry {
    loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => return registry,
            item = registry.next() => item,
        };
        let Some(item) = item else {
            tracing::debug!("all producers closed, fan-in finished");
            return registry;
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => return registry,
            res = tx.send(item) => {
                if res.is_err() {
                    return registry;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeResponse;
    use std::time::Duration;

    fn result(node_id: NodeId, key: &str) -> NodeResult {
        NodeResult {
            node_id,
            response: NodeResponse {
                start_key: key.as_bytes().to_vec(),
                ..NodeResponse::default()
            },
        }
    }

    fn producer() -> (mpsc::Sender<NodeResult>, Producer) {
        let (tx, rx) = mpsc::channel(1);
        (
            tx,
            Producer {
                rx,
                cancel: CancellationToken::new(),
            },
        )
    }

    #[tokio::test]
    async fn merges_until_every_producer_closes() {
        let mut registry = ProducerRegistry::new();
        let mut senders = Vec::new();
        for node_id in 1..=3 {
            let (tx, producer) = producer();
            registry.insert(node_id, producer);
            senders.push((node_id, tx));
        }
        for (node_id, tx) in senders {
            tokio::spawn(async move {
                for i in 0..4 {
                    tx.send(result(node_id, &format!("{node_id}-{i}")))
                        .await
                        .unwrap();
                }
            });
        }

        let mut collector = FanInCollector::start(registry, CancellationToken::new());
        let mut per_node = BTreeMap::<NodeId, usize>::new();
        while let Some(item) = tokio::time::timeout(Duration::from_secs(5), collector.recv())
            .await
            .unwrap()
        {
            *per_node.entry(item.node_id).or_default() += 1;
        }
        assert_eq!(per_node, BTreeMap::from([(1, 4), (2, 4), (3, 4)]));
        assert!(collector.stop().await.is_empty());
    }

    #[tokio::test]
    async fn stop_returns_registry_for_rebuild() {
        let mut registry = ProducerRegistry::new();
        let (tx1, p1) = producer();
        let (_tx2, p2) = producer();
        registry.insert(1, p1);
        registry.insert(2, p2);

        let mut collector = FanInCollector::start(registry, CancellationToken::new());
        tx1.send(result(1, "a")).await.unwrap();
        assert_eq!(collector.recv().await.unwrap().node_id, 1);

        let mut registry = collector.stop().await;
        assert_eq!(registry.node_ids(), vec![1, 2]);

        // Replace node 1 with a fresh producer and drop node 2.
        let (tx1b, p1b) = producer();
        registry.insert(1, p1b);
        assert!(registry.remove(2));
        assert!(!registry.contains(2));

        let mut collector = FanInCollector::start(registry, CancellationToken::new());
        tx1b.send(result(1, "b")).await.unwrap();
        let item = collector.recv().await.unwrap();
        assert_eq!(item.response.start_key, b"b");
        drop(tx1b);
        drop(tx1);
        assert!(collector.recv().await.is_none());
    }

    #[tokio::test]
    async fn replaced_producer_is_cancelled() {
        let mut registry = ProducerRegistry::new();
        let (_tx, old) = producer();
        let old_token = old.cancel.clone();
        registry.insert(4, old);
        let (_tx2, new) = producer();
        registry.insert(4, new);
        assert!(old_token.is_cancelled());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn empty_registry_closes_immediately() {
        let mut collector = FanInCollector::start(ProducerRegistry::new(), CancellationToken::new());
        assert!(collector.recv().await.is_none());
    }
}
