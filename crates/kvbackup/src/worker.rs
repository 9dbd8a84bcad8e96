//! Per-node backup worker.
//!
//! A worker owns one node's share of a round. It splits the request into up
//! to `concurrency` units, admits each unit through the shared limiter,
//! streams the node's responses onto its output queue and closes the queue
//! when it is done. A transport failure stops the remaining units and raises
//! exactly one `RetryNode` for the node; cancellation stops the worker
//! quietly.

use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::admission::AdmissionLimiter;
use crate::cluster::NodeClient;
use crate::types::{BackupRequest, NodeId, NodeResult, RetrySignal};

/// Capacity of a worker's output queue. Kept at one so a slow consumer
/// pushes back on the node stream.
pub const WORKER_QUEUE_CAPACITY: usize = 1;

/// Everything a worker needs for one node in one round.
pub struct NodeWorker {
    pub node_id: NodeId,
    pub round: u64,
    pub client: Arc<dyn NodeClient>,
    pub request: BackupRequest,
    pub concurrency: usize,
    pub limiter: AdmissionLimiter,
    pub notify: mpsc::Sender<RetrySignal>,
    pub cancel: CancellationToken,
}

/// Start `worker` and return its output queue.
pub fn spawn_node_worker(worker: NodeWorker) -> mpsc::Receiver<NodeResult> {
    let (tx, rx) = mpsc::channel(WORKER_QUEUE_CAPACITY);
    tokio::spawn(worker.run(tx));
    rx
}

impl NodeWorker {
    async fn run(self, tx: mpsc::Sender<NodeResult>) {
        let units = split_request(&self.request, self.concurrency);
        let unit_count = units.len();
        let units_cancel = self.cancel.child_token();
        let mut running: FuturesUnordered<_> = units
            .into_iter()
            .map(|unit| self.run_unit(unit, tx.clone(), &units_cancel))
            .collect();

        let mut failure: Option<anyhow::Error> = None;
        while let Some(res) = running.next().await {
            if let Err(err) = res {
                if failure.is_none() {
                    units_cancel.cancel();
                    failure = Some(err);
                }
            }
        }
        drop(running);

        match failure {
            Some(err) if !self.cancel.is_cancelled() => {
                tracing::warn!(
                    node_id = self.node_id,
                    round = self.round,
                    error = ?err,
                    "backup stream from node failed, requesting node retry"
                );
                let signal = RetrySignal::RetryNode {
                    node_id: self.node_id,
                    round: self.round,
                };
                // The queue stays open until the signal is queued, so the
                // round cannot drain before it sees the retry.
                tokio::select! {
                    () = self.cancel.cancelled() => {}
                    res = self.notify.send(signal) => {
                        if res.is_err() {
                            tracing::debug!(node_id = self.node_id, "retry signal dropped, controller gone");
                        }
                    }
                }
                drop(tx);
            }
            _ => {
                tracing::debug!(
                    node_id = self.node_id,
                    round = self.round,
                    units = unit_count,
                    cancelled = self.cancel.is_cancelled(),
                    "node worker finished"
                );
            }
        }
    }

    /// Run one request unit. An error means the transport failed.
    async fn run_unit(
        &self,
        unit: BackupRequest,
        tx: mpsc::Sender<NodeResult>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let permit = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            permit = self.limiter.acquire(unit.sub_ranges.len()) => permit?,
        };
        let mut stream = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            stream = self.client.backup(unit) => stream?,
        };
        loop {
            let item = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                item = stream.next() => item,
            };
            let response = match item {
                None => break,
                Some(Err(err)) => return Err(err),
                Some(Ok(response)) => response,
            };
            let result = NodeResult {
                node_id: self.node_id,
                response,
            };
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                res = tx.send(result) => {
                    if res.is_err() {
                        // Collector dropped our queue; nobody wants the rest.
                        return Ok(());
                    }
                }
            }
        }
        permit.release();
        Ok(())
    }
}

/// Split `request` into at most `concurrency` units of contiguous sub-ranges.
pub fn split_request(request: &BackupRequest, concurrency: usize) -> Vec<BackupRequest> {
    let total = request.sub_ranges.len();
    let units = concurrency.clamp(1, total.max(1));
    if units == 1 {
        return vec![request.clone()];
    }
    let chunk = total.div_ceil(units);
    request
        .sub_ranges
        .chunks(chunk)
        .map(|ranges| BackupRequest {
            sub_ranges: ranges.to_vec(),
            ..request.clone()
        })
        .collect()
}
