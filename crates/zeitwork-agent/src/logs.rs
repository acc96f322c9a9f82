use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};
use uuid::Uuid;

/// Lines retained per VM for interactive inspection.
const RING_CAPACITY: usize = 2048;

/// Shipping cadence of pending batches.
const SHIP_INTERVAL: Duration = Duration::from_secs(5);

/// Batch shipped to the external log sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBatch {
    pub vm_id: Uuid,
    pub lines: Vec<String>,
}

struct VmLog {
    /// Bounded tail for `agentd` admin queries.
    ring: VecDeque<String>,
    /// Lines not yet shipped to the sink.
    pending: Vec<String>,
}

/// Per-VM log buffers: every guest stdout/stderr line is teed into a ring
/// buffer and queued for the sink.
#[derive(Clone)]
pub struct LogRegistry {
    vms: Arc<Mutex<HashMap<Uuid, VmLog>>>,
}

impl Default for LogRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LogRegistry {
    pub fn new() -> Self {
        Self {
            vms: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn push(&self, vm_id: Uuid, line: &str) {
        let mut vms = self.vms.lock().await;
        let log = vms.entry(vm_id).or_insert_with(|| VmLog {
            ring: VecDeque::with_capacity(RING_CAPACITY),
            pending: Vec::new(),
        });
        if log.ring.len() == RING_CAPACITY {
            log.ring.pop_front();
        }
        log.ring.push_back(line.to_string());
        log.pending.push(line.to_string());
    }

    /// Last `n` lines for a VM.
    pub async fn tail(&self, vm_id: Uuid, n: usize) -> Vec<String> {
        let vms = self.vms.lock().await;
        match vms.get(&vm_id) {
            Some(log) => log.ring.iter().rev().take(n).rev().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Drain all pending lines into per-VM batches.
    pub async fn drain_pending(&self) -> Vec<LogBatch> {
        let mut vms = self.vms.lock().await;
        vms.iter_mut()
            .filter(|(_, log)| !log.pending.is_empty())
            .map(|(vm_id, log)| LogBatch {
                vm_id: *vm_id,
                lines: std::mem::take(&mut log.pending),
            })
            .collect()
    }

    /// Drop a VM's buffers after teardown.
    pub async fn remove(&self, vm_id: Uuid) {
        self.vms.lock().await.remove(&vm_id);
    }
}

/// Ship pending log batches to the configured HTTP sink until shutdown.
/// Failed shipments are retried with the next batch; the ring buffer is
/// unaffected either way.
pub async fn ship_loop(
    registry: LogRegistry,
    sink_url: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let client = reqwest::Client::new();
    let mut tick = tokio::time::interval(SHIP_INTERVAL);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => return,
        }

        for batch in registry.drain_pending().await {
            match client.post(&sink_url).json(&batch).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(vm = %batch.vm_id, lines = batch.lines.len(), "Shipped log batch");
                }
                Ok(response) => {
                    warn!(vm = %batch.vm_id, status = %response.status(), "Log sink rejected batch");
                }
                Err(e) => {
                    warn!(vm = %batch.vm_id, error = %e, "Log sink unreachable");
                }
            }
        }
    }
}

/// Convenience: push a multi-line chunk, splitting on newlines.
pub async fn push_chunk(registry: &LogRegistry, vm_id: Uuid, chunk: &str) -> Result<()> {
    for line in chunk.lines() {
        if !line.is_empty() {
            registry.push(vm_id, line).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ring_buffer_caps_and_tails() {
        let registry = LogRegistry::new();
        let vm = Uuid::from_u128(1);

        for i in 0..(RING_CAPACITY + 10) {
            registry.push(vm, &format!("line {}", i)).await;
        }

        let tail = registry.tail(vm, 3).await;
        assert_eq!(
            tail,
            vec![
                format!("line {}", RING_CAPACITY + 7),
                format!("line {}", RING_CAPACITY + 8),
                format!("line {}", RING_CAPACITY + 9),
            ]
        );
    }

    #[tokio::test]
    async fn test_drain_pending_batches_once() {
        let registry = LogRegistry::new();
        let vm = Uuid::from_u128(2);
        registry.push(vm, "a").await;
        registry.push(vm, "b").await;

        let batches = registry.drain_pending().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].lines, vec!["a", "b"]);

        // Nothing left after the drain; the ring still serves tails.
        assert!(registry.drain_pending().await.is_empty());
        assert_eq!(registry.tail(vm, 10).await.len(), 2);
    }

    #[tokio::test]
    async fn test_push_chunk_splits_lines() {
        let registry = LogRegistry::new();
        let vm = Uuid::from_u128(3);
        push_chunk(&registry, vm, "one\ntwo\n\nthree\n").await.unwrap();
        assert_eq!(registry.tail(vm, 10).await, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_tail_unknown_vm_is_empty() {
        let registry = LogRegistry::new();
        assert!(registry.tail(Uuid::from_u128(9), 5).await.is_empty());
    }
}
