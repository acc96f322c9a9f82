use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;
use tracing::{Instrument, error, info};
use uuid::Uuid;

/// A domain reconciler: advances one object one FSM step per invocation.
///
/// Implementations read the current row, decide the next transition, and
/// apply it with an update-if-still-in-expected-state guard, so repeat
/// invocations are always safe.
///
/// The return value is the next run delay for this object; `None` falls
/// back to the kernel's default interval.
pub trait Reconcile: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn reconcile(&self, id: Uuid) -> impl Future<Output = Result<Option<Duration>>> + Send;
}

/// Kernel tuning. The defaults match the production cadence; tests shrink
/// them to keep the suite fast.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Worker tasks pulling due objects.
    pub workers: usize,
    /// Scan interval of the due-queue ticker.
    pub tick_interval: Duration,
    /// Delay before retrying an object whose reconcile returned an error.
    pub retry_delay: Duration,
    /// Next run for objects whose reconcile returned no schedule.
    pub default_interval: Duration,
    /// Bound of the due-work channel.
    pub queue_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            tick_interval: Duration::from_secs(1),
            retry_delay: Duration::from_secs(5),
            default_interval: Duration::from_secs(3600),
            queue_capacity: 64,
        }
    }
}

struct KernelState {
    /// objectId → next run time.
    schedule: HashMap<Uuid, Instant>,
    /// Objects currently being reconciled. Guarantees at most one
    /// concurrent reconciliation per object id.
    inflight: HashSet<Uuid>,
}

struct Shared<R> {
    reconciler: R,
    config: KernelConfig,
    state: Mutex<KernelState>,
}

/// Handle for scheduling objects onto a running kernel and shutting it
/// down. Cloneable; all clones address the same kernel.
pub struct KernelHandle<R> {
    shared: Arc<Shared<R>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<R> Clone for KernelHandle<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }
}

impl<R: Reconcile> KernelHandle<R> {
    /// Set the next run time for an object, replacing any existing entry.
    pub async fn schedule(&self, id: Uuid, after: Duration) {
        let mut state = self.shared.state.lock().await;
        state.schedule.insert(id, Instant::now() + after);
    }

    /// Schedule an object only if the kernel is not already tracking it
    /// (neither scheduled nor in flight). Used by the periodic seed scan so
    /// it never disturbs objects with a live schedule.
    pub async fn schedule_if_untracked(&self, id: Uuid, after: Duration) {
        let mut state = self.shared.state.lock().await;
        if !state.schedule.contains_key(&id) && !state.inflight.contains(&id) {
            state.schedule.insert(id, Instant::now() + after);
        }
    }

    /// Number of objects currently tracked (scheduled or in flight).
    pub async fn tracked(&self) -> usize {
        let state = self.shared.state.lock().await;
        let inflight_only = state
            .inflight
            .iter()
            .filter(|id| !state.schedule.contains_key(id))
            .count();
        state.schedule.len() + inflight_only
    }

    /// Stop the ticker and workers. In-flight reconciles finish their
    /// current invocation.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Start a reconciler kernel: one ticker moving due objects into a bounded
/// channel, plus a fixed worker pool draining it.
pub fn start<R: Reconcile>(reconciler: R, config: KernelConfig) -> KernelHandle<R> {
    let shared = Arc::new(Shared {
        reconciler,
        config: config.clone(),
        state: Mutex::new(KernelState {
            schedule: HashMap::new(),
            inflight: HashSet::new(),
        }),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (work_tx, work_rx) = mpsc::channel::<Uuid>(config.queue_capacity);
    let work_rx = Arc::new(Mutex::new(work_rx));

    // Ticker: scan the schedule, move due ids that are not in flight into
    // the channel, clear their schedule entry, mark them in flight.
    {
        let shared = Arc::clone(&shared);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(shared.config.tick_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = shutdown.changed() => break,
                }

                let now = Instant::now();
                let due: Vec<Uuid> = {
                    let state = shared.state.lock().await;
                    state
                        .schedule
                        .iter()
                        .filter(|(id, at)| **at <= now && !state.inflight.contains(id))
                        .map(|(id, _)| *id)
                        .collect()
                };

                for id in due {
                    let mut state = shared.state.lock().await;
                    state.schedule.remove(&id);
                    state.inflight.insert(id);
                    drop(state);

                    if work_tx.try_send(id).is_err() {
                        // Queue full: put the object back and let a later
                        // tick retry.
                        let mut state = shared.state.lock().await;
                        state.inflight.remove(&id);
                        state.schedule.insert(id, now);
                    }
                }
            }
        });
    }

    for worker in 0..config.workers {
        let shared = Arc::clone(&shared);
        let work_rx = Arc::clone(&work_rx);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                let id = {
                    let mut rx = work_rx.lock().await;
                    tokio::select! {
                        maybe = rx.recv() => match maybe {
                            Some(id) => id,
                            None => break,
                        },
                        _ = shutdown.changed() => break,
                    }
                };

                run_one(&shared, worker, id).await;
            }
        });
    }

    KernelHandle {
        shared,
        shutdown_tx,
    }
}

async fn run_one<R: Reconcile>(shared: &Arc<Shared<R>>, worker: usize, id: Uuid) {
    let name = shared.reconciler.name();
    let span = tracing::info_span!("reconcile", reconciler = name, object = %id, worker);

    let result = shared.reconciler.reconcile(id).instrument(span).await;

    let mut state = shared.state.lock().await;
    state.inflight.remove(&id);

    match result {
        Ok(next) => {
            info!(reconciler = name, object = %id, "Reconcile tick complete");
            match next {
                Some(after) => {
                    state.schedule.insert(id, Instant::now() + after);
                }
                None => {
                    // Default schedule, unless the handler (or anyone else)
                    // already placed one while we ran.
                    state
                        .schedule
                        .entry(id)
                        .or_insert_with(|| Instant::now() + shared.config.default_interval);
                }
            }
        }
        Err(e) => {
            error!(reconciler = name, object = %id, error = %e, "Reconcile failed");
            state
                .schedule
                .insert(id, Instant::now() + shared.config.retry_delay);
        }
    }
}
