//! The worker pool: ready list, on-demand growth, idle reclamation.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::task::Task;
use crate::WorkerPoolError;

/// Capacity of each worker's private task queue.
///
/// A single slot keeps `assign` non-blocking: an idle or freshly spawned
/// worker always has the slot free.
const WORKER_QUEUE_CAPACITY: usize = 1;

type TaskSlot = Option<Box<dyn Task>>;

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Floor the idle sweep never shrinks below
    pub min_workers: usize,
    /// Hard cap on concurrently live workers
    pub max_workers: usize,
    /// How long a worker may sit idle before becoming reclaimable
    pub idle_window: Duration,
    /// Interval between idle sweeps
    pub sweep_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 10,
            max_workers: 256 * 1024,
            idle_window: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

/// A parked worker: its task sender and when it last finished work.
struct IdleWorker {
    tx: mpsc::Sender<TaskSlot>,
    last_use: Instant,
}

struct PoolInner {
    /// Idle workers, ascending by `last_use`; reuse pops the back (most
    /// recently idle), reclamation drains the front.
    ready: Vec<IdleWorker>,
    current: usize,
    must_stop: bool,
}

/// A dynamically sized pool of workers.
///
/// Workers are created lazily on demand up to `max_workers` and reclaimed
/// once idle past `idle_window`, down to `min_workers`. [`stop`] is
/// terminal: every idle worker is told to exit and all future assigns fail.
///
/// [`stop`]: WorkerPool::stop
pub struct WorkerPool {
    config: WorkerPoolConfig,
    inner: Arc<Mutex<PoolInner>>,
    sweeper: Mutex<Option<watch::Sender<bool>>>,
}

impl WorkerPool {
    /// Create a pool; call [`start`](WorkerPool::start) to begin idle sweeps
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(PoolInner {
                ready: Vec::new(),
                current: 0,
                must_stop: false,
            })),
            sweeper: Mutex::new(None),
        }
    }

    /// Begin the periodic idle sweep. A second call is a no-op.
    pub fn start(&self) {
        let mut sweeper = lock(&self.sweeper);
        if sweeper.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        *sweeper = Some(stop_tx);

        let inner = Arc::clone(&self.inner);
        let config = self.config.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(
                Instant::now() + config.sweep_interval,
                config.sweep_interval,
            );
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = timer.tick() => sweep_idle(&inner, &config).await,
                }
            }
        });
    }

    /// Stop the pool: end the sweep, terminate every idle worker, and fail
    /// all future assigns. Terminal for this pool instance.
    pub fn stop(&self) {
        if let Some(stop_tx) = lock(&self.sweeper).take() {
            let _ = stop_tx.send(true);
        }

        let drained: Vec<IdleWorker> = {
            let mut inner = lock(&self.inner);
            inner.must_stop = true;
            inner.ready.drain(..).collect()
        };

        info!(workers = drained.len(), "stopping worker pool");
        for worker in drained {
            let _ = worker.tx.try_send(None);
        }
    }

    /// Hand `task` to an available worker, reusing the most recently idle
    /// one or creating a new worker if the pool is below its maximum.
    ///
    /// Never blocks; fails with [`WorkerPoolError::TooManyWorkers`] when the
    /// cap is reached with no idle worker, or
    /// [`WorkerPoolError::Stopped`] after [`stop`](WorkerPool::stop). The
    /// pool never retries internally; the caller decides.
    pub fn assign(&self, task: Box<dyn Task>) -> Result<(), WorkerPoolError> {
        let worker = self.acquire_worker()?;
        match worker.tx.try_send(Some(task)) {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!("acquired worker refused task, dropping it");
                Err(WorkerPoolError::WorkerUnavailable)
            }
        }
    }

    /// Number of live workers
    pub fn current_workers(&self) -> usize {
        lock(&self.inner).current
    }

    /// Number of idle workers in the ready list
    pub fn idle_workers(&self) -> usize {
        lock(&self.inner).ready.len()
    }

    fn acquire_worker(&self) -> Result<IdleWorker, WorkerPoolError> {
        {
            let mut inner = lock(&self.inner);
            if inner.must_stop {
                return Err(WorkerPoolError::Stopped);
            }
            if let Some(worker) = inner.ready.pop() {
                return Ok(worker);
            }
            if inner.current >= self.config.max_workers {
                drop(inner);
                warn!(max = self.config.max_workers, "worker pool exhausted");
                return Err(WorkerPoolError::TooManyWorkers(self.config.max_workers));
            }
            inner.current += 1;
        }

        let (tx, rx) = mpsc::channel(WORKER_QUEUE_CAPACITY);
        tokio::spawn(worker_loop(rx, tx.clone(), Arc::clone(&self.inner)));
        Ok(IdleWorker {
            tx,
            last_use: Instant::now(),
        })
    }
}

/// One worker: wait for a task, run it to completion, offer itself back.
///
/// The `None` sentinel means terminate. Self-release loses the race against
/// `stop` exactly when `must_stop` is observed under the lock; the worker
/// then exits instead of re-entering the ready list, and `current` is
/// decremented exactly once either way.
async fn worker_loop(
    mut rx: mpsc::Receiver<TaskSlot>,
    tx: mpsc::Sender<TaskSlot>,
    inner: Arc<Mutex<PoolInner>>,
) {
    while let Some(slot) = rx.recv().await {
        let Some(task) = slot else { break };
        task.run().await;

        let released = {
            let mut inner = lock(&inner);
            if inner.must_stop {
                false
            } else {
                inner.ready.push(IdleWorker {
                    tx: tx.clone(),
                    last_use: Instant::now(),
                });
                true
            }
        };
        if !released {
            break;
        }
    }

    lock(&inner).current -= 1;
    debug!("worker terminated");
}

/// Evict workers idle since before `now - idle_window`, never below the
/// minimum. The ready list's ascending-by-`last_use` invariant makes the
/// cut point a binary search; eviction happens under the lock, the
/// (potentially slow) sentinel sends happen outside it.
async fn sweep_idle(inner: &Arc<Mutex<PoolInner>>, config: &WorkerPoolConfig) {
    let Some(critical) = Instant::now().checked_sub(config.idle_window) else {
        return;
    };

    let evicted: Vec<IdleWorker> = {
        let mut inner = lock(inner);
        let n = inner.ready.len();
        if n <= config.min_workers {
            return;
        }

        let cut = inner
            .ready
            .partition_point(|w| w.last_use < critical)
            .min(n - config.min_workers);
        if cut == 0 {
            return;
        }
        inner.ready.drain(..cut).collect()
    };

    info!(count = evicted.len(), "reclaiming idle workers");
    for worker in evicted {
        let _ = worker.tx.send(None).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
