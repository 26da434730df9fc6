//! The worker pool.
//!
//! # State
//!
//! Slots live in one map keyed by a never reused index. A slot is either
//! idle (its index sits in the idle queue) or busy with exactly one task.
//! Every membership change happens under the slot lock, so of a concurrent
//! `drop` (via the idle queue) and `cancel` (via a scan for the task id)
//! only one ever observes a given worker.
//!
//! # Thread Safety
//!
//! The idle queue's receiver is behind a tokio `Mutex`, which queues waiters
//! in arrival order and so gives FIFO handoff. The std `Mutex` around the
//! slots is never held across an await.

use super::executor::{Executor, ExecutorFactory, TaskParams};
use crate::cancel::CancellationToken;
use crate::protocol::TaskOutput;
use crate::{ProviderError, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// Pool size and number of running tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub pool_size: usize,
    pub active_tasks: usize,
}

/// What one worker is doing right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub index: usize,
    pub busy: bool,
    pub task_id: Option<String>,
    pub started: Option<DateTime<Utc>>,
}

type Observer = Arc<dyn Fn(PoolSnapshot) + Send + Sync>;

struct BusyInfo {
    task_id: String,
    started: DateTime<Utc>,
    token: CancellationToken,
    abort: Option<AbortHandle>,
}

struct Slot {
    executor: Arc<dyn Executor>,
    busy: Option<BusyInfo>,
}

#[derive(Default)]
struct PoolState {
    slots: BTreeMap<usize, Slot>,
    /// Executors being created; they count as members so a pool that is
    /// replacing its last worker is not mistaken for an empty one.
    spawning: usize,
    /// Bumped by `killall`; spawns reserved under an older generation are
    /// discarded when they complete.
    generation: u64,
}

impl PoolState {
    fn members(&self) -> usize {
        self.slots.len() + self.spawning
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            pool_size: self.slots.len(),
            active_tasks: self.slots.values().filter(|s| s.busy.is_some()).count(),
        }
    }
}

struct PoolInner {
    capacity: usize,
    factory: Arc<dyn ExecutorFactory>,
    state: Mutex<PoolState>,
    next_index: AtomicUsize,
    idle_tx: mpsc::UnboundedSender<usize>,
    idle_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<usize>>,
    members: watch::Sender<usize>,
    scale_lock: tokio::sync::Mutex<()>,
    observer: Mutex<Option<Observer>>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, state: &PoolState) -> PoolSnapshot {
        self.members.send_replace(state.members());
        state.snapshot()
    }

    fn notify(&self, snapshot: PoolSnapshot) {
        let observer = self.observer.lock().ok().and_then(|o| o.clone());
        if let Some(observer) = observer {
            observer(snapshot);
        }
    }
}

/// Pool of task executors.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.inner.capacity)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl WorkerPool {
    /// Create an empty pool; call [`WorkerPool::scale`] to start executors.
    pub fn new(factory: Arc<dyn ExecutorFactory>, capacity: usize) -> Self {
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        let (members, _) = watch::channel(0);
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                factory,
                state: Mutex::new(PoolState::default()),
                next_index: AtomicUsize::new(0),
                idle_tx,
                idle_rx: tokio::sync::Mutex::new(idle_rx),
                members,
                scale_lock: tokio::sync::Mutex::new(()),
                observer: Mutex::new(None),
            }),
        }
    }

    /// Call `observer` whenever the pool size or the number of busy workers
    /// changes.
    pub fn set_observer<F>(&self, observer: F)
    where
        F: Fn(PoolSnapshot) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.inner.observer.lock() {
            *slot = Some(Arc::new(observer));
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of executors in the pool.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        self.inner.lock().snapshot()
    }

    /// Busy flag of every worker, in index order.
    pub fn busy(&self) -> Vec<bool> {
        self.inner
            .lock()
            .slots
            .values()
            .map(|s| s.busy.is_some())
            .collect()
    }

    pub fn any_idle(&self) -> bool {
        self.inner.lock().slots.values().any(|s| s.busy.is_none())
    }

    pub fn current_tasks(&self) -> Vec<WorkerInfo> {
        self.inner
            .lock()
            .slots
            .iter()
            .map(|(index, slot)| WorkerInfo {
                index: *index,
                busy: slot.busy.is_some(),
                task_id: slot.busy.as_ref().map(|b| b.task_id.clone()),
                started: slot.busy.as_ref().map(|b| b.started),
            })
            .collect()
    }

    /// Add one executor. Fails when the pool is at capacity.
    pub async fn spawn(&self) -> Result<usize> {
        let generation = {
            let mut state = self.inner.lock();
            if state.members() >= self.inner.capacity {
                return Err(ProviderError::SpawnFailed {
                    message: format!("pool is at capacity ({})", self.inner.capacity),
                });
            }
            state.spawning += 1;
            self.inner.publish(&state);
            state.generation
        };
        self.spawn_reserved(generation).await?;
        Ok(self.len())
    }

    /// Create an executor for a slot counted in `spawning` during `generation`.
    async fn spawn_reserved(&self, generation: u64) -> Result<usize> {
        let index = self.inner.next_index.fetch_add(1, Ordering::SeqCst);
        let spawned = self.inner.factory.spawn(index).await;

        let snapshot = {
            let mut state = self.inner.lock();
            if state.generation != generation {
                // killall already released the reservation
                drop(state);
                if let Ok(executor) = spawned {
                    executor.terminate();
                }
                debug!("Discarded executor {} spawned before killall", index);
                return Err(ProviderError::SpawnFailed {
                    message: "pool was killed".to_string(),
                });
            }
            state.spawning -= 1;
            if let Ok(executor) = &spawned {
                state.slots.insert(
                    index,
                    Slot {
                        executor: executor.clone(),
                        busy: None,
                    },
                );
                let _ = self.inner.idle_tx.send(index);
            }
            self.inner.publish(&state)
        };
        self.inner.notify(snapshot);

        match spawned {
            Ok(_) => {
                info!("Spawned executor {}", index);
                Ok(index)
            }
            Err(e) => {
                error!("Failed to spawn executor {}: {}", index, e);
                Err(e)
            }
        }
    }

    /// Grow or shrink toward `n`, clamped to the capacity.
    ///
    /// Shrinking only ever removes idle executors, so scaling to zero
    /// returns once every running task has finished.
    pub async fn scale(&self, n: usize) -> Result<usize> {
        let _guard = self.inner.scale_lock.lock().await;
        let target = n.min(self.inner.capacity);
        debug!("Scaling pool from {} to {}", self.len(), target);

        while self.inner.lock().members() < target {
            self.spawn().await?;
        }
        if target == 0 {
            self.shutdown().await;
        }
        while self.inner.lock().members() > target {
            self.drop_worker().await;
        }
        Ok(self.len())
    }

    /// Drop every executor as soon as it is idle, all at once.
    async fn shutdown(&self) {
        let count = self.inner.lock().members();
        let drops = (0..count).map(|_| self.drop_worker());
        futures::future::join_all(drops).await;
    }

    /// Remove one idle executor, waiting for one to become idle.
    ///
    /// Returns the remaining pool size.
    pub async fn drop_worker(&self) -> usize {
        if self.inner.lock().members() == 0 {
            return 0;
        }
        let removed = self
            .take_idle(|state, index| match state.slots.get(&index) {
                Some(slot) if slot.busy.is_none() => state.slots.remove(&index),
                _ => None,
            })
            .await;

        if let Some((index, slot)) = removed {
            slot.executor.terminate();
            info!("Dropped executor {}", index);
        }
        self.len()
    }

    /// Forcefully terminate every executor, busy or not.
    pub fn killall(&self) {
        let (slots, snapshot) = {
            let mut state = self.inner.lock();
            let slots = std::mem::take(&mut state.slots);
            state.spawning = 0;
            state.generation += 1;
            let snapshot = self.inner.publish(&state);
            (slots, snapshot)
        };
        if slots.is_empty() {
            self.inner.notify(snapshot);
            return;
        }
        warn!("Killing all {} executors", slots.len());

        for (_, slot) in slots {
            if let Some(busy) = slot.busy {
                busy.token.cancel();
                if let Some(abort) = busy.abort {
                    abort.abort();
                }
            }
            slot.executor.terminate();
        }
        if let Ok(mut idle) = self.inner.idle_rx.try_lock() {
            while idle.try_recv().is_ok() {}
        }
        self.inner.notify(snapshot);
    }

    /// Cancel the task `task_id` by terminating its executor and spawning a
    /// replacement. Returns false if no worker runs that task.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let (removed, generation, snapshot) = {
            let mut state = self.inner.lock();
            let index = state
                .slots
                .iter()
                .find(|(_, s)| s.busy.as_ref().is_some_and(|b| b.task_id == task_id))
                .map(|(index, _)| *index);
            let Some(index) = index else {
                return false;
            };
            let removed = state.slots.remove(&index).map(|slot| (index, slot));
            // reserve the replacement before releasing the lock
            state.spawning += 1;
            (removed, state.generation, self.inner.publish(&state))
        };

        if let Some((index, slot)) = removed {
            warn!("Cancelling task {} on executor {}", task_id, index);
            if let Some(busy) = slot.busy {
                busy.token.cancel();
                if let Some(abort) = busy.abort {
                    abort.abort();
                }
            }
            slot.executor.terminate();
        }
        self.inner.notify(snapshot);

        let _ = self.spawn_reserved(generation).await;
        true
    }

    /// Run a task on the next idle executor, waiting for one if all are busy.
    ///
    /// The outcome is either the task result or [`ProviderError::TaskCancelled`]
    /// when the task was cancelled while it ran.
    pub async fn run_task(&self, task_id: &str, params: TaskParams) -> Result<TaskOutput> {
        if self.inner.capacity == 0 || self.inner.lock().members() == 0 {
            return Err(ProviderError::NoWorkers);
        }

        let token = CancellationToken::new();
        let claimed = self
            .take_idle(|state, index| {
                let slot = state.slots.get_mut(&index)?;
                if slot.busy.is_some() {
                    return None;
                }
                slot.busy = Some(BusyInfo {
                    task_id: task_id.to_string(),
                    started: Utc::now(),
                    token: token.clone(),
                    abort: None,
                });
                Some(slot.executor.clone())
            })
            .await;
        let Some((index, executor)) = claimed else {
            return Err(ProviderError::NoWorkers);
        };
        debug!("Task {} assigned to executor {}", task_id, index);

        let run_id = task_id.to_string();
        let worker = executor.clone();
        let mut handle = tokio::spawn(async move { worker.run(&run_id, params).await });
        {
            let mut state = self.inner.lock();
            match state.slots.get_mut(&index).and_then(|s| s.busy.as_mut()) {
                Some(busy) => busy.abort = Some(handle.abort_handle()),
                // cancelled before the run started
                None => handle.abort(),
            }
        }

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            joined = &mut handle => Some(joined),
        };
        if outcome.is_none() {
            handle.abort();
        }

        let crashed = !matches!(outcome, Some(Ok(_)));
        let (ours, respawn, generation, snapshot) = {
            let mut state = self.inner.lock();
            let generation = state.generation;
            if !state.slots.contains_key(&index) {
                (false, false, generation, state.snapshot())
            } else if crashed || executor.respawn_after_task() {
                state.slots.remove(&index);
                state.spawning += 1;
                (true, true, generation, self.inner.publish(&state))
            } else {
                if let Some(slot) = state.slots.get_mut(&index) {
                    slot.busy = None;
                }
                let _ = self.inner.idle_tx.send(index);
                (true, false, generation, state.snapshot())
            }
        };

        if !ours {
            return Err(ProviderError::TaskCancelled {
                task_id: task_id.to_string(),
            });
        }
        self.inner.notify(snapshot);
        if respawn {
            debug!("Respawning executor {} after task {}", index, task_id);
            executor.terminate();
            // the failure is already logged and the pool stays one short
            let _ = self.spawn_reserved(generation).await;
        }

        match outcome {
            Some(Ok(result)) => result,
            Some(Err(e)) if e.is_panic() => Err(ProviderError::ExecutorCrashed {
                index,
                message: panic_message(e.into_panic()),
            }),
            _ => Err(ProviderError::TaskCancelled {
                task_id: task_id.to_string(),
            }),
        }
    }

    /// Take indices off the idle queue until `claim` accepts one.
    ///
    /// Indices whose slot is gone are skipped. Returns `None` once the pool
    /// has no members left.
    async fn take_idle<T>(
        &self,
        mut claim: impl FnMut(&mut PoolState, usize) -> Option<T>,
    ) -> Option<(usize, T)> {
        let mut members = self.inner.members.subscribe();
        let mut idle = self.inner.idle_rx.lock().await;
        loop {
            tokio::select! {
                biased;
                index = idle.recv() => {
                    let index = index?;
                    let (claimed, snapshot) = {
                        let mut state = self.inner.lock();
                        let claimed = claim(&mut state, index);
                        (claimed, self.inner.publish(&state))
                    };
                    if let Some(value) = claimed {
                        self.inner.notify(snapshot);
                        return Some((index, value));
                    }
                }
                _ = members.wait_for(|n| *n == 0) => return None,
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "executor panicked".to_string()
    }
}
