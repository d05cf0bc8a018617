//! Purpose: Admit client operations and run them with bounded, conflict-aware concurrency.
//! Exports: `OuterQueue`, `Job`, `ConflictKey`, `QueuePriority`.
//! Role: Upper tier of the mediator; decides which submitted operation runs next.
//! Invariants: Jobs sharing a conflict key start in submission order, regardless of priority.
//! Invariants: Among non-conflicting jobs, higher priority first, then FIFO.
//! Invariants: A job is either run once or cancelled once, never both.

use std::cmp::Reverse;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::core::model::DatabaseScope;
use crate::core::zone::RecordZoneId;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub enum QueuePriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Resource an operation touches; overlapping keys force submission order.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum ConflictKey {
    Zone {
        container: String,
        database: DatabaseScope,
        zone: RecordZoneId,
    },
    Subscriptions {
        container: String,
        database: DatabaseScope,
    },
    /// Whole-database work (e.g. listing every zone); conflicts with all keys in scope.
    Database {
        container: String,
        database: DatabaseScope,
    },
}

impl ConflictKey {
    fn scope(&self) -> (&str, DatabaseScope) {
        match self {
            ConflictKey::Zone {
                container,
                database,
                ..
            }
            | ConflictKey::Subscriptions {
                container,
                database,
            }
            | ConflictKey::Database {
                container,
                database,
            } => (container.as_str(), *database),
        }
    }

    pub fn conflicts_with(&self, other: &ConflictKey) -> bool {
        if self.scope() != other.scope() {
            return false;
        }
        matches!(self, ConflictKey::Database { .. })
            || matches!(other, ConflictKey::Database { .. })
            || self == other
    }
}

fn keys_conflict(left: &[ConflictKey], right: &[ConflictKey]) -> bool {
    left.iter()
        .any(|a| right.iter().any(|b| a.conflicts_with(b)))
}

#[async_trait]
pub trait Job: Send + 'static {
    async fn run(self: Box<Self>);

    /// Called instead of `run` when the job is removed before it started.
    fn cancel(self: Box<Self>);
}

struct PendingJob {
    id: u64,
    seq: u64,
    priority: QueuePriority,
    keys: Vec<ConflictKey>,
    job: Box<dyn Job>,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<PendingJob>,
    running: Vec<(u64, Vec<ConflictKey>)>,
    next_seq: u64,
}

pub struct OuterQueue {
    state: Mutex<QueueState>,
    max_concurrent: usize,
    runtime: Handle,
}

impl OuterQueue {
    pub fn new(max_concurrent: usize, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            max_concurrent: max_concurrent.max(1),
            runtime,
        })
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn running_len(&self) -> usize {
        self.lock().running.len()
    }

    pub fn submit(
        self: &Arc<Self>,
        id: u64,
        priority: QueuePriority,
        keys: Vec<ConflictKey>,
        job: Box<dyn Job>,
    ) {
        {
            let mut state = self.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            trace!(id, seq, ?priority, "operation queued");
            state.pending.push(PendingJob {
                id,
                seq,
                priority,
                keys,
                job,
            });
        }
        self.pump();
    }

    /// Remove a job that has not started yet. Returns false once it is running or gone.
    pub fn cancel_pending(&self, id: u64) -> bool {
        let removed = {
            let mut state = self.lock();
            let index = state.pending.iter().position(|pending| pending.id == id);
            index.map(|index| state.pending.remove(index))
        };
        match removed {
            Some(pending) => {
                debug!(id, "queued operation cancelled");
                pending.job.cancel();
                true
            }
            None => false,
        }
    }

    fn pump(self: &Arc<Self>) {
        let ready = {
            let mut state = self.lock();
            let mut ready = Vec::new();
            while state.running.len() < self.max_concurrent {
                let Some(index) = next_eligible(&state) else {
                    break;
                };
                let pending = state.pending.remove(index);
                state.running.push((pending.id, pending.keys.clone()));
                ready.push(pending);
            }
            ready
        };

        for pending in ready {
            let guard = RunningGuard {
                queue: Arc::clone(self),
                id: pending.id,
            };
            trace!(id = pending.id, seq = pending.seq, "operation dispatched");
            self.runtime.spawn(async move {
                let _guard = guard;
                pending.job.run().await;
            });
        }
    }

    fn finish(self: &Arc<Self>, id: u64) {
        {
            let mut state = self.lock();
            state.running.retain(|(running_id, _)| *running_id != id);
        }
        self.pump();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// Releases the running slot even if the job future is dropped or panics.
struct RunningGuard {
    queue: Arc<OuterQueue>,
    id: u64,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.queue.finish(self.id);
    }
}

fn next_eligible(state: &QueueState) -> Option<usize> {
    let mut order: Vec<usize> = (0..state.pending.len()).collect();
    order.sort_by_key(|&index| {
        let pending = &state.pending[index];
        (Reverse(pending.priority), pending.seq)
    });

    order.into_iter().find(|&index| {
        let candidate = &state.pending[index];
        let blocked_by_running = state
            .running
            .iter()
            .any(|(_, keys)| keys_conflict(keys, &candidate.keys));
        let blocked_by_earlier = state
            .pending
            .iter()
            .any(|other| other.seq < candidate.seq && keys_conflict(&other.keys, &candidate.keys));
        !blocked_by_running && !blocked_by_earlier
    })
}
