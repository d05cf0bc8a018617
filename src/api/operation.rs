//! Purpose: Define the operation abstraction and the driver that executes it.
//! Exports: `Operation`, `OperationBase`, `OperationState`, `OperationHandle`, `Completion`,
//!          `BackendCall`, `CompletionHandler`, `FinishedObserver`.
//! Role: Turns an operation into inner calls and demultiplexes results into one completion.
//! Invariants: The completion handler fires exactly once, then the finished observer.
//! Invariants: A partial failure reports every succeeded item plus a map of exactly the failures.
//! Invariants: Cancellation discards in-flight results and never issues further calls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::error::{Error, ErrorKind, PartialErrors};
use crate::core::inner::{InnerQueue, InnerRequest};
use crate::core::model::DatabaseScope;
use crate::core::queue::{ConflictKey, Job, OuterQueue, QueuePriority};
use crate::core::session::SessionState;
use crate::core::zone::RecordZoneId;

pub type CompletionHandler<T> = Box<dyn FnOnce(Completion<T>) + Send>;
pub type FinishedObserver = Box<dyn FnOnce() + Send>;

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle as seen through a handle.
///
/// Starts at `Queued`, not a created state: an operation only has a handle once submitted.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum OperationState {
    Queued,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Failed | OperationState::Cancelled
        )
    }
}

/// Outcome delivered to an operation's completion handler.
#[derive(Debug)]
pub enum Completion<T> {
    Success(T),
    /// Some items failed; `value` holds every item that succeeded.
    Partial { value: T, error: Error },
    Failure(Error),
}

impl<T> Completion<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Completion::Success(value) | Completion::Partial { value, .. } => Some(value),
            Completion::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Completion::Success(_) => None,
            Completion::Partial { error, .. } | Completion::Failure(error) => Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Completion::Success(_))
    }

    pub fn into_parts(self) -> (Option<T>, Option<Error>) {
        match self {
            Completion::Success(value) => (Some(value), None),
            Completion::Partial { value, error } => (Some(value), Some(error)),
            Completion::Failure(error) => (None, Some(error)),
        }
    }

    fn terminal_state(&self) -> OperationState {
        match self {
            Completion::Success(_) => OperationState::Completed,
            Completion::Failure(error) if error.kind() == ErrorKind::Cancelled => {
                OperationState::Cancelled
            }
            _ => OperationState::Failed,
        }
    }
}

/// Fields every operation carries regardless of its kind.
pub struct OperationBase {
    id: u64,
    container_id: String,
    database: DatabaseScope,
    priority: QueuePriority,
    finished: Option<FinishedObserver>,
}

impl OperationBase {
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            id: NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed),
            container_id: container_id.into(),
            database: DatabaseScope::default(),
            priority: QueuePriority::default(),
            finished: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn database(&self) -> DatabaseScope {
        self.database
    }

    pub fn priority(&self) -> QueuePriority {
        self.priority
    }

    pub fn set_database(&mut self, database: DatabaseScope) {
        self.database = database;
    }

    pub fn set_priority(&mut self, priority: QueuePriority) {
        self.priority = priority;
    }

    pub fn set_finished_observer<F>(&mut self, observer: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.finished = Some(Box::new(observer));
    }

    pub(crate) fn zone_key(&self, zone: &RecordZoneId) -> ConflictKey {
        ConflictKey::Zone {
            container: self.container_id.clone(),
            database: self.database,
            zone: zone.clone(),
        }
    }
}

/// One backend call planned by an operation, tagged with the items it covers.
#[derive(Clone, Debug)]
pub struct BackendCall {
    pub method: String,
    pub args: Value,
    pub item_ids: Vec<String>,
}

/// Result type of an operation; batches fold in one at a time.
pub trait OperationOutput: Default + Send + 'static {
    fn merge(&mut self, batch: Self);
}

pub trait Operation: Send + 'static {
    type Output: OperationOutput;

    fn base(&self) -> &OperationBase;

    fn base_mut(&mut self) -> &mut OperationBase;

    fn completion_slot(&mut self) -> &mut Option<CompletionHandler<Self::Output>>;

    fn conflict_keys(&self) -> Vec<ConflictKey>;

    /// True when there is nothing to send; the operation completes with an empty result.
    fn is_empty(&self) -> bool;

    fn validate(&self) -> Result<(), Error> {
        Ok(())
    }

    fn calls(&self) -> Vec<BackendCall>;

    /// Fold one successful response into `output`, recording per-item failures.
    ///
    /// On `Err` the caller discards whatever was written to `output` and `failures`.
    fn absorb(
        &self,
        call: &BackendCall,
        response: Value,
        output: &mut Self::Output,
        failures: &mut PartialErrors,
    ) -> Result<(), Error>;

    /// Report the items of `call` missing from `failed` as succeeded.
    ///
    /// Used when the channel answers with a bare `PartialFailure` error and no payload.
    fn echo_succeeded(
        &self,
        _call: &BackendCall,
        _failed: &PartialErrors,
        _output: &mut Self::Output,
    ) {
    }

    fn set_completion<F>(&mut self, handler: F)
    where
        F: FnOnce(Completion<Self::Output>) + Send + 'static,
        Self: Sized,
    {
        *self.completion_slot() = Some(Box::new(handler));
    }

    fn set_finished_observer<F>(&mut self, observer: F)
    where
        F: FnOnce() + Send + 'static,
        Self: Sized,
    {
        self.base_mut().set_finished_observer(observer);
    }
}

#[derive(Clone)]
pub(crate) struct Dispatch {
    pub(crate) session: Arc<SessionState>,
    pub(crate) inner: InnerQueue,
}

/// Caller-side view of a submitted operation.
#[derive(Clone)]
pub struct OperationHandle {
    id: u64,
    state: watch::Receiver<OperationState>,
    cancel: CancellationToken,
    queue: Weak<OuterQueue>,
}

impl OperationHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> OperationState {
        *self.state.borrow()
    }

    /// Cancel the operation. Queued work is dropped without any backend call;
    /// executing work finishes its in-flight call and then reports `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
        if let Some(queue) = self.queue.upgrade() {
            queue.cancel_pending(self.id);
        }
    }

    pub async fn wait(&self) -> OperationState {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if state.changed().await.is_err() {
                return *state.borrow();
            }
        }
    }
}

pub(crate) struct OperationJob<O: Operation> {
    op: O,
    dispatch: Dispatch,
    state: watch::Sender<OperationState>,
    cancel: CancellationToken,
    finished: bool,
}

impl<O: Operation> OperationJob<O> {
    pub(crate) fn prepare(
        op: O,
        dispatch: Dispatch,
        queue: &Arc<OuterQueue>,
    ) -> (Self, OperationHandle) {
        let (state_tx, state_rx) = watch::channel(OperationState::Queued);
        let cancel = CancellationToken::new();
        let handle = OperationHandle {
            id: op.base().id(),
            state: state_rx,
            cancel: cancel.clone(),
            queue: Arc::downgrade(queue),
        };
        let job = Self {
            op,
            dispatch,
            state: state_tx,
            cancel,
            finished: false,
        };
        (job, handle)
    }

    pub(crate) fn reject(mut self, error: Error) {
        self.complete(Completion::Failure(error));
    }

    async fn execute(&mut self) -> Completion<O::Output> {
        if let Err(err) = self.op.validate() {
            return Completion::Failure(err);
        }
        if self.op.is_empty() {
            return Completion::Success(O::Output::default());
        }

        let snapshot = self.dispatch.session.snapshot();
        let token = match snapshot.require_token() {
            Ok(token) => token,
            Err(err) => return Completion::Failure(err),
        };
        let container = match snapshot.container(self.op.base().container_id()) {
            Ok(container) => container,
            Err(err) => return Completion::Failure(err),
        };

        let calls = self.op.calls();
        let mut output = O::Output::default();
        let mut failures = PartialErrors::new();
        let mut whole_call_errors: Vec<Error> = Vec::new();

        for call in &calls {
            if self.cancel.is_cancelled() {
                return Completion::Failure(cancelled());
            }
            let result = self
                .dispatch
                .inner
                .submit(InnerRequest {
                    method: call.method.clone(),
                    args: call.args.clone(),
                    token: Arc::clone(&token),
                    container: Arc::clone(&container),
                })
                .outcome()
                .await;
            if self.cancel.is_cancelled() {
                return Completion::Failure(cancelled());
            }

            match result {
                Ok(response) => {
                    // A batch lands whole or not at all.
                    let mut batch = O::Output::default();
                    let mut batch_failures = PartialErrors::new();
                    match self
                        .op
                        .absorb(call, response, &mut batch, &mut batch_failures)
                    {
                        Ok(()) => {
                            output.merge(batch);
                            failures.extend(batch_failures);
                        }
                        Err(err) => {
                            attribute(call, &err, &mut failures);
                            whole_call_errors.push(err);
                        }
                    }
                }
                Err(err) if has_item_detail(&err) => {
                    let detail = err.partial_errors().cloned().unwrap_or_default();
                    self.op.echo_succeeded(call, &detail, &mut output);
                    failures.extend(detail);
                }
                Err(err) => {
                    attribute(call, &err, &mut failures);
                    whole_call_errors.push(err);
                }
            }
        }

        if !calls.is_empty() && whole_call_errors.len() == calls.len() {
            return Completion::Failure(whole_call_errors.swap_remove(0));
        }
        if failures.is_empty() {
            Completion::Success(output)
        } else {
            Completion::Partial {
                value: output,
                error: Error::partial(failures),
            }
        }
    }

    fn complete(&mut self, completion: Completion<O::Output>) {
        if self.finished {
            return;
        }
        self.finished = true;
        let state = completion.terminal_state();
        let id = self.op.base().id();
        match completion.error() {
            Some(err) => info!(id, ?state, error = %err, "operation finished"),
            None => debug!(id, ?state, "operation finished"),
        }
        if let Some(handler) = self.op.completion_slot().take() {
            handler(completion);
        }
        if let Some(observer) = self.op.base_mut().finished.take() {
            observer();
        }
        self.state.send_replace(state);
    }
}

#[async_trait]
impl<O: Operation> Job for OperationJob<O> {
    async fn run(mut self: Box<Self>) {
        if self.cancel.is_cancelled() {
            self.complete(Completion::Failure(cancelled()));
            return;
        }
        self.state.send_replace(OperationState::Executing);
        let completion = self.execute().await;
        let completion = if self.cancel.is_cancelled() {
            Completion::Failure(cancelled())
        } else {
            completion
        };
        self.complete(completion);
    }

    fn cancel(mut self: Box<Self>) {
        self.complete(Completion::Failure(cancelled()));
    }
}

impl<O: Operation> Drop for OperationJob<O> {
    fn drop(&mut self) {
        // Dropped unfinished only when the runtime shuts down under the job.
        if !self.finished {
            self.complete(Completion::Failure(
                cancelled().with_message("operation dropped before completion"),
            ));
        }
    }
}

pub(crate) fn cancelled() -> Error {
    Error::new(ErrorKind::Cancelled).with_message("operation was cancelled")
}

fn has_item_detail(err: &Error) -> bool {
    err.kind() == ErrorKind::PartialFailure
        && err.partial_errors().is_some_and(|detail| !detail.is_empty())
}

// A whole-call failure fails every item that call carried.
fn attribute(call: &BackendCall, err: &Error, failures: &mut PartialErrors) {
    for item in &call.item_ids {
        failures.insert(item.clone(), err.clone());
    }
}
