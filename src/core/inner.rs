//! Purpose: Execute raw backend calls with bounded concurrency.
//! Exports: `InnerQueue`, `InnerRequest`, `InnerTicket`.
//! Role: Lower tier of the mediator; operations decompose into inner calls here.
//! Invariants: At most `max_concurrent` calls are in the channel at once.
//! Invariants: One dispatcher task grants permits in submission order.
//! Invariants: Every submitted request resolves its ticket exactly once.

use std::sync::Arc;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tracing::{debug, warn};

use crate::core::channel::SharedChannel;
use crate::core::error::{Error, ErrorKind};
use crate::core::session::ContainerConfig;

#[derive(Clone, Debug)]
pub struct InnerRequest {
    pub method: String,
    pub args: Value,
    pub token: Arc<str>,
    pub container: Arc<ContainerConfig>,
}

type Reply = oneshot::Sender<Result<Value, Error>>;

struct Queued {
    request: InnerRequest,
    reply: Reply,
}

#[derive(Clone)]
pub struct InnerQueue {
    pending: mpsc::UnboundedSender<Queued>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

pub struct InnerTicket {
    rx: oneshot::Receiver<Result<Value, Error>>,
}

impl InnerQueue {
    pub fn new(channel: SharedChannel, max_concurrent: usize, runtime: Handle) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let permits = Arc::new(Semaphore::new(max_concurrent));
        let (pending, rx) = mpsc::unbounded_channel();
        runtime.spawn(dispatch(rx, Arc::clone(&permits), channel, runtime.clone()));
        Self {
            pending,
            permits,
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    pub fn submit(&self, request: InnerRequest) -> InnerTicket {
        let (tx, rx) = oneshot::channel();
        let queued = Queued { request, reply: tx };
        if let Err(mpsc::error::SendError(queued)) = self.pending.send(queued) {
            let _ = queued.reply.send(Err(closed()));
        }
        InnerTicket { rx }
    }
}

// Runs until every `InnerQueue` handle is dropped.
async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<Queued>,
    permits: Arc<Semaphore>,
    channel: SharedChannel,
    runtime: Handle,
) {
    while let Some(Queued { request, reply }) = rx.recv().await {
        let permit = match Arc::clone(&permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                let _ = reply.send(Err(closed()));
                continue;
            }
        };
        runtime.spawn(run_call(Arc::clone(&channel), request, reply, permit));
    }
}

async fn run_call(
    channel: SharedChannel,
    request: InnerRequest,
    reply: Reply,
    _permit: OwnedSemaphorePermit,
) {
    debug!(
        method = %request.method,
        container = %request.container.container_identifier,
        "inner call started"
    );
    let result = channel
        .invoke(
            &request.method,
            &request.token,
            &request.container,
            request.args,
        )
        .await;
    if let Err(err) = &result {
        warn!(method = %request.method, error = %err, "inner call failed");
    }
    let _ = reply.send(result);
}

fn closed() -> Error {
    Error::new(ErrorKind::Internal).with_message("inner queue is closed")
}

impl InnerTicket {
    pub async fn outcome(self) -> Result<Value, Error> {
        self.rx.await.unwrap_or_else(|_| {
            Err(Error::new(ErrorKind::Internal).with_message("inner call was dropped"))
        })
    }
}
