//! Purpose: Single entry point that owns session state, both queues, and the call channel.
//! Exports: `Mediator`.
//! Role: Client code submits operations and manages the session only through this type.
//! Invariants: An operation naming an unregistered container is rejected before queueing.
//! Invariants: Without a session token an operation completes `NotAuthenticated` and is never queued.
//! Invariants: Push registration issues at most one successful backend call per mediator.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio::sync::{OnceCell, broadcast};
use tracing::{debug, info, warn};

use crate::api::config::MediatorConfig;
use crate::api::events::AccountStatusEvent;
use crate::api::operation::{Dispatch, Operation, OperationHandle, OperationJob};
use crate::core::channel::SharedChannel;
use crate::core::error::{Error, ErrorKind};
use crate::core::inner::{InnerQueue, InnerRequest, InnerTicket};
use crate::core::model::{AccountStatus, DatabaseScope};
use crate::core::queue::OuterQueue;
use crate::core::session::{ContainerConfig, SessionSnapshot, SessionState};

const REGISTER_METHOD: &str = "tokens/register";
const CURRENT_USER_METHOD: &str = "users/current";

#[derive(Clone)]
pub struct Mediator {
    inner: Arc<MediatorInner>,
}

struct MediatorInner {
    config: MediatorConfig,
    session: Arc<SessionState>,
    outer: Arc<OuterQueue>,
    calls: InnerQueue,
    runtime: Handle,
    registration: OnceCell<AccountStatus>,
    last_status: Mutex<Option<AccountStatus>>,
    events: broadcast::Sender<AccountStatusEvent>,
}

impl Mediator {
    /// Build a mediator on the current tokio runtime.
    pub fn new(channel: SharedChannel, config: MediatorConfig) -> Result<Self, Error> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("mediator requires a tokio runtime")
                .with_hint("Construct the mediator from within a tokio runtime context.")
                .with_source(err)
        })?;
        let outer = OuterQueue::new(config.outer_concurrency, runtime.clone());
        let calls = InnerQueue::new(channel, config.inner_concurrency, runtime.clone());
        let (events, _) = broadcast::channel(config.event_buffer);
        debug!(
            outer = config.outer_concurrency,
            inner = config.inner_concurrency,
            "mediator created"
        );
        Ok(Self {
            inner: Arc::new(MediatorInner {
                config,
                session: Arc::new(SessionState::new()),
                outer,
                calls,
                runtime,
                registration: OnceCell::new(),
                last_status: Mutex::new(None),
                events,
            }),
        })
    }

    pub fn config(&self) -> &MediatorConfig {
        &self.inner.config
    }

    pub fn set_session_token(&self, token: impl Into<String>) -> Result<(), Error> {
        self.inner.session.set_session_token(token)
    }

    pub fn clear_session_token(&self) {
        self.inner.session.clear_session_token();
    }

    pub fn session(&self) -> Arc<SessionSnapshot> {
        self.inner.session.snapshot()
    }

    pub fn register_container(&self, config: ContainerConfig) -> Result<(), Error> {
        self.inner.session.register_container(config)
    }

    pub fn info_for_container(&self, container_id: &str) -> Result<Arc<ContainerConfig>, Error> {
        self.inner.session.info_for_container(container_id)
    }

    /// Submit an operation to the outer queue.
    ///
    /// Returns `UnknownContainer` without queueing (and without firing the callback) when
    /// the operation names a container that was never registered. With no session token the
    /// operation is not queued either; its callback receives `NotAuthenticated`.
    pub fn add_operation<O: Operation>(&self, op: O) -> Result<OperationHandle, Error> {
        let snapshot = self.inner.session.snapshot();
        snapshot.container(op.base().container_id())?;

        let id = op.base().id();
        let priority = op.base().priority();
        let keys = op.conflict_keys();
        let dispatch = Dispatch {
            session: Arc::clone(&self.inner.session),
            inner: self.inner.calls.clone(),
        };
        let (job, handle) = OperationJob::prepare(op, dispatch, &self.inner.outer);

        if let Err(err) = snapshot.require_token() {
            debug!(id, "operation rejected without session token");
            self.inner.runtime.spawn(async move { job.reject(err) });
            return Ok(handle);
        }

        self.inner.outer.submit(id, priority, keys, Box::new(job));
        Ok(handle)
    }

    /// Queue one raw backend call, bypassing the outer queue.
    pub fn add_inner_operation(
        &self,
        container_id: &str,
        method: impl Into<String>,
        args: Value,
    ) -> Result<InnerTicket, Error> {
        let snapshot = self.inner.session.snapshot();
        let container = snapshot.container(container_id)?;
        let token = snapshot.require_token()?;
        Ok(self.inner.calls.submit(InnerRequest {
            method: method.into(),
            args,
            token,
            container,
        }))
    }

    /// Register the session for push delivery.
    ///
    /// Only the first successful call reaches the backend; later and concurrent callers share
    /// its status. A failed attempt is not remembered, so the next call tries again.
    pub async fn register_for_remote_notifications(&self) -> Result<AccountStatus, Error> {
        let status = self
            .inner
            .registration
            .get_or_try_init(|| async {
                let container = self.default_container()?;
                let args = json!({ "apnsEnvironment": container.environment.as_str() });
                let response = self
                    .add_inner_operation(&container.container_identifier, REGISTER_METHOD, args)?
                    .outcome()
                    .await?;
                let status = status_from_response(&response);
                info!(status = status.as_str(), "registered for remote notifications");
                Ok::<_, Error>(status)
            })
            .await?;
        self.publish_status(*status);
        Ok(*status)
    }

    /// Ask the backend for the current account status and publish it if it changed.
    pub async fn refresh_account_status(&self) -> Result<AccountStatus, Error> {
        let container = self.default_container()?;
        let method = DatabaseScope::Public.method(CURRENT_USER_METHOD);
        let ticket = self.add_inner_operation(&container.container_identifier, method, json!({}));
        let result = match ticket {
            Ok(ticket) => ticket.outcome().await,
            Err(err) => Err(err),
        };
        let status = match result {
            Ok(response) => status_from_response(&response),
            Err(err) if err.kind() == ErrorKind::NotAuthenticated => AccountStatus::NoAccount,
            Err(err) if err.kind() == ErrorKind::NetworkFailure => {
                warn!(error = %err, "account status unavailable");
                AccountStatus::TemporarilyUnavailable
            }
            Err(err) => return Err(err),
        };
        self.publish_status(status);
        Ok(status)
    }

    pub fn subscribe_account_status(&self) -> broadcast::Receiver<AccountStatusEvent> {
        self.inner.events.subscribe()
    }

    pub fn last_account_status(&self) -> Option<AccountStatus> {
        *self.lock_status()
    }

    pub fn pending_operations(&self) -> usize {
        self.inner.outer.pending_len()
    }

    pub fn running_operations(&self) -> usize {
        self.inner.outer.running_len()
    }

    pub fn in_flight_calls(&self) -> usize {
        self.inner.calls.in_flight()
    }

    fn default_container(&self) -> Result<Arc<ContainerConfig>, Error> {
        self.inner
            .session
            .snapshot()
            .containers()
            .first()
            .cloned()
            .ok_or_else(|| {
                Error::new(ErrorKind::UnknownContainer)
                    .with_message("no container registered")
                    .with_hint("Register a container before contacting the backend.")
            })
    }

    fn publish_status(&self, status: AccountStatus) {
        let changed = {
            let mut last = self.lock_status();
            let changed = *last != Some(status);
            *last = Some(status);
            changed
        };
        if changed {
            debug!(status = status.as_str(), "account status changed");
            // No subscribers is fine.
            let _ = self.inner.events.send(AccountStatusEvent::new(status));
        }
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, Option<AccountStatus>> {
        self.inner
            .last_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

// A successful call without an explicit status means the account is usable.
fn status_from_response(response: &Value) -> AccountStatus {
    match response.get("accountStatus").and_then(Value::as_str) {
        Some(raw) => AccountStatus::parse(Some(raw)),
        None => AccountStatus::Available,
    }
}

#[cfg(test)]
mod tests {
    use super::{Mediator, status_from_response};
    use crate::api::config::MediatorConfig;
    use crate::core::channel::{CallChannel, SharedChannel};
    use crate::core::error::{Error, ErrorKind};
    use crate::core::model::AccountStatus;
    use crate::core::session::ContainerConfig;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Arc;

    struct Unreachable;

    #[async_trait]
    impl CallChannel for Unreachable {
        async fn invoke(
            &self,
            _method: &str,
            _token: &str,
            _container: &ContainerConfig,
            _args: Value,
        ) -> Result<Value, Error> {
            Err(Error::new(ErrorKind::NetworkFailure))
        }
    }

    fn channel() -> SharedChannel {
        Arc::new(Unreachable)
    }

    #[test]
    fn new_outside_runtime_is_usage_error() {
        let err = match Mediator::new(channel(), MediatorConfig::default()) {
            Ok(_) => panic!("expected usage error"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[tokio::test]
    async fn network_failure_reads_as_temporarily_unavailable() {
        let mediator = Mediator::new(channel(), MediatorConfig::default()).expect("mediator");
        mediator
            .register_container(ContainerConfig::new("iCloud.test", "key"))
            .expect("register");
        mediator.set_session_token("tok").expect("token");
        let mut events = mediator.subscribe_account_status();
        let status = mediator.refresh_account_status().await.expect("status");
        assert_eq!(status, AccountStatus::TemporarilyUnavailable);
        assert_eq!(events.recv().await.expect("event").status, status);
    }

    #[tokio::test]
    async fn refresh_without_container_is_unknown_container() {
        let mediator = Mediator::new(channel(), MediatorConfig::default()).expect("mediator");
        let err = mediator.refresh_account_status().await.expect_err("err");
        assert_eq!(err.kind(), ErrorKind::UnknownContainer);
    }

    #[test]
    fn status_defaults_to_available() {
        assert_eq!(status_from_response(&json!({})), AccountStatus::Available);
        assert_eq!(
            status_from_response(&json!({"accountStatus": "restricted"})),
            AccountStatus::Restricted
        );
    }
}
