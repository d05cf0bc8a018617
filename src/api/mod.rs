//! Purpose: Define the public Rust API boundary for the mediator.
//! Exports: `Mediator`, operation kinds, value types, configuration, and errors.
//! Role: The surface client code and the CLI build on; queue internals stay in `core`.
//! Invariants: Operations reach the backend only through `Mediator::add_operation`.

mod config;
mod events;
mod http;
mod mediator;
mod operation;
mod operations;
mod response;

pub use crate::core::channel::{CallChannel, SharedChannel};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind, PartialErrors};
pub use crate::core::inner::InnerTicket;
pub use crate::core::model::{
    AccountStatus, DatabaseScope, Record, RecordId, RecordZone, Subscription, SubscriptionType,
};
pub use crate::core::queue::{ConflictKey, QueuePriority};
pub use crate::core::session::{ContainerConfig, Environment, SessionSnapshot};
pub use crate::core::zone::{DEFAULT_OWNER_NAME, DEFAULT_ZONE_NAME, MAX_ZONE_NAME_CHARS, RecordZoneId};
pub use config::{ContainerFile, MediatorConfig};
pub use events::{ACCOUNT_STATUS_EVENT, ACCOUNT_STATUS_USER_INFO_KEY, AccountStatusEvent};
pub use http::HttpCallChannel;
pub use mediator::Mediator;
pub use operation::{
    BackendCall, Completion, CompletionHandler, FinishedObserver, Operation, OperationBase,
    OperationHandle, OperationOutput, OperationState,
};
pub use operations::{
    DEFAULT_BATCH_SIZE, FetchRecordZonesOperation, FetchRecordZonesOutput, FetchRecordsOperation,
    FetchRecordsOutput, ModifyRecordZonesOperation, ModifyRecordZonesOutput,
    ModifyRecordsOperation, ModifyRecordsOutput, ModifySubscriptionsOperation,
    ModifySubscriptionsOutput, SavePolicy,
};
