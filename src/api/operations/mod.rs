// Concrete operation kinds.
mod records;
mod subscriptions;
mod zones;

pub use records::{
    DEFAULT_BATCH_SIZE, FetchRecordsOperation, FetchRecordsOutput, ModifyRecordsOperation,
    ModifyRecordsOutput, SavePolicy,
};
pub use subscriptions::{ModifySubscriptionsOperation, ModifySubscriptionsOutput};
pub use zones::{
    FetchRecordZonesOperation, FetchRecordZonesOutput, ModifyRecordZonesOperation,
    ModifyRecordZonesOutput,
};
