//! Purpose: Account-status change notifications published by the mediator.
//! Exports: `AccountStatusEvent`, `ACCOUNT_STATUS_EVENT`, `ACCOUNT_STATUS_USER_INFO_KEY`.
//! Role: Payload of the mediator's broadcast channel.
//! Invariants: An event is published only when the status differs from the last one seen.

use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::core::model::AccountStatus;

/// Name carried by every account-status event.
pub const ACCOUNT_STATUS_EVENT: &str = "CloudMediatorAccountStatusChanged";

/// Key under which `to_json` stores the new status.
pub const ACCOUNT_STATUS_USER_INFO_KEY: &str = "accountStatus";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountStatusEvent {
    pub name: &'static str,
    pub status: AccountStatus,
    pub observed_at: OffsetDateTime,
}

impl AccountStatusEvent {
    pub fn new(status: AccountStatus) -> Self {
        Self {
            name: ACCOUNT_STATUS_EVENT,
            status,
            observed_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn to_json(&self) -> Value {
        let observed_at = self
            .observed_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.observed_at.unix_timestamp().to_string());
        json!({
            "name": self.name,
            "observedAt": observed_at,
            "userInfo": { ACCOUNT_STATUS_USER_INFO_KEY: self.status.as_str() },
        })
    }
}
