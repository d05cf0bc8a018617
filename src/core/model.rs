// Wire-shaped value types for records, zones, subscriptions, and account status.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::zone::RecordZoneId;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseScope {
    Public,
    #[default]
    Private,
    Shared,
}

impl DatabaseScope {
    pub fn as_str(self) -> &'static str {
        match self {
            DatabaseScope::Public => "public",
            DatabaseScope::Private => "private",
            DatabaseScope::Shared => "shared",
        }
    }

    /// Prefix a database-relative method (`records/modify`) with the scope.
    pub fn method(self, method: &str) -> String {
        format!("{}/{}", self.as_str(), method)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordId {
    pub record_name: String,
    #[serde(rename = "zoneID", default = "RecordZoneId::default_zone")]
    pub zone_id: RecordZoneId,
}

impl RecordId {
    pub fn new(record_name: impl Into<String>, zone_id: RecordZoneId) -> Self {
        Self {
            record_name: record_name.into(),
            zone_id,
        }
    }

    /// Key used in per-item error maps: `<zone key>/<record>`.
    pub fn item_key(&self) -> String {
        format!("{}/{}", self.zone_id.item_key(), self.record_name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(flatten)]
    pub record_id: RecordId,
    pub record_type: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_change_tag: Option<String>,
}

impl Record {
    pub fn new(record_type: impl Into<String>, record_id: RecordId) -> Self {
        Self {
            record_id,
            record_type: record_type.into(),
            fields: Map::new(),
            record_change_tag: None,
        }
    }

    /// Set a field using the `{ "value": ... }` wrapper the backend expects.
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        let mut wrapped = Map::new();
        wrapped.insert("value".to_string(), value);
        self.fields.insert(name.into(), Value::Object(wrapped));
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).and_then(|field| field.get("value"))
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordZone {
    #[serde(rename = "zoneID")]
    pub zone_id: RecordZoneId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_token: Option<String>,
}

impl RecordZone {
    pub fn new(zone_id: RecordZoneId) -> Self {
        Self {
            zone_id,
            sync_token: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionType {
    Query,
    Zone,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    #[serde(rename = "subscriptionID")]
    pub subscription_id: String,
    pub subscription_type: SubscriptionType,
    #[serde(rename = "zoneID", default, skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<RecordZoneId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fires_on: Vec<String>,
}

impl Subscription {
    pub fn zone(subscription_id: impl Into<String>, zone_id: RecordZoneId) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            subscription_type: SubscriptionType::Zone,
            zone_id: Some(zone_id),
            query: None,
            fires_on: Vec::new(),
        }
    }

    pub fn query(subscription_id: impl Into<String>, query: Value) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            subscription_type: SubscriptionType::Query,
            zone_id: None,
            query: Some(query),
            fires_on: vec![
                "create".to_string(),
                "update".to_string(),
                "delete".to_string(),
            ],
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccountStatus {
    Available,
    NoAccount,
    Restricted,
    CouldNotDetermine,
    TemporarilyUnavailable,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountStatus::Available => "available",
            AccountStatus::NoAccount => "noAccount",
            AccountStatus::Restricted => "restricted",
            AccountStatus::CouldNotDetermine => "couldNotDetermine",
            AccountStatus::TemporarilyUnavailable => "temporarilyUnavailable",
        }
    }

    /// Unknown or missing values map to `CouldNotDetermine`.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("available") => AccountStatus::Available,
            Some("noAccount") => AccountStatus::NoAccount,
            Some("restricted") => AccountStatus::Restricted,
            Some("temporarilyUnavailable") => AccountStatus::TemporarilyUnavailable,
            _ => AccountStatus::CouldNotDetermine,
        }
    }
}
