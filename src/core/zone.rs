//! Purpose: Identify a record zone by (zone name, owner name).
//! Exports: `RecordZoneId`, `MAX_ZONE_NAME_CHARS`, `DEFAULT_OWNER_NAME`, `DEFAULT_ZONE_NAME`.
//! Role: Value type used as the ordering key for zone-scoped operations.
//! Invariants: Zone names are 1..=255 characters; identifiers are immutable once built.
//! Invariants: Equality and hashing are structural over both fields.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::core::error::{Error, ErrorKind};

pub const MAX_ZONE_NAME_CHARS: usize = 255;
pub const DEFAULT_OWNER_NAME: &str = "__defaultOwner__";
pub const DEFAULT_ZONE_NAME: &str = "_defaultZone";

#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordZoneId {
    zone_name: String,
    owner_name: String,
}

impl RecordZoneId {
    pub fn new(zone_name: impl Into<String>) -> Result<Self, Error> {
        Self::with_owner(zone_name, DEFAULT_OWNER_NAME)
    }

    pub fn with_owner(
        zone_name: impl Into<String>,
        owner_name: impl Into<String>,
    ) -> Result<Self, Error> {
        let zone_name = zone_name.into();
        let owner_name = owner_name.into();
        validate_zone_name(&zone_name)?;
        if owner_name.is_empty() {
            return Err(Error::new(ErrorKind::InvalidInput)
                .with_message("zone owner name must not be empty"));
        }
        Ok(Self {
            zone_name,
            owner_name,
        })
    }

    pub fn default_zone() -> Self {
        Self {
            zone_name: DEFAULT_ZONE_NAME.to_string(),
            owner_name: DEFAULT_OWNER_NAME.to_string(),
        }
    }

    pub fn zone_name(&self) -> &str {
        &self.zone_name
    }

    pub fn owner_name(&self) -> &str {
        &self.owner_name
    }

    /// Key used in per-item error maps: the zone name, prefixed with `<owner>:` for
    /// zones not owned by the current user.
    pub fn item_key(&self) -> String {
        if self.owner_name == DEFAULT_OWNER_NAME {
            self.zone_name.clone()
        } else {
            format!("{}:{}", self.owner_name, self.zone_name)
        }
    }
}

impl fmt::Display for RecordZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner_name, self.zone_name)
    }
}

// Deserialization goes through the validating constructor.
impl<'de> Deserialize<'de> for RecordZoneId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Raw {
            zone_name: String,
            owner_name: Option<String>,
        }

        let raw = Raw::deserialize(deserializer)?;
        let owner = raw
            .owner_name
            .unwrap_or_else(|| DEFAULT_OWNER_NAME.to_string());
        RecordZoneId::with_owner(raw.zone_name, owner).map_err(serde::de::Error::custom)
    }
}

fn validate_zone_name(zone_name: &str) -> Result<(), Error> {
    if zone_name.is_empty() {
        return Err(Error::new(ErrorKind::InvalidInput).with_message("zone name must not be empty"));
    }
    let chars = zone_name.chars().count();
    if chars > MAX_ZONE_NAME_CHARS {
        return Err(Error::new(ErrorKind::InvalidInput)
            .with_message(format!(
                "zone name is {chars} characters; limit is {MAX_ZONE_NAME_CHARS}"
            ))
            .with_hint("Shorten the zone name to 255 characters or less."));
    }
    Ok(())
}
