// Shared parsing of batch responses: item lists, per-item server errors, decoding.
use std::collections::HashSet;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::error::{Error, ErrorKind, PartialErrors};
use crate::core::zone::{DEFAULT_OWNER_NAME, RecordZoneId};

use super::operation::BackendCall;

const AUTH_CODES: &[&str] = &["AUTHENTICATION_REQUIRED", "AUTHENTICATION_FAILED"];

pub(crate) fn items<'a>(response: &'a Value, key: &str) -> Result<&'a [Value], Error> {
    response
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .ok_or_else(|| {
            Error::new(ErrorKind::Internal)
                .with_message(format!("response is missing the `{key}` list"))
        })
}

/// Error for a backend-reported failure code.
pub(crate) fn server_error(code: &str, reason: Option<&str>) -> Error {
    let kind = if AUTH_CODES.contains(&code) {
        ErrorKind::NotAuthenticated
    } else {
        ErrorKind::Server
    };
    let mut err = Error::new(kind).with_server_code(code);
    if let Some(reason) = reason {
        err = err.with_message(reason);
    }
    err
}

pub(crate) fn item_error(item: &Value) -> Option<Error> {
    let code = item.get("serverErrorCode").and_then(Value::as_str)?;
    let reason = item.get("reason").and_then(Value::as_str);
    Some(server_error(code, reason))
}

pub(crate) fn is_deleted(item: &Value) -> bool {
    item.get("deleted").and_then(Value::as_bool).unwrap_or(false)
}

pub(crate) fn decode<T: DeserializeOwned>(item: &Value, what: &str) -> Result<T, Error> {
    serde_json::from_value(item.clone()).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message(format!("invalid {what} in response"))
            .with_source(err)
    })
}

/// Keep the candidates whose zone matches an item's `zoneID`.
///
/// An owner the request never named (the server spelling the current user's owner
/// differently) does not rule candidates out; a matching owner does.
pub(crate) fn narrow_by_zone<'a, T>(
    candidates: Vec<&'a T>,
    zone_of: impl Fn(&T) -> &RecordZoneId,
    zone: Option<&Value>,
) -> Vec<&'a T> {
    let Some(zone) = zone else {
        return candidates;
    };
    let by_name: Vec<&T> = match zone.get("zoneName").and_then(Value::as_str) {
        Some(name) => candidates
            .into_iter()
            .filter(|candidate| zone_of(*candidate).zone_name() == name)
            .collect(),
        None => candidates,
    };
    let Some(owner) = zone.get("ownerName").and_then(Value::as_str) else {
        return by_name;
    };
    let by_owner: Vec<&T> = by_name
        .iter()
        .copied()
        .filter(|candidate| zone_of(*candidate).owner_name() == owner)
        .collect();
    if by_owner.is_empty() { by_name } else { by_owner }
}

/// Item key for a `zoneID` object that matched nothing in the request.
pub(crate) fn zone_key_of(zone: &Value) -> Option<String> {
    let name = zone.get("zoneName").and_then(Value::as_str)?;
    let owner = zone
        .get("ownerName")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_OWNER_NAME);
    Some(
        RecordZoneId::with_owner(name, owner)
            .map(|zone| zone.item_key())
            .unwrap_or_else(|_| name.to_string()),
    )
}

/// Fail every item of `call` that the response neither confirmed nor rejected.
pub(crate) fn fail_unreported(
    call: &BackendCall,
    reported: &HashSet<String>,
    failures: &mut PartialErrors,
) {
    for item in &call.item_ids {
        if !reported.contains(item) && !failures.contains_key(item) {
            failures.insert(
                item.clone(),
                Error::new(ErrorKind::Internal).with_message("backend did not report this item"),
            );
        }
    }
}
