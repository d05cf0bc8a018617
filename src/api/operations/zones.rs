// Zone operations: save/delete zones and fetch them by id or all at once.
use std::collections::HashSet;

use serde_json::{Value, json};

use crate::api::operation::{
    BackendCall, CompletionHandler, Operation, OperationBase, OperationOutput,
};
use crate::api::response::{
    decode, fail_unreported, is_deleted, item_error, items, narrow_by_zone, zone_key_of,
};
use crate::core::error::{Error, ErrorKind, PartialErrors};
use crate::core::model::{DatabaseScope, RecordZone};
use crate::core::queue::ConflictKey;
use crate::core::zone::RecordZoneId;

const MODIFY_METHOD: &str = "zones/modify";
const LOOKUP_METHOD: &str = "zones/lookup";
const LIST_METHOD: &str = "zones/list";
const LIST_ITEM: &str = "*";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModifyRecordZonesOutput {
    pub saved_zones: Vec<RecordZone>,
    pub deleted_zone_ids: Vec<RecordZoneId>,
}

impl OperationOutput for ModifyRecordZonesOutput {
    fn merge(&mut self, batch: Self) {
        self.saved_zones.extend(batch.saved_zones);
        self.deleted_zone_ids.extend(batch.deleted_zone_ids);
    }
}

pub struct ModifyRecordZonesOperation {
    base: OperationBase,
    zones_to_save: Vec<RecordZone>,
    zone_ids_to_delete: Vec<RecordZoneId>,
    completion: Option<CompletionHandler<ModifyRecordZonesOutput>>,
}

impl ModifyRecordZonesOperation {
    pub fn new(
        container_id: impl Into<String>,
        zones_to_save: Vec<RecordZone>,
        zone_ids_to_delete: Vec<RecordZoneId>,
    ) -> Self {
        Self {
            base: OperationBase::new(container_id),
            zones_to_save,
            zone_ids_to_delete,
            completion: None,
        }
    }

    pub fn with_database(mut self, database: DatabaseScope) -> Self {
        self.base.set_database(database);
        self
    }

    pub fn zones_to_save(&self) -> &[RecordZone] {
        &self.zones_to_save
    }

    pub fn zone_ids_to_delete(&self) -> &[RecordZoneId] {
        &self.zone_ids_to_delete
    }

    pub fn set_modify_zones_completion<F>(&mut self, handler: F)
    where
        F: FnOnce(Vec<RecordZone>, Vec<RecordZoneId>, Option<Error>) + Send + 'static,
    {
        self.set_completion(move |completion| {
            let (output, error) = completion.into_parts();
            let output = output.unwrap_or_default();
            handler(output.saved_zones, output.deleted_zone_ids, error);
        });
    }

    fn zone_ids(&self) -> impl Iterator<Item = &RecordZoneId> {
        self.zones_to_save
            .iter()
            .map(|zone| &zone.zone_id)
            .chain(self.zone_ids_to_delete.iter())
    }
}

impl Operation for ModifyRecordZonesOperation {
    type Output = ModifyRecordZonesOutput;

    fn base(&self) -> &OperationBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperationBase {
        &mut self.base
    }

    fn completion_slot(&mut self) -> &mut Option<CompletionHandler<Self::Output>> {
        &mut self.completion
    }

    fn conflict_keys(&self) -> Vec<ConflictKey> {
        self.zone_ids().map(|zone| self.base.zone_key(zone)).collect()
    }

    fn is_empty(&self) -> bool {
        self.zones_to_save.is_empty() && self.zone_ids_to_delete.is_empty()
    }

    fn validate(&self) -> Result<(), Error> {
        let mut seen = HashSet::new();
        for zone in self.zone_ids() {
            if !seen.insert(zone) {
                return Err(Error::new(ErrorKind::InvalidInput)
                    .with_message(format!("zone {zone} appears more than once")));
            }
        }
        Ok(())
    }

    fn calls(&self) -> Vec<BackendCall> {
        let saves = self
            .zones_to_save
            .iter()
            .map(|zone| json!({ "operationType": "create", "zone": zone }));
        let deletes = self
            .zone_ids_to_delete
            .iter()
            .map(|zone| json!({ "operationType": "delete", "zone": { "zoneID": zone } }));
        vec![BackendCall {
            method: self.base.database().method(MODIFY_METHOD),
            args: json!({ "operations": saves.chain(deletes).collect::<Vec<_>>() }),
            item_ids: self.zone_ids().map(RecordZoneId::item_key).collect(),
        }]
    }

    fn absorb(
        &self,
        call: &BackendCall,
        response: Value,
        output: &mut Self::Output,
        failures: &mut PartialErrors,
    ) -> Result<(), Error> {
        let mut reported = HashSet::new();
        for item in items(&response, "zones")? {
            let Some(key) = zone_item_key(item, call, self.zone_ids(), &reported) else {
                continue;
            };
            if !call.item_ids.contains(&key) {
                continue;
            }
            if let Some(err) = item_error(item) {
                failures.insert(key.clone(), err);
            } else if is_deleted(item) {
                let zone: RecordZone = decode(item, "zone")?;
                output.deleted_zone_ids.push(zone.zone_id);
            } else {
                output.saved_zones.push(decode(item, "zone")?);
            }
            reported.insert(key);
        }
        fail_unreported(call, &reported, failures);
        Ok(())
    }

    fn echo_succeeded(&self, _call: &BackendCall, failed: &PartialErrors, output: &mut Self::Output) {
        for zone in &self.zones_to_save {
            if !failed.contains_key(&zone.zone_id.item_key()) {
                output.saved_zones.push(zone.clone());
            }
        }
        for zone in &self.zone_ids_to_delete {
            if !failed.contains_key(&zone.item_key()) {
                output.deleted_zone_ids.push(zone.clone());
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FetchRecordZonesOutput {
    pub zones: Vec<RecordZone>,
}

impl OperationOutput for FetchRecordZonesOutput {
    fn merge(&mut self, batch: Self) {
        self.zones.extend(batch.zones);
    }
}

/// Fetch specific zones, or every zone in the database when constructed with `all`.
pub struct FetchRecordZonesOperation {
    base: OperationBase,
    zone_ids: Option<Vec<RecordZoneId>>,
    completion: Option<CompletionHandler<FetchRecordZonesOutput>>,
}

impl FetchRecordZonesOperation {
    pub fn new(container_id: impl Into<String>, zone_ids: Vec<RecordZoneId>) -> Self {
        Self {
            base: OperationBase::new(container_id),
            zone_ids: Some(zone_ids),
            completion: None,
        }
    }

    pub fn all(container_id: impl Into<String>) -> Self {
        Self {
            base: OperationBase::new(container_id),
            zone_ids: None,
            completion: None,
        }
    }

    pub fn with_database(mut self, database: DatabaseScope) -> Self {
        self.base.set_database(database);
        self
    }

    pub fn zone_ids(&self) -> Option<&[RecordZoneId]> {
        self.zone_ids.as_deref()
    }

    pub fn set_fetch_zones_completion<F>(&mut self, handler: F)
    where
        F: FnOnce(Vec<RecordZone>, Option<Error>) + Send + 'static,
    {
        self.set_completion(move |completion| {
            let (output, error) = completion.into_parts();
            handler(output.unwrap_or_default().zones, error);
        });
    }
}

impl Operation for FetchRecordZonesOperation {
    type Output = FetchRecordZonesOutput;

    fn base(&self) -> &OperationBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperationBase {
        &mut self.base
    }

    fn completion_slot(&mut self) -> &mut Option<CompletionHandler<Self::Output>> {
        &mut self.completion
    }

    fn conflict_keys(&self) -> Vec<ConflictKey> {
        match &self.zone_ids {
            Some(zone_ids) => zone_ids.iter().map(|zone| self.base.zone_key(zone)).collect(),
            None => vec![ConflictKey::Database {
                container: self.base.container_id().to_string(),
                database: self.base.database(),
            }],
        }
    }

    fn is_empty(&self) -> bool {
        self.zone_ids.as_ref().is_some_and(Vec::is_empty)
    }

    fn calls(&self) -> Vec<BackendCall> {
        match &self.zone_ids {
            Some(zone_ids) => vec![BackendCall {
                method: self.base.database().method(LOOKUP_METHOD),
                args: json!({ "zones": zone_ids }),
                item_ids: zone_ids.iter().map(RecordZoneId::item_key).collect(),
            }],
            None => vec![BackendCall {
                method: self.base.database().method(LIST_METHOD),
                args: json!({}),
                item_ids: vec![LIST_ITEM.to_string()],
            }],
        }
    }

    fn absorb(
        &self,
        call: &BackendCall,
        response: Value,
        output: &mut Self::Output,
        failures: &mut PartialErrors,
    ) -> Result<(), Error> {
        let listing = self.zone_ids.is_none();
        let mut reported = HashSet::new();
        let requested = self.zone_ids.iter().flatten();
        for item in items(&response, "zones")? {
            let Some(key) = zone_item_key(item, call, requested.clone(), &reported) else {
                continue;
            };
            if !listing && !call.item_ids.contains(&key) {
                continue;
            }
            if let Some(err) = item_error(item) {
                failures.insert(key.clone(), err);
            } else {
                output.zones.push(decode(item, "zone")?);
            }
            reported.insert(key);
        }
        if listing {
            // An empty listing is a valid answer.
            reported.insert(LIST_ITEM.to_string());
        }
        fail_unreported(call, &reported, failures);
        Ok(())
    }
}

// Resolve a response item to a requested zone of `call` that is not reported yet.
fn zone_item_key<'a>(
    item: &Value,
    call: &BackendCall,
    requested: impl Iterator<Item = &'a RecordZoneId>,
    reported: &HashSet<String>,
) -> Option<String> {
    let zone = item.get("zoneID")?;
    let candidates: Vec<&RecordZoneId> = requested
        .filter(|requested| {
            let key = requested.item_key();
            call.item_ids.contains(&key) && !reported.contains(&key)
        })
        .collect();
    match narrow_by_zone(candidates, |id| id, Some(zone)).first() {
        Some(requested) => Some(requested.item_key()),
        None => zone_key_of(zone),
    }
}
