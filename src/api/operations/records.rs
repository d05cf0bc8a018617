//! Purpose: Modify and fetch records, batching large requests.
//! Exports: `ModifyRecordsOperation`, `ModifyRecordsOutput`, `FetchRecordsOperation`,
//!          `FetchRecordsOutput`, `SavePolicy`, `DEFAULT_BATCH_SIZE`.
//! Role: Record-level operations; every zone touched becomes an ordering key.
//! Invariants: Batches are issued in item order; each batch carries at most `batch_size` items.
//! Invariants: Per-item errors are keyed by `RecordId::item_key` (`[<owner>:]<zone>/<record>`).

use std::collections::{HashMap, HashSet};

use serde_json::{Value, json};

use crate::api::operation::{
    BackendCall, CompletionHandler, Operation, OperationBase, OperationOutput,
};
use crate::api::response::{
    decode, fail_unreported, is_deleted, item_error, items, narrow_by_zone, zone_key_of,
};
use crate::core::error::{Error, ErrorKind, PartialErrors};
use crate::core::model::{DatabaseScope, Record, RecordId};
use crate::core::queue::ConflictKey;
use crate::core::zone::RecordZoneId;

pub const DEFAULT_BATCH_SIZE: usize = 200;

const MODIFY_METHOD: &str = "records/modify";
const LOOKUP_METHOD: &str = "records/lookup";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SavePolicy {
    /// Reject the save if the server copy changed since `record_change_tag`.
    #[default]
    IfServerRecordUnchanged,
    /// Overwrite only the fields that are sent.
    ChangedKeys,
    /// Replace the whole server record.
    AllKeys,
}

impl SavePolicy {
    fn save_type(self, record: &Record) -> &'static str {
        match self {
            SavePolicy::IfServerRecordUnchanged if record.record_change_tag.is_some() => "update",
            SavePolicy::IfServerRecordUnchanged => "create",
            SavePolicy::ChangedKeys => "forceUpdate",
            SavePolicy::AllKeys => "forceReplace",
        }
    }

    fn delete_type(self) -> &'static str {
        match self {
            SavePolicy::IfServerRecordUnchanged => "delete",
            SavePolicy::ChangedKeys | SavePolicy::AllKeys => "forceDelete",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModifyRecordsOutput {
    pub saved_records: Vec<Record>,
    pub deleted_record_ids: Vec<RecordId>,
}

impl OperationOutput for ModifyRecordsOutput {
    fn merge(&mut self, batch: Self) {
        self.saved_records.extend(batch.saved_records);
        self.deleted_record_ids.extend(batch.deleted_record_ids);
    }
}

pub struct ModifyRecordsOperation {
    base: OperationBase,
    records_to_save: Vec<Record>,
    record_ids_to_delete: Vec<RecordId>,
    save_policy: SavePolicy,
    atomic: bool,
    batch_size: usize,
    completion: Option<CompletionHandler<ModifyRecordsOutput>>,
}

impl ModifyRecordsOperation {
    pub fn new(
        container_id: impl Into<String>,
        records_to_save: Vec<Record>,
        record_ids_to_delete: Vec<RecordId>,
    ) -> Self {
        Self {
            base: OperationBase::new(container_id),
            records_to_save,
            record_ids_to_delete,
            save_policy: SavePolicy::default(),
            atomic: false,
            batch_size: DEFAULT_BATCH_SIZE,
            completion: None,
        }
    }

    pub fn with_database(mut self, database: DatabaseScope) -> Self {
        self.base.set_database(database);
        self
    }

    pub fn with_save_policy(mut self, save_policy: SavePolicy) -> Self {
        self.save_policy = save_policy;
        self
    }

    pub fn with_atomic(mut self, atomic: bool) -> Self {
        self.atomic = atomic;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn records_to_save(&self) -> &[Record] {
        &self.records_to_save
    }

    pub fn record_ids_to_delete(&self) -> &[RecordId] {
        &self.record_ids_to_delete
    }

    pub fn set_modify_records_completion<F>(&mut self, handler: F)
    where
        F: FnOnce(Vec<Record>, Vec<RecordId>, Option<Error>) + Send + 'static,
    {
        self.set_completion(move |completion| {
            let (output, error) = completion.into_parts();
            let output = output.unwrap_or_default();
            handler(output.saved_records, output.deleted_record_ids, error);
        });
    }

    fn requested_ids(&self) -> impl Iterator<Item = &RecordId> {
        self.records_to_save
            .iter()
            .map(|record| &record.record_id)
            .chain(self.record_ids_to_delete.iter())
    }

    fn entries(&self) -> Vec<(String, Value)> {
        let saves = self.records_to_save.iter().map(|record| {
            (
                record.record_id.item_key(),
                json!({
                    "operationType": self.save_policy.save_type(record),
                    "record": record,
                }),
            )
        });
        let deletes = self.record_ids_to_delete.iter().map(|id| {
            (
                id.item_key(),
                json!({
                    "operationType": self.save_policy.delete_type(),
                    "record": id,
                }),
            )
        });
        saves.chain(deletes).collect()
    }
}

impl Operation for ModifyRecordsOperation {
    type Output = ModifyRecordsOutput;

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
        zone_keys(&self.base, self.requested_ids().map(|id| &id.zone_id))
    }

    fn is_empty(&self) -> bool {
        self.records_to_save.is_empty() && self.record_ids_to_delete.is_empty()
    }

    fn validate(&self) -> Result<(), Error> {
        for record in &self.records_to_save {
            if record.record_type.is_empty() {
                return Err(Error::new(ErrorKind::InvalidInput).with_message(format!(
                    "record {} has no record type",
                    record.record_id.item_key()
                )));
            }
        }
        validate_record_ids(self.requested_ids())
    }

    fn calls(&self) -> Vec<BackendCall> {
        let method = self.base.database().method(MODIFY_METHOD);
        self.entries()
            .chunks(self.batch_size)
            .map(|batch| {
                let (item_ids, operations): (Vec<String>, Vec<Value>) =
                    batch.iter().cloned().unzip();
                BackendCall {
                    method: method.clone(),
                    args: json!({ "operations": operations, "atomic": self.atomic }),
                    item_ids,
                }
            })
            .collect()
    }

    fn absorb(
        &self,
        call: &BackendCall,
        response: Value,
        output: &mut Self::Output,
        failures: &mut PartialErrors,
    ) -> Result<(), Error> {
        let mut reported = HashSet::new();
        for item in items(&response, "records")? {
            let Some(key) = record_item_key(item, call, self.requested_ids(), &reported) else {
                continue;
            };
            if !call.item_ids.contains(&key) {
                continue;
            }
            if let Some(err) = item_error(item) {
                failures.insert(key.clone(), err);
            } else if is_deleted(item) {
                output.deleted_record_ids.push(decode(item, "record id")?);
            } else {
                output.saved_records.push(decode(item, "record")?);
            }
            reported.insert(key);
        }
        fail_unreported(call, &reported, failures);
        Ok(())
    }

    fn echo_succeeded(&self, call: &BackendCall, failed: &PartialErrors, output: &mut Self::Output) {
        let in_call = |key: &String| call.item_ids.contains(key) && !failed.contains_key(key);
        for record in &self.records_to_save {
            if in_call(&record.record_id.item_key()) {
                output.saved_records.push(record.clone());
            }
        }
        for id in &self.record_ids_to_delete {
            if in_call(&id.item_key()) {
                output.deleted_record_ids.push(id.clone());
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FetchRecordsOutput {
    pub records: HashMap<RecordId, Record>,
}

impl OperationOutput for FetchRecordsOutput {
    fn merge(&mut self, batch: Self) {
        self.records.extend(batch.records);
    }
}

pub struct FetchRecordsOperation {
    base: OperationBase,
    record_ids: Vec<RecordId>,
    desired_keys: Option<Vec<String>>,
    batch_size: usize,
    completion: Option<CompletionHandler<FetchRecordsOutput>>,
}

impl FetchRecordsOperation {
    pub fn new(container_id: impl Into<String>, record_ids: Vec<RecordId>) -> Self {
        Self {
            base: OperationBase::new(container_id),
            record_ids,
            desired_keys: None,
            batch_size: DEFAULT_BATCH_SIZE,
            completion: None,
        }
    }

    pub fn with_database(mut self, database: DatabaseScope) -> Self {
        self.base.set_database(database);
        self
    }

    /// Restrict the fields returned for each record.
    pub fn with_desired_keys(mut self, keys: Vec<String>) -> Self {
        self.desired_keys = Some(keys);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn record_ids(&self) -> &[RecordId] {
        &self.record_ids
    }

    pub fn set_fetch_records_completion<F>(&mut self, handler: F)
    where
        F: FnOnce(HashMap<RecordId, Record>, Option<Error>) + Send + 'static,
    {
        self.set_completion(move |completion| {
            let (output, error) = completion.into_parts();
            handler(output.unwrap_or_default().records, error);
        });
    }
}

impl Operation for FetchRecordsOperation {
    type Output = FetchRecordsOutput;

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
        zone_keys(&self.base, self.record_ids.iter().map(|id| &id.zone_id))
    }

    fn is_empty(&self) -> bool {
        self.record_ids.is_empty()
    }

    fn validate(&self) -> Result<(), Error> {
        validate_record_ids(self.record_ids.iter())
    }

    fn calls(&self) -> Vec<BackendCall> {
        let method = self.base.database().method(LOOKUP_METHOD);
        self.record_ids
            .chunks(self.batch_size)
            .map(|batch| {
                let mut args = json!({ "records": batch });
                if let Some(keys) = &self.desired_keys {
                    args["desiredKeys"] = json!(keys);
                }
                BackendCall {
                    method: method.clone(),
                    args,
                    item_ids: batch.iter().map(RecordId::item_key).collect(),
                }
            })
            .collect()
    }

    fn absorb(
        &self,
        call: &BackendCall,
        response: Value,
        output: &mut Self::Output,
        failures: &mut PartialErrors,
    ) -> Result<(), Error> {
        let mut reported = HashSet::new();
        for item in items(&response, "records")? {
            let Some(key) = record_item_key(item, call, self.record_ids.iter(), &reported) else {
                continue;
            };
            if !call.item_ids.contains(&key) {
                continue;
            }
            if let Some(err) = item_error(item) {
                failures.insert(key.clone(), err);
            } else {
                let record: Record = decode(item, "record")?;
                output.records.insert(record.record_id.clone(), record);
            }
            reported.insert(key);
        }
        fail_unreported(call, &reported, failures);
        Ok(())
    }
}

fn zone_keys<'a>(
    base: &OperationBase,
    zones: impl Iterator<Item = &'a RecordZoneId>,
) -> Vec<ConflictKey> {
    let mut seen = HashSet::new();
    zones
        .filter(|zone| seen.insert(*zone))
        .map(|zone| base.zone_key(zone))
        .collect()
}

fn validate_record_ids<'a>(ids: impl Iterator<Item = &'a RecordId>) -> Result<(), Error> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.record_name.is_empty() {
            return Err(
                Error::new(ErrorKind::InvalidInput).with_message("record name must not be empty")
            );
        }
        if !seen.insert(id) {
            return Err(Error::new(ErrorKind::InvalidInput)
                .with_message(format!("record {} appears more than once", id.item_key())));
        }
    }
    Ok(())
}

// Resolve a response item to a requested id of `call` that is not reported yet.
// Error items may omit the zone, and the server may spell the owner differently.
fn record_item_key<'a>(
    item: &Value,
    call: &BackendCall,
    requested: impl Iterator<Item = &'a RecordId>,
    reported: &HashSet<String>,
) -> Option<String> {
    let name = item.get("recordName").and_then(Value::as_str)?;
    let candidates: Vec<&RecordId> = requested
        .filter(|id| id.record_name == name)
        .filter(|id| {
            let key = id.item_key();
            call.item_ids.contains(&key) && !reported.contains(&key)
        })
        .collect();
    let zone = item.get("zoneID");
    if let Some(id) = narrow_by_zone(candidates, |id| &id.zone_id, zone).first() {
        return Some(id.item_key());
    }
    let zone_key = zone
        .and_then(zone_key_of)
        .unwrap_or_else(|| RecordZoneId::default_zone().item_key());
    Some(format!("{zone_key}/{name}"))
}

#[cfg(test)]
mod tests {
    use super::{FetchRecordsOperation, ModifyRecordsOperation, SavePolicy};
    use crate::api::operation::Operation;
    use crate::core::error::{ErrorKind, PartialErrors};
    use crate::core::model::{Record, RecordId};
    use crate::core::queue::ConflictKey;
    use crate::core::zone::RecordZoneId;
    use serde_json::json;

    fn id(zone: &str, name: &str) -> RecordId {
        RecordId::new(name, RecordZoneId::new(zone).unwrap())
    }

    fn record(zone: &str, name: &str) -> Record {
        Record::new("Note", id(zone, name)).with_field("title", json!(name))
    }

    #[test]
    fn modify_batches_respect_batch_size() {
        let saves = (0..5).map(|n| record("notes", &format!("r{n}"))).collect();
        let op = ModifyRecordsOperation::new("iCloud.test", saves, vec![id("notes", "old")])
            .with_batch_size(2);
        let calls = op.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].item_ids, vec!["notes/r0", "notes/r1"]);
        assert_eq!(calls[2].item_ids, vec!["notes/r4", "notes/old"]);
        assert_eq!(calls[2].args["operations"][1]["operationType"], "delete");
        assert_eq!(calls[0].args["atomic"], false);
    }

    #[test]
    fn save_policy_selects_operation_type() {
        let mut tagged = record("notes", "a");
        tagged.record_change_tag = Some("tag-1".to_string());
        let op = ModifyRecordsOperation::new("iCloud.test", vec![record("notes", "b"), tagged], vec![]);
        let ops = op.calls()[0].args["operations"].clone();
        assert_eq!(ops[0]["operationType"], "create");
        assert_eq!(ops[1]["operationType"], "update");

        let forced = ModifyRecordsOperation::new("iCloud.test", vec![record("notes", "c")], vec![])
            .with_save_policy(SavePolicy::AllKeys);
        assert_eq!(forced.calls()[0].args["operations"][0]["operationType"], "forceReplace");
    }

    #[test]
    fn conflict_keys_cover_each_zone_once() {
        let op = ModifyRecordsOperation::new(
            "iCloud.test",
            vec![record("a", "1"), record("b", "2"), record("a", "3")],
            vec![id("c", "4")],
        );
        let zones: Vec<String> = op
            .conflict_keys()
            .into_iter()
            .map(|key| match key {
                ConflictKey::Zone { zone, .. } => zone.zone_name().to_string(),
                other => panic!("unexpected key {other:?}"),
            })
            .collect();
        assert_eq!(zones, vec!["a", "b", "c"]);
    }

    #[test]
    fn modify_absorb_keys_errors_without_zone() {
        let op = ModifyRecordsOperation::new(
            "iCloud.test",
            vec![record("notes", "a"), record("notes", "b")],
            vec![id("notes", "gone")],
        );
        let call = op.calls().remove(0);
        let response = json!({
            "records": [
                serde_json::to_value(record("notes", "a")).unwrap(),
                {"recordName": "b", "serverErrorCode": "CONFLICT", "reason": "changed"},
                {"recordName": "gone", "zoneID": {"zoneName": "notes"}, "deleted": true},
            ]
        });
        let mut output = Default::default();
        let mut failures = PartialErrors::new();
        op.absorb(&call, response, &mut output, &mut failures)
            .expect("absorb");
        let output: super::ModifyRecordsOutput = output;
        assert_eq!(output.saved_records.len(), 1);
        assert_eq!(output.deleted_record_ids, vec![id("notes", "gone")]);
        assert_eq!(failures.keys().collect::<Vec<_>>(), vec!["notes/b"]);
    }

    #[test]
    fn fetch_reports_missing_records_as_item_failures() {
        let op = FetchRecordsOperation::new("iCloud.test", vec![id("notes", "a"), id("notes", "b")])
            .with_desired_keys(vec!["title".to_string()]);
        let call = op.calls().remove(0);
        assert_eq!(call.args["desiredKeys"], json!(["title"]));
        let response = json!({
            "records": [
                serde_json::to_value(record("notes", "a")).unwrap(),
                {"recordName": "b", "zoneID": {"zoneName": "notes"}, "serverErrorCode": "NOT_FOUND"},
            ]
        });
        let mut output = Default::default();
        let mut failures = PartialErrors::new();
        op.absorb(&call, response, &mut output, &mut failures)
            .expect("absorb");
        let output: super::FetchRecordsOutput = output;
        assert!(output.records.contains_key(&id("notes", "a")));
        assert_eq!(failures["notes/b"].server_code(), Some("NOT_FOUND"));
    }

    #[test]
    fn same_name_under_two_owners_is_keyed_apart() {
        let alice = RecordId::new("x", RecordZoneId::with_owner("notes", "alice").unwrap());
        let bob = RecordId::new("x", RecordZoneId::with_owner("notes", "bob").unwrap());
        let op = ModifyRecordsOperation::new(
            "iCloud.test",
            vec![
                Record::new("Note", alice.clone()),
                Record::new("Note", bob.clone()),
            ],
            vec![],
        );
        op.validate().expect("distinct owners are distinct records");
        let call = op.calls().remove(0);
        assert_eq!(call.item_ids, vec!["alice:notes/x", "bob:notes/x"]);

        let response = json!({
            "records": [
                serde_json::to_value(Record::new("Note", alice.clone())).unwrap(),
                {
                    "recordName": "x",
                    "zoneID": {"zoneName": "notes", "ownerName": "bob"},
                    "serverErrorCode": "CONFLICT",
                },
            ]
        });
        let mut output = super::ModifyRecordsOutput::default();
        let mut failures = PartialErrors::new();
        op.absorb(&call, response, &mut output, &mut failures)
            .expect("absorb");
        assert_eq!(output.saved_records.len(), 1);
        assert_eq!(output.saved_records[0].record_id, alice);
        assert_eq!(failures.keys().collect::<Vec<_>>(), vec!["bob:notes/x"]);
    }

    #[test]
    fn server_spelling_of_own_owner_still_matches() {
        let op = ModifyRecordsOperation::new("iCloud.test", vec![record("notes", "a")], vec![]);
        let call = op.calls().remove(0);
        let response = json!({
            "records": [{
                "recordName": "a",
                "recordType": "Note",
                "zoneID": {"zoneName": "notes", "ownerName": "_5f3a"},
            }]
        });
        let mut output = super::ModifyRecordsOutput::default();
        let mut failures = PartialErrors::new();
        op.absorb(&call, response, &mut output, &mut failures)
            .expect("absorb");
        assert_eq!(output.saved_records.len(), 1);
        assert!(failures.is_empty());
    }

    #[test]
    fn records_outside_the_call_are_ignored() {
        let op = FetchRecordsOperation::new("iCloud.test", vec![id("notes", "a")]);
        let call = op.calls().remove(0);
        let response = json!({
            "records": [
                serde_json::to_value(record("notes", "a")).unwrap(),
                serde_json::to_value(record("notes", "stray")).unwrap(),
            ]
        });
        let mut output = super::FetchRecordsOutput::default();
        let mut failures = PartialErrors::new();
        op.absorb(&call, response, &mut output, &mut failures)
            .expect("absorb");
        assert_eq!(output.records.len(), 1);
        assert!(failures.is_empty());
    }

    #[test]
    fn duplicate_record_ids_are_invalid() {
        let op = FetchRecordsOperation::new("iCloud.test", vec![id("n", "a"), id("n", "a")]);
        assert_eq!(op.validate().expect_err("err").kind(), ErrorKind::InvalidInput);
    }
}
