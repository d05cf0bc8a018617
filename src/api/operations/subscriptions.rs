//! Purpose: Save and delete subscriptions in one backend call.
//! Exports: `ModifySubscriptionsOperation`, `ModifySubscriptionsOutput`.
//! Role: Representative modify-type operation (save list + delete list).
//! Invariants: A subscription id may not be both saved and deleted by one operation.
//! Invariants: On partial failure, saved/deleted lists hold exactly the succeeded items.

use std::collections::HashSet;

use serde_json::{Value, json};

use crate::api::operation::{
    BackendCall, CompletionHandler, Operation, OperationBase, OperationOutput,
};
use crate::api::response::{decode, fail_unreported, is_deleted, item_error, items};
use crate::core::error::{Error, ErrorKind, PartialErrors};
use crate::core::model::{DatabaseScope, Subscription};
use crate::core::queue::ConflictKey;

const METHOD: &str = "subscriptions/modify";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModifySubscriptionsOutput {
    pub saved_subscriptions: Vec<Subscription>,
    pub deleted_subscription_ids: Vec<String>,
}

impl OperationOutput for ModifySubscriptionsOutput {
    fn merge(&mut self, batch: Self) {
        self.saved_subscriptions.extend(batch.saved_subscriptions);
        self.deleted_subscription_ids
            .extend(batch.deleted_subscription_ids);
    }
}

pub struct ModifySubscriptionsOperation {
    base: OperationBase,
    subscriptions_to_save: Vec<Subscription>,
    subscription_ids_to_delete: Vec<String>,
    completion: Option<CompletionHandler<ModifySubscriptionsOutput>>,
}

impl ModifySubscriptionsOperation {
    pub fn new(
        container_id: impl Into<String>,
        subscriptions_to_save: Vec<Subscription>,
        subscription_ids_to_delete: Vec<String>,
    ) -> Self {
        Self {
            base: OperationBase::new(container_id),
            subscriptions_to_save,
            subscription_ids_to_delete,
            completion: None,
        }
    }

    pub fn with_database(mut self, database: DatabaseScope) -> Self {
        self.base.set_database(database);
        self
    }

    pub fn subscriptions_to_save(&self) -> &[Subscription] {
        &self.subscriptions_to_save
    }

    pub fn subscription_ids_to_delete(&self) -> &[String] {
        &self.subscription_ids_to_delete
    }

    pub fn set_subscriptions_to_save(&mut self, subscriptions: Vec<Subscription>) {
        self.subscriptions_to_save = subscriptions;
    }

    pub fn set_subscription_ids_to_delete(&mut self, ids: Vec<String>) {
        self.subscription_ids_to_delete = ids;
    }

    /// Completion in the `(saved, deleted, error)` shape.
    ///
    /// `error` is a `PartialFailure` when only some items failed; its detail map is
    /// keyed by subscription id.
    pub fn set_modify_subscriptions_completion<F>(&mut self, handler: F)
    where
        F: FnOnce(Vec<Subscription>, Vec<String>, Option<Error>) + Send + 'static,
    {
        self.set_completion(move |completion| {
            let (output, error) = completion.into_parts();
            let output = output.unwrap_or_default();
            handler(
                output.saved_subscriptions,
                output.deleted_subscription_ids,
                error,
            );
        });
    }
}

impl Operation for ModifySubscriptionsOperation {
    type Output = ModifySubscriptionsOutput;

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
        vec![ConflictKey::Subscriptions {
            container: self.base.container_id().to_string(),
            database: self.base.database(),
        }]
    }

    fn is_empty(&self) -> bool {
        self.subscriptions_to_save.is_empty() && self.subscription_ids_to_delete.is_empty()
    }

    fn validate(&self) -> Result<(), Error> {
        let mut seen = HashSet::new();
        for id in self
            .subscriptions_to_save
            .iter()
            .map(|subscription| &subscription.subscription_id)
            .chain(self.subscription_ids_to_delete.iter())
        {
            if id.is_empty() {
                return Err(Error::new(ErrorKind::InvalidInput)
                    .with_message("subscription id must not be empty"));
            }
            if !seen.insert(id.as_str()) {
                return Err(Error::new(ErrorKind::InvalidInput)
                    .with_message(format!("subscription {id} appears more than once")));
            }
        }
        Ok(())
    }

    fn calls(&self) -> Vec<BackendCall> {
        let mut operations = Vec::new();
        let mut item_ids = Vec::new();
        for subscription in &self.subscriptions_to_save {
            operations.push(json!({
                "operationType": "create",
                "subscription": subscription,
            }));
            item_ids.push(subscription.subscription_id.clone());
        }
        for id in &self.subscription_ids_to_delete {
            operations.push(json!({
                "operationType": "delete",
                "subscription": { "subscriptionID": id },
            }));
            item_ids.push(id.clone());
        }
        vec![BackendCall {
            method: self.base.database().method(METHOD),
            args: json!({ "operations": operations }),
            item_ids,
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
        for item in items(&response, "subscriptions")? {
            let Some(id) = item.get("subscriptionID").and_then(Value::as_str) else {
                continue;
            };
            if !call.item_ids.iter().any(|requested| requested == id) {
                continue;
            }
            if let Some(err) = item_error(item) {
                failures.insert(id.to_string(), err);
            } else if is_deleted(item) || self.subscription_ids_to_delete.iter().any(|d| d == id) {
                output.deleted_subscription_ids.push(id.to_string());
            } else {
                output
                    .saved_subscriptions
                    .push(decode(item, "subscription")?);
            }
            reported.insert(id.to_string());
        }
        fail_unreported(call, &reported, failures);
        Ok(())
    }

    fn echo_succeeded(
        &self,
        _call: &BackendCall,
        failed: &PartialErrors,
        output: &mut Self::Output,
    ) {
        for subscription in &self.subscriptions_to_save {
            if !failed.contains_key(&subscription.subscription_id) {
                output.saved_subscriptions.push(subscription.clone());
            }
        }
        for id in &self.subscription_ids_to_delete {
            if !failed.contains_key(id) {
                output.deleted_subscription_ids.push(id.clone());
            }
        }
    }
}
