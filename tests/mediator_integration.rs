// Mediator behaviour against a scripted in-process call channel.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::oneshot;

use cloudmediator::api::{
    AccountStatus, CallChannel, Completion, ContainerConfig, Error, ErrorKind, Mediator,
    MediatorConfig, ModifyRecordsOperation, ModifySubscriptionsOperation, Operation,
    OperationState, Record, RecordId, RecordZoneId, Subscription,
};

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

const CONTAINER: &str = "iCloud.com.example.notes";

type Responder = Box<dyn Fn(&str, &Value) -> Result<Value, Error> + Send + Sync>;
type Delay = Box<dyn Fn(&Value) -> Duration + Send + Sync>;

#[derive(Clone, Debug)]
struct Call {
    method: String,
    args: Value,
    token: String,
}

struct ScriptedChannel {
    calls: Mutex<Vec<Call>>,
    responder: Responder,
    delay: Delay,
}

impl ScriptedChannel {
    fn new(responder: Responder) -> Arc<Self> {
        Self::with_delay(responder, Box::new(|_: &Value| Duration::ZERO))
    }

    fn with_delay(responder: Responder, delay: Delay) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            responder,
            delay,
        })
    }

    fn echo() -> Arc<Self> {
        Self::new(Box::new(echo))
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CallChannel for ScriptedChannel {
    async fn invoke(
        &self,
        method: &str,
        token: &str,
        _container: &ContainerConfig,
        args: Value,
    ) -> Result<Value, Error> {
        self.calls.lock().unwrap().push(Call {
            method: method.to_string(),
            args: args.clone(),
            token: token.to_string(),
        });
        let delay = (self.delay)(&args);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(method, &args)
    }
}

// Answers every modify call as if each item succeeded.
fn echo(method: &str, args: &Value) -> Result<Value, Error> {
    let operations = args["operations"].as_array().cloned().unwrap_or_default();
    if method.ends_with("records/modify") {
        let records: Vec<Value> = operations.iter().map(|op| op["record"].clone()).collect();
        return Ok(json!({ "records": records }));
    }
    if method.ends_with("subscriptions/modify") {
        let subscriptions: Vec<Value> = operations
            .iter()
            .map(|op| op["subscription"].clone())
            .collect();
        return Ok(json!({ "subscriptions": subscriptions }));
    }
    Ok(json!({}))
}

fn mediator(channel: &Arc<ScriptedChannel>, config: MediatorConfig) -> TestResult<Mediator> {
    let mediator = Mediator::new(channel.clone(), config)?;
    mediator.register_container(ContainerConfig::new(CONTAINER, "api-key"))?;
    mediator.set_session_token("session-1")?;
    Ok(mediator)
}

fn zone(name: &str) -> RecordZoneId {
    RecordZoneId::new(name).expect("zone")
}

fn record(zone_name: &str, name: &str) -> Record {
    Record::new("Note", RecordId::new(name, zone(zone_name))).with_field("title", json!(name))
}

fn with_receiver<O: Operation>(op: &mut O) -> oneshot::Receiver<Completion<O::Output>> {
    let (tx, rx) = oneshot::channel();
    op.set_completion(move |completion| {
        let _ = tx.send(completion);
    });
    rx
}

fn record_names(call: &Call) -> Vec<String> {
    names_in(&call.args)
}

fn names_in(args: &Value) -> Vec<String> {
    args["operations"]
        .as_array()
        .map(|ops| {
            ops.iter()
                .filter_map(|op| op["record"]["recordName"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_zone_modifies_reach_backend_in_submission_order() -> TestResult<()> {
    // Earlier submissions take longer, so any reordering would show up.
    let channel = ScriptedChannel::with_delay(
        Box::new(echo),
        Box::new(|args: &Value| {
            let name = args["operations"][0]["record"]["recordName"]
                .as_str()
                .unwrap_or("r0");
            let index: u64 = name.trim_start_matches('r').parse().unwrap_or(0);
            Duration::from_millis(60 - index * 10)
        }),
    );
    let config = MediatorConfig {
        outer_concurrency: 4,
        inner_concurrency: 8,
        ..MediatorConfig::default()
    };
    let mediator = mediator(&channel, config)?;

    let mut handles = Vec::new();
    for index in 0..5 {
        let op = ModifyRecordsOperation::new(
            CONTAINER,
            vec![record("notes", &format!("r{index}"))],
            Vec::new(),
        );
        handles.push(mediator.add_operation(op)?);
    }
    for handle in &handles {
        assert_eq!(handle.wait().await, OperationState::Completed);
    }

    let order: Vec<String> = channel.calls().iter().flat_map(record_names).collect();
    assert_eq!(order, vec!["r0", "r1", "r2", "r3", "r4"]);
    Ok(())
}

#[tokio::test]
async fn partial_subscription_failure_reports_exactly_the_failed_item() -> TestResult<()> {
    let channel = ScriptedChannel::new(Box::new(|_: &str, args: &Value| {
        let ops = args["operations"].as_array().cloned().unwrap_or_default();
        let items: Vec<Value> = ops
            .iter()
            .map(|op| {
                let subscription = op["subscription"].clone();
                if subscription["subscriptionID"] == "sub-2" {
                    json!({
                        "subscriptionID": "sub-2",
                        "serverErrorCode": "BAD_REQUEST",
                        "reason": "zone does not exist",
                    })
                } else {
                    subscription
                }
            })
            .collect();
        Ok(json!({ "subscriptions": items }))
    }));
    let mediator = mediator(&channel, MediatorConfig::default())?;

    let saves = ["sub-1", "sub-2", "sub-3"]
        .iter()
        .map(|id| Subscription::zone(*id, zone("notes")))
        .collect();
    let mut op = ModifySubscriptionsOperation::new(CONTAINER, saves, Vec::new());
    let (tx, rx) = oneshot::channel();
    op.set_modify_subscriptions_completion(move |saved, deleted, error| {
        let _ = tx.send((saved, deleted, error));
    });
    let handle = mediator.add_operation(op)?;

    let (saved, deleted, error) = rx.await?;
    let saved_ids: Vec<&str> = saved
        .iter()
        .map(|subscription| subscription.subscription_id.as_str())
        .collect();
    assert_eq!(saved_ids, vec!["sub-1", "sub-3"]);
    assert!(deleted.is_empty());
    let error = error.expect("partial failure");
    assert_eq!(error.kind(), ErrorKind::PartialFailure);
    let failed: Vec<&String> = error.partial_errors().expect("detail").keys().collect();
    assert_eq!(failed, vec!["sub-2"]);
    assert_eq!(handle.wait().await, OperationState::Failed);
    Ok(())
}

#[tokio::test]
async fn channel_level_partial_failure_echoes_the_successes() -> TestResult<()> {
    let channel = ScriptedChannel::new(Box::new(|_: &str, _: &Value| {
        let mut detail = BTreeMap::new();
        detail.insert(
            "notes/b".to_string(),
            Error::new(ErrorKind::Server).with_server_code("CONFLICT"),
        );
        Err(Error::partial(detail))
    }));
    let mediator = mediator(&channel, MediatorConfig::default())?;

    let mut op = ModifyRecordsOperation::new(
        CONTAINER,
        vec![record("notes", "a"), record("notes", "b"), record("notes", "c")],
        Vec::new(),
    );
    let rx = with_receiver(&mut op);
    mediator.add_operation(op)?;

    match rx.await? {
        Completion::Partial { value, error } => {
            let names: Vec<&str> = value
                .saved_records
                .iter()
                .map(|record| record.record_id.record_name.as_str())
                .collect();
            assert_eq!(names, vec!["a", "c"]);
            assert_eq!(
                error.partial_errors().expect("detail")["notes/b"].server_code(),
                Some("CONFLICT")
            );
        }
        other => panic!("expected partial completion, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn whole_call_failure_is_a_failure_not_a_partial() -> TestResult<()> {
    let channel = ScriptedChannel::new(Box::new(|_: &str, _: &Value| {
        Err(Error::new(ErrorKind::Server).with_server_code("INTERNAL_ERROR"))
    }));
    let mediator = mediator(&channel, MediatorConfig::default())?;

    let mut op = ModifyRecordsOperation::new(CONTAINER, vec![record("notes", "a")], Vec::new());
    let rx = with_receiver(&mut op);
    let handle = mediator.add_operation(op)?;

    match rx.await? {
        Completion::Failure(error) => {
            assert_eq!(error.kind(), ErrorKind::Server);
            assert_eq!(error.server_code(), Some("INTERNAL_ERROR"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(handle.wait().await, OperationState::Failed);
    Ok(())
}

#[tokio::test]
async fn failed_batch_is_attributed_to_its_items_only() -> TestResult<()> {
    let channel = ScriptedChannel::new(Box::new(|method: &str, args: &Value| {
        if names_in(args).iter().any(|name| name == "c") {
            return Err(Error::new(ErrorKind::NetworkFailure).with_message("timed out"));
        }
        echo(method, args)
    }));
    let mediator = mediator(&channel, MediatorConfig::default())?;

    let saves = ["a", "b", "c", "d"]
        .iter()
        .map(|name| record("notes", name))
        .collect();
    let mut op = ModifyRecordsOperation::new(CONTAINER, saves, Vec::new()).with_batch_size(2);
    let rx = with_receiver(&mut op);
    mediator.add_operation(op)?;

    match rx.await? {
        Completion::Partial { value, error } => {
            assert_eq!(value.saved_records.len(), 2);
            let failed: Vec<&String> = error.partial_errors().expect("detail").keys().collect();
            assert_eq!(failed, vec!["notes/c", "notes/d"]);
        }
        other => panic!("expected partial completion, got {other:?}"),
    }
    assert_eq!(channel.calls().len(), 2);
    Ok(())
}

#[tokio::test]
async fn undecodable_batch_keeps_none_of_its_items_as_saved() -> TestResult<()> {
    let channel = ScriptedChannel::new(Box::new(|method: &str, args: &Value| {
        let mut response = echo(method, args)?;
        if let Some(records) = response["records"].as_array_mut() {
            for record in records {
                if record["recordName"] == "d" {
                    if let Some(fields) = record.as_object_mut() {
                        fields.remove("recordType");
                    }
                }
            }
        }
        Ok(response)
    }));
    let mediator = mediator(&channel, MediatorConfig::default())?;

    let saves = ["a", "b", "c", "d"]
        .iter()
        .map(|name| record("notes", name))
        .collect();
    let mut op = ModifyRecordsOperation::new(CONTAINER, saves, Vec::new()).with_batch_size(2);
    let rx = with_receiver(&mut op);
    mediator.add_operation(op)?;

    match rx.await? {
        Completion::Partial { value, error } => {
            let saved: Vec<&str> = value
                .saved_records
                .iter()
                .map(|record| record.record_id.record_name.as_str())
                .collect();
            assert_eq!(saved, vec!["a", "b"]);
            let failed: Vec<&String> = error.partial_errors().expect("detail").keys().collect();
            assert_eq!(failed, vec!["notes/c", "notes/d"]);
        }
        other => panic!("expected partial completion, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn same_record_name_under_two_owners_is_reported_per_owner() -> TestResult<()> {
    let channel = ScriptedChannel::new(Box::new(|method: &str, args: &Value| {
        let mut response = echo(method, args)?;
        if let Some(records) = response["records"].as_array_mut() {
            for record in records {
                if record["zoneID"]["ownerName"] == "bob" {
                    *record = json!({
                        "recordName": record["recordName"].clone(),
                        "zoneID": record["zoneID"].clone(),
                        "serverErrorCode": "ACCESS_DENIED",
                    });
                }
            }
        }
        Ok(response)
    }));
    let mediator = mediator(&channel, MediatorConfig::default())?;

    let alice = RecordId::new("x", RecordZoneId::with_owner("notes", "alice")?);
    let bob = RecordId::new("x", RecordZoneId::with_owner("notes", "bob")?);
    let saves = vec![
        Record::new("Note", alice.clone()),
        Record::new("Note", bob.clone()),
    ];
    let mut op = ModifyRecordsOperation::new(CONTAINER, saves, Vec::new());
    let rx = with_receiver(&mut op);
    mediator.add_operation(op)?;

    match rx.await? {
        Completion::Partial { value, error } => {
            let saved: Vec<&RecordId> = value
                .saved_records
                .iter()
                .map(|record| &record.record_id)
                .collect();
            assert_eq!(saved, vec![&alice]);
            let failed: Vec<&String> = error.partial_errors().expect("detail").keys().collect();
            assert_eq!(failed, vec!["bob:notes/x"]);
        }
        other => panic!("expected partial completion, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn cancelling_a_queued_operation_issues_no_backend_call() -> TestResult<()> {
    let channel = ScriptedChannel::with_delay(
        Box::new(echo),
        Box::new(|_: &Value| Duration::from_millis(50)),
    );
    let mediator = mediator(&channel, MediatorConfig::default())?;

    let first = ModifyRecordsOperation::new(CONTAINER, vec![record("x", "first")], Vec::new());
    let first = mediator.add_operation(first)?;

    let mut second = ModifyRecordsOperation::new(CONTAINER, vec![record("y", "second")], Vec::new());
    let rx = with_receiver(&mut second);
    let second = mediator.add_operation(second)?;
    assert_eq!(second.state(), OperationState::Queued);
    second.cancel();

    match rx.await? {
        Completion::Failure(error) => assert_eq!(error.kind(), ErrorKind::Cancelled),
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert_eq!(second.wait().await, OperationState::Cancelled);
    assert_eq!(first.wait().await, OperationState::Completed);

    let names: Vec<String> = channel.calls().iter().flat_map(record_names).collect();
    assert_eq!(names, vec!["first"]);
    Ok(())
}

#[tokio::test]
async fn cancelling_an_executing_operation_stops_after_the_in_flight_call() -> TestResult<()> {
    let channel = ScriptedChannel::with_delay(
        Box::new(echo),
        Box::new(|_: &Value| Duration::from_millis(60)),
    );
    let mediator = mediator(&channel, MediatorConfig::default())?;

    let saves = ["a", "b", "c"].iter().map(|name| record("z", name)).collect();
    let mut op = ModifyRecordsOperation::new(CONTAINER, saves, Vec::new()).with_batch_size(1);
    let rx = with_receiver(&mut op);
    let handle = mediator.add_operation(op)?;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(handle.state(), OperationState::Executing);
    handle.cancel();

    match rx.await? {
        Completion::Failure(error) => assert_eq!(error.kind(), ErrorKind::Cancelled),
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert_eq!(handle.wait().await, OperationState::Cancelled);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(channel.calls().len(), 1);
    Ok(())
}

#[tokio::test]
async fn missing_session_token_fails_without_backend_call() -> TestResult<()> {
    let channel = ScriptedChannel::echo();
    let mediator = mediator(&channel, MediatorConfig::default())?;
    mediator.clear_session_token();

    let mut op = ModifyRecordsOperation::new(CONTAINER, vec![record("notes", "a")], Vec::new());
    let rx = with_receiver(&mut op);
    let handle = mediator.add_operation(op)?;

    match rx.await? {
        Completion::Failure(error) => assert_eq!(error.kind(), ErrorKind::NotAuthenticated),
        other => panic!("expected NotAuthenticated, got {other:?}"),
    }
    assert_eq!(handle.wait().await, OperationState::Failed);
    assert_eq!(mediator.pending_operations(), 0);
    assert!(channel.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn unknown_container_is_rejected_before_queueing() -> TestResult<()> {
    let channel = ScriptedChannel::echo();
    let mediator = mediator(&channel, MediatorConfig::default())?;

    let fired = Arc::new(Mutex::new(false));
    let flag = fired.clone();
    let mut op = ModifyRecordsOperation::new("iCloud.unknown", vec![record("n", "a")], Vec::new());
    op.set_completion(move |_| *flag.lock().unwrap() = true);

    let err = match mediator.add_operation(op) {
        Ok(_) => panic!("expected UnknownContainer"),
        Err(err) => err,
    };
    assert_eq!(err.kind(), ErrorKind::UnknownContainer);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!*fired.lock().unwrap());
    assert!(channel.calls().is_empty());

    let err = mediator
        .info_for_container("iCloud.unknown")
        .expect_err("unknown");
    assert_eq!(err.kind(), ErrorKind::UnknownContainer);
    assert_eq!(
        mediator.info_for_container(CONTAINER)?.api_token,
        "api-key".to_string()
    );
    Ok(())
}

#[tokio::test]
async fn empty_operation_succeeds_without_backend_call() -> TestResult<()> {
    let channel = ScriptedChannel::echo();
    let mediator = mediator(&channel, MediatorConfig::default())?;

    let mut op = ModifySubscriptionsOperation::new(CONTAINER, Vec::new(), Vec::new());
    let rx = with_receiver(&mut op);
    let handle = mediator.add_operation(op)?;

    match rx.await? {
        Completion::Success(output) => {
            assert!(output.saved_subscriptions.is_empty());
            assert!(output.deleted_subscription_ids.is_empty());
        }
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(handle.wait().await, OperationState::Completed);
    assert!(channel.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn callback_fires_before_finished_observer() -> TestResult<()> {
    let channel = ScriptedChannel::echo();
    let mediator = mediator(&channel, MediatorConfig::default())?;

    let log = Arc::new(Mutex::new(Vec::new()));
    let mut op = ModifyRecordsOperation::new(CONTAINER, vec![record("notes", "a")], Vec::new());
    let callback_log = log.clone();
    op.set_modify_records_completion(move |saved, _, error| {
        assert_eq!(saved.len(), 1);
        assert!(error.is_none());
        callback_log.lock().unwrap().push("callback");
    });
    let observer_log = log.clone();
    op.set_finished_observer(move || observer_log.lock().unwrap().push("observer"));
    let handle = mediator.add_operation(op)?;

    assert_eq!(handle.wait().await, OperationState::Completed);
    assert_eq!(*log.lock().unwrap(), vec!["callback", "observer"]);
    assert_eq!(channel.calls()[0].token, "session-1");
    Ok(())
}

#[tokio::test]
async fn validation_errors_arrive_through_the_callback() -> TestResult<()> {
    let channel = ScriptedChannel::echo();
    let mediator = mediator(&channel, MediatorConfig::default())?;

    let mut op = ModifySubscriptionsOperation::new(
        CONTAINER,
        vec![Subscription::zone("dup", zone("notes"))],
        vec!["dup".to_string()],
    );
    let rx = with_receiver(&mut op);
    mediator.add_operation(op)?;
    match rx.await? {
        Completion::Failure(error) => assert_eq!(error.kind(), ErrorKind::InvalidInput),
        other => panic!("expected invalid input, got {other:?}"),
    }
    assert!(channel.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn remote_notification_registration_is_idempotent() -> TestResult<()> {
    let channel = ScriptedChannel::echo();
    let mediator = mediator(&channel, MediatorConfig::default())?;
    let mut events = mediator.subscribe_account_status();

    let (first, second) = tokio::join!(
        mediator.register_for_remote_notifications(),
        mediator.register_for_remote_notifications()
    );
    assert_eq!(first?, AccountStatus::Available);
    assert_eq!(second?, AccountStatus::Available);
    assert_eq!(mediator.register_for_remote_notifications().await?, AccountStatus::Available);

    let calls = channel.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].method, "tokens/register");

    let event = events.recv().await?;
    assert_eq!(event.status, AccountStatus::Available);
    assert!(events.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn failed_registration_is_retried() -> TestResult<()> {
    let attempts = Arc::new(Mutex::new(0));
    let counter = attempts.clone();
    let channel = ScriptedChannel::new(Box::new(move |_: &str, _: &Value| {
        let mut attempts = counter.lock().unwrap();
        *attempts += 1;
        if *attempts == 1 {
            Err(Error::new(ErrorKind::NetworkFailure))
        } else {
            Ok(json!({ "accountStatus": "restricted" }))
        }
    }));
    let mediator = mediator(&channel, MediatorConfig::default())?;

    let err = mediator
        .register_for_remote_notifications()
        .await
        .expect_err("first attempt fails");
    assert_eq!(err.kind(), ErrorKind::NetworkFailure);
    assert_eq!(
        mediator.register_for_remote_notifications().await?,
        AccountStatus::Restricted
    );
    assert_eq!(*attempts.lock().unwrap(), 2);
    Ok(())
}

#[tokio::test]
async fn account_status_events_fire_only_on_change() -> TestResult<()> {
    let responses = Arc::new(Mutex::new(vec!["available", "available", "noAccount"]));
    let queue = responses.clone();
    let channel = ScriptedChannel::new(Box::new(move |_: &str, _: &Value| {
        let status = queue.lock().unwrap().remove(0);
        Ok(json!({ "accountStatus": status }))
    }));
    let mediator = mediator(&channel, MediatorConfig::default())?;
    let mut events = mediator.subscribe_account_status();

    for _ in 0..3 {
        mediator.refresh_account_status().await?;
    }
    assert_eq!(channel.calls()[0].method, "public/users/current");
    assert_eq!(events.recv().await?.status, AccountStatus::Available);
    let change = events.recv().await?;
    assert_eq!(change.status, AccountStatus::NoAccount);
    assert_eq!(
        change.to_json()["userInfo"][cloudmediator::api::ACCOUNT_STATUS_USER_INFO_KEY],
        "noAccount"
    );
    assert!(events.try_recv().is_err());
    assert_eq!(mediator.last_account_status(), Some(AccountStatus::NoAccount));
    Ok(())
}

#[tokio::test]
async fn session_token_is_set_once_per_cycle() -> TestResult<()> {
    let channel = ScriptedChannel::echo();
    let mediator = mediator(&channel, MediatorConfig::default())?;

    mediator.set_session_token("session-1")?;
    let err = mediator
        .set_session_token("session-2")
        .expect_err("second token");
    assert_eq!(err.kind(), ErrorKind::Usage);

    mediator.clear_session_token();
    mediator.set_session_token("session-2")?;
    assert_eq!(mediator.session().token(), Some("session-2"));
    Ok(())
}
