//! Purpose: `cloudmediator` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, drives one operation through a mediator, emits JSON.
//! Invariants: Results are emitted as JSON on stdout; errors as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Every backend call goes through `api::Mediator`.
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

use cloudmediator::api::{
    Completion, ContainerConfig, ContainerFile, DatabaseScope, Environment, Error, ErrorKind,
    FetchRecordZonesOperation, FetchRecordsOperation, HttpCallChannel, Mediator, MediatorConfig,
    ModifyRecordZonesOperation, ModifyRecordsOperation, ModifySubscriptionsOperation, Operation,
    PartialErrors, Record, RecordId, RecordZone, RecordZoneId, SavePolicy, Subscription,
    to_exit_code,
};

const DEFAULT_BASE_URL: &str = "https://api.apple-cloudkit.com";

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `cloudmediator --help`."));
            }
        },
    };

    init_tracing();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start async runtime")
                .with_source(err)
        })?;
    runtime
        .block_on(dispatch(cli))
        .map_err(add_internal_hint)
}

#[derive(Parser)]
#[command(
    name = "cloudmediator",
    version,
    about = "Queue record, zone, and subscription operations against a cloud record backend",
    after_help = r#"EXAMPLES
  $ cloudmediator --config containers.json containers
  $ cloudmediator --config containers.json --token $SESSION zones list
  $ cloudmediator --config containers.json fetch-records --zone notes note-1 note-2
  $ cloudmediator --config containers.json save-record --zone notes --type Note \
      --name note-1 --field title='"hello"'

NOTES
  - The session token may also come from CLOUDMEDIATOR_SESSION_TOKEN
  - Without --container the first configured container is used
  - Set RUST_LOG=debug to trace queue and backend activity on stderr"#,
    arg_required_else_help = true
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    #[arg(
        long,
        global = true,
        help = "Container config file ({\"containers\": [...]})",
        value_hint = ValueHint::FilePath
    )]
    config: Option<PathBuf>,
    #[arg(
        long = "base-url",
        global = true,
        default_value = DEFAULT_BASE_URL,
        help = "Backend web service root"
    )]
    base_url: String,
    #[arg(
        long,
        global = true,
        env = "CLOUDMEDIATOR_SESSION_TOKEN",
        hide_env_values = true,
        help = "Session token for the signed-in user"
    )]
    token: Option<String>,
    #[arg(long, global = true, help = "Container identifier to target")]
    container: Option<String>,
    #[arg(
        long = "api-token",
        global = true,
        env = "CLOUDMEDIATOR_API_TOKEN",
        hide_env_values = true,
        help = "API token for --container when no config file is given"
    )]
    api_token: Option<String>,
    #[arg(
        long,
        global = true,
        value_enum,
        default_value = "private",
        help = "Database scope: public|private|shared"
    )]
    database: DatabaseArg,
    #[arg(
        long = "timeout-secs",
        global = true,
        default_value_t = 30,
        help = "Per-request timeout in seconds"
    )]
    timeout_secs: u64,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum DatabaseArg {
    Public,
    Private,
    Shared,
}

impl From<DatabaseArg> for DatabaseScope {
    fn from(value: DatabaseArg) -> Self {
        match value {
            DatabaseArg::Public => DatabaseScope::Public,
            DatabaseArg::Private => DatabaseScope::Private,
            DatabaseArg::Shared => DatabaseScope::Shared,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum SavePolicyArg {
    IfUnchanged,
    ChangedKeys,
    AllKeys,
}

impl From<SavePolicyArg> for SavePolicy {
    fn from(value: SavePolicyArg) -> Self {
        match value {
            SavePolicyArg::IfUnchanged => SavePolicy::IfServerRecordUnchanged,
            SavePolicyArg::ChangedKeys => SavePolicy::ChangedKeys,
            SavePolicyArg::AllKeys => SavePolicy::AllKeys,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "List configured containers (no backend call)")]
    Containers,
    #[command(about = "Report the account status of the session")]
    Status {
        #[arg(long, help = "Also register the session for remote notifications")]
        register: bool,
    },
    #[command(name = "fetch-records", about = "Fetch records by name from one zone")]
    FetchRecords {
        #[arg(long, help = "Zone holding the records (default zone if omitted)")]
        zone: Option<String>,
        #[arg(long = "key", help = "Repeatable field name to return")]
        keys: Vec<String>,
        #[arg(required = true, help = "Record names")]
        names: Vec<String>,
    },
    #[command(name = "save-record", about = "Save one record")]
    SaveRecord {
        #[arg(long, help = "Zone holding the record (default zone if omitted)")]
        zone: Option<String>,
        #[arg(long = "type", help = "Record type")]
        record_type: String,
        #[arg(long, help = "Record name")]
        name: String,
        #[arg(long = "field", help = "Repeatable name=value; value is JSON or a plain string")]
        fields: Vec<String>,
        #[arg(long = "change-tag", help = "Server change tag the edit is based on")]
        change_tag: Option<String>,
        #[arg(long, value_enum, default_value = "if-unchanged", help = "Conflict policy")]
        policy: SavePolicyArg,
    },
    #[command(name = "delete-records", about = "Delete records by name from one zone")]
    DeleteRecords {
        #[arg(long, help = "Zone holding the records (default zone if omitted)")]
        zone: Option<String>,
        #[arg(long, help = "Delete even if the server copy changed")]
        force: bool,
        #[arg(required = true, help = "Record names")]
        names: Vec<String>,
    },
    #[command(arg_required_else_help = true, about = "List, save, or delete record zones")]
    Zones {
        #[command(subcommand)]
        command: ZonesCommand,
    },
    #[command(arg_required_else_help = true, about = "Save or delete subscriptions")]
    Subscriptions {
        #[command(subcommand)]
        command: SubscriptionsCommand,
    },
}

#[derive(Subcommand)]
enum ZonesCommand {
    #[command(about = "Fetch every zone, or only the named ones")]
    List {
        #[arg(help = "Zone names (all zones if omitted)")]
        names: Vec<String>,
    },
    #[command(about = "Create zones")]
    Save {
        #[arg(required = true)]
        names: Vec<String>,
    },
    #[command(about = "Delete zones")]
    Delete {
        #[arg(required = true)]
        names: Vec<String>,
    },
}

#[derive(Subcommand)]
enum SubscriptionsCommand {
    #[command(about = "Subscribe to changes in a zone")]
    Save {
        #[arg(long, help = "Subscription id")]
        id: String,
        #[arg(long, help = "Zone to watch")]
        zone: String,
    },
    #[command(about = "Delete subscriptions by id")]
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

// Resolved target of a command: mediator plus the container operations address.
struct Target {
    mediator: Mediator,
    container: String,
    database: DatabaseScope,
}

async fn dispatch(cli: Cli) -> Result<RunOutcome, Error> {
    let containers = load_containers(&cli.global)?;

    if let Command::Containers = cli.command {
        let listed: Vec<Value> = containers
            .iter()
            .map(|config| {
                json!({
                    "containerIdentifier": config.container_identifier,
                    "environment": config.environment.as_str(),
                    "name": config.name,
                })
            })
            .collect();
        emit_json(json!({ "containers": listed }));
        return Ok(RunOutcome::ok());
    }

    let target = build_target(&cli.global, containers)?;
    match cli.command {
        Command::Containers => Ok(RunOutcome::ok()),
        Command::Status { register } => run_status(&target, register).await,
        Command::FetchRecords { zone, keys, names } => {
            let zone = zone_id(zone.as_deref())?;
            let ids = names
                .into_iter()
                .map(|name| RecordId::new(name, zone.clone()))
                .collect();
            let mut op = FetchRecordsOperation::new(target.container.clone(), ids)
                .with_database(target.database);
            if !keys.is_empty() {
                op = op.with_desired_keys(keys);
            }
            let (output, error) = run_operation(&target.mediator, op).await?;
            let mut records: Vec<&Record> = output.records.values().collect();
            records.sort_by(|a, b| a.record_id.record_name.cmp(&b.record_id.record_name));
            finish(json!({ "records": records }), error)
        }
        Command::SaveRecord {
            zone,
            record_type,
            name,
            fields,
            change_tag,
            policy,
        } => {
            let record_id = RecordId::new(name, zone_id(zone.as_deref())?);
            let mut record = Record::new(record_type, record_id);
            for field in &fields {
                let (name, value) = parse_field(field)?;
                record = record.with_field(name, value);
            }
            record.record_change_tag = change_tag;
            let op = ModifyRecordsOperation::new(target.container.clone(), vec![record], Vec::new())
                .with_database(target.database)
                .with_save_policy(policy.into());
            let (output, error) = run_operation(&target.mediator, op).await?;
            finish(json!({ "saved": output.saved_records }), error)
        }
        Command::DeleteRecords { zone, force, names } => {
            let zone = zone_id(zone.as_deref())?;
            let ids = names
                .into_iter()
                .map(|name| RecordId::new(name, zone.clone()))
                .collect();
            let policy = if force {
                SavePolicy::ChangedKeys
            } else {
                SavePolicy::IfServerRecordUnchanged
            };
            let op = ModifyRecordsOperation::new(target.container.clone(), Vec::new(), ids)
                .with_database(target.database)
                .with_save_policy(policy);
            let (output, error) = run_operation(&target.mediator, op).await?;
            finish(json!({ "deleted": output.deleted_record_ids }), error)
        }
        Command::Zones { command } => run_zones(&target, command).await,
        Command::Subscriptions { command } => run_subscriptions(&target, command).await,
    }
}

async fn run_status(target: &Target, register: bool) -> Result<RunOutcome, Error> {
    let mut value = Map::new();
    if register {
        let status = target.mediator.register_for_remote_notifications().await?;
        value.insert("registered".to_string(), json!(true));
        value.insert("registrationStatus".to_string(), json!(status.as_str()));
    }
    let status = target.mediator.refresh_account_status().await?;
    value.insert("accountStatus".to_string(), json!(status.as_str()));
    emit_json(Value::Object(value));
    Ok(RunOutcome::ok())
}

async fn run_zones(target: &Target, command: ZonesCommand) -> Result<RunOutcome, Error> {
    match command {
        ZonesCommand::List { names } => {
            let op = if names.is_empty() {
                FetchRecordZonesOperation::all(target.container.clone())
            } else {
                FetchRecordZonesOperation::new(target.container.clone(), zone_ids(&names)?)
            };
            let op = op.with_database(target.database);
            let (output, error) = run_operation(&target.mediator, op).await?;
            finish(json!({ "zones": output.zones }), error)
        }
        ZonesCommand::Save { names } => {
            let zones = zone_ids(&names)?.into_iter().map(RecordZone::new).collect();
            let op = ModifyRecordZonesOperation::new(target.container.clone(), zones, Vec::new())
                .with_database(target.database);
            let (output, error) = run_operation(&target.mediator, op).await?;
            finish(json!({ "saved": output.saved_zones }), error)
        }
        ZonesCommand::Delete { names } => {
            let op = ModifyRecordZonesOperation::new(
                target.container.clone(),
                Vec::new(),
                zone_ids(&names)?,
            )
            .with_database(target.database);
            let (output, error) = run_operation(&target.mediator, op).await?;
            finish(json!({ "deleted": output.deleted_zone_ids }), error)
        }
    }
}

async fn run_subscriptions(
    target: &Target,
    command: SubscriptionsCommand,
) -> Result<RunOutcome, Error> {
    let op = match command {
        SubscriptionsCommand::Save { id, zone } => ModifySubscriptionsOperation::new(
            target.container.clone(),
            vec![Subscription::zone(id, RecordZoneId::new(zone)?)],
            Vec::new(),
        ),
        SubscriptionsCommand::Delete { ids } => {
            ModifySubscriptionsOperation::new(target.container.clone(), Vec::new(), ids)
        }
    };
    let op = op.with_database(target.database);
    let (output, error) = run_operation(&target.mediator, op).await?;
    finish(
        json!({
            "saved": output.saved_subscriptions,
            "deleted": output.deleted_subscription_ids,
        }),
        error,
    )
}

/// Submit `op` and wait for its completion. A partial failure keeps the succeeded output.
async fn run_operation<O: Operation>(
    mediator: &Mediator,
    mut op: O,
) -> Result<(O::Output, Option<Error>), Error> {
    let (tx, rx) = oneshot::channel();
    op.set_completion(move |completion| {
        let _ = tx.send(completion);
    });
    mediator.add_operation(op)?;
    let completion = rx.await.map_err(|_| {
        Error::new(ErrorKind::Internal).with_message("operation finished without a result")
    })?;
    match completion {
        Completion::Success(value) => Ok((value, None)),
        Completion::Partial { value, error } => Ok((value, Some(error))),
        Completion::Failure(error) => Err(error),
    }
}

fn finish(mut value: Value, error: Option<Error>) -> Result<RunOutcome, Error> {
    let Some(error) = error else {
        emit_json(value);
        return Ok(RunOutcome::ok());
    };
    if let Some(failures) = error.partial_errors() {
        value["failed"] = failures_json(failures);
    }
    emit_json(value);
    Ok(RunOutcome::with_code(to_exit_code(error.kind())))
}

fn load_containers(global: &GlobalArgs) -> Result<Vec<ContainerConfig>, Error> {
    let mut containers = match &global.config {
        Some(path) => ContainerFile::load(path)?.containers,
        None => Vec::new(),
    };
    if let (Some(container), Some(api_token)) = (&global.container, &global.api_token) {
        let listed = containers
            .iter()
            .any(|config| &config.container_identifier == container);
        if !listed {
            containers.push(
                ContainerConfig::new(container.clone(), api_token.clone())
                    .with_environment(Environment::Development),
            );
        }
    }
    Ok(containers)
}

fn build_target(global: &GlobalArgs, containers: Vec<ContainerConfig>) -> Result<Target, Error> {
    let container = match (&global.container, containers.first()) {
        (Some(container), _) => container.clone(),
        (None, Some(first)) => first.container_identifier.clone(),
        (None, None) => {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("no container configured")
                .with_hint("Pass --config <file> or --container with --api-token."));
        }
    };

    let config = MediatorConfig {
        request_timeout: Duration::from_secs(global.timeout_secs),
        ..MediatorConfig::default()
    };
    config.validate()?;
    let channel = HttpCallChannel::new(global.base_url.clone(), config.request_timeout)?;
    let mediator = Mediator::new(Arc::new(channel), config)?;
    for config in containers {
        mediator.register_container(config)?;
    }
    if let Some(token) = &global.token {
        mediator.set_session_token(token.clone())?;
    }

    Ok(Target {
        mediator,
        container,
        database: global.database.into(),
    })
}

fn zone_id(name: Option<&str>) -> Result<RecordZoneId, Error> {
    match name {
        Some(name) => RecordZoneId::new(name),
        None => Ok(RecordZoneId::default_zone()),
    }
}

fn zone_ids(names: &[String]) -> Result<Vec<RecordZoneId>, Error> {
    names.iter().map(|name| RecordZoneId::new(name.as_str())).collect()
}

fn parse_field(raw: &str) -> Result<(String, Value), Error> {
    let Some((name, value)) = raw.split_once('=') else {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("invalid field `{raw}`"))
            .with_hint("Use --field name=value, e.g. --field count=3."));
    };
    if name.is_empty() {
        return Err(Error::new(ErrorKind::Usage).with_message("field name must not be empty"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("error: {}", error_message(err));
        if let Some(hint) = err.hint() {
            eprintln!("hint: {hint}");
        }
        return;
    }

    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::InvalidInput => "invalid input".to_string(),
        ErrorKind::NotAuthenticated => "not authenticated".to_string(),
        ErrorKind::UnknownContainer => "unknown container".to_string(),
        ErrorKind::NetworkFailure => "network failure".to_string(),
        ErrorKind::Server => "server error".to_string(),
        ErrorKind::PartialFailure => "some items failed".to_string(),
        ErrorKind::Cancelled => "cancelled".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_fields(err: &Error) -> Map<String, Value> {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(err.kind().as_str()));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(code) = err.server_code() {
        inner.insert("serverErrorCode".to_string(), json!(code));
    }
    inner
}

fn failures_json(failures: &PartialErrors) -> Value {
    let map: Map<String, Value> = failures
        .iter()
        .map(|(item, err)| (item.clone(), Value::Object(error_fields(err))))
        .collect();
    Value::Object(map)
}

fn error_json(err: &Error) -> Value {
    let mut inner = error_fields(err);
    if let Some(failures) = err.partial_errors() {
        inner.insert("failed".to_string(), failures_json(failures));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }
    json!({ "error": inner })
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint("Unexpected internal failure. Retry with RUST_LOG=debug and share the output if it persists.")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

#[cfg(test)]
mod tests {
    use super::{error_json, parse_field};
    use cloudmediator::api::{Error, ErrorKind, PartialErrors};
    use serde_json::json;

    #[test]
    fn parse_field_accepts_json_and_plain_strings() {
        assert_eq!(parse_field("count=3").unwrap(), ("count".to_string(), json!(3)));
        assert_eq!(
            parse_field("title=hello world").unwrap(),
            ("title".to_string(), json!("hello world"))
        );
        assert_eq!(
            parse_field("novalue").unwrap_err().kind(),
            ErrorKind::Usage
        );
    }

    #[test]
    fn error_json_lists_failed_items() {
        let mut failures = PartialErrors::new();
        failures.insert(
            "notes/b".to_string(),
            Error::new(ErrorKind::Server).with_server_code("CONFLICT"),
        );
        let value = error_json(&Error::partial(failures));
        assert_eq!(value["error"]["kind"], "PartialFailure");
        assert_eq!(
            value["error"]["failed"]["notes/b"]["serverErrorCode"],
            "CONFLICT"
        );
    }
}
