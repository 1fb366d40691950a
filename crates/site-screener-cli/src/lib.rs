//! Operator command surface for the site-screening pipeline.
//!
//! Every command prints one JSON document on stdout; logs go to stderr.
//! A gate check that blocks promotion exits with status 2.
//!
//! Embedding hosts can use [`run_cli`] with a parsed [`Cli`], after calling
//! [`init_tracing`] once.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use site_screener_conflict::{apply_assertions, resolve_conflict, ConflictReport, PrecedenceTable};
use site_screener_domain::{now_utc, parse_rfc3339_utc, DateTimeUtc, RunId, RunRecord};
use site_screener_gate::{load_gate_from_path, validate, validate_run, ValidationResult};
use site_screener_knowledge::{
    evaluate_completeness, evaluate_freshness, parse_iso_date, AuthorityScope, Card, CardSchema,
    FreshnessPolicy, KnowledgeField, Prohibition, ProhibitionStatus, Provenance, SourceType,
    SubjectKey,
};
use site_screener_orchestrator::{
    GatedRun, PhaseOrchestrator, RunConfig, RunPolicy, TracingRunLogger, UlidGenerator,
};
use site_screener_phase::load_phase_from_path;
use site_screener_stage::StageRegistry;
use site_screener_store_core::{write_card_with_retry, CardStore, CardWrite, RunStore};
use site_screener_store_sqlite::SqliteStore;
use tracing_subscriber::EnvFilter;

/// Process exit status when a gate blocks promotion.
pub const GATE_BLOCKED_EXIT: u8 = 2;

const CARD_WRITE_ATTEMPTS: u32 = 3;

#[derive(Debug, Parser)]
#[command(name = "site-screener")]
#[command(about = "Phase runner, gate checks and constraint cards for storage-site screening")]
pub struct Cli {
    #[arg(long, global = true, default_value = "./site_screener.sqlite3")]
    db: PathBuf,

    /// Log filter directive. `RUST_LOG` wins when set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    #[must_use]
    pub fn log_json(&self) -> bool {
        self.log_json
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Phase {
        #[command(subcommand)]
        command: Box<PhaseCommand>,
    },
    Gate {
        #[command(subcommand)]
        command: Box<GateCommand>,
    },
    Run {
        #[command(subcommand)]
        command: Box<RunCommand>,
    },
    Card {
        #[command(subcommand)]
        command: Box<CardCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum PhaseCommand {
    /// Normalize a phase definition and check that every stage binds.
    Validate(PhaseValidateArgs),
    /// Run a phase and store its record.
    Run(PhaseRunArgs),
}

#[derive(Debug, Args)]
pub struct PhaseValidateArgs {
    #[arg(long)]
    phase: PathBuf,
}

#[derive(Debug, Args)]
pub struct PhaseRunArgs {
    #[arg(long)]
    phase: PathBuf,
    /// JSON file holding the phase input.
    #[arg(long, conflicts_with = "input_json")]
    input: Option<PathBuf>,
    #[arg(long)]
    input_json: Option<String>,
    /// Run policy YAML; defaults apply when omitted.
    #[arg(long)]
    policy: Option<PathBuf>,
    #[arg(long)]
    as_of: Option<String>,
    /// Stored run to gate on before running.
    #[arg(long, requires = "gate")]
    upstream_run_id: Option<String>,
    #[arg(long, requires = "upstream_run_id")]
    gate: Option<PathBuf>,
    /// Card consulted by the gate, as `<jurisdiction>::<asset_class>`.
    #[arg(long)]
    subject: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum GateCommand {
    /// Validate a run record against a gate definition.
    Check(GateCheckArgs),
}

#[derive(Debug, Args)]
pub struct GateCheckArgs {
    #[arg(long)]
    gate: PathBuf,
    #[arg(long, conflicts_with = "record")]
    run_id: Option<String>,
    /// Run record JSON file, for records not in the store.
    #[arg(long)]
    record: Option<PathBuf>,
    #[arg(long)]
    subject: Option<String>,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum RunCommand {
    Show(RunShowArgs),
    List,
}

#[derive(Debug, Args)]
pub struct RunShowArgs {
    #[arg(long)]
    run_id: String,
}

#[derive(Debug, Subcommand)]
pub enum CardCommand {
    /// Create a card with every declared field unknown.
    Init(CardInitArgs),
    Show(CardShowArgs),
    /// Assert field values, applying the precedence table.
    Assert(CardAssertArgs),
    /// Settle an open conflict with an operator-chosen value.
    Resolve(CardResolveArgs),
    Prohibit(CardProhibitArgs),
    Lift(CardLiftArgs),
}

#[derive(Debug, Args)]
pub struct CardInitArgs {
    #[arg(long)]
    subject: String,
    #[arg(long, default_value = "config/card-schema.yaml")]
    schema: PathBuf,
}

#[derive(Debug, Args)]
pub struct CardShowArgs {
    #[arg(long)]
    subject: String,
    #[arg(long)]
    as_of: Option<String>,
    #[arg(long)]
    max_age_months: Option<u32>,
    /// Print every stored version instead of the current card.
    #[arg(long)]
    history: bool,
}

#[derive(Debug, Args)]
pub struct FieldValueArgs {
    /// JSON value; text that is not valid JSON is taken as a string.
    #[arg(long, conflicts_with = "blocked")]
    value: Option<String>,
    /// Mark the field blocked with this rationale.
    #[arg(long)]
    blocked: Option<String>,
    #[arg(long)]
    source_type: Option<String>,
    #[arg(long)]
    source_reference: Option<String>,
    #[arg(long)]
    authority_scope: Option<String>,
    /// `YYYY-MM-DD` after which the value needs re-verification.
    #[arg(long)]
    ttl_date: Option<String>,
}

#[derive(Debug, Args)]
pub struct CardAssertArgs {
    #[arg(long)]
    subject: String,
    #[arg(long, conflicts_with = "assertions")]
    field: Option<String>,
    #[command(flatten)]
    value: FieldValueArgs,
    /// JSON object of `key -> { value | blocked, source_type, ... }`.
    #[arg(long)]
    assertions: Option<PathBuf>,
    /// Precedence YAML; the standard table applies when omitted.
    #[arg(long)]
    precedence: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct CardResolveArgs {
    #[arg(long)]
    subject: String,
    #[arg(long)]
    field: String,
    #[command(flatten)]
    value: FieldValueArgs,
}

#[derive(Debug, Args)]
pub struct CardProhibitArgs {
    #[arg(long)]
    subject: String,
    #[arg(long)]
    code: String,
    #[arg(long)]
    description: String,
    #[arg(long)]
    authority_scope: String,
}

#[derive(Debug, Args)]
pub struct CardLiftArgs {
    #[arg(long)]
    subject: String,
    #[arg(long)]
    code: String,
}

/// Install the stderr `tracing` subscriber.
///
/// # Errors
/// Returns an error when the filter directive is invalid or a global
/// subscriber is already installed.
pub fn init_tracing(log_level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("invalid log filter `{log_level}`"))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

/// Executes a parsed command.
///
/// # Errors
/// Returns an error when a definition cannot be loaded, the store cannot be
/// opened or the command itself fails. A blocking gate is not an error; it
/// yields exit status [`GATE_BLOCKED_EXIT`].
pub fn run_cli(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Phase { command } => match *command {
            PhaseCommand::Validate(args) => phase_validate(&args),
            PhaseCommand::Run(args) => {
                let store = open_store(&cli.db)?;
                phase_run(args, &store)
            }
        },
        Command::Gate { command } => {
            let store = open_store(&cli.db)?;
            match *command {
                GateCommand::Check(args) => gate_check(&args, &store),
            }
        }
        Command::Run { command } => {
            let store = open_store(&cli.db)?;
            run_inspect(&command, &store)
        }
        Command::Card { command } => {
            let store = open_store(&cli.db)?;
            run_card(*command, &store)
        }
    }
}

fn open_store(path: &Path) -> Result<SqliteStore> {
    let store = SqliteStore::open(path)?;
    store.migrate()?;
    Ok(store)
}

fn phase_validate(args: &PhaseValidateArgs) -> Result<ExitCode> {
    let envelope = load_phase_from_path(&args.phase)?;
    let orchestrator = PhaseOrchestrator::bind(
        &envelope.definition,
        &StageRegistry::default(),
        Arc::new(UlidGenerator::new()),
        Arc::new(TracingRunLogger),
    )?;
    let stages: Vec<&str> = envelope
        .definition
        .stages
        .iter()
        .map(|stage| stage.stage_id.as_str())
        .collect();
    print_json(&json!({
        "phase_tag": envelope.definition.phase_tag,
        "phase_version": envelope.definition.phase_version,
        "terminal_stage": envelope.definition.terminal_stage,
        "stages": stages,
        "source_yaml_hash": envelope.source_yaml_hash,
        "normalized_hash": envelope.normalized_hash,
        "phase_hash": orchestrator.phase_hash(),
    }))?;
    Ok(ExitCode::SUCCESS)
}

#[derive(Debug, Serialize)]
struct GatedRunOutput<'a> {
    validation: &'a ValidationResult,
    record: Option<&'a RunRecord>,
}

fn phase_run(args: PhaseRunArgs, store: &SqliteStore) -> Result<ExitCode> {
    let envelope = load_phase_from_path(&args.phase)?;
    let policy = match &args.policy {
        Some(path) => RunPolicy::load_from_path(path)?,
        None => RunPolicy::default(),
    };
    let input = read_input(args.input.as_deref(), args.input_json.as_deref())?;
    let config = RunConfig {
        as_of: parse_optional_as_of(args.as_of.as_deref())?,
        ..RunConfig::default()
    };
    let orchestrator = PhaseOrchestrator::bind(
        &envelope.definition,
        &StageRegistry::default(),
        Arc::new(UlidGenerator::new()),
        Arc::new(TracingRunLogger),
    )?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let (Some(upstream_run_id), Some(gate_path)) = (&args.upstream_run_id, &args.gate) else {
        let record = runtime.block_on(orchestrator.run(input, &policy, config))?;
        store.insert_run(&record)?;
        log_stored(&record);
        print_json(&record)?;
        return Ok(ExitCode::SUCCESS);
    };

    let upstream = load_run(store, upstream_run_id)?;
    let gate = load_gate_from_path(gate_path)?;
    let card = load_optional_card(store, args.subject.as_deref())?;
    let gated = runtime.block_on(orchestrator.run_gated(
        &upstream,
        &gate,
        card.as_ref(),
        input,
        &policy,
        config,
    ))?;
    if let Some(record) = gated.record() {
        store.insert_run(record)?;
        log_stored(record);
    }
    print_json(&GatedRunOutput {
        validation: gated.validation(),
        record: gated.record(),
    })?;
    Ok(match gated {
        GatedRun::Started { .. } => ExitCode::SUCCESS,
        GatedRun::Blocked(_) => ExitCode::from(GATE_BLOCKED_EXIT),
    })
}

fn log_stored(record: &RunRecord) {
    tracing::info!(
        run_id = %record.run_id,
        phase_tag = %record.phase_tag,
        status = record.aggregate_status.as_str(),
        errors = record.errors.len(),
        "run stored"
    );
}

fn gate_check(args: &GateCheckArgs, store: &SqliteStore) -> Result<ExitCode> {
    let gate = load_gate_from_path(&args.gate)?;
    let card = load_optional_card(store, args.subject.as_deref())?;
    let as_of = parse_optional_as_of(args.as_of.as_deref())?.unwrap_or_else(now_utc);
    let result = match (&args.run_id, &args.record) {
        (Some(run_id), _) => {
            let record = load_run(store, run_id)?;
            validate_run(&gate, &record, card.as_ref(), as_of)?
        }
        (None, Some(path)) => {
            let record = read_json_file(path)?;
            validate(&gate, &record, card.as_ref(), as_of)
        }
        (None, None) => return Err(anyhow!("gate check needs --run-id or --record")),
    };
    if !result.ok {
        tracing::warn!(
            gate = %gate.gate_name,
            blockers = %result.blockers.join(","),
            "gate blocked promotion"
        );
    }
    print_json(&result)?;
    Ok(if result.ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(GATE_BLOCKED_EXIT)
    })
}

fn run_inspect(command: &RunCommand, store: &SqliteStore) -> Result<ExitCode> {
    match command {
        RunCommand::Show(args) => print_json(&load_run(store, &args.run_id)?)?,
        RunCommand::List => print_json(&store.list_runs()?)?,
    }
    Ok(ExitCode::SUCCESS)
}

#[derive(Debug, Serialize)]
struct CardWriteOutput<'a> {
    card: &'a Card,
    attempts: u32,
    needs_revalidation: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<&'a ConflictReport>,
}

fn print_card_write(write: &CardWrite, report: Option<&ConflictReport>) -> Result<()> {
    print_json(&CardWriteOutput {
        card: &write.card,
        attempts: write.attempts,
        needs_revalidation: &write.needs_revalidation,
        report,
    })
}

fn run_card(command: CardCommand, store: &SqliteStore) -> Result<ExitCode> {
    match command {
        CardCommand::Init(args) => {
            let subject = parse_subject(&args.subject)?;
            let schema = CardSchema::load_from_path(&args.schema)?;
            let write = write_card_with_retry(store, &subject, CARD_WRITE_ATTEMPTS, now_utc(), |current| {
                if let Some(existing) = current {
                    return Err(anyhow!(
                        "card {subject} already exists at version {}",
                        existing.version()
                    ));
                }
                Ok(Card::initialize(subject.clone(), &schema, now_utc())?)
            })?;
            print_card_write(&write, None)?;
        }
        CardCommand::Show(args) => card_show(&args, store)?,
        CardCommand::Assert(args) => {
            let subject = parse_subject(&args.subject)?;
            let table = match &args.precedence {
                Some(path) => PrecedenceTable::load_from_path(path)?,
                None => PrecedenceTable::standard(),
            };
            let incoming = match (&args.field, &args.assertions) {
                (Some(key), _) => BTreeMap::from([(key.clone(), field_from_args(&args.value)?)]),
                (None, Some(path)) => read_assertions(path)?,
                (None, None) => return Err(anyhow!("card assert needs --field or --assertions")),
            };
            let mut report = None;
            let write = write_card_with_retry(store, &subject, CARD_WRITE_ATTEMPTS, now_utc(), |current| {
                let card = require_card(current, &subject)?;
                let (next, applied) = apply_assertions(&card, &incoming, &table, now_utc())?;
                report = Some(applied);
                Ok(next)
            })?;
            if let Some(report) = &report {
                for flag in report.flags() {
                    tracing::warn!(subject = %subject, flag = %flag, "conflicting assertion recorded");
                }
            }
            print_card_write(&write, report.as_ref())?;
        }
        CardCommand::Resolve(args) => {
            let subject = parse_subject(&args.subject)?;
            let chosen = field_from_args(&args.value)?;
            let write = write_card_with_retry(store, &subject, CARD_WRITE_ATTEMPTS, now_utc(), |current| {
                let card = require_card(current, &subject)?;
                Ok(resolve_conflict(&card, &args.field, chosen.clone(), now_utc())?)
            })?;
            print_card_write(&write, None)?;
        }
        CardCommand::Prohibit(args) => {
            let subject = parse_subject(&args.subject)?;
            let authority_scope = parse_authority_scope(&args.authority_scope)?;
            let write = write_card_with_retry(store, &subject, CARD_WRITE_ATTEMPTS, now_utc(), |current| {
                let mut card = require_card(current, &subject)?;
                card.add_prohibition(Prohibition {
                    code: args.code.clone(),
                    description: args.description.clone(),
                    authority_scope,
                    status: ProhibitionStatus::Open,
                    recorded_at: now_utc(),
                });
                Ok(card)
            })?;
            print_card_write(&write, None)?;
        }
        CardCommand::Lift(args) => {
            let subject = parse_subject(&args.subject)?;
            let write = write_card_with_retry(store, &subject, CARD_WRITE_ATTEMPTS, now_utc(), |current| {
                let mut card = require_card(current, &subject)?;
                if card.lift_prohibition(&args.code, now_utc()) == 0 {
                    return Err(anyhow!("no open prohibition {} on {subject}", args.code));
                }
                Ok(card)
            })?;
            print_card_write(&write, None)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn card_show(args: &CardShowArgs, store: &SqliteStore) -> Result<()> {
    let subject = parse_subject(&args.subject)?;
    if args.history {
        return print_json(&store.history(&subject)?);
    }
    let card = require_card(store.get(&subject)?, &subject)?;
    let as_of = parse_optional_as_of(args.as_of.as_deref())?.unwrap_or_else(now_utc);
    let policy = args
        .max_age_months
        .map_or_else(FreshnessPolicy::default, |max_age_months| FreshnessPolicy { max_age_months });
    print_json(&json!({
        "card": card,
        "completeness": evaluate_completeness(&card),
        "freshness": evaluate_freshness(&card, as_of, policy),
    }))
}

fn require_card(card: Option<Card>, subject: &SubjectKey) -> Result<Card> {
    card.ok_or_else(|| anyhow!("no card for {subject}; run `card init` first"))
}

fn load_optional_card(store: &SqliteStore, subject: Option<&str>) -> Result<Option<Card>> {
    let Some(raw) = subject else {
        return Ok(None);
    };
    let subject = parse_subject(raw)?;
    Ok(Some(require_card(store.get(&subject)?, &subject)?))
}

fn load_run(store: &SqliteStore, raw: &str) -> Result<RunRecord> {
    let run_id: RunId = raw.parse()?;
    store
        .get_run(run_id)?
        .ok_or_else(|| anyhow!("run {run_id} not found"))
}

fn parse_subject(raw: &str) -> Result<SubjectKey> {
    Ok(raw.parse::<SubjectKey>()?)
}

fn parse_optional_as_of(raw: Option<&str>) -> Result<Option<DateTimeUtc>> {
    raw.map(parse_rfc3339_utc).transpose()
}

fn parse_source_type(raw: &str) -> Result<SourceType> {
    SourceType::parse(raw).ok_or_else(|| anyhow!("unknown source type `{raw}`"))
}

fn parse_authority_scope(raw: &str) -> Result<AuthorityScope> {
    AuthorityScope::parse(raw).ok_or_else(|| {
        anyhow!("unknown authority scope `{raw}`; expected municipality, county or state")
    })
}

fn field_from_args(args: &FieldValueArgs) -> Result<KnowledgeField> {
    if let Some(reason) = &args.blocked {
        return Ok(KnowledgeField::blocked(reason.clone())?);
    }
    let raw = args
        .value
        .as_deref()
        .ok_or_else(|| anyhow!("either --value or --blocked is required"))?;
    let value =
        serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    let provenance = Provenance {
        source_type: args.source_type.as_deref().map(parse_source_type).transpose()?,
        source_reference: args.source_reference.clone(),
        authority_scope: args
            .authority_scope
            .as_deref()
            .map(parse_authority_scope)
            .transpose()?,
        ttl_date: args.ttl_date.as_deref().map(parse_iso_date).transpose()?,
    };
    Ok(KnowledgeField::known(value, provenance)?)
}

/// One entry of an `--assertions` file.
#[derive(Debug, Deserialize)]
struct AssertionDoc {
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    blocked: Option<String>,
    #[serde(flatten)]
    provenance: Provenance,
}

impl AssertionDoc {
    fn into_field(self, key: &str) -> Result<KnowledgeField> {
        match (self.value, self.blocked) {
            (Some(value), None) => Ok(KnowledgeField::known(value, self.provenance)
                .with_context(|| format!("assertion for `{key}`"))?),
            (None, Some(reason)) => Ok(KnowledgeField::blocked(reason)
                .with_context(|| format!("assertion for `{key}`"))?),
            (Some(_), Some(_)) => Err(anyhow!("assertion for `{key}` sets both value and blocked")),
            (None, None) => Err(anyhow!("assertion for `{key}` needs value or blocked")),
        }
    }
}

fn parse_assertions(body: &str) -> Result<BTreeMap<String, KnowledgeField>> {
    let docs: BTreeMap<String, AssertionDoc> =
        serde_json::from_str(body).context("assertions must be a JSON object of field entries")?;
    docs.into_iter()
        .map(|(key, doc)| {
            let field = doc.into_field(&key)?;
            Ok((key, field))
        })
        .collect()
}

fn read_assertions(path: &Path) -> Result<BTreeMap<String, KnowledgeField>> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read assertions {}", path.display()))?;
    parse_assertions(&body)
}

fn read_json_file(path: &Path) -> Result<Value> {
    let body =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&body).with_context(|| format!("failed to parse {}", path.display()))
}

fn read_input(path: Option<&Path>, inline: Option<&str>) -> Result<Value> {
    match (path, inline) {
        (Some(path), _) => read_json_file(path),
        (None, Some(raw)) => serde_json::from_str(raw).context("--input-json is not valid JSON"),
        (None, None) => Ok(json!({})),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use site_screener_knowledge::KnowledgeState;

    fn field_args(value: Option<&str>, blocked: Option<&str>) -> FieldValueArgs {
        FieldValueArgs {
            value: value.map(str::to_string),
            blocked: blocked.map(str::to_string),
            source_type: Some("ordinance".to_string()),
            source_reference: Some("Sec. 4.2.1".to_string()),
            authority_scope: Some("municipality".to_string()),
            ttl_date: Some("2027-01-31".to_string()),
        }
    }

    #[test]
    fn command_graph_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn field_args_build_known_and_blocked_fields() {
        let known = field_from_args(&field_args(Some("25"), None));
        assert!(matches!(known, Ok(ref field) if field.value() == Some(&json!(25))));
        assert_eq!(
            known.ok().and_then(|field| field.ttl_date()),
            parse_iso_date("2027-01-31").ok()
        );

        let text = field_from_args(&field_args(Some("C-2"), None));
        assert!(matches!(text, Ok(ref field) if field.value() == Some(&json!("C-2"))));

        let blocked = field_from_args(&field_args(None, Some("portal requires login")));
        assert!(matches!(blocked, Ok(ref field) if field.knowledge_state() == KnowledgeState::Blocked));

        assert!(field_from_args(&field_args(None, None)).is_err());
        let mut missing_scope = field_args(Some("25"), None);
        missing_scope.authority_scope = None;
        assert!(field_from_args(&missing_scope).is_err());
        let mut bad_scope = field_args(Some("25"), None);
        bad_scope.authority_scope = Some("federal".to_string());
        assert!(field_from_args(&bad_scope).is_err());
    }

    #[test]
    fn assertion_files_accept_known_and_blocked_entries() {
        let body = r#"{
            "front_setback_ft": {
                "value": 25,
                "source_type": "ordinance",
                "source_reference": "Sec. 4.2.1",
                "authority_scope": "county",
                "ttl_date": "2027-01-31"
            },
            "parking_ratio": { "blocked": "not published online" }
        }"#;
        let parsed = parse_assertions(body);
        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(err) => panic!("assertions failed to parse: {err:#}"),
        };
        assert_eq!(parsed.len(), 2);
        assert!(parsed.get("front_setback_ft").is_some_and(KnowledgeField::is_known));
        assert_eq!(
            parsed.get("parking_ratio").map(KnowledgeField::knowledge_state),
            Some(KnowledgeState::Blocked)
        );

        assert!(parse_assertions(r#"{"x": {"value": 1, "blocked": "no"}}"#).is_err());
        assert!(parse_assertions(r#"{"x": {"value": 1, "source_type": "ordinance"}}"#).is_err());
        assert!(parse_assertions(r#"{"x": {}}"#).is_err());
    }

    #[test]
    fn input_defaults_to_empty_object() {
        assert!(matches!(read_input(None, None), Ok(ref value) if value == &json!({})));
        assert!(matches!(read_input(None, Some(r#"{"zip":"99999"}"#)), Ok(ref value) if value["zip"] == json!("99999")));
        assert!(read_input(None, Some("{zip")).is_err());
    }
}
