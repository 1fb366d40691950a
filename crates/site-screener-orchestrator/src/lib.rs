#![forbid(unsafe_code)]

//! Runs one phase: sequences its stages in declaration order, isolates each
//! stage failure, applies run policy, and assembles the run record.

use std::fmt::{Debug, Formatter};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use site_screener_domain::{
    hash_json, now_utc, value_at_path, DateTimeUtc, RunDraft, RunHeader, RunId, RunRecord,
    StageErrorKind, StageResult, ENGINE_VERSION,
};
use site_screener_gate::{validate_run, GateDefinition, ValidationResult};
use site_screener_knowledge::Card;
use site_screener_phase::{DependencyRef, PhaseDefinition, StageDefinition};
use site_screener_stage::{project_input, stage_input_hash, Stage, StageContext, StageRegistry};
use time::UtcOffset;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PolicyError {
    #[error("max_attempts must be >= 1")]
    NoAttempts,
    #[error("stage_timeout_ms must be > 0")]
    ZeroTimeout,
    #[error("outbound hour window {start}-{end} must use hours 0..=23")]
    InvalidHourWindow { start: u8, end: u8 },
}

/// UTC hours `[start, end)`; wraps past midnight when `start > end`.
/// `start == end` allows every hour.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HourWindow {
    pub start: u8,
    pub end: u8,
}

impl HourWindow {
    #[must_use]
    pub fn contains(self, hour: u8) -> bool {
        match self.start.cmp(&self.end) {
            std::cmp::Ordering::Equal => true,
            std::cmp::Ordering::Less => hour >= self.start && hour < self.end,
            std::cmp::Ordering::Greater => hour >= self.start || hour < self.end,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct RunPolicy {
    pub stage_timeout_ms: u64,
    pub max_attempts: u32,
    pub cost_cap_units: Option<u32>,
    pub outbound_enabled: bool,
    pub outbound_hours_utc: Option<HourWindow>,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            stage_timeout_ms: 30_000,
            max_attempts: 1,
            cost_cap_units: None,
            outbound_enabled: true,
            outbound_hours_utc: None,
        }
    }
}

impl RunPolicy {
    /// # Errors
    /// Returns the first [`PolicyError`] found.
    pub fn validate(&self) -> std::result::Result<(), PolicyError> {
        if self.max_attempts == 0 {
            return Err(PolicyError::NoAttempts);
        }
        if self.stage_timeout_ms == 0 {
            return Err(PolicyError::ZeroTimeout);
        }
        if let Some(window) = self.outbound_hours_utc {
            if window.start > 23 || window.end > 23 {
                return Err(PolicyError::InvalidHourWindow {
                    start: window.start,
                    end: window.end,
                });
            }
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error when the YAML is malformed or the policy is invalid.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let policy: Self = serde_yaml::from_str(yaml)
            .map_err(|err| anyhow!("invalid run policy YAML structure: {err}"))?;
        policy.validate()?;
        Ok(policy)
    }

    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read run policy {}", path.display()))?;
        Self::from_yaml_str(&content)
    }

    /// Why `stage` may not run, if it may not.
    fn denial(&self, stage: &StageDefinition, as_of: DateTimeUtc, spent_units: u32) -> Option<String> {
        if stage.outbound {
            if !self.outbound_enabled {
                return Some("outbound disabled".to_string());
            }
            if let Some(window) = self.outbound_hours_utc {
                let hour = as_of.to_offset(UtcOffset::UTC).hour();
                if !window.contains(hour) {
                    return Some(format!(
                        "outbound outside allowed hours {:02}-{:02} UTC",
                        window.start, window.end
                    ));
                }
            }
        }
        if let Some(cap) = self.cost_cap_units {
            let needed = spent_units.saturating_add(stage.cost_units);
            if needed > cap {
                return Some(format!(
                    "cost cap {cap} exceeded (spent {spent_units}, stage needs {})",
                    stage.cost_units
                ));
            }
        }
        None
    }
}

pub trait IdGenerator: Send + Sync {
    fn next_run_id(&self) -> RunId;
}

/// Monotonic ULIDs.
pub struct UlidGenerator {
    inner: Mutex<ulid::Generator>,
}

impl UlidGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ulid::Generator::new()),
        }
    }
}

impl Default for UlidGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for UlidGenerator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("UlidGenerator")
    }
}

impl IdGenerator for UlidGenerator {
    fn next_run_id(&self) -> RunId {
        let mut generator = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        RunId::from_ulid(generator.generate().unwrap_or_else(|_| Ulid::new()))
    }
}

/// Deterministic ids `1, 2, 3, ...` for tests and replays.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl SequentialIdGenerator {
    #[must_use]
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_run_id(&self) -> RunId {
        let value = self.next.fetch_add(1, Ordering::Relaxed);
        RunId::from_ulid(Ulid::from_parts(0, u128::from(value)))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    RunStarted,
    StageStarted,
    StageSucceeded,
    StageFailed,
    StageRetried,
    StageSkipped,
    RunFinished,
    GateEvaluated,
    GateBlocked,
}

impl RunEventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::StageStarted => "stage_started",
            Self::StageSucceeded => "stage_succeeded",
            Self::StageFailed => "stage_failed",
            Self::StageRetried => "stage_retried",
            Self::StageSkipped => "stage_skipped",
            Self::RunFinished => "run_finished",
            Self::GateEvaluated => "gate_evaluated",
            Self::GateBlocked => "gate_blocked",
        }
    }

    fn is_warning(self) -> bool {
        matches!(
            self,
            Self::StageFailed | Self::StageRetried | Self::StageSkipped | Self::GateBlocked
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunEvent {
    pub run_id: Option<RunId>,
    pub kind: RunEventKind,
    pub stage_id: Option<String>,
    pub attempt: Option<u32>,
    pub message: Option<String>,
}

impl RunEvent {
    fn new(run_id: Option<RunId>, kind: RunEventKind) -> Self {
        Self {
            run_id,
            kind,
            stage_id: None,
            attempt: None,
            message: None,
        }
    }

    fn stage(mut self, stage_id: &str) -> Self {
        self.stage_id = Some(stage_id.to_string());
        self
    }

    fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

pub trait RunLogger: Send + Sync {
    fn log(&self, event: &RunEvent);
}

/// Emits every event as a `tracing` event under the `site_screener::run`
/// target; failures, retries, skips and gate blocks at WARN.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRunLogger;

impl RunLogger for TracingRunLogger {
    fn log(&self, event: &RunEvent) {
        let run_id = event.run_id.map(|id| id.to_string());
        if event.kind.is_warning() {
            tracing::warn!(
                target: "site_screener::run",
                event = event.kind.as_str(),
                run_id = run_id.as_deref(),
                stage_id = event.stage_id.as_deref(),
                attempt = event.attempt,
                message = event.message.as_deref(),
            );
        } else {
            tracing::info!(
                target: "site_screener::run",
                event = event.kind.as_str(),
                run_id = run_id.as_deref(),
                stage_id = event.stage_id.as_deref(),
                attempt = event.attempt,
                message = event.message.as_deref(),
            );
        }
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemoryRunLogger {
    events: Mutex<Vec<RunEvent>>,
}

impl MemoryRunLogger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<RunEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn kinds(&self) -> Vec<RunEventKind> {
        self.events().iter().map(|event| event.kind).collect()
    }
}

impl RunLogger for MemoryRunLogger {
    fn log(&self, event: &RunEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Evaluation instant; defaults to the run's creation time.
    pub as_of: Option<DateTimeUtc>,
    pub engine_version: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            as_of: None,
            engine_version: ENGINE_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatedRun {
    /// The gate passed and the phase ran.
    Started {
        validation: ValidationResult,
        record: RunRecord,
    },
    /// The gate blocked promotion; nothing ran.
    Blocked(ValidationResult),
}

impl GatedRun {
    #[must_use]
    pub fn validation(&self) -> &ValidationResult {
        match self {
            Self::Started { validation, .. } | Self::Blocked(validation) => validation,
        }
    }

    #[must_use]
    pub fn record(&self) -> Option<&RunRecord> {
        match self {
            Self::Started { record, .. } => Some(record),
            Self::Blocked(_) => None,
        }
    }
}

struct BoundStage {
    definition: StageDefinition,
    dependencies: Vec<DependencyRef>,
    stage: Arc<dyn Stage>,
}

/// A phase definition bound to stage implementations. Holds only shared
/// read-only state, so one orchestrator serves any number of runs.
pub struct PhaseOrchestrator {
    phase_tag: String,
    phase_version: String,
    phase_hash: String,
    terminal_stage: String,
    assumptions: std::collections::BTreeMap<String, f64>,
    stages: Vec<BoundStage>,
    ids: Arc<dyn IdGenerator>,
    logger: Arc<dyn RunLogger>,
}

impl Debug for PhaseOrchestrator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseOrchestrator")
            .field("phase_tag", &self.phase_tag)
            .field("phase_version", &self.phase_version)
            .field("phase_hash", &self.phase_hash)
            .field(
                "stages",
                &self
                    .stages
                    .iter()
                    .map(|bound| bound.definition.stage_id.as_str())
                    .collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl PhaseOrchestrator {
    /// Validate the definition and resolve every stage.
    ///
    /// # Errors
    /// Returns a [`site_screener_phase::PhaseConfigError`] for an invalid
    /// phase graph, or an error when a stage cannot be resolved.
    pub fn bind(
        definition: &PhaseDefinition,
        registry: &StageRegistry,
        ids: Arc<dyn IdGenerator>,
        logger: Arc<dyn RunLogger>,
    ) -> Result<Self> {
        definition.validate()?;
        let phase_hash = hash_json(&serde_json::to_value(definition)?)?;

        let stages = definition
            .stages
            .iter()
            .map(|stage| -> Result<BoundStage> {
                Ok(BoundStage {
                    definition: stage.clone(),
                    dependencies: stage.dependencies()?,
                    stage: registry.resolve(stage)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            phase_tag: definition.phase_tag.clone(),
            phase_version: definition.phase_version.clone(),
            phase_hash,
            terminal_stage: definition.terminal_stage.clone(),
            assumptions: definition.assumptions.clone(),
            stages,
            ids,
            logger,
        })
    }

    #[must_use]
    pub fn phase_tag(&self) -> &str {
        &self.phase_tag
    }

    #[must_use]
    pub fn phase_hash(&self) -> &str {
        &self.phase_hash
    }

    /// Run every stage once in declaration order and return the finished
    /// record. Stage failures are recorded, never returned; only
    /// infrastructure errors (hashing) abort the run.
    ///
    /// # Errors
    /// Returns an error when a stage input cannot be hashed.
    pub async fn run(&self, input: Value, policy: &RunPolicy, config: RunConfig) -> Result<RunRecord> {
        let run_id = self.ids.next_run_id();
        let created_at = now_utc();
        let as_of = config.as_of.unwrap_or(created_at);
        let mut draft = RunDraft::new(
            RunHeader {
                run_id,
                phase_tag: self.phase_tag.clone(),
                phase_version: self.phase_version.clone(),
                phase_hash: self.phase_hash.clone(),
                terminal_stage: self.terminal_stage.clone(),
                created_at,
                as_of,
                engine_version: config.engine_version,
            },
            input,
        );
        self.logger.log(
            &RunEvent::new(Some(run_id), RunEventKind::RunStarted)
                .message(format!("phase {} {}", self.phase_tag, self.phase_version)),
        );

        let max_attempts = policy.max_attempts.max(1);
        let mut spent_units: u32 = 0;
        for bound in &self.stages {
            let definition = &bound.definition;
            let stage_id = definition.stage_id.as_str();
            let started_at = now_utc();

            if let Some(missing) = bound
                .dependencies
                .iter()
                .find(|dependency| !dependency_present(&draft, dependency))
            {
                let message = format!("skipped: missing dependency {missing}");
                self.logger.log(
                    &RunEvent::new(Some(run_id), RunEventKind::StageSkipped)
                        .stage(stage_id)
                        .message(message.clone()),
                );
                draft.record(StageResult::error(
                    stage_id,
                    StageErrorKind::MissingDependency,
                    message,
                    started_at,
                ));
                continue;
            }

            if let Some(reason) = policy.denial(definition, as_of, spent_units) {
                let message = format!("skipped: policy {reason}");
                self.logger.log(
                    &RunEvent::new(Some(run_id), RunEventKind::StageSkipped)
                        .stage(stage_id)
                        .message(message.clone()),
                );
                draft.record(StageResult::error(
                    stage_id,
                    StageErrorKind::PolicyDenied,
                    message,
                    started_at,
                ));
                continue;
            }
            spent_units = spent_units.saturating_add(definition.cost_units);

            let projected = project_input(draft.input(), definition);
            let upstream: std::collections::BTreeMap<String, Value> = definition
                .visible_stages()
                .into_iter()
                .filter_map(|id| draft.payload(&id).cloned().map(|payload| (id, payload)))
                .collect();
            let input_hash = stage_input_hash(
                &self.phase_tag,
                stage_id,
                &projected,
                &upstream,
                &self.assumptions,
                &definition.adapter.params,
            )?;
            let timeout = Duration::from_millis(
                definition
                    .timeout_ms
                    .unwrap_or(policy.stage_timeout_ms)
                    .max(1),
            );

            let mut attempt = 0;
            let result = loop {
                attempt += 1;
                let context = StageContext {
                    run_id,
                    phase_tag: self.phase_tag.clone(),
                    stage_id: stage_id.to_string(),
                    as_of,
                    input: projected.clone(),
                    upstream: upstream.clone(),
                    assumptions: self.assumptions.clone(),
                    params: definition.adapter.params.clone(),
                    input_hash: input_hash.clone(),
                    attempt,
                };
                self.logger.log(
                    &RunEvent::new(Some(run_id), RunEventKind::StageStarted)
                        .stage(stage_id)
                        .attempt(attempt),
                );
                match run_attempt(Arc::clone(&bound.stage), context, timeout).await {
                    Ok(payload) => {
                        break StageResult::ok(stage_id, payload, started_at);
                    }
                    Err((_, message)) if attempt < max_attempts => {
                        self.logger.log(
                            &RunEvent::new(Some(run_id), RunEventKind::StageRetried)
                                .stage(stage_id)
                                .attempt(attempt)
                                .message(message),
                        );
                    }
                    Err((kind, message)) => {
                        break StageResult::error(stage_id, kind, message, started_at);
                    }
                }
            }
            .with_attempts(attempt)
            .with_input_hash(input_hash);

            let event = if result.is_ok() {
                RunEvent::new(Some(run_id), RunEventKind::StageSucceeded)
            } else {
                RunEvent::new(Some(run_id), RunEventKind::StageFailed)
                    .message(result.error_message.clone().unwrap_or_default())
            };
            self.logger.log(&event.stage(stage_id).attempt(attempt));
            draft.record(result);
        }

        let record = draft.finish(now_utc());
        self.logger.log(
            &RunEvent::new(Some(run_id), RunEventKind::RunFinished)
                .message(record.aggregate_status.as_str()),
        );
        Ok(record)
    }

    /// Check `upstream` against `gate` and run this phase only if nothing
    /// blocks. The upstream run id, phase tag and terminal payload are
    /// merged into the input under `upstream`.
    ///
    /// # Errors
    /// Returns an error when the input is not a JSON object (or null), or
    /// when the run itself fails to start.
    pub async fn run_gated(
        &self,
        upstream: &RunRecord,
        gate: &GateDefinition,
        card: Option<&Card>,
        input: Value,
        policy: &RunPolicy,
        config: RunConfig,
    ) -> Result<GatedRun> {
        let as_of = config.as_of.unwrap_or_else(now_utc);
        let validation = validate_run(gate, upstream, card, as_of)?;
        self.logger.log(
            &RunEvent::new(Some(upstream.run_id), RunEventKind::GateEvaluated).message(format!(
                "{} {} score={}",
                gate.gate_name, gate.gate_version, validation.score
            )),
        );
        if !validation.ok {
            self.logger.log(
                &RunEvent::new(Some(upstream.run_id), RunEventKind::GateBlocked)
                    .message(validation.blockers.join(", ")),
            );
            return Ok(GatedRun::Blocked(validation));
        }

        let mut object = match input {
            Value::Object(object) => object,
            Value::Null => Map::new(),
            other => {
                return Err(anyhow!(
                    "phase input must be a JSON object to receive the upstream summary, got {other}"
                ))
            }
        };
        object.insert(
            "upstream".to_string(),
            json!({
                "run_id": upstream.run_id.to_string(),
                "phase_tag": upstream.phase_tag,
                "aggregate_status": upstream.aggregate_status,
                "terminal_payload": upstream.terminal_payload(),
            }),
        );

        let record = self
            .run(
                Value::Object(object),
                policy,
                RunConfig {
                    as_of: Some(as_of),
                    ..config
                },
            )
            .await?;
        Ok(GatedRun::Started { validation, record })
    }
}

fn dependency_present(draft: &RunDraft, dependency: &DependencyRef) -> bool {
    draft
        .payload(&dependency.stage_id)
        .and_then(|payload| value_at_path(payload, &dependency.path))
        .is_some()
}

/// One attempt on the blocking pool under a timeout. A timed-out attempt
/// is abandoned, not cancelled.
async fn run_attempt(
    stage: Arc<dyn Stage>,
    context: StageContext,
    timeout: Duration,
) -> std::result::Result<Value, (StageErrorKind, String)> {
    let handle = tokio::task::spawn_blocking(move || stage.run(&context));
    match tokio::time::timeout(timeout, handle).await {
        Err(_) => Err((
            StageErrorKind::Timeout,
            format!("timed out after {} ms", timeout.as_millis()),
        )),
        Ok(Err(join_err)) => Err((
            StageErrorKind::Execution,
            format!("stage panicked: {join_err}"),
        )),
        Ok(Ok(Err(err))) => Err((StageErrorKind::Execution, format!("{err:#}"))),
        Ok(Ok(Ok(value))) => Ok(value),
    }
}
