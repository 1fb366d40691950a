#![forbid(unsafe_code)]

//! Run-level domain types shared by every site-screener crate: run and stage
//! identifiers, stage results, the run record and the status resolver.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

pub const ENGINE_VERSION: &str = "site-screener.v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn from_ulid(value: Ulid) -> Self {
        Self(value)
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        Ulid::from_string(value.trim())
            .map(Self)
            .map_err(|err| anyhow!("invalid run_id `{value}`: {err}"))
    }
}

/// Aggregate status of one phase invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    Partial,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "complete" => Some(Self::Complete),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ok,
    Error,
}

/// Why a stage ended in `error`. Operators use this to tell "tried and
/// failed" apart from "never attempted".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    Execution,
    Timeout,
    MissingDependency,
    PolicyDenied,
}

impl StageErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::Timeout => "timeout",
            Self::MissingDependency => "missing_dependency",
            Self::PolicyDenied => "policy_denied",
        }
    }

    /// Stages skipped before invocation never consumed an attempt.
    #[must_use]
    pub fn was_attempted(self) -> bool {
        matches!(self, Self::Execution | Self::Timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageResult {
    pub stage_id: String,
    pub status: StageStatus,
    pub payload: Option<Value>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_kind: Option<StageErrorKind>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub input_hash: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub ended_at: DateTimeUtc,
}

impl StageResult {
    /// A successful result. A JSON `null` payload is stored as absent.
    #[must_use]
    pub fn ok(stage_id: impl Into<String>, payload: Value, started_at: DateTimeUtc) -> Self {
        let payload = if payload.is_null() {
            None
        } else {
            Some(payload)
        };
        Self {
            stage_id: stage_id.into(),
            status: StageStatus::Ok,
            payload,
            error_message: None,
            error_kind: None,
            attempts: 1,
            input_hash: None,
            started_at,
            ended_at: now_utc(),
        }
    }

    #[must_use]
    pub fn error(
        stage_id: impl Into<String>,
        kind: StageErrorKind,
        message: impl Into<String>,
        started_at: DateTimeUtc,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            status: StageStatus::Error,
            payload: None,
            error_message: Some(message.into()),
            error_kind: Some(kind),
            attempts: u32::from(kind.was_attempted()),
            input_hash: None,
            started_at,
            ended_at: now_utc(),
        }
    }

    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_input_hash(mut self, input_hash: impl Into<String>) -> Self {
        self.input_hash = Some(input_hash.into());
        self
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == StageStatus::Ok
    }
}

/// Header fields fixed at the start of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunHeader {
    pub run_id: RunId,
    pub phase_tag: String,
    pub phase_version: String,
    pub phase_hash: String,
    pub terminal_stage: String,
    pub created_at: DateTimeUtc,
    pub as_of: DateTimeUtc,
    pub engine_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: RunId,
    pub phase_tag: String,
    pub phase_version: String,
    pub phase_hash: String,
    pub terminal_stage: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: DateTimeUtc,
    pub engine_version: String,
    pub input: Value,
    #[serde(with = "stage_result_map")]
    pub stage_results: Vec<StageResult>,
    pub aggregate_status: RunStatus,
    pub errors: Vec<String>,
}

impl RunRecord {
    #[must_use]
    pub fn stage_result(&self, stage_id: &str) -> Option<&StageResult> {
        self.stage_results
            .iter()
            .find(|result| result.stage_id == stage_id)
    }

    #[must_use]
    pub fn payload(&self, stage_id: &str) -> Option<&Value> {
        self.stage_result(stage_id)
            .and_then(|result| result.payload.as_ref())
    }

    #[must_use]
    pub fn terminal_payload(&self) -> Option<&Value> {
        self.payload(&self.terminal_stage)
    }

    #[must_use]
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            phase_tag: self.phase_tag.clone(),
            created_at: self.created_at,
            aggregate_status: self.aggregate_status,
            stages_total: self.stage_results.len(),
            errors_total: self.errors.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunSummary {
    pub run_id: RunId,
    pub phase_tag: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    pub aggregate_status: RunStatus,
    pub stages_total: usize,
    pub errors_total: usize,
}

/// A run record under construction. Results can only be appended, and
/// [`RunDraft::finish`] consumes the draft, so the status is stamped once.
#[derive(Debug, Clone)]
pub struct RunDraft {
    header: RunHeader,
    input: Value,
    stage_results: Vec<StageResult>,
    errors: Vec<String>,
}

impl RunDraft {
    #[must_use]
    pub fn new(header: RunHeader, input: Value) -> Self {
        Self {
            header,
            input,
            stage_results: Vec::new(),
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn header(&self) -> &RunHeader {
        &self.header
    }

    #[must_use]
    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn record(&mut self, result: StageResult) {
        if result.status == StageStatus::Error {
            let message = result
                .error_message
                .as_deref()
                .unwrap_or("unspecified stage error");
            self.errors
                .push(format!("{} failed: {message}", result.stage_id));
        }
        self.stage_results.push(result);
    }

    #[must_use]
    pub fn result(&self, stage_id: &str) -> Option<&StageResult> {
        self.stage_results
            .iter()
            .find(|result| result.stage_id == stage_id)
    }

    /// Payload of an already-executed stage; `None` for failed, null or
    /// not-yet-run stages.
    #[must_use]
    pub fn payload(&self, stage_id: &str) -> Option<&Value> {
        self.result(stage_id)
            .and_then(|result| result.payload.as_ref())
    }

    #[must_use]
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    #[must_use]
    pub fn finish(self, finished_at: DateTimeUtc) -> RunRecord {
        let aggregate_status = resolve_run_status(
            &self.errors,
            self.stage_results
                .iter()
                .find(|result| result.stage_id == self.header.terminal_stage)
                .and_then(|result| result.payload.as_ref()),
        );
        RunRecord {
            run_id: self.header.run_id,
            phase_tag: self.header.phase_tag,
            phase_version: self.header.phase_version,
            phase_hash: self.header.phase_hash,
            terminal_stage: self.header.terminal_stage,
            created_at: self.header.created_at,
            as_of: self.header.as_of,
            finished_at,
            engine_version: self.header.engine_version,
            input: self.input,
            stage_results: self.stage_results,
            aggregate_status,
            errors: self.errors,
        }
    }
}

/// Derive the aggregate run status from the error list and the terminal
/// stage payload. A run without a usable terminal payload is `failed`
/// regardless of how many stages errored.
#[must_use]
pub fn resolve_run_status(errors: &[String], terminal_payload: Option<&Value>) -> RunStatus {
    match (terminal_payload.filter(|value| !value.is_null()), errors.is_empty()) {
        (Some(_), true) => RunStatus::Complete,
        (Some(_), false) => RunStatus::Partial,
        (None, _) => RunStatus::Failed,
    }
}

/// Serializes `Vec<StageResult>` as a JSON object keyed by `stage_id`,
/// keeping declaration order.
mod stage_result_map {
    use std::fmt::Formatter;

    use serde::de::{MapAccess, Visitor};
    use serde::{Deserializer, Serializer};

    use super::StageResult;

    pub fn serialize<S>(results: &[StageResult], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(results.iter().map(|result| (&result.stage_id, result)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<StageResult>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(OrderedResults)
    }

    struct OrderedResults;

    impl<'de> Visitor<'de> for OrderedResults {
        type Value = Vec<StageResult>;

        fn expecting(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
            formatter.write_str("a map of stage_id to stage result")
        }

        fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut out = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some((key, result)) = access.next_entry::<String, StageResult>()? {
                if key != result.stage_id {
                    return Err(serde::de::Error::custom(format!(
                        "stage_results key `{key}` does not match stage_id `{}`",
                        result.stage_id
                    )));
                }
                out.push(result);
            }
            Ok(out)
        }
    }
}

/// Walk a dotted field path (already split) inside a JSON value.
#[must_use]
pub fn value_at_path<'a, S: AsRef<str>>(value: &'a Value, path: &[S]) -> Option<&'a Value> {
    let mut current = value;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(segment.as_ref())?,
            Value::Array(items) => items.get(segment.as_ref().parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns an error when formatting fails.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("failed to format RFC3339 timestamp: {err}"))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns an error when parsing fails or the timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<DateTimeUtc> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 timestamp `{value}`: {err}"))?;
    if parsed.offset() != UtcOffset::UTC {
        return Err(anyhow!("timestamp `{value}` MUST use UTC offset Z"));
    }
    Ok(parsed)
}
