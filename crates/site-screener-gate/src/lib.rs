#![forbid(unsafe_code)]

//! Inter-phase promotion check. A gate walks a declared list of required
//! fields and thresholds over an upstream run record, consults the subject's
//! card, and reports blockers, warnings and an informational score.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use site_screener_domain::{DateTimeUtc, RunRecord, RunStatus};
use site_screener_knowledge::{conflict_flag, evaluate_freshness, Card, FreshnessPolicy};

pub const MISSING_REQUIRED_FIELD: &str = "MISSING_REQUIRED_FIELD";
pub const OPEN_PROHIBITION: &str = "OPEN_PROHIBITION";
pub const UPSTREAM_RUN_FAILED: &str = "UPSTREAM_RUN_FAILED";
pub const UPSTREAM_RUN_PARTIAL: &str = "UPSTREAM_RUN_PARTIAL";
pub const CARD_MISSING: &str = "CARD_MISSING";
pub const ENVELOPE_INCOMPLETE: &str = "ENVELOPE_INCOMPLETE";
pub const CARD_INCOMPLETE: &str = "CARD_INCOMPLETE";
pub const CARD_STALE: &str = "CARD_STALE";
pub const STALE_FIELD: &str = "STALE_FIELD";
pub const NON_NUMERIC_FIELD: &str = "NON_NUMERIC_FIELD";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum GateConfigError {
    #[error("{field} must be non-empty")]
    Empty { field: String },
    #[error("duplicate gate field name: {0}")]
    DuplicateField(String),
    #[error("field {name} has invalid JSON pointer `{pointer}`")]
    InvalidPointer { name: String, pointer: String },
    #[error("threshold {0} must have a finite bound")]
    NonFiniteBound(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FieldSpec {
    pub name: String,
    /// JSON pointer into the serialized run record.
    pub pointer: String,
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ThresholdBound {
    Fixed(f64),
    /// Bound read from the record itself, e.g. a caller-supplied minimum.
    FromRecord { pointer: String, fallback: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ThresholdSpec {
    pub name: String,
    pub pointer: String,
    pub min: ThresholdBound,
    pub warning_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GateDefinition {
    pub gate_name: String,
    pub gate_version: String,
    #[serde(default)]
    pub required_fields: Vec<FieldSpec>,
    #[serde(default)]
    pub optional_fields: Vec<FieldSpec>,
    #[serde(default)]
    pub thresholds: Vec<ThresholdSpec>,
    #[serde(default)]
    pub require_card: bool,
    #[serde(default)]
    pub require_envelope_complete: bool,
    #[serde(default)]
    pub freshness: FreshnessPolicy,
}

impl GateDefinition {
    /// # Errors
    /// Returns the first [`GateConfigError`] found.
    pub fn validate(&self) -> std::result::Result<(), GateConfigError> {
        require_non_empty("gate_name", &self.gate_name)?;
        require_non_empty("gate_version", &self.gate_version)?;
        let mut names = BTreeSet::new();
        for field in self.required_fields.iter().chain(&self.optional_fields) {
            require_non_empty("field name", &field.name)?;
            check_pointer(&field.name, &field.pointer)?;
            if !names.insert(field.name.as_str()) {
                return Err(GateConfigError::DuplicateField(field.name.clone()));
            }
        }
        for threshold in &self.thresholds {
            require_non_empty("threshold name", &threshold.name)?;
            require_non_empty("warning_code", &threshold.warning_code)?;
            check_pointer(&threshold.name, &threshold.pointer)?;
            let bound = match &threshold.min {
                ThresholdBound::Fixed(value) => *value,
                ThresholdBound::FromRecord { pointer, fallback } => {
                    check_pointer(&threshold.name, pointer)?;
                    *fallback
                }
            };
            if !bound.is_finite() {
                return Err(GateConfigError::NonFiniteBound(threshold.name.clone()));
            }
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error when the YAML is malformed or fails validation.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let definition: Self = serde_yaml::from_str(yaml)
            .map_err(|err| anyhow!("invalid gate YAML structure: {err}"))?;
        definition.validate()?;
        Ok(definition)
    }
}

/// # Errors
/// Returns an error when the file cannot be read or parsed.
pub fn load_gate_from_path(path: &Path) -> Result<GateDefinition> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read gate definition {}", path.display()))?;
    GateDefinition::from_yaml_str(&content)
}

fn require_non_empty(field: &str, value: &str) -> std::result::Result<(), GateConfigError> {
    if value.trim().is_empty() {
        return Err(GateConfigError::Empty {
            field: field.to_string(),
        });
    }
    Ok(())
}

fn check_pointer(name: &str, pointer: &str) -> std::result::Result<(), GateConfigError> {
    if !pointer.is_empty() && !pointer.starts_with('/') {
        return Err(GateConfigError::InvalidPointer {
            name: name.to_string(),
            pointer: pointer.to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ValidationMeta {
    pub gate_name: String,
    pub gate_version: String,
    pub upstream_run_id: Option<String>,
    pub upstream_phase_tag: Option<String>,
    pub upstream_status: Option<String>,
    pub required_fields_declared: usize,
    pub card_subject: Option<String>,
    pub card_version: Option<u64>,
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: DateTimeUtc,
}

/// Derived view of one gate check; recomputable from its inputs.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ValidationResult {
    pub ok: bool,
    pub blockers: Vec<String>,
    pub warnings: Vec<String>,
    pub required_fields_present: Vec<String>,
    pub optional_fields_present: Vec<String>,
    pub score: u8,
    pub meta: ValidationMeta,
}

impl ValidationResult {
    #[must_use]
    pub fn has_blocker(&self, code: &str) -> bool {
        self.blockers.iter().any(|blocker| blocker_code(blocker) == code)
    }

    #[must_use]
    pub fn has_warning(&self, code: &str) -> bool {
        self.warnings.iter().any(|warning| blocker_code(warning) == code)
    }
}

fn blocker_code(entry: &str) -> &str {
    entry.split_once(':').map_or(entry, |(code, _)| code)
}

/// Validate a serialized run record against a gate definition.
#[must_use]
pub fn validate(
    definition: &GateDefinition,
    record: &Value,
    card: Option<&Card>,
    as_of: DateTimeUtc,
) -> ValidationResult {
    let mut blockers = Vec::new();
    let mut warnings = Vec::new();

    let mut required_fields_present = Vec::new();
    for field in &definition.required_fields {
        if is_present(record.pointer(&field.pointer)) {
            required_fields_present.push(field.name.clone());
        } else {
            blockers.push(format!("{MISSING_REQUIRED_FIELD}:{}", field.name));
        }
    }
    let optional_fields_present = definition
        .optional_fields
        .iter()
        .filter(|field| is_present(record.pointer(&field.pointer)))
        .map(|field| field.name.clone())
        .collect();

    for threshold in &definition.thresholds {
        let Some(raw) = record.pointer(&threshold.pointer).filter(|value| !value.is_null())
        else {
            continue;
        };
        let Some(value) = as_number(raw) else {
            warnings.push(format!("{NON_NUMERIC_FIELD}:{}", threshold.name));
            continue;
        };
        let min = match &threshold.min {
            ThresholdBound::Fixed(min) => *min,
            ThresholdBound::FromRecord { pointer, fallback } => record
                .pointer(pointer)
                .and_then(as_number)
                .unwrap_or(*fallback),
        };
        if value < min {
            warnings.push(format!(
                "{}:{}={value}<{min}",
                threshold.warning_code, threshold.name
            ));
        }
    }

    let upstream_status = record
        .get("aggregate_status")
        .and_then(Value::as_str)
        .map(str::to_string);
    match upstream_status.as_deref().and_then(RunStatus::parse) {
        Some(RunStatus::Failed) => blockers.push(UPSTREAM_RUN_FAILED.to_string()),
        Some(RunStatus::Partial) => warnings.push(UPSTREAM_RUN_PARTIAL.to_string()),
        Some(RunStatus::Complete) | None => {}
    }

    match card {
        None => {
            if definition.require_card {
                blockers.push(CARD_MISSING.to_string());
            }
        }
        Some(card) => {
            for key in card.conflicts().keys() {
                blockers.push(conflict_flag(key));
            }
            for prohibition in card.open_prohibitions() {
                blockers.push(format!("{OPEN_PROHIBITION}:{}", prohibition.code));
            }
            if definition.require_envelope_complete && !card.envelope_complete() {
                blockers.push(ENVELOPE_INCOMPLETE.to_string());
            }
            if !card.card_complete() {
                warnings.push(CARD_INCOMPLETE.to_string());
            }
            let freshness = evaluate_freshness(card, as_of, definition.freshness);
            if freshness.stale {
                warnings.push(CARD_STALE.to_string());
                for key in &freshness.expired_fields {
                    warnings.push(format!("{STALE_FIELD}:{key}"));
                }
            }
        }
    }

    let declared = definition.required_fields.len();
    ValidationResult {
        ok: blockers.is_empty(),
        score: score(required_fields_present.len(), declared),
        blockers,
        warnings,
        required_fields_present,
        optional_fields_present,
        meta: ValidationMeta {
            gate_name: definition.gate_name.clone(),
            gate_version: definition.gate_version.clone(),
            upstream_run_id: record
                .get("run_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            upstream_phase_tag: record
                .get("phase_tag")
                .and_then(Value::as_str)
                .map(str::to_string),
            upstream_status,
            required_fields_declared: declared,
            card_subject: card.map(|card| card.subject().to_string()),
            card_version: card.map(Card::version),
            as_of,
        },
    }
}

/// Validate a typed run record.
///
/// # Errors
/// Returns an error when the record cannot be serialized.
pub fn validate_run(
    definition: &GateDefinition,
    record: &RunRecord,
    card: Option<&Card>,
    as_of: DateTimeUtc,
) -> Result<ValidationResult> {
    let record_json = serde_json::to_value(record)?;
    Ok(validate(definition, &record_json, card, as_of))
}

/// `round(100 * present / declared)`; 100 when nothing is declared.
#[must_use]
pub fn score(present: usize, declared: usize) -> u8 {
    if declared == 0 {
        return 100;
    }
    let present = present.min(declared);
    let rounded = (200 * present + declared) / (2 * declared);
    u8::try_from(rounded).unwrap_or(100)
}

fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(text)) => !text.trim().is_empty(),
        Some(_) => true,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok().filter(|number| number.is_finite()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use site_screener_knowledge::{
        AuthorityScope, CardSchema, FieldConflict, KnowledgeField, Prohibition,
        ProhibitionStatus, Provenance, SourceType, SubjectKey,
    };
    use time::macros::datetime;

    const GATE_YAML: &str = r"
gate_name: pass1_to_pass2
gate_version: v1
required_fields:
  - { name: zip, pointer: /input/zip, group: identity }
  - { name: state, pointer: /input/state, group: identity }
  - { name: county, pointer: /input/county, group: identity }
  - { name: population, pointer: /stage_results/population/payload/population }
optional_fields:
  - { name: median_income, pointer: /stage_results/population/payload/median_income }
thresholds:
  - name: population
    pointer: /stage_results/population/payload/population
    min: { pointer: /input/requiredPopulation, fallback: 5000 }
    warning_code: LOW_POPULATION
";

    fn must_ok<T, E: std::fmt::Display>(result: std::result::Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn as_of() -> DateTimeUtc {
        datetime!(2026-06-01 00:00 UTC)
    }

    fn record(input: Value, population: Value, status: &str) -> Value {
        json!({
            "run_id": "01J0000000000000000000000A",
            "phase_tag": "pass1",
            "aggregate_status": status,
            "input": input,
            "stage_results": {
                "population": {
                    "stage_id": "population",
                    "status": "ok",
                    "payload": population,
                    "error_message": null
                }
            },
            "errors": []
        })
    }

    fn card() -> Card {
        let schema = CardSchema {
            schema_version: 1,
            required_for_envelope: vec!["front_setback_ft".to_string()],
            informational: Vec::new(),
        };
        let mut card = must_ok(Card::initialize(
            SubjectKey::new("travis-county-tx", "self_storage"),
            &schema,
            datetime!(2026-05-01 00:00 UTC),
        ));
        must_ok(card.set_field(
            "front_setback_ft",
            must_ok(KnowledgeField::known_at(
                25,
                Provenance::new(SourceType::Ordinance, "Sec. 4", AuthorityScope::County),
                datetime!(2026-05-01 00:00 UTC),
            )),
            datetime!(2026-05-01 00:00 UTC),
        ));
        card
    }

    #[test]
    fn low_population_warns_without_blocking() {
        let definition = must_ok(GateDefinition::from_yaml_str(GATE_YAML));
        let record = record(
            json!({"zip": "99999", "state": "TX", "county": "Travis", "requiredPopulation": 10000}),
            json!({"population": 8000}),
            "complete",
        );
        let result = validate(&definition, &record, None, as_of());
        assert!(result.ok, "unexpected blockers: {:?}", result.blockers);
        assert_eq!(result.warnings, vec!["LOW_POPULATION:population=8000<10000".to_string()]);
        assert_eq!(result.score, 100);
        assert!(result.optional_fields_present.is_empty());
        assert_eq!(result.meta.upstream_phase_tag.as_deref(), Some("pass1"));
    }

    #[test]
    fn missing_identity_block_names_every_field() {
        let definition = must_ok(GateDefinition::from_yaml_str(GATE_YAML));
        let record = record(json!({}), json!({"population": 12000}), "complete");
        let result = validate(&definition, &record, None, as_of());
        assert!(!result.ok);
        assert_eq!(
            result.blockers,
            vec![
                "MISSING_REQUIRED_FIELD:zip".to_string(),
                "MISSING_REQUIRED_FIELD:state".to_string(),
                "MISSING_REQUIRED_FIELD:county".to_string(),
            ]
        );
        assert!(result.score < 100);
        assert_eq!(result.score, 25);
        assert_eq!(result.required_fields_present, vec!["population".to_string()]);
    }

    #[test]
    fn threshold_falls_back_and_flags_non_numeric() {
        let definition = must_ok(GateDefinition::from_yaml_str(GATE_YAML));
        let fallback = record(
            json!({"zip": "1", "state": "TX", "county": "Travis"}),
            json!({"population": 4000}),
            "complete",
        );
        let result = validate(&definition, &fallback, None, as_of());
        assert_eq!(result.warnings, vec!["LOW_POPULATION:population=4000<5000".to_string()]);

        let non_numeric = record(
            json!({"zip": "1", "state": "TX", "county": "Travis"}),
            json!({"population": "lots"}),
            "complete",
        );
        let result = validate(&definition, &non_numeric, None, as_of());
        assert!(result.ok);
        assert_eq!(result.warnings, vec!["NON_NUMERIC_FIELD:population".to_string()]);
    }

    #[test]
    fn upstream_status_feeds_blockers_and_warnings() {
        let definition = must_ok(GateDefinition::from_yaml_str(GATE_YAML));
        let input = json!({"zip": "1", "state": "TX", "county": "Travis"});
        let partial = validate(
            &definition,
            &record(input.clone(), json!({"population": 9000}), "partial"),
            None,
            as_of(),
        );
        assert!(partial.ok);
        assert!(partial.has_warning(UPSTREAM_RUN_PARTIAL));

        let failed = validate(
            &definition,
            &record(input, json!({"population": 9000}), "failed"),
            None,
            as_of(),
        );
        assert!(!failed.ok);
        assert!(failed.has_blocker(UPSTREAM_RUN_FAILED));
    }

    #[test]
    fn conflicts_and_prohibitions_block_promotion() {
        let definition = GateDefinition {
            gate_name: "pass2_to_pass3".to_string(),
            gate_version: "v1".to_string(),
            required_fields: Vec::new(),
            optional_fields: Vec::new(),
            thresholds: Vec::new(),
            require_card: true,
            require_envelope_complete: true,
            freshness: FreshnessPolicy::default(),
        };
        let record = json!({"aggregate_status": "complete"});

        let missing = validate(&definition, &record, None, as_of());
        assert_eq!(missing.blockers, vec![CARD_MISSING.to_string()]);

        let clean = card();
        let result = validate(&definition, &record, Some(&clean), as_of());
        assert!(result.ok, "unexpected blockers: {:?}", result.blockers);
        assert_eq!(result.score, 100);
        assert_eq!(result.meta.card_subject.as_deref(), Some("travis-county-tx::self_storage"));

        let mut conflicted = card();
        let existing = conflicted.field("front_setback_ft").cloned().unwrap_or_default();
        let proposed = must_ok(KnowledgeField::known_at(
            40,
            Provenance::new(SourceType::Portal, "city portal", AuthorityScope::Municipality),
            datetime!(2026-05-02 00:00 UTC),
        ));
        must_ok(conflicted.record_conflict(FieldConflict {
            key: "front_setback_ft".to_string(),
            existing,
            proposed,
            detected_at: datetime!(2026-05-02 00:00 UTC),
        }));
        conflicted.add_prohibition(Prohibition {
            code: "MORATORIUM".to_string(),
            description: "storage moratorium".to_string(),
            authority_scope: AuthorityScope::Municipality,
            status: ProhibitionStatus::Open,
            recorded_at: datetime!(2026-05-02 00:00 UTC),
        });
        let result = validate(&definition, &record, Some(&conflicted), as_of());
        assert!(!result.ok);
        assert_eq!(
            result.blockers,
            vec![
                "CONFLICT_DETECTED:front_setback_ft".to_string(),
                "OPEN_PROHIBITION:MORATORIUM".to_string(),
            ]
        );
    }

    #[test]
    fn stale_card_only_warns() {
        let definition = GateDefinition {
            gate_name: "g".to_string(),
            gate_version: "v1".to_string(),
            required_fields: Vec::new(),
            optional_fields: Vec::new(),
            thresholds: Vec::new(),
            require_card: true,
            require_envelope_complete: true,
            freshness: FreshnessPolicy { max_age_months: 6 },
        };
        let result = validate(
            &definition,
            &json!({}),
            Some(&card()),
            datetime!(2027-01-01 00:00 UTC),
        );
        assert!(result.ok);
        assert!(result.has_warning(CARD_STALE));
    }

    #[test]
    fn score_rounds_half_up() {
        assert_eq!(score(0, 0), 100);
        assert_eq!(score(1, 3), 33);
        assert_eq!(score(2, 3), 67);
        assert_eq!(score(1, 8), 13);
        assert_eq!(score(0, 4), 0);
    }

    #[test]
    fn invalid_pointer_is_rejected() {
        let yaml = "gate_name: g\ngate_version: v1\nrequired_fields:\n  - { name: zip, pointer: input.zip }\n";
        assert!(GateDefinition::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn non_finite_threshold_bounds_are_rejected() {
        let gate = |min: &str| {
            format!(
                "gate_name: g\ngate_version: v1\nthresholds:\n  - {{ name: population, pointer: /stage_results/population/payload/population, min: {min}, warning_code: LOW_POPULATION }}\n"
            )
        };
        for min in [".nan", "-.inf", "{ pointer: /input/requiredPopulation, fallback: .nan }"] {
            let err = GateDefinition::from_yaml_str(&gate(min)).err();
            assert_eq!(
                err.as_ref().and_then(|err| err.downcast_ref::<GateConfigError>()),
                Some(&GateConfigError::NonFiniteBound("population".to_string())),
                "bound {min} should be rejected"
            );
        }
        assert!(GateDefinition::from_yaml_str(&gate("5000")).is_ok());
        assert!(GateDefinition::from_yaml_str(&gate("{ pointer: /input/requiredPopulation, fallback: 5000 }")).is_ok());
    }
}
