#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use site_screener_domain::{hash_bytes, hash_json};

const NORMALIZATION_VERSION: u32 = 1;

/// Input key selecting the whole phase input.
pub const ALL_INPUT_KEYS: &str = "*";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PhaseConfigError {
    #[error("{field} must be non-empty")]
    Empty { field: String },
    #[error("phase declares no stages")]
    NoStages,
    #[error("duplicate stage_id: {0}")]
    DuplicateStage(String),
    #[error("stage {stage} references unknown stage {reference}")]
    UnknownStage { stage: String, reference: String },
    #[error("stage {stage} reads {reference}, which is not declared before it")]
    ForwardReference { stage: String, reference: String },
    #[error("stage {stage} has malformed dependency `{reference}`")]
    InvalidDependency { stage: String, reference: String },
    #[error("terminal_stage {0} is not a declared stage")]
    UnknownTerminalStage(String),
    #[error("assumption {0} must be a finite number")]
    InvalidAssumption(String),
}

/// A hard dependency: a prior stage, or a field path inside its payload.
/// Written as `stage_id` or `stage_id.field.path`.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DependencyRef {
    pub stage_id: String,
    pub path: Vec<String>,
}

impl FromStr for DependencyRef {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let mut segments = value.split('.');
        let stage_id = segments.next().unwrap_or_default().trim().to_string();
        let path: Vec<String> = segments.map(|segment| segment.trim().to_string()).collect();
        if stage_id.is_empty() || path.iter().any(String::is_empty) {
            return Err(value.to_string());
        }
        Ok(Self { stage_id, path })
    }
}

impl Display for DependencyRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.stage_id)?;
        for segment in &self.path {
            write!(f, ".{segment}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AdapterSpec {
    pub kind: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StageDefinition {
    pub stage_id: String,
    pub adapter: AdapterSpec,
    /// Prior stages whose payloads are visible in the stage context.
    #[serde(default)]
    pub reads: Vec<String>,
    /// Hard dependencies; the stage is skipped when any is absent or null.
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default = "default_input_keys")]
    pub input_keys: Vec<String>,
    #[serde(default)]
    pub cost_units: u32,
    #[serde(default)]
    pub outbound: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_input_keys() -> Vec<String> {
    vec![ALL_INPUT_KEYS.to_string()]
}

impl StageDefinition {
    /// Parsed `requires` entries.
    ///
    /// # Errors
    /// Returns [`PhaseConfigError::InvalidDependency`] for malformed entries.
    pub fn dependencies(&self) -> std::result::Result<Vec<DependencyRef>, PhaseConfigError> {
        self.requires
            .iter()
            .map(|reference| {
                reference
                    .parse::<DependencyRef>()
                    .map_err(|reference| PhaseConfigError::InvalidDependency {
                        stage: self.stage_id.clone(),
                        reference,
                    })
            })
            .collect()
    }

    /// Stages whose payloads this stage may observe: `reads` plus the
    /// stages named by `requires`.
    #[must_use]
    pub fn visible_stages(&self) -> BTreeSet<String> {
        let mut visible: BTreeSet<String> = self.reads.iter().cloned().collect();
        for reference in &self.requires {
            if let Ok(dependency) = reference.parse::<DependencyRef>() {
                visible.insert(dependency.stage_id);
            }
        }
        visible
    }

    #[must_use]
    pub fn reads_all_input(&self) -> bool {
        self.input_keys.iter().any(|key| key == ALL_INPUT_KEYS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PhaseDefinition {
    pub phase_tag: String,
    pub phase_version: String,
    #[serde(default)]
    pub normalization_version: u32,
    pub terminal_stage: String,
    /// Named business defaults visible to every stage of the phase.
    #[serde(default)]
    pub assumptions: BTreeMap<String, f64>,
    pub stages: Vec<StageDefinition>,
}

impl PhaseDefinition {
    #[must_use]
    pub fn stage(&self, stage_id: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|stage| stage.stage_id == stage_id)
    }

    /// Static checks: unique non-empty ids, a declared terminal stage and a
    /// strictly forward-only data flow.
    ///
    /// # Errors
    /// Returns the first [`PhaseConfigError`] found.
    pub fn validate(&self) -> std::result::Result<(), PhaseConfigError> {
        require_non_empty("phase_tag", &self.phase_tag)?;
        require_non_empty("phase_version", &self.phase_version)?;
        require_non_empty("terminal_stage", &self.terminal_stage)?;
        if self.stages.is_empty() {
            return Err(PhaseConfigError::NoStages);
        }
        for (name, value) in &self.assumptions {
            if !value.is_finite() {
                return Err(PhaseConfigError::InvalidAssumption(name.clone()));
            }
        }

        let declared: BTreeSet<&str> = self
            .stages
            .iter()
            .map(|stage| stage.stage_id.as_str())
            .collect();
        let mut earlier: BTreeSet<&str> = BTreeSet::new();
        for stage in &self.stages {
            require_non_empty("stage_id", &stage.stage_id)?;
            require_non_empty("adapter.kind", &stage.adapter.kind)?;
            if earlier.contains(stage.stage_id.as_str()) {
                return Err(PhaseConfigError::DuplicateStage(stage.stage_id.clone()));
            }
            let dependencies = stage.dependencies()?;
            let referenced = stage
                .reads
                .iter()
                .map(String::as_str)
                .chain(dependencies.iter().map(|dep| dep.stage_id.as_str()));
            for reference in referenced {
                if !declared.contains(reference) {
                    return Err(PhaseConfigError::UnknownStage {
                        stage: stage.stage_id.clone(),
                        reference: reference.to_string(),
                    });
                }
                if !earlier.contains(reference) {
                    return Err(PhaseConfigError::ForwardReference {
                        stage: stage.stage_id.clone(),
                        reference: reference.to_string(),
                    });
                }
            }
            earlier.insert(stage.stage_id.as_str());
        }

        if !declared.contains(self.terminal_stage.as_str()) {
            return Err(PhaseConfigError::UnknownTerminalStage(
                self.terminal_stage.clone(),
            ));
        }
        Ok(())
    }
}

fn require_non_empty(field: &str, value: &str) -> std::result::Result<(), PhaseConfigError> {
    if value.trim().is_empty() {
        return Err(PhaseConfigError::Empty {
            field: field.to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseEnvelope {
    pub source_format: String,
    pub source_yaml_hash: String,
    pub normalized_hash: String,
    pub definition: PhaseDefinition,
    pub normalized_json: Value,
}

/// Load phase YAML from disk and normalize it.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed or validated.
pub fn load_phase_from_path(path: &Path) -> Result<PhaseEnvelope> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read phase definition {}", path.display()))?;
    normalize_phase_yaml(&content)
}

/// Normalize phase YAML into canonical JSON plus a stable hash. Stage order
/// is significant and never changes.
///
/// # Errors
/// Returns an error when YAML parsing, validation or serialization fails.
pub fn normalize_phase_yaml(yaml: &str) -> Result<PhaseEnvelope> {
    let source_yaml_hash = hash_bytes(yaml.as_bytes());
    let mut definition: PhaseDefinition = serde_yaml::from_str(yaml)
        .map_err(|err| anyhow!("invalid phase YAML structure: {err}"))?;

    definition.validate()?;
    normalize_phase(&mut definition);
    definition.validate()?;

    let normalized_json = serde_json::to_value(&definition)?;
    let normalized_hash = hash_json(&normalized_json)?;

    Ok(PhaseEnvelope {
        source_format: "yaml".to_string(),
        source_yaml_hash,
        normalized_hash,
        definition,
        normalized_json,
    })
}

fn normalize_phase(definition: &mut PhaseDefinition) {
    definition.normalization_version = NORMALIZATION_VERSION;
    definition.phase_tag = definition.phase_tag.trim().to_string();
    definition.terminal_stage = definition.terminal_stage.trim().to_string();

    for stage in &mut definition.stages {
        stage.stage_id = stage.stage_id.trim().to_string();
        stage.reads.sort();
        stage.reads.dedup();

        let mut seen = BTreeSet::new();
        stage.requires.retain(|reference| seen.insert(reference.clone()));

        if stage.reads_all_input() {
            stage.input_keys = default_input_keys();
        } else {
            stage.input_keys.sort();
            stage.input_keys.dedup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHASE_YAML: &str = r"
phase_tag: pass1
phase_version: v1
terminal_stage: summary
assumptions:
  min_population: 10000
stages:
  - stage_id: identity
    adapter: { kind: static, params: { payload: { zip: '99999' } } }
    input_keys: [zip, zip]
  - stage_id: population
    adapter: { kind: http_json, params: { url: 'http://localhost:9000/population' } }
    reads: [identity]
    requires: [identity.zip, identity.zip]
    outbound: true
    cost_units: 2
  - stage_id: summary
    adapter: { kind: static }
    reads: [population, identity, population]
";

    fn must_ok<T, E: Display>(result: std::result::Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn normalize_hash_is_stable() {
        let first = must_ok(normalize_phase_yaml(PHASE_YAML));
        let second = must_ok(normalize_phase_yaml(PHASE_YAML));
        assert_eq!(first.normalized_hash, second.normalized_hash);
        assert_eq!(first.definition.normalization_version, NORMALIZATION_VERSION);
    }

    #[test]
    fn normalization_keeps_stage_order_and_dedups_lists() {
        let envelope = must_ok(normalize_phase_yaml(PHASE_YAML));
        let ids: Vec<&str> = envelope
            .definition
            .stages
            .iter()
            .map(|stage| stage.stage_id.as_str())
            .collect();
        assert_eq!(ids, vec!["identity", "population", "summary"]);

        let population = envelope.definition.stage("population");
        assert_eq!(
            population.map(|stage| stage.requires.clone()),
            Some(vec!["identity.zip".to_string()])
        );
        assert_eq!(
            envelope.definition.stage("summary").map(|stage| stage.reads.clone()),
            Some(vec!["identity".to_string(), "population".to_string()])
        );
        assert_eq!(
            envelope.definition.stage("identity").map(|stage| stage.input_keys.clone()),
            Some(vec!["zip".to_string()])
        );
        assert_eq!(envelope.definition.assumptions.get("min_population"), Some(&10_000.0));
    }

    #[test]
    fn reading_a_later_stage_is_a_configuration_error() {
        let yaml = r"
phase_tag: pass1
phase_version: v1
terminal_stage: b
stages:
  - stage_id: a
    adapter: { kind: static }
    reads: [b]
  - stage_id: b
    adapter: { kind: static }
";
        let definition: PhaseDefinition = must_ok(serde_yaml::from_str(yaml));
        assert_eq!(
            definition.validate(),
            Err(PhaseConfigError::ForwardReference {
                stage: "a".to_string(),
                reference: "b".to_string(),
            })
        );
        assert!(normalize_phase_yaml(yaml).is_err());
    }

    #[test]
    fn requiring_self_or_unknown_stage_is_rejected() {
        let self_ref = r"
phase_tag: p
phase_version: v1
terminal_stage: a
stages:
  - stage_id: a
    adapter: { kind: static }
    requires: [a.value]
";
        let definition: PhaseDefinition = must_ok(serde_yaml::from_str(self_ref));
        assert!(matches!(
            definition.validate(),
            Err(PhaseConfigError::ForwardReference { .. })
        ));

        let unknown = self_ref.replace("a.value", "ghost");
        let definition: PhaseDefinition = must_ok(serde_yaml::from_str(&unknown));
        assert!(matches!(
            definition.validate(),
            Err(PhaseConfigError::UnknownStage { .. })
        ));
    }

    #[test]
    fn terminal_stage_must_be_declared() {
        let yaml = PHASE_YAML.replace("terminal_stage: summary", "terminal_stage: report");
        let definition: PhaseDefinition = must_ok(serde_yaml::from_str(&yaml));
        assert_eq!(
            definition.validate(),
            Err(PhaseConfigError::UnknownTerminalStage("report".to_string()))
        );
    }

    #[test]
    fn dependency_refs_parse_paths() {
        let dependency: DependencyRef = must_ok("population.census.total".parse());
        assert_eq!(dependency.stage_id, "population");
        assert_eq!(dependency.path, vec!["census".to_string(), "total".to_string()]);
        assert_eq!(dependency.to_string(), "population.census.total");
        assert!("population..total".parse::<DependencyRef>().is_err());
        assert!("".parse::<DependencyRef>().is_err());
    }

    #[test]
    fn visible_stages_include_required_stages() {
        let envelope = must_ok(normalize_phase_yaml(PHASE_YAML));
        let visible = envelope
            .definition
            .stage("population")
            .map(StageDefinition::visible_stages)
            .unwrap_or_default();
        assert_eq!(visible, BTreeSet::from(["identity".to_string()]));
    }
}
