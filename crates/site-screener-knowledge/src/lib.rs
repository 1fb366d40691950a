#![forbid(unsafe_code)]

//! Tri-state knowledge fields, constraint cards and the completeness and
//! freshness evaluations over them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use site_screener_domain::{now_utc, DateTimeUtc};
use time::Date;

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("known value requires full provenance; missing: {}", .missing.join(", "))]
pub struct InvalidProvenanceError {
    pub missing: Vec<&'static str>,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KnowledgeError {
    #[error(transparent)]
    InvalidProvenance(#[from] InvalidProvenanceError),
    #[error("knowledge field invariant violated: {0}")]
    Invariant(String),
    #[error("field `{0}` is not declared on this card")]
    UndeclaredField(String),
    #[error("field `{key}` is {current} and cannot be downgraded to {proposed}")]
    Downgrade {
        key: String,
        current: &'static str,
        proposed: &'static str,
    },
    #[error("card schema error: {0}")]
    Schema(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeState {
    Known,
    Unknown,
    Blocked,
}

impl KnowledgeState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Known => "known",
            Self::Unknown => "unknown",
            Self::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Ordinance,
    ZoningMap,
    PlanningStaff,
    Portal,
    Dataset,
    Manual,
}

impl SourceType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ordinance => "ordinance",
            Self::ZoningMap => "zoning_map",
            Self::PlanningStaff => "planning_staff",
            Self::Portal => "portal",
            Self::Dataset => "dataset",
            Self::Manual => "manual",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ordinance" => Some(Self::Ordinance),
            "zoning_map" => Some(Self::ZoningMap),
            "planning_staff" => Some(Self::PlanningStaff),
            "portal" => Some(Self::Portal),
            "dataset" => Some(Self::Dataset),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// Governmental level a source speaks for. The derived ordering is
/// `municipality < county < state`; which level wins a disagreement is
/// decided by the conflict precedence table, not by this ordering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityScope {
    Municipality,
    County,
    State,
}

impl AuthorityScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Municipality => "municipality",
            Self::County => "county",
            Self::State => "state",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "municipality" => Some(Self::Municipality),
            "county" => Some(Self::County),
            "state" => Some(Self::State),
            _ => None,
        }
    }
}

/// Provenance offered when asserting a known value. Every field is optional
/// here so that incomplete provenance can be detected and rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Provenance {
    #[serde(default)]
    pub source_type: Option<SourceType>,
    #[serde(default)]
    pub source_reference: Option<String>,
    #[serde(default)]
    pub authority_scope: Option<AuthorityScope>,
    #[serde(default, with = "iso_date::option")]
    pub ttl_date: Option<Date>,
}

impl Provenance {
    #[must_use]
    pub fn new(
        source_type: SourceType,
        source_reference: impl Into<String>,
        authority_scope: AuthorityScope,
    ) -> Self {
        Self {
            source_type: Some(source_type),
            source_reference: Some(source_reference.into()),
            authority_scope: Some(authority_scope),
            ttl_date: None,
        }
    }

    #[must_use]
    pub fn with_ttl_date(mut self, ttl_date: Date) -> Self {
        self.ttl_date = Some(ttl_date);
        self
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.source_type.is_none() {
            missing.push("source_type");
        }
        if self
            .source_reference
            .as_deref()
            .map_or(true, |reference| reference.trim().is_empty())
        {
            missing.push("source_reference");
        }
        if self.authority_scope.is_none() {
            missing.push("authority_scope");
        }
        missing
    }
}

/// Immutable tri-state value. Constructors enforce the provenance
/// invariants; deserialization re-checks them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "KnowledgeFieldRepr")]
pub struct KnowledgeField {
    value: Option<Value>,
    knowledge_state: KnowledgeState,
    source_type: Option<SourceType>,
    source_reference: Option<String>,
    authority_scope: Option<AuthorityScope>,
    #[serde(with = "time::serde::rfc3339::option")]
    verified_at: Option<DateTimeUtc>,
    #[serde(with = "iso_date::option")]
    ttl_date: Option<Date>,
}

#[derive(Deserialize)]
struct KnowledgeFieldRepr {
    #[serde(default)]
    value: Option<Value>,
    knowledge_state: KnowledgeState,
    #[serde(default)]
    source_type: Option<SourceType>,
    #[serde(default)]
    source_reference: Option<String>,
    #[serde(default)]
    authority_scope: Option<AuthorityScope>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    verified_at: Option<DateTimeUtc>,
    #[serde(default, with = "iso_date::option")]
    ttl_date: Option<Date>,
}

impl TryFrom<KnowledgeFieldRepr> for KnowledgeField {
    type Error = KnowledgeError;

    fn try_from(repr: KnowledgeFieldRepr) -> Result<Self, Self::Error> {
        let field = Self {
            value: repr.value.filter(|value| !value.is_null()),
            knowledge_state: repr.knowledge_state,
            source_type: repr.source_type,
            source_reference: repr.source_reference,
            authority_scope: repr.authority_scope,
            verified_at: repr.verified_at,
            ttl_date: repr.ttl_date,
        };
        field.validate()?;
        Ok(field)
    }
}

impl Default for KnowledgeField {
    fn default() -> Self {
        Self::unknown()
    }
}

impl KnowledgeField {
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            value: None,
            knowledge_state: KnowledgeState::Unknown,
            source_type: None,
            source_reference: None,
            authority_scope: None,
            verified_at: None,
            ttl_date: None,
        }
    }

    /// Assert a known value, stamping `verified_at` with the current time.
    ///
    /// # Errors
    /// Returns [`KnowledgeError::InvalidProvenance`] when source type,
    /// reference or authority scope is missing, and
    /// [`KnowledgeError::Invariant`] for a null value.
    pub fn known(value: impl Into<Value>, provenance: Provenance) -> Result<Self, KnowledgeError> {
        Self::known_at(value, provenance, now_utc())
    }

    /// # Errors
    /// Same as [`KnowledgeField::known`].
    pub fn known_at(
        value: impl Into<Value>,
        provenance: Provenance,
        verified_at: DateTimeUtc,
    ) -> Result<Self, KnowledgeError> {
        let missing = provenance.missing_fields();
        if !missing.is_empty() {
            return Err(InvalidProvenanceError { missing }.into());
        }
        let value = value.into();
        if value.is_null() {
            return Err(KnowledgeError::Invariant(
                "known fields MUST carry a non-null value".to_string(),
            ));
        }
        Ok(Self {
            value: Some(value),
            knowledge_state: KnowledgeState::Known,
            source_type: provenance.source_type,
            source_reference: provenance.source_reference,
            authority_scope: provenance.authority_scope,
            verified_at: Some(verified_at),
            ttl_date: provenance.ttl_date,
        })
    }

    /// Mark a field as researched but not obtainable; the rationale is kept
    /// in `source_reference`.
    ///
    /// # Errors
    /// Returns [`KnowledgeError::Invariant`] when the reason is blank.
    pub fn blocked(reason: impl Into<String>) -> Result<Self, KnowledgeError> {
        let reason = reason.into();
        if reason.trim().is_empty() {
            return Err(KnowledgeError::Invariant(
                "blocked fields MUST record a reason".to_string(),
            ));
        }
        Ok(Self {
            value: None,
            knowledge_state: KnowledgeState::Blocked,
            source_type: None,
            source_reference: Some(reason),
            authority_scope: None,
            verified_at: None,
            ttl_date: None,
        })
    }

    /// Check the tri-state invariants.
    ///
    /// # Errors
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), KnowledgeError> {
        match self.knowledge_state {
            KnowledgeState::Known => {
                let mut missing = Provenance {
                    source_type: self.source_type,
                    source_reference: self.source_reference.clone(),
                    authority_scope: self.authority_scope,
                    ttl_date: self.ttl_date,
                }
                .missing_fields();
                if self.verified_at.is_none() {
                    missing.push("verified_at");
                }
                if !missing.is_empty() {
                    return Err(InvalidProvenanceError { missing }.into());
                }
                if self.value.is_none() {
                    return Err(KnowledgeError::Invariant(
                        "known fields MUST carry a non-null value".to_string(),
                    ));
                }
            }
            KnowledgeState::Unknown => {
                if self.value.is_some()
                    || self.source_type.is_some()
                    || self.source_reference.is_some()
                    || self.authority_scope.is_some()
                    || self.verified_at.is_some()
                    || self.ttl_date.is_some()
                {
                    return Err(KnowledgeError::Invariant(
                        "unknown fields MUST NOT carry a value or provenance".to_string(),
                    ));
                }
            }
            KnowledgeState::Blocked => {
                if self.value.is_some() {
                    return Err(KnowledgeError::Invariant(
                        "blocked fields MUST NOT carry a value".to_string(),
                    ));
                }
                if self
                    .source_reference
                    .as_deref()
                    .map_or(true, |reason| reason.trim().is_empty())
                {
                    return Err(KnowledgeError::Invariant(
                        "blocked fields MUST record a reason".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn knowledge_state(&self) -> KnowledgeState {
        self.knowledge_state
    }

    #[must_use]
    pub fn is_known(&self) -> bool {
        self.knowledge_state == KnowledgeState::Known
    }

    /// Known and blocked both count as resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.knowledge_state != KnowledgeState::Unknown
    }

    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Decode the value, `None` when absent or of a different shape.
    #[must_use]
    pub fn value_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.value
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    #[must_use]
    pub fn source_type(&self) -> Option<SourceType> {
        self.source_type
    }

    #[must_use]
    pub fn source_reference(&self) -> Option<&str> {
        self.source_reference.as_deref()
    }

    #[must_use]
    pub fn authority_scope(&self) -> Option<AuthorityScope> {
        self.authority_scope
    }

    #[must_use]
    pub fn verified_at(&self) -> Option<DateTimeUtc> {
        self.verified_at
    }

    #[must_use]
    pub fn ttl_date(&self) -> Option<Date> {
        self.ttl_date
    }

    /// A known field is expired once `as_of` is past its TTL date.
    #[must_use]
    pub fn is_expired(&self, as_of: Date) -> bool {
        self.is_known() && self.ttl_date.is_some_and(|ttl| as_of > ttl)
    }
}

/// Parse a `YYYY-MM-DD` date.
///
/// # Errors
/// Returns [`KnowledgeError::Invariant`] for malformed input.
pub fn parse_iso_date(value: &str) -> Result<Date, KnowledgeError> {
    Date::parse(
        value.trim(),
        time::macros::format_description!("[year]-[month]-[day]"),
    )
    .map_err(|err| KnowledgeError::Invariant(format!("invalid date `{value}`: {err}")))
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SubjectKey {
    pub jurisdiction: String,
    pub asset_class: String,
}

impl SubjectKey {
    #[must_use]
    pub fn new(jurisdiction: impl Into<String>, asset_class: impl Into<String>) -> Self {
        Self {
            jurisdiction: jurisdiction.into(),
            asset_class: asset_class.into(),
        }
    }
}

impl Display for SubjectKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.jurisdiction, self.asset_class)
    }
}

impl FromStr for SubjectKey {
    type Err = KnowledgeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (jurisdiction, asset_class) = value.split_once("::").ok_or_else(|| {
            KnowledgeError::Invariant(format!(
                "subject key `{value}` MUST look like <jurisdiction>::<asset_class>"
            ))
        })?;
        if jurisdiction.trim().is_empty() || asset_class.trim().is_empty() {
            return Err(KnowledgeError::Invariant(format!(
                "subject key `{value}` has an empty component"
            )));
        }
        Ok(Self::new(jurisdiction.trim(), asset_class.trim()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ProhibitionStatus {
    Open,
    Lifted,
}

/// A fatal flag on a card, e.g. a moratorium on new storage uses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prohibition {
    pub code: String,
    pub description: String,
    pub authority_scope: AuthorityScope,
    pub status: ProhibitionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: DateTimeUtc,
}

impl Prohibition {
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == ProhibitionStatus::Open
    }
}

/// Two known assertions for one key that no precedence rule settles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldConflict {
    pub key: String,
    pub existing: KnowledgeField,
    pub proposed: KnowledgeField,
    #[serde(with = "time::serde::rfc3339")]
    pub detected_at: DateTimeUtc,
}

impl FieldConflict {
    #[must_use]
    pub fn flag(&self) -> String {
        conflict_flag(&self.key)
    }
}

#[must_use]
pub fn conflict_flag(key: &str) -> String {
    format!("CONFLICT_DETECTED:{key}")
}

/// Declared fields of a card type. This is the single source of the
/// envelope-required key list.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CardSchema {
    pub schema_version: u32,
    pub required_for_envelope: Vec<String>,
    #[serde(default)]
    pub informational: Vec<String>,
}

impl CardSchema {
    /// # Errors
    /// Returns [`KnowledgeError::Schema`] for a zero version, blank keys or
    /// keys declared twice.
    pub fn validate(&self) -> Result<(), KnowledgeError> {
        if self.schema_version == 0 {
            return Err(KnowledgeError::Schema(
                "schema_version MUST be >= 1".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for key in self.required_for_envelope.iter().chain(&self.informational) {
            if key.trim().is_empty() {
                return Err(KnowledgeError::Schema("field keys MUST be non-empty".to_string()));
            }
            if !seen.insert(key.as_str()) {
                return Err(KnowledgeError::Schema(format!("duplicate field key: {key}")));
            }
        }
        Ok(())
    }

    pub fn declared_keys(&self) -> impl Iterator<Item = &String> {
        self.required_for_envelope.iter().chain(&self.informational)
    }

    /// # Errors
    /// Returns an error when the YAML is malformed or fails validation.
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let schema: Self = serde_yaml::from_str(yaml)
            .map_err(|err| anyhow!("invalid card schema YAML structure: {err}"))?;
        schema.validate()?;
        Ok(schema)
    }

    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read card schema {}", path.display()))?;
        Self::from_yaml_str(&content)
    }
}

/// Constraint record for one subject. Fields are replaced whole, never
/// edited in place, and completeness flags are restamped on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CardRepr")]
pub struct Card {
    subject: SubjectKey,
    version: u64,
    schema_version: u32,
    envelope_keys: Vec<String>,
    fields: BTreeMap<String, KnowledgeField>,
    prohibitions: Vec<Prohibition>,
    conflicts: BTreeMap<String, FieldConflict>,
    envelope_complete: bool,
    card_complete: bool,
    #[serde(with = "time::serde::rfc3339")]
    created_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    updated_at: DateTimeUtc,
}

#[derive(Deserialize)]
struct CardRepr {
    subject: SubjectKey,
    version: u64,
    schema_version: u32,
    envelope_keys: Vec<String>,
    fields: BTreeMap<String, KnowledgeField>,
    #[serde(default)]
    prohibitions: Vec<Prohibition>,
    #[serde(default)]
    conflicts: BTreeMap<String, FieldConflict>,
    #[serde(with = "time::serde::rfc3339")]
    created_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    updated_at: DateTimeUtc,
}

impl TryFrom<CardRepr> for Card {
    type Error = KnowledgeError;

    fn try_from(repr: CardRepr) -> Result<Self, Self::Error> {
        for key in repr.envelope_keys.iter().chain(repr.conflicts.keys()) {
            if !repr.fields.contains_key(key) {
                return Err(KnowledgeError::UndeclaredField(key.clone()));
            }
        }
        let mut card = Self {
            subject: repr.subject,
            version: repr.version,
            schema_version: repr.schema_version,
            envelope_keys: repr.envelope_keys,
            fields: repr.fields,
            prohibitions: repr.prohibitions,
            conflicts: repr.conflicts,
            envelope_complete: false,
            card_complete: false,
            created_at: repr.created_at,
            updated_at: repr.updated_at,
        };
        card.restamp_completeness();
        Ok(card)
    }
}

impl Card {
    /// A fresh card with every declared field `unknown` and version 0
    /// (not yet stored).
    ///
    /// # Errors
    /// Returns [`KnowledgeError::Schema`] when the schema is invalid.
    pub fn initialize(
        subject: SubjectKey,
        schema: &CardSchema,
        now: DateTimeUtc,
    ) -> Result<Self, KnowledgeError> {
        schema.validate()?;
        let fields = schema
            .declared_keys()
            .map(|key| (key.clone(), KnowledgeField::unknown()))
            .collect();
        let mut card = Self {
            subject,
            version: 0,
            schema_version: schema.schema_version,
            envelope_keys: schema.required_for_envelope.clone(),
            fields,
            prohibitions: Vec::new(),
            conflicts: BTreeMap::new(),
            envelope_complete: false,
            card_complete: false,
            created_at: now,
            updated_at: now,
        };
        card.restamp_completeness();
        Ok(card)
    }

    #[must_use]
    pub fn subject(&self) -> &SubjectKey {
        &self.subject
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Copy carrying the version assigned by a store write.
    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    #[must_use]
    pub fn envelope_keys(&self) -> &[String] {
        &self.envelope_keys
    }

    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, KnowledgeField> {
        &self.fields
    }

    #[must_use]
    pub fn field(&self, key: &str) -> Option<&KnowledgeField> {
        self.fields.get(key)
    }

    #[must_use]
    pub fn prohibitions(&self) -> &[Prohibition] {
        &self.prohibitions
    }

    pub fn open_prohibitions(&self) -> impl Iterator<Item = &Prohibition> {
        self.prohibitions.iter().filter(|item| item.is_open())
    }

    #[must_use]
    pub fn conflicts(&self) -> &BTreeMap<String, FieldConflict> {
        &self.conflicts
    }

    #[must_use]
    pub fn envelope_complete(&self) -> bool {
        self.envelope_complete
    }

    #[must_use]
    pub fn card_complete(&self) -> bool {
        self.card_complete
    }

    #[must_use]
    pub fn created_at(&self) -> DateTimeUtc {
        self.created_at
    }

    #[must_use]
    pub fn updated_at(&self) -> DateTimeUtc {
        self.updated_at
    }

    /// Replace a declared field. Resolved fields never go back to `unknown`,
    /// and a `known` field only becomes `blocked` while the key has an open
    /// conflict for an operator to settle.
    ///
    /// # Errors
    /// Returns [`KnowledgeError::UndeclaredField`] for keys outside the
    /// schema and [`KnowledgeError::Downgrade`] for a resolved → unknown or
    /// an unconflicted known → blocked transition.
    pub fn set_field(
        &mut self,
        key: &str,
        field: KnowledgeField,
        now: DateTimeUtc,
    ) -> Result<(), KnowledgeError> {
        field.validate()?;
        let current = self
            .fields
            .get(key)
            .ok_or_else(|| KnowledgeError::UndeclaredField(key.to_string()))?;
        let downgrade = match (current.knowledge_state(), field.knowledge_state()) {
            (KnowledgeState::Known | KnowledgeState::Blocked, KnowledgeState::Unknown) => true,
            (KnowledgeState::Known, KnowledgeState::Blocked) => !self.conflicts.contains_key(key),
            _ => false,
        };
        if downgrade {
            return Err(KnowledgeError::Downgrade {
                key: key.to_string(),
                current: current.knowledge_state().as_str(),
                proposed: field.knowledge_state().as_str(),
            });
        }
        self.fields.insert(key.to_string(), field);
        self.touch(now);
        Ok(())
    }

    /// # Errors
    /// Returns [`KnowledgeError::UndeclaredField`] for keys outside the schema.
    pub fn record_conflict(&mut self, conflict: FieldConflict) -> Result<(), KnowledgeError> {
        if !self.fields.contains_key(&conflict.key) {
            return Err(KnowledgeError::UndeclaredField(conflict.key));
        }
        let detected_at = conflict.detected_at;
        self.conflicts.insert(conflict.key.clone(), conflict);
        self.touch(detected_at);
        Ok(())
    }

    pub fn clear_conflict(&mut self, key: &str, now: DateTimeUtc) -> Option<FieldConflict> {
        let cleared = self.conflicts.remove(key);
        if cleared.is_some() {
            self.touch(now);
        }
        cleared
    }

    pub fn add_prohibition(&mut self, prohibition: Prohibition) {
        let recorded_at = prohibition.recorded_at;
        self.prohibitions
            .retain(|item| !(item.code == prohibition.code && item.is_open()));
        self.prohibitions.push(prohibition);
        self.touch(recorded_at);
    }

    /// Lift every open prohibition with `code`; returns how many were lifted.
    pub fn lift_prohibition(&mut self, code: &str, now: DateTimeUtc) -> usize {
        let mut lifted = 0;
        for item in &mut self.prohibitions {
            if item.code == code && item.is_open() {
                item.status = ProhibitionStatus::Lifted;
                lifted += 1;
            }
        }
        if lifted > 0 {
            self.touch(now);
        }
        lifted
    }

    fn touch(&mut self, now: DateTimeUtc) {
        if now > self.updated_at {
            self.updated_at = now;
        }
        self.restamp_completeness();
    }

    fn restamp_completeness(&mut self) {
        self.envelope_complete = evaluate_envelope(self, &self.envelope_keys);
        self.card_complete = evaluate_card(self);
    }
}

/// True iff every key in `required_keys` is `known` on the card.
#[must_use]
pub fn evaluate_envelope(card: &Card, required_keys: &[String]) -> bool {
    required_keys
        .iter()
        .all(|key| card.fields.get(key).is_some_and(KnowledgeField::is_known))
}

/// True iff no field on the card is still `unknown`.
#[must_use]
pub fn evaluate_card(card: &Card) -> bool {
    card.fields.values().all(KnowledgeField::is_resolved)
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CompletenessReport {
    pub envelope_complete: bool,
    pub card_complete: bool,
    pub missing_for_envelope: Vec<String>,
    pub unresolved: Vec<String>,
}

#[must_use]
pub fn evaluate_completeness(card: &Card) -> CompletenessReport {
    let missing_for_envelope = card
        .envelope_keys
        .iter()
        .filter(|key| !card.fields.get(*key).is_some_and(KnowledgeField::is_known))
        .cloned()
        .collect();
    let unresolved = card
        .fields
        .iter()
        .filter(|(_, field)| !field.is_resolved())
        .map(|(key, _)| key.clone())
        .collect();
    CompletenessReport {
        envelope_complete: evaluate_envelope(card, &card.envelope_keys),
        card_complete: evaluate_card(card),
        missing_for_envelope,
        unresolved,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FreshnessPolicy {
    pub max_age_months: u32,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self { max_age_months: 12 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Freshness {
    pub stale: bool,
    pub card_age_exceeded: bool,
    pub expired_fields: Vec<String>,
}

/// Read-time staleness: the card is stale when it was last updated more than
/// `max_age_months` before `as_of`, or when any known field is past its TTL.
#[must_use]
pub fn evaluate_freshness(card: &Card, as_of: DateTimeUtc, policy: FreshnessPolicy) -> Freshness {
    let as_of_date = as_of.date();
    let card_age_exceeded =
        months_between(card.updated_at.date(), as_of_date) >= i64::from(policy.max_age_months);
    let expired_fields: Vec<String> = card
        .fields
        .iter()
        .filter(|(_, field)| field.is_expired(as_of_date))
        .map(|(key, _)| key.clone())
        .collect();
    Freshness {
        stale: card_age_exceeded || !expired_fields.is_empty(),
        card_age_exceeded,
        expired_fields,
    }
}

/// Whole calendar months from `earlier` to `later`; negative when reversed.
#[must_use]
pub fn months_between(earlier: Date, later: Date) -> i64 {
    let month_index = |date: Date| i64::from(date.year()) * 12 + i64::from(u8::from(date.month()));
    let mut months = month_index(later) - month_index(earlier);
    if months > 0 && later.day() < earlier.day() {
        months -= 1;
    } else if months < 0 && later.day() > earlier.day() {
        months += 1;
    }
    months
}
