#![forbid(unsafe_code)]

//! Detects disagreements between newly asserted known values and the values
//! already on a card, under an explicit authority precedence table.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use site_screener_domain::DateTimeUtc;
use site_screener_knowledge::{
    conflict_flag, AuthorityScope, Card, FieldConflict, KnowledgeError, KnowledgeField,
    KnowledgeState,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PrecedenceError {
    #[error("precedence rule for {scope} cannot supersede itself")]
    SelfSupersession { scope: &'static str },
    #[error("precedence rules contradict each other for {higher} vs {lower}{}", field_suffix(.field))]
    Contradiction {
        field: Option<String>,
        higher: &'static str,
        lower: &'static str,
    },
}

fn field_suffix(field: &Option<String>) -> String {
    field
        .as_deref()
        .map_or_else(String::new, |field| format!(" on field `{field}`"))
}

/// `higher` supersedes `lower`, either for every field or for one key.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PrecedenceRule {
    #[serde(default)]
    pub field: Option<String>,
    pub higher: AuthorityScope,
    pub lower: AuthorityScope,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PrecedenceTable {
    pub rules: Vec<PrecedenceRule>,
}

impl Default for PrecedenceTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl PrecedenceTable {
    /// State supersedes county and municipality. County and municipality
    /// have no general ordering; disagreements between them are conflicts
    /// unless a field-specific rule says otherwise.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            rules: vec![
                PrecedenceRule {
                    field: None,
                    higher: AuthorityScope::State,
                    lower: AuthorityScope::County,
                },
                PrecedenceRule {
                    field: None,
                    higher: AuthorityScope::State,
                    lower: AuthorityScope::Municipality,
                },
            ],
        }
    }

    /// # Errors
    /// Returns [`PrecedenceError`] for self-referencing or contradictory rules.
    pub fn validate(&self) -> Result<(), PrecedenceError> {
        for rule in &self.rules {
            if rule.higher == rule.lower {
                return Err(PrecedenceError::SelfSupersession {
                    scope: rule.higher.as_str(),
                });
            }
            let reversed = self.rules.iter().any(|other| {
                other.field == rule.field && other.higher == rule.lower && other.lower == rule.higher
            });
            if reversed {
                return Err(PrecedenceError::Contradiction {
                    field: rule.field.clone(),
                    higher: rule.higher.as_str(),
                    lower: rule.lower.as_str(),
                });
            }
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error when the YAML is malformed or the rules are invalid.
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let table: Self = serde_yaml::from_str(yaml)
            .map_err(|err| anyhow!("invalid precedence YAML structure: {err}"))?;
        table.validate()?;
        Ok(table)
    }

    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read precedence table {}", path.display()))?;
        Self::from_yaml_str(&content)
    }

    /// Whether `a` strictly supersedes `b` for `key`. Rules naming `key`
    /// are consulted first; general rules apply only when no field rule
    /// mentions the pair in either direction.
    #[must_use]
    pub fn supersedes(&self, key: &str, a: AuthorityScope, b: AuthorityScope) -> bool {
        if a == b {
            return false;
        }
        let mentions_pair = |rule: &&PrecedenceRule| {
            (rule.higher == a && rule.lower == b) || (rule.higher == b && rule.lower == a)
        };
        let field_rules: Vec<&PrecedenceRule> = self
            .rules
            .iter()
            .filter(|rule| rule.field.as_deref() == Some(key))
            .filter(mentions_pair)
            .collect();
        let applicable = if field_rules.is_empty() {
            self.rules
                .iter()
                .filter(|rule| rule.field.is_none())
                .filter(mentions_pair)
                .collect()
        } else {
            field_rules
        };
        applicable
            .iter()
            .any(|rule| rule.higher == a && rule.lower == b)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Same value as stored; provenance refreshed.
    Unchanged,
    Accepted,
    /// The stored value supersedes the assertion.
    Retained,
    Conflict,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConflictFinding {
    pub key: String,
    pub resolution: Resolution,
    pub existing_state: KnowledgeState,
    pub existing_scope: Option<AuthorityScope>,
    pub proposed_scope: Option<AuthorityScope>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConflictReport {
    pub findings: Vec<ConflictFinding>,
}

impl ConflictReport {
    #[must_use]
    pub fn flags(&self) -> Vec<String> {
        self.findings
            .iter()
            .filter(|finding| finding.resolution == Resolution::Conflict)
            .map(|finding| conflict_flag(&finding.key))
            .collect()
    }

    #[must_use]
    pub fn has_conflicts(&self) -> bool {
        self.findings
            .iter()
            .any(|finding| finding.resolution == Resolution::Conflict)
    }

    #[must_use]
    pub fn resolution(&self, key: &str) -> Option<Resolution> {
        self.findings
            .iter()
            .find(|finding| finding.key == key)
            .map(|finding| finding.resolution)
    }
}

/// Classify each incoming assertion against the card without mutating it.
///
/// # Errors
/// Returns [`KnowledgeError::UndeclaredField`] for keys the card does not
/// declare, and any invariant error carried by an incoming field.
pub fn detect_conflicts(
    card: &Card,
    incoming: &BTreeMap<String, KnowledgeField>,
    table: &PrecedenceTable,
) -> Result<ConflictReport, KnowledgeError> {
    let mut findings = Vec::with_capacity(incoming.len());
    for (key, proposed) in incoming {
        proposed.validate()?;
        let existing = card
            .field(key)
            .ok_or_else(|| KnowledgeError::UndeclaredField(key.clone()))?;
        let open_conflict = card.conflicts().get(key);
        findings.push(ConflictFinding {
            key: key.clone(),
            resolution: classify(key, existing, proposed, open_conflict, table),
            existing_state: existing.knowledge_state(),
            existing_scope: existing.authority_scope(),
            proposed_scope: proposed.authority_scope(),
        });
    }
    Ok(ConflictReport { findings })
}

fn classify(
    key: &str,
    existing: &KnowledgeField,
    proposed: &KnowledgeField,
    open_conflict: Option<&FieldConflict>,
    table: &PrecedenceTable,
) -> Resolution {
    match (existing.knowledge_state(), proposed.knowledge_state()) {
        (KnowledgeState::Unknown, KnowledgeState::Unknown) => Resolution::Unchanged,
        (_, KnowledgeState::Unknown) | (KnowledgeState::Known, KnowledgeState::Blocked) => {
            Resolution::Retained
        }
        (KnowledgeState::Blocked, KnowledgeState::Blocked) => {
            if existing.source_reference() == proposed.source_reference() {
                Resolution::Unchanged
            } else {
                Resolution::Accepted
            }
        }
        (KnowledgeState::Unknown | KnowledgeState::Blocked, _) => Resolution::Accepted,
        (KnowledgeState::Known, KnowledgeState::Known) => {
            let (Some(old_scope), Some(new_scope)) =
                (existing.authority_scope(), proposed.authority_scope())
            else {
                return Resolution::Conflict;
            };
            if let Some(conflict) = open_conflict {
                let beats_existing = table.supersedes(key, new_scope, old_scope);
                let beats_pending = conflict
                    .proposed
                    .authority_scope()
                    .is_some_and(|pending| table.supersedes(key, new_scope, pending));
                return if beats_existing && beats_pending {
                    Resolution::Accepted
                } else {
                    Resolution::Conflict
                };
            }
            if existing.value() == proposed.value() {
                Resolution::Unchanged
            } else if table.supersedes(key, new_scope, old_scope) {
                Resolution::Accepted
            } else if table.supersedes(key, old_scope, new_scope) {
                Resolution::Retained
            } else {
                Resolution::Conflict
            }
        }
    }
}

/// Apply a batch of assertions, returning the updated card and the report.
/// Conflicting keys keep their stored value and are recorded on the card.
///
/// # Errors
/// Same as [`detect_conflicts`].
pub fn apply_assertions(
    card: &Card,
    incoming: &BTreeMap<String, KnowledgeField>,
    table: &PrecedenceTable,
    now: DateTimeUtc,
) -> Result<(Card, ConflictReport), KnowledgeError> {
    let report = detect_conflicts(card, incoming, table)?;
    let mut next = card.clone();
    for finding in &report.findings {
        let Some(proposed) = incoming.get(&finding.key) else {
            continue;
        };
        match finding.resolution {
            Resolution::Accepted => {
                next.set_field(&finding.key, proposed.clone(), now)?;
                next.clear_conflict(&finding.key, now);
            }
            Resolution::Unchanged => {
                if proposed.is_resolved() {
                    next.set_field(&finding.key, proposed.clone(), now)?;
                }
            }
            Resolution::Retained => {}
            Resolution::Conflict => {
                let repeats_open = next.conflicts().get(&finding.key).is_some_and(|open| {
                    open.proposed.value() == proposed.value()
                        || open.existing.value() == proposed.value()
                });
                if repeats_open {
                    continue;
                }
                let existing = next
                    .field(&finding.key)
                    .cloned()
                    .ok_or_else(|| KnowledgeError::UndeclaredField(finding.key.clone()))?;
                next.record_conflict(FieldConflict {
                    key: finding.key.clone(),
                    existing,
                    proposed: proposed.clone(),
                    detected_at: now,
                })?;
            }
        }
    }
    Ok((next, report))
}

/// Operator resolution of an open conflict: `chosen` replaces the stored
/// field and the conflict is cleared.
///
/// # Errors
/// Returns [`KnowledgeError::Invariant`] when `key` has no open conflict or
/// `chosen` is `unknown`.
pub fn resolve_conflict(
    card: &Card,
    key: &str,
    chosen: KnowledgeField,
    now: DateTimeUtc,
) -> Result<Card, KnowledgeError> {
    if !card.conflicts().contains_key(key) {
        return Err(KnowledgeError::Invariant(format!(
            "field `{key}` has no open conflict"
        )));
    }
    if !chosen.is_resolved() {
        return Err(KnowledgeError::Invariant(format!(
            "conflict on `{key}` must be resolved to a known or blocked value"
        )));
    }
    let mut next = card.clone();
    next.set_field(key, chosen, now)?;
    next.clear_conflict(key, now);
    Ok(next)
}
