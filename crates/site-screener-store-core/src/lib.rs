#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use site_screener_domain::{DateTimeUtc, RunId, RunRecord, RunSummary};
use site_screener_knowledge::{Card, SubjectKey};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("card {subject} was modified concurrently: expected version {expected}, stored version {actual}")]
pub struct VersionConflictError {
    pub subject: SubjectKey,
    pub expected: u64,
    pub actual: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    VersionConflict(#[from] VersionConflictError),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    #[must_use]
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict(_))
    }
}

pub trait CardStore {
    #[allow(clippy::missing_errors_doc)]
    fn get(&self, subject: &SubjectKey) -> Result<Option<Card>, StoreError>;

    /// Store `card` iff the stored version equals `expected_version` (0 when
    /// no card exists yet). Returns the card as stored, with its new version.
    #[allow(clippy::missing_errors_doc)]
    fn upsert(&self, card: &Card, expected_version: u64) -> Result<Card, StoreError>;

    /// Every stored version of a subject's card, oldest first.
    #[allow(clippy::missing_errors_doc)]
    fn history(&self, subject: &SubjectKey) -> Result<Vec<Card>, StoreError>;
}

pub trait RunStore {
    #[allow(clippy::missing_errors_doc)]
    fn insert_run(&self, run: &RunRecord) -> anyhow::Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_run(&self, run_id: RunId) -> anyhow::Result<Option<RunRecord>>;

    /// Summaries ordered by creation time, then run id.
    #[allow(clippy::missing_errors_doc)]
    fn list_runs(&self) -> anyhow::Result<Vec<RunSummary>>;
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    cards: Mutex<BTreeMap<SubjectKey, Vec<Card>>>,
    runs: Mutex<BTreeMap<RunId, RunRecord>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> anyhow::Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| anyhow!("in-memory {what} store lock poisoned"))
}

impl CardStore for InMemoryStore {
    fn get(&self, subject: &SubjectKey) -> Result<Option<Card>, StoreError> {
        let cards = lock(&self.cards, "card")?;
        Ok(cards.get(subject).and_then(|versions| versions.last().cloned()))
    }

    fn upsert(&self, card: &Card, expected_version: u64) -> Result<Card, StoreError> {
        let mut cards = lock(&self.cards, "card")?;
        let actual = cards
            .get(card.subject())
            .and_then(|versions| versions.last())
            .map_or(0, Card::version);
        if actual != expected_version {
            return Err(VersionConflictError {
                subject: card.subject().clone(),
                expected: expected_version,
                actual,
            }
            .into());
        }
        let stored = card.clone().with_version(actual + 1);
        cards
            .entry(card.subject().clone())
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    fn history(&self, subject: &SubjectKey) -> Result<Vec<Card>, StoreError> {
        let cards = lock(&self.cards, "card")?;
        Ok(cards.get(subject).cloned().unwrap_or_default())
    }
}

impl RunStore for InMemoryStore {
    fn insert_run(&self, run: &RunRecord) -> anyhow::Result<()> {
        let mut runs = lock(&self.runs, "run")?;
        if runs.contains_key(&run.run_id) {
            return Err(anyhow!("run {} already recorded; runs are append-only", run.run_id));
        }
        runs.insert(run.run_id, run.clone());
        Ok(())
    }

    fn get_run(&self, run_id: RunId) -> anyhow::Result<Option<RunRecord>> {
        let runs = lock(&self.runs, "run")?;
        Ok(runs.get(&run_id).cloned())
    }

    fn list_runs(&self) -> anyhow::Result<Vec<RunSummary>> {
        let runs = lock(&self.runs, "run")?;
        let mut summaries: Vec<RunSummary> = runs.values().map(RunRecord::summary).collect();
        summaries.sort_by(|lhs, rhs| {
            lhs.created_at
                .cmp(&rhs.created_at)
                .then_with(|| lhs.run_id.cmp(&rhs.run_id))
        });
        Ok(summaries)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CardWrite {
    pub card: Card,
    pub attempts: u32,
    /// Known fields whose TTL date has passed as of the write.
    pub needs_revalidation: Vec<String>,
}

/// Read-modify-write with optimistic concurrency. `apply` receives the
/// currently stored card (if any) and returns the card to store; on a
/// version conflict the card is re-read and `apply` runs again, up to
/// `max_attempts` times.
///
/// # Errors
/// Returns the last [`StoreError::VersionConflict`] once attempts are
/// exhausted, or any backend or `apply` error immediately.
pub fn write_card_with_retry<S, F>(
    store: &S,
    subject: &SubjectKey,
    max_attempts: u32,
    as_of: DateTimeUtc,
    mut apply: F,
) -> Result<CardWrite, StoreError>
where
    S: CardStore + ?Sized,
    F: FnMut(Option<Card>) -> anyhow::Result<Card>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let current = store.get(subject)?;
        let expected_version = current.as_ref().map_or(0, Card::version);
        let next = apply(current)?;
        if next.subject() != subject {
            return Err(StoreError::Backend(anyhow!(
                "card update changed subject from {subject} to {}",
                next.subject()
            )));
        }
        match store.upsert(&next, expected_version) {
            Ok(card) => {
                let today = as_of.date();
                let needs_revalidation = card
                    .fields()
                    .iter()
                    .filter(|(_, field)| field.is_expired(today))
                    .map(|(key, _)| key.clone())
                    .collect();
                return Ok(CardWrite {
                    card,
                    attempts: attempt,
                    needs_revalidation,
                });
            }
            Err(StoreError::VersionConflict(_)) if attempt < max_attempts => {}
            Err(err) => return Err(err),
        }
    }
}
