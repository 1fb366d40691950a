#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use site_screener_domain::{
    format_rfc3339, hash_json, now_utc, parse_rfc3339_utc, RunId, RunRecord, RunStatus, RunSummary,
};
use site_screener_knowledge::{Card, SubjectKey};
use site_screener_store_core::{CardStore, RunStore, StoreError, VersionConflictError};
use ulid::Ulid;

const STORE_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cards (
  jurisdiction TEXT NOT NULL,
  asset_class TEXT NOT NULL,
  version INTEGER NOT NULL CHECK (version >= 1),
  schema_version INTEGER NOT NULL,
  envelope_complete INTEGER NOT NULL CHECK (envelope_complete IN (0,1)),
  card_complete INTEGER NOT NULL CHECK (card_complete IN (0,1)),
  card_json TEXT NOT NULL,
  card_hash TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (jurisdiction, asset_class)
);

CREATE TABLE IF NOT EXISTS card_history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  jurisdiction TEXT NOT NULL,
  asset_class TEXT NOT NULL,
  version INTEGER NOT NULL,
  card_json TEXT NOT NULL,
  card_hash TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  UNIQUE(jurisdiction, asset_class, version)
);

CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  phase_tag TEXT NOT NULL,
  phase_version TEXT NOT NULL,
  phase_hash TEXT NOT NULL,
  terminal_stage TEXT NOT NULL,
  created_at TEXT NOT NULL,
  as_of TEXT NOT NULL,
  finished_at TEXT NOT NULL,
  aggregate_status TEXT NOT NULL CHECK (aggregate_status IN ('complete','partial','failed')),
  engine_version TEXT NOT NULL,
  stages_total INTEGER NOT NULL,
  errors_total INTEGER NOT NULL,
  record_json TEXT NOT NULL,
  record_hash TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_card_history_subject ON card_history(jurisdiction, asset_class, version);
CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at, run_id);
CREATE INDEX IF NOT EXISTS idx_runs_phase ON runs(phase_tag, created_at);

CREATE TRIGGER IF NOT EXISTS trg_cards_no_delete
BEFORE DELETE ON cards
BEGIN
  SELECT RAISE(FAIL, 'cards are never deleted');
END;

CREATE TRIGGER IF NOT EXISTS trg_card_history_no_update
BEFORE UPDATE ON card_history
BEGIN
  SELECT RAISE(FAIL, 'card_history is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_card_history_no_delete
BEFORE DELETE ON card_history
BEGIN
  SELECT RAISE(FAIL, 'card_history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_runs_no_update
BEFORE UPDATE ON runs
BEGIN
  SELECT RAISE(FAIL, 'runs is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_runs_no_delete
BEFORE DELETE ON runs
BEGIN
  SELECT RAISE(FAIL, 'runs is append-only');
END;
";

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create a `SQLite` store database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Apply the schema. Safe to run repeatedly.
    ///
    /// # Errors
    /// Returns an error if the schema cannot be applied.
    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply store schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![STORE_SCHEMA_VERSION, now],
            )
            .context("failed to record store migration")?;
        Ok(())
    }

    fn stored_version(&self, subject: &SubjectKey) -> Result<u64> {
        let version: Option<i64> = self
            .conn
            .query_row(
                "SELECT version FROM cards WHERE jurisdiction = ?1 AND asset_class = ?2",
                params![subject.jurisdiction, subject.asset_class],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read card version")?;
        version.map_or(Ok(0), version_from_sql)
    }

    fn upsert_checked(
        &self,
        card: &Card,
        expected_version: u64,
    ) -> Result<std::result::Result<Card, VersionConflictError>> {
        let subject = card.subject();
        // Take the write lock before reading the version so a concurrent
        // commit shows up as a version mismatch, not a stale snapshot.
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("failed to begin card transaction")?;

        let actual = self.stored_version(subject)?;
        if actual != expected_version {
            return Ok(Err(VersionConflictError {
                subject: subject.clone(),
                expected: expected_version,
                actual,
            }));
        }

        let stored = card.clone().with_version(actual + 1);
        let card_json = serde_json::to_value(&stored)?;
        let card_hash = hash_json(&card_json)?;
        let card_text = serde_json::to_string(&card_json)?;
        let new_version = version_to_sql(stored.version())?;
        let updated_at = format_rfc3339(stored.updated_at())?;

        let changed = if expected_version == 0 {
            tx.execute(
                "INSERT INTO cards(
                    jurisdiction, asset_class, version, schema_version,
                    envelope_complete, card_complete, card_json, card_hash, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(jurisdiction, asset_class) DO NOTHING",
                params![
                    subject.jurisdiction,
                    subject.asset_class,
                    new_version,
                    i64::from(stored.schema_version()),
                    i64::from(stored.envelope_complete()),
                    i64::from(stored.card_complete()),
                    card_text,
                    card_hash,
                    updated_at,
                ],
            )
            .context("failed to insert card")?
        } else {
            tx.execute(
                "UPDATE cards SET
                    version = ?3, schema_version = ?4, envelope_complete = ?5,
                    card_complete = ?6, card_json = ?7, card_hash = ?8, updated_at = ?9
                 WHERE jurisdiction = ?1 AND asset_class = ?2 AND version = ?10",
                params![
                    subject.jurisdiction,
                    subject.asset_class,
                    new_version,
                    i64::from(stored.schema_version()),
                    i64::from(stored.envelope_complete()),
                    i64::from(stored.card_complete()),
                    card_text,
                    card_hash,
                    updated_at,
                    version_to_sql(expected_version)?,
                ],
            )
            .context("failed to update card")?
        };

        if changed != 1 {
            let actual = self.stored_version(subject)?;
            return Ok(Err(VersionConflictError {
                subject: subject.clone(),
                expected: expected_version,
                actual,
            }));
        }

        tx.execute(
            "INSERT INTO card_history(
                jurisdiction, asset_class, version, card_json, card_hash, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                subject.jurisdiction,
                subject.asset_class,
                new_version,
                card_text,
                card_hash,
                format_rfc3339(now_utc())?,
            ],
        )
        .context("failed to append card history")?;

        tx.commit().context("failed to commit card write")?;
        Ok(Ok(stored))
    }
}

impl CardStore for SqliteStore {
    fn get(&self, subject: &SubjectKey) -> std::result::Result<Option<Card>, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT card_json FROM cards WHERE jurisdiction = ?1 AND asset_class = ?2",
                params![subject.jurisdiction, subject.asset_class],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read card")?;
        Ok(raw.map(|text| parse_card(&text)).transpose()?)
    }

    fn upsert(&self, card: &Card, expected_version: u64) -> std::result::Result<Card, StoreError> {
        Ok(self.upsert_checked(card, expected_version)??)
    }

    fn history(&self, subject: &SubjectKey) -> std::result::Result<Vec<Card>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT card_json FROM card_history
                 WHERE jurisdiction = ?1 AND asset_class = ?2
                 ORDER BY version ASC",
            )
            .context("failed to prepare card history query")?;
        let mut rows = stmt
            .query(params![subject.jurisdiction, subject.asset_class])
            .context("failed to query card history")?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().context("failed to read card history row")? {
            let text: String = row.get(0).context("failed to read card_json")?;
            out.push(parse_card(&text)?);
        }
        Ok(out)
    }
}

impl RunStore for SqliteStore {
    fn insert_run(&self, run: &RunRecord) -> Result<()> {
        let record_json = serde_json::to_value(run)?;
        let record_hash = hash_json(&record_json)?;
        self.conn
            .execute(
                "INSERT INTO runs(
                    run_id, phase_tag, phase_version, phase_hash, terminal_stage,
                    created_at, as_of, finished_at, aggregate_status, engine_version,
                    stages_total, errors_total, record_json, record_hash
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    run.run_id.to_string(),
                    run.phase_tag,
                    run.phase_version,
                    run.phase_hash,
                    run.terminal_stage,
                    format_rfc3339(run.created_at)?,
                    format_rfc3339(run.as_of)?,
                    format_rfc3339(run.finished_at)?,
                    run.aggregate_status.as_str(),
                    run.engine_version,
                    i64::try_from(run.stage_results.len()).unwrap_or(i64::MAX),
                    i64::try_from(run.errors.len()).unwrap_or(i64::MAX),
                    serde_json::to_string(&record_json)?,
                    record_hash,
                ],
            )
            .context("failed to insert run")?;
        Ok(())
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT record_json FROM runs WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read run")?;
        raw.map(|text| serde_json::from_str(&text).context("invalid record_json"))
            .transpose()
    }

    fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, phase_tag, created_at, aggregate_status, stages_total, errors_total
             FROM runs
             ORDER BY created_at ASC, run_id ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();

        while let Some(row) = rows.next()? {
            let run_id_str: String = row.get(0)?;
            out.push(RunSummary {
                run_id: parse_run_id(&run_id_str)?,
                phase_tag: row.get(1)?,
                created_at: parse_rfc3339_utc(&row.get::<_, String>(2)?)?,
                aggregate_status: parse_run_status(&row.get::<_, String>(3)?)?,
                stages_total: count_from_sql(row.get::<_, i64>(4)?)?,
                errors_total: count_from_sql(row.get::<_, i64>(5)?)?,
            });
        }

        Ok(out)
    }
}

fn parse_card(text: &str) -> Result<Card> {
    serde_json::from_str(text).context("invalid card_json")
}

fn parse_run_id(value: &str) -> Result<RunId> {
    let ulid = Ulid::from_str(value).map_err(|err| anyhow!("invalid run_id ULID: {err}"))?;
    Ok(RunId(ulid))
}

fn parse_run_status(value: &str) -> Result<RunStatus> {
    RunStatus::parse(value).ok_or_else(|| anyhow!("invalid aggregate_status: {value}"))
}

fn version_to_sql(version: u64) -> Result<i64> {
    i64::try_from(version).map_err(|_| anyhow!("card version {version} exceeds sqlite range"))
}

fn version_from_sql(version: i64) -> Result<u64> {
    u64::try_from(version).map_err(|_| anyhow!("invalid stored card version {version}"))
}

fn count_from_sql(value: i64) -> Result<usize> {
    usize::try_from(value).map_err(|_| anyhow!("invalid stored count {value}"))
}

#[cfg(test)]
mod tests {
    use super::SqliteStore;
    use serde_json::json;
    use site_screener_domain::{RunId, RunRecord, RunStatus, StageErrorKind, StageResult};
    use site_screener_knowledge::{
        AuthorityScope, Card, CardSchema, KnowledgeField, Provenance, SourceType, SubjectKey,
    };
    use site_screener_store_core::{
        write_card_with_retry, CardStore, RunStore, StoreError,
    };
    use time::macros::datetime;
    use ulid::Ulid;

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "site-screener-store-test-{}-{}.sqlite",
            name,
            Ulid::new()
        ))
    }

    fn open_store(name: &str) -> SqliteStore {
        let store = SqliteStore::open(&temp_db_path(name));
        assert!(store.is_ok());
        let store = store.unwrap_or_else(|_| unreachable!());
        assert!(store.migrate().is_ok());
        store
    }

    fn subject() -> SubjectKey {
        SubjectKey::new("travis-county-tx", "self_storage")
    }

    fn fresh_card() -> Card {
        let schema = CardSchema {
            schema_version: 1,
            required_for_envelope: vec!["front_setback_ft".to_string()],
            informational: Vec::new(),
        };
        Card::initialize(subject(), &schema, datetime!(2026-05-01 00:00 UTC))
            .unwrap_or_else(|_| unreachable!())
    }

    fn with_setback(card: &Card, feet: u32) -> Card {
        let mut next = card.clone();
        let field = KnowledgeField::known_at(
            feet,
            Provenance::new(SourceType::Ordinance, "Sec. 4", AuthorityScope::County),
            datetime!(2026-05-02 00:00 UTC),
        )
        .unwrap_or_else(|_| unreachable!());
        assert!(next
            .set_field("front_setback_ft", field, datetime!(2026-05-02 00:00 UTC))
            .is_ok());
        next
    }

    fn fixture_run(seq: u128, status: RunStatus) -> RunRecord {
        let now = datetime!(2026-05-01 00:00 UTC);
        RunRecord {
            run_id: RunId(Ulid::from_parts(0, seq)),
            phase_tag: "pass1".to_string(),
            phase_version: "v1".to_string(),
            phase_hash: "hash".to_string(),
            terminal_stage: "summary".to_string(),
            created_at: now,
            as_of: now,
            finished_at: now,
            engine_version: "test".to_string(),
            input: json!({"zip": "99999"}),
            stage_results: vec![
                StageResult::error("population", StageErrorKind::Timeout, "timed out", now),
                StageResult::ok("summary", json!({"score": 3}), now),
            ],
            aggregate_status: status,
            errors: vec!["population failed: timed out".to_string()],
        }
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = open_store("migrate");
        assert!(store.migrate().is_ok());
    }

    #[test]
    fn optimistic_upsert_rejects_stale_writers() {
        let store = open_store("optimistic");
        let v1 = store.upsert(&fresh_card(), 0);
        assert!(v1.is_ok());
        let v1 = v1.unwrap_or_else(|_| unreachable!());
        assert_eq!(v1.version(), 1);

        let a = store.upsert(&with_setback(&v1, 25), 1);
        assert!(a.is_ok());
        let a = a.unwrap_or_else(|_| unreachable!());

        let stale = store.upsert(&with_setback(&v1, 40), 1);
        assert!(matches!(stale, Err(StoreError::VersionConflict(ref err)) if err.actual == 2));

        let current = store.get(&subject());
        assert!(matches!(current, Ok(Some(ref card)) if card == &a));

        let history = store.history(&subject());
        assert!(matches!(history, Ok(ref versions) if versions.len() == 2));

        assert!(store
            .upsert(&fresh_card(), 0)
            .is_err_and(|err| err.is_version_conflict()));
    }

    #[test]
    fn concurrent_connections_converge_through_retries() {
        let path = temp_db_path("concurrent");
        let seed = SqliteStore::open(&path).unwrap_or_else(|err| panic!("open: {err:#}"));
        assert!(seed.migrate().is_ok());
        assert!(seed.upsert(&fresh_card(), 0).is_ok());

        let writers = 4_u32;
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..writers)
                .map(|writer| {
                    let path = path.clone();
                    scope.spawn(move || {
                        let store =
                            SqliteStore::open(&path).unwrap_or_else(|err| panic!("open: {err:#}"));
                        write_card_with_retry(
                            &store,
                            &subject(),
                            writers * 4,
                            datetime!(2026-05-03 00:00 UTC),
                            |current| Ok(with_setback(&current.unwrap_or_else(fresh_card), 20 + writer)),
                        )
                    })
                })
                .collect();
            for handle in handles {
                let write = handle
                    .join()
                    .unwrap_or_else(|_| panic!("writer thread panicked"));
                assert!(
                    matches!(write, Ok(ref write) if write.attempts >= 1),
                    "writer failed: {write:?}"
                );
            }
        });

        let current = seed.get(&subject());
        assert!(matches!(current, Ok(Some(ref card)) if card.version() == 5));
        let history = seed.history(&subject());
        assert!(matches!(history, Ok(ref versions) if versions.len() == 5));
    }

    #[test]
    fn card_history_is_append_only() {
        let store = open_store("history");
        assert!(store.upsert(&fresh_card(), 0).is_ok());
        let mutated = store
            .conn
            .execute("UPDATE card_history SET card_hash = 'x'", []);
        assert!(mutated.is_err());
        let deleted = store.conn.execute("DELETE FROM cards", []);
        assert!(deleted.is_err());
    }

    #[test]
    fn retry_helper_works_over_sqlite() {
        let store = open_store("retry");
        let write = write_card_with_retry(
            &store,
            &subject(),
            3,
            datetime!(2026-05-03 00:00 UTC),
            |current| Ok(with_setback(&current.unwrap_or_else(fresh_card), 30)),
        );
        assert!(matches!(write, Ok(ref write) if write.card.version() == 1 && write.attempts == 1));
    }

    #[test]
    fn runs_round_trip_and_are_immutable() {
        let store = open_store("runs");
        let run = fixture_run(1, RunStatus::Partial);
        assert!(store.insert_run(&run).is_ok());
        assert!(store.insert_run(&run).is_err());

        let loaded = store.get_run(run.run_id);
        assert!(matches!(loaded, Ok(Some(ref record)) if record == &run));

        let listed = store.list_runs();
        assert!(matches!(
            listed,
            Ok(ref summaries) if summaries.len() == 1
                && summaries[0].aggregate_status == RunStatus::Partial
                && summaries[0].errors_total == 1
        ));

        let mutated = store
            .conn
            .execute("UPDATE runs SET aggregate_status = 'complete'", []);
        assert!(mutated.is_err());
    }
}
