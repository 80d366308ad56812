//! SQLite storage layer.
//!
//! Durable store: one case row per case carrying the version counter, plus
//! append-only history and sweep tables. The compare-and-set is a
//! version-guarded UPDATE checked through `rows_affected`. A single pooled
//! connection: SQLite takes one writer at a time anyway, and one connection
//! keeps `sqlite::memory:` databases coherent across calls.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::history::{Actor, HistoryEntry, NewHistoryEntry, StatePoint, SweepRun};
use crate::model::{Case, CaseId, Lease, OperatorId, Provenance};
use crate::pipeline::Stage;

use super::{CaseStore, CaseUpdate, LeaseChange};

const CASE_COLUMNS: &str =
    "id, reference, source, trigger_, payload, stage, holder, leased_at, expires_at, \
     version, created_at, updated_at";

const HISTORY_COLUMNS: &str =
    "seq, case_id, actor, action, from_stage, from_holder, to_stage, to_holder, at, note";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS cases (
        id          TEXT PRIMARY KEY,
        reference   TEXT NOT NULL,
        source      TEXT NOT NULL,
        trigger_    TEXT,
        payload     TEXT NOT NULL DEFAULT 'null',
        stage       TEXT NOT NULL,
        holder      TEXT,
        leased_at   TEXT,
        expires_at  TEXT,
        version     INTEGER NOT NULL DEFAULT 0,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL,
        CHECK ((holder IS NULL) = (leased_at IS NULL)
           AND (leased_at IS NULL) = (expires_at IS NULL))
    )",
    "CREATE INDEX IF NOT EXISTS idx_cases_stage ON cases(stage)",
    "CREATE INDEX IF NOT EXISTS idx_cases_expiry ON cases(expires_at)
        WHERE expires_at IS NOT NULL",
    "CREATE TABLE IF NOT EXISTS history (
        seq         INTEGER PRIMARY KEY AUTOINCREMENT,
        case_id     TEXT NOT NULL REFERENCES cases(id),
        actor       TEXT NOT NULL,
        action      TEXT NOT NULL,
        from_stage  TEXT NOT NULL,
        from_holder TEXT,
        to_stage    TEXT NOT NULL,
        to_holder   TEXT,
        at          TEXT NOT NULL,
        note        TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_history_case ON history(case_id, seq)",
    "CREATE TABLE IF NOT EXISTS sweep_runs (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        started_at  TEXT NOT NULL,
        duration_ms INTEGER NOT NULL,
        processed   INTEGER NOT NULL,
        expired     INTEGER NOT NULL,
        errors      INTEGER NOT NULL,
        trigger_    TEXT NOT NULL
    )",
];

/// Durable case store. Owns the connection pool.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub async fn open(path: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        Self::with_options(opts).await
    }

    /// Create an in-memory database (for testing).
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::with_options(opts).await
    }

    async fn with_options(opts: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn fetch_cases(&self, sql: &str, binds: Vec<Bind>) -> Result<Vec<Case>> {
        let mut query = sqlx::query_as::<_, CaseRow>(sql);
        for bind in binds {
            query = match bind {
                Bind::Text(s) => query.bind(s),
                Bind::Time(t) => query.bind(t),
                Bind::Int(n) => query.bind(n),
            };
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(CaseRow::try_into_case).collect()
    }
}

enum Bind {
    Text(String),
    Time(DateTime<Utc>),
    Int(i64),
}

#[async_trait]
impl CaseStore for SqliteStore {
    async fn insert_case(&self, case: Case) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO cases (id, reference, source, trigger_, payload, stage,
                                holder, leased_at, expires_at, version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(case.id.0.to_string())
        .bind(&case.reference)
        .bind(&case.provenance.source)
        .bind(case.provenance.trigger.as_deref())
        .bind(case.payload.to_string())
        .bind(case.stage.to_string())
        .bind(case.holder().map(|h| h.to_string()))
        .bind(case.lease.as_ref().map(|l| l.leased_at))
        .bind(case.lease.as_ref().map(|l| l.expires_at))
        .bind(case.version as i64)
        .bind(case.created_at)
        .bind(case.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(insert_error(e, case.id)),
        }
    }

    async fn get(&self, id: CaseId) -> Result<Case> {
        let sql = format!("SELECT {CASE_COLUMNS} FROM cases WHERE id = ?1");
        let row: Option<CaseRow> = sqlx::query_as(&sql)
            .bind(id.0.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| Error::NotFound(id.to_string()))?
            .try_into_case()
    }

    async fn update_if(
        &self,
        id: CaseId,
        expected_version: u64,
        update: CaseUpdate,
        entries: Vec<NewHistoryEntry>,
        now: DateTime<Utc>,
    ) -> Result<Case> {
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {CASE_COLUMNS} FROM cases WHERE id = ?1");
        let row: Option<CaseRow> = sqlx::query_as(&sql)
            .bind(id.0.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let current = row
            .ok_or_else(|| Error::NotFound(id.to_string()))?
            .try_into_case()?;

        if current.version != expected_version {
            return Err(Error::Conflict {
                case: id.to_string(),
                detail: format!(
                    "expected version {expected_version}, found {}",
                    current.version
                ),
            });
        }

        let stage = update.stage.unwrap_or(current.stage);
        let lease = match update.lease {
            LeaseChange::Keep => current.lease.clone(),
            LeaseChange::Clear => None,
            LeaseChange::Grant(lease) => Some(lease),
        };

        let rows_affected = sqlx::query(
            "UPDATE cases SET stage = ?1, holder = ?2, leased_at = ?3, expires_at = ?4,
                              version = version + 1, updated_at = ?5
             WHERE id = ?6 AND version = ?7",
        )
        .bind(stage.to_string())
        .bind(lease.as_ref().map(|l| l.holder.to_string()))
        .bind(lease.as_ref().map(|l| l.leased_at))
        .bind(lease.as_ref().map(|l| l.expires_at))
        .bind(now)
        .bind(id.0.to_string())
        .bind(expected_version as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // raced between read and write; dropping the tx rolls back
            return Err(Error::Conflict {
                case: id.to_string(),
                detail: "version changed concurrently".to_string(),
            });
        }

        for entry in &entries {
            sqlx::query(
                "INSERT INTO history (case_id, actor, action, from_stage, from_holder,
                                      to_stage, to_holder, at, note)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .bind(id.0.to_string())
            .bind(entry.actor.to_string())
            .bind(entry.action.to_string())
            .bind(entry.from.stage.to_string())
            .bind(entry.from.holder.as_ref().map(|h| h.to_string()))
            .bind(entry.to.stage.to_string())
            .bind(entry.to.holder.as_ref().map(|h| h.to_string()))
            .bind(now)
            .bind(entry.note.as_deref())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(Case {
            stage,
            lease,
            version: expected_version + 1,
            updated_at: now,
            ..current
        })
    }

    async fn list_available(&self, stage: Option<Stage>, now: DateTime<Utc>) -> Result<Vec<Case>> {
        match stage {
            Some(stage) => {
                let sql = format!(
                    "SELECT {CASE_COLUMNS} FROM cases
                     WHERE (holder IS NULL OR expires_at <= ?1) AND stage = ?2
                     ORDER BY created_at ASC"
                );
                self.fetch_cases(&sql, vec![Bind::Time(now), Bind::Text(stage.to_string())])
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {CASE_COLUMNS} FROM cases
                     WHERE holder IS NULL OR expires_at <= ?1
                     ORDER BY created_at ASC"
                );
                self.fetch_cases(&sql, vec![Bind::Time(now)]).await
            }
        }
    }

    async fn list_held_by(&self, holder: &OperatorId, now: DateTime<Utc>) -> Result<Vec<Case>> {
        let sql = format!(
            "SELECT {CASE_COLUMNS} FROM cases
             WHERE holder = ?1 AND expires_at > ?2
             ORDER BY leased_at ASC"
        );
        self.fetch_cases(&sql, vec![Bind::Text(holder.to_string()), Bind::Time(now)])
            .await
    }

    async fn list_by_stage(&self, stage: Stage) -> Result<Vec<Case>> {
        let sql = format!(
            "SELECT {CASE_COLUMNS} FROM cases WHERE stage = ?1 ORDER BY created_at ASC"
        );
        self.fetch_cases(&sql, vec![Bind::Text(stage.to_string())])
            .await
    }

    async fn list_expiring_within(
        &self,
        now: DateTime<Utc>,
        horizon: Duration,
    ) -> Result<Vec<Case>> {
        let sql = format!(
            "SELECT {CASE_COLUMNS} FROM cases
             WHERE expires_at > ?1 AND expires_at <= ?2
             ORDER BY expires_at ASC"
        );
        self.fetch_cases(&sql, vec![Bind::Time(now), Bind::Time(now + horizon)])
            .await
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Case>> {
        let sql = format!(
            "SELECT {CASE_COLUMNS} FROM cases
             WHERE expires_at IS NOT NULL AND expires_at <= ?1
             ORDER BY expires_at ASC"
        );
        self.fetch_cases(&sql, vec![Bind::Time(now)]).await
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Case>> {
        let sql = format!(
            "SELECT {CASE_COLUMNS} FROM cases ORDER BY updated_at DESC LIMIT ?1"
        );
        self.fetch_cases(&sql, vec![Bind::Int(limit as i64)]).await
    }

    async fn history(&self, id: CaseId) -> Result<Vec<HistoryEntry>> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM history WHERE case_id = ?1 ORDER BY seq ASC"
        );
        let rows: Vec<HistoryRow> = sqlx::query_as(&sql)
            .bind(id.0.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(HistoryRow::try_into_entry).collect()
    }

    async fn events_since(&self, seq: u64) -> Result<Vec<HistoryEntry>> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM history WHERE seq > ?1 ORDER BY seq ASC"
        );
        let rows: Vec<HistoryRow> = sqlx::query_as(&sql)
            .bind(seq as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(HistoryRow::try_into_entry).collect()
    }

    async fn record_sweep(&self, run: SweepRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO sweep_runs (started_at, duration_ms, processed, expired, errors, trigger_)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(run.started_at)
        .bind(run.duration_ms as i64)
        .bind(run.processed as i64)
        .bind(run.expired as i64)
        .bind(run.errors as i64)
        .bind(run.trigger.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sweep_runs(&self, limit: usize) -> Result<Vec<SweepRun>> {
        let rows: Vec<SweepRow> = sqlx::query_as(
            "SELECT started_at, duration_ms, processed, expired, errors, trigger_
             FROM sweep_runs ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SweepRow::try_into_run).collect()
    }
}

fn insert_error(e: sqlx::Error, id: CaseId) -> Error {
    if let sqlx::Error::Database(db) = &e {
        if db.kind() == sqlx::error::ErrorKind::UniqueViolation {
            return Error::Conflict {
                case: id.to_string(),
                detail: "case id already exists".to_string(),
            };
        }
    }
    e.into()
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct CaseRow {
    id: String,
    reference: String,
    source: String,
    trigger_: Option<String>,
    payload: String,
    stage: String,
    holder: Option<String>,
    leased_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CaseRow {
    fn try_into_case(self) -> Result<Case> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| Error::StoreUnavailable(format!("bad case id in row: {e}")))?;
        let stage: Stage = self.stage.parse().map_err(Error::StoreUnavailable)?;

        let lease = match (self.holder, self.leased_at, self.expires_at) {
            (Some(holder), Some(leased_at), Some(expires_at)) => Some(Lease {
                holder: OperatorId::new(holder),
                leased_at,
                expires_at,
            }),
            (None, None, None) => None,
            // the table CHECK rules this out
            _ => {
                return Err(Error::StoreUnavailable(
                    "case row with partial lease columns".to_string(),
                ));
            }
        };

        Ok(Case {
            id: CaseId(id),
            reference: self.reference,
            provenance: Provenance {
                source: self.source,
                trigger: self.trigger_,
            },
            payload: serde_json::from_str(&self.payload).unwrap_or(serde_json::Value::Null),
            stage,
            lease,
            version: self.version as u64,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    seq: i64,
    case_id: String,
    actor: String,
    action: String,
    from_stage: String,
    from_holder: Option<String>,
    to_stage: String,
    to_holder: Option<String>,
    at: DateTime<Utc>,
    note: Option<String>,
}

impl HistoryRow {
    fn try_into_entry(self) -> Result<HistoryEntry> {
        let case_id = Uuid::parse_str(&self.case_id)
            .map_err(|e| Error::StoreUnavailable(format!("bad case id in history row: {e}")))?;
        let from_stage: Stage = self.from_stage.parse().map_err(Error::StoreUnavailable)?;
        let to_stage: Stage = self.to_stage.parse().map_err(Error::StoreUnavailable)?;

        Ok(HistoryEntry {
            seq: self.seq as u64,
            case_id: CaseId(case_id),
            actor: Actor::from_label(&self.actor),
            action: self.action.parse().map_err(Error::StoreUnavailable)?,
            from: StatePoint::new(from_stage, self.from_holder.map(OperatorId::new)),
            to: StatePoint::new(to_stage, self.to_holder.map(OperatorId::new)),
            at: self.at,
            note: self.note,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SweepRow {
    started_at: DateTime<Utc>,
    duration_ms: i64,
    processed: i64,
    expired: i64,
    errors: i64,
    trigger_: String,
}

impl SweepRow {
    fn try_into_run(self) -> Result<SweepRun> {
        Ok(SweepRun {
            started_at: self.started_at,
            duration_ms: self.duration_ms as u64,
            processed: self.processed as u64,
            expired: self.expired as u64,
            errors: self.errors as u64,
            trigger: self.trigger_.parse().map_err(Error::StoreUnavailable)?,
        })
    }
}
