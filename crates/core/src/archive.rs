//! Study archive: the shared relational store.
//!
//! One database per breeder holds every study of that breeder (one per
//! sampler when running parallel workers). Workers in separate processes
//! open the same database; WAL mode plus a busy timeout covers the write
//! concurrency the worker loop produces, and `user_attrs` writes are
//! last-writer-wins as the coordination protocol expects.

use crate::config::Direction;
use crate::error::{Error, Result};
use crate::params::ParamAssignment;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Connection settings for the archive, from the `GODON_ARCHIVE_DB_*`
/// environment. User/password/host/port identify the archive service in
/// deployments with a server-backed store; the embedded backend only needs
/// the directory.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: String,
    pub directory: PathBuf,
}

impl ArchiveConfig {
    pub fn from_env() -> Self {
        Self {
            user: env::var("GODON_ARCHIVE_DB_USER").unwrap_or_else(|_| "postgres".into()),
            password: env::var("GODON_ARCHIVE_DB_PASSWORD").unwrap_or_else(|_| "postgres".into()),
            host: env::var("GODON_ARCHIVE_DB_SERVICE_HOST").unwrap_or_else(|_| "localhost".into()),
            port: env::var("GODON_ARCHIVE_DB_SERVICE_PORT").unwrap_or_else(|_| "5432".into()),
            directory: env::var("GODON_ARCHIVE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Database file for one breeder's archive.
    pub fn database_path(&self, db_name: &str) -> PathBuf {
        self.directory.join(format!("{db_name}.db"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialState {
    Running,
    Complete,
    Failed,
    Pruned,
}

impl TrialState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Pruned => "pruned",
        }
    }

    fn from_str(value: &str) -> Self {
        match value {
            "complete" => Self::Complete,
            "failed" => Self::Failed,
            "pruned" => Self::Pruned,
            _ => Self::Running,
        }
    }
}

/// An immutable snapshot of a finished (or at least persisted) trial.
///
/// `origin_study`/`origin_number` preserve trial identity across studies so
/// that copying a trial into a peer study is idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrozenTrial {
    pub number: u64,
    pub state: TrialState,
    pub params: ParamAssignment,
    pub values: Option<Vec<f64>>,
    pub origin_study: String,
    pub origin_number: u64,
}

#[derive(Debug, Clone)]
pub struct StudyRecord {
    pub id: i64,
    pub name: String,
    pub directions: Vec<Direction>,
}

pub struct Archive {
    conn: Connection,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS studies (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    directions TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS trials (
    id INTEGER PRIMARY KEY,
    study_id INTEGER NOT NULL REFERENCES studies(id),
    number INTEGER NOT NULL,
    state TEXT NOT NULL,
    params TEXT NOT NULL DEFAULT '{}',
    origin_study TEXT NOT NULL,
    origin_number INTEGER NOT NULL,
    UNIQUE (study_id, number),
    UNIQUE (study_id, origin_study, origin_number)
);
CREATE TABLE IF NOT EXISTS trial_values (
    trial_id INTEGER NOT NULL REFERENCES trials(id),
    objective_index INTEGER NOT NULL,
    value REAL NOT NULL,
    PRIMARY KEY (trial_id, objective_index)
);
CREATE TABLE IF NOT EXISTS study_user_attrs (
    study_id INTEGER NOT NULL REFERENCES studies(id),
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (study_id, key)
);
";

impl Archive {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        let _: String = conn.pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// In-memory archive for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn open_from_env(config: &ArchiveConfig, db_name: &str) -> Result<Self> {
        let path = config.database_path(db_name);
        tracing::info!(
            archive = %path.display(),
            host = %config.host,
            port = %config.port,
            user = %config.user,
            "opening study archive"
        );
        Self::open(path)
    }

    pub fn load_study(&self, name: &str) -> Result<Option<StudyRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, directions FROM studies WHERE name = ?1",
                params![name],
                |row| {
                    let id: i64 = row.get(0)?;
                    let directions: String = row.get(1)?;
                    Ok((id, directions))
                },
            )
            .optional()?;

        match record {
            Some((id, directions)) => Ok(Some(StudyRecord {
                id,
                name: name.to_string(),
                directions: serde_json::from_str(&directions)?,
            })),
            None => Ok(None),
        }
    }

    pub fn create_or_load_study(
        &mut self,
        name: &str,
        directions: &[Direction],
    ) -> Result<StudyRecord> {
        if let Some(record) = self.load_study(name)? {
            return Ok(record);
        }
        let encoded = serde_json::to_string(directions)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO studies (name, directions) VALUES (?1, ?2)",
            params![name, encoded],
        )?;
        self.load_study(name)?
            .ok_or_else(|| Error::StudyNotFound(name.to_string()))
    }

    pub fn all_study_names(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT name FROM studies ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    /// Open a new running trial and return `(row_id, trial_number)`.
    pub fn begin_trial(&mut self, study_id: i64, study_name: &str) -> Result<(i64, u64)> {
        // Immediate: trial numbers are allocated under the write lock so two
        // workers on the same study cannot pick the same number.
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let number: i64 = tx.query_row(
            "SELECT COALESCE(MAX(number) + 1, 0) FROM trials WHERE study_id = ?1",
            params![study_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO trials (study_id, number, state, origin_study, origin_number)
             VALUES (?1, ?2, 'running', ?3, ?2)",
            params![study_id, number, study_name],
        )?;
        let row_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok((row_id, number as u64))
    }

    pub fn finish_trial(
        &mut self,
        trial_row: i64,
        assignment: &ParamAssignment,
        values: &[f64],
    ) -> Result<()> {
        let encoded = serde_json::to_string(assignment)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE trials SET state = 'complete', params = ?2 WHERE id = ?1",
            params![trial_row, encoded],
        )?;
        for (index, value) in values.iter().enumerate() {
            tx.execute(
                "INSERT OR REPLACE INTO trial_values (trial_id, objective_index, value)
                 VALUES (?1, ?2, ?3)",
                params![trial_row, index as i64, value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn fail_trial(&mut self, trial_row: i64, assignment: &ParamAssignment) -> Result<()> {
        let encoded = serde_json::to_string(assignment)?;
        self.conn.execute(
            "UPDATE trials SET state = 'failed', params = ?2 WHERE id = ?1",
            params![trial_row, encoded],
        )?;
        Ok(())
    }

    pub fn count_trials(&self, study_id: i64) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM trials WHERE study_id = ?1",
            params![study_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn trials(&self, study_id: i64) -> Result<Vec<FrozenTrial>> {
        self.query_trials(study_id, false)
    }

    /// Completed trials with values, ordered by trial number.
    pub fn completed_trials(&self, study_id: i64) -> Result<Vec<FrozenTrial>> {
        self.query_trials(study_id, true)
    }

    fn query_trials(&self, study_id: i64, completed_only: bool) -> Result<Vec<FrozenTrial>> {
        let filter = if completed_only {
            "AND state = 'complete'"
        } else {
            ""
        };
        let sql = format!(
            "SELECT id, number, state, params, origin_study, origin_number
             FROM trials WHERE study_id = ?1 {filter} ORDER BY number"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![study_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut values_stmt = self.conn.prepare(
            "SELECT value FROM trial_values WHERE trial_id = ?1 ORDER BY objective_index",
        )?;

        let mut trials = Vec::with_capacity(rows.len());
        for (row_id, number, state, raw_params, origin_study, origin_number) in rows {
            let state = TrialState::from_str(&state);
            let values = if state == TrialState::Complete {
                let collected = values_stmt
                    .query_map(params![row_id], |row| row.get::<_, f64>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Some(collected)
            } else {
                None
            };
            trials.push(FrozenTrial {
                number: number as u64,
                state,
                params: serde_json::from_str(&raw_params)?,
                values,
                origin_study,
                origin_number: origin_number as u64,
            });
        }
        Ok(trials)
    }

    /// Copy a frozen trial into another study.
    ///
    /// Identity is `(origin_study, origin_number)`; re-adding the same trial
    /// is a no-op. Returns whether a row was actually inserted.
    pub fn add_trial(&mut self, study_id: i64, trial: &FrozenTrial) -> Result<bool> {
        let encoded = serde_json::to_string(&trial.params)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let number: i64 = tx.query_row(
            "SELECT COALESCE(MAX(number) + 1, 0) FROM trials WHERE study_id = ?1",
            params![study_id],
            |row| row.get(0),
        )?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO trials
                 (study_id, number, state, params, origin_study, origin_number)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                study_id,
                number,
                trial.state.as_str(),
                encoded,
                trial.origin_study,
                trial.origin_number as i64
            ],
        )?;
        if inserted > 0 {
            if let Some(values) = &trial.values {
                let trial_row = tx.last_insert_rowid();
                for (index, value) in values.iter().enumerate() {
                    tx.execute(
                        "INSERT INTO trial_values (trial_id, objective_index, value)
                         VALUES (?1, ?2, ?3)",
                        params![trial_row, index as i64, value],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(inserted > 0)
    }

    pub fn set_user_attr(&mut self, study_id: i64, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO study_user_attrs (study_id, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (study_id, key) DO UPDATE SET value = excluded.value",
            params![study_id, key, value],
        )?;
        Ok(())
    }

    pub fn get_user_attr(&self, study_id: i64, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM study_user_attrs WHERE study_id = ?1 AND key = ?2",
                params![study_id, key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }
}
