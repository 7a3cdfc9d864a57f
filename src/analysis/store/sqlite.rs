use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use doc_analyser_common::{
    Job, JobId, JobReport, JobStatus, UseCaseRecord, UseCaseSpec, UseCaseUpdate,
};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::JobStore;
use crate::errors::StoreError;

fn db_err(e: impl Into<anyhow::Error>) -> StoreError {
    StoreError::Database(e.into())
}

/// Async-safe handle to the job database.
///
/// Wraps `JobDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`. The mutex is also what makes
/// each read-modify-write below atomic.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<JobDb>>,
}

impl DbHandle {
    pub fn new(db: JobDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&JobDb) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| db_err(anyhow!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| db_err(anyhow!("DB task panicked: {}", e)))?
    }
}

pub struct JobDb {
    conn: Connection,
}

const JOB_COLUMNS: &str = "id, status, repository_url, branch, include_folders, project_id, \
     error, transitions, report, created_at, updated_at";

const USE_CASE_COLUMNS: &str = "idx, name, description, success_criteria, difficulty, \
     documentation_source, status, started_at, ended_at, execution_time_seconds, \
     container_logs, code_file, result_file, error";

struct JobRow {
    id: String,
    status: String,
    repository_url: String,
    branch: String,
    include_folders: String,
    project_id: Option<String>,
    error: Option<String>,
    transitions: String,
    report: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            repository_url: row.get(2)?,
            branch: row.get(3)?,
            include_folders: row.get(4)?,
            project_id: row.get(5)?,
            error: row.get(6)?,
            transitions: row.get(7)?,
            report: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_job(self, use_cases: Vec<UseCaseRecord>) -> Result<Job, StoreError> {
        Ok(Job {
            id: self.id.parse().map_err(db_err)?,
            status: self.status.parse::<JobStatus>().map_err(|e| db_err(anyhow!(e)))?,
            repository_url: self.repository_url,
            branch: self.branch,
            include_folders: serde_json::from_str(&self.include_folders)?,
            project_id: self.project_id,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            use_cases,
            error: self.error,
            transitions: serde_json::from_str(&self.transitions)?,
            report: self
                .report
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    }
}

struct UseCaseRow {
    index: i64,
    name: String,
    description: String,
    success_criteria: String,
    difficulty: String,
    documentation_source: String,
    status: String,
    started_at: Option<String>,
    ended_at: Option<String>,
    execution_time_seconds: Option<f64>,
    container_logs: Option<String>,
    code_file: Option<String>,
    result_file: Option<String>,
    error: Option<String>,
}

impl UseCaseRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            index: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            success_criteria: row.get(3)?,
            difficulty: row.get(4)?,
            documentation_source: row.get(5)?,
            status: row.get(6)?,
            started_at: row.get(7)?,
            ended_at: row.get(8)?,
            execution_time_seconds: row.get(9)?,
            container_logs: row.get(10)?,
            code_file: row.get(11)?,
            result_file: row.get(12)?,
            error: row.get(13)?,
        })
    }

    fn into_record(self) -> Result<UseCaseRecord, StoreError> {
        Ok(UseCaseRecord {
            index: usize::try_from(self.index).map_err(db_err)?,
            spec: UseCaseSpec {
                name: self.name,
                description: self.description,
                success_criteria: serde_json::from_str(&self.success_criteria)?,
                difficulty_level: self.difficulty.parse().map_err(|e: String| db_err(anyhow!(e)))?,
                documentation_source: serde_json::from_str(&self.documentation_source)?,
            },
            status: self.status.parse().map_err(|e: String| db_err(anyhow!(e)))?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            ended_at: self.ended_at.as_deref().map(parse_ts).transpose()?,
            execution_time_seconds: self.execution_time_seconds,
            container_logs: self.container_logs,
            code_file: self.code_file,
            result_file: self.result_file,
            error: self.error,
        })
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in job store: {}", raw))
        .map_err(StoreError::Database)
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339()
}

impl JobDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    status TEXT NOT NULL DEFAULT 'pending',
                    repository_url TEXT NOT NULL,
                    branch TEXT NOT NULL,
                    include_folders TEXT NOT NULL DEFAULT '[]',
                    project_id TEXT,
                    error TEXT,
                    transitions TEXT NOT NULL DEFAULT '[]',
                    report TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS use_cases (
                    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    idx INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    success_criteria TEXT NOT NULL DEFAULT '[]',
                    difficulty TEXT NOT NULL DEFAULT 'intermediate',
                    documentation_source TEXT NOT NULL DEFAULT '[]',
                    status TEXT NOT NULL DEFAULT 'pending',
                    started_at TEXT,
                    ended_at TEXT,
                    execution_time_seconds REAL,
                    container_logs TEXT,
                    code_file TEXT,
                    result_file TEXT,
                    error TEXT,
                    PRIMARY KEY (job_id, idx)
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_project ON jobs(project_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at);
                ",
            )
            .context("Failed to run migrations")?;
        Ok(())
    }

    pub fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction().map_err(db_err)?;
        tx.execute(
            &format!(
                "INSERT OR REPLACE INTO jobs ({JOB_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                job.id.to_string(),
                job.status.as_str(),
                job.repository_url,
                job.branch,
                serde_json::to_string(&job.include_folders)?,
                job.project_id,
                job.error,
                serde_json::to_string(&job.transitions)?,
                job.report.as_ref().map(serde_json::to_string).transpose()?,
                ts(&job.created_at),
                ts(&job.updated_at),
            ],
        )
        .map_err(db_err)?;
        write_use_cases(&tx, job.id, &job.use_cases)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
                JobRow::read,
            )
            .optional()
            .map_err(db_err)?;
        match row {
            Some(row) => {
                let use_cases = self.get_use_cases(id)?;
                Ok(Some(row.into_job(use_cases)?))
            }
            None => Ok(None),
        }
    }

    fn get_use_cases(&self, id: JobId) -> Result<Vec<UseCaseRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {USE_CASE_COLUMNS} FROM use_cases WHERE job_id = ?1 ORDER BY idx"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![id.to_string()], UseCaseRow::read)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        rows.into_iter().map(UseCaseRow::into_record).collect()
    }

    pub fn update_use_case(
        &self,
        id: JobId,
        index: usize,
        update: &UseCaseUpdate,
    ) -> Result<UseCaseRecord, StoreError> {
        let tx = self.conn.unchecked_transaction().map_err(db_err)?;
        ensure_open(&tx, id)?;

        let row = tx
            .query_row(
                &format!(
                    "SELECT {USE_CASE_COLUMNS} FROM use_cases WHERE job_id = ?1 AND idx = ?2"
                ),
                params![id.to_string(), index as i64],
                UseCaseRow::read,
            )
            .optional()
            .map_err(db_err)?
            .ok_or(StoreError::UseCaseNotFound { job_id: id, index })?;

        let mut record = row.into_record()?;
        if record.apply(update) {
            tx.execute(
                "UPDATE use_cases SET status = ?3, started_at = ?4, ended_at = ?5, \
                 execution_time_seconds = ?6, container_logs = ?7, code_file = ?8, \
                 result_file = ?9, error = ?10 WHERE job_id = ?1 AND idx = ?2",
                params![
                    id.to_string(),
                    index as i64,
                    record.status.as_str(),
                    record.started_at.as_ref().map(ts),
                    record.ended_at.as_ref().map(ts),
                    record.execution_time_seconds,
                    record.container_logs,
                    record.code_file,
                    record.result_file,
                    record.error,
                ],
            )
            .map_err(db_err)?;
            tx.execute(
                "UPDATE jobs SET updated_at = ?2 WHERE id = ?1",
                params![id.to_string(), ts(&Utc::now())],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(record)
    }

    pub fn transition(
        &self,
        id: JobId,
        to: JobStatus,
        reason: Option<String>,
    ) -> Result<Job, StoreError> {
        let mut job = self.get_job(id)?.ok_or(StoreError::JobNotFound(id))?;
        job.transition(to, reason)?;
        self.conn
            .execute(
                "UPDATE jobs SET status = ?2, error = ?3, transitions = ?4, updated_at = ?5 \
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    job.status.as_str(),
                    job.error,
                    serde_json::to_string(&job.transitions)?,
                    ts(&job.updated_at),
                ],
            )
            .map_err(db_err)?;
        Ok(job)
    }

    pub fn replace_use_cases(
        &self,
        id: JobId,
        records: &[UseCaseRecord],
    ) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction().map_err(db_err)?;
        ensure_open(&tx, id)?;
        tx.execute(
            "UPDATE jobs SET updated_at = ?2 WHERE id = ?1",
            params![id.to_string(), ts(&Utc::now())],
        )
        .map_err(db_err)?;
        write_use_cases(&tx, id, records)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn set_report(&self, id: JobId, report: &JobReport) -> Result<(), StoreError> {
        ensure_open(&self.conn, id)?;
        self.conn
            .execute(
                "UPDATE jobs SET report = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), serde_json::to_string(report)?, ts(&Utc::now())],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], JobRow::read)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let id: JobId = row.id.parse().map_err(db_err)?;
            let use_cases = self.get_use_cases(id)?;
            jobs.push(row.into_job(use_cases)?);
        }
        Ok(jobs)
    }

    pub fn delete_job(&self, id: JobId) -> Result<bool, StoreError> {
        let deleted = self
            .conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![id.to_string()])
            .map_err(db_err)?;
        Ok(deleted > 0)
    }
}

/// Fails unless the job exists and has not reached a terminal status.
fn ensure_open(conn: &Connection, id: JobId) -> Result<(), StoreError> {
    let status: String = conn
        .query_row(
            "SELECT status FROM jobs WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?
        .ok_or(StoreError::JobNotFound(id))?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|e| db_err(anyhow!(e)))?;
    if status.is_terminal() {
        return Err(StoreError::JobFinished { id, status });
    }
    Ok(())
}

fn write_use_cases(
    conn: &Connection,
    id: JobId,
    records: &[UseCaseRecord],
) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM use_cases WHERE job_id = ?1",
        params![id.to_string()],
    )
    .map_err(db_err)?;
    let mut stmt = conn
        .prepare(&format!(
            "INSERT INTO use_cases (job_id, {USE_CASE_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        ))
        .map_err(db_err)?;
    for record in records {
        stmt.execute(params![
            id.to_string(),
            record.index as i64,
            record.spec.name,
            record.spec.description,
            serde_json::to_string(&record.spec.success_criteria)?,
            record.spec.difficulty_level.as_str(),
            serde_json::to_string(&record.spec.documentation_source)?,
            record.status.as_str(),
            record.started_at.as_ref().map(ts),
            record.ended_at.as_ref().map(ts),
            record.execution_time_seconds,
            record.container_logs,
            record.code_file,
            record.result_file,
            record.error,
        ])
        .map_err(db_err)?;
    }
    Ok(())
}

/// `JobStore` backed by SQLite.
#[derive(Clone)]
pub struct SqliteJobStore {
    db: DbHandle,
}

impl SqliteJobStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(Self {
            db: DbHandle::new(JobDb::new(path)?),
        })
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Ok(Self {
            db: DbHandle::new(JobDb::new_in_memory()?),
        })
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.db.call(move |db| db.get_job(id)).await
    }

    async fn put(&self, job: &Job) -> Result<(), StoreError> {
        let job = job.clone();
        self.db.call(move |db| db.insert_job(&job)).await
    }

    async fn update_use_case(
        &self,
        id: JobId,
        index: usize,
        update: UseCaseUpdate,
    ) -> Result<UseCaseRecord, StoreError> {
        self.db
            .call(move |db| db.update_use_case(id, index, &update))
            .await
    }

    async fn transition(
        &self,
        id: JobId,
        to: JobStatus,
        reason: Option<String>,
    ) -> Result<Job, StoreError> {
        self.db.call(move |db| db.transition(id, to, reason)).await
    }

    async fn set_use_cases(
        &self,
        id: JobId,
        records: Vec<UseCaseRecord>,
    ) -> Result<(), StoreError> {
        self.db
            .call(move |db| db.replace_use_cases(id, &records))
            .await
    }

    async fn set_report(&self, id: JobId, report: JobReport) -> Result<(), StoreError> {
        self.db.call(move |db| db.set_report(id, &report)).await
    }

    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        self.db.call(|db| db.list_jobs()).await
    }

    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        self.db.call(move |db| db.delete_job(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;
    use doc_analyser_common::UseCaseStatus;

    fn store() -> Arc<dyn JobStore> {
        Arc::new(SqliteJobStore::in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_put_then_get() {
        contract::put_then_get(store()).await;
    }

    #[tokio::test]
    async fn test_missing_job() {
        contract::missing_job(store()).await;
    }

    #[tokio::test]
    async fn test_missing_use_case() {
        contract::missing_use_case(store()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_are_not_lost() {
        contract::concurrent_updates_are_not_lost(store()).await;
    }

    #[tokio::test]
    async fn test_transitions_are_validated() {
        contract::transitions_are_validated(store()).await;
    }

    #[tokio::test]
    async fn test_set_use_cases_and_report() {
        contract::set_use_cases_and_report(store()).await;
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        contract::list_and_delete(store()).await;
    }

    #[tokio::test]
    async fn test_finished_job_is_frozen() {
        contract::finished_job_is_frozen(store()).await;
    }

    #[tokio::test]
    async fn test_state_survives_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("jobs.db");
        let job = contract::sample_job(2);
        {
            let store = SqliteJobStore::open(&path)?;
            store.put(&job).await?;
            store
                .update_use_case(job.id, 1, UseCaseUpdate::failed("exit 2"))
                .await?;
        }

        let store = SqliteJobStore::open(&path)?;
        let loaded = store.get(job.id).await?.expect("job persisted");
        assert_eq!(loaded.use_cases[1].status, UseCaseStatus::Failed);
        assert_eq!(loaded.use_cases[1].error.as_deref(), Some("exit 2"));
        assert!(loaded.use_cases[1].ended_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_cascades_to_use_cases() -> anyhow::Result<()> {
        let store = SqliteJobStore::in_memory()?;
        let job = contract::sample_job(3);
        store.put(&job).await?;
        assert!(store.delete(job.id).await?);

        let remaining: i64 = store
            .db
            .call(|db| {
                db.conn
                    .query_row("SELECT COUNT(*) FROM use_cases", [], |r| r.get(0))
                    .map_err(db_err)
            })
            .await?;
        assert_eq!(remaining, 0);
        Ok(())
    }
}
