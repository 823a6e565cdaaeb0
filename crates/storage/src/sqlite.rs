//! SQLite-backed store
//!
//! Rows keep their full JSON body next to the columns the store filters
//! and compares on. The `stage_runs` primary key is the storage-level
//! guard for one run per (job, stage, sub-target).

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

use kavach_common::{
    Finding, JobFilter, JobStatus, ProgressEvent, ScanJob, ScanStore, StageRun, StageRunFilter,
    StageRunKey, SubTarget, VulnerabilityRecord,
};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        status TEXT NOT NULL,
        body TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS sub_targets (
        job_id TEXT NOT NULL,
        dedup_key TEXT NOT NULL,
        body TEXT NOT NULL,
        PRIMARY KEY (job_id, dedup_key)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS stage_runs (
        job_id TEXT NOT NULL,
        stage TEXT NOT NULL,
        dedup_key TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        body TEXT NOT NULL,
        PRIMARY KEY (job_id, stage, dedup_key)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS findings (
        id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL,
        body TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS findings_job ON findings (job_id)",
    r#"CREATE TABLE IF NOT EXISTS vulnerabilities (
        id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL,
        body TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS vulnerabilities_job ON vulnerabilities (job_id)",
    r#"CREATE TABLE IF NOT EXISTS events (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        body TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS events_job ON events (job_id)",
];

pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

fn body<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("failed to encode row")
}

fn decode<T: DeserializeOwned>(row: &SqliteRow) -> Result<T> {
    let raw: String = row.try_get("body")?;
    serde_json::from_str(&raw).context("failed to decode row")
}

fn decode_all<T: DeserializeOwned>(rows: &[SqliteRow]) -> Result<Vec<T>> {
    rows.iter().map(decode).collect()
}

impl SqliteStore {
    /// Open (creating if needed) a database, e.g. `sqlite://kavach.db` or
    /// `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid database url {url}"))?
            .create_if_missing(true);
        // every connection to :memory: is its own database
        let max = if url.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database {url}"))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("schema ready");
        Ok(())
    }
}

#[async_trait]
impl ScanStore for SqliteStore {
    async fn save_job(&self, job: &ScanJob) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO jobs (id, owner, status, body) VALUES (?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET owner = excluded.owner,
                   status = excluded.status, body = excluded.body"#,
        )
        .bind(job.id.to_string())
        .bind(&job.owner)
        .bind(job.status.as_str())
        .bind(body(job)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_job(&self, id: Uuid) -> Result<Option<ScanJob>> {
        let row = sqlx::query("SELECT body FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScanJob>> {
        let rows = sqlx::query(
            r#"SELECT body FROM jobs
               WHERE (? IS NULL OR owner = ?) AND (? IS NULL OR status = ?)"#,
        )
        .bind(filter.owner.as_deref())
        .bind(filter.owner.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        let mut jobs: Vec<ScanJob> = decode_all(&rows)?;
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    async fn transition_job(&self, id: Uuid, from: &[JobStatus], to: JobStatus) -> Result<bool> {
        let Some(mut job) = self.load_job(id).await? else {
            return Ok(false);
        };
        if !from.contains(&job.status) {
            return Ok(false);
        }
        let previous = job.status;
        job.set_status(to);
        let done = sqlx::query("UPDATE jobs SET status = ?, body = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(body(&job)?)
            .bind(id.to_string())
            .bind(previous.as_str())
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn delete_job(&self, id: Uuid) -> Result<()> {
        let id = id.to_string();
        let mut tx = self.pool.begin().await?;
        for table in ["jobs", "sub_targets", "stage_runs", "findings", "events"] {
            let column = if table == "jobs" { "id" } else { "job_id" };
            sqlx::query(&format!("DELETE FROM {table} WHERE {column} = ?"))
                .bind(&id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_sub_target(&self, sub_target: &SubTarget) -> Result<bool> {
        let done = sqlx::query(
            "INSERT OR IGNORE INTO sub_targets (job_id, dedup_key, body) VALUES (?, ?, ?)",
        )
        .bind(sub_target.job_id.to_string())
        .bind(&sub_target.dedup_key)
        .bind(body(sub_target)?)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn sub_targets(&self, job_id: Uuid) -> Result<Vec<SubTarget>> {
        let rows = sqlx::query("SELECT body FROM sub_targets WHERE job_id = ? ORDER BY dedup_key")
            .bind(job_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        decode_all(&rows)
    }

    async fn insert_stage_run(&self, run: &StageRun) -> Result<bool> {
        let done = sqlx::query(
            r#"INSERT OR IGNORE INTO stage_runs (job_id, stage, dedup_key, status, attempts, body)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.job_id.to_string())
        .bind(run.stage.as_str())
        .bind(&run.dedup_key)
        .bind(run.status.as_str())
        .bind(i64::from(run.attempts))
        .bind(body(run)?)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn load_stage_run(&self, key: &StageRunKey) -> Result<Option<StageRun>> {
        let row = sqlx::query(
            "SELECT body FROM stage_runs WHERE job_id = ? AND stage = ? AND dedup_key = ?",
        )
        .bind(key.job_id.to_string())
        .bind(key.stage.as_str())
        .bind(&key.dedup_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn update_stage_run(&self, expected: &StageRun, next: &StageRun) -> Result<bool> {
        let done = sqlx::query(
            r#"UPDATE stage_runs SET status = ?, attempts = ?, body = ?
               WHERE job_id = ? AND stage = ? AND dedup_key = ? AND status = ? AND attempts = ?"#,
        )
        .bind(next.status.as_str())
        .bind(i64::from(next.attempts))
        .bind(body(next)?)
        .bind(expected.job_id.to_string())
        .bind(expected.stage.as_str())
        .bind(&expected.dedup_key)
        .bind(expected.status.as_str())
        .bind(i64::from(expected.attempts))
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn query_stage_runs(&self, filter: &StageRunFilter) -> Result<Vec<StageRun>> {
        let rows = sqlx::query(
            r#"SELECT body FROM stage_runs
               WHERE job_id = ? AND (? IS NULL OR stage = ?) AND (? IS NULL OR status = ?)"#,
        )
        .bind(filter.job_id.to_string())
        .bind(filter.stage.map(|s| s.as_str()))
        .bind(filter.stage.map(|s| s.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        let mut runs: Vec<StageRun> = decode_all(&rows)?;
        runs.sort_by(|a, b| (a.stage, &a.dedup_key).cmp(&(b.stage, &b.dedup_key)));
        Ok(runs)
    }

    async fn save_findings(&self, findings: &[Finding]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for finding in findings {
            sqlx::query("INSERT OR IGNORE INTO findings (id, job_id, body) VALUES (?, ?, ?)")
                .bind(finding.id.to_string())
                .bind(finding.job_id.to_string())
                .bind(body(finding)?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn findings(&self, job_id: Uuid) -> Result<Vec<Finding>> {
        let rows = sqlx::query("SELECT body FROM findings WHERE job_id = ? ORDER BY rowid")
            .bind(job_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        decode_all(&rows)
    }

    async fn save_vulnerabilities(&self, records: &[VulnerabilityRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"INSERT INTO vulnerabilities (id, job_id, body) VALUES (?, ?, ?)
                   ON CONFLICT(id) DO UPDATE SET job_id = excluded.job_id, body = excluded.body"#,
            )
            .bind(record.id.to_string())
            .bind(record.job_id.to_string())
            .bind(body(record)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn vulnerabilities(&self, job_id: Uuid) -> Result<Vec<VulnerabilityRecord>> {
        let rows = sqlx::query("SELECT body FROM vulnerabilities WHERE job_id = ? ORDER BY id")
            .bind(job_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        decode_all(&rows)
    }

    async fn append_event(&self, event: &ProgressEvent) -> Result<()> {
        sqlx::query("INSERT INTO events (job_id, body) VALUES (?, ?)")
            .bind(event.job_id.to_string())
            .bind(body(event)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn events(&self, job_id: Uuid) -> Result<Vec<ProgressEvent>> {
        let rows = sqlx::query("SELECT body FROM events WHERE job_id = ? ORDER BY seq")
            .bind(job_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        decode_all(&rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract;
    use kavach_common::ScanRequest;

    #[tokio::test]
    async fn sqlite_store_contract() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        contract::run_all(&store).await;
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("kavach.db").display());

        let job = ScanJob::new(ScanRequest::new("example.com", "alice"), "example.com".into());
        {
            let store = SqliteStore::connect(&url).await.unwrap();
            store.save_job(&job).await.unwrap();
        }
        let store = SqliteStore::connect(&url).await.unwrap();
        let loaded = store.load_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.root_target, "example.com");
    }
}
