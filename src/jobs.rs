// 📋 Job Status - side channel for batch progress
// Writes are best-effort: a failed status update never fails the batch.

use crate::error::{PipelineError, PipelineResult};
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_name: String,
    pub status: String,
    pub last_run_start: Option<String>,
    pub last_run_end: Option<String>,
    pub message: Option<String>,
}

/// Injected into batch runners
pub trait JobStatusStore: Send + Sync {
    fn update_job_status(&self, job: &str, state: JobState, message: &str) -> PipelineResult<()>;
}

/// Update and swallow failures with a warning
pub fn report(store: &dyn JobStatusStore, job: &str, state: JobState, message: &str) {
    if let Err(e) = store.update_job_status(job, state, message) {
        warn!(job = job, state = state.as_str(), error = %e, "Job status update failed");
    }
}

// ============================================================================
// SQLITE STORE
// ============================================================================

/// Job status on its own connection, so status writes never join
/// an ingestion transaction
pub struct SqliteJobStatus {
    conn: Mutex<Connection>,
}

impl SqliteJobStatus {
    pub fn new(conn: Connection) -> Self {
        SqliteJobStatus {
            conn: Mutex::new(conn),
        }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open job status database: {:?}", path.as_ref()))?;
        Ok(SqliteJobStatus::new(conn))
    }

    pub fn get(&self, job: &str) -> PipelineResult<Option<JobStatus>> {
        let conn = self.lock()?;
        get_job_status(&conn, job)
    }

    fn lock(&self) -> PipelineResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::BatchFatal("job status connection poisoned".to_string()))
    }
}

impl JobStatusStore for SqliteJobStatus {
    fn update_job_status(&self, job: &str, state: JobState, message: &str) -> PipelineResult<()> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();

        match state {
            JobState::Running => conn.execute(
                "INSERT INTO system_jobs (job_name, status, last_run_start, last_run_end, message)
                 VALUES (?1, ?2, ?3, NULL, ?4)
                 ON CONFLICT(job_name) DO UPDATE SET
                    status = excluded.status,
                    last_run_start = CASE
                        WHEN system_jobs.status = 'running' THEN system_jobs.last_run_start
                        ELSE excluded.last_run_start
                    END,
                    last_run_end = NULL,
                    message = excluded.message",
                params![job, state.as_str(), now, message],
            )?,
            JobState::Completed | JobState::Failed => conn.execute(
                "INSERT INTO system_jobs (job_name, status, last_run_start, last_run_end, message)
                 VALUES (?1, ?2, NULL, ?3, ?4)
                 ON CONFLICT(job_name) DO UPDATE SET
                    status = excluded.status,
                    last_run_end = excluded.last_run_end,
                    message = excluded.message",
                params![job, state.as_str(), now, message],
            )?,
        };

        Ok(())
    }
}

pub fn get_job_status(conn: &Connection, job: &str) -> PipelineResult<Option<JobStatus>> {
    let status = conn
        .query_row(
            "SELECT job_name, status, last_run_start, last_run_end, message
             FROM system_jobs WHERE job_name = ?1",
            [job],
            |row| {
                Ok(JobStatus {
                    job_name: row.get(0)?,
                    status: row.get(1)?,
                    last_run_start: row.get(2)?,
                    last_run_end: row.get(3)?,
                    message: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(status)
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// Records every update; for dry runs and tests
#[derive(Default)]
pub struct MemoryJobStatus {
    events: Mutex<Vec<(String, JobState, String)>>,
}

impl MemoryJobStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, JobState, String)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn last_state(&self, job: &str) -> Option<JobState> {
        self.events()
            .into_iter()
            .rev()
            .find(|(name, _, _)| name == job)
            .map(|(_, state, _)| state)
    }
}

impl JobStatusStore for MemoryJobStatus {
    fn update_job_status(&self, job: &str, state: JobState, message: &str) -> PipelineResult<()> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| PipelineError::BatchFatal("job status log poisoned".to_string()))?;
        events.push((job.to_string(), state, message.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;

    fn store() -> SqliteJobStatus {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        SqliteJobStatus::new(conn)
    }

    #[test]
    fn test_running_then_completed() {
        let jobs = store();
        jobs.update_job_status("ingest", JobState::Running, "Processing 0/10").unwrap();

        let running = jobs.get("ingest").unwrap().unwrap();
        assert_eq!(running.status, "running");
        assert!(running.last_run_start.is_some());
        assert!(running.last_run_end.is_none());

        jobs.update_job_status("ingest", JobState::Running, "Processing 5/10").unwrap();
        let checkpoint = jobs.get("ingest").unwrap().unwrap();
        assert_eq!(checkpoint.last_run_start, running.last_run_start);
        assert_eq!(checkpoint.message.as_deref(), Some("Processing 5/10"));

        jobs.update_job_status("ingest", JobState::Completed, "done").unwrap();
        let done = jobs.get("ingest").unwrap().unwrap();
        assert_eq!(done.status, "completed");
        assert!(done.last_run_end.is_some());
    }

    #[test]
    fn test_unknown_job_is_none() {
        assert!(store().get("never-ran").unwrap().is_none());
    }

    #[test]
    fn test_memory_store_tracks_last_state() {
        let jobs = MemoryJobStatus::new();
        report(&jobs, "rules", JobState::Running, "start");
        report(&jobs, "rules", JobState::Failed, "db gone");

        assert_eq!(jobs.last_state("rules"), Some(JobState::Failed));
        assert_eq!(jobs.events().len(), 2);
    }
}
