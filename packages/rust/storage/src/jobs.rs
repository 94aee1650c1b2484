//! Durable job records behind the [`JobStore`] interface.
//!
//! [`SqlJobStore`] keeps jobs in a local libSQL database so they survive the
//! process; [`MemoryJobStore`] is the in-process substitute used by tests and
//! by callers that do not need persistence.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use libsql::{Connection, params};
use varnika_shared::{Job, JobId, Result, VarnikaError};

use crate::migrations;

/// How long a write waits for another process's transaction before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One page of jobs, newest first, plus the total number stored.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: usize,
}

/// Storage for job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or overwrite a job record.
    ///
    /// A record that is already `completed` or `failed` is never overwritten;
    /// saving over one is a validation error.
    async fn save(&self, job: &Job) -> Result<()>;

    async fn load(&self, id: JobId) -> Result<Option<Job>>;

    /// Jobs ordered by creation time, newest first.
    async fn list(&self, limit: usize, offset: usize) -> Result<JobPage>;

    /// Delete a job. Returns whether it existed.
    async fn remove(&self, id: JobId) -> Result<bool>;
}

fn sort_newest_first(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        b.created_at()
            .cmp(&a.created_at())
            .then_with(|| b.id().cmp(&a.id()))
    });
}

// ---------------------------------------------------------------------------
// MemoryJobStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> VarnikaError {
    VarnikaError::Storage("job store lock poisoned".into())
}

fn already_final(id: JobId) -> VarnikaError {
    VarnikaError::validation(format!("job {id} already finished in the store"))
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        if jobs.get(&job.id()).is_some_and(Job::is_terminal) {
            return Err(already_final(job.id()));
        }
        jobs.insert(job.id(), job.clone());
        Ok(())
    }

    async fn load(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.read().map_err(|_| poisoned())?.get(&id).cloned())
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<JobPage> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .map_err(|_| poisoned())?
            .values()
            .cloned()
            .collect();
        let total = jobs.len();
        sort_newest_first(&mut jobs);
        let jobs = jobs.into_iter().skip(offset).take(limit).collect();
        Ok(JobPage { jobs, total })
    }

    async fn remove(&self, id: JobId) -> Result<bool> {
        Ok(self
            .jobs
            .write()
            .map_err(|_| poisoned())?
            .remove(&id)
            .is_some())
    }
}

// ---------------------------------------------------------------------------
// SqlJobStore
// ---------------------------------------------------------------------------

/// Job store backed by a local libSQL database.
pub struct SqlJobStore {
    conn: Connection,
    readonly: bool,
}

fn storage_err(e: impl std::fmt::Display) -> VarnikaError {
    VarnikaError::Storage(e.to_string())
}

impl SqlJobStore {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| VarnikaError::io(parent, e))?;
        }

        let store = Self {
            conn: connect(path).await?,
            readonly: false,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Open an existing database for inspection only.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: connect(path).await?,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    VarnikaError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(VarnikaError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM jobs", params![])
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(storage_err)?.max(0) as usize),
            None => Ok(0),
        }
    }
}

/// Open a connection that waits out other writers instead of failing busy.
async fn connect(path: &Path) -> Result<Connection> {
    let db = libsql::Builder::new_local(path)
        .build()
        .await
        .map_err(storage_err)?;
    let conn = db.connect().map_err(storage_err)?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(storage_err)?;
    Ok(conn)
}

fn decode_job(json: &str) -> Result<Job> {
    serde_json::from_str(json).map_err(|e| VarnikaError::Storage(format!("corrupt job record: {e}")))
}

#[async_trait]
impl JobStore for SqlJobStore {
    async fn save(&self, job: &Job) -> Result<()> {
        self.check_writable()?;
        let record = serde_json::to_string(job).map_err(storage_err)?;
        let created = job.created_at().to_rfc3339_opts(SecondsFormat::Micros, true);
        let updated = job.updated_at().to_rfc3339_opts(SecondsFormat::Micros, true);
        let affected = self
            .conn
            .execute(
                "INSERT INTO jobs (id, status, stages, created_at, updated_at, record_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    updated_at = excluded.updated_at,
                    record_json = excluded.record_json
                 WHERE jobs.status NOT IN ('completed', 'failed')",
                params![
                    job.id().to_string(),
                    job.status().as_str(),
                    job.stages().to_string(),
                    created,
                    updated,
                    record
                ],
            )
            .await
            .map_err(storage_err)?;
        if affected == 0 {
            return Err(already_final(job.id()));
        }
        Ok(())
    }

    async fn load(&self, id: JobId) -> Result<Option<Job>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_json FROM jobs WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => {
                let json = row.get::<String>(0).map_err(storage_err)?;
                Ok(Some(decode_job(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<JobPage> {
        let total = self.count().await?;
        let mut rows = self
            .conn
            .query(
                "SELECT record_json FROM jobs
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?1 OFFSET ?2",
                params![limit as i64, offset as i64],
            )
            .await
            .map_err(storage_err)?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let json = row.get::<String>(0).map_err(storage_err)?;
            jobs.push(decode_job(&json)?);
        }
        Ok(JobPage { jobs, total })
    }

    async fn remove(&self, id: JobId) -> Result<bool> {
        self.check_writable()?;
        let affected = self
            .conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(storage_err)?;
        Ok(affected > 0)
    }
}
