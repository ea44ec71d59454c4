//! Durable task state store.
//!
//! Every mutation is a single SQLite `IMMEDIATE` transaction that reads the
//! record, checks the caller still owns the lock, applies the change and
//! writes it back. Lock acquisition is a compare-and-set in the same style,
//! so single-flight holds across processes sharing the database file.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::task::{
    plan_acquire, AcquireRejection, AcquireRequest, ResearchTask, Step, StepCompletion,
    StepFailure, StepState, StepStatus,
};
use crate::llm::ProviderKind;

/// Forward-only migrations; entry `n` brings the schema to version `n + 1`.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS research_tasks (
        subject_id INTEGER PRIMARY KEY,
        provider TEXT NOT NULL,
        steps_json TEXT NOT NULL,
        continuation_handle TEXT,
        report_url TEXT,
        report_published_at TEXT,
        lock_token TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );",
    "ALTER TABLE research_tasks ADD COLUMN publish_error TEXT;
     ALTER TABLE research_tasks ADD COLUMN locked_at TEXT;
     ALTER TABLE research_tasks ADD COLUMN cancel_requested INTEGER NOT NULL DEFAULT 0;
     ALTER TABLE research_tasks ADD COLUMN last_attempted_step INTEGER;
     ALTER TABLE research_tasks ADD COLUMN cost_cents INTEGER NOT NULL DEFAULT 0;",
    "ALTER TABLE research_tasks ADD COLUMN heartbeat_at TEXT;",
];

const SCHEMA_VERSION: i32 = MIGRATIONS.len() as i32;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("lock for subject {0} is not held by this worker")]
    LockLost(i64),

    #[error("no research task for subject {0}")]
    NotFound(i64),

    #[error("corrupt task record for subject {subject_id}: {message}")]
    Corrupt { subject_id: i64, message: String },

    #[error("invariant violated for subject {subject_id}: {message}")]
    Invariant { subject_id: i64, message: String },

    #[error("store worker failed: {0}")]
    Worker(String),
}

/// Outcome of an acquire attempt.
#[derive(Debug, Clone)]
pub enum Acquire {
    /// Lock taken; the snapshot reflects the record as written.
    Acquired(ResearchTask),
    Rejected(AcquireRejection),
}

/// Persistence seam for research tasks.
///
/// All writes after acquisition take the caller's lock token and fail with
/// [`StoreError::LockLost`] if it no longer matches.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get(&self, subject_id: i64) -> Result<Option<ResearchTask>, StoreError>;

    async fn acquire(
        &self,
        subject_id: i64,
        request: AcquireRequest,
        lock_token: &str,
    ) -> Result<Acquire, StoreError>;

    async fn begin_step(
        &self,
        subject_id: i64,
        lock_token: &str,
        step: Step,
    ) -> Result<ResearchTask, StoreError>;

    async fn complete_step(
        &self,
        subject_id: i64,
        lock_token: &str,
        step: Step,
        completion: StepCompletion,
    ) -> Result<ResearchTask, StoreError>;

    /// Mark `step` FAILED and release the lock in one transaction.
    async fn fail_step(
        &self,
        subject_id: i64,
        lock_token: &str,
        step: Step,
        failure: StepFailure,
    ) -> Result<ResearchTask, StoreError>;

    async fn record_publish(
        &self,
        subject_id: i64,
        lock_token: &str,
        report_url: &str,
        published_at: DateTime<Utc>,
    ) -> Result<ResearchTask, StoreError>;

    async fn record_publish_failure(
        &self,
        subject_id: i64,
        lock_token: &str,
        message: &str,
    ) -> Result<ResearchTask, StoreError>;

    async fn cancel_requested(&self, subject_id: i64, lock_token: &str)
        -> Result<bool, StoreError>;

    /// Flag a running task for cancellation. Returns `false` if it is not running.
    async fn request_cancel(&self, subject_id: i64) -> Result<bool, StoreError>;

    async fn release(&self, subject_id: i64, lock_token: &str) -> Result<ResearchTask, StoreError>;

    /// Record that the lock holder is still alive.
    async fn heartbeat(&self, subject_id: i64, lock_token: &str) -> Result<(), StoreError>;

    /// Fail the in-progress step with `failure` and release the caller's lock.
    async fn abandon(
        &self,
        subject_id: i64,
        lock_token: &str,
        failure: StepFailure,
    ) -> Result<ResearchTask, StoreError>;

    /// Take over the lock on `subject_id` if its holder has not sent a
    /// heartbeat since `heartbeat_before`: the in-progress step fails with
    /// `failure` and the lock is released. Returns the record if it was
    /// reclaimed.
    async fn reclaim(
        &self,
        subject_id: i64,
        heartbeat_before: DateTime<Utc>,
        failure: StepFailure,
    ) -> Result<Option<ResearchTask>, StoreError>;

    /// [`reclaim`](Self::reclaim) every abandoned lock. Returns the affected
    /// subjects.
    async fn release_stale(
        &self,
        heartbeat_before: DateTime<Utc>,
        failure: StepFailure,
    ) -> Result<Vec<i64>, StoreError>;
}

/// SQLite-backed [`TaskStore`].
#[derive(Clone)]
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self, StoreError> {
        init_schema(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run blocking database work off the async runtime.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Worker("connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
    }

    /// Read-check-write under the caller's lock token.
    async fn update_locked<F>(
        &self,
        subject_id: i64,
        lock_token: &str,
        apply: F,
    ) -> Result<ResearchTask, StoreError>
    where
        F: FnOnce(&mut ResearchTask, DateTime<Utc>) -> Result<(), StoreError> + Send + 'static,
    {
        let lock_token = lock_token.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut task =
                load_task(&tx, subject_id)?.ok_or(StoreError::NotFound(subject_id))?;
            if !task.holds_lock(&lock_token) {
                return Err(StoreError::LockLost(subject_id));
            }
            let now = Utc::now();
            apply(&mut task, now)?;
            task.updated_at = now;
            if task.is_locked() {
                task.heartbeat_at = Some(now);
            }
            task.check_invariants()
                .map_err(|message| StoreError::Invariant { subject_id, message })?;
            save_task(&tx, &task)?;
            tx.commit()?;
            Ok(task)
        })
        .await
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn get(&self, subject_id: i64) -> Result<Option<ResearchTask>, StoreError> {
        self.with_conn(move |conn| load_task(conn, subject_id)).await
    }

    async fn acquire(
        &self,
        subject_id: i64,
        request: AcquireRequest,
        lock_token: &str,
    ) -> Result<Acquire, StoreError> {
        let lock_token = lock_token.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing = load_task(&tx, subject_id)?;
            match plan_acquire(existing, subject_id, request, &lock_token, Utc::now()) {
                Ok(task) => {
                    save_task(&tx, &task)?;
                    tx.commit()?;
                    Ok(Acquire::Acquired(task))
                }
                Err(rejection) => Ok(Acquire::Rejected(rejection)),
            }
        })
        .await
    }

    async fn begin_step(
        &self,
        subject_id: i64,
        lock_token: &str,
        step: Step,
    ) -> Result<ResearchTask, StoreError> {
        self.update_locked(subject_id, lock_token, move |task, _| {
            if task.first_pending_step() != Some(step) {
                return Err(StoreError::Invariant {
                    subject_id,
                    message: format!("cannot begin {} out of order", step),
                });
            }
            let state = task.step_mut(step);
            state.status = StepStatus::InProgress;
            state.output = None;
            state.error = None;
            state.truncated = false;
            task.last_attempted_step = Some(step);
            Ok(())
        })
        .await
    }

    async fn complete_step(
        &self,
        subject_id: i64,
        lock_token: &str,
        step: Step,
        completion: StepCompletion,
    ) -> Result<ResearchTask, StoreError> {
        self.update_locked(subject_id, lock_token, move |task, _| {
            *task.step_mut(step) = StepState {
                status: StepStatus::Completed,
                output: Some(completion.output),
                error: None,
                truncated: completion.truncated,
            };
            if completion.continuation.is_some() {
                task.continuation_handle = completion.continuation;
            }
            task.cost_cents = task.cost_cents.saturating_add(completion.cost_cents);
            Ok(())
        })
        .await
    }

    async fn fail_step(
        &self,
        subject_id: i64,
        lock_token: &str,
        step: Step,
        failure: StepFailure,
    ) -> Result<ResearchTask, StoreError> {
        self.update_locked(subject_id, lock_token, move |task, _| {
            let state = task.step_mut(step);
            state.status = StepStatus::Failed;
            state.output = None;
            state.error = Some(failure);
            task.last_attempted_step = Some(step);
            task.release_lock();
            Ok(())
        })
        .await
    }

    async fn record_publish(
        &self,
        subject_id: i64,
        lock_token: &str,
        report_url: &str,
        published_at: DateTime<Utc>,
    ) -> Result<ResearchTask, StoreError> {
        let report_url = report_url.to_string();
        self.update_locked(subject_id, lock_token, move |task, _| {
            task.report_url = Some(report_url);
            task.report_published_at = Some(published_at);
            task.publish_error = None;
            Ok(())
        })
        .await
    }

    async fn record_publish_failure(
        &self,
        subject_id: i64,
        lock_token: &str,
        message: &str,
    ) -> Result<ResearchTask, StoreError> {
        let message = message.to_string();
        self.update_locked(subject_id, lock_token, move |task, _| {
            task.publish_error = Some(message);
            Ok(())
        })
        .await
    }

    async fn cancel_requested(
        &self,
        subject_id: i64,
        lock_token: &str,
    ) -> Result<bool, StoreError> {
        let lock_token = lock_token.to_string();
        self.with_conn(move |conn| {
            let task = load_task(conn, subject_id)?.ok_or(StoreError::NotFound(subject_id))?;
            if !task.holds_lock(&lock_token) {
                return Err(StoreError::LockLost(subject_id));
            }
            Ok(task.cancel_requested)
        })
        .await
    }

    async fn request_cancel(&self, subject_id: i64) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE research_tasks
                 SET cancel_requested = 1, updated_at = ?2
                 WHERE subject_id = ?1 AND lock_token IS NOT NULL",
                params![subject_id, timestamp(&Utc::now())],
            )?;
            Ok(updated == 1)
        })
        .await
    }

    async fn release(&self, subject_id: i64, lock_token: &str) -> Result<ResearchTask, StoreError> {
        self.update_locked(subject_id, lock_token, |task, _| {
            task.release_lock();
            Ok(())
        })
        .await
    }

    async fn heartbeat(&self, subject_id: i64, lock_token: &str) -> Result<(), StoreError> {
        let lock_token = lock_token.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE research_tasks SET heartbeat_at = ?3
                 WHERE subject_id = ?1 AND lock_token = ?2",
                params![subject_id, lock_token, timestamp(&Utc::now())],
            )?;
            if updated == 0 {
                return Err(StoreError::LockLost(subject_id));
            }
            Ok(())
        })
        .await
    }

    async fn abandon(
        &self,
        subject_id: i64,
        lock_token: &str,
        failure: StepFailure,
    ) -> Result<ResearchTask, StoreError> {
        self.update_locked(subject_id, lock_token, move |task, _| {
            task.abandon(failure);
            Ok(())
        })
        .await
    }

    async fn reclaim(
        &self,
        subject_id: i64,
        heartbeat_before: DateTime<Utc>,
        failure: StepFailure,
    ) -> Result<Option<ResearchTask>, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let task = reclaim_abandoned(&tx, subject_id, heartbeat_before, &failure)?;
            tx.commit()?;
            Ok(task)
        })
        .await
    }

    async fn release_stale(
        &self,
        heartbeat_before: DateTime<Utc>,
        failure: StepFailure,
    ) -> Result<Vec<i64>, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let candidates: Vec<i64> = {
                let mut stmt = tx.prepare(
                    "SELECT subject_id FROM research_tasks
                     WHERE lock_token IS NOT NULL
                       AND COALESCE(heartbeat_at, locked_at, '') < ?1",
                )?;
                let rows =
                    stmt.query_map(params![timestamp(&heartbeat_before)], |row| row.get(0))?;
                rows.collect::<Result<_, _>>()?
            };

            let mut released = Vec::with_capacity(candidates.len());
            for subject_id in candidates {
                if reclaim_abandoned(&tx, subject_id, heartbeat_before, &failure)?.is_some() {
                    released.push(subject_id);
                }
            }
            tx.commit()?;
            Ok(released)
        })
        .await
    }
}

/// Fixed-width UTC timestamps so that text comparison orders them correctly.
fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn reclaim_abandoned(
    conn: &Connection,
    subject_id: i64,
    heartbeat_before: DateTime<Utc>,
    failure: &StepFailure,
) -> Result<Option<ResearchTask>, StoreError> {
    let Some(mut task) = load_task(conn, subject_id)? else {
        return Ok(None);
    };
    if !task.lock_abandoned(heartbeat_before) {
        return Ok(None);
    }
    tracing::warn!(
        subject_id,
        lock_token = ?task.lock_token,
        heartbeat_at = ?task.heartbeat_at,
        "Reclaiming abandoned research lock"
    );
    task.abandon(failure.clone());
    task.updated_at = Utc::now();
    save_task(conn, &task)?;
    Ok(Some(task))
}

fn init_schema(conn: &mut Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    let version: i32 = conn
        .query_row(
            "SELECT value FROM schema_metadata WHERE key = 'version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if version > SCHEMA_VERSION {
        return Err(StoreError::Corrupt {
            subject_id: 0,
            message: format!(
                "database schema version {} is newer than supported version {}",
                version, SCHEMA_VERSION
            ),
        });
    }

    for (index, migration) in MIGRATIONS.iter().enumerate().skip(version.max(0) as usize) {
        let target = index as i32 + 1;
        // Each migration commits together with its version bump.
        let tx = conn.transaction()?;
        tx.execute_batch(migration)?;
        tx.execute(
            "INSERT INTO schema_metadata (key, value) VALUES ('version', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![target.to_string()],
        )?;
        tx.commit()?;
        tracing::info!("Migrated task store schema to version {}", target);
    }
    Ok(())
}

fn load_task(conn: &Connection, subject_id: i64) -> Result<Option<ResearchTask>, StoreError> {
    let row = conn
        .query_row(
            "SELECT provider, steps_json, continuation_handle, report_url, report_published_at,
                    publish_error, lock_token, locked_at, cancel_requested, last_attempted_step,
                    cost_cents, created_at, updated_at, heartbeat_at
             FROM research_tasks WHERE subject_id = ?1",
            params![subject_id],
            |row| {
                Ok(RawTask {
                    provider: row.get(0)?,
                    steps_json: row.get(1)?,
                    continuation_handle: row.get(2)?,
                    report_url: row.get(3)?,
                    report_published_at: row.get(4)?,
                    publish_error: row.get(5)?,
                    lock_token: row.get(6)?,
                    locked_at: row.get(7)?,
                    cancel_requested: row.get(8)?,
                    last_attempted_step: row.get(9)?,
                    cost_cents: row.get(10)?,
                    created_at: row.get(11)?,
                    updated_at: row.get(12)?,
                    heartbeat_at: row.get(13)?,
                })
            },
        )
        .optional()?;

    row.map(|raw| raw.into_task(subject_id)).transpose()
}

fn save_task(conn: &Connection, task: &ResearchTask) -> Result<(), StoreError> {
    let steps_json = serde_json::to_string(&task.steps).map_err(|e| StoreError::Corrupt {
        subject_id: task.subject_id,
        message: e.to_string(),
    })?;

    conn.execute(
        "INSERT INTO research_tasks (
            subject_id, provider, steps_json, continuation_handle, report_url,
            report_published_at, publish_error, lock_token, locked_at, cancel_requested,
            last_attempted_step, cost_cents, created_at, updated_at, heartbeat_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(subject_id) DO UPDATE SET
            provider = excluded.provider,
            steps_json = excluded.steps_json,
            continuation_handle = excluded.continuation_handle,
            report_url = excluded.report_url,
            report_published_at = excluded.report_published_at,
            publish_error = excluded.publish_error,
            lock_token = excluded.lock_token,
            locked_at = excluded.locked_at,
            cancel_requested = excluded.cancel_requested,
            last_attempted_step = excluded.last_attempted_step,
            cost_cents = excluded.cost_cents,
            updated_at = excluded.updated_at,
            heartbeat_at = excluded.heartbeat_at",
        params![
            task.subject_id,
            task.provider.as_str(),
            steps_json,
            task.continuation_handle,
            task.report_url,
            task.report_published_at.as_ref().map(timestamp),
            task.publish_error,
            task.lock_token,
            task.locked_at.as_ref().map(timestamp),
            task.cancel_requested,
            task.last_attempted_step.map(|s| s.index()),
            i64::try_from(task.cost_cents).unwrap_or(i64::MAX),
            timestamp(&task.created_at),
            timestamp(&task.updated_at),
            task.heartbeat_at.as_ref().map(timestamp),
        ],
    )?;
    Ok(())
}

/// Row as stored, before decoding.
struct RawTask {
    provider: String,
    steps_json: String,
    continuation_handle: Option<String>,
    report_url: Option<String>,
    report_published_at: Option<String>,
    publish_error: Option<String>,
    lock_token: Option<String>,
    locked_at: Option<String>,
    cancel_requested: bool,
    last_attempted_step: Option<u8>,
    cost_cents: i64,
    created_at: String,
    updated_at: String,
    heartbeat_at: Option<String>,
}

impl RawTask {
    fn into_task(self, subject_id: i64) -> Result<ResearchTask, StoreError> {
        let corrupt = |message: String| StoreError::Corrupt {
            subject_id,
            message,
        };
        let parse_time = |value: &str| {
            DateTime::parse_from_rfc3339(value)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| corrupt(format!("bad timestamp {:?}: {}", value, e)))
        };

        let provider: ProviderKind = self.provider.parse().map_err(corrupt)?;
        let steps: [StepState; 3] = serde_json::from_str(&self.steps_json)
            .map_err(|e| corrupt(format!("bad steps_json: {}", e)))?;

        Ok(ResearchTask {
            subject_id,
            provider,
            steps,
            continuation_handle: self.continuation_handle,
            report_url: self.report_url,
            report_published_at: self
                .report_published_at
                .as_deref()
                .map(parse_time)
                .transpose()?,
            publish_error: self.publish_error,
            lock_token: self.lock_token,
            locked_at: self.locked_at.as_deref().map(parse_time).transpose()?,
            heartbeat_at: self.heartbeat_at.as_deref().map(parse_time).transpose()?,
            cancel_requested: self.cancel_requested,
            last_attempted_step: self.last_attempted_step.and_then(Step::from_index),
            cost_cents: u64::try_from(self.cost_cents).unwrap_or(0),
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}
