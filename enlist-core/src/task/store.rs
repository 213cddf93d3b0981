use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use uuid::Uuid;

use crate::sqlite::configure_connection;

use super::error::{SinkError, SinkResult, StoreError, StoreResult};
use super::models::{AutomationTask, Credentials, StatusPatch, StepRecord, TaskStatus};

const TASK_SCHEMA: &str = include_str!("../../../sql/tasks.sql");

/// Durability boundary for task and trace records. The engine never assumes
/// in-memory state survives a crash; everything it needs on restart is here.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, task: &AutomationTask) -> StoreResult<()>;
    async fn append_step(&self, task_id: &str, step: &StepRecord) -> StoreResult<i64>;
    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        patch: StatusPatch,
    ) -> StoreResult<()>;
    async fn get(&self, task_id: &str) -> StoreResult<Option<AutomationTask>>;
    async fn steps(&self, task_id: &str) -> StoreResult<Vec<StepRecord>>;
}

/// Where raw credentials cross out of the engine, exactly once, at SUCCESS.
/// Extracted provisioning tokens ride along with them.
#[async_trait]
pub trait CredentialSink: Send + Sync {
    async fn store(
        &self,
        task_id: &str,
        credentials: &Credentials,
        tokens: &HashMap<String, String>,
    ) -> SinkResult<String>;
}

#[derive(Debug, Clone)]
pub struct SqliteTaskStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteTaskStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteTaskStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<SqliteTaskStore> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };

        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }

        Ok(SqliteTaskStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteTaskStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteTaskStore {
    pub fn builder() -> SqliteTaskStoreBuilder {
        SqliteTaskStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        SqliteTaskStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StoreError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| StoreError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(TASK_SCHEMA)?;
        Ok(())
    }

    pub fn insert_task(&self, task: &AutomationTask) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO tasks (
                task_id, software_id, email_domain_hint, usage_context, status,
                current_step, total_steps, retry_count, max_retries, generated_email,
                success, error_message, account_id, created_at, started_at,
                completed_at, duration_ms
            ) VALUES (
                :task_id, :software_id, :email_domain_hint, :usage_context, :status,
                :current_step, :total_steps, :retry_count, :max_retries, :generated_email,
                :success, :error_message, :account_id, :created_at, :started_at,
                :completed_at, :duration_ms
            )",
            params![
                &task.task_id,
                &task.software_id,
                &task.email_domain_hint,
                &task.usage_context,
                task.status.as_str(),
                task.current_step as i64,
                task.total_steps as i64,
                task.retry_count as i64,
                task.max_retries as i64,
                &task.generated_email,
                if task.success { 1 } else { 0 },
                &task.error_message,
                &task.account_id,
                task.created_at.map(|dt| dt.naive_utc()),
                task.started_at.map(|dt| dt.naive_utc()),
                task.completed_at.map(|dt| dt.naive_utc()),
                task.duration_ms,
            ],
        )?;
        Ok(())
    }

    pub fn fetch_task(&self, task_id: &str) -> StoreResult<Option<AutomationTask>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM tasks WHERE task_id = ?1")?;
        let task = stmt
            .query_row([task_id], |row| AutomationTask::from_row(row))
            .optional()?;
        Ok(task)
    }

    /// Appends one trace record inside a transaction, assigning the next seq
    /// for the task. Seqs are never reused, including across attempts.
    pub fn append_step_sync(&self, task_id: &str, step: &StepRecord) -> StoreResult<i64> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;

        let known: Option<i64> = tx
            .query_row("SELECT 1 FROM tasks WHERE task_id = ?1", [task_id], |row| {
                row.get(0)
            })
            .optional()?;
        if known.is_none() {
            return Err(StoreError::NotFound {
                task_id: task_id.to_string(),
            });
        }

        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM task_steps WHERE task_id = ?1",
            [task_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO task_steps (
                task_id, seq, attempt, step_number, name, outcome, action,
                selector, input_summary, error, duration_ms, screenshot, recorded_at
            ) VALUES (
                :task_id, :seq, :attempt, :step_number, :name, :outcome, :action,
                :selector, :input_summary, :error, :duration_ms, :screenshot, :recorded_at
            )",
            params![
                task_id,
                seq,
                step.attempt as i64,
                step.step_number as i64,
                &step.name,
                step.outcome.as_str(),
                &step.action,
                &step.selector,
                &step.input_summary,
                &step.error,
                step.duration_ms,
                &step.screenshot,
                step.recorded_at.map(|dt| dt.naive_utc()),
            ],
        )?;
        tx.commit()?;
        Ok(seq)
    }

    /// Applies the transition plus whatever fields the patch carries. A move
    /// to SUCCESS drops any error message left behind by earlier attempts.
    pub fn update_status_sync(
        &self,
        task_id: &str,
        status: TaskStatus,
        patch: &StatusPatch,
    ) -> StoreResult<()> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE tasks SET
                status = :status,
                current_step = COALESCE(:current_step, current_step),
                total_steps = COALESCE(:total_steps, total_steps),
                retry_count = COALESCE(:retry_count, retry_count),
                generated_email = COALESCE(:generated_email, generated_email),
                success = COALESCE(:success, success),
                error_message = CASE WHEN :status = 'success'
                    THEN :error_message
                    ELSE COALESCE(:error_message, error_message) END,
                account_id = COALESCE(:account_id, account_id),
                started_at = COALESCE(:started_at, started_at),
                completed_at = COALESCE(:completed_at, completed_at),
                duration_ms = COALESCE(:duration_ms, duration_ms)
             WHERE task_id = :task_id",
            params![
                status.as_str(),
                patch.current_step.map(|v| v as i64),
                patch.total_steps.map(|v| v as i64),
                patch.retry_count.map(|v| v as i64),
                &patch.generated_email,
                patch.success.map(|v| if v { 1i64 } else { 0 }),
                &patch.error_message,
                &patch.account_id,
                patch.started_at.map(|dt| dt.naive_utc()),
                patch.completed_at.map(|dt| dt.naive_utc()),
                patch.duration_ms,
                task_id,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                task_id: task_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn list_steps(&self, task_id: &str) -> StoreResult<Vec<StepRecord>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT * FROM task_steps WHERE task_id = ?1 ORDER BY seq ASC")?;
        let rows = stmt
            .query_map([task_id], |row| StepRecord::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> StoreResult<Vec<AutomationTask>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM tasks
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(
                (status.as_ref().map(TaskStatus::as_str), limit as i64),
                |row| AutomationTask::from_row(row),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn store_account_sync(
        &self,
        task_id: &str,
        credentials: &Credentials,
        tokens: &HashMap<String, String>,
    ) -> SinkResult<String> {
        let conn = self.open().map_err(|err| SinkError::Rejected {
            task_id: task_id.to_string(),
            reason: err.to_string(),
        })?;
        let account_id = format!("acct-{}", Uuid::new_v4().simple());
        let tokens_json = if tokens.is_empty() {
            None
        } else {
            serde_json::to_string(tokens).ok()
        };
        conn.execute(
            "INSERT INTO accounts (account_id, task_id, email, password, tokens)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &account_id,
                task_id,
                &credentials.email,
                &credentials.password,
                tokens_json,
            ],
        )?;
        Ok(account_id)
    }

    pub fn fetch_account_email(&self, account_id: &str) -> StoreResult<Option<String>> {
        let conn = self.open()?;
        let email = conn
            .query_row(
                "SELECT email FROM accounts WHERE account_id = ?1",
                [account_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(email)
    }
}

fn join_err(err: tokio::task::JoinError) -> StoreError {
    StoreError::Io(io::Error::other(err))
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, task: &AutomationTask) -> StoreResult<()> {
        let store = self.clone();
        let task = task.clone();
        tokio::task::spawn_blocking(move || store.insert_task(&task))
            .await
            .map_err(join_err)?
    }

    async fn append_step(&self, task_id: &str, step: &StepRecord) -> StoreResult<i64> {
        let store = self.clone();
        let task_id = task_id.to_string();
        let step = step.clone();
        tokio::task::spawn_blocking(move || store.append_step_sync(&task_id, &step))
            .await
            .map_err(join_err)?
    }

    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        patch: StatusPatch,
    ) -> StoreResult<()> {
        let store = self.clone();
        let task_id = task_id.to_string();
        tokio::task::spawn_blocking(move || store.update_status_sync(&task_id, status, &patch))
            .await
            .map_err(join_err)?
    }

    async fn get(&self, task_id: &str) -> StoreResult<Option<AutomationTask>> {
        let store = self.clone();
        let task_id = task_id.to_string();
        tokio::task::spawn_blocking(move || store.fetch_task(&task_id))
            .await
            .map_err(join_err)?
    }

    async fn steps(&self, task_id: &str) -> StoreResult<Vec<StepRecord>> {
        let store = self.clone();
        let task_id = task_id.to_string();
        tokio::task::spawn_blocking(move || store.list_steps(&task_id))
            .await
            .map_err(join_err)?
    }
}

#[async_trait]
impl CredentialSink for SqliteTaskStore {
    async fn store(
        &self,
        task_id: &str,
        credentials: &Credentials,
        tokens: &HashMap<String, String>,
    ) -> SinkResult<String> {
        let store = self.clone();
        let task_id = task_id.to_string();
        let credentials = credentials.clone();
        let tokens = tokens.clone();
        tokio::task::spawn_blocking(move || store.store_account_sync(&task_id, &credentials, &tokens))
            .await
            .map_err(|err| SinkError::Io(io::Error::other(err)))?
    }
}
