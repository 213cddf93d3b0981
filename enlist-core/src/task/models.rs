use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ErrorClass;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Blocked,
    RetryScheduled,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Blocked => "blocked",
            TaskStatus::RetryScheduled => "retry_scheduled",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "blocked" => Ok(TaskStatus::Blocked),
            "retry_scheduled" => Ok(TaskStatus::RetryScheduled),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failure,
    Skipped,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Success => "success",
            StepOutcome::Failure => "failure",
            StepOutcome::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(StepOutcome::Success),
            "failure" => Ok(StepOutcome::Failure),
            "skipped" => Ok(StepOutcome::Skipped),
            other => Err(format!("unknown step outcome: {other}")),
        }
    }
}

/// One attempt-series for "create an account on software S". The record is
/// created once by `submit`, mutated only by the engine while it runs, and
/// frozen after reaching a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutomationTask {
    pub task_id: String,
    pub software_id: String,
    pub email_domain_hint: Option<String>,
    pub usage_context: Option<String>,
    pub status: TaskStatus,
    pub current_step: u32,
    pub total_steps: u32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub generated_email: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub account_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl AutomationTask {
    pub fn new(software_id: impl Into<String>, max_retries: u32) -> Self {
        Self {
            task_id: format!("task-{}", Uuid::new_v4().simple()),
            software_id: software_id.into(),
            email_domain_hint: None,
            usage_context: None,
            status: TaskStatus::Pending,
            current_step: 0,
            total_steps: 0,
            retry_count: 0,
            max_retries,
            generated_email: None,
            success: false,
            error_message: None,
            account_id: None,
            created_at: Some(Utc::now()),
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: Option<NaiveDateTime> = row.get("created_at")?;
        let started_at: Option<NaiveDateTime> = row.get("started_at")?;
        let completed_at: Option<NaiveDateTime> = row.get("completed_at")?;
        Ok(Self {
            task_id: row.get("task_id")?,
            software_id: row.get("software_id")?,
            email_domain_hint: row.get("email_domain_hint")?,
            usage_context: row.get("usage_context")?,
            status: row
                .get::<_, String>("status")?
                .parse()
                .unwrap_or(TaskStatus::Pending),
            current_step: row.get::<_, Option<i64>>("current_step")?.unwrap_or(0) as u32,
            total_steps: row.get::<_, Option<i64>>("total_steps")?.unwrap_or(0) as u32,
            retry_count: row.get::<_, Option<i64>>("retry_count")?.unwrap_or(0) as u32,
            max_retries: row.get::<_, Option<i64>>("max_retries")?.unwrap_or(3) as u32,
            generated_email: row.get("generated_email")?,
            success: match row.get::<_, Option<i64>>("success")? {
                Some(value) => value != 0,
                None => false,
            },
            error_message: row.get("error_message")?,
            account_id: row.get("account_id")?,
            created_at: created_at.map(|dt| Utc.from_utc_datetime(&dt)),
            started_at: started_at.map(|dt| Utc.from_utc_datetime(&dt)),
            completed_at: completed_at.map(|dt| Utc.from_utc_datetime(&dt)),
            duration_ms: row.get("duration_ms")?,
        })
    }
}

/// One ordered record in a task's trace. `seq` is assigned by the store and
/// grows strictly across the whole trace; `step_number` restarts at 1 on
/// every attempt and drives the task's `current_step`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub seq: i64,
    pub attempt: u32,
    pub step_number: u32,
    pub name: String,
    pub outcome: StepOutcome,
    pub action: String,
    pub selector: Option<String>,
    pub input_summary: Option<String>,
    pub error: Option<String>,
    pub duration_ms: i64,
    pub screenshot: Option<String>,
    pub recorded_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn new(attempt: u32, step_number: u32, name: impl Into<String>) -> Self {
        Self {
            seq: 0,
            attempt,
            step_number,
            name: name.into(),
            outcome: StepOutcome::Success,
            action: String::new(),
            selector: None,
            input_summary: None,
            error: None,
            duration_ms: 0,
            screenshot: None,
            recorded_at: Some(Utc::now()),
        }
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let recorded_at: Option<NaiveDateTime> = row.get("recorded_at")?;
        Ok(Self {
            seq: row.get("seq")?,
            attempt: row.get::<_, i64>("attempt")? as u32,
            step_number: row.get::<_, i64>("step_number")? as u32,
            name: row.get("name")?,
            outcome: row
                .get::<_, String>("outcome")?
                .parse()
                .unwrap_or(StepOutcome::Failure),
            action: row.get("action")?,
            selector: row.get("selector")?,
            input_summary: row.get("input_summary")?,
            error: row.get("error")?,
            duration_ms: row.get("duration_ms")?,
            screenshot: row.get("screenshot")?,
            recorded_at: recorded_at.map(|dt| Utc.from_utc_datetime(&dt)),
        })
    }
}

/// Generated mailbox address and password for one attempt. The password is
/// redacted from `Debug` so incidental logging cannot leak it; the raw value
/// leaves this core exactly once, through the credential sink.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }

    /// Trace-safe description of what was typed into a signup form.
    pub fn summary(&self) -> String {
        format!("email={} password=<{} chars>", self.email, self.password.len())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Fields the engine can patch alongside a status transition. Everything is
/// optional; `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub current_step: Option<u32>,
    pub total_steps: Option<u32>,
    pub retry_count: Option<u32>,
    pub generated_email: Option<String>,
    pub success: Option<bool>,
    pub error_message: Option<String>,
    pub account_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// Caller-facing view of a task, the answer to `status(task_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub status: TaskStatus,
    pub current_step: u32,
    pub total_steps: u32,
    pub error_message: Option<String>,
}

impl TaskSnapshot {
    pub fn of(task: &AutomationTask) -> Self {
        Self {
            task_id: task.task_id.clone(),
            status: task.status,
            current_step: task.current_step,
            total_steps: task.total_steps,
            error_message: task.error_message.clone(),
        }
    }
}

/// In-memory result of one attempt, owned by the engine until it is folded
/// into the persisted task record at the attempt boundary.
#[derive(Debug)]
pub struct AttemptReport {
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub screenshots: Vec<String>,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub enum AttemptOutcome {
    Completed {
        credentials: Credentials,
        tokens: HashMap<String, String>,
    },
    Blocked {
        reason: String,
    },
    Failed {
        class: ErrorClass,
        message: String,
    },
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Success,
            TaskStatus::Blocked,
            TaskStatus::RetryScheduled,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>(), Ok(status));
        }
        assert!("resting".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn only_success_failed_cancelled_are_terminal() {
        assert!(TaskStatus::Success.terminal());
        assert!(TaskStatus::Failed.terminal());
        assert!(TaskStatus::Cancelled.terminal());
        assert!(!TaskStatus::Pending.terminal());
        assert!(!TaskStatus::Running.terminal());
        assert!(!TaskStatus::Blocked.terminal());
        assert!(!TaskStatus::RetryScheduled.terminal());
    }

    #[test]
    fn credentials_debug_never_contains_password() {
        let credentials = Credentials::new("probe@mailinator.com", "Tr0uble&Strife12");
        let rendered = format!("{credentials:?}");
        assert!(!rendered.contains("Tr0uble&Strife12"));
        assert!(rendered.contains("probe@mailinator.com"));
    }

    #[test]
    fn credentials_summary_reports_length_only() {
        let credentials = Credentials::new("probe@mailinator.com", "hunter2hunter2!A");
        let summary = credentials.summary();
        assert!(summary.contains("probe@mailinator.com"));
        assert!(summary.contains("<16 chars>"));
        assert!(!summary.contains("hunter2"));
    }

    #[test]
    fn new_task_starts_pending_with_zero_counters() {
        let task = AutomationTask::new("forgecloud", 3);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retries, 3);
        assert!(!task.success);
        assert!(task.task_id.starts_with("task-"));
    }
}
