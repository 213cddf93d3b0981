use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use enlist_core::{
    AutomationEngine, AutomationTask, AutomatorRegistry, BrowserLauncher, ChromiumSessionFactory,
    CredentialSink, EnlistConfig, HttpMailboxProvider, MailboxPoller, Notifier, NullNotifier,
    SessionFactory, SignupRequest, SqliteTaskStore, StatusPatch, StepRecord, TaskStatus, TaskStore,
    WebhookNotifier,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] enlist_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("store error: {0}")]
    Store(#[from] enlist_core::StoreError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("authentication failed")]
    Authentication,
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("task {task_id} ended {status}: {detail}")]
    RunFailed {
        task_id: String,
        status: TaskStatus,
        detail: String,
    },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "enlist command-line control interface", long_about = None)]
pub struct Cli {
    /// Path to the main enlist.toml
    #[arg(long, default_value = "configs/enlist.toml")]
    pub config: PathBuf,
    /// Alternate path to the task database
    #[arg(long)]
    pub db: Option<PathBuf>,
    /// Local authentication token (checked when ENLISTCTL_TOKEN is set)
    #[arg(long)]
    pub token: Option<String>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit one signup task and drive it until it comes to rest
    Run(RunArgs),
    /// Show the stored state of a task
    Status(TaskArgs),
    /// Print the recorded step trace of a task
    Trace(TaskArgs),
    /// List recorded tasks
    Tasks(TasksArgs),
    /// Cancel a task that is resting in the store
    Cancel(TaskArgs),
    /// List the signup targets this build can automate
    Targets,
    /// Configuration inspection
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Emit a shell completion script on stdout
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Target software identifier (see `targets`)
    pub software_id: String,
    /// Preferred domain for the generated mailbox address
    #[arg(long)]
    pub email_domain: Option<String>,
    /// Free-form note stored alongside the task
    #[arg(long)]
    pub usage_context: Option<String>,
    /// Seconds to wait before the run is cancelled
    #[arg(long, default_value_t = 600)]
    pub wait_secs: u64,
}

#[derive(Args, Debug)]
pub struct TaskArgs {
    pub task_id: String,
}

#[derive(Args, Debug)]
pub struct TasksArgs {
    /// Filter by status
    #[arg(long)]
    pub status: Option<String>,
    /// Maximum number of rows returned
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Parse the configuration and check the resources it points at
    Validate,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    #[arg(value_enum)]
    pub shell: Shell,
}

pub fn run(cli: Cli) -> Result<()> {
    enforce_token(&cli)?;
    init_tracing();

    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        let name = command.get_name().to_string();
        clap_complete::generate(args.shell, &mut command, name, &mut std::io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Run(args) => {
            let outcome = context.run_task(args)?;
            render(&outcome, cli.format)?;
            if outcome.status != TaskStatus::Success {
                return Err(AppError::RunFailed {
                    task_id: outcome.task_id.clone(),
                    status: outcome.status,
                    detail: outcome
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "see the step trace for details".to_string()),
                });
            }
        }
        Commands::Status(args) => {
            let report = context.task_status(args)?;
            render(&report, cli.format)?;
        }
        Commands::Trace(args) => {
            let trace = context.task_trace(args)?;
            render(&trace, cli.format)?;
        }
        Commands::Tasks(args) => {
            let list = context.task_list(args)?;
            render(&list, cli.format)?;
        }
        Commands::Cancel(args) => {
            let outcome = context.cancel_task(args)?;
            render(&outcome, cli.format)?;
        }
        Commands::Targets => {
            let targets = context.list_targets();
            render(&targets, cli.format)?;
        }
        Commands::Config(ConfigCommands::Validate) => {
            let report = context.validate_config()?;
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more configuration checks failed".to_string(),
                ));
            }
        }
        // Emitted before the context was built; completions need no config.
        Commands::Completions(_) => {}
    }

    Ok(())
}

fn enforce_token(cli: &Cli) -> Result<()> {
    if let Ok(expected) = std::env::var("ENLISTCTL_TOKEN") {
        match &cli.token {
            Some(provided) if provided == &expected => Ok(()),
            _ => Err(AppError::Authentication),
        }
    } else {
        Ok(())
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: EnlistConfig,
    config_path: PathBuf,
    db_path: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let config = EnlistConfig::from_file(&config_path)?;
        let db_path = cli
            .db
            .clone()
            .unwrap_or_else(|| PathBuf::from(&config.storage.db_path));

        Ok(Self {
            config,
            config_path,
            db_path,
        })
    }

    fn run_task(&self, args: &RunArgs) -> Result<RunOutcome> {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.drive_task(args))
    }

    async fn drive_task(&self, args: &RunArgs) -> Result<RunOutcome> {
        let store = Arc::new(
            SqliteTaskStore::builder()
                .path(&self.db_path)
                .build()?,
        );
        store.initialize()?;

        let task_store: Arc<dyn TaskStore> = store.clone();
        let sink: Arc<dyn CredentialSink> = store.clone();
        let notifier: Arc<dyn Notifier> = match WebhookNotifier::from_config(&self.config.notify) {
            Some(webhook) => Arc::new(webhook),
            None => Arc::new(NullNotifier),
        };
        let sessions: Arc<dyn SessionFactory> = Arc::new(ChromiumSessionFactory::new(
            BrowserLauncher::new(self.config.browser.clone()),
        ));
        let mailbox = MailboxPoller::new(
            Arc::new(HttpMailboxProvider::new(&self.config.mailbox)),
            self.config.mailbox.poll_interval(),
        );

        let engine = AutomationEngine::start(
            &self.config,
            task_store,
            sink,
            notifier,
            AutomatorRegistry::with_builtin_targets(),
            sessions,
            mailbox,
        );

        let mut request = SignupRequest::new(&args.software_id);
        request.email_domain_hint = args.email_domain.clone();
        request.usage_context = args.usage_context.clone();
        let task_id = engine.submit(request).await?;

        let deadline = Instant::now() + Duration::from_secs(args.wait_secs);
        let mut cancel_requested = false;
        loop {
            let snapshot = engine.status(&task_id).await?;
            if snapshot.status.terminal() || snapshot.status == TaskStatus::Blocked {
                break;
            }
            if !cancel_requested && Instant::now() >= deadline {
                engine.cancel(&task_id).await?;
                cancel_requested = true;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        engine.shutdown().await;

        let task = store.fetch_task(&task_id)?.ok_or_else(|| {
            AppError::MissingResource(format!("task record disappeared: {task_id}"))
        })?;
        let steps = store.list_steps(&task_id)?;
        Ok(RunOutcome::from_task(&task, steps.len()))
    }

    fn task_status(&self, args: &TaskArgs) -> Result<TaskReport> {
        let store = self.open_store()?;
        let task = store.fetch_task(&args.task_id)?.ok_or_else(|| {
            AppError::MissingResource(format!("task not found: {}", args.task_id))
        })?;
        let account_email = match &task.account_id {
            Some(account_id) => store.fetch_account_email(account_id)?,
            None => None,
        };
        Ok(TaskReport {
            task,
            account_email,
        })
    }

    fn task_trace(&self, args: &TaskArgs) -> Result<TraceReport> {
        let store = self.open_store()?;
        if store.fetch_task(&args.task_id)?.is_none() {
            return Err(AppError::MissingResource(format!(
                "task not found: {}",
                args.task_id
            )));
        }
        let rows = store.list_steps(&args.task_id)?;
        Ok(TraceReport {
            task_id: args.task_id.clone(),
            rows,
        })
    }

    fn task_list(&self, args: &TasksArgs) -> Result<TaskList> {
        let status = match &args.status {
            Some(raw) => Some(
                raw.parse::<TaskStatus>()
                    .map_err(AppError::InvalidArgument)?,
            ),
            None => None,
        };
        let store = self.open_store()?;
        let rows = store.list_tasks(status, args.limit)?;
        Ok(TaskList { rows })
    }

    /// Settles a task that is resting in the store. A running task belongs to
    /// the engine process that is driving it and cannot be reached from here.
    fn cancel_task(&self, args: &TaskArgs) -> Result<CancelOutcome> {
        if !self.db_path.exists() {
            return Err(AppError::MissingResource(format!(
                "task database missing: {}",
                self.db_path.display()
            )));
        }
        let store = SqliteTaskStore::builder()
            .path(&self.db_path)
            .create_if_missing(false)
            .build()?;
        let task = store.fetch_task(&args.task_id)?.ok_or_else(|| {
            AppError::MissingResource(format!("task not found: {}", args.task_id))
        })?;

        if task.status.terminal() {
            return Ok(CancelOutcome {
                task_id: task.task_id,
                status: task.status,
                cancelled: false,
                note: format!("already {}, nothing to cancel", task.status),
            });
        }
        if task.status == TaskStatus::Running {
            return Ok(CancelOutcome {
                task_id: task.task_id,
                status: task.status,
                cancelled: false,
                note: "mid-attempt in a live engine process, only resting tasks can be cancelled here"
                    .to_string(),
            });
        }

        let now = Utc::now();
        let patch = StatusPatch {
            completed_at: Some(now),
            duration_ms: task
                .started_at
                .map(|started| (now - started).num_milliseconds()),
            ..StatusPatch::default()
        };
        store.update_status_sync(&task.task_id, TaskStatus::Cancelled, &patch)?;
        Ok(CancelOutcome {
            task_id: task.task_id,
            status: TaskStatus::Cancelled,
            cancelled: true,
            note: "cancelled".to_string(),
        })
    }

    fn list_targets(&self) -> TargetList {
        TargetList {
            targets: AutomatorRegistry::with_builtin_targets().supported_targets(),
        }
    }

    fn validate_config(&self) -> Result<Vec<HealthEntry>> {
        let mut results = Vec::new();
        results.push(self.check_path("enlist.toml", &self.config_path));

        let engine = &self.config.engine;
        if engine.concurrency == 0 || engine.queue_depth == 0 {
            results.push(HealthEntry::error(
                "engine",
                "concurrency and queue_depth must be nonzero",
            ));
        } else {
            results.push(HealthEntry::ok(
                "engine",
                format!(
                    "concurrency={} retries={} step_timeout={}s",
                    engine.concurrency, engine.max_retries, engine.step_timeout_secs
                ),
            ));
        }
        if engine.base_delay_ms > engine.max_delay_ms {
            results.push(HealthEntry::warn(
                "backoff",
                format!(
                    "base_delay_ms {} exceeds max_delay_ms {}",
                    engine.base_delay_ms, engine.max_delay_ms
                ),
            ));
        } else {
            results.push(HealthEntry::ok(
                "backoff",
                format!(
                    "base={}ms max={}ms jitter={}ms",
                    engine.base_delay_ms, engine.max_delay_ms, engine.retry_jitter_ms
                ),
            ));
        }

        let credentials = &self.config.credentials;
        if credentials.mailbox_domains.is_empty() {
            results.push(HealthEntry::error(
                "credentials",
                "no mailbox domains configured",
            ));
        } else {
            results.push(HealthEntry::ok(
                "credentials",
                format!("{} mailbox domains", credentials.mailbox_domains.len()),
            ));
        }

        results.push(match &self.config.mailbox.api_key {
            Some(_) => HealthEntry::ok("mailbox", self.config.mailbox.base_url.clone()),
            None => HealthEntry::warn(
                "mailbox",
                format!("{} without api_key", self.config.mailbox.base_url),
            ),
        });
        results.push(match &self.config.challenge.solver_api_key {
            Some(_) => {
                HealthEntry::ok("challenge solver", self.config.challenge.solver_base_url.clone())
            }
            None => HealthEntry::warn(
                "challenge solver",
                "no solver_api_key set, challenged signups will park as blocked",
            ),
        });
        results.push(match &self.config.notify.webhook_url {
            Some(url) if self.config.notify.signing_secret.is_none() => {
                HealthEntry::warn("notify", format!("{url} without signing secret"))
            }
            Some(url) => HealthEntry::ok("notify", url.clone()),
            None => HealthEntry::ok("notify", "webhook disabled"),
        });

        results.push(self.check_directory("artifacts root", Path::new(&self.config.artifacts.root)));
        if let Some(path) = &self.config.browser.executable_path {
            results.push(self.check_path("browser executable", Path::new(path)));
        }
        results.push(self.check_database("task database", &self.db_path));

        Ok(results)
    }

    fn check_path(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::error(name, format!("{} is missing", path.display()))
        }
    }

    fn check_directory(&self, name: &str, path: &Path) -> HealthEntry {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
            Ok(_) => HealthEntry::warn(name, format!("{} is not a directory", path.display())),
            Err(_) => HealthEntry::warn(name, format!("{} not created yet", path.display())),
        }
    }

    fn check_database(&self, name: &str, path: &Path) -> HealthEntry {
        if !path.exists() {
            return HealthEntry::warn(name, format!("{} not created yet", path.display()));
        }
        match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
            Ok(conn) => {
                let pragma: rusqlite::Result<String> =
                    conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0));
                match pragma {
                    Ok(result) if result.to_lowercase() == "ok" => {
                        HealthEntry::ok(name, "integrity ok".to_string())
                    }
                    Ok(result) => HealthEntry::warn(name, format!("integrity_check: {result}")),
                    Err(err) => HealthEntry::warn(name, format!("integrity_check failed: {err}")),
                }
            }
            Err(err) => HealthEntry::error(name, format!("cannot open: {err}")),
        }
    }

    fn open_store(&self) -> Result<SqliteTaskStore> {
        if !self.db_path.exists() {
            return Err(AppError::MissingResource(format!(
                "task database missing: {}",
                self.db_path.display()
            )));
        }
        let store = SqliteTaskStore::builder()
            .path(&self.db_path)
            .read_only(true)
            .build()?;
        Ok(store)
    }
}

#[derive(Debug, Serialize)]
pub struct RunOutcome {
    pub task_id: String,
    pub software_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub steps_recorded: usize,
}

impl RunOutcome {
    fn from_task(task: &AutomationTask, steps_recorded: usize) -> Self {
        Self {
            task_id: task.task_id.clone(),
            software_id: task.software_id.clone(),
            status: task.status,
            generated_email: task.generated_email.clone(),
            account_id: task.account_id.clone(),
            error_message: task.error_message.clone(),
            duration_ms: task.duration_ms,
            steps_recorded,
        }
    }
}

impl DisplayFallback for RunOutcome {
    fn display(&self) -> String {
        match self.status {
            TaskStatus::Success => format!(
                "{}: account {} ({}) created in {}ms",
                self.task_id,
                self.account_id.as_deref().unwrap_or("-"),
                self.generated_email.as_deref().unwrap_or("-"),
                self.duration_ms.unwrap_or(0)
            ),
            TaskStatus::Blocked => format!(
                "{}: blocked, {}",
                self.task_id,
                self.error_message.as_deref().unwrap_or("manual follow-up needed")
            ),
            TaskStatus::Failed => format!(
                "{}: failed, {}",
                self.task_id,
                self.error_message.as_deref().unwrap_or("no error recorded")
            ),
            TaskStatus::Cancelled => format!("{}: cancelled before completion", self.task_id),
            status => format!("{}: {}", self.task_id, status),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskReport {
    pub task: AutomationTask,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_email: Option<String>,
}

impl DisplayFallback for TaskReport {
    fn display(&self) -> String {
        let task = &self.task;
        let mut lines = vec![
            format!("{} target={}", task.task_id, task.software_id),
            format!(
                "status={} step={}/{} attempt={}/{}",
                task.status,
                task.current_step,
                task.total_steps,
                task.retry_count + 1,
                task.max_retries + 1
            ),
        ];
        if let Some(email) = &task.generated_email {
            lines.push(format!("email={email}"));
        }
        if let Some(account_id) = &task.account_id {
            let email = self.account_email.as_deref().unwrap_or("-");
            lines.push(format!("account={account_id} ({email})"));
        }
        if let Some(error) = &task.error_message {
            lines.push(format!("error={error}"));
        }
        if let Some(ms) = task.duration_ms {
            lines.push(format!("duration={ms}ms"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct TraceReport {
    pub task_id: String,
    pub rows: Vec<StepRecord>,
}

impl DisplayFallback for TraceReport {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No steps recorded".to_string();
        }
        let mut lines = Vec::new();
        for row in &self.rows {
            let mut line = format!(
                "#{} attempt={} step={} {} [{}] {}ms",
                row.seq, row.attempt, row.step_number, row.name, row.outcome, row.duration_ms
            );
            if let Some(error) = &row.error {
                line.push_str(&format!(" error={error}"));
            }
            if let Some(screenshot) = &row.screenshot {
                line.push_str(&format!(" screenshot={screenshot}"));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct TaskList {
    pub rows: Vec<AutomationTask>,
}

impl DisplayFallback for TaskList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No tasks recorded".to_string();
        }
        let mut lines = Vec::new();
        for task in &self.rows {
            lines.push(format!(
                "{} | {} | status={} | step={}/{} | retries={} | email={}",
                task.task_id,
                task.software_id,
                task.status,
                task.current_step,
                task.total_steps,
                task.retry_count,
                task.generated_email.as_deref().unwrap_or("-")
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct CancelOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    pub cancelled: bool,
    pub note: String,
}

impl DisplayFallback for CancelOutcome {
    fn display(&self) -> String {
        format!("{}: {} (status={})", self.task_id, self.note, self.status)
    }
}

#[derive(Debug, Serialize)]
pub struct TargetList {
    pub targets: Vec<String>,
}

impl DisplayFallback for TargetList {
    fn display(&self) -> String {
        self.targets.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for HealthEntry {
    fn display(&self) -> String {
        format!(
            "[{status}] {name}: {detail}",
            status = self.status,
            name = self.name,
            detail = self.detail
        )
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for entry in self {
            lines.push(entry.display());
        }
        lines.join("\n")
    }
}
