use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::artifacts::{ArtifactResult, ArtifactStore};
use crate::automator::{AutomatorRegistry, SiteAutomator};
use crate::challenge::{ChallengeError, ChallengeHandler, Resolution};
use crate::config::{EngineSection, EnlistConfig};
use crate::credentials::CredentialGenerator;
use crate::mailbox::MailboxPoller;
use crate::notify::{Notifier, TaskEvent};
use crate::session::{SessionFactory, SignupSession};

use super::error::{AutomationError, ErrorClass, StoreError, StoreResult, TaskResult};
use super::models::{
    AttemptOutcome, AttemptReport, AutomationTask, Credentials, StatusPatch, StepOutcome,
    StepRecord, TaskSnapshot, TaskStatus,
};
use super::retry::RetryPolicy;
use super::store::{CredentialSink, TaskStore};

const STEPS_WITHOUT_MAILBOX: u32 = 9;
const STEPS_WITH_MAILBOX: u32 = 10;

/// What a caller hands to `submit`.
#[derive(Debug, Clone)]
pub struct SignupRequest {
    pub software_id: String,
    pub email_domain_hint: Option<String>,
    pub usage_context: Option<String>,
}

impl SignupRequest {
    pub fn new(software_id: impl Into<String>) -> Self {
        Self {
            software_id: software_id.into(),
            email_domain_hint: None,
            usage_context: None,
        }
    }
}

/// Runs signup tasks through their whole lifecycle: queueing, the per-attempt
/// step sequence, retry scheduling, and the terminal hand-off of credentials.
/// One engine owns one dispatcher; tasks run concurrently up to the
/// configured ceiling.
pub struct AutomationEngine {
    inner: Arc<EngineInner>,
    submit_tx: Option<mpsc::Sender<String>>,
    dispatcher: Option<JoinHandle<()>>,
}

struct EngineInner {
    engine: EngineSection,
    mailbox_timeout: Duration,
    store: Arc<dyn TaskStore>,
    sink: Arc<dyn CredentialSink>,
    notifier: Arc<dyn Notifier>,
    registry: AutomatorRegistry,
    sessions: Arc<dyn SessionFactory>,
    mailbox: MailboxPoller,
    challenges: ChallengeHandler,
    credentials: CredentialGenerator,
    artifacts: ArtifactStore,
    retry: RetryPolicy,
    cancelled: Mutex<HashSet<String>>,
}

impl AutomationEngine {
    /// Wires the collaborators together and spawns the dispatcher. The
    /// returned engine accepts submissions immediately.
    pub fn start(
        config: &EnlistConfig,
        store: Arc<dyn TaskStore>,
        sink: Arc<dyn CredentialSink>,
        notifier: Arc<dyn Notifier>,
        registry: AutomatorRegistry,
        sessions: Arc<dyn SessionFactory>,
        mailbox: MailboxPoller,
    ) -> Self {
        let inner = Arc::new(EngineInner {
            engine: config.engine.clone(),
            mailbox_timeout: config.mailbox.message_timeout(),
            store,
            sink,
            notifier,
            registry,
            sessions,
            mailbox,
            challenges: ChallengeHandler::new(config.challenge.clone()),
            credentials: CredentialGenerator::new(config.credentials.clone()),
            artifacts: ArtifactStore::new(config.artifacts.clone()),
            retry: RetryPolicy::new(&config.engine),
            cancelled: Mutex::new(HashSet::new()),
        });
        match inner.artifacts.sweep_expired() {
            Ok(removed) if !removed.is_empty() => {
                debug!(count = removed.len(), "stale artifacts swept at startup")
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "artifact sweep failed at startup"),
        }
        let (submit_tx, submit_rx) = mpsc::channel(config.engine.queue_depth);
        let concurrency = config.engine.concurrency;
        let dispatcher = tokio::spawn(Self::dispatch(inner.clone(), submit_rx, concurrency));
        info!(
            concurrency,
            targets = inner.registry.supported_targets().len(),
            "automation engine started"
        );
        Self {
            inner,
            submit_tx: Some(submit_tx),
            dispatcher: Some(dispatcher),
        }
    }

    async fn dispatch(
        inner: Arc<EngineInner>,
        submit_rx: mpsc::Receiver<String>,
        concurrency: usize,
    ) {
        ReceiverStream::new(submit_rx)
            .for_each_concurrent(concurrency, |task_id| {
                let inner = inner.clone();
                async move {
                    if let Err(err) = Self::run_task(inner, task_id.clone()).await {
                        error!(%task_id, error = %err, "task run aborted on store failure");
                    }
                }
            })
            .await;
        debug!("dispatcher drained");
    }

    /// Creates the task record and enqueues it. An unsupported target is
    /// settled on the spot: one trace step, FAILED, never enqueued.
    pub async fn submit(&self, request: SignupRequest) -> StoreResult<String> {
        let mut task = AutomationTask::new(request.software_id, self.inner.engine.max_retries);
        task.email_domain_hint = request.email_domain_hint;
        task.usage_context = request.usage_context;
        self.inner.store.create(&task).await?;
        info!(task_id = %task.task_id, software_id = %task.software_id, "task accepted");

        if self.inner.registry.get(&task.software_id).is_none() {
            self.inner.fail_unsupported(&mut task).await?;
            return Ok(task.task_id);
        }

        if let Some(tx) = &self.submit_tx {
            if tx.send(task.task_id.clone()).await.is_err() {
                warn!(task_id = %task.task_id, "dispatcher not accepting work; task stays pending");
            }
        }
        Ok(task.task_id)
    }

    /// Flags the task for cancellation. A running attempt notices at its next
    /// step boundary; blocked tasks settle immediately; terminal tasks are
    /// left alone.
    pub async fn cancel(&self, task_id: &str) -> StoreResult<()> {
        let Some(mut task) = self.inner.store.get(task_id).await? else {
            return Err(StoreError::NotFound {
                task_id: task_id.to_string(),
            });
        };
        if task.status.terminal() {
            debug!(task_id, status = %task.status, "cancel ignored, task already settled");
            return Ok(());
        }
        if task.status == TaskStatus::Blocked {
            let now = Utc::now();
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(now);
            self.inner
                .store
                .update_status(
                    task_id,
                    TaskStatus::Cancelled,
                    StatusPatch {
                        completed_at: Some(now),
                        ..Default::default()
                    },
                )
                .await?;
            info!(task_id, "blocked task cancelled");
            self.inner.publish(&task).await;
            return Ok(());
        }
        self.inner
            .cancelled
            .lock()
            .await
            .insert(task_id.to_string());
        info!(task_id, "cancellation requested");
        Ok(())
    }

    pub async fn status(&self, task_id: &str) -> StoreResult<TaskSnapshot> {
        let task = self
            .inner
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                task_id: task_id.to_string(),
            })?;
        Ok(TaskSnapshot::of(&task))
    }

    pub async fn trace(&self, task_id: &str) -> StoreResult<Vec<StepRecord>> {
        self.inner.store.steps(task_id).await
    }

    pub fn supported_targets(&self) -> Vec<String> {
        self.inner.registry.supported_targets()
    }

    /// Drops expired debugging captures per the retention window.
    pub fn sweep_artifacts(&self) -> ArtifactResult<Vec<PathBuf>> {
        self.inner.artifacts.sweep_expired()
    }

    /// Stops accepting submissions and waits for everything in flight to
    /// settle.
    pub async fn shutdown(mut self) {
        self.submit_tx.take();
        if let Some(handle) = self.dispatcher.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "dispatcher join error");
            }
        }
        info!("automation engine stopped");
    }

    async fn run_task(inner: Arc<EngineInner>, task_id: String) -> StoreResult<()> {
        let Some(mut task) = inner.store.get(&task_id).await? else {
            error!(%task_id, "queued task vanished from the store");
            return Ok(());
        };
        if task.status.terminal() {
            debug!(%task_id, status = %task.status, "queued task already settled");
            return Ok(());
        }
        let Some(automator) = inner.registry.get(&task.software_id) else {
            return inner.fail_unsupported(&mut task).await;
        };

        let run_started = Instant::now();
        let total_steps = if automator.requires_email_verification() {
            STEPS_WITH_MAILBOX
        } else {
            STEPS_WITHOUT_MAILBOX
        };
        task.status = TaskStatus::Running;
        task.total_steps = total_steps;
        task.started_at = Some(Utc::now());
        inner
            .store
            .update_status(
                &task_id,
                TaskStatus::Running,
                StatusPatch {
                    total_steps: Some(total_steps),
                    started_at: task.started_at,
                    ..Default::default()
                },
            )
            .await?;
        info!(%task_id, software_id = %task.software_id, "task started");

        loop {
            if inner.is_cancelled(&task_id).await {
                return Self::settle_cancelled(&inner, &mut task, run_started).await;
            }
            let attempt = task.retry_count + 1;
            debug!(%task_id, attempt, "attempt started");
            let report = Self::run_attempt(&inner, &task, automator.as_ref(), attempt).await?;
            debug!(
                %task_id,
                attempt,
                elapsed_ms = report.elapsed.as_millis() as u64,
                screenshots = report.screenshots.len(),
                "attempt finished"
            );
            match report.outcome {
                AttemptOutcome::Completed {
                    credentials,
                    tokens,
                } => {
                    return Self::settle_success(
                        &inner,
                        &mut task,
                        credentials,
                        tokens,
                        run_started,
                    )
                    .await;
                }
                AttemptOutcome::Cancelled => {
                    return Self::settle_cancelled(&inner, &mut task, run_started).await;
                }
                AttemptOutcome::Blocked { reason } => {
                    return Self::settle_blocked(&inner, &mut task, reason).await;
                }
                AttemptOutcome::Failed { class, message } => {
                    let retryable =
                        class == ErrorClass::Transient && inner.retry.allows(task.retry_count);
                    if !retryable {
                        return Self::settle_failed(&inner, &mut task, message, run_started).await;
                    }
                    task.retry_count += 1;
                    let delay = inner.retry.delay_for(task.retry_count);
                    task.error_message = Some(message.clone());
                    inner
                        .store
                        .update_status(
                            &task_id,
                            TaskStatus::RetryScheduled,
                            StatusPatch {
                                retry_count: Some(task.retry_count),
                                error_message: Some(message),
                                ..Default::default()
                            },
                        )
                        .await?;
                    info!(
                        %task_id,
                        retry_count = task.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "retry scheduled"
                    );
                    sleep(delay).await;
                    if inner.is_cancelled(&task_id).await {
                        return Self::settle_cancelled(&inner, &mut task, run_started).await;
                    }
                    task.status = TaskStatus::Running;
                    inner
                        .store
                        .update_status(&task_id, TaskStatus::Running, StatusPatch::default())
                        .await?;
                }
            }
        }
    }

    /// One full pass through the step sequence. Credentials are minted fresh
    /// here so no attempt ever reuses an identity; the session opened here is
    /// closed here, on every path.
    async fn run_attempt(
        inner: &EngineInner,
        task: &AutomationTask,
        automator: &dyn SiteAutomator,
        attempt: u32,
    ) -> StoreResult<AttemptReport> {
        let attempt_started = Instant::now();
        let mut ctx = AttemptCtx {
            inner,
            task_id: &task.task_id,
            attempt,
            step_number: 0,
            step_timeout: inner.engine.step_timeout(),
            screenshots: Vec::new(),
        };

        let credentials = inner.credentials.generate(task.email_domain_hint.as_deref());
        let generated = ctx
            .step(
                "generate_credentials",
                "mint mailbox identity and password".to_string(),
                None,
                Some(credentials.summary()),
                async { Ok(()) },
            )
            .await?;
        if let Err(err) = generated {
            return Ok(Self::report_failure(ctx, attempt, attempt_started, err));
        }
        inner
            .store
            .update_status(
                &task.task_id,
                TaskStatus::Running,
                StatusPatch {
                    generated_email: Some(credentials.email.clone()),
                    ..Default::default()
                },
            )
            .await?;

        if inner.is_cancelled(&task.task_id).await {
            return Ok(Self::report_failure(
                ctx,
                attempt,
                attempt_started,
                AutomationError::Cancelled,
            ));
        }

        // The session is created outside the step helper: if the trace write
        // fails after a successful launch, the browser still has to be
        // released before the store error aborts the run.
        let launch_started = Instant::now();
        let launched = match timeout(ctx.step_timeout, inner.sessions.create()).await {
            Ok(created) => created.map_err(AutomationError::from),
            Err(_) => Err(AutomationError::StepTimeout {
                step: "launch_session".to_string(),
                timeout_secs: ctx.step_timeout.as_secs(),
            }),
        };
        let recorded = ctx
            .record(
                "launch_session",
                "launch driven browser".to_string(),
                None,
                None,
                launch_started.elapsed(),
                launched.as_ref().err().map(|err| err.to_string()),
            )
            .await;
        if let Err(store_err) = recorded {
            if let Ok(mut session) = launched {
                if let Err(err) = session.close().await {
                    warn!(task_id = %task.task_id, error = %err, "session close failed");
                }
            }
            return Err(store_err);
        }
        let mut session = match launched {
            Ok(session) => session,
            Err(err) => return Ok(Self::report_failure(ctx, attempt, attempt_started, err)),
        };

        let drive = Self::drive(&mut ctx, session.as_mut(), automator, &credentials).await;
        if let Err(err) = session.close().await {
            warn!(task_id = %task.task_id, error = %err, "session close failed");
        }
        match drive? {
            Ok(tokens) => Ok(AttemptReport {
                attempt,
                outcome: AttemptOutcome::Completed {
                    credentials,
                    tokens,
                },
                screenshots: ctx.screenshots,
                elapsed: attempt_started.elapsed(),
            }),
            Err(err) => Ok(Self::report_failure(ctx, attempt, attempt_started, err)),
        }
    }

    /// The session-bound middle of an attempt, separated out so the caller
    /// can close the session no matter how this returns.
    async fn drive(
        ctx: &mut AttemptCtx<'_>,
        session: &mut dyn SignupSession,
        automator: &dyn SiteAutomator,
        credentials: &Credentials,
    ) -> StoreResult<Result<HashMap<String, String>, AutomationError>> {
        let inner = ctx.inner;

        if inner.is_cancelled(ctx.task_id).await {
            return Ok(Err(AutomationError::Cancelled));
        }
        let result = ctx
            .step(
                "navigate",
                "open the signup page".to_string(),
                Some(automator.signup_url().to_string()),
                None,
                automator.navigate_to_signup(&mut *session),
            )
            .await?;
        if let Err(err) = result {
            ctx.capture_evidence(&mut *session, "navigate").await?;
            return Ok(Err(err));
        }

        if inner.is_cancelled(ctx.task_id).await {
            return Ok(Err(AutomationError::Cancelled));
        }
        let result = ctx
            .step(
                "challenge_scan",
                "probe for anti-bot widgets".to_string(),
                None,
                None,
                inner.scan_challenges(&mut *session),
            )
            .await?;
        if let Err(err) = result {
            ctx.capture_evidence(&mut *session, "challenge_scan").await?;
            return Ok(Err(err));
        }

        if inner.is_cancelled(ctx.task_id).await {
            return Ok(Err(AutomationError::Cancelled));
        }
        let result = ctx
            .step(
                "fill_form",
                "type signup form".to_string(),
                None,
                Some(credentials.summary()),
                automator.fill_signup_form(&mut *session, credentials),
            )
            .await?;
        if let Err(err) = result {
            ctx.capture_evidence(&mut *session, "fill_form").await?;
            return Ok(Err(err));
        }

        if inner.is_cancelled(ctx.task_id).await {
            return Ok(Err(AutomationError::Cancelled));
        }
        let result = ctx
            .step(
                "submit_form",
                "submit signup form".to_string(),
                None,
                None,
                automator.submit_form(&mut *session),
            )
            .await?;
        if let Err(err) = result {
            ctx.capture_evidence(&mut *session, "submit_form").await?;
            return Ok(Err(err));
        }

        if inner.is_cancelled(ctx.task_id).await {
            return Ok(Err(AutomationError::Cancelled));
        }
        let result = ctx
            .step(
                "challenge_recheck",
                "re-probe widgets after submit".to_string(),
                None,
                None,
                inner.scan_challenges(&mut *session),
            )
            .await?;
        if let Err(err) = result {
            ctx.capture_evidence(&mut *session, "challenge_recheck")
                .await?;
            return Ok(Err(err));
        }

        if inner.is_cancelled(ctx.task_id).await {
            return Ok(Err(AutomationError::Cancelled));
        }
        let verify = {
            let s = &mut *session;
            async move {
                match automator.verify_account_created(s).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(AutomationError::VerificationNotConfirmed),
                    Err(err) => Err(err),
                }
            }
        };
        let result = ctx
            .step(
                "verify_account",
                "confirm account creation".to_string(),
                None,
                None,
                verify,
            )
            .await?;
        if let Err(err) = result {
            ctx.capture_evidence(&mut *session, "verify_account").await?;
            return Ok(Err(err));
        }

        if automator.requires_email_verification() {
            if inner.is_cancelled(ctx.task_id).await {
                return Ok(Err(AutomationError::Cancelled));
            }
            // the mailbox wait has its own budget on top of the step budget
            let budget = ctx.step_timeout + inner.mailbox_timeout;
            let result = ctx
                .step_with_budget(
                    "email_verification",
                    "confirm the mailbox round trip".to_string(),
                    Some(credentials.email.clone()),
                    None,
                    budget,
                    automator.handle_email_verification(
                        &mut *session,
                        &inner.mailbox,
                        &credentials.email,
                        inner.mailbox_timeout,
                    ),
                )
                .await?;
            if let Err(err) = result {
                ctx.capture_evidence(&mut *session, "email_verification")
                    .await?;
                return Ok(Err(err));
            }
        }

        if inner.is_cancelled(ctx.task_id).await {
            return Ok(Err(AutomationError::Cancelled));
        }
        let tokens = match ctx
            .step(
                "extract_tokens",
                "collect provisioning tokens".to_string(),
                None,
                None,
                automator.extract_api_tokens(&mut *session),
            )
            .await?
        {
            Ok(tokens) => tokens,
            Err(err) => {
                warn!(task_id = ctx.task_id, error = %err, "token extraction failed, continuing without tokens");
                HashMap::new()
            }
        };
        Ok(Ok(tokens))
    }

    fn report_failure(
        ctx: AttemptCtx<'_>,
        attempt: u32,
        started: Instant,
        err: AutomationError,
    ) -> AttemptReport {
        let outcome = if matches!(err, AutomationError::Cancelled) {
            AttemptOutcome::Cancelled
        } else {
            match err.class() {
                ErrorClass::Blocked => AttemptOutcome::Blocked {
                    reason: err.to_string(),
                },
                class => AttemptOutcome::Failed {
                    class,
                    message: err.to_string(),
                },
            }
        };
        AttemptReport {
            attempt,
            outcome,
            screenshots: ctx.screenshots,
            elapsed: started.elapsed(),
        }
    }

    async fn settle_success(
        inner: &EngineInner,
        task: &mut AutomationTask,
        credentials: Credentials,
        tokens: HashMap<String, String>,
        run_started: Instant,
    ) -> StoreResult<()> {
        let account_id = match inner
            .sink
            .store(&task.task_id, &credentials, &tokens)
            .await
        {
            Ok(account_id) => account_id,
            Err(err) => {
                // the account may exist on the target, but we lost our handle
                error!(task_id = %task.task_id, error = %err, "credential hand-off failed");
                return Self::settle_failed(
                    inner,
                    task,
                    format!("credential sink error: {err}"),
                    run_started,
                )
                .await;
            }
        };
        let now = Utc::now();
        let duration = run_started.elapsed().as_millis() as i64;
        task.status = TaskStatus::Success;
        task.success = true;
        task.generated_email = Some(credentials.email.clone());
        task.account_id = Some(account_id.clone());
        task.error_message = None;
        task.completed_at = Some(now);
        task.duration_ms = Some(duration);
        inner
            .store
            .update_status(
                &task.task_id,
                TaskStatus::Success,
                StatusPatch {
                    generated_email: Some(credentials.email.clone()),
                    success: Some(true),
                    account_id: Some(account_id.clone()),
                    completed_at: Some(now),
                    duration_ms: Some(duration),
                    ..Default::default()
                },
            )
            .await?;
        inner.clear_cancelled(&task.task_id).await;
        info!(
            task_id = %task.task_id,
            %account_id,
            tokens = tokens.len(),
            duration_ms = duration,
            "task succeeded"
        );
        inner.publish(task).await;
        Ok(())
    }

    async fn settle_failed(
        inner: &EngineInner,
        task: &mut AutomationTask,
        message: String,
        run_started: Instant,
    ) -> StoreResult<()> {
        let now = Utc::now();
        let duration = run_started.elapsed().as_millis() as i64;
        task.status = TaskStatus::Failed;
        task.error_message = Some(message.clone());
        task.completed_at = Some(now);
        task.duration_ms = Some(duration);
        inner
            .store
            .update_status(
                &task.task_id,
                TaskStatus::Failed,
                StatusPatch {
                    error_message: Some(message.clone()),
                    success: Some(false),
                    completed_at: Some(now),
                    duration_ms: Some(duration),
                    ..Default::default()
                },
            )
            .await?;
        inner.clear_cancelled(&task.task_id).await;
        warn!(task_id = %task.task_id, error = %message, "task failed");
        inner.publish(task).await;
        Ok(())
    }

    /// BLOCKED is a resting state, not a terminal one: no completion stamp,
    /// and a later resubmission starts with fresh credentials.
    async fn settle_blocked(
        inner: &EngineInner,
        task: &mut AutomationTask,
        reason: String,
    ) -> StoreResult<()> {
        task.status = TaskStatus::Blocked;
        task.error_message = Some(reason.clone());
        inner
            .store
            .update_status(
                &task.task_id,
                TaskStatus::Blocked,
                StatusPatch {
                    error_message: Some(reason.clone()),
                    ..Default::default()
                },
            )
            .await?;
        inner.clear_cancelled(&task.task_id).await;
        warn!(task_id = %task.task_id, %reason, "task blocked");
        inner.publish(task).await;
        Ok(())
    }

    async fn settle_cancelled(
        inner: &EngineInner,
        task: &mut AutomationTask,
        run_started: Instant,
    ) -> StoreResult<()> {
        let now = Utc::now();
        let duration = run_started.elapsed().as_millis() as i64;
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(now);
        task.duration_ms = Some(duration);
        inner
            .store
            .update_status(
                &task.task_id,
                TaskStatus::Cancelled,
                StatusPatch {
                    completed_at: Some(now),
                    duration_ms: Some(duration),
                    ..Default::default()
                },
            )
            .await?;
        inner.clear_cancelled(&task.task_id).await;
        info!(task_id = %task.task_id, "task cancelled");
        inner.publish(task).await;
        Ok(())
    }
}

impl Drop for AutomationEngine {
    fn drop(&mut self) {
        if let Some(handle) = &self.dispatcher {
            if !handle.is_finished() {
                warn!("AutomationEngine dropped without explicit shutdown");
            }
        }
    }
}

impl EngineInner {
    async fn is_cancelled(&self, task_id: &str) -> bool {
        self.cancelled.lock().await.contains(task_id)
    }

    async fn clear_cancelled(&self, task_id: &str) {
        self.cancelled.lock().await.remove(task_id);
    }

    /// Fire-and-forget: delivery runs on its own task so a slow or stalled
    /// receiver never holds up a settle path or a worker slot.
    async fn publish(&self, task: &AutomationTask) {
        let event = TaskEvent::from_task(task);
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            if let Err(err) = notifier.notify(&event).await {
                warn!(task_id = %event.task_id, error = %err, "notification failed");
            }
        });
    }

    async fn scan_challenges(&self, session: &mut dyn SignupSession) -> TaskResult<()> {
        let detected = self.challenges.detect(session).await?;
        if !detected {
            return Ok(());
        }
        match self.challenges.resolve(session).await? {
            Resolution::Solved => Ok(()),
            Resolution::Blocked(reason) => Err(AutomationError::Challenge(
                ChallengeError::Unresolved { reason },
            )),
        }
    }

    async fn fail_unsupported(&self, task: &mut AutomationTask) -> StoreResult<()> {
        let err = AutomationError::UnsupportedTarget(task.software_id.clone());
        let mut step = StepRecord::new(1, 1, "resolve_target");
        step.outcome = StepOutcome::Failure;
        step.action = "look up site automator".to_string();
        step.error = Some(err.to_string());
        self.store.append_step(&task.task_id, &step).await?;
        let now = Utc::now();
        task.status = TaskStatus::Failed;
        task.error_message = Some(err.to_string());
        task.completed_at = Some(now);
        task.duration_ms = Some(0);
        self.store
            .update_status(
                &task.task_id,
                TaskStatus::Failed,
                StatusPatch {
                    current_step: Some(1),
                    total_steps: Some(1),
                    error_message: task.error_message.clone(),
                    success: Some(false),
                    completed_at: Some(now),
                    duration_ms: Some(0),
                    ..Default::default()
                },
            )
            .await?;
        warn!(task_id = %task.task_id, software_id = %task.software_id, "unsupported target");
        self.publish(task).await;
        Ok(())
    }
}

/// Bookkeeping shared by the steps of one attempt: numbering, the per-step
/// budget, and the screenshots captured along the way.
struct AttemptCtx<'a> {
    inner: &'a EngineInner,
    task_id: &'a str,
    attempt: u32,
    step_number: u32,
    step_timeout: Duration,
    screenshots: Vec<String>,
}

impl AttemptCtx<'_> {
    async fn step<T, F>(
        &mut self,
        name: &str,
        action: String,
        selector: Option<String>,
        input_summary: Option<String>,
        op: F,
    ) -> StoreResult<TaskResult<T>>
    where
        F: Future<Output = TaskResult<T>>,
    {
        let budget = self.step_timeout;
        self.step_with_budget(name, action, selector, input_summary, budget, op)
            .await
    }

    /// Runs one step under its budget and appends the trace record, win or
    /// lose.
    async fn step_with_budget<T, F>(
        &mut self,
        name: &str,
        action: String,
        selector: Option<String>,
        input_summary: Option<String>,
        budget: Duration,
        op: F,
    ) -> StoreResult<TaskResult<T>>
    where
        F: Future<Output = TaskResult<T>>,
    {
        let started = Instant::now();
        let result = match timeout(budget, op).await {
            Ok(result) => result,
            Err(_) => Err(AutomationError::StepTimeout {
                step: name.to_string(),
                timeout_secs: budget.as_secs(),
            }),
        };
        self.record(
            name,
            action,
            selector,
            input_summary,
            started.elapsed(),
            result.as_ref().err().map(|err| err.to_string()),
        )
        .await?;
        if let Err(err) = &result {
            debug!(task_id = self.task_id, step = name, error = %err, "step failed");
        }
        Ok(result)
    }

    /// Appends one trace record with the next step number of this attempt and
    /// advances the task's `current_step`.
    async fn record(
        &mut self,
        name: &str,
        action: String,
        selector: Option<String>,
        input_summary: Option<String>,
        duration: Duration,
        error: Option<String>,
    ) -> StoreResult<()> {
        self.step_number += 1;
        let mut record = StepRecord::new(self.attempt, self.step_number, name);
        record.action = action;
        record.selector = selector;
        record.input_summary = input_summary;
        record.duration_ms = duration.as_millis() as i64;
        if let Some(error) = error {
            record.outcome = StepOutcome::Failure;
            record.error = Some(error);
        }
        self.inner.store.append_step(self.task_id, &record).await?;
        self.inner
            .store
            .update_status(
                self.task_id,
                TaskStatus::Running,
                StatusPatch {
                    current_step: Some(self.step_number),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Appends a screenshot record for the step that just failed, under its
    /// own step number. Capture problems are logged and swallowed; evidence
    /// is never worth failing over.
    async fn capture_evidence(
        &mut self,
        session: &mut dyn SignupSession,
        failed_step: &str,
    ) -> StoreResult<()> {
        let bytes = match session.screenshot().await {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(task_id = self.task_id, error = %err, "failure screenshot unavailable");
                return Ok(());
            }
        };
        self.step_number += 1;
        match self.inner.artifacts.save_screenshot(
            self.task_id,
            self.attempt,
            self.step_number,
            failed_step,
            &bytes,
        ) {
            Ok(path) => {
                let path = path.to_string_lossy().into_owned();
                let mut record = StepRecord::new(self.attempt, self.step_number, "failure_screenshot");
                record.action = format!("capture evidence for {failed_step}");
                record.screenshot = Some(path.clone());
                self.inner.store.append_step(self.task_id, &record).await?;
                self.screenshots.push(path);
            }
            Err(err) => {
                debug!(task_id = self.task_id, error = %err, "screenshot not stored");
            }
        }
        Ok(())
    }
}
