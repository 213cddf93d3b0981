pub mod artifacts;
pub mod automator;
pub mod challenge;
pub mod config;
pub mod credentials;
pub mod error;
pub mod mailbox;
pub mod notify;
pub mod session;
pub mod sqlite;
pub mod task;

pub use artifacts::{ArtifactError, ArtifactResult, ArtifactStore};
pub use automator::{AutomatorRegistry, SiteAutomator};
pub use challenge::{ChallengeError, ChallengeHandler, ChallengeResult, Resolution};
pub use config::{
    ArtifactSection, BrowserSection, ChallengeSection, CredentialSection, EngineSection,
    EnlistConfig, MailboxSection, NotifySection, StorageSection,
};
pub use credentials::CredentialGenerator;
pub use error::{ConfigError, Result};
pub use mailbox::{
    HttpMailboxProvider, LinkExtractor, MailboxError, MailboxMessage, MailboxPoller,
    MailboxProvider, MailboxResult,
};
pub use notify::{Notifier, NotifyError, NotifyResult, NullNotifier, TaskEvent, WebhookNotifier};
pub use session::{
    BrowserLauncher, ChromiumSessionFactory, LaunchOverrides, SessionError, SessionFactory,
    SessionResult, SignupSession,
};
pub use task::{
    AutomationEngine, AutomationError, AutomationTask, CredentialSink, Credentials, ErrorClass,
    RetryPolicy, SignupRequest, SinkError, SinkResult, SqliteTaskStore, SqliteTaskStoreBuilder,
    StatusPatch, StepOutcome, StepRecord, StoreError, StoreResult, TaskResult, TaskSnapshot,
    TaskStatus, TaskStore,
};
