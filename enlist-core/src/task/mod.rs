pub mod engine;
pub mod error;
pub mod models;
pub mod retry;
pub mod store;

pub use engine::{AutomationEngine, SignupRequest};
pub use error::{
    AutomationError, ErrorClass, SinkError, SinkResult, StoreError, StoreResult, TaskResult,
};
pub use models::{
    AttemptOutcome, AttemptReport, AutomationTask, Credentials, StatusPatch, StepOutcome,
    StepRecord, TaskSnapshot, TaskStatus,
};
pub use retry::RetryPolicy;
pub use store::{CredentialSink, SqliteTaskStore, SqliteTaskStoreBuilder, TaskStore};
