use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::challenge::ChallengeError;
use crate::mailbox::MailboxError;
use crate::session::SessionError;

/// Failure class the state machine routes on. Every error the engine sees
/// maps to exactly one class; there is no unknown bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    NonTransient,
    Blocked,
    Internal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::NonTransient => "non_transient",
            ErrorClass::Blocked => "blocked",
            ErrorClass::Internal => "internal",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task {task_id} not found")]
    NotFound { task_id: String },
    #[error("task store path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("credential sink rejected task {task_id}: {reason}")]
    Rejected { task_id: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SinkResult<T> = std::result::Result<T, SinkError>;

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("unsupported target: {0}")]
    UnsupportedTarget(String),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("signup rejected: {0}")]
    Rejected(String),
    #[error("duplicate account: {0}")]
    DuplicateAccount(String),
    #[error("could not verify creation")]
    VerificationNotConfirmed,
    #[error("no verification message arrived for {address}")]
    VerificationMessageMissing { address: String },
    #[error("verification message for {address} carried no usable link")]
    VerificationLinkMissing { address: String },
    #[error("challenge error: {0}")]
    Challenge(#[from] ChallengeError),
    #[error("mailbox error: {0}")]
    Mailbox(#[from] MailboxError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("credential sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("step {step} exceeded its {timeout_secs}s budget")]
    StepTimeout { step: String, timeout_secs: u64 },
    #[error("task cancelled")]
    Cancelled,
    #[error("internal fault: {0}")]
    Internal(String),
}

pub type TaskResult<T> = std::result::Result<T, AutomationError>;

impl AutomationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AutomationError::Session(err) => classify_session(err),
            AutomationError::UnsupportedTarget(_)
            | AutomationError::Rejected(_)
            | AutomationError::DuplicateAccount(_)
            | AutomationError::VerificationNotConfirmed
            | AutomationError::VerificationMessageMissing { .. }
            | AutomationError::VerificationLinkMissing { .. } => ErrorClass::NonTransient,
            AutomationError::Challenge(_) => ErrorClass::Blocked,
            AutomationError::Mailbox(_) => ErrorClass::Transient,
            AutomationError::StepTimeout { .. } => ErrorClass::Transient,
            AutomationError::Store(_)
            | AutomationError::Sink(_)
            | AutomationError::Cancelled
            | AutomationError::Internal(_) => ErrorClass::Internal,
        }
    }
}

fn classify_session(err: &SessionError) -> ErrorClass {
    match err {
        SessionError::Launch(_)
        | SessionError::Navigation { .. }
        | SessionError::Timeout(_)
        | SessionError::Stale(_) => ErrorClass::Transient,
        SessionError::Cdp(inner) => {
            let text = inner.to_string().to_lowercase();
            if text.contains("timeout") || text.contains("connection") {
                ErrorClass::Transient
            } else {
                ErrorClass::Internal
            }
        }
        SessionError::ElementMissing(_) => ErrorClass::NonTransient,
        SessionError::Configuration(_)
        | SessionError::Evaluate(_)
        | SessionError::Io(_)
        | SessionError::Unexpected(_) => ErrorClass::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_stale_elements_are_transient() {
        let timeout = AutomationError::Session(SessionError::Timeout("selector".into()));
        assert_eq!(timeout.class(), ErrorClass::Transient);

        let stale = AutomationError::Session(SessionError::Stale("form input".into()));
        assert_eq!(stale.class(), ErrorClass::Transient);

        let budget = AutomationError::StepTimeout {
            step: "submit_form".into(),
            timeout_secs: 30,
        };
        assert_eq!(budget.class(), ErrorClass::Transient);
    }

    #[test]
    fn structural_mismatch_and_rejections_are_non_transient() {
        let missing = AutomationError::Session(SessionError::ElementMissing(
            "input[name='email']".into(),
        ));
        assert_eq!(missing.class(), ErrorClass::NonTransient);

        let duplicate = AutomationError::DuplicateAccount("email already registered".into());
        assert_eq!(duplicate.class(), ErrorClass::NonTransient);

        assert_eq!(
            AutomationError::VerificationNotConfirmed.class(),
            ErrorClass::NonTransient
        );
        assert_eq!(
            AutomationError::UnsupportedTarget("netscape".into()).class(),
            ErrorClass::NonTransient
        );
    }

    #[test]
    fn challenge_errors_map_to_blocked() {
        let err = AutomationError::Challenge(ChallengeError::Unresolved {
            reason: "no solver configured".into(),
        });
        assert_eq!(err.class(), ErrorClass::Blocked);
    }

    #[test]
    fn faults_inside_the_pipeline_are_internal() {
        assert_eq!(
            AutomationError::Internal("poisoned lock".into()).class(),
            ErrorClass::Internal
        );
        let eval = AutomationError::Session(SessionError::Evaluate("bad script".into()));
        assert_eq!(eval.class(), ErrorClass::Internal);
    }
}
