use std::io;

use chromiumoxide::error::CdpError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("invalid browser configuration: {0}")]
    Configuration(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] CdpError),
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("element not found: {0}")]
    ElementMissing(String),
    #[error("stale element: {0}")]
    Stale(String),
    #[error("script evaluation failed: {0}")]
    Evaluate(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected browser failure: {0}")]
    Unexpected(String),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;
