use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};
use url::Url;

use crate::config::MailboxSection;

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("mailbox request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("mailbox payload malformed: {0}")]
    Payload(String),
}

pub type MailboxResult<T> = Result<T, MailboxError>;

/// A message pulled from a disposable inbox. `body` carries whatever the
/// provider returns, HTML or plain text.
#[derive(Debug, Clone, Deserialize)]
pub struct MailboxMessage {
    pub id: String,
    pub from: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

/// Read-side of a disposable mailbox service. Implementations return the
/// newest message for an address, or `None` while the inbox is still empty.
#[async_trait]
pub trait MailboxProvider: Send + Sync {
    async fn fetch_latest(&self, address: &str) -> MailboxResult<Option<MailboxMessage>>;
}

pub struct HttpMailboxProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpMailboxProvider {
    pub fn new(config: &MailboxSection) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }
}

#[async_trait]
impl MailboxProvider for HttpMailboxProvider {
    async fn fetch_latest(&self, address: &str) -> MailboxResult<Option<MailboxMessage>> {
        let url = format!("{}/messages", self.base_url);
        let mut request = self
            .client
            .get(url)
            .query(&[("address", address), ("limit", "1")]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?.error_for_status()?;
        let messages = response.json::<Vec<MailboxMessage>>().await?;
        Ok(messages.into_iter().next())
    }
}

/// Polls an inbox on a fixed cadence until a message arrives or the deadline
/// passes. Provider failures inside a cycle are logged and the next cycle
/// still runs, so a flaky inbox API does not abort the wait early.
pub struct MailboxPoller {
    provider: Arc<dyn MailboxProvider>,
    interval: Duration,
}

impl MailboxPoller {
    pub fn new(provider: Arc<dyn MailboxProvider>, interval: Duration) -> Self {
        Self { provider, interval }
    }

    /// Waits up to `timeout` for a message addressed to `address`. Returns
    /// `None` once the deadline passes without one; a final fetch runs at the
    /// deadline itself before giving up.
    pub async fn await_message(&self, address: &str, timeout: Duration) -> Option<MailboxMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.provider.fetch_latest(address).await {
                Ok(Some(message)) => {
                    debug!(address, message_id = %message.id, "mailbox message arrived");
                    return Some(message);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(address, error = %err, "mailbox poll failed");
                }
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(address, "no mailbox message before deadline");
                return None;
            }
            sleep_until(deadline.min(now + self.interval)).await;
        }
    }
}

/// Pulls the account-action link out of a verification email. Candidates are
/// tried in order of confidence: anchor hrefs whose URL mentions a
/// verification word, then bare keyword URLs, then any absolute URL at all.
pub struct LinkExtractor {
    anchor: Regex,
    keyword: Regex,
    any_url: Regex,
}

impl LinkExtractor {
    pub fn new() -> Self {
        let anchor = Regex::new(
            r#"(?i)href=["']?(https?://[^"'\s>]*(?:verify|confirm|activat)[^"'\s>]*)"#,
        )
        .expect("valid regex");
        let keyword = Regex::new(r#"(?i)(https?://[^\s"'<>]*(?:verify|confirm|activat)[^\s"'<>]*)"#)
            .expect("valid regex");
        let any_url = Regex::new(r#"(?i)https?://[^\s"'<>]+"#).expect("valid regex");
        Self {
            anchor,
            keyword,
            any_url,
        }
    }

    pub fn action_link(&self, body: &str) -> Option<String> {
        for capture in self.anchor.captures_iter(body) {
            if let Some(group) = capture.get(1) {
                if let Some(link) = normalize_candidate(group.as_str()) {
                    return Some(link);
                }
            }
        }
        for capture in self.keyword.captures_iter(body) {
            if let Some(group) = capture.get(1) {
                if let Some(link) = normalize_candidate(group.as_str()) {
                    return Some(link);
                }
            }
        }
        for found in self.any_url.find_iter(body) {
            if let Some(link) = normalize_candidate(found.as_str()) {
                return Some(link);
            }
        }
        None
    }
}

impl Default for LinkExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_candidate(raw: &str) -> Option<String> {
    let trimmed = raw.trim_end_matches(['.', ',', ';', ')', '>', '\'', '"']);
    let decoded = trimmed.replace("&amp;", "&");
    Url::parse(&decoded).ok()?;
    Some(decoded)
}
