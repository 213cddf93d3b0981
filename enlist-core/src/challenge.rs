use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::ChallengeSection;
use crate::session::{SessionResult, SignupSession};

/// Widget markers checked in order. The rendered iframe variants come first
/// because they survive site-side markup changes better than the host divs.
const CHALLENGE_PROBES: &[&str] = &[
    "iframe[src*='recaptcha']",
    ".g-recaptcha",
    "iframe[src*='hcaptcha']",
    ".h-captcha",
    "[data-captcha]",
    "#captcha",
];

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("challenge unresolved: {reason}")]
    Unresolved { reason: String },
    #[error("solver request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("solver response malformed: {0}")]
    Payload(String),
}

pub type ChallengeResult<T> = Result<T, ChallengeError>;

/// Outcome of a resolution attempt. `Blocked` carries the operator-facing
/// reason and means the signup cannot proceed on this page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Solved,
    Blocked(String),
}

/// Detects anti-bot challenges on the current page and, when a solver service
/// is configured, tries to clear them. Without a solver every detected
/// challenge is reported as blocking.
pub struct ChallengeHandler {
    config: ChallengeSection,
    solver: Option<SolverClient>,
}

impl ChallengeHandler {
    pub fn new(config: ChallengeSection) -> Self {
        let solver = config
            .solver_api_key
            .as_ref()
            .map(|key| SolverClient::new(config.solver_base_url.clone(), key.clone()));
        Self { config, solver }
    }

    /// Structural scan for known challenge widgets. Waits `probe_wait` first
    /// so late-loading widget scripts have a chance to mount their markup.
    pub async fn detect(&self, session: &mut dyn SignupSession) -> SessionResult<bool> {
        sleep(self.config.probe_wait()).await;
        for probe in CHALLENGE_PROBES {
            if session.exists(probe).await? {
                debug!(probe, "challenge widget present");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Hands the current page to the solver service and injects the returned
    /// token. Every path that cannot end in a usable token resolves to
    /// `Blocked` rather than an error, so callers treat solver declines and
    /// missing configuration the same way.
    pub async fn resolve(&self, session: &mut dyn SignupSession) -> ChallengeResult<Resolution> {
        let Some(solver) = &self.solver else {
            return Ok(Resolution::Blocked("no solver configured".to_string()));
        };
        let screenshot = match session.screenshot().await {
            Ok(bytes) => bytes,
            Err(err) => {
                return Ok(Resolution::Blocked(format!(
                    "challenge screenshot failed: {err}"
                )))
            }
        };
        let page_url = session.current_url().await.unwrap_or_default();
        let solver_task = solver.create_task(&page_url, &screenshot).await?;
        debug!(solver_task, "challenge submitted to solver");
        let token = solver
            .poll_result(
                &solver_task,
                self.config.solve_timeout(),
                self.config.poll_interval(),
            )
            .await?;
        match token {
            Some(token) => {
                if let Err(err) = session.eval(&inject_token_script(&token)).await {
                    return Ok(Resolution::Blocked(format!("token injection failed: {err}")));
                }
                info!(solver_task, "challenge token injected");
                Ok(Resolution::Solved)
            }
            None => {
                warn!(solver_task, "solver did not produce a token in time");
                Ok(Resolution::Blocked(
                    "solver did not produce a token in time".to_string(),
                ))
            }
        }
    }
}

struct SolverClient {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SolverCreate {
    error_id: i64,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    task_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SolverPoll {
    error_id: i64,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    solution: Option<SolverSolution>,
}

#[derive(Debug, Deserialize)]
struct SolverSolution {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "gRecaptchaResponse")]
    g_recaptcha_response: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

impl SolverSolution {
    fn into_token(self) -> Option<String> {
        self.token.or(self.g_recaptcha_response).or(self.text)
    }
}

impl SolverClient {
    fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn create_task(&self, page_url: &str, screenshot: &[u8]) -> ChallengeResult<String> {
        let payload = json!({
            "clientKey": self.api_key,
            "task": {
                "type": "ImageToTextTask",
                "websiteURL": page_url,
                "body": BASE64.encode(screenshot),
            },
        });
        let response = self
            .client
            .post(format!("{}/createTask", self.base_url))
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        let body: SolverCreate = response.json().await?;
        if body.error_id != 0 {
            return Err(ChallengeError::Unresolved {
                reason: body
                    .error_description
                    .unwrap_or_else(|| format!("solver rejected task ({})", body.error_id)),
            });
        }
        body.task_id
            .map(|id| id.to_string())
            .ok_or_else(|| ChallengeError::Payload("createTask response missing taskId".into()))
    }

    async fn poll_result(
        &self,
        solver_task: &str,
        timeout: Duration,
        interval: Duration,
    ) -> ChallengeResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let response = self
                .client
                .post(format!("{}/getTaskResult", self.base_url))
                .json(&json!({ "clientKey": self.api_key, "taskId": solver_task }))
                .send()
                .await?
                .error_for_status()?;
            let body: SolverPoll = response.json().await?;
            if body.error_id != 0 {
                return Err(ChallengeError::Unresolved {
                    reason: body
                        .error_description
                        .unwrap_or_else(|| format!("solver error ({})", body.error_id)),
                });
            }
            if body.status.as_deref() == Some("ready") {
                return Ok(body.solution.and_then(SolverSolution::into_token));
            }
            let now = Instant::now();
            if now + interval > deadline {
                return Ok(None);
            }
            sleep(interval).await;
        }
    }
}

/// Widgets read their token from a well-known hidden field, so writing it
/// there is enough for the form submission that follows.
fn inject_token_script(token: &str) -> String {
    let encoded = serde_json::to_string(token).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        "(() => {{ const token = {encoded}; \
         for (const name of ['g-recaptcha-response', 'h-captcha-response']) {{ \
         for (const field of document.getElementsByName(name)) {{ field.value = token; }} }} \
         return true; }})()"
    )
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::session::SessionError;

    struct StubSession {
        present: Vec<&'static str>,
        probed: Vec<String>,
    }

    impl StubSession {
        fn with_markers(present: Vec<&'static str>) -> Self {
            Self {
                present,
                probed: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl SignupSession for StubSession {
        async fn goto(&mut self, _url: &str) -> SessionResult<()> {
            Ok(())
        }

        async fn current_url(&mut self) -> SessionResult<String> {
            Ok("https://example.test/signup".into())
        }

        async fn fill(&mut self, _selector: &str, _text: &str) -> SessionResult<()> {
            Ok(())
        }

        async fn click(&mut self, _selector: &str) -> SessionResult<()> {
            Ok(())
        }

        async fn exists(&mut self, selector: &str) -> SessionResult<bool> {
            self.probed.push(selector.to_string());
            Ok(self.present.contains(&selector))
        }

        async fn body_text(&mut self) -> SessionResult<String> {
            Ok(String::new())
        }

        async fn eval(&mut self, _script: &str) -> SessionResult<Value> {
            Ok(Value::Null)
        }

        async fn screenshot(&mut self) -> SessionResult<Vec<u8>> {
            Err(SessionError::Unexpected("no screenshot in stub".into()))
        }

        async fn idle(&mut self, _range_ms: (u64, u64)) -> SessionResult<()> {
            Ok(())
        }

        async fn close(&mut self) -> SessionResult<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn detects_widget_markers() {
        let handler = ChallengeHandler::new(ChallengeSection::default());
        let mut session = StubSession::with_markers(vec![".h-captcha"]);
        assert!(handler.detect(&mut session).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn clean_page_scans_every_probe() {
        let handler = ChallengeHandler::new(ChallengeSection::default());
        let mut session = StubSession::with_markers(Vec::new());
        assert!(!handler.detect(&mut session).await.unwrap());
        assert_eq!(session.probed.len(), CHALLENGE_PROBES.len());
    }

    #[tokio::test]
    async fn resolve_without_solver_blocks() {
        let handler = ChallengeHandler::new(ChallengeSection::default());
        let mut session = StubSession::with_markers(vec![".g-recaptcha"]);
        let resolution = handler.resolve(&mut session).await.unwrap();
        assert_eq!(
            resolution,
            Resolution::Blocked("no solver configured".to_string())
        );
    }

    #[test]
    fn token_script_escapes_quotes() {
        let script = inject_token_script("ab\"c");
        assert!(script.contains(r#""ab\"c""#));
    }
}
