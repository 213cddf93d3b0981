use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};

use crate::mailbox::MailboxPoller;
use crate::session::SignupSession;
use crate::task::{AutomationError, Credentials, TaskResult};

mod forgecloud;
mod hexlayer;

pub use forgecloud::ForgecloudAutomator;
pub use hexlayer::HexlayerAutomator;

/// Site-specific signup choreography. The engine owns ordering, retries and
/// persistence; an automator only knows the pages of one product.
#[async_trait]
pub trait SiteAutomator: Send + Sync {
    /// Stable identifier tasks are submitted under.
    fn id(&self) -> &'static str;

    fn signup_url(&self) -> &'static str;

    /// Whether the product gates new accounts behind a mailbox round trip.
    fn requires_email_verification(&self) -> bool;

    async fn navigate_to_signup(&self, session: &mut dyn SignupSession) -> TaskResult<()>;

    async fn fill_signup_form(
        &self,
        session: &mut dyn SignupSession,
        credentials: &Credentials,
    ) -> TaskResult<()>;

    async fn submit_form(&self, session: &mut dyn SignupSession) -> TaskResult<()>;

    /// Fail-closed creation check: `false` whenever success cannot be
    /// positively established.
    async fn verify_account_created(&self, session: &mut dyn SignupSession) -> TaskResult<bool>;

    async fn handle_email_verification(
        &self,
        _session: &mut dyn SignupSession,
        _poller: &MailboxPoller,
        _address: &str,
        _timeout: Duration,
    ) -> TaskResult<()> {
        Ok(())
    }

    /// Best effort. An empty map is a valid outcome and callers treat
    /// extraction problems as non-fatal.
    async fn extract_api_tokens(
        &self,
        session: &mut dyn SignupSession,
    ) -> TaskResult<HashMap<String, String>>;
}

const CONFIRM_POLL: Duration = Duration::from_millis(500);

/// URL fragments accepted as landing proof when no content marker shows up.
const URL_SUCCESS_KEYWORDS: &[&str] = &["dashboard", "welcome", "success"];

/// Shared creation probe. Scans rendered text for the site's markers first
/// and falls back to URL keywords, re-checking on a fixed cadence until the
/// budget runs out. Rejection markers short-circuit with the matching error.
/// All markers are compared lowercase.
pub(crate) async fn confirm_creation(
    session: &mut dyn SignupSession,
    success_markers: &[&str],
    duplicate_markers: &[&str],
    rejection_markers: &[&str],
    budget: Duration,
) -> TaskResult<bool> {
    let deadline = Instant::now() + budget;
    loop {
        let body = session.body_text().await?.to_lowercase();
        for marker in duplicate_markers {
            if body.contains(marker) {
                return Err(AutomationError::DuplicateAccount((*marker).to_string()));
            }
        }
        for marker in rejection_markers {
            if body.contains(marker) {
                return Err(AutomationError::Rejected((*marker).to_string()));
            }
        }
        if success_markers.iter().any(|marker| body.contains(marker)) {
            return Ok(true);
        }
        let url = session.current_url().await?.to_lowercase();
        if URL_SUCCESS_KEYWORDS.iter().any(|keyword| url.contains(keyword)) {
            return Ok(true);
        }
        if Instant::now() + CONFIRM_POLL > deadline {
            return Ok(false);
        }
        sleep(CONFIRM_POLL).await;
    }
}

/// Lookup table from software identifier to its automator. Built once at
/// engine start, read-only afterwards.
pub struct AutomatorRegistry {
    automators: HashMap<String, Arc<dyn SiteAutomator>>,
}

impl AutomatorRegistry {
    pub fn empty() -> Self {
        Self {
            automators: HashMap::new(),
        }
    }

    /// Every automator shipped with this crate.
    pub fn with_builtin_targets() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(ForgecloudAutomator::new()));
        registry.register(Arc::new(HexlayerAutomator::new()));
        registry
    }

    pub fn register(&mut self, automator: Arc<dyn SiteAutomator>) {
        self.automators
            .insert(automator.id().to_string(), automator);
    }

    pub fn get(&self, software_id: &str) -> Option<Arc<dyn SiteAutomator>> {
        self.automators.get(software_id).cloned()
    }

    pub fn supported_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.automators.keys().cloned().collect();
        targets.sort();
        targets
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::session::SessionResult;

    struct ScriptedPage {
        body: String,
        url: String,
    }

    #[async_trait]
    impl SignupSession for ScriptedPage {
        async fn goto(&mut self, url: &str) -> SessionResult<()> {
            self.url = url.to_string();
            Ok(())
        }

        async fn current_url(&mut self) -> SessionResult<String> {
            Ok(self.url.clone())
        }

        async fn fill(&mut self, _selector: &str, _text: &str) -> SessionResult<()> {
            Ok(())
        }

        async fn click(&mut self, _selector: &str) -> SessionResult<()> {
            Ok(())
        }

        async fn exists(&mut self, _selector: &str) -> SessionResult<bool> {
            Ok(false)
        }

        async fn body_text(&mut self) -> SessionResult<String> {
            Ok(self.body.clone())
        }

        async fn eval(&mut self, _script: &str) -> SessionResult<Value> {
            Ok(Value::Null)
        }

        async fn screenshot(&mut self) -> SessionResult<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn idle(&mut self, _range_ms: (u64, u64)) -> SessionResult<()> {
            Ok(())
        }

        async fn close(&mut self) -> SessionResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn content_marker_confirms_creation() {
        let mut page = ScriptedPage {
            body: "Welcome aboard! Your account is ready.".into(),
            url: "https://example.test/signup".into(),
        };
        let confirmed = confirm_creation(
            &mut page,
            &["account is ready"],
            &[],
            &[],
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(confirmed);
    }

    #[tokio::test]
    async fn url_keyword_is_accepted_without_marker() {
        let mut page = ScriptedPage {
            body: "Loading...".into(),
            url: "https://example.test/dashboard".into(),
        };
        let confirmed = confirm_creation(
            &mut page,
            &["account is ready"],
            &[],
            &[],
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(confirmed);
    }

    #[tokio::test]
    async fn duplicate_marker_raises_instead_of_false() {
        let mut page = ScriptedPage {
            body: "This email is already registered.".into(),
            url: "https://example.test/signup".into(),
        };
        let err = confirm_creation(
            &mut page,
            &["account is ready"],
            &["already registered"],
            &[],
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AutomationError::DuplicateAccount(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_fails_closed_when_budget_ends() {
        let mut page = ScriptedPage {
            body: "Please wait".into(),
            url: "https://example.test/signup".into(),
        };
        let confirmed = confirm_creation(
            &mut page,
            &["account is ready"],
            &[],
            &[],
            Duration::from_secs(3),
        )
        .await
        .unwrap();
        assert!(!confirmed);
    }

    #[test]
    fn builtin_registry_lists_targets_sorted() {
        let registry = AutomatorRegistry::with_builtin_targets();
        assert_eq!(registry.supported_targets(), vec!["forgecloud", "hexlayer"]);
        assert!(registry.get("forgecloud").is_some());
        assert!(registry.get("netscape").is_none());
    }
}
