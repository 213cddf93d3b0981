use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{confirm_creation, SiteAutomator};
use crate::session::SignupSession;
use crate::task::{Credentials, TaskResult};

const SIGNUP_URL: &str = "https://hexlayer.io/register";

const HANDLE_FIELD: &str = "input#handle";
const EMAIL_FIELD: &str = "input#email";
const PASSWORD_FIELD: &str = "input#password";
const SUBMIT_BUTTON: &str = "button#create-account";

const SUCCESS_MARKERS: &[&str] = &["your workspace is ready", "welcome to hexlayer"];
const DUPLICATE_MARKERS: &[&str] = &["handle is taken", "already has an account"];
const REJECTION_MARKERS: &[&str] = &["registrations are paused"];

const CONFIRM_BUDGET: Duration = Duration::from_secs(10);
const WORKSPACE_KEY_PROBE: &str =
    "(() => window.localStorage.getItem('hexlayer.workspace_key'))()";

/// Drives account creation on hexlayer.io. Registration is a single form
/// with a user handle; the workspace key is parked in local storage once the
/// workspace boots.
pub struct HexlayerAutomator;

impl HexlayerAutomator {
    pub fn new() -> Self {
        Self
    }

    fn handle_for(email: &str) -> &str {
        email.split('@').next().unwrap_or(email)
    }
}

impl Default for HexlayerAutomator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SiteAutomator for HexlayerAutomator {
    fn id(&self) -> &'static str {
        "hexlayer"
    }

    fn signup_url(&self) -> &'static str {
        SIGNUP_URL
    }

    fn requires_email_verification(&self) -> bool {
        false
    }

    async fn navigate_to_signup(&self, session: &mut dyn SignupSession) -> TaskResult<()> {
        session.goto(SIGNUP_URL).await?;
        session.idle((300, 800)).await?;
        Ok(())
    }

    async fn fill_signup_form(
        &self,
        session: &mut dyn SignupSession,
        credentials: &Credentials,
    ) -> TaskResult<()> {
        session
            .fill(HANDLE_FIELD, Self::handle_for(&credentials.email))
            .await?;
        session.fill(EMAIL_FIELD, &credentials.email).await?;
        session.fill(PASSWORD_FIELD, &credentials.password).await?;
        Ok(())
    }

    async fn submit_form(&self, session: &mut dyn SignupSession) -> TaskResult<()> {
        session.click(SUBMIT_BUTTON).await?;
        session.idle((600, 1400)).await?;
        Ok(())
    }

    async fn verify_account_created(&self, session: &mut dyn SignupSession) -> TaskResult<bool> {
        confirm_creation(
            session,
            SUCCESS_MARKERS,
            DUPLICATE_MARKERS,
            REJECTION_MARKERS,
            CONFIRM_BUDGET,
        )
        .await
    }

    async fn extract_api_tokens(
        &self,
        session: &mut dyn SignupSession,
    ) -> TaskResult<HashMap<String, String>> {
        let value = session.eval(WORKSPACE_KEY_PROBE).await?;
        let mut tokens = HashMap::new();
        if let Some(key) = value.as_str() {
            if !key.is_empty() {
                tokens.insert("workspace_key".to_string(), key.to_string());
            }
        }
        if tokens.is_empty() {
            debug!("workspace key not present in local storage");
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::session::SessionResult;

    #[derive(Default)]
    struct RecordingSession {
        url: String,
        workspace_key: Option<String>,
        fills: Vec<(String, String)>,
    }

    #[async_trait]
    impl SignupSession for RecordingSession {
        async fn goto(&mut self, url: &str) -> SessionResult<()> {
            self.url = url.to_string();
            Ok(())
        }

        async fn current_url(&mut self) -> SessionResult<String> {
            Ok(self.url.clone())
        }

        async fn fill(&mut self, selector: &str, text: &str) -> SessionResult<()> {
            self.fills.push((selector.to_string(), text.to_string()));
            Ok(())
        }

        async fn click(&mut self, _selector: &str) -> SessionResult<()> {
            Ok(())
        }

        async fn exists(&mut self, _selector: &str) -> SessionResult<bool> {
            Ok(false)
        }

        async fn body_text(&mut self) -> SessionResult<String> {
            Ok(String::new())
        }

        async fn eval(&mut self, _script: &str) -> SessionResult<Value> {
            Ok(self
                .workspace_key
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null))
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
    async fn handle_comes_from_email_local_part() {
        let automator = HexlayerAutomator::new();
        let mut session = RecordingSession::default();
        let credentials = Credentials {
            email: "qv3m81xk1724300000002@guerrillamail.com".into(),
            password: "S3cure!passw0rd".into(),
        };
        automator
            .fill_signup_form(&mut session, &credentials)
            .await
            .unwrap();
        assert_eq!(session.fills[0].0, HANDLE_FIELD);
        assert_eq!(session.fills[0].1, "qv3m81xk1724300000002");
        assert_eq!(session.fills[1].1, credentials.email);
    }

    #[tokio::test]
    async fn workspace_key_extraction_does_not_navigate() {
        let automator = HexlayerAutomator::new();
        let mut session = RecordingSession {
            url: "https://hexlayer.io/workspace".into(),
            workspace_key: Some("hx_9f82ac".into()),
            ..Default::default()
        };
        let tokens = automator.extract_api_tokens(&mut session).await.unwrap();
        assert_eq!(
            tokens.get("workspace_key").map(String::as_str),
            Some("hx_9f82ac")
        );
        assert_eq!(session.url, "https://hexlayer.io/workspace");
    }

    #[tokio::test]
    async fn no_email_round_trip_required() {
        let automator = HexlayerAutomator::new();
        assert!(!automator.requires_email_verification());
    }
}
