use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, CaptureScreenshotParams, NavigateParams,
};
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::error::CdpError;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::Page;
use futures::StreamExt;
use rand::Rng;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::BrowserSection;

use super::error::{SessionError, SessionResult};
use super::human::InputPacer;

const ELEMENT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Driven-browser surface a signup attempt runs against. One session is
/// exclusively owned by one attempt; `close` must be called on every exit
/// path and is idempotent.
#[async_trait]
pub trait SignupSession: Send {
    async fn goto(&mut self, url: &str) -> SessionResult<()>;
    async fn current_url(&mut self) -> SessionResult<String>;
    /// Waits for the selector within the session's element budget.
    async fn fill(&mut self, selector: &str, text: &str) -> SessionResult<()>;
    async fn click(&mut self, selector: &str) -> SessionResult<()>;
    /// Single structural probe, no waiting.
    async fn exists(&mut self, selector: &str) -> SessionResult<bool>;
    async fn body_text(&mut self) -> SessionResult<String>;
    async fn eval(&mut self, script: &str) -> SessionResult<Value>;
    async fn screenshot(&mut self) -> SessionResult<Vec<u8>>;
    async fn idle(&mut self, range_ms: (u64, u64)) -> SessionResult<()>;
    async fn close(&mut self) -> SessionResult<()>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> SessionResult<Box<dyn SignupSession>>;
}

#[derive(Debug, Clone, Default)]
pub struct LaunchOverrides {
    pub headless: Option<bool>,
}

/// Builds Chromium instances, local or against a remote CDP grid, with the
/// flags signup flows need.
#[derive(Debug, Clone)]
pub struct BrowserLauncher {
    config: Arc<BrowserSection>,
}

impl BrowserLauncher {
    pub fn new(config: BrowserSection) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &BrowserSection {
        &self.config
    }

    pub async fn launch(&self) -> SessionResult<DrivenBrowser> {
        self.launch_with_overrides(LaunchOverrides::default()).await
    }

    pub async fn launch_with_overrides(
        &self,
        overrides: LaunchOverrides,
    ) -> SessionResult<DrivenBrowser> {
        let headless = overrides.headless.unwrap_or(self.config.headless);

        let (browser, mut handler, profile) = match &self.config.grid_endpoint {
            Some(endpoint) => {
                info!(endpoint = %endpoint, "Connecting to remote browser grid");
                let (browser, handler) = Browser::connect(endpoint.clone())
                    .await
                    .map_err(|err| SessionError::Launch(err.to_string()))?;
                (browser, handler, None)
            }
            None => {
                let profile = tempfile::Builder::new()
                    .prefix("enlist-profile-")
                    .tempdir()
                    .map_err(SessionError::Io)?;
                let chromium_config = self.build_chromium_config(profile.path(), headless)?;
                info!(
                    profile = %profile.path().display(),
                    headless,
                    "Launching Chromium instance"
                );
                let (browser, handler) = Browser::launch(chromium_config)
                    .await
                    .map_err(|err| SessionError::Launch(err.to_string()))?;
                (browser, handler, Some(profile))
            }
        };

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "Chromium handler reported error");
                }
            }
        });

        Ok(DrivenBrowser {
            browser,
            handler_task: Some(handler_task),
            profile,
            config: Arc::clone(&self.config),
        })
    }

    fn build_chromium_config(
        &self,
        profile_dir: &Path,
        headless: bool,
    ) -> SessionResult<ChromiumConfig> {
        let [width, height] = self.config.window;
        let mut builder = ChromiumConfig::builder()
            .user_data_dir(profile_dir)
            .request_timeout(Duration::from_secs(self.config.nav_timeout_secs))
            .viewport(ChromiumViewport {
                width,
                height,
                device_scale_factor: Some(1.0),
                emulating_mobile: false,
                is_landscape: width >= height,
                has_touch: false,
            });

        if let Some(path) = &self.config.executable_path {
            builder = builder.chrome_executable(path);
        }
        if !headless {
            builder = builder.with_head();
        }
        if !self.config.sandbox {
            builder = builder.no_sandbox();
        }

        let mut args = vec![
            format!("--window-size={width},{height}"),
            "--no-first-run".to_string(),
            "--disable-features=AutomationControlled".to_string(),
            "--disable-background-timer-throttling".to_string(),
            "--password-store=basic".to_string(),
        ];
        if let Some(agent) = &self.config.user_agent {
            args.push(format!("--user-agent={agent}"));
        }
        builder = builder.args(args);

        builder.build().map_err(SessionError::Configuration)
    }
}

/// One launched Chromium plus its CDP handler loop. Call `shutdown` rather
/// than dropping; a drop without shutdown leaks the running browser and is
/// logged.
#[derive(Debug)]
pub struct DrivenBrowser {
    browser: Browser,
    handler_task: Option<JoinHandle<()>>,
    profile: Option<tempfile::TempDir>,
    config: Arc<BrowserSection>,
}

impl DrivenBrowser {
    pub async fn new_page(&self) -> SessionResult<Page> {
        let params = CreateTargetParams::new("about:blank");
        let page = self.browser.new_page(params).await?;
        if let Some(agent) = &self.config.user_agent {
            page.enable_stealth_mode_with_agent(agent).await?;
        } else {
            page.enable_stealth_mode().await?;
        }
        Ok(page)
    }

    pub async fn shutdown(mut self) -> SessionResult<()> {
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "Failed to close browser gracefully");
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "Browser handler join error");
            }
        }
        if let Some(profile) = self.profile.take() {
            drop(profile);
        }
        Ok(())
    }
}

impl Drop for DrivenBrowser {
    fn drop(&mut self) {
        if let Some(handle) = &self.handler_task {
            if !handle.is_finished() {
                warn!("DrivenBrowser dropped without explicit shutdown");
            }
        }
    }
}

pub struct ChromiumSession {
    browser: Option<DrivenBrowser>,
    page: Page,
    pacer: InputPacer,
    element_budget: Duration,
}

impl ChromiumSession {
    async fn wait_for_element(
        &self,
        selector: &str,
    ) -> SessionResult<chromiumoxide::element::Element> {
        let deadline = tokio::time::Instant::now() + self.element_budget;
        loop {
            match self.page.find_element(selector).await {
                Ok(element) => return Ok(element),
                Err(_) if tokio::time::Instant::now() < deadline => {
                    sleep(ELEMENT_POLL_INTERVAL).await;
                }
                Err(_) => return Err(SessionError::ElementMissing(selector.to_string())),
            }
        }
    }
}

fn interaction_error(context: &str, err: CdpError) -> SessionError {
    let text = err.to_string();
    if text.contains("does not belong to the document") || text.to_lowercase().contains("stale") {
        SessionError::Stale(context.to_string())
    } else {
        SessionError::Unexpected(format!("{context}: {text}"))
    }
}

#[async_trait]
impl SignupSession for ChromiumSession {
    async fn goto(&mut self, url: &str) -> SessionResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(SessionError::Configuration)?;
        self.page
            .goto(params)
            .await
            .map_err(|err| SessionError::Navigation {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        self.page
            .wait_for_navigation()
            .await
            .map_err(|err| SessionError::Navigation {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        Ok(())
    }

    async fn current_url(&mut self) -> SessionResult<String> {
        let url = self.page.url().await?;
        Ok(url.unwrap_or_default())
    }

    async fn fill(&mut self, selector: &str, text: &str) -> SessionResult<()> {
        let element = self.wait_for_element(selector).await?;
        self.pacer.before_click().await;
        element
            .click()
            .await
            .map_err(|err| interaction_error(selector, err))?;
        for ch in text.chars() {
            element
                .type_str(ch.to_string())
                .await
                .map_err(|err| interaction_error(selector, err))?;
            self.pacer.between_keys().await;
        }
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> SessionResult<()> {
        let element = self.wait_for_element(selector).await?;
        self.pacer.before_click().await;
        element
            .click()
            .await
            .map_err(|err| interaction_error(selector, err))?;
        Ok(())
    }

    async fn exists(&mut self, selector: &str) -> SessionResult<bool> {
        Ok(self.page.find_element(selector).await.is_ok())
    }

    async fn body_text(&mut self) -> SessionResult<String> {
        let result = self
            .page
            .evaluate("document.body ? document.body.innerText : ''")
            .await
            .map_err(|err| SessionError::Evaluate(err.to_string()))?;
        Ok(result.into_value::<String>().unwrap_or_default())
    }

    async fn eval(&mut self, script: &str) -> SessionResult<Value> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|err| SessionError::Evaluate(err.to_string()))?;
        Ok(result.into_value::<Value>().unwrap_or(Value::Null))
    }

    async fn screenshot(&mut self) -> SessionResult<Vec<u8>> {
        let params = CaptureScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .build();
        let bytes = self
            .page
            .screenshot(params)
            .await
            .map_err(|err| SessionError::Unexpected(format!("screenshot failed: {err}")))?;
        Ok(bytes)
    }

    async fn idle(&mut self, range_ms: (u64, u64)) -> SessionResult<()> {
        if range_ms.0 == 0 && range_ms.1 == 0 {
            return Ok(());
        }
        let millis = {
            let mut rng = rand::thread_rng();
            let lower = range_ms.0.min(range_ms.1);
            let upper = range_ms.0.max(range_ms.1);
            rng.gen_range(lower..=upper)
        };
        sleep(Duration::from_millis(millis)).await;
        Ok(())
    }

    async fn close(&mut self) -> SessionResult<()> {
        if let Some(browser) = self.browser.take() {
            browser.shutdown().await?;
        }
        Ok(())
    }
}

/// Launches one dedicated browser per session, so no attempt ever shares
/// browser state with another.
pub struct ChromiumSessionFactory {
    launcher: BrowserLauncher,
    pacer: InputPacer,
}

impl ChromiumSessionFactory {
    pub fn new(launcher: BrowserLauncher) -> Self {
        let pacer = InputPacer::new(launcher.config().pacing.clone());
        Self { launcher, pacer }
    }
}

#[async_trait]
impl SessionFactory for ChromiumSessionFactory {
    async fn create(&self) -> SessionResult<Box<dyn SignupSession>> {
        let element_budget = Duration::from_secs(self.launcher.config().nav_timeout_secs);
        let browser = self.launcher.launch().await?;
        let page = browser.new_page().await?;
        Ok(Box::new(ChromiumSession {
            browser: Some(browser),
            page,
            pacer: self.pacer.clone(),
            element_budget,
        }))
    }
}
