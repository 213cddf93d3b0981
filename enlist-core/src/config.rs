use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EnlistConfig {
    pub engine: EngineSection,
    pub browser: BrowserSection,
    pub credentials: CredentialSection,
    pub mailbox: MailboxSection,
    pub challenge: ChallengeSection,
    pub artifacts: ArtifactSection,
    pub notify: NotifySection,
    pub storage: StorageSection,
}

impl EnlistConfig {
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> Result<Self> {
        load_toml(dir.as_ref().join("enlist.toml"))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_toml(path)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub retry_jitter_ms: u64,
    pub step_timeout_secs: u64,
    pub concurrency: usize,
    pub queue_depth: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            retry_jitter_ms: 500,
            step_timeout_secs: 30,
            concurrency: 4,
            queue_depth: 64,
        }
    }
}

impl EngineSection {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub grid_endpoint: Option<String>,
    pub user_agent: Option<String>,
    pub window: [u32; 2],
    pub nav_timeout_secs: u64,
    pub pacing: PacingSection,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            executable_path: None,
            headless: true,
            sandbox: true,
            grid_endpoint: None,
            user_agent: None,
            window: [1366, 768],
            nav_timeout_secs: 30,
            pacing: PacingSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PacingSection {
    pub typing_cadence_cpm: [u32; 2],
    pub typing_jitter_ms: [u32; 2],
    pub click_hesitation_ms: [u32; 2],
}

impl Default for PacingSection {
    fn default() -> Self {
        Self {
            typing_cadence_cpm: [280, 420],
            typing_jitter_ms: [15, 60],
            click_hesitation_ms: [80, 240],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialSection {
    pub password_min_length: usize,
    pub password_require_symbols: bool,
    pub mailbox_domains: Vec<String>,
}

impl Default for CredentialSection {
    fn default() -> Self {
        Self {
            password_min_length: 12,
            password_require_symbols: true,
            mailbox_domains: vec![
                "mailinator.com".to_string(),
                "guerrillamail.com".to_string(),
                "temp-mail.org".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MailboxSection {
    pub base_url: String,
    pub api_key: Option<String>,
    pub poll_interval_secs: u64,
    pub message_timeout_secs: u64,
}

impl Default for MailboxSection {
    fn default() -> Self {
        Self {
            base_url: "https://inbox.enlist.sh/api/v1".to_string(),
            api_key: None,
            poll_interval_secs: 5,
            message_timeout_secs: 180,
        }
    }
}

impl MailboxSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChallengeSection {
    pub solver_api_key: Option<String>,
    pub solver_base_url: String,
    pub solve_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub probe_wait_ms: u64,
}

impl Default for ChallengeSection {
    fn default() -> Self {
        Self {
            solver_api_key: None,
            solver_base_url: "https://api.2captcha.com".to_string(),
            solve_timeout_secs: 120,
            poll_interval_secs: 5,
            probe_wait_ms: 1_500,
        }
    }
}

impl ChallengeSection {
    pub fn solve_timeout(&self) -> Duration {
        Duration::from_secs(self.solve_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn probe_wait(&self) -> Duration {
        Duration::from_millis(self.probe_wait_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArtifactSection {
    pub root: String,
    pub retention_days: u32,
}

impl Default for ArtifactSection {
    fn default() -> Self {
        Self {
            root: "artifacts".to_string(),
            retention_days: 14,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotifySection {
    pub webhook_url: Option<String>,
    pub signing_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub db_path: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: "enlist.db".to_string(),
        }
    }
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
