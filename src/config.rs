//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Default queue base directory when `QUEUE_DIR` is not set.
const DEFAULT_QUEUE_DIR: &str = "/tmp/pai-slack-queue";

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Slack credentials.
    pub slack: SlackConfig,

    /// Claude CLI invocation settings.
    pub claude: ClaudeConfig,

    /// On-disk queue settings.
    pub queue: QueueConfig,

    /// User IDs allowed to talk to the bridge. Empty = allow all.
    pub allowed_users: Vec<String>,

    /// Channel IDs the bridge listens in. Empty = allow all.
    pub allowed_channels: Vec<String>,

    /// Enable debug logging.
    pub debug: bool,
}

/// Slack credentials.
#[derive(Debug, Clone)]
pub struct SlackConfig {
    /// Bot token (xoxb-...), used for all REST calls.
    pub bot_token: String,

    /// App-level token (xapp-...), used for the Socket Mode connection.
    pub app_token: String,

    /// Signing secret. Unused over Socket Mode but accepted for parity
    /// with HTTP-mode deployments.
    pub signing_secret: Option<String>,
}

/// Claude CLI invocation settings.
#[derive(Debug, Clone)]
pub struct ClaudeConfig {
    /// Path to the Claude CLI executable.
    pub cli_path: PathBuf,

    /// Working directory the CLI runs in.
    pub working_dir: PathBuf,

    /// Maximum size of an agent reply posted back to Slack.
    pub max_output_chars: usize,
}

/// On-disk queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Base directory holding pending/, processing/, completed/, failed/.
    pub base_dir: PathBuf,

    /// Delay between pending-directory scans.
    pub poll_interval: Duration,
}

impl Config {
    /// Load configuration from the environment. Missing required keys are
    /// a fatal startup error.
    pub fn load() -> Result<Self> {
        let slack = SlackConfig {
            bot_token: require_env("SLACK_BOT_TOKEN")?,
            app_token: require_env("SLACK_APP_TOKEN")?,
            signing_secret: std::env::var("SLACK_SIGNING_SECRET").ok(),
        };

        let claude = ClaudeConfig {
            cli_path: std::env::var("CLAUDE_CLI_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("claude")),
            working_dir: std::env::var("CLAUDE_WORKING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            max_output_chars: parse_env("CLAUDE_MAX_OUTPUT_CHARS", 4000)?,
        };

        let queue = QueueConfig {
            base_dir: std::env::var("QUEUE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_QUEUE_DIR)),
            poll_interval: Duration::from_millis(parse_env("POLL_INTERVAL_MS", 2000)?),
        };

        Ok(Self {
            slack,
            claude,
            queue,
            allowed_users: parse_list(std::env::var("ALLOWED_USERS").ok().as_deref()),
            allowed_channels: parse_list(std::env::var("ALLOWED_CHANNELS").ok().as_deref()),
            debug: std::env::var("DEBUG").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true")),
        })
    }

    /// Directory holding per-thread transcript files.
    ///
    /// `__THREAD_STORE_DIR` overrides the default location; it exists for
    /// tests only and should not be set in production.
    pub fn thread_store_dir(&self) -> PathBuf {
        std::env::var("__THREAD_STORE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| self.queue.base_dir.join("threads"))
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingKey(key.to_string()).into())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("{key} must be a number, got {raw:?}")).into()),
        Err(_) => Ok(default),
    }
}

/// Split a comma-separated allowlist, dropping empty entries.
fn parse_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}
