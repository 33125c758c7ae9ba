use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// SQLite database file for the reply records.
    pub database_path: String,
    /// Base URL of the platform's JSON API.
    pub api_base_url: String,
    /// Bearer token for the bot account. Empty means unauthenticated (only
    /// useful against a local test server).
    #[serde(default)]
    pub api_token: String,
    /// Public site base URL, used in rendered message links.
    pub site_base_url: String,
    /// The bot's own account name.
    pub bot_username: String,
    /// Feed to watch for new documents.
    pub feed: String,
    /// Accounts allowed to bypass the normal delete authorization and to
    /// issue recheck commands. The bot's own account is always implied.
    pub trustees: Vec<String>,
    /// Enables the throttled follow-up replies to short comment replies.
    #[serde(default)]
    pub advanced_replying_enabled: bool,
    /// How often the feed and inbox listings are polled.
    #[serde(default = "default_feed_poll_interval_secs")]
    pub feed_poll_interval_secs: u64,
    #[serde(default)]
    pub recheck: RecheckConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecheckConfig {
    #[serde(default = "default_base_poll_interval_secs")]
    pub base_poll_interval_secs: u64,
    #[serde(default = "default_max_poll_interval_secs")]
    pub max_poll_interval_secs: u64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: u64,
    /// Error ratio above which a cycle counts as failed and the poll
    /// interval backs off.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,
    /// Records whose document is older than this are expired instead of
    /// rechecked.
    #[serde(default = "default_forget_after_secs")]
    pub forget_after_secs: u64,
}

fn default_feed_poll_interval_secs() -> u64 {
    10
}

fn default_base_poll_interval_secs() -> u64 {
    30
}

fn default_max_poll_interval_secs() -> u64 {
    3 * 60
}

fn default_jitter_factor() -> f64 {
    0.4
}

fn default_backoff_factor() -> u64 {
    2
}

fn default_failure_threshold() -> f64 {
    0.5
}

fn default_forget_after_secs() -> u64 {
    60 * 60 * 24
}

impl Default for RecheckConfig {
    fn default() -> Self {
        RecheckConfig {
            base_poll_interval_secs: default_base_poll_interval_secs(),
            max_poll_interval_secs: default_max_poll_interval_secs(),
            jitter_factor: default_jitter_factor(),
            backoff_factor: default_backoff_factor(),
            failure_threshold: default_failure_threshold(),
            forget_after_secs: default_forget_after_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_path: "fencepost.db".to_string(),
            api_base_url: "https://forum.example.com/api".to_string(),
            api_token: String::new(),
            site_base_url: "https://forum.example.com".to_string(),
            bot_username: "fencepost_bot".to_string(),
            feed: "powershell".to_string(),
            trustees: vec!["forum_owner".to_string()],
            advanced_replying_enabled: false,
            feed_poll_interval_secs: default_feed_poll_interval_secs(),
            recheck: RecheckConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Trustee check is case-insensitive and always admits the bot itself.
    pub fn is_trustee(&self, username: &str) -> bool {
        username.eq_ignore_ascii_case(&self.bot_username)
            || self.trustees.iter().any(|t| t.eq_ignore_ascii_case(username))
    }
}
