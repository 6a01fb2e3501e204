use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("bad config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub redis: RedisConfig,
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub reddit: RedditConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Redis pub/sub, nothing kept for absent subscribers.
    Broadcast,
    /// Redis streams, kept until acked.
    Durable,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub backend: Backend,
    /// Broadcast only: retry publishes nobody received.
    pub verify_accepted: bool,
    /// Durable only: consumer group and consumer name.
    pub group: String,
    pub consumer: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379/".into(),
            backend: Backend::Durable,
            verify_accepted: false,
            group: "redfoxbot".into(),
            consumer: "redfoxbot-1".into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub token: String,
    pub api_url: Option<String>,
    /// Limit for JSON calls; uploads are not limited.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    crate::telegram::REQUEST_TIMEOUT.as_secs()
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RedditConfig {
    pub user_agent: String,
    /// Defaults to `https://www.reddit.com`.
    pub base_url: Option<String>,
    /// Pause before each listing fetch.
    pub pause_secs: u64,
    /// Added to the pause on every 429, up to `max_pause_secs`.
    pub pause_step_secs: u64,
    pub max_pause_secs: u64,
    /// Ids remembered per listing.
    pub cache_size: usize,
}

impl Default for RedditConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("redfoxbot/", env!("CARGO_PKG_VERSION")).into(),
            base_url: None,
            pause_secs: 10,
            pause_step_secs: 10,
            max_pause_secs: 300,
            cache_size: 500,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub ffmpeg: PathBuf,
    pub args: Vec<String>,
    pub timeout_secs: u64,
    pub work_dir: Option<PathBuf>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".into(),
            args: vec!["-hide_banner".into(), "-loglevel".into(), "error".into()],
            timeout_secs: crate::delivery::MERGE_TIMEOUT.as_secs(),
            work_dir: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Listing url, e.g. `https://www.reddit.com/r/pics/top/?t=day`.
    pub listing: String,
    pub chats: Vec<String>,
}
