use std::time::Duration;
use tracing::warn;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_GREETING: &str =
    "Hello! I'm your Socratic tutor. What shall we explore today?";

const ENV_BASE_URL: &str = "COGNIFLOW_API_URL";
const ENV_POLL_INTERVAL_MS: &str = "COGNIFLOW_POLL_INTERVAL_MS";
const ENV_HISTORY_WINDOW: &str = "COGNIFLOW_HISTORY_WINDOW";

#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    pub poll_interval: Duration,
    /// Number of most recent turns sent along with each message.
    pub history_window: usize,
    pub max_poll_attempts: Option<u32>,
    pub max_poll_duration: Option<Duration>,
    pub stream_timeout: Option<Duration>,
    pub greeting: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            poll_interval: Duration::from_secs(1),
            history_window: 10,
            max_poll_attempts: None,
            max_poll_duration: None,
            stream_timeout: None,
            greeting: Some(DEFAULT_GREETING.to_string()),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.trim().is_empty()) {
            config.base_url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(ms) = parse_setting::<u64>(&lookup, ENV_POLL_INTERVAL_MS) {
            if ms == 0 {
                warn!(key = ENV_POLL_INTERVAL_MS, "zero poll interval ignored");
            } else {
                config.poll_interval = Duration::from_millis(ms);
            }
        }
        if let Some(window) = parse_setting::<usize>(&lookup, ENV_HISTORY_WINDOW) {
            config.history_window = window;
        }

        config
    }
}

fn parse_setting<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "invalid setting, using default");
            None
        }
    }
}
