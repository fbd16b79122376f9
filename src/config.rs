use std::time::Duration;

use crate::net::BackoffPolicy;

pub const DEFAULT_BASE_URL: &str = "https://danbooru.donmai.us/";
pub const DEFAULT_PROXY_URL: &str = "socks5h://localhost:1080";
pub const DEFAULT_USER_AGENT: &str = concat!("booru-mirror/", env!("CARGO_PKG_VERSION"));

/// Settings for the outbound HTTP client.
#[derive(Clone, Debug)]
pub struct FetchConfig {
    pub base_url: String,
    /// `None` sends requests directly.
    pub proxy_url: Option<String>,
    pub user_agent: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            proxy_url: Some(DEFAULT_PROXY_URL.into()),
            user_agent: DEFAULT_USER_AGENT.into(),
            timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MirrorConfig {
    pub fetch: FetchConfig,
    /// Cached records older than this are fetched again on lookup.
    pub stale_threshold: chrono::Duration,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub imageboard_name: String,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            fetch: FetchConfig::default(),
            stale_threshold: chrono::Duration::days(7),
            database_url: None,
            database_max_connections: 5,
            imageboard_name: "Danbooru".into(),
        }
    }
}

impl MirrorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; unset or unparsable values fall back to defaults.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(raw: Option<String>) -> Option<T> {
            raw.and_then(|v| v.trim().parse().ok())
        }
        let defaults = Self::default();
        let backoff_defaults = BackoffPolicy::default();

        let proxy_url = match var("BOORU_PROXY_URL") {
            Some(v) if v.eq_ignore_ascii_case("none") || v.trim().is_empty() => None,
            Some(v) => Some(v),
            None => defaults.fetch.proxy_url,
        };
        let backoff = BackoffPolicy {
            initial: parsed(var("FETCH_BACKOFF_INITIAL_MS"))
                .map(Duration::from_millis)
                .unwrap_or(backoff_defaults.initial),
            max_delay: match var("FETCH_BACKOFF_MAX_MS") {
                Some(v) if v.trim() == "0" => None,
                raw => parsed(raw).map(Duration::from_millis).or(backoff_defaults.max_delay),
            },
            max_attempts: parsed(var("FETCH_MAX_ATTEMPTS")).or(backoff_defaults.max_attempts),
            jitter: parsed(var("FETCH_BACKOFF_JITTER")).unwrap_or(backoff_defaults.jitter),
            ..backoff_defaults
        };

        Self {
            fetch: FetchConfig {
                base_url: var("BOORU_BASE_URL").unwrap_or(defaults.fetch.base_url),
                proxy_url,
                user_agent: var("BOORU_USER_AGENT").unwrap_or(defaults.fetch.user_agent),
                timeout: parsed(var("BOORU_TIMEOUT_SECS"))
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.fetch.timeout),
                backoff,
            },
            stale_threshold: parsed::<i64>(var("BOORU_STALE_DAYS"))
                .filter(|days| *days >= 0)
                .and_then(chrono::Duration::try_days)
                .unwrap_or(defaults.stale_threshold),
            database_url: var("DATABASE_URL"),
            database_max_connections: parsed(var("DATABASE_MAX_CONNECTIONS"))
                .unwrap_or(defaults.database_max_connections),
            imageboard_name: var("IMAGEBOARD_NAME").unwrap_or(defaults.imageboard_name),
        }
    }
}
