//! HTTP client that rides out rate limiting and server errors.
//!
//! Every request goes through [`FetchClient::get`]. Responses with status 429 or any 5xx are
//! never handed to the caller: the request is repeated after an exponentially growing delay.
//! Everything else, including 404, is returned untouched.

use std::time::Duration;

use rand::Rng;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::FetchConfig;

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("invalid url '{url}': {reason}")] InvalidUrl { url: String, reason: String },
    #[error("transport error: {0}")] Transport(#[from] reqwest::Error),
    #[error("gave up after {attempts} attempts (last status {status})")] RetriesExhausted { status: u16, attempts: u32 },
}

/// Exponential backoff schedule for transient failures.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Wait after the first failed attempt.
    pub initial: Duration,
    pub factor: u32,
    /// Upper bound for a single wait. `None` lets the delay grow without limit.
    pub max_delay: Option<Duration>,
    /// Total attempts before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Random spread applied to each delay, as a fraction (0.1 = ±10%).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            factor: 2,
            max_delay: Some(Duration::from_secs(60)),
            max_attempts: None,
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next request, given how many attempts have failed so far (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1);
        let base = self.initial.saturating_mul(self.factor.saturating_pow(exp));
        let capped = match self.max_delay {
            Some(max) => base.min(max),
            None => base,
        };
        if self.jitter <= 0.0 {
            return capped;
        }
        let spread = self.jitter.min(1.0);
        let scale = 1.0 + rand::thread_rng().gen_range(-spread..=spread);
        Duration::try_from_secs_f64(capped.as_secs_f64() * scale).unwrap_or(capped)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        matches!(self.max_attempts, Some(max) if attempts >= max)
    }
}

/// Statuses that are retried instead of being returned.
pub fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

const NO_QUERY: &[(&str, &str)] = &[];

#[derive(Clone)]
pub struct FetchClient {
    client: Client,
    base_url: Url,
    backoff: BackoffPolicy,
}

impl FetchClient {
    /// Build a client routed through the configured proxy.
    pub fn new(cfg: &FetchConfig) -> Result<Self, FetchError> {
        let mut builder = Client::builder()
            .user_agent(&cfg.user_agent)
            .timeout(cfg.timeout);
        if let Some(proxy) = &cfg.proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        let client = builder.build()?;
        Self::with_client(client, &cfg.base_url, cfg.backoff.clone())
    }

    /// Wrap an already configured [`Client`].
    pub fn with_client(client: Client, base_url: &str, backoff: BackoffPolicy) -> Result<Self, FetchError> {
        let mut base = base_url.to_string();
        // Url::join drops the last path segment unless it ends in '/'
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).map_err(|e| FetchError::InvalidUrl { url: base.clone(), reason: e.to_string() })?;
        Ok(Self { client, base_url, backoff })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Absolute URLs pass through; anything else is joined onto the base URL.
    pub fn resolve(&self, path_or_url: &str) -> Result<Url, FetchError> {
        let parsed = if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
            Url::parse(path_or_url)
        } else {
            self.base_url.join(path_or_url.trim_start_matches('/'))
        };
        parsed.map_err(|e| FetchError::InvalidUrl { url: path_or_url.to_string(), reason: e.to_string() })
    }

    pub async fn get_path(&self, path_or_url: &str) -> Result<Response, FetchError> {
        self.get(path_or_url, NO_QUERY).await
    }

    /// GET with query parameters, retrying 429/5xx responses with backoff.
    pub async fn get<Q: Serialize + ?Sized>(&self, path_or_url: &str, query: &Q) -> Result<Response, FetchError> {
        let url = self.resolve(path_or_url)?;
        let mut failures = 0u32;
        loop {
            let response = self.client.get(url.clone()).query(query).send().await?;
            let status = response.status();
            if !is_transient(status) {
                debug!(%url, status = status.as_u16(), attempts = failures + 1, "fetched");
                return Ok(response);
            }
            failures += 1;
            metrics::increment_counter!("booru_fetch_retries_total", "status" => status.as_u16().to_string());
            if self.backoff.exhausted(failures) {
                warn!(%url, status = status.as_u16(), attempts = failures, "giving up on transient errors");
                return Err(FetchError::RetriesExhausted { status: status.as_u16(), attempts: failures });
            }
            let delay = self.backoff.delay_for(failures);
            warn!(%url, status = status.as_u16(), delay_ms = delay.as_millis() as u64, "error {}, waiting {:?}", status.as_u16(), delay);
            tokio::time::sleep(delay).await;
        }
    }
}
