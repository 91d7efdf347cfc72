//!
//! src/fetch.rs  Andrew Belles  Oct 2nd, 2025
//!
//! Defines the upstream capability the aggregator fans out over, and the
//! last.fm client implementing it. Retries and timeouts live here, the
//! aggregation layer above never retries on its own
//!

use std::time::Duration;

use async_trait::async_trait;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use reqwest::{Client, header, redirect, RequestBuilder};
use serde_json::Value;
use tokio::time::sleep;
use tracing::warn;

use crate::config::{HttpConfig, LastFmConfig, RetryConfig};
use crate::errors::AggregatorError;
use crate::types::Identifier;

/// last.fm reports "rate limit exceeded" as application error 29
const LASTFM_RATE_LIMITED: i64 = 29;

/// Request-by-identifier access to the data provider. Every call is
/// independent and may fail; the raw json is normalized by the caller
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn user_info(&self, user: &Identifier) -> Result<Value, AggregatorError>;

    async fn recent_tracks(&self, user: &Identifier, limit: u32)
        -> Result<Value, AggregatorError>;

    async fn compare(&self, user: &Identifier, other: &Identifier)
        -> Result<Value, AggregatorError>;
}

/// Client building functionality
fn client_helper(http: &HttpConfig) -> reqwest::ClientBuilder {
    Client::builder()
        .timeout(http.timeout)
        .connect_timeout(http.connect_timeout)
        .pool_max_idle_per_host(http.pool_max_idle_per_host)
        .pool_idle_timeout(Some(http.pool_idle_timeout))
        .redirect(redirect::Policy::limited(http.max_redirects as usize))
}

pub fn base_client(http: &HttpConfig) -> Result<Client, AggregatorError> {
    let mut h = header::HeaderMap::new();
    h.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
    client_helper(http)
        .default_headers(h)
        .user_agent(concat!("rs-aggregator/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| AggregatorError::Config(format!("build client: {e}")))
}

/// Simple function to generate random wait for http_with_retry
fn generate_backoff(base: Duration, attempt: u8, jitter: bool, rng: &mut SmallRng)
    -> Duration {
    let exp = base * (1_u32 << attempt.min(6));
    if jitter {
        exp + Duration::from_millis(rng.gen_range(50..=200))
    } else {
        exp
    }
}

/// Sends request, retrying 429/5xx and transport errors with exponential backoff
pub async fn http_with_retry(request: RequestBuilder, retry: &RetryConfig)
    -> Result<Value, AggregatorError> {
    let mut rng = SmallRng::from_entropy();
    let mut attempt = 0_u8;
    loop {
        let response = request.try_clone()
            .ok_or_else(|| AggregatorError::Config("non-cloneable request".to_string()))?
            .send()
            .await;
        match response {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    let v = resp.json::<Value>().await?;
                    return Ok(v);
                }
                let retryable = status.as_u16() == 429 || status.is_server_error();
                if !retryable || attempt >= retry.max_attempts {
                    if status.as_u16() == 429 {
                        return Err(AggregatorError::RateLimited(
                            format!("status {status} after {attempt} retries")
                        ));
                    }
                    return Err(AggregatorError::UpstreamUnavailable(
                        format!("status {status} after {attempt} retries")
                    ));
                }
                let backoff = generate_backoff(retry.base_backoff, attempt, retry.jitter, &mut rng);
                warn!(status = %status, backoff = ?backoff.as_millis(), "http.retry");
                sleep(backoff).await;
                attempt += 1;
            },
            Err(e) => {
                if attempt >= retry.max_attempts {
                    return Err(e.into());
                }
                let backoff = generate_backoff(retry.base_backoff, attempt, retry.jitter, &mut rng);
                warn!(error = %e, backoff = ?backoff.as_millis(), "http.retry.error");
                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// last.fm answers application errors with a 200 and an error body
pub fn check_lastfm_error(v: Value) -> Result<Value, AggregatorError> {
    let Some(code) = v.get("error").and_then(Value::as_i64) else {
        return Ok(v);
    };
    let message = v.get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown last.fm error")
        .to_string();
    if code == LASTFM_RATE_LIMITED {
        Err(AggregatorError::RateLimited(message))
    } else {
        Err(AggregatorError::UpstreamUnavailable(format!("last.fm error {code}: {message}")))
    }
}

#[derive(Clone, Debug)]
pub struct LastFmClient {
    pub http: Client,
    pub cfg: LastFmConfig,
    pub retry: RetryConfig
}

impl LastFmClient {
    pub fn new(http_cfg: &HttpConfig, last_cfg: &LastFmConfig) -> Result<Self, AggregatorError> {
        let http = base_client(http_cfg)?;
        Ok( Self{ http, cfg: last_cfg.clone(), retry: http_cfg.retry.clone() })
    }

    /// GET /?method=user.getInfo&user=...&api_key=...&format=json
    pub fn user_info_request(&self, user: &str) -> RequestBuilder {
        self.http.get(self.cfg.base_url.clone()).query(&[
            ("method", "user.getInfo"),
            ("user", user),
            ("api_key", &self.cfg.api_key),
            ("format", "json"),
        ])
    }

    /// GET /?method=user.getRecentTracks&user=...&limit=...&api_key=...&format=json
    pub fn recent_tracks_request(&self, user: &str, limit: u32) -> RequestBuilder {
        self.http.get(self.cfg.base_url.clone()).query(&[
            ("method", "user.getRecentTracks"),
            ("user", user),
            ("limit", &limit.to_string()),
            ("api_key", &self.cfg.api_key),
            ("format", "json"),
        ])
    }

    /// GET /?method=tasteometer.compare&type1=user&type2=user&value1=...&value2=...
    pub fn compare_request(&self, user: &str, other: &str) -> RequestBuilder {
        self.http.get(self.cfg.base_url.clone()).query(&[
            ("method", "tasteometer.compare"),
            ("type1", "user"),
            ("type2", "user"),
            ("value1", user),
            ("value2", other),
            ("api_key", &self.cfg.api_key),
            ("format", "json"),
        ])
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value, AggregatorError> {
        let v = http_with_retry(request, &self.retry).await?;
        check_lastfm_error(v)
    }
}

#[async_trait]
impl Upstream for LastFmClient {
    async fn user_info(&self, user: &Identifier) -> Result<Value, AggregatorError> {
        self.send(self.user_info_request(user.as_str())).await
    }

    async fn recent_tracks(&self, user: &Identifier, limit: u32)
        -> Result<Value, AggregatorError> {
        self.send(self.recent_tracks_request(user.as_str(), limit)).await
    }

    async fn compare(&self, user: &Identifier, other: &Identifier)
        -> Result<Value, AggregatorError> {
        self.send(self.compare_request(user.as_str(), other.as_str())).await
    }
}
