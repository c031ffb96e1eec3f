//! Rate-limited upstream REST client.
//!
//! All outbound traffic in the process goes through one [`EsiClient`]. The
//! client owns the global token bucket, the conditional-request cache, the
//! single-flight registry, and the error-limit guard, so no caller can
//! overrun the upstream error budget regardless of scan concurrency.

pub mod auth;
pub mod contracts;
pub mod market;

pub use auth::AuthSession;

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use rand::Rng;
use reqwest::{Client, StatusCode};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{FlipperError, Result};

pub const DEFAULT_BASE_URL: &str = "https://esi.evetech.net/latest";
const DEFAULT_USER_AGENT: &str = concat!("flipper/", env!("CARGO_PKG_VERSION"));

/// Stop issuing requests when the upstream error budget drops below this.
const ERROR_LIMIT_MARGIN: i64 = 10;
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Ceiling for any single request, deadline or not.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Absolute point in time a call must finish by. Every blocking call in a
/// scan carries one of these alongside its cancel token: each request's own
/// timeout is clamped to the time remaining, and an exhausted deadline
/// fails fast with `Timeout` before touching the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// No deadline; requests still get the per-request ceiling.
    pub fn none() -> Self {
        Self { at: None }
    }

    pub fn after(budget: Duration) -> Self {
        Self {
            at: Some(Instant::now() + budget),
        }
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.remaining(), Some(left) if left.is_zero())
    }

    /// Timeout to apply to one request under this deadline.
    fn request_timeout(&self) -> Duration {
        match self.remaining() {
            Some(left) => left.min(REQUEST_TIMEOUT),
            None => REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EsiConfig {
    pub base_url: String,
    pub user_agent: String,
    pub requests_per_second: NonZeroU32,
    pub burst: NonZeroU32,
}

impl Default for EsiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: std::env::var("FLIPPER_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            requests_per_second: nonzero!(20u32),
            burst: nonzero!(40u32),
        }
    }
}

#[derive(Clone)]
struct CachedBody {
    etag: String,
    body: Arc<String>,
    expires: Instant,
    pages: u32,
}

struct FetchedPage {
    body: Arc<String>,
    pages: u32,
}

pub struct EsiClient {
    http: Client,
    base_url: String,
    user_agent: String,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    etag_cache: Mutex<HashMap<String, CachedBody>>,
    flights: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    suspended_until: Mutex<Option<Instant>>,
    pub session: AuthSession,
}

impl EsiClient {
    pub fn new(config: EsiConfig) -> Result<Self> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let quota = Quota::per_second(config.requests_per_second).allow_burst(config.burst);

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user_agent: config.user_agent,
            limiter: RateLimiter::direct(quota),
            etag_cache: Mutex::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
            suspended_until: Mutex::new(None),
            session: AuthSession::new(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url, path_and_query)
    }

    async fn flight_lock(&self, url: &str) -> Arc<Mutex<()>> {
        let mut flights = self.flights.lock().await;
        flights.entry(url.to_string()).or_default().clone()
    }

    /// Waits out any error-limit suspension, then takes a rate token.
    async fn admit(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(FlipperError::Canceled);
        }

        let resume_at = *self.suspended_until.lock().await;
        if let Some(at) = resume_at {
            let now = Instant::now();
            if at > now {
                debug!("error limit low, holding requests for {:?}", at - now);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(FlipperError::Canceled),
                    _ = tokio::time::sleep(at - now) => {}
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(FlipperError::Canceled),
            _ = self.limiter.until_ready() => Ok(()),
        }
    }

    fn note_error_limit(&self, headers: &reqwest::header::HeaderMap) {
        let remain = headers
            .get("x-esi-error-limit-remain")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok());
        let reset = headers
            .get("x-esi-error-limit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        if let (Some(remain), Some(reset)) = (remain, reset) {
            if remain < ERROR_LIMIT_MARGIN {
                warn!(remain, reset, "upstream error budget nearly exhausted, suspending");
                let until = Instant::now() + Duration::from_secs(reset);
                if let Ok(mut guard) = self.suspended_until.try_lock() {
                    *guard = Some(until);
                }
            }
        }
    }

    fn parse_expires(headers: &reqwest::header::HeaderMap) -> Instant {
        headers
            .get(reqwest::header::EXPIRES)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
            .map(|t| {
                let delta = (t.timestamp() - chrono::Utc::now().timestamp()).max(0) as u64;
                Instant::now() + Duration::from_secs(delta)
            })
            .unwrap_or_else(Instant::now)
    }

    fn parse_pages(headers: &reqwest::header::HeaderMap) -> u32 {
        headers
            .get("x-pages")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(1)
            .max(1)
    }

    /// One canonical-URL fetch with conditional caching, coalescing,
    /// retries, and a stale fallback when a refetch fails transiently.
    async fn fetch(
        &self,
        url: &str,
        authed: bool,
        cancel: &CancellationToken,
        deadline: Deadline,
    ) -> Result<FetchedPage> {
        let lock = self.flight_lock(url).await;
        let _guard = lock.lock().await;

        // Fresh cached bodies are served without touching the network; this
        // is also what collapses coalesced callers after the first returns.
        let cached = self.etag_cache.lock().await.get(url).cloned();
        if let Some(entry) = &cached {
            if entry.expires > Instant::now() {
                return Ok(FetchedPage {
                    body: entry.body.clone(),
                    pages: entry.pages,
                });
            }
        }

        let mut last_err = FlipperError::Timeout(url.to_string());
        for attempt in 0..MAX_ATTEMPTS {
            if deadline.is_expired() {
                last_err = FlipperError::Timeout(format!("deadline exhausted for {url}"));
                break;
            }
            if attempt > 0 {
                let jitter = rand::thread_rng().gen_range(0..250);
                let backoff = BACKOFF_BASE * 2u32.pow(attempt - 1) + Duration::from_millis(jitter);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(FlipperError::Canceled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            self.admit(cancel).await?;

            let mut request = self
                .http
                .get(url)
                .timeout(deadline.request_timeout())
                .header(reqwest::header::USER_AGENT, &self.user_agent)
                .header(reqwest::header::ACCEPT, "application/json");
            if let Some(entry) = &cached {
                request = request.header(reqwest::header::IF_NONE_MATCH, entry.etag.clone());
            }
            if authed {
                match self.session.bearer().await? {
                    Some(token) => {
                        request = request.header(
                            reqwest::header::AUTHORIZATION,
                            format!("Bearer {token}"),
                        );
                    }
                    None => return Err(FlipperError::Unauthorized("no active session".into())),
                }
            }

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(FlipperError::Canceled),
                r = request.send() => r,
            };

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    last_err = FlipperError::from(e);
                    debug!(url, attempt, error = %last_err, "request failed");
                    continue;
                }
            };

            self.note_error_limit(response.headers());
            let status = response.status();

            match status {
                StatusCode::OK => {
                    let etag = response
                        .headers()
                        .get(reqwest::header::ETAG)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    let expires = Self::parse_expires(response.headers());
                    let pages = Self::parse_pages(response.headers());
                    let body = Arc::new(response.text().await?);

                    if !etag.is_empty() {
                        self.etag_cache.lock().await.insert(
                            url.to_string(),
                            CachedBody {
                                etag,
                                body: body.clone(),
                                expires,
                                pages,
                            },
                        );
                    }
                    return Ok(FetchedPage { body, pages });
                }
                StatusCode::NOT_MODIFIED => {
                    if let Some(entry) = &cached {
                        let expires = Self::parse_expires(response.headers());
                        let mut cache = self.etag_cache.lock().await;
                        if let Some(live) = cache.get_mut(url) {
                            live.expires = expires;
                        }
                        return Ok(FetchedPage {
                            body: entry.body.clone(),
                            pages: entry.pages,
                        });
                    }
                    // 304 without a cached body means our cache was evicted
                    // between the conditional header and the response.
                    last_err = FlipperError::Decode("304 with no cached body".into());
                    continue;
                }
                StatusCode::UNAUTHORIZED if authed => {
                    self.session.invalidate().await;
                    return Err(FlipperError::AuthExpired);
                }
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    return Err(FlipperError::Unauthorized(format!("{status} for {url}")));
                }
                StatusCode::NOT_FOUND => {
                    return Err(FlipperError::NotFound(url.to_string()));
                }
                // 420 is the legacy error-limit status; 429 the standard one.
                s if s == StatusCode::TOO_MANY_REQUESTS || s.as_u16() == 420 => {
                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(10);
                    *self.suspended_until.lock().await =
                        Some(Instant::now() + Duration::from_secs(retry_after));
                    last_err = FlipperError::RateLimited {
                        retry_after_secs: retry_after,
                    };
                    continue;
                }
                s if s.is_server_error() => {
                    last_err = FlipperError::ServerError {
                        status: s.as_u16(),
                        body: response.text().await.unwrap_or_default(),
                    };
                    debug!(url, attempt, error = %last_err, "server error");
                    continue;
                }
                s => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(FlipperError::BadInput(format!("{s} for {url}: {body}")));
                }
            }
        }

        // Exhausted retries: a stale cached body beats no data, but only for
        // transient failures.
        if last_err.is_transient() {
            if let Some(entry) = cached {
                warn!(url, error = %last_err, "refetch failed, serving stale cached body");
                return Ok(FetchedPage {
                    body: entry.body,
                    pages: entry.pages,
                });
            }
        }
        Err(last_err)
    }

    /// GET returning a single decoded JSON document.
    pub async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path_and_query: &str,
        authed: bool,
        cancel: &CancellationToken,
        deadline: Deadline,
    ) -> Result<T> {
        let url = self.url(path_and_query);
        let page = self.fetch(&url, authed, cancel, deadline).await?;
        serde_json::from_str(&page.body).map_err(|e| FlipperError::Decode(e.to_string()))
    }

    /// GET walking `X-Pages`, returning the concatenated array payload.
    /// Remaining pages are fetched concurrently; the global bucket still
    /// meters each one.
    pub async fn get_paginated<T: serde::de::DeserializeOwned + Send + 'static>(
        &self,
        path_and_query: &str,
        authed: bool,
        cancel: &CancellationToken,
        deadline: Deadline,
    ) -> Result<Vec<T>> {
        let sep = if path_and_query.contains('?') { '&' } else { '?' };
        let first_url = format!("{}{}page=1", self.url(path_and_query), sep);
        let first = self.fetch(&first_url, authed, cancel, deadline).await?;

        let mut out: Vec<T> =
            serde_json::from_str(&first.body).map_err(|e| FlipperError::Decode(e.to_string()))?;

        if first.pages > 1 {
            let futures: Vec<_> = (2..=first.pages)
                .map(|page| {
                    let url = format!("{}{}page={}", self.url(path_and_query), sep, page);
                    async move {
                        let fetched = self.fetch(&url, authed, cancel, deadline).await?;
                        serde_json::from_str::<Vec<T>>(&fetched.body)
                            .map_err(|e| FlipperError::Decode(e.to_string()))
                    }
                })
                .collect();

            for result in futures_util::future::join_all(futures).await {
                out.extend(result?);
            }
        }
        Ok(out)
    }
}
