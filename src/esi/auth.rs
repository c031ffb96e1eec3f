//! OAuth session state.
//!
//! The browser-side login flow delivers a token pair; the client only has to
//! keep it fresh. Refresh is transparent and thread-safe: concurrent callers
//! that find an expired token serialize on the refresh lock and the losers
//! reuse the winner's result.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::{FlipperError, Result};

pub const DEFAULT_TOKEN_URL: &str = "https://login.eveonline.com/v2/oauth/token";

/// Refresh this long before the token actually expires.
const EXPIRY_SLACK_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct Token {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub character_name: String,
    pub character_id: i64,
}

impl Token {
    fn is_fresh(&self) -> bool {
        self.expires_at - ChronoDuration::seconds(EXPIRY_SLACK_SECS) > Utc::now()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}

pub struct AuthSession {
    token: RwLock<Option<Token>>,
    refresh_lock: Mutex<()>,
    http: Client,
    token_url: String,
    client_id: String,
}

impl AuthSession {
    pub fn new() -> Self {
        Self::with_token_url(DEFAULT_TOKEN_URL)
    }

    pub fn with_token_url(token_url: &str) -> Self {
        Self {
            token: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            http: Client::new(),
            token_url: token_url.to_string(),
            client_id: std::env::var("FLIPPER_CLIENT_ID").unwrap_or_default(),
        }
    }

    pub async fn install(&self, token: Token) {
        info!(character = %token.character_name, "session installed");
        *self.token.write().await = Some(token);
    }

    pub async fn invalidate(&self) {
        warn!("session invalidated");
        *self.token.write().await = None;
    }

    pub async fn snapshot(&self) -> Option<Token> {
        self.token.read().await.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.token.read().await.is_some()
    }

    /// Current bearer token, refreshing if stale. `Ok(None)` means there is
    /// no session at all; callers decide whether that is an error.
    pub async fn bearer(&self) -> Result<Option<String>> {
        {
            let guard = self.token.read().await;
            match guard.as_ref() {
                None => return Ok(None),
                Some(t) if t.is_fresh() => return Ok(Some(t.access_token.clone())),
                Some(_) => {}
            }
        }

        let _refreshing = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited.
        {
            let guard = self.token.read().await;
            match guard.as_ref() {
                None => return Ok(None),
                Some(t) if t.is_fresh() => return Ok(Some(t.access_token.clone())),
                Some(_) => {}
            }
        }

        let stale = self.token.read().await.clone();
        let stale = match stale {
            Some(t) => t,
            None => return Ok(None),
        };

        let refreshed = self.refresh(&stale).await;
        match refreshed {
            Ok(token) => {
                let access = token.access_token.clone();
                *self.token.write().await = Some(token);
                Ok(Some(access))
            }
            Err(e) => {
                warn!(error = %e, "token refresh failed");
                *self.token.write().await = None;
                Err(FlipperError::AuthExpired)
            }
        }
    }

    async fn refresh(&self, stale: &Token) -> Result<Token> {
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", stale.refresh_token.clone()),
        ];
        if !self.client_id.is_empty() {
            form.push(("client_id", self.client_id.clone()));
        }

        let response = self.http.post(&self.token_url).form(&form).send().await?;
        if !response.status().is_success() {
            return Err(FlipperError::AuthExpired);
        }
        let body: TokenResponse = response.json().await?;

        Ok(Token {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_at: Utc::now() + ChronoDuration::seconds(body.expires_in),
            character_name: stale.character_name.clone(),
            character_id: stale.character_id,
        })
    }
}

impl Default for AuthSession {
    fn default() -> Self {
        Self::new()
    }
}
