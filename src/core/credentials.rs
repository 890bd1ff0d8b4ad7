//! Upstream credentials.
//!
//! The upstream client asks a [`CredentialProvider`] for a bearer token on every
//! call and asks it to `refresh` after a 401. Two providers exist: a static API
//! key and an OAuth token file that refreshes itself when near expiry.
//!
//! Refresh is serialized: concurrent callers that all observe an expiring token
//! wait on one mutex, and only the first performs the HTTP refresh. Everyone
//! else picks up the result.

use crate::core::config::OAuthConfig;
use crate::core::{AppError, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Tokens expiring within this window are refreshed ahead of time.
pub const NEAR_EXPIRY_THRESHOLD: Duration = Duration::from_secs(45 * 60 * 60);

/// A token refreshed this recently is used as-is even if still "near expiry".
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Stored OAuth token, in the upstream CLI's file format.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Token {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    /// Epoch millis, digit string, RFC 3339, or `YYYY-MM-DD HH:MM`
    #[serde(default)]
    pub expiry_date: Value,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default, rename = "apiKey")]
    pub api_key: String,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl Token {
    pub fn from_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            token_type: default_token_type(),
            ..Default::default()
        }
    }

    /// The value sent as `Authorization: Bearer`.
    pub fn bearer(&self) -> &str {
        if self.api_key.is_empty() {
            &self.access_token
        } else {
            &self.api_key
        }
    }

    /// Expiry as epoch millis; `None` when absent or unparsable.
    pub fn expiry_millis(&self) -> Option<i64> {
        match &self.expiry_date {
            Value::Number(n) => n.as_i64().filter(|v| *v > 0),
            Value::String(s) => parse_expiry_str(s.trim()),
            _ => None,
        }
    }

    /// Whether the token is expired or expires within `threshold` of `now_ms`.
    pub fn needs_refresh(&self, now_ms: i64, threshold: Duration) -> bool {
        match self.expiry_millis() {
            Some(expiry) => expiry - now_ms <= threshold.as_millis() as i64,
            None => false,
        }
    }
}

fn parse_expiry_str(s: &str) -> Option<i64> {
    if s.is_empty() {
        return None;
    }
    if s.chars().all(|c| c.is_ascii_digit()) {
        return s.parse::<i64>().ok().filter(|v| *v > 0);
    }
    if s.contains('T') {
        return DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis());
    }
    NaiveDateTime::parse_from_str(&format!("{}:00", s), "%Y-%m-%d %H:%M:%S")
        .ok()
        .and_then(|naive| Local.from_local_datetime(&naive).single())
        .map(|dt| dt.timestamp_millis())
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// A bearer token tagged with the credential generation it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerToken {
    pub token: String,
    pub generation: u64,
}

/// Source of the upstream bearer token.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Token to use for the next upstream call, refreshing first if it is about to expire.
    async fn current_bearer(&self) -> Result<BearerToken>;

    async fn current_bearer_token(&self) -> Result<String> {
        Ok(self.current_bearer().await?.token)
    }

    /// Force a refresh.
    async fn refresh(&self) -> Result<Token>;

    /// Refresh after the upstream rejected a token read at `generation`.
    ///
    /// Returns the current token without refreshing when a newer generation
    /// already exists.
    async fn refresh_rejected(&self, generation: u64) -> Result<Token> {
        let _ = generation;
        self.refresh().await
    }
}

/// Fixed API key; refreshing is a no-op.
pub struct StaticCredentialProvider {
    token: Token,
}

impl StaticCredentialProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            token: Token::from_api_key(api_key),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn current_bearer(&self) -> Result<BearerToken> {
        if self.token.bearer().is_empty() {
            return Err(AppError::Unauthorized(
                "no upstream API key configured".to_string(),
            ));
        }
        Ok(BearerToken {
            token: self.token.bearer().to_string(),
            generation: 0,
        })
    }

    async fn refresh(&self) -> Result<Token> {
        Ok(self.token.clone())
    }
}

/// OAuth token stored in a JSON file and refreshed with its refresh token.
pub struct TokenFileCredentialProvider {
    path: PathBuf,
    oauth: OAuthConfig,
    http: reqwest::Client,
    token: ArcSwap<Token>,
    /// Bumped after every successful refresh
    generation: AtomicU64,
    last_refresh_ms: AtomicU64,
    refresh_lock: Mutex<()>,
}

impl TokenFileCredentialProvider {
    /// Load the token file.
    pub async fn load(
        path: impl AsRef<Path>,
        oauth: OAuthConfig,
        http: reqwest::Client,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            AppError::Config(anyhow::anyhow!(
                "failed to read token file {}: {}",
                path.display(),
                e
            ))
        })?;
        let token: Token = serde_json::from_str(&content)?;

        tracing::info!(
            path = %path.display(),
            has_refresh_token = !token.refresh_token.is_empty(),
            has_api_key = !token.api_key.is_empty(),
            "Upstream token loaded"
        );

        Ok(Self {
            path,
            oauth,
            http,
            token: ArcSwap::from_pointee(token),
            generation: AtomicU64::new(0),
            last_refresh_ms: AtomicU64::new(0),
            refresh_lock: Mutex::new(()),
        })
    }

    /// Snapshot of the token currently in use.
    pub fn token(&self) -> Arc<Token> {
        self.token.load_full()
    }

    fn recently_refreshed(&self) -> bool {
        let last = self.last_refresh_ms.load(Ordering::Acquire) as i64;
        last > 0 && now_millis() - last < MIN_REFRESH_INTERVAL.as_millis() as i64
    }

    /// Refresh unless another task already did so since `observed_generation`.
    async fn refresh_from(&self, observed_generation: u64) -> Result<Token> {
        let _guard = self.refresh_lock.lock().await;

        if self.generation.load(Ordering::Acquire) != observed_generation {
            tracing::debug!("Token refreshed by a concurrent request, reusing it");
            return Ok((*self.token.load_full()).clone());
        }

        let current = self.token.load_full();
        let refreshed = self.request_refresh(&current).await?;

        if let Err(e) = self.persist(&refreshed).await {
            tracing::warn!(error = %e, path = %self.path.display(), "Failed to save refreshed token");
        }

        self.token.store(Arc::new(refreshed.clone()));
        self.last_refresh_ms
            .store(now_millis() as u64, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        tracing::info!("Upstream token refreshed");
        Ok(refreshed)
    }

    async fn request_refresh(&self, current: &Token) -> Result<Token> {
        if current.refresh_token.trim().is_empty() {
            return Err(AppError::Unauthorized(
                "token file has no refresh_token".to_string(),
            ));
        }

        let basic = base64::engine::general_purpose::STANDARD.encode(format!(
            "{}:{}",
            self.oauth.client_id, self.oauth.client_secret
        ));
        let response = self
            .http
            .post(&self.oauth.token_endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::AUTHORIZATION, format!("Basic {}", basic))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", current.refresh_token.as_str()),
                ("client_id", self.oauth.client_id.as_str()),
                ("client_secret", self.oauth.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(format!("token refresh failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Unauthorized(format!(
                "token refresh failed: HTTP {}",
                status.as_u16()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("invalid token refresh response: {}", e)))?;
        let access_token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                AppError::Unauthorized("token refresh response has no access_token".to_string())
            })?
            .to_string();
        let expires_in = body
            .get("expires_in")
            .and_then(|v| v.as_i64())
            .unwrap_or(3600);

        let mut refreshed = Token {
            access_token,
            refresh_token: body
                .get("refresh_token")
                .and_then(|v| v.as_str())
                .unwrap_or(&current.refresh_token)
                .to_string(),
            expiry_date: Value::from(now_millis() + expires_in * 1000),
            token_type: body
                .get("token_type")
                .and_then(|v| v.as_str())
                .unwrap_or("Bearer")
                .to_string(),
            scope: body
                .get("scope")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            api_key: current.api_key.clone(),
        };

        match self.fetch_api_key(&refreshed.access_token).await {
            Ok(Some(api_key)) => refreshed.api_key = api_key,
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "User info lookup failed, keeping previous API key"),
        }

        Ok(refreshed)
    }

    async fn fetch_api_key(&self, access_token: &str) -> Result<Option<String>> {
        if self.oauth.user_info_endpoint.is_empty() {
            return Ok(None);
        }
        let response = self
            .http
            .get(&self.oauth.user_info_endpoint)
            .query(&[("accessToken", access_token)])
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AppError::Upstream {
                status: response.status().as_u16(),
                message: "user info lookup failed".to_string(),
            });
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(body
            .pointer("/data/apiKey")
            .and_then(|v| v.as_str())
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string()))
    }

    async fn persist(&self, token: &Token) -> Result<()> {
        let content = serde_json::to_string_pretty(token)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| AppError::Internal(e.to_string()))?;
            }
        }
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))
    }
}

#[async_trait]
impl CredentialProvider for TokenFileCredentialProvider {
    async fn current_bearer(&self) -> Result<BearerToken> {
        // generation first: a refresh stores the token before bumping it
        let observed = self.generation.load(Ordering::Acquire);
        let token = self.token.load_full();

        if token.needs_refresh(now_millis(), NEAR_EXPIRY_THRESHOLD)
            && !token.refresh_token.is_empty()
            && !self.recently_refreshed()
        {
            tracing::info!("Upstream token expired or near expiry, refreshing");
            match self.refresh_from(observed).await {
                Ok(fresh) => {
                    return Ok(BearerToken {
                        token: fresh.bearer().to_string(),
                        generation: self.generation.load(Ordering::Acquire),
                    })
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Token refresh failed, using current token");
                }
            }
        }

        let bearer = token.bearer();
        if bearer.is_empty() {
            return Err(AppError::Unauthorized(
                "token file holds neither apiKey nor access_token".to_string(),
            ));
        }
        Ok(BearerToken {
            token: bearer.to_string(),
            generation: observed,
        })
    }

    async fn refresh(&self) -> Result<Token> {
        let observed = self.generation.load(Ordering::Acquire);
        self.refresh_from(observed).await
    }

    async fn refresh_rejected(&self, generation: u64) -> Result<Token> {
        self.refresh_from(generation).await
    }
}
