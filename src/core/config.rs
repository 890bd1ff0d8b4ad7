//! Configuration management for the gateway.
//!
//! Everything is read from the process environment (a `.env` file is loaded
//! by the binary before this runs). Missing or unparsable values fall back to
//! the defaults below.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration (host, port)
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream provider connection
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Model policy flags (vision substitution, prompts, images)
    #[serde(default)]
    pub models: ModelPolicyConfig,

    /// Token budgets for compression and continuation
    #[serde(default)]
    pub budgets: BudgetConfig,

    /// Capacity of the in-memory request log
    #[serde(default = "default_request_log_capacity")]
    pub request_log_capacity: usize,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Where and how to reach the upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL exposing `/chat/completions` and `/models`
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Static API key; used when no token file is configured
    #[serde(default)]
    pub api_key: Option<String>,

    /// OAuth token file (takes precedence over `api_key`)
    #[serde(default)]
    pub token_file_path: Option<String>,

    #[serde(default)]
    pub oauth: OAuthConfig,

    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// OAuth endpoints used to refresh a token file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_oauth_token_endpoint")]
    pub token_endpoint: String,

    #[serde(default = "default_oauth_user_info_endpoint")]
    pub user_info_endpoint: String,

    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,
}

/// Model policy flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPolicyConfig {
    /// Vision-capable model used for substitution and image description
    #[serde(default = "default_vision_model")]
    pub vision_model: String,

    /// Enable vision fallback (two-stage or substitution)
    #[serde(default = "default_true")]
    pub auto_vision_model: bool,

    /// Allow reading `file://` and absolute-path images from local disk
    #[serde(default)]
    pub allow_local_file_images: bool,

    #[serde(default = "default_max_local_image_bytes")]
    pub max_local_image_bytes: u64,

    /// Prepend the operational system prompt to every request
    #[serde(default = "default_true")]
    pub inject_system_prompt: bool,
}

/// Token budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_context_token_budget")]
    pub context_token_budget: usize,

    #[serde(default = "default_true")]
    pub compression_enabled: bool,

    #[serde(default = "default_max_continuations")]
    pub max_continuations: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            models: ModelPolicyConfig::default(),
            budgets: BudgetConfig::default(),
            request_log_capacity: default_request_log_capacity(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            token_file_path: None,
            oauth: OAuthConfig::default(),
            verify_ssl: default_verify_ssl(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            token_endpoint: default_oauth_token_endpoint(),
            user_info_endpoint: default_oauth_user_info_endpoint(),
            client_id: String::new(),
            client_secret: String::new(),
        }
    }
}

impl Default for ModelPolicyConfig {
    fn default() -> Self {
        Self {
            vision_model: default_vision_model(),
            auto_vision_model: true,
            allow_local_file_images: false,
            max_local_image_bytes: default_max_local_image_bytes(),
            inject_system_prompt: true,
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            context_token_budget: default_context_token_budget(),
            compression_enabled: true,
            max_continuations: default_max_continuations(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_base_url() -> String {
    "https://apis.iflow.cn/v1".to_string()
}

fn default_oauth_token_endpoint() -> String {
    "https://iflow.cn/oauth/token".to_string()
}

fn default_oauth_user_info_endpoint() -> String {
    "https://iflow.cn/api/oauth/getUserInfo".to_string()
}

fn default_verify_ssl() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    300
}

fn default_vision_model() -> String {
    "qwen3-vl-plus".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_local_image_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_context_token_budget() -> usize {
    180_000
}

fn default_max_continuations() -> usize {
    5
}

fn default_request_log_capacity() -> usize {
    300
}

impl AppConfig {
    /// Build the configuration from environment variables.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use iflow_proxy_rust::core::config::AppConfig;
    ///
    /// let config = AppConfig::from_env().expect("invalid configuration");
    /// println!("listening on {}:{}", config.server.host, config.server.port);
    /// ```
    pub fn from_env() -> Result<Self> {
        let mut config = AppConfig::default();

        if let Ok(host) = std::env::var("HOST") {
            config.server.host = host;
        }
        if let Some(port) = env_parse::<u16>("PORT") {
            config.server.port = port;
        }

        if let Ok(base_url) = std::env::var("UPSTREAM_BASE_URL") {
            config.upstream.base_url = base_url.trim_end_matches('/').to_string();
        }
        config.upstream.api_key = env_non_empty("IFLOW_API_KEY");
        config.upstream.token_file_path = env_non_empty("TOKEN_FILE_PATH");
        if let Some(endpoint) = env_non_empty("OAUTH_TOKEN_ENDPOINT") {
            config.upstream.oauth.token_endpoint = endpoint;
        }
        if let Some(endpoint) = env_non_empty("OAUTH_USER_INFO_ENDPOINT") {
            config.upstream.oauth.user_info_endpoint = endpoint;
        }
        if let Some(id) = env_non_empty("OAUTH_CLIENT_ID") {
            config.upstream.oauth.client_id = id;
        }
        if let Some(secret) = env_non_empty("OAUTH_CLIENT_SECRET") {
            config.upstream.oauth.client_secret = secret;
        }
        if let Ok(verify_ssl) = std::env::var("VERIFY_SSL") {
            config.upstream.verify_ssl = str_to_bool(&verify_ssl);
        }
        if let Some(timeout) = env_parse::<u64>("REQUEST_TIMEOUT_SECS") {
            config.upstream.request_timeout_secs = timeout;
        }

        if let Some(model) = env_non_empty("VISION_MODEL") {
            config.models.vision_model = model;
        }
        if let Ok(flag) = std::env::var("AUTO_VISION_MODEL") {
            config.models.auto_vision_model = str_to_bool(&flag);
        }
        if let Ok(flag) = std::env::var("ALLOW_LOCAL_FILE_IMAGES") {
            config.models.allow_local_file_images = str_to_bool(&flag);
        }
        if let Some(bytes) = env_parse::<u64>("MAX_LOCAL_IMAGE_BYTES") {
            config.models.max_local_image_bytes = bytes;
        }
        if let Ok(flag) = std::env::var("INJECT_SYSTEM_PROMPT") {
            config.models.inject_system_prompt = str_to_bool(&flag);
        }

        if let Some(budget) = env_parse::<usize>("CONTEXT_TOKEN_BUDGET") {
            config.budgets.context_token_budget = budget;
        }
        if let Ok(flag) = std::env::var("CONTEXT_COMPRESSION") {
            config.budgets.compression_enabled = str_to_bool(&flag);
        }
        if let Some(hops) = env_parse::<usize>("MAX_CONTINUATIONS") {
            config.budgets.max_continuations = hops;
        }
        if let Some(capacity) = env_parse::<usize>("REQUEST_LOG_CAPACITY") {
            config.request_log_capacity = capacity;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.upstream.base_url.trim().is_empty() {
            bail!("UPSTREAM_BASE_URL must not be empty");
        }
        if self.models.vision_model.trim().is_empty() {
            bail!("VISION_MODEL must not be empty");
        }
        if self.request_log_capacity == 0 {
            bail!("REQUEST_LOG_CAPACITY must be at least 1");
        }
        Ok(())
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

/// Convert string to boolean.
///
/// Accepts: "true", "1", "yes", "on" (case-insensitive)
fn str_to_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "HOST",
        "PORT",
        "UPSTREAM_BASE_URL",
        "IFLOW_API_KEY",
        "TOKEN_FILE_PATH",
        "VISION_MODEL",
        "AUTO_VISION_MODEL",
        "ALLOW_LOCAL_FILE_IMAGES",
        "CONTEXT_TOKEN_BUDGET",
        "MAX_CONTINUATIONS",
        "REQUEST_LOG_CAPACITY",
        "VERIFY_SSL",
    ];

    fn clear_env() {
        for key in KEYS {
            unsafe {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_str_to_bool() {
        assert!(str_to_bool("true"));
        assert!(str_to_bool("TRUE"));
        assert!(str_to_bool("1"));
        assert!(str_to_bool("yes"));
        assert!(str_to_bool(" on "));
        assert!(!str_to_bool("false"));
        assert!(!str_to_bool("0"));
        assert!(!str_to_bool(""));
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.upstream.base_url, "https://apis.iflow.cn/v1");
        assert_eq!(config.models.vision_model, "qwen3-vl-plus");
        assert!(config.models.auto_vision_model);
        assert!(!config.models.allow_local_file_images);
        assert_eq!(config.models.max_local_image_bytes, 10 * 1024 * 1024);
        assert_eq!(config.budgets.context_token_budget, 180_000);
        assert_eq!(config.budgets.max_continuations, 5);
        assert_eq!(config.request_log_capacity, 300);
        assert!(config.upstream.api_key.is_none());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        unsafe {
            std::env::set_var("PORT", "9100");
            std::env::set_var("UPSTREAM_BASE_URL", "http://localhost:1234/v1/");
            std::env::set_var("IFLOW_API_KEY", "sk-test");
            std::env::set_var("AUTO_VISION_MODEL", "false");
            std::env::set_var("ALLOW_LOCAL_FILE_IMAGES", "yes");
            std::env::set_var("MAX_CONTINUATIONS", "2");
        }

        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.upstream.base_url, "http://localhost:1234/v1");
        assert_eq!(config.upstream.api_key.as_deref(), Some("sk-test"));
        assert!(!config.models.auto_vision_model);
        assert!(config.models.allow_local_file_images);
        assert_eq!(config.budgets.max_continuations, 2);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_port_falls_back_to_default() {
        clear_env();
        unsafe {
            std::env::set_var("PORT", "not-a-port");
        }
        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.server.port, 8000);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_blank_api_key_is_ignored() {
        clear_env();
        unsafe {
            std::env::set_var("IFLOW_API_KEY", "   ");
        }
        let config = AppConfig::from_env().unwrap();
        assert!(config.upstream.api_key.is_none());
        clear_env();
    }

    #[test]
    fn test_validate_rejects_zero_log_capacity() {
        let config = AppConfig {
            request_log_capacity: 0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
