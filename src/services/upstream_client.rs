//! Upstream chat/completions client.
//!
//! Owns everything between a canonical request and upstream bytes: body
//! policy (reasoning encoding, system prompt, local images), credentials,
//! retries and the vision fallback paths.

use crate::core::config::{AppConfig, ModelPolicyConfig};
use crate::core::credentials::CredentialProvider;
use crate::core::error::{AppError, Result};
use crate::core::error_types::{
    ATTEMPT_OUTCOME_FATAL, ATTEMPT_OUTCOME_OK, ATTEMPT_OUTCOME_RETRYABLE, MAX_ERROR_MESSAGE_LEN,
};
use crate::core::header_policy::upstream_headers;
use crate::core::logging::get_request_id;
use crate::core::metrics::get_metrics;
use crate::core::utils::{extract_error_message, truncate_text};
use crate::services::vision::{self, VisionPlan};
use crate::services::{images, system_prompt, thinking};
use crate::transformer::CanonicalRequest;
use bytes::Bytes;
use flate2::read::GzDecoder;
use reqwest::header::{HeaderMap, CONTENT_ENCODING};
use serde_json::{json, Value};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Retry schedule for upstream calls. The delay grows linearly with the
/// attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// A completed non-streaming call.
#[derive(Debug, Clone)]
pub struct Completion {
    pub body: Value,
    /// The request actually sent; differs from the caller's after a vision
    /// fallback.
    pub effective_request: CanonicalRequest,
}

/// An opened streaming call. No bytes have been read yet.
#[derive(Debug)]
pub struct UpstreamStream {
    pub response: reqwest::Response,
    pub effective_request: CanonicalRequest,
}

#[derive(Debug, Clone, Copy)]
struct SendOptions {
    stream: bool,
    allow_retry: bool,
}

pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
    retry: RetryPolicy,
    policy: ModelPolicyConfig,
    request_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(
        http: reqwest::Client,
        config: &AppConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            http,
            base_url: config.upstream.base_url.trim_end_matches('/').to_string(),
            credentials,
            retry: RetryPolicy::default(),
            policy: config.models.clone(),
            request_timeout: Duration::from_secs(config.upstream.request_timeout_secs),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn policy(&self) -> &ModelPolicyConfig {
        &self.policy
    }

    // ========================================================================
    // Body policy
    // ========================================================================

    /// Serialize a canonical request into the exact upstream body.
    pub async fn prepare_body(&self, request: &CanonicalRequest, inject_prompt: bool) -> Value {
        let mut request = request.clone();
        if inject_prompt && self.policy.inject_system_prompt {
            system_prompt::inject_system_prompt(&mut request.messages);
        }
        images::resolve_local_images(&mut request.messages, &self.policy).await;

        let mut body = request.to_upstream_body(thinking::preserves_reasoning(&request.model));
        if let Value::Object(map) = &mut body {
            thinking::apply_encoding(map, &request.model, request.thinking.as_ref());
        }
        body
    }

    // ========================================================================
    // Non-streaming
    // ========================================================================

    /// Complete a request, applying the vision fallback policy.
    pub async fn complete(&self, request: &CanonicalRequest) -> Result<Completion> {
        let plan = vision::plan(request, &self.policy);
        match plan {
            VisionPlan::Direct => Ok(Completion {
                body: self.complete_direct(request).await?,
                effective_request: request.clone(),
            }),
            VisionPlan::DirectWithSubstitution => match self.complete_direct(request).await {
                Ok(body) => Ok(Completion {
                    body,
                    effective_request: request.clone(),
                }),
                Err(err) if is_vision_rejection(&err) => {
                    let swapped = self.substitute(request, &err);
                    Ok(Completion {
                        body: self.complete_direct(&swapped).await?,
                        effective_request: swapped,
                    })
                }
                Err(err) => Err(err),
            },
            VisionPlan::TwoStage => {
                let effective = self.two_stage_request(request).await;
                Ok(Completion {
                    body: self.complete_direct(&effective).await?,
                    effective_request: effective,
                })
            }
        }
    }

    /// Complete a request as-is, with retries.
    pub async fn complete_direct(&self, request: &CanonicalRequest) -> Result<Value> {
        self.call_json(request, true).await
    }

    async fn call_json(&self, request: &CanonicalRequest, inject_prompt: bool) -> Result<Value> {
        let mut request = request.clone();
        request.stream = false;
        let body = self.prepare_body(&request, inject_prompt).await;
        let response = self
            .send_with_retry(
                &body,
                SendOptions {
                    stream: false,
                    allow_retry: true,
                },
            )
            .await?;

        let status = response.status().as_u16();
        let encoding = response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await.map_err(|e| {
            AppError::UpstreamUnavailable(format!("Failed to read upstream response: {}", e))
        })?;
        let bytes = decode_body(bytes, encoding.as_deref());

        let mut value: Value = serde_json::from_slice(&bytes).map_err(|e| {
            tracing::error!(
                request_id = %get_request_id(),
                status,
                error = %e,
                "Upstream returned invalid JSON"
            );
            AppError::Upstream {
                status,
                message: "Invalid JSON response from upstream".to_string(),
            }
        })?;
        ensure_usage(&mut value);
        Ok(value)
    }

    // ========================================================================
    // Streaming
    // ========================================================================

    /// Open a stream, applying the vision fallback policy.
    ///
    /// With `allow_retry` unset a failure is returned immediately; used for
    /// continuation hops after bytes have already been forwarded.
    pub async fn open_stream(
        &self,
        request: &CanonicalRequest,
        allow_retry: bool,
    ) -> Result<UpstreamStream> {
        let plan = vision::plan(request, &self.policy);
        match plan {
            VisionPlan::Direct => Ok(UpstreamStream {
                response: self.open_stream_direct(request, allow_retry).await?,
                effective_request: request.clone(),
            }),
            VisionPlan::DirectWithSubstitution => {
                match self.open_stream_direct(request, allow_retry).await {
                    Ok(response) => Ok(UpstreamStream {
                        response,
                        effective_request: request.clone(),
                    }),
                    Err(err) if is_vision_rejection(&err) => {
                        let swapped = self.substitute(request, &err);
                        Ok(UpstreamStream {
                            response: self.open_stream_direct(&swapped, allow_retry).await?,
                            effective_request: swapped,
                        })
                    }
                    Err(err) => Err(err),
                }
            }
            VisionPlan::TwoStage => {
                let effective = self.two_stage_request(request).await;
                Ok(UpstreamStream {
                    response: self.open_stream_direct(&effective, allow_retry).await?,
                    effective_request: effective,
                })
            }
        }
    }

    /// Open a stream for a request as-is.
    pub async fn open_stream_direct(
        &self,
        request: &CanonicalRequest,
        allow_retry: bool,
    ) -> Result<reqwest::Response> {
        let mut request = request.clone();
        request.stream = true;
        let body = self.prepare_body(&request, true).await;
        self.send_with_retry(
            &body,
            SendOptions {
                stream: true,
                allow_retry,
            },
        )
        .await
    }

    // ========================================================================
    // Vision fallback
    // ========================================================================

    fn substitute(&self, request: &CanonicalRequest, err: &AppError) -> CanonicalRequest {
        tracing::warn!(
            request_id = %get_request_id(),
            model = %request.model,
            vision_model = %self.policy.vision_model,
            error = %err,
            "Upstream rejected images; retrying with vision model"
        );
        get_metrics()
            .vision_fallbacks
            .with_label_values(&[VisionPlan::DirectWithSubstitution.metric_label()])
            .inc();
        vision::substitute_model(request, &self.policy)
    }

    /// Describe the images with the vision model and bridge the description
    /// into the original request. Falls back to sending the whole request to
    /// the vision model if the description call fails.
    async fn two_stage_request(&self, request: &CanonicalRequest) -> CanonicalRequest {
        let metrics = get_metrics();
        match self.describe_images(request).await {
            Ok(description) if !description.trim().is_empty() => {
                tracing::info!(
                    request_id = %get_request_id(),
                    model = %request.model,
                    images = request.image_count(),
                    description_chars = description.chars().count(),
                    "Bridged image description into text-only request"
                );
                metrics
                    .vision_fallbacks
                    .with_label_values(&[VisionPlan::TwoStage.metric_label()])
                    .inc();
                vision::bridge_with_description(request, &description)
            }
            outcome => {
                let reason = match outcome {
                    Err(e) => e.to_string(),
                    Ok(_) => "empty description".to_string(),
                };
                tracing::warn!(
                    request_id = %get_request_id(),
                    model = %request.model,
                    vision_model = %self.policy.vision_model,
                    reason = %reason,
                    "Image description failed; sending request to vision model"
                );
                metrics
                    .vision_fallbacks
                    .with_label_values(&[VisionPlan::Direct.metric_label()])
                    .inc();
                vision::substitute_model(request, &self.policy)
            }
        }
    }

    async fn describe_images(&self, request: &CanonicalRequest) -> Result<String> {
        let describe = vision::describe_request(request, &self.policy);
        let body = self.call_json(&describe, false).await?;
        Ok(message_text(&body))
    }

    // ========================================================================
    // Models
    // ========================================================================

    /// Fetch the upstream model list.
    pub async fn list_models(&self) -> Result<Value> {
        let bearer = self.credentials.current_bearer_token().await?;
        let response = self
            .http
            .get(format!("{}/models", self.base_url))
            .headers(upstream_headers(HeaderMap::new(), &bearer))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(format!("Upstream request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(format!("Invalid model list: {}", e)))
    }

    // ========================================================================
    // Transport
    // ========================================================================

    async fn send_with_retry(
        &self,
        body: &Value,
        options: SendOptions,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let max_attempts = if options.allow_retry {
            self.retry.max_attempts.max(1)
        } else {
            1
        };
        let metrics = get_metrics();
        let mut attempt = 0;
        let mut refreshed = false;

        loop {
            attempt += 1;
            let bearer = self.credentials.current_bearer().await?;
            let mut builder = self
                .http
                .post(&url)
                .headers(upstream_headers(HeaderMap::new(), &bearer.token))
                .json(body);
            if !options.stream {
                builder = builder.timeout(self.request_timeout);
            }

            let error = match builder.send().await {
                Ok(response) if response.status().is_success() => {
                    metrics
                        .upstream_attempts
                        .with_label_values(&[ATTEMPT_OUTCOME_OK])
                        .inc();
                    tracing::debug!(
                        request_id = %get_request_id(),
                        attempt,
                        stream = options.stream,
                        "Upstream accepted request"
                    );
                    return Ok(response);
                }
                Ok(response)
                    if response.status() == reqwest::StatusCode::UNAUTHORIZED
                        && options.allow_retry
                        && !refreshed =>
                {
                    refreshed = true;
                    metrics
                        .upstream_attempts
                        .with_label_values(&[ATTEMPT_OUTCOME_RETRYABLE])
                        .inc();
                    tracing::warn!(
                        request_id = %get_request_id(),
                        "Upstream rejected credentials; refreshing token"
                    );
                    if let Err(e) = self.credentials.refresh_rejected(bearer.generation).await {
                        tracing::warn!(error = %e, "Credential refresh failed");
                        return Err(error_from_response(response).await);
                    }
                    // the re-send after a refresh does not use up a retry
                    attempt -= 1;
                    continue;
                }
                Ok(response) => {
                    let retryable = response.status().is_server_error();
                    let err = error_from_response(response).await;
                    if !retryable {
                        metrics
                            .upstream_attempts
                            .with_label_values(&[ATTEMPT_OUTCOME_FATAL])
                            .inc();
                        return Err(err);
                    }
                    err
                }
                Err(e) => AppError::UpstreamUnavailable(format!("Upstream request failed: {}", e)),
            };

            metrics
                .upstream_attempts
                .with_label_values(&[ATTEMPT_OUTCOME_RETRYABLE])
                .inc();
            if attempt >= max_attempts {
                tracing::error!(
                    request_id = %get_request_id(),
                    attempts = attempt,
                    error = %error,
                    "Upstream request failed"
                );
                return Err(error);
            }
            let delay = self.retry.delay(attempt);
            tracing::warn!(
                request_id = %get_request_id(),
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Upstream attempt failed; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn is_vision_rejection(err: &AppError) -> bool {
    match err {
        AppError::Upstream { status, message } => vision::is_vision_rejection(*status, message),
        _ => false,
    }
}

/// Map a non-success upstream reply to an error carrying its status and the
/// most specific message the body offers.
async fn error_from_response(response: reqwest::Response) -> AppError {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| extract_error_message(&v))
        .unwrap_or(text);
    AppError::Upstream {
        status,
        message: truncate_text(message.trim(), MAX_ERROR_MESSAGE_LEN),
    }
}

/// Gunzip a body that carries the gzip magic but no content-encoding label.
pub fn decode_body(bytes: Bytes, content_encoding: Option<&str>) -> Bytes {
    let labelled = content_encoding
        .map(|e| !e.trim().is_empty() && !e.eq_ignore_ascii_case("identity"))
        .unwrap_or(false);
    if labelled || !bytes.starts_with(&GZIP_MAGIC) {
        return bytes;
    }
    let mut decoded = Vec::new();
    match GzDecoder::new(bytes.as_ref()).read_to_end(&mut decoded) {
        Ok(_) => Bytes::from(decoded),
        Err(e) => {
            tracing::warn!(error = %e, "Body looked gzip-compressed but did not decode");
            bytes
        }
    }
}

/// Make sure a completion carries a usage object.
pub fn ensure_usage(body: &mut Value) {
    if let Value::Object(obj) = body {
        if obj.get("usage").map_or(true, Value::is_null) {
            obj.insert(
                "usage".into(),
                json!({"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0}),
            );
        }
    }
}

/// Assistant text of a completion's first choice.
pub fn message_text(body: &Value) -> String {
    match body.pointer("/choices/0/message/content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}
