use super::models::{endpoint_path, Usage, ANTHROPIC_MAX_TOKENS, ANTHROPIC_VERSION};
use bundlelab_adapters::config::{Provider, ResolvedModel};
use bundlelab_core::protocol::{ChatMessage, ModelClient};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

/// Prefix of the reply that stands in for a call that failed after retries.
/// The reply never contains a brace, so it can never parse as a mapping.
pub const FAILURE_SENTINEL_PREFIX: &str = "MODEL_CALL_FAILED";

/// Maximum length for error content in error messages
const MAX_ERROR_CONTENT_LEN: usize = 200;

/// Rate limit retry configuration
pub(crate) const MAX_RETRIES: u32 = 3;
pub(crate) const INITIAL_BACKOFF_MS: u64 = 2000;
pub(crate) const BACKOFF_MULTIPLIER: u64 = 2;
pub(crate) const MAX_TOTAL_BACKOFF_SECS: u64 = 60;
pub(crate) const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Sanitize API response content for error messages to prevent credential leakage.
fn sanitize_api_response(content: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "api_key",
        "apikey",
        "x-api-key",
        "secret",
        "password",
        "credential",
        "bearer",
        "sk-",
    ];

    let truncated = truncate_str(content, MAX_ERROR_CONTENT_LEN);

    let lower = truncated.to_lowercase();
    for pattern in SECRET_PATTERNS {
        if lower.contains(pattern) {
            return "(response details redacted - may contain sensitive data)".to_string();
        }
    }

    truncated.to_string()
}

/// Extract a retry hint from an error body such as "retry after 5 seconds".
fn parse_retry_after(text: &str) -> Option<u64> {
    let text_lower = text.to_lowercase();
    if let Some(pos) = text_lower.find("retry") {
        let after_retry = &text_lower[pos..];
        for word in after_retry.split_whitespace().skip(1).take(5) {
            if let Ok(secs) = word.trim_matches(|c: char| !c.is_numeric()).parse::<u64>() {
                if secs > 0 && secs < 300 {
                    return Some(secs);
                }
            }
        }
    }
    None
}

fn parse_retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0 && *secs < 300)
}

pub(crate) fn backoff_secs(retry_count: u32) -> u64 {
    let factor = BACKOFF_MULTIPLIER.pow(retry_count.saturating_sub(1));
    let ms = INITIAL_BACKOFF_MS.saturating_mul(factor);
    let secs = ms / 1000;
    if secs == 0 {
        1
    } else {
        secs
    }
}

pub(crate) fn is_retryable_network_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn map_timeout_error(provider: Provider, err: reqwest::Error) -> anyhow::Error {
    if err.is_timeout() {
        anyhow::anyhow!("{} request timed out", provider)
    } else if err.is_connect() {
        anyhow::anyhow!("could not connect to {}", provider)
    } else {
        err.into()
    }
}

/// Truncate a string for display (Unicode-safe)
pub(crate) fn truncate_str(s: &str, max_chars: usize) -> &str {
    if s.chars().count() <= max_chars {
        s
    } else {
        let byte_idx = s
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        &s[..byte_idx]
    }
}

/// Degraded reply for a call that could not be completed.
pub fn failure_sentinel(reason: &str) -> String {
    let reason: String = truncate_str(reason, MAX_ERROR_CONTENT_LEN)
        .chars()
        .map(|c| match c {
            '{' => '(',
            '}' => ')',
            other => other,
        })
        .collect();
    format!("{}: {}", FAILURE_SENTINEL_PREFIX, reason)
}

pub fn is_failure_sentinel(reply: &str) -> bool {
    reply.starts_with(FAILURE_SENTINEL_PREFIX)
}

/// Create a configured HTTP client for model requests
pub(crate) fn create_http_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

fn wire_messages(messages: &[ChatMessage]) -> Vec<WireMessage<'_>> {
    messages
        .iter()
        .map(|message| WireMessage {
            role: message.role.as_str(),
            content: &message.content,
        })
        .collect()
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Request body for one provider, rebuilt on every attempt.
fn request_body(model: &ResolvedModel, messages: &[ChatMessage]) -> anyhow::Result<serde_json::Value> {
    let body = match model.provider {
        Provider::OpenAi => serde_json::to_value(ChatRequest {
            model: &model.name,
            messages: wire_messages(messages),
            temperature: model.temperature,
        })?,
        Provider::Anthropic => serde_json::to_value(AnthropicRequest {
            model: &model.name,
            max_tokens: ANTHROPIC_MAX_TOKENS,
            messages: wire_messages(messages),
            temperature: model.temperature,
        })?,
    };
    Ok(body)
}

/// Reply text and usage from a successful response body.
fn extract_reply(provider: Provider, text: &str) -> anyhow::Result<(String, Option<Usage>)> {
    let (content, usage) = match provider {
        Provider::OpenAi => {
            let parsed: ChatResponse = serde_json::from_str(text).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to parse {} response: {}\n{}",
                    provider,
                    e,
                    sanitize_api_response(text)
                )
            })?;
            let content = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content)
                .unwrap_or_default();
            (content, parsed.usage)
        }
        Provider::Anthropic => {
            let parsed: AnthropicResponse = serde_json::from_str(text).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to parse {} response: {}\n{}",
                    provider,
                    e,
                    sanitize_api_response(text)
                )
            })?;
            let content = parsed
                .content
                .into_iter()
                .filter(|block| block.kind == "text")
                .filter_map(|block| block.text)
                .collect::<Vec<_>>()
                .join("");
            (content, parsed.usage)
        }
    };

    if content.trim().is_empty() {
        return Err(anyhow::anyhow!("{} returned an empty response", provider));
    }
    Ok((content, usage))
}

/// Chat endpoint for one resolved model.
pub struct ChatClient {
    http: reqwest::Client,
    model: ResolvedModel,
    usage: Mutex<Usage>,
}

impl ChatClient {
    pub fn new(model: ResolvedModel) -> anyhow::Result<Self> {
        Ok(Self {
            http: create_http_client(REQUEST_TIMEOUT_SECS)?,
            model,
            usage: Mutex::new(Usage::default()),
        })
    }

    /// Token usage accumulated over every successful call.
    pub fn usage_totals(&self) -> Usage {
        match self.usage.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn record_usage(&self, usage: &Usage) {
        let mut guard = match self.usage.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.merge(usage);
    }

    /// Send the conversation and return the reply text.
    pub async fn complete(&self, messages: &[ChatMessage]) -> anyhow::Result<String> {
        let body = request_body(&self.model, messages)?;
        let text = self.send_with_retry(&body).await?;
        let (content, usage) = extract_reply(self.model.provider, &text)?;
        self.record_usage(&usage.unwrap_or_default());
        Ok(content)
    }

    fn request(&self, body: &serde_json::Value) -> anyhow::Result<reqwest::RequestBuilder> {
        let url = self.model.endpoint(endpoint_path(self.model.provider))?;
        let builder = self
            .http
            .post(url)
            .header("Content-Type", "application/json");
        let builder = match self.model.provider {
            Provider::OpenAi => {
                builder.header("Authorization", format!("Bearer {}", self.model.api_key))
            }
            Provider::Anthropic => builder
                .header("x-api-key", &self.model.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
        };
        Ok(builder.json(body))
    }

    /// Send request with automatic retry on transient errors.
    ///
    /// Retries on:
    /// - Network errors (timeout, connection failures)
    /// - Rate limits (429)
    /// - Server errors (5xx)
    ///
    /// Total sleep across retries never exceeds [`MAX_TOTAL_BACKOFF_SECS`].
    async fn send_with_retry(&self, body: &serde_json::Value) -> anyhow::Result<String> {
        let provider = self.model.provider;
        let mut last_error = String::new();
        let mut retry_count = 0;
        let mut slept_secs = 0;

        while retry_count <= MAX_RETRIES {
            let response = match self.request(body)?.send().await {
                Ok(response) => response,
                Err(err) => {
                    last_error = err.to_string();
                    if is_retryable_network_error(&err) && retry_count < MAX_RETRIES {
                        retry_count += 1;
                        if let Some(wait) = budgeted_wait(backoff_secs(retry_count), &mut slept_secs) {
                            tracing::debug!(%provider, retry_count, wait, error = %err, "retrying after network error");
                            tokio::time::sleep(Duration::from_secs(wait)).await;
                            continue;
                        }
                    }
                    return Err(map_timeout_error(provider, err));
                }
            };

            let status = response.status();
            let header_hint = parse_retry_after_header(response.headers());
            let text = match response.text().await {
                Ok(text) => text,
                Err(err) => {
                    last_error = err.to_string();
                    if is_retryable_network_error(&err) && retry_count < MAX_RETRIES {
                        retry_count += 1;
                        if let Some(wait) = budgeted_wait(backoff_secs(retry_count), &mut slept_secs) {
                            tokio::time::sleep(Duration::from_secs(wait)).await;
                            continue;
                        }
                    }
                    return Err(map_timeout_error(provider, err));
                }
            };

            if status.is_success() {
                return Ok(text);
            }

            last_error = text.clone();

            let retryable = status.as_u16() == 429 || status.is_server_error();
            if retryable && retry_count < MAX_RETRIES {
                retry_count += 1;
                let wanted = if status.as_u16() == 429 {
                    header_hint
                        .or_else(|| parse_retry_after(&text))
                        .unwrap_or_else(|| backoff_secs(retry_count))
                } else {
                    backoff_secs(retry_count)
                };
                if let Some(wait) = budgeted_wait(wanted, &mut slept_secs) {
                    tracing::debug!(%provider, retry_count, wait, status = status.as_u16(), "retrying after HTTP error");
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    continue;
                }
            }

            let error_msg = match status.as_u16() {
                401 => format!(
                    "Invalid {} API key. Run 'bundlelab credentials set --provider {}' to update it.",
                    provider, provider
                ),
                429 => format!("Rate limited by {} after {} retries", provider, retry_count),
                500..=599 => format!(
                    "{} server error ({}). The service may be temporarily unavailable.",
                    provider, status
                ),
                _ => format!("API error {}: {}", status, sanitize_api_response(&text)),
            };
            return Err(anyhow::anyhow!("{}", error_msg));
        }

        Err(anyhow::anyhow!("{}", sanitize_api_response(&last_error)))
    }
}

/// Clamp a wait to what is left of the total backoff budget. `None` once the
/// budget is spent.
fn budgeted_wait(wanted: u64, slept_secs: &mut u64) -> Option<u64> {
    let remaining = MAX_TOTAL_BACKOFF_SECS.saturating_sub(*slept_secs);
    if remaining == 0 {
        return None;
    }
    let wait = wanted.min(remaining);
    *slept_secs += wait;
    Some(wait)
}

impl ModelClient for ChatClient {
    fn model_id(&self) -> &str {
        &self.model.name
    }

    fn send<'a>(
        &'a self,
        messages: &'a [ChatMessage],
    ) -> Pin<Box<dyn Future<Output = String> + Send + 'a>> {
        Box::pin(async move {
            match self.complete(messages).await {
                Ok(reply) => reply,
                Err(err) => {
                    tracing::warn!(
                        model = %self.model.name,
                        provider = %self.model.provider,
                        error = %err,
                        "model call failed"
                    );
                    failure_sentinel(&err.to_string())
                }
            }
        })
    }
}
