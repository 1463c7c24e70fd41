use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::{
    credentials::{self, EnvSecrets, SecretSource},
    models::{DispatchSettings, GenerationParameters, OutcomeStatus, ProviderConfig, RequestOutcome},
    telemetry,
};

const ATTRIBUTION_REFERER: &str = "https://github.com/antigravity/chatlist";
const ATTRIBUTION_TITLE: &str = "ChatList AI Tool";

/** \brief Auth and capacity statuses; any other non-200 still rotates but is logged as non-retryable. */
const RETRYABLE_STATUSES: [u16; 4] = [401, 429, 502, 503];

const AGGREGATOR_MARKERS: [&str; 1] = ["openrouter.ai"];
const REASONING_MARKERS: [&str; 2] = ["bigmodel.cn", "api.z.ai"];

/**
 * \brief Provider family derived once from the endpoint URL.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFamily {
    /** \brief Multi-model aggregator; requires attribution headers. */
    Aggregator,
    /** \brief Vendor with a reasoning toggle and case-sensitive model ids. */
    ReasoningVendor,
    DirectVendor,
}

/**
 * \brief Request-shaping quirks of a provider family.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub attribution_headers: bool,
    pub lowercase_model: bool,
    pub thinking: bool,
}

impl ProviderFamily {
    pub fn detect(api_url: &str) -> Self {
        let url = api_url.to_ascii_lowercase();
        if AGGREGATOR_MARKERS.iter().any(|m| url.contains(m)) {
            ProviderFamily::Aggregator
        } else if REASONING_MARKERS.iter().any(|m| url.contains(m)) {
            ProviderFamily::ReasoningVendor
        } else {
            ProviderFamily::DirectVendor
        }
    }

    pub fn capabilities(self) -> Capabilities {
        match self {
            ProviderFamily::Aggregator => Capabilities {
                attribution_headers: true,
                lowercase_model: false,
                thinking: false,
            },
            ProviderFamily::ReasoningVendor => Capabilities {
                attribution_headers: false,
                lowercase_model: true,
                thinking: true,
            },
            ProviderFamily::DirectVendor => Capabilities {
                attribution_headers: false,
                lowercase_model: false,
                thinking: false,
            },
        }
    }
}

/**
 * \brief Chat completions payload for a single user prompt.
 */
pub fn build_payload(
    provider_name: &str,
    prompt: &str,
    params: &GenerationParameters,
    caps: Capabilities,
) -> Value {
    let model = if caps.lowercase_model {
        provider_name.to_lowercase()
    } else {
        provider_name.to_string()
    };
    let mut body = json!({
        "model": model,
        "messages": [{"role": "user", "content": prompt}],
        "temperature": params.temperature,
        "max_tokens": params.max_tokens,
        "top_p": params.top_p,
    });
    if params.thinking_enabled && caps.thinking {
        body["thinking"] = json!({"type": "enabled"});
    }
    body
}

pub fn build_headers(secret: &str, caps: Capabilities) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", secret))?,
    );
    if caps.attribution_headers {
        headers.insert(
            HeaderName::from_static("http-referer"),
            HeaderValue::from_static(ATTRIBUTION_REFERER),
        );
        headers.insert(
            HeaderName::from_static("x-title"),
            HeaderValue::from_static(ATTRIBUTION_TITLE),
        );
    }
    Ok(headers)
}

/**
 * \brief `choices[0].message.content`; empty text counts as absent.
 */
pub fn extract_content(v: &Value) -> Option<String> {
    v.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn backoff_delay(base: Duration, candidate_index: usize) -> Duration {
    base * 2u32.pow(candidate_index.min(16) as u32)
}

fn describe_transport_error(err: &reqwest::Error, timeout: Duration) -> String {
    if err.is_timeout() {
        return format!("request timed out after {:.1}s", timeout.as_secs_f64());
    }
    let mut msg = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}

enum AttemptError {
    Transport(String),
    Status(StatusCode),
}

/**
 * \brief Single-request executor with credential rotation.
 * \details Cheap to clone; clones share the HTTP client and secret source.
 */
#[derive(Clone)]
pub struct Executor {
    client: reqwest::Client,
    secrets: Arc<dyn SecretSource>,
    backoff_base: Duration,
}

impl Executor {
    pub fn new(secrets: Arc<dyn SecretSource>) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            secrets,
            backoff_base: Duration::from_secs(1),
        })
    }

    /**
     * \brief Executor reading secrets from the process environment and `.env`.
     */
    pub fn from_env() -> Result<Self> {
        Self::new(Arc::new(EnvSecrets))
    }

    /**
     * \brief Unit of the rotation backoff; candidate `i` waits `base * 2^i`.
     */
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /**
     * \brief Sends `prompt` to one provider and always returns a terminal outcome.
     */
    pub async fn execute(
        &self,
        provider_name: &str,
        api_url: &str,
        credential_id: &str,
        prompt: &str,
        timeout_seconds: f64,
        params: &GenerationParameters,
    ) -> RequestOutcome {
        let provider = ProviderConfig::new(provider_name, api_url, credential_id);
        let timeout = DispatchSettings {
            timeout_seconds,
            ..Default::default()
        }
        .timeout();
        self.execute_provider(&provider, prompt, timeout, params, &CancellationToken::new())
            .await
    }

    /**
     * \brief As `execute`, resolving early to `Error: Cancelled` once `cancel` fires.
     */
    pub async fn execute_provider(
        &self,
        provider: &ProviderConfig,
        prompt: &str,
        timeout: Duration,
        params: &GenerationParameters,
        cancel: &CancellationToken,
    ) -> RequestOutcome {
        let name = provider.name.as_str();
        let candidates = credentials::resolve(self.secrets.as_ref(), &provider.credential_id);
        if candidates.is_empty() {
            telemetry::log_warn(
                "llm.execute",
                &format!("no credential for {} (id={})", name, provider.credential_id),
            );
            return RequestOutcome::new(
                name,
                "API key not found",
                OutcomeStatus::AuthError,
                Duration::ZERO,
            );
        }

        let caps = ProviderFamily::detect(&provider.api_url).capabilities();
        let payload = build_payload(name, prompt, params, caps);
        let start = Instant::now();
        let total = candidates.len();
        let mut last_error = String::from("no request attempted");

        for (index, secret) in candidates.iter().enumerate() {
            let has_more = index + 1 < total;
            if index > 0 {
                let wait = backoff_delay(self.backoff_base, index);
                tokio::select! {
                    _ = cancel.cancelled() => return cancelled(name, start),
                    _ = tokio::time::sleep(wait) => {}
                }
            }

            let headers = match build_headers(secret, caps) {
                Ok(h) => h,
                Err(e) => {
                    last_error = format!("invalid credential value: {}", e);
                    if has_more {
                        telemetry::log_warn("llm.execute", &format!("{}: {}", name, last_error));
                        continue;
                    }
                    return RequestOutcome::new(
                        name,
                        last_error,
                        OutcomeStatus::Error,
                        start.elapsed(),
                    );
                }
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => return cancelled(name, start),
                r = self.attempt(name, &provider.api_url, headers, &payload, timeout) => r,
            };

            match result {
                Ok(body) => {
                    return match extract_content(&body) {
                        Some(text) => {
                            telemetry::log_event(
                                "llm.execute",
                                &format!(
                                    "{} answered in {:.2}s (key #{})",
                                    name,
                                    start.elapsed().as_secs_f64(),
                                    index + 1
                                ),
                            );
                            RequestOutcome::new(name, text, OutcomeStatus::Success, start.elapsed())
                        }
                        None => RequestOutcome::new(
                            name,
                            "No content in response",
                            OutcomeStatus::ParseError,
                            start.elapsed(),
                        ),
                    };
                }
                Err(AttemptError::Status(code)) => {
                    last_error = format!("HTTP {}", code.as_u16());
                    if has_more {
                        let reason = if RETRYABLE_STATUSES.contains(&code.as_u16()) {
                            "auth/capacity"
                        } else {
                            "non-retryable"
                        };
                        telemetry::log_warn(
                            "llm.execute",
                            &format!(
                                "{} returned {} ({}), switching to backup key",
                                name, code, reason
                            ),
                        );
                        continue;
                    }
                    return RequestOutcome::new(
                        name,
                        last_error,
                        OutcomeStatus::ApiError,
                        start.elapsed(),
                    );
                }
                Err(AttemptError::Transport(msg)) => {
                    last_error = msg;
                    if has_more {
                        telemetry::log_warn(
                            "llm.execute",
                            &format!("fallback triggered for {}: {}", name, last_error),
                        );
                        continue;
                    }
                    telemetry::log_error("llm.execute", &format!("{}: {}", name, last_error));
                    return RequestOutcome::new(
                        name,
                        last_error,
                        OutcomeStatus::Error,
                        start.elapsed(),
                    );
                }
            }
        }

        RequestOutcome::new(name, last_error, OutcomeStatus::Error, start.elapsed())
    }

    async fn attempt(
        &self,
        name: &str,
        api_url: &str,
        headers: HeaderMap,
        payload: &Value,
        timeout: Duration,
    ) -> std::result::Result<Value, AttemptError> {
        let resp = self
            .client
            .post(api_url)
            .headers(headers)
            .timeout(timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| AttemptError::Transport(describe_transport_error(&e, timeout)))?;

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await.unwrap_or_default();
            telemetry::log_error(
                "llm.execute",
                &format!("{} request failed: {} -> {}", name, status, text),
            );
            return Err(AttemptError::Status(status));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| AttemptError::Transport(describe_transport_error(&e, timeout)))
    }
}

fn cancelled(name: &str, start: Instant) -> RequestOutcome {
    RequestOutcome::new(
        name,
        "Request cancelled",
        OutcomeStatus::Cancelled,
        start.elapsed(),
    )
}
