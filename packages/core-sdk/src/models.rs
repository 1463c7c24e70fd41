use std::{fmt, str::FromStr, time::Duration};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/**
 * \brief Provider configuration row.
 * \details `name` doubles as the model identifier sent to the remote API.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /** \brief Unique name, also the remote model id. */
    pub name: String,
    /** \brief Chat completions endpoint. */
    pub api_url: String,
    /** \brief Environment key identifier used to resolve secrets. */
    pub credential_id: String,
    /** \brief Whether the provider takes part in fan-out batches. */
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl ProviderConfig {
    pub fn new(name: &str, api_url: &str, credential_id: &str) -> Self {
        Self {
            name: name.to_string(),
            api_url: api_url.to_string(),
            credential_id: credential_id.to_string(),
            active: true,
        }
    }
}

/**
 * \brief Sampling parameters supplied fresh for every dispatch.
 */
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    #[serde(default)]
    pub thinking_enabled: bool,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2048,
            top_p: 1.0,
            thinking_enabled: false,
        }
    }
}

impl GenerationParameters {
    /**
     * \brief Rejects values outside the ranges accepted by the providers.
     */
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.temperature) {
            bail!("temperature must be within 0.0..=2.0, got {}", self.temperature);
        }
        if self.max_tokens < 1 {
            bail!("max_tokens must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            bail!("top_p must be within 0.0..=1.0, got {}", self.top_p);
        }
        Ok(())
    }
}

/**
 * \brief Terminal status of a single provider request.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutcomeStatus {
    #[serde(rename = "Success")]
    Success,
    /** \brief Transport failure, or candidates exhausted after failures. */
    #[serde(rename = "Error")]
    Error,
    /** \brief No credential could be resolved; no request was sent. */
    #[serde(rename = "Error: Auth")]
    AuthError,
    /** \brief Non-200 response on the final credential. */
    #[serde(rename = "Error: API")]
    ApiError,
    /** \brief 200 response without `choices[0].message.content`. */
    #[serde(rename = "Error: Parse")]
    ParseError,
    /** \brief The owning batch was cancelled before completion. */
    #[serde(rename = "Error: Cancelled")]
    Cancelled,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "Success",
            OutcomeStatus::Error => "Error",
            OutcomeStatus::AuthError => "Error: Auth",
            OutcomeStatus::ApiError => "Error: API",
            OutcomeStatus::ParseError => "Error: Parse",
            OutcomeStatus::Cancelled => "Error: Cancelled",
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, OutcomeStatus::Success)
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutcomeStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "Success" => Ok(OutcomeStatus::Success),
            "Error" => Ok(OutcomeStatus::Error),
            "Error: Auth" => Ok(OutcomeStatus::AuthError),
            "Error: API" => Ok(OutcomeStatus::ApiError),
            "Error: Parse" => Ok(OutcomeStatus::ParseError),
            "Error: Cancelled" => Ok(OutcomeStatus::Cancelled),
            other if other.starts_with("Error") => Ok(OutcomeStatus::Error),
            other => bail!("unknown outcome status: {}", other),
        }
    }
}

/**
 * \brief Result of one dispatched provider request.
 * \details Serialized as the hand-off record `{model, response, status, resp_time}`.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    #[serde(rename = "model")]
    pub provider_name: String,
    #[serde(rename = "response")]
    pub response_text: String,
    pub status: OutcomeStatus,
    #[serde(rename = "resp_time")]
    pub elapsed_seconds: f64,
}

impl RequestOutcome {
    pub fn new(
        provider_name: &str,
        response_text: impl Into<String>,
        status: OutcomeStatus,
        elapsed: Duration,
    ) -> Self {
        Self {
            provider_name: provider_name.to_string(),
            response_text: response_text.into(),
            status,
            elapsed_seconds: elapsed.as_secs_f64(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status.is_error()
    }
}

pub const DEFAULT_REQUEST_DELAY: f64 = 0.0;
pub const DEFAULT_REQUEST_TIMEOUT: f64 = 60.0;
/** \brief Upper bound for a stored delay step or timeout, in seconds (24h). */
pub const MAX_DISPATCH_SECONDS: f64 = 86_400.0;
const MAX_DISPATCH_WAIT: Duration = Duration::from_secs(86_400);

/**
 * \brief Per-batch dispatch configuration, sourced from the settings store right before dispatch.
 */
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DispatchSettings {
    /** \brief Linear stagger step between providers, in seconds. */
    pub delay_step_seconds: f64,
    /** \brief Bound on every individual HTTP attempt, in seconds. */
    pub timeout_seconds: f64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            delay_step_seconds: DEFAULT_REQUEST_DELAY,
            timeout_seconds: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl DispatchSettings {
    /**
     * \brief Rejects values that cannot be stored as dispatch settings.
     */
    pub fn validate(&self) -> Result<()> {
        let delay = self.delay_step_seconds;
        if !delay.is_finite() || !(0.0..=MAX_DISPATCH_SECONDS).contains(&delay) {
            bail!(
                "request_delay must be between 0 and {} seconds",
                MAX_DISPATCH_SECONDS
            );
        }
        let timeout = self.timeout_seconds;
        if !timeout.is_finite() || timeout <= 0.0 || timeout > MAX_DISPATCH_SECONDS {
            bail!(
                "request_timeout must be positive and at most {} seconds",
                MAX_DISPATCH_SECONDS
            );
        }
        Ok(())
    }

    /**
     * \brief Start offset for the provider at `index` in the dispatch list.
     * \details Saturates at 24h.
     */
    pub fn delay_for(&self, index: usize) -> Duration {
        let step = self.delay_step_seconds;
        if !step.is_finite() || step <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(step * index as f64)
            .map_or(MAX_DISPATCH_WAIT, |d| d.min(MAX_DISPATCH_WAIT))
    }

    /**
     * \brief Per-attempt timeout; anything outside (0, 24h] falls back to the default.
     */
    pub fn timeout(&self) -> Duration {
        let secs = self.timeout_seconds;
        if secs > 0.0 && secs <= MAX_DISPATCH_SECONDS {
            if let Ok(timeout) = Duration::try_from_secs_f64(secs) {
                return timeout;
            }
        }
        Duration::from_secs_f64(DEFAULT_REQUEST_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serializes_as_handoff_record() {
        let outcome = RequestOutcome::new(
            "gpt-4o-mini",
            "hello",
            OutcomeStatus::AuthError,
            Duration::from_millis(1500),
        );
        let v = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(v["model"], "gpt-4o-mini");
        assert_eq!(v["response"], "hello");
        assert_eq!(v["status"], "Error: Auth");
        assert_eq!(v["resp_time"], 1.5);
    }

    #[test]
    fn test_status_parse_and_error_classification() {
        assert_eq!("Error: Parse".parse::<OutcomeStatus>().unwrap(), OutcomeStatus::ParseError);
        assert_eq!("Error: Quota".parse::<OutcomeStatus>().unwrap(), OutcomeStatus::Error);
        assert!("Done".parse::<OutcomeStatus>().is_err());
        assert!(!OutcomeStatus::Success.is_error());
        assert!(OutcomeStatus::Cancelled.is_error());
    }

    #[test]
    fn test_generation_parameters_validate_ranges() {
        assert!(GenerationParameters::default().validate().is_ok());
        let hot = GenerationParameters {
            temperature: 2.5,
            ..Default::default()
        };
        assert!(hot.validate().is_err());
        let empty = GenerationParameters {
            max_tokens: 0,
            ..Default::default()
        };
        assert!(empty.validate().is_err());
        let wide = GenerationParameters {
            top_p: 1.2,
            ..Default::default()
        };
        assert!(wide.validate().is_err());
    }

    #[test]
    fn test_dispatch_settings_guard_bad_values() {
        let settings = DispatchSettings {
            delay_step_seconds: 2.0,
            timeout_seconds: 0.0,
        };
        assert_eq!(settings.delay_for(0), Duration::ZERO);
        assert_eq!(settings.delay_for(2), Duration::from_secs(4));
        assert_eq!(settings.timeout(), Duration::from_secs(60));

        let negative = DispatchSettings {
            delay_step_seconds: -1.0,
            timeout_seconds: f64::NAN,
        };
        assert_eq!(negative.delay_for(3), Duration::ZERO);
        assert_eq!(negative.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_dispatch_settings_huge_values_do_not_overflow() {
        let huge = DispatchSettings {
            delay_step_seconds: 1e19,
            timeout_seconds: 1e20,
        };
        assert_eq!(huge.delay_for(0), Duration::ZERO);
        assert_eq!(huge.delay_for(2), Duration::from_secs(86_400));
        assert_eq!(huge.timeout(), Duration::from_secs(60));
        assert!(huge.validate().is_err());

        let long_list = DispatchSettings {
            delay_step_seconds: 3_600.0,
            timeout_seconds: 86_400.0,
        };
        assert!(long_list.validate().is_ok());
        assert_eq!(long_list.delay_for(30), Duration::from_secs(86_400));
        assert_eq!(long_list.timeout(), Duration::from_secs(86_400));

        let too_long = DispatchSettings {
            delay_step_seconds: 0.0,
            timeout_seconds: 86_401.0,
        };
        assert!(too_long.validate().is_err());
    }
}
