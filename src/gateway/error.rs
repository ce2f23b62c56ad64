//! Provider failures.
//!
//! Every variant maps to either a retry inside the gateway or, once retries
//! are spent, an in-band error answer for the sample. None of them abort a
//! scoring run.

use std::time::Duration;

use thiserror::Error;

use super::types::ProviderKind;

/// HTTP-level detail captured from a failed provider response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub http_status: Option<u16>,
    /// Provider error code from the body, e.g. "invalid_api_key".
    pub provider_code: Option<String>,
    /// `x-request-id` (or equivalent) response header.
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn from_status(status: u16, request_id: Option<String>) -> Self {
        Self {
            http_status: Some(status),
            provider_code: None,
            request_id,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: ProviderKind,
        retry_after: Duration,
        context: ErrorContext,
    },

    /// Non-success HTTP status. 5xx is retryable, 4xx is not.
    #[error("{provider} error: {message}")]
    Upstream {
        provider: ProviderKind,
        message: String,
        retryable: bool,
        context: Option<ErrorContext>,
    },

    /// Success status with a body we cannot use.
    #[error("{provider} returned an unusable response: {message}")]
    BadResponse {
        provider: ProviderKind,
        message: String,
    },

    #[error("{provider} refused: {message}")]
    Refused {
        provider: ProviderKind,
        message: String,
    },

    #[error("question too large: {chars} chars (max {limit})")]
    InputTooLarge { chars: usize, limit: usize },

    #[error("{provider} timed out after {after:?}")]
    Timeout {
        provider: ProviderKind,
        after: Duration,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Missing credentials or an unregistered provider.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn upstream(provider: ProviderKind, message: impl Into<String>, retryable: bool) -> Self {
        Self::Upstream {
            provider,
            message: message.into(),
            retryable,
            context: None,
        }
    }

    pub fn bad_response(provider: ProviderKind, message: impl Into<String>) -> Self {
        Self::BadResponse {
            provider,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout { .. } => true,
            Self::Upstream { retryable, .. } => *retryable,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::BadResponse { .. }
            | Self::Refused { .. }
            | Self::InputTooLarge { .. }
            | Self::Config(_) => false,
        }
    }

    /// Short code for usage records and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Upstream { .. } => "upstream_error",
            Self::BadResponse { .. } => "bad_response",
            Self::Refused { .. } => "refused",
            Self::InputTooLarge { .. } => "input_too_large",
            Self::Timeout { .. } => "timeout",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. } => Some(context),
            Self::Upstream { context, .. } => context.as_ref(),
            _ => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.context().and_then(|c| c.request_id.as_deref())
    }
}
