use std::time::Duration;
use thiserror::Error;

use crate::fetch::FetchError;

/// Structured error context for logging and scheduling decisions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Field path or storage key that caused the error (e.g. "records[3].id", "activities.json")
    pub field_path: Option<String>,
    /// Additional context about the error
    pub details: Option<String>,
    /// Component that raised the error (e.g. "cache_store", "retry_client")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Unified error type for the cache engine.
///
/// Fetch failures are folded into the four upstream categories the scheduler
/// reasons about (`RateLimited`, `Throttled`, `AuthFailed`, `Transport`); the
/// rest are local failures.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Rate limit exceeded: {reason}")]
    RateLimited {
        reason: String,
        retry_after: Option<Duration>,
    },

    #[error("Upstream throttled{}", format_wait(.retry_after))]
    Throttled { retry_after: Option<Duration> },

    #[error("Authentication failed: {message}")]
    AuthFailed { message: String },

    #[error("Transport error after {attempts} attempt(s): {message}")]
    Transport { message: String, attempts: u32 },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Storage error: {message}{}", format_context(.context))]
    Storage {
        message: String,
        context: ErrorContext,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// How the scheduler should react to a failed refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The upstream budget is exhausted; back off before trying again.
    Cooldown,
    /// Try again on the next periodic tick.
    NextTick,
    /// Shutdown in progress; nothing to reschedule.
    Cancelled,
}

fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

fn format_wait(wait: &Option<Duration>) -> String {
    match wait {
        Some(d) => format!(", retry after {}s", d.as_secs()),
        None => String::new(),
    }
}

impl Error {
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn storage_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Storage {
            message: msg.into(),
            context,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Validation { context, .. }
            | Error::Configuration { context, .. }
            | Error::Storage { context, .. } => Some(context),
            _ => None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::RateLimited { .. } | Error::Throttled { .. } => ErrorClass::Cooldown,
            Error::Cancelled(_) => ErrorClass::Cancelled,
            _ => ErrorClass::NextTick,
        }
    }

    /// Upstream-suggested wait, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } | Error::Throttled { retry_after } => {
                *retry_after
            }
            _ => None,
        }
    }

    /// Map the last fetch failure of an exhausted retry loop.
    pub(crate) fn from_fetch(err: FetchError, attempts: u32) -> Self {
        match err {
            FetchError::Unauthorized(message) => Error::AuthFailed { message },
            FetchError::Throttled { retry_after } => Error::Throttled { retry_after },
            FetchError::Transport(message) => Error::Transport { message, attempts },
            FetchError::Status { status, message } => Error::Transport {
                message: format!("HTTP {}: {}", status, message),
                attempts,
            },
        }
    }
}
