//! Closed failure taxonomy.
//!
//! Every error that crosses into observable state is a [`Failure`]. The kind
//! is one of four closed variants; everything else is structured diagnostics.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable failure codes attached by the core itself.
///
/// Collaborators may use any string as a code; these are the ones the
/// fetcher, runner and coordinator emit.
pub mod codes {
    /// The operation was superseded or cancelled before it settled.
    pub const CANCELLED: &str = "cancelled";
    /// The network call did not complete within its timeout.
    pub const TIMEOUT: &str = "timeout";
    /// The transport could not reach the server.
    pub const CONNECT: &str = "connect";
    /// Any other transport-level error.
    pub const TRANSPORT: &str = "transport";
    /// The server answered with a non-success status.
    pub const HTTP_STATUS: &str = "http_status";
    /// The response body could not be parsed in its declared content kind.
    pub const DECODE: &str = "decode";
    /// The transformed response was rejected by its schema.
    pub const SCHEMA_MISMATCH: &str = "schema_mismatch";
    /// The request could not be built (bad URL, unserializable body).
    pub const INVALID_REQUEST: &str = "invalid_request";
    /// The wrapped operation panicked.
    pub const PANICKED: &str = "panicked";
    /// The operation returned an error that was not a `Failure`.
    pub const UNEXPECTED: &str = "unexpected";
}

/// Failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed or schema-rejected data.
    Validation,
    /// Transport failure, timeout, or non-2xx response.
    Network,
    /// Authentication or authorization rejection.
    Auth,
    /// Domain-rule violation surfaced by a collaborator.
    Business,
}

impl FailureKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Network => "network",
            Self::Auth => "auth",
            Self::Business => "business",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rejected field in a validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// JSON-pointer style path to the offending value (`""` for the root).
    pub path: String,
    /// Short machine-readable reason (`"type"`, `"required"`, ...).
    pub code: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(
        path: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Attempt metadata merged into a failure by the retry machinery.
///
/// `attempt` is zero-based: attempt 0 is the first try, so a call
/// configured with `max_retries = 3` makes at most attempts 0 through 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryContext {
    pub attempt: u32,
    pub max_retries: u32,
    /// Whether another attempt would have been (or will be) made.
    pub retryable: bool,
}

impl RetryContext {
    #[must_use]
    pub const fn new(attempt: u32, max_retries: u32, retryable: bool) -> Self {
        Self {
            attempt,
            max_retries,
            retryable,
        }
    }

    #[must_use]
    pub const fn attempts_remaining(&self) -> u32 {
        self.max_retries.saturating_sub(self.attempt)
    }
}

/// Typed failure carried in `Result<T, Failure>`.
///
/// Fields are public so callers can pattern-match on `kind`, `code` and
/// `status_code` directly.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct Failure {
    pub kind: FailureKind,

    /// Human-readable description. Never contains an unsanitized URL.
    pub message: String,

    /// Stable code, see [`codes`].
    pub code: Option<String>,

    /// Error-specific context (sanitized URL, method, body excerpt, ...).
    pub details: BTreeMap<String, String>,

    /// Offending field paths for validation failures.
    pub issues: Vec<ValidationIssue>,

    #[source]
    pub cause: Option<Arc<dyn StdError + Send + Sync>>,

    /// Whether retrying may succeed.
    pub retryable: bool,

    /// HTTP status, when the failure came from a response.
    pub status_code: Option<u16>,

    /// Attempt metadata, attached by the retry machinery.
    pub retry: Option<RetryContext>,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            details: BTreeMap::new(),
            issues: Vec::new(),
            cause: None,
            retryable: false,
            status_code: None,
            retry: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Network, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Auth, message)
    }

    pub fn business(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Business, message)
    }

    /// The failure a superseded or cancelled operation reports.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::network("operation cancelled").with_code(codes::CANCELLED)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_issues(mut self, issues: impl IntoIterator<Item = ValidationIssue>) -> Self {
        self.issues.extend(issues);
        self
    }

    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Attach an already shared cause (e.g. a boxed error converted with `Arc::from`).
    pub fn with_shared_cause(mut self, cause: Arc<dyn StdError + Send + Sync>) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    /// Merge attempt metadata. The context's `retryable` flag wins, since it
    /// reflects whether the retry machinery would try again.
    pub fn with_retry(mut self, context: RetryContext) -> Self {
        self.retryable = context.retryable;
        self.retry = Some(context);
        self
    }

    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self.kind, FailureKind::Validation)
    }

    #[must_use]
    pub const fn is_network(&self) -> bool {
        matches!(self.kind, FailureKind::Network)
    }

    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self.kind, FailureKind::Auth)
    }

    #[must_use]
    pub const fn is_business(&self) -> bool {
        matches!(self.kind, FailureKind::Business)
    }

    #[must_use]
    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.has_code(codes::CANCELLED)
    }

    /// Zero-based attempt that produced this failure, if known.
    #[must_use]
    pub fn attempt(&self) -> Option<u32> {
        self.retry.map(|ctx| ctx.attempt)
    }

    /// Serialize to JSON for display or structured logs.
    ///
    /// The cause is rendered through its `Display` only.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::json!({
            "kind": self.kind,
            "message": self.message,
            "retryable": self.retryable,
        });

        if let Some(code) = &self.code {
            obj["code"] = serde_json::Value::String(code.clone());
        }
        if let Some(status) = self.status_code {
            obj["status_code"] = serde_json::Value::from(status);
        }
        if !self.details.is_empty() {
            obj["details"] = serde_json::json!(self.details);
        }
        if !self.issues.is_empty() {
            obj["issues"] = serde_json::json!(self.issues);
        }
        if let Some(retry) = self.retry {
            obj["retry"] = serde_json::json!(retry);
        }
        if let Some(cause) = &self.cause {
            obj["cause"] = serde_json::Value::String(cause.to_string());
        }

        obj
    }
}

impl Serialize for Failure {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_json().serialize(serializer)
    }
}
