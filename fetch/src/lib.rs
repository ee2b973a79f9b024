//! Resilient HTTP fetch for Keystone.
//!
//! A [`Fetcher`] performs one logical request: every attempt is raced
//! against a timeout, transient statuses and transport errors are retried
//! with exponential backoff, and a successful body is parsed, transformed
//! and validated before it is deserialized into the caller's type. Every
//! failure comes back as a [`Failure`] whose URL details are sanitized.

mod request;
pub mod retry;
pub mod transport;
mod validate;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use reqwest::header::{HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use keystone_config::FetchConfig;
use keystone_types::{Failure, RetryContext, codes};
use keystone_utils::sanitize_url;

pub use request::{BodyKind, FetchRequest};
pub use retry::{RetryPolicy, RetrySchedule, RetryState};
pub use transport::{RawResponse, ReqwestTransport, Transport, TransportError, TransportRequest};
pub use validate::{JsonSchemaValidator, SchemaValidator};

const MAX_ERROR_BODY_CHARS: usize = 512;

/// Errors raised while wiring up a fetcher, before any request is made.
#[derive(Debug, Error)]
pub enum FetchSetupError {
    #[error("failed to build HTTP client: {0}")]
    Client(String),
    #[error("invalid response schema: {0}")]
    Schema(String),
}

type ResponseTransform = dyn Fn(Value) -> Result<Value, Failure> + Send + Sync;
type ErrorTransform = dyn Fn(Failure) -> Failure + Send + Sync;

/// Per-call behavior of [`Fetcher::fetch`].
#[derive(Clone)]
pub struct FetchOptions {
    timeout: Duration,
    retry: RetryPolicy,
    base_url: Option<String>,
    transform_response: Option<Arc<ResponseTransform>>,
    validate_response: Option<Arc<dyn SchemaValidator>>,
    transform_error: Option<Arc<ErrorTransform>>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(FetchConfig::DEFAULT_TIMEOUT_MS),
            retry: RetryPolicy::default(),
            base_url: None,
            transform_response: None,
            validate_response: None,
            transform_error: None,
        }
    }
}

impl fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("base_url", &self.base_url.as_deref().map(sanitize_url))
            .field("transform_response", &self.transform_response.is_some())
            .field("validate_response", &self.validate_response.is_some())
            .field("transform_error", &self.transform_error.is_some())
            .finish()
    }
}

impl FetchOptions {
    #[must_use]
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            timeout: config.timeout(),
            retry: RetryPolicy::from_config(config),
            base_url: config.base_url(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry.retry_delay = retry_delay;
        self
    }

    pub fn with_retry_on_transient_error(mut self, enabled: bool) -> Self {
        self.retry.retry_on_transient_error = enabled;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Applied to the parsed body before validation.
    pub fn with_transform_response(
        mut self,
        transform: impl Fn(Value) -> Result<Value, Failure> + Send + Sync + 'static,
    ) -> Self {
        self.transform_response = Some(Arc::new(transform));
        self
    }

    /// Checked against the transformed value. Rejections are never retried.
    pub fn with_validator(mut self, validator: impl SchemaValidator + 'static) -> Self {
        self.validate_response = Some(Arc::new(validator));
        self
    }

    /// Applied to every failure right before it is returned.
    pub fn with_transform_error(
        mut self,
        transform: impl Fn(Failure) -> Failure + Send + Sync + 'static,
    ) -> Self {
        self.transform_error = Some(Arc::new(transform));
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    #[must_use]
    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    /// A transform or a validator looks at every success body.
    #[must_use]
    pub fn checks_response(&self) -> bool {
        self.transform_response.is_some() || self.validate_response.is_some()
    }
}

/// Issues requests through a [`Transport`].
pub struct Fetcher<X = ReqwestTransport> {
    transport: Arc<X>,
}

impl<X> Clone for Fetcher<X> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
        }
    }
}

impl<X> fmt::Debug for Fetcher<X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fetcher").finish_non_exhaustive()
    }
}

impl Fetcher<ReqwestTransport> {
    pub fn new() -> Result<Self, FetchSetupError> {
        Ok(Self::with_transport(ReqwestTransport::new()?))
    }
}

impl<X: Transport> Fetcher<X> {
    pub fn with_transport(transport: X) -> Self {
        Self::from_shared(Arc::new(transport))
    }

    pub fn from_shared(transport: Arc<X>) -> Self {
        Self { transport }
    }

    #[must_use]
    pub fn transport(&self) -> &X {
        &self.transport
    }

    /// Fetch and deserialize into `T`.
    pub async fn fetch<T: DeserializeOwned>(
        &self,
        request: &FetchRequest,
        options: &FetchOptions,
    ) -> Result<T, Failure> {
        let result = self.attempt_all(request, options).await.and_then(|delivered| {
            serde_json::from_value::<T>(delivered.value).map_err(|e| {
                Failure::validation(format!("response has an unexpected shape: {e}"))
                    .with_code(codes::DECODE)
                    .with_status(delivered.status)
                    .with_retry(delivered.retry)
                    .with_detail("url", delivered.shown_url)
                    .with_detail("method", request.method().as_str())
            })
        });

        match (result, &options.transform_error) {
            (Err(failure), Some(transform)) => Err(transform(failure)),
            (result, _) => result,
        }
    }

    /// Fetch without deserializing; the transformed, validated JSON value.
    pub async fn fetch_value(
        &self,
        request: &FetchRequest,
        options: &FetchOptions,
    ) -> Result<Value, Failure> {
        self.fetch(request, options).await
    }

    async fn attempt_all(
        &self,
        request: &FetchRequest,
        options: &FetchOptions,
    ) -> Result<Delivered, Failure> {
        let url = request.resolve_url(options.base_url())?;
        let shown_url = sanitize_url(url.as_str());
        let method = request.method().clone();

        let mut headers = request.header_map()?;
        if method != Method::GET
            && let Ok(key) = HeaderValue::from_str(&retry::generate_idempotency_key())
        {
            headers.insert(HeaderName::from_static(retry::IDEMPOTENCY_KEY_HEADER), key);
        }

        let mut schedule = RetrySchedule::new(&options.retry);

        loop {
            let attempt = schedule.attempt();
            let mut attempt_headers = headers.clone();
            attempt_headers.insert(
                HeaderName::from_static(retry::RETRY_COUNT_HEADER),
                HeaderValue::from(attempt),
            );

            let call = self.transport.call(TransportRequest {
                method: method.clone(),
                url: url.clone(),
                headers: attempt_headers,
                body: request.body().map(<[u8]>::to_vec),
            });

            let (failure, hint) = match tokio::time::timeout(options.timeout, call).await {
                Ok(Ok(response)) if response.status.is_success() => {
                    schedule.succeed();
                    let retry = schedule.context(false);
                    return match process_success(&response, request, options, &shown_url) {
                        Ok(value) => Ok(Delivered {
                            value,
                            status: response.status.as_u16(),
                            retry,
                            shown_url,
                        }),
                        Err(failure) if failure.retry.is_some() => Err(failure),
                        Err(failure) => Err(failure.with_retry(retry)),
                    };
                }
                Ok(Ok(response)) => {
                    let failure = status_failure(&response, &method, &shown_url);
                    if !is_transient(&response) {
                        schedule.fail();
                        return Err(failure.with_retry(schedule.context(false)));
                    }
                    (failure, retry::parse_retry_after(&response.headers))
                }
                Ok(Err(error)) => (transport_failure(error, &method, &shown_url), None),
                Err(_elapsed) => (
                    timeout_failure(options.timeout, &method, &shown_url),
                    None,
                ),
            };

            if !schedule.can_retry() {
                schedule.fail();
                tracing::debug!(
                    attempt,
                    url = %shown_url,
                    code = failure.code.as_deref().unwrap_or_default(),
                    "Request failed; no attempts remain"
                );
                return Err(failure.with_retry(schedule.context(false)));
            }

            let delay = schedule.schedule_retry(hint);
            tracing::debug!(
                status = ?failure.status_code,
                code = failure.code.as_deref().unwrap_or_default(),
                attempt = attempt + 1,
                delay_ms = delay.as_millis(),
                url = %shown_url,
                "Retrying request"
            );
            schedule.wait().await;
        }
    }
}

/// A body that passed decoding, transformation and validation.
struct Delivered {
    value: Value,
    status: u16,
    retry: RetryContext,
    shown_url: String,
}

fn is_transient(response: &RawResponse) -> bool {
    retry::is_transient_status(response.status)
}

fn process_success(
    response: &RawResponse,
    request: &FetchRequest,
    options: &FetchOptions,
    shown_url: &str,
) -> Result<Value, Failure> {
    let status = response.status.as_u16();
    let mut value = decode_body(response, request.body_kind())
        .map_err(|failure| failure.with_status(status).with_detail("url", shown_url))?;

    if let Some(transform) = &options.transform_response {
        value = transform(value)?;
    }

    if let Some(validator) = &options.validate_response
        && let Err(issues) = validator.validate(&value)
    {
        tracing::debug!(url = %shown_url, issues = issues.len(), "Response rejected by schema");
        return Err(Failure::validation(format!(
            "response from {} {shown_url} does not match the expected schema",
            request.method()
        ))
        .with_code(codes::SCHEMA_MISMATCH)
        .with_status(status)
        .with_detail("url", shown_url)
        .with_detail("method", request.method().as_str())
        .with_issues(issues));
    }

    Ok(value)
}

fn decode_body(response: &RawResponse, kind: BodyKind) -> Result<Value, Failure> {
    let as_json = match kind {
        BodyKind::Json => true,
        BodyKind::Text => false,
        BodyKind::Auto => response.content_type().is_some_and(is_json_content_type),
    };

    if as_json {
        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&response.body).map_err(|e| {
            Failure::validation(format!("response body is not valid JSON: {e}"))
                .with_code(codes::DECODE)
        })
    } else {
        String::from_utf8(response.body.clone())
            .map(Value::String)
            .map_err(|_| {
                Failure::validation("response body is not valid UTF-8").with_code(codes::DECODE)
            })
    }
}

fn is_json_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    mime == "application/json" || mime.ends_with("+json")
}

fn status_failure(response: &RawResponse, method: &Method, shown_url: &str) -> Failure {
    let status = response.status;
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let failure = Failure::network(format!(
        "{method} {shown_url} failed with HTTP {} {reason}",
        status.as_u16()
    ))
    .with_code(codes::HTTP_STATUS)
    .with_status(status.as_u16())
    .with_retryable(retry::is_transient_status(status))
    .with_detail("url", shown_url)
    .with_detail("method", method.as_str());

    match body_excerpt(&response.body) {
        Some(excerpt) => failure.with_detail("body", excerpt),
        None => failure,
    }
}

fn transport_failure(error: TransportError, method: &Method, shown_url: &str) -> Failure {
    let code = match error {
        TransportError::Timeout => codes::TIMEOUT,
        TransportError::Connect(_) => codes::CONNECT,
        TransportError::Aborted | TransportError::Other(_) => codes::TRANSPORT,
    };
    Failure::network(format!("{method} {shown_url}: {error}"))
        .with_code(code)
        .with_retryable(true)
        .with_detail("url", shown_url)
        .with_detail("method", method.as_str())
        .with_cause(error)
}

fn timeout_failure(timeout: Duration, method: &Method, shown_url: &str) -> Failure {
    Failure::network(format!(
        "{method} {shown_url} timed out after {} ms",
        timeout.as_millis()
    ))
    .with_code(codes::TIMEOUT)
    .with_retryable(true)
    .with_detail("url", shown_url)
    .with_detail("method", method.as_str())
    .with_detail("timeout_ms", timeout.as_millis().to_string())
}

/// First few hundred characters of an error body, control characters removed.
fn body_excerpt(body: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let mut excerpt: String = text
        .chars()
        .take(MAX_ERROR_BODY_CHARS)
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    if text.chars().count() > MAX_ERROR_BODY_CHARS {
        excerpt.push_str("...");
    }
    Some(excerpt)
}
