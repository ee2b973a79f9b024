//! The network seam.
//!
//! [`Fetcher`](crate::Fetcher) never talks to reqwest directly; it drives a
//! [`Transport`], which performs exactly one request and returns the full
//! response. Timeouts, retries and body interpretation stay in the fetcher.

use std::future::Future;
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use thiserror::Error;
use url::Url;

use crate::FetchSetupError;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const POOL_MAX_IDLE_PER_HOST: usize = 32;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

/// One fully-resolved outgoing request.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

/// Status, headers and the complete body of a response.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RawResponse {
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }
}

/// Transport-level failure. Never carries the request URL.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request aborted")]
    Aborted,
    #[error("transport error: {0}")]
    Other(String),
}

pub trait Transport: Send + Sync {
    fn call(
        &self,
        request: TransportRequest,
    ) -> impl Future<Output = Result<RawResponse, TransportError>> + Send;
}

/// Production transport over a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, FetchSetupError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
            .user_agent(concat!("keystone/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchSetupError::Client(e.without_url().to_string()))?;
        Ok(Self { client })
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for ReqwestTransport {
    fn call(
        &self,
        request: TransportRequest,
    ) -> impl Future<Output = Result<RawResponse, TransportError>> + Send {
        let client = self.client.clone();
        async move {
            let mut builder = client
                .request(request.method, request.url)
                .headers(request.headers);
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await.map_err(classify)?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(classify)?;

            Ok(RawResponse {
                status,
                headers,
                body: body.to_vec(),
            })
        }
    }
}

fn classify(error: reqwest::Error) -> TransportError {
    // reqwest embeds the full URL (query string included) in its Display.
    let error = error.without_url();
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else {
        TransportError::Other(error.to_string())
    }
}

/// Deterministic in-process transport for tests.
#[cfg(any(test, feature = "test-support"))]
pub mod mock {
    use std::collections::VecDeque;
    use std::future::Future;
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
    use reqwest::{Method, StatusCode};
    use tokio::time::Instant;

    use super::{RawResponse, Transport, TransportError, TransportRequest};

    type Scripted = Result<RawResponse, TransportError>;

    /// A request as the transport saw it.
    #[derive(Debug, Clone)]
    pub struct RecordedCall {
        pub at: Instant,
        pub method: Method,
        pub url: String,
        pub headers: HeaderMap,
        pub body: Option<Vec<u8>>,
    }

    /// Replays a fixed script of responses; the last entry repeats once the
    /// script runs out.
    #[derive(Debug, Default)]
    pub struct ScriptedTransport {
        script: Mutex<VecDeque<Scripted>>,
        last: Mutex<Option<Scripted>>,
        calls: Mutex<Vec<RecordedCall>>,
        latency: Option<Duration>,
    }

    impl ScriptedTransport {
        pub fn new(script: impl IntoIterator<Item = Scripted>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                ..Self::default()
            }
        }

        /// Every call resolves only after `latency` of (tokio) time.
        #[must_use]
        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = Some(latency);
            self
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().map(|calls| calls.len()).unwrap_or_default()
        }

        fn next(&self) -> Scripted {
            let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            match script.pop_front() {
                Some(entry) => {
                    *last = Some(entry.clone());
                    entry
                }
                None => last
                    .clone()
                    .unwrap_or_else(|| Err(TransportError::Other("script exhausted".into()))),
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn call(
            &self,
            request: TransportRequest,
        ) -> impl Future<Output = Result<RawResponse, TransportError>> + Send {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(RecordedCall {
                    at: Instant::now(),
                    method: request.method,
                    url: request.url.to_string(),
                    headers: request.headers,
                    body: request.body,
                });
            }
            let outcome = self.next();
            let latency = self.latency;
            async move {
                if let Some(latency) = latency {
                    tokio::time::sleep(latency).await;
                }
                outcome
            }
        }
    }

    /// Response with `body` and no headers.
    pub fn respond(status: u16, body: &str) -> Scripted {
        Ok(RawResponse {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            headers: HeaderMap::new(),
            body: body.as_bytes().to_vec(),
        })
    }

    /// JSON response with a matching content type.
    pub fn respond_json(status: u16, body: &serde_json::Value) -> Scripted {
        respond(status, &body.to_string())
            .map(|response| with_header(response, "content-type", "application/json"))
    }

    pub fn with_header(mut response: RawResponse, name: &'static str, value: &str) -> RawResponse {
        if let Ok(value) = HeaderValue::from_str(value) {
            response.headers.insert(HeaderName::from_static(name), value);
        }
        response
    }

    pub fn fail(error: TransportError) -> Scripted {
        Err(error)
    }
}
