use std::fmt::Write as _;

use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use sha2::{Digest, Sha256};
use url::Url;

use keystone_types::{Failure, codes};
use keystone_utils::sanitize_url;

/// How a successful response body is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyKind {
    /// JSON when the response declares a JSON content type, text otherwise.
    #[default]
    Auto,
    Json,
    /// The body is exposed as a JSON string value.
    Text,
}

/// A request to fetch, relative to the configured base URL or absolute.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    method: Method,
    path: String,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    content_type: Option<&'static str>,
    expect: BodyKind,
}

impl FetchRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: None,
            content_type: None,
            expect: BodyKind::Auto,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Serialize `body` as the JSON request body.
    pub fn with_json(mut self, body: &impl Serialize) -> Result<Self, Failure> {
        let bytes = serde_json::to_vec(body).map_err(|e| {
            Failure::validation(format!("request body is not serializable: {e}"))
                .with_code(codes::INVALID_REQUEST)
        })?;
        self.body = Some(bytes);
        self.content_type = Some("application/json");
        Ok(self)
    }

    pub fn with_text(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into().into_bytes());
        self.content_type = Some("text/plain; charset=utf-8");
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn expect(mut self, kind: BodyKind) -> Self {
        self.expect = kind;
        self
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    #[must_use]
    pub fn body_kind(&self) -> BodyKind {
        self.expect
    }

    /// Resolve the request path against `base_url`.
    ///
    /// Absolute paths ignore the base. Relative paths are appended to the
    /// base's path, so `https://host/api` + `/contacts` is
    /// `https://host/api/contacts`.
    pub fn resolve_url(&self, base_url: Option<&str>) -> Result<Url, Failure> {
        if let Ok(url) = Url::parse(&self.path) {
            return Ok(url);
        }

        let Some(base) = base_url else {
            return Err(self.invalid("request path is relative and no base URL is configured"));
        };

        let mut base = Url::parse(base).map_err(|_| {
            Failure::validation("base URL is not a valid absolute URL")
                .with_code(codes::INVALID_REQUEST)
                .with_detail("base_url", sanitize_url(base))
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        base.join(self.path.trim_start_matches('/'))
            .map_err(|_| self.invalid("request path cannot be joined to the base URL"))
    }

    /// Headers for every attempt: caller headers plus the body content type.
    pub fn header_map(&self) -> Result<HeaderMap, Failure> {
        let mut headers = HeaderMap::with_capacity(self.headers.len() + 1);
        if let Some(content_type) = self.content_type {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                self.invalid("invalid header name").with_detail("header", name.clone())
            })?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                self.invalid("invalid header value")
                    .with_detail("header", name.as_str().to_string())
            })?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    /// Default cache identity: method, origin, sanitized path and query, and a
    /// digest of the full URL and body.
    ///
    /// Keys show up in logs, so credentials in the query string only ever
    /// enter the digest.
    #[must_use]
    pub fn cache_key(&self, base_url: Option<&str>) -> String {
        let (shown, full) = match self.resolve_url(base_url) {
            Ok(url) => {
                let origin = url.origin().ascii_serialization();
                let shown = format!("{origin}{}", sanitize_url(url.as_str()));
                (shown, String::from(url))
            }
            Err(_) => (sanitize_url(&self.path), self.path.clone()),
        };

        let mut hasher = Sha256::new();
        hasher.update(self.method.as_str());
        hasher.update(b" ");
        hasher.update(full.as_bytes());
        if let Some(body) = &self.body {
            hasher.update(b"\n");
            hasher.update(body);
        }
        let digest = hasher.finalize();

        format!("{} {shown} #{}", self.method, hex_encode(&digest[..8]))
    }

    fn invalid(&self, message: &str) -> Failure {
        Failure::validation(message)
            .with_code(codes::INVALID_REQUEST)
            .with_detail("url", sanitize_url(&self.path))
            .with_detail("method", self.method.as_str())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
