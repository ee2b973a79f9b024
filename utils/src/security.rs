//! URL sanitization for logs and failure details.
//!
//! Request URLs routinely carry credentials in their query string (session
//! ids, signed tokens, API keys). Every URL that ends up in a log line or in
//! `Failure::details` goes through [`sanitize_url`] first.
//!
//! The sanitizer keeps only the path, the query parameters whose names do not
//! look sensitive, and the fragment. Scheme, host, port and userinfo are
//! dropped entirely. Parameter names are matched case-insensitively against
//! glob patterns (`*token*`, `*session*`, `*key*`, ...). If the matcher cannot
//! be built, every parameter is treated as sensitive.

use std::borrow::Cow;
use std::sync::OnceLock;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use url::{Url, form_urlencoded};

/// Returned in place of a URL that cannot be parsed.
pub const REDACTED_URL: &str = "[redacted-url]";

/// Base used to resolve relative request paths (`/contacts?page=2`).
const RELATIVE_BASE: &str = "http://keystone.invalid/";

const SENSITIVE_PARAM_PATTERNS: &[&str] = &[
    "*token*",
    "*session*",
    "*key*",
    "*secret*",
    "*password*",
    "*passwd*",
    "*auth*",
    "*credential*",
    "*signature*",
    "sig",
    "sid",
    "jwt",
];

static PARAM_MATCHER: OnceLock<Option<GlobSet>> = OnceLock::new();

fn param_matcher() -> Option<&'static GlobSet> {
    PARAM_MATCHER.get_or_init(build_param_matcher).as_ref()
}

fn build_param_matcher() -> Option<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in SENSITIVE_PARAM_PATTERNS {
        match GlobBuilder::new(pattern).case_insensitive(true).build() {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => {
                tracing::warn!(pattern, "Skipping invalid sensitive-parameter pattern ({e})");
            }
        }
    }

    match builder.build() {
        Ok(set) => Some(set),
        Err(e) => {
            tracing::warn!("Sensitive-parameter matcher build failed; stripping all query parameters ({e})");
            None
        }
    }
}

/// Whether a query parameter name looks like it carries a credential.
#[must_use]
pub fn is_sensitive_param(name: &str) -> bool {
    param_matcher().is_none_or(|matcher| matcher.is_match(name))
}

/// Reduce a URL to path + non-sensitive query + fragment.
///
/// Accepts absolute URLs and request paths. Returns [`REDACTED_URL`] when the
/// input cannot be parsed. A URL with no remaining query parameters yields
/// the bare path.
#[must_use]
pub fn sanitize_url(raw: &str) -> String {
    let Ok(base) = Url::parse(RELATIVE_BASE) else {
        return REDACTED_URL.to_string();
    };
    let Ok(url) = base.join(raw.trim()) else {
        return REDACTED_URL.to_string();
    };

    let mut out = String::from(url.path());

    if let Some(query) = url.query()
        && let Some(filtered) = filter_pairs(query)
    {
        out.push('?');
        out.push_str(&filtered);
    }

    if let Some(fragment) = url.fragment() {
        // `#access_token=...` style fragments get the same treatment as queries.
        if fragment.contains('=') {
            if let Some(filtered) = filter_pairs(fragment) {
                out.push('#');
                out.push_str(&filtered);
            }
        } else if !fragment.is_empty() {
            out.push('#');
            out.push_str(fragment);
        }
    }

    out
}

fn filter_pairs(encoded: &str) -> Option<String> {
    let kept: Vec<(Cow<'_, str>, Cow<'_, str>)> = form_urlencoded::parse(encoded.as_bytes())
        .filter(|(name, _)| !is_sensitive_param(name))
        .collect();

    if kept.is_empty() {
        return None;
    }

    Some(
        form_urlencoded::Serializer::new(String::new())
            .extend_pairs(kept)
            .finish(),
    )
}
