//! Core result and failure types for Keystone.
//!
//! This crate contains pure types with no IO, no async, and minimal dependencies.
//! Every other Keystone crate speaks `Result<T, Failure>`.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod failure;

pub use failure::{Failure, FailureKind, RetryContext, ValidationIssue, codes};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// Result eliminator
// ============================================================================

/// Eliminator for `Result`.
///
/// `std::result::Result` already provides `map`, `map_err` and `and_then`;
/// `fold` collapses both arms into one value without an explicit `match`.
pub trait ResultExt<T, E> {
    fn fold<R>(self, on_success: impl FnOnce(T) -> R, on_failure: impl FnOnce(E) -> R) -> R;
}

impl<T, E> ResultExt<T, E> for Result<T, E> {
    fn fold<R>(self, on_success: impl FnOnce(T) -> R, on_failure: impl FnOnce(E) -> R) -> R {
        match self {
            Ok(value) => on_success(value),
            Err(error) => on_failure(error),
        }
    }
}

// ============================================================================
// Cache Keys
// ============================================================================

/// Logical resource identity used by the shared result cache.
///
/// Guaranteed non-empty after trimming.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey(String);

#[derive(Debug, Error)]
#[error("cache key must not be empty")]
pub struct EmptyCacheKeyError;

impl CacheKey {
    pub fn new(value: impl Into<String>) -> Result<Self, EmptyCacheKeyError> {
        let value = value.into();
        if value.trim().is_empty() {
            Err(EmptyCacheKeyError)
        } else {
            Ok(Self(value))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CacheKey {
    type Error = EmptyCacheKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for CacheKey {
    type Error = EmptyCacheKeyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CacheKey> for String {
    fn from(value: CacheKey) -> Self {
        value.0
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
