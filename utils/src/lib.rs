//! Shared infrastructure utilities for Keystone.
//!
//! This crate provides cross-cutting utilities that multiple Keystone crates need
//! but that don't belong in the IO-free `keystone-types` crate:
//!
//! - **`security`**: URL sanitization before URLs reach logs or failure details

pub mod security;

pub use security::{REDACTED_URL, is_sensitive_param, sanitize_url};
