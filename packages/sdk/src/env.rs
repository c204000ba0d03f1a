//! Environment variables recognized by the SDK.

use std::env;

pub const DEV: &str = "INNGEST_DEV";
pub const SIGNING_KEY: &str = "INNGEST_SIGNING_KEY";
pub const SIGNING_KEY_FALLBACK: &str = "INNGEST_SIGNING_KEY_FALLBACK";
pub const EVENT_KEY: &str = "INNGEST_EVENT_KEY";
pub const ENV: &str = "INNGEST_ENV";
pub const BASE_URL: &str = "INNGEST_BASE_URL";
pub const SERVE_HOST: &str = "INNGEST_SERVE_HOST";
pub const SERVE_PATH: &str = "INNGEST_SERVE_PATH";
pub const MAX_WORKER_CONCURRENCY: &str = "INNGEST_MAX_WORKER_CONCURRENCY";

/// Reads a variable, treating unset and empty as absent.
pub fn var(name: &str) -> Option<String> {
	env::var(name).ok().filter(|v| !v.is_empty())
}

/// True for any value other than the usual falsy spellings.
pub fn is_truthy(value: &str) -> bool {
	!matches!(value.to_ascii_lowercase().as_str(), "" | "0" | "false" | "no")
}
