use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::env;

/// Default orchestrator API origin in cloud mode.
const DEFAULT_API_ORIGIN: &str = "https://api.inngest.com";
/// Default event API origin in cloud mode.
const DEFAULT_EVENT_API_ORIGIN: &str = "https://inn.gs";
/// Default dev server origin when `INNGEST_DEV` is truthy but not a URL.
const DEFAULT_DEV_ORIGIN: &str = "http://127.0.0.1:8288";

const DEFAULT_SERVE_PATH: &str = "/api/inngest";
/// Largest accepted orchestrator request body.
const DEFAULT_MAX_BODY_SIZE: usize = 100 * 1024 * 1024;
const DEFAULT_MAX_WORKER_CONCURRENCY: usize = 1_000;
const DEFAULT_WORKER_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// Default per-frame read limit on the gateway socket.
const DEFAULT_MESSAGE_READ_LIMIT: usize = 32 * 1024;

/// SDK configuration. Every field is optional; accessors apply the
/// user-value > environment > default resolution order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
	/// Application identifier, unique per orchestrator environment.
	pub app_id: String,
	/// Force dev mode. `INNGEST_DEV` is consulted when unset.
	pub dev: Option<bool>,
	pub signing_key: Option<String>,
	pub signing_key_fallback: Option<String>,
	pub event_key: Option<String>,
	/// Branch environment name.
	pub env: Option<String>,
	/// Overrides the orchestrator API origin.
	pub api_base_url: Option<String>,
	/// Overrides the event API origin.
	pub event_api_base_url: Option<String>,
	/// Externally reachable origin of this app's serve endpoint.
	pub serve_origin: Option<String>,
	pub serve_path: Option<String>,
	/// Largest accepted orchestrator request body, in bytes.
	pub max_body_size: Option<usize>,
	pub max_worker_concurrency: Option<usize>,
	/// Gateway heartbeat interval, in milliseconds.
	pub worker_heartbeat_interval: Option<u64>,
	/// Gateway frame read limit in bytes. `0` means the library default,
	/// `-1` means unlimited.
	pub message_read_limit: Option<i64>,
	/// Stable identifier for this process across gateway reconnects.
	pub instance_id: Option<String>,
	/// Respond to invocations as a single framed envelope behind
	/// whitespace keepalives.
	pub streaming: Option<bool>,
}

impl Config {
	pub fn new(app_id: impl Into<String>) -> Self {
		Config {
			app_id: app_id.into(),
			..Default::default()
		}
	}

	pub fn is_dev(&self) -> bool {
		if let Some(dev) = self.dev {
			return dev;
		}

		env::var(env::DEV).map(|v| env::is_truthy(&v)).unwrap_or(false)
	}

	/// Dev server origin, either from a URL-valued `INNGEST_DEV` or the
	/// default local address.
	fn dev_origin(&self) -> String {
		if let Some(value) = env::var(env::DEV) {
			if value.starts_with("http://") || value.starts_with("https://") {
				return value.trim_end_matches('/').to_string();
			}
		}

		DEFAULT_DEV_ORIGIN.to_string()
	}

	pub fn signing_key(&self) -> Option<String> {
		self.signing_key.clone().or_else(|| env::var(env::SIGNING_KEY))
	}

	pub fn signing_key_fallback(&self) -> Option<String> {
		self.signing_key_fallback
			.clone()
			.or_else(|| env::var(env::SIGNING_KEY_FALLBACK))
	}

	pub fn event_key(&self) -> Option<String> {
		self.event_key.clone().or_else(|| env::var(env::EVENT_KEY))
	}

	pub fn env_name(&self) -> Option<String> {
		self.env.clone().or_else(|| env::var(env::ENV))
	}

	pub fn api_origin(&self) -> String {
		if let Some(url) = &self.api_base_url {
			return url.trim_end_matches('/').to_string();
		}
		if let Some(url) = env::var(env::BASE_URL) {
			return url.trim_end_matches('/').to_string();
		}
		if self.is_dev() {
			return self.dev_origin();
		}

		DEFAULT_API_ORIGIN.to_string()
	}

	pub fn event_api_origin(&self) -> String {
		if let Some(url) = &self.event_api_base_url {
			return url.trim_end_matches('/').to_string();
		}
		if let Some(url) = env::var(env::BASE_URL) {
			return url.trim_end_matches('/').to_string();
		}
		if self.is_dev() {
			return self.dev_origin();
		}

		DEFAULT_EVENT_API_ORIGIN.to_string()
	}

	pub fn serve_origin(&self) -> Option<String> {
		self.serve_origin.clone().or_else(|| env::var(env::SERVE_HOST))
	}

	pub fn serve_path(&self) -> String {
		self.serve_path
			.clone()
			.or_else(|| env::var(env::SERVE_PATH))
			.unwrap_or_else(|| DEFAULT_SERVE_PATH.to_string())
	}

	/// Externally reachable URL of the serve endpoint.
	pub fn app_url(&self) -> String {
		let origin = self
			.serve_origin()
			.unwrap_or_else(|| "http://localhost:8080".to_string());

		format!("{}{}", origin.trim_end_matches('/'), self.serve_path())
	}

	pub fn max_body_size(&self) -> usize {
		self.max_body_size.unwrap_or(DEFAULT_MAX_BODY_SIZE)
	}

	/// User value > `INNGEST_MAX_WORKER_CONCURRENCY` > default. Values that
	/// fail to parse (or are zero) fall back to the default.
	pub fn max_worker_concurrency(&self) -> usize {
		if let Some(value) = self.max_worker_concurrency {
			if value > 0 {
				return value;
			}
		}

		env::var(env::MAX_WORKER_CONCURRENCY)
			.and_then(|v| v.parse::<usize>().ok())
			.filter(|v| *v > 0)
			.unwrap_or(DEFAULT_MAX_WORKER_CONCURRENCY)
	}

	pub fn worker_heartbeat_interval(&self) -> Duration {
		self.worker_heartbeat_interval
			.map(Duration::from_millis)
			.unwrap_or(DEFAULT_WORKER_HEARTBEAT_INTERVAL)
	}

	/// `None` means unlimited.
	pub fn message_read_limit(&self) -> Option<usize> {
		match self.message_read_limit {
			None | Some(0) => Some(DEFAULT_MESSAGE_READ_LIMIT),
			Some(v) if v < 0 => None,
			Some(v) => Some(v as usize),
		}
	}

	pub fn streaming(&self) -> bool {
		self.streaming.unwrap_or(false)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn read_limit_resolution() {
		let mut config = Config::new("app");
		assert_eq!(config.message_read_limit(), Some(DEFAULT_MESSAGE_READ_LIMIT));

		config.message_read_limit = Some(0);
		assert_eq!(config.message_read_limit(), Some(DEFAULT_MESSAGE_READ_LIMIT));

		config.message_read_limit = Some(-1);
		assert_eq!(config.message_read_limit(), None);

		config.message_read_limit = Some(1024);
		assert_eq!(config.message_read_limit(), Some(1024));
	}

	#[test]
	fn explicit_concurrency_wins() {
		let mut config = Config::new("app");
		config.max_worker_concurrency = Some(4);
		assert_eq!(config.max_worker_concurrency(), 4);

		config.max_worker_concurrency = Some(0);
		assert_eq!(config.max_worker_concurrency(), DEFAULT_MAX_WORKER_CONCURRENCY);
	}
}
