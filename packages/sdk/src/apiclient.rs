use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Deserialize;

use crate::config::Config;
use crate::event::Event;
use crate::register::RegisterRequest;
use crate::signing::{self, KeyRotation, SIGNATURE_HEADER};

/// Outbound client for the orchestrator API. Carries the shared key
/// rotation state so a fallback success sticks for subsequent calls.
pub struct ApiClient {
	http: reqwest::Client,
	config: Config,
	rotation: Arc<KeyRotation>,
}

impl ApiClient {
	pub fn new(config: Config, rotation: Arc<KeyRotation>) -> Self {
		ApiClient {
			http: reqwest::Client::new(),
			config,
			rotation,
		}
	}

	pub fn rotation(&self) -> &Arc<KeyRotation> {
		&self.rotation
	}

	/// Pushes the app's function configuration to the orchestrator.
	///
	/// In cloud mode the call must succeed under the primary or the
	/// fallback signing key; once the fallback worked, it is tried first on
	/// later calls.
	#[tracing::instrument(skip_all, fields(app_id = %self.config.app_id))]
	pub async fn register(&self, request: &RegisterRequest) -> Result<()> {
		let body = serde_json::to_vec(request).context("failed to encode register request")?;
		let url = format!("{}/fn/register", self.config.api_origin());

		if self.config.is_dev() {
			let res = self
				.http
				.post(&url)
				.header("Content-Type", "application/json")
				.body(body)
				.send()
				.await
				.context("failed to send register request")?;

			return check_register_response(res).await;
		}

		let primary = self
			.config
			.signing_key()
			.context("a signing key is required to register in cloud mode")?;
		let fallback = self.config.signing_key_fallback();

		let mut last_unauthorized = None;
		for key in self.rotation.order(&primary, fallback.as_deref()) {
			let signature = signing::sign(&body, key, Utc::now().timestamp())?;

			let res = self
				.http
				.post(&url)
				.header("Content-Type", "application/json")
				.header(SIGNATURE_HEADER, signature)
				.header("Authorization", format!("Bearer {}", signing::hashed_key(key)?))
				.body(body.clone())
				.send()
				.await
				.context("failed to send register request")?;

			if res.status() == reqwest::StatusCode::UNAUTHORIZED
				|| res.status() == reqwest::StatusCode::FORBIDDEN
			{
				tracing::debug!(status = %res.status(), "register rejected, trying next key");
				last_unauthorized = Some(res.status());
				continue;
			}

			check_register_response(res).await?;
			self.rotation.mark_success(key, &primary);
			return Ok(());
		}

		bail!(
			"registration unauthorized under every configured signing key (last status: {:?})",
			last_unauthorized
		)
	}
}

#[derive(Deserialize)]
struct RegisterError {
	#[serde(default)]
	error: String,
}

async fn check_register_response(res: reqwest::Response) -> Result<()> {
	let status = res.status();
	if status.is_success() {
		return Ok(());
	}

	let message = res
		.json::<RegisterError>()
		.await
		.map(|e| e.error)
		.unwrap_or_default();

	bail!("registration failed with status {status}: {message}")
}

/// Minimal event API client backing `send_event` steps.
pub struct EventClient {
	http: reqwest::Client,
	origin: String,
	event_key: String,
}

#[derive(Deserialize)]
struct SendResponse {
	#[serde(default)]
	ids: Vec<String>,
}

impl EventClient {
	pub fn from_config(config: &Config) -> Option<Self> {
		let event_key = config.event_key()?;

		Some(EventClient {
			http: reqwest::Client::new(),
			origin: config.event_api_origin(),
			event_key,
		})
	}

	/// Sends one event, returning its assigned id.
	pub async fn send(&self, event: &Event) -> Result<String> {
		let ids = self.send_many(std::slice::from_ref(event)).await?;

		ids.into_iter()
			.next()
			.context("event API returned no event ids")
	}

	/// Sends a batch of events, returning their assigned ids.
	#[tracing::instrument(skip_all, fields(count = events.len()))]
	pub async fn send_many(&self, events: &[Event]) -> Result<Vec<String>> {
		let url = format!("{}/e/{}", self.origin, self.event_key);

		let res = self
			.http
			.post(&url)
			.json(events)
			.send()
			.await
			.context("failed to send events")?;

		let status = res.status();
		if !status.is_success() {
			bail!("event API rejected send with status {status}");
		}

		let body: SendResponse = res
			.json()
			.await
			.context("failed to decode event API response")?;

		Ok(body.ids)
	}
}
