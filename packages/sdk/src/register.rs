//! Registration payloads pushed to the orchestrator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::function::{
	Cancel, Concurrency, Debounce, EventBatchConfig, Priority, RateLimit, Throttle, Timeouts,
	Trigger,
};
use crate::registry::FunctionRegistry;

pub const SDK_LANGUAGE: &str = "rust";
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
	/// Externally reachable serve URL of this app.
	pub url: String,
	pub v: String,
	pub sdk: String,
	#[serde(rename = "appname")]
	pub app_name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub headers: Option<RegisterHeaders>,
	pub capabilities: Capabilities,
	pub functions: Vec<FunctionConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterHeaders {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub env: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub platform: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
	pub trust_probe: String,
	pub connect: String,
}

impl Default for Capabilities {
	fn default() -> Self {
		Capabilities {
			trust_probe: "v1".to_string(),
			connect: "v1".to_string(),
		}
	}
}

/// Wire shape of one registered function.
#[derive(Debug, Serialize, Deserialize)]
pub struct FunctionConfig {
	pub id: String,
	pub name: String,
	pub triggers: Vec<Trigger>,
	pub steps: BTreeMap<String, StepConfig>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub concurrency: Option<Vec<Concurrency>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub batch_events: Option<EventBatchConfig>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub debounce: Option<Debounce>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub throttle: Option<Throttle>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rate_limit: Option<RateLimit>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub idempotency: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub priority: Option<Priority>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub timeouts: Option<Timeouts>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub cancel: Vec<Cancel>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StepConfig {
	pub id: String,
	pub name: String,
	pub runtime: StepRuntime,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub retries: Option<StepRetries>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StepRuntime {
	#[serde(rename = "type")]
	pub kind: String,
	pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StepRetries {
	pub attempts: u32,
}

/// Builds the per-function configs. Each function carries a single step
/// whose URL points back at the serve endpoint with `fnId` and `step=step`
/// query parameters.
pub fn function_configs(registry: &FunctionRegistry, config: &Config) -> Vec<FunctionConfig> {
	let app_url = config.app_url();

	registry
		.all()
		.iter()
		.map(|function| {
			let step_url = format!("{}?fnId={}&step=step", app_url, function.slug());

			let mut steps = BTreeMap::new();
			steps.insert(
				"step".to_string(),
				StepConfig {
					id: "step".to_string(),
					name: function.name().to_string(),
					runtime: StepRuntime {
						kind: "http".to_string(),
						url: step_url,
					},
					retries: function.retries().map(|attempts| StepRetries { attempts }),
				},
			);

			FunctionConfig {
				id: function.slug().to_string(),
				name: function.name().to_string(),
				triggers: function.triggers().to_vec(),
				steps,
				concurrency: if function.concurrency().is_empty() {
					None
				} else {
					Some(function.concurrency().to_vec())
				},
				batch_events: function.batch().cloned(),
				debounce: function.debounce().cloned(),
				throttle: function.throttle().cloned(),
				rate_limit: function.rate_limit().cloned(),
				idempotency: function.idempotency().map(str::to_string),
				priority: function.priority().cloned(),
				timeouts: function.timeouts().cloned(),
				cancel: function.cancel().to_vec(),
			}
		})
		.collect()
}

pub fn register_request(registry: &FunctionRegistry, config: &Config) -> RegisterRequest {
	RegisterRequest {
		url: config.app_url(),
		v: "1".to_string(),
		sdk: format!("{}:v{}", SDK_LANGUAGE, SDK_VERSION),
		app_name: config.app_id.clone(),
		headers: config.env_name().map(|env| RegisterHeaders {
			env: Some(env),
			platform: None,
		}),
		capabilities: Capabilities::default(),
		functions: function_configs(registry, config),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::event::Event;
	use crate::function::FunctionBuilder;

	#[test]
	fn step_url_carries_fn_id() {
		let registry = FunctionRegistry::new();
		registry
			.add(
				FunctionBuilder::new("send-welcome")
					.trigger(Trigger::event("user/created"))
					.retries(3)
					.build::<Event, _, _, _>(|_ctx, _input| async { Ok(serde_json::json!(null)) })
					.unwrap(),
			)
			.unwrap();

		let mut config = Config::new("my-app");
		config.serve_origin = Some("https://example.com".to_string());

		let configs = function_configs(&registry, &config);
		assert_eq!(configs.len(), 1);

		let step = configs[0].steps.get("step").unwrap();
		assert_eq!(
			step.runtime.url,
			"https://example.com/api/inngest?fnId=send-welcome&step=step"
		);
		assert_eq!(step.retries.as_ref().unwrap().attempts, 3);
	}
}
