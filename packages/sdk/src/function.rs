use std::future::Future;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::event::Event;
use crate::request::CallContext;
use crate::step::StepCtx;

/// What causes a function to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Trigger {
	Event {
		event: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		expression: Option<String>,
	},
	Cron { cron: String },
}

impl Trigger {
	pub fn event(name: impl Into<String>) -> Self {
		Trigger::Event {
			event: name.into(),
			expression: None,
		}
	}

	/// Event trigger gated by a match expression.
	pub fn event_if(name: impl Into<String>, expression: impl Into<String>) -> Self {
		Trigger::Event {
			event: name.into(),
			expression: Some(expression.into()),
		}
	}

	pub fn cron(expression: impl Into<String>) -> Self {
		Trigger::Cron {
			cron: expression.into(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concurrency {
	pub limit: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub key: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub scope: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatchConfig {
	#[serde(rename = "maxSize")]
	pub max_size: u32,
	/// Duration string, e.g. `"5s"`.
	pub timeout: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Debounce {
	pub period: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Throttle {
	pub limit: u32,
	pub period: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub key: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub burst: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
	pub limit: u32,
	pub period: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Priority {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub run: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
	/// Maximum queue time before the run starts.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub start: Option<String>,
	/// Maximum run time after the first attempt starts.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub finish: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cancel {
	pub event: String,
	#[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
	pub if_expression: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub timeout: Option<String>,
}

/// Typed input handed to a function handler.
#[derive(Debug)]
pub struct Input<T> {
	/// Primary triggering event.
	pub event: T,
	/// Triggering batch; contains only the primary event when batching is
	/// off.
	pub events: Vec<T>,
	pub ctx: CallContext,
}

/// Untyped input, post middleware, pre decode.
#[derive(Debug)]
pub struct RawInput {
	pub event: Event,
	pub events: Vec<Event>,
	pub ctx: CallContext,
}

type ErasedHandler =
	Arc<dyn Fn(StepCtx, RawInput) -> BoxFuture<'static, Result<Box<RawValue>>> + Send + Sync>;

/// Immutable function registration record. Created once per process and
/// referenced by slug.
#[derive(Clone)]
pub struct Function {
	slug: String,
	name: String,
	triggers: Vec<Trigger>,
	retries: Option<u32>,
	concurrency: Vec<Concurrency>,
	batch: Option<EventBatchConfig>,
	debounce: Option<Debounce>,
	throttle: Option<Throttle>,
	rate_limit: Option<RateLimit>,
	idempotency: Option<String>,
	priority: Option<Priority>,
	timeouts: Option<Timeouts>,
	cancel: Vec<Cancel>,
	handler: ErasedHandler,
}

impl Function {
	pub fn slug(&self) -> &str {
		&self.slug
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn triggers(&self) -> &[Trigger] {
		&self.triggers
	}

	pub fn retries(&self) -> Option<u32> {
		self.retries
	}

	pub fn concurrency(&self) -> &[Concurrency] {
		&self.concurrency
	}

	pub fn batch(&self) -> Option<&EventBatchConfig> {
		self.batch.as_ref()
	}

	pub fn debounce(&self) -> Option<&Debounce> {
		self.debounce.as_ref()
	}

	pub fn throttle(&self) -> Option<&Throttle> {
		self.throttle.as_ref()
	}

	pub fn rate_limit(&self) -> Option<&RateLimit> {
		self.rate_limit.as_ref()
	}

	pub fn idempotency(&self) -> Option<&str> {
		self.idempotency.as_deref()
	}

	pub fn priority(&self) -> Option<&Priority> {
		self.priority.as_ref()
	}

	pub fn timeouts(&self) -> Option<&Timeouts> {
		self.timeouts.as_ref()
	}

	pub fn cancel(&self) -> &[Cancel] {
		&self.cancel
	}

	pub(crate) fn call(
		&self,
		ctx: StepCtx,
		input: RawInput,
	) -> BoxFuture<'static, Result<Box<RawValue>>> {
		(self.handler.as_ref())(ctx, input)
	}
}

impl std::fmt::Debug for Function {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Function")
			.field("slug", &self.slug)
			.field("triggers", &self.triggers.len())
			.finish_non_exhaustive()
	}
}

/// Builder for [`Function`]. The handler's event type is fixed by the
/// generic parameter at `build` time; the record stores the resulting
/// decoder rather than inspecting anything at runtime.
#[derive(Default)]
pub struct FunctionBuilder {
	slug: String,
	name: Option<String>,
	triggers: Vec<Trigger>,
	retries: Option<u32>,
	concurrency: Vec<Concurrency>,
	batch: Option<EventBatchConfig>,
	debounce: Option<Debounce>,
	throttle: Option<Throttle>,
	rate_limit: Option<RateLimit>,
	idempotency: Option<String>,
	priority: Option<Priority>,
	timeouts: Option<Timeouts>,
	cancel: Vec<Cancel>,
}

impl FunctionBuilder {
	pub fn new(slug: impl Into<String>) -> Self {
		FunctionBuilder {
			slug: slug.into(),
			..Default::default()
		}
	}

	pub fn name(mut self, name: impl Into<String>) -> Self {
		self.name = Some(name.into());
		self
	}

	pub fn trigger(mut self, trigger: Trigger) -> Self {
		self.triggers.push(trigger);
		self
	}

	pub fn retries(mut self, retries: u32) -> Self {
		self.retries = Some(retries);
		self
	}

	pub fn concurrency(mut self, concurrency: Concurrency) -> Self {
		self.concurrency.push(concurrency);
		self
	}

	pub fn batch_events(mut self, batch: EventBatchConfig) -> Self {
		self.batch = Some(batch);
		self
	}

	pub fn debounce(mut self, debounce: Debounce) -> Self {
		self.debounce = Some(debounce);
		self
	}

	pub fn throttle(mut self, throttle: Throttle) -> Self {
		self.throttle = Some(throttle);
		self
	}

	pub fn rate_limit(mut self, rate_limit: RateLimit) -> Self {
		self.rate_limit = Some(rate_limit);
		self
	}

	/// Idempotency key expression.
	pub fn idempotency(mut self, expression: impl Into<String>) -> Self {
		self.idempotency = Some(expression.into());
		self
	}

	pub fn priority(mut self, priority: Priority) -> Self {
		self.priority = Some(priority);
		self
	}

	pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
		self.timeouts = Some(timeouts);
		self
	}

	pub fn cancel_on(mut self, cancel: Cancel) -> Self {
		self.cancel.push(cancel);
		self
	}

	pub fn build<T, O, F, Fut>(self, handler: F) -> Result<Function>
	where
		T: DeserializeOwned + Send + 'static,
		O: Serialize + Send + 'static,
		F: Fn(StepCtx, Input<T>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<O>> + Send + 'static,
	{
		ensure!(!self.slug.is_empty(), "function slug must not be empty");
		ensure!(
			!self.triggers.is_empty(),
			"function {} needs at least one trigger",
			self.slug
		);

		let handler = Arc::new(handler);
		let erased: ErasedHandler = Arc::new(move |ctx, raw: RawInput| {
			let handler = handler.clone();

			Box::pin(async move {
				let event = decode_event::<T>(&raw.event)?;
				let events = raw
					.events
					.iter()
					.map(decode_event::<T>)
					.collect::<Result<Vec<_>>>()?;

				let output = (handler.as_ref())(
					ctx,
					Input {
						event,
						events,
						ctx: raw.ctx,
					},
				)
				.await?;

				serde_json::value::to_raw_value(&output)
					.context("failed to encode function return value")
			})
		});

		let name = self.name.unwrap_or_else(|| self.slug.clone());

		Ok(Function {
			slug: self.slug,
			name,
			triggers: self.triggers,
			retries: self.retries,
			concurrency: self.concurrency,
			batch: self.batch,
			debounce: self.debounce,
			throttle: self.throttle,
			rate_limit: self.rate_limit,
			idempotency: self.idempotency,
			priority: self.priority,
			timeouts: self.timeouts,
			cancel: self.cancel,
			handler: erased,
		})
	}
}

fn decode_event<T: DeserializeOwned>(event: &Event) -> Result<T> {
	let value = serde_json::to_value(event).context("failed to re-encode event")?;
	serde_json::from_value(value).context("failed to decode event into the declared event type")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn build_requires_trigger() {
		let res = FunctionBuilder::new("no-triggers")
			.build::<Event, _, _, _>(|_ctx, _input| async { Ok(serde_json::json!({})) });

		assert!(res.is_err());
	}

	#[test]
	fn trigger_serde_shapes() {
		let event = serde_json::to_value(Trigger::event("a/b")).unwrap();
		assert_eq!(event, serde_json::json!({"event": "a/b"}));

		let cron = serde_json::to_value(Trigger::cron("0 * * * *")).unwrap();
		assert_eq!(cron, serde_json::json!({"cron": "0 * * * *"}));

		let decoded: Trigger = serde_json::from_value(serde_json::json!({
			"event": "x/y",
			"expression": "event.data.ok == true",
		}))
		.unwrap();
		assert!(matches!(decoded, Trigger::Event { expression: Some(_), .. }));
	}
}
