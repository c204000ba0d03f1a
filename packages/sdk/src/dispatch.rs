use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use futures_util::FutureExt;
use serde_json::value::RawValue;

use crate::apiclient::EventClient;
use crate::config::Config;
use crate::error::{get_retry_at, is_interrupt, is_no_retry, StepError};
use crate::event::Event;
use crate::function::RawInput;
use crate::manager::{InvocationManager, StepMode};
use crate::middleware::{MiddlewareStack, TransformableInput};
use crate::registry::FunctionRegistry;
use crate::request::{ResponseStatus, SdkResponse, ServerRequest};
use crate::signing::{self, KeyRotation};
use crate::step::op::OpCode;
use crate::step::StepCtx;

/// Host-side dispatcher: receives an orchestrator request, rebuilds state,
/// drives one replay pass, classifies the outcome, and emits an
/// orchestrator-compatible response. Shared by every transport.
pub struct Dispatcher {
	config: Config,
	registry: Arc<FunctionRegistry>,
	middleware: Arc<MiddlewareStack>,
	rotation: Arc<KeyRotation>,
	event_client: Option<Arc<EventClient>>,
}

impl Dispatcher {
	pub fn new(config: Config, registry: Arc<FunctionRegistry>) -> Self {
		let event_client = EventClient::from_config(&config).map(Arc::new);

		Dispatcher {
			config,
			registry,
			middleware: Arc::new(MiddlewareStack::default()),
			rotation: Arc::new(KeyRotation::new()),
			event_client,
		}
	}

	pub fn with_middleware(mut self, middleware: MiddlewareStack) -> Self {
		self.middleware = Arc::new(middleware);
		self
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn registry(&self) -> &Arc<FunctionRegistry> {
		&self.registry
	}

	pub fn rotation(&self) -> &Arc<KeyRotation> {
		&self.rotation
	}

	/// Runs one invocation of the function registered under `fn_slug`.
	#[tracing::instrument(skip_all, fields(%fn_slug))]
	pub async fn invoke(
		&self,
		fn_slug: &str,
		body: &[u8],
		signature: Option<&str>,
	) -> SdkResponse {
		// Authenticate before touching the body.
		let signed_key = match self.verify_signature(body, signature) {
			Ok(key) => key,
			Err(err) => {
				tracing::warn!(?err, "rejecting unauthorized invocation");
				return SdkResponse::message(ResponseStatus::Unauthorized, "unauthorized");
			}
		};

		if body.len() > self.config.max_body_size() {
			return SdkResponse::message(
				ResponseStatus::Error,
				format!(
					"request body of {} bytes exceeds the configured limit",
					body.len()
				),
			);
		}

		let request: ServerRequest = match serde_json::from_slice(body) {
			Ok(request) => request,
			Err(err) => {
				tracing::warn!(?err, "failed to parse invocation body");
				return SdkResponse::message(ResponseStatus::BadRequest, "malformed input");
			}
		};

		let Some(function) = self.registry.get(fn_slug) else {
			return SdkResponse::message(
				ResponseStatus::NotFound,
				format!("function not found: {fn_slug}"),
			);
		};

		let mut res = self.run_function(&function, request).await;
		res.signed_key = signed_key;
		res
	}

	fn verify_signature(&self, body: &[u8], signature: Option<&str>) -> Result<Option<String>> {
		if self.config.is_dev() {
			return Ok(None);
		}

		let primary = self
			.config
			.signing_key()
			.ok_or_else(|| anyhow!("no signing key configured"))?;
		let fallback = self.config.signing_key_fallback();

		let header = signature.ok_or_else(|| anyhow!("missing request signature"))?;

		let order = self.rotation.order(&primary, fallback.as_deref());
		let matched = signing::validate(
			body,
			header,
			order[0],
			order.get(1).copied(),
			Utc::now().timestamp(),
		)?;

		self.rotation.mark_success(&matched, &primary);
		Ok(Some(matched))
	}

	async fn run_function(
		&self,
		function: &crate::function::Function,
		request: ServerRequest,
	) -> SdkResponse {
		// Decode the triggering event and batch before the manager takes
		// ownership of the request.
		let event: Event = match &request.event {
			Some(raw) => match serde_json::from_str(raw.get()) {
				Ok(event) => event,
				Err(err) => {
					tracing::warn!(?err, "failed to parse triggering event");
					return SdkResponse::message(ResponseStatus::BadRequest, "malformed input");
				}
			},
			None => Event::new("", serde_json::Value::Null),
		};

		let mut events = Vec::with_capacity(request.events.len().max(1));
		for raw in &request.events {
			match serde_json::from_str(raw.get()) {
				Ok(event) => events.push(event),
				Err(err) => {
					tracing::warn!(?err, "failed to parse batch event");
					return SdkResponse::message(ResponseStatus::BadRequest, "malformed input");
				}
			}
		}
		if events.is_empty() {
			events.push(event.clone());
		}

		let call_ctx = request.ctx.clone();
		let no_memoized_steps = request.steps.is_empty();

		let manager = Arc::new(InvocationManager::new(request));
		manager.set_mode(StepMode::Return);

		// Let middleware reshape the input before decoding into the
		// declared event type.
		let mut input = TransformableInput { event, events };
		self.middleware.transform_input(&mut input, &call_ctx).await;

		let step_ctx = StepCtx::new(
			manager.clone(),
			self.middleware.clone(),
			self.event_client.clone(),
		);

		// With no memoized state, new code runs immediately.
		if no_memoized_steps && manager.mark_before_execution() {
			self.middleware.before_execution(&call_ctx).await;
		}

		let raw_input = RawInput {
			event: input.event,
			events: input.events,
			ctx: call_ctx.clone(),
		};

		let caught = std::panic::AssertUnwindSafe(function.call(step_ctx, raw_input))
			.catch_unwind()
			.await;

		let user_res: Result<Box<RawValue>> = match caught {
			Ok(res) => res,
			Err(panic) => {
				let message = panic_message(panic.as_ref());
				Err(anyhow!(
					"function panicked: {message}. stack: {}",
					std::backtrace::Backtrace::force_capture()
				))
			}
		};

		self.middleware.after_execution(&call_ctx).await;

		self.classify(&manager, user_res)
	}

	/// Turns the replay outcome into a response. Exactly one of
	/// ops/error/done is ever produced.
	fn classify(
		&self,
		manager: &InvocationManager,
		user_res: Result<Box<RawValue>>,
	) -> SdkResponse {
		let ops = manager.ops();

		let mut output = None;
		let fn_err = match user_res {
			Ok(value) => {
				output = Some(value);
				None
			}
			Err(err) if is_interrupt(&err) => None,
			Err(err) => Some(err),
		};

		// The manager's recorded step error takes precedence over whatever
		// the function returned after it.
		let mut err = manager.take_err().or(fn_err);

		let mut no_retry = err.as_ref().map(is_no_retry).unwrap_or(false);
		let retry_at = err.as_ref().and_then(get_retry_at);

		// A lone step-error opcode already represents the failure; reporting
		// it at the top level as well would double-count it.
		if ops.len() == 1 && ops[0].op == OpCode::StepError {
			err = None;
		}

		// A step error that leaks out of the function body means the user
		// caught it improperly; replaying cannot help.
		let unhandled_step_error = err.as_ref().and_then(|current| {
			current
				.chain()
				.find_map(|cause| cause.downcast_ref::<StepError>())
				.map(|step_err| step_err.message.clone())
		});
		if let Some(message) = unhandled_step_error {
			err = Some(anyhow!("Unhandled step error: {message}"));
			no_retry = true;
		}

		let mut res = if let Some(err) = err {
			tracing::debug!(%err, "function invocation failed");
			SdkResponse::message(
				ResponseStatus::Error,
				format!("error calling function: {err}"),
			)
		} else if !ops.is_empty() {
			match serde_json::to_vec(&ops) {
				Ok(body) => SdkResponse::new(ResponseStatus::NotCompleted, body),
				Err(err) => SdkResponse::message(
					ResponseStatus::Error,
					format!("error calling function: failed to encode opcodes: {err}"),
				),
			}
		} else {
			let body = output
				.map(|raw| raw.get().as_bytes().to_vec())
				.unwrap_or_else(|| b"null".to_vec());
			SdkResponse::new(ResponseStatus::Done, body)
		};

		res.no_retry = no_retry;
		res.retry_at = retry_at;
		res
	}
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
	if let Some(message) = panic.downcast_ref::<&str>() {
		(*message).to_string()
	} else if let Some(message) = panic.downcast_ref::<String>() {
		message.clone()
	} else {
		"unknown panic".to_string()
	}
}
