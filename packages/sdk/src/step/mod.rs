pub mod group;
pub mod op;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::RawValue;

use crate::apiclient::EventClient;
use crate::error::{no_retry, EventNotReceived, Interrupt, SignalNotReceived, StepError};
use crate::event::Event;
use crate::manager::{InvocationManager, StepMode};
use crate::middleware::MiddlewareStack;
use crate::step::op::{fmt_duration, unwrap_payload, GeneratorOpcode, OpCode, StepPayload};

/// Options for `wait_for_event`.
#[derive(Debug, Clone)]
pub struct WaitForEventOpts {
	/// Name of the event to match.
	pub event: String,
	pub timeout: Duration,
	/// Optional match expression evaluated by the orchestrator.
	pub if_expression: Option<String>,
}

/// Options for `wait_for_signal`.
#[derive(Debug, Clone)]
pub struct WaitForSignalOpts {
	pub signal: String,
	pub timeout: Duration,
}

/// Options for `invoke`.
#[derive(Debug, Clone, Default)]
pub struct InvokeOpts {
	/// App owning the target function. Defaults to the local app.
	pub app_id: Option<String>,
	/// Target function slug.
	pub function_id: String,
	pub data: serde_json::Value,
	pub user: Option<serde_json::Value>,
	pub timeout: Option<Duration>,
}

/// HTTP request performed by the orchestrator on the function's behalf.
#[derive(Debug, Clone)]
pub struct FetchRequest {
	pub url: String,
	/// Defaults to GET.
	pub method: Option<String>,
	pub headers: Option<BTreeMap<String, String>>,
	pub body: Option<serde_json::Value>,
}

/// Target time for `sleep_until`.
pub enum SleepUntil {
	Time(DateTime<Utc>),
	/// RFC 3339. Unparseable strings yield a zero duration.
	Rfc3339(String),
}

impl From<DateTime<Utc>> for SleepUntil {
	fn from(time: DateTime<Utc>) -> Self {
		SleepUntil::Time(time)
	}
}

impl From<&str> for SleepUntil {
	fn from(value: &str) -> Self {
		SleepUntil::Rfc3339(value.to_string())
	}
}

impl From<String> for SleepUntil {
	fn from(value: String) -> Self {
		SleepUntil::Rfc3339(value)
	}
}

/// Per-invocation handle to the step runtime. Cheap to clone; all clones
/// share the same invocation manager.
#[derive(Clone)]
pub struct StepCtx {
	manager: Arc<InvocationManager>,
	middleware: Arc<MiddlewareStack>,
	event_client: Option<Arc<EventClient>>,
}

impl StepCtx {
	pub(crate) fn new(
		manager: Arc<InvocationManager>,
		middleware: Arc<MiddlewareStack>,
		event_client: Option<Arc<EventClient>>,
	) -> Self {
		StepCtx {
			manager,
			middleware,
			event_client,
		}
	}

	pub fn manager(&self) -> &Arc<InvocationManager> {
		&self.manager
	}

	/// Memoized lookup plus the once-per-invocation before-execution hook.
	async fn lookup(&self, hashed_id: &str) -> Option<Box<RawValue>> {
		let res = self.manager.step(hashed_id);

		if res.fire_before_execution {
			self.middleware
				.before_execution(&self.manager.call_context())
				.await;
		}

		res.memo
	}

	fn interrupt<T>(&self) -> Result<T> {
		Err(Interrupt.into())
	}

	/// Mode-dispatched behavior for step kinds that cannot execute locally:
	/// emit the opcode, then either suspend or keep executing.
	fn suspend_or_continue<T: Default>(&self, opcode: GeneratorOpcode) -> Result<T> {
		match self.manager.mode() {
			StepMode::Return | StepMode::Checkpoint | StepMode::Background => {
				self.manager.append_op(opcode);
				self.interrupt()
			}
			StepMode::Continue => {
				self.manager.append_op(opcode);
				Ok(T::default())
			}
		}
	}

	/// Executes `f` once, memoizing its JSON-encoded result.
	///
	/// On replay the memoized bytes decode into `T` (or into a [`StepError`]
	/// if the step ultimately failed). When executing fresh, the result is
	/// attached to a `StepRun` opcode and the invocation suspends so the
	/// orchestrator can checkpoint it.
	pub async fn run<T, F, Fut>(&self, id: &str, f: F) -> Result<T>
	where
		T: Serialize + DeserializeOwned + Default + Send,
		F: FnOnce() -> Fut + Send,
		Fut: Future<Output = Result<T>> + Send,
	{
		let op = self.manager.new_op(OpCode::StepRun, id, None);
		let hashed = op.hashed_id();

		if let Some(raw) = self.lookup(&hashed).await {
			return match unwrap_payload(&raw)? {
				StepPayload::Error(err) => Err(err.into()),
				StepPayload::Data(value) | StepPayload::Plain(value) => {
					serde_json::from_value(value).context("failed to decode memoized step result")
				}
			};
		}

		if self.manager.is_cancelled() {
			return self.interrupt();
		}

		match self.manager.mode() {
			StepMode::Return | StepMode::Checkpoint => {
				match f().await {
					Ok(output) => {
						let data = serde_json::value::to_raw_value(&output)
							.context("failed to encode step result")?;
						self.manager.append_op(op.with_data(Some(id), data));
						self.interrupt()
					}
					Err(err) => {
						self.manager
							.append_op(op.with_error(Some(id), StepError::from_err(&err)));
						self.manager.set_err(err);
						self.interrupt()
					}
				}
			}
			StepMode::Continue => {
				self.manager.append_op(op.planned(Some(id)));
				Ok(T::default())
			}
			StepMode::Background => match f().await {
				Ok(output) => {
					let data = serde_json::value::to_raw_value(&output)
						.context("failed to encode step result")?;
					self.manager.checkpoint_send(op.with_data(Some(id), data));
					Ok(output)
				}
				Err(err) => {
					self.manager
						.checkpoint_send(op.with_error(Some(id), StepError::from_err(&err)));
					Err(err)
				}
			},
		}
	}

	pub async fn sleep(&self, id: &str, duration: Duration) -> Result<()> {
		self.sleep_inner(id, duration).await
	}

	/// Sleeps until an absolute time. Past times and unparseable strings
	/// emit a zero-duration sleep.
	pub async fn sleep_until(&self, id: &str, until: impl Into<SleepUntil>) -> Result<()> {
		let duration = match until.into() {
			SleepUntil::Time(time) => (time - Utc::now()).to_std().unwrap_or(Duration::ZERO),
			SleepUntil::Rfc3339(raw) => DateTime::parse_from_rfc3339(&raw)
				.map(|time| {
					(time.with_timezone(&Utc) - Utc::now())
						.to_std()
						.unwrap_or(Duration::ZERO)
				})
				.unwrap_or(Duration::ZERO),
		};

		self.sleep_inner(id, duration).await
	}

	async fn sleep_inner(&self, id: &str, duration: Duration) -> Result<()> {
		let opts = serde_json::json!({ "duration": fmt_duration(duration) });
		let op = self.manager.new_op(OpCode::Sleep, id, Some(opts));
		let hashed = op.hashed_id();

		if self.lookup(&hashed).await.is_some() {
			return Ok(());
		}

		if self.manager.is_cancelled() {
			return self.interrupt();
		}

		if self.manager.mode() == StepMode::Background {
			tokio::time::sleep(duration).await;
			self.manager.checkpoint_send(op.planned(Some(id)));
			return Ok(());
		}

		self.suspend_or_continue(op.planned(Some(id)))
	}

	/// Waits for a matching event. A memoized `null` records a timeout and
	/// surfaces as [`EventNotReceived`].
	pub async fn wait_for_event<T>(&self, id: &str, opts: WaitForEventOpts) -> Result<T>
	where
		T: DeserializeOwned + Default,
	{
		let mut op_opts = serde_json::json!({
			"event": opts.event,
			"timeout": fmt_duration(opts.timeout),
		});
		if let Some(expression) = &opts.if_expression {
			op_opts["if"] = serde_json::Value::String(expression.clone());
		}

		let op = self.manager.new_op(OpCode::WaitForEvent, id, Some(op_opts));
		let hashed = op.hashed_id();

		if let Some(raw) = self.lookup(&hashed).await {
			let value: serde_json::Value = serde_json::from_str(raw.get())
				.context("memoized wait-for-event payload is not valid JSON")?;
			if value.is_null() {
				return Err(EventNotReceived.into());
			}
			return serde_json::from_value(value).context("failed to decode awaited event");
		}

		if self.manager.is_cancelled() {
			return self.interrupt();
		}

		self.suspend_or_continue(op.planned(Some(id)))
	}

	/// Waits for a named signal, analogous to `wait_for_event`.
	pub async fn wait_for_signal<T>(&self, id: &str, opts: WaitForSignalOpts) -> Result<T>
	where
		T: DeserializeOwned + Default,
	{
		let op_opts = serde_json::json!({
			"signal": opts.signal,
			"timeout": fmt_duration(opts.timeout),
		});

		let op = self.manager.new_op(OpCode::WaitForSignal, id, Some(op_opts));
		let hashed = op.hashed_id();

		if let Some(raw) = self.lookup(&hashed).await {
			let value: serde_json::Value = serde_json::from_str(raw.get())
				.context("memoized wait-for-signal payload is not valid JSON")?;
			if value.is_null() {
				return Err(SignalNotReceived.into());
			}
			return serde_json::from_value(value).context("failed to decode awaited signal");
		}

		if self.manager.is_cancelled() {
			return self.interrupt();
		}

		self.suspend_or_continue(op.planned(Some(id)))
	}

	/// Invokes another function and waits for its output. The memoized
	/// payload is the `{data|error}` wrapper; the error branch surfaces as
	/// a no-retry error.
	pub async fn invoke<T>(&self, id: &str, opts: InvokeOpts) -> Result<T>
	where
		T: DeserializeOwned + Default,
	{
		let function_id = match &opts.app_id {
			Some(app_id) => format!("{}-{}", app_id, opts.function_id),
			None => opts.function_id.clone(),
		};

		self.invoke_by_id(id, &function_id, opts).await
	}

	/// Like `invoke` but takes the fully qualified function id.
	pub async fn invoke_by_id<T>(&self, id: &str, function_id: &str, opts: InvokeOpts) -> Result<T>
	where
		T: DeserializeOwned + Default,
	{
		let mut op_opts = serde_json::json!({
			"function_id": function_id,
			"payload": {
				"data": opts.data,
			},
		});
		if let Some(user) = &opts.user {
			op_opts["payload"]["user"] = user.clone();
		}
		if let Some(timeout) = opts.timeout {
			op_opts["timeout"] = serde_json::Value::String(fmt_duration(timeout));
		}

		let op = self.manager.new_op(OpCode::InvokeFunction, id, Some(op_opts));
		let hashed = op.hashed_id();

		if let Some(raw) = self.lookup(&hashed).await {
			return match unwrap_payload(&raw)? {
				StepPayload::Error(err) => Err(no_retry(err)),
				StepPayload::Data(value) | StepPayload::Plain(value) => {
					serde_json::from_value(value).context("failed to decode invoked function output")
				}
			};
		}

		if self.manager.is_cancelled() {
			return self.interrupt();
		}

		self.suspend_or_continue(op.planned(Some(id)))
	}

	/// Delegates an HTTP request to the orchestrator. To take the response
	/// verbatim, use `T = Box<serde_json::value::RawValue>`.
	pub async fn fetch<T>(&self, id: &str, request: FetchRequest) -> Result<T>
	where
		T: DeserializeOwned + Default,
	{
		let mut op_opts = serde_json::json!({
			"url": request.url,
			"method": request.method.as_deref().unwrap_or("GET"),
		});
		if let Some(headers) = &request.headers {
			op_opts["headers"] = serde_json::to_value(headers)?;
		}
		if let Some(body) = &request.body {
			op_opts["body"] = body.clone();
		}

		let op = self.manager.new_op(OpCode::Gateway, id, Some(op_opts));
		let hashed = op.hashed_id();

		if let Some(raw) = self.lookup(&hashed).await {
			return match unwrap_payload(&raw)? {
				StepPayload::Error(err) => Err(err.into()),
				StepPayload::Data(value) | StepPayload::Plain(value) => {
					serde_json::from_value(value).context("failed to decode fetch response")
				}
			};
		}

		if self.manager.is_cancelled() {
			return self.interrupt();
		}

		self.suspend_or_continue(op.planned(Some(id)))
	}

	/// Sends one event through the event API, memoized as a `run` step.
	/// Returns the assigned event id.
	pub async fn send_event(&self, id: &str, event: Event) -> Result<String> {
		let client = self
			.event_client
			.clone()
			.context("no event key configured for sending events")?;

		self.run(id, || async move { client.send(&event).await }).await
	}

	/// Sends a batch of events, memoized as a `run` step. Returns the
	/// assigned event ids.
	pub async fn send_events(&self, id: &str, events: Vec<Event>) -> Result<Vec<String>> {
		let client = self
			.event_client
			.clone()
			.context("no event key configured for sending events")?;

		self.run(id, || async move { client.send_many(&events).await })
			.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::is_interrupt;
	use crate::request::ServerRequest;
	use crate::step::op::UnhashedOp;

	fn ctx_with(manager: Arc<InvocationManager>) -> StepCtx {
		StepCtx::new(manager, Arc::new(MiddlewareStack::default()), None)
	}

	#[tokio::test]
	async fn continue_mode_returns_zero_value_without_suspending() {
		let manager = Arc::new(InvocationManager::new(ServerRequest::default()));
		manager.set_mode(StepMode::Continue);
		let ctx = ctx_with(manager.clone());

		let out: serde_json::Value = ctx
			.run("a", || async { Ok(serde_json::json!({"x": 1})) })
			.await
			.unwrap();

		// Zero value, body not executed, opcode still emitted.
		assert_eq!(out, serde_json::Value::Null);
		let ops = manager.ops();
		assert_eq!(ops.len(), 1);
		assert_eq!(ops[0].op, OpCode::StepRun);
		assert!(ops[0].data.is_none());

		// Execution keeps going: a second step can follow in the same pass.
		ctx.sleep("pause", Duration::from_secs(1)).await.unwrap();
		assert_eq!(manager.ops().len(), 2);
	}

	#[tokio::test]
	async fn cancelled_invocation_suspends_without_emitting() {
		let manager = Arc::new(InvocationManager::new(ServerRequest::default()));
		let ctx = ctx_with(manager.clone());

		manager.cancel();

		let res: Result<serde_json::Value> =
			ctx.run("a", || async { Ok(serde_json::json!(1)) }).await;

		let err = res.unwrap_err();
		assert!(is_interrupt(&err));
		assert!(manager.ops().is_empty());
	}

	#[tokio::test]
	async fn wait_for_signal_null_payload_is_timeout() {
		let hashed = UnhashedOp {
			op: OpCode::WaitForSignal,
			id: "sig".to_string(),
			opts: None,
			pos: 0,
		}
		.hashed_id();

		let request: ServerRequest = serde_json::from_str(
			&serde_json::json!({
				"steps": { hashed: null },
			})
			.to_string(),
		)
		.unwrap();

		let manager = Arc::new(InvocationManager::new(request));
		let ctx = ctx_with(manager);

		let res: Result<serde_json::Value> = ctx
			.wait_for_signal(
				"sig",
				WaitForSignalOpts {
					signal: "release".to_string(),
					timeout: Duration::from_secs(30),
				},
			)
			.await;

		let err = res.unwrap_err();
		assert!(err.chain().any(|cause| cause.is::<SignalNotReceived>()));
	}
}
