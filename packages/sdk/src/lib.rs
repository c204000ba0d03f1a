//! Durable-function worker SDK core.
//!
//! Application code expresses long-running, retry-safe workflows as
//! ordinary async functions whose steps are checkpointed by a remote
//! orchestrator. Each invocation is a replay: already-completed step
//! results are supplied from state, newly reached steps emit opcodes, and
//! execution suspends at the first undiscovered step.
//!
//! Transports live in sibling crates; both hand requests to
//! [`dispatch::Dispatcher`].

pub mod apiclient;
pub mod config;
pub mod dispatch;
pub mod env;
pub mod error;
pub mod event;
pub mod function;
pub mod manager;
pub mod middleware;
pub mod register;
pub mod registry;
pub mod request;
pub mod signing;
pub mod step;

pub mod prelude {
	pub use anyhow::Result;

	pub use crate::config::Config;
	pub use crate::dispatch::Dispatcher;
	pub use crate::error::{no_retry, retry_at, StepError};
	pub use crate::event::Event;
	pub use crate::function::{Function, FunctionBuilder, Input, Trigger};
	pub use crate::registry::FunctionRegistry;
	pub use crate::step::group;
	pub use crate::step::{
		FetchRequest, InvokeOpts, StepCtx, WaitForEventOpts, WaitForSignalOpts,
	};
}
