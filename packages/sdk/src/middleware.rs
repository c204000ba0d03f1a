use std::sync::Arc;

use async_trait::async_trait;

use crate::event::Event;
use crate::request::CallContext;

/// Mutable view of the invocation input handed to `transform_input`.
#[derive(Debug)]
pub struct TransformableInput {
	pub event: Event,
	pub events: Vec<Event>,
}

/// Per-invocation lifecycle hooks.
///
/// `before_execution` fires exactly once per invocation, at the first
/// moment new code runs after the last memoized step. `after_execution`
/// fires once as the dispatcher returns. `transform_input` runs before the
/// user function and may mutate the event or batch.
#[async_trait]
pub trait Middleware: Send + Sync {
	async fn before_execution(&self, _ctx: &CallContext) {}

	async fn after_execution(&self, _ctx: &CallContext) {}

	async fn transform_input(&self, _input: &mut TransformableInput, _ctx: &CallContext) {}
}

/// Registered middleware, called in forward order except for
/// `after_execution` which runs in reverse.
#[derive(Default, Clone)]
pub struct MiddlewareStack {
	items: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareStack {
	pub fn new(items: Vec<Arc<dyn Middleware>>) -> Self {
		MiddlewareStack { items }
	}

	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}

	pub async fn before_execution(&self, ctx: &CallContext) {
		for mw in &self.items {
			mw.before_execution(ctx).await;
		}
	}

	pub async fn after_execution(&self, ctx: &CallContext) {
		for mw in self.items.iter().rev() {
			mw.after_execution(ctx).await;
		}
	}

	pub async fn transform_input(&self, input: &mut TransformableInput, ctx: &CallContext) {
		for mw in &self.items {
			mw.transform_input(input, ctx).await;
		}
	}
}
