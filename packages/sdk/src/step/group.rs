//! Parallel step groups.
//!
//! Branches run sequentially inside the single-threaded replay. A branch
//! that reaches a new step appends its opcode and unwinds with the
//! suspension sentinel; the group swallows it and offers the next branch.
//! Once every branch has been offered, the group itself suspends if any
//! opcode was planned, so the orchestrator receives the whole batch in one
//! response. Sequential sub-steps inside one branch take effect on
//! subsequent replays.

use std::future::Future;

use anyhow::Result;
use futures_util::future::BoxFuture;

use crate::error::{is_interrupt, Interrupt};
use crate::step::StepCtx;

/// One branch of a parallel group.
pub type Branch = Box<dyn FnOnce(StepCtx) -> BoxFuture<'static, Result<serde_json::Value>> + Send>;

/// Adapts a closure into a [`Branch`].
pub fn branch<F, Fut>(f: F) -> Branch
where
	F: FnOnce(StepCtx) -> Fut + Send + 'static,
	Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
	Box::new(move |ctx| Box::pin(f(ctx)))
}

/// Offers every branch, then either suspends with the collected batch or
/// returns all branch outputs in branch order.
pub async fn parallel(ctx: &StepCtx, branches: Vec<Branch>) -> Result<Vec<serde_json::Value>> {
	let mut planned = false;
	let mut outputs = Vec::with_capacity(branches.len());

	for branch in branches {
		match branch(ctx.clone()).await {
			Ok(value) => outputs.push(value),
			Err(err) if is_interrupt(&err) => planned = true,
			Err(err) => return Err(err),
		}
	}

	if planned {
		return Err(Interrupt.into());
	}

	Ok(outputs)
}
