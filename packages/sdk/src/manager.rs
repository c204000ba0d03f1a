use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use serde_json::value::RawValue;
use tokio::sync::mpsc;

use crate::request::{CallContext, ServerRequest};
use crate::step::op::{GeneratorOpcode, OpCode, UnhashedOp};

/// Policy for a step operation that finds no memoized result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepMode {
	/// Emit the opcode and suspend. Standard orchestrator model.
	#[default]
	Return,
	/// Emit the opcode, return the zero value, keep executing.
	Continue,
	/// Execute inline and emit a result-carrying opcode to the side channel.
	Background,
	/// Same as `Return`; entered after conversion from `Background`.
	Checkpoint,
}

#[derive(Default)]
struct ReplayState {
	/// Emitted opcodes, append-only within one replay.
	ops: Vec<GeneratorOpcode>,
	/// Occurrence counter per user-supplied step id. Rebuilt every replay.
	indexes: HashMap<String, u32>,
	/// Hashed ids whose memoized result has been consumed.
	seen: HashSet<String>,
	/// Hashed ids present in the request but not yet consumed.
	unseen: HashSet<String>,
}

/// Result of a memoized-step lookup.
pub struct StepLookup {
	pub memo: Option<Box<RawValue>>,
	/// True exactly once per invocation, at the transition into new code.
	pub fire_before_execution: bool,
}

/// Per-run, single-replay state. Owned by the dispatcher; the step runtime
/// reaches it through a cloneable `Arc` handle.
pub struct InvocationManager {
	request: ServerRequest,
	state: RwLock<ReplayState>,
	/// First step-fatal error; later setters are dropped.
	err: Mutex<Option<anyhow::Error>>,
	mode: RwLock<StepMode>,
	cancelled: AtomicBool,
	before_execution_fired: AtomicBool,
	/// Side channel for `Background` mode opcodes.
	checkpoint_tx: Mutex<Option<mpsc::UnboundedSender<GeneratorOpcode>>>,
}

impl InvocationManager {
	pub fn new(request: ServerRequest) -> Self {
		let unseen = request.steps.keys().cloned().collect();

		InvocationManager {
			request,
			state: RwLock::new(ReplayState {
				unseen,
				..Default::default()
			}),
			err: Mutex::new(None),
			mode: RwLock::new(StepMode::default()),
			cancelled: AtomicBool::new(false),
			before_execution_fired: AtomicBool::new(false),
			checkpoint_tx: Mutex::new(None),
		}
	}

	pub fn request(&self) -> &ServerRequest {
		&self.request
	}

	/// Read-only projection of the call context for middleware hooks.
	pub fn call_context(&self) -> CallContext {
		self.request.ctx.clone()
	}

	pub fn mode(&self) -> StepMode {
		*self.mode.read().expect("mode lock poisoned")
	}

	pub fn set_mode(&self, mode: StepMode) {
		*self.mode.write().expect("mode lock poisoned") = mode;
	}

	/// Allocates the logical identity for a step call, bumping the
	/// occurrence counter for repeated ids.
	pub fn new_op(&self, op: OpCode, id: &str, opts: Option<serde_json::Value>) -> UnhashedOp {
		let mut state = self.state.write().expect("state lock poisoned");

		let pos = state
			.indexes
			.entry(id.to_string())
			.and_modify(|pos| *pos += 1)
			.or_insert(0);

		UnhashedOp {
			op,
			id: id.to_string(),
			opts,
			pos: *pos,
		}
	}

	/// Looks up the memoized result for a hashed step id and keeps the
	/// seen/unseen bookkeeping. The first lookup that drains `unseen`
	/// reports that the before-execution hook must fire.
	pub fn step(&self, hashed_id: &str) -> StepLookup {
		let mut state = self.state.write().expect("state lock poisoned");

		if let Some(raw) = self.request.steps.get(hashed_id) {
			state.seen.insert(hashed_id.to_string());
			let had_unseen = !state.unseen.is_empty();
			state.unseen.remove(hashed_id);
			let drained = had_unseen && state.unseen.is_empty();

			StepLookup {
				memo: Some(raw.clone()),
				fire_before_execution: drained && self.mark_before_execution(),
			}
		} else {
			StepLookup {
				memo: None,
				fire_before_execution: false,
			}
		}
	}

	/// Claims the one before-execution firing; true for the first caller.
	pub fn mark_before_execution(&self) -> bool {
		self.before_execution_fired
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_ok()
	}

	/// Pushes an opcode. Dropped silently after cancellation.
	pub fn append_op(&self, op: GeneratorOpcode) {
		if self.is_cancelled() {
			tracing::debug!(op_id = %op.id, "invocation cancelled, dropping opcode");
			return;
		}

		self.state.write().expect("state lock poisoned").ops.push(op);
	}

	pub fn ops(&self) -> Vec<GeneratorOpcode> {
		self.state.read().expect("state lock poisoned").ops.clone()
	}

	pub fn ops_len(&self) -> usize {
		self.state.read().expect("state lock poisoned").ops.len()
	}

	/// Records the step-fatal error for this run; the first setter wins.
	pub fn set_err(&self, err: anyhow::Error) {
		let mut slot = self.err.lock().expect("err lock poisoned");
		if slot.is_none() {
			*slot = Some(err);
		}
	}

	pub fn has_err(&self) -> bool {
		self.err.lock().expect("err lock poisoned").is_some()
	}

	pub fn take_err(&self) -> Option<anyhow::Error> {
		self.err.lock().expect("err lock poisoned").take()
	}

	/// Aborts any further opcode emission.
	pub fn cancel(&self) {
		self.cancelled.store(true, Ordering::SeqCst);
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancelled.load(Ordering::SeqCst)
	}

	/// True iff this id's memoized result was consumed in this replay.
	pub fn replayed_step(&self, hashed_id: &str) -> bool {
		self.state
			.read()
			.expect("state lock poisoned")
			.seen
			.contains(hashed_id)
	}

	pub fn all_steps_seen(&self) -> bool {
		self.state
			.read()
			.expect("state lock poisoned")
			.unseen
			.is_empty()
	}

	pub fn set_checkpoint_channel(&self, tx: mpsc::UnboundedSender<GeneratorOpcode>) {
		*self.checkpoint_tx.lock().expect("checkpoint lock poisoned") = Some(tx);
	}

	/// Emits an opcode to the background side channel, falling back to the
	/// ops buffer when no channel is installed.
	pub fn checkpoint_send(&self, op: GeneratorOpcode) {
		let tx = self
			.checkpoint_tx
			.lock()
			.expect("checkpoint lock poisoned")
			.clone();

		match tx {
			Some(tx) => {
				if tx.send(op).is_err() {
					tracing::warn!("checkpoint channel closed, dropping opcode");
				}
			}
			None => self.append_op(op),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use anyhow::anyhow;

	fn request_with_steps(ids: &[&str]) -> ServerRequest {
		let steps = ids
			.iter()
			.map(|id| {
				(
					id.to_string(),
					serde_json::value::to_raw_value(&serde_json::json!({"ok": true})).unwrap(),
				)
			})
			.collect();

		ServerRequest {
			steps,
			..Default::default()
		}
	}

	#[test]
	fn index_increments_per_id() {
		let manager = InvocationManager::new(ServerRequest::default());

		assert_eq!(manager.new_op(OpCode::StepRun, "a", None).pos, 0);
		assert_eq!(manager.new_op(OpCode::StepRun, "a", None).pos, 1);
		assert_eq!(manager.new_op(OpCode::StepRun, "b", None).pos, 0);
		assert_eq!(manager.new_op(OpCode::StepRun, "a", None).pos, 2);
	}

	#[test]
	fn seen_unseen_partition_is_stable() {
		let manager = InvocationManager::new(request_with_steps(&["x", "y"]));

		let first = manager.step("x");
		assert!(first.memo.is_some());
		assert!(!first.fire_before_execution);
		assert!(manager.replayed_step("x"));
		assert!(!manager.all_steps_seen());

		let second = manager.step("y");
		assert!(second.memo.is_some());
		assert!(second.fire_before_execution);
		assert!(manager.all_steps_seen());

		// The hook never fires twice.
		assert!(!manager.mark_before_execution());
	}

	#[test]
	fn first_error_wins() {
		let manager = InvocationManager::new(ServerRequest::default());

		manager.set_err(anyhow!("first"));
		manager.set_err(anyhow!("second"));

		assert_eq!(manager.take_err().unwrap().to_string(), "first");
		assert!(manager.take_err().is_none());
	}

	#[test]
	fn cancel_stops_opcode_emission() {
		let manager = InvocationManager::new(ServerRequest::default());
		let op = manager.new_op(OpCode::StepRun, "a", None);

		manager.cancel();
		manager.append_op(op.planned(None));

		assert!(manager.ops().is_empty());
	}
}
