use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Result};

use crate::function::Function;

/// Functions served by this app, keyed by slug. Writes happen only during
/// registration at startup.
#[derive(Default)]
pub struct FunctionRegistry {
	inner: RwLock<HashMap<String, Arc<Function>>>,
}

impl FunctionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&self, function: Function) -> Result<()> {
		let mut inner = self.inner.write().expect("registry lock poisoned");

		if inner.contains_key(function.slug()) {
			bail!("duplicate function slug: {}", function.slug());
		}

		inner.insert(function.slug().to_string(), Arc::new(function));
		Ok(())
	}

	pub fn get(&self, slug: &str) -> Option<Arc<Function>> {
		self.inner.read().expect("registry lock poisoned").get(slug).cloned()
	}

	pub fn len(&self) -> usize {
		self.inner.read().expect("registry lock poisoned").len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// All functions, ordered by slug for deterministic registration
	/// payloads.
	pub fn all(&self) -> Vec<Arc<Function>> {
		let mut functions: Vec<_> = self
			.inner
			.read()
			.expect("registry lock poisoned")
			.values()
			.cloned()
			.collect();
		functions.sort_by(|a, b| a.slug().cmp(b.slug()));
		functions
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::event::Event;
	use crate::function::{FunctionBuilder, Trigger};

	fn test_fn(slug: &str) -> Function {
		FunctionBuilder::new(slug)
			.trigger(Trigger::event("test/event"))
			.build::<Event, _, _, _>(|_ctx, _input| async { Ok(serde_json::json!(null)) })
			.unwrap()
	}

	#[test]
	fn duplicate_slug_rejected() {
		let registry = FunctionRegistry::new();
		registry.add(test_fn("a")).unwrap();
		assert!(registry.add(test_fn("a")).is_err());
		assert_eq!(registry.len(), 1);
	}

	#[test]
	fn all_is_sorted() {
		let registry = FunctionRegistry::new();
		registry.add(test_fn("b")).unwrap();
		registry.add(test_fn("a")).unwrap();

		let slugs: Vec<_> = registry.all().iter().map(|f| f.slug().to_string()).collect();
		assert_eq!(slugs, vec!["a", "b"]);
	}
}
