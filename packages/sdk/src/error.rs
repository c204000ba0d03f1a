use std::error::Error as StdError;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel returned by step operations when the invocation has to suspend.
///
/// This is a normal error value that unwinds through the user function's `?`
/// chain; the dispatcher recognises it with [`is_interrupt`] and treats the
/// replay as checkpointed rather than failed. It must never be surfaced to
/// the orchestrator.
#[derive(Debug, thiserror::Error)]
#[error("invocation suspended at a step boundary")]
pub struct Interrupt;

/// True if the error chain contains the step-suspension sentinel.
pub fn is_interrupt(err: &anyhow::Error) -> bool {
	err.chain().any(|cause| cause.is::<Interrupt>())
}

/// Marks an error as permanent: the orchestrator must not retry.
///
/// Detection is by wrapper-chain search, so this can wrap (and be wrapped
/// by) any other error, including [`RetryAtError`].
pub struct NoRetryError {
	inner: Box<dyn StdError + Send + Sync + 'static>,
}

impl fmt::Display for NoRetryError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.inner)
	}
}

impl fmt::Debug for NoRetryError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "NoRetryError({:?})", self.inner)
	}
}

impl StdError for NoRetryError {
	fn source(&self) -> Option<&(dyn StdError + 'static)> {
		Some(self.inner.as_ref() as &(dyn StdError + 'static))
	}
}

/// Wraps `err` so the orchestrator will not schedule another attempt.
pub fn no_retry(err: impl Into<anyhow::Error>) -> anyhow::Error {
	anyhow::Error::new(NoRetryError {
		inner: err.into().into(),
	})
}

/// True if the error chain contains a [`NoRetryError`].
pub fn is_no_retry(err: &anyhow::Error) -> bool {
	err.chain().any(|cause| cause.is::<NoRetryError>())
}

/// Carries an absolute time at which the orchestrator should schedule the
/// next attempt.
pub struct RetryAtError {
	pub at: DateTime<Utc>,
	inner: Box<dyn StdError + Send + Sync + 'static>,
}

impl fmt::Display for RetryAtError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.inner)
	}
}

impl fmt::Debug for RetryAtError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "RetryAtError(at={}, {:?})", self.at, self.inner)
	}
}

impl StdError for RetryAtError {
	fn source(&self) -> Option<&(dyn StdError + 'static)> {
		Some(self.inner.as_ref() as &(dyn StdError + 'static))
	}
}

/// Wraps `err` with an absolute time for the next attempt.
pub fn retry_at(err: impl Into<anyhow::Error>, at: DateTime<Utc>) -> anyhow::Error {
	anyhow::Error::new(RetryAtError {
		at,
		inner: err.into().into(),
	})
}

/// Earliest retry time found anywhere in the error chain.
pub fn get_retry_at(err: &anyhow::Error) -> Option<DateTime<Utc>> {
	err.chain()
		.find_map(|cause| cause.downcast_ref::<RetryAtError>())
		.map(|e| e.at)
}

/// An error raised inside a memoized step and carried across replays.
///
/// On replay of a failed step the memoized payload decodes into this type
/// and is returned from the step operation, letting user code handle it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct StepError {
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<serde_json::Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stack: Option<String>,
}

impl StepError {
	pub fn from_err(err: &anyhow::Error) -> Self {
		StepError {
			message: err.to_string(),
			name: None,
			data: None,
			stack: None,
		}
	}
}

/// True if the error chain contains a [`StepError`].
pub fn is_step_error(err: &anyhow::Error) -> bool {
	err.chain().any(|cause| cause.is::<StepError>())
}

/// Returned by `wait_for_event` when the memoized result records a timeout.
#[derive(Debug, thiserror::Error)]
#[error("event not received within the wait window")]
pub struct EventNotReceived;

/// Returned by `wait_for_signal` when the memoized result records a timeout.
#[derive(Debug, thiserror::Error)]
#[error("signal not received within the wait window")]
pub struct SignalNotReceived;

#[cfg(test)]
mod tests {
	use super::*;
	use anyhow::{anyhow, Context};

	#[test]
	fn no_retry_detected_through_context() {
		let err = no_retry(anyhow!("perm")).context("outer");
		assert!(is_no_retry(&err));
		assert!(!is_interrupt(&err));
	}

	#[test]
	fn retry_at_wraps_no_retry() {
		let at = Utc::now();
		let err = retry_at(no_retry(anyhow!("flaky")), at);
		assert!(is_no_retry(&err));
		assert_eq!(get_retry_at(&err), Some(at));
	}

	#[test]
	fn plain_error_has_no_metadata() {
		let err = anyhow!("boom");
		assert!(!is_no_retry(&err));
		assert_eq!(get_retry_at(&err), None);
	}

	#[test]
	fn step_error_round_trip() {
		let step_err = StepError {
			message: "perm".to_string(),
			name: Some("Error".to_string()),
			data: Some(serde_json::json!({"code": 7})),
			stack: None,
		};

		let encoded = serde_json::to_string(&step_err).unwrap();
		let decoded: StepError = serde_json::from_str(&encoded).unwrap();
		assert_eq!(step_err, decoded);
	}
}
