use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sha1::{Digest, Sha1};

use crate::error::StepError;

/// Step kinds understood by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpCode {
	StepRun,
	Sleep,
	WaitForEvent,
	WaitForSignal,
	InvokeFunction,
	/// HTTP performed by the orchestrator on the function's behalf.
	Gateway,
	StepError,
}

/// Logical step identity before hashing.
///
/// `pos` is the zero-based occurrence counter for `id` within one replay:
/// the first occurrence hashes the bare id, later occurrences hash
/// `"{id}:{pos}"`. The scheme is append-only across replays, so identical
/// code paths always produce identical hashed ids.
#[derive(Debug, Clone)]
pub struct UnhashedOp {
	pub op: OpCode,
	pub id: String,
	pub opts: Option<serde_json::Value>,
	pub pos: u32,
}

impl UnhashedOp {
	pub fn hashed_id(&self) -> String {
		let input = if self.pos == 0 {
			self.id.clone()
		} else {
			format!("{}:{}", self.id, self.pos)
		};

		hex::encode(Sha1::digest(input.as_bytes()))
	}

	/// Opcode describing this step with no result attached.
	pub fn planned(&self, name: Option<&str>) -> GeneratorOpcode {
		GeneratorOpcode {
			id: self.hashed_id(),
			op: self.op,
			name: name.map(str::to_string),
			opts: self.opts.clone(),
			data: None,
			error: None,
		}
	}

	/// Opcode carrying a successful result.
	pub fn with_data(&self, name: Option<&str>, data: Box<RawValue>) -> GeneratorOpcode {
		GeneratorOpcode {
			data: Some(data),
			..self.planned(name)
		}
	}

	/// Opcode of kind `StepError` carrying the failure.
	pub fn with_error(&self, name: Option<&str>, error: StepError) -> GeneratorOpcode {
		GeneratorOpcode {
			op: OpCode::StepError,
			error: Some(error),
			..self.planned(name)
		}
	}
}

/// One entry in the worker → orchestrator protocol: a single unfinished
/// step, or a step result produced during this replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorOpcode {
	/// Hashed step id.
	pub id: String,
	pub op: OpCode,
	/// Display name, the user-supplied step id.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub opts: Option<serde_json::Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Box<RawValue>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<StepError>,
}

/// Decoded memoized payload.
pub enum StepPayload {
	/// `{"data": …}` wrapper.
	Data(serde_json::Value),
	/// `{"error": …}` wrapper.
	Error(StepError),
	/// Anything else, taken verbatim.
	Plain(serde_json::Value),
}

/// Splits a memoized payload into the `{data|error}` wrapped form or a
/// plain value. An object is treated as wrapped when it carries an `error`
/// key, or a lone `data` key.
pub fn unwrap_payload(raw: &RawValue) -> Result<StepPayload> {
	let value: serde_json::Value =
		serde_json::from_str(raw.get()).context("memoized step payload is not valid JSON")?;

	if let serde_json::Value::Object(map) = &value {
		if let Some(err_value) = map.get("error") {
			if !err_value.is_null() {
				let error: StepError = serde_json::from_value(err_value.clone())
					.context("failed to decode memoized step error")?;
				return Ok(StepPayload::Error(error));
			}
		}

		if map.len() == 1 {
			if let Some(data) = map.get("data") {
				return Ok(StepPayload::Data(data.clone()));
			}
		}
	}

	Ok(StepPayload::Plain(value))
}

/// Formats a duration the way the orchestrator parses them: whole
/// hour/minute/second components, millisecond precision below one second.
pub fn fmt_duration(duration: Duration) -> String {
	let millis = duration.as_millis();
	if millis == 0 {
		return "0s".to_string();
	}
	if millis < 1_000 {
		return format!("{millis}ms");
	}

	let total_secs = duration.as_secs();
	let hours = total_secs / 3_600;
	let minutes = (total_secs % 3_600) / 60;
	let secs = total_secs % 60;
	let sub_millis = millis as u64 % 1_000;

	let mut out = String::new();
	if hours > 0 {
		out.push_str(&format!("{hours}h"));
	}
	if minutes > 0 {
		out.push_str(&format!("{minutes}m"));
	}
	if secs > 0 || sub_millis > 0 {
		if sub_millis > 0 {
			out.push_str(&format!("{secs}.{sub_millis:03}s"));
		} else {
			out.push_str(&format!("{secs}s"));
		}
	}

	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hash_is_stable_per_occurrence() {
		let first = UnhashedOp {
			op: OpCode::StepRun,
			id: "a".to_string(),
			opts: None,
			pos: 0,
		};
		let repeat = UnhashedOp { pos: 1, ..first.clone() };

		// sha1("a") and sha1("a:1")
		assert_eq!(first.hashed_id(), "86f7e437faa5a7fce15d1ddcb9eaeaea377667b8");
		assert_eq!(repeat.hashed_id(), "de89bfaf06245091a7873290a793604612302247");

		// The same call in a later replay yields the same hash.
		assert_eq!(first.hashed_id(), first.hashed_id());
	}

	#[test]
	fn payload_unwrapping() {
		let raw = serde_json::value::to_raw_value(&serde_json::json!({"data": {"n": 1}})).unwrap();
		assert!(matches!(unwrap_payload(&raw).unwrap(), StepPayload::Data(_)));

		let raw =
			serde_json::value::to_raw_value(&serde_json::json!({"error": {"message": "perm"}}))
				.unwrap();
		match unwrap_payload(&raw).unwrap() {
			StepPayload::Error(err) => assert_eq!(err.message, "perm"),
			_ => panic!("expected error payload"),
		}

		let raw = serde_json::value::to_raw_value(&serde_json::json!({"data": 1, "other": 2}))
			.unwrap();
		assert!(matches!(unwrap_payload(&raw).unwrap(), StepPayload::Plain(_)));

		let raw = serde_json::value::to_raw_value(&serde_json::json!([1, 2])).unwrap();
		assert!(matches!(unwrap_payload(&raw).unwrap(), StepPayload::Plain(_)));
	}

	#[test]
	fn duration_formatting() {
		assert_eq!(fmt_duration(Duration::ZERO), "0s");
		assert_eq!(fmt_duration(Duration::from_millis(500)), "500ms");
		assert_eq!(fmt_duration(Duration::from_secs(90)), "1m30s");
		assert_eq!(fmt_duration(Duration::from_secs(3_600)), "1h");
		assert_eq!(fmt_duration(Duration::from_millis(61_250)), "1m1.250s");
	}
}
