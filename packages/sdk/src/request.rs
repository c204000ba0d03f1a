use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Per-invocation input from the orchestrator. Immutable after parse.
#[derive(Debug, Default, Deserialize)]
pub struct ServerRequest {
	/// Primary triggering event.
	#[serde(default)]
	pub event: Option<Box<RawValue>>,
	/// Batch of triggering events, non-empty when batching is configured.
	#[serde(default)]
	pub events: Vec<Box<RawValue>>,
	/// Prior step results keyed by hashed step id.
	#[serde(default)]
	pub steps: HashMap<String, Box<RawValue>>,
	#[serde(default)]
	pub ctx: CallContext,
	#[serde(default)]
	pub use_api: bool,
	#[serde(default)]
	pub version: i32,
}

/// Call context fields forwarded with every invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallContext {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub env: Option<String>,
	#[serde(default)]
	pub fn_id: String,
	#[serde(default)]
	pub run_id: String,
	#[serde(default)]
	pub attempt: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub step_id: Option<String>,
}

/// Invocation outcome classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
	/// Function returned a value; body is its JSON encoding.
	Done,
	/// Opcodes were emitted; body is the encoded opcode array.
	NotCompleted,
	BadRequest,
	Unauthorized,
	NotFound,
	/// Function or dispatcher error; body is `{"message": …}`.
	Error,
}

impl ResponseStatus {
	pub fn http_status(self) -> u16 {
		match self {
			ResponseStatus::Done => 200,
			ResponseStatus::NotCompleted => 206,
			ResponseStatus::BadRequest => 400,
			ResponseStatus::Unauthorized => 401,
			ResponseStatus::NotFound => 410,
			ResponseStatus::Error => 500,
		}
	}
}

/// Transport-independent invocation response.
#[derive(Debug)]
pub struct SdkResponse {
	pub status: ResponseStatus,
	pub body: Vec<u8>,
	pub no_retry: bool,
	pub retry_at: Option<DateTime<Utc>>,
	/// Key that validated the request, used to sign the response.
	pub signed_key: Option<String>,
}

impl SdkResponse {
	pub fn new(status: ResponseStatus, body: Vec<u8>) -> Self {
		SdkResponse {
			status,
			body,
			no_retry: false,
			retry_at: None,
			signed_key: None,
		}
	}

	pub fn message(status: ResponseStatus, message: impl AsRef<str>) -> Self {
		let body = serde_json::json!({ "message": message.as_ref() });
		Self::new(status, serde_json::to_vec(&body).unwrap_or_default())
	}
}

/// Single framed response used by the streaming transport mode.
#[derive(Debug, Serialize, Deserialize)]
pub struct StreamEnvelope {
	pub status: u16,
	pub body: String,
	#[serde(rename = "retryAt", skip_serializing_if = "Option::is_none")]
	pub retry_at: Option<String>,
	#[serde(rename = "noRetry")]
	pub no_retry: bool,
	#[serde(default)]
	pub headers: HashMap<String, String>,
}

impl StreamEnvelope {
	pub fn from_response(res: &SdkResponse) -> Self {
		StreamEnvelope {
			status: res.status.http_status(),
			body: String::from_utf8_lossy(&res.body).into_owned(),
			retry_at: res.retry_at.map(|at| at.to_rfc3339()),
			no_retry: res.no_retry,
			headers: HashMap::new(),
		}
	}
}
