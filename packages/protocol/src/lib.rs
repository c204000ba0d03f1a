//! Wire protocol for the gateway transport.
//!
//! Every frame on the WebSocket is a binary-encoded [`ConnectMessage`]
//! envelope: a message kind plus an opaque payload. Payload schemas are
//! defined here as well so the worker and any test gateway agree on the
//! exact bytes.

use anyhow::{Context, Result};
use prost::Message;

/// Subprotocol negotiated on the WebSocket upgrade.
pub const WS_SUBPROTOCOL: &str = "v0.connect.sdk";

/// Envelope for every frame exchanged with the gateway.
#[derive(Clone, PartialEq, Message)]
pub struct ConnectMessage {
	#[prost(enumeration = "MessageKind", tag = "1")]
	pub kind: i32,
	#[prost(bytes = "vec", tag = "2")]
	pub payload: Vec<u8>,
}

/// Message kinds understood by either side of the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageKind {
	Unspecified = 0,
	/// Inbound, once, immediately after the upgrade.
	GatewayHello = 1,
	/// Inbound, once, after the gateway accepted the worker session.
	GatewayConnectionReady = 2,
	/// Inbound, any time while ready. Carries one invocation to execute.
	GatewayExecutorRequest = 3,
	/// Inbound. The gateway wants this connection gone; the worker must fail
	/// over to another gateway before closing.
	GatewayClosing = 4,
	GatewayHeartbeat = 5,
	/// Outbound, once, authenticates the session.
	WorkerConnect = 6,
	WorkerHeartbeat = 7,
	/// Outbound on shutdown, before waiting for in-flight handlers.
	WorkerPause = 8,
	/// Outbound, one per executor request completion.
	WorkerReply = 9,
	/// Inbound ack of a delivered reply, releases it from the buffer.
	WorkerReplyAck = 10,
	/// Outbound ack of a received executor request, by message id.
	SdkAck = 11,
}

impl ConnectMessage {
	pub fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
		ConnectMessage {
			kind: kind as i32,
			payload,
		}
	}

	pub fn encode_frame(&self) -> Vec<u8> {
		self.encode_to_vec()
	}

	pub fn decode_frame(buf: &[u8]) -> Result<Self> {
		ConnectMessage::decode(buf).context("failed to decode connect message frame")
	}
}

/// Session authentication and registration, sent once per connection.
#[derive(Clone, PartialEq, Message)]
pub struct WorkerConnectData {
	/// New for every (re)connection.
	#[prost(string, tag = "1")]
	pub connection_id: String,
	/// Stable across reconnects of the same process.
	#[prost(string, tag = "2")]
	pub instance_id: String,
	#[prost(string, tag = "3")]
	pub app_name: String,
	#[prost(string, optional, tag = "4")]
	pub env: Option<String>,
	#[prost(string, tag = "5")]
	pub sdk_version: String,
	/// Sha256 of the normalized signing key, hex encoded.
	#[prost(string, optional, tag = "6")]
	pub auth_key_hash: Option<String>,
	#[prost(uint32, tag = "7")]
	pub worker_concurrency: u32,
	/// JSON-encoded function configuration array, same shape as the HTTP
	/// register request.
	#[prost(bytes = "vec", tag = "8")]
	pub functions: Vec<u8>,
	/// JSON-encoded capability map.
	#[prost(bytes = "vec", tag = "9")]
	pub capabilities: Vec<u8>,
}

/// One invocation to execute, pushed by the gateway.
#[derive(Clone, PartialEq, Message)]
pub struct GatewayExecutorRequestData {
	/// Identifies this delivery for `SdkAck` and the reply.
	#[prost(string, tag = "1")]
	pub request_id: String,
	#[prost(string, tag = "2")]
	pub function_slug: String,
	/// Orchestrator request body, identical to the HTTP invoke body.
	#[prost(bytes = "vec", tag = "3")]
	pub request_payload: Vec<u8>,
	#[prost(string, optional, tag = "4")]
	pub app_id: Option<String>,
	/// Request-body signature, same header value as the HTTP transport.
	#[prost(string, optional, tag = "5")]
	pub signature: Option<String>,
}

/// Completion of one executor request.
#[derive(Clone, PartialEq, Message)]
pub struct WorkerReplyData {
	#[prost(string, tag = "1")]
	pub request_id: String,
	/// HTTP-equivalent status for the invocation outcome.
	#[prost(uint32, tag = "2")]
	pub status: u32,
	#[prost(bytes = "vec", tag = "3")]
	pub body: Vec<u8>,
	#[prost(bool, tag = "4")]
	pub no_retry: bool,
	/// RFC 3339, set when the orchestrator should delay the next attempt.
	#[prost(string, optional, tag = "5")]
	pub retry_at: Option<String>,
}

/// Ack payload, used by `SdkAck` and `WorkerReplyAck`.
#[derive(Clone, PartialEq, Message)]
pub struct AckData {
	#[prost(string, tag = "1")]
	pub request_id: String,
}

/// Periodic liveness payload for both heartbeat directions.
#[derive(Clone, PartialEq, Message)]
pub struct HeartbeatData {
	#[prost(int64, tag = "1")]
	pub ts: i64,
}

pub fn worker_connect(data: &WorkerConnectData) -> ConnectMessage {
	ConnectMessage::new(MessageKind::WorkerConnect, data.encode_to_vec())
}

pub fn worker_heartbeat(ts: i64) -> ConnectMessage {
	ConnectMessage::new(MessageKind::WorkerHeartbeat, HeartbeatData { ts }.encode_to_vec())
}

pub fn worker_pause() -> ConnectMessage {
	ConnectMessage::new(MessageKind::WorkerPause, Vec::new())
}

pub fn worker_reply(data: &WorkerReplyData) -> ConnectMessage {
	ConnectMessage::new(MessageKind::WorkerReply, data.encode_to_vec())
}

pub fn sdk_ack(request_id: &str) -> ConnectMessage {
	ConnectMessage::new(
		MessageKind::SdkAck,
		AckData {
			request_id: request_id.to_string(),
		}
		.encode_to_vec(),
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn frame_round_trip() {
		let msg = worker_reply(&WorkerReplyData {
			request_id: "req-1".to_string(),
			status: 206,
			body: b"[]".to_vec(),
			no_retry: false,
			retry_at: None,
		});

		let decoded = ConnectMessage::decode_frame(&msg.encode_frame()).unwrap();
		assert_eq!(decoded.kind(), MessageKind::WorkerReply);

		let reply = WorkerReplyData::decode(&decoded.payload[..]).unwrap();
		assert_eq!(reply.request_id, "req-1");
		assert_eq!(reply.status, 206);
	}

	#[test]
	fn unknown_kind_is_unspecified() {
		let msg = ConnectMessage {
			kind: 999,
			payload: Vec::new(),
		};

		assert_eq!(msg.kind(), MessageKind::Unspecified);
	}
}
