use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use inngest_protocol::ConnectMessage;

use crate::conn::WsHandle;

/// Most attempts one flush call makes before giving up.
const MAX_FLUSH_ATTEMPTS: usize = 5;

#[derive(Default)]
struct BufferState {
	/// Not-yet-sent messages, in enqueue order.
	buffered: VecDeque<(String, ConnectMessage)>,
	/// Sent messages awaiting a gateway ack.
	pending_ack: HashMap<String, ConnectMessage>,
}

/// Outbound messages that need at-least-once delivery.
///
/// Every message is in exactly one of three states: queued in `buffered`,
/// awaiting ack in `pending_ack`, or acknowledged (gone). A pending message
/// whose ack does not arrive in time moves back to `buffered` for the next
/// flush.
#[derive(Default)]
pub struct MessageBuffer {
	state: Mutex<BufferState>,
	/// Serializes concurrent flush calls.
	flush_lock: tokio::sync::Mutex<()>,
}

impl MessageBuffer {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Enqueues a message for the next flush, dropping any pending-ack
	/// entry for the same id.
	pub fn append(&self, id: impl Into<String>, msg: ConnectMessage) {
		let id = id.into();
		let mut state = self.state.lock().expect("buffer lock poisoned");

		state.pending_ack.remove(&id);
		state.buffered.push_back((id, msg));
	}

	/// Marks a sent message as awaiting ack. After `timeout` without an
	/// ack the watcher moves it back to `buffered` and exits.
	pub fn add_pending(
		self: &Arc<Self>,
		id: impl Into<String>,
		msg: ConnectMessage,
		timeout: Duration,
	) {
		let id = id.into();

		{
			let mut state = self.state.lock().expect("buffer lock poisoned");
			state.buffered.retain(|(existing, _)| *existing != id);
			state.pending_ack.insert(id.clone(), msg);
		}

		let buffer = self.clone();
		tokio::spawn(async move {
			tokio::time::sleep(timeout).await;

			let mut state = buffer.state.lock().expect("buffer lock poisoned");
			if let Some(msg) = state.pending_ack.remove(&id) {
				tracing::debug!(%id, "ack timeout, re-buffering message");
				state.buffered.push_back((id, msg));
			}
		});
	}

	/// Removes a pending message; true if it was still pending.
	pub fn acknowledge(&self, id: &str) -> bool {
		self.state
			.lock()
			.expect("buffer lock poisoned")
			.pending_ack
			.remove(id)
			.is_some()
	}

	/// Sends every buffered message in order. Failed sends are retried
	/// whole-batch up to [`MAX_FLUSH_ATTEMPTS`] times.
	pub async fn flush(&self, ws: &WsHandle) -> Result<()> {
		let _guard = self.flush_lock.lock().await;

		for _attempt in 0..MAX_FLUSH_ATTEMPTS {
			let batch: Vec<(String, ConnectMessage)> = {
				let mut state = self.state.lock().expect("buffer lock poisoned");
				state.buffered.drain(..).collect()
			};

			if batch.is_empty() {
				return Ok(());
			}

			// Collect failures into a fresh list; once a send fails, the
			// rest of the batch is carried over untouched to preserve order.
			let mut failed = Vec::new();
			for (id, msg) in batch {
				if !failed.is_empty() {
					failed.push((id, msg));
					continue;
				}

				if let Err(err) = ws.send_binary(msg.encode_frame()).await {
					tracing::warn!(%id, ?err, "failed to flush buffered message");
					failed.push((id, msg));
				}
			}

			if failed.is_empty() {
				return Ok(());
			}

			// Re-enqueue ahead of anything appended while we were sending.
			let mut state = self.state.lock().expect("buffer lock poisoned");
			for entry in failed.into_iter().rev() {
				state.buffered.push_front(entry);
			}
		}

		let remaining = self.buffered_len();
		bail!("could not send {remaining} buffered messages")
	}

	pub fn buffered_len(&self) -> usize {
		self.state.lock().expect("buffer lock poisoned").buffered.len()
	}

	pub fn pending_len(&self) -> usize {
		self.state.lock().expect("buffer lock poisoned").pending_ack.len()
	}

	pub fn is_empty(&self) -> bool {
		let state = self.state.lock().expect("buffer lock poisoned");
		state.buffered.is_empty() && state.pending_ack.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use inngest_protocol::MessageKind;

	fn msg(n: u8) -> ConnectMessage {
		ConnectMessage::new(MessageKind::WorkerReply, vec![n])
	}

	#[test]
	fn message_is_in_exactly_one_state() {
		let buffer = MessageBuffer::new();

		buffer.append("m1", msg(1));
		assert_eq!(buffer.buffered_len(), 1);
		assert_eq!(buffer.pending_len(), 0);

		// Appending an id drops its pending entry.
		{
			let mut state = buffer.state.lock().unwrap();
			state.pending_ack.insert("m2".to_string(), msg(2));
		}
		buffer.append("m2", msg(2));
		assert_eq!(buffer.buffered_len(), 2);
		assert_eq!(buffer.pending_len(), 0);
	}

	#[tokio::test]
	async fn ack_timeout_moves_pending_back_to_buffered() {
		tokio::time::pause();

		let buffer = MessageBuffer::new();
		buffer.add_pending("m1", msg(1), Duration::from_secs(5));
		assert_eq!(buffer.pending_len(), 1);

		tokio::time::advance(Duration::from_secs(6)).await;
		// Let the watcher task run.
		tokio::task::yield_now().await;

		assert_eq!(buffer.pending_len(), 0);
		assert_eq!(buffer.buffered_len(), 1);
	}

	#[tokio::test]
	async fn acknowledge_prevents_rebuffering() {
		tokio::time::pause();

		let buffer = MessageBuffer::new();
		buffer.add_pending("m1", msg(1), Duration::from_secs(5));

		assert!(buffer.acknowledge("m1"));
		assert!(!buffer.acknowledge("m1"));

		tokio::time::advance(Duration::from_secs(6)).await;
		tokio::task::yield_now().await;

		assert!(buffer.is_empty());
	}

	#[tokio::test]
	async fn flush_gives_up_after_bounded_attempts() {
		use futures_util::StreamExt;

		// A socket whose close handshake has completed fails every send.
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();

		let server = tokio::spawn(async move {
			let (stream, _) = listener.accept().await.unwrap();
			let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
			let _ = ws.close(None).await;
			while let Some(Ok(_)) = ws.next().await {}
		});

		let (stream, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
			.await
			.unwrap();
		let (tx, mut rx) = stream.split();
		let ws = WsHandle::new(tx);

		// Drain the close frame so the shared protocol state is closed.
		while let Some(Ok(_)) = rx.next().await {}
		server.await.unwrap();

		let buffer = MessageBuffer::new();
		buffer.append("m1", msg(1));
		buffer.append("m2", msg(2));

		let err = buffer.flush(&ws).await.unwrap_err();
		assert!(
			err.to_string().contains("could not send 2 buffered messages"),
			"unexpected error: {err}"
		);

		// The messages stay queued for the next connection.
		assert_eq!(buffer.buffered_len(), 2);
	}
}
