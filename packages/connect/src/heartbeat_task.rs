use std::sync::Arc;
use std::time::Duration;

use inngest_protocol as protocol;
use tokio::sync::watch;

use crate::buffer::MessageBuffer;
use crate::conn::WsHandle;

/// Periodic `WORKER_HEARTBEAT` sender for one connection. Write failures
/// are logged but never tear the connection down; the read loop detects
/// real loss. Each tick also drains any re-buffered messages.
#[tracing::instrument(skip_all)]
pub async fn task(
	ws: WsHandle,
	buffer: Arc<MessageBuffer>,
	interval: Duration,
	mut abort_rx: watch::Receiver<()>,
) {
	loop {
		tokio::select! {
			_ = tokio::time::sleep(interval) => {}
			_ = abort_rx.changed() => {
				tracing::debug!("heartbeat task aborted");
				return;
			}
		}

		let msg = protocol::worker_heartbeat(chrono::Utc::now().timestamp_millis());
		if let Err(err) = ws.send_binary(msg.encode_frame()).await {
			tracing::warn!(?err, "failed to send worker heartbeat");
		}

		if buffer.buffered_len() > 0 {
			if let Err(err) = buffer.flush(&ws).await {
				tracing::warn!(?err, "failed to flush buffered messages");
			}
		}
	}
}
