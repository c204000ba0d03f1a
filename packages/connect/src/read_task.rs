use anyhow::{Context, Result};
use inngest_protocol::{AckData, ConnectMessage, GatewayExecutorRequestData, MessageKind};
use prost::Message as _;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

use crate::buffer::MessageBuffer;
use crate::conn::{WsHandle, WsStream};
use crate::errors::ConnectError;
use crate::pool::{ExecutorJob, WorkerPool};

/// Why the read loop returned without an error.
#[derive(Debug)]
pub enum ReadOutcome {
	/// Socket closed or stream ended.
	Closed,
	/// Parent asked the loop to stop.
	Aborted,
}

/// Single-task frame reader for one gateway connection.
///
/// Unknown kinds are logged and ignored. Read errors bubble up so the
/// worker reconnects; `GATEWAY_CLOSING` returns the draining sentinel so
/// the worker fails over instead.
#[tracing::instrument(skip_all)]
pub async fn task(
	rx: &mut WsStream,
	ws: WsHandle,
	pool: &WorkerPool,
	buffer: &Arc<MessageBuffer>,
	mut abort_rx: watch::Receiver<()>,
) -> Result<ReadOutcome> {
	use futures_util::StreamExt;

	loop {
		let msg = tokio::select! {
			msg = rx.next() => msg,
			_ = abort_rx.changed() => {
				tracing::debug!("read loop aborted");
				return Ok(ReadOutcome::Aborted);
			}
		};

		let Some(msg) = msg else {
			tracing::debug!("gateway socket stream ended");
			return Ok(ReadOutcome::Closed);
		};

		let buf = match msg.context("gateway socket read error")? {
			Message::Binary(buf) => buf,
			Message::Close(frame) => {
				tracing::debug!(?frame, "gateway closed the socket");
				return Ok(ReadOutcome::Closed);
			}
			other => {
				tracing::trace!(?other, "ignoring non-binary frame");
				continue;
			}
		};

		let frame = match ConnectMessage::decode_frame(&buf) {
			Ok(frame) => frame,
			Err(err) => {
				tracing::warn!(?err, len = buf.len(), "failed to decode gateway frame");
				continue;
			}
		};

		match frame.kind() {
			MessageKind::GatewayExecutorRequest => {
				let request = match GatewayExecutorRequestData::decode(&frame.payload[..]) {
					Ok(request) => request,
					Err(err) => {
						tracing::warn!(?err, "failed to decode executor request");
						continue;
					}
				};

				if let Err(err) = pool.add(ExecutorJob {
					request,
					ws: ws.clone(),
				}) {
					// The gateway redelivers unacked requests, so dropping
					// here is safe.
					tracing::warn!(?err, "failed to enqueue executor request");
				}
			}
			MessageKind::WorkerReplyAck => match AckData::decode(&frame.payload[..]) {
				Ok(ack) => {
					if !buffer.acknowledge(&ack.request_id) {
						tracing::debug!(
							request_id = %ack.request_id,
							"ack for a message that is no longer pending"
						);
					}
				}
				Err(err) => {
					tracing::warn!(?err, "failed to decode reply ack");
				}
			},
			MessageKind::GatewayClosing => {
				tracing::info!("gateway announced drain");
				return Err(ConnectError::GatewayDraining.into());
			}
			MessageKind::GatewayHeartbeat => {
				tracing::trace!("gateway heartbeat");
			}
			kind => {
				tracing::debug!(?kind, "ignoring unexpected message kind");
			}
		}
	}
}
