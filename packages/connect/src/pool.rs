use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use inngest::dispatch::Dispatcher;
use inngest_protocol::{self as protocol, GatewayExecutorRequestData, WorkerReplyData};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::buffer::MessageBuffer;
use crate::conn::WsHandle;
use crate::errors::ConnectError;

/// How long a reply may sit unacknowledged before it is re-buffered.
const REPLY_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// One executor request plus the socket it arrived on. Replies are written
/// to that socket even if the worker has failed over since.
pub struct ExecutorJob {
	pub request: GatewayExecutorRequestData,
	pub ws: WsHandle,
}

/// Counts in-flight handlers so shutdown can wait for them.
#[derive(Default)]
struct InProgress {
	count: AtomicUsize,
	notify: Notify,
}

impl InProgress {
	fn start(&self) {
		self.count.fetch_add(1, Ordering::AcqRel);
	}

	fn finish(&self) {
		if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
			self.notify.notify_waiters();
		}
	}

	async fn wait_idle(&self) {
		if self.count.load(Ordering::Acquire) == 0 {
			return;
		}

		loop {
			self.notify.notified().await;
			if self.count.load(Ordering::Acquire) == 0 {
				break;
			}
		}
	}
}

/// Fixed-concurrency set of workers draining a bounded queue of executor
/// requests. Started when a connection reaches ready, stopped once at
/// worker shutdown.
pub struct WorkerPool {
	tx: std::sync::Mutex<Option<mpsc::Sender<ExecutorJob>>>,
	in_progress: Arc<InProgress>,
	workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
	pub fn new(
		concurrency: usize,
		dispatcher: Arc<Dispatcher>,
		buffer: Arc<MessageBuffer>,
	) -> Self {
		let concurrency = concurrency.max(1);
		let (tx, rx) = mpsc::channel::<ExecutorJob>(concurrency * 2);
		let rx = Arc::new(tokio::sync::Mutex::new(rx));
		let in_progress = Arc::new(InProgress::default());

		let workers = (0..concurrency)
			.map(|worker_idx| {
				let rx = rx.clone();
				let dispatcher = dispatcher.clone();
				let buffer = buffer.clone();
				let in_progress = in_progress.clone();

				tokio::spawn(
					async move {
						loop {
							let job = { rx.lock().await.recv().await };
							let Some(job) = job else {
								break;
							};

							handle_job(&dispatcher, &buffer, job).await;
							in_progress.finish();
						}
					}
					.instrument(tracing::info_span!("executor_worker", worker_idx)),
				)
			})
			.collect();

		WorkerPool {
			tx: std::sync::Mutex::new(Some(tx)),
			in_progress,
			workers: std::sync::Mutex::new(workers),
		}
	}

	/// Non-blocking enqueue. The in-progress counter covers queued jobs so
	/// `wait` also drains the backlog.
	pub fn add(&self, job: ExecutorJob) -> Result<()> {
		let tx = self.tx.lock().expect("pool lock poisoned").clone();
		let Some(tx) = tx else {
			return Err(ConnectError::PoolQueueFull.into());
		};

		self.in_progress.start();
		if let Err(err) = tx.try_send(job) {
			self.in_progress.finish();
			tracing::warn!(?err, "executor queue full, dropping request for redelivery");
			return Err(ConnectError::PoolQueueFull.into());
		}

		Ok(())
	}

	/// Blocks until every queued and running handler has returned.
	pub async fn wait(&self) {
		self.in_progress.wait_idle().await;
	}

	/// Drains in-flight work and stops the workers.
	pub async fn shutdown(&self) {
		self.tx.lock().expect("pool lock poisoned").take();
		self.wait().await;

		let workers = std::mem::take(&mut *self.workers.lock().expect("pool lock poisoned"));
		for worker in workers {
			if let Err(err) = worker.await {
				tracing::error!(?err, "executor worker panicked");
			}
		}
	}
}

#[tracing::instrument(skip_all, fields(request_id = %job.request.request_id, fn_slug = %job.request.function_slug))]
async fn handle_job(dispatcher: &Dispatcher, buffer: &Arc<MessageBuffer>, job: ExecutorJob) {
	let request = job.request;

	// Ack receipt before doing any work so the gateway stops its
	// redelivery timer.
	if let Err(err) = job
		.ws
		.send_binary(protocol::sdk_ack(&request.request_id).encode_frame())
		.await
	{
		tracing::warn!(?err, "failed to ack executor request");
	}

	let res = dispatcher
		.invoke(
			&request.function_slug,
			&request.request_payload,
			request.signature.as_deref(),
		)
		.await;

	let reply = WorkerReplyData {
		request_id: request.request_id.clone(),
		status: res.status.http_status() as u32,
		body: res.body,
		no_retry: res.no_retry,
		retry_at: res.retry_at.map(|at| at.to_rfc3339()),
	};
	let msg = protocol::worker_reply(&reply);

	// Track the reply before writing it: if the socket dies mid-send, the
	// ack timeout re-buffers it for the next connection.
	buffer.add_pending(request.request_id.clone(), msg.clone(), REPLY_ACK_TIMEOUT);

	if let Err(err) = job.ws.send_binary(msg.encode_frame()).await {
		tracing::warn!(?err, "failed to send reply, leaving it buffered for redelivery");
	}
}
