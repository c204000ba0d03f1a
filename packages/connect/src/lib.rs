//! Gateway worker: the long-lived bidirectional connection between this
//! process and the orchestrator's gateway.
//!
//! One connection at a time is ready; executor requests fan out to a
//! bounded worker pool and replies are delivered at-least-once through an
//! ack-tracked message buffer. A gateway-initiated drain opens the
//! replacement connection before the old socket closes, so in-flight
//! requests keep their reply path.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use inngest::dispatch::Dispatcher;
use inngest::register;
use inngest::signing;
use inngest_protocol::{self as protocol, WorkerConnectData};
use rand::Rng;
use tokio::sync::watch;
use ulid::Ulid;

mod buffer;
mod conn;
mod errors;
mod heartbeat_task;
mod hosts;
mod pool;
mod read_task;

pub use buffer::MessageBuffer;
pub use conn::{GatewayConnection, WsHandle};
pub use errors::ConnectError;
pub use hosts::HostsManager;
pub use pool::{ExecutorJob, WorkerPool};
pub use read_task::ReadOutcome;

const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);
const RECONNECT_MAX_EXPONENT: u32 = 5;

/// Options for [`connect`].
pub struct ConnectOpts {
	/// Gateway endpoints, e.g. `ws://gw-1.example.com/connect`.
	pub gateway_hosts: Vec<String>,
	/// Signalled (or dropped) to begin graceful shutdown.
	pub shutdown: watch::Receiver<()>,
}

/// Runs the worker until shutdown: connect, serve executor requests,
/// fail over on drains, reconnect on loss.
#[tracing::instrument(skip_all, fields(app_id = %dispatcher.config().app_id))]
pub async fn connect(dispatcher: Arc<Dispatcher>, opts: ConnectOpts) -> Result<()> {
	let config = dispatcher.config().clone();
	let hosts = HostsManager::new(opts.gateway_hosts);
	let buffer = MessageBuffer::new();
	let pool = Arc::new(WorkerPool::new(
		config.max_worker_concurrency(),
		dispatcher.clone(),
		buffer.clone(),
	));

	let connect_data = build_connect_data(&dispatcher)?;
	let mut shutdown = opts.shutdown;
	let mut reconnect_attempt: u32 = 0;
	let mut pending_conn: Option<GatewayConnection> = None;

	let final_ws = loop {
		let mut conn = match pending_conn.take() {
			Some(conn) => conn,
			None => {
				match prepare_with_retry(
					&config,
					&hosts,
					&connect_data,
					&mut shutdown,
					&mut reconnect_attempt,
				)
				.await
				{
					Some(conn) => conn,
					None => break None,
				}
			}
		};
		reconnect_attempt = 0;

		// Buffered messages from previous connections precede any new
		// output on this one.
		if let Err(err) = buffer.flush(&conn.ws).await {
			tracing::warn!(?err, "failed to flush buffer after connect");
		}

		let (heartbeat_abort_tx, heartbeat_abort_rx) = watch::channel(());
		let heartbeat = tokio::spawn(heartbeat_task::task(
			conn.ws.clone(),
			buffer.clone(),
			config.worker_heartbeat_interval(),
			heartbeat_abort_rx,
		));

		let (_read_abort_tx, read_abort_rx) = watch::channel(());
		let outcome = tokio::select! {
			res = read_task::task(&mut conn.rx, conn.ws.clone(), &pool, &buffer, read_abort_rx) => Some(res),
			_ = shutdown.changed() => None,
		};

		let _ = heartbeat_abort_tx.send(());
		let _ = heartbeat.await;

		match outcome {
			// Shutdown requested; pause on the connection we still hold.
			None => break Some(conn.ws),
			Some(Ok(outcome)) => {
				tracing::info!(?outcome, "gateway connection ended, reconnecting");
				hosts.mark_unreachable(&conn.host);
			}
			Some(Err(err)) if errors::is_draining(&err) => {
				hosts.mark_draining(&conn.host);

				// Establish the replacement through the normal prepare
				// flow and only then close the old socket. In-flight
				// requests hold their own handle to the old socket and
				// keep replying on it.
				match prepare_with_retry(
					&config,
					&hosts,
					&connect_data,
					&mut shutdown,
					&mut reconnect_attempt,
				)
				.await
				{
					Some(new_conn) => {
						tracing::info!(
							old_host = %conn.host,
							new_host = %new_conn.host,
							"drained to new gateway connection"
						);

						// Close the old socket only once its in-flight
						// handlers have posted their replies.
						let old_ws = conn.ws.clone();
						let pool = pool.clone();
						tokio::spawn(async move {
							pool.wait().await;
							if let Err(err) = old_ws.close_normal().await {
								tracing::debug!(?err, "failed to close drained connection");
							}
						});

						pending_conn = Some(new_conn);
					}
					None => break Some(conn.ws),
				}
			}
			Some(Err(err)) => {
				tracing::warn!(?err, "gateway read failed, reconnecting");
				hosts.mark_unreachable(&conn.host);
			}
		}
	};

	// Graceful shutdown: pause, wait for in-flight handlers, flush, close.
	tracing::info!("worker shutting down");
	if let Some(ws) = final_ws {
		if let Err(err) = ws
			.send_binary(protocol::worker_pause().encode_frame())
			.await
		{
			tracing::debug!(?err, "failed to send worker pause");
		}

		pool.shutdown().await;

		if let Err(err) = buffer.flush(&ws).await {
			tracing::warn!(?err, "failed to flush buffer during shutdown");
		}
		if let Err(err) = ws.close_normal().await {
			tracing::debug!(?err, "failed to close gateway socket");
		}
	} else {
		pool.shutdown().await;
	}

	tracing::info!("worker shutdown complete");
	Ok(())
}

/// Connects with exponential backoff until ready or shutdown. When every
/// host is excluded, the exclusion list is reset and selection starts
/// over.
async fn prepare_with_retry(
	config: &inngest::config::Config,
	hosts: &HostsManager,
	connect_data: &WorkerConnectData,
	shutdown: &mut watch::Receiver<()>,
	attempt: &mut u32,
) -> Option<GatewayConnection> {
	loop {
		if shutdown.has_changed().unwrap_or(true) {
			return None;
		}

		match conn::prepare_connection(config, hosts, connect_data).await {
			Ok(conn) => return Some(conn),
			Err(err) => {
				tracing::warn!(?err, "failed to connect to any gateway, retrying");
				hosts.reset();

				let delay = reconnect_backoff(*attempt);
				*attempt = attempt.saturating_add(1);

				tokio::select! {
					_ = tokio::time::sleep(delay) => {}
					_ = shutdown.changed() => return None,
				}
			}
		}
	}
}

fn reconnect_backoff(attempt: u32) -> Duration {
	let exp = attempt.min(RECONNECT_MAX_EXPONENT);
	let base = RECONNECT_BASE_DELAY * 2u32.pow(exp);
	let jitter = rand::thread_rng().gen_range(0..250);

	base + Duration::from_millis(jitter)
}

/// Session payload sent as `WORKER_CONNECT`. The connection id is replaced
/// with a fresh ULID on every (re)connection attempt.
fn build_connect_data(dispatcher: &Arc<Dispatcher>) -> Result<WorkerConnectData> {
	let config = dispatcher.config();

	let functions = serde_json::to_vec(&register::function_configs(
		dispatcher.registry(),
		config,
	))
	.context("failed to encode function configs")?;
	let capabilities = serde_json::to_vec(&register::Capabilities::default())
		.context("failed to encode capabilities")?;

	let auth_key_hash = match config.signing_key() {
		Some(key) => Some(signing::hashed_key(&key)?),
		None => None,
	};

	Ok(WorkerConnectData {
		connection_id: String::new(),
		instance_id: config
			.instance_id
			.clone()
			.unwrap_or_else(|| Ulid::new().to_string()),
		app_name: config.app_id.clone(),
		env: config.env_name(),
		sdk_version: format!("{}:v{}", register::SDK_LANGUAGE, register::SDK_VERSION),
		auth_key_hash,
		worker_concurrency: config.max_worker_concurrency() as u32,
		functions,
		capabilities,
	})
}
