use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use inngest::config::Config;
use inngest_protocol::{ConnectMessage, MessageKind, WorkerConnectData, WS_SUBPROTOCOL};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use ulid::Ulid;

use crate::errors::ConnectError;
use crate::hosts::HostsManager;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
const READY_TIMEOUT: Duration = Duration::from_secs(20);

pub type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
pub type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Shared write half of a gateway socket. In-flight executor requests hold
/// a clone so their replies land on the connection they arrived on, even
/// after a drain established a newer one.
#[derive(Clone)]
pub struct WsHandle {
	tx: Arc<tokio::sync::Mutex<WsSink>>,
}

impl WsHandle {
	pub(crate) fn new(tx: WsSink) -> Self {
		WsHandle {
			tx: Arc::new(tokio::sync::Mutex::new(tx)),
		}
	}

	pub async fn send_binary(&self, buf: Vec<u8>) -> Result<()> {
		self.tx
			.lock()
			.await
			.send(Message::Binary(buf))
			.await
			.context("failed to write to gateway socket")
	}

	/// Closes the socket with a normal-closure frame.
	pub async fn close_normal(&self) -> Result<()> {
		self.tx
			.lock()
			.await
			.send(Message::Close(Some(CloseFrame {
				code: CloseCode::Normal,
				reason: "".into(),
			})))
			.await
			.context("failed to close gateway socket")
	}
}

/// One established, ready gateway connection.
pub struct GatewayConnection {
	/// New for every (re)connection attempt.
	pub connection_id: Ulid,
	pub host: String,
	pub ws: WsHandle,
	pub rx: WsStream,
}

/// Dials a selectable host and runs the handshake to `Ready`:
/// dial → `GATEWAY_HELLO` → `WORKER_CONNECT` → `GATEWAY_CONNECTION_READY`.
///
/// Hosts that fail are marked unreachable and the next one is tried; once
/// every host is excluded this returns [`ConnectError::NoReachableHost`]
/// and the caller decides when to reset the exclusion list.
#[tracing::instrument(skip_all)]
pub async fn prepare_connection(
	config: &Config,
	hosts: &HostsManager,
	connect_data: &WorkerConnectData,
) -> Result<GatewayConnection> {
	loop {
		let Some(host) = hosts.select() else {
			return Err(ConnectError::NoReachableHost.into());
		};

		match establish(config, &host, connect_data).await {
			Ok(conn) => return Ok(conn),
			Err(err) => {
				tracing::warn!(%host, ?err, "failed to establish gateway connection");
				hosts.mark_unreachable(&host);
			}
		}
	}
}

async fn establish(
	config: &Config,
	host: &str,
	connect_data: &WorkerConnectData,
) -> Result<GatewayConnection> {
	let connection_id = Ulid::new();

	let mut request = host
		.into_client_request()
		.context("invalid gateway host url")?;
	request.headers_mut().insert(
		"Sec-WebSocket-Protocol",
		HeaderValue::from_static(WS_SUBPROTOCOL),
	);

	let mut ws_config = WebSocketConfig::default();
	ws_config.max_message_size = config.message_read_limit();
	ws_config.max_frame_size = config.message_read_limit();

	let (stream, _response) = tokio::time::timeout(
		DIAL_TIMEOUT,
		connect_async_with_config(request, Some(ws_config), false),
	)
	.await
	.map_err(|_| ConnectError::HandshakeTimeout("dial"))?
	.context("failed to dial gateway")?;

	let (tx, mut rx) = stream.split();
	let ws = WsHandle::new(tx);

	// Hello phase.
	let hello = recv_frame(&mut rx, HELLO_TIMEOUT, "GATEWAY_HELLO").await?;
	if hello.kind() != MessageKind::GatewayHello {
		return Err(ConnectError::InvalidHandshakePacket(format!(
			"expected GATEWAY_HELLO, got {:?}",
			hello.kind()
		))
		.into());
	}

	// Authenticate the session.
	let mut connect_data = connect_data.clone();
	connect_data.connection_id = connection_id.to_string();
	ws.send_binary(inngest_protocol::worker_connect(&connect_data).encode_frame())
		.await?;

	// Ready phase.
	let ready = recv_frame(&mut rx, READY_TIMEOUT, "GATEWAY_CONNECTION_READY").await?;
	if ready.kind() != MessageKind::GatewayConnectionReady {
		return Err(ConnectError::InvalidHandshakePacket(format!(
			"expected GATEWAY_CONNECTION_READY, got {:?}",
			ready.kind()
		))
		.into());
	}

	tracing::info!(%host, %connection_id, "gateway connection ready");

	Ok(GatewayConnection {
		connection_id,
		host: host.to_string(),
		ws,
		rx,
	})
}

async fn recv_frame(rx: &mut WsStream, timeout: Duration, phase: &'static str) -> Result<ConnectMessage> {
	loop {
		let msg = tokio::time::timeout(timeout, rx.next())
			.await
			.map_err(|_| ConnectError::HandshakeTimeout(phase))?
			.ok_or(ConnectError::ConnectionClosed)?
			.context("gateway socket error during handshake")?;

		match msg {
			Message::Binary(buf) => return ConnectMessage::decode_frame(&buf),
			Message::Close(_) => return Err(ConnectError::ConnectionClosed.into()),
			other => {
				tracing::debug!(?other, "ignoring non-binary frame during handshake");
			}
		}
	}
}
