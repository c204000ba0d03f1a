#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
	/// Sentinel returned by the read loop on `GATEWAY_CLOSING`; triggers
	/// the draining failover instead of a plain reconnect.
	#[error("gateway is draining this connection")]
	GatewayDraining,
	#[error("gateway closed the connection")]
	ConnectionClosed,
	#[error("timed out waiting for {0}")]
	HandshakeTimeout(&'static str),
	#[error("invalid handshake packet: {0}")]
	InvalidHandshakePacket(String),
	#[error("no reachable gateway host")]
	NoReachableHost,
	#[error("worker pool queue is full")]
	PoolQueueFull,
}

/// True if the error chain carries the draining sentinel.
pub fn is_draining(err: &anyhow::Error) -> bool {
	err.chain()
		.any(|cause| matches!(cause.downcast_ref::<ConnectError>(), Some(ConnectError::GatewayDraining)))
}
