//! HTTP handler-mode transport.
//!
//! Serves the introspect / register / invoke / trust-probe endpoints on
//! one path, handing invocations to the shared dispatcher. Stateless: all
//! run state lives with the orchestrator.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;

use inngest::apiclient::ApiClient;
use inngest::dispatch::Dispatcher;
use inngest::register;
use inngest::request::{SdkResponse, StreamEnvelope};
use inngest::signing::{self, SIGNATURE_HEADER};

/// Interval between whitespace keepalives in streaming mode.
const STREAM_KEEPALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

const HEADER_NO_RETRY: &str = "X-Inngest-No-Retry";
const HEADER_RETRY_AFTER: &str = "Retry-After";
const HEADER_SDK: &str = "X-Inngest-SDK";

struct ServeState {
	dispatcher: Arc<Dispatcher>,
	api: ApiClient,
}

/// Builds the serve router mounted at the configured serve path.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
	let path = dispatcher.config().serve_path();
	let api = ApiClient::new(
		dispatcher.config().clone(),
		dispatcher.rotation().clone(),
	);

	let state = Arc::new(ServeState { dispatcher, api });

	Router::new()
		.route(&path, get(introspect).put(register_app).post(invoke))
		.with_state(state)
}

fn sdk_header() -> String {
	format!("{}:v{}", register::SDK_LANGUAGE, register::SDK_VERSION)
}

/// Validates a signature over `body` for non-invoke endpoints. `Ok(None)`
/// in dev mode or with no signature header present.
fn validate_optional_signature(
	state: &ServeState,
	headers: &HeaderMap,
	body: &[u8],
) -> anyhow::Result<Option<String>> {
	if state.dispatcher.config().is_dev() {
		return Ok(None);
	}

	let Some(header) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
		return Ok(None);
	};

	let config = state.dispatcher.config();
	let key = config
		.signing_key()
		.ok_or_else(|| anyhow::anyhow!("no signing key configured"))?;
	let fallback = config.signing_key_fallback();

	let matched = signing::validate(
		body,
		header,
		&key,
		fallback.as_deref(),
		Utc::now().timestamp(),
	)?;

	Ok(Some(matched))
}

/// `GET /{serve_path}`: introspection. A valid signature unlocks the
/// extended payload.
async fn introspect(State(state): State<Arc<ServeState>>, headers: HeaderMap) -> impl IntoResponse {
	let config = state.dispatcher.config();

	let mode = if config.is_dev() { "dev" } else { "cloud" };
	let mut body = serde_json::json!({
		"function_count": state.dispatcher.registry().len(),
		"has_event_key": config.event_key().is_some(),
		"has_signing_key": config.signing_key().is_some(),
		"mode": mode,
	});

	let signed = match validate_optional_signature(&state, &headers, b"") {
		Ok(matched) => matched.is_some(),
		Err(err) => {
			tracing::debug!(?err, "introspection signature invalid");
			false
		}
	};

	if signed {
		body["capabilities"] = serde_json::to_value(register::Capabilities::default())
			.unwrap_or(serde_json::Value::Null);
		body["signing_key_hash"] = config
			.signing_key()
			.and_then(|key| signing::hashed_key(&key).ok())
			.map(serde_json::Value::String)
			.unwrap_or(serde_json::Value::Null);
		body["signing_key_fallback_hash"] = config
			.signing_key_fallback()
			.and_then(|key| signing::hashed_key(&key).ok())
			.map(serde_json::Value::String)
			.unwrap_or(serde_json::Value::Null);
	}

	let sdk = sdk_header();
	(
		StatusCode::OK,
		[("Content-Type", "application/json"), (HEADER_SDK, sdk.as_str())],
		body.to_string(),
	)
		.into_response()
}

/// `PUT /{serve_path}`: pushes this app's function configuration to the
/// orchestrator.
async fn register_app(State(state): State<Arc<ServeState>>) -> impl IntoResponse {
	let request = register::register_request(
		state.dispatcher.registry(),
		state.dispatcher.config(),
	);

	match state.api.register(&request).await {
		Ok(()) => (
			StatusCode::OK,
			[("Content-Type", "application/json")],
			serde_json::json!({"message": "registered"}).to_string(),
		)
			.into_response(),
		Err(err) => {
			tracing::error!(?err, "registration failed");
			(
				StatusCode::INTERNAL_SERVER_ERROR,
				[("Content-Type", "application/json")],
				serde_json::json!({"error": err.to_string()}).to_string(),
			)
				.into_response()
		}
	}
}

/// `POST /{serve_path}`: invocation, or the trust probe when
/// `probe=trust` is set.
async fn invoke(
	State(state): State<Arc<ServeState>>,
	Query(params): Query<HashMap<String, String>>,
	headers: HeaderMap,
	body: Bytes,
) -> axum::response::Response {
	let signature = headers
		.get(SIGNATURE_HEADER)
		.and_then(|value| value.to_str().ok())
		.map(str::to_string);

	if params.get("probe").map(String::as_str) == Some("trust") {
		return trust_probe(&state, signature.as_deref(), &body).await;
	}

	let Some(fn_slug) = params.get("fnId").cloned() else {
		return (
			StatusCode::BAD_REQUEST,
			[("Content-Type", "application/json")],
			serde_json::json!({"message": "missing fnId"}).to_string(),
		)
			.into_response();
	};

	if state.dispatcher.config().streaming() {
		return invoke_streaming(state, fn_slug, body, signature).await;
	}

	let res = state
		.dispatcher
		.invoke(&fn_slug, &body, signature.as_deref())
		.await;

	sdk_response_to_http(&res)
}

/// `POST /{serve_path}?probe=trust`: validates the signature and returns
/// a signed empty body so the orchestrator can verify key possession.
async fn trust_probe(
	state: &ServeState,
	signature: Option<&str>,
	body: &[u8],
) -> axum::response::Response {
	let config = state.dispatcher.config();

	if config.is_dev() {
		return (
			StatusCode::OK,
			[("Content-Type", "application/json")],
			"{}",
		)
			.into_response();
	}

	let (Some(key), Some(header)) = (config.signing_key(), signature) else {
		return (
			StatusCode::UNAUTHORIZED,
			[("Content-Type", "application/json")],
			serde_json::json!({"message": "unauthorized"}).to_string(),
		)
			.into_response();
	};

	let fallback = config.signing_key_fallback();
	let matched = match signing::validate(
		body,
		header,
		&key,
		fallback.as_deref(),
		Utc::now().timestamp(),
	) {
		Ok(matched) => matched,
		Err(err) => {
			tracing::debug!(?err, "trust probe signature invalid");
			return (
				StatusCode::UNAUTHORIZED,
				[("Content-Type", "application/json")],
				serde_json::json!({"message": "unauthorized"}).to_string(),
			)
				.into_response();
		}
	};

	let reply_body = b"{}";
	let reply_signature = match signing::sign(reply_body, &matched, Utc::now().timestamp()) {
		Ok(signature) => signature,
		Err(err) => {
			tracing::error!(?err, "failed to sign trust probe reply");
			return (StatusCode::INTERNAL_SERVER_ERROR, "").into_response();
		}
	};

	(
		StatusCode::OK,
		[
			("Content-Type", "application/json"),
			(SIGNATURE_HEADER, reply_signature.as_str()),
		],
		"{}",
	)
		.into_response()
}

/// Maps a dispatcher response onto HTTP, attaching retry metadata and a
/// response signature when the request was signed.
fn sdk_response_to_http(res: &SdkResponse) -> axum::response::Response {
	let mut builder = Response::builder()
		.status(res.status.http_status())
		.header("Content-Type", "application/json")
		.header(HEADER_SDK, sdk_header());

	if res.no_retry {
		builder = builder.header(HEADER_NO_RETRY, "true");
	}
	if let Some(at) = res.retry_at {
		builder = builder.header(HEADER_RETRY_AFTER, at.to_rfc3339());
	}
	if let Some(key) = &res.signed_key {
		match signing::sign(&res.body, key, Utc::now().timestamp()) {
			Ok(signature) => {
				builder = builder.header(SIGNATURE_HEADER, signature);
			}
			Err(err) => {
				tracing::error!(?err, "failed to sign response body");
			}
		}
	}

	builder
		.body(Body::from(res.body.clone()))
		.unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Streaming mode: one framed envelope behind whitespace keepalives, so
/// proxies with short idle timeouts do not cut long invocations off.
async fn invoke_streaming(
	state: Arc<ServeState>,
	fn_slug: String,
	body: Bytes,
	signature: Option<String>,
) -> axum::response::Response {
	let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Bytes, std::convert::Infallible>>();

	tokio::spawn(async move {
		let mut invoke_fut = std::pin::pin!(state.dispatcher.invoke(
			&fn_slug,
			&body,
			signature.as_deref(),
		));

		let mut keepalive = tokio::time::interval(STREAM_KEEPALIVE_INTERVAL);
		keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		keepalive.tick().await;

		let res = loop {
			tokio::select! {
				res = &mut invoke_fut => break res,
				_ = keepalive.tick() => {
					if tx.unbounded_send(Ok(Bytes::from_static(b" "))).is_err() {
						// Client went away; finish the invocation anyway so
						// side effects are recorded.
						break invoke_fut.await;
					}
				}
			}
		};

		let mut envelope = StreamEnvelope::from_response(&res);
		if res.no_retry {
			envelope
				.headers
				.insert(HEADER_NO_RETRY.to_string(), "true".to_string());
		}
		if let Some(at) = res.retry_at {
			envelope
				.headers
				.insert(HEADER_RETRY_AFTER.to_string(), at.to_rfc3339());
		}
		if let Some(key) = &res.signed_key {
			if let Ok(signature) = signing::sign(&res.body, key, Utc::now().timestamp()) {
				envelope
					.headers
					.insert(SIGNATURE_HEADER.to_string(), signature);
			}
		}

		match serde_json::to_vec(&envelope) {
			Ok(encoded) => {
				let _ = tx.unbounded_send(Ok(Bytes::from(encoded)));
			}
			Err(err) => {
				tracing::error!(?err, "failed to encode stream envelope");
			}
		}
	});

	Response::builder()
		.status(StatusCode::CREATED)
		.header("Content-Type", "application/json")
		.header(HEADER_SDK, sdk_header())
		.body(Body::from_stream(rx))
		.unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
