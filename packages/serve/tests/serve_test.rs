use std::sync::{Arc, Mutex};

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use chrono::Utc;
use tower::ServiceExt;

use inngest::config::Config;
use inngest::dispatch::Dispatcher;
use inngest::error::no_retry;
use inngest::event::Event;
use inngest::function::{Function, FunctionBuilder, Trigger};
use inngest::registry::FunctionRegistry;
use inngest::signing;

const PRIMARY: &str =
	"signkey-prod-8f3a2b1c4d5e6f708192a3b4c5d6e7f8091a2b3c4d5e6f708192a3b4c5d6e7f8";
const FALLBACK: &str =
	"signkey-prod-00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

fn hello_function() -> Function {
	FunctionBuilder::new("hello")
		.trigger(Trigger::event("test/hello"))
		.build::<Event, _, _, _>(|ctx, _input| async move {
			let greeting: serde_json::Value = ctx
				.run("greet", || async { Ok(serde_json::json!({"greeting": "hi"})) })
				.await?;
			Ok(greeting)
		})
		.unwrap()
}

fn dispatcher_with(config: Config, functions: Vec<Function>) -> Arc<Dispatcher> {
	let registry = Arc::new(FunctionRegistry::new());
	for function in functions {
		registry.add(function).unwrap();
	}

	Arc::new(Dispatcher::new(config, registry))
}

fn invoke_body() -> Vec<u8> {
	serde_json::to_vec(&serde_json::json!({
		"event": {"name": "test/hello", "data": {}},
		"steps": {},
		"ctx": {"fn_id": "hello", "run_id": "run-1", "attempt": 0},
	}))
	.unwrap()
}

#[tokio::test]
async fn introspection_without_signature_is_minimal() {
	let mut config = Config::new("app");
	config.dev = Some(true);

	let router = inngest_serve::router(dispatcher_with(config, vec![hello_function()]));

	let res = router
		.oneshot(
			Request::builder()
				.method("GET")
				.uri("/api/inngest")
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.unwrap();

	assert_eq!(res.status(), StatusCode::OK);

	let body: serde_json::Value =
		serde_json::from_slice(&to_bytes(res.into_body(), usize::MAX).await.unwrap()).unwrap();
	assert_eq!(body["function_count"], 1);
	assert_eq!(body["mode"], "dev");
	assert!(body.get("signing_key_hash").is_none());
}

#[tokio::test]
async fn invoke_routes_to_dispatcher() {
	let mut config = Config::new("app");
	config.dev = Some(true);

	let router = inngest_serve::router(dispatcher_with(config, vec![hello_function()]));

	let res = router
		.oneshot(
			Request::builder()
				.method("POST")
				.uri("/api/inngest?fnId=hello")
				.header("Content-Type", "application/json")
				.body(Body::from(invoke_body()))
				.unwrap(),
		)
		.await
		.unwrap();

	assert_eq!(res.status(), StatusCode::PARTIAL_CONTENT);

	let ops: Vec<serde_json::Value> =
		serde_json::from_slice(&to_bytes(res.into_body(), usize::MAX).await.unwrap()).unwrap();
	assert_eq!(ops.len(), 1);
	assert_eq!(ops[0]["op"], "StepRun");
	assert_eq!(ops[0]["data"], serde_json::json!({"greeting": "hi"}));
}

#[tokio::test]
async fn cloud_invoke_requires_signature_and_signs_response() {
	let mut config = Config::new("app");
	config.dev = Some(false);
	config.signing_key = Some(PRIMARY.to_string());

	let router = inngest_serve::router(dispatcher_with(config, vec![hello_function()]));

	// Unsigned request is rejected.
	let res = router
		.clone()
		.oneshot(
			Request::builder()
				.method("POST")
				.uri("/api/inngest?fnId=hello")
				.body(Body::from(invoke_body()))
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

	// Signed request goes through and the response is signed with the
	// same key.
	let body = invoke_body();
	let signature = signing::sign(&body, PRIMARY, Utc::now().timestamp()).unwrap();

	let res = router
		.oneshot(
			Request::builder()
				.method("POST")
				.uri("/api/inngest?fnId=hello")
				.header("X-Inngest-Signature", signature)
				.body(Body::from(body))
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(res.status(), StatusCode::PARTIAL_CONTENT);

	let response_signature = res
		.headers()
		.get("X-Inngest-Signature")
		.unwrap()
		.to_str()
		.unwrap()
		.to_string();
	let response_body = to_bytes(res.into_body(), usize::MAX).await.unwrap();

	signing::validate(
		&response_body,
		&response_signature,
		PRIMARY,
		None,
		Utc::now().timestamp(),
	)
	.expect("response must verify under the request's key");
}

#[tokio::test]
async fn error_responses_carry_retry_metadata() {
	let function = FunctionBuilder::new("permafail")
		.trigger(Trigger::event("test/hello"))
		.build::<Event, _, _, _>(|_ctx, _input| async move {
			Err::<serde_json::Value, _>(no_retry(anyhow::anyhow!("nope")))
		})
		.unwrap();

	let mut config = Config::new("app");
	config.dev = Some(true);

	let router = inngest_serve::router(dispatcher_with(config, vec![function]));

	let res = router
		.oneshot(
			Request::builder()
				.method("POST")
				.uri("/api/inngest?fnId=permafail")
				.body(Body::from(invoke_body()))
				.unwrap(),
		)
		.await
		.unwrap();

	assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
	assert_eq!(res.headers().get("X-Inngest-No-Retry").unwrap(), "true");

	let body: serde_json::Value =
		serde_json::from_slice(&to_bytes(res.into_body(), usize::MAX).await.unwrap()).unwrap();
	assert_eq!(body["message"], "error calling function: nope");
}

#[tokio::test]
async fn trust_probe_returns_signed_reply() {
	let mut config = Config::new("app");
	config.dev = Some(false);
	config.signing_key = Some(PRIMARY.to_string());

	let router = inngest_serve::router(dispatcher_with(config, vec![]));

	let signature = signing::sign(b"", PRIMARY, Utc::now().timestamp()).unwrap();
	let res = router
		.oneshot(
			Request::builder()
				.method("POST")
				.uri("/api/inngest?probe=trust")
				.header("X-Inngest-Signature", signature)
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.unwrap();

	assert_eq!(res.status(), StatusCode::OK);

	let reply_signature = res
		.headers()
		.get("X-Inngest-Signature")
		.unwrap()
		.to_str()
		.unwrap()
		.to_string();
	let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
	assert_eq!(&body[..], b"{}");

	signing::validate(&body, &reply_signature, PRIMARY, None, Utc::now().timestamp()).unwrap();
}

#[tokio::test]
async fn streaming_mode_wraps_result_in_envelope() {
	let mut config = Config::new("app");
	config.dev = Some(true);
	config.streaming = Some(true);

	let router = inngest_serve::router(dispatcher_with(config, vec![hello_function()]));

	let res = router
		.oneshot(
			Request::builder()
				.method("POST")
				.uri("/api/inngest?fnId=hello")
				.body(Body::from(invoke_body()))
				.unwrap(),
		)
		.await
		.unwrap();

	assert_eq!(res.status(), StatusCode::CREATED);

	let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
	let text = String::from_utf8(body.to_vec()).unwrap();
	let envelope: serde_json::Value = serde_json::from_str(text.trim_start()).unwrap();

	assert_eq!(envelope["status"], 206);
	assert_eq!(envelope["noRetry"], false);

	let ops: Vec<serde_json::Value> =
		serde_json::from_str(envelope["body"].as_str().unwrap()).unwrap();
	assert_eq!(ops[0]["op"], "StepRun");
}

/// Fake orchestrator that only accepts registrations signed with the
/// fallback key, recording which key each attempt used.
async fn orchestrator_register(
	State(log): State<Arc<Mutex<Vec<&'static str>>>>,
	headers: HeaderMap,
	body: Bytes,
) -> impl IntoResponse {
	let now = Utc::now().timestamp();
	let signature = headers
		.get("X-Inngest-Signature")
		.and_then(|value| value.to_str().ok())
		.unwrap_or_default()
		.to_string();

	let key = if signing::validate(&body, &signature, PRIMARY, None, now).is_ok() {
		"primary"
	} else if signing::validate(&body, &signature, FALLBACK, None, now).is_ok() {
		"fallback"
	} else {
		"none"
	};
	log.lock().unwrap().push(key);

	if key == "fallback" {
		(StatusCode::OK, "{}").into_response()
	} else {
		(
			StatusCode::UNAUTHORIZED,
			serde_json::json!({"error": "unauthorized"}).to_string(),
		)
			.into_response()
	}
}

#[tokio::test]
async fn registration_rotates_to_fallback_key_and_sticks() {
	let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

	let orchestrator = Router::new()
		.route("/fn/register", post(orchestrator_register))
		.with_state(log.clone());

	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		axum::serve(listener, orchestrator).await.unwrap();
	});

	let mut config = Config::new("app");
	config.dev = Some(false);
	config.signing_key = Some(PRIMARY.to_string());
	config.signing_key_fallback = Some(FALLBACK.to_string());
	config.api_base_url = Some(format!("http://{addr}"));
	config.serve_origin = Some("https://example.com".to_string());

	let dispatcher = dispatcher_with(config, vec![hello_function()]);
	let router = inngest_serve::router(dispatcher.clone());

	// First registration: 401 under the primary, accepted under the
	// fallback.
	let res = router
		.clone()
		.oneshot(
			Request::builder()
				.method("PUT")
				.uri("/api/inngest")
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(res.status(), StatusCode::OK);
	assert_eq!(*log.lock().unwrap(), vec!["primary", "fallback"]);
	assert!(dispatcher.rotation().using_fallback());

	// Second registration starts with the fallback key directly.
	let res = router
		.oneshot(
			Request::builder()
				.method("PUT")
				.uri("/api/inngest")
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(res.status(), StatusCode::OK);
	assert_eq!(*log.lock().unwrap(), vec!["primary", "fallback", "fallback"]);
}
