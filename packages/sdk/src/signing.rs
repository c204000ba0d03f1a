use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature on requests and responses.
pub const SIGNATURE_HEADER: &str = "X-Inngest-Signature";

/// Maximum accepted skew between a signature timestamp and local time.
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(5 * 60);

const KEY_PREFIXES: [&str; 2] = ["signkey-test-", "signkey-prod-"];

/// Strips the environment prefix and hex-decodes the remaining key material.
pub fn normalize_key(key: &str) -> Result<Vec<u8>> {
	let stripped = KEY_PREFIXES
		.iter()
		.find_map(|prefix| key.strip_prefix(prefix))
		.unwrap_or(key);

	hex::decode(stripped).context("signing key is not valid hex")
}

/// Sha256 of the normalized key material, hex encoded. Exposed by signed
/// introspection so operators can verify which key a worker holds.
pub fn hashed_key(key: &str) -> Result<String> {
	let material = normalize_key(key)?;
	Ok(hex::encode(Sha256::digest(&material)))
}

/// Signs `body`, producing a `t={unix}&s={hex}` header value.
pub fn sign(body: &[u8], key: &str, unix_ts: i64) -> Result<String> {
	let material = normalize_key(key)?;

	let mut mac = HmacSha256::new_from_slice(&material).context("failed to build hmac")?;
	mac.update(body);
	mac.update(unix_ts.to_string().as_bytes());

	Ok(format!(
		"t={}&s={}",
		unix_ts,
		hex::encode(mac.finalize().into_bytes())
	))
}

/// Validates a signature header against one key. Comparison is constant
/// time via the mac verification.
fn validate_with_key(body: &[u8], key: &str, ts: i64, sig: &[u8]) -> Result<()> {
	let material = normalize_key(key)?;

	let mut mac = HmacSha256::new_from_slice(&material).context("failed to build hmac")?;
	mac.update(body);
	mac.update(ts.to_string().as_bytes());

	mac.verify_slice(sig).context("signature mismatch")?;
	Ok(())
}

fn parse_header(header: &str) -> Result<(i64, Vec<u8>)> {
	let mut ts = None;
	let mut sig = None;

	for pair in header.split('&') {
		match pair.split_once('=') {
			Some(("t", v)) => ts = Some(v.parse::<i64>().context("malformed signature timestamp")?),
			Some(("s", v)) => sig = Some(hex::decode(v).context("malformed signature hex")?),
			_ => {}
		}
	}

	match (ts, sig) {
		(Some(ts), Some(sig)) => Ok((ts, sig)),
		_ => bail!("malformed signature header"),
	}
}

/// Validates `header` against the primary key, then the fallback. Returns
/// the key that matched so the response can be signed with the same key.
pub fn validate(
	body: &[u8],
	header: &str,
	key: &str,
	fallback: Option<&str>,
	now_unix: i64,
) -> Result<String> {
	let (ts, sig) = parse_header(header)?;

	if (now_unix - ts).unsigned_abs() > FRESHNESS_WINDOW.as_secs() {
		bail!("signature timestamp outside the freshness window");
	}

	if validate_with_key(body, key, ts, &sig).is_ok() {
		return Ok(key.to_string());
	}

	if let Some(fallback) = fallback {
		validate_with_key(body, fallback, ts, &sig)
			.context("signature did not match the primary or fallback key")?;
		return Ok(fallback.to_string());
	}

	bail!("signature did not match the signing key")
}

/// Shared "use the fallback key first" state.
///
/// Once any call succeeded with the fallback, subsequent calls start with it
/// instead of retrying the primary each time.
#[derive(Default)]
pub struct KeyRotation {
	use_fallback: AtomicBool,
}

impl KeyRotation {
	pub fn new() -> Self {
		Self::default()
	}

	/// Keys in the order they should be attempted.
	pub fn order<'a>(&self, primary: &'a str, fallback: Option<&'a str>) -> Vec<&'a str> {
		match fallback {
			Some(fallback) if self.use_fallback.load(Ordering::Relaxed) => {
				vec![fallback, primary]
			}
			Some(fallback) => vec![primary, fallback],
			None => vec![primary],
		}
	}

	/// Records that a call succeeded with the given key.
	pub fn mark_success(&self, key: &str, primary: &str) {
		self.use_fallback.store(key != primary, Ordering::Relaxed);
	}

	pub fn using_fallback(&self) -> bool {
		self.use_fallback.load(Ordering::Relaxed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const KEY: &str = "signkey-test-d5a63661cb4b94b2f0dcbcc4add0a0f7a2f06d3cdd3e2aafde5fed35a2a5d50a";
	const FALLBACK: &str =
		"signkey-test-9c9b55b4b9b9da259e9ab48d529e2ddbd97e1cb736459b54fe26c2e1286516ad";

	#[test]
	fn sign_then_validate_accepts() {
		let body = br#"{"event":{"name":"a/b"}}"#;
		let header = sign(body, KEY, 1_700_000_000).unwrap();

		let matched = validate(body, &header, KEY, None, 1_700_000_010).unwrap();
		assert_eq!(matched, KEY);
	}

	#[test]
	fn stale_signature_rejected() {
		let body = b"{}";
		let header = sign(body, KEY, 1_700_000_000).unwrap();

		let res = validate(body, &header, KEY, None, 1_700_000_000 + 600);
		assert!(res.is_err());
	}

	#[test]
	fn fallback_key_matches() {
		let body = b"{}";
		let header = sign(body, FALLBACK, 1_700_000_000).unwrap();

		let matched = validate(body, &header, KEY, Some(FALLBACK), 1_700_000_001).unwrap();
		assert_eq!(matched, FALLBACK);
	}

	#[test]
	fn tampered_body_rejected() {
		let header = sign(b"{}", KEY, 1_700_000_000).unwrap();
		assert!(validate(b"{ }", &header, KEY, Some(FALLBACK), 1_700_000_001).is_err());
	}

	#[test]
	fn malformed_header_rejected() {
		assert!(validate(b"{}", "t=abc&s=zz", KEY, None, 0).is_err());
		assert!(validate(b"{}", "nonsense", KEY, None, 0).is_err());
	}

	#[test]
	fn rotation_flag_flips_order() {
		let rotation = KeyRotation::new();
		assert_eq!(rotation.order(KEY, Some(FALLBACK)), vec![KEY, FALLBACK]);

		rotation.mark_success(FALLBACK, KEY);
		assert!(rotation.using_fallback());
		assert_eq!(rotation.order(KEY, Some(FALLBACK)), vec![FALLBACK, KEY]);

		rotation.mark_success(KEY, KEY);
		assert!(!rotation.using_fallback());
	}
}
