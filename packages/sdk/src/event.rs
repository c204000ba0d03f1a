use serde::{Deserialize, Serialize};

/// An event as sent to and received from the event API.
///
/// This is the default, untyped event shape. Functions that declare a
/// concrete event type decode from this via its JSON representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	pub name: String,
	#[serde(default)]
	pub data: serde_json::Value,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user: Option<serde_json::Value>,
	/// Unix milliseconds. Filled by the event API when absent.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ts: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub v: Option<String>,
}

impl Event {
	pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
		Event {
			id: None,
			name: name.into(),
			data,
			user: None,
			ts: None,
			v: None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn json_round_trip() {
		let event = Event {
			id: Some("01J3ZKW9".to_string()),
			name: "order/created".to_string(),
			data: serde_json::json!({"order_id": 42, "total": "19.99"}),
			user: Some(serde_json::json!({"external_id": "u_1"})),
			ts: Some(1_700_000_000_000),
			v: Some("2024-01-01.1".to_string()),
		};

		let encoded = serde_json::to_string(&event).unwrap();
		let decoded: Event = serde_json::from_str(&encoded).unwrap();
		assert_eq!(event, decoded);
	}

	#[test]
	fn optional_fields_default() {
		let decoded: Event = serde_json::from_str(r#"{"name":"a/b"}"#).unwrap();
		assert_eq!(decoded.name, "a/b");
		assert_eq!(decoded.data, serde_json::Value::Null);
		assert!(decoded.id.is_none() && decoded.ts.is_none());
	}
}
