use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// How raw bytes from a datagram or a log line become an event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Codec {
    #[default]
    Utf8,
    Json,
    Raw,
}

impl Codec {
    /// Never fails: malformed JSON becomes `{raw, error: "invalid_json"}`.
    pub fn decode(&self, bytes: &[u8]) -> Value {
        match self {
            Codec::Utf8 => Value::String(String::from_utf8_lossy(bytes).into_owned()),
            Codec::Json => {
                let text = String::from_utf8_lossy(bytes);
                serde_json::from_str(&text)
                    .unwrap_or_else(|_| json!({ "raw": text, "error": "invalid_json" }))
            }
            Codec::Raw => Value::String(STANDARD.encode(bytes)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode() {
        assert_eq!(Codec::Utf8.decode(b"hello"), json!("hello"));
        assert_eq!(Codec::Json.decode(br#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(
            Codec::Json.decode(b"{oops"),
            json!({"raw": "{oops", "error": "invalid_json"})
        );
        assert_eq!(Codec::Raw.decode(&[0xde, 0xad]), json!("3q0="));
    }
}
