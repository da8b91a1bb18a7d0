//! Payload codec at the MQTT boundary.
//!
//! Every value in the engine is a [`serde_json::Value`]; serialization only
//! happens at the transport and store boundaries. On the wire, scalars are
//! their bare JSON literal (`42`, `true`, `"on"`) rather than being wrapped
//! in an envelope object. Inbound payloads that are not valid JSON are kept
//! as plain strings, which is what most sensor firmwares publish.

use serde_json::Value;

/// Encodes a value for publishing. `Null` encodes as the literal `null`.
pub fn to_payload(value: &Value) -> String {
    value.to_string()
}

/// Decodes an MQTT payload into a value. Valid JSON parses as-is; anything
/// else becomes a string (lossy on invalid UTF-8).
pub fn from_payload(payload: &[u8]) -> Value {
    match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(_) => Value::String(String::from_utf8_lossy(payload).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars_encode_bare() {
        assert_eq!(to_payload(&json!(42)), "42");
        assert_eq!(to_payload(&json!(true)), "true");
        assert_eq!(to_payload(&json!("on")), "\"on\"");
        assert_eq!(to_payload(&Value::Null), "null");
    }

    #[test]
    fn objects_round_trip() {
        let v = json!({"temp": 21.5, "unit": "C"});
        assert_eq!(from_payload(to_payload(&v).as_bytes()), v);
    }

    #[test]
    fn invalid_json_becomes_string() {
        assert_eq!(from_payload(b"ON"), Value::String("ON".to_string()));
        assert_eq!(from_payload(b"21.5.3"), Value::String("21.5.3".to_string()));
    }

    #[test]
    fn numeric_payload_parses_as_number() {
        assert_eq!(from_payload(b"42"), json!(42));
        assert_eq!(from_payload(b"21.5"), json!(21.5));
    }
}
