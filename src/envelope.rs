//! Wire envelope carried in every bus message body.
//!
//! The envelope is the unit of exchange between clients, servers, and
//! handlers: a dynamic JSON `body`, the operation [`Code`], and an `error`
//! flag. When `error` is true the body is a human-readable failure
//! description, never a structured success payload.
//!
//! Payloads stay dynamic on the wire; each call boundary applies an explicit
//! typed decode via [`Envelope::decode_body`] or
//! [`Envelope::decode_body_list`].

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Code, Result};

/// The `{body, code, error}` wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    // ---
    /// Dynamic payload. A failure description string when `error` is true.
    pub body: Value,

    /// Operation or event discriminator.
    pub code: Code,

    /// Whether this envelope reports a remote failure.
    #[serde(default)]
    pub error: bool,
}

impl Envelope {
    /// Create a success envelope for the given code and body.
    pub fn new(code: Code, body: Value) -> Self {
        // ---
        Self {
            body,
            code,
            error: false,
        }
    }

    /// Create a failure envelope whose body is a textual description.
    pub fn failure(code: Code, description: impl Into<String>) -> Self {
        // ---
        Self {
            body: Value::String(description.into()),
            code,
            error: true,
        }
    }

    /// Serialize the envelope to wire bytes.
    pub fn encode(&self) -> Result<Bytes> {
        // ---
        let bytes = serde_json::to_vec(self)?;
        Ok(Bytes::from(bytes))
    }

    /// Deserialize an envelope from wire bytes.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        // ---
        let envelope = serde_json::from_slice(payload)?;
        Ok(envelope)
    }

    /// Decode the body into a concrete type.
    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T> {
        // ---
        let value = serde_json::from_value(self.body.clone())?;
        Ok(value)
    }

    /// Decode a body holding a JSON array into a vector of a concrete type.
    pub fn decode_body_list<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        // ---
        let values = serde_json::from_value(self.body.clone())?;
        Ok(values)
    }

    /// The failure description carried by an `error = true` envelope.
    ///
    /// Falls back to the raw JSON rendering if the body is not a string.
    pub fn failure_text(&self) -> String {
        // ---
        match self.body.as_str() {
            Some(text) => text.to_string(),
            None => self.body.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn error_flag_defaults_to_false_on_decode() {
        // ---
        let envelope = Envelope::decode(br#"{"body":{"x":1},"code":42}"#).unwrap();
        assert!(!envelope.error);
        assert_eq!(envelope.code, Code::Num(42));
        assert_eq!(envelope.body, json!({"x":1}));
    }

    #[test]
    fn encode_decode_preserves_fields() {
        // ---
        let envelope = Envelope::new(Code::from(7), json!({"id": 5}));
        let bytes = envelope.encode().unwrap();

        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.code, Code::Num(7));
        assert_eq!(decoded.body, json!({"id": 5}));
        assert!(!decoded.error);
    }

    #[test]
    fn failure_body_is_description_text() {
        // ---
        let envelope = Envelope::failure(Code::from(7), "out of stock");
        assert!(envelope.error);
        assert_eq!(envelope.failure_text(), "out of stock");
    }

    #[test]
    fn decode_body_into_typed_struct() {
        // ---
        #[derive(Deserialize)]
        struct Order {
            id: u32,
        }

        let envelope = Envelope::new(Code::from(7), json!({"id": 5}));
        let order: Order = envelope.decode_body().unwrap();
        assert_eq!(order.id, 5);
    }

    #[test]
    fn decode_body_list_into_typed_vec() {
        // ---
        let envelope = Envelope::new(Code::from(8), json!([{"id": 1}, {"id": 2}]));

        #[derive(Deserialize)]
        struct Order {
            id: u32,
        }

        let orders: Vec<Order> = envelope.decode_body_list().unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[1].id, 2);
    }

    #[test]
    fn decode_body_type_mismatch_is_decode_error() {
        // ---
        let envelope = Envelope::new(Code::from(7), json!("not an object"));
        let result: Result<std::collections::HashMap<String, u32>> = envelope.decode_body();
        assert!(matches!(result, Err(crate::RpcError::Decode(_))));
    }
}
