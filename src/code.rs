use serde::{Deserialize, Serialize};
use std::fmt;

/// Discriminator identifying a logical operation or event type.
///
/// A code is used both for routing (bus binding key) and handler lookup.
/// It is either numeric or named; numeric codes serialize as JSON integers,
/// named codes as strings. [`Code::routing_key`] is the single conversion
/// point to the string form used for binding keys, so routing and lookup can
/// never disagree on a code's spelling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Code {
    /// Numeric operation code.
    Num(i64),
    /// Named operation code.
    Name(String),
}

impl Code {
    /// Canonical string form used as the bus routing/binding key.
    pub fn routing_key(&self) -> String {
        // ---
        match self {
            Code::Num(n) => n.to_string(),
            Code::Name(s) => s.clone(),
        }
    }
}

impl From<i64> for Code {
    fn from(value: i64) -> Self {
        Code::Num(value)
    }
}

impl From<i32> for Code {
    fn from(value: i32) -> Self {
        Code::Num(value.into())
    }
}

impl From<u32> for Code {
    fn from(value: u32) -> Self {
        Code::Num(value.into())
    }
}

impl From<&str> for Code {
    fn from(value: &str) -> Self {
        Code::Name(value.to_string())
    }
}

impl From<String> for Code {
    fn from(value: String) -> Self {
        Code::Name(value)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        match self {
            Code::Num(n) => write!(f, "{n}"),
            Code::Name(s) => f.write_str(s),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn numeric_code_serializes_as_integer() {
        // ---
        let code = Code::from(42);
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, "42");
    }

    #[test]
    fn named_code_serializes_as_string() {
        // ---
        let code = Code::from("order-created");
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, "\"order-created\"");
    }

    #[test]
    fn deserializes_both_forms() {
        // ---
        let num: Code = serde_json::from_str("7").unwrap();
        assert_eq!(num, Code::Num(7));

        let name: Code = serde_json::from_str("\"ping\"").unwrap();
        assert_eq!(name, Code::Name("ping".to_string()));
    }

    #[test]
    fn routing_key_matches_display() {
        // ---
        let num = Code::from(42);
        assert_eq!(num.routing_key(), "42");
        assert_eq!(num.to_string(), "42");

        let name = Code::from("ping");
        assert_eq!(name.routing_key(), "ping");
        assert_eq!(name.to_string(), "ping");
    }
}
