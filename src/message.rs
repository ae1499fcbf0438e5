use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A message travelling between nodes of a flow.
///
/// Only `_msgid` and `payload` have a fixed meaning; every other property
/// is carried along untouched so downstream nodes can see what upstream
/// nodes attached (for example `cloudant` or `attachment`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "_msgid", default = "Message::fresh_id")]
    id: String,
    #[serde(default)]
    payload: Value,
    #[serde(flatten)]
    properties: Map<String, Value>,
}

impl Message {
    pub fn new(id: &str, payload: Value) -> Self {
        Self {
            id: id.to_string(),
            payload,
            properties: Map::new(),
        }
    }

    pub fn from_payload(payload: Value) -> Self {
        Self::new(&Self::fresh_id(), payload)
    }

    fn fresh_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn id(&self) -> String {
        self.id.clone()
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: Value) {
        self.payload = payload;
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        match name {
            "payload" => Some(&self.payload),
            _ => self.properties.get(name),
        }
    }

    pub fn set(&mut self, name: &str, value: Value) {
        match name {
            "payload" => self.payload = value,
            _ => {
                self.properties.insert(name.to_string(), value);
            }
        }
    }

    /// Looks a property up on the message first, then inside an object payload.
    pub fn property(&self, name: &str) -> Option<&Value> {
        if let Some(value) = self.get(name) {
            return Some(value);
        }
        self.payload.as_object().and_then(|payload| payload.get(name))
    }

    /// The message as a plain JSON object, without the runtime-injected `_msgid`.
    pub fn to_value_without_id(&self) -> Value {
        let mut object = self.properties.clone();
        object.insert("payload".to_string(), self.payload.clone());
        Value::Object(object)
    }
}

/// JavaScript-style truthiness, used where a flow author may leave a
/// property empty instead of removing it.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_creation() {
        let msg = Message::new("abc123", json!({"key": "value"}));
        assert_eq!(msg.id(), "abc123");
        assert_eq!(msg.payload(), &json!({"key": "value"}));
        assert!(msg.properties.is_empty());
    }

    #[test]
    fn test_deserialize_keeps_extra_properties() {
        let msg: Message = serde_json::from_value(json!({
            "_msgid": "m1",
            "payload": 5,
            "topic": "sensors"
        }))
        .unwrap();
        assert_eq!(msg.id(), "m1");
        assert_eq!(msg.get("topic"), Some(&json!("sensors")));

        let back = serde_json::to_value(&msg).unwrap();
        assert_eq!(back, json!({"_msgid": "m1", "payload": 5, "topic": "sensors"}));
    }

    #[test]
    fn test_missing_msgid_gets_generated() {
        let msg: Message = serde_json::from_value(json!({"payload": "x"})).unwrap();
        assert!(!msg.id().is_empty());
    }

    #[test]
    fn test_property_falls_back_to_payload() {
        let mut msg = Message::new("id", json!({"attachmentName": "a.txt"}));
        assert_eq!(msg.property("attachmentName"), Some(&json!("a.txt")));

        msg.set("attachmentName", json!("b.txt"));
        assert_eq!(msg.property("attachmentName"), Some(&json!("b.txt")));
        assert_eq!(msg.property("missing"), None);
    }

    #[test]
    fn test_value_without_id_drops_msgid() {
        let mut msg = Message::new("id", json!("hello"));
        msg.set("topic", json!("t"));
        assert_eq!(
            msg.to_value_without_id(),
            json!({"payload": "hello", "topic": "t"})
        );
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!(false)));
        assert!(is_truthy(&json!({})));
        assert!(is_truthy(&json!("x")));
    }
}
