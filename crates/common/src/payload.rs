//! The open key/value bag a saga accumulates as its steps complete.

use serde_json::{Map, Value};

/// Process-specific data carried by events, instances and commands.
pub type Payload = Map<String, Value>;

/// Merges `incoming` into `target`, overwriting keys that already exist.
pub fn merge_payload(target: &mut Payload, incoming: &Payload) {
    for (key, value) in incoming {
        target.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn merge_adds_and_overwrites() {
        let mut target = payload(json!({"match_id": "M1", "slot_id": null}));
        let incoming = payload(json!({"slot_id": "S-7", "member_ids": ["a", "b"]}));

        merge_payload(&mut target, &incoming);

        assert_eq!(target["match_id"], "M1");
        assert_eq!(target["slot_id"], "S-7");
        assert_eq!(target["member_ids"], json!(["a", "b"]));
    }
}
