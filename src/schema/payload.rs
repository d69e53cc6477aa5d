//! Payload data <-> protobuf bytes.
//!
//! Payload data is a JSON object keyed by the schema's field names. Enum
//! fields accept a value name or number and decode to numbers; 64-bit
//! integers stay JSON numbers; `bytes` fields are base64 text. Decoding is
//! bounded by prost's nesting limit, and repeated occurrences of a
//! singular message field merge.

use prost::Message;
use prost_reflect::{
    Cardinality, DynamicMessage, MessageDescriptor, ReflectMessage, SerializeOptions,
    Value as FieldValue,
};
use serde_json::Value;

/// Same depth prost allows when decoding.
const MAX_NESTING: usize = 100;

fn json_options() -> SerializeOptions {
    SerializeOptions::new()
        .use_proto_field_name(true)
        .use_enum_numbers(true)
        .stringify_64_bit_integers(false)
}

pub(crate) fn encode(descriptor: &MessageDescriptor, data: &Value) -> Result<Vec<u8>, String> {
    let message =
        DynamicMessage::deserialize(descriptor.clone(), data).map_err(|e| e.to_string())?;
    check_required(&message, 0)?;
    Ok(message.encode_to_vec())
}

pub(crate) fn decode(descriptor: &MessageDescriptor, bytes: &[u8]) -> Result<Value, String> {
    let message = DynamicMessage::decode(descriptor.clone(), bytes).map_err(|e| e.to_string())?;
    check_required(&message, 0)?;
    message
        .serialize_with_options(serde_json::value::Serializer, &json_options())
        .map_err(|e| e.to_string())
}

/// proto2 `required` fields must be present at every level.
fn check_required(message: &DynamicMessage, depth: usize) -> Result<(), String> {
    let descriptor = message.descriptor();
    if depth > MAX_NESTING {
        return Err(format!("{} nests deeper than {} levels", descriptor.full_name(), MAX_NESTING));
    }
    if let Some(field) = descriptor
        .fields()
        .find(|f| f.cardinality() == Cardinality::Required && !message.has_field(f))
    {
        return Err(format!("missing required field {}.{}", descriptor.name(), field.name()));
    }

    for (_, value) in message.fields() {
        let nested: Vec<&DynamicMessage> = match value {
            FieldValue::Message(inner) => vec![inner],
            FieldValue::List(items) => items.iter().filter_map(FieldValue::as_message).collect(),
            FieldValue::Map(entries) => entries.values().filter_map(FieldValue::as_message).collect(),
            _ => continue,
        };
        for inner in nested {
            check_required(inner, depth + 1)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::schema::source::SourceSet;

    fn descriptor(source: &str, name: &str) -> MessageDescriptor {
        let mut sources = SourceSet::default();
        sources.insert("test.proto", source).unwrap();
        sources.compile().unwrap().get_message_by_name(name).unwrap()
    }

    const SAMPLE: &str = r#"
        enum Color { RED = 0; GREEN = 1; BLUE = 2; }
        message Item {
            required string id     = 1;
            optional int32  count  = 2;
            optional sint64 delta  = 3;
            optional bool   flag   = 4;
            optional double ratio  = 5;
            optional bytes  blob   = 6;
            optional Color  color  = 7;
            repeated uint32 sizes  = 8;
            repeated uint32 packed = 9 [packed = true];
            optional Item   child  = 10;
            optional fixed32 f32   = 11;
        }
    "#;

    /// Builds `depth` levels of field 1 wrapping field 1, innermost empty.
    fn nested_payload(depth: usize) -> Vec<u8> {
        let mut lengths = vec![0usize; depth];
        for level in 1..depth {
            let inner = lengths[level - 1];
            lengths[level] = 1 + prost::encoding::encoded_len_varint(inner as u64) + inner;
        }
        let mut buf = Vec::new();
        for &len in lengths.iter().rev() {
            buf.push(0x0a);
            prost::encoding::encode_varint(len as u64, &mut buf);
        }
        buf
    }

    #[test]
    fn test_encode_matches_protobuf_layout() {
        let message = descriptor("message M { optional int32 a = 1; optional string b = 2; }", "M");
        let bytes = encode(&message, &json!({"a": 150, "b": "hi"})).unwrap();
        assert_eq!(bytes, [0x08, 0x96, 0x01, 0x12, 0x02, b'h', b'i']);
    }

    #[test]
    fn test_round_trip_all_kinds() {
        let item = descriptor(SAMPLE, "Item");
        let value = json!({
            "id": "d/123",
            "count": -5,
            "delta": -300,
            "flag": true,
            "ratio": 0.25,
            "blob": "AAEC",
            "color": 2,
            "sizes": [1, 2, 3],
            "packed": [4, 5],
            "child": {"id": "c"},
            "f32": 7
        });

        let bytes = encode(&item, &value).unwrap();
        assert_eq!(decode(&item, &bytes).unwrap(), value);
    }

    #[test]
    fn test_enum_accepts_name() {
        let item = descriptor(SAMPLE, "Item");
        let bytes = encode(&item, &json!({"id": "x", "color": "GREEN"})).unwrap();
        assert_eq!(decode(&item, &bytes).unwrap()["color"], json!(1));
    }

    #[test]
    fn test_packed_and_unpacked_both_decode() {
        let message = descriptor("message M { repeated int32 v = 1; }", "M");
        let unpacked = [0x08, 0x01, 0x08, 0x02];
        let packed = [0x0a, 0x02, 0x01, 0x02];

        assert_eq!(decode(&message, &unpacked).unwrap(), json!({"v": [1, 2]}));
        assert_eq!(decode(&message, &packed).unwrap(), json!({"v": [1, 2]}));
    }

    #[test]
    fn test_unknown_fields_skipped_on_decode() {
        let message = descriptor("message M { optional int32 a = 1; }", "M");
        let bytes = [0x08, 0x01, 0x10, 0x05, 0x1a, 0x01, b'x'];
        assert_eq!(decode(&message, &bytes).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_encode_rejects_bad_input() {
        let item = descriptor(SAMPLE, "Item");

        assert!(encode(&item, &json!({"id": "x", "nope": 1})).is_err());
        assert!(encode(&item, &json!({"id": "x", "count": "many"})).is_err());
        assert!(encode(&item, &json!({"id": "x", "color": "PURPLE"})).is_err());

        let err = encode(&item, &json!({"count": 1})).unwrap_err();
        assert!(err.contains("Item.id"), "{}", err);
        let err = encode(&item, &json!({"id": "x", "child": {"count": 1}})).unwrap_err();
        assert!(err.contains("Item.id"), "{}", err);
    }

    #[test]
    fn test_null_means_absent() {
        let item = descriptor(SAMPLE, "Item");
        let bytes = encode(&item, &json!({"id": "x", "count": null, "child": null})).unwrap();
        assert_eq!(decode(&item, &bytes).unwrap(), json!({"id": "x"}));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let message = descriptor("message M { optional string s = 1; }", "M");
        // length prefix claims 9 bytes with 1 present
        assert!(decode(&message, &[0x0a, 0x09, 0x01]).is_err());
        // truncated varint
        assert!(decode(&message, &[0x08, 0xff]).is_err());
    }

    #[test]
    fn test_missing_required_on_decode() {
        let item = descriptor(SAMPLE, "Item");
        assert!(decode(&item, &[]).is_err());
        assert_eq!(
            decode(&descriptor("message Empty {}", "Empty"), &[]).unwrap(),
            json!({})
        );
    }

    #[test]
    fn test_deeply_nested_payload_is_rejected() {
        let node = descriptor("message Node { optional Node child = 1; }", "Node");

        let shallow = nested_payload(20);
        let decoded = decode(&node, &shallow).unwrap();
        assert!(decoded["child"]["child"].is_object());

        // roughly a megabyte of nesting must fail cleanly, not exhaust the stack
        let deep = nested_payload(200_000);
        assert!(deep.len() < 2 * 1024 * 1024);
        let err = decode(&node, &deep).unwrap_err();
        assert!(err.contains("recursion limit"), "{}", err);
    }

    #[test]
    fn test_repeated_singular_message_fields_merge() {
        let outer = descriptor(
            r#"
            message Inner { optional uint32 a = 1; optional string b = 2; repeated uint32 c = 3; }
            message Outer { optional Inner inner = 1; }
            "#,
            "Outer",
        );
        let bytes = [
            0x0a, 0x04, 0x08, 0x05, 0x18, 0x01, // inner { a: 5, c: [1] }
            0x0a, 0x05, 0x12, 0x01, b'x', 0x18, 0x02, // inner { b: "x", c: [2] }
        ];

        assert_eq!(
            decode(&outer, &bytes).unwrap(),
            json!({"inner": {"a": 5, "b": "x", "c": [1, 2]}})
        );
    }
}
