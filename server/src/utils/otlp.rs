//! OTLP utility functions
//!
//! Helpers for working with OTLP protobuf attribute types:
//! - Rendering `AnyValue`s as strings (routing view, log output)
//! - Building and replacing `KeyValue` attributes in place

use std::collections::HashMap;

use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue, any_value};

// ============================================================================
// ATTRIBUTE EXTRACTION
// ============================================================================

/// Extract attributes from KeyValue array into HashMap
pub fn extract_attributes(attrs: &[KeyValue]) -> HashMap<String, String> {
    attrs
        .iter()
        .filter_map(|kv| {
            kv.value
                .as_ref()
                .map(|v| (kv.key.clone(), any_value_to_string(v)))
        })
        .collect()
}

/// Convert AnyValue to string representation
pub fn any_value_to_string(value: &AnyValue) -> String {
    match &value.value {
        Some(any_value::Value::StringValue(s)) => s.clone(),
        Some(any_value::Value::BoolValue(b)) => b.to_string(),
        Some(any_value::Value::IntValue(i)) => i.to_string(),
        Some(any_value::Value::DoubleValue(d)) => d.to_string(),
        Some(any_value::Value::ArrayValue(arr)) => {
            let values: Vec<String> = arr.values.iter().map(any_value_to_string).collect();
            serde_json::to_string(&values).unwrap_or_default()
        }
        Some(any_value::Value::KvlistValue(kvlist)) => {
            // Sorted so equal lists render identically
            let map: std::collections::BTreeMap<String, String> = kvlist
                .values
                .iter()
                .filter_map(|kv| {
                    kv.value
                        .as_ref()
                        .map(|v| (kv.key.clone(), any_value_to_string(v)))
                })
                .collect();
            serde_json::to_string(&map).unwrap_or_default()
        }
        Some(any_value::Value::BytesValue(b)) => hex::encode(b),
        None => String::new(),
    }
}

// ============================================================================
// ATTRIBUTE MUTATION
// ============================================================================

/// Create a KeyValue attribute
pub fn make_attr(key: &str, value: any_value::Value) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue { value: Some(value) }),
    }
}

/// Create a string KeyValue attribute
pub fn make_string_attr(key: &str, value: &str) -> KeyValue {
    make_attr(key, any_value::Value::StringValue(value.to_string()))
}

/// Replace every attribute named `attr.key` with `attr`, or append it
pub fn upsert_attr(attrs: &mut Vec<KeyValue>, attr: KeyValue) {
    attrs.retain(|kv| kv.key != attr.key);
    attrs.push(attr);
}

/// Remove every attribute named `key`. Returns true if any was removed.
pub fn remove_attr(attrs: &mut Vec<KeyValue>, key: &str) -> bool {
    let before = attrs.len();
    attrs.retain(|kv| kv.key != key);
    attrs.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_proto::tonic::common::v1::{ArrayValue, KeyValueList};

    fn kv(key: &str, value: any_value::Value) -> KeyValue {
        make_attr(key, value)
    }

    #[test]
    fn test_any_value_to_string_scalars() {
        let cases = [
            (any_value::Value::StringValue("api".into()), "api"),
            (any_value::Value::BoolValue(true), "true"),
            (any_value::Value::IntValue(-42), "-42"),
            (any_value::Value::DoubleValue(1.5), "1.5"),
        ];
        for (value, expected) in cases {
            let any = AnyValue { value: Some(value) };
            assert_eq!(any_value_to_string(&any), expected);
        }
    }

    #[test]
    fn test_any_value_to_string_none() {
        assert_eq!(any_value_to_string(&AnyValue { value: None }), "");
    }

    #[test]
    fn test_any_value_to_string_bytes() {
        let any = AnyValue {
            value: Some(any_value::Value::BytesValue(vec![0xde, 0xad])),
        };
        assert_eq!(any_value_to_string(&any), "dead");
    }

    #[test]
    fn test_any_value_to_string_array() {
        let any = AnyValue {
            value: Some(any_value::Value::ArrayValue(ArrayValue {
                values: vec![
                    AnyValue {
                        value: Some(any_value::Value::StringValue("a".into())),
                    },
                    AnyValue {
                        value: Some(any_value::Value::IntValue(1)),
                    },
                ],
            })),
        };
        assert_eq!(any_value_to_string(&any), r#"["a","1"]"#);
    }

    #[test]
    fn test_any_value_to_string_kvlist_is_sorted() {
        let any = AnyValue {
            value: Some(any_value::Value::KvlistValue(KeyValueList {
                values: vec![
                    kv("b", any_value::Value::IntValue(2)),
                    kv("a", any_value::Value::IntValue(1)),
                ],
            })),
        };
        assert_eq!(any_value_to_string(&any), r#"{"a":"1","b":"2"}"#);
    }

    #[test]
    fn test_extract_attributes_skips_missing_values() {
        let attrs = vec![
            make_string_attr("service.name", "api"),
            KeyValue {
                key: "empty".into(),
                value: None,
            },
        ];
        let map = extract_attributes(&attrs);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("service.name"), Some(&"api".to_string()));
    }

    #[test]
    fn test_upsert_attr_replaces_duplicates() {
        let mut attrs = vec![
            make_string_attr("env", "dev"),
            make_string_attr("service.name", "api"),
            make_string_attr("env", "staging"),
        ];
        upsert_attr(&mut attrs, make_string_attr("env", "prod"));
        let map = extract_attributes(&attrs);
        assert_eq!(attrs.len(), 2);
        assert_eq!(map.get("env"), Some(&"prod".to_string()));
    }

    #[test]
    fn test_remove_attr() {
        let mut attrs = vec![make_string_attr("env", "prod")];
        assert!(remove_attr(&mut attrs, "env"));
        assert!(!remove_attr(&mut attrs, "env"));
        assert!(attrs.is_empty());
    }
}
