//! payload schema 校验

use chrono::{DateTime, NaiveDate};
use serde_json::Value;
use std::collections::BTreeMap;

use super::definition::{FieldKind, FieldSchema};
use crate::error::FieldError;

/// 按 schema 校验 payload
///
/// 返回所有出错字段（缺失的必填字段 + 类型不匹配的字段），不会在第一个错误处停止。
/// schema 之外的字段不做检查。
pub fn validate_payload(
    schema: &BTreeMap<String, FieldSchema>,
    payload: &Value,
) -> Result<(), Vec<FieldError>> {
    let object = match payload.as_object() {
        Some(obj) => obj,
        None => {
            return Err(vec![FieldError::new(
                "$",
                format!("payload must be an object, got {}", json_type_name(payload)),
            )])
        }
    };

    let mut errors = Vec::new();

    for (name, field) in schema {
        match object.get(name) {
            None | Some(Value::Null) => {
                if field.required {
                    errors.push(FieldError::new(name, "required field is missing"));
                }
            }
            Some(value) => {
                if !matches_kind(field.kind, value) {
                    errors.push(FieldError::new(
                        name,
                        format!("expected {}, got {}", field.kind, json_type_name(value)),
                    ));
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn matches_kind(kind: FieldKind, value: &Value) -> bool {
    match kind {
        FieldKind::String => value.is_string(),
        FieldKind::Number => value.is_number(),
        FieldKind::Boolean => value.is_boolean(),
        FieldKind::Array => value.is_array(),
        FieldKind::Object => value.is_object(),
        FieldKind::Date => is_date(value),
    }
}

/// 日期：RFC3339 字符串、`YYYY-MM-DD` 字符串或毫秒时间戳
fn is_date(value: &Value) -> bool {
    match value {
        Value::String(s) => {
            DateTime::parse_from_rfc3339(s).is_ok() || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
        }
        Value::Number(n) => n.is_i64() || n.is_u64(),
        _ => false,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_schema() -> BTreeMap<String, FieldSchema> {
        let mut schema = BTreeMap::new();
        schema.insert("order_id".to_string(), FieldSchema::required(FieldKind::String));
        schema.insert("total".to_string(), FieldSchema::required(FieldKind::Number));
        schema.insert("paid".to_string(), FieldSchema::optional(FieldKind::Boolean));
        schema.insert("created_at".to_string(), FieldSchema::optional(FieldKind::Date));
        schema.insert("items".to_string(), FieldSchema::optional(FieldKind::Array));
        schema.insert("customer".to_string(), FieldSchema::optional(FieldKind::Object));
        schema
    }

    #[test]
    fn test_valid_payload_passes() {
        let payload = json!({
            "order_id": "o-1",
            "total": 12.5,
            "paid": true,
            "created_at": "2024-03-01T10:00:00Z",
            "items": [1, 2],
            "customer": {"id": "c-1"},
            "extra": "ignored"
        });
        assert!(validate_payload(&order_schema(), &payload).is_ok());
    }

    #[test]
    fn test_missing_required_field() {
        let payload = json!({"total": 3});
        let errors = validate_payload(&order_schema(), &payload).unwrap_err();
        assert_eq!(errors, vec![FieldError::new("order_id", "required field is missing")]);
    }

    #[test]
    fn test_lists_exactly_offending_fields() {
        let payload = json!({"order_id": 1, "paid": "yes"});
        let errors = validate_payload(&order_schema(), &payload).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        // BTreeMap 保证按字段名排序
        assert_eq!(fields, vec!["order_id", "paid", "total"]);
        assert_eq!(errors[0].message, "expected string, got number");
    }

    #[test]
    fn test_null_required_field_is_missing() {
        let payload = json!({"order_id": null, "total": 1});
        let errors = validate_payload(&order_schema(), &payload).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "order_id");
    }

    #[test]
    fn test_date_formats() {
        assert!(is_date(&json!("2024-03-01")));
        assert!(is_date(&json!("2024-03-01T10:00:00+08:00")));
        assert!(is_date(&json!(1709287200000_i64)));
        assert!(!is_date(&json!("yesterday")));
        assert!(!is_date(&json!(1.5)));
    }

    #[test]
    fn test_non_object_payload_rejected() {
        let errors = validate_payload(&order_schema(), &json!([1, 2])).unwrap_err();
        assert_eq!(errors[0].field, "$");
    }

    #[test]
    fn test_empty_schema_accepts_any_object() {
        assert!(validate_payload(&BTreeMap::new(), &json!({"a": 1})).is_ok());
    }
}
