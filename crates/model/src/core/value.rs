use crate::core::data_type::DataType;
use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Decimal(BigDecimal),
    String(String),
    Boolean(bool),
    Json(serde_json::Value),
    Uuid(Uuid),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Array(Vec<Value>),
    Null,
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            Value::Decimal(v) => v.to_i64(),
            Value::String(v) => v.parse::<i64>().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(v) => Some(*v as f64),
            Value::Int64(v) => Some(*v as f64),
            Value::Float32(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            Value::Decimal(v) => v.to_f64(),
            Value::String(v) => v.parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            Value::Int32(v) => Some(*v != 0),
            Value::Int64(v) => Some(*v != 0),
            Value::String(v) => match v.as_str() {
                "t" | "true" | "1" => Some(true),
                "f" | "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<String> {
        match self {
            Value::Int32(v) => Some(v.to_string()),
            Value::Int64(v) => Some(v.to_string()),
            Value::Float32(v) => Some(v.to_string()),
            Value::Float64(v) => Some(v.to_string()),
            Value::Decimal(v) => Some(v.to_string()),
            Value::String(v) => Some(v.clone()),
            Value::Boolean(v) => Some(v.to_string()),
            Value::Uuid(v) => Some(v.to_string()),
            Value::Timestamp(v) => Some(v.to_rfc3339()),
            Value::Json(v) => Some(v.to_string()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Value::Int32(_) => DataType::Int32,
            Value::Int64(_) => DataType::Int64,
            Value::Float32(_) => DataType::Float32,
            Value::Float64(_) => DataType::Float64,
            Value::Decimal(_) => DataType::Numeric,
            Value::String(_) => DataType::String,
            Value::Boolean(_) => DataType::Boolean,
            Value::Json(_) => DataType::Json,
            Value::Uuid(_) => DataType::String,
            Value::Bytes(_) => DataType::Bytes,
            Value::Timestamp(_) => DataType::Timestamp,
            Value::Array(items) => DataType::Array(Box::new(
                items
                    .iter()
                    .find(|v| !v.is_null())
                    .map(Value::data_type)
                    .unwrap_or(DataType::String),
            )),
            Value::Null => DataType::String,
        }
    }

    /// JSON rendition used for the raw-table `data` / `match_data` payloads.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Int32(v) => serde_json::json!(v),
            Value::Int64(v) => serde_json::json!(v),
            Value::Float32(v) => serde_json::json!(v),
            Value::Float64(v) => serde_json::json!(v),
            Value::Decimal(v) => serde_json::Value::String(v.to_string()),
            Value::String(v) => serde_json::Value::String(v.clone()),
            Value::Boolean(v) => serde_json::json!(v),
            Value::Json(v) => v.clone(),
            Value::Uuid(v) => serde_json::Value::String(v.to_string()),
            Value::Bytes(v) => serde_json::Value::String(hex_encode(v)),
            Value::Timestamp(v) => serde_json::Value::String(v.to_rfc3339()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Null => serde_json::Value::Null,
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |acc, b| {
            acc + &format!("{b:02x}")
        })
}

/// SQL-literal rendering. Strings are single-quote escaped; bytes render as
/// a hex literal; arrays render as an ARRAY_CONSTRUCT-style list.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float32(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::Decimal(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "'{}'", v.replace('\'', "''")),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Json(v) => write!(f, "'{}'", v.to_string().replace('\'', "''")),
            Value::Uuid(v) => write!(f, "'{v}'"),
            Value::Bytes(v) => write!(f, "TO_BINARY('{}', 'HEX')", hex_encode(v)),
            Value::Timestamp(v) => write!(f, "'{}'", v.to_rfc3339()),
            Value::Array(items) => {
                write!(f, "ARRAY_CONSTRUCT(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Value::Null => write!(f, "NULL"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldValue {
    pub name: String,
    pub value: Value,
}

impl FieldValue {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_literal_escapes_quotes() {
        let v = Value::String("O'Brien".to_string());
        assert_eq!(v.to_string(), "'O''Brien'");
    }

    #[test]
    fn json_payload_keeps_numbers_typed() {
        let v = Value::Int64(42);
        assert_eq!(v.to_json(), serde_json::json!(42));
    }

    #[test]
    fn bytes_render_as_hex() {
        let v = Value::Bytes(vec![0xde, 0xad]);
        assert_eq!(v.to_string(), "TO_BINARY('dead', 'HEX')");
        assert_eq!(v.to_json(), serde_json::json!("dead"));
    }

    #[test]
    fn bool_parses_postgres_text_form() {
        assert_eq!(Value::String("t".into()).as_bool(), Some(true));
        assert_eq!(Value::String("f".into()).as_bool(), Some(false));
    }
}
