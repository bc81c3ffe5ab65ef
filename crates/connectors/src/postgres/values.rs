use crate::error::ConnectorError;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDateTime, Utc};
use model::core::{data_type::DataType, value::Value};
use std::str::FromStr;
use tokio_postgres::{Row, types::Type};

/// Parses a pgoutput text-format column value into a typed value. The text
/// forms here are exactly what the decoder hands over for `proto_version 1`
/// without the binary option.
pub fn parse_text_value(text: &str, data_type: &DataType) -> Result<Value, ConnectorError> {
    let corrupt = |what: &str| ConnectorError::Corrupt(format!("{what}: {text:?}"));

    let value = match data_type {
        DataType::Boolean => Value::Boolean(match text {
            "t" | "true" => true,
            "f" | "false" => false,
            _ => return Err(corrupt("boolean")),
        }),
        DataType::Int32 => Value::Int32(text.parse().map_err(|_| corrupt("int32"))?),
        DataType::Int64 => Value::Int64(text.parse().map_err(|_| corrupt("int64"))?),
        DataType::Float32 => Value::Float32(text.parse().map_err(|_| corrupt("float32"))?),
        DataType::Float64 => Value::Float64(text.parse().map_err(|_| corrupt("float64"))?),
        DataType::Numeric => {
            Value::Decimal(BigDecimal::from_str(text).map_err(|_| corrupt("numeric"))?)
        }
        DataType::Timestamp => Value::Timestamp(parse_timestamp(text).ok_or_else(|| {
            ConnectorError::Corrupt(format!("timestamp: {text:?}"))
        })?),
        DataType::Bytes => Value::Bytes(parse_bytea(text).ok_or_else(|| {
            ConnectorError::Corrupt(format!("bytea: {text:?}"))
        })?),
        DataType::Json => {
            Value::Json(serde_json::from_str(text).map_err(|_| corrupt("json"))?)
        }
        // Array text form ("{a,b}") is carried through as-is; destinations
        // receive it as a string element list.
        DataType::Array(inner) => Value::Array(
            parse_array_text(text)
                .into_iter()
                .map(|elem| parse_text_value(&elem, inner))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        DataType::String => Value::String(text.to_string()),
    };
    Ok(value)
}

/// Postgres prints timestamps as `2024-01-02 03:04:05.123456` with an
/// optional zone suffix.
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ts) = DateTime::parse_from_str(text, format) {
            return Some(ts.with_timezone(&Utc));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

fn parse_bytea(text: &str) -> Option<Vec<u8>> {
    let hex = text.strip_prefix("\\x")?;
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

fn parse_array_text(text: &str) -> Vec<String> {
    let trimmed = text.trim_start_matches('{').trim_end_matches('}');
    if trimmed.is_empty() {
        return Vec::new();
    }
    let mut elements = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = trimmed.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => in_quotes = !in_quotes,
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ',' if !in_quotes => {
                elements.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    elements.push(current);
    elements
}

/// Maps a result-set column type to the generic model.
pub fn data_type_for(pg_type: &Type) -> DataType {
    // Type's associated constants are not usable in patterns, so this is an
    // equality ladder.
    if *pg_type == Type::BOOL {
        DataType::Boolean
    } else if *pg_type == Type::INT2 || *pg_type == Type::INT4 {
        DataType::Int32
    } else if *pg_type == Type::INT8 {
        DataType::Int64
    } else if *pg_type == Type::FLOAT4 {
        DataType::Float32
    } else if *pg_type == Type::FLOAT8 {
        DataType::Float64
    } else if *pg_type == Type::NUMERIC {
        DataType::Numeric
    } else if *pg_type == Type::BYTEA {
        DataType::Bytes
    } else if *pg_type == Type::JSON || *pg_type == Type::JSONB {
        DataType::Json
    } else if *pg_type == Type::TIMESTAMP || *pg_type == Type::TIMESTAMPTZ {
        DataType::Timestamp
    } else if *pg_type == Type::TEXT_ARRAY || *pg_type == Type::VARCHAR_ARRAY {
        DataType::Array(Box::new(DataType::String))
    } else if *pg_type == Type::INT4_ARRAY {
        DataType::Array(Box::new(DataType::Int32))
    } else if *pg_type == Type::INT8_ARRAY {
        DataType::Array(Box::new(DataType::Int64))
    } else {
        DataType::String
    }
}

/// Extracts one cell from a query result row as a typed value.
pub fn value_from_row(
    row: &Row,
    idx: usize,
    data_type: &DataType,
) -> Result<Value, ConnectorError> {
    let value = match data_type {
        DataType::Boolean => row
            .try_get::<_, Option<bool>>(idx)?
            .map_or(Value::Null, Value::Boolean),
        DataType::Int32 => {
            // SMALLINT surfaces as i16; retry as such before giving up.
            match row.try_get::<_, Option<i32>>(idx) {
                Ok(v) => v.map_or(Value::Null, Value::Int32),
                Err(_) => row
                    .try_get::<_, Option<i16>>(idx)?
                    .map_or(Value::Null, |v| Value::Int32(v as i32)),
            }
        }
        DataType::Int64 => row
            .try_get::<_, Option<i64>>(idx)?
            .map_or(Value::Null, Value::Int64),
        DataType::Float32 => row
            .try_get::<_, Option<f32>>(idx)?
            .map_or(Value::Null, Value::Float32),
        DataType::Float64 => row
            .try_get::<_, Option<f64>>(idx)?
            .map_or(Value::Null, Value::Float64),
        DataType::Numeric => {
            // tokio-postgres has no BigDecimal mapping; bridge through
            // rust_decimal's wire support.
            match row.try_get::<_, Option<rust_decimal::Decimal>>(idx)? {
                Some(decimal) => {
                    let text = decimal.to_string();
                    Value::Decimal(BigDecimal::from_str(&text).map_err(|_| {
                        ConnectorError::Corrupt(format!("numeric: {text:?}"))
                    })?)
                }
                None => Value::Null,
            }
        }
        DataType::Timestamp => match row.try_get::<_, Option<DateTime<Utc>>>(idx) {
            Ok(v) => v.map_or(Value::Null, Value::Timestamp),
            Err(_) => row
                .try_get::<_, Option<NaiveDateTime>>(idx)?
                .map_or(Value::Null, |v| Value::Timestamp(v.and_utc())),
        },
        DataType::Bytes => row
            .try_get::<_, Option<Vec<u8>>>(idx)?
            .map_or(Value::Null, Value::Bytes),
        DataType::Json => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map_or(Value::Null, Value::Json),
        DataType::Array(_) => row
            .try_get::<_, Option<Vec<String>>>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, |items| {
                Value::Array(items.into_iter().map(Value::String).collect())
            }),
        DataType::String => {
            // Everything that degraded to String: text, uuid, date/time.
            if let Ok(v) = row.try_get::<_, Option<String>>(idx) {
                v.map_or(Value::Null, Value::String)
            } else if let Ok(v) = row.try_get::<_, Option<uuid::Uuid>>(idx) {
                v.map_or(Value::Null, Value::Uuid)
            } else {
                row.try_get::<_, Option<chrono::NaiveDate>>(idx)?
                    .map_or(Value::Null, |d| Value::String(d.to_string()))
            }
        }
    };
    Ok(value)
}
