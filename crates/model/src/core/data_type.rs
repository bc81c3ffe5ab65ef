use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt};

/// Generic column types carried through the replication path. Everything a
/// source exposes is collapsed into one of these before it crosses a
/// connector boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DataType {
    String,
    Int32,
    Int64,
    Float32,
    Float64,
    Boolean,
    Timestamp,
    Numeric,
    Bytes,
    Json,
    Array(Box<DataType>),
}

impl DataType {
    /// Maps a Postgres type OID (as seen in pgoutput Relation messages) to a
    /// generic type. Unknown OIDs degrade to String.
    pub fn from_postgres_oid(oid: u32) -> Self {
        match oid {
            16 => DataType::Boolean,
            20 => DataType::Int64,
            21 | 23 => DataType::Int32,
            700 => DataType::Float32,
            701 => DataType::Float64,
            1700 => DataType::Numeric,
            17 => DataType::Bytes,
            114 | 3802 => DataType::Json,
            1114 | 1184 => DataType::Timestamp,
            1007 => DataType::Array(Box::new(DataType::Int32)),
            1016 => DataType::Array(Box::new(DataType::Int64)),
            1009 | 1015 => DataType::Array(Box::new(DataType::String)),
            25 | 1043 | 1042 | 2950 => DataType::String,
            _ => DataType::String,
        }
    }

    /// Maps a Postgres type name (information_schema / result metadata) to a
    /// generic type.
    pub fn from_postgres_type(type_name: &str) -> Self {
        let lowered = type_name.to_ascii_lowercase();
        if let Some(inner) = lowered.strip_suffix("[]") {
            return DataType::Array(Box::new(Self::from_postgres_type(inner)));
        }
        match lowered.as_str() {
            "boolean" | "bool" => DataType::Boolean,
            "smallint" | "int2" | "integer" | "int" | "int4" => DataType::Int32,
            "bigint" | "int8" => DataType::Int64,
            "real" | "float4" => DataType::Float32,
            "double precision" | "float8" => DataType::Float64,
            "numeric" | "decimal" => DataType::Numeric,
            "bytea" => DataType::Bytes,
            "json" | "jsonb" => DataType::Json,
            "timestamp" | "timestamptz" | "timestamp without time zone"
            | "timestamp with time zone" => DataType::Timestamp,
            _ => DataType::String,
        }
    }

    /// Destination column type for Snowflake DDL and MERGE casts.
    pub fn snowflake_name(&self) -> Cow<'_, str> {
        match self {
            DataType::Boolean => Cow::Borrowed("BOOLEAN"),
            DataType::Int32 | DataType::Int64 => Cow::Borrowed("INT"),
            DataType::Float32 | DataType::Float64 => Cow::Borrowed("FLOAT"),
            DataType::String => Cow::Borrowed("STRING"),
            DataType::Timestamp => Cow::Borrowed("TIMESTAMP_NTZ"),
            DataType::Numeric => Cow::Borrowed("NUMBER(38,20)"),
            DataType::Bytes => Cow::Borrowed("BINARY"),
            DataType::Json => Cow::Borrowed("VARIANT"),
            DataType::Array(_) => Cow::Borrowed("ARRAY"),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Array(inner) => write!(f, "array<{inner}>"),
            DataType::String => write!(f, "string"),
            DataType::Int32 => write!(f, "int32"),
            DataType::Int64 => write!(f, "int64"),
            DataType::Float32 => write!(f, "float32"),
            DataType::Float64 => write!(f, "float64"),
            DataType::Boolean => write!(f, "bool"),
            DataType::Timestamp => write!(f, "timestamp"),
            DataType::Numeric => write!(f, "numeric"),
            DataType::Bytes => write!(f, "bytes"),
            DataType::Json => write!(f, "json"),
        }
    }
}
