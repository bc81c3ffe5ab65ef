use crate::error::ConnectorError;
use apache_avro::{
    Codec, Schema, Writer,
    types::{Record as AvroRecord, Value as AvroValue},
};
use model::{
    core::{data_type::DataType, identifiers::snowflake_ident, value::Value},
    records::stream::{QRecordReceiver, QRecordSchema},
};
use serde_json::json;

/// Avro primitive for a generic column type. Everything without a natural
/// Avro shape travels as a string and is coerced by the destination's COPY.
fn avro_primitive(data_type: &DataType) -> &'static str {
    match data_type {
        DataType::Int32 => "int",
        DataType::Int64 => "long",
        DataType::Float32 => "float",
        DataType::Float64 => "double",
        DataType::Boolean => "boolean",
        DataType::Bytes => "bytes",
        _ => "string",
    }
}

/// Record schema whose field names match the destination columns, so COPY
/// can match by name.
pub fn avro_schema_json(name: &str, schema: &QRecordSchema) -> serde_json::Value {
    let fields: Vec<serde_json::Value> = schema
        .fields
        .iter()
        .map(|field| {
            json!({
                "name": snowflake_ident(&field.name),
                "type": ["null", avro_primitive(&field.data_type)],
                "default": null,
            })
        })
        .collect();
    json!({
        "type": "record",
        "name": snowflake_ident(name),
        "fields": fields,
    })
}

fn to_avro_value(value: Value, data_type: &DataType) -> AvroValue {
    if value.is_null() {
        return AvroValue::Union(0, Box::new(AvroValue::Null));
    }
    let inner = match (data_type, value) {
        (DataType::Int32, Value::Int32(v)) => AvroValue::Int(v),
        (DataType::Int64, Value::Int64(v)) => AvroValue::Long(v),
        (DataType::Int64, Value::Int32(v)) => AvroValue::Long(v as i64),
        (DataType::Float32, Value::Float32(v)) => AvroValue::Float(v),
        (DataType::Float64, Value::Float64(v)) => AvroValue::Double(v),
        (DataType::Boolean, Value::Boolean(v)) => AvroValue::Boolean(v),
        (DataType::Bytes, Value::Bytes(v)) => AvroValue::Bytes(v),
        (_, other) => AvroValue::String(other.as_string().unwrap_or_default()),
    };
    AvroValue::Union(1, Box::new(inner))
}

/// Drains a record stream into one Avro object container in memory and
/// returns its bytes with the row count. Partitions are bounded by the
/// configured rows-per-partition, which bounds this buffer.
pub async fn stream_to_avro(
    name: &str,
    schema: &QRecordSchema,
    receiver: &mut QRecordReceiver,
) -> Result<(Vec<u8>, u64), ConnectorError> {
    let avro_schema = Schema::parse_str(&avro_schema_json(name, schema).to_string())?;
    let mut writer = Writer::with_codec(&avro_schema, Vec::new(), Codec::Deflate);
    let field_names: Vec<String> = schema
        .fields
        .iter()
        .map(|f| snowflake_ident(&f.name))
        .collect();

    let mut rows: u64 = 0;
    while let Some(item) = receiver.recv().await {
        let record = item?;
        let mut avro_record = AvroRecord::new(&avro_schema).ok_or_else(|| {
            ConnectorError::ObjectStore("avro schema is not a record".to_string())
        })?;
        for ((field_name, field), value) in field_names
            .iter()
            .zip(&schema.fields)
            .zip(record.values.into_iter())
        {
            avro_record.put(field_name, to_avro_value(value, &field.data_type));
        }
        writer.append(avro_record)?;
        rows += 1;
    }

    let bytes = writer.into_inner()?;
    Ok((bytes, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{
        records::stream::{QRecord, record_stream},
        schema::ColumnSchema,
    };

    fn schema() -> QRecordSchema {
        QRecordSchema::new(vec![
            ColumnSchema::new("id", DataType::Int64),
            ColumnSchema::new("name", DataType::String),
        ])
    }

    #[test]
    fn schema_json_uppercases_field_names() {
        let json = avro_schema_json("orders", &schema());
        assert_eq!(json["name"], "ORDERS");
        assert_eq!(json["fields"][0]["name"], "ID");
        assert_eq!(json["fields"][1]["type"][1], "string");
    }

    #[tokio::test]
    async fn roundtrips_records_through_container() {
        let (mut tx, mut rx) = record_stream(8);
        tx.set_schema(schema()).unwrap();
        tx.send(QRecord::new(vec![Value::Int64(1), Value::String("a".into())]))
            .await
            .unwrap();
        tx.send(QRecord::new(vec![Value::Int64(2), Value::Null]))
            .await
            .unwrap();
        drop(tx);

        let s = rx.schema().await.unwrap();
        let (bytes, rows) = stream_to_avro("orders", &s, &mut rx).await.unwrap();
        assert_eq!(rows, 2);

        let reader = apache_avro::Reader::new(&bytes[..]).unwrap();
        let decoded: Vec<_> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(decoded.len(), 2);
        match &decoded[0] {
            AvroValue::Record(fields) => {
                assert_eq!(fields[0].0, "ID");
                assert_eq!(
                    fields[0].1,
                    AvroValue::Union(1, Box::new(AvroValue::Long(1)))
                );
            }
            other => panic!("expected record, got {other:?}"),
        }
    }
}
