use crate::{
    core::QRepPullConnector,
    error::ConnectorError,
    postgres::{
        client::connect_client,
        source::PgSource,
        values::{data_type_for, value_from_row},
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{TryStreamExt, pin_mut};
use model::{
    core::{identifiers::quote_postgres_ident, value::Value},
    flow::QRepConfig,
    partition::{PartitionRange, QRepPartition, TupleId},
    records::stream::{QRecord, QRecordSchema, QRecordSender},
    schema::ColumnSchema,
};
use tokio_postgres::{Client, types::Type};
use tracing::{debug, info};
use uuid::Uuid;

#[async_trait]
impl QRepPullConnector for PgSource {
    async fn get_qrep_partitions(
        &self,
        config: &QRepConfig,
        last: Option<&QRepPartition>,
    ) -> Result<Vec<QRepPartition>, ConnectorError> {
        let run_uuid = Uuid::new_v4();
        let client = connect_client(self.connection_url()).await?;

        if config.watermark_column.is_empty() {
            // No watermark: the whole table is one partition, once.
            return Ok(match last {
                Some(_) => Vec::new(),
                None => vec![QRepPartition::full_table(run_uuid)],
            });
        }
        if config.watermark_column.eq_ignore_ascii_case("ctid") {
            return tid_partitions(&client, config, run_uuid).await;
        }

        let table = quote_postgres_ident(&config.watermark_table);
        let column = quote_postgres_ident(&config.watermark_column);

        let max_row = client
            .query_one(&format!("SELECT MAX({column}) FROM {table}"), &[])
            .await?;
        let wm_type = max_row.columns()[0].type_().clone();
        let max_value = value_from_row(&max_row, 0, &data_type_for(&wm_type))?;
        if max_value.is_null() {
            return Ok(Vec::new());
        }

        let prev = last.map(|p| range_end_value(&p.range)).transpose()?;
        let bounds = watermark_bounds(&wm_type, prev.as_ref(), &max_value)?;

        let count_sql = format!(
            "SELECT COUNT(*) FROM {table} WHERE {column} > {} AND {column} <= {}",
            bounds.start_literal, bounds.end_literal
        );
        let count: i64 = client.query_one(&count_sql, &[]).await?.get(0);
        if count == 0 {
            return Ok(Vec::new());
        }

        let num_partitions =
            ((count as u64).div_ceil(config.num_rows_per_partition.max(1))).max(1);
        let bucket_sql = format!(
            "SELECT MIN(wm), MAX(wm) FROM ( \
               SELECT NTILE({num_partitions}) OVER (ORDER BY {column}) AS bucket, {column} AS wm \
               FROM {table} WHERE {column} > {} AND {column} <= {} \
             ) buckets GROUP BY bucket ORDER BY MIN(wm)",
            bounds.start_literal, bounds.end_literal
        );
        let rows = client.query(&bucket_sql, &[]).await?;

        let mut partitions = Vec::with_capacity(rows.len());
        let data_type = data_type_for(&wm_type);
        let mut cursor = bounds.start_value;
        for row in &rows {
            let bucket_end = value_from_row(row, 1, &data_type)?;
            if let Some(range) = make_range(&wm_type, &cursor, &bucket_end)? {
                partitions.push(QRepPartition::new(run_uuid, range));
            }
            cursor = bucket_end;
        }

        info!(
            flow = %config.flow_job_name,
            partitions = partitions.len(),
            rows = count,
            "discovered watermark partitions"
        );
        Ok(partitions)
    }

    async fn pull_qrep_records(
        &self,
        config: &QRepConfig,
        partition: &QRepPartition,
        mut sender: QRecordSender,
    ) -> Result<u64, ConnectorError> {
        // A dedicated session per partition keeps snapshot transactions and
        // parallel pulls from trampling each other.
        let client = connect_client(self.connection_url()).await?;

        if let Some(snapshot) = &config.snapshot_name {
            client
                .batch_execute("BEGIN TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
                .await?;
            client
                .execute(
                    &format!("SET TRANSACTION SNAPSHOT '{}'", snapshot.replace('\'', "''")),
                    &[],
                )
                .await?;
        }

        let sql = partition_query(&config.query, &partition.range)?;
        debug!(partition = %partition.partition_id, "running partition query");

        let statement = client.prepare(&sql).await?;
        let schema = QRecordSchema::new(
            statement
                .columns()
                .iter()
                .map(|col| ColumnSchema::new(col.name(), data_type_for(col.type_())))
                .collect(),
        );
        let data_types: Vec<_> = schema.fields.iter().map(|f| f.data_type.clone()).collect();
        sender.set_schema(schema)?;

        let params: Vec<String> = Vec::new();
        let stream = client.query_raw(&statement, params.iter()).await?;
        pin_mut!(stream);

        let mut rows_pulled: u64 = 0;
        loop {
            match stream.try_next().await {
                Ok(Some(row)) => {
                    let mut values = Vec::with_capacity(data_types.len());
                    for (idx, data_type) in data_types.iter().enumerate() {
                        values.push(value_from_row(&row, idx, data_type)?);
                    }
                    sender.send(QRecord::new(values)).await?;
                    rows_pulled += 1;
                }
                Ok(None) => break,
                Err(err) => {
                    sender.fail(err.to_string()).await;
                    return Err(err.into());
                }
            }
        }

        if config.snapshot_name.is_some() {
            client.batch_execute("COMMIT").await?;
        }
        Ok(rows_pulled)
    }

    async fn fetch_max_watermark(
        &self,
        config: &QRepConfig,
    ) -> Result<Option<Value>, ConnectorError> {
        if config.watermark_column.is_empty()
            || config.watermark_column.eq_ignore_ascii_case("ctid")
        {
            return Ok(None);
        }
        let client = connect_client(self.connection_url()).await?;
        let sql = format!(
            "SELECT MAX({}) FROM {}",
            quote_postgres_ident(&config.watermark_column),
            quote_postgres_ident(&config.watermark_table)
        );
        let row = client.query_one(&sql, &[]).await?;
        let value = value_from_row(&row, 0, &data_type_for(row.columns()[0].type_()))?;
        Ok((!value.is_null()).then_some(value))
    }
}

fn is_integer_type(wm_type: &Type) -> bool {
    *wm_type == Type::INT2 || *wm_type == Type::INT4 || *wm_type == Type::INT8
}

fn is_timestamp_type(wm_type: &Type) -> bool {
    *wm_type == Type::TIMESTAMP || *wm_type == Type::TIMESTAMPTZ
}

struct WatermarkBounds {
    start_value: Value,
    start_literal: String,
    end_literal: String,
}

/// Lower/upper bound literals for the partition universe `(prev, max]`.
fn watermark_bounds(
    wm_type: &Type,
    prev: Option<&Value>,
    max: &Value,
) -> Result<WatermarkBounds, ConnectorError> {
    let start_value = match prev {
        Some(v) => v.clone(),
        None if is_integer_type(wm_type) => Value::Int64(i64::MIN),
        None if is_timestamp_type(wm_type) => Value::Timestamp(DateTime::<Utc>::MIN_UTC),
        None => {
            return Err(ConnectorError::Precondition(format!(
                "unsupported watermark column type {wm_type}"
            )));
        }
    };
    Ok(WatermarkBounds {
        start_literal: pg_literal(&start_value, wm_type),
        end_literal: pg_literal(max, wm_type),
        start_value,
    })
}

fn pg_literal(value: &Value, wm_type: &Type) -> String {
    if is_timestamp_type(wm_type) {
        if let Value::Timestamp(ts) = value {
            return format!("'{}'::timestamptz", ts.to_rfc3339());
        }
    }
    value.to_string()
}

fn range_end_value(range: &PartitionRange) -> Result<Value, ConnectorError> {
    match range {
        PartitionRange::Int { end, .. } => Ok(Value::Int64(*end)),
        PartitionRange::Timestamp { end, .. } => Ok(Value::Timestamp(*end)),
        PartitionRange::Tid { .. } | PartitionRange::FullTable => Err(
            ConnectorError::Precondition("previous partition has no watermark value".into()),
        ),
    }
}

/// Builds the `(start, end]` range for one bucket; `None` when the bucket
/// collapsed onto the cursor (all rows shared the boundary watermark).
fn make_range(
    wm_type: &Type,
    start: &Value,
    end: &Value,
) -> Result<Option<PartitionRange>, ConnectorError> {
    if is_integer_type(wm_type) {
        let start = start.as_i64().unwrap_or(i64::MIN);
        let end = end
            .as_i64()
            .ok_or_else(|| ConnectorError::Corrupt("non-integer watermark".into()))?;
        return Ok((end > start).then_some(PartitionRange::Int { start, end }));
    }
    if is_timestamp_type(wm_type) {
        let start = match start {
            Value::Timestamp(ts) => *ts,
            _ => DateTime::<Utc>::MIN_UTC,
        };
        let end = match end {
            Value::Timestamp(ts) => *ts,
            _ => return Err(ConnectorError::Corrupt("non-timestamp watermark".into())),
        };
        return Ok((end > start).then_some(PartitionRange::Timestamp { start, end }));
    }
    Err(ConnectorError::Precondition(format!(
        "unsupported watermark column type {wm_type}"
    )))
}

/// Splits the table into ctid block ranges sized from planner statistics.
async fn tid_partitions(
    client: &Client,
    config: &QRepConfig,
    run_uuid: Uuid,
) -> Result<Vec<QRepPartition>, ConnectorError> {
    let row = client
        .query_one(
            "SELECT GREATEST(relpages, 1)::bigint, GREATEST(reltuples, 1)::float8 \
             FROM pg_class WHERE oid = to_regclass($1)",
            &[&config.watermark_table],
        )
        .await?;
    let relpages: i64 = row.get(0);
    let reltuples: f64 = row.get(1);

    let rows_per_block = (reltuples / relpages as f64).max(1.0);
    let blocks_per_partition =
        ((config.num_rows_per_partition as f64 / rows_per_block).ceil() as i64).max(1);

    let mut partitions = Vec::new();
    let mut block: i64 = 0;
    while block < relpages {
        let end_block = (block + blocks_per_partition).min(relpages);
        let end_offset = if end_block == relpages { u16::MAX } else { 0 };
        partitions.push(QRepPartition::new(
            run_uuid,
            PartitionRange::Tid {
                start: TupleId {
                    block_number: block as u32,
                    offset_number: 0,
                },
                end: TupleId {
                    block_number: end_block as u32,
                    offset_number: end_offset,
                },
            },
        ));
        block = end_block;
    }
    Ok(partitions)
}

/// Substitutes the partition bounds into the configured query. The query
/// carries `{{.start}}` / `{{.end}}` placeholders; a full-table partition
/// must not carry any.
pub fn partition_query(
    query: &str,
    range: &PartitionRange,
) -> Result<String, ConnectorError> {
    let (start, end) = match range {
        PartitionRange::FullTable => {
            if query.contains("{{.start}}") || query.contains("{{.end}}") {
                return Err(ConnectorError::Precondition(
                    "full-table replication query must not have range placeholders".into(),
                ));
            }
            return Ok(query.to_string());
        }
        PartitionRange::Int { start, end } => {
            (Value::Int64(*start).to_string(), Value::Int64(*end).to_string())
        }
        PartitionRange::Timestamp { start, end } => (
            format!("'{}'::timestamptz", start.to_rfc3339()),
            format!("'{}'::timestamptz", end.to_rfc3339()),
        ),
        PartitionRange::Tid { start, end } => (
            format!("'({},{})'::tid", start.block_number, start.offset_number),
            format!("'({},{})'::tid", end.block_number, end.offset_number),
        ),
    };
    Ok(query
        .replace("{{.start}}", &start)
        .replace("{{.end}}", &end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_partition_query_substitutes_bounds() {
        let sql = partition_query(
            "SELECT * FROM n WHERE id > {{.start}} AND id <= {{.end}}",
            &PartitionRange::Int { start: 0, end: 2000 },
        )
        .unwrap();
        assert_eq!(sql, "SELECT * FROM n WHERE id > 0 AND id <= 2000");
    }

    #[test]
    fn tid_partition_query_renders_ctid_literals() {
        let sql = partition_query(
            "SELECT * FROM n WHERE ctid > {{.start}} AND ctid <= {{.end}}",
            &PartitionRange::Tid {
                start: TupleId {
                    block_number: 0,
                    offset_number: 0,
                },
                end: TupleId {
                    block_number: 128,
                    offset_number: 0,
                },
            },
        )
        .unwrap();
        assert!(sql.contains("'(0,0)'::tid"));
        assert!(sql.contains("'(128,0)'::tid"));
    }

    #[test]
    fn full_table_rejects_placeholders() {
        assert!(
            partition_query("SELECT * FROM n WHERE id > {{.start}}", &PartitionRange::FullTable)
                .is_err()
        );
    }

    #[test]
    fn ranges_drop_empty_buckets() {
        let range = make_range(&Type::INT8, &Value::Int64(10), &Value::Int64(10)).unwrap();
        assert!(range.is_none());
    }

    #[test]
    fn consecutive_buckets_chain_into_disjoint_ranges() {
        let wm = Type::INT8;
        let mut cursor = Value::Int64(i64::MIN);
        let bucket_ends = [2000_i64, 4000, 6000, 8000, 10_000];
        let mut ranges = Vec::new();
        for end in bucket_ends {
            if let Some(range) = make_range(&wm, &cursor, &Value::Int64(end)).unwrap() {
                ranges.push(range);
            }
            cursor = Value::Int64(end);
        }
        assert_eq!(ranges.len(), 5);
        // Disjoint and covering: each range starts where the previous ended.
        let mut prev_end = i64::MIN;
        for range in &ranges {
            match range {
                PartitionRange::Int { start, end } => {
                    assert_eq!(*start, prev_end);
                    assert!(end > start);
                    prev_end = *end;
                }
                other => panic!("unexpected range {other:?}"),
            }
        }
        assert_eq!(prev_end, 10_000);
    }
}
