use chrono::{DateTime, Utc};
use model::{
    core::{
        data_type::DataType,
        identifiers::{raw_table_name, snowflake_ident},
    },
    records::record::{Lsn, Record},
    schema::{ColumnSchema, TableSchema},
};
use uuid::Uuid;

pub const METADATA_SCHEMA: &str = "_SLUICE_INTERNAL";
pub const MIRROR_JOBS_TABLE: &str = "_SLUICE_INTERNAL.MIRROR_JOBS";
pub const QREP_PARTITIONS_TABLE: &str = "_SLUICE_INTERNAL.QREP_PARTITIONS";
pub const SOFT_DELETE_COLUMN: &str = "_SLUICE_IS_DELETED";

/// Quotes a possibly schema-qualified destination identifier, folding each
/// part the way we create them.
pub fn quote_table(identifier: &str) -> String {
    identifier
        .split('.')
        .map(|part| format!("\"{}\"", snowflake_ident(part)))
        .collect::<Vec<_>>()
        .join(".")
}

fn quote_column(name: &str) -> String {
    format!("\"{}\"", snowflake_ident(name))
}

/// The raw table's `_SLUICE_DESTINATION_TABLE_NAME` key for a destination
/// identifier: the bare table name, folded. Must match on both the landing
/// and normalization sides.
pub fn table_key(identifier: &str) -> String {
    snowflake_ident(identifier.rsplit('.').next().unwrap_or(identifier))
}

pub fn qualified_raw_table(job_name: &str) -> String {
    format!("{METADATA_SCHEMA}.{}", raw_table_name(job_name))
}

fn escape(text: &str) -> String {
    text.replace('\'', "''")
}

/// Idempotent DDL for the internal schema and the per-deployment metadata
/// tables.
pub fn metadata_tables_ddl() -> Vec<String> {
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS {METADATA_SCHEMA}"),
        format!(
            "CREATE TABLE IF NOT EXISTS {MIRROR_JOBS_TABLE} (\
             MIRROR_JOB_NAME STRING NOT NULL, \
             LAST_OFFSET INT NOT NULL, \
             SYNC_BATCH_ID INT NOT NULL, \
             NORMALIZE_BATCH_ID INT NOT NULL, \
             PRIMARY KEY (MIRROR_JOB_NAME))"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {QREP_PARTITIONS_TABLE} (\
             FLOW_JOB_NAME STRING NOT NULL, \
             RUN_UUID STRING NOT NULL, \
             PARTITION_UUID STRING NOT NULL, \
             ROWS_SYNCED INT NOT NULL, \
             SYNCED_AT TIMESTAMP_NTZ NOT NULL, \
             PRIMARY KEY (FLOW_JOB_NAME, PARTITION_UUID))"
        ),
    ]
}

pub fn metadata_tables_probe() -> String {
    format!(
        "SELECT COUNT(*) FROM INFORMATION_SCHEMA.TABLES \
         WHERE TABLE_SCHEMA = '{METADATA_SCHEMA}' AND TABLE_NAME = 'MIRROR_JOBS'"
    )
}

/// Append-only landing table for one mirror job.
pub fn raw_table_ddl(job_name: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         _SLUICE_UID STRING NOT NULL, \
         _SLUICE_TIMESTAMP INT NOT NULL, \
         _SLUICE_DESTINATION_TABLE_NAME STRING NOT NULL, \
         _SLUICE_DATA STRING NOT NULL, \
         _SLUICE_RECORD_TYPE INT NOT NULL, \
         _SLUICE_MATCH_DATA STRING, \
         _SLUICE_BATCH_ID INT NOT NULL)",
        qualified_raw_table(job_name)
    )
}

pub fn normalized_table_ddl(schema: &TableSchema, soft_delete: bool) -> String {
    let mut columns: Vec<String> = schema
        .columns
        .iter()
        .map(|col| {
            format!(
                "{} {}",
                quote_column(&col.name),
                col.data_type.snowflake_name()
            )
        })
        .collect();
    if soft_delete {
        columns.push(format!("{SOFT_DELETE_COLUMN} BOOLEAN DEFAULT FALSE"));
    }
    if !schema.primary_key_columns.is_empty() {
        let keys = schema
            .primary_key_columns
            .iter()
            .map(|k| quote_column(k))
            .collect::<Vec<_>>()
            .join(", ");
        columns.push(format!("PRIMARY KEY ({keys})"));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_table(&schema.table_identifier),
        columns.join(", ")
    )
}

pub fn add_column_ddl(table_identifier: &str, column: &ColumnSchema) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
        quote_table(table_identifier),
        quote_column(&column.name),
        column.data_type.snowflake_name()
    )
}

/// One raw-table row, pre-rendered for literal insertion.
#[derive(Debug, Clone)]
pub struct RawRow {
    pub uid: Uuid,
    pub timestamp_nanos: i64,
    pub destination_table: String,
    pub data: String,
    pub record_type: i64,
    pub match_data: Option<String>,
}

impl RawRow {
    pub fn from_record(record: &Record, uid: Uuid, at: DateTime<Utc>) -> Self {
        Self {
            uid,
            timestamp_nanos: at.timestamp_nanos_opt().unwrap_or(0),
            destination_table: table_key(record.table()),
            data: record.data_items().to_json().to_string(),
            record_type: record.record_type(),
            match_data: record.match_items().map(|items| items.to_json().to_string()),
        }
    }
}

/// Chunked INSERT into the raw table. Caller bounds the chunk size.
pub fn insert_raw_rows_sql(job_name: &str, batch_id: i64, rows: &[RawRow]) -> String {
    let values = rows
        .iter()
        .map(|row| {
            let match_data = match &row.match_data {
                Some(m) => format!("'{}'", escape(m)),
                None => "NULL".to_string(),
            };
            format!(
                "('{}', {}, '{}', '{}', {}, {}, {})",
                row.uid,
                row.timestamp_nanos,
                escape(&row.destination_table),
                escape(&row.data),
                row.record_type,
                match_data,
                batch_id
            )
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} (_SLUICE_UID, _SLUICE_TIMESTAMP, _SLUICE_DESTINATION_TABLE_NAME, \
         _SLUICE_DATA, _SLUICE_RECORD_TYPE, _SLUICE_MATCH_DATA, _SLUICE_BATCH_ID) VALUES {values}",
        qualified_raw_table(job_name)
    )
}

/// Creates or advances the job metadata row. `GREATEST` keeps the offset
/// monotone even if a stale retry lands after a newer commit. The column
/// is `LAST_OFFSET` because `OFFSET` is reserved on the destination.
pub fn upsert_metadata_sql(job_name: &str, last_offset: Lsn, sync_batch_id: i64) -> String {
    format!(
        "MERGE INTO {MIRROR_JOBS_TABLE} M USING (\
         SELECT '{job}' AS JOB, {offset} AS OFFSET_V, {batch} AS BATCH_V) S \
         ON M.MIRROR_JOB_NAME = S.JOB \
         WHEN MATCHED THEN UPDATE SET \
         LAST_OFFSET = GREATEST(M.LAST_OFFSET, S.OFFSET_V), SYNC_BATCH_ID = S.BATCH_V \
         WHEN NOT MATCHED THEN INSERT \
         (MIRROR_JOB_NAME, LAST_OFFSET, SYNC_BATCH_ID, NORMALIZE_BATCH_ID) \
         VALUES (S.JOB, S.OFFSET_V, S.BATCH_V, 0)",
        job = escape(job_name),
        offset = last_offset,
        batch = sync_batch_id
    )
}

pub fn update_normalize_batch_sql(job_name: &str, batch_id: i64) -> String {
    format!(
        "UPDATE {MIRROR_JOBS_TABLE} SET NORMALIZE_BATCH_ID = {batch_id} \
         WHERE MIRROR_JOB_NAME = '{}'",
        escape(job_name)
    )
}

pub fn select_metadata_sql(job_name: &str) -> String {
    format!(
        "SELECT LAST_OFFSET, SYNC_BATCH_ID, NORMALIZE_BATCH_ID FROM {MIRROR_JOBS_TABLE} \
         WHERE MIRROR_JOB_NAME = '{}'",
        escape(job_name)
    )
}

pub fn delete_metadata_sql(job_name: &str) -> String {
    format!(
        "DELETE FROM {MIRROR_JOBS_TABLE} WHERE MIRROR_JOB_NAME = '{}'",
        escape(job_name)
    )
}

/// Destination tables touched inside a batch window.
pub fn distinct_tables_sql(job_name: &str, normalize_batch_id: i64, sync_batch_id: i64) -> String {
    format!(
        "SELECT DISTINCT _SLUICE_DESTINATION_TABLE_NAME FROM {} \
         WHERE _SLUICE_BATCH_ID > {normalize_batch_id} AND _SLUICE_BATCH_ID <= {sync_batch_id}",
        qualified_raw_table(job_name)
    )
}

fn cast_expression(column: &ColumnSchema) -> String {
    let accessor = format!("PAYLOAD:\"{}\"", column.name.replace('"', "\\\""));
    match &column.data_type {
        DataType::Json => accessor,
        DataType::Bytes => format!("TO_BINARY(CAST({accessor} AS STRING), 'HEX')"),
        DataType::Array(_) => format!("CAST({accessor} AS ARRAY)"),
        other => format!("CAST({accessor} AS {})", other.snowflake_name()),
    }
}

/// The normalization MERGE for one destination table over one batch window.
///
/// The source side projects the raw rows for the window, casts the JSON
/// payload into typed columns, and keeps only the latest event per primary
/// key (`RANK` over commit timestamp, uid as the stable tiebreaker).
/// Deletes take their key values from the pre-image.
pub fn merge_statement(
    job_name: &str,
    schema: &TableSchema,
    normalize_batch_id: i64,
    sync_batch_id: i64,
    soft_delete: bool,
) -> String {
    let target = quote_table(&schema.table_identifier);
    let table_key = table_key(&schema.table_identifier);

    let flatten_columns = schema
        .columns
        .iter()
        .map(|col| format!("{} AS {}", cast_expression(col), quote_column(&col.name)))
        .collect::<Vec<_>>()
        .join(", ");

    let partition_keys = schema
        .primary_key_columns
        .iter()
        .map(|k| quote_column(k))
        .collect::<Vec<_>>()
        .join(", ");

    let on_clause = schema
        .primary_key_columns
        .iter()
        .map(|k| {
            let col = quote_column(k);
            format!("TARGET.{col} = SOURCE.{col}")
        })
        .collect::<Vec<_>>()
        .join(" AND ");

    let mut insert_columns = schema
        .columns
        .iter()
        .map(|col| quote_column(&col.name))
        .collect::<Vec<_>>();
    let mut insert_values = schema
        .columns
        .iter()
        .map(|col| format!("SOURCE.{}", quote_column(&col.name)))
        .collect::<Vec<_>>();
    let mut update_assignments = schema
        .columns
        .iter()
        .map(|col| {
            let c = quote_column(&col.name);
            format!("{c} = SOURCE.{c}")
        })
        .collect::<Vec<_>>();
    if soft_delete {
        insert_columns.push(SOFT_DELETE_COLUMN.to_string());
        insert_values.push("FALSE".to_string());
        update_assignments.push(format!("{SOFT_DELETE_COLUMN} = FALSE"));
    }

    let matched_delete = if soft_delete {
        format!(
            "WHEN MATCHED AND SOURCE._SLUICE_RECORD_TYPE = 2 THEN \
             UPDATE SET {SOFT_DELETE_COLUMN} = TRUE"
        )
    } else {
        "WHEN MATCHED AND SOURCE._SLUICE_RECORD_TYPE = 2 THEN DELETE".to_string()
    };

    format!(
        "MERGE INTO {target} TARGET USING (\
         WITH RAW_ROWS AS (\
         SELECT _SLUICE_UID, _SLUICE_TIMESTAMP, _SLUICE_RECORD_TYPE, \
         CASE WHEN _SLUICE_RECORD_TYPE = 2 THEN PARSE_JSON(_SLUICE_MATCH_DATA) \
         ELSE PARSE_JSON(_SLUICE_DATA) END AS PAYLOAD \
         FROM {raw_table} \
         WHERE _SLUICE_BATCH_ID > {normalize_batch_id} \
         AND _SLUICE_BATCH_ID <= {sync_batch_id} \
         AND _SLUICE_DESTINATION_TABLE_NAME = '{table_key}'\
         ), FLATTENED AS (\
         SELECT _SLUICE_UID, _SLUICE_TIMESTAMP, _SLUICE_RECORD_TYPE, {flatten_columns} \
         FROM RAW_ROWS\
         ), DEDUPLICATED AS (\
         SELECT * FROM FLATTENED QUALIFY \
         RANK() OVER (PARTITION BY {partition_keys} \
         ORDER BY _SLUICE_TIMESTAMP DESC, _SLUICE_UID DESC) = 1\
         ) SELECT * FROM DEDUPLICATED\
         ) SOURCE ON {on_clause} \
         WHEN NOT MATCHED AND SOURCE._SLUICE_RECORD_TYPE != 2 THEN \
         INSERT ({insert_cols}) VALUES ({insert_vals}) \
         WHEN MATCHED AND SOURCE._SLUICE_RECORD_TYPE != 2 THEN \
         UPDATE SET {update_assignments} \
         {matched_delete}",
        raw_table = qualified_raw_table(job_name),
        insert_cols = insert_columns.join(", "),
        insert_vals = insert_values.join(", "),
        update_assignments = update_assignments.join(", "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{
        core::value::{FieldValue, Value},
        records::record::RowItems,
    };

    fn schema() -> TableSchema {
        TableSchema {
            table_identifier: "t".into(),
            columns: vec![
                ColumnSchema::new("id", DataType::Int32),
                ColumnSchema::new("v", DataType::String),
            ],
            primary_key_columns: vec!["id".into()],
            replica_identity_full: false,
        }
    }

    #[test]
    fn merge_routes_deletes_through_preimage() {
        let sql = merge_statement("job", &schema(), 0, 1, false);
        assert!(sql.contains(
            "CASE WHEN _SLUICE_RECORD_TYPE = 2 THEN PARSE_JSON(_SLUICE_MATCH_DATA)"
        ));
        assert!(sql.contains("WHEN MATCHED AND SOURCE._SLUICE_RECORD_TYPE = 2 THEN DELETE"));
    }

    #[test]
    fn merge_dedups_by_rank_with_uid_tiebreak() {
        let sql = merge_statement("job", &schema(), 0, 1, false);
        assert!(sql.contains(
            "RANK() OVER (PARTITION BY \"ID\" ORDER BY _SLUICE_TIMESTAMP DESC, _SLUICE_UID DESC) = 1"
        ));
    }

    #[test]
    fn merge_supports_composite_primary_keys() {
        let mut schema = schema();
        schema.primary_key_columns = vec!["id".into(), "v".into()];
        let sql = merge_statement("job", &schema, 0, 1, false);
        assert!(sql.contains("PARTITION BY \"ID\", \"V\""));
        assert!(sql.contains("TARGET.\"ID\" = SOURCE.\"ID\" AND TARGET.\"V\" = SOURCE.\"V\""));
    }

    #[test]
    fn merge_soft_delete_flags_instead_of_deleting() {
        let sql = merge_statement("job", &schema(), 0, 1, true);
        assert!(sql.contains("UPDATE SET _SLUICE_IS_DELETED = TRUE"));
        assert!(!sql.contains("THEN DELETE"));
        assert!(sql.contains("_SLUICE_IS_DELETED = FALSE"));
    }

    #[test]
    fn merge_windows_on_batch_ids() {
        let sql = merge_statement("job", &schema(), 3, 7, false);
        assert!(sql.contains("_SLUICE_BATCH_ID > 3"));
        assert!(sql.contains("_SLUICE_BATCH_ID <= 7"));
    }

    #[test]
    fn raw_insert_escapes_json_payload() {
        let record = Record::Insert {
            table: "t".into(),
            checkpoint: 5,
            items: RowItems::new(vec![FieldValue::new("v", Value::String("it's".into()))]),
        };
        let row = RawRow::from_record(&record, Uuid::nil(), Utc::now());
        let sql = insert_raw_rows_sql("job", 1, &[row]);
        assert!(sql.contains("{\"v\":\"it''s\"}"));
        assert!(sql.contains("_SLUICE_RAW_JOB"));
    }

    #[test]
    fn metadata_upsert_keeps_offset_monotone() {
        let sql = upsert_metadata_sql("job", 42, 3);
        assert!(sql.contains("GREATEST(M.LAST_OFFSET, S.OFFSET_V)"));
        assert!(sql.contains("VALUES (S.JOB, S.OFFSET_V, S.BATCH_V, 0)"));
    }

    /// `OFFSET` is reserved on the destination; every metadata statement
    /// must go through the `LAST_OFFSET` column and the DDL, upsert and
    /// select must agree on it.
    #[test]
    fn metadata_statements_avoid_the_reserved_offset_keyword() {
        let ddl = metadata_tables_ddl()
            .into_iter()
            .find(|s| s.contains("MIRROR_JOBS"))
            .unwrap();
        let upsert = upsert_metadata_sql("job", 42, 3);
        let select = select_metadata_sql("job");

        assert!(ddl.contains("LAST_OFFSET INT NOT NULL"));
        assert!(select.starts_with("SELECT LAST_OFFSET, SYNC_BATCH_ID, NORMALIZE_BATCH_ID"));
        assert!(upsert.contains("LAST_OFFSET = GREATEST(M.LAST_OFFSET, S.OFFSET_V)"));
        for statement in [&ddl, &upsert, &select] {
            for token in statement.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_')) {
                assert_ne!(token, "OFFSET", "bare reserved identifier in: {statement}");
            }
        }
    }

    #[test]
    fn normalized_ddl_types_follow_mapping() {
        let mut schema = schema();
        schema.columns.push(ColumnSchema::new("ts", DataType::Timestamp));
        let ddl = normalized_table_ddl(&schema, true);
        assert!(ddl.contains("\"TS\" TIMESTAMP_NTZ"));
        assert!(ddl.contains("_SLUICE_IS_DELETED BOOLEAN DEFAULT FALSE"));
        assert!(ddl.contains("PRIMARY KEY (\"ID\")"));
    }

    #[test]
    fn bytes_columns_flatten_through_to_binary() {
        let mut schema = schema();
        schema.columns.push(ColumnSchema::new("b", DataType::Bytes));
        let sql = merge_statement("job", &schema, 0, 1, false);
        assert!(sql.contains("TO_BINARY(CAST(PAYLOAD:\"b\" AS STRING), 'HEX') AS \"B\""));
    }
}
