//! Pure pipeline-shape checks that run without any live endpoint: pgoutput
//! bytes → typed records → raw-table rows → normalization MERGE text.

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use connectors::{
        postgres::decoder::{PgOutputMessage, decode_message},
        snowflake::sql::{RawRow, insert_raw_rows_sql, merge_statement},
    };
    use model::{
        core::{
            data_type::DataType,
            value::{FieldValue, Value},
        },
        records::{batch::RecordBatch, record::{Record, RowItems}},
        schema::{ColumnSchema, TableSchema},
    };
    use tracing_test::traced_test;
    use uuid::Uuid;

    fn row(id: i32, v: &str) -> RowItems {
        RowItems::new(vec![
            FieldValue::new("id", Value::Int32(id)),
            FieldValue::new("v", Value::String(v.into())),
        ])
    }

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

    /// The S1 lifecycle in miniature: one batch carrying insert, update and
    /// delete for the same key produces three raw rows with the expected
    /// discriminants, and the merge statement dedups to the delete.
    #[traced_test]
    #[test]
    fn lifecycle_batch_renders_three_raw_rows_and_one_merge() {
        let mut batch = RecordBatch::default();
        batch.push(Record::Insert {
            table: "t".into(),
            checkpoint: 100,
            items: row(1, "a"),
        });
        batch.push(Record::Update {
            table: "t".into(),
            checkpoint: 100,
            old_items: row(1, "a"),
            new_items: row(1, "b"),
        });
        batch.push(Record::Delete {
            table: "t".into(),
            checkpoint: 100,
            items: row(1, "b"),
        });
        assert_eq!(batch.first_checkpoint, 100);
        assert_eq!(batch.last_checkpoint, 100);

        let now = Utc::now();
        let raw_rows: Vec<RawRow> = batch
            .records
            .iter()
            .map(|r| RawRow::from_record(r, Uuid::new_v4(), now))
            .collect();
        assert_eq!(
            raw_rows.iter().map(|r| r.record_type).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        // Inserts carry no pre-image; updates and deletes do.
        assert!(raw_rows[0].match_data.is_none());
        assert!(raw_rows[1].match_data.as_deref().unwrap().contains("\"a\""));
        assert!(raw_rows[2].match_data.as_deref().unwrap().contains("\"b\""));

        let insert_sql = insert_raw_rows_sql("job", 1, &raw_rows);
        assert_eq!(insert_sql.matches("('").count(), 3, "one tuple per record");
        assert!(insert_sql.contains("_SLUICE_BATCH_ID"));

        let merge = merge_statement("job", &schema(), 0, 1, false);
        assert!(merge.contains("_SLUICE_RECORD_TYPE = 2 THEN DELETE"));
    }

    /// Checkpoints carried per record bound the batch window.
    #[test]
    fn batch_checkpoints_are_monotone_across_transactions() {
        let mut batch = RecordBatch::default();
        for (cp, v) in [(10u64, "a"), (20, "b"), (30, "c")] {
            batch.push(Record::Insert {
                table: "t".into(),
                checkpoint: cp,
                items: row(cp as i32, v),
            });
        }
        assert_eq!(batch.first_checkpoint, 10);
        assert_eq!(batch.last_checkpoint, 30);
        assert!(
            batch
                .records
                .windows(2)
                .all(|w| w[0].checkpoint() <= w[1].checkpoint())
        );
    }

    /// A decoded wire message round-trips into the same shape the source
    /// connector feeds the batch with.
    #[test]
    fn wire_insert_decodes_into_relation_order() {
        // Relation for t(id int4 key, v text), then an insert of (7, 'x').
        let mut rel = Vec::new();
        rel.push(b'R');
        rel.extend(16384u32.to_be_bytes());
        rel.extend(b"public\0");
        rel.extend(b"t\0");
        rel.push(b'd');
        rel.extend(2u16.to_be_bytes());
        rel.push(1);
        rel.extend(b"id\0");
        rel.extend(23u32.to_be_bytes());
        rel.extend((-1i32).to_be_bytes());
        rel.push(0);
        rel.extend(b"v\0");
        rel.extend(25u32.to_be_bytes());
        rel.extend((-1i32).to_be_bytes());

        let mut ins = Vec::new();
        ins.push(b'I');
        ins.extend(16384u32.to_be_bytes());
        ins.push(b'N');
        ins.extend(2u16.to_be_bytes());
        ins.push(b't');
        ins.extend(1u32.to_be_bytes());
        ins.extend(b"7");
        ins.push(b't');
        ins.extend(1u32.to_be_bytes());
        ins.extend(b"x");

        let rel_msg = decode_message(&rel).unwrap();
        let PgOutputMessage::Relation(descriptor) = rel_msg else {
            panic!("expected relation message");
        };
        assert_eq!(descriptor.qualified_name(), "public.t");

        let ins_msg = decode_message(&ins).unwrap();
        let PgOutputMessage::Row(event) = ins_msg else {
            panic!("expected row message");
        };
        let tuple = event.new_tuple.unwrap();
        assert_eq!(tuple.len(), descriptor.columns.len());
    }
}
