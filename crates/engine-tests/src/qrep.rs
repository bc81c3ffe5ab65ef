#[cfg(test)]
mod tests {
    use crate::utils::{execute, postgres_peer, snowflake_peer};
    use connectors::{
        core::QRepPullConnector,
        registry::{DestinationConnector, SourceConnector},
    };
    use engine_activities::context::QRepContext;
    use engine_flows::qrep::run_qrep_pass;
    use model::{
        flow::{QRepConfig, SyncMode},
        partition::PartitionRange,
    };
    use monitor::NoopMonitor;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn qrep_config(job: &str, table: &str, dest: &str) -> QRepConfig {
        QRepConfig {
            flow_job_name: job.to_string(),
            source: postgres_peer(),
            destination: snowflake_peer(),
            query: format!(
                "SELECT * FROM {table} WHERE id > {{{{.start}}}} AND id <= {{{{.end}}}}"
            ),
            watermark_table: table.to_string(),
            watermark_column: "id".to_string(),
            destination_table_identifier: dest.to_string(),
            num_rows_per_partition: 2_000,
            max_parallel_workers: 4,
            batch_size_int: 1_000,
            sync_mode: SyncMode::MultiInsert,
            staging_path: None,
            initial_copy_only: true,
            wait_between_batches_secs: 0,
            snapshot_name: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[ignore = "requires a live Postgres"]
    async fn ten_thousand_rows_split_into_five_disjoint_partitions() {
        execute(
            "DROP TABLE IF EXISTS qrep_n; \
             CREATE TABLE qrep_n (id INT PRIMARY KEY, ts TIMESTAMPTZ DEFAULT now()); \
             INSERT INTO qrep_n (id) SELECT generate_series(1, 10000);",
        )
        .await;

        let source = SourceConnector::connect(&postgres_peer())
            .await
            .expect("connect source");
        let config = qrep_config("qrep_parts_job", "qrep_n", "qrep_n");
        let partitions = source
            .qrep()
            .get_qrep_partitions(&config, None)
            .await
            .expect("discover partitions");

        assert_eq!(partitions.len(), 5);
        let mut prev_end = i64::MIN;
        let mut covered: i64 = 0;
        for partition in &partitions {
            match &partition.range {
                PartitionRange::Int { start, end } => {
                    assert_eq!(*start, prev_end, "ranges must chain without gaps");
                    covered += *end - (*start).max(0);
                    prev_end = *end;
                }
                other => panic!("expected integer range, got {other:?}"),
            }
        }
        assert_eq!(prev_end, 10_000, "partition universe must reach max(id)");
        assert_eq!(covered, 10_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires a live Postgres and a Snowflake test account"]
    async fn partitioned_copy_lands_every_row() {
        execute(
            "DROP TABLE IF EXISTS qrep_copy; \
             CREATE TABLE qrep_copy (id INT PRIMARY KEY, ts TIMESTAMPTZ DEFAULT now()); \
             INSERT INTO qrep_copy (id) SELECT generate_series(1, 10000);",
        )
        .await;

        let config = qrep_config("qrep_copy_job", "qrep_copy", "qrep_copy");
        let source = Arc::new(
            SourceConnector::connect(&config.source)
                .await
                .expect("connect source"),
        );
        let destination = Arc::new(
            DestinationConnector::connect(&config.destination)
                .await
                .expect("connect destination"),
        );
        let DestinationConnector::Snowflake(dest) = destination.as_ref();
        dest.client()
            .execute("CREATE OR REPLACE TABLE \"QREP_COPY\" (\"ID\" INT, \"TS\" TIMESTAMP_NTZ)")
            .await
            .expect("create destination table");

        let ctx = QRepContext {
            config: Arc::new(config),
            source,
            destination: destination.clone(),
            monitor: Arc::new(NoopMonitor),
            cancel: CancellationToken::new(),
        };
        engine_activities::qrep::setup_qrep_metadata(&ctx)
            .await
            .expect("qrep metadata");

        let summary = run_qrep_pass(&ctx, None).await.expect("replication pass");
        assert_eq!(summary.partitions_processed, 5);
        let last = summary.last_partition;
        assert!(last.is_some());

        let count = dest
            .client()
            .execute("SELECT COUNT(*) FROM \"QREP_COPY\"")
            .await
            .expect("count destination rows")
            .i64_cell(0, 0)
            .unwrap_or(0);
        assert_eq!(count, 10_000);

        // A second pass over an unchanged table finds nothing new.
        let again = run_qrep_pass(&ctx, last.clone()).await.expect("idle pass");
        assert_eq!(again.partitions_processed, 0);
        assert_eq!(again.last_partition, last);
        let count_again = dest
            .client()
            .execute("SELECT COUNT(*) FROM \"QREP_COPY\"")
            .await
            .expect("recount destination rows")
            .i64_cell(0, 0)
            .unwrap_or(0);
        assert_eq!(count_again, 10_000);
    }
}
