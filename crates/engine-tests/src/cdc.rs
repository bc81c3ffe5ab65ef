#[cfg(test)]
mod tests {
    use crate::utils::{
        execute, flow_configs, pg_client, postgres_peer, publication_exists, slot_exists,
    };
    use connectors::{
        core::{CdcPullConnector, PullFlowCleanupRequest, SetupReplicationRequest},
        registry::{DestinationConnector, SourceConnector},
        snowflake::sql,
    };
    use engine_activities::{cdc, context::FlowContext, setup};
    use engine_core::control::ControlHub;
    use engine_flows::cdc::CdcFlow;
    use engine_core::state::sled_store::SledFlowStateStore;
    use model::core::identifiers::snowflake_ident;
    use monitor::NoopMonitor;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    async fn flow_context(job: &str, source_table: &str, dest_table: &str) -> FlowContext {
        let config = flow_configs(job, source_table, dest_table);
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
        FlowContext {
            config: Arc::new(config),
            source,
            destination,
            monitor: Arc::new(NoopMonitor),
            cancel: CancellationToken::new(),
        }
    }

    async fn sf_count(ctx: &FlowContext, sql_text: &str) -> i64 {
        let DestinationConnector::Snowflake(dest) = ctx.destination.as_ref();
        dest.client()
            .execute(sql_text)
            .await
            .expect("snowflake query")
            .i64_cell(0, 0)
            .unwrap_or(0)
    }

    async fn run_setup(ctx: &FlowContext) {
        setup::check_connections(ctx).await.expect("connections");
        setup::setup_metadata_tables(ctx).await.expect("metadata");
        setup::ensure_pullability(ctx).await.expect("pullability");
        setup::setup_replication(ctx).await.expect("replication");
        setup::create_raw_table(ctx).await.expect("raw table");
        setup::setup_normalized_tables(ctx).await.expect("tables");
    }

    async fn teardown(ctx: &FlowContext) {
        cdc::drop_flow(ctx).await.expect("drop flow");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[ignore = "requires a live logical-replication Postgres and a Snowflake test account"]
    async fn insert_update_delete_normalize_to_empty_table() {
        execute("DROP TABLE IF EXISTS cdc_basic; CREATE TABLE cdc_basic (id INT PRIMARY KEY, v TEXT)").await;
        let ctx = flow_context("cdc_basic_job", "public.cdc_basic", "cdc_basic").await;
        run_setup(&ctx).await;

        execute(
            "INSERT INTO cdc_basic VALUES (1, 'a'); \
             UPDATE cdc_basic SET v = 'b' WHERE id = 1; \
             DELETE FROM cdc_basic WHERE id = 1;",
        )
        .await;

        let output = cdc::start_flow(&ctx).await.expect("start flow");
        let response = output.sync_response.expect("records synced");
        assert_eq!(response.num_records_synced, 3);

        // All three raw rows landed under one batch id with their types.
        let raw = sql::qualified_raw_table("cdc_basic_job");
        let raw_rows = sf_count(
            &ctx,
            &format!(
                "SELECT COUNT(*) FROM {raw} WHERE _SLUICE_BATCH_ID = {}",
                response.current_sync_batch_id
            ),
        )
        .await;
        assert_eq!(raw_rows, 3);
        for record_type in [0, 1, 2] {
            let n = sf_count(
                &ctx,
                &format!("SELECT COUNT(*) FROM {raw} WHERE _SLUICE_RECORD_TYPE = {record_type}"),
            )
            .await;
            assert_eq!(n, 1, "expected one row of type {record_type}");
        }

        let normalize = cdc::start_normalize(&ctx).await.expect("normalize");
        assert_eq!(normalize.end_batch_id, response.current_sync_batch_id);

        // The lifecycle collapses to nothing: insert+update+delete = absent.
        let dest_rows = sf_count(
            &ctx,
            &format!("SELECT COUNT(*) FROM \"{}\"", snowflake_ident("cdc_basic")),
        )
        .await;
        assert_eq!(dest_rows, 0);

        teardown(&ctx).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[ignore = "requires a live logical-replication Postgres and a Snowflake test account"]
    async fn replayed_batch_normalizes_to_single_row() {
        execute("DROP TABLE IF EXISTS cdc_dedup; CREATE TABLE cdc_dedup (id INT PRIMARY KEY, v TEXT)").await;
        let ctx = flow_context("cdc_dedup_job", "public.cdc_dedup", "cdc_dedup").await;
        run_setup(&ctx).await;

        execute("INSERT INTO cdc_dedup VALUES (1, 'a')").await;
        cdc::start_flow(&ctx).await.expect("batch 1");
        cdc::start_normalize(&ctx).await.expect("normalize 1");

        execute("UPDATE cdc_dedup SET v = 'b' WHERE id = 1").await;
        let second = cdc::start_flow(&ctx)
            .await
            .expect("batch 2")
            .sync_response
            .expect("records synced");

        // Land the same batch's raw rows a second time to model a replayed
        // step, then normalize once.
        let DestinationConnector::Snowflake(dest) = ctx.destination.as_ref();
        let raw = sql::qualified_raw_table("cdc_dedup_job");
        dest.client()
            .execute(&format!(
                "INSERT INTO {raw} SELECT * FROM {raw} WHERE _SLUICE_BATCH_ID = {}",
                second.current_sync_batch_id
            ))
            .await
            .expect("replay raw rows");

        cdc::start_normalize(&ctx).await.expect("normalize 2");

        let table = format!("\"{}\"", snowflake_ident("cdc_dedup"));
        assert_eq!(sf_count(&ctx, &format!("SELECT COUNT(*) FROM {table}")).await, 1);
        let v = {
            let result = dest
                .client()
                .execute(&format!("SELECT \"V\" FROM {table} WHERE \"ID\" = 1"))
                .await
                .expect("read row");
            result.cell(0, 0).map(str::to_string)
        };
        assert_eq!(v.as_deref(), Some("b"));

        teardown(&ctx).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[ignore = "requires a live logical-replication Postgres and a Snowflake test account"]
    async fn added_source_column_reaches_destination() {
        execute("DROP TABLE IF EXISTS cdc_drift; CREATE TABLE cdc_drift (id INT PRIMARY KEY, v TEXT)").await;
        let ctx = flow_context("cdc_drift_job", "public.cdc_drift", "cdc_drift").await;
        run_setup(&ctx).await;

        execute("INSERT INTO cdc_drift VALUES (1, 'a')").await;
        cdc::start_flow(&ctx).await.expect("warmup batch");

        execute("ALTER TABLE cdc_drift ADD COLUMN c INT; INSERT INTO cdc_drift VALUES (2, 'x', 5)")
            .await;
        let output = cdc::start_flow(&ctx).await.expect("drift batch");
        assert!(
            output
                .schema_deltas
                .iter()
                .any(|d| d.added_columns.iter().any(|c| c.name == "c")),
            "pull should surface the added column"
        );
        cdc::replay_schema_deltas(&ctx, &output.schema_deltas)
            .await
            .expect("replay deltas");

        let cols = sf_count(
            &ctx,
            &format!(
                "SELECT COUNT(*) FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_NAME = '{}' AND COLUMN_NAME = 'C'",
                snowflake_ident("cdc_drift")
            ),
        )
        .await;
        assert_eq!(cols, 1, "destination column set must grow");

        teardown(&ctx).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[ignore = "requires a live logical-replication Postgres"]
    async fn adopted_slot_and_publication_survive_cleanup() {
        execute("DROP TABLE IF EXISTS cdc_adopt; CREATE TABLE cdc_adopt (id INT PRIMARY KEY, v TEXT)").await;
        let pg = pg_client().await;
        pg.batch_execute("CREATE PUBLICATION p0 FOR TABLE cdc_adopt")
            .await
            .expect("create publication");
        pg.query_one(
            "SELECT lsn FROM pg_create_logical_replication_slot('s0', 'pgoutput')",
            &[],
        )
        .await
        .expect("create slot");

        let source = SourceConnector::connect(&postgres_peer())
            .await
            .expect("connect source");
        let setup_req = SetupReplicationRequest {
            flow_job_name: "cdc_adopt_job".into(),
            slot_name: "s0".into(),
            publication_name: "p0".into(),
            create_slot: false,
            create_publication: false,
            source_tables: vec!["public.cdc_adopt".into()],
            do_initial_copy: false,
        };
        let output = source
            .cdc()
            .setup_replication(&setup_req)
            .await
            .expect("adopt existing slot");
        assert_eq!(output.slot_name, "s0");
        assert!(output.snapshot_name.is_none());

        // Cleanup with ownership flags off must leave both objects alone.
        source
            .cdc()
            .pull_flow_cleanup(&PullFlowCleanupRequest {
                flow_job_name: "cdc_adopt_job".into(),
                slot_name: "s0".into(),
                publication_name: "p0".into(),
                drop_slot: false,
                drop_publication: false,
            })
            .await
            .expect("cleanup");

        assert!(slot_exists("s0").await);
        assert!(publication_exists("p0").await);

        pg.batch_execute("SELECT pg_drop_replication_slot('s0'); DROP PUBLICATION p0")
            .await
            .expect("cleanup test objects");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[ignore = "requires a live logical-replication Postgres and a Snowflake test account"]
    async fn soft_delete_flags_rows_in_place() {
        execute("DROP TABLE IF EXISTS cdc_soft; CREATE TABLE cdc_soft (id INT PRIMARY KEY, v TEXT)").await;
        let mut config = flow_configs("cdc_soft_job", "public.cdc_soft", "cdc_soft");
        config.soft_delete = true;
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
        let ctx = FlowContext {
            config: Arc::new(config),
            source,
            destination,
            monitor: Arc::new(NoopMonitor),
            cancel: CancellationToken::new(),
        };
        run_setup(&ctx).await;

        execute("INSERT INTO cdc_soft VALUES (1, 'keep')").await;
        cdc::start_flow(&ctx).await.expect("insert batch");
        cdc::start_normalize(&ctx).await.expect("normalize insert");

        execute("DELETE FROM cdc_soft WHERE id = 1").await;
        cdc::start_flow(&ctx).await.expect("delete batch");
        cdc::start_normalize(&ctx).await.expect("normalize delete");

        let DestinationConnector::Snowflake(dest) = ctx.destination.as_ref();
        let result = dest
            .client()
            .execute(&format!(
                "SELECT \"V\", _SLUICE_IS_DELETED FROM \"{}\" WHERE \"ID\" = 1",
                snowflake_ident("cdc_soft")
            ))
            .await
            .expect("read soft-deleted row");
        assert_eq!(result.cell(0, 0), Some("keep"));
        assert_eq!(result.cell(0, 1), Some("true"));

        teardown(&ctx).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[ignore = "requires a live logical-replication Postgres and a Snowflake test account"]
    async fn full_flow_survives_a_generation_restart() {
        execute("DROP TABLE IF EXISTS cdc_gen; CREATE TABLE cdc_gen (id INT PRIMARY KEY, v TEXT)").await;
        let ctx = flow_context("cdc_gen_job", "public.cdc_gen", "cdc_gen").await;

        let dir = tempdir().unwrap();
        let store = Arc::new(SledFlowStateStore::open(dir.path()).unwrap());
        let control = ControlHub::new().register("cdc_gen_job").await;
        let flow = CdcFlow::new(ctx.clone(), store.clone(), control.clone());

        execute("INSERT INTO cdc_gen VALUES (1, 'a'), (2, 'b')").await;
        let runner = tokio::spawn(async move { flow.run().await });

        // Give the flow time to land the first batch, then ask it to stop.
        tokio::time::sleep(std::time::Duration::from_secs(20)).await;
        control.signal_shutdown();
        let result = runner.await.expect("flow task");
        assert!(result.is_ok() || result.as_ref().err().is_some_and(|e| e.is_shutdown()));
    }
}
