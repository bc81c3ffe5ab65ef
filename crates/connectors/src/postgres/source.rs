use crate::{
    core::{
        CdcPullConnector, PullFlowCleanupRequest, PullRecordsRequest, SetupReplicationOutput,
        SetupReplicationRequest,
    },
    error::ConnectorError,
    postgres::{
        client::{PostgresConfig, connect_client},
        decoder::{
            PgOutputMessage, RelationDescriptor, RelationMapping, RowEvent, RowEventKind,
            TupleCell, TupleData, decode_message,
        },
        values::parse_text_value,
    },
};
use async_trait::async_trait;
use model::{
    core::{
        identifiers::quote_postgres_ident,
        value::{FieldValue, Value},
    },
    flow::Peer,
    records::{
        batch::RecordBatch,
        record::{Lsn, Record, RowItems, format_lsn},
    },
    schema::{ColumnSchema, TableSchema, TableSchemaDelta},
};
use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tokio_postgres::{Client, types::PgLsn};
use tracing::{debug, info, warn};

const PEEK_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A session pinning an exported snapshot. The transaction stays open until
/// the initial copy finishes; dropping the client rolls it back.
struct SnapshotSession {
    client: Client,
    snapshot_name: String,
}

pub struct PgSource {
    client: Client,
    config: PostgresConfig,
    snapshot: Mutex<Option<SnapshotSession>>,
}

impl PgSource {
    pub async fn connect(peer: &Peer) -> Result<Self, ConnectorError> {
        let config = PostgresConfig::from_peer(peer)?;
        let client = connect_client(&config.url).await?;
        Ok(Self {
            client,
            config,
            snapshot: Mutex::new(None),
        })
    }

    /// Opens a dedicated session, pins a repeatable-read snapshot and
    /// exports it for other sessions to adopt.
    async fn export_snapshot(&self) -> Result<String, ConnectorError> {
        let client = connect_client(&self.config.url).await?;
        client
            .batch_execute("BEGIN TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .await?;
        let row = client.query_one("SELECT pg_export_snapshot()", &[]).await?;
        let snapshot_name: String = row.get(0);
        info!(snapshot = %snapshot_name, "exported consistent snapshot");

        let mut guard = self.snapshot.lock().await;
        *guard = Some(SnapshotSession {
            client,
            snapshot_name: snapshot_name.clone(),
        });
        Ok(snapshot_name)
    }

    /// Commits and releases the snapshot session once the initial copy is
    /// done.
    pub async fn release_snapshot(&self) -> Result<(), ConnectorError> {
        let mut guard = self.snapshot.lock().await;
        if let Some(session) = guard.take() {
            session.client.batch_execute("COMMIT").await?;
            debug!(snapshot = %session.snapshot_name, "released snapshot session");
        }
        Ok(())
    }

    async fn slot_confirmed_flush(&self, slot_name: &str) -> Result<Option<Lsn>, ConnectorError> {
        let row = self
            .client
            .query_opt(
                "SELECT confirmed_flush_lsn FROM pg_replication_slots WHERE slot_name = $1",
                &[&slot_name],
            )
            .await?;
        Ok(row.map(|r| {
            let lsn: PgLsn = r.get(0);
            lsn.into()
        }))
    }

    async fn publication_exists(&self, name: &str) -> Result<bool, ConnectorError> {
        let row = self
            .client
            .query_opt("SELECT 1 FROM pg_publication WHERE pubname = $1", &[&name])
            .await?;
        Ok(row.is_some())
    }

    pub(crate) fn connection_url(&self) -> &str {
        &self.config.url
    }
}

#[async_trait]
impl CdcPullConnector for PgSource {
    async fn check_connection(&self) -> Result<(), ConnectorError> {
        self.client.query_one("SELECT 1", &[]).await?;
        Ok(())
    }

    async fn ensure_pullability(&self, tables: &[String]) -> Result<(), ConnectorError> {
        for table in tables {
            let (schema, name) = split_qualified(table);
            let row = self
                .client
                .query_opt(
                    "SELECT c.relkind::text FROM pg_class c \
                     JOIN pg_namespace n ON n.oid = c.relnamespace \
                     WHERE n.nspname = $1 AND c.relname = $2",
                    &[&schema, &name],
                )
                .await?;
            match row {
                None => {
                    return Err(ConnectorError::Precondition(format!(
                        "source table {table} does not exist"
                    )));
                }
                Some(row) => {
                    let relkind: String = row.get(0);
                    if relkind != "r" && relkind != "p" {
                        return Err(ConnectorError::Precondition(format!(
                            "source table {table} is not a plain table (relkind {relkind})"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    async fn setup_replication(
        &self,
        req: &SetupReplicationRequest,
    ) -> Result<SetupReplicationOutput, ConnectorError> {
        if req.create_publication {
            if self.publication_exists(&req.publication_name).await? {
                debug!(publication = %req.publication_name, "publication already present");
            } else {
                let tables = req
                    .source_tables
                    .iter()
                    .map(|t| quote_postgres_ident(t))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "CREATE PUBLICATION {} FOR TABLE {tables}",
                    quote_postgres_ident(&req.publication_name)
                );
                self.client.batch_execute(&sql).await?;
                info!(publication = %req.publication_name, "created publication");
            }
        } else if !self.publication_exists(&req.publication_name).await? {
            return Err(ConnectorError::Precondition(format!(
                "configured publication {} does not exist",
                req.publication_name
            )));
        }

        let consistent_point = match self.slot_confirmed_flush(&req.slot_name).await? {
            Some(confirmed) => {
                info!(slot = %req.slot_name, lsn = %format_lsn(confirmed), "adopting existing replication slot");
                confirmed
            }
            None => {
                if !req.create_slot {
                    return Err(ConnectorError::Precondition(format!(
                        "configured replication slot {} does not exist",
                        req.slot_name
                    )));
                }
                let row = self
                    .client
                    .query_one(
                        "SELECT lsn FROM pg_create_logical_replication_slot($1, 'pgoutput')",
                        &[&req.slot_name],
                    )
                    .await?;
                let lsn: PgLsn = row.get(0);
                let consistent_point: Lsn = lsn.into();
                info!(
                    slot = %req.slot_name,
                    lsn = %format_lsn(consistent_point),
                    "created logical replication slot"
                );
                consistent_point
            }
        };

        let snapshot_name = if req.do_initial_copy {
            Some(self.export_snapshot().await?)
        } else {
            None
        };

        Ok(SetupReplicationOutput {
            slot_name: req.slot_name.clone(),
            snapshot_name,
            consistent_point,
        })
    }

    async fn pull_records(
        &self,
        req: &PullRecordsRequest,
    ) -> Result<RecordBatch, ConnectorError> {
        // Reconcile the slot with the offset the destination has durably
        // committed; a crash between sync and feedback leaves it behind.
        self.confirm_flushed_offset(&req.slot_name, req.last_offset)
            .await?;

        let deadline = Instant::now() + req.idle_timeout;
        let mut peek_limit =
            (req.max_batch_size.saturating_mul(3) + 128).min(i32::MAX as usize) as i32;
        let peek_sql = format!(
            "SELECT lsn, data FROM pg_logical_slot_peek_binary_changes($1, NULL, $2, \
             'proto_version', '1', 'publication_names', '{}')",
            req.publication_name.replace('\'', "''")
        );

        let mut batch = RecordBatch::default();
        let mut relations: RelationMapping = HashMap::new();
        let mut seen_deltas: HashSet<(String, String)> = HashSet::new();
        // Transactions at or below this point are already durable downstream.
        let mut resume_lsn = req.last_offset;

        'pull: loop {
            let rows = self
                .client
                .query(&peek_sql, &[&req.slot_name, &peek_limit])
                .await?;
            let window_full = rows.len() as i32 >= peek_limit;

            let mut progressed = false;
            let mut txn: Vec<RowEvent> = Vec::new();

            for row in &rows {
                let data: &[u8] = row.get(1);
                match decode_message(data)? {
                    PgOutputMessage::Begin { .. } => txn.clear(),
                    PgOutputMessage::Relation(rel) => {
                        self.collect_schema_delta(&rel, req, &mut seen_deltas, &mut batch);
                        relations.insert(rel.rel_id, rel);
                    }
                    PgOutputMessage::Row(event) => txn.push(event),
                    PgOutputMessage::Commit { end_lsn, .. } => {
                        if end_lsn <= resume_lsn {
                            // Already synced (or replayed by an earlier peek
                            // in this pull); skip the whole transaction.
                            txn.clear();
                            continue;
                        }
                        for event in txn.drain(..) {
                            if let Some(record) =
                                convert_event(&relations, event, req, end_lsn)?
                            {
                                batch.push(record);
                            }
                        }
                        batch.last_checkpoint = batch.last_checkpoint.max(end_lsn);
                        if batch.first_checkpoint == 0 {
                            batch.first_checkpoint = end_lsn;
                        }
                        resume_lsn = end_lsn;
                        progressed = true;
                        if batch.len() >= req.max_batch_size {
                            break 'pull;
                        }
                    }
                    PgOutputMessage::Truncate { rel_ids } => {
                        // Truncates are not replayed; flag them so the
                        // operator knows rows diverged.
                        for rel_id in rel_ids {
                            if let Some(rel) = relations.get(&rel_id) {
                                warn!(table = %rel.qualified_name(), "ignoring TRUNCATE on replicated table");
                            }
                        }
                    }
                    PgOutputMessage::Ignored => {}
                }
            }

            if Instant::now() >= deadline {
                break;
            }
            if !progressed {
                if window_full {
                    // A transaction larger than the window; widen and retry
                    // so its commit record comes into view.
                    peek_limit = peek_limit.saturating_mul(2);
                    continue;
                }
                if !batch.is_empty() {
                    // Quiet stream with data in hand: close the batch.
                    break;
                }
                tokio::time::sleep(PEEK_POLL_INTERVAL).await;
            }
        }

        debug!(
            flow = %req.flow_job_name,
            records = batch.len(),
            first = %format_lsn(batch.first_checkpoint),
            last = %format_lsn(batch.last_checkpoint),
            "pulled record batch"
        );
        Ok(batch)
    }

    async fn confirm_flushed_offset(
        &self,
        slot_name: &str,
        offset: Lsn,
    ) -> Result<(), ConnectorError> {
        if offset == 0 {
            return Ok(());
        }
        let confirmed = self.slot_confirmed_flush(slot_name).await?.unwrap_or(0);
        if offset <= confirmed {
            return Ok(());
        }
        let target = format_lsn(offset);
        self.client
            .execute(
                "SELECT pg_replication_slot_advance($1, $2::pg_lsn)",
                &[&slot_name, &target],
            )
            .await?;
        debug!(slot = %slot_name, lsn = %target, "advanced confirmed flush position");
        Ok(())
    }

    async fn send_wal_heartbeat(&self) -> Result<(), ConnectorError> {
        self.client
            .execute(
                "SELECT pg_logical_emit_message(false, 'sluice_heartbeat', '')",
                &[],
            )
            .await?;
        Ok(())
    }

    async fn pull_flow_cleanup(
        &self,
        req: &PullFlowCleanupRequest,
    ) -> Result<(), ConnectorError> {
        self.release_snapshot().await?;

        if req.drop_slot {
            self.client
                .execute(
                    "SELECT pg_drop_replication_slot(slot_name) \
                     FROM pg_replication_slots WHERE slot_name = $1",
                    &[&req.slot_name],
                )
                .await?;
            info!(flow = %req.flow_job_name, slot = %req.slot_name, "dropped replication slot");
        }
        if req.drop_publication {
            let sql = format!(
                "DROP PUBLICATION IF EXISTS {}",
                quote_postgres_ident(&req.publication_name)
            );
            self.client.batch_execute(&sql).await?;
            info!(flow = %req.flow_job_name, publication = %req.publication_name, "dropped publication");
        }
        Ok(())
    }
}

impl PgSource {
    /// Compares an incoming Relation message against the declared schema and
    /// records any additive drift on the batch.
    fn collect_schema_delta(
        &self,
        rel: &RelationDescriptor,
        req: &PullRecordsRequest,
        seen: &mut HashSet<(String, String)>,
        batch: &mut RecordBatch,
    ) {
        let src_name = rel.qualified_name();
        let Some(dst_name) = req.table_name_mapping.get(&src_name) else {
            return;
        };
        let Some(schema) = req.table_name_schema_mapping.get(dst_name) else {
            return;
        };

        let added: Vec<ColumnSchema> = rel
            .columns
            .iter()
            .filter(|col| schema.column(&col.name).is_none())
            .filter(|col| seen.insert((dst_name.clone(), col.name.clone())))
            .map(|col| ColumnSchema::new(col.name.clone(), col.data_type()))
            .collect();

        if !added.is_empty() {
            info!(
                table = %dst_name,
                columns = added.len(),
                "observed additive schema drift on source"
            );
            batch.push_delta(TableSchemaDelta {
                src_table_name: src_name,
                dst_table_name: dst_name.clone(),
                added_columns: added,
            });
        }
    }
}

fn split_qualified(table: &str) -> (String, String) {
    match table.split_once('.') {
        Some((schema, name)) => (schema.to_string(), name.to_string()),
        None => ("public".to_string(), table.to_string()),
    }
}

/// Turns a decoded row event into a typed record addressed to its
/// destination table. Events for tables outside the mapping are dropped.
fn convert_event(
    relations: &RelationMapping,
    event: RowEvent,
    req: &PullRecordsRequest,
    checkpoint: Lsn,
) -> Result<Option<Record>, ConnectorError> {
    let rel = relations.get(&event.rel_id).ok_or_else(|| {
        ConnectorError::Corrupt(format!("row event for unknown relation {}", event.rel_id))
    })?;
    let Some(dest_table) = req.table_name_mapping.get(&rel.qualified_name()) else {
        return Ok(None);
    };

    let record = match event.kind {
        RowEventKind::Insert => {
            let tuple = event.new_tuple.ok_or_else(missing_tuple)?;
            Record::Insert {
                table: dest_table.clone(),
                checkpoint,
                items: tuple_to_items(rel, &tuple, None)?,
            }
        }
        RowEventKind::Update => {
            let new_tuple = event.new_tuple.ok_or_else(missing_tuple)?;
            let new_items = tuple_to_items(rel, &new_tuple, event.old_tuple.as_ref())?;
            let old_items = match &event.old_tuple {
                Some(old) => tuple_to_items(rel, old, None)?,
                // No old tuple on the wire: the replica identity key did not
                // change, so project it from the new image.
                None => key_items(rel, &new_items),
            };
            Record::Update {
                table: dest_table.clone(),
                checkpoint,
                old_items,
                new_items,
            }
        }
        RowEventKind::Delete => {
            let tuple = event.old_tuple.ok_or_else(missing_tuple)?;
            Record::Delete {
                table: dest_table.clone(),
                checkpoint,
                items: tuple_to_items(rel, &tuple, None)?,
            }
        }
    };
    Ok(Some(record))
}

fn missing_tuple() -> ConnectorError {
    ConnectorError::Corrupt("row event without expected tuple data".into())
}

/// Decodes a tuple against its relation. Unchanged TOAST cells fall back to
/// the other image when available, else surface as NULL.
fn tuple_to_items(
    rel: &RelationDescriptor,
    tuple: &TupleData,
    fallback: Option<&TupleData>,
) -> Result<RowItems, ConnectorError> {
    if tuple.len() != rel.columns.len() {
        return Err(ConnectorError::Corrupt(format!(
            "tuple arity {} does not match relation {} ({} columns)",
            tuple.len(),
            rel.qualified_name(),
            rel.columns.len()
        )));
    }

    let mut fields = Vec::with_capacity(tuple.len());
    for (idx, (cell, col)) in tuple.iter().zip(&rel.columns).enumerate() {
        let value = match cell {
            TupleCell::Null => Value::Null,
            TupleCell::Text(text) => parse_text_value(text, &col.data_type())?,
            TupleCell::Unchanged => match fallback.and_then(|t| t.get(idx)) {
                Some(TupleCell::Text(text)) => parse_text_value(text, &col.data_type())?,
                _ => Value::Null,
            },
        };
        fields.push(FieldValue::new(col.name.clone(), value));
    }
    Ok(RowItems::new(fields))
}

/// Projects the replica-identity key columns out of a decoded row image.
fn key_items(rel: &RelationDescriptor, items: &RowItems) -> RowItems {
    let fields = rel
        .columns
        .iter()
        .filter(|col| col.is_key())
        .filter_map(|col| {
            items
                .get(&col.name)
                .map(|value| FieldValue::new(col.name.clone(), value.clone()))
        })
        .collect();
    RowItems::new(fields)
}

/// Builds a `TableSchema` from a relation descriptor; used when schemas are
/// introspected rather than declared.
pub fn schema_from_relation(rel: &RelationDescriptor, dest_table: &str) -> TableSchema {
    TableSchema {
        table_identifier: dest_table.to_string(),
        columns: rel
            .columns
            .iter()
            .map(|col| ColumnSchema::new(col.name.clone(), col.data_type()))
            .collect(),
        primary_key_columns: rel
            .columns
            .iter()
            .filter(|col| col.is_key())
            .map(|col| col.name.clone())
            .collect(),
        replica_identity_full: rel.replica_identity_full(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgres::decoder::RelationColumn;
    use model::core::data_type::DataType;
    use std::time::Duration;

    fn relation() -> RelationDescriptor {
        RelationDescriptor {
            rel_id: 1,
            namespace: "public".into(),
            name: "t".into(),
            replica_identity: b'd',
            columns: vec![
                RelationColumn {
                    flags: 1,
                    name: "id".into(),
                    type_oid: 23,
                },
                RelationColumn {
                    flags: 0,
                    name: "v".into(),
                    type_oid: 25,
                },
            ],
        }
    }

    fn request() -> PullRecordsRequest {
        PullRecordsRequest {
            flow_job_name: "job".into(),
            slot_name: "slot".into(),
            publication_name: "pub".into(),
            last_offset: 0,
            max_batch_size: 100,
            idle_timeout: Duration::from_secs(1),
            table_name_mapping: HashMap::from([("public.t".to_string(), "T".to_string())]),
            table_name_schema_mapping: HashMap::new(),
        }
    }

    #[test]
    fn update_without_old_tuple_projects_key_columns() {
        let rel = relation();
        let mut relations = RelationMapping::new();
        relations.insert(1, rel);

        let event = RowEvent {
            rel_id: 1,
            kind: RowEventKind::Update,
            old_tuple: None,
            new_tuple: Some(vec![
                TupleCell::Text("7".into()),
                TupleCell::Text("b".into()),
            ]),
        };
        let record = convert_event(&relations, event, &request(), 50)
            .unwrap()
            .unwrap();
        match record {
            Record::Update {
                old_items,
                new_items,
                checkpoint,
                ..
            } => {
                assert_eq!(checkpoint, 50);
                assert_eq!(old_items.fields.len(), 1);
                assert_eq!(old_items.get("id"), Some(&Value::Int32(7)));
                assert_eq!(new_items.get("v"), Some(&Value::String("b".into())));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn unmapped_tables_are_dropped() {
        let mut relations = RelationMapping::new();
        let mut rel = relation();
        rel.name = "untracked".into();
        relations.insert(1, rel);

        let event = RowEvent {
            rel_id: 1,
            kind: RowEventKind::Insert,
            old_tuple: None,
            new_tuple: Some(vec![TupleCell::Text("1".into()), TupleCell::Null]),
        };
        assert!(
            convert_event(&relations, event, &request(), 10)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn unchanged_toast_falls_back_to_old_image() {
        let rel = relation();
        let old = vec![TupleCell::Text("1".into()), TupleCell::Text("big".into())];
        let new = vec![TupleCell::Text("1".into()), TupleCell::Unchanged];
        let items = tuple_to_items(&rel, &new, Some(&old)).unwrap();
        assert_eq!(items.get("v"), Some(&Value::String("big".into())));
    }

    #[test]
    fn arity_mismatch_is_corrupt() {
        let rel = relation();
        let tuple = vec![TupleCell::Null];
        assert!(matches!(
            tuple_to_items(&rel, &tuple, None),
            Err(ConnectorError::Corrupt(_))
        ));
    }

    #[test]
    fn schema_from_relation_captures_keys() {
        let schema = schema_from_relation(&relation(), "T");
        assert_eq!(schema.primary_key_columns, vec!["id".to_string()]);
        assert_eq!(schema.columns[1].data_type, DataType::String);
    }
}
