use crate::{
    records::record::{Lsn, Record},
    schema::TableSchemaDelta,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A contiguous run of commit-closed CDC records pulled in one step.
/// `first_checkpoint <= r.checkpoint() <= last_checkpoint` for every record,
/// and records appear in source commit order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordBatch {
    pub records: Vec<Record>,
    pub first_checkpoint: Lsn,
    pub last_checkpoint: Lsn,
    pub schema_deltas: Vec<TableSchemaDelta>,
}

impl RecordBatch {
    pub fn push(&mut self, record: Record) {
        let cp = record.checkpoint();
        if self.records.is_empty() {
            self.first_checkpoint = cp;
        }
        debug_assert!(cp >= self.last_checkpoint || self.records.is_empty());
        self.last_checkpoint = self.last_checkpoint.max(cp);
        self.records.push(record);
    }

    pub fn push_delta(&mut self, delta: TableSchemaDelta) {
        if !delta.is_empty() {
            self.schema_deltas.push(delta);
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Row counts per destination table, for monitoring and sync responses.
    pub fn table_row_counts(&self) -> HashMap<String, u64> {
        let mut counts: HashMap<String, u64> = HashMap::new();
        for record in &self.records {
            *counts.entry(record.table().to_string()).or_default() += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::record::RowItems;

    fn insert(table: &str, checkpoint: Lsn) -> Record {
        Record::Insert {
            table: table.into(),
            checkpoint,
            items: RowItems::default(),
        }
    }

    #[test]
    fn checkpoints_track_first_and_last() {
        let mut batch = RecordBatch::default();
        batch.push(insert("a", 10));
        batch.push(insert("a", 11));
        batch.push(insert("b", 15));
        assert_eq!(batch.first_checkpoint, 10);
        assert_eq!(batch.last_checkpoint, 15);
        for r in &batch.records {
            assert!(r.checkpoint() >= batch.first_checkpoint);
            assert!(r.checkpoint() <= batch.last_checkpoint);
        }
    }

    #[test]
    fn table_counts_split_by_destination() {
        let mut batch = RecordBatch::default();
        batch.push(insert("a", 1));
        batch.push(insert("a", 2));
        batch.push(insert("b", 3));
        let counts = batch.table_row_counts();
        assert_eq!(counts["a"], 2);
        assert_eq!(counts["b"], 1);
    }
}
