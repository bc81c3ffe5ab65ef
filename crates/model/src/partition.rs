use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Physical tuple id, used as the watermark when a table has no usable
/// primary key. Ordering is block-major.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct TupleId {
    pub block_number: u32,
    pub offset_number: u16,
}

/// Half-open on the left: a partition covers `(start, end]` in watermark
/// order, except the very first partition of a table which includes its
/// start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum PartitionRange {
    Int { start: i64, end: i64 },
    Timestamp { start: DateTime<Utc>, end: DateTime<Utc> },
    Tid { start: TupleId, end: TupleId },
    FullTable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QRepPartition {
    pub partition_id: Uuid,
    pub range: PartitionRange,
    pub run_uuid: Uuid,
}

impl QRepPartition {
    pub fn new(run_uuid: Uuid, range: PartitionRange) -> Self {
        Self {
            partition_id: Uuid::new_v4(),
            range,
            run_uuid,
        }
    }

    pub fn full_table(run_uuid: Uuid) -> Self {
        Self::new(run_uuid, PartitionRange::FullTable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_ids_order_block_major() {
        let a = TupleId {
            block_number: 1,
            offset_number: 60,
        };
        let b = TupleId {
            block_number: 2,
            offset_number: 1,
        };
        assert!(a < b);
    }
}
