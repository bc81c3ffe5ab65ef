use crate::core::value::{FieldValue, Value};
use serde::{Deserialize, Serialize};

/// WAL position. Offsets persisted at the destination are of this type and
/// only ever move forward; 0 means "never synced".
pub type Lsn = u64;

/// Renders an LSN in the `X/Y` form Postgres prints.
pub fn format_lsn(lsn: Lsn) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

/// An ordered set of column values for one row image.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RowItems {
    pub fields: Vec<FieldValue>,
}

impl RowItems {
    pub fn new(fields: Vec<FieldValue>) -> Self {
        Self { fields }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| &f.value)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::with_capacity(self.fields.len());
        for field in &self.fields {
            map.insert(field.name.clone(), field.value.to_json());
        }
        serde_json::Value::Object(map)
    }
}

/// A single decoded change. Each record carries the checkpoint of the WAL
/// position it was decoded at; checkpoints are monotone within a batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Record {
    Insert {
        table: String,
        checkpoint: Lsn,
        items: RowItems,
    },
    Update {
        table: String,
        checkpoint: Lsn,
        old_items: RowItems,
        new_items: RowItems,
    },
    Delete {
        table: String,
        checkpoint: Lsn,
        items: RowItems,
    },
}

impl Record {
    pub fn table(&self) -> &str {
        match self {
            Record::Insert { table, .. }
            | Record::Update { table, .. }
            | Record::Delete { table, .. } => table,
        }
    }

    pub fn checkpoint(&self) -> Lsn {
        match self {
            Record::Insert { checkpoint, .. }
            | Record::Update { checkpoint, .. }
            | Record::Delete { checkpoint, .. } => *checkpoint,
        }
    }

    /// Raw-table discriminant: 0 insert, 1 update, 2 delete.
    pub fn record_type(&self) -> i64 {
        match self {
            Record::Insert { .. } => 0,
            Record::Update { .. } => 1,
            Record::Delete { .. } => 2,
        }
    }

    /// The row image that lands in the raw table's `data` column: the new
    /// image for inserts/updates, the key (or full pre-image) for deletes.
    pub fn data_items(&self) -> &RowItems {
        match self {
            Record::Insert { items, .. } => items,
            Record::Update { new_items, .. } => new_items,
            Record::Delete { items, .. } => items,
        }
    }

    /// The pre-image carried in `match_data`; empty for inserts.
    pub fn match_items(&self) -> Option<&RowItems> {
        match self {
            Record::Insert { .. } => None,
            Record::Update { old_items, .. } => Some(old_items),
            Record::Delete { items, .. } => Some(items),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_formats_like_postgres() {
        assert_eq!(format_lsn(0x1_0000_002A), "1/2A");
    }

    #[test]
    fn record_type_discriminants() {
        let items = RowItems::default();
        let insert = Record::Insert {
            table: "t".into(),
            checkpoint: 1,
            items: items.clone(),
        };
        let delete = Record::Delete {
            table: "t".into(),
            checkpoint: 2,
            items,
        };
        assert_eq!(insert.record_type(), 0);
        assert_eq!(delete.record_type(), 2);
    }

    #[test]
    fn row_items_serialize_to_object() {
        let items = RowItems::new(vec![
            FieldValue::new("id", Value::Int32(1)),
            FieldValue::new("v", Value::String("a".into())),
        ]);
        assert_eq!(items.to_json(), serde_json::json!({"id": 1, "v": "a"}));
    }
}
