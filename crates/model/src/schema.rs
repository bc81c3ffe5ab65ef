use crate::core::data_type::DataType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: DataType,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Schema of a replicated table as the destination should see it. Column
/// order is meaningful and follows the source relation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableSchema {
    pub table_identifier: String,
    pub columns: Vec<ColumnSchema>,
    pub primary_key_columns: Vec<String>,
    pub replica_identity_full: bool,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// One source→destination table pairing in a flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableMapping {
    pub source_table_identifier: String,
    pub destination_table_identifier: String,
    #[serde(default)]
    pub partition_key: Option<String>,
}

/// Additive schema drift observed on the source mid-stream. Removals are
/// never propagated; the destination column set only grows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableSchemaDelta {
    pub src_table_name: String,
    pub dst_table_name: String,
    pub added_columns: Vec<ColumnSchema>,
}

impl TableSchemaDelta {
    pub fn is_empty(&self) -> bool {
        self.added_columns.is_empty()
    }
}
