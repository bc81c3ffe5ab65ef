use crate::{core::value::Value, schema::ColumnSchema};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Column layout announced once per stream; every record conforms to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QRecordSchema {
    pub fields: Vec<ColumnSchema>,
}

impl QRecordSchema {
    pub fn new(fields: Vec<ColumnSchema>) -> Self {
        Self { fields }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

/// One positional row matching the stream schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QRecord {
    pub values: Vec<Value>,
}

impl QRecord {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("record stream closed")]
    Closed,

    #[error("record stream schema already announced")]
    SchemaAlreadySet,

    #[error("record stream producer failed: {0}")]
    Producer(String),
}

enum StreamItem {
    Record(QRecord),
    Failed(String),
}

/// Creates a bounded single-producer single-consumer record stream. The
/// producer blocks once `capacity` records are in flight, so destination
/// write latency throttles the source read.
pub fn record_stream(capacity: usize) -> (QRecordSender, QRecordReceiver) {
    let (schema_tx, schema_rx) = oneshot::channel();
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        QRecordSender {
            schema_tx: Some(schema_tx),
            tx,
        },
        QRecordReceiver {
            schema_rx: Some(schema_rx),
            schema: None,
            rx,
        },
    )
}

pub struct QRecordSender {
    schema_tx: Option<oneshot::Sender<QRecordSchema>>,
    tx: mpsc::Sender<StreamItem>,
}

impl QRecordSender {
    /// Announces the stream schema. Must happen before the first record and
    /// exactly once.
    pub fn set_schema(&mut self, schema: QRecordSchema) -> Result<(), StreamError> {
        let tx = self.schema_tx.take().ok_or(StreamError::SchemaAlreadySet)?;
        tx.send(schema).map_err(|_| StreamError::Closed)
    }

    pub async fn send(&self, record: QRecord) -> Result<(), StreamError> {
        self.tx
            .send(StreamItem::Record(record))
            .await
            .map_err(|_| StreamError::Closed)
    }

    /// Terminates the stream with an error. The consumer observes it after
    /// draining records already in flight; nothing can be sent afterwards.
    pub async fn fail(self, message: impl Into<String>) {
        let _ = self.tx.send(StreamItem::Failed(message.into())).await;
    }
}

pub struct QRecordReceiver {
    schema_rx: Option<oneshot::Receiver<QRecordSchema>>,
    schema: Option<QRecordSchema>,
    rx: mpsc::Receiver<StreamItem>,
}

impl QRecordReceiver {
    /// Waits for the producer to announce the schema.
    pub async fn schema(&mut self) -> Result<QRecordSchema, StreamError> {
        if let Some(schema) = &self.schema {
            return Ok(schema.clone());
        }
        let rx = self.schema_rx.take().ok_or(StreamError::Closed)?;
        let schema = rx.await.map_err(|_| StreamError::Closed)?;
        self.schema = Some(schema.clone());
        Ok(schema)
    }

    /// `None` means the producer finished cleanly.
    pub async fn recv(&mut self) -> Option<Result<QRecord, StreamError>> {
        match self.rx.recv().await? {
            StreamItem::Record(record) => Some(Ok(record)),
            StreamItem::Failed(message) => Some(Err(StreamError::Producer(message))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data_type::DataType;

    #[tokio::test]
    async fn schema_arrives_before_records() {
        let (mut tx, mut rx) = record_stream(4);
        tx.set_schema(QRecordSchema::new(vec![ColumnSchema::new(
            "id",
            DataType::Int64,
        )]))
        .unwrap();
        tx.send(QRecord::new(vec![Value::Int64(7)])).await.unwrap();
        drop(tx);

        let schema = rx.schema().await.unwrap();
        assert_eq!(schema.fields[0].name, "id");
        let record = rx.recv().await.unwrap().unwrap();
        assert_eq!(record.values[0], Value::Int64(7));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn schema_can_only_be_set_once() {
        let (mut tx, _rx) = record_stream(1);
        let schema = QRecordSchema::new(vec![]);
        tx.set_schema(schema.clone()).unwrap();
        assert!(matches!(
            tx.set_schema(schema),
            Err(StreamError::SchemaAlreadySet)
        ));
    }

    #[tokio::test]
    async fn producer_error_reaches_consumer_after_drain() {
        let (mut tx, mut rx) = record_stream(4);
        tx.set_schema(QRecordSchema::new(vec![])).unwrap();
        tx.send(QRecord::new(vec![])).await.unwrap();
        tx.fail("connection reset").await;

        assert!(rx.recv().await.unwrap().is_ok());
        match rx.recv().await.unwrap() {
            Err(StreamError::Producer(msg)) => assert_eq!(msg, "connection reset"),
            other => panic!("unexpected item: {other:?}"),
        }
    }
}
