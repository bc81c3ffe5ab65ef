use crate::error::ConnectorError;
use bytes::{Buf, Bytes};
use model::core::data_type::DataType;
use std::collections::HashMap;

/// One column as described by a Relation message.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationColumn {
    /// Bit 0 set when the column is part of the replica identity key.
    pub flags: u8,
    pub name: String,
    pub type_oid: u32,
}

impl RelationColumn {
    pub fn is_key(&self) -> bool {
        self.flags & 1 != 0
    }

    pub fn data_type(&self) -> DataType {
        DataType::from_postgres_oid(self.type_oid)
    }
}

/// Decoded Relation message; the stream repeats these ahead of row events
/// whenever a decoding session (re)starts or the table changes.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationDescriptor {
    pub rel_id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<RelationColumn>,
}

impl RelationDescriptor {
    pub fn qualified_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    pub fn replica_identity_full(&self) -> bool {
        self.replica_identity == b'f'
    }
}

/// rel_id → latest relation descriptor seen on the stream.
pub type RelationMapping = HashMap<u32, RelationDescriptor>;

/// A column cell inside a tuple: absent (null), unchanged TOAST, or the
/// text form of the value.
#[derive(Debug, Clone, PartialEq)]
pub enum TupleCell {
    Null,
    Unchanged,
    Text(String),
}

pub type TupleData = Vec<TupleCell>;

#[derive(Debug, Clone, PartialEq)]
pub enum RowEventKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowEvent {
    pub rel_id: u32,
    pub kind: RowEventKind,
    /// Pre-image: full under REPLICA IDENTITY FULL, key-only otherwise,
    /// absent when the stream did not send one.
    pub old_tuple: Option<TupleData>,
    /// New image for inserts/updates; absent for deletes.
    pub new_tuple: Option<TupleData>,
}

/// The subset of pgoutput messages the pull loop acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum PgOutputMessage {
    Begin { final_lsn: u64, xid: u32 },
    Commit { commit_lsn: u64, end_lsn: u64 },
    Relation(RelationDescriptor),
    Row(RowEvent),
    Truncate { rel_ids: Vec<u32> },
    /// Origin, Type and logical-decoding messages carry nothing we replay.
    Ignored,
}

pub fn decode_message(data: &[u8]) -> Result<PgOutputMessage, ConnectorError> {
    let mut buf = Bytes::copy_from_slice(data);
    if buf.is_empty() {
        return Err(ConnectorError::Corrupt("empty pgoutput message".into()));
    }
    let tag = buf.get_u8();
    match tag {
        b'B' => {
            ensure_len(&buf, 16)?;
            let final_lsn = buf.get_u64();
            let _commit_ts = buf.get_i64();
            ensure_len(&buf, 4)?;
            let xid = buf.get_u32();
            Ok(PgOutputMessage::Begin { final_lsn, xid })
        }
        b'C' => {
            ensure_len(&buf, 25)?;
            let _flags = buf.get_u8();
            let commit_lsn = buf.get_u64();
            let end_lsn = buf.get_u64();
            let _commit_ts = buf.get_i64();
            Ok(PgOutputMessage::Commit {
                commit_lsn,
                end_lsn,
            })
        }
        b'R' => {
            ensure_len(&buf, 4)?;
            let rel_id = buf.get_u32();
            let namespace = read_cstr(&mut buf)?;
            let name = read_cstr(&mut buf)?;
            ensure_len(&buf, 3)?;
            let replica_identity = buf.get_u8();
            let ncols = buf.get_u16();
            let mut columns = Vec::with_capacity(ncols as usize);
            for _ in 0..ncols {
                ensure_len(&buf, 1)?;
                let flags = buf.get_u8();
                let name = read_cstr(&mut buf)?;
                ensure_len(&buf, 8)?;
                let type_oid = buf.get_u32();
                let _type_mod = buf.get_i32();
                columns.push(RelationColumn {
                    flags,
                    name,
                    type_oid,
                });
            }
            Ok(PgOutputMessage::Relation(RelationDescriptor {
                rel_id,
                namespace,
                name,
                replica_identity,
                columns,
            }))
        }
        b'I' => {
            ensure_len(&buf, 5)?;
            let rel_id = buf.get_u32();
            let marker = buf.get_u8();
            if marker != b'N' {
                return Err(ConnectorError::Corrupt(format!(
                    "insert tuple marker {marker:#x}"
                )));
            }
            let new_tuple = read_tuple(&mut buf)?;
            Ok(PgOutputMessage::Row(RowEvent {
                rel_id,
                kind: RowEventKind::Insert,
                old_tuple: None,
                new_tuple: Some(new_tuple),
            }))
        }
        b'U' => {
            ensure_len(&buf, 5)?;
            let rel_id = buf.get_u32();
            let mut marker = buf.get_u8();
            let old_tuple = if marker == b'K' || marker == b'O' {
                let tuple = read_tuple(&mut buf)?;
                ensure_len(&buf, 1)?;
                marker = buf.get_u8();
                Some(tuple)
            } else {
                None
            };
            if marker != b'N' {
                return Err(ConnectorError::Corrupt(format!(
                    "update tuple marker {marker:#x}"
                )));
            }
            let new_tuple = read_tuple(&mut buf)?;
            Ok(PgOutputMessage::Row(RowEvent {
                rel_id,
                kind: RowEventKind::Update,
                old_tuple,
                new_tuple: Some(new_tuple),
            }))
        }
        b'D' => {
            ensure_len(&buf, 5)?;
            let rel_id = buf.get_u32();
            let marker = buf.get_u8();
            if marker != b'K' && marker != b'O' {
                return Err(ConnectorError::Corrupt(format!(
                    "delete tuple marker {marker:#x}"
                )));
            }
            let old_tuple = read_tuple(&mut buf)?;
            Ok(PgOutputMessage::Row(RowEvent {
                rel_id,
                kind: RowEventKind::Delete,
                old_tuple: Some(old_tuple),
                new_tuple: None,
            }))
        }
        b'T' => {
            ensure_len(&buf, 5)?;
            let nrels = buf.get_u32();
            let _options = buf.get_u8();
            let mut rel_ids = Vec::with_capacity(nrels as usize);
            for _ in 0..nrels {
                ensure_len(&buf, 4)?;
                rel_ids.push(buf.get_u32());
            }
            Ok(PgOutputMessage::Truncate { rel_ids })
        }
        b'O' | b'Y' | b'M' => Ok(PgOutputMessage::Ignored),
        other => Err(ConnectorError::Corrupt(format!(
            "unknown pgoutput message tag {other:#x}"
        ))),
    }
}

fn ensure_len(buf: &Bytes, len: usize) -> Result<(), ConnectorError> {
    if buf.remaining() < len {
        return Err(ConnectorError::Corrupt(format!(
            "truncated pgoutput message: need {len} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn read_cstr(buf: &mut Bytes) -> Result<String, ConnectorError> {
    let pos = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| ConnectorError::Corrupt("unterminated string".into()))?;
    let raw = buf.split_to(pos);
    buf.advance(1);
    String::from_utf8(raw.to_vec())
        .map_err(|_| ConnectorError::Corrupt("non-utf8 identifier".into()))
}

fn read_tuple(buf: &mut Bytes) -> Result<TupleData, ConnectorError> {
    ensure_len(buf, 2)?;
    let ncols = buf.get_u16();
    let mut cells = Vec::with_capacity(ncols as usize);
    for _ in 0..ncols {
        ensure_len(buf, 1)?;
        match buf.get_u8() {
            b'n' => cells.push(TupleCell::Null),
            b'u' => cells.push(TupleCell::Unchanged),
            b't' => {
                ensure_len(buf, 4)?;
                let len = buf.get_u32() as usize;
                ensure_len(buf, len)?;
                let raw = buf.split_to(len);
                let text = String::from_utf8(raw.to_vec())
                    .map_err(|_| ConnectorError::Corrupt("non-utf8 tuple value".into()))?;
                cells.push(TupleCell::Text(text));
            }
            other => {
                return Err(ConnectorError::Corrupt(format!(
                    "unknown tuple cell kind {other:#x}"
                )));
            }
        }
    }
    Ok(cells)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn put_cstr(buf: &mut BytesMut, s: &str) {
        buf.put_slice(s.as_bytes());
        buf.put_u8(0);
    }

    fn relation_bytes() -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(16384);
        put_cstr(&mut buf, "public");
        put_cstr(&mut buf, "users");
        buf.put_u8(b'd');
        buf.put_u16(2);
        // id: key column, int4
        buf.put_u8(1);
        put_cstr(&mut buf, "id");
        buf.put_u32(23);
        buf.put_i32(-1);
        // name: text
        buf.put_u8(0);
        put_cstr(&mut buf, "name");
        buf.put_u32(25);
        buf.put_i32(-1);
        buf.to_vec()
    }

    #[test]
    fn decodes_relation_message() {
        let msg = decode_message(&relation_bytes()).unwrap();
        match msg {
            PgOutputMessage::Relation(rel) => {
                assert_eq!(rel.rel_id, 16384);
                assert_eq!(rel.qualified_name(), "public.users");
                assert_eq!(rel.columns.len(), 2);
                assert!(rel.columns[0].is_key());
                assert_eq!(rel.columns[0].data_type(), DataType::Int32);
                assert!(!rel.replica_identity_full());
            }
            other => panic!("expected relation, got {other:?}"),
        }
    }

    #[test]
    fn decodes_insert_with_tuple() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(16384);
        buf.put_u8(b'N');
        buf.put_u16(2);
        buf.put_u8(b't');
        buf.put_u32(1);
        buf.put_slice(b"1");
        buf.put_u8(b'n');
        let msg = decode_message(&buf).unwrap();
        match msg {
            PgOutputMessage::Row(event) => {
                assert_eq!(event.kind, RowEventKind::Insert);
                let tuple = event.new_tuple.unwrap();
                assert_eq!(tuple[0], TupleCell::Text("1".into()));
                assert_eq!(tuple[1], TupleCell::Null);
            }
            other => panic!("expected row, got {other:?}"),
        }
    }

    #[test]
    fn decodes_update_with_old_key() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        buf.put_u32(16384);
        buf.put_u8(b'K');
        buf.put_u16(1);
        buf.put_u8(b't');
        buf.put_u32(1);
        buf.put_slice(b"1");
        buf.put_u8(b'N');
        buf.put_u16(1);
        buf.put_u8(b't');
        buf.put_u32(1);
        buf.put_slice(b"2");
        let msg = decode_message(&buf).unwrap();
        match msg {
            PgOutputMessage::Row(event) => {
                assert_eq!(event.kind, RowEventKind::Update);
                assert_eq!(event.old_tuple.unwrap()[0], TupleCell::Text("1".into()));
                assert_eq!(event.new_tuple.unwrap()[0], TupleCell::Text("2".into()));
            }
            other => panic!("expected row, got {other:?}"),
        }
    }

    #[test]
    fn decodes_begin_and_commit() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(0x1_0000_0000);
        buf.put_i64(0);
        buf.put_u32(777);
        match decode_message(&buf).unwrap() {
            PgOutputMessage::Begin { final_lsn, xid } => {
                assert_eq!(final_lsn, 0x1_0000_0000);
                assert_eq!(xid, 777);
            }
            other => panic!("expected begin, got {other:?}"),
        }

        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_u8(0);
        buf.put_u64(100);
        buf.put_u64(101);
        buf.put_i64(0);
        match decode_message(&buf).unwrap() {
            PgOutputMessage::Commit {
                commit_lsn,
                end_lsn,
            } => {
                assert_eq!(commit_lsn, 100);
                assert_eq!(end_lsn, 101);
            }
            other => panic!("expected commit, got {other:?}"),
        }
    }

    #[test]
    fn truncated_message_is_corrupt() {
        let buf = vec![b'B', 0, 0];
        assert!(matches!(
            decode_message(&buf),
            Err(ConnectorError::Corrupt(_))
        ));
    }
}
