//! Oplog ingestion
//!
//! Consumes the companion store's change log: inserts open new roots (or
//! reconnect a deletion), updates replace or modify the last acknowledged
//! body, deletes append tombstones. The engine's own write-backs echo
//! through the oplog; those are recognised and acknowledged instead of
//! minting a new version.

use bson::{Bson, Document, Timestamp};
use thiserror::Error;
use tracing::debug;

use vantage_model::{canonical_eq, DocId, Item, ItemError, Meta, Version};
use vantage_tree::TreeError;

use crate::merge_tree::MergeTree;
use crate::writer::WriteError;

const OPLOG_TS_KEY: &[u8] = b"oplog_ts";

/// Errors from oplog ingestion.
#[derive(Debug, Error)]
pub enum OplogError {
    #[error("unknown oplog op {0:?}")]
    UnknownOp(String),

    #[error("oplog entry missing field {0:?}")]
    MissingField(&'static str),

    #[error("oplog entry has no usable document id")]
    MissingId,

    #[error("unsupported update modifier {0:?}")]
    UnsupportedModifier(String),

    #[error("update mixes modifiers and plain fields")]
    MixedModifier,

    #[error("modifier {0:?} must map paths to a document")]
    BadModifier(&'static str),

    #[error("cannot increment non-numeric value at {0:?}")]
    BadIncTarget(String),

    #[error("no acknowledged base for {0} to apply modifiers to")]
    NoAckedBase(DocId),

    #[error(transparent)]
    Item(#[from] ItemError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Write(#[from] Box<WriteError>),
}

/// The three oplog operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OplogOp {
    Insert,
    Update,
    Delete,
}

/// One oplog record, as consumed from the collaborator.
#[derive(Debug, Clone)]
pub struct OplogEntry {
    pub op: OplogOp,
    pub ns: String,
    pub ts: Timestamp,
    pub o: Document,
    pub o2: Option<Document>,
}

impl OplogEntry {
    pub fn from_doc(doc: &Document) -> Result<Self, OplogError> {
        let op = match doc.get_str("op").map_err(|_| OplogError::MissingField("op"))? {
            "i" => OplogOp::Insert,
            "u" => OplogOp::Update,
            "d" => OplogOp::Delete,
            other => return Err(OplogError::UnknownOp(other.to_string())),
        };
        let ns = doc
            .get_str("ns")
            .map_err(|_| OplogError::MissingField("ns"))?
            .to_string();
        let ts = match doc.get("ts") {
            Some(Bson::Timestamp(ts)) => *ts,
            _ => return Err(OplogError::MissingField("ts")),
        };
        let o = doc
            .get_document("o")
            .map_err(|_| OplogError::MissingField("o"))?
            .clone();
        let o2 = doc.get_document("o2").ok().cloned();
        Ok(Self { op, ns, ts, o, o2 })
    }

    /// The document id this entry concerns.
    pub fn doc_id(&self) -> Result<DocId, OplogError> {
        let source = match self.op {
            OplogOp::Update => self.o2.as_ref().unwrap_or(&self.o),
            _ => &self.o,
        };
        match source.get("_id") {
            Some(Bson::String(s)) => Ok(DocId::new(s.as_bytes().to_vec())?),
            Some(Bson::Binary(bin)) => Ok(DocId::new(bin.bytes.clone())?),
            Some(Bson::ObjectId(oid)) => Ok(DocId::new(oid.to_hex().into_bytes())?),
            _ => Err(OplogError::MissingId),
        }
    }
}

impl MergeTree {
    /// Apply one oplog entry in log order.
    pub async fn apply_oplog(&mut self, entry: OplogEntry) -> Result<Option<Version>, OplogError> {
        let id = entry.doc_id()?;
        let result = match entry.op {
            OplogOp::Insert => {
                if self.ack_echo(&id, &entry.o, false)? {
                    None
                } else {
                    self.fresh_local_write(
                        id.clone(),
                        None,
                        entry.o.clone(),
                        false,
                        Meta { ack: true, op: entry.ts },
                    )
                    .await
                    .map_err(Box::new)?
                }
            }
            OplogOp::Update => {
                let body = if has_modifiers(&entry.o) {
                    let base = self
                        .last_acked(&id)?
                        .ok_or_else(|| OplogError::NoAckedBase(id.clone()))?;
                    apply_modifiers(&base.b, &entry.o)?
                } else {
                    entry.o.clone()
                };
                if self.ack_echo(&id, &body, false)? {
                    None
                } else {
                    self.fresh_local_write(
                        id.clone(),
                        None,
                        body,
                        false,
                        Meta { ack: true, op: entry.ts },
                    )
                    .await
                    .map_err(Box::new)?
                }
            }
            OplogOp::Delete => {
                if self.ack_echo(&id, &Document::new(), true)? {
                    None
                } else {
                    self.fresh_local_write(
                        id.clone(),
                        None,
                        Document::new(),
                        true,
                        Meta { ack: true, op: entry.ts },
                    )
                    .await
                    .map_err(Box::new)?
                }
            }
        };
        self.record_oplog_ts(entry.ts)?;
        debug!(id = %id, op = ?entry.op, "oplog applied");
        Ok(result)
    }

    /// Recognise the echo of our own write-back: the newest clean head is
    /// unacknowledged and already carries this content.
    fn ack_echo(&self, id: &DocId, body: &Document, deleted: bool) -> Result<bool, OplogError> {
        let heads = self.local.heads(id, false, true)?;
        let Some(head) = heads.last() else { return Ok(false) };
        if head.m.ack || head.h.d != deleted {
            return Ok(false);
        }
        // The plain store adds the id envelope; it is not content.
        let mut ours = head.b.clone();
        ours.remove("_id");
        let mut theirs = body.clone();
        theirs.remove("_id");
        let equal = deleted || canonical_eq(&Bson::Document(ours), &Bson::Document(theirs));
        if equal {
            self.local.set_ack(head.version()?, true)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Newest local item already acknowledged into the plain store.
    fn last_acked(&self, id: &DocId) -> Result<Option<Item>, OplogError> {
        Ok(self
            .local
            .iter_id(id, true)?
            .into_iter()
            .find(|it| it.m.ack))
    }

    fn record_oplog_ts(&self, ts: Timestamp) -> Result<(), OplogError> {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&ts.time.to_be_bytes());
        buf[4..].copy_from_slice(&ts.increment.to_be_bytes());
        self.local.put_user(OPLOG_TS_KEY, &buf)?;
        Ok(())
    }

    /// Where to resume tailing the oplog after a restart.
    pub fn oplog_resume_ts(&self) -> Result<Option<Timestamp>, OplogError> {
        let Some(buf) = self.local.get_user(OPLOG_TS_KEY)? else {
            return Ok(None);
        };
        if buf.len() != 8 {
            return Ok(None);
        }
        let time = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let increment = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Ok(Some(Timestamp { time, increment }))
    }
}

fn has_modifiers(o: &Document) -> bool {
    o.keys().any(|k| k.starts_with('$'))
}

/// Apply a `$`-modifier update document to a base body.
fn apply_modifiers(base: &Document, update: &Document) -> Result<Document, OplogError> {
    let mut out = base.clone();
    for (key, value) in update {
        match key.as_str() {
            "$set" => {
                let paths = value
                    .as_document()
                    .ok_or(OplogError::BadModifier("$set"))?;
                for (path, v) in paths {
                    set_path(&mut out, path, v.clone());
                }
            }
            "$unset" => {
                let paths = value
                    .as_document()
                    .ok_or(OplogError::BadModifier("$unset"))?;
                for (path, _) in paths {
                    unset_path(&mut out, path);
                }
            }
            "$inc" => {
                let paths = value
                    .as_document()
                    .ok_or(OplogError::BadModifier("$inc"))?;
                for (path, delta) in paths {
                    inc_path(&mut out, path, delta)?;
                }
            }
            other if other.starts_with('$') => {
                return Err(OplogError::UnsupportedModifier(other.to_string()))
            }
            _ => return Err(OplogError::MixedModifier),
        }
    }
    Ok(out)
}

fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            if let Some(Bson::Document(inner)) = doc.get_mut(head) {
                set_path(inner, rest, value);
            }
        }
    }
}

fn unset_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(inner)) = doc.get_mut(head) {
                unset_path(inner, rest);
            }
        }
    }
}

fn inc_path(doc: &mut Document, path: &str, delta: &Bson) -> Result<(), OplogError> {
    match path.split_once('.') {
        None => {
            let next = match doc.get(path) {
                None => delta.clone(),
                Some(current) => num_add(current, delta)
                    .ok_or_else(|| OplogError::BadIncTarget(path.to_string()))?,
            };
            doc.insert(path, next);
            Ok(())
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            match doc.get_mut(head) {
                Some(Bson::Document(inner)) => inc_path(inner, rest, delta),
                _ => Err(OplogError::BadIncTarget(path.to_string())),
            }
        }
    }
}

fn num_add(a: &Bson, b: &Bson) -> Option<Bson> {
    use Bson::{Double, Int32, Int64};
    match (a, b) {
        (Int32(x), Int32(y)) => Some(Int32(x.wrapping_add(*y))),
        (Int64(x), Int64(y)) => Some(Int64(x.wrapping_add(*y))),
        (Int32(x), Int64(y)) | (Int64(y), Int32(x)) => {
            Some(Int64((*x as i64).wrapping_add(*y)))
        }
        (Double(x), Double(y)) => Some(Double(x + y)),
        (Double(x), Int32(y)) | (Int32(y), Double(x)) => Some(Double(x + f64::from(*y))),
        (Double(x), Int64(y)) | (Int64(y), Double(x)) => Some(Double(x + *y as f64)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn parses_wire_entries() {
        let entry = OplogEntry::from_doc(&doc! {
            "op": "i",
            "ns": "app.things",
            "ts": Bson::Timestamp(Timestamp { time: 7, increment: 1 }),
            "o": { "_id": "t1", "x": 1i32 },
        })
        .unwrap();
        assert_eq!(entry.op, OplogOp::Insert);
        assert_eq!(entry.ns, "app.things");
        assert_eq!(entry.doc_id().unwrap().as_bytes(), b"t1");

        let err = OplogEntry::from_doc(&doc! {
            "op": "x",
            "ns": "app.things",
            "ts": Bson::Timestamp(Timestamp { time: 7, increment: 1 }),
            "o": {},
        })
        .unwrap_err();
        assert!(matches!(err, OplogError::UnknownOp(_)));
    }

    #[test]
    fn update_id_comes_from_criteria() {
        let entry = OplogEntry::from_doc(&doc! {
            "op": "u",
            "ns": "app.things",
            "ts": Bson::Timestamp(Timestamp { time: 7, increment: 2 }),
            "o": { "$set": { "x": 2i32 } },
            "o2": { "_id": "t1" },
        })
        .unwrap();
        assert_eq!(entry.doc_id().unwrap().as_bytes(), b"t1");
    }

    #[test]
    fn modifiers_set_unset_inc() {
        let base = doc! { "a": 1i32, "nested": { "keep": true, "gone": 1i32 }, "n": 10i64 };
        let update = doc! {
            "$set": { "a": 5i32, "nested.added": "yes" },
            "$unset": { "nested.gone": 1i32 },
            "$inc": { "n": 5i64, "fresh": 2i32 },
        };
        let out = apply_modifiers(&base, &update).unwrap();
        assert_eq!(out.get_i32("a").unwrap(), 5);
        let nested = out.get_document("nested").unwrap();
        assert_eq!(nested.get_str("added").unwrap(), "yes");
        assert!(!nested.contains_key("gone"));
        assert!(nested.get_bool("keep").unwrap());
        assert_eq!(out.get_i64("n").unwrap(), 15);
        assert_eq!(out.get_i32("fresh").unwrap(), 2);
    }

    #[test]
    fn unknown_modifiers_are_rejected() {
        let base = doc! { "a": [1i32] };
        let update = doc! { "$push": { "a": 2i32 } };
        assert!(matches!(
            apply_modifiers(&base, &update),
            Err(OplogError::UnsupportedModifier(_))
        ));

        let mixed = doc! { "$set": { "a": 1i32 }, "b": 2i32 };
        assert!(matches!(
            apply_modifiers(&base, &mixed),
            Err(OplogError::MixedModifier)
        ));
    }

    #[test]
    fn inc_rejects_non_numeric_targets() {
        let base = doc! { "s": "text" };
        let update = doc! { "$inc": { "s": 1i32 } };
        assert!(matches!(
            apply_modifiers(&base, &update),
            Err(OplogError::BadIncTarget(_))
        ));
    }
}
