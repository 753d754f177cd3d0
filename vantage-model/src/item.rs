//! DAG nodes (items) with strong typing
//!
//! An `Item` is one node in a document's version DAG: a header carrying the
//! DAG structure, opaque meta, and the document body. The wire encoding is
//! BSON; conversions are explicit so every field is validated on the way in.

use std::fmt;

use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document, Timestamp};
use thiserror::Error;

use crate::version::{Version, VersionError, MAX_VERSION_SIZE};

/// Longest document id and perspective name the key layout supports.
pub const MAX_ID_SIZE: usize = 254;

/// Default name of the local perspective.
pub const LOCAL_PERSPECTIVE: &str = "_local";

/// Default name of the stage perspective.
pub const STAGE_PERSPECTIVE: &str = "_stage";

/// Errors raised while validating or decoding items.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("item has no document id")]
    MissingId,

    #[error("document id exceeds {MAX_ID_SIZE} bytes: {0}")]
    IdTooLong(usize),

    #[error("document id contains a NUL byte")]
    IdContainsNul,

    #[error("item has no version")]
    MissingVersion,

    #[error("version width mismatch: expected {expected}, got {got}")]
    VersionWidth { expected: usize, got: usize },

    #[error("perspective name is empty")]
    EmptyPerspective,

    #[error("perspective name exceeds {MAX_ID_SIZE} bytes: {0}")]
    PerspectiveTooLong(usize),

    #[error("perspective name must be ASCII without NUL bytes")]
    PerspectiveNotAscii,

    #[error("missing field {0:?}")]
    MissingField(&'static str),

    #[error("field {0:?} has the wrong type")]
    BadFieldType(&'static str),

    #[error("invalid version: {0}")]
    Version(#[from] VersionError),

    #[error("BSON encode error: {0}")]
    Encode(#[from] bson::ser::Error),

    #[error("BSON decode error: {0}")]
    Decode(#[from] bson::de::Error),
}

/// A perspective label: one view of a document's history.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Perspective(String);

impl Perspective {
    pub fn new(name: impl Into<String>) -> Result<Self, ItemError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ItemError::EmptyPerspective);
        }
        if name.len() > MAX_ID_SIZE {
            return Err(ItemError::PerspectiveTooLong(name.len()));
        }
        if !name.bytes().all(|b| b.is_ascii() && b != 0) {
            return Err(ItemError::PerspectiveNotAscii);
        }
        Ok(Self(name))
    }

    /// The default local perspective.
    pub fn local() -> Self {
        Self(LOCAL_PERSPECTIVE.to_string())
    }

    /// The default stage perspective.
    pub fn stage() -> Self {
        Self(STAGE_PERSPECTIVE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Perspective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Perspective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Perspective({})", self.0)
    }
}

impl AsRef<str> for Perspective {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// An application-level document id: opaque bytes, bounded for the key layout.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocId(Vec<u8>);

impl DocId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, ItemError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(ItemError::MissingId);
        }
        if bytes.len() > MAX_ID_SIZE {
            return Err(ItemError::IdTooLong(bytes.len()));
        }
        if bytes.contains(&0) {
            return Err(ItemError::IdContainsNul);
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "DocId({s})"),
            Err(_) => write!(f, "DocId(0x{})", hex_of(&self.0)),
        }
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            Err(_) => write!(f, "0x{}", hex_of(&self.0)),
        }
    }
}

fn hex_of(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl AsRef<[u8]> for DocId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Item header: everything the DAG needs to place the node.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    /// Document id.
    pub id: DocId,
    /// Version of this node. Absent only on virtual merges.
    pub v: Option<Version>,
    /// Ordered parent versions: empty for roots, two or more for merges.
    pub pa: Vec<Version>,
    /// Perspective the node's content originated in.
    pub pe: Perspective,
    /// Deletion tombstone.
    pub d: bool,
    /// Conflict flag.
    pub c: bool,
    /// Insertion index, assigned by the tree on write.
    pub i: Option<u64>,
}

/// Opaque item meta: acknowledgement state and oplog pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    /// Whether this node has been written back to the plain document store.
    pub ack: bool,
    /// Oplog timestamp this node was derived from.
    pub op: Timestamp,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            ack: false,
            op: Timestamp { time: 0, increment: 0 },
        }
    }
}

/// One node in a document's version DAG.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub h: Header,
    pub m: Meta,
    pub b: Document,
}

impl Item {
    /// Create a builder for a new item.
    pub fn builder(id: DocId, pe: Perspective) -> ItemBuilder {
        ItemBuilder::new(id, pe)
    }

    /// The version, or an error for virtual merges.
    pub fn version(&self) -> Result<&Version, ItemError> {
        self.h.v.as_ref().ok_or(ItemError::MissingVersion)
    }

    /// Whether this item starts a new DAG (no parents).
    pub fn is_root(&self) -> bool {
        self.h.pa.is_empty()
    }

    /// Whether this item is a virtual merge (parents only, no version).
    pub fn is_virtual(&self) -> bool {
        self.h.v.is_none()
    }

    /// Validate header shape against a tree's version width.
    pub fn validate(&self, v_size: usize) -> Result<(), ItemError> {
        let v = self.h.v.as_ref().ok_or(ItemError::MissingVersion)?;
        if v.len() != v_size {
            return Err(ItemError::VersionWidth {
                expected: v_size,
                got: v.len(),
            });
        }
        for p in &self.h.pa {
            if p.len() != v_size {
                return Err(ItemError::VersionWidth {
                    expected: v_size,
                    got: p.len(),
                });
            }
        }
        Ok(())
    }

    /// Whether two items describe the same node: id, version, parents,
    /// tombstone and body must agree. Insertion index, conflict flag and
    /// meta are tree-local state and do not participate.
    pub fn equivalent(&self, other: &Item) -> bool {
        self.h.id == other.h.id
            && self.h.v == other.h.v
            && self.h.pa == other.h.pa
            && self.h.d == other.h.d
            && crate::merge::canonical_eq(&Bson::Document(self.b.clone()), &Bson::Document(other.b.clone()))
    }

    /// The canonical document hashed to derive a content version.
    ///
    /// Perspective, insertion index, conflict flag and meta are excluded;
    /// parents and body keys are sorted. Two peers constructing the same
    /// merge therefore hash identical bytes.
    pub fn canonical_doc(&self) -> Document {
        let mut pa: Vec<String> = self.h.pa.iter().map(Version::to_base64).collect();
        pa.sort();
        let mut doc = Document::new();
        doc.insert(
            "id",
            Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: self.h.id.as_bytes().to_vec(),
            }),
        );
        doc.insert("pa", pa.into_iter().map(Bson::String).collect::<Vec<_>>());
        doc.insert("d", self.h.d);
        doc.insert("b", canonicalize_doc(&self.b));
        doc
    }

    /// Derive the deterministic content-hash version for this item.
    pub fn content_version(&self, v_size: usize) -> Result<Version, ItemError> {
        Ok(Version::content_hash(&self.canonical_doc(), v_size)?)
    }

    /// Encode to the full wire document.
    pub fn to_doc(&self) -> Document {
        let mut h = Document::new();
        h.insert(
            "id",
            Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: self.h.id.as_bytes().to_vec(),
            }),
        );
        if let Some(v) = &self.h.v {
            h.insert("v", v.to_base64());
        }
        h.insert(
            "pa",
            self.h
                .pa
                .iter()
                .map(|p| Bson::String(p.to_base64()))
                .collect::<Vec<_>>(),
        );
        h.insert("pe", self.h.pe.as_str());
        if self.h.d {
            h.insert("d", true);
        }
        if self.h.c {
            h.insert("c", true);
        }
        if let Some(i) = self.h.i {
            h.insert("i", i as i64);
        }

        let mut m = Document::new();
        m.insert("ack", self.m.ack);
        m.insert("op", Bson::Timestamp(self.m.op));

        let mut doc = Document::new();
        doc.insert("h", h);
        doc.insert("m", m);
        doc.insert("b", self.b.clone());
        doc
    }

    /// Encode to wire bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ItemError> {
        let mut buf = Vec::new();
        self.to_doc().to_writer(&mut buf)?;
        Ok(buf)
    }

    /// Decode a wire document.
    pub fn from_doc(doc: &Document) -> Result<Self, ItemError> {
        Self::from_doc_with_perspective(doc, None)
    }

    /// Decode a wire document, stamping `fallback_pe` when the header
    /// carries no perspective (readers strip it on export).
    pub fn from_doc_with_perspective(
        doc: &Document,
        fallback_pe: Option<&Perspective>,
    ) -> Result<Self, ItemError> {
        let h = doc
            .get_document("h")
            .map_err(|_| ItemError::MissingField("h"))?;

        let id = match h.get("id") {
            Some(Bson::Binary(bin)) => DocId::new(bin.bytes.clone())?,
            Some(Bson::String(s)) => DocId::new(s.as_bytes().to_vec())?,
            Some(_) => return Err(ItemError::BadFieldType("h.id")),
            None => return Err(ItemError::MissingId),
        };

        let v = match h.get("v") {
            Some(Bson::String(s)) => Some(Version::from_base64(s)?),
            Some(_) => return Err(ItemError::BadFieldType("h.v")),
            None => None,
        };

        let pa = match h.get("pa") {
            Some(Bson::Array(arr)) => {
                let mut pa = Vec::with_capacity(arr.len());
                for p in arr {
                    match p {
                        Bson::String(s) => pa.push(Version::from_base64(s)?),
                        _ => return Err(ItemError::BadFieldType("h.pa")),
                    }
                }
                pa
            }
            Some(_) => return Err(ItemError::BadFieldType("h.pa")),
            None => Vec::new(),
        };

        let pe = match h.get("pe") {
            Some(Bson::String(s)) => Perspective::new(s.clone())?,
            Some(_) => return Err(ItemError::BadFieldType("h.pe")),
            None => match fallback_pe {
                Some(pe) => pe.clone(),
                None => return Err(ItemError::MissingField("h.pe")),
            },
        };

        let d = match h.get("d") {
            Some(Bson::Boolean(b)) => *b,
            Some(_) => return Err(ItemError::BadFieldType("h.d")),
            None => false,
        };
        let c = match h.get("c") {
            Some(Bson::Boolean(b)) => *b,
            Some(_) => return Err(ItemError::BadFieldType("h.c")),
            None => false,
        };
        let i = match h.get("i") {
            Some(Bson::Int64(i)) if *i >= 0 => Some(*i as u64),
            Some(Bson::Int32(i)) if *i >= 0 => Some(*i as u64),
            Some(_) => return Err(ItemError::BadFieldType("h.i")),
            None => None,
        };

        let m = match doc.get_document("m") {
            Ok(m) => Meta {
                ack: m.get_bool("ack").unwrap_or(false),
                op: match m.get("op") {
                    Some(Bson::Timestamp(ts)) => *ts,
                    _ => Timestamp { time: 0, increment: 0 },
                },
            },
            Err(_) => Meta::default(),
        };

        let b = match doc.get("b") {
            Some(Bson::Document(b)) => b.clone(),
            Some(_) => return Err(ItemError::BadFieldType("b")),
            None => Document::new(),
        };

        Ok(Item {
            h: Header { id, v, pa, pe, d, c, i },
            m,
            b,
        })
    }

    /// Decode wire bytes.
    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, ItemError> {
        let doc = Document::from_reader(&mut bytes)?;
        Self::from_doc(&doc)
    }
}

/// Recursively sort document keys so serialization is order-independent.
pub(crate) fn canonicalize_doc(doc: &Document) -> Document {
    let mut keys: Vec<&String> = doc.keys().collect();
    keys.sort();
    let mut out = Document::new();
    for k in keys {
        if let Some(v) = doc.get(k) {
            out.insert(k.clone(), canonicalize_value(v));
        }
    }
    out
}

fn canonicalize_value(value: &Bson) -> Bson {
    match value {
        Bson::Document(d) => Bson::Document(canonicalize_doc(d)),
        Bson::Array(a) => Bson::Array(a.iter().map(canonicalize_value).collect()),
        other => other.clone(),
    }
}

// --- Builder ---

/// Builder for items, mirroring the header field order.
pub struct ItemBuilder {
    item: Item,
}

impl ItemBuilder {
    pub fn new(id: DocId, pe: Perspective) -> Self {
        Self {
            item: Item {
                h: Header {
                    id,
                    v: None,
                    pa: Vec::new(),
                    pe,
                    d: false,
                    c: false,
                    i: None,
                },
                m: Meta::default(),
                b: Document::new(),
            },
        }
    }

    pub fn version(mut self, v: Version) -> Self {
        self.item.h.v = Some(v);
        self
    }

    pub fn parents(mut self, pa: Vec<Version>) -> Self {
        self.item.h.pa = pa;
        self
    }

    pub fn deleted(mut self, d: bool) -> Self {
        self.item.h.d = d;
        self
    }

    pub fn conflicted(mut self, c: bool) -> Self {
        self.item.h.c = c;
        self
    }

    pub fn meta(mut self, m: Meta) -> Self {
        self.item.m = m;
        self
    }

    pub fn body(mut self, b: Document) -> Self {
        self.item.b = b;
        self
    }

    /// Finish with the given version.
    pub fn build(self) -> Item {
        self.item
    }

    /// Finish, deriving the content-hash version at the given width.
    pub fn build_hashed(mut self, v_size: usize) -> Result<Item, ItemError> {
        let v = self.item.content_version(v_size)?;
        self.item.h.v = Some(v);
        Ok(self.item)
    }
}
