//! Core types for the change feed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source-assigned position of an event in the change feed.
///
/// Opaque to the dispatcher. Positions compare lexicographically by byte,
/// which is how resume tokens from document stores order.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequencePosition(#[serde(with = "serde_bytes_hex")] Vec<u8>);

impl SequencePosition {
    /// Wrap raw token bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        SequencePosition(bytes.into())
    }

    /// Encode a counter big-endian so byte order matches numeric order.
    pub fn from_u64(n: u64) -> Self {
        SequencePosition(n.to_be_bytes().to_vec())
    }

    /// Parse from a hex token.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        Ok(SequencePosition(hex::decode(s)?))
    }

    /// Decode a position created by [`SequencePosition::from_u64`].
    pub fn as_u64(&self) -> Option<u64> {
        let arr: [u8; 8] = self.0.as_slice().try_into().ok()?;
        Some(u64::from_be_bytes(arr))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Debug for SequencePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pos({})", self.to_hex())
    }
}

impl fmt::Display for SequencePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Positions travel as hex strings in JSON and as raw bytes elsewhere.
mod serde_bytes_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        if s.is_human_readable() {
            s.serialize_str(&hex::encode(bytes))
        } else {
            serde_bytes::serialize(bytes, s)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        if d.is_human_readable() {
            let s = String::deserialize(d)?;
            hex::decode(s).map_err(serde::de::Error::custom)
        } else {
            serde_bytes::ByteBuf::deserialize(d).map(serde_bytes::ByteBuf::into_vec)
        }
    }
}

/// Position after which a consumer resumes reading.
///
/// Empty means "start from the source's current position".
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeCursor(Option<SequencePosition>);

impl ResumeCursor {
    /// A cursor that has never been advanced.
    pub fn empty() -> Self {
        ResumeCursor(None)
    }

    /// A cursor resuming after `position`.
    pub fn at(position: SequencePosition) -> Self {
        ResumeCursor(Some(position))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn position(&self) -> Option<&SequencePosition> {
        self.0.as_ref()
    }

    /// Move the cursor forward. Never moves backwards.
    pub fn advance(&mut self, position: &SequencePosition) {
        match &self.0 {
            Some(current) if current >= position => {}
            _ => self.0 = Some(position.clone()),
        }
    }
}

impl fmt::Debug for ResumeCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(pos) => write!(f, "Cursor({})", pos),
            None => write!(f, "Cursor(<empty>)"),
        }
    }
}

impl fmt::Display for ResumeCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(pos) => write!(f, "{}", pos),
            None => write!(f, "<empty>"),
        }
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }

    pub fn from_millis(ms: i64) -> Self {
        Timestamp(ms.saturating_mul(1000))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Store/collection an event belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub database: String,
    /// None for database-level events (e.g. `dropDatabase`).
    pub collection: Option<String>,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: Some(collection.into()),
        }
    }

    pub fn database(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: None,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.collection {
            Some(coll) => write!(f, "{}.{}", self.database, coll),
            None => write!(f, "{}", self.database),
        }
    }
}

/// Identifies the affected record within its namespace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordKey(pub Value);

impl RecordKey {
    pub fn new(key: impl Into<Value>) -> Self {
        RecordKey(key.into())
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of mutation, without payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    Other,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// A mutation together with the record state it carries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    /// New record; carries the full document.
    Insert { document: Value },

    /// Changed record; carries the changed fields and, if the source
    /// provides one, the post-image.
    Update {
        updated_fields: Map<String, Value>,
        removed_fields: Vec<String>,
        document: Option<Value>,
    },

    /// Removed record; the key is all there is.
    Delete,

    /// Anything else the source emits (replace, drop, rename, invalidate...).
    Other { kind: String, detail: Value },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Insert { .. } => OperationKind::Insert,
            Operation::Update { .. } => OperationKind::Update,
            Operation::Delete => OperationKind::Delete,
            Operation::Other { .. } => OperationKind::Other,
        }
    }
}

/// One mutation read from the change feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Position in the source stream (assigned by the source).
    pub position: SequencePosition,

    /// What happened, with its payload.
    pub operation: Operation,

    /// Where it happened.
    pub namespace: Namespace,

    /// Which record it happened to.
    pub key: RecordKey,

    /// When the source recorded it.
    pub timestamp: Timestamp,
}

impl ChangeEvent {
    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    /// The document view used for field matching.
    ///
    /// Inserts expose the full document. Updates expose the post-image when
    /// present, otherwise the changed fields. Deletes and other kinds expose
    /// nothing.
    pub fn document(&self) -> Option<DocumentView<'_>> {
        match &self.operation {
            Operation::Insert { document } => Some(DocumentView::Value(document)),
            Operation::Update {
                document: Some(document),
                ..
            } => Some(DocumentView::Value(document)),
            Operation::Update { updated_fields, .. } => Some(DocumentView::Fields(updated_fields)),
            Operation::Delete | Operation::Other { .. } => None,
        }
    }
}

/// Borrowed view over an event's record state.
#[derive(Clone, Copy, Debug)]
pub enum DocumentView<'a> {
    Value(&'a Value),
    Fields(&'a Map<String, Value>),
}

impl<'a> DocumentView<'a> {
    /// Resolve a dot-separated path (`"address.city"`).
    ///
    /// Update field maps may hold dotted keys verbatim, so the full path is
    /// tried as a literal key first.
    pub fn lookup(&self, path: &str) -> Option<&'a Value> {
        match self {
            DocumentView::Value(value) => walk(value, path),
            DocumentView::Fields(fields) => {
                if let Some(v) = fields.get(path) {
                    return Some(v);
                }
                let (head, rest) = match path.split_once('.') {
                    Some((h, r)) => (h, Some(r)),
                    None => (path, None),
                };
                let first = fields.get(head)?;
                match rest {
                    Some(rest) => walk(first, rest),
                    None => Some(first),
                }
            }
        }
    }
}

fn walk<'a>(mut value: &'a Value, path: &str) -> Option<&'a Value> {
    for segment in path.split('.') {
        value = match value {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

/// Identifies a persisted cursor: which source, read by which consumer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub source: String,
    pub consumer: String,
}

impl CheckpointKey {
    pub fn new(source: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            consumer: consumer.into(),
        }
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.consumer)
    }
}
