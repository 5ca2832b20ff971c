//! Conversion of document-store change documents into [`ChangeEvent`]s.
//!
//! Expected shape:
//!
//! ```text
//! {
//!   "_id": { "_data": "8263..." },
//!   "operationType": "insert",
//!   "ns": { "db": "ecommerce", "coll": "orders" },
//!   "documentKey": { "_id": ... },
//!   "fullDocument": { ... },
//!   "updateDescription": { "updatedFields": { ... }, "removedFields": [ ... ] },
//!   "wallTime": 1700000000000
//! }
//! ```

use super::SourceError;
use crate::types::{
    ChangeEvent, Namespace, Operation, RecordKey, SequencePosition, Timestamp,
};
use serde_json::{Map, Value};

/// Decode one change document.
pub fn decode_change_document(doc: &Value) -> Result<ChangeEvent, SourceError> {
    let obj = doc
        .as_object()
        .ok_or_else(|| malformed("change document is not an object"))?;

    let position = decode_token(obj.get("_id"))?;

    let op_type = obj
        .get("operationType")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing operationType"))?;

    let namespace = decode_namespace(obj.get("ns"))?;

    // Invalidate and drop events carry no documentKey.
    let key = RecordKey(obj.get("documentKey").cloned().unwrap_or(Value::Null));

    let full_document = obj
        .get("fullDocument")
        .filter(|v| !v.is_null())
        .cloned();

    let operation = match op_type {
        "insert" => Operation::Insert {
            document: full_document.ok_or_else(|| malformed("insert without fullDocument"))?,
        },
        "update" => {
            let (updated_fields, removed_fields) = decode_update(obj.get("updateDescription"))?;
            Operation::Update {
                updated_fields,
                removed_fields,
                document: full_document,
            }
        }
        "delete" => Operation::Delete,
        other => Operation::Other {
            kind: other.to_string(),
            detail: doc.clone(),
        },
    };

    Ok(ChangeEvent {
        position,
        operation,
        namespace,
        key,
        timestamp: decode_timestamp(obj),
    })
}

fn decode_token(id: Option<&Value>) -> Result<SequencePosition, SourceError> {
    let data = id
        .and_then(|v| v.get("_data"))
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing resume token _id._data"))?;
    SequencePosition::from_hex(data).map_err(|e| malformed(&format!("bad resume token: {}", e)))
}

fn decode_namespace(ns: Option<&Value>) -> Result<Namespace, SourceError> {
    let ns = ns.ok_or_else(|| malformed("missing ns"))?;
    let database = ns
        .get("db")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing ns.db"))?;
    Ok(Namespace {
        database: database.to_string(),
        collection: ns.get("coll").and_then(Value::as_str).map(str::to_string),
    })
}

fn decode_update(desc: Option<&Value>) -> Result<(Map<String, Value>, Vec<String>), SourceError> {
    let Some(desc) = desc else {
        return Ok((Map::new(), Vec::new()));
    };

    let updated = match desc.get("updatedFields") {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::Null) | None => Map::new(),
        Some(_) => return Err(malformed("updatedFields is not an object")),
    };

    let removed = match desc.get("removedFields") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| malformed("removedFields entry is not a string"))
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(Value::Null) | None => Vec::new(),
        Some(_) => return Err(malformed("removedFields is not an array")),
    };

    Ok((updated, removed))
}

fn decode_timestamp(obj: &Map<String, Value>) -> Timestamp {
    if let Some(ms) = obj.get("wallTime").and_then(Value::as_i64) {
        return Timestamp::from_millis(ms);
    }
    // clusterTime is a BSON timestamp: seconds in the high 32 bits of the
    // raw value, or `t` in its extended-JSON forms.
    if let Some(cluster_time) = obj.get("clusterTime") {
        let secs = match cluster_time {
            Value::Number(n) => n.as_u64().map(|raw| (raw >> 32) as i64),
            Value::Object(_) => cluster_time
                .get("$timestamp")
                .unwrap_or(cluster_time)
                .get("t")
                .and_then(Value::as_i64),
            _ => None,
        };
        if let Some(secs) = secs {
            return Timestamp(secs.saturating_mul(1_000_000));
        }
    }
    Timestamp::now()
}

fn malformed(msg: &str) -> SourceError {
    SourceError::Malformed(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperationKind;
    use serde_json::json;

    #[test]
    fn test_decode_insert() {
        let doc = json!({
            "_id": { "_data": "826500000001" },
            "operationType": "insert",
            "ns": { "db": "ecommerce", "coll": "orders" },
            "documentKey": { "_id": "o-1" },
            "fullDocument": { "_id": "o-1", "customer": "Bhargav", "total": 500 },
            "wallTime": 1_700_000_000_000i64
        });

        let event = decode_change_document(&doc).unwrap();
        assert_eq!(event.kind(), OperationKind::Insert);
        assert_eq!(event.namespace, Namespace::new("ecommerce", "orders"));
        assert_eq!(event.key, RecordKey::new(json!({"_id": "o-1"})));
        assert_eq!(event.position.to_hex(), "826500000001");
        assert_eq!(event.timestamp, Timestamp(1_700_000_000_000_000));
        match event.operation {
            Operation::Insert { document } => assert_eq!(document["total"], 500),
            other => panic!("Expected insert, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_update_description() {
        let doc = json!({
            "_id": { "_data": "02" },
            "operationType": "update",
            "ns": { "db": "ecommerce", "coll": "orders" },
            "documentKey": { "_id": "o-1" },
            "updateDescription": {
                "updatedFields": { "status": "shipped" },
                "removedFields": ["coupon"]
            }
        });

        let event = decode_change_document(&doc).unwrap();
        match event.operation {
            Operation::Update {
                updated_fields,
                removed_fields,
                document,
            } => {
                assert_eq!(updated_fields["status"], "shipped");
                assert_eq!(removed_fields, vec!["coupon".to_string()]);
                assert!(document.is_none());
            }
            other => panic!("Expected update, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_delete_and_other() {
        let delete = json!({
            "_id": { "_data": "03" },
            "operationType": "delete",
            "ns": { "db": "ecommerce", "coll": "orders" },
            "documentKey": { "_id": "o-1" }
        });
        assert_eq!(
            decode_change_document(&delete).unwrap().kind(),
            OperationKind::Delete
        );

        let drop = json!({
            "_id": { "_data": "04" },
            "operationType": "dropDatabase",
            "ns": { "db": "ecommerce" }
        });
        let event = decode_change_document(&drop).unwrap();
        assert_eq!(event.kind(), OperationKind::Other);
        assert_eq!(event.namespace.collection, None);
        assert_eq!(event.key.0, Value::Null);
    }

    #[test]
    fn test_decode_rejects_missing_token() {
        let doc = json!({
            "operationType": "delete",
            "ns": { "db": "ecommerce", "coll": "orders" }
        });
        assert!(matches!(
            decode_change_document(&doc),
            Err(SourceError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_insert_without_document() {
        let doc = json!({
            "_id": { "_data": "05" },
            "operationType": "insert",
            "ns": { "db": "ecommerce", "coll": "orders" },
            "documentKey": { "_id": "o-2" }
        });
        assert!(matches!(
            decode_change_document(&doc),
            Err(SourceError::Malformed(_))
        ));
    }

    fn delete_at(cluster_time: Value) -> Value {
        json!({
            "_id": { "_data": "06" },
            "operationType": "delete",
            "ns": { "db": "ecommerce", "coll": "orders" },
            "documentKey": { "_id": "o-3" },
            "clusterTime": cluster_time
        })
    }

    #[test]
    fn test_decode_cluster_time_raw_bson_timestamp() {
        // seconds in the high word, increment in the low word
        let raw = (1_700_000_000u64 << 32) | 7;
        let event = decode_change_document(&delete_at(json!(raw))).unwrap();
        assert_eq!(event.timestamp, Timestamp(1_700_000_000_000_000));
    }

    #[test]
    fn test_decode_cluster_time_extended_json() {
        let canonical = delete_at(json!({ "$timestamp": { "t": 1_700_000_000, "i": 7 } }));
        let event = decode_change_document(&canonical).unwrap();
        assert_eq!(event.timestamp, Timestamp(1_700_000_000_000_000));

        let relaxed = delete_at(json!({ "t": 1_700_000_001, "i": 1 }));
        let event = decode_change_document(&relaxed).unwrap();
        assert_eq!(event.timestamp, Timestamp(1_700_000_001_000_000));
    }
}
