// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document records and ingestion-time transforms.
//!
//! A scroll page yields raw hits (`{"_index", "_type", "_id", "_source",
//! "_routing"?}`). [`SourceRecord::from_hit`] validates the shape of one hit;
//! [`IngestTransform::apply`] turns it into a [`DocumentEnvelope`] routed to
//! its destination.
//!
//! # Lifecycle
//!
//! ```text
//! scroll hit ──▶ SourceRecord ──▶ (merge-diff) ──▶ IngestTransform ──▶ DocumentEnvelope ──▶ bulk line pair
//! ```
//!
//! The id of a `SourceRecord` never changes after decoding. Rewrites (index
//! and type overrides, field renames, id regeneration) happen exactly once,
//! inside `IngestTransform::apply`.

use crate::config::TransformConfig;
use crate::error::{Result, SyncError};
use serde_json::{Map, Value};

/// Schema-free document body. Keys are kept sorted, so equality is
/// insensitive to field order while arrays stay order-sensitive.
pub type Payload = Map<String, Value>;

/// One validated document as read from a cursor page.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub index: String,
    pub doc_type: String,
    pub id: String,
    pub routing: Option<String>,
    pub source: Payload,
}

impl SourceRecord {
    /// Validate and decode a raw scroll hit.
    ///
    /// Returns [`SyncError::DataShape`] for an upstream error record
    /// (`"status": 404`) or a hit missing `_index`, `_type`, `_id` or `_source`.
    pub fn from_hit(hit: Value) -> Result<Self> {
        let mut obj = match hit {
            Value::Object(obj) => obj,
            other => {
                return Err(SyncError::DataShape(format!("hit is not an object: {}", other)));
            }
        };

        if let Some(status) = obj.get("status").and_then(Value::as_u64) {
            if status == 404 {
                let response = obj.get("response").cloned().unwrap_or(Value::Null);
                return Err(SyncError::DataShape(format!("upstream 404: {}", response)));
            }
        }

        let index = take_string(&mut obj, "_index")?;
        let doc_type = take_string(&mut obj, "_type")?;
        let id = take_string(&mut obj, "_id")?;
        let source = match obj.remove("_source") {
            Some(Value::Object(source)) => source,
            Some(_) => return Err(SyncError::DataShape(format!("_source of {} is not an object", id))),
            None => return Err(SyncError::DataShape(format!("missing _source on {}", id))),
        };
        let routing = match obj.remove("_routing") {
            Some(Value::String(r)) if !r.is_empty() => Some(r),
            _ => None,
        };

        Ok(Self {
            index,
            doc_type,
            id,
            routing,
            source,
        })
    }
}

fn take_string(obj: &mut Map<String, Value>, key: &str) -> Result<String> {
    match obj.remove(key) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(SyncError::DataShape(format!("{} is not a string: {}", key, other))),
        None => Err(SyncError::DataShape(format!("missing {}", key))),
    }
}

/// A document routed to its destination, ready for bulk encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentEnvelope {
    pub index: String,
    pub doc_type: String,
    /// `None` when the target should assign the id.
    pub id: Option<String>,
    pub routing: Option<String>,
    pub payload: Payload,
}

/// A single `old:new` field rename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameRule {
    pub from: String,
    pub to: String,
}

impl RenameRule {
    /// Parse `"old:new,old2:new2"`. Whitespace around names is ignored.
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        list.split(',')
            .filter(|part| !part.trim().is_empty())
            .map(|part| {
                let (from, to) = part
                    .split_once(':')
                    .ok_or_else(|| SyncError::Config(format!("rename rule '{}' is not old:new", part)))?;
                let (from, to) = (from.trim(), to.trim());
                if from.is_empty() || to.is_empty() {
                    return Err(SyncError::Config(format!("rename rule '{}' has an empty side", part)));
                }
                Ok(Self {
                    from: from.to_string(),
                    to: to.to_string(),
                })
            })
            .collect()
    }
}

/// Configuration-driven rewrites applied once per document at ingestion.
#[derive(Debug, Clone, Default)]
pub struct IngestTransform {
    target_index: Option<String>,
    override_type: Option<String>,
    renames: Vec<RenameRule>,
    regenerate_id: bool,
}

impl IngestTransform {
    pub fn from_config(config: &TransformConfig) -> Result<Self> {
        Ok(Self {
            target_index: config.target_index.clone().filter(|s| !s.is_empty()),
            override_type: config.override_type.clone().filter(|s| !s.is_empty()),
            renames: config.rename_rules()?,
            regenerate_id: config.regenerate_id,
        })
    }

    /// Identity transform.
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Rewrite a record into its destination envelope.
    ///
    /// Fails with [`SyncError::DataShape`] if the resulting index or type is empty.
    pub fn apply(&self, record: SourceRecord) -> Result<DocumentEnvelope> {
        let SourceRecord {
            index,
            doc_type,
            id,
            routing,
            mut source,
        } = record;

        for rule in &self.renames {
            if rule.from == "_type" {
                source.insert(rule.to.clone(), Value::String(doc_type.clone()));
            } else if let Some(value) = source.remove(&rule.from) {
                source.insert(rule.to.clone(), value);
            }
        }

        let (index, doc_type) = self.route(index, doc_type);
        if index.is_empty() || doc_type.is_empty() {
            return Err(SyncError::DataShape(format!(
                "document {} has no destination index/type",
                id
            )));
        }

        Ok(DocumentEnvelope {
            index,
            doc_type,
            id: if self.regenerate_id { None } else { Some(id) },
            routing,
            payload: source,
        })
    }

    /// Apply the index/type overrides alone (used for deletes).
    pub fn route(&self, index: String, doc_type: String) -> (String, String) {
        (
            self.target_index.clone().unwrap_or(index),
            self.override_type.clone().unwrap_or(doc_type),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hit(id: &str) -> Value {
        json!({
            "_index": "products",
            "_type": "item",
            "_id": id,
            "_source": {"name": "widget", "price": 3}
        })
    }

    #[test]
    fn test_from_hit_valid() {
        let record = SourceRecord::from_hit(hit("a1")).unwrap();
        assert_eq!(record.index, "products");
        assert_eq!(record.doc_type, "item");
        assert_eq!(record.id, "a1");
        assert!(record.routing.is_none());
        assert_eq!(record.source["price"], json!(3));
    }

    #[test]
    fn test_from_hit_with_routing() {
        let mut value = hit("a1");
        value["_routing"] = json!("tenant-7");
        let record = SourceRecord::from_hit(value).unwrap();
        assert_eq!(record.routing.as_deref(), Some("tenant-7"));

        let mut value = hit("a2");
        value["_routing"] = json!("");
        let record = SourceRecord::from_hit(value).unwrap();
        assert!(record.routing.is_none());
    }

    #[test]
    fn test_from_hit_missing_fields() {
        for key in ["_index", "_type", "_id", "_source"] {
            let mut value = hit("a1");
            value.as_object_mut().unwrap().remove(key);
            let err = SourceRecord::from_hit(value).unwrap_err();
            assert!(matches!(err, SyncError::DataShape(_)), "missing {}", key);
        }
    }

    #[test]
    fn test_from_hit_upstream_404() {
        let err = SourceRecord::from_hit(json!({"status": 404, "response": "no such index"})).unwrap_err();
        assert!(err.to_string().contains("404"));
    }

    #[test]
    fn test_from_hit_not_an_object() {
        assert!(SourceRecord::from_hit(json!([1, 2])).is_err());
        assert!(SourceRecord::from_hit(json!("doc")).is_err());
    }

    #[test]
    fn test_parse_rename_rules() {
        let rules = RenameRule::parse_list(" title : name ,_type:kind").unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0], RenameRule { from: "title".into(), to: "name".into() });
        assert_eq!(rules[1].from, "_type");

        assert!(RenameRule::parse_list("").unwrap().is_empty());
        assert!(RenameRule::parse_list("title").is_err());
        assert!(RenameRule::parse_list("title:").is_err());
    }

    #[test]
    fn test_transform_passthrough() {
        let record = SourceRecord::from_hit(hit("a1")).unwrap();
        let envelope = IngestTransform::passthrough().apply(record.clone()).unwrap();
        assert_eq!(envelope.index, "products");
        assert_eq!(envelope.doc_type, "item");
        assert_eq!(envelope.id.as_deref(), Some("a1"));
        assert_eq!(envelope.payload, record.source);
    }

    #[test]
    fn test_transform_overrides_and_renames() {
        let config = TransformConfig {
            target_index: Some("products_v2".into()),
            override_type: Some("_doc".into()),
            rename_fields: Some("name:title,_type:legacy_type,missing:whatever".into()),
            regenerate_id: true,
        };
        let transform = IngestTransform::from_config(&config).unwrap();
        let envelope = transform.apply(SourceRecord::from_hit(hit("a1")).unwrap()).unwrap();

        assert_eq!(envelope.index, "products_v2");
        assert_eq!(envelope.doc_type, "_doc");
        assert!(envelope.id.is_none());
        assert_eq!(envelope.payload["title"], json!("widget"));
        assert!(!envelope.payload.contains_key("name"));
        assert_eq!(envelope.payload["legacy_type"], json!("item"));
        assert!(!envelope.payload.contains_key("whatever"));
    }

    #[test]
    fn test_transform_rejects_empty_destination() {
        let mut value = hit("a1");
        value["_index"] = json!("");
        let record = SourceRecord::from_hit(value).unwrap();
        assert!(IngestTransform::passthrough().apply(record).is_err());
    }

    #[test]
    fn test_payload_equality_ignores_key_order() {
        let a: Payload = serde_json::from_str(r#"{"a":1,"b":[1,2]}"#).unwrap();
        let b: Payload = serde_json::from_str(r#"{"b":[1,2],"a":1}"#).unwrap();
        let c: Payload = serde_json::from_str(r#"{"a":1,"b":[2,1]}"#).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
