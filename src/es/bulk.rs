//! Bulk request encoding.
//!
//! Every document action becomes one metadata line plus, except for
//! deletes, one data line. Updates wrap their body in a `doc` envelope for
//! partial-document semantics.

use crate::error::Result;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Bulk action kind.
///
/// See <https://www.elastic.co/guide/en/elasticsearch/reference/current/docs-bulk.html>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BulkAction {
    #[default]
    Index,
    Create,
    Update,
    Delete,
}

impl BulkAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkAction::Index => "index",
            BulkAction::Create => "create",
            BulkAction::Update => "update",
            BulkAction::Delete => "delete",
        }
    }
}

impl fmt::Display for BulkAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One document action inside a bulk call.
#[derive(Debug, Clone, Default)]
pub struct BulkRequest {
    pub action: BulkAction,
    pub index: String,
    pub doc_type: String,
    pub id: String,
    pub parent: String,
    pub pipeline: String,
    pub data: Map<String, Value>,
}

impl BulkRequest {
    /// Append this action to a bulk body.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        let mut meta = Map::new();
        if !self.index.is_empty() {
            meta.insert("_index".into(), json!(self.index));
        }
        if !self.doc_type.is_empty() {
            meta.insert("_type".into(), json!(self.doc_type));
        }
        if !self.id.is_empty() {
            meta.insert("_id".into(), json!(self.id));
        }
        if !self.parent.is_empty() {
            meta.insert("_parent".into(), json!(self.parent));
        }
        if !self.pipeline.is_empty() {
            meta.insert("pipeline".into(), json!(self.pipeline));
        }

        let header = json!({ self.action.as_str(): Value::Object(meta) });
        serde_json::to_writer(&mut *buf, &header)?;
        buf.push(b'\n');

        match self.action {
            BulkAction::Delete => {}
            BulkAction::Update => {
                let doc = json!({ "doc": Value::Object(self.data.clone()) });
                serde_json::to_writer(&mut *buf, &doc)?;
                buf.push(b'\n');
            }
            BulkAction::Index | BulkAction::Create => {
                serde_json::to_writer(&mut *buf, &Value::Object(self.data.clone()))?;
                buf.push(b'\n');
            }
        }

        Ok(())
    }
}

/// Encode an ordered sequence of actions into one bulk body.
pub fn encode_bulk(requests: &[BulkRequest]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(requests.len() * 256);
    for request in requests {
        request.encode(&mut buf)?;
    }
    Ok(buf)
}

/// Per-item result in a bulk response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BulkResponseItem {
    #[serde(default, rename = "_index")]
    pub index: String,
    #[serde(default, rename = "_type")]
    pub doc_type: String,
    #[serde(default, rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub status: u16,
    /// Raw error object; present only when the item failed
    #[serde(default)]
    pub error: Option<Value>,
}

/// Response of a `_bulk` call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BulkResponse {
    #[serde(skip)]
    pub code: u16,
    #[serde(default)]
    pub took: u64,
    #[serde(default)]
    pub errors: bool,
    /// One entry per action, keyed by the action name
    #[serde(default)]
    pub items: Vec<HashMap<String, BulkResponseItem>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_lines(requests: &[BulkRequest]) -> Vec<Value> {
        let body = encode_bulk(requests).unwrap();
        String::from_utf8(body)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn doc(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_index_action_two_lines() {
        let request = BulkRequest {
            action: BulkAction::Index,
            index: "river".into(),
            doc_type: "river".into(),
            id: "1".into(),
            data: doc(&[("es_title", json!("first"))]),
            ..Default::default()
        };

        let lines = body_lines(&[request]);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["index"]["_index"], "river");
        assert_eq!(lines[0]["index"]["_id"], "1");
        assert_eq!(lines[1]["es_title"], "first");
    }

    #[test]
    fn test_delete_action_single_line() {
        let request = BulkRequest {
            action: BulkAction::Delete,
            index: "river".into(),
            doc_type: "river".into(),
            id: "3".into(),
            ..Default::default()
        };

        let lines = body_lines(&[request]);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].get("delete").is_some());
    }

    #[test]
    fn test_update_wraps_doc() {
        let request = BulkRequest {
            action: BulkAction::Update,
            index: "river".into(),
            doc_type: "river".into(),
            id: "1".into(),
            data: doc(&[("es_title", json!("first2"))]),
            ..Default::default()
        };

        let lines = body_lines(&[request]);
        assert_eq!(lines[1]["doc"]["es_title"], "first2");
    }

    #[test]
    fn test_parent_and_pipeline_in_metadata() {
        let request = BulkRequest {
            action: BulkAction::Index,
            index: "river".into(),
            doc_type: "river".into(),
            id: "1".into(),
            parent: "42".into(),
            pipeline: "clean".into(),
            ..Default::default()
        };

        let lines = body_lines(&[request]);
        assert_eq!(lines[0]["index"]["_parent"], "42");
        assert_eq!(lines[0]["index"]["pipeline"], "clean");
    }

    #[test]
    fn test_order_preserved() {
        let delete = BulkRequest {
            action: BulkAction::Delete,
            index: "river".into(),
            doc_type: "river".into(),
            id: "3".into(),
            ..Default::default()
        };
        let index = BulkRequest {
            action: BulkAction::Index,
            index: "river".into(),
            doc_type: "river".into(),
            id: "30".into(),
            data: doc(&[("title", json!("third"))]),
            ..Default::default()
        };

        let lines = body_lines(&[delete, index]);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["delete"]["_id"], "3");
        assert_eq!(lines[1]["index"]["_id"], "30");
    }

    #[test]
    fn test_parse_bulk_response() {
        let raw = r#"{
            "took": 30,
            "errors": true,
            "items": [
                {"index": {"_index": "river", "_type": "river", "_id": "1", "status": 200}},
                {"delete": {"_index": "river", "_type": "river", "_id": "2", "status": 404,
                            "error": {"type": "not_found"}}}
            ]
        }"#;
        let response: BulkResponse = serde_json::from_str(raw).unwrap();
        assert!(response.errors);
        assert_eq!(response.items.len(), 2);
        assert!(response.items[0]["index"].error.is_none());
        assert!(response.items[1]["delete"].error.is_some());
    }
}
