use crate::error::{Result, ScanError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Totals for one crawl run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrawlSummary {
    pub emitted: usize,
    pub skipped: usize,
    pub requests: usize,
    pub emitted_by_type: BTreeMap<String, usize>,
}

impl CrawlSummary {
    pub fn record_emitted(&mut self, definition_name: &str) {
        self.emitted += 1;
        *self
            .emitted_by_type
            .entry(definition_name.to_string())
            .or_default() += 1;
    }

    pub fn merge(&mut self, other: CrawlSummary) {
        self.emitted += other.emitted;
        self.skipped += other.skipped;
        self.requests += other.requests;
        for (name, count) in other.emitted_by_type {
            *self.emitted_by_type.entry(name).or_default() += count;
        }
    }
}

/// What the API reports about a node when asked for `metadata=1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub node_type: String,
    pub fields: Vec<String>,
    pub connections: Vec<String>,
}

impl NodeMetadata {
    pub fn from_response(response: &Value) -> Result<Self> {
        let metadata = response
            .get("metadata")
            .ok_or_else(|| ScanError::Parse("response has no metadata".to_string()))?;
        let node_type = metadata
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ScanError::Parse("metadata has no type".to_string()))?
            .to_string();
        let fields = metadata
            .get("fields")
            .and_then(Value::as_array)
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(|f| f.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let connections = metadata
            .get("connections")
            .and_then(Value::as_object)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();

        Ok(Self {
            node_type,
            fields,
            connections,
        })
    }

    /// Fields followed by connections.
    pub fn all_names(&self) -> Vec<String> {
        self.fields
            .iter()
            .chain(self.connections.iter())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metadata_from_response() {
        let response = json!({
            "id": "153080620724",
            "metadata": {
                "type": "page",
                "fields": [{"name": "about"}, {"name": "name"}],
                "connections": {"albums": "https://example.com/albums", "feed": "https://example.com/feed"}
            }
        });
        let metadata = NodeMetadata::from_response(&response).unwrap();
        assert_eq!(metadata.node_type, "page");
        assert_eq!(metadata.all_names(), vec!["about", "name", "albums", "feed"]);
    }

    #[test]
    fn test_metadata_without_type() {
        assert!(NodeMetadata::from_response(&json!({"metadata": {}})).is_err());
    }

    #[test]
    fn test_summary_merge() {
        let mut a = CrawlSummary::default();
        a.record_emitted("post");
        let mut b = CrawlSummary::default();
        b.record_emitted("post");
        b.record_emitted("comment");
        b.skipped = 1;
        a.merge(b);
        assert_eq!(a.emitted, 3);
        assert_eq!(a.skipped, 1);
        assert_eq!(a.emitted_by_type["post"], 2);
    }
}
