//! Record types returned by the memory store.

use serde::{Deserialize, Serialize};

/// A stored text with its metadata, matching the `memories` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    /// UUID v7 (time-sortable) primary key.
    pub id: String,
    pub content: String,
    /// Arbitrary JSON metadata supplied at store time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Name of the model that produced the embedding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    pub updated_at: String,
}

/// One nearest-neighbour hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub memory: Memory,
    /// Cosine similarity to the query, derived from the vec0 L2 distance.
    pub similarity: f64,
    pub distance: f64,
}

/// Result returned from a store operation.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMemory {
    pub id: String,
    pub dimensions: usize,
}

/// Parse the `metadata` column.
pub(crate) fn parse_metadata(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}
