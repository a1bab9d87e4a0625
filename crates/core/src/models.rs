use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Axis-aligned box in the coordinate space of the upstream extractor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(from = "BoundingBoxRepr")]
pub struct BoundingBox {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl BoundingBox {
    pub fn new(left: f64, top: f64, right: f64, bottom: f64) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BoundingBoxRepr {
    Array([f64; 4]),
    Object {
        left: f64,
        top: f64,
        right: f64,
        bottom: f64,
    },
}

impl From<BoundingBoxRepr> for BoundingBox {
    fn from(value: BoundingBoxRepr) -> Self {
        match value {
            BoundingBoxRepr::Array([left, top, right, bottom]) => {
                BoundingBox::new(left, top, right, bottom)
            }
            BoundingBoxRepr::Object {
                left,
                top,
                right,
                bottom,
            } => BoundingBox::new(left, top, right, bottom),
        }
    }
}

/// A positioned text line as emitted by the upstream OCR/text-layer extractor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Line {
    pub text: String,
    /// 1-based page number.
    pub page: u32,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub page: u32,
    pub bbox: BoundingBox,
    pub source: String,
    pub sequence: u64,
}

impl Chunk {
    pub fn into_record(self, kind: impl Into<String>) -> ChunkRecord {
        ChunkRecord {
            chunk_id: self.sequence,
            page: Some(self.page),
            text: self.text,
            source: Some(self.source),
            kind: Some(kind.into()),
        }
    }
}

/// The per-file chunk record handed to ingestion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkRecord {
    pub chunk_id: u64,
    #[serde(default)]
    pub page: Option<u32>,
    pub text: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

/// Metadata stored in parallel with each indexed vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorMetadata {
    pub file: String,
    pub chunk_id: u64,
    pub text: String,
    pub page: Option<u32>,
    pub source: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

impl VectorMetadata {
    pub fn from_record(file: impl Into<String>, record: ChunkRecord) -> Self {
        Self {
            file: file.into(),
            chunk_id: record.chunk_id,
            text: record.text,
            page: record.page,
            source: record.source,
            kind: record.kind,
        }
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            file: self.file.clone(),
            chunk_id: self.chunk_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub file: String,
    pub chunk_id: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceCitation {
    pub file: String,
    pub page: Option<u32>,
    pub source: Option<String>,
    pub highlight: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnswerPayload {
    pub question: String,
    pub resolved_query: String,
    pub answer: String,
    pub sources: Vec<SourceCitation>,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkingOptions {
    pub x_threshold: f64,
    pub y_threshold: f64,
    pub max_chars: usize,
    pub overlap: usize,
    pub min_size: usize,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            x_threshold: 0.03,
            y_threshold: 0.02,
            max_chars: 1_500,
            overlap: 100,
            min_size: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetrievalOptions {
    pub short_query_tokens: usize,
    pub short_query_top_k: usize,
    pub default_top_k: usize,
    pub keyword_hits_per_term: usize,
    pub max_keyword_terms: usize,
    pub fingerprint_prefix_chars: usize,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            short_query_tokens: 3,
            short_query_top_k: 8,
            default_top_k: 5,
            keyword_hits_per_term: 5,
            max_keyword_terms: 8,
            fingerprint_prefix_chars: 120,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationOptions {
    pub overlap_threshold: f64,
    pub replay_window: usize,
    pub history_capacity: usize,
    pub max_fallback_run: usize,
    pub entity_labels: Vec<String>,
}

impl Default for ConversationOptions {
    fn default() -> Self {
        Self {
            overlap_threshold: 0.3,
            replay_window: 6,
            history_capacity: 50,
            max_fallback_run: 3,
            entity_labels: vec!["PERSON".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub capacity: usize,
    pub ttl: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            capacity: 1_024,
            ttl: Duration::from_secs(30 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_accepts_array_and_object_forms() -> Result<(), Box<dyn std::error::Error>> {
        let from_array: Line =
            serde_json::from_str(r#"{"text":"a","page":1,"bbox":[0.1,0.2,0.3,0.4]}"#)?;
        let from_object: Line = serde_json::from_str(
            r#"{"text":"a","page":1,"bbox":{"left":0.1,"top":0.2,"right":0.3,"bottom":0.4}}"#,
        )?;
        assert_eq!(from_array, from_object);
        assert_eq!(from_array.bbox.right, 0.3);
        Ok(())
    }

    #[test]
    fn chunk_record_reads_type_field() -> Result<(), Box<dyn std::error::Error>> {
        let record: ChunkRecord = serde_json::from_str(
            r#"{"chunk_id":4,"page":2,"text":"Allergies: none","source":"a.pdf#page=2","type":"patients"}"#,
        )?;
        assert_eq!(record.kind.as_deref(), Some("patients"));
        assert_eq!(record.chunk_id, 4);
        Ok(())
    }

    #[test]
    fn union_covers_both_boxes() {
        let merged = BoundingBox::new(0.1, 0.2, 0.3, 0.4).union(&BoundingBox::new(0.0, 0.3, 0.5, 0.35));
        assert_eq!(merged, BoundingBox::new(0.0, 0.2, 0.5, 0.4));
    }
}
