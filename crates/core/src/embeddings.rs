use crate::error::ServiceError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use url::Url;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError>;
}

#[async_trait]
impl<T: Embedder + ?Sized> Embedder for Box<T> {
    fn dimensions(&self) -> usize {
        (**self).dimensions()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        (**self).embed(text).await
    }
}

/// Deterministic hashing embedder for offline runs and tests.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        Ok(self.embed_text(text))
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    #[serde(rename = "inputText")]
    input_text: &'a str,
}

/// Calls a remote embedding endpoint. Throttling surfaces as
/// [`ServiceError::RateLimited`] so callers can apply backoff.
pub struct HttpEmbedder {
    endpoint: Url,
    api_key: Option<String>,
    client: Client,
    dimensions: usize,
}

impl HttpEmbedder {
    pub fn new(
        endpoint: &str,
        api_key: Option<String>,
        dimensions: usize,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            endpoint: Url::parse(endpoint)?,
            api_key,
            client: Client::new(),
            dimensions,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .json(&EmbeddingRequest { input_text: text });

        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ServiceError::RateLimited {
                service: "embedding".to_string(),
                details: status.to_string(),
            });
        }
        if !status.is_success() {
            return Err(ServiceError::BackendResponse {
                service: "embedding".to_string(),
                details: status.to_string(),
            });
        }

        let payload: Value = response.json().await?;
        parse_embedding(&payload, self.dimensions)
    }
}

fn parse_embedding(payload: &Value, dimensions: usize) -> Result<Vec<f32>, ServiceError> {
    let values = payload
        .pointer("/embedding")
        .and_then(Value::as_array)
        .ok_or_else(|| ServiceError::BackendResponse {
            service: "embedding".to_string(),
            details: "response has no embedding array".to_string(),
        })?;

    let vector = values
        .iter()
        .map(|value| value.as_f64().map(|number| number as f32))
        .collect::<Option<Vec<f32>>>()
        .ok_or_else(|| ServiceError::BackendResponse {
            service: "embedding".to_string(),
            details: "embedding contains non-numeric values".to_string(),
        })?;

    if dimensions > 0 && vector.len() != dimensions {
        return Err(ServiceError::BackendResponse {
            service: "embedding".to_string(),
            details: format!("embedding dimension {} != {}", vector.len(), dimensions),
        });
    }

    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::{parse_embedding, CharacterNgramEmbedder, Embedder, HttpEmbedder};
    use serde_json::json;

    #[tokio::test]
    async fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed("Persistent fever and cough").await.ok();
        let second = embedder.embed("Persistent fever and cough").await.ok();
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        let vector = embedder.embed_text("abc");
        assert_eq!(vector.len(), 32);
    }

    #[test]
    fn embedding_payload_is_parsed_and_checked() {
        let payload = json!({ "embedding": [0.5, -1.0, 2.0] });
        assert_eq!(parse_embedding(&payload, 3).ok(), Some(vec![0.5, -1.0, 2.0]));
        assert!(parse_embedding(&payload, 4).is_err());
        assert!(parse_embedding(&json!({ "vector": [] }), 0).is_err());
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        assert!(HttpEmbedder::new("not a url", None, 8).is_err());
    }
}
