use crate::error::ServiceError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use url::Url;

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, ServiceError>;
}

#[async_trait]
impl<T: AnswerGenerator + ?Sized> AnswerGenerator for Box<T> {
    async fn generate(&self, prompt: &str) -> Result<String, ServiceError> {
        (**self).generate(prompt).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InferenceConfig {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.2,
            top_p: 0.9,
        }
    }
}

/// Messages-style text generation endpoint.
pub struct HttpGenerator {
    endpoint: Url,
    api_key: Option<String>,
    client: Client,
    inference: InferenceConfig,
}

impl HttpGenerator {
    pub fn new(endpoint: &str, api_key: Option<String>) -> Result<Self, ServiceError> {
        Ok(Self {
            endpoint: Url::parse(endpoint)?,
            api_key,
            client: Client::new(),
            inference: InferenceConfig::default(),
        })
    }

    pub fn with_inference(mut self, inference: InferenceConfig) -> Self {
        self.inference = inference;
        self
    }
}

#[async_trait]
impl AnswerGenerator for HttpGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, ServiceError> {
        let body = json!({
            "messages": [{ "role": "user", "content": [{ "text": prompt }] }],
            "inferenceConfig": {
                "maxTokens": self.inference.max_tokens,
                "temperature": self.inference.temperature,
                "topP": self.inference.top_p,
            }
        });

        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ServiceError::RateLimited {
                service: "generation".to_string(),
                details: status.to_string(),
            });
        }
        if !status.is_success() {
            return Err(ServiceError::BackendResponse {
                service: "generation".to_string(),
                details: status.to_string(),
            });
        }

        let payload: Value = response.json().await?;
        parse_generation(&payload)
    }
}

fn parse_generation(payload: &Value) -> Result<String, ServiceError> {
    payload
        .pointer("/output/message/content/0/text")
        .and_then(Value::as_str)
        .map(|text| text.trim().to_string())
        .ok_or_else(|| ServiceError::BackendResponse {
            service: "generation".to_string(),
            details: "response has no output text".to_string(),
        })
}
