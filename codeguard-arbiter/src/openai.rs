//! Externally scored arbiter over an OpenAI-compatible chat API.
//!
//! Works with any server exposing `/chat/completions` (vLLM, Ollama,
//! OpenAI). The model is asked for a JSON object and its answer goes
//! through [`parse_decision`]; the caller enforces the time bound.

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::decision::parse_decision;
use crate::evidence::ClaimEvidence;
use crate::traits::{Arbiter, ArbiterError, ArbiterVerdict};

const SYSTEM_PROMPT: &str = "You judge ownership disputes over single-use redemption codes. \
You receive a JSON evidence bundle describing the code's original owner, the device \
fingerprint and IP recorded when the code was issued, and the claimant's current \
fingerprint and IP. Null means the value was never recorded. Respond with exactly one \
JSON object: {\"approved\": boolean, \"reason\": string, \"confidence\": number between 0 and 1}. \
Approve only when the evidence supports that the claimant legitimately holds the code.";

/// OpenAI-compatible arbiter.
pub struct OpenAiArbiter {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiArbiter {
    /// Create a new OpenAI-compatible arbiter.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, ArbiterError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ArbiterError::Unavailable(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        })
    }

    /// Arbiter backed by a local Ollama server.
    pub fn ollama(model: &str) -> Result<Self, ArbiterError> {
        Self::new("http://localhost:11434/v1", model, None)
    }

    /// Arbiter backed by the OpenAI API.
    pub fn openai(model: &str, api_key: impl Into<String>) -> Result<Self, ArbiterError> {
        Self::new("https://api.openai.com/v1", model, Some(api_key.into()))
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn auth_header(&self) -> Option<String> {
        self.api_key.as_ref().map(|k| format!("Bearer {}", k))
    }
}

/// OpenAI chat completion request body.
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormatRequest,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormatRequest {
    #[serde(rename = "type")]
    format_type: &'static str,
}

/// OpenAI chat completion response.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageResponse,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Option<String>,
}

#[async_trait]
impl Arbiter for OpenAiArbiter {
    fn id(&self) -> &str {
        &self.model
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/models", self.base_url);
        let mut request = self.client.get(&url);

        if let Some(auth) = self.auth_header() {
            request = request.header(header::AUTHORIZATION, auth);
        }

        request
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn evaluate(&self, evidence: &ClaimEvidence) -> Result<ArbiterVerdict, ArbiterError> {
        let evidence_json = serde_json::to_string(evidence)
            .map_err(|e| ArbiterError::RequestFailed(format!("Failed to encode evidence: {}", e)))?;

        let chat_request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: evidence_json,
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormatRequest {
                format_type: "json_object",
            },
            stream: false,
        };

        let mut http_request = self.client.post(self.chat_completions_url());

        if let Some(auth) = self.auth_header() {
            http_request = http_request.header(header::AUTHORIZATION, auth);
        }

        let response = http_request
            .json(&chat_request)
            .send()
            .await
            .map_err(|e| ArbiterError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();

            if status.as_u16() == 429 {
                return Err(ArbiterError::RateLimited { retry_after_ms: None });
            }

            return Err(ArbiterError::RequestFailed(format!("HTTP {}: {}", status, body)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ArbiterError::NetworkError(e.to_string()))?;

        let chat_response: ChatResponse =
            serde_json::from_str(&body).map_err(|e| ArbiterError::Unparsable {
                reason: format!("malformed completion envelope: {}", e),
                raw: body.clone(),
            })?;

        let content = chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ArbiterError::Unparsable {
                reason: "no content in response".to_string(),
                raw: body.clone(),
            })?;

        debug!(model = %self.model, code = %evidence.code, "arbiter responded");

        let decision = parse_decision(&content)?;
        Ok(ArbiterVerdict {
            decision,
            raw: content,
        })
    }
}
