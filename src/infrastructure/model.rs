use crate::domain::types::ChatMessage;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

/// Fixed char-to-token ratio used when trimming prompts to the context window.
pub const CHARS_PER_TOKEN: usize = 4;

const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub tools_description: Option<String>,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("model provider returned invalid response: {0}")]
    InvalidResponse(String),
}

impl ModelError {
    pub fn user_message(&self) -> String {
        match self {
            ModelError::Network(err) => {
                if err.is_connect() {
                    "Could not reach the model service. Check your network connection.".to_string()
                } else if err.is_timeout() {
                    "The model service took too long to answer. Try again shortly.".to_string()
                } else if let Some(status) = err.status() {
                    match status {
                        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                            "The model service rejected the API key. Check GEMINI_API_KEY."
                                .to_string()
                        }
                        StatusCode::TOO_MANY_REQUESTS => {
                            "The model service is rate limiting requests. Try again later."
                                .to_string()
                        }
                        _ => format!(
                            "The model request failed with status {}. Try again later.",
                            status.as_u16()
                        ),
                    }
                } else {
                    "A network error occurred while contacting the model service.".to_string()
                }
            }
            ModelError::InvalidResponse(_) => {
                "The model returned a response that could not be processed.".to_string()
            }
        }
    }
}

/// Text-in/text-out planning capability. Any provider that can complete a
/// flattened transcript satisfies the loop.
#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String, ModelError>;
}

/// Concatenate system prompt, tool catalog, and transcript into one text
/// blob, keeping the tail when the result exceeds the context budget.
pub fn flatten_prompt(request: &CompletionRequest, context_window: usize) -> String {
    let mut sections = Vec::with_capacity(request.messages.len() + 2);
    if !request.system_prompt.trim().is_empty() {
        sections.push(request.system_prompt.trim().to_string());
    }
    if let Some(tools) = request
        .tools_description
        .as_deref()
        .filter(|text| !text.trim().is_empty())
    {
        sections.push(format!("Available tools:\n{}", tools.trim()));
    }
    for message in &request.messages {
        sections.push(format!(
            "{}: {}",
            message.role.as_str().to_uppercase(),
            message.content
        ));
    }
    let combined = sections.join("\n\n");

    let budget = context_window.saturating_mul(CHARS_PER_TOKEN);
    let total = combined.chars().count();
    if total <= budget {
        return combined;
    }
    combined
        .chars()
        .skip(total - budget)
        .collect()
}

/// Gemini `generateContent` transport with query-key auth.
#[derive(Clone)]
pub struct GeminiClient {
    http: Client,
    api_key: String,
    model: String,
    endpoint: String,
    context_window: usize,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, context_window: usize) -> Self {
        Self {
            http: Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            endpoint: GEMINI_ENDPOINT.to_string(),
            context_window,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn build_url(&self) -> String {
        let base = self.endpoint.trim_end_matches('/');
        format!(
            "{base}/{model}:generateContent?key={key}",
            model = self.model,
            key = self.api_key
        )
    }
}

#[async_trait]
impl PlanGenerator for GeminiClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String, ModelError> {
        let prompt = flatten_prompt(&request, self.context_window);
        let payload = json!({
            "contents": [
                { "role": "user", "parts": [{ "text": prompt }] }
            ],
            "generationConfig": {
                "temperature": request.temperature
            }
        });

        info!(
            model = self.model.as_str(),
            prompt_chars = prompt.len(),
            temperature = request.temperature,
            "Sending request to Gemini"
        );
        let response: GeminiResponse = self
            .http
            .post(self.build_url())
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!("Received response from Gemini");

        response
            .candidates
            .unwrap_or_default()
            .into_iter()
            .flat_map(|candidate| candidate.content)
            .flat_map(|content| content.parts)
            .find_map(|part| part.text)
            .ok_or_else(|| ModelError::InvalidResponse("missing candidate text".into()))
    }
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Deserialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    text: Option<String>,
}
