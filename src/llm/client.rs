use log::debug;
use reqwest::{Client, StatusCode};

use crate::error::StructuringError;
use crate::llm::types::{
    Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig,
};
use crate::utils::truncate_diagnostic;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_STRUCTURING_MODEL: &str = "gemini-2.0-flash";

/// HTTP client for the generateContent API, driven with a JSON response
/// schema so the model's output is constrained to the statement shape.
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        GeminiClient {
            client: Client::new(),
            api_key,
            base_url: GEMINI_BASE_URL.to_string(),
            model: DEFAULT_STRUCTURING_MODEL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub(crate) async fn generate_content(
        &self,
        model: &str,
        system_prompt: &str,
        messages: Vec<Content>,
        response_schema: Option<serde_json::Value>,
    ) -> Result<String, StructuringError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );

        let payload = GenerateContentRequest {
            contents: messages,
            system_instruction: Some(Content::user(system_prompt)),
            generation_config: GenerationConfig {
                response_mime_type: "application/json".to_string(),
                response_schema,
                // Extraction wants determinism, not creativity.
                temperature: Some(0.0),
            },
        };

        debug!("generateContent call to model {}", model);
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        let body: GenerateContentResponse = response.json().await.map_err(|err| {
            StructuringError::MalformedResponse(format!("unreadable API response: {}", err))
        })?;

        body.candidates
            .and_then(|candidates| candidates.into_iter().next())
            .and_then(|candidate| {
                candidate
                    .content
                    .parts
                    .into_iter()
                    .find_map(|part| part.text)
            })
            .ok_or_else(|| {
                StructuringError::MalformedResponse("no text candidate in response".to_string())
            })
    }
}

fn map_transport_error(err: reqwest::Error) -> StructuringError {
    if err.is_timeout() {
        StructuringError::Timeout
    } else {
        StructuringError::Unknown(err.to_string())
    }
}

fn map_status(status: StatusCode, body: &str) -> StructuringError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => StructuringError::RateLimited,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StructuringError::Unauthorized,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => StructuringError::Timeout,
        StatusCode::BAD_REQUEST if body.to_lowercase().contains("schema") => {
            StructuringError::SchemaRejected(truncate_diagnostic(body))
        }
        _ => StructuringError::Unknown(format!(
            "generateContent error (status {}): {}",
            status,
            truncate_diagnostic(body)
        )),
    }
}
