use std::time::Duration;

use async_trait::async_trait;
use lexguard_core::{
    agent::{ensure_within_limit, AnalysisBackend},
    error::AnalysisError,
    AnalysisPayload, DocumentFormat,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{instruction::build_text_instruction, parse::parse_analysis};

/// Calls a locally-hosted Ollama model via its native chat API.
///
/// Keeps document content on the local machine. Ollama has no document input, so only
/// plain-text uploads can be analyzed; PDF and DOCX are rejected as provider errors.
pub struct OllamaBackend {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            timeout_secs: 300,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }
}

#[derive(Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    format: &'static str,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
}

#[derive(Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

#[async_trait]
impl AnalysisBackend for OllamaBackend {
    async fn analyze(
        &self,
        content: &[u8],
        mime_type: &str,
    ) -> Result<AnalysisPayload, AnalysisError> {
        ensure_within_limit(content)?;
        if DocumentFormat::from_mime(mime_type) != Some(DocumentFormat::PlainText) {
            return Err(AnalysisError::Provider(format!(
                "ollama backend only analyzes text/plain documents, got {mime_type}"
            )));
        }
        let text = String::from_utf8_lossy(content);

        let request_body = OllamaChatRequest {
            model: self.model.clone(),
            messages: vec![OllamaMessage {
                role: "user".into(),
                content: build_text_instruction(&text),
            }],
            stream: false,
            format: "json",
        };

        info!(
            model = %self.model,
            base_url = %self.base_url,
            bytes = content.len(),
            "calling ollama chat API"
        );

        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| AnalysisError::Provider(format!("Ollama client: {e}")))?;

        let response = match client.post(&url).json(&request_body).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(timeout_secs = self.timeout_secs, "ollama request timed out");
                return Err(AnalysisError::Provider(format!(
                    "Ollama request timed out after {}s",
                    self.timeout_secs
                )));
            }
            Err(e) => {
                warn!("ollama request failed: {}", e);
                return Err(AnalysisError::Provider(format!("Ollama request failed: {e}")));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "ollama returned non-200: {}", body);
            return Err(AnalysisError::Provider(format!("Ollama error {status}: {body}")));
        }

        let parsed: OllamaChatResponse = response.json().await.map_err(|e| {
            warn!("failed to parse ollama response: {}", e);
            AnalysisError::Provider(format!("Failed to parse Ollama response: {e}"))
        })?;

        let output = parsed.message.content;
        if output.trim().is_empty() {
            return Err(AnalysisError::Provider("Ollama returned an empty response".into()));
        }

        info!(output_len = output.len(), "ollama response received");
        Ok(parse_analysis(&output))
    }

    fn name(&self) -> &str {
        "ollama"
    }
}
