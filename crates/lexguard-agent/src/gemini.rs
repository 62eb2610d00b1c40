use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use lexguard_core::{
    agent::{ensure_within_limit, AnalysisBackend},
    error::AnalysisError,
    AnalysisPayload,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{instruction::ANALYSIS_PROMPT, parse::parse_analysis};

/// Sends the raw document to Gemini `generateContent` as inline data.
pub struct GeminiBackend {
    pub base_url: String,
    pub model: String,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiBackend {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: api_key.into(),
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }
}

pub fn build_request_body(content: &[u8], mime_type: &str) -> Value {
    let data = base64::engine::general_purpose::STANDARD.encode(content);
    json!({
        "contents": [{
            "parts": [
                { "text": ANALYSIS_PROMPT },
                { "inline_data": { "mime_type": mime_type, "data": data } }
            ]
        }],
        "generationConfig": {
            "temperature": 1,
            "topK": 1,
            "topP": 1,
            "maxOutputTokens": 4096
        }
    })
}

/// `candidates[0].content.parts[0].text`, if present and non-blank.
pub fn candidate_text(response: &Value) -> Option<&str> {
    response
        .pointer("/candidates/0/content/parts/0/text")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

#[async_trait]
impl AnalysisBackend for GeminiBackend {
    async fn analyze(
        &self,
        content: &[u8],
        mime_type: &str,
    ) -> Result<AnalysisPayload, AnalysisError> {
        ensure_within_limit(content)?;
        if self.api_key.is_empty() {
            return Err(AnalysisError::Provider("GEMINI_API_KEY is not configured".into()));
        }

        info!(
            model = %self.model,
            bytes = content.len(),
            mime_type,
            "calling gemini generateContent"
        );

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&build_request_body(content, mime_type))
            .send()
            .await
            .map_err(|e| {
                let what = if e.is_timeout() { "timed out" } else { "failed" };
                warn!(model = %self.model, "gemini request {what}: {}", e);
                AnalysisError::Provider(format!("Gemini request {what}: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "gemini returned non-200: {}", body);
            return Err(AnalysisError::Provider(format!("Gemini API error: {status}")));
        }

        let parsed: Value = response.json().await.map_err(|e| {
            warn!("failed to parse gemini response: {}", e);
            AnalysisError::Provider(format!("Failed to parse Gemini response: {e}"))
        })?;

        let text = candidate_text(&parsed).ok_or_else(|| {
            AnalysisError::Provider("No analysis text received from Gemini".into())
        })?;

        info!(output_len = text.len(), "gemini response received");
        Ok(parse_analysis(text))
    }

    fn name(&self) -> &str {
        "gemini"
    }
}
