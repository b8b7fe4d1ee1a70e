use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::{GenerationFailure, Result};
use crate::generation::{GenerationService, Prompt, parse_payload};

pub const DEFAULT_MODEL: &str = "gemini-1.5-flash-latest";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection settings for [`GeminiService`].
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    /// Model name, e.g. `gemini-1.5-flash-latest`.
    pub model: String,

    /// Scheme and host of the Generative Language API. Overridable for proxies and tests.
    pub base_url: String,

    /// Whole-request timeout. This is the only timeout the pipeline has.
    pub timeout: Duration,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Built-in [`GenerationService`] backed by Google's `generateContent` REST endpoint.
#[derive(Debug, Clone)]
pub struct GeminiService {
    client: Client,
    endpoint: String,
    model: String,
}

impl GeminiService {
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(GenerationFailure::transport)?;

        let endpoint = format!(
            "{}/v1beta/models/{}:generateContent",
            config.base_url.trim_end_matches('/'),
            config.model
        );

        Ok(Self {
            client,
            endpoint,
            model: config.model,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl GenerationService for GeminiService {
    fn request(
        &self,
        credential: &str,
        prompt: Prompt<'_>,
    ) -> std::result::Result<Value, GenerationFailure> {
        let body = serde_json::to_vec(&request_body(&prompt)).map_err(GenerationFailure::Malformed)?;

        info!(model = %self.model, "calling generateContent");
        let resp = self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", credential)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .map_err(GenerationFailure::transport)?;

        let status = resp.status();
        let text = resp.text().map_err(GenerationFailure::transport)?;
        debug!(status = status.as_u16(), bytes = text.len(), "generateContent replied");

        if !status.is_success() {
            return Err(GenerationFailure::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        parse_payload(&candidate_text(&text)?)
    }
}

/// Build the JSON body for a `generateContent` call.
pub fn request_body(prompt: &Prompt<'_>) -> Value {
    json!({
        "systemInstruction": {
            "parts": [{ "text": prompt.system_instruction }]
        },
        "contents": [{
            "role": "user",
            "parts": [{ "text": prompt.user_prompt }]
        }],
        "generationConfig": {
            "responseMimeType": "application/json",
            "responseSchema": prompt.schema.to_wire()
        }
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GenerateContentResponse {
    candidates: Vec<Candidate>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Part {
    text: Option<String>,
}

/// Extract the concatenated text of the first candidate from a `generateContent` reply.
pub fn candidate_text(body: &str) -> std::result::Result<String, GenerationFailure> {
    let resp: GenerateContentResponse =
        serde_json::from_str(body).map_err(GenerationFailure::Malformed)?;

    let text: String = resp
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(GenerationFailure::EmptyPayload);
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;

    #[test]
    fn endpoint_joins_base_url_and_model() -> anyhow::Result<()> {
        let svc = GeminiService::new(GeminiConfig {
            model: "gemini-test".to_string(),
            base_url: "http://localhost:9999/".to_string(),
            timeout: Duration::from_secs(1),
        })?;
        assert_eq!(
            svc.endpoint(),
            "http://localhost:9999/v1beta/models/gemini-test:generateContent"
        );
        Ok(())
    }

    #[test]
    fn request_body_carries_instruction_prompt_and_schema() {
        let schema = Schema::object([("title", Schema::string())]);
        let body = request_body(&Prompt {
            system_instruction: "be brief",
            user_prompt: "write a title",
            schema: &schema,
        });

        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "write a title");
        assert_eq!(
            body["generationConfig"]["responseMimeType"],
            "application/json"
        );
        assert_eq!(
            body["generationConfig"]["responseSchema"],
            schema.to_wire()
        );
    }

    #[test]
    fn candidate_text_concatenates_parts() -> anyhow::Result<()> {
        let body = r#"{
            "candidates": [
                { "content": { "parts": [ { "text": "{\"a\":" }, { "text": "1}" } ] } },
                { "content": { "parts": [ { "text": "ignored" } ] } }
            ]
        }"#;
        assert_eq!(candidate_text(body)?, r#"{"a":1}"#);
        Ok(())
    }

    #[test]
    fn candidate_text_without_candidates_is_empty_payload() {
        let body = r#"{ "promptFeedback": { "blockReason": "SAFETY" } }"#;
        assert!(matches!(
            candidate_text(body),
            Err(GenerationFailure::EmptyPayload)
        ));
    }

    #[test]
    fn candidate_text_rejects_non_json_body() {
        assert!(matches!(
            candidate_text("<html>oops</html>"),
            Err(GenerationFailure::Malformed(_))
        ));
    }
}
