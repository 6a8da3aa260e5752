use anyhow::{Context, Result};
use raccord_contracts::models::PROVIDER_GEMINI;
use raccord_contracts::project::ProviderCredentials;
use serde_json::{json, Map, Value};

use super::http::HttpTransport;
use super::{GenerationBackend, GenerationOutput, GenerationRequest, OutputLayout};
use crate::config::EngineConfig;
use crate::error::GenerationError;
use crate::images::InlineImage;
use crate::non_empty_env;
use crate::prompt::PromptLayout;

pub(crate) fn gemini_api_base() -> String {
    non_empty_env("GEMINI_API_BASE")
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string())
}

/// Project credentials first, then the environment.
pub(crate) fn gemini_api_key(credentials: &ProviderCredentials) -> Option<String> {
    credentials
        .gemini_api_key
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| non_empty_env("GEMINI_API_KEY"))
        .or_else(|| non_empty_env("GOOGLE_API_KEY"))
}

/// `generateContent` caller shared by the image backend and the vision model.
#[derive(Debug, Clone)]
pub(crate) struct GeminiClient {
    api_base: String,
    transport: HttpTransport,
}

impl GeminiClient {
    pub(crate) fn new(api_base: String, config: &EngineConfig) -> Self {
        Self {
            api_base,
            transport: HttpTransport::new(config),
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    pub(crate) fn generate_content(
        &self,
        model: &str,
        api_key: &str,
        payload: &Value,
        warnings: &mut Vec<String>,
    ) -> Result<(String, Value)> {
        let endpoint = self.endpoint_for_model(model);
        let response = self.transport.post_json(
            "Gemini",
            &endpoint,
            &[("key", api_key)],
            payload,
            warnings,
        )?;
        if let Some(reason) = response
            .get("promptFeedback")
            .and_then(|feedback| feedback.get("blockReason"))
            .and_then(Value::as_str)
        {
            return Err(GenerationError::Provider {
                provider: PROVIDER_GEMINI.to_string(),
                message: format!("prompt blocked ({reason})"),
            }
            .into());
        }
        Ok((endpoint, response))
    }
}

pub(crate) fn inline_part(image: &InlineImage) -> Value {
    json!({
        "inlineData": {
            "mimeType": image.mime_type,
            "data": image.data,
        }
    })
}

/// Concatenated text parts of the first candidate.
pub(crate) fn response_text(payload: &Value) -> String {
    candidate_parts(payload)
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("")
}

fn candidate_parts(payload: &Value) -> Vec<Value> {
    payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn extract_image(payload: &Value) -> Option<InlineImage> {
    candidate_parts(payload).into_iter().find_map(|part| {
        let inline = part.get("inlineData").or_else(|| part.get("inline_data"))?;
        let data = inline.get("data").and_then(Value::as_str)?;
        if data.is_empty() {
            return None;
        }
        let mime_type = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or("image/png");
        Some(InlineImage {
            mime_type: mime_type.to_string(),
            data: data.to_string(),
        })
    })
}

fn default_safety_settings() -> Vec<Value> {
    [
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
    ]
    .into_iter()
    .map(|category| {
        json!({
            "category": category,
            "threshold": "BLOCK_ONLY_HIGH",
        })
    })
    .collect()
}

/// Primary backend: one multimodal `generateContent` call with the
/// directive first and every reference preceded by its role instruction.
pub struct GeminiBackend {
    client: GeminiClient,
}

impl GeminiBackend {
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_api_base(gemini_api_base(), config)
    }

    pub fn with_api_base(api_base: impl Into<String>, config: &EngineConfig) -> Self {
        Self {
            client: GeminiClient::new(api_base.into(), config),
        }
    }

    fn build_payload(request: &GenerationRequest<'_>) -> Map<String, Value> {
        let mut parts = vec![json!({ "text": request.prompt.text })];
        for segment in &request.prompt.references {
            parts.push(json!({ "text": segment.label }));
            parts.push(inline_part(&segment.image));
        }

        let mut image_config = Map::new();
        image_config.insert(
            "aspectRatio".to_string(),
            Value::String(request.aspect_ratio.to_string()),
        );
        if request.model.name.contains("gemini-3") {
            image_config.insert(
                "imageSize".to_string(),
                Value::String(request.resolution.to_ascii_uppercase()),
            );
        }

        let mut payload = Map::new();
        payload.insert(
            "contents".to_string(),
            json!([{ "role": "user", "parts": parts }]),
        );
        payload.insert(
            "generationConfig".to_string(),
            json!({
                "responseModalities": ["IMAGE"],
                "imageConfig": image_config,
            }),
        );
        payload.insert(
            "safetySettings".to_string(),
            Value::Array(default_safety_settings()),
        );
        payload
    }
}

impl GenerationBackend for GeminiBackend {
    fn name(&self) -> &str {
        PROVIDER_GEMINI
    }

    fn prompt_layout(&self) -> PromptLayout {
        PromptLayout::SubjectFirst
    }

    fn generate(&self, request: &GenerationRequest<'_>) -> Result<GenerationOutput> {
        let Some(api_key) = gemini_api_key(request.credentials) else {
            return Err(GenerationError::FatalAuth {
                provider: PROVIDER_GEMINI.to_string(),
                message: "GEMINI_API_KEY or GOOGLE_API_KEY not set".to_string(),
            }
            .into());
        };
        let mut warnings = Vec::new();
        let payload = Self::build_payload(request);
        let (endpoint, response) = self
            .client
            .generate_content(
                &request.model.name,
                &api_key,
                &Value::Object(payload.clone()),
                &mut warnings,
            )
            .with_context(|| format!("Gemini generation failed for scene {}", request.scene_id))?;
        let image = extract_image(&response).ok_or_else(|| GenerationError::NoImageReturned {
            provider: PROVIDER_GEMINI.to_string(),
        })?;

        let mut provider_request = Map::new();
        provider_request.insert("endpoint".to_string(), Value::String(endpoint));
        provider_request.insert("payload".to_string(), Value::Object(payload));
        Ok(GenerationOutput {
            image,
            media_id: response
                .get("responseId")
                .and_then(Value::as_str)
                .map(str::to_string),
            layout: OutputLayout::Single,
            provider_request,
            warnings,
        })
    }
}
