use std::sync::Arc;

use anyhow::{Context, Result};
use raccord_contracts::models::{ModelSelector, PROVIDER_DRYRUN, PROVIDER_GEMINI};
use raccord_contracts::project::ProviderCredentials;
use serde_json::{json, Value};

use crate::backends::{gemini_api_base, gemini_api_key, inline_part, response_text, GeminiClient};
use crate::config::EngineConfig;
use crate::error::GenerationError;
use crate::images::InlineImage;

/// A multimodal text model used for continuity checks and edit reasoning.
pub trait VisionModel: Send + Sync {
    fn name(&self) -> &str;
    fn analyze(&self, instruction: &str, images: &[InlineImage]) -> Result<String>;
}

pub struct GeminiVision {
    client: GeminiClient,
    model: String,
    api_key: Option<String>,
}

impl GeminiVision {
    pub fn new(model: impl Into<String>, credentials: &ProviderCredentials, config: &EngineConfig) -> Self {
        Self {
            client: GeminiClient::new(gemini_api_base(), config),
            model: model.into(),
            api_key: gemini_api_key(credentials),
        }
    }
}

impl VisionModel for GeminiVision {
    fn name(&self) -> &str {
        &self.model
    }

    fn analyze(&self, instruction: &str, images: &[InlineImage]) -> Result<String> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(GenerationError::FatalAuth {
                provider: PROVIDER_GEMINI.to_string(),
                message: "GEMINI_API_KEY or GOOGLE_API_KEY not set".to_string(),
            }
            .into());
        };
        let mut parts = vec![json!({ "text": instruction })];
        parts.extend(images.iter().map(inline_part));
        let payload = json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": {
                "temperature": 0.2,
                "responseMimeType": "application/json",
            },
        });
        let mut warnings = Vec::new();
        let (_, response) = self
            .client
            .generate_content(&self.model, api_key, &payload, &mut warnings)
            .with_context(|| format!("vision analysis with {} failed", self.model))?;
        for warning in warnings {
            tracing::debug!(model = %self.model, "{warning}");
        }
        Ok(response_text(&response))
    }
}

/// Offline stand-in: every frame passes and edit instructions are kept.
#[derive(Debug, Default, Clone)]
pub struct DryrunVision;

impl VisionModel for DryrunVision {
    fn name(&self) -> &str {
        "dryrun-vision-1"
    }

    fn analyze(&self, _instruction: &str, _images: &[InlineImage]) -> Result<String> {
        Ok(json!({
            "isValid": true,
            "errors": [],
            "decision": "skip",
            "refinedInstruction": null,
        })
        .to_string())
    }
}

/// Builds the vision model named in project settings, falling back to the
/// first registered vision model.
pub fn vision_for_model(
    selector: &ModelSelector,
    requested: &str,
    credentials: &ProviderCredentials,
    config: &EngineConfig,
) -> Result<Arc<dyn VisionModel>> {
    let selection = selector
        .select(Some(requested), "vision")
        .map_err(anyhow::Error::msg)?;
    if let Some(reason) = selection.fallback_reason.as_deref() {
        tracing::warn!("{reason}");
    }
    match selection.model.provider.as_str() {
        PROVIDER_GEMINI => Ok(Arc::new(GeminiVision::new(
            selection.model.name,
            credentials,
            config,
        ))),
        PROVIDER_DRYRUN => Ok(Arc::new(DryrunVision)),
        other => anyhow::bail!("no vision client for provider '{other}'"),
    }
}

/// First JSON object in a model reply, tolerating code fences and prose.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end])
        .ok()
        .filter(Value::is_object)
}

/// Rewrites a terse edit request into an explicit one after looking at the
/// base image. `None` means the model had nothing better to offer.
pub fn refine_edit_instruction(
    vision: &dyn VisionModel,
    base_image: &InlineImage,
    instruction: &str,
) -> Result<Option<String>> {
    let prompt = format!(
        "You are preparing an image edit. Look at the attached image and rewrite the user's edit request \
         so an image model can apply it precisely: name the exact objects, positions and colors involved \
         and state what must stay unchanged.\n\
         User request: {}\n\
         Reply as JSON: {{\"refinedInstruction\": \"...\"}}",
        instruction.trim()
    );
    let reply = vision.analyze(&prompt, std::slice::from_ref(base_image))?;
    Ok(extract_json_object(&reply)
        .and_then(|value| {
            value
                .get("refinedInstruction")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|refined| !refined.is_empty())
                .map(str::to_string)
        }))
}
