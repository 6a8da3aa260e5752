mod dryrun;
mod gemini;
mod gommo;
mod http;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use raccord_contracts::models::ModelSpec;
use raccord_contracts::project::ProviderCredentials;
use serde_json::{Map, Value};

pub use dryrun::DryrunBackend;
pub use gemini::GeminiBackend;
pub(crate) use gemini::{gemini_api_base, gemini_api_key, inline_part, response_text, GeminiClient};
pub use gommo::{normalize_domain, GommoBackend};

use crate::config::EngineConfig;
use crate::images::{split_grid, InlineImage};
use crate::prompt::{AssembledPrompt, PromptLayout};

/// One provider call.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub scene_id: &'a str,
    pub model: &'a ModelSpec,
    pub prompt: &'a AssembledPrompt,
    pub aspect_ratio: &'a str,
    pub resolution: &'a str,
    pub credentials: &'a ProviderCredentials,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
    Single,
    /// A 2x2 montage of four variations.
    Grid2x2,
}

#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub image: InlineImage,
    pub media_id: Option<String>,
    pub layout: OutputLayout,
    /// Request description for receipts; inline payloads are stripped later.
    pub provider_request: Map<String, Value>,
    pub warnings: Vec<String>,
}

impl GenerationOutput {
    /// Primary frame plus alternates. A montage that cannot be split is
    /// kept whole.
    pub fn into_frames(self, scene_id: &str) -> (InlineImage, Vec<InlineImage>) {
        if self.layout == OutputLayout::Single {
            return (self.image, Vec::new());
        }
        match split_grid(&self.image) {
            Ok(mut frames) if !frames.is_empty() => {
                let primary = frames.remove(0);
                (primary, frames)
            }
            Ok(_) => (self.image, Vec::new()),
            Err(err) => {
                tracing::warn!(scene_id, error = %err, "grid output could not be split; keeping montage");
                (self.image, Vec::new())
            }
        }
    }
}

/// A text-to-image provider.
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;
    fn prompt_layout(&self) -> PromptLayout;
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<GenerationOutput>;
}

#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn GenerationBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn GenerationBackend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn GenerationBackend>> {
        self.backends.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }
}

pub fn default_backend_registry(config: &EngineConfig) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(DryrunBackend::default()));
    registry.register(Arc::new(GeminiBackend::new(config)));
    registry.register(Arc::new(GommoBackend::new(config)));
    registry
}
