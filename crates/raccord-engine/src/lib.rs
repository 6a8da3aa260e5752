pub mod analytics;
pub mod backends;
pub mod cascade;
pub mod config;
pub mod error;
pub mod images;
pub mod narrative;
pub mod orchestrator;
pub mod pose;
pub mod prompt;
pub mod raccord;
pub mod scheduler;
pub mod shot;
#[cfg(test)]
mod testing;
pub mod vision;

use std::env;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use raccord_contracts::events::{EventPayload, EventWriter};
use raccord_contracts::models::{ModelRegistry, ModelSelector};
use raccord_contracts::project::{ProjectState, ProjectStore};
use raccord_contracts::runs::prompt_history::PromptHistoryWriter;
use raccord_contracts::runs::scene_history::SceneHistory;
use serde_json::Value;
use uuid::Uuid;

use crate::analytics::{AnalyticsQueue, AnalyticsRecorder, LogRecorder, PromptHistoryRecorder};
use crate::backends::{default_backend_registry, BackendRegistry};
use crate::config::EngineConfig;
use crate::error::{ErrorClassifier, HeuristicErrorClassifier};
use crate::images::{HttpReferenceLoader, ReferenceLoader};
use crate::prompt::PromptAssembler;
use crate::raccord::{DecisionAgent, HeuristicDecisionAgent};
use crate::scheduler::{CancelToken, GenerationLocks};
use crate::vision::{vision_for_model, VisionModel};

pub use crate::orchestrator::{GenerateOptions, SceneOutcome};
pub use crate::scheduler::{BatchOptions, BatchReport};

/// Owns one project and everything needed to generate its scenes.
///
/// All methods take `&self`; two batches may run on two threads against the
/// same engine and the generation locks keep them off each other's scenes.
pub struct SceneEngine {
    run_id: String,
    store: ProjectStore,
    config: EngineConfig,
    models: ModelSelector,
    backends: BackendRegistry,
    vision: Option<Arc<dyn VisionModel>>,
    loader: Arc<dyn ReferenceLoader>,
    assembler: PromptAssembler,
    classifier: Box<dyn ErrorClassifier>,
    decision_agent: Box<dyn DecisionAgent>,
    events: EventWriter,
    analytics: AnalyticsQueue,
    history: Option<Mutex<SceneHistory>>,
    locks: GenerationLocks,
    cancel: CancelToken,
}

impl SceneEngine {
    pub fn builder(state: ProjectState) -> SceneEngineBuilder {
        SceneEngineBuilder::new(state)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn store(&self) -> &ProjectStore {
        &self.store
    }

    pub fn snapshot(&self) -> Arc<ProjectState> {
        self.store.snapshot()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn locks(&self) -> &GenerationLocks {
        &self.locks
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    /// Drains the analytics queue and persists scene history.
    pub fn finish(&self) -> Result<u64> {
        let delivered = self.analytics.shutdown();
        if let Some(history) = self.history.as_ref() {
            let history = match history.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            history.save()?;
        }
        Ok(delivered)
    }

    pub(crate) fn emit(&self, event_type: &str, payload: Value) {
        if let Err(err) = self.events.emit(event_type, map_object(payload)) {
            tracing::warn!(event_type, error = %err, "event write failed");
        }
    }

    pub(crate) fn emit_scene(&self, event_type: &str, scene_id: &str, payload: Value) {
        if let Err(err) = self
            .events
            .emit_scene(event_type, scene_id, map_object(payload))
        {
            tracing::warn!(event_type, scene_id, error = %err, "event write failed");
        }
    }

    pub(crate) fn with_history(&self, apply: impl FnOnce(&mut SceneHistory)) {
        let Some(history) = self.history.as_ref() else {
            return;
        };
        let mut history = match history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply(&mut history);
        if let Err(err) = history.save() {
            tracing::warn!(error = %err, "scene history write failed");
        }
    }
}

pub struct SceneEngineBuilder {
    state: ProjectState,
    config: Option<EngineConfig>,
    run_id: Option<String>,
    registry: Option<ModelRegistry>,
    backends: Option<BackendRegistry>,
    vision: Option<Arc<dyn VisionModel>>,
    loader: Option<Arc<dyn ReferenceLoader>>,
    classifier: Option<Box<dyn ErrorClassifier>>,
    decision_agent: Option<Box<dyn DecisionAgent>>,
    recorder: Option<Box<dyn AnalyticsRecorder>>,
}

impl SceneEngineBuilder {
    pub fn new(state: ProjectState) -> Self {
        Self {
            state,
            config: None,
            run_id: None,
            registry: None,
            backends: None,
            vision: None,
            loader: None,
            classifier: None,
            decision_agent: None,
            recorder: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn model_registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn backends(mut self, backends: BackendRegistry) -> Self {
        self.backends = Some(backends);
        self
    }

    pub fn vision(mut self, vision: Arc<dyn VisionModel>) -> Self {
        self.vision = Some(vision);
        self
    }

    pub fn reference_loader(mut self, loader: Arc<dyn ReferenceLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn error_classifier(mut self, classifier: Box<dyn ErrorClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn decision_agent(mut self, agent: Box<dyn DecisionAgent>) -> Self {
        self.decision_agent = Some(agent);
        self
    }

    pub fn analytics_recorder(mut self, recorder: Box<dyn AnalyticsRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn build(self) -> Result<SceneEngine> {
        let config = self.config.unwrap_or_else(EngineConfig::from_env);
        let run_id = self
            .run_id
            .unwrap_or_else(|| format!("run-{}", Uuid::new_v4().simple()));
        let models = ModelSelector::new(self.registry);
        let backends = self
            .backends
            .unwrap_or_else(|| default_backend_registry(&config));
        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(HttpReferenceLoader::new(config.request_timeout())));

        let vision = match self.vision {
            Some(vision) => Some(vision),
            None => match vision_for_model(
                &models,
                &self.state.settings.vision_model,
                &self.state.settings.credentials,
                &config,
            ) {
                Ok(vision) => Some(vision),
                Err(err) => {
                    tracing::warn!(error = %err, "no vision model; continuity checks disabled");
                    None
                }
            },
        };

        let (events, history, recorder) = match config.artifact_dir.as_deref() {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed creating {}", dir.display()))?;
                let recorder = self.recorder.unwrap_or_else(|| {
                    Box::new(PromptHistoryRecorder::new(PromptHistoryWriter::new(
                        dir.join("prompt_history.jsonl"),
                        self.state.project_name.clone(),
                    )))
                });
                (
                    EventWriter::new(dir.join("events.jsonl"), run_id.clone()),
                    Some(Mutex::new(SceneHistory::load(dir.join("scene_history.json")))),
                    recorder,
                )
            }
            None => (
                EventWriter::disabled(run_id.clone()),
                None,
                self.recorder
                    .unwrap_or_else(|| Box::new(LogRecorder) as Box<dyn AnalyticsRecorder>),
            ),
        };

        tracing::debug!(
            %run_id,
            backends = ?backends.names(),
            vision = ?vision.as_ref().map(|model| model.name().to_string()),
            "scene engine ready"
        );

        Ok(SceneEngine {
            run_id,
            store: ProjectStore::new(self.state),
            config,
            models,
            backends,
            vision,
            assembler: PromptAssembler::new(Arc::clone(&loader)),
            loader,
            classifier: self
                .classifier
                .unwrap_or_else(|| Box::new(HeuristicErrorClassifier)),
            decision_agent: self
                .decision_agent
                .unwrap_or_else(|| Box::new(HeuristicDecisionAgent)),
            events,
            analytics: AnalyticsQueue::spawn(recorder),
            history,
            locks: GenerationLocks::default(),
            cancel: CancelToken::default(),
        })
    }
}

pub(crate) fn map_object(value: Value) -> EventPayload {
    match value {
        Value::Object(map) => map,
        _ => EventPayload::new(),
    }
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Flattens an error chain into one line, skipping repeated causes.
pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() || parts.last().map(String::as_str) == Some(trimmed) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn push_unique_warning(warnings: &mut Vec<String>, message: String) {
    if message.trim().is_empty() || warnings.iter().any(|existing| existing == &message) {
        return;
    }
    warnings.push(message);
}

pub(crate) fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_chain_text_skips_repeats_and_truncates() {
        let err = anyhow::anyhow!("connection reset")
            .context("gemini request failed")
            .context("gemini request failed");
        assert_eq!(
            error_chain_text(&err, 200),
            "gemini request failed | caused by: connection reset"
        );
        assert_eq!(error_chain_text(&err, 6), "gemini…");
    }

    #[test]
    fn unique_warnings_ignore_blank_and_duplicates() {
        let mut warnings = Vec::new();
        push_unique_warning(&mut warnings, "cap exceeded".to_string());
        push_unique_warning(&mut warnings, "cap exceeded".to_string());
        push_unique_warning(&mut warnings, "  ".to_string());
        assert_eq!(warnings, vec!["cap exceeded".to_string()]);
    }
}
