//! Fakes shared by the engine's unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use raccord_contracts::models::PROVIDER_DRYRUN;
use raccord_contracts::project::{GenerationSettings, ProjectState, Scene, SceneGroup};
use serde_json::Map;

use crate::backends::{
    BackendRegistry, GenerationBackend, GenerationOutput, GenerationRequest, OutputLayout,
};
use crate::config::EngineConfig;
use crate::images::{InlineImage, ReferenceLoader};
use crate::prompt::{PromptLayout, ReferenceRole};
use crate::vision::VisionModel;
use crate::SceneEngine;

pub(crate) const PASS: &str = r#"{"isValid": true, "errors": [], "decision": "skip"}"#;
pub(crate) const CHARACTER_ERROR: &str = r#"{"isValid": false, "errors": [{"type": "character", "severity": "critical", "description": "her face is a different person"}], "decision": "retry"}"#;

#[derive(Debug, Clone)]
struct Call {
    scene_id: String,
    prompt: String,
    cascade: Vec<String>,
    continuity: Vec<String>,
}

type Gate = (Sender<()>, Receiver<()>);

/// Records every call; fails scenes listed in `failures`. With a gate, the
/// first call reports on the sender and blocks until the receiver fires.
#[derive(Default)]
pub(crate) struct FakeBackend {
    calls: Mutex<Vec<Call>>,
    failures: BTreeMap<String, String>,
    gate: Mutex<Option<Gate>>,
}

impl FakeBackend {
    pub(crate) fn failing(failures: &[(&str, &str)]) -> Self {
        Self {
            failures: failures
                .iter()
                .map(|(id, message)| (id.to_string(), message.to_string()))
                .collect(),
            ..Self::default()
        }
    }

    pub(crate) fn gated(started: Sender<()>, release: Receiver<()>) -> Self {
        Self {
            gate: Mutex::new(Some((started, release))),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|rows| rows.clone()).unwrap_or_default()
    }

    pub(crate) fn calls_for(&self, scene_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.scene_id == scene_id)
            .count()
    }

    pub(crate) fn prompts_for(&self, scene_id: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.scene_id == scene_id)
            .map(|call| call.prompt)
            .collect()
    }

    pub(crate) fn cascade_sources_for(&self, scene_id: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.scene_id == scene_id)
            .flat_map(|call| call.cascade)
            .collect()
    }

    pub(crate) fn continuity_sources_for(&self, scene_id: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.scene_id == scene_id)
            .flat_map(|call| call.continuity)
            .collect()
    }
}

impl GenerationBackend for FakeBackend {
    fn name(&self) -> &str {
        PROVIDER_DRYRUN
    }

    fn prompt_layout(&self) -> PromptLayout {
        PromptLayout::SubjectFirst
    }

    fn generate(&self, request: &GenerationRequest<'_>) -> Result<GenerationOutput> {
        let count = {
            let mut calls = self
                .calls
                .lock()
                .map_err(|_| anyhow::anyhow!("calls lock poisoned"))?;
            calls.push(Call {
                scene_id: request.scene_id.to_string(),
                prompt: request.prompt.text.clone(),
                cascade: sources_with_role(request, ReferenceRole::CascadeAnchor),
                continuity: sources_with_role(request, ReferenceRole::ContinuityAnchor),
            });
            calls.len()
        };
        let gate = self.gate.lock().ok().and_then(|mut gate| gate.take());
        if let Some((started, release)) = gate {
            started.send(()).ok();
            release.recv().ok();
        }
        if let Some(message) = self.failures.get(request.scene_id) {
            anyhow::bail!("{message}");
        }
        let bytes = format!("{}-{count}", request.scene_id);
        Ok(GenerationOutput {
            image: InlineImage::from_bytes(bytes.as_bytes(), Some("image/png")),
            media_id: Some(format!("fake-{count}")),
            layout: OutputLayout::Single,
            provider_request: Map::new(),
            warnings: Vec::new(),
        })
    }
}

fn sources_with_role(request: &GenerationRequest<'_>, role: ReferenceRole) -> Vec<String> {
    request
        .prompt
        .references
        .iter()
        .filter(|segment| segment.role == role)
        .map(|segment| segment.source.clone())
        .collect()
}

/// Replies from a queue, then repeats the fallback forever. Every
/// instruction it receives is kept.
pub(crate) struct ScriptedVision {
    replies: Mutex<VecDeque<String>>,
    fallback: std::result::Result<String, String>,
    instructions: Mutex<Vec<String>>,
}

impl ScriptedVision {
    pub(crate) fn always(reply: &str) -> Self {
        Self::sequence(&[], reply)
    }

    pub(crate) fn sequence(replies: &[&str], fallback: &str) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|reply| reply.to_string()).collect()),
            fallback: Ok(fallback.to_string()),
            instructions: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing(message: &str) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: Err(message.to_string()),
            instructions: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn instructions(&self) -> Vec<String> {
        self.instructions
            .lock()
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }
}

impl VisionModel for ScriptedVision {
    fn name(&self) -> &str {
        "scripted-vision"
    }

    fn analyze(&self, instruction: &str, _images: &[InlineImage]) -> Result<String> {
        if let Ok(mut rows) = self.instructions.lock() {
            rows.push(instruction.to_string());
        }
        let queued = self.replies.lock().ok().and_then(|mut rows| rows.pop_front());
        if let Some(reply) = queued {
            return Ok(reply);
        }
        self.fallback.clone().map_err(anyhow::Error::msg)
    }
}

/// Data URLs decode as usual; anything else resolves to a stub image.
pub(crate) struct FakeLoader;

impl ReferenceLoader for FakeLoader {
    fn load(&self, source: &str) -> Result<InlineImage> {
        Ok(InlineImage::parse_data_url(source)
            .unwrap_or_else(|| InlineImage::from_bytes(source.as_bytes(), Some("image/png"))))
    }
}

pub(crate) fn office_project(numbers: &[u32]) -> ProjectState {
    ProjectState {
        project_name: "Short".to_string(),
        scenes: numbers
            .iter()
            .map(|number| Scene {
                group_id: Some("office".to_string()),
                context_description: format!("Scene {number}: Mai reviews the contract at her desk."),
                ..Scene::new(format!("s{number}"), *number)
            })
            .collect(),
        scene_groups: vec![SceneGroup {
            id: "office".to_string(),
            name: "Office".to_string(),
            time_of_day: Some("night".to_string()),
            ..SceneGroup::default()
        }],
        settings: GenerationSettings {
            image_model: "dryrun-image-1".to_string(),
            vision_model: "dryrun-vision-1".to_string(),
            ..GenerationSettings::default()
        },
        ..ProjectState::default()
    }
}

fn test_config(artifact_dir: Option<&Path>) -> EngineConfig {
    EngineConfig {
        inter_scene_delay_ms: 0,
        artifact_dir: artifact_dir.map(Path::to_path_buf),
        ..EngineConfig::default()
    }
}

fn build(
    state: ProjectState,
    backend: Arc<FakeBackend>,
    vision: Arc<ScriptedVision>,
    artifact_dir: Option<&Path>,
) -> Result<SceneEngine> {
    let mut backends = BackendRegistry::new();
    backends.register(backend);
    SceneEngine::builder(state)
        .config(test_config(artifact_dir))
        .run_id("test-run")
        .backends(backends)
        .vision(vision)
        .reference_loader(Arc::new(FakeLoader))
        .build()
}

pub(crate) fn engine(
    state: ProjectState,
    backend: Arc<FakeBackend>,
    vision: Arc<ScriptedVision>,
) -> Result<SceneEngine> {
    build(state, backend, vision, None)
}

pub(crate) fn engine_with_dir(
    state: ProjectState,
    backend: Arc<FakeBackend>,
    vision: Arc<ScriptedVision>,
    dir: &Path,
) -> Result<SceneEngine> {
    build(state, backend, vision, Some(dir))
}
