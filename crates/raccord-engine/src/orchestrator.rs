use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use raccord_contracts::models::ModelSpec;
use raccord_contracts::project::{
    DnaMode, FailureKind, GalleryEntry, ProjectAction, ProjectState, Scene,
};
use raccord_contracts::runs::receipts::{build_receipt, write_receipt, GenerationReceipt};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::analytics::AnalyticsEvent;
use crate::backends::GenerationRequest;
use crate::cascade::{resolve_cascade_reference, resolve_previous_frame};
use crate::error::GenerationError;
use crate::images::InlineImage;
use crate::prompt::{AssembledPrompt, PromptCorrection, PromptRequest};
use crate::raccord::{build_correction, RaccordValidator, RetryPolicy, ValidationReport};
use crate::vision::refine_edit_instruction;
use crate::{error_chain_text, now_utc_iso, SceneEngine};

/// Per-call inputs beyond what the project already stores.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateOptions {
    /// Existing frame to edit instead of generating from scratch.
    pub base_image: Option<String>,
    pub edit_instruction: Option<String>,
    /// Overrides the scene's own DNA reference for this call.
    pub dna_reference: Option<String>,
    pub dna_mode: Option<DnaMode>,
    pub model_override: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SceneOutcome {
    Generated { attempts: u32 },
    /// Kept the last frame but continuity never passed.
    DopFailed { attempts: u32 },
    Failed { kind: FailureKind, message: String },
    Cancelled,
    /// Another invocation holds the scene, or it already had an image.
    Skipped,
}

impl SceneOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Generated { .. } => "generated",
            Self::DopFailed { .. } => "dop_failed",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }
}

struct Attempt<'a> {
    number: u32,
    model: &'a ModelSpec,
    prompt: &'a AssembledPrompt,
    aspect_ratio: &'a str,
    resolution: &'a str,
    correction: Option<String>,
    image_path: Option<String>,
    media_id: Option<String>,
    provider_request: Map<String, Value>,
    warnings: Vec<String>,
    duration_s: f64,
}

impl SceneEngine {
    /// Generates one scene outside a batch. Returns `Skipped` when the scene
    /// is already being generated elsewhere.
    pub fn generate_scene(&self, scene_id: &str, options: &GenerateOptions) -> Result<SceneOutcome> {
        let Some(_guard) = self.locks.try_acquire(scene_id) else {
            tracing::debug!(scene_id, "scene already generating; skipped");
            return Ok(SceneOutcome::Skipped);
        };
        self.generate_locked(scene_id, options)
    }

    /// Runs the full generate, validate, retry cycle. The caller holds the
    /// scene's generation lock. Provider failures end up on the scene and in
    /// the returned outcome; only engine misuse returns `Err`.
    pub(crate) fn generate_locked(
        &self,
        scene_id: &str,
        options: &GenerateOptions,
    ) -> Result<SceneOutcome> {
        let snapshot = self.store.snapshot();
        let scene = snapshot
            .scene(scene_id)
            .with_context(|| format!("unknown scene '{scene_id}'"))?;
        if self.cancel.is_cancelled() {
            return Ok(SceneOutcome::Cancelled);
        }

        let requested = options
            .model_override
            .as_deref()
            .unwrap_or(snapshot.settings.image_model.as_str());
        let selection = self
            .models
            .select(Some(requested), "image")
            .map_err(anyhow::Error::msg)?;
        if let Some(reason) = selection.fallback_reason.as_deref() {
            tracing::warn!(scene_id, "{reason}");
        }
        let model = selection.model;

        let started = Instant::now();
        self.store.dispatch(ProjectAction::MarkGenerating {
            scene_id: scene_id.to_string(),
            started_at: now_utc_iso(),
        });
        self.emit_scene(
            "scene_generation_started",
            scene_id,
            json!({
                "scene_number": scene.scene_number,
                "model": model.name,
                "provider": model.provider,
            }),
        );
        tracing::info!(scene_id, scene_number = scene.scene_number, model = %model.name, "generating scene");

        let Some(backend) = self.backends.get(&model.provider) else {
            let err = anyhow::Error::new(GenerationError::ProviderConfig {
                provider: model.provider.clone(),
                message: format!("no backend registered for model {}", model.name),
            });
            return Ok(self.fail_scene(scene_id, &model, None, 1, started, &err));
        };

        let cascade = resolve_cascade_reference(scene, &snapshot);
        if let Some(reference) = cascade.as_ref() {
            tracing::debug!(scene_id, source = reference.source.label(), "cascade reference resolved");
        }
        let previous_frame = resolve_previous_frame(scene, &snapshot)
            .and_then(|row| Some((row.id.clone(), row.generated_image.clone()?)));
        let edit_instruction = self.prepare_edit_instruction(scene_id, options);
        let policy = RetryPolicy {
            max_retries: self.config.max_continuity_retries,
        };
        let mut retries_used = 0u32;
        let mut correction: Option<PromptCorrection> = None;

        loop {
            let number = retries_used + 1;
            let state = self.store.snapshot();
            let scene = state
                .scene(scene_id)
                .with_context(|| format!("scene '{scene_id}' disappeared during generation"))?;

            let mut request = PromptRequest::new(scene, &state);
            request.layout = backend.prompt_layout();
            request.char_limit = self.config.prompt_char_limit(&model);
            request.reference_cap = self.config.reference_cap(&model);
            if retries_used > 0 {
                request.continuity_anchor = previous_frame.as_ref().map(|(_, image)| image.as_str());
            } else {
                request.cascade = cascade.as_ref();
            }
            request.base_image = options.base_image.as_deref();
            request.edit_instruction = edit_instruction.as_deref();
            request.dna_reference = options.dna_reference.as_deref();
            request.dna_mode = options.dna_mode;
            request.correction = correction.as_ref();
            let prompt = self.assembler.assemble(&request);

            let generation = GenerationRequest {
                scene_id,
                model: &model,
                prompt: &prompt,
                aspect_ratio: &state.settings.aspect_ratio,
                resolution: &state.settings.resolution,
                credentials: &state.settings.credentials,
            };
            let output = match backend.generate(&generation) {
                Ok(output) => output,
                Err(err) => {
                    return Ok(self.fail_scene(scene_id, &model, Some(&prompt), number, started, &err));
                }
            };

            let media_id = output.media_id.clone();
            let provider_request = output.provider_request.clone();
            let mut warnings = prompt.warnings.clone();
            warnings.extend(output.warnings.iter().cloned());
            let (primary, alternates) = output.into_frames(scene_id);
            let image_url = primary.to_data_url();
            let duration_s = started.elapsed().as_secs_f64();
            self.store.dispatch(ProjectAction::GenerationSucceeded {
                scene_id: scene_id.to_string(),
                image: image_url.clone(),
                alternates: alternates.iter().map(InlineImage::to_data_url).collect(),
                media_id: media_id.clone(),
                duration_s,
            });
            self.record_usage(scene_id, &model, &state.settings.resolution, &prompt, &image_url);
            self.emit_scene(
                "scene_generated",
                scene_id,
                json!({
                    "attempt": number,
                    "model": model.name,
                    "duration_s": duration_s,
                    "alternates": alternates.len(),
                    "truncated": prompt.truncated,
                    "warnings": warnings,
                }),
            );

            let attempt = Attempt {
                number,
                model: &model,
                prompt: &prompt,
                aspect_ratio: &state.settings.aspect_ratio,
                resolution: &state.settings.resolution,
                correction: correction.as_ref().map(describe_correction),
                image_path: self.write_image(scene_id, number, &primary),
                media_id,
                provider_request,
                warnings,
                duration_s,
            };

            let report = previous_frame.as_ref().and_then(|(previous_id, previous_image)| {
                let previous_scene = state.scene(previous_id)?;
                self.check_continuity(&state, scene, previous_scene, previous_image, &primary)
            });
            let Some(report) = report else {
                self.store.dispatch(ProjectAction::ContinuityPassed {
                    scene_id: scene_id.to_string(),
                });
                self.finish_attempt(scene_id, &attempt, None, "generated");
                return Ok(SceneOutcome::Generated { attempts: number });
            };

            let verdict = report.to_value();
            self.emit_scene(
                "raccord_checked",
                scene_id,
                json!({ "attempt": number, "passed": report.passed(), "report": verdict }),
            );
            if report.passed() {
                self.store.dispatch(ProjectAction::ContinuityPassed {
                    scene_id: scene_id.to_string(),
                });
                self.finish_attempt(scene_id, &attempt, Some(&verdict), "generated");
                tracing::info!(scene_id, attempts = number, "continuity passed");
                return Ok(SceneOutcome::Generated { attempts: number });
            }

            let decision = self.decision_agent.decide(&report, retries_used);
            if self.cancel.is_cancelled() {
                self.store.dispatch(ProjectAction::ContinuityFailed {
                    scene_id: scene_id.to_string(),
                    error: format!("Batch cancelled before continuity was fixed: {}", report.summary()),
                });
                self.finish_attempt(scene_id, &attempt, Some(&verdict), "cancelled");
                return Ok(SceneOutcome::Cancelled);
            }
            if policy.should_retry(decision, retries_used) {
                let next = build_correction(&report);
                self.store.dispatch(ProjectAction::AddNegativeConstraints {
                    scene_id: scene_id.to_string(),
                    constraints: next.negative.clone(),
                });
                self.store.dispatch(ProjectAction::SetStatusText {
                    scene_id: scene_id.to_string(),
                    text: Some("Retrying for continuity...".to_string()),
                });
                self.emit_scene(
                    "raccord_retry",
                    scene_id,
                    json!({
                        "attempt": number,
                        "decision": decision,
                        "corrections": next.positive,
                    }),
                );
                tracing::warn!(scene_id, ?decision, "continuity errors, retrying: {}", report.summary());
                self.finish_attempt(scene_id, &attempt, Some(&verdict), "retry");
                correction = Some(next);
                retries_used += 1;
                continue;
            }

            let message = format!("Continuity errors after {number} attempts: {}", report.summary());
            self.store.dispatch(ProjectAction::ContinuityFailed {
                scene_id: scene_id.to_string(),
                error: message.clone(),
            });
            self.emit_scene(
                "scene_dop_failed",
                scene_id,
                json!({ "attempts": number, "error": message }),
            );
            tracing::warn!(scene_id, attempts = number, "{message}");
            self.finish_attempt(scene_id, &attempt, Some(&verdict), "dop_failed");
            return Ok(SceneOutcome::DopFailed { attempts: number });
        }
    }

    /// Asks the vision model to spell out a terse edit request against the
    /// base image. Any failure keeps the user's wording.
    fn prepare_edit_instruction(&self, scene_id: &str, options: &GenerateOptions) -> Option<String> {
        let instruction = options
            .edit_instruction
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())?;
        let (Some(base), Some(vision)) = (options.base_image.as_deref(), self.vision.as_ref()) else {
            return Some(instruction.to_string());
        };
        self.store.dispatch(ProjectAction::SetStatusText {
            scene_id: scene_id.to_string(),
            text: Some("Analyzing edit...".to_string()),
        });
        let refined = self
            .loader
            .load(base)
            .and_then(|image| refine_edit_instruction(vision.as_ref(), &image, instruction));
        match refined {
            Ok(Some(refined)) => {
                tracing::debug!(scene_id, %refined, "edit instruction refined");
                Some(refined)
            }
            Ok(None) => Some(instruction.to_string()),
            Err(err) => {
                tracing::warn!(scene_id, error = %error_chain_text(&err, 240), "edit reasoning failed; using the raw instruction");
                Some(instruction.to_string())
            }
        }
    }

    /// `None` means validation is off, or the check itself failed and the
    /// frame is accepted as is.
    fn check_continuity(
        &self,
        state: &ProjectState,
        scene: &Scene,
        previous_scene: &Scene,
        previous_image: &str,
        current: &InlineImage,
    ) -> Option<ValidationReport> {
        if !self.config.validate_continuity {
            return None;
        }
        let vision = self.vision.as_ref()?;
        self.store.dispatch(ProjectAction::SetStatusText {
            scene_id: scene.id.clone(),
            text: Some("Checking continuity...".to_string()),
        });
        let result = self.loader.load(previous_image).and_then(|previous| {
            RaccordValidator::new(Arc::clone(vision)).validate(
                state,
                previous_scene,
                &previous,
                scene,
                current,
            )
        });
        self.store.dispatch(ProjectAction::SetStatusText {
            scene_id: scene.id.clone(),
            text: None,
        });
        match result {
            Ok(report) => Some(report),
            Err(err) => {
                tracing::warn!(
                    scene_id = %scene.id,
                    error = %error_chain_text(&err, 240),
                    "continuity check failed; accepting frame"
                );
                None
            }
        }
    }

    fn fail_scene(
        &self,
        scene_id: &str,
        model: &ModelSpec,
        prompt: Option<&AssembledPrompt>,
        attempt: u32,
        started: Instant,
        err: &anyhow::Error,
    ) -> SceneOutcome {
        let kind = self.classifier.classify(err);
        let message = error_chain_text(err, 600);
        self.store.dispatch(ProjectAction::GenerationFailed {
            scene_id: scene_id.to_string(),
            error: message.clone(),
            kind,
            duration_s: started.elapsed().as_secs_f64(),
        });
        self.emit_scene(
            "scene_generation_failed",
            scene_id,
            json!({
                "attempt": attempt,
                "model": model.name,
                "kind": kind,
                "error": message,
            }),
        );
        if kind.is_fatal() {
            self.cancel.cancel();
            tracing::error!(scene_id, "credentials rejected; stopping batch: {message}");
        } else {
            tracing::warn!(scene_id, ?kind, "generation failed: {message}");
        }
        if let Some(prompt) = prompt {
            self.analytics.send(AnalyticsEvent::PromptRecorded {
                scene_id: scene_id.to_string(),
                model: model.name.clone(),
                prompt: prompt.text.clone(),
                outcome: "failed".to_string(),
                note: Some(message.clone()),
            });
            self.with_history(|history| {
                history.add_attempt(scene_id, &model.name, &prompt.text, None, "failed");
            });
        }
        SceneOutcome::Failed { kind, message }
    }

    fn record_usage(
        &self,
        scene_id: &str,
        model: &ModelSpec,
        resolution: &str,
        prompt: &AssembledPrompt,
        image_url: &str,
    ) {
        let at = now_utc_iso();
        self.store.dispatch(ProjectAction::RecordUsage {
            resolution: resolution.to_string(),
            provider: model.provider.clone(),
            at: at.clone(),
        });
        let state = self.store.dispatch(ProjectAction::AppendGallery {
            entry: GalleryEntry {
                id: Uuid::new_v4().to_string(),
                scene_id: scene_id.to_string(),
                image: image_url.to_string(),
                prompt: prompt.text.clone(),
                model: model.name.clone(),
                created_at: at,
            },
            limit: self.config.gallery_limit,
        });
        self.analytics.send(AnalyticsEvent::UsageRecorded {
            provider: model.provider.clone(),
            resolution: resolution.to_string(),
            total_images: state.usage.total_images,
        });
    }

    fn run_artifact_dir(&self, kind: &str) -> Option<PathBuf> {
        self.config
            .artifact_dir
            .as_ref()
            .map(|dir| dir.join(kind).join(&self.run_id))
    }

    fn write_image(&self, scene_id: &str, attempt: u32, image: &InlineImage) -> Option<String> {
        let dir = self.run_artifact_dir("images")?;
        let path = dir.join(format!("{scene_id}-attempt{attempt}.{}", image.extension()));
        let written = image.decode().and_then(|bytes| {
            std::fs::create_dir_all(&dir)?;
            std::fs::write(&path, bytes)?;
            Ok(())
        });
        match written {
            Ok(()) => Some(path.to_string_lossy().to_string()),
            Err(err) => {
                tracing::warn!(scene_id, error = %err, "image artifact write failed");
                None
            }
        }
    }

    fn finish_attempt(
        &self,
        scene_id: &str,
        attempt: &Attempt<'_>,
        validation: Option<&Value>,
        outcome: &str,
    ) {
        self.analytics.send(AnalyticsEvent::PromptRecorded {
            scene_id: scene_id.to_string(),
            model: attempt.model.name.clone(),
            prompt: attempt.prompt.text.clone(),
            outcome: outcome.to_string(),
            note: attempt.correction.clone(),
        });
        self.with_history(|history| {
            history.add_attempt(
                scene_id,
                &attempt.model.name,
                &attempt.prompt.text,
                attempt.correction.as_deref(),
                outcome,
            );
        });

        let Some(dir) = self.run_artifact_dir("receipts") else {
            return;
        };
        let receipt = GenerationReceipt {
            scene_id: scene_id.to_string(),
            attempt: attempt.number,
            model: attempt.model.name.clone(),
            provider: attempt.model.provider.clone(),
            aspect_ratio: attempt.aspect_ratio.to_string(),
            resolution: attempt.resolution.to_string(),
            prompt: attempt.prompt.text.clone(),
            references: attempt.prompt.reference_records(),
            warnings: attempt.warnings.clone(),
            image_path: attempt.image_path.clone(),
            media_id: attempt.media_id.clone(),
            duration_s: attempt.duration_s,
            created_at: now_utc_iso(),
        };
        let payload = build_receipt(&receipt, &attempt.provider_request, validation);
        let path = dir.join(format!("{scene_id}-attempt{}.json", attempt.number));
        if let Err(err) = write_receipt(&path, &payload) {
            tracing::warn!(scene_id, error = %err, "receipt write failed");
        }
    }
}

fn describe_correction(correction: &PromptCorrection) -> String {
    correction
        .positive
        .iter()
        .chain(correction.negative.iter())
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" | ")
}
