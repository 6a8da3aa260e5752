use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use anyhow::Result;
use raccord_contracts::project::{FailureKind, ProjectState};
use raccord_contracts::runs::summary::{write_summary, BatchSummary};
use serde_json::json;
use uuid::Uuid;

use crate::orchestrator::{GenerateOptions, SceneOutcome};
use crate::{error_chain_text, now_utc_iso, SceneEngine};

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    running_batches: Mutex<usize>,
}

/// Engine-wide stop flag shared by every batch and the orchestrator.
///
/// The flag is only cleared when a batch starts while no other batch is
/// running, so a stop raised for one batch also halts any batch that
/// overlaps it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<CancelState>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Clears the flag unconditionally, even under running batches.
    pub fn reset(&self) {
        self.0.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn running_batches(&self) -> usize {
        *self.running()
    }

    /// Registers a running batch until the returned scope drops.
    pub fn begin_batch(&self) -> BatchScope {
        let mut running = self.running();
        if *running == 0 {
            self.reset();
        }
        *running += 1;
        BatchScope {
            token: self.clone(),
        }
    }

    fn running(&self) -> MutexGuard<'_, usize> {
        match self.0.running_batches.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Keeps a batch counted as running; see [`CancelToken::begin_batch`].
#[derive(Debug)]
pub struct BatchScope {
    token: CancelToken,
}

impl Drop for BatchScope {
    fn drop(&mut self) {
        let mut running = self.token.running();
        *running = running.saturating_sub(1);
    }
}

/// Scene ids with a generation in flight.
#[derive(Debug, Default)]
pub struct GenerationLocks {
    active: Mutex<HashSet<String>>,
}

impl GenerationLocks {
    /// Claims `scene_id`, or returns `None` if someone else holds it.
    pub fn try_acquire(&self, scene_id: &str) -> Option<GenerationGuard<'_>> {
        if !self.lock().insert(scene_id.to_string()) {
            return None;
        }
        Some(GenerationGuard {
            locks: self,
            scene_id: scene_id.to_string(),
        })
    }

    pub fn is_active(&self, scene_id: &str) -> bool {
        self.lock().contains(scene_id)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Releases the scene on drop, whatever path the generation took.
#[derive(Debug)]
pub struct GenerationGuard<'a> {
    locks: &'a GenerationLocks,
    scene_id: String,
}

impl GenerationGuard<'_> {
    pub fn scene_id(&self) -> &str {
        &self.scene_id
    }
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        self.locks.lock().remove(&self.scene_id);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOptions {
    /// `None` means every scene in the project.
    pub scene_ids: Option<Vec<String>>,
    pub skip_existing: bool,
    pub generate: GenerateOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub batch_id: String,
    pub outcomes: Vec<(String, SceneOutcome)>,
    pub cancelled: bool,
    pub summary: BatchSummary,
}

impl BatchReport {
    pub fn outcome(&self, scene_id: &str) -> Option<&SceneOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == scene_id)
            .map(|(_, outcome)| outcome)
    }
}

/// Key frames first, then ascending scene number. Unknown and repeated ids
/// are dropped.
pub fn order_scenes(state: &ProjectState, scene_ids: Option<&[String]>) -> Vec<String> {
    let wanted: Option<HashSet<&str>> =
        scene_ids.map(|ids| ids.iter().map(String::as_str).collect());
    if let Some(ids) = scene_ids {
        for id in ids {
            if state.scene(id).is_none() {
                tracing::warn!(scene_id = %id, "unknown scene in batch request; ignored");
            }
        }
    }
    let mut scenes: Vec<_> = state
        .scenes
        .iter()
        .filter(|scene| {
            wanted
                .as_ref()
                .map(|ids| ids.contains(scene.id.as_str()))
                .unwrap_or(true)
        })
        .collect();
    scenes.sort_by_key(|scene| (!scene.is_key_frame, scene.scene_number));
    let mut seen = HashSet::new();
    scenes
        .into_iter()
        .filter(|scene| seen.insert(scene.id.as_str()))
        .map(|scene| scene.id.clone())
        .collect()
}

impl SceneEngine {
    /// Generates the requested scenes one after another.
    ///
    /// Every scene is claimed before the first call goes out; scenes held by
    /// another invocation are reported as skipped and never retried here.
    /// The cancel token is checked between scenes and is set by the
    /// orchestrator when credentials are rejected. It is cleared on entry
    /// only when no other batch is running.
    pub fn run_batch(&self, options: &BatchOptions) -> Result<BatchReport> {
        let batch_id = format!("batch-{}", Uuid::new_v4().simple());
        let started_at = now_utc_iso();
        let _running = self.cancel.begin_batch();

        let snapshot = self.store.snapshot();
        let ordered = order_scenes(&snapshot, options.scene_ids.as_deref());
        let mut outcomes = Vec::new();
        let mut claimed = Vec::new();
        for scene_id in ordered {
            match self.locks.try_acquire(&scene_id) {
                Some(guard) => claimed.push(guard),
                None => {
                    tracing::debug!(%scene_id, "scene already generating; skipped");
                    outcomes.push((scene_id, SceneOutcome::Skipped));
                }
            }
        }
        let scene_ids: Vec<String> = claimed
            .iter()
            .map(|guard| guard.scene_id().to_string())
            .collect();
        self.emit(
            "batch_started",
            json!({ "batch_id": batch_id, "scene_ids": scene_ids }),
        );
        tracing::info!(%batch_id, scenes = claimed.len(), "batch started");

        let total = claimed.len();
        let mut cancelled = false;
        let mut pending = claimed.into_iter().enumerate();
        for (index, guard) in pending.by_ref() {
            let scene_id = guard.scene_id().to_string();
            if self.cancel.is_cancelled() {
                cancelled = true;
                outcomes.push((scene_id, SceneOutcome::Cancelled));
                break;
            }
            let existing = self
                .store
                .snapshot()
                .scene(&scene_id)
                .map(|scene| scene.has_image())
                .unwrap_or(false);
            if options.skip_existing && existing {
                tracing::debug!(%scene_id, "scene already has an image; skipped");
                outcomes.push((scene_id, SceneOutcome::Skipped));
                continue;
            }

            let outcome = match self.generate_locked(&scene_id, &options.generate) {
                Ok(outcome) => outcome,
                Err(err) => {
                    let message = error_chain_text(&err, 600);
                    tracing::warn!(%scene_id, "scene aborted: {message}");
                    SceneOutcome::Failed {
                        kind: FailureKind::Other,
                        message,
                    }
                }
            };
            drop(guard);
            let stop = outcome == SceneOutcome::Cancelled || self.cancel.is_cancelled();
            outcomes.push((scene_id, outcome));
            if stop {
                cancelled = true;
                break;
            }
            if index + 1 < total {
                thread::sleep(self.config.inter_scene_delay());
            }
        }
        for (_, guard) in pending {
            outcomes.push((guard.scene_id().to_string(), SceneOutcome::Cancelled));
        }
        if cancelled {
            self.emit("batch_cancelled", json!({ "batch_id": batch_id }));
            tracing::warn!(%batch_id, "batch cancelled");
        }

        let summary = summarize(&batch_id, started_at, &outcomes, cancelled);
        if let Some(dir) = self.config.artifact_dir.as_deref() {
            let path = dir.join("batches").join(format!("{batch_id}.json"));
            if let Err(err) = write_summary(&path, &summary, None) {
                tracing::warn!(%batch_id, error = %err, "batch summary write failed");
            }
        }
        self.emit(
            "batch_finished",
            serde_json::to_value(&summary).unwrap_or_default(),
        );
        tracing::info!(
            %batch_id,
            generated = summary.generated,
            dop_failed = summary.dop_failed,
            failed = summary.failed,
            skipped = summary.skipped,
            "batch finished"
        );

        Ok(BatchReport {
            batch_id,
            outcomes,
            cancelled,
            summary,
        })
    }
}

fn summarize(
    batch_id: &str,
    started_at: String,
    outcomes: &[(String, SceneOutcome)],
    cancelled: bool,
) -> BatchSummary {
    let mut summary = BatchSummary {
        batch_id: batch_id.to_string(),
        started_at,
        finished_at: now_utc_iso(),
        requested: outcomes.len() as u64,
        cancelled,
        scene_ids: outcomes.iter().map(|(id, _)| id.clone()).collect(),
        ..BatchSummary::default()
    };
    for (_, outcome) in outcomes {
        match outcome {
            SceneOutcome::Generated { .. } => summary.generated += 1,
            SceneOutcome::DopFailed { .. } => summary.dop_failed += 1,
            SceneOutcome::Failed { .. } => summary.failed += 1,
            SceneOutcome::Skipped => summary.skipped += 1,
            SceneOutcome::Cancelled => {}
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use raccord_contracts::project::Scene;

    use super::*;
    use crate::testing::{office_project, FakeBackend, ScriptedVision, CHARACTER_ERROR, PASS};

    fn all(ids: &[&str]) -> BatchOptions {
        BatchOptions {
            scene_ids: Some(ids.iter().map(|id| id.to_string()).collect()),
            ..BatchOptions::default()
        }
    }

    #[test]
    fn key_frames_lead_then_scene_number() {
        let mut state = office_project(&[3, 1, 7, 5]);
        state
            .scenes
            .iter_mut()
            .filter(|scene| scene.id == "s5" || scene.id == "s7")
            .for_each(|scene| scene.is_key_frame = true);
        assert_eq!(order_scenes(&state, None), vec!["s5", "s7", "s1", "s3"]);

        let requested = vec!["s3".to_string(), "s9".to_string(), "s3".to_string(), "s7".to_string()];
        assert_eq!(order_scenes(&state, Some(&requested)), vec!["s7", "s3"]);
    }

    #[test]
    fn locks_release_on_drop_and_reject_duplicates() {
        let locks = GenerationLocks::default();
        let guard = locks.try_acquire("s1").expect("first claim");
        assert!(locks.try_acquire("s1").is_none());
        assert!(locks.is_active("s1"));
        drop(guard);
        assert!(!locks.is_active("s1"));
        assert!(locks.try_acquire("s1").is_some());
    }

    #[test]
    fn stop_flag_clears_only_when_no_batch_is_running() {
        let token = CancelToken::default();
        let first = token.begin_batch();
        token.cancel();
        let second = token.begin_batch();
        assert!(token.is_cancelled());
        assert_eq!(token.running_batches(), 2);

        drop(second);
        drop(first);
        assert_eq!(token.running_batches(), 0);
        assert!(token.is_cancelled());
        let _third = token.begin_batch();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn overlapping_batch_does_not_clear_a_running_cancel() -> Result<()> {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let backend = Arc::new(FakeBackend::gated(started_tx, release_rx));
        let engine = crate::testing::engine(
            office_project(&[1, 2, 3, 4]),
            Arc::clone(&backend),
            Arc::new(ScriptedVision::always(PASS)),
        )?;

        let (first, second) = thread::scope(|scope| {
            let first = scope.spawn(|| engine.run_batch(&all(&["s1", "s2", "s3"])));
            started_rx.recv().ok();
            engine.cancel_token().cancel();
            let second = engine.run_batch(&all(&["s4"]));
            release_tx.send(()).ok();
            (first.join(), second)
        });
        let first = first.map_err(|_| anyhow::anyhow!("first batch panicked"))??;
        let second = second?;

        assert!(first.cancelled);
        assert_eq!(first.outcome("s1"), Some(&SceneOutcome::Generated { attempts: 1 }));
        assert_eq!(first.outcome("s2"), Some(&SceneOutcome::Cancelled));
        assert_eq!(first.outcome("s3"), Some(&SceneOutcome::Cancelled));
        assert_eq!(backend.calls_for("s2"), 0);
        assert_eq!(backend.calls_for("s3"), 0);
        assert!(second.cancelled);
        assert_eq!(second.outcome("s4"), Some(&SceneOutcome::Cancelled));
        assert_eq!(backend.calls_for("s4"), 0);
        assert_eq!(engine.cancel_token().running_batches(), 0);

        let rerun = engine.run_batch(&all(&["s4"]))?;
        assert!(!rerun.cancelled);
        assert_eq!(rerun.outcome("s4"), Some(&SceneOutcome::Generated { attempts: 1 }));
        Ok(())
    }

    #[test]
    fn dop_failed_scene_does_not_halt_the_batch() -> Result<()> {
        let backend = Arc::new(FakeBackend::default());
        let mut state = office_project(&[5, 6, 7]);
        state.scenes[0].is_key_frame = true;
        let engine = crate::testing::engine(
            state,
            Arc::clone(&backend),
            Arc::new(ScriptedVision::always(CHARACTER_ERROR)),
        )?;

        let report = engine.run_batch(&all(&["s5", "s6", "s7"]))?;
        assert!(!report.cancelled);
        assert_eq!(report.outcome("s5"), Some(&SceneOutcome::Generated { attempts: 1 }));
        assert_eq!(report.outcome("s6"), Some(&SceneOutcome::DopFailed { attempts: 2 }));
        assert_eq!(report.outcome("s7"), Some(&SceneOutcome::DopFailed { attempts: 2 }));
        assert_eq!(backend.calls_for("s5"), 1);
        assert_eq!(backend.calls_for("s6"), 2);
        assert_eq!(backend.calls_for("s7"), 2);
        assert_eq!(report.summary.generated, 1);
        assert_eq!(report.summary.dop_failed, 2);

        let state = engine.snapshot();
        let s6 = state.scene("s6").expect("scene");
        assert!(s6.dop_failed);
        assert!(s6.error.as_deref().is_some_and(|error| !error.is_empty()));
        assert!(!state.scene("s5").expect("scene").dop_failed);
        Ok(())
    }

    #[test]
    fn key_frame_anchors_the_next_scene() -> Result<()> {
        let backend = Arc::new(FakeBackend::default());
        let mut state = office_project(&[4, 5, 6]);
        state.scenes[0].generated_image = Some("data:image/png;base64,czQ=".to_string());
        state.scenes[1].is_key_frame = true;
        let engine = crate::testing::engine(
            state,
            Arc::clone(&backend),
            Arc::new(ScriptedVision::always(PASS)),
        )?;
        engine.run_batch(&all(&["s5", "s6"]))?;

        let s5_image = engine
            .snapshot()
            .scene("s5")
            .and_then(|scene| scene.generated_image.clone())
            .expect("s5 image");
        let anchors = backend.cascade_sources_for("s6");
        assert_eq!(anchors.first(), Some(&s5_image));
        Ok(())
    }

    #[test]
    fn fatal_auth_stops_before_the_next_scene() -> Result<()> {
        let backend = Arc::new(FakeBackend::failing(&[("s1", "400 Bad Request: invalid api key")]));
        let engine = crate::testing::engine(
            office_project(&[1, 2, 3]),
            Arc::clone(&backend),
            Arc::new(ScriptedVision::always(PASS)),
        )?;

        let report = engine.run_batch(&BatchOptions::default())?;
        assert!(report.cancelled);
        assert!(matches!(
            report.outcome("s1"),
            Some(SceneOutcome::Failed { kind: FailureKind::FatalAuth, .. })
        ));
        assert_eq!(backend.calls_for("s2"), 0);
        assert_eq!(backend.calls_for("s3"), 0);
        assert_eq!(report.outcome("s2"), Some(&SceneOutcome::Cancelled));
        assert!(!engine.locks().is_active("s2"));
        assert!(!engine.locks().is_active("s3"));
        assert!(engine.cancel_token().is_cancelled());
        Ok(())
    }

    #[test]
    fn overlapping_batches_generate_each_scene_once() -> Result<()> {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let backend = Arc::new(FakeBackend::gated(started_tx, release_rx));
        let engine = crate::testing::engine(
            office_project(&[1, 2, 3, 4]),
            Arc::clone(&backend),
            Arc::new(ScriptedVision::always(PASS)),
        )?;

        let (first, second) = thread::scope(|scope| {
            let first = scope.spawn(|| engine.run_batch(&all(&["s1", "s2", "s3"])));
            started_rx.recv().ok();
            let second = engine.run_batch(&all(&["s2", "s3", "s4"]));
            release_tx.send(()).ok();
            (first.join(), second)
        });
        let first = first.map_err(|_| anyhow::anyhow!("first batch panicked"))??;
        let second = second?;

        for id in ["s1", "s2", "s3", "s4"] {
            assert_eq!(backend.calls_for(id), 1, "{id}");
        }
        assert_eq!(second.outcome("s2"), Some(&SceneOutcome::Skipped));
        assert_eq!(second.outcome("s3"), Some(&SceneOutcome::Skipped));
        assert_eq!(second.outcome("s4"), Some(&SceneOutcome::Generated { attempts: 1 }));
        assert_eq!(first.summary.generated, 3);
        Ok(())
    }

    #[test]
    fn skip_existing_leaves_finished_scenes_alone() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let backend = Arc::new(FakeBackend::default());
        let mut state = office_project(&[1, 2]);
        state.scenes[0].generated_image = Some("data:image/png;base64,AAAA".to_string());
        state.scenes.push(Scene::new("loose", 9));
        let engine = crate::testing::engine_with_dir(
            state,
            Arc::clone(&backend),
            Arc::new(ScriptedVision::always(PASS)),
            temp.path(),
        )?;

        let report = engine.run_batch(&BatchOptions {
            skip_existing: true,
            ..BatchOptions::default()
        })?;
        assert_eq!(report.outcome("s1"), Some(&SceneOutcome::Skipped));
        assert_eq!(backend.calls_for("s1"), 0);
        assert_eq!(backend.calls_for("s2"), 1);
        assert_eq!(backend.calls_for("loose"), 1);

        let summary_path = temp
            .path()
            .join("batches")
            .join(format!("{}.json", report.batch_id));
        let summary: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(summary_path)?)?;
        assert_eq!(summary["skipped"], 1);
        assert_eq!(summary["generated"], 2);
        let events = std::fs::read_to_string(temp.path().join("events.jsonl"))?;
        assert!(events.lines().next().is_some_and(|line| line.contains("batch_started")));
        assert!(events.contains("batch_finished"));
        Ok(())
    }
}
