use super::{FailureKind, GalleryEntry, ProjectState, Scene};

/// Every mutation the engine performs on a project.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectAction {
    UpsertScene(Scene),
    SetKeyFrame {
        scene_id: String,
        is_key_frame: bool,
    },
    MarkGenerating {
        scene_id: String,
        started_at: String,
    },
    SetStatusText {
        scene_id: String,
        text: Option<String>,
    },
    GenerationSucceeded {
        scene_id: String,
        image: String,
        alternates: Vec<String>,
        media_id: Option<String>,
        duration_s: f64,
    },
    GenerationFailed {
        scene_id: String,
        error: String,
        kind: FailureKind,
        duration_s: f64,
    },
    AddNegativeConstraints {
        scene_id: String,
        constraints: Vec<String>,
    },
    ContinuityPassed {
        scene_id: String,
    },
    ContinuityFailed {
        scene_id: String,
        error: String,
    },
    ClearGeneratedImage {
        scene_id: String,
    },
    ResetContinuity {
        scene_id: String,
    },
    RecordUsage {
        resolution: String,
        provider: String,
        at: String,
    },
    AppendGallery {
        entry: GalleryEntry,
        limit: usize,
    },
}

/// Applies `action` to a copy of `state` and returns the new snapshot.
///
/// Actions naming an unknown scene leave the snapshot unchanged.
pub fn reduce(state: &ProjectState, action: ProjectAction) -> ProjectState {
    let mut next = state.clone();
    match action {
        ProjectAction::UpsertScene(scene) => {
            if let Some(existing) = next.scenes.iter_mut().find(|row| row.id == scene.id) {
                *existing = scene;
            } else {
                next.scenes.push(scene);
                next.scenes.sort_by_key(|row| row.scene_number);
            }
        }
        ProjectAction::SetKeyFrame {
            scene_id,
            is_key_frame,
        } => {
            with_scene(&mut next, &scene_id, |scene| scene.is_key_frame = is_key_frame);
        }
        ProjectAction::MarkGenerating {
            scene_id,
            started_at,
        } => {
            with_scene(&mut next, &scene_id, |scene| {
                scene.is_generating = true;
                scene.generation_started_at = Some(started_at);
                scene.generation_duration = None;
                scene.error = None;
                scene.failure_kind = None;
                scene.status_text = Some("Generating...".to_string());
            });
        }
        ProjectAction::SetStatusText { scene_id, text } => {
            with_scene(&mut next, &scene_id, |scene| scene.status_text = text);
        }
        ProjectAction::GenerationSucceeded {
            scene_id,
            image,
            alternates,
            media_id,
            duration_s,
        } => {
            with_scene(&mut next, &scene_id, |scene| {
                scene.generated_image = Some(image);
                scene.alternate_images = alternates;
                scene.media_id = media_id;
                scene.generation_duration = Some(duration_s);
                scene.status_text = None;
                scene.error = None;
                scene.failure_kind = None;
            });
        }
        ProjectAction::GenerationFailed {
            scene_id,
            error,
            kind,
            duration_s,
        } => {
            with_scene(&mut next, &scene_id, |scene| {
                scene.is_generating = false;
                scene.generation_duration = Some(duration_s);
                scene.status_text = None;
                scene.error = Some(error);
                scene.failure_kind = Some(kind);
            });
        }
        ProjectAction::AddNegativeConstraints {
            scene_id,
            constraints,
        } => {
            with_scene(&mut next, &scene_id, |scene| {
                for constraint in constraints {
                    let trimmed = constraint.trim();
                    if trimmed.is_empty()
                        || scene.negative_constraints.iter().any(|row| row == trimmed)
                    {
                        continue;
                    }
                    scene.negative_constraints.push(trimmed.to_string());
                }
            });
        }
        ProjectAction::ContinuityPassed { scene_id } => {
            with_scene(&mut next, &scene_id, |scene| {
                scene.is_generating = false;
                scene.dop_failed = false;
                scene.status_text = None;
                if scene.failure_kind == Some(FailureKind::DopUnfixable) {
                    scene.failure_kind = None;
                    scene.error = None;
                }
            });
        }
        ProjectAction::ContinuityFailed { scene_id, error } => {
            with_scene(&mut next, &scene_id, |scene| {
                scene.dop_failed = true;
                scene.is_generating = false;
                scene.status_text = None;
                scene.error = Some(error);
                scene.failure_kind = Some(FailureKind::DopUnfixable);
            });
        }
        ProjectAction::ClearGeneratedImage { scene_id } => {
            with_scene(&mut next, &scene_id, |scene| {
                scene.generated_image = None;
                scene.alternate_images.clear();
                scene.media_id = None;
                scene.generation_duration = None;
                scene.error = None;
                scene.failure_kind = None;
                scene.dop_failed = false;
            });
        }
        ProjectAction::ResetContinuity { scene_id } => {
            with_scene(&mut next, &scene_id, |scene| {
                scene.dop_failed = false;
                scene.negative_constraints.clear();
                if scene.failure_kind == Some(FailureKind::DopUnfixable) {
                    scene.failure_kind = None;
                    scene.error = None;
                }
            });
        }
        ProjectAction::RecordUsage {
            resolution,
            provider,
            at,
        } => {
            next.usage.total_images += 1;
            *next.usage.by_resolution.entry(resolution).or_insert(0) += 1;
            *next.usage.by_provider.entry(provider).or_insert(0) += 1;
            next.usage.last_generated_at = Some(at);
        }
        ProjectAction::AppendGallery { entry, limit } => {
            next.gallery.push(entry);
            if limit > 0 && next.gallery.len() > limit {
                let overflow = next.gallery.len() - limit;
                next.gallery.drain(..overflow);
            }
        }
    }
    next
}

fn with_scene(state: &mut ProjectState, scene_id: &str, apply: impl FnOnce(&mut Scene)) {
    if let Some(scene) = state.scenes.iter_mut().find(|scene| scene.id == scene_id) {
        apply(scene);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::SceneStatus;

    fn state_with(ids: &[(&str, u32)]) -> ProjectState {
        ProjectState {
            scenes: ids
                .iter()
                .map(|(id, number)| Scene::new(*id, *number))
                .collect(),
            ..ProjectState::default()
        }
    }

    #[test]
    fn reduce_leaves_previous_snapshot_untouched() {
        let before = state_with(&[("s1", 1)]);
        let after = reduce(
            &before,
            ProjectAction::MarkGenerating {
                scene_id: "s1".to_string(),
                started_at: "2026-01-01T00:00:00Z".to_string(),
            },
        );
        assert!(!before.scenes[0].is_generating);
        assert!(after.scenes[0].is_generating);
        assert_eq!(
            after.scenes[0].generation_started_at.as_deref(),
            Some("2026-01-01T00:00:00Z")
        );
    }

    #[test]
    fn success_clears_error_but_stays_generating_until_verdict() {
        let mut state = state_with(&[("s1", 1)]);
        state = reduce(
            &state,
            ProjectAction::GenerationFailed {
                scene_id: "s1".to_string(),
                error: "429 quota".to_string(),
                kind: FailureKind::RateLimited,
                duration_s: 1.0,
            },
        );
        assert_eq!(state.scenes[0].failure_kind, Some(FailureKind::RateLimited));

        state = reduce(
            &state,
            ProjectAction::GenerationSucceeded {
                scene_id: "s1".to_string(),
                image: "data:image/png;base64,AA==".to_string(),
                alternates: vec!["b".to_string()],
                media_id: Some("m1".to_string()),
                duration_s: 2.5,
            },
        );
        let scene = &state.scenes[0];
        assert!(scene.error.is_none());
        assert!(scene.failure_kind.is_none());
        assert_eq!(scene.alternate_images, vec!["b".to_string()]);
        assert_eq!(scene.generation_duration, Some(2.5));
        assert!(scene.is_generating);

        state = reduce(
            &state,
            ProjectAction::ContinuityPassed {
                scene_id: "s1".to_string(),
            },
        );
        assert!(!state.scenes[0].is_generating);
        assert_eq!(state.scenes[0].status(), SceneStatus::Succeeded);
    }

    #[test]
    fn continuity_failure_keeps_image_and_flags_scene() {
        let mut state = state_with(&[("s1", 1)]);
        state = reduce(
            &state,
            ProjectAction::GenerationSucceeded {
                scene_id: "s1".to_string(),
                image: "img".to_string(),
                alternates: Vec::new(),
                media_id: None,
                duration_s: 1.0,
            },
        );
        state = reduce(
            &state,
            ProjectAction::ContinuityFailed {
                scene_id: "s1".to_string(),
                error: "face mismatch".to_string(),
            },
        );
        assert!(state.scenes[0].dop_failed);
        assert!(!state.scenes[0].is_generating);
        assert_eq!(state.scenes[0].generated_image.as_deref(), Some("img"));

        state = reduce(
            &state,
            ProjectAction::ResetContinuity {
                scene_id: "s1".to_string(),
            },
        );
        assert!(!state.scenes[0].dop_failed);
        assert!(state.scenes[0].error.is_none());
    }

    #[test]
    fn negative_constraints_accumulate_without_duplicates() {
        let mut state = state_with(&[("s1", 1)]);
        for _ in 0..2 {
            state = reduce(
                &state,
                ProjectAction::AddNegativeConstraints {
                    scene_id: "s1".to_string(),
                    constraints: vec!["different face".to_string(), " ".to_string()],
                },
            );
        }
        assert_eq!(
            state.scenes[0].negative_constraints,
            vec!["different face".to_string()]
        );
    }

    #[test]
    fn gallery_is_bounded_and_drops_oldest() {
        let mut state = ProjectState::default();
        for idx in 0..5 {
            state = reduce(
                &state,
                ProjectAction::AppendGallery {
                    entry: GalleryEntry {
                        id: format!("g{idx}"),
                        ..GalleryEntry::default()
                    },
                    limit: 3,
                },
            );
        }
        let ids: Vec<&str> = state.gallery.iter().map(|row| row.id.as_str()).collect();
        assert_eq!(ids, vec!["g2", "g3", "g4"]);
    }

    #[test]
    fn usage_counts_by_resolution_and_provider() {
        let mut state = ProjectState::default();
        for (resolution, provider) in [("1K", "gemini"), ("2K", "gemini"), ("1K", "gommo")] {
            state = reduce(
                &state,
                ProjectAction::RecordUsage {
                    resolution: resolution.to_string(),
                    provider: provider.to_string(),
                    at: "now".to_string(),
                },
            );
        }
        assert_eq!(state.usage.total_images, 3);
        assert_eq!(state.usage.by_resolution.get("1K"), Some(&2));
        assert_eq!(state.usage.by_provider.get("gemini"), Some(&2));
    }

    #[test]
    fn upsert_inserts_in_scene_number_order() {
        let state = state_with(&[("s1", 1), ("s3", 3)]);
        let next = reduce(&state, ProjectAction::UpsertScene(Scene::new("s2", 2)));
        let ids: Vec<&str> = next.scenes.iter().map(|row| row.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2", "s3"]);
    }

    #[test]
    fn unknown_scene_is_a_noop() {
        let state = state_with(&[("s1", 1)]);
        let next = reduce(
            &state,
            ProjectAction::ClearGeneratedImage {
                scene_id: "missing".to_string(),
            },
        );
        assert_eq!(next, state);
    }
}
