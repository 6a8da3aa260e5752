use raccord_contracts::project::{ProjectState, Scene};

/// Which rung of the fallback ladder produced the anchor image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CascadeSource {
    KeyFrame { scene_id: String },
    PrecedingScene { scene_id: String },
    FollowingScene { scene_id: String },
    LocationConcept { location_id: String },
    GroupConcept { group_id: String },
}

impl CascadeSource {
    pub fn label(&self) -> &'static str {
        match self {
            Self::KeyFrame { .. } => "key_frame",
            Self::PrecedingScene { .. } => "preceding_scene",
            Self::FollowingScene { .. } => "following_scene",
            Self::LocationConcept { .. } => "location_concept",
            Self::GroupConcept { .. } => "group_concept",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeReference {
    pub image: String,
    pub source: CascadeSource,
}

impl CascadeReference {
    /// The sibling scene the anchor came from, if it is a generated frame.
    pub fn scene_id(&self) -> Option<&str> {
        match &self.source {
            CascadeSource::KeyFrame { scene_id }
            | CascadeSource::PrecedingScene { scene_id }
            | CascadeSource::FollowingScene { scene_id } => Some(scene_id),
            CascadeSource::LocationConcept { .. } | CascadeSource::GroupConcept { .. } => None,
        }
    }
}

/// Picks the visual anchor for `scene` from its group.
///
/// Order: nearest key frame (ties go to the earlier scene), nearest earlier
/// scene, nearest later scene, location or group concept art. Siblings
/// flagged `dop_failed` or without an image never anchor anything. Pure and
/// deterministic for a given snapshot.
pub fn resolve_cascade_reference(scene: &Scene, state: &ProjectState) -> Option<CascadeReference> {
    let group_id = scene.group_id.as_deref()?;
    let siblings: Vec<&Scene> = state
        .scenes
        .iter()
        .filter(|row| row.id != scene.id)
        .filter(|row| row.group_id.as_deref() == Some(group_id))
        .filter(|row| row.has_image() && !row.dop_failed)
        .collect();
    let current = scene.scene_number;

    let key_frame = siblings
        .iter()
        .filter(|row| row.is_key_frame)
        .min_by_key(|row| (row.scene_number.abs_diff(current), row.scene_number > current, row.scene_number));
    if let Some(row) = key_frame {
        return anchor(row, |scene_id| CascadeSource::KeyFrame { scene_id });
    }

    let preceding = siblings
        .iter()
        .filter(|row| row.scene_number <= current)
        .max_by_key(|row| row.scene_number);
    if let Some(row) = preceding {
        return anchor(row, |scene_id| CascadeSource::PrecedingScene { scene_id });
    }

    let following = siblings
        .iter()
        .filter(|row| row.scene_number > current)
        .min_by_key(|row| row.scene_number);
    if let Some(row) = following {
        return anchor(row, |scene_id| CascadeSource::FollowingScene { scene_id });
    }

    let group = state.group(group_id)?;
    let image = state.concept_image_for(group)?.to_string();
    let location_image = group
        .location_id
        .as_deref()
        .and_then(|id| state.location(id))
        .and_then(|location| location.concept_image.as_deref())
        .filter(|value| !value.trim().is_empty());
    let source = match (location_image, group.location_id.as_deref()) {
        (Some(_), Some(location_id)) => CascadeSource::LocationConcept {
            location_id: location_id.to_string(),
        },
        _ => CascadeSource::GroupConcept {
            group_id: group.id.clone(),
        },
    };
    Some(CascadeReference { image, source })
}

/// The closest earlier frame in the same group that can be compared
/// against: it has an image and did not fail continuity itself.
///
/// Raccord is checked against this frame even when the cascade anchor is a
/// key frame further away.
pub fn resolve_previous_frame<'a>(scene: &Scene, state: &'a ProjectState) -> Option<&'a Scene> {
    let group_id = scene.group_id.as_deref()?;
    state
        .scenes
        .iter()
        .filter(|row| row.id != scene.id)
        .filter(|row| row.group_id.as_deref() == Some(group_id))
        .filter(|row| row.scene_number < scene.scene_number)
        .filter(|row| row.has_image() && !row.dop_failed)
        .max_by_key(|row| row.scene_number)
}

fn anchor(row: &Scene, source: impl FnOnce(String) -> CascadeSource) -> Option<CascadeReference> {
    Some(CascadeReference {
        image: row.generated_image.clone()?,
        source: source(row.id.clone()),
    })
}

#[cfg(test)]
mod tests {
    use raccord_contracts::project::{Location, SceneGroup};

    use super::*;

    fn scene(number: u32, group: &str, image: Option<&str>, key: bool) -> Scene {
        let mut scene = Scene::new(format!("s{number}"), number);
        scene.group_id = Some(group.to_string());
        scene.generated_image = image.map(str::to_string);
        scene.is_key_frame = key;
        scene
    }

    fn office(scenes: Vec<Scene>) -> ProjectState {
        ProjectState {
            scenes,
            scene_groups: vec![SceneGroup {
                id: "office".to_string(),
                name: "Office".to_string(),
                concept_image: Some("office-concept.png".to_string()),
                ..SceneGroup::default()
            }],
            ..ProjectState::default()
        }
    }

    #[test]
    fn nearest_key_frame_wins_over_adjacent_scene() {
        let state = office(vec![
            scene(2, "office", Some("k2.png"), true),
            scene(3, "office", Some("s3.png"), false),
            scene(4, "office", None, false),
            scene(5, "office", Some("k5.png"), true),
        ]);
        let target = state.scene("s4").expect("s4").clone();
        let resolved = resolve_cascade_reference(&target, &state).expect("anchor");
        assert_eq!(
            resolved.source,
            CascadeSource::KeyFrame {
                scene_id: "s5".to_string()
            }
        );
        assert_eq!(resolved.image, "k5.png");
    }

    #[test]
    fn farther_key_frame_beats_closer_plain_sibling() {
        let state = office(vec![
            scene(1, "office", None, false),
            scene(3, "office", Some("s3.png"), false),
            scene(5, "office", None, false),
            scene(10, "office", Some("k10.png"), true),
        ]);
        let target = state.scene("s5").expect("s5").clone();
        let resolved = resolve_cascade_reference(&target, &state).expect("anchor");
        assert_eq!(
            resolved.source,
            CascadeSource::KeyFrame {
                scene_id: "s10".to_string()
            }
        );
        assert_eq!(resolved.image, "k10.png");
    }

    #[test]
    fn previous_frame_ignores_key_frames_ahead_and_flagged_scenes() {
        let mut flagged = scene(4, "office", Some("bad.png"), false);
        flagged.dop_failed = true;
        let state = office(vec![
            scene(2, "office", Some("s2.png"), false),
            scene(3, "office", None, false),
            flagged,
            scene(5, "office", None, false),
            scene(8, "office", Some("k8.png"), true),
            scene(1, "street", Some("street.png"), false),
        ]);
        let target = state.scene("s3").expect("s3").clone();
        let previous = resolve_previous_frame(&target, &state).expect("previous frame");
        assert_eq!(previous.id, "s2");
        assert_eq!(
            resolve_cascade_reference(&target, &state).and_then(|reference| reference.scene_id().map(str::to_string)),
            Some("s8".to_string())
        );

        let target = state.scene("s5").expect("s5").clone();
        assert_eq!(resolve_previous_frame(&target, &state).map(|row| row.id.as_str()), Some("s2"));

        let first = scene(0, "office", None, false);
        assert!(resolve_previous_frame(&first, &state).is_none());
    }

    #[test]
    fn equidistant_key_frames_prefer_the_earlier_scene() {
        let state = office(vec![
            scene(2, "office", Some("k2.png"), true),
            scene(4, "office", None, false),
            scene(6, "office", Some("k6.png"), true),
        ]);
        let target = state.scene("s4").expect("s4").clone();
        let resolved = resolve_cascade_reference(&target, &state).expect("anchor");
        assert_eq!(resolved.scene_id(), Some("s2"));
    }

    #[test]
    fn dop_failed_scenes_are_never_anchors() {
        let mut flagged = scene(5, "office", Some("bad.png"), true);
        flagged.dop_failed = true;
        let state = office(vec![
            scene(3, "office", Some("s3.png"), false),
            scene(4, "office", None, false),
            flagged,
        ]);
        let target = state.scene("s4").expect("s4").clone();
        let resolved = resolve_cascade_reference(&target, &state).expect("anchor");
        assert_eq!(
            resolved.source,
            CascadeSource::PrecedingScene {
                scene_id: "s3".to_string()
            }
        );
    }

    #[test]
    fn falls_through_to_following_scene_then_concept_art() {
        let state = office(vec![
            scene(1, "office", None, false),
            scene(2, "office", Some("s2.png"), false),
        ]);
        let target = state.scene("s1").expect("s1").clone();
        let resolved = resolve_cascade_reference(&target, &state).expect("anchor");
        assert_eq!(resolved.scene_id(), Some("s2"));

        let bare = office(vec![scene(1, "office", None, false)]);
        let target = bare.scene("s1").expect("s1").clone();
        let resolved = resolve_cascade_reference(&target, &bare).expect("anchor");
        assert_eq!(
            resolved.source,
            CascadeSource::GroupConcept {
                group_id: "office".to_string()
            }
        );
        assert_eq!(resolved.image, "office-concept.png");
    }

    #[test]
    fn location_concept_overrides_group_concept() {
        let mut state = office(vec![scene(1, "office", None, false)]);
        state.scene_groups[0].location_id = Some("loc-1".to_string());
        state.locations.push(Location {
            id: "loc-1".to_string(),
            name: "Open-plan office".to_string(),
            concept_image: Some("location.png".to_string()),
            ..Location::default()
        });
        let target = state.scene("s1").expect("s1").clone();
        let resolved = resolve_cascade_reference(&target, &state).expect("anchor");
        assert_eq!(resolved.source.label(), "location_concept");
        assert_eq!(resolved.image, "location.png");
    }

    #[test]
    fn other_groups_and_ungrouped_scenes_do_not_leak() {
        let mut state = office(vec![
            scene(1, "street", Some("street.png"), true),
            scene(2, "office", None, false),
        ]);
        state.scene_groups[0].concept_image = None;
        let target = state.scene("s2").expect("s2").clone();
        assert!(resolve_cascade_reference(&target, &state).is_none());

        let loose = Scene::new("loose", 9);
        assert!(resolve_cascade_reference(&loose, &state).is_none());
    }

    #[test]
    fn resolution_is_deterministic() {
        let state = office(vec![
            scene(1, "office", Some("k1.png"), true),
            scene(3, "office", None, false),
            scene(5, "office", Some("k5.png"), true),
        ]);
        let target = state.scene("s3").expect("s3").clone();
        let first = resolve_cascade_reference(&target, &state);
        for _ in 0..10 {
            assert_eq!(resolve_cascade_reference(&target, &state), first);
        }
    }
}
