use raccord_contracts::project::{Character, DnaMode, ProjectState, Scene, SceneGroup};

use super::{PromptCorrection, ReferenceRole, ReferenceSegment};
use crate::pose::PoseDirective;
use crate::shot::ShotSpec;

const BASE_NEGATIVES: &[&str] = &[
    "text, captions, subtitles or watermarks",
    "split screens, collages or panels",
    "extra limbs or duplicated characters",
];

pub(super) fn header(scene: &Scene, editing: bool, reference_count: usize) -> String {
    let mut out = if editing {
        format!(
            "EDIT the attached base image for scene {}. Change only what the edit instruction asks for.",
            scene.scene_number
        )
    } else {
        format!(
            "Generate ONE cinematic film frame for scene {}. Every LOCK block below is mandatory.",
            scene.scene_number
        )
    };
    if reference_count > 0 {
        out.push_str(&format!(
            " {reference_count} reference image(s) follow in the order listed under REFERENCES."
        ));
    }
    out
}

pub(super) fn pose(directives: &[PoseDirective]) -> Option<String> {
    if directives.is_empty() {
        return None;
    }
    let lines: Vec<String> = directives
        .iter()
        .map(|directive| format!("- {}", directive.instruction()))
        .collect();
    Some(format!("MANDATORY BODY POSITION:\n{}", lines.join("\n")))
}

pub(super) fn narrative(scene: &Scene, context: &str, voice_over: &str) -> String {
    let mut out = format!("SCENE {}:", scene.scene_number);
    if !context.is_empty() {
        out.push('\n');
        out.push_str(context);
    }
    if !voice_over.is_empty() {
        out.push_str("\nNarration (context only, never render as text): ");
        out.push_str(voice_over);
    }
    out
}

pub(super) fn edit_instruction(instruction: &str) -> String {
    format!(
        "EDIT INSTRUCTION: {}\nKeep composition, identities and lighting of the base image unless the instruction changes them.",
        instruction.trim()
    )
}

pub(super) fn characters(scene: &Scene, cast: &[&Character]) -> Option<String> {
    if cast.is_empty() {
        return None;
    }
    let mut lines = vec!["CHARACTERS:".to_string()];
    for character in cast {
        let mut line = format!("- {}", character.name);
        if let Some(description) = character.description.as_deref().filter(|v| !v.trim().is_empty()) {
            line.push_str(&format!(": {}", description.trim()));
        }
        let outfit = scene
            .character_visual_states
            .get(&character.id)
            .map(String::as_str)
            .or(character.outfit.as_deref())
            .filter(|v| !v.trim().is_empty());
        if let Some(outfit) = outfit {
            line.push_str(&format!(". Wearing: {}", outfit.trim()));
        }
        if character.identity_anchor().is_some() {
            line.push_str(". Face must match the IDENTITY LOCK image exactly");
        }
        let views: Vec<&str> = character
            .supporting_views()
            .into_iter()
            .map(|(view, _)| view)
            .collect();
        if !views.is_empty() {
            line.push_str(&format!(
                ". Outfit and build must match the OUTFIT LOCK views ({})",
                views.join(", ")
            ));
        }
        line.push('.');
        lines.push(line);
    }
    if let Some(facing) = scene.facing_direction.as_deref().filter(|v| !v.trim().is_empty()) {
        lines.push(format!("Facing direction: {}.", facing.trim()));
    }
    Some(lines.join("\n"))
}

pub(super) fn environment(state: &ProjectState, group: &SceneGroup) -> String {
    let mut lines = vec![format!(
        "ENVIRONMENT LOCK ({}), identical in every shot of this location:",
        if group.name.trim().is_empty() { group.id.as_str() } else { group.name.trim() }
    )];
    let location = group.location_id.as_deref().and_then(|id| state.location(id));
    match (location, group.description.as_deref()) {
        (Some(location), _) => {
            let mut line = format!("- Location: {}", location.name);
            if let Some(description) = location.description.as_deref().filter(|v| !v.trim().is_empty()) {
                line.push_str(&format!(", {}", description.trim()));
            }
            lines.push(line);
        }
        (None, Some(description)) if !description.trim().is_empty() => {
            lines.push(format!("- Location: {}", description.trim()));
        }
        _ => {}
    }
    for (label, value) in [
        ("Time of day", group.time_of_day.as_deref()),
        ("Weather", group.weather.as_deref()),
        ("Lighting", group.lighting_mood.as_deref()),
        ("Fixed spatial anchors", group.spatial_anchors.as_deref()),
    ] {
        if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
            lines.push(format!("- {label}: {}", value.trim()));
        }
    }
    lines.join("\n")
}

/// Text instruction attached to each reference image.
pub(super) fn role_instruction(
    role: ReferenceRole,
    subject: Option<&str>,
    dna_mode: DnaMode,
    dna_description: Option<&str>,
) -> String {
    let subject = subject.unwrap_or("the character");
    match role {
        ReferenceRole::BaseCanvas => {
            "BASE IMAGE: the frame to edit. Preserve everything the instruction does not change.".to_string()
        }
        ReferenceRole::DnaReference => match dna_mode {
            DnaMode::StyleOnly => {
                "DNA REFERENCE (STYLE ONLY): borrow palette, lighting and texture. Do NOT copy its subjects, objects or layout."
                    .to_string()
            }
            DnaMode::ObjectComposite => format!(
                "DNA REFERENCE (OBJECT): place this exact object into the scene with matching shape, color and material{}. Ignore its background.",
                dna_description
                    .filter(|v| !v.trim().is_empty())
                    .map(|v| format!(" ({})", v.trim()))
                    .unwrap_or_default()
            ),
        },
        ReferenceRole::CharacterFace => format!(
            "IDENTITY LOCK for {subject}: match face shape, eyes, skin tone and hair exactly. Ignore its background and clothing."
        ),
        ReferenceRole::CharacterOutfit => format!(
            "OUTFIT LOCK for {subject}: match garments, colors, accessories and proportions. Do not copy pose or background."
        ),
        ReferenceRole::StyleReference => {
            "STYLE REFERENCE ONLY: match rendering style and color grade. Ignore its content.".to_string()
        }
        ReferenceRole::Environment => {
            "ENVIRONMENT LOCK: this is the location. Keep architecture, props and layout. Ignore any people in it."
                .to_string()
        }
        ReferenceRole::CascadeAnchor => {
            "PREVIOUS SHOT ANCHOR: keep lighting, palette, set dressing and character appearance continuous with this frame. Choose a new camera setup."
                .to_string()
        }
        ReferenceRole::ContinuityAnchor => {
            "CONTINUITY ANCHOR (previous frame): characters, outfits, props and background must match this frame exactly."
                .to_string()
        }
    }
}

pub(super) fn references(segments: &[ReferenceSegment]) -> Option<String> {
    if segments.is_empty() {
        return None;
    }
    let lines: Vec<String> = segments
        .iter()
        .enumerate()
        .map(|(idx, segment)| format!("{}. {}", idx + 1, segment.label))
        .collect();
    Some(format!("REFERENCES:\n{}", lines.join("\n")))
}

pub(super) fn camera(shot: &ShotSpec) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(angle) = shot.angle.as_deref() {
        parts.push(format!("{angle} angle"));
    }
    if let Some(lens) = shot.lens.as_deref() {
        parts.push(format!("{lens} lens"));
    }
    if let Some(camera) = shot.camera.as_deref() {
        parts.push(format!("shot on {camera}"));
    }
    if parts.is_empty() {
        return None;
    }
    Some(format!("CAMERA: {}.", parts.join(", ")))
}

pub(super) fn style(shot: &ShotSpec) -> String {
    format!("STYLE: {}", shot.style)
}

pub(super) fn director(shot: &ShotSpec) -> Option<String> {
    let director = shot.director.as_ref()?;
    let name = director.name.trim();
    Some(if name.is_empty() {
        format!("DIRECTOR STYLE: {}", director.instruction.trim())
    } else {
        format!("DIRECTOR STYLE ({name}): {}", director.instruction.trim())
    })
}

pub(super) fn corrections(correction: Option<&PromptCorrection>) -> Option<String> {
    let correction = correction?;
    if correction.positive.is_empty() {
        return None;
    }
    let lines: Vec<String> = correction
        .positive
        .iter()
        .map(|line| format!("- {line}"))
        .collect();
    Some(format!(
        "CONTINUITY CORRECTIONS (fix these before anything else):\n{}",
        lines.join("\n")
    ))
}

pub(super) fn negatives(scene: &Scene, correction: Option<&PromptCorrection>) -> String {
    let mut items: Vec<&str> = BASE_NEGATIVES.to_vec();
    let extra = scene
        .negative_constraints
        .iter()
        .chain(correction.into_iter().flat_map(|row| row.negative.iter()))
        .map(|row| row.trim())
        .filter(|row| !row.is_empty());
    for item in extra {
        if !items.contains(&item) {
            items.push(item);
        }
    }
    format!("AVOID: {}.", items.join("; "))
}
