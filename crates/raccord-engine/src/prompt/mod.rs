mod fragments;

use std::sync::Arc;

use raccord_contracts::project::{DnaMode, ProjectState, Scene};
use raccord_contracts::runs::receipts::ReferenceRecord;

use crate::cascade::{CascadeReference, CascadeSource};
use crate::images::{describe_reference, InlineImage, ReferenceLoader};
use crate::narrative::{clean_narrative, tail_chars};
use crate::pose::{KeywordPoseExtractor, PoseExtractor};
use crate::error_chain_text;
use crate::shot::resolve_shot;

/// Narrative shorter than this after trimming is not worth keeping; the
/// whole directive is cut from the front instead.
const MIN_NARRATIVE_CHARS: usize = 80;

/// Optional sections in the order they are given up under a tight budget.
const DROPPABLE_SECTIONS: [&str; 6] = [
    "reference list",
    "director notes",
    "camera",
    "environment",
    "characters",
    "style",
];

/// Attachment role of a reference image. Declaration order is attachment
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReferenceRole {
    BaseCanvas,
    DnaReference,
    CharacterFace,
    CharacterOutfit,
    StyleReference,
    Environment,
    CascadeAnchor,
    ContinuityAnchor,
}

impl ReferenceRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BaseCanvas => "base_canvas",
            Self::DnaReference => "dna_reference",
            Self::CharacterFace => "character_face",
            Self::CharacterOutfit => "character_outfit",
            Self::StyleReference => "style_reference",
            Self::Environment => "environment",
            Self::CascadeAnchor => "cascade_anchor",
            Self::ContinuityAnchor => "continuity_anchor",
        }
    }

    pub fn is_identity(self) -> bool {
        matches!(self, Self::CharacterFace | Self::CharacterOutfit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSegment {
    pub role: ReferenceRole,
    /// Instruction sent right before the image.
    pub label: String,
    /// Original reference string, for receipts.
    pub source: String,
    pub image: InlineImage,
}

/// Fragment ordering. Providers that read prompts front-to-back with a
/// small budget get style and constraints first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptLayout {
    SubjectFirst,
    StyleFirst,
}

/// Prompt deltas produced by a failed continuity check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptCorrection {
    pub positive: Vec<String>,
    pub negative: Vec<String>,
}

impl PromptCorrection {
    pub fn is_empty(&self) -> bool {
        self.positive.is_empty() && self.negative.is_empty()
    }
}

/// Everything one prompt assembly needs.
#[derive(Debug, Clone)]
pub struct PromptRequest<'a> {
    pub scene: &'a Scene,
    pub state: &'a ProjectState,
    pub layout: PromptLayout,
    pub char_limit: usize,
    pub reference_cap: usize,
    pub cascade: Option<&'a CascadeReference>,
    pub continuity_anchor: Option<&'a str>,
    pub base_image: Option<&'a str>,
    pub edit_instruction: Option<&'a str>,
    pub dna_reference: Option<&'a str>,
    pub dna_mode: Option<DnaMode>,
    pub correction: Option<&'a PromptCorrection>,
}

impl<'a> PromptRequest<'a> {
    pub fn new(scene: &'a Scene, state: &'a ProjectState) -> Self {
        Self {
            scene,
            state,
            layout: PromptLayout::SubjectFirst,
            char_limit: 12_000,
            reference_cap: 14,
            cascade: None,
            continuity_anchor: None,
            base_image: None,
            edit_instruction: None,
            dna_reference: None,
            dna_mode: None,
            correction: None,
        }
    }

    fn dna(&self) -> Option<(&'a str, DnaMode)> {
        let source = self
            .dna_reference
            .or(self.scene.reference_image.as_deref())
            .filter(|value| !value.trim().is_empty())?;
        Some((source, self.dna_mode.unwrap_or(self.scene.reference_mode)))
    }

    fn editing(&self) -> bool {
        self.base_image.is_some() && self.edit_instruction.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssembledPrompt {
    pub text: String,
    pub references: Vec<ReferenceSegment>,
    pub warnings: Vec<String>,
    pub truncated: bool,
}

impl AssembledPrompt {
    pub fn reference_records(&self) -> Vec<ReferenceRecord> {
        self.references
            .iter()
            .map(|segment| ReferenceRecord::new(segment.role.as_str(), &segment.source))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReferenceCandidate {
    role: ReferenceRole,
    label: String,
    source: String,
}

/// Builds the directive text and the ordered reference list for a scene.
pub struct PromptAssembler {
    pose: Box<dyn PoseExtractor>,
    loader: Arc<dyn ReferenceLoader>,
}

impl PromptAssembler {
    pub fn new(loader: Arc<dyn ReferenceLoader>) -> Self {
        Self {
            pose: Box::new(KeywordPoseExtractor::default()),
            loader,
        }
    }

    pub fn with_pose_extractor(mut self, pose: Box<dyn PoseExtractor>) -> Self {
        self.pose = pose;
        self
    }

    /// Unloadable references are dropped with a warning; assembly itself
    /// never fails.
    pub fn assemble(&self, request: &PromptRequest<'_>) -> AssembledPrompt {
        let mut warnings = Vec::new();
        let mut references = Vec::new();
        for candidate in collect_references(request) {
            match self.loader.load(&candidate.source) {
                Ok(image) => references.push(ReferenceSegment {
                    role: candidate.role,
                    label: candidate.label,
                    source: candidate.source,
                    image,
                }),
                Err(err) => {
                    let message = format!(
                        "Skipped {} reference {}: {}",
                        candidate.role.as_str(),
                        describe_reference(&candidate.source),
                        error_chain_text(&err, 240)
                    );
                    tracing::warn!(scene_id = %request.scene.id, "{message}");
                    warnings.push(message);
                }
            }
        }
        if references.len() > request.reference_cap {
            let message = format!(
                "{} reference images exceed the model limit of {}; extras may be ignored.",
                references.len(),
                request.reference_cap
            );
            tracing::warn!(scene_id = %request.scene.id, "{message}");
            warnings.push(message);
        }

        let (text, trim_warning) = self.compose_text(request, &references);
        let truncated = trim_warning.is_some();
        warnings.extend(trim_warning);
        AssembledPrompt {
            text,
            references,
            warnings,
            truncated,
        }
    }

    fn compose_text(
        &self,
        request: &PromptRequest<'_>,
        references: &[ReferenceSegment],
    ) -> (String, Option<String>) {
        let scene = request.scene;
        let state = request.state;
        let group = state.group_for(scene);
        let shot = resolve_shot(scene, group, &state.settings);
        let context = clean_narrative(&scene.context_description);
        let voice_over = clean_narrative(scene.voice_over_text.as_deref().unwrap_or_default());
        let poses = self.pose.extract(&format!("{context}\n{voice_over}"));
        let cast = state.characters_in(scene);

        let head = fragments::header(scene, request.editing(), references.len());
        let pose = fragments::pose(&poses);
        let corrections = fragments::corrections(request.correction);
        let edit = request
            .edit_instruction
            .filter(|_| request.editing())
            .map(fragments::edit_instruction);
        let characters = fragments::characters(scene, &cast);
        let environment = group.map(|group| fragments::environment(state, group));
        let reference_list = fragments::references(references);
        let camera = fragments::camera(&shot);
        let style = Some(fragments::style(&shot));
        let director = fragments::director(&shot);
        let negatives = Some(fragments::negatives(scene, request.correction));

        // Rank 0 fragments are never dropped; the rest go in rank order
        // when trimming the narrative alone is not enough.
        let render = |narrative: &str, dropped: usize| -> String {
            let narrative = Some(narrative.to_string());
            let ordered: Vec<(&Option<String>, usize)> = match request.layout {
                PromptLayout::SubjectFirst => vec![
                    (&pose, 0),
                    (&corrections, 0),
                    (&edit, 0),
                    (&narrative, 0),
                    (&characters, 5),
                    (&environment, 4),
                    (&reference_list, 1),
                    (&camera, 3),
                    (&style, 6),
                    (&director, 2),
                    (&negatives, 0),
                ],
                PromptLayout::StyleFirst => vec![
                    (&pose, 0),
                    (&style, 6),
                    (&director, 2),
                    (&negatives, 0),
                    (&corrections, 0),
                    (&camera, 3),
                    (&edit, 0),
                    (&narrative, 0),
                    (&characters, 5),
                    (&environment, 4),
                    (&reference_list, 1),
                ],
            };
            let mut parts = vec![head.clone()];
            parts.extend(
                ordered
                    .into_iter()
                    .filter(|(_, rank)| *rank == 0 || *rank > dropped)
                    .filter_map(|(fragment, _)| fragment.clone()),
            );
            parts.join("\n\n")
        };

        let full_narrative = fragments::narrative(scene, &context, &voice_over);
        let limit = request.char_limit.max(1);
        let text = render(&full_narrative, 0);
        if text.chars().count() <= limit {
            return (text, None);
        }

        let narrative_chars = full_narrative.chars().count();
        let fit = |dropped: usize| -> Option<String> {
            let text = render(&full_narrative, dropped);
            let total = text.chars().count();
            if total <= limit {
                return Some(text);
            }
            let overflow = total - limit;
            if narrative_chars <= overflow + MIN_NARRATIVE_CHARS {
                return None;
            }
            let keep = narrative_chars - overflow - 1;
            let text = render(&format!("…{}", tail_chars(&full_narrative, keep)), dropped);
            (text.chars().count() <= limit).then_some(text)
        };
        for dropped in 0..=DROPPABLE_SECTIONS.len() {
            if let Some(text) = fit(dropped) {
                let mut warning = format!("Prompt trimmed to {limit} characters to fit the model budget.");
                if dropped > 0 {
                    warning.push_str(&format!(
                        " Dropped sections: {}.",
                        DROPPABLE_SECTIONS[..dropped].join(", ")
                    ));
                }
                return (text, Some(warning));
            }
        }

        // Header, pose and corrections lead every layout, so a hard cut
        // from the end keeps them.
        let narrative = if narrative_chars > MIN_NARRATIVE_CHARS {
            format!("…{}", tail_chars(&full_narrative, MIN_NARRATIVE_CHARS))
        } else {
            full_narrative.clone()
        };
        let minimal = render(&narrative, DROPPABLE_SECTIONS.len());
        let text: String = minimal.chars().take(limit).collect();
        let warning = format!(
            "Prompt cut to its first {limit} characters; mandatory blocks alone exceed the model budget."
        );
        tracing::warn!(scene_id = %scene.id, limit, "{warning}");
        (text, Some(warning))
    }
}

fn collect_references(request: &PromptRequest<'_>) -> Vec<ReferenceCandidate> {
    let scene = request.scene;
    let state = request.state;
    let mut out = Vec::new();
    let (dna_source, dna_mode) = match request.dna() {
        Some((source, mode)) => (Some(source), mode),
        None => (None, DnaMode::StyleOnly),
    };
    let mut push = |role: ReferenceRole, source: Option<&str>, subject: Option<&str>| {
        let Some(source) = source.map(str::trim).filter(|value| !value.is_empty()) else {
            return;
        };
        out.push(ReferenceCandidate {
            role,
            label: fragments::role_instruction(
                role,
                subject,
                dna_mode,
                scene.reference_image_description.as_deref(),
            ),
            source: source.to_string(),
        });
    };

    if request.editing() {
        push(ReferenceRole::BaseCanvas, request.base_image, None);
    }
    push(ReferenceRole::DnaReference, dna_source, None);
    let cast = state.characters_in(scene);
    for character in &cast {
        push(
            ReferenceRole::CharacterFace,
            character.identity_anchor(),
            Some(character.name.as_str()),
        );
    }
    for character in &cast {
        for (view, source) in character.supporting_views() {
            push(
                ReferenceRole::CharacterOutfit,
                Some(source),
                Some(format!("{} ({view} view)", character.name).as_str()),
            );
        }
    }
    push(
        ReferenceRole::StyleReference,
        state.settings.style_reference_image.as_deref(),
        None,
    );
    let concept = state
        .group_for(scene)
        .and_then(|group| state.concept_image_for(group));
    push(ReferenceRole::Environment, concept, None);
    if let Some(cascade) = request.cascade {
        let role = match cascade.source {
            CascadeSource::LocationConcept { .. } | CascadeSource::GroupConcept { .. } => {
                ReferenceRole::Environment
            }
            _ => ReferenceRole::CascadeAnchor,
        };
        push(role, Some(cascade.image.as_str()), None);
    }
    push(ReferenceRole::ContinuityAnchor, request.continuity_anchor, None);

    out.sort_by_key(|candidate| candidate.role);
    let mut seen = std::collections::HashSet::new();
    out.retain(|candidate| seen.insert(candidate.source.clone()));
    out
}
