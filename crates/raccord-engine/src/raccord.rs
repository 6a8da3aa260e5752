use std::sync::Arc;

use anyhow::Result;
use raccord_contracts::project::{ProjectState, Scene};
use serde::Serialize;
use serde_json::Value;

use crate::error::GenerationError;
use crate::images::InlineImage;
use crate::prompt::PromptCorrection;
use crate::vision::{extract_json_object, VisionModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuityErrorType {
    Character,
    Outfit,
    Lighting,
    Background,
    Style,
    Prop,
    Spatial,
    Other,
}

impl ContinuityErrorType {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "character" | "identity" | "face" => Self::Character,
            "outfit" | "costume" | "wardrobe" => Self::Outfit,
            "lighting" | "light" => Self::Lighting,
            "background" | "environment" | "set" => Self::Background,
            "style" => Self::Style,
            "prop" | "props" | "object" => Self::Prop,
            "spatial" | "position" | "screen_direction" => Self::Spatial,
            _ => Self::Other,
        }
    }

    /// Only these block acceptance; the rest are advisory.
    pub fn is_critical(self) -> bool {
        matches!(self, Self::Character | Self::Prop | Self::Spatial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Major,
    Minor,
}

impl Severity {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "critical" | "high" => Self::Critical,
            "minor" | "low" => Self::Minor,
            _ => Self::Major,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContinuityIssue {
    #[serde(rename = "type")]
    pub kind: ContinuityErrorType,
    pub severity: Severity,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDecision {
    Retry,
    Skip,
    TryOnce,
}

impl RetryDecision {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "retry" => Some(Self::Retry),
            "skip" => Some(Self::Skip),
            "try_once" | "tryonce" => Some(Self::TryOnce),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<ContinuityIssue>,
    pub decision: Option<RetryDecision>,
    pub correction_prompt: Option<String>,
}

impl ValidationReport {
    /// Parses the vision model's JSON verdict. A missing `isValid` is
    /// treated as malformed.
    pub fn from_value(value: &Value) -> Result<Self> {
        let is_valid = value
            .get("isValid")
            .or_else(|| value.get("is_valid"))
            .and_then(Value::as_bool)
            .ok_or_else(|| {
                GenerationError::ContinuityValidation("verdict is missing isValid".to_string())
            })?;
        let errors = value
            .get("errors")
            .and_then(Value::as_array)
            .map(|rows| rows.iter().filter_map(parse_issue).collect())
            .unwrap_or_default();
        let decision = value
            .get("decision")
            .and_then(Value::as_str)
            .and_then(RetryDecision::parse);
        let correction_prompt = value
            .get("correctionPrompt")
            .or_else(|| value.get("correction_prompt"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string);
        Ok(Self {
            is_valid,
            errors,
            decision,
            correction_prompt,
        })
    }

    pub fn blocking_errors(&self) -> impl Iterator<Item = &ContinuityIssue> {
        self.errors.iter().filter(|issue| issue.kind.is_critical())
    }

    /// A verdict passes when no critical-category error is reported, even
    /// if the model flagged lighting or style drift.
    pub fn passed(&self) -> bool {
        self.blocking_errors().next().is_none()
    }

    pub fn summary(&self) -> String {
        let blocking: Vec<String> = self
            .blocking_errors()
            .map(|issue| format!("{:?}: {}", issue.kind, issue.description).to_lowercase())
            .collect();
        if blocking.is_empty() {
            return "no blocking continuity errors".to_string();
        }
        blocking.join("; ")
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn parse_issue(row: &Value) -> Option<ContinuityIssue> {
    let description = row
        .get("description")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())?;
    Some(ContinuityIssue {
        kind: ContinuityErrorType::parse(row.get("type").and_then(Value::as_str).unwrap_or("")),
        severity: Severity::parse(row.get("severity").and_then(Value::as_str).unwrap_or("")),
        description: description.to_string(),
    })
}

/// Compares a new frame with the frame it should continue from.
pub struct RaccordValidator {
    vision: Arc<dyn VisionModel>,
}

impl RaccordValidator {
    pub fn new(vision: Arc<dyn VisionModel>) -> Self {
        Self { vision }
    }

    pub fn validate(
        &self,
        state: &ProjectState,
        previous_scene: &Scene,
        previous: &InlineImage,
        current_scene: &Scene,
        current: &InlineImage,
    ) -> Result<ValidationReport> {
        let instruction = validation_instruction(state, previous_scene, current_scene);
        let reply = self
            .vision
            .analyze(&instruction, &[previous.clone(), current.clone()])?;
        let value = extract_json_object(&reply).ok_or_else(|| {
            GenerationError::ContinuityValidation(format!(
                "{} returned no JSON verdict",
                self.vision.name()
            ))
        })?;
        ValidationReport::from_value(&value)
    }
}

fn validation_instruction(state: &ProjectState, previous: &Scene, current: &Scene) -> String {
    let cast: Vec<String> = state
        .characters_in(current)
        .into_iter()
        .map(|character| {
            let outfit = current
                .character_visual_states
                .get(&character.id)
                .or(character.outfit.as_ref())
                .map(|outfit| format!(" wearing {outfit}"))
                .unwrap_or_default();
            format!("{}{outfit}", character.name)
        })
        .collect();
    format!(
        "You are the director of photography checking continuity (raccord) between two consecutive shots.\n\
         Image 1 is the PREVIOUS shot (scene {}): {}\n\
         Image 2 is the NEW shot (scene {}): {}\n\
         Expected characters: {}\n\
         Check character identity, outfits, props, spatial layout and screen direction, lighting, background and style. \
         Also flag a NEW shot that merely repeats the previous composition as a static background.\n\
         Reply as JSON only: {{\"isValid\": true|false, \"errors\": [{{\"type\": \"character|outfit|lighting|background|style|prop|spatial\", \
         \"severity\": \"critical|major|minor\", \"description\": \"...\"}}], \"decision\": \"retry|skip|try_once\", \
         \"correctionPrompt\": \"...\"}}",
        previous.scene_number,
        previous.context_description.trim(),
        current.scene_number,
        current.context_description.trim(),
        if cast.is_empty() { "none listed".to_string() } else { cast.join(", ") },
    )
}

/// Chooses what to do after a blocking verdict.
pub trait DecisionAgent: Send + Sync {
    fn decide(&self, report: &ValidationReport, retries_used: u32) -> RetryDecision;
}

/// Trusts the model's own decision when it gives one.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicDecisionAgent;

impl DecisionAgent for HeuristicDecisionAgent {
    fn decide(&self, report: &ValidationReport, _retries_used: u32) -> RetryDecision {
        if let Some(decision) = report.decision {
            return decision;
        }
        if report.passed() {
            RetryDecision::Skip
        } else {
            RetryDecision::Retry
        }
    }
}

/// Retry budget for continuity failures. The first retry always runs;
/// later ones need an explicit `Retry` decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn should_retry(&self, decision: RetryDecision, retries_used: u32) -> bool {
        if retries_used >= self.max_retries {
            return false;
        }
        match decision {
            RetryDecision::Retry => true,
            RetryDecision::Skip | RetryDecision::TryOnce => retries_used == 0,
        }
    }
}

struct CorrectionRule {
    keywords: &'static [&'static str],
    positive: &'static str,
    negative: Option<&'static str>,
}

const CAMERA_JITTER_KEYWORDS: &[&str] = &[
    "static background",
    "identical composition",
    "same composition",
    "same framing",
    "copy of the previous",
    "duplicate",
];

const CORRECTION_RULES: &[CorrectionRule] = &[
    CorrectionRule {
        keywords: &[" face", "identity", "different person", "hair"],
        positive: "IDENTITY LOCK BOOST: every character's face must be a faithful match of the IDENTITY LOCK image: same face shape, eyes, nose, skin tone and hairstyle.",
        negative: Some("a different face or person than the identity reference"),
    },
    CorrectionRule {
        keywords: &["outfit", "clothing", "clothes", "costume", "wearing", "jacket", "shirt"],
        positive: "OUTFIT LOCK: same garments, colors and accessories as the previous shot.",
        negative: Some("changed clothing or accessories"),
    },
    CorrectionRule {
        keywords: &["prop", "object", "holding", "missing", "item"],
        positive: "PROP CONTINUITY: every prop from the previous shot stays present, in the same hands and positions.",
        negative: Some("missing or swapped props"),
    },
    CorrectionRule {
        keywords: &[" left", " right", " position", " facing", "screen direction", "spatial", "flipped"],
        positive: "SCREEN DIRECTION: keep characters on the same side of frame and facing the same way as the previous shot.",
        negative: Some("flipped screen direction"),
    },
    CorrectionRule {
        keywords: &["light", "shadow", "exposure", "color temperature"],
        positive: "LIGHTING LOCK: keep the key light direction, intensity and color temperature of the previous shot.",
        negative: None,
    },
    CorrectionRule {
        keywords: &["style", "cartoon", "render", "painterly"],
        positive: "STYLE LOCK: same rendering style and color grade as the previous shot.",
        negative: None,
    },
];

const BACKGROUND_RULE: CorrectionRule = CorrectionRule {
    keywords: &["background", "room", "location", "wall", "furniture"],
    positive: "BACKGROUND LOCK: same architecture, furniture and set dressing as the previous shot.",
    negative: Some("a different location or rearranged set"),
};

const CAMERA_JITTER: CorrectionRule = CorrectionRule {
    keywords: CAMERA_JITTER_KEYWORDS,
    positive: "FORCE CAMERA CHANGE: move the camera to a clearly different position and angle than the previous shot; do not reproduce its framing.",
    negative: Some("an identical copy of the previous shot's composition"),
};

/// Maps continuity error descriptions to prompt deltas for the retry.
pub fn build_correction(report: &ValidationReport) -> PromptCorrection {
    let mut correction = PromptCorrection::default();
    let mut apply = |rule: &CorrectionRule| {
        if !correction.positive.iter().any(|row| row == rule.positive) {
            correction.positive.push(rule.positive.to_string());
        }
        if let Some(negative) = rule.negative {
            if !correction.negative.iter().any(|row| row == negative) {
                correction.negative.push(negative.to_string());
            }
        }
    };

    for issue in &report.errors {
        let text = format!(" {}", issue.description.to_lowercase());
        let matches = |rule: &CorrectionRule| rule.keywords.iter().any(|keyword| text.contains(keyword));
        let jitter = matches(&CAMERA_JITTER);
        if jitter {
            apply(&CAMERA_JITTER);
        }
        for rule in CORRECTION_RULES {
            if matches(rule) {
                apply(rule);
            }
        }
        if !jitter && (matches(&BACKGROUND_RULE) || issue.kind == ContinuityErrorType::Background) {
            apply(&BACKGROUND_RULE);
        }
        if issue.kind == ContinuityErrorType::Character {
            apply(&CORRECTION_RULES[0]);
        }
    }
    if let Some(extra) = report.correction_prompt.as_deref() {
        correction.positive.push(extra.to_string());
    }
    correction
}
