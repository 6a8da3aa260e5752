mod reducer;
mod store;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub use reducer::{reduce, ProjectAction};
pub use store::ProjectStore;

/// How a scene's explicit DNA reference image should be used.
///
/// The two modes are mutually exclusive: either the look of the source is
/// borrowed, or a specific object from it is transplanted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DnaMode {
    #[default]
    StyleOnly,
    ObjectComposite,
}

/// Why the last generation attempt for a scene failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Quota or transient provider failure; the user may re-run the batch.
    RateLimited,
    /// Credentials rejected. Aborts the whole batch.
    FatalAuth,
    /// The alternate backend is missing its endpoint or token.
    ProviderConfig,
    /// The provider answered without an image.
    NoImage,
    /// Continuity errors survived the retry budget.
    DopUnfixable,
    Other,
}

impl FailureKind {
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::FatalAuth)
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited)
    }
}

/// Coarse lifecycle of a scene, derived from its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneStatus {
    Idle,
    Generating,
    Succeeded,
    Failed(FailureKind),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Scene {
    pub id: String,
    pub scene_number: u32,
    pub group_id: Option<String>,
    pub context_description: String,
    pub voice_over_text: Option<String>,
    pub character_ids: Vec<String>,
    /// Per-scene outfit or state override keyed by character id.
    pub character_visual_states: BTreeMap<String, String>,
    pub facing_direction: Option<String>,
    pub is_key_frame: bool,
    pub camera_angle_override: Option<String>,
    pub lens_override: Option<String>,
    pub style_override: Option<String>,
    /// User-selected DNA source image.
    pub reference_image: Option<String>,
    pub reference_image_description: Option<String>,
    pub reference_mode: DnaMode,
    pub negative_constraints: Vec<String>,

    pub generated_image: Option<String>,
    pub alternate_images: Vec<String>,
    pub media_id: Option<String>,
    pub is_generating: bool,
    pub generation_started_at: Option<String>,
    pub generation_duration: Option<f64>,
    pub status_text: Option<String>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub dop_failed: bool,
}

impl Scene {
    pub fn new(id: impl Into<String>, scene_number: u32) -> Self {
        Self {
            id: id.into(),
            scene_number,
            ..Self::default()
        }
    }

    pub fn status(&self) -> SceneStatus {
        if self.is_generating {
            return SceneStatus::Generating;
        }
        if self.dop_failed {
            return SceneStatus::Failed(FailureKind::DopUnfixable);
        }
        if let Some(kind) = self.failure_kind {
            return SceneStatus::Failed(kind);
        }
        if self.generated_image.is_some() {
            return SceneStatus::Succeeded;
        }
        SceneStatus::Idle
    }

    pub fn has_image(&self) -> bool {
        self.generated_image
            .as_deref()
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false)
    }
}

/// A shared-location bucket. Every member scene must honour the same
/// environment: time of day, weather, lighting and spatial anchors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SceneGroup {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub location_id: Option<String>,
    pub time_of_day: Option<String>,
    pub weather: Option<String>,
    pub lighting_mood: Option<String>,
    pub spatial_anchors: Option<String>,
    pub concept_image: Option<String>,
    pub camera_angle: Option<String>,
    pub lens: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CharacterViews {
    pub face: Option<String>,
    pub body: Option<String>,
    pub side: Option<String>,
    pub back: Option<String>,
    pub master: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Character {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub outfit: Option<String>,
    pub views: CharacterViews,
}

impl Character {
    /// The face view wins over the master sheet as identity anchor.
    pub fn identity_anchor(&self) -> Option<&str> {
        non_empty(self.views.face.as_deref()).or_else(|| non_empty(self.views.master.as_deref()))
    }

    /// Non-identity views in attachment order: body, side, back, and the
    /// master sheet when the face view already took the identity slot.
    pub fn supporting_views(&self) -> Vec<(&'static str, &str)> {
        let mut out = Vec::new();
        if let Some(body) = non_empty(self.views.body.as_deref()) {
            out.push(("body", body));
        }
        if let Some(side) = non_empty(self.views.side.as_deref()) {
            out.push(("side", side));
        }
        if let Some(back) = non_empty(self.views.back.as_deref()) {
            out.push(("back", back));
        }
        if non_empty(self.views.face.as_deref()).is_some() {
            if let Some(master) = non_empty(self.views.master.as_deref()) {
                out.push(("master", master));
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Location {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub concept_image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DirectorStyle {
    pub name: String,
    pub instruction: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderCredentials {
    pub gemini_api_key: Option<String>,
    pub gommo_domain: Option<String>,
    pub gommo_access_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationSettings {
    pub image_model: String,
    pub vision_model: String,
    pub aspect_ratio: String,
    /// Resolution tier: `1K`, `2K` or `4K`.
    pub resolution: String,
    pub style_preset: Option<String>,
    pub custom_style_instruction: Option<String>,
    pub style_reference_image: Option<String>,
    pub director_style: Option<DirectorStyle>,
    pub camera: Option<String>,
    pub lens: Option<String>,
    pub camera_angle: Option<String>,
    pub credentials: ProviderCredentials,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            image_model: "gemini-2.5-flash-image".to_string(),
            vision_model: "gemini-2.5-flash".to_string(),
            aspect_ratio: "16:9".to_string(),
            resolution: "1K".to_string(),
            style_preset: Some("cinematic".to_string()),
            custom_style_instruction: None,
            style_reference_image: None,
            director_style: None,
            camera: None,
            lens: None,
            camera_angle: None,
            credentials: ProviderCredentials::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageStats {
    pub total_images: u64,
    pub by_resolution: BTreeMap<String, u64>,
    pub by_provider: BTreeMap<String, u64>,
    pub last_generated_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GalleryEntry {
    pub id: String,
    pub scene_id: String,
    pub image: String,
    pub prompt: String,
    pub model: String,
    pub created_at: String,
}

/// Root aggregate. Updated only through [`reduce`], never in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectState {
    pub project_name: String,
    pub scenes: Vec<Scene>,
    pub scene_groups: Vec<SceneGroup>,
    pub characters: Vec<Character>,
    pub locations: Vec<Location>,
    pub settings: GenerationSettings,
    pub usage: UsageStats,
    pub gallery: Vec<GalleryEntry>,
}

impl ProjectState {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading project {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid project document {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn scene(&self, id: &str) -> Option<&Scene> {
        self.scenes.iter().find(|scene| scene.id == id)
    }

    pub fn group(&self, id: &str) -> Option<&SceneGroup> {
        self.scene_groups.iter().find(|group| group.id == id)
    }

    pub fn group_for(&self, scene: &Scene) -> Option<&SceneGroup> {
        scene.group_id.as_deref().and_then(|id| self.group(id))
    }

    pub fn character(&self, id: &str) -> Option<&Character> {
        self.characters.iter().find(|character| character.id == id)
    }

    pub fn location(&self, id: &str) -> Option<&Location> {
        self.locations.iter().find(|location| location.id == id)
    }

    /// Concept art for a group. A linked location's image takes precedence
    /// over the group's own.
    pub fn concept_image_for<'a>(&'a self, group: &'a SceneGroup) -> Option<&'a str> {
        group
            .location_id
            .as_deref()
            .and_then(|id| self.location(id))
            .and_then(|location| non_empty(location.concept_image.as_deref()))
            .or_else(|| non_empty(group.concept_image.as_deref()))
    }

    /// Characters appearing in a scene, in the scene's listed order.
    pub fn characters_in(&self, scene: &Scene) -> Vec<&Character> {
        scene
            .character_ids
            .iter()
            .filter_map(|id| self.character(id))
            .collect()
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|raw| !raw.trim().is_empty())
}
