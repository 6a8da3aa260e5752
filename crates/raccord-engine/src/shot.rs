use raccord_contracts::project::{DirectorStyle, GenerationSettings, Scene, SceneGroup};

const DEFAULT_STYLE: &str =
    "Cinematic photorealistic film still, natural skin texture, motivated lighting, shallow depth of field.";

/// Named looks selectable from project settings.
pub fn style_preset(name: &str) -> Option<&'static str> {
    let normalized = name.trim().to_ascii_lowercase().replace(['-', ' '], "_");
    let text = match normalized.as_str() {
        "cinematic" => DEFAULT_STYLE,
        "noir" | "film_noir" => {
            "Black-and-white film noir, hard low-key lighting, deep shadows, venetian-blind light patterns."
        }
        "anime" => "High-quality 2D anime key visual, clean line art, cel shading, vibrant palette.",
        "documentary" => {
            "Handheld documentary realism, available light, slight grain, unposed framing."
        }
        "vintage_film" | "35mm" => {
            "Vintage 35mm film stock look, warm halation, soft grain, muted highlights."
        }
        "pixar" | "3d_animation" => {
            "Stylized 3D animated feature look, soft global illumination, expressive proportions."
        }
        "watercolor" => "Hand-painted watercolor illustration, visible paper texture, soft bleeding edges.",
        _ => return None,
    };
    Some(text)
}

/// Camera and look for one shot after applying the fallback chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ShotSpec {
    pub style: String,
    pub camera: Option<String>,
    pub lens: Option<String>,
    pub angle: Option<String>,
    pub director: Option<DirectorStyle>,
}

/// Scene override, then group default, then project default.
pub fn resolve_shot(
    scene: &Scene,
    group: Option<&SceneGroup>,
    settings: &GenerationSettings,
) -> ShotSpec {
    let style = first_non_empty([
        scene.style_override.as_deref(),
        settings.custom_style_instruction.as_deref(),
        settings.style_preset.as_deref().and_then(style_preset),
    ])
    .unwrap_or(DEFAULT_STYLE)
    .to_string();

    let angle = first_non_empty([
        scene.camera_angle_override.as_deref(),
        group.and_then(|row| row.camera_angle.as_deref()),
        settings.camera_angle.as_deref(),
    ]);
    let lens = first_non_empty([
        scene.lens_override.as_deref(),
        group.and_then(|row| row.lens.as_deref()),
        settings.lens.as_deref(),
    ]);

    ShotSpec {
        style,
        camera: first_non_empty([settings.camera.as_deref()]).map(str::to_string),
        lens: lens.map(str::to_string),
        angle: angle.map(str::to_string),
        director: settings
            .director_style
            .clone()
            .filter(|style| !style.instruction.trim().is_empty()),
    }
}

fn first_non_empty<'a, const N: usize>(values: [Option<&'a str>; N]) -> Option<&'a str> {
    values
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scene_override_beats_group_and_project() {
        let mut scene = Scene::new("s1", 1);
        let group = SceneGroup {
            id: "g".to_string(),
            camera_angle: Some("low angle".to_string()),
            lens: Some("35mm".to_string()),
            ..SceneGroup::default()
        };
        let settings = GenerationSettings {
            camera_angle: Some("eye level".to_string()),
            lens: Some("50mm".to_string()),
            camera: Some("ARRI Alexa".to_string()),
            ..GenerationSettings::default()
        };

        let shot = resolve_shot(&scene, Some(&group), &settings);
        assert_eq!(shot.angle.as_deref(), Some("low angle"));
        assert_eq!(shot.lens.as_deref(), Some("35mm"));
        assert_eq!(shot.camera.as_deref(), Some("ARRI Alexa"));

        scene.camera_angle_override = Some("overhead".to_string());
        scene.lens_override = Some("  ".to_string());
        let shot = resolve_shot(&scene, Some(&group), &settings);
        assert_eq!(shot.angle.as_deref(), Some("overhead"));
        assert_eq!(shot.lens.as_deref(), Some("35mm"));

        let shot = resolve_shot(&scene, None, &settings);
        assert_eq!(shot.lens.as_deref(), Some("50mm"));
    }

    #[test]
    fn style_falls_back_from_custom_to_preset_to_default() {
        let scene = Scene::new("s1", 1);
        let mut settings = GenerationSettings {
            style_preset: Some("Film Noir".to_string()),
            ..GenerationSettings::default()
        };
        assert!(resolve_shot(&scene, None, &settings).style.contains("noir"));

        settings.custom_style_instruction = Some("Pastel storybook".to_string());
        assert_eq!(resolve_shot(&scene, None, &settings).style, "Pastel storybook");

        settings.custom_style_instruction = None;
        settings.style_preset = Some("unknown".to_string());
        assert_eq!(resolve_shot(&scene, None, &settings).style, DEFAULT_STYLE);
    }
}
