use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use raccord_contracts::models::ModelSpec;
use serde::Deserialize;

use crate::non_empty_env;

/// Engine tunables. Provider limits live here rather than in code because
/// they are facts about external models, not design invariants.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_prompt_chars: usize,
    pub max_reference_images: usize,
    pub gommo_max_subjects: usize,
    pub max_continuity_retries: u32,
    pub inter_scene_delay_ms: u64,
    pub gallery_limit: usize,
    pub validate_continuity: bool,
    pub poll_interval_ms: u64,
    pub poll_max_attempts: u32,
    pub request_timeout_s: f64,
    pub transport_retries: usize,
    pub artifact_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_prompt_chars: 12_000,
            max_reference_images: 14,
            gommo_max_subjects: 3,
            max_continuity_retries: 1,
            inter_scene_delay_ms: 1_500,
            gallery_limit: 40,
            validate_continuity: true,
            poll_interval_ms: 2_000,
            poll_max_attempts: 60,
            request_timeout_s: 120.0,
            transport_retries: 2,
            artifact_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Reads a JSON config file, then applies the environment overlay.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Some(value) = env_parse("RACCORD_MAX_PROMPT_CHARS") {
            self.max_prompt_chars = value;
        }
        if let Some(value) = env_parse("RACCORD_MAX_REFERENCE_IMAGES") {
            self.max_reference_images = value;
        }
        if let Some(value) = env_parse("RACCORD_MAX_CONTINUITY_RETRIES") {
            self.max_continuity_retries = value;
        }
        if let Some(value) = env_parse("RACCORD_INTER_SCENE_DELAY_MS") {
            self.inter_scene_delay_ms = value;
        }
        if let Some(value) = non_empty_env("RACCORD_ARTIFACT_DIR") {
            self.artifact_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = non_empty_env("RACCORD_VALIDATE_CONTINUITY") {
            self.validate_continuity = !matches!(
                value.to_ascii_lowercase().as_str(),
                "0" | "false" | "no" | "off"
            );
        }
    }

    pub fn prompt_char_limit(&self, model: &ModelSpec) -> usize {
        model
            .prompt_char_limit
            .map(|limit| limit.min(self.max_prompt_chars))
            .unwrap_or(self.max_prompt_chars)
    }

    pub fn reference_cap(&self, model: &ModelSpec) -> usize {
        model
            .max_reference_images
            .map(|cap| cap.min(self.max_reference_images))
            .unwrap_or(self.max_reference_images)
    }

    pub fn inter_scene_delay(&self) -> Duration {
        Duration::from_millis(self.inter_scene_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_s.clamp(5.0, 600.0))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    non_empty_env(key).and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use raccord_contracts::models::ModelRegistry;

    use super::*;

    #[test]
    fn partial_json_keeps_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "max_prompt_chars": 500, "inter_scene_delay_ms": 0 }"#,
        )?;
        let config = EngineConfig::load(&path)?;
        assert_eq!(config.max_prompt_chars, 500);
        assert_eq!(config.inter_scene_delay(), Duration::ZERO);
        assert_eq!(config.max_reference_images, 14);
        assert_eq!(config.max_continuity_retries, 1);
        Ok(())
    }

    #[test]
    fn model_limits_only_tighten_config() {
        let registry = ModelRegistry::new(None);
        let config = EngineConfig::default();
        let gommo = registry.get("gommo-imagen-4").expect("gommo model");
        let gemini = registry.get("gemini-2.5-flash-image").expect("gemini model");
        assert_eq!(config.reference_cap(gommo), 3);
        assert_eq!(config.reference_cap(gemini), 14);
        assert_eq!(config.prompt_char_limit(gommo), 4000);

        let tight = EngineConfig {
            max_prompt_chars: 1000,
            ..EngineConfig::default()
        };
        assert_eq!(tight.prompt_char_limit(gommo), 1000);
    }
}
