use anyhow::Result;
use image::{DynamicImage, Rgb, RgbImage};
use raccord_contracts::models::PROVIDER_DRYRUN;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use super::{GenerationBackend, GenerationOutput, GenerationRequest, OutputLayout};
use crate::images::encode_png;
use crate::prompt::PromptLayout;

/// Offline backend: a flat color derived from the prompt hash, so reruns
/// are reproducible and prompt changes are visible.
#[derive(Debug, Clone)]
pub struct DryrunBackend {
    width: u32,
}

impl Default for DryrunBackend {
    fn default() -> Self {
        Self { width: 160 }
    }
}

impl DryrunBackend {
    fn dims(&self, aspect_ratio: &str) -> (u32, u32) {
        let ratio = aspect_ratio
            .split_once(':')
            .and_then(|(w, h)| Some((w.trim().parse::<f64>().ok()?, h.trim().parse::<f64>().ok()?)))
            .filter(|(w, h)| *w > 0.0 && *h > 0.0)
            .map(|(w, h)| w / h)
            .unwrap_or(16.0 / 9.0);
        let height = ((self.width as f64) / ratio).round().max(2.0) as u32;
        (self.width, height)
    }
}

fn color_from_prompt(prompt: &str, salt: u64) -> Rgb<u8> {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(salt.to_be_bytes());
    let digest = hasher.finalize();
    Rgb([digest[0], digest[1], digest[2]])
}

fn short_id(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hex::encode(&hasher.finalize()[..4])
}

impl GenerationBackend for DryrunBackend {
    fn name(&self) -> &str {
        PROVIDER_DRYRUN
    }

    fn prompt_layout(&self) -> PromptLayout {
        PromptLayout::SubjectFirst
    }

    fn generate(&self, request: &GenerationRequest<'_>) -> Result<GenerationOutput> {
        let (width, height) = self.dims(request.aspect_ratio);
        let prompt = &request.prompt.text;
        let grid = request.model.grid_output;
        let canvas = if grid {
            RgbImage::from_fn(width * 2, height * 2, |x, y| {
                let cell = (y / height) * 2 + (x / width);
                color_from_prompt(prompt, u64::from(cell))
            })
        } else {
            RgbImage::from_pixel(width, height, color_from_prompt(prompt, 0))
        };
        let image = encode_png(&DynamicImage::ImageRgb8(canvas))?;

        let roles: Vec<&str> = request
            .prompt
            .references
            .iter()
            .map(|segment| segment.role.as_str())
            .collect();
        let mut provider_request = Map::new();
        provider_request.insert("endpoint".to_string(), Value::String("dryrun-native".to_string()));
        provider_request.insert(
            "payload".to_string(),
            json!({
                "model": request.model.name,
                "prompt": prompt,
                "aspect_ratio": request.aspect_ratio,
                "resolution": request.resolution,
                "references": roles,
            }),
        );
        Ok(GenerationOutput {
            image,
            media_id: Some(format!("dryrun-{}", short_id(prompt))),
            layout: if grid {
                OutputLayout::Grid2x2
            } else {
                OutputLayout::Single
            },
            provider_request,
            warnings: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use raccord_contracts::models::ModelRegistry;
    use raccord_contracts::project::ProviderCredentials;

    use super::*;
    use crate::prompt::AssembledPrompt;

    fn prompt(text: &str) -> AssembledPrompt {
        AssembledPrompt {
            text: text.to_string(),
            references: Vec::new(),
            warnings: Vec::new(),
            truncated: false,
        }
    }

    #[test]
    fn same_prompt_gives_same_image() -> anyhow::Result<()> {
        let registry = ModelRegistry::new(None);
        let model = registry.get("dryrun-image-1").expect("model");
        let credentials = ProviderCredentials::default();
        let first_prompt = prompt("scene one");
        let request = GenerationRequest {
            scene_id: "s1",
            model,
            prompt: &first_prompt,
            aspect_ratio: "16:9",
            resolution: "1K",
            credentials: &credentials,
        };
        let backend = DryrunBackend::default();
        let a = backend.generate(&request)?;
        let b = backend.generate(&request)?;
        assert_eq!(a.image, b.image);
        assert_eq!(a.layout, OutputLayout::Single);

        let decoded = image::load_from_memory(&a.image.decode()?)?;
        assert_eq!((decoded.width(), decoded.height()), (160, 90));

        let other_prompt = prompt("scene two");
        let other = backend.generate(&GenerationRequest {
            prompt: &other_prompt,
            ..request
        })?;
        assert_ne!(other.image, a.image);
        Ok(())
    }

    #[test]
    fn grid_models_return_a_montage() -> anyhow::Result<()> {
        let mut model = ModelRegistry::new(None)
            .get("dryrun-image-1")
            .cloned()
            .expect("model");
        model.grid_output = true;
        let credentials = ProviderCredentials::default();
        let text = prompt("montage");
        let output = DryrunBackend::default().generate(&GenerationRequest {
            scene_id: "s1",
            model: &model,
            prompt: &text,
            aspect_ratio: "1:1",
            resolution: "1K",
            credentials: &credentials,
        })?;
        assert_eq!(output.layout, OutputLayout::Grid2x2);
        let (_, alternates) = output.into_frames("s1");
        assert_eq!(alternates.len(), 3);
        Ok(())
    }
}
