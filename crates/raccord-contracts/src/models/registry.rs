use indexmap::IndexMap;

pub const PROVIDER_GEMINI: &str = "gemini";
pub const PROVIDER_GOMMO: &str = "gommo";
pub const PROVIDER_DRYRUN: &str = "dryrun";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    /// Tighter reference-image cap than the engine default, if the backend has one.
    pub max_reference_images: Option<usize>,
    /// Tighter prompt length guard than the engine default.
    pub prompt_char_limit: Option<usize>,
    /// The model answers with a 2x2 montage instead of a single frame.
    pub grid_output: bool,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

/// Static model id → provider lookup table.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name.trim())
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }

    pub fn provider_for(&self, name: &str) -> Option<&str> {
        self.get(name).map(|model| model.provider.as_str())
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str,
                      provider: &str,
                      capabilities: &[&str],
                      max_reference_images: Option<usize>,
                      prompt_char_limit: Option<usize>,
                      grid_output: bool| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
                max_reference_images,
                prompt_char_limit,
                grid_output,
            },
        );
    };

    insert(
        "gemini-2.5-flash-image",
        PROVIDER_GEMINI,
        &["image", "edit"],
        None,
        None,
        false,
    );
    insert(
        "gemini-3-pro-image-preview",
        PROVIDER_GEMINI,
        &["image", "edit"],
        None,
        None,
        false,
    );
    insert(
        "gemini-2.5-flash",
        PROVIDER_GEMINI,
        &["text", "vision"],
        None,
        None,
        false,
    );
    insert(
        "gemini-2.5-pro",
        PROVIDER_GEMINI,
        &["text", "vision"],
        None,
        None,
        false,
    );
    insert(
        "gommo-imagen-4",
        PROVIDER_GOMMO,
        &["image"],
        Some(3),
        Some(4000),
        false,
    );
    insert(
        "gommo-seedream-4",
        PROVIDER_GOMMO,
        &["image", "edit"],
        Some(3),
        Some(4000),
        false,
    );
    insert(
        "gommo-midjourney-7",
        PROVIDER_GOMMO,
        &["image"],
        Some(3),
        Some(4000),
        true,
    );
    insert(
        "dryrun-image-1",
        PROVIDER_DRYRUN,
        &["image", "edit"],
        None,
        None,
        false,
    );
    insert(
        "dryrun-vision-1",
        PROVIDER_DRYRUN,
        &["text", "vision"],
        None,
        None,
        false,
    );

    map
}
