mod registry;
mod selectors;

pub use registry::{ModelRegistry, ModelSpec, PROVIDER_DRYRUN, PROVIDER_GEMINI, PROVIDER_GOMMO};
pub use selectors::{ModelSelection, ModelSelector};
