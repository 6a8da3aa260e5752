use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use raccord_contracts::models::ModelSelector;
use raccord_contracts::project::{ProjectAction, ProjectState, ProjectStore};
use raccord_engine::backends::default_backend_registry;
use raccord_engine::cascade::resolve_cascade_reference;
use raccord_engine::config::EngineConfig;
use raccord_engine::images::HttpReferenceLoader;
use raccord_engine::prompt::{PromptAssembler, PromptRequest};
use raccord_engine::{BatchOptions, GenerateOptions, SceneEngine, SceneOutcome};
use serde_json::{json, Value};

const DRYRUN_IMAGE_MODEL: &str = "dryrun-image-1";
const DRYRUN_VISION_MODEL: &str = "dryrun-vision-1";

#[derive(Debug, Parser)]
#[command(name = "raccord", version, about = "Continuity-aware batch scene generation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate scenes in order, checking continuity between shots.
    Batch(BatchArgs),
    /// Show which image would anchor a scene.
    Resolve(SceneArgs),
    /// Print the assembled prompt for a scene without generating.
    Prompt(PromptArgs),
    /// Clear a scene's continuity failure, and optionally its image.
    Reset(ResetArgs),
}

#[derive(Debug, Parser)]
struct BatchArgs {
    #[arg(long)]
    project: PathBuf,
    /// Artifact directory for images, receipts, histories and events.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Where to write the updated project; defaults to `--project`.
    #[arg(long)]
    save_to: Option<PathBuf>,
    #[arg(long, value_delimiter = ',')]
    scenes: Vec<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    delay_ms: Option<u64>,
    #[arg(long)]
    max_retries: Option<u32>,
    #[arg(long)]
    no_validate: bool,
    #[arg(long)]
    skip_existing: bool,
    /// Offline backends: flat-color frames and an always-passing validator.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Parser)]
struct SceneArgs {
    #[arg(long)]
    project: PathBuf,
    #[arg(long)]
    scene: String,
}

#[derive(Debug, Parser)]
struct PromptArgs {
    #[arg(long)]
    project: PathBuf,
    #[arg(long)]
    scene: String,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ResetArgs {
    #[arg(long)]
    project: PathBuf,
    #[arg(long)]
    scene: String,
    #[arg(long)]
    clear_image: bool,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("raccord error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Batch(args) => run_batch(args),
        Command::Resolve(args) => run_resolve(args),
        Command::Prompt(args) => run_prompt(args),
        Command::Reset(args) => run_reset(args),
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path),
        None => Ok(EngineConfig::from_env()),
    }
}

fn batch_config(args: &BatchArgs) -> Result<EngineConfig> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(out) = args.out.as_ref() {
        config.artifact_dir = Some(out.clone());
    }
    if let Some(delay_ms) = args.delay_ms {
        config.inter_scene_delay_ms = delay_ms;
    }
    if let Some(max_retries) = args.max_retries {
        config.max_continuity_retries = max_retries;
    }
    if args.no_validate {
        config.validate_continuity = false;
    }
    Ok(config)
}

fn apply_dry_run(state: &mut ProjectState) {
    state.settings.image_model = DRYRUN_IMAGE_MODEL.to_string();
    state.settings.vision_model = DRYRUN_VISION_MODEL.to_string();
}

fn run_batch(args: BatchArgs) -> Result<i32> {
    let config = batch_config(&args)?;
    let mut state = ProjectState::load(&args.project)?;
    if args.dry_run {
        apply_dry_run(&mut state);
    }
    let engine = SceneEngine::builder(state).config(config).build()?;
    let options = BatchOptions {
        scene_ids: (!args.scenes.is_empty()).then(|| args.scenes.clone()),
        skip_existing: args.skip_existing,
        generate: GenerateOptions {
            model_override: if args.dry_run {
                None
            } else {
                args.model.clone()
            },
            ..GenerateOptions::default()
        },
    };
    let report = engine.run_batch(&options);
    let delivered = engine.finish()?;
    tracing::debug!(delivered, "analytics drained");
    let report = report?;

    let save_to = args.save_to.as_deref().unwrap_or(&args.project);
    engine
        .snapshot()
        .save(save_to)
        .with_context(|| format!("failed saving project to {}", save_to.display()))?;

    for (scene_id, outcome) in &report.outcomes {
        match outcome {
            SceneOutcome::Failed { message, .. } => {
                println!("{scene_id}: {} ({message})", outcome.label());
            }
            _ => println!("{scene_id}: {}", outcome.label()),
        }
    }
    println!(
        "batch {}: {} generated, {} dop_failed, {} failed, {} skipped{}",
        report.batch_id,
        report.summary.generated,
        report.summary.dop_failed,
        report.summary.failed,
        report.summary.skipped,
        if report.cancelled { ", cancelled" } else { "" }
    );
    Ok(if report.cancelled { 2 } else { 0 })
}

fn resolve_payload(state: &ProjectState, scene_id: &str) -> Result<Value> {
    let scene = state
        .scene(scene_id)
        .with_context(|| format!("unknown scene '{scene_id}'"))?;
    Ok(match resolve_cascade_reference(scene, state) {
        Some(reference) => json!({
            "scene_id": scene_id,
            "source": reference.source.label(),
            "anchor_scene_id": reference.scene_id(),
            "image": raccord_engine::images::describe_reference(&reference.image),
        }),
        None => json!({ "scene_id": scene_id, "source": Value::Null }),
    })
}

fn run_resolve(args: SceneArgs) -> Result<i32> {
    let state = ProjectState::load(&args.project)?;
    let payload = resolve_payload(&state, &args.scene)?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(0)
}

fn run_prompt(args: PromptArgs) -> Result<i32> {
    let config = load_config(args.config.as_deref())?;
    let state = ProjectState::load(&args.project)?;
    let scene = state
        .scene(&args.scene)
        .with_context(|| format!("unknown scene '{}'", args.scene))?;
    let requested = args
        .model
        .as_deref()
        .unwrap_or(state.settings.image_model.as_str());
    let selection = ModelSelector::new(None)
        .select(Some(requested), "image")
        .map_err(anyhow::Error::msg)?;
    if let Some(reason) = selection.fallback_reason.as_deref() {
        tracing::warn!("{reason}");
    }
    let model = selection.model;
    let backend = default_backend_registry(&config)
        .get(&model.provider)
        .with_context(|| format!("no backend for provider '{}'", model.provider))?;

    let cascade = resolve_cascade_reference(scene, &state);
    let mut request = PromptRequest::new(scene, &state);
    request.layout = backend.prompt_layout();
    request.char_limit = config.prompt_char_limit(&model);
    request.reference_cap = config.reference_cap(&model);
    request.cascade = cascade.as_ref();
    let assembler = PromptAssembler::new(Arc::new(HttpReferenceLoader::new(
        config.request_timeout(),
    )));
    let prompt = assembler.assemble(&request);

    println!("{}", prompt.text);
    println!();
    for record in prompt.reference_records() {
        println!("[{}] {}", record.role, record.source);
    }
    for warning in &prompt.warnings {
        eprintln!("warning: {warning}");
    }
    Ok(0)
}

fn run_reset(args: ResetArgs) -> Result<i32> {
    let state = ProjectState::load(&args.project)?;
    if state.scene(&args.scene).is_none() {
        anyhow::bail!("unknown scene '{}'", args.scene);
    }
    let store = ProjectStore::new(state);
    if args.clear_image {
        store.dispatch(ProjectAction::ClearGeneratedImage {
            scene_id: args.scene.clone(),
        });
    }
    let next = store.dispatch(ProjectAction::ResetContinuity {
        scene_id: args.scene.clone(),
    });
    next.save(&args.project)?;
    println!("{}: reset", args.scene);
    Ok(0)
}

#[cfg(test)]
mod tests {
    use raccord_contracts::project::{Scene, SceneGroup};

    use super::*;

    fn project(path: &Path) -> Result<()> {
        let scenes = [1, 2, 3]
            .into_iter()
            .map(|number| Scene {
                group_id: Some("office".to_string()),
                context_description: format!("Scene {number}: the detective studies the wall of clues."),
                ..Scene::new(format!("s{number}"), number)
            })
            .collect();
        ProjectState {
            project_name: "Clues".to_string(),
            scenes,
            scene_groups: vec![SceneGroup {
                id: "office".to_string(),
                name: "Office".to_string(),
                ..SceneGroup::default()
            }],
            ..ProjectState::default()
        }
        .save(path)
    }

    #[test]
    fn batch_flags_parse_and_override_config() -> Result<()> {
        let cli = Cli::try_parse_from([
            "raccord",
            "batch",
            "--project",
            "p.json",
            "--scenes",
            "s1,s3",
            "--delay-ms",
            "0",
            "--max-retries",
            "2",
            "--no-validate",
            "--dry-run",
        ])?;
        let Command::Batch(args) = cli.command else {
            anyhow::bail!("expected batch");
        };
        assert_eq!(args.scenes, vec!["s1", "s3"]);
        let config = batch_config(&args)?;
        assert_eq!(config.inter_scene_delay_ms, 0);
        assert_eq!(config.max_continuity_retries, 2);
        assert!(!config.validate_continuity);
        Ok(())
    }

    #[test]
    fn dry_run_batch_updates_the_project() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("project.json");
        let out = temp.path().join("run");
        project(&path)?;

        let code = run_batch(BatchArgs {
            project: path.clone(),
            out: Some(out.clone()),
            save_to: None,
            scenes: Vec::new(),
            model: None,
            config: None,
            delay_ms: Some(0),
            max_retries: None,
            no_validate: false,
            skip_existing: false,
            dry_run: true,
        })?;
        assert_eq!(code, 0);

        let saved = ProjectState::load(&path)?;
        assert!(saved.scenes.iter().all(Scene::has_image));
        assert_eq!(saved.usage.total_images, 3);
        assert_eq!(saved.usage.by_provider.get("dryrun"), Some(&3));
        assert!(out.join("events.jsonl").exists());
        assert!(out.join("prompt_history.jsonl").exists());

        let anchor = resolve_payload(&saved, "s2")?;
        assert_eq!(anchor["source"], "preceding_scene");
        assert_eq!(anchor["anchor_scene_id"], "s1");
        Ok(())
    }

    #[test]
    fn reset_clears_continuity_failure() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("project.json");
        project(&path)?;
        let store = ProjectStore::new(ProjectState::load(&path)?);
        store.dispatch(ProjectAction::ContinuityFailed {
            scene_id: "s2".to_string(),
            error: "character: different face".to_string(),
        });
        store.snapshot().save(&path)?;

        run_reset(ResetArgs {
            project: path.clone(),
            scene: "s2".to_string(),
            clear_image: true,
        })?;
        let saved = ProjectState::load(&path)?;
        let scene = saved.scene("s2").expect("scene");
        assert!(!scene.dop_failed);
        assert!(scene.error.is_none());
        assert!(!scene.has_image());
        Ok(())
    }
}
