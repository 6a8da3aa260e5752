use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Appends successful prompts to a JSONL log so later runs can learn from
/// what worked.
#[derive(Debug, Clone)]
pub struct PromptHistoryWriter {
    path: PathBuf,
    project: String,
}

impl PromptHistoryWriter {
    pub fn new(path: impl Into<PathBuf>, project: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            project: project.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(
        &self,
        scene_id: &str,
        model: &str,
        prompt: &str,
        outcome: &str,
        note: Option<&str>,
    ) -> anyhow::Result<Map<String, Value>> {
        let mut payload = Map::new();
        payload.insert("ts".to_string(), Value::String(now_utc_iso()));
        payload.insert("project".to_string(), Value::String(self.project.clone()));
        payload.insert("scene_id".to_string(), Value::String(scene_id.to_string()));
        payload.insert("model".to_string(), Value::String(model.to_string()));
        payload.insert("prompt".to_string(), Value::String(prompt.to_string()));
        payload.insert("outcome".to_string(), Value::String(outcome.to_string()));
        payload.insert(
            "note".to_string(),
            note.map(|value| Value::String(value.to_string()))
                .unwrap_or(Value::Null),
        );

        append_jsonl(&self.path, &payload)?;
        Ok(payload)
    }
}

fn append_jsonl(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    use std::io::Write;
    file.write_all(serde_json::to_string(payload)?.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
