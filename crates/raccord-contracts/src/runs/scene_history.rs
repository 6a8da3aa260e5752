use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use similar::TextDiff;
use uuid::Uuid;

/// One generation attempt for a scene, with the prompt delta against the
/// previous attempt of the same scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptEntry {
    pub attempt_id: String,
    pub attempt: u32,
    pub model: String,
    pub prompt: String,
    pub prompt_diff: Option<Vec<String>>,
    pub correction: Option<String>,
    pub outcome: String,
    pub recorded_at: String,
}

/// Per-scene attempt log persisted as `scene_history.json`.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneHistory {
    pub path: PathBuf,
    pub schema_version: u64,
    pub history_id: String,
    pub created_at: String,
    pub scenes: BTreeMap<String, Vec<AttemptEntry>>,
}

impl SceneHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schema_version: 1,
            history_id: Uuid::new_v4().to_string(),
            created_at: now_utc_iso(),
            scenes: BTreeMap::new(),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut history = Self::new(path.clone());
        let payload = read_json(&path).unwrap_or(Value::Object(Map::new()));
        let Some(obj) = payload.as_object() else {
            return history;
        };

        history.schema_version = obj
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or(history.schema_version);
        history.history_id = obj
            .get("history_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(history.history_id);
        history.created_at = obj
            .get("created_at")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(history.created_at);

        if let Some(scenes) = obj.get("scenes").and_then(Value::as_object) {
            for (scene_id, rows) in scenes {
                let attempts = rows
                    .as_array()
                    .map(|rows| {
                        rows.iter()
                            .filter_map(|row| {
                                serde_json::from_value::<AttemptEntry>(row.clone()).ok()
                            })
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                history.scenes.insert(scene_id.clone(), attempts);
            }
        }
        history
    }

    pub fn attempts(&self, scene_id: &str) -> &[AttemptEntry] {
        self.scenes
            .get(scene_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn add_attempt(
        &mut self,
        scene_id: &str,
        model: &str,
        prompt: &str,
        correction: Option<&str>,
        outcome: &str,
    ) -> AttemptEntry {
        let rows = self.scenes.entry(scene_id.to_string()).or_default();
        let prompt_diff = prompt_diff(rows.last().map(|row| row.prompt.as_str()), prompt);
        let entry = AttemptEntry {
            attempt_id: Uuid::new_v4().to_string(),
            attempt: rows.len() as u32 + 1,
            model: model.to_string(),
            prompt: prompt.to_string(),
            prompt_diff,
            correction: correction.map(str::to_string),
            outcome: outcome.to_string(),
            recorded_at: now_utc_iso(),
        };
        rows.push(entry.clone());
        entry
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let mut payload = Map::new();
        payload.insert(
            "schema_version".to_string(),
            Value::Number(self.schema_version.into()),
        );
        payload.insert(
            "history_id".to_string(),
            Value::String(self.history_id.clone()),
        );
        payload.insert(
            "created_at".to_string(),
            Value::String(self.created_at.clone()),
        );
        payload.insert("scenes".to_string(), serde_json::to_value(&self.scenes)?);

        write_json(&self.path, Value::Object(payload))
    }
}

fn prompt_diff(prev: Option<&str>, curr: &str) -> Option<Vec<String>> {
    let prev = prev?;
    let diff = TextDiff::from_lines(prev, curr);
    let rendered = diff.unified_diff().header("prev", "curr").to_string();
    let lines = rendered
        .lines()
        .map(str::to_string)
        .collect::<Vec<String>>();
    Some(lines)
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json(path: &Path, payload: Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&payload)?)?;
    Ok(())
}
