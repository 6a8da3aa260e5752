use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// One attached reference image, recorded by role and source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReferenceRecord {
    pub role: String,
    pub source: String,
}

impl ReferenceRecord {
    pub fn new(role: impl Into<String>, source: &str) -> Self {
        Self {
            role: role.into(),
            source: describe_source(source),
        }
    }
}

/// Everything needed to explain one generation attempt for one scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GenerationReceipt {
    pub scene_id: String,
    pub attempt: u32,
    pub model: String,
    pub provider: String,
    pub aspect_ratio: String,
    pub resolution: String,
    pub prompt: String,
    #[serde(default)]
    pub references: Vec<ReferenceRecord>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub image_path: Option<String>,
    pub media_id: Option<String>,
    pub duration_s: f64,
    pub created_at: String,
}

pub fn build_receipt(
    receipt: &GenerationReceipt,
    provider_request: &Map<String, Value>,
    validation: Option<&Value>,
) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert(
        "attempt".to_string(),
        serde_json::to_value(receipt).unwrap_or(Value::Null),
    );
    root.insert(
        "provider_request".to_string(),
        sanitize_payload(&Value::Object(provider_request.clone())),
    );
    root.insert(
        "validation".to_string(),
        validation.cloned().unwrap_or(Value::Null),
    );
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

/// Inline images are replaced by a size marker so receipts stay readable.
fn describe_source(source: &str) -> String {
    let trimmed = source.trim();
    if trimmed.starts_with("data:") {
        let mime = trimmed
            .trim_start_matches("data:")
            .split(';')
            .next()
            .unwrap_or("application/octet-stream");
        return format!("<inline {mime}, {} chars>", trimmed.len());
    }
    trimmed.to_string()
}

fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(_) | Value::Number(_) => value.clone(),
        Value::String(text) if text.starts_with("data:") => {
            Value::String(describe_source(text))
        }
        Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "data" | "image" | "image_bytes" | "inlinedata" | "inline_data"
                ) {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::*;

    #[test]
    fn receipt_writes_expected_shape_without_image_bytes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("receipt-s1-1.json");
        let receipt = GenerationReceipt {
            scene_id: "s1".to_string(),
            attempt: 1,
            model: "gemini-2.5-flash-image".to_string(),
            provider: "gemini".to_string(),
            aspect_ratio: "16:9".to_string(),
            resolution: "1K".to_string(),
            prompt: "a detective in the rain".to_string(),
            references: vec![ReferenceRecord::new(
                "character_face",
                "data:image/png;base64,AAAA",
            )],
            warnings: vec!["reference omitted".to_string()],
            image_path: Some("scene-s1.png".to_string()),
            media_id: None,
            duration_s: 3.2,
            created_at: "2026-01-01T00:00:00Z".to_string(),
        };
        let mut provider_request = Map::new();
        provider_request.insert(
            "parts".to_string(),
            json!([{ "text": "hi" }, { "inlineData": { "data": "AAAA" } }]),
        );
        let validation = json!({ "isValid": true });

        write_receipt(
            &path,
            &build_receipt(&receipt, &provider_request, Some(&validation)),
        )?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(parsed["schema_version"], json!(RECEIPT_SCHEMA_VERSION));
        assert_eq!(parsed["attempt"]["scene_id"], json!("s1"));
        assert_eq!(
            parsed["attempt"]["references"][0]["source"],
            json!("<inline image/png, 26 chars>")
        );
        assert_eq!(
            parsed["provider_request"]["parts"][1]["inlineData"],
            json!("<omitted>")
        );
        assert_eq!(parsed["validation"]["isValid"], json!(true));
        Ok(())
    }
}
