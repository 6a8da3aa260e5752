use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use raccord_contracts::models::PROVIDER_GOMMO;
use raccord_contracts::project::ProviderCredentials;
use serde_json::{json, Map, Value};

use super::http::HttpTransport;
use super::{GenerationBackend, GenerationOutput, GenerationRequest, OutputLayout};
use crate::config::EngineConfig;
use crate::error::GenerationError;
use crate::non_empty_env;
use crate::prompt::{PromptLayout, ReferenceRole, ReferenceSegment};

const SUBJECT_PREFIX: &str =
    "Use the attached subject images as the identity reference for the characters: match faces, hair and outfits exactly.";

/// Adds a scheme when missing and drops trailing slashes.
pub fn normalize_domain(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

/// Identity views go first; the backend only accepts a few subjects.
fn subject_rank(role: ReferenceRole) -> u8 {
    match role {
        ReferenceRole::CharacterFace => 0,
        ReferenceRole::CharacterOutfit => 1,
        ReferenceRole::BaseCanvas => 2,
        ReferenceRole::DnaReference => 3,
        ReferenceRole::ContinuityAnchor => 4,
        ReferenceRole::CascadeAnchor => 5,
        ReferenceRole::Environment => 6,
        ReferenceRole::StyleReference => 7,
    }
}

fn select_subjects(references: &[ReferenceSegment], max: usize) -> (Vec<&ReferenceSegment>, usize) {
    let mut ranked: Vec<&ReferenceSegment> = references.iter().collect();
    ranked.sort_by_key(|segment| subject_rank(segment.role));
    let dropped = ranked.len().saturating_sub(max);
    ranked.truncate(max);
    (ranked, dropped)
}

fn subject_legend(subjects: &[&ReferenceSegment]) -> Option<String> {
    if subjects.is_empty() {
        return None;
    }
    let lines: Vec<String> = subjects
        .iter()
        .enumerate()
        .map(|(idx, segment)| format!("Subject {}: {}", idx + 1, segment.label))
        .collect();
    Some(lines.join("\n"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum JobStatus {
    Pending,
    Done { url: String },
    Failed { message: String },
}

fn parse_job_status(payload: &Value) -> JobStatus {
    let body = payload.get("data").unwrap_or(payload);
    let status = body
        .get("status")
        .and_then(Value::as_str)
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    let url = body
        .get("url")
        .or_else(|| body.get("image_url"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty());
    match (status.as_str(), url) {
        ("failed" | "error" | "cancelled", _) => JobStatus::Failed {
            message: body
                .get("error")
                .or_else(|| body.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("job failed")
                .to_string(),
        },
        (_, Some(url)) => JobStatus::Done {
            url: url.to_string(),
        },
        _ => JobStatus::Pending,
    }
}

fn job_id(payload: &Value) -> Option<String> {
    let body = payload.get("data").unwrap_or(payload);
    body.get("job_id")
        .or_else(|| body.get("id"))
        .and_then(|value| match value {
            Value::String(raw) => Some(raw.trim().to_string()),
            Value::Number(raw) => Some(raw.to_string()),
            _ => None,
        })
        .filter(|value| !value.is_empty())
}

/// Job-based backend authenticated by a domain plus access token.
///
/// `POST {domain}/ai/image/create` submits the job with up to
/// `gommo_max_subjects` subject images; `POST {domain}/ai/image/status`
/// is polled until the job reports a result URL.
pub struct GommoBackend {
    transport: HttpTransport,
    max_subjects: usize,
    poll_interval: Duration,
    poll_max_attempts: u32,
}

impl GommoBackend {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            transport: HttpTransport::new(config),
            max_subjects: config.gommo_max_subjects,
            poll_interval: config.poll_interval(),
            poll_max_attempts: config.poll_max_attempts.max(1),
        }
    }

    fn credentials(credentials: &ProviderCredentials) -> Result<(String, String)> {
        let domain = credentials
            .gommo_domain
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .or_else(|| non_empty_env("GOMMO_DOMAIN"));
        let token = credentials
            .gommo_access_token
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .or_else(|| non_empty_env("GOMMO_ACCESS_TOKEN"));
        match (domain, token) {
            (Some(domain), Some(token)) => Ok((normalize_domain(&domain), token)),
            (domain, _) => Err(GenerationError::ProviderConfig {
                provider: PROVIDER_GOMMO.to_string(),
                message: if domain.is_none() {
                    "domain is missing (set GOMMO_DOMAIN or project settings)".to_string()
                } else {
                    "access token is missing (set GOMMO_ACCESS_TOKEN or project settings)".to_string()
                },
            }
            .into()),
        }
    }

    fn build_payload(
        request: &GenerationRequest<'_>,
        token: &str,
        subjects: &[&ReferenceSegment],
    ) -> Map<String, Value> {
        let mut prompt = String::new();
        if !subjects.is_empty() {
            prompt.push_str(SUBJECT_PREFIX);
            prompt.push('\n');
            if let Some(legend) = subject_legend(subjects) {
                prompt.push_str(&legend);
                prompt.push_str("\n\n");
            }
        }
        prompt.push_str(&request.prompt.text);

        let mut payload = Map::new();
        payload.insert("access_token".to_string(), Value::String(token.to_string()));
        payload.insert(
            "model".to_string(),
            Value::String(
                request
                    .model
                    .name
                    .trim_start_matches("gommo-")
                    .to_string(),
            ),
        );
        payload.insert("prompt".to_string(), Value::String(prompt));
        payload.insert(
            "ratio".to_string(),
            Value::String(request.aspect_ratio.to_string()),
        );
        payload.insert(
            "resolution".to_string(),
            Value::String(request.resolution.to_string()),
        );
        payload.insert(
            "subjects".to_string(),
            Value::Array(
                subjects
                    .iter()
                    .map(|segment| json!({ "image": segment.image.to_data_url() }))
                    .collect(),
            ),
        );
        payload
    }

    fn poll(&self, domain: &str, token: &str, job: &str, warnings: &mut Vec<String>) -> Result<String> {
        let endpoint = format!("{domain}/ai/image/status");
        let payload = json!({ "access_token": token, "job_id": job });
        for _ in 0..self.poll_max_attempts {
            thread::sleep(self.poll_interval);
            let response = self
                .transport
                .post_json("Gommo", &endpoint, &[], &payload, warnings)
                .with_context(|| format!("Gommo status poll failed for job {job}"))?;
            match parse_job_status(&response) {
                JobStatus::Done { url } => return Ok(url),
                JobStatus::Failed { message } => {
                    return Err(GenerationError::from_status(PROVIDER_GOMMO, 200, &message).into())
                }
                JobStatus::Pending => {}
            }
        }
        Err(GenerationError::Provider {
            provider: PROVIDER_GOMMO.to_string(),
            message: format!(
                "job {job} still pending after {} polls",
                self.poll_max_attempts
            ),
        }
        .into())
    }
}

impl GenerationBackend for GommoBackend {
    fn name(&self) -> &str {
        PROVIDER_GOMMO
    }

    fn prompt_layout(&self) -> PromptLayout {
        PromptLayout::StyleFirst
    }

    fn generate(&self, request: &GenerationRequest<'_>) -> Result<GenerationOutput> {
        let (domain, token) = Self::credentials(request.credentials)?;
        let mut warnings = Vec::new();
        let (subjects, dropped) = select_subjects(&request.prompt.references, self.max_subjects);
        if dropped > 0 {
            warnings.push(format!(
                "Gommo accepts {} subject images; dropped {dropped} lower-priority references.",
                self.max_subjects
            ));
        }
        let payload = Self::build_payload(request, &token, &subjects);
        let endpoint = format!("{domain}/ai/image/create");
        let response = self
            .transport
            .post_json("Gommo", &endpoint, &[], &Value::Object(payload.clone()), &mut warnings)
            .with_context(|| format!("Gommo job submission failed for scene {}", request.scene_id))?;
        if response.get("success").and_then(Value::as_bool) == Some(false) {
            let message = response
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("job rejected");
            return Err(GenerationError::from_status(PROVIDER_GOMMO, 200, message).into());
        }

        let job = job_id(&response);
        let url = match (parse_job_status(&response), job.as_deref()) {
            (JobStatus::Done { url }, _) => url,
            (JobStatus::Failed { message }, _) => {
                return Err(GenerationError::from_status(PROVIDER_GOMMO, 200, &message).into())
            }
            (JobStatus::Pending, Some(job)) => self.poll(&domain, &token, job, &mut warnings)?,
            (JobStatus::Pending, None) => {
                return Err(GenerationError::NoImageReturned {
                    provider: PROVIDER_GOMMO.to_string(),
                }
                .into())
            }
        };
        let image = self.transport.download("Gommo", &url)?;

        let mut provider_request = Map::new();
        provider_request.insert("endpoint".to_string(), Value::String(endpoint));
        let mut logged = payload;
        logged.remove("access_token");
        provider_request.insert("payload".to_string(), Value::Object(logged));
        Ok(GenerationOutput {
            image,
            media_id: job,
            layout: if request.model.grid_output {
                OutputLayout::Grid2x2
            } else {
                OutputLayout::Single
            },
            provider_request,
            warnings,
        })
    }
}
