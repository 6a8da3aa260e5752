use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

use crate::config::EngineConfig;
use crate::error::GenerationError;
use crate::images::InlineImage;
use crate::{push_unique_warning, truncate_text};

/// Blocking JSON transport shared by the provider backends.
#[derive(Debug, Clone)]
pub(crate) struct HttpTransport {
    http: HttpClient,
    timeout: Duration,
    retries: usize,
    backoff_s: f64,
}

impl HttpTransport {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        Self {
            http: HttpClient::new(),
            timeout: config.request_timeout(),
            retries: config.transport_retries.min(4),
            backoff_s: 1.2,
        }
    }

    pub(crate) fn post_json(
        &self,
        provider: &str,
        endpoint: &str,
        query: &[(&str, &str)],
        payload: &Value,
        warnings: &mut Vec<String>,
    ) -> Result<Value> {
        let response = self.send_with_retries(provider, endpoint, warnings, || {
            self.http
                .post(endpoint)
                .query(query)
                .timeout(self.timeout)
                .json(payload)
        })?;
        response_json_or_error(provider, response)
    }

    /// Transport failures (connect, timeout) are retried with linear
    /// backoff; HTTP error statuses are not.
    fn send_with_retries(
        &self,
        provider: &str,
        endpoint: &str,
        warnings: &mut Vec<String>,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<HttpResponse> {
        let mut attempt = 0;
        loop {
            match build().send() {
                Ok(response) => return Ok(response),
                Err(raw) => {
                    let err = anyhow::Error::new(raw)
                        .context(format!("{provider} request failed ({endpoint})"));
                    if !is_retryable_transport_error(&err) || attempt >= self.retries {
                        return Err(err);
                    }
                    attempt += 1;
                    push_unique_warning(
                        warnings,
                        format!(
                            "{provider} transport retry {attempt}/{} after transient request failure.",
                            self.retries
                        ),
                    );
                    thread::sleep(Duration::from_secs_f64(self.backoff_s * attempt as f64));
                }
            }
        }
    }

    pub(crate) fn download(&self, provider: &str, url: &str) -> Result<InlineImage> {
        let response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .with_context(|| format!("failed downloading {provider} image ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(GenerationError::from_status(provider, code, &truncate_text(&body, 512)).into());
        }
        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .with_context(|| format!("failed reading {provider} image bytes"))?;
        Ok(InlineImage::from_bytes(&bytes, mime_type.as_deref()))
    }
}

pub(crate) fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        return Err(GenerationError::from_status(provider, code, &truncate_text(&body, 512)).into());
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| {
                reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request()
            })
            .unwrap_or(false)
    })
}
