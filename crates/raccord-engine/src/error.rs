use raccord_contracts::project::FailureKind;

use crate::error_chain_text;

/// Failures the engine distinguishes. They travel inside `anyhow::Error`
/// and are recovered with `downcast_ref` at the orchestrator boundary.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("{provider} rate limited the request: {message}")]
    TransientProvider { provider: String, message: String },
    #[error("{provider} rejected the credentials: {message}")]
    FatalAuth { provider: String, message: String },
    #[error("{provider} is not configured: {message}")]
    ProviderConfig { provider: String, message: String },
    #[error("{provider} responded without an image")]
    NoImageReturned { provider: String },
    #[error("continuity validation failed: {0}")]
    ContinuityValidation(String),
    #[error("reference image {reference} could not be loaded: {reason}")]
    ReferenceLoad { reference: String, reason: String },
    #[error("{provider} request failed: {message}")]
    Provider { provider: String, message: String },
}

impl GenerationError {
    /// Maps an HTTP failure to the taxonomy: 429 is transient, 401/403 are
    /// fatal, anything else is classified from the response body.
    pub fn from_status(provider: &str, code: u16, body: &str) -> Self {
        let provider = provider.to_string();
        let message = format!("({code}) {body}");
        match code {
            429 => Self::TransientProvider { provider, message },
            401 | 403 => Self::FatalAuth { provider, message },
            _ => match classify_error_text(&message) {
                FailureKind::RateLimited => Self::TransientProvider { provider, message },
                FailureKind::FatalAuth => Self::FatalAuth { provider, message },
                _ => Self::Provider { provider, message },
            },
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::TransientProvider { .. } => FailureKind::RateLimited,
            Self::FatalAuth { .. } => FailureKind::FatalAuth,
            Self::ProviderConfig { .. } => FailureKind::ProviderConfig,
            Self::NoImageReturned { .. } => FailureKind::NoImage,
            Self::ContinuityValidation(_) => FailureKind::DopUnfixable,
            Self::ReferenceLoad { .. } | Self::Provider { .. } => FailureKind::Other,
        }
    }
}

/// Decides how a generation failure should be treated.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, err: &anyhow::Error) -> FailureKind;
}

/// Typed errors win; otherwise the error text is matched against known
/// provider phrasing.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicErrorClassifier;

impl ErrorClassifier for HeuristicErrorClassifier {
    fn classify(&self, err: &anyhow::Error) -> FailureKind {
        if let Some(typed) = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<GenerationError>())
        {
            return typed.failure_kind();
        }
        classify_error_text(&error_chain_text(err, 4096))
    }
}

const AUTH_MARKERS: &[&str] = &[
    "api key",
    "api_key",
    "apikey",
    "credentials",
    "permission",
    "unauthorized",
    "unauthenticated",
    "401",
    "403",
];

const RATE_LIMIT_MARKERS: &[&str] = &[
    "429",
    "quota",
    "rate limit",
    "rate-limit",
    "resource exhausted",
    "resource_exhausted",
    "too many requests",
];

/// Auth markers are checked first: a rejected key must stop the batch even
/// when the provider also mentions quota.
pub fn classify_error_text(text: &str) -> FailureKind {
    let lowered = text.to_ascii_lowercase();
    if AUTH_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return FailureKind::FatalAuth;
    }
    if RATE_LIMIT_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return FailureKind::RateLimited;
    }
    FailureKind::Other
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn text_rules_match_provider_phrasing() {
        assert_eq!(
            classify_error_text("Gemini request failed (400): API key not valid"),
            FailureKind::FatalAuth
        );
        assert_eq!(
            classify_error_text("invalid api key"),
            FailureKind::FatalAuth
        );
        assert_eq!(
            classify_error_text("RESOURCE_EXHAUSTED: quota exceeded"),
            FailureKind::RateLimited
        );
        assert_eq!(
            classify_error_text("status 429 Too Many Requests"),
            FailureKind::RateLimited
        );
        assert_eq!(classify_error_text("socket closed"), FailureKind::Other);
    }

    #[test]
    fn typed_error_wins_over_text() {
        let err = anyhow::Error::new(GenerationError::ProviderConfig {
            provider: "gommo".to_string(),
            message: "missing access token and credentials".to_string(),
        })
        .context("scene s1 failed");
        assert_eq!(
            HeuristicErrorClassifier.classify(&err),
            FailureKind::ProviderConfig
        );
    }

    #[test]
    fn untyped_chain_is_classified_by_text() {
        let err: anyhow::Error = Err::<(), _>(anyhow::anyhow!("permission denied for project"))
            .context("generation failed")
            .unwrap_err();
        assert_eq!(HeuristicErrorClassifier.classify(&err), FailureKind::FatalAuth);
    }

    #[test]
    fn status_codes_map_to_taxonomy() {
        assert_eq!(
            GenerationError::from_status("gemini", 429, "slow down").failure_kind(),
            FailureKind::RateLimited
        );
        assert_eq!(
            GenerationError::from_status("gemini", 403, "nope").failure_kind(),
            FailureKind::FatalAuth
        );
        assert_eq!(
            GenerationError::from_status("gemini", 400, "API key not valid").failure_kind(),
            FailureKind::FatalAuth
        );
        assert_eq!(
            GenerationError::from_status("gemini", 500, "boom").failure_kind(),
            FailureKind::Other
        );
    }
}
