use thiserror::Error;

pub type Result<T, E = NovelGenError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum NovelGenError {
    #[error("Configuration incomplete: {0}")] Configuration(String),
    #[error("Unsupported provider: {0}")] UnsupportedProvider(String),
    #[error("No AI provider selected")] NoActiveProvider,
    #[error("Invalid novel data: {0}")] Validation(String),
    #[error("{provider} request failed{}: {body}", status_suffix(.status))]
    Provider {
        provider: String,
        status: Option<u16>,
        body: String,
    },
    #[error("Persistence failure: {0}")] Persistence(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl NovelGenError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CFG-1001",
            Self::UnsupportedProvider(_) => "AI-1001",
            Self::NoActiveProvider => "AI-1002",
            Self::Validation(_) => "NOV-1001",
            Self::Provider { .. } => "AI-2001",
            Self::Persistence(_) => "NOV-2001",
        }
    }
    pub fn explain(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "A required connection parameter was missing after resolving explicit values, the config store and defaults.",
            Self::UnsupportedProvider(_) => "The provider name is not built in and no custom profile carries that name.",
            Self::NoActiveProvider => "Generation was requested before a provider was selected.",
            Self::Validation(_) => "The volume or chapter addressed does not exist or is not a structured record.",
            Self::Provider { .. } => "The provider returned an error status, the transport failed, or the reply could not be parsed.",
            Self::Persistence(_) => "A project or template file could not be read or written.",
        }
    }

    pub(crate) fn provider(provider: &str, status: Option<u16>, body: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.to_string(),
            status,
            body: body.into(),
        }
    }

    /// Map a transport-level failure onto the provider error shape.
    pub(crate) fn transport(provider: &str, err: reqwest::Error) -> Self {
        Self::provider(provider, err.status().map(|s| s.as_u16()), err.to_string())
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Provider { status, .. } => *status,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_display_includes_status_and_body() {
        let err = NovelGenError::provider("gpt", Some(401), "bad key");
        assert_eq!(err.to_string(), "gpt request failed (HTTP 401): bad key");
        assert_eq!(err.status(), Some(401));
        assert_eq!(err.code(), "AI-2001");
    }

    #[test]
    fn provider_error_without_status_omits_it() {
        let err = NovelGenError::provider("ollama", None, "connection refused");
        assert_eq!(err.to_string(), "ollama request failed: connection refused");
    }
}
