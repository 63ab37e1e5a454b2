use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} request failed: {source}")]
    Http {
        provider: String,
        source: reqwest::Error,
    },
    #[error("{provider} returned HTTP {status}: {body}")]
    Api {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("no content generated by {provider}")]
    NoContent { provider: String },
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("wordpress request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("wordpress returned HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("no wordpress connection configured")]
    NotConfigured,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Provider(#[from] ProviderError),
    #[error("invalid outline structure: {0}")]
    InvalidOutline(String),
    #[error("empty completion while writing {unit}")]
    EmptyUnit { unit: String },
    #[error("{0}")]
    Publish(#[from] PublishError),
}

/// User-facing rendering of a failed run: what happened plus what to do next.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ClassifiedError {
    pub message: String,
    pub hint: String,
}

/// Map a pipeline failure to a message + hint the UI can show directly.
///
/// Providers disagree wildly on error shapes, so this is substring and status
/// matching over whatever text came back, not structured error codes.
pub fn classify(err: &PipelineError) -> ClassifiedError {
    match err {
        PipelineError::Provider(ProviderError::Api {
            provider,
            status,
            body,
        }) => classify_provider_failure(provider, Some(*status), body),
        PipelineError::Provider(ProviderError::Http { provider, source }) => {
            if source.is_timeout() || source.is_connect() {
                return network_error(provider);
            }
            classify_provider_failure(provider, source.status().map(|s| s.as_u16()), &source.to_string())
        }
        PipelineError::Provider(ProviderError::NoContent { provider }) => ClassifiedError {
            message: format!("the {provider} model returned an empty response"),
            hint: "Retry, or switch to a different model — some models refuse certain prompts silently.".to_string(),
        },
        PipelineError::InvalidOutline(detail) => ClassifiedError {
            message: format!("the model did not return a usable outline: {detail}"),
            hint: "Retry, or pick a stronger model — small models often break the outline format.".to_string(),
        },
        PipelineError::EmptyUnit { unit } => ClassifiedError {
            message: format!("the model returned no content for {unit}"),
            hint: "Retry the generation, or switch provider/model.".to_string(),
        },
        PipelineError::Publish(PublishError::Api { status, body }) => {
            classify_provider_failure("wordpress", Some(*status), body)
        }
        PipelineError::Publish(PublishError::Http(source)) => {
            if source.is_timeout() || source.is_connect() {
                return network_error("wordpress");
            }
            classify_provider_failure("wordpress", source.status().map(|s| s.as_u16()), &source.to_string())
        }
        PipelineError::Publish(PublishError::NotConfigured) => ClassifiedError {
            message: "no WordPress connection configured".to_string(),
            hint: "Add your WordPress site URL, username and application password, then retry.".to_string(),
        },
    }
}

pub fn classify_provider_failure(provider: &str, status: Option<u16>, detail: &str) -> ClassifiedError {
    let lower = detail.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if status == Some(402)
        || (status == Some(403) && has(&["billing", "credit", "quota", "balance"]))
        || has(&[
            "insufficient credits",
            "insufficient_quota",
            "exceeded your current quota",
            "billing hard limit",
            "insufficient balance",
        ])
    {
        return ClassifiedError {
            message: format!("insufficient credits on your {provider} account"),
            hint: format!(
                "Top up your {provider} balance (most providers require a small minimum, e.g. $5) and retry."
            ),
        };
    }

    if status == Some(401)
        || has(&[
            "invalid api key",
            "incorrect api key",
            "invalid x-api-key",
            "api key not valid",
            "unauthorized",
            "authentication_error",
        ])
    {
        return ClassifiedError {
            message: format!("invalid API key for {provider}"),
            hint: format!("Re-check the {provider} API key in your settings, or generate a fresh one in the provider dashboard."),
        };
    }

    if status == Some(429) || has(&["rate limit", "too many requests", "requests per min"]) {
        return ClassifiedError {
            message: format!("rate limit exceeded on {provider}"),
            hint: "Wait a minute and retry, or switch to a model with a higher rate limit.".to_string(),
        };
    }

    if has(&[
        "model not found",
        "model_not_found",
        "no such model",
        "unknown model",
        "does not exist",
    ]) {
        return ClassifiedError {
            message: format!("invalid model selected for {provider}"),
            hint: "Pick a model id this provider actually serves and retry.".to_string(),
        };
    }

    if has(&[
        "timed out",
        "timeout",
        "connection refused",
        "connection reset",
        "dns error",
        "error sending request",
    ]) {
        return network_error(provider);
    }

    ClassifiedError {
        message: if detail.trim().is_empty() {
            format!("{provider} request failed")
        } else {
            detail.trim().to_string()
        },
        hint: format!("Check your API keys and account credits for {provider}, then retry."),
    }
}

fn network_error(provider: &str) -> ClassifiedError {
    ClassifiedError {
        message: format!("network connection error while calling {provider}"),
        hint: "Check your internet connection and the provider's status page, then retry.".to_string(),
    }
}
