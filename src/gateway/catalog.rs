//! Supported models and sampling parameters per provider.

use serde::Serialize;

use super::types::{ProviderKind, SamplingParam, SamplingParams};

/// Validation failures for a run request, surfaced to the caller as-is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("invalid provider model '{model}' for {provider}")]
    UnsupportedModel {
        provider: ProviderKind,
        model: String,
    },
    #[error("for {provider} provider the next field should be specified: {param}")]
    MissingParam {
        provider: ProviderKind,
        param: &'static str,
    },
}

const OPENAI_MODELS: &[&str] = &["gpt-3.5-turbo", "gpt-4", "gpt-4-1106-preview"];

const FIREWORKS_MODELS: &[&str] = &[
    "llama-v2-70b-chat",
    "llama-v2-13b-chat",
    "llama-v2-7b-chat",
    "llama-v2-34b-code-instruct",
];

const OPENROUTER_MODELS: &[&str] = &[
    "openai/gpt-4",
    "meta-llama/llama-2-70b-chat",
    "meta-llama/llama-2-13b-chat",
];

impl ProviderKind {
    /// Model ids accepted for this provider.
    pub fn models(&self) -> &'static [&'static str] {
        match self {
            ProviderKind::OpenAi => OPENAI_MODELS,
            ProviderKind::Fireworks => FIREWORKS_MODELS,
            ProviderKind::OpenRouter => OPENROUTER_MODELS,
        }
    }

    /// Sampling parameters this provider requires on every request.
    pub fn available_params(&self) -> &'static [SamplingParam] {
        match self {
            ProviderKind::OpenAi => &[SamplingParam::Temperature],
            ProviderKind::Fireworks => &[SamplingParam::Temperature, SamplingParam::TopP],
            ProviderKind::OpenRouter => &[
                SamplingParam::Seed,
                SamplingParam::Temperature,
                SamplingParam::TopP,
                SamplingParam::TopK,
            ],
        }
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.models().contains(&model)
    }
}

/// Reject a model the provider does not serve, or a missing required param.
pub fn validate_request(
    provider: ProviderKind,
    model: &str,
    sampling: &SamplingParams,
) -> Result<(), CatalogError> {
    if let Some(param) = provider
        .available_params()
        .iter()
        .find(|p| !sampling.is_set(**p))
    {
        return Err(CatalogError::MissingParam {
            provider,
            param: param.name(),
        });
    }

    if !provider.supports_model(model) {
        return Err(CatalogError::UnsupportedModel {
            provider,
            model: model.to_string(),
        });
    }

    Ok(())
}

// =============================================================================
// Listing
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ModelParamItem {
    pub param_name: &'static str,
    pub default_value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderItem {
    pub provider_name: &'static str,
    pub models: Vec<&'static str>,
    pub available_params: Vec<ModelParamItem>,
}

/// Describe every supported provider with its models and parameter defaults.
pub fn list_providers() -> Vec<ProviderItem> {
    ProviderKind::ALL
        .iter()
        .map(|kind| ProviderItem {
            provider_name: kind.as_str(),
            models: kind.models().to_vec(),
            available_params: kind
                .available_params()
                .iter()
                .map(|p| ModelParamItem {
                    param_name: p.name(),
                    default_value: p.default_value(),
                })
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_required_param_is_reported_first() {
        let err = validate_request(
            ProviderKind::Fireworks,
            "not-a-model",
            &SamplingParams {
                temperature: Some(0.2),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(
            err,
            CatalogError::MissingParam {
                provider: ProviderKind::Fireworks,
                param: "top_p"
            }
        );
    }

    #[test]
    fn unknown_model_is_rejected() {
        let sampling = SamplingParams::default().with_defaults(ProviderKind::OpenAi.available_params());
        let err = validate_request(ProviderKind::OpenAi, "llama-v2-7b-chat", &sampling).unwrap_err();
        assert!(matches!(err, CatalogError::UnsupportedModel { .. }));
        assert!(validate_request(ProviderKind::OpenAi, "gpt-4", &sampling).is_ok());
    }

    #[test]
    fn listing_covers_every_provider() {
        let items = list_providers();
        assert_eq!(items.len(), ProviderKind::ALL.len());
        assert!(items.iter().all(|i| !i.models.is_empty() && !i.available_params.is_empty()));
        let openrouter = items.iter().find(|i| i.provider_name == "openrouter").unwrap();
        let top_k = openrouter
            .available_params
            .iter()
            .find(|p| p.param_name == "top_k")
            .unwrap();
        assert_eq!(top_k.default_value, 70.0);
    }
}
