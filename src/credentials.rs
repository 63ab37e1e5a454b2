use std::collections::HashMap;

use crate::config::ProviderCredentialConfig;
use crate::models::UserSecret;

/// Chat backends the adapter knows how to call.
pub const CHAT_PROVIDERS: [&str; 6] = ["openai", "anthropic", "gemini", "deepseek", "qwen", "grok"];

/// One resolved credential: the key plus an optional base URL override.
#[derive(Debug, Clone)]
pub struct ProviderKey {
    pub api_key: String,
    pub base_url: Option<String>,
}

/// Credentials for one generation run, resolved once up front and carried
/// with the run. Resolution order per provider: the user's stored secret,
/// then the `[providers]` config table, then the conventional environment
/// variable. Process state is never mutated.
#[derive(Debug, Clone, Default)]
pub struct RunCredentials {
    keys: HashMap<String, ProviderKey>,
}

impl RunCredentials {
    pub fn resolve(
        secrets: &[UserSecret],
        configured: &HashMap<String, ProviderCredentialConfig>,
    ) -> Self {
        let mut keys = HashMap::new();
        for name in CHAT_PROVIDERS.iter().chain(["perplexity", "unsplash"].iter()) {
            if let Some(key) = resolve_one(name, secrets, configured) {
                keys.insert(name.to_string(), key);
            }
        }
        Self { keys }
    }

    pub fn get(&self, provider: &str) -> Option<&ProviderKey> {
        self.keys.get(provider)
    }

    #[cfg(test)]
    pub fn with_key(provider: &str, api_key: &str) -> Self {
        let mut keys = HashMap::new();
        keys.insert(
            provider.to_string(),
            ProviderKey {
                api_key: api_key.to_string(),
                base_url: None,
            },
        );
        Self { keys }
    }
}

fn resolve_one(
    provider: &str,
    secrets: &[UserSecret],
    configured: &HashMap<String, ProviderCredentialConfig>,
) -> Option<ProviderKey> {
    if let Some(secret) = secrets
        .iter()
        .find(|s| s.provider == provider && !s.api_key.is_empty())
    {
        return Some(ProviderKey {
            api_key: secret.api_key.clone(),
            base_url: secret.base_url.clone(),
        });
    }

    if let Some(entry) = configured.get(provider)
        && !entry.api_key.is_empty()
    {
        return Some(ProviderKey {
            api_key: entry.api_key.clone(),
            base_url: entry.base_url.clone(),
        });
    }

    std::env::var(env_var_name(provider)?)
        .ok()
        .filter(|v| !v.is_empty())
        .map(|api_key| ProviderKey {
            api_key,
            base_url: None,
        })
}

fn env_var_name(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("OPENAI_API_KEY"),
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "gemini" => Some("GEMINI_API_KEY"),
        "deepseek" => Some("DEEPSEEK_API_KEY"),
        "qwen" => Some("QWEN_API_KEY"),
        "grok" => Some("GROK_API_KEY"),
        "perplexity" => Some("PERPLEXITY_API_KEY"),
        "unsplash" => Some("UNSPLASH_ACCESS_KEY"),
        _ => None,
    }
}
