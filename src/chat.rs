use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_core::future::BoxFuture;
use reqwest::Response;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::credentials::{ProviderKey, RunCredentials};
use crate::error::ProviderError;
use crate::models::{ChatMessage, ChatOutput, GenerateOptions, Role, TokenUsage};

/// Chat seam between the pipeline and provider backends. Implemented by the
/// real HTTP client here and by scripted fakes in tests.
pub trait ChatApi: Send + Sync {
    fn generate<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        options: &'a GenerateOptions,
    ) -> BoxFuture<'a, Result<ChatOutput, ProviderError>>;

    /// Cumulative token usage across every call made through this client.
    /// Counters never reset mid-run.
    fn totals(&self) -> TokenUsage;
}

const OPENAI_BASE: &str = "https://api.openai.com/v1";
const DEEPSEEK_BASE: &str = "https://api.deepseek.com/v1";
const QWEN_BASE: &str = "https://dashscope-intl.aliyuncs.com/compatible-mode/v1";
const GROK_BASE: &str = "https://api.x.ai/v1";
const ANTHROPIC_BASE: &str = "https://api.anthropic.com";
const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Model-id prefix marking the reasoning-capable openai family.
const REASONING_MODEL_PREFIX: &str = "gpt-5";

/// Reasoning models burn most of the budget on hidden reasoning tokens, so
/// the nominal cap is inflated before it reaches that provider. This is
/// compensation specific to the reasoning family, not a general rule.
const REASONING_BUDGET_MULTIPLIER: u32 = 10;

const MAX_ERROR_BODY_CHARS: usize = 600;

/// One client per generation run: carries that run's credentials and its
/// token counters.
pub struct HttpChatClient {
    http: reqwest::Client,
    credentials: RunCredentials,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

impl HttpChatClient {
    pub fn new(credentials: RunCredentials, timeout: Duration) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("plume/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Http {
                provider: "client".to_string(),
                source: e,
            })?;

        Ok(Self {
            http,
            credentials,
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
        })
    }

    fn key_for(&self, provider: &str) -> Result<&ProviderKey, ProviderError> {
        self.credentials.get(provider).ok_or_else(|| ProviderError::Api {
            provider: provider.to_string(),
            status: 401,
            body: format!("no {provider} API key configured"),
        })
    }

    fn add_usage(&self, usage: &TokenUsage) {
        self.input_tokens.fetch_add(usage.input, Ordering::Relaxed);
        self.output_tokens.fetch_add(usage.output, Ordering::Relaxed);
    }

    async fn call_openai_compatible(
        &self,
        provider: &str,
        default_base: &str,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<ChatOutput, ProviderError> {
        let key = self.key_for(provider)?;
        let base = key.base_url.as_deref().unwrap_or(default_base);
        let url = format!("{}/chat/completions", base.trim_end_matches('/'));
        let body = openai_request_body(messages, options);

        debug!(provider, model = %options.model, "chat completion request");
        let response = self
            .http
            .post(&url)
            .bearer_auth(&key.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| http_error(provider, e))?;
        let value = read_json(provider, response).await?;

        let text = value
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let usage = normalize_usage(TokenUsage {
            input: read_u64(&value, "/usage/prompt_tokens"),
            output: read_u64(&value, "/usage/completion_tokens"),
            total: read_u64(&value, "/usage/total_tokens"),
        });

        finalize(provider, text, usage, &value)
    }

    async fn call_anthropic(
        &self,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<ChatOutput, ProviderError> {
        let key = self.key_for("anthropic")?;
        let base = key.base_url.as_deref().unwrap_or(ANTHROPIC_BASE);
        let url = format!("{}/v1/messages", base.trim_end_matches('/'));
        let body = anthropic_request_body(messages, options);

        debug!(model = %options.model, "anthropic messages request");
        let response = self
            .http
            .post(&url)
            .header("x-api-key", &key.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| http_error("anthropic", e))?;
        let value = read_json("anthropic", response).await?;

        let text = value
            .pointer("/content")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.pointer("/text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        let usage = normalize_usage(TokenUsage {
            input: read_u64(&value, "/usage/input_tokens"),
            output: read_u64(&value, "/usage/output_tokens"),
            total: 0,
        });

        finalize("anthropic", text, usage, &value)
    }

    async fn call_gemini(
        &self,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<ChatOutput, ProviderError> {
        let key = self.key_for("gemini")?;
        let base = key.base_url.as_deref().unwrap_or(GEMINI_BASE);
        let url = format!(
            "{}/models/{}:generateContent",
            base.trim_end_matches('/'),
            options.model
        );
        let body = gemini_request_body(messages, options);

        debug!(model = %options.model, "gemini generateContent request");
        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &key.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| http_error("gemini", e))?;
        let value = read_json("gemini", response).await?;

        let text = value
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.pointer("/text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        let usage = normalize_usage(TokenUsage {
            input: read_u64(&value, "/usageMetadata/promptTokenCount"),
            output: read_u64(&value, "/usageMetadata/candidatesTokenCount"),
            total: read_u64(&value, "/usageMetadata/totalTokenCount"),
        });

        finalize("gemini", text, usage, &value)
    }
}

impl ChatApi for HttpChatClient {
    fn generate<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        options: &'a GenerateOptions,
    ) -> BoxFuture<'a, Result<ChatOutput, ProviderError>> {
        Box::pin(async move {
            let result = match options.provider.as_str() {
                "openai" => self.call_openai_compatible("openai", OPENAI_BASE, messages, options).await,
                "deepseek" => {
                    self.call_openai_compatible("deepseek", DEEPSEEK_BASE, messages, options)
                        .await
                }
                "qwen" => self.call_openai_compatible("qwen", QWEN_BASE, messages, options).await,
                "grok" => self.call_openai_compatible("grok", GROK_BASE, messages, options).await,
                "anthropic" => self.call_anthropic(messages, options).await,
                "gemini" => self.call_gemini(messages, options).await,
                other => {
                    warn!(provider = %other, "unsupported provider id, returning empty text");
                    Ok(ChatOutput {
                        text: String::new(),
                        usage: TokenUsage::default(),
                    })
                }
            };

            if let Ok(ref output) = result {
                self.add_usage(&output.usage);
            }
            result
        })
    }

    fn totals(&self) -> TokenUsage {
        let input = self.input_tokens.load(Ordering::Relaxed);
        let output = self.output_tokens.load(Ordering::Relaxed);
        TokenUsage {
            input,
            output,
            total: input + output,
        }
    }
}

/// True when the model id belongs to the reasoning family with its own
/// calling convention (reasoning effort, verbosity, inflated budget).
pub fn is_reasoning_model(model: &str) -> bool {
    model.starts_with(REASONING_MODEL_PREFIX)
}

fn openai_request_body(messages: &[ChatMessage], options: &GenerateOptions) -> Value {
    let mut body = json!({
        "model": options.model,
        "messages": messages,
    });

    if is_reasoning_model(&options.model) {
        // temperature is rejected by this family; omit it entirely
        body["max_completion_tokens"] =
            json!(options.max_tokens.saturating_mul(REASONING_BUDGET_MULTIPLIER));
        if let Some(ref effort) = options.reasoning_effort {
            body["reasoning_effort"] = json!(effort);
        }
        if let Some(ref verbosity) = options.verbosity {
            body["verbosity"] = json!(verbosity);
        }
    } else {
        body["temperature"] = json!(options.temperature);
        body["max_tokens"] = json!(options.max_tokens);
    }

    body
}

fn anthropic_request_body(messages: &[ChatMessage], options: &GenerateOptions) -> Value {
    let system = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let turns: Vec<Value> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            json!({
                "role": if m.role == Role::Assistant { "assistant" } else { "user" },
                "content": m.content,
            })
        })
        .collect();

    let mut body = json!({
        "model": options.model,
        "max_tokens": options.max_tokens,
        "temperature": options.temperature,
        "messages": turns,
    });
    if !system.is_empty() {
        body["system"] = json!(system);
    }
    body
}

fn gemini_request_body(messages: &[ChatMessage], options: &GenerateOptions) -> Value {
    let system = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let contents: Vec<Value> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            json!({
                "role": if m.role == Role::Assistant { "model" } else { "user" },
                "parts": [{"text": m.content}],
            })
        })
        .collect();

    let mut body = json!({
        "contents": contents,
        "generationConfig": {
            "temperature": options.temperature,
            "maxOutputTokens": options.max_tokens,
        },
    });
    if !system.is_empty() {
        body["systemInstruction"] = json!({"parts": [{"text": system}]});
    }
    body
}

pub(crate) fn http_error(provider: &str, source: reqwest::Error) -> ProviderError {
    ProviderError::Http {
        provider: provider.to_string(),
        source,
    }
}

pub(crate) async fn read_json(provider: &str, response: Response) -> Result<Value, ProviderError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Api {
            provider: provider.to_string(),
            status: status.as_u16(),
            body: truncate_chars(&body, MAX_ERROR_BODY_CHARS),
        });
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| http_error(provider, e))
}

pub(crate) fn read_u64(value: &Value, pointer: &str) -> u64 {
    value.pointer(pointer).and_then(Value::as_u64).unwrap_or(0)
}

pub(crate) fn normalize_usage(mut usage: TokenUsage) -> TokenUsage {
    if usage.total == 0 {
        usage.total = usage.input + usage.output;
    }
    usage
}

/// Empty primary field does not immediately fail the call: one fallback pass
/// scans the raw response for any non-empty text-bearing field first. The
/// network call itself is never retried — every attempt may be billed.
fn finalize(provider: &str, text: String, usage: TokenUsage, raw: &Value) -> Result<ChatOutput, ProviderError> {
    let text = text.trim().to_string();
    if !text.is_empty() {
        return Ok(ChatOutput { text, usage });
    }

    if let Some(found) = scan_for_text(raw) {
        warn!(provider, "primary content field empty, used fallback text extraction");
        return Ok(ChatOutput { text: found, usage });
    }

    Err(ProviderError::NoContent {
        provider: provider.to_string(),
    })
}

fn scan_for_text(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            for key in ["text", "content", "output_text"] {
                if let Some(Value::String(s)) = map.get(key)
                    && !s.trim().is_empty()
                {
                    return Some(s.trim().to_string());
                }
            }
            map.values().find_map(scan_for_text)
        }
        Value::Array(items) => items.iter().find_map(scan_for_text),
        _ => None,
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}
