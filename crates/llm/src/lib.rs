use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use librarian_config::LlmConfig;

/// Outcome of one text-generation call.
///
/// A failed generation is a normal value, not an `Err`: the caller records it
/// against its resilience policy and reports it to the requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub ok: bool,
    pub output: String,
    pub error: String,
}

impl Generation {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            ok: true,
            output: output.into(),
            error: String::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            output: String::new(),
            error: error.into(),
        }
    }
}

/// The outbound text-generation provider.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Generation;
}

pub type SharedGenerator = Arc<dyn Generator>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Provider {
    Ollama,
    OpenRouter,
}

impl Provider {
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("openrouter") {
            Provider::OpenRouter
        } else {
            Provider::Ollama
        }
    }
}

/// HTTP-backed generator talking to Ollama or OpenRouter.
#[derive(Debug, Clone)]
pub struct HttpGenerator {
    client: reqwest::Client,
    provider: Provider,
    model: String,
    base_url: String,
}

impl HttpGenerator {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()?;
        let provider = Provider::from_name(&config.provider);
        let model = match provider {
            Provider::Ollama => config.ollama_model.clone(),
            Provider::OpenRouter => config.openrouter_model.clone(),
        };
        // Allow the environment variable to override the config value at runtime.
        let base_url = std::env::var("OLLAMA_BASE_URL")
            .unwrap_or_else(|_| config.ollama_base_url.clone());
        Ok(Self {
            client,
            provider,
            model,
            base_url,
        })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    async fn ollama(&self, prompt: &str) -> Result<Generation> {
        let endpoint = format!("{}/api/generate", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false
        });

        let response = self.client.post(endpoint).json(&payload).send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            return Ok(Generation::failure(format!("Ollama error ({status}): {body}")));
        }

        match body.get("response").and_then(|value| value.as_str()) {
            Some(content) => Ok(Generation::success(content)),
            None => Ok(Generation::failure(format!("Ollama response missing text: {body}"))),
        }
    }

    async fn openrouter(&self, prompt: &str) -> Result<Generation> {
        let api_key = std::env::var("OPENROUTER_API_KEY").unwrap_or_default();
        if api_key.trim().is_empty() {
            return Ok(Generation::failure("OPENROUTER_API_KEY is not set"));
        }

        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "user", "content": prompt}
            ]
        });

        let response = self
            .client
            .post("https://openrouter.ai/api/v1/chat/completions")
            .bearer_auth(api_key)
            .header("X-Title", "Librarian")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            return Ok(Generation::failure(format!("OpenRouter error ({status}): {body}")));
        }

        match body
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
        {
            Some(content) if !content.trim().is_empty() => Ok(Generation::success(content)),
            _ => Ok(Generation::failure("OpenRouter response empty")),
        }
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, prompt: &str) -> Generation {
        let result = match self.provider {
            Provider::Ollama => self.ollama(prompt).await,
            Provider::OpenRouter => self.openrouter(prompt).await,
        };
        match result {
            Ok(generation) => generation,
            Err(err) => {
                debug!(provider = ?self.provider, ?err, "generation transport failure");
                Generation::failure(format!("{:?} unavailable: {err}", self.provider))
            }
        }
    }
}

/// Generator backed by a closure.  Handy for wiring fakes in tests and for
/// running the service with a canned responder.
pub struct FnGenerator<F>(pub F);

#[async_trait]
impl<F> Generator for FnGenerator<F>
where
    F: Fn(&str) -> Generation + Send + Sync,
{
    async fn generate(&self, prompt: &str) -> Generation {
        (self.0)(prompt)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
