//! Completion backends.
//!
//! The [`CompletionBackend`] trait decouples the agent loop from the actual
//! language-model API. Tests use scripted backends that return predetermined
//! replies without network access.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use crate::core::content::Message;
use crate::io::config::LlmConfig;

/// One chat completion call. Serializes to the OpenAI request body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>, cfg: &LlmConfig) -> Self {
        Self {
            model: cfg.model.clone(),
            messages,
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
        }
    }
}

/// Abstraction over completion backends. Replies are arbitrary text.
pub trait CompletionBackend {
    fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

impl<B: CompletionBackend + ?Sized> CompletionBackend for Box<B> {
    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        (**self).complete(request)
    }
}

/// Backend for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiBackend {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
}

impl OpenAiBackend {
    /// Build from config. The API key is read from the environment variable
    /// named by `llm.api_key_env`.
    pub fn from_config(cfg: &LlmConfig) -> Result<Self> {
        let api_key = env::var(&cfg.api_key_env)
            .map_err(|_| anyhow!("environment variable {} is not set", cfg.api_key_env))?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", cfg.base_url.trim_end_matches('/')),
            api_key,
        })
    }
}

impl CompletionBackend for OpenAiBackend {
    #[instrument(skip_all, fields(model = %request.model, messages = request.messages.len()))]
    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        info!(endpoint = %self.endpoint, "requesting completion");
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .context("call completion API")?
            .error_for_status()
            .context("completion API returned an error status")?;

        let payload: serde_json::Value = resp.json().context("invalid completion response")?;
        let content = payload
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str());

        match content {
            Some(text) => {
                debug!(chars = text.len(), "completion received");
                Ok(text.to_string())
            }
            None => bail!("unexpected completion response shape: {payload}"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedReply {
    reply: String,
}

/// Content-addressed disk cache in front of another backend.
///
/// Entries live at `{dir}/{sha256(request json)}.json`; identical requests
/// never reach the inner backend twice.
pub struct CachedBackend<B> {
    inner: B,
    dir: PathBuf,
}

impl<B: CompletionBackend> CachedBackend<B> {
    pub fn new(inner: B, dir: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            dir: dir.into(),
        }
    }

    fn cache_path(&self, request: &CompletionRequest) -> Result<PathBuf> {
        let body = serde_json::to_string(request).context("serialize completion request")?;
        Ok(self.dir.join(format!("{}.json", content_hash(&body))))
    }
}

impl<B: CompletionBackend> CompletionBackend for CachedBackend<B> {
    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let path = self.cache_path(request)?;
        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read cache {}", path.display()))?;
            let cached: CachedReply = serde_json::from_str(&contents)
                .with_context(|| format!("parse cache {}", path.display()))?;
            debug!(path = %path.display(), "completion cache hit");
            return Ok(cached.reply);
        }

        let cached = CachedReply {
            reply: self.inner.complete(request)?,
        };
        write_cache(&path, &cached)?;
        Ok(cached.reply)
    }
}

/// Hex sha256 of `content`.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

fn write_cache(path: &Path, cached: &CachedReply) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create cache dir {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, serde_json::to_string_pretty(cached)?)
        .with_context(|| format!("write cache {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace cache {}", path.display()))?;
    debug!(path = %path.display(), "saved completion to cache");
    Ok(())
}

/// Build the configured backend, wrapped in the disk cache when enabled.
pub fn backend_from_config(cfg: &LlmConfig) -> Result<Box<dyn CompletionBackend>> {
    let backend = OpenAiBackend::from_config(cfg)?;
    if cfg.cache {
        return Ok(Box::new(CachedBackend::new(backend, cfg.cache_dir.clone())));
    }
    Ok(Box::new(backend))
}
