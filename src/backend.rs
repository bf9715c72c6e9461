use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::SamplingConfig;
use crate::engine::{ChatSession, ContextHandle, EngineBackend, ModelHandle};
use crate::error::{DeskError, Result};

#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub api_base: String,        // e.g. "http://127.0.0.1:8080/v1"
    pub api_key: Option<String>, // env MULTIDESK_LLM_API_KEY
    pub max_tokens: u32,
    pub history_messages: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("MULTIDESK_LLM_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:8080/v1".into()),
            api_key: env::var("MULTIDESK_LLM_API_KEY").ok().filter(|k| !k.is_empty()),
            max_tokens: 1024,
            history_messages: 8,
        }
    }
}

/// Engine backend for a local OpenAI-compatible inference server such as
/// llama.cpp's `llama-server`. Handles map onto server-side state: the model
/// is addressed by artifact name, the session keeps chat history.
#[derive(Clone)]
pub struct OpenAiCompatBackend {
    http: Client,
    cfg: BackendConfig,
}

impl OpenAiCompatBackend {
    pub fn new(cfg: BackendConfig) -> Self {
        Self { http: Client::new(), cfg }
    }

    async fn ping(&self) -> anyhow::Result<()> {
        let url = format!("{}/models", self.cfg.api_base);
        let mut req = self.http.get(url);
        if let Some(key) = &self.cfg.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.context("inference server unreachable")?;
        if !resp.status().is_success() {
            bail!("inference server returned {}", resp.status());
        }
        Ok(())
    }
}

#[async_trait]
impl EngineBackend for OpenAiCompatBackend {
    async fn load_model(&self, path: &Path) -> Result<Box<dyn ModelHandle>> {
        if !path.is_file() {
            return Err(DeskError::Engine(format!("model file not found: {}", path.display())));
        }
        self.ping().await.map_err(|e| DeskError::Engine(format!("{:#}", e)))?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "default".into());
        debug!(model = %name, path = %path.display(), "remote model handle acquired");
        Ok(Box::new(RemoteModel { backend: self.clone(), name, _path: path.to_path_buf() }))
    }
}

struct RemoteModel {
    backend: OpenAiCompatBackend,
    name: String,
    _path: PathBuf,
}

#[async_trait]
impl ModelHandle for RemoteModel {
    async fn create_context(&self, context_size: u32) -> Result<Box<dyn ContextHandle>> {
        Ok(Box::new(RemoteContext {
            backend: self.backend.clone(),
            model: self.name.clone(),
            context_size,
        }))
    }

    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

struct RemoteContext {
    backend: OpenAiCompatBackend,
    model: String,
    context_size: u32,
}

#[async_trait]
impl ContextHandle for RemoteContext {
    async fn create_session(&self) -> Result<Box<dyn ChatSession>> {
        Ok(Box::new(RemoteChatSession {
            backend: self.backend.clone(),
            model: self.model.clone(),
            max_tokens: self.backend.cfg.max_tokens.min(self.context_size),
            history: Mutex::new(Vec::new()),
        }))
    }

    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

struct RemoteChatSession {
    backend: OpenAiCompatBackend,
    model: String,
    max_tokens: u32,
    // The lock also keeps prompts on this session one at a time.
    history: Mutex<Vec<Value>>,
}

impl RemoteChatSession {
    async fn complete(&self, messages: &[Value], sampling: &SamplingConfig) -> anyhow::Result<String> {
        let url = format!("{}/chat/completions", self.backend.cfg.api_base);
        let body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": sampling.temperature,
            "top_p": sampling.top_p,
            "max_tokens": self.max_tokens,
            "stream": false,
        });
        let mut req = self.backend.http.post(url).json(&body);
        if let Some(key) = &self.backend.cfg.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("inference server error {}: {}", status, text);
        }
        let v: Value = serde_json::from_str(&text).context("failed to parse completion JSON")?;
        let content = v
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .context("completion has no message content")?;
        Ok(content.to_string())
    }
}

#[async_trait]
impl ChatSession for RemoteChatSession {
    async fn prompt(&self, prompt: &str, sampling: &SamplingConfig) -> Result<String> {
        let mut history = self.history.lock().await;
        let mut messages = history.clone();
        messages.push(json!({ "role": "user", "content": prompt }));

        let mut reply = self
            .complete(&messages, sampling)
            .await
            .map_err(|e| DeskError::Engine(format!("{:#}", e)))?;
        if sampling.trim_whitespace_suffix {
            reply.truncate(reply.trim_end().len());
        }

        messages.push(json!({ "role": "assistant", "content": reply }));
        let keep = self.backend.cfg.history_messages;
        if messages.len() > keep {
            messages.drain(..messages.len() - keep);
        }
        *history = messages;
        Ok(reply)
    }

    async fn dispose(&self) -> Result<()> {
        self.history.lock().await.clear();
        Ok(())
    }
}
