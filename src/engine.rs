use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, SamplingConfig};
use crate::error::{DeskError, Result};

// ========================= Backend Handles =========================

/// Source of native model handles. The three handle levels are acquired in
/// order model -> context -> session and released in the reverse order.
#[async_trait]
pub trait EngineBackend: Send + Sync {
    async fn load_model(&self, path: &Path) -> Result<Box<dyn ModelHandle>>;
}

#[async_trait]
pub trait ModelHandle: Send + Sync {
    async fn create_context(&self, context_size: u32) -> Result<Box<dyn ContextHandle>>;
    async fn dispose(&self) -> Result<()>;
}

#[async_trait]
pub trait ContextHandle: Send + Sync {
    async fn create_session(&self) -> Result<Box<dyn ChatSession>>;
    async fn dispose(&self) -> Result<()>;
}

/// Implementations serialize concurrent prompts themselves.
#[async_trait]
pub trait ChatSession: Send + Sync {
    async fn prompt(&self, prompt: &str, sampling: &SamplingConfig) -> Result<String>;
    async fn dispose(&self) -> Result<()>;
}

// ========================= Engine State =========================

struct LoadedEngine {
    path: PathBuf,
    model: Box<dyn ModelHandle>,
    context: Box<dyn ContextHandle>,
    session: Box<dyn ChatSession>,
}

impl LoadedEngine {
    /// Each release is attempted even if an earlier one failed.
    async fn dispose(self) {
        if let Err(e) = self.session.dispose().await {
            warn!(path = %self.path.display(), error = %e, "failed to dispose chat session");
        }
        if let Err(e) = self.context.dispose().await {
            warn!(path = %self.path.display(), error = %e, "failed to dispose context");
        }
        if let Err(e) = self.model.dispose().await {
            warn!(path = %self.path.display(), error = %e, "failed to dispose model");
        }
    }
}

enum EngineState {
    Unloaded,
    Loading(PathBuf),
    Loaded(LoadedEngine),
}

impl EngineState {
    fn loaded_path(&self) -> Option<&Path> {
        match self {
            EngineState::Loaded(engine) => Some(&engine.path),
            _ => None,
        }
    }

    /// Moves to `next` and hands back whatever handles the old state owned.
    fn transition(&mut self, next: EngineState) -> Option<LoadedEngine> {
        match std::mem::replace(self, next) {
            EngineState::Loaded(engine) => Some(engine),
            EngineState::Loading(_) | EngineState::Unloaded => None,
        }
    }
}

/// Owned copy of the engine state for introspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnginePhase {
    Unloaded,
    Loading(PathBuf),
    Loaded(PathBuf),
}

// ========================= Manager =========================

pub struct InferenceEngineManager {
    backend: Arc<dyn EngineBackend>,
    cfg: EngineConfig,
    prompt_timeout: Option<Duration>,
    // Held for the whole of a load/swap/unload sequence.
    lifecycle: Mutex<()>,
    state: RwLock<EngineState>,
}

impl InferenceEngineManager {
    pub fn new(backend: Arc<dyn EngineBackend>, cfg: EngineConfig) -> Self {
        Self {
            backend,
            cfg,
            prompt_timeout: None,
            lifecycle: Mutex::new(()),
            state: RwLock::new(EngineState::Unloaded),
        }
    }

    pub fn with_prompt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.prompt_timeout = timeout;
        self
    }

    pub async fn current_path(&self) -> Option<PathBuf> {
        self.state.read().await.loaded_path().map(Path::to_path_buf)
    }

    pub async fn phase(&self) -> EnginePhase {
        match &*self.state.read().await {
            EngineState::Unloaded => EnginePhase::Unloaded,
            EngineState::Loading(p) => EnginePhase::Loading(p.clone()),
            EngineState::Loaded(engine) => EnginePhase::Loaded(engine.path.clone()),
        }
    }

    async fn is_loaded(&self, path: &Path) -> bool {
        let state = self.state.read().await;
        match state.loaded_path() {
            Some(current) => same_path(current, path).await,
            None => false,
        }
    }

    /// Makes `path` the loaded model, releasing whatever was loaded before.
    /// A caller arriving while another load is running waits for it and then
    /// re-checks, so two sequences never interleave.
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if self.is_loaded(path).await {
            return Ok(());
        }

        let _op = self.lifecycle.lock().await;
        if self.is_loaded(path).await {
            debug!(path = %path.display(), "model loaded by a concurrent caller");
            return Ok(());
        }

        // Taking the write lock waits out prompts running on the old session.
        let previous = self
            .state
            .write()
            .await
            .transition(EngineState::Loading(path.to_path_buf()));
        if let Some(previous) = previous {
            info!(from = %previous.path.display(), to = %path.display(), "swapping model");
            previous.dispose().await;
        }

        match self.acquire(path).await {
            Ok(engine) => {
                self.state.write().await.transition(EngineState::Loaded(engine));
                info!(path = %path.display(), "model loaded");
                Ok(())
            }
            Err(e) => {
                self.state.write().await.transition(EngineState::Unloaded);
                warn!(path = %path.display(), error = %e, "model load failed");
                Err(e)
            }
        }
    }

    async fn acquire(&self, path: &Path) -> Result<LoadedEngine> {
        let model = self.backend.load_model(path).await?;
        let context = match model.create_context(self.cfg.context_size).await {
            Ok(context) => context,
            Err(e) => {
                release("model", model.dispose().await);
                return Err(e);
            }
        };
        let session = match context.create_session().await {
            Ok(session) => session,
            Err(e) => {
                release("context", context.dispose().await);
                release("model", model.dispose().await);
                return Err(e);
            }
        };
        Ok(LoadedEngine { path: path.to_path_buf(), model, context, session })
    }

    /// Releases the loaded model. With `Some(path)`, does nothing unless that
    /// path is the one currently loaded.
    pub async fn unload(&self, path: Option<&Path>) {
        let _op = self.lifecycle.lock().await;
        let mut state = self.state.write().await;
        if let (Some(target), Some(current)) = (path, state.loaded_path()) {
            if !same_path(target, current).await {
                debug!(requested = %target.display(), current = %current.display(), "stale unload ignored");
                return;
            }
        }
        let previous = state.transition(EngineState::Unloaded);
        drop(state);
        if let Some(previous) = previous {
            info!(path = %previous.path.display(), "unloading model");
            previous.dispose().await;
        }
    }

    pub async fn run(&self, prompt: &str) -> Result<String> {
        let state = self.state.read().await;
        let EngineState::Loaded(engine) = &*state else {
            return Err(DeskError::EngineNotInitialized);
        };
        let sampling = &self.cfg.sampling;
        let reply = engine.session.prompt(prompt, sampling);
        let text = match self.prompt_timeout {
            Some(limit) => tokio::time::timeout(limit, reply)
                .await
                .map_err(|_| DeskError::Timeout(format!("inference exceeded {:?}", limit)))??,
            None => reply.await?,
        };
        Ok(if sampling.trim_whitespace_suffix {
            text.trim_end().to_string()
        } else {
            text
        })
    }
}

fn release(what: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!(error = %e, "failed to dispose {} after aborted load", what);
    }
}

async fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a).await, fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
