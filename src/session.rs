use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::acquisition::{DownloadProgress, ModelAcquisitionManager};
use crate::catalog::ModelRecord;
use crate::config::DeskConfig;
use crate::engine::InferenceEngineManager;
use crate::error::{DeskError, Result};
use crate::operator::{now_ms, ActionExecutor, ScreenCapture, Screenshot};
use crate::plan::{build_prompt, parse_plan, placeholder_plan, AgentPlan};

// ========================= Session Types =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp_ms: u128,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into(), timestamp_ms: now_ms() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Thinking,
    Ready,
    Running,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub id: String,
    pub title: String,
    pub messages: Vec<ChatMessage>,
    pub screenshot: Option<Screenshot>,
    pub plan: Option<AgentPlan>,
    pub status: SessionStatus,
    pub error: Option<String>,
}

impl SessionState {
    fn new(index: usize) -> Self {
        Self {
            id: format!("session-{}", index),
            title: format!("Session {}", index),
            messages: Vec::new(),
            screenshot: None,
            plan: None,
            status: SessionStatus::Idle,
            error: None,
        }
    }
}

/// Immutable view handed to observers after every change.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeskSnapshot {
    pub sessions: Vec<SessionState>,
    pub selected_model: Option<String>,
    pub models: Vec<ModelRecord>,
}

#[derive(Clone, Debug)]
pub enum OrchestratorEvent {
    Snapshot(Arc<DeskSnapshot>),
    ModelProgress(DownloadProgress),
}

struct Desk {
    sessions: Vec<SessionState>,
    selected_model: Option<String>,
    models: Vec<ModelRecord>,
}

impl Desk {
    fn session_mut(&mut self, id: &str) -> Result<&mut SessionState> {
        self.sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| DeskError::UnknownSession(id.to_string()))
    }

    fn snapshot(&self) -> Arc<DeskSnapshot> {
        Arc::new(DeskSnapshot {
            sessions: self.sessions.clone(),
            selected_model: self.selected_model.clone(),
            models: self.models.clone(),
        })
    }
}

/// Ready model matching the previous choice, else the first Ready model,
/// else the catalog default.
fn pick_preferred(models: &[ModelRecord], previous: Option<&str>, default_id: Option<&str>) -> Option<String> {
    let mut ready = models.iter().filter(|m| m.is_ready());
    previous
        .and_then(|prev| models.iter().find(|m| m.is_ready() && m.id() == prev))
        .or_else(|| ready.next())
        .map(|m| m.id().to_string())
        .or_else(|| default_id.map(str::to_string))
}

// ========================= Orchestrator =========================

/// Owns the session state machines and drives each one through
/// prompt -> plan -> confirm -> execute against the shared managers.
/// Failures inside a session end up in that session's `error` field.
pub struct SessionOrchestrator {
    desk: Mutex<Desk>,
    models: Arc<ModelAcquisitionManager>,
    engine: Arc<InferenceEngineManager>,
    capture: Arc<dyn ScreenCapture>,
    executor: Arc<dyn ActionExecutor>,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl SessionOrchestrator {
    pub fn new(
        cfg: &DeskConfig,
        models: Arc<ModelAcquisitionManager>,
        engine: Arc<InferenceEngineManager>,
        capture: Arc<dyn ScreenCapture>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        let (events, _) = broadcast::channel(cfg.progress_buffer.max(1));
        let sessions = (1..=cfg.session_count).map(SessionState::new).collect();
        Self {
            desk: Mutex::new(Desk { sessions, selected_model: None, models: Vec::new() }),
            models,
            engine,
            capture,
            executor,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> Arc<DeskSnapshot> {
        self.desk.lock().await.snapshot()
    }

    pub async fn selected_model(&self) -> Option<String> {
        self.desk.lock().await.selected_model.clone()
    }

    fn publish(&self, snapshot: Arc<DeskSnapshot>) {
        // Fire-and-forget; nobody listening is fine.
        let _ = self.events.send(OrchestratorEvent::Snapshot(snapshot));
    }

    fn progress_sink(&self) -> impl Fn(DownloadProgress) + Send + Sync + 'static {
        let events = self.events.clone();
        move |p| {
            let _ = events.send(OrchestratorEvent::ModelProgress(p));
        }
    }

    async fn update_session<T>(&self, id: &str, f: impl FnOnce(&mut SessionState) -> T) -> Result<T> {
        let (out, snapshot) = {
            let mut desk = self.desk.lock().await;
            let out = f(desk.session_mut(id)?);
            (out, desk.snapshot())
        };
        self.publish(snapshot);
        Ok(out)
    }

    // ---- models ----

    /// Reads the catalog and picks the selected model. Safe to call again to
    /// refresh: a selection that is no longer Ready falls back the same way.
    pub async fn init_models(&self) -> Option<String> {
        let list = self.models.catalog().list().await;
        let default_id = self.models.catalog().default_id();
        let snapshot = {
            let mut desk = self.desk.lock().await;
            desk.selected_model = pick_preferred(&list, desk.selected_model.as_deref(), default_id);
            desk.models = list;
            desk.snapshot()
        };
        info!(selected = ?snapshot.selected_model, models = snapshot.models.len(), "model catalog loaded");
        let selected = snapshot.selected_model.clone();
        self.publish(snapshot);
        selected
    }

    pub async fn set_model(&self, id: Option<String>) {
        let snapshot = {
            let mut desk = self.desk.lock().await;
            desk.selected_model = id;
            desk.snapshot()
        };
        self.publish(snapshot);
    }

    async fn reload_models(&self) {
        let list = self.models.catalog().list().await;
        let snapshot = {
            let mut desk = self.desk.lock().await;
            desk.models = list;
            desk.snapshot()
        };
        self.publish(snapshot);
    }

    pub async fn download_model(&self, id: &str) -> Result<ModelRecord> {
        let result = self.models.ensure_available(id, self.progress_sink()).await;
        self.reload_models().await;
        result
    }

    /// Deletes an artifact, unloading the engine first if it holds that file.
    pub async fn delete_model(&self, id: &str) -> Result<ModelRecord> {
        if self.models.is_downloading(id).await {
            return Err(DeskError::ModelBusy(id.to_string()));
        }
        let current = self.models.catalog().get(id).await?;
        if let Some(path) = &current.local_path {
            // No-op unless the engine holds this very file.
            self.engine.unload(Some(path.as_path())).await;
        }
        let record = self.models.delete(id).await?;
        self.init_models().await;
        Ok(record)
    }

    /// Starts fetching the catalog default in the background.
    pub fn prefetch_default_model(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let default_id = self.models.catalog().default_id()?.to_string();
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            match this.download_model(&default_id).await {
                Ok(record) => info!(model_id = %record.id(), "default model available"),
                Err(e) => error!(model_id = %default_id, error = %e, "default model download failed"),
            }
        }))
    }

    // ---- sessions ----

    async fn capture_screenshot(&self) -> Option<Screenshot> {
        match self.capture.capture().await {
            Ok(shot) => shot,
            Err(e) => {
                warn!(error = %e, "screenshot capture failed; continuing without one");
                None
            }
        }
    }

    pub async fn update_screenshot(&self, session_id: &str) -> Result<()> {
        self.desk.lock().await.session_mut(session_id)?;
        if let Some(shot) = self.capture_screenshot().await {
            self.update_session(session_id, |s| s.screenshot = Some(shot)).await?;
        }
        Ok(())
    }

    /// Runs one prompt through the selected model and leaves the session
    /// either Ready with a plan or in Error. Only an unknown session id is
    /// returned as an error.
    pub async fn run_prompt(&self, session_id: &str, prompt: &str) -> Result<()> {
        let needs_screenshot = self
            .update_session(session_id, |s| {
                s.status = SessionStatus::Thinking;
                s.error = None;
                s.messages.push(ChatMessage::new(Role::User, prompt));
                s.screenshot.is_none()
            })
            .await?;
        if needs_screenshot {
            if let Some(shot) = self.capture_screenshot().await {
                self.update_session(session_id, |s| s.screenshot = Some(shot)).await?;
            }
        }

        let screenshot = self.desk.lock().await.session_mut(session_id)?.screenshot.clone();
        let outcome = self.request_plan(prompt, screenshot.as_ref()).await;

        self.update_session(session_id, |s| match outcome {
            Ok(plan) => {
                s.messages.push(ChatMessage::new(Role::Agent, plan.summary.clone()));
                s.plan = Some(plan);
                s.status = SessionStatus::Ready;
            }
            Err(e) => {
                warn!(session_id = %s.id, error = %e, "prompt failed");
                s.status = SessionStatus::Error;
                s.error = Some(e.to_string());
            }
        })
        .await
    }

    async fn request_plan(&self, prompt: &str, screenshot: Option<&Screenshot>) -> Result<AgentPlan> {
        let model_id = match self.selected_model().await {
            Some(id) => id,
            None => self
                .models
                .catalog()
                .default_id()
                .map(str::to_string)
                .ok_or(DeskError::NoModelSelected)?,
        };

        let current = self.models.catalog().get(&model_id).await?;
        let record = if current.is_ready() {
            current
        } else {
            let fetched = self.models.ensure_available(&model_id, self.progress_sink()).await;
            self.reload_models().await;
            fetched?
        };
        let path = record
            .local_path
            .ok_or_else(|| DeskError::ModelPathMissing(model_id.clone()))?;

        self.engine.load(&path).await?;
        let raw = self.engine.run(&build_prompt(prompt, screenshot)).await?;
        match parse_plan(&raw) {
            Ok(plan) => Ok(plan),
            Err(DeskError::PlanUnparsable(reason)) => {
                warn!(model_id = %model_id, %reason, "model output unparsable, using placeholder plan");
                Ok(placeholder_plan())
            }
            Err(e) => Err(e),
        }
    }

    /// Executes the pending plan once. Without a plan this does nothing.
    pub async fn confirm_and_execute(&self, session_id: &str) -> Result<()> {
        let plan = {
            let mut desk = self.desk.lock().await;
            let session = desk.session_mut(session_id)?;
            let Some(plan) = session.plan.take() else {
                debug!(session_id, "no pending plan to execute");
                return Ok(());
            };
            session.status = SessionStatus::Running;
            session.error = None;
            let snapshot = desk.snapshot();
            drop(desk);
            self.publish(snapshot);
            plan
        };

        info!(session_id, steps = plan.actions.len(), "executing plan");
        let result = self.executor.execute(&plan.actions).await;
        self.update_session(session_id, |s| match result {
            // A prompt that finished meanwhile keeps its Ready status.
            Ok(()) => {
                if s.status == SessionStatus::Running {
                    s.status = SessionStatus::Idle;
                }
            }
            Err(e) => {
                let reason = match e {
                    DeskError::ExecutionFailed(reason) => reason,
                    other => other.to_string(),
                };
                warn!(session_id = %s.id, %reason, "plan execution failed");
                s.status = SessionStatus::Error;
                s.error = Some(DeskError::ExecutionFailed(reason).to_string());
            }
        })
        .await
    }
}
