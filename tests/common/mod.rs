#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::Notify;

use multidesk::engine::{ChatSession, ContextHandle, EngineBackend, ModelHandle};
use multidesk::error::{DeskError, Result};
use multidesk::operator::{ActionExecutor, ScreenCapture, Screenshot};
use multidesk::transport::{Transport, TransportResponse};
use multidesk::{AgentAction, ModelDefinition, SamplingConfig};

pub fn definition(id: &str, url: &str, default_selected: bool) -> ModelDefinition {
    ModelDefinition {
        id: id.into(),
        label: format!("Model {}", id),
        size_mb: 1,
        url: url.into(),
        default_selected,
    }
}

// ========================= Transport =========================

#[derive(Clone, Default)]
pub struct Route {
    pub status: u16,
    pub location: Option<String>,
    pub content_length: Option<u64>,
    pub chunks: Vec<Vec<u8>>,
    /// Fail the body with this error after all chunks.
    pub fail_with: Option<DeskError>,
    /// Hold the last chunk until notified.
    pub gate: Option<Arc<Notify>>,
    /// Blow up inside `get`.
    pub panics: bool,
}

impl Route {
    pub fn ok(chunks: Vec<Vec<u8>>, content_length: Option<u64>) -> Self {
        Self { status: 200, content_length, chunks, ..Default::default() }
    }

    pub fn redirect(to: &str) -> Self {
        Self { status: 302, location: Some(to.into()), ..Default::default() }
    }

    pub fn status(status: u16) -> Self {
        Self { status, ..Default::default() }
    }
}

#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, url: &str, route: Route) {
        self.routes.lock().unwrap().insert(url.to_string(), route);
    }

    pub fn requests_for(&self, url: &str) -> usize {
        self.requests.lock().unwrap().iter().filter(|u| *u == url).count()
    }

    pub fn total_requests(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn get(&self, url: &str) -> Result<TransportResponse> {
        self.requests.lock().unwrap().push(url.to_string());
        let route = self
            .routes
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(|| Route::status(404));
        if route.panics {
            panic!("transport fell over while fetching {}", url);
        }

        let mut chunks: Vec<Result<Vec<u8>>> = route.chunks.into_iter().map(Ok).collect();
        let last = match route.gate {
            Some(_) => chunks.pop(),
            None => None,
        };
        let head = stream::iter(chunks);
        let gate = route.gate.clone();
        let tail = stream::iter(last).then(move |chunk| {
            let gate = gate.clone();
            async move {
                tokio::task::yield_now().await;
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                chunk
            }
        });
        let failure = stream::iter(route.fail_with.map(Err));
        Ok(TransportResponse {
            status: route.status,
            location: route.location,
            content_length: route.content_length,
            body: head.chain(tail).chain(failure).boxed(),
        })
    }
}

// ========================= Engine Backend =========================

#[derive(Default)]
pub struct Counters {
    pub models_loaded: AtomicUsize,
    pub contexts_created: AtomicUsize,
    pub sessions_created: AtomicUsize,
    pub models_disposed: AtomicUsize,
    pub contexts_disposed: AtomicUsize,
    pub sessions_disposed: AtomicUsize,
    pub prompts: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct FakeBackend {
    pub counters: Arc<Counters>,
    pub log: Arc<Mutex<Vec<String>>>,
    pub reply: Arc<Mutex<String>>,
    pub fail_context: AtomicBool,
    pub fail_session_dispose: Arc<AtomicBool>,
    pub load_delay: Duration,
    pub prompt_delay: Duration,
}

impl FakeBackend {
    pub fn new(reply: &str) -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            log: Arc::new(Mutex::new(Vec::new())),
            reply: Arc::new(Mutex::new(reply.to_string())),
            fail_context: AtomicBool::new(false),
            fail_session_dispose: Arc::new(AtomicBool::new(false)),
            load_delay: Duration::from_millis(10),
            prompt_delay: Duration::ZERO,
        }
    }

    pub fn set_reply(&self, reply: &str) {
        *self.reply.lock().unwrap() = reply.to_string();
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

fn name_of(path: &Path) -> String {
    path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default()
}

#[async_trait]
impl EngineBackend for FakeBackend {
    async fn load_model(&self, path: &Path) -> Result<Box<dyn ModelHandle>> {
        let name = name_of(path);
        self.log.lock().unwrap().push(format!("load-model:{}", name));
        tokio::time::sleep(self.load_delay).await;
        self.counters.models_loaded.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeModel {
            name,
            counters: self.counters.clone(),
            log: self.log.clone(),
            reply: self.reply.clone(),
            fail_context: self.fail_context.load(Ordering::SeqCst),
            fail_session_dispose: self.fail_session_dispose.clone(),
            prompt_delay: self.prompt_delay,
        }))
    }
}

struct FakeModel {
    name: String,
    counters: Arc<Counters>,
    log: Arc<Mutex<Vec<String>>>,
    reply: Arc<Mutex<String>>,
    fail_context: bool,
    fail_session_dispose: Arc<AtomicBool>,
    prompt_delay: Duration,
}

#[async_trait]
impl ModelHandle for FakeModel {
    async fn create_context(&self, _context_size: u32) -> Result<Box<dyn ContextHandle>> {
        if self.fail_context {
            self.log.lock().unwrap().push(format!("context-failed:{}", self.name));
            return Err(DeskError::Engine("out of memory".into()));
        }
        self.counters.contexts_created.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(format!("create-context:{}", self.name));
        Ok(Box::new(FakeContext {
            name: self.name.clone(),
            counters: self.counters.clone(),
            log: self.log.clone(),
            reply: self.reply.clone(),
            fail_session_dispose: self.fail_session_dispose.clone(),
            prompt_delay: self.prompt_delay,
        }))
    }

    async fn dispose(&self) -> Result<()> {
        self.counters.models_disposed.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(format!("dispose-model:{}", self.name));
        Ok(())
    }
}

struct FakeContext {
    name: String,
    counters: Arc<Counters>,
    log: Arc<Mutex<Vec<String>>>,
    reply: Arc<Mutex<String>>,
    fail_session_dispose: Arc<AtomicBool>,
    prompt_delay: Duration,
}

#[async_trait]
impl ContextHandle for FakeContext {
    async fn create_session(&self) -> Result<Box<dyn ChatSession>> {
        self.counters.sessions_created.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(format!("create-session:{}", self.name));
        Ok(Box::new(FakeSession {
            name: self.name.clone(),
            counters: self.counters.clone(),
            log: self.log.clone(),
            reply: self.reply.clone(),
            fail_dispose: self.fail_session_dispose.clone(),
            prompt_delay: self.prompt_delay,
            busy: tokio::sync::Mutex::new(()),
        }))
    }

    async fn dispose(&self) -> Result<()> {
        self.counters.contexts_disposed.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(format!("dispose-context:{}", self.name));
        Ok(())
    }
}

struct FakeSession {
    name: String,
    counters: Arc<Counters>,
    log: Arc<Mutex<Vec<String>>>,
    reply: Arc<Mutex<String>>,
    fail_dispose: Arc<AtomicBool>,
    prompt_delay: Duration,
    busy: tokio::sync::Mutex<()>,
}

#[async_trait]
impl ChatSession for FakeSession {
    async fn prompt(&self, _prompt: &str, _sampling: &SamplingConfig) -> Result<String> {
        let _one_at_a_time = self.busy.lock().await;
        if !self.prompt_delay.is_zero() {
            tokio::time::sleep(self.prompt_delay).await;
        }
        self.counters.prompts.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.lock().unwrap().clone())
    }

    async fn dispose(&self) -> Result<()> {
        self.counters.sessions_disposed.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(format!("dispose-session:{}", self.name));
        if self.fail_dispose.load(Ordering::SeqCst) {
            return Err(DeskError::Engine("session refused to release".into()));
        }
        Ok(())
    }
}

// ========================= Operator =========================

#[derive(Default)]
pub struct FakeOperator {
    pub captures: AtomicUsize,
    pub executed: Mutex<Vec<Vec<AgentAction>>>,
    pub fail_execute: AtomicBool,
    pub no_surface: AtomicBool,
    /// Execution waits here until notified.
    pub hold: Mutex<Option<Arc<Notify>>>,
}

#[async_trait]
impl ScreenCapture for FakeOperator {
    async fn capture(&self) -> Result<Option<Screenshot>> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        if self.no_surface.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(Screenshot::png("iVBORw0KGgo=")))
    }
}

#[async_trait]
impl ActionExecutor for FakeOperator {
    async fn execute(&self, actions: &[AgentAction]) -> Result<()> {
        self.executed.lock().unwrap().push(actions.to_vec());
        let hold = self.hold.lock().unwrap().clone();
        if let Some(hold) = hold {
            hold.notified().await;
        }
        if self.fail_execute.load(Ordering::SeqCst) {
            return Err(DeskError::ExecutionFailed("pointer device unavailable".into()));
        }
        Ok(())
    }
}
