use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SESSION_COUNT: usize = 4;
pub const MAX_REDIRECTS: usize = 5;

/// Sampling applied to every prompt submitted to the loaded engine.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub trim_whitespace_suffix: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self { temperature: 0.2, top_p: 0.9, trim_whitespace_suffix: true }
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub context_size: u32,
    pub sampling: SamplingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { context_size: 4096, sampling: SamplingConfig::default() }
    }
}

#[derive(Clone, Debug)]
pub struct DeskConfig {
    pub models_dir: PathBuf,      // env MULTIDESK_MODELS_DIR
    pub session_count: usize,     // env MULTIDESK_SESSIONS
    pub max_redirects: usize,
    pub progress_buffer: usize,
    pub prompt_timeout: Option<Duration>, // env MULTIDESK_PROMPT_TIMEOUT_MS
    pub engine: EngineConfig,
}

impl Default for DeskConfig {
    fn default() -> Self {
        Self {
            models_dir: env::var("MULTIDESK_MODELS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_models_dir()),
            session_count: env::var("MULTIDESK_SESSIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_SESSION_COUNT),
            max_redirects: MAX_REDIRECTS,
            progress_buffer: 64,
            prompt_timeout: env::var("MULTIDESK_PROMPT_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis),
            engine: EngineConfig::default(),
        }
    }
}

impl DeskConfig {
    /// Defaults with storage rooted at `models_dir`, ignoring the environment
    /// for the directory.
    pub fn with_models_dir(models_dir: impl Into<PathBuf>) -> Self {
        Self { models_dir: models_dir.into(), ..Self::default() }
    }
}

fn default_models_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(env::temp_dir)
        .join("multidesk")
        .join("models")
}
