use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every failure the managers and the orchestrator can report.
///
/// Clone so that one download outcome can be handed to every caller that
/// attached to the same in-flight task.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeskError {
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("model {0} is currently downloading; wait for it to finish before deleting")]
    ModelBusy(String),
    #[error("model download failed with status {0}")]
    DownloadFailed(u16),
    #[error("too many redirects while downloading model (limit {0})")]
    TooManyRedirects(usize),
    #[error("inference engine not initialized")]
    EngineNotInitialized,
    #[error("model output could not be parsed as a plan: {0}")]
    PlanUnparsable(String),
    #[error("action execution failed: {0}")]
    ExecutionFailed(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("no model selected")]
    NoModelSelected,
    #[error("model path missing after download: {0}")]
    ModelPathMissing(String),
    #[error("engine error: {0}")]
    Engine(String),
    #[error("screenshot capture failed: {0}")]
    Capture(String),
    #[error("timeout: {0}")]
    Timeout(String),
}

impl From<std::io::Error> for DeskError {
    fn from(err: std::io::Error) -> Self {
        DeskError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for DeskError {
    fn from(err: reqwest::Error) -> Self {
        DeskError::Io(format!("network: {}", err))
    }
}

pub type Result<T, E = DeskError> = std::result::Result<T, E>;
