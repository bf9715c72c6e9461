pub mod acquisition;
pub mod backend;
pub mod browser;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod operator;
pub mod plan;
pub mod session;
pub mod transport;

pub use acquisition::{DownloadProgress, ModelAcquisitionManager};
pub use backend::{BackendConfig, OpenAiCompatBackend};
pub use browser::BrowserConfig;
pub use catalog::{builtin_models, ModelCatalog, ModelDefinition, ModelRecord, ModelStatus};
pub use config::{DeskConfig, EngineConfig, SamplingConfig};
pub use engine::{EngineBackend, EnginePhase, InferenceEngineManager};
pub use error::DeskError;
pub use operator::{ActionExecutor, ChromiumOperator, NoopOperator, ScreenCapture, Screenshot};
pub use plan::{ActionKind, AgentAction, AgentPlan};
pub use session::{OrchestratorEvent, SessionOrchestrator, SessionState, SessionStatus};
pub use transport::{ReqwestTransport, Transport};
