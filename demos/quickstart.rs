use anyhow::Result;
use multidesk::operator::{ActionExecutor, ScreenCapture};
use multidesk::{
    builtin_models, BackendConfig, BrowserConfig, ChromiumOperator, DeskConfig, InferenceEngineManager,
    ModelAcquisitionManager, NoopOperator, OpenAiCompatBackend, OrchestratorEvent, ReqwestTransport,
    SessionOrchestrator,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let prompt = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Open the settings menu".to_string());
    let execute = std::env::args().any(|a| a == "--execute");

    let cfg = DeskConfig::default();
    let transport = Arc::new(ReqwestTransport::new()?);
    let models = Arc::new(ModelAcquisitionManager::new(&cfg, builtin_models(), transport));
    let backend = Arc::new(OpenAiCompatBackend::new(BackendConfig::default()));
    let engine = Arc::new(
        InferenceEngineManager::new(backend, cfg.engine.clone()).with_prompt_timeout(cfg.prompt_timeout),
    );

    let (capture, executor): (Arc<dyn ScreenCapture>, Arc<dyn ActionExecutor>) =
        match std::env::var("CHROME_WS_URL").ok().filter(|ws| !ws.trim().is_empty()) {
            Some(ws) => {
                let op = Arc::new(ChromiumOperator::connect(&ws, BrowserConfig::default()).await?);
                (op.clone() as Arc<dyn ScreenCapture>, op as Arc<dyn ActionExecutor>)
            }
            None if std::env::var("MULTIDESK_BROWSER").is_ok() => {
                let op = Arc::new(
                    ChromiumOperator::launch(BrowserConfig { headless: false, ..Default::default() }).await?,
                );
                (op.clone() as Arc<dyn ScreenCapture>, op as Arc<dyn ActionExecutor>)
            }
            None => (Arc::new(NoopOperator) as Arc<dyn ScreenCapture>, Arc::new(NoopOperator) as Arc<dyn ActionExecutor>),
        };

    let desk = Arc::new(SessionOrchestrator::new(&cfg, models, engine, capture, executor));

    let mut events = desk.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let OrchestratorEvent::ModelProgress(p) = event {
                info!(model_id = %p.model_id, percent = p.percent, "download progress");
            }
        }
    });

    desk.init_models().await;
    if let Some(prefetch) = desk.prefetch_default_model() {
        prefetch.await?;
    }
    desk.init_models().await;

    desk.run_prompt("session-1", &prompt).await?;
    let snapshot = desk.snapshot().await;
    let session = &snapshot.sessions[0];
    println!("{}", serde_json::to_string_pretty(session)?);

    if execute {
        desk.confirm_and_execute("session-1").await?;
        let snapshot = desk.snapshot().await;
        println!("status after execution: {:?}", snapshot.sessions[0].status);
    }

    Ok(())
}
