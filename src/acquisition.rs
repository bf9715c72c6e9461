use std::collections::HashMap;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::fs::{self as async_fs, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::catalog::{ModelCatalog, ModelDefinition, ModelRecord, ModelStatus};
use crate::config::DeskConfig;
use crate::error::{DeskError, Result};
use crate::transport::{Transport, TransportResponse};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub model_id: String,
    pub percent: u8,
}

type Outcome = Option<Result<ModelRecord>>;

/// One transfer in flight. Every caller asking for the same model id while
/// this exists subscribes to `progress` and waits on `outcome`.
pub(crate) struct DownloadTask {
    destination: PathBuf,
    progress: broadcast::Sender<DownloadProgress>,
    outcome: watch::Receiver<Outcome>,
}

/// Model id -> in-flight task. The single deduplication point for transfers.
pub(crate) type InFlight = Arc<Mutex<HashMap<String, DownloadTask>>>;

pub struct ModelAcquisitionManager {
    catalog: ModelCatalog,
    transport: Arc<dyn Transport>,
    in_flight: InFlight,
    max_redirects: usize,
    progress_buffer: usize,
}

impl ModelAcquisitionManager {
    pub fn new(cfg: &DeskConfig, definitions: Vec<ModelDefinition>, transport: Arc<dyn Transport>) -> Self {
        let in_flight = InFlight::default();
        Self {
            catalog: ModelCatalog::new(cfg.models_dir.clone(), definitions, in_flight.clone()),
            transport,
            in_flight,
            max_redirects: cfg.max_redirects,
            progress_buffer: cfg.progress_buffer.max(1),
        }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub async fn is_downloading(&self, id: &str) -> bool {
        self.in_flight.lock().await.contains_key(id)
    }

    /// Progress feed of an in-flight download, if there is one.
    pub async fn subscribe(&self, id: &str) -> Option<broadcast::Receiver<DownloadProgress>> {
        self.in_flight.lock().await.get(id).map(|t| t.progress.subscribe())
    }

    pub async fn ensure_available<F>(&self, id: &str, on_progress: F) -> Result<ModelRecord>
    where
        F: Fn(DownloadProgress) + Send + Sync,
    {
        let record = self.catalog.get(id).await?;
        if record.is_ready() {
            return Ok(record);
        }
        self.download(id, on_progress).await
    }

    /// Fetches the artifact, or joins the transfer already running for `id`.
    /// An artifact already on disk is returned as is, never fetched again.
    ///
    /// The transfer runs on its own task: a caller that stops waiting does not
    /// abort it, and its outcome reaches every caller that attached.
    pub async fn download<F>(&self, id: &str, on_progress: F) -> Result<ModelRecord>
    where
        F: Fn(DownloadProgress) + Send + Sync,
    {
        let def = self.catalog.definition(id)?.clone();

        let (progress, outcome) = {
            let mut tasks = self.in_flight.lock().await;
            if let Some(task) = tasks.get(id) {
                debug!(model_id = %id, dest = %task.destination.display(), "joining in-flight download");
                (task.progress.subscribe(), task.outcome.clone())
            } else {
                // A finished transfer leaves the map only after its rename, so
                // under this lock "no task" plus "file present" means Ready.
                let ready = self.catalog.record(&def, false).await;
                if ready.is_ready() {
                    debug!(model_id = %id, "artifact already on disk");
                    return Ok(ready);
                }

                let destination = self.catalog.artifact_path(&def);
                let (progress_tx, progress_rx) = broadcast::channel(self.progress_buffer);
                let (outcome_tx, outcome_rx) = watch::channel(None);
                tasks.insert(
                    id.to_string(),
                    DownloadTask {
                        destination: destination.clone(),
                        progress: progress_tx.clone(),
                        outcome: outcome_rx.clone(),
                    },
                );
                info!(model_id = %id, url = %def.url, dest = %destination.display(), "starting model download");

                let job = Transfer {
                    transport: Arc::clone(&self.transport),
                    def,
                    destination,
                    max_redirects: self.max_redirects,
                    progress: progress_tx,
                };
                let in_flight = Arc::clone(&self.in_flight);
                let model_id = id.to_string();
                tokio::spawn(async move {
                    // The transfer gets its own task so a panic in it still
                    // clears the map entry below.
                    let result = match tokio::spawn(async move { job.run().await }).await {
                        Ok(result) => result,
                        Err(e) => {
                            error!(model_id = %model_id, error = %e, "download task aborted");
                            Err(DeskError::Io(format!("download task aborted: {}", e)))
                        }
                    };
                    // Leave the map before publishing so a waiter that wakes up
                    // and lists models no longer sees `Downloading`.
                    in_flight.lock().await.remove(&model_id);
                    let _ = outcome_tx.send(Some(result));
                });

                (progress_rx, outcome_rx)
            }
        };

        wait_for_outcome(progress, outcome, &on_progress).await
    }

    /// Removes the artifact. Refused while a download for `id` is running.
    pub async fn delete(&self, id: &str) -> Result<ModelRecord> {
        let def = self.catalog.definition(id)?;
        // Held across the removal so no transfer can start in between.
        let tasks = self.in_flight.lock().await;
        if tasks.contains_key(id) {
            return Err(DeskError::ModelBusy(id.to_string()));
        }
        let file = self.catalog.artifact_path(def);
        match async_fs::remove_file(&file).await {
            Ok(()) => info!(model_id = %id, path = %file.display(), "deleted model artifact"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        drop(tasks);
        Ok(ModelRecord {
            definition: def.clone(),
            local_path: None,
            status: ModelStatus::NotDownloaded,
        })
    }
}

async fn wait_for_outcome<F>(
    mut progress: broadcast::Receiver<DownloadProgress>,
    mut outcome: watch::Receiver<Outcome>,
    on_progress: &F,
) -> Result<ModelRecord>
where
    F: Fn(DownloadProgress) + Send + Sync,
{
    loop {
        tokio::select! {
            biased;
            event = progress.recv() => match event {
                Ok(p) => on_progress(p),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "progress observer lagged"),
                Err(RecvError::Closed) => break,
            },
            changed = outcome.changed() => {
                if changed.is_err() || outcome.borrow().is_some() {
                    break;
                }
            }
        }
    }
    // Events published before the outcome are still buffered.
    loop {
        match progress.try_recv() {
            Ok(p) => on_progress(p),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    let result = outcome.borrow().clone();
    result.unwrap_or_else(|| Err(DeskError::Io("download task ended without a result".into())))
}

// ========================= Transfer =========================

struct Transfer {
    transport: Arc<dyn Transport>,
    def: ModelDefinition,
    destination: PathBuf,
    max_redirects: usize,
    progress: broadcast::Sender<DownloadProgress>,
}

impl Transfer {
    async fn run(&self) -> Result<ModelRecord> {
        let staging = staging_path(&self.destination);
        match self.fetch_to(&staging).await {
            Ok(()) => {
                info!(model_id = %self.def.id, path = %self.destination.display(), "model download complete");
                Ok(ModelRecord {
                    definition: self.def.clone(),
                    local_path: Some(self.destination.clone()),
                    status: ModelStatus::Ready,
                })
            }
            Err(err) => {
                warn!(model_id = %self.def.id, error = %err, "model download failed");
                if let Err(e) = async_fs::remove_file(&staging).await {
                    if e.kind() != ErrorKind::NotFound {
                        warn!(path = %staging.display(), error = %e, "failed to remove partial download");
                    }
                }
                Err(err)
            }
        }
    }

    async fn fetch_to(&self, staging: &Path) -> Result<()> {
        if let Some(parent) = self.destination.parent() {
            async_fs::create_dir_all(parent).await?;
        }

        let response = self.follow_redirects().await?;
        let total = response.content_length;
        let mut body = response.body;
        let mut file = File::create(staging).await?;
        let mut received: u64 = 0;
        let mut last: u8 = 0;

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if let Some(total) = total {
                let pct = percent(received, total);
                if pct > last {
                    last = pct;
                    self.emit(pct);
                }
            }
        }

        file.flush().await?;
        drop(file);
        async_fs::rename(staging, &self.destination).await?;

        if last != 100 {
            self.emit(100);
        }
        Ok(())
    }

    async fn follow_redirects(&self) -> Result<TransportResponse> {
        let mut url = self.def.url.clone();
        let mut redirects = 0;
        loop {
            let resp = self.transport.get(&url).await?;
            if resp.is_redirect() {
                let Some(location) = resp.location.as_deref() else {
                    return Err(DeskError::DownloadFailed(resp.status));
                };
                if redirects >= self.max_redirects {
                    return Err(DeskError::TooManyRedirects(self.max_redirects));
                }
                redirects += 1;
                url = resolve_location(&url, location);
                debug!(model_id = %self.def.id, hop = redirects, %url, "following redirect");
                continue;
            }
            if resp.status >= 400 {
                return Err(DeskError::DownloadFailed(resp.status));
            }
            return Ok(resp);
        }
    }

    fn emit(&self, percent: u8) {
        // No receivers is fine.
        let _ = self.progress.send(DownloadProgress { model_id: self.def.id.clone(), percent });
    }
}

fn percent(received: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    (received.saturating_mul(100) / total).min(100) as u8
}

fn staging_path(destination: &Path) -> PathBuf {
    let mut name = OsString::from(destination.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

fn resolve_location(current: &str, location: &str) -> String {
    Url::parse(current)
        .and_then(|base| base.join(location))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| location.to_string())
}
