use std::collections::HashSet;
use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::acquisition::InFlight;
use crate::error::{DeskError, Result};

// ========================= Catalog Types =========================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub id: String,
    pub label: String,
    pub size_mb: u32,
    pub url: String,
    #[serde(default)]
    pub default_selected: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelStatus {
    NotDownloaded,
    Downloading,
    Ready,
}

/// A definition joined with what is currently true on disk. Never stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    #[serde(flatten)]
    pub definition: ModelDefinition,
    pub local_path: Option<PathBuf>,
    pub status: ModelStatus,
}

impl ModelRecord {
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn is_ready(&self) -> bool {
        self.status == ModelStatus::Ready
    }
}

pub fn builtin_models() -> Vec<ModelDefinition> {
    vec![
        ModelDefinition {
            id: "ui-tars-small".into(),
            label: "UI-TARS 7B i1 (GGUF, small)".into(),
            size_mb: 2700,
            url: "https://huggingface.co/mradermacher/UI-TARS-1.5-7B-i1-GGUF/resolve/main/UI-TARS-1.5-7B-i1-GGUF.gguf".into(),
            default_selected: true,
        },
        ModelDefinition {
            id: "ui-tars-1.5".into(),
            label: "UI-TARS 1.5 (GUI)".into(),
            size_mb: 800,
            url: "https://example.com/ui-tars-1.5.bin".into(),
            default_selected: false,
        },
        ModelDefinition {
            id: "ui-tars-1.5-lite".into(),
            label: "UI-TARS 1.5 Lite".into(),
            size_mb: 400,
            url: "https://example.com/ui-tars-1.5-lite.bin".into(),
            default_selected: false,
        },
    ]
}

/// `<models_dir>/<id><ext>`, where ext comes from the URL path and falls back to `.bin`.
pub fn artifact_path(models_dir: &Path, def: &ModelDefinition) -> PathBuf {
    let url_path = Url::parse(&def.url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| def.url.clone());
    let file_name = match Path::new(&url_path).extension().and_then(|e| e.to_str()) {
        Some(ext) if !ext.is_empty() => format!("{}.{}", def.id, ext),
        _ => format!("{}.bin", def.id),
    };
    models_dir.join(file_name)
}

// ========================= Catalog =========================

/// Read-only view over the model definitions. Writes go through
/// [`crate::ModelAcquisitionManager`], which shares its in-flight set with
/// the catalog so a model being fetched reports `Downloading`.
pub struct ModelCatalog {
    definitions: Vec<ModelDefinition>,
    models_dir: PathBuf,
    in_flight: InFlight,
}

impl ModelCatalog {
    pub(crate) fn new(models_dir: PathBuf, definitions: Vec<ModelDefinition>, in_flight: InFlight) -> Self {
        Self { definitions, models_dir, in_flight }
    }

    pub fn definitions(&self) -> &[ModelDefinition] {
        &self.definitions
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub(crate) fn definition(&self, id: &str) -> Result<&ModelDefinition> {
        self.definitions
            .iter()
            .find(|d| d.id == id)
            .ok_or_else(|| DeskError::UnknownModel(id.to_string()))
    }

    pub fn artifact_path(&self, def: &ModelDefinition) -> PathBuf {
        artifact_path(&self.models_dir, def)
    }

    pub async fn list(&self) -> Vec<ModelRecord> {
        let downloading: HashSet<String> = self.in_flight.lock().await.keys().cloned().collect();
        let mut records = Vec::with_capacity(self.definitions.len());
        for def in &self.definitions {
            records.push(self.record(def, downloading.contains(&def.id)).await);
        }
        records
    }

    pub async fn get(&self, id: &str) -> Result<ModelRecord> {
        let def = self.definition(id)?;
        let downloading = self.in_flight.lock().await.contains_key(id);
        Ok(self.record(def, downloading).await)
    }

    pub fn default_id(&self) -> Option<&str> {
        self.definitions
            .iter()
            .find(|d| d.default_selected)
            .map(|d| d.id.as_str())
    }

    pub(crate) async fn record(&self, def: &ModelDefinition, downloading: bool) -> ModelRecord {
        let file = self.artifact_path(def);
        let exists = fs::metadata(&file).await.is_ok_and(|m| m.is_file());
        let status = if downloading {
            ModelStatus::Downloading
        } else if exists {
            ModelStatus::Ready
        } else {
            ModelStatus::NotDownloaded
        };
        ModelRecord {
            definition: def.clone(),
            local_path: exists.then_some(file),
            status,
        }
    }
}
