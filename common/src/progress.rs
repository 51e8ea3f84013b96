use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, HashSet},
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{info, warn};

use crate::task::TaskId;

pub const DEFAULT_PROGRESS_FILE: &str = ".export_progress.json";

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("error de E/S con el checkpoint {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no se pudo serializar el checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Estado de avance de un export, persistido entre ejecuciones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub config_hash: String,
    /// En orden de finalización
    pub completed_tasks: Vec<TaskId>,
    /// task_id -> último mensaje de error
    pub failed_tasks: BTreeMap<TaskId, String>,
    pub total_tasks: usize,
    pub total_rows_exported: u64,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,

    #[serde(skip)]
    completed_index: HashSet<TaskId>,
}

/// Vista resumida para logs y para el subcomando `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSummary {
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub completion_rate: f64,
    pub total_rows_exported: u64,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl Progress {
    pub fn new(config_hash: impl Into<String>, total_tasks: usize) -> Self {
        let now = Utc::now();
        Self {
            config_hash: config_hash.into(),
            completed_tasks: Vec::new(),
            failed_tasks: BTreeMap::new(),
            total_tasks,
            total_rows_exported: 0,
            start_time: now,
            last_update: now,
            completed_index: HashSet::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_update = Utc::now();
    }

    /// true si el checkpoint corresponde a la misma configuración.
    pub fn validate(&self, config_hash: &str) -> bool {
        self.config_hash == config_hash
    }

    // el índice no se serializa: se reconstruye después de cargar
    fn ensure_index(&mut self) {
        if self.completed_index.len() != self.completed_tasks.len() {
            self.completed_index = self.completed_tasks.iter().cloned().collect();
        }
    }

    /// Idempotente: una tarea ya completada no vuelve a sumar filas.
    pub fn mark_completed(&mut self, task_id: &str, rows: u64) {
        self.ensure_index();
        if self.completed_index.insert(task_id.to_string()) {
            self.completed_tasks.push(task_id.to_string());
            self.total_rows_exported += rows;
        }
        self.failed_tasks.remove(task_id);
        self.touch();
    }

    /// Registra (o pisa) el error de una tarea.
    pub fn mark_failed(&mut self, task_id: &str, error: &str) {
        self.failed_tasks.insert(task_id.to_string(), error.to_string());
        self.touch();
    }

    pub fn is_completed(&mut self, task_id: &str) -> bool {
        self.ensure_index();
        self.completed_index.contains(task_id)
    }

    /// Todas las tareas menos las completadas, en el orden recibido.
    /// Las fallidas vuelven a quedar pendientes.
    pub fn pending(&mut self, all_tasks: &[TaskId]) -> Vec<TaskId> {
        self.ensure_index();
        all_tasks
            .iter()
            .filter(|id| !self.completed_index.contains(id.as_str()))
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> ProgressSummary {
        let completed = self.completed_tasks.len();
        let failed = self.failed_tasks.len();
        let completion_rate = if self.total_tasks == 0 {
            0.0
        } else {
            completed as f64 / self.total_tasks as f64 * 100.0
        };

        ProgressSummary {
            total_tasks: self.total_tasks,
            completed,
            failed,
            pending: self.total_tasks.saturating_sub(completed + failed),
            completion_rate,
            total_rows_exported: self.total_rows_exported,
            start_time: self.start_time,
            last_update: self.last_update,
        }
    }
}

/* =========================
   Hash de configuración
   ========================= */

/// "sha256:" + 16 primeros hex del SHA-256 del JSON canónico (claves ordenadas).
pub fn config_hash(config: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(config, &mut canonical);

    let digest = Sha256::digest(canonical.as_bytes());
    let hex = hex::encode(digest);
    format!("sha256:{}", &hex[..16])
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/* =========================
   Checkpoint store
   ========================= */

pub trait CheckpointStore: Send + Sync {
    /// `None` si no hay checkpoint o no se puede leer.
    fn load(&self) -> Option<Progress>;
    fn save(&self, progress: &Progress) -> Result<(), ProgressError>;
    fn reset(&self) -> Result<(), ProgressError>;
}

/// Checkpoint en un archivo JSON local.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn io_err(&self, source: io::Error) -> ProgressError {
        ProgressError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Option<Progress> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("no se pudo leer el checkpoint {}: {}", self.path.display(), e);
                return None;
            }
        };

        match serde_json::from_str::<Progress>(&raw) {
            Ok(mut progress) => {
                progress.ensure_index();
                info!(
                    "checkpoint cargado desde {} ({} completadas, {} fallidas)",
                    self.path.display(),
                    progress.completed_tasks.len(),
                    progress.failed_tasks.len()
                );
                Some(progress)
            }
            Err(e) => {
                warn!("checkpoint corrupto en {}, se ignora: {}", self.path.display(), e);
                None
            }
        }
    }

    fn save(&self, progress: &Progress) -> Result<(), ProgressError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
            }
        }

        let json = serde_json::to_string_pretty(progress)?;
        let tmp = self.tmp_path();
        fs::write(&tmp, json).map_err(|e| self.io_err(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;
        Ok(())
    }

    fn reset(&self) -> Result<(), ProgressError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("checkpoint {} eliminado", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }
}
