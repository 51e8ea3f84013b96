use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::progress::Progress;

pub type RunId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Interrupted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
            RunStatus::Interrupted => "INTERRUPTED",
        };
        f.write_str(s)
    }
}

/// Resumen final de una ejecución del export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,

    /// -------- Tareas --------
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub completion_rate: f64,

    /// -------- Volumen y costo --------
    pub total_rows_exported: u64,
    pub total_cost: u64,
    pub duration_secs: f64,
    pub avg_cost_per_sec: f64,

    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,

    /// Error del guardado final del checkpoint, si lo hubo
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_error: Option<String>,
}

impl RunSummary {
    /// `total_cost` y `duration_secs` son de esta ejecución; el resto sale del checkpoint.
    pub fn from_progress(
        run_id: impl Into<RunId>,
        status: RunStatus,
        progress: &Progress,
        total_cost: u64,
        duration_secs: f64,
    ) -> Self {
        let s = progress.summary();
        let avg_cost_per_sec = if duration_secs > 0.0 {
            total_cost as f64 / duration_secs
        } else {
            0.0
        };

        Self {
            run_id: run_id.into(),
            status,
            total_tasks: s.total_tasks,
            completed: s.completed,
            failed: s.failed,
            pending: s.pending,
            completion_rate: s.completion_rate,
            total_rows_exported: s.total_rows_exported,
            total_cost,
            duration_secs,
            avg_cost_per_sec,
            start_time: s.start_time,
            last_update: s.last_update,
            checkpoint_error: None,
        }
    }

    /// Código de salida del proceso: 0 ok, 1 con fallas, 130 interrumpido.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Succeeded => 0,
            RunStatus::Failed => 1,
            RunStatus::Interrupted => 130,
        }
    }
}
