use crate::state::EngineState;
use std::time::Duration;
use tracing::info;

/// Loguea el avance cada `interval` mientras el export corre.
/// El scheduler aborta esta tarea al terminar.
pub async fn monitor_progress(state: EngineState, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;

        let summary = state.progress_summary();
        let counters = state.counters();
        let elapsed = state.elapsed_secs();
        let cost_per_sec = if elapsed > 0.0 {
            counters.cost as f64 / elapsed
        } else {
            0.0
        };

        info!(
            "progreso: {}/{} tareas ({:.1}%), {} fallidas, {} filas, {} CU ({:.1} CU/s)",
            summary.completed,
            summary.total_tasks,
            summary.completion_rate,
            summary.failed,
            summary.total_rows_exported,
            counters.cost,
            cost_per_sec
        );
    }
}
