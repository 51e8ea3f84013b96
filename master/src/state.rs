// master/src/state.rs

use common::{
    progress::{CheckpointStore, Progress, ProgressError, ProgressSummary},
    store::StoreClient,
    task::TaskResult,
};
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

/// Contadores de esta ejecución (el checkpoint acumula entre ejecuciones).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunCounters {
    pub finished: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rows: u64,
    pub cost: u64,
}

#[derive(Clone)]
pub struct EngineState {
    pub progress: Arc<Mutex<Progress>>,
    // un cliente por slot; se saca al empezar una tarea y se devuelve al terminar
    pub clients: Arc<Mutex<Vec<Box<dyn StoreClient>>>>,
    pub counters: Arc<Mutex<RunCounters>>,
    pub started_at: Instant,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EngineState {
    pub fn new(progress: Progress, clients: Vec<Box<dyn StoreClient>>) -> Self {
        Self {
            progress: Arc::new(Mutex::new(progress)),
            clients: Arc::new(Mutex::new(clients)),
            counters: Arc::new(Mutex::new(RunCounters::default())),
            started_at: Instant::now(),
        }
    }

    /// `None` si el pool quedó vacío (un cliente se perdió en un panic).
    pub fn checkout_client(&self) -> Option<Box<dyn StoreClient>> {
        lock(&self.clients).pop()
    }

    pub fn return_client(&self, client: Box<dyn StoreClient>) {
        lock(&self.clients).push(client);
    }

    pub fn take_clients(&self) -> Vec<Box<dyn StoreClient>> {
        std::mem::take(&mut *lock(&self.clients))
    }

    /// Aplica un resultado al progreso y a los contadores.
    /// Devuelve los contadores actualizados.
    pub fn record(&self, result: &TaskResult) -> RunCounters {
        {
            let mut progress = lock(&self.progress);
            if result.success {
                progress.mark_completed(&result.task_id, result.rows_exported);
            } else {
                let message = result.error_message.as_deref().unwrap_or("error desconocido");
                progress.mark_failed(&result.task_id, message);
            }
        }

        let mut counters = lock(&self.counters);
        counters.finished += 1;
        counters.rows += result.rows_exported;
        counters.cost += result.cost_consumed;
        if result.success {
            counters.succeeded += 1;
        } else {
            counters.failed += 1;
        }
        *counters
    }

    pub fn counters(&self) -> RunCounters {
        *lock(&self.counters)
    }

    pub fn progress_summary(&self) -> ProgressSummary {
        lock(&self.progress).summary()
    }

    pub fn progress_snapshot(&self) -> Progress {
        lock(&self.progress).clone()
    }

    pub fn save_progress(&self, checkpoint: &dyn CheckpointStore) -> Result<(), ProgressError> {
        let mut progress = lock(&self.progress);
        progress.touch();
        checkpoint.save(&progress)
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::MemoryStore;

    #[test]
    fn record_actualiza_progreso_y_contadores() {
        let state = EngineState::new(Progress::new("h", 2), vec![]);

        state.record(&TaskResult::succeeded("A", 10, 4, 0.1));
        let c = state.record(&TaskResult::failed("B", "boom", 1, 2, 0.1));

        assert_eq!(c.finished, 2);
        assert_eq!(c.succeeded, 1);
        assert_eq!(c.failed, 1);
        assert_eq!(c.rows, 11);
        assert_eq!(c.cost, 6);

        let p = state.progress_snapshot();
        assert_eq!(p.completed_tasks, vec!["A".to_string()]);
        assert_eq!(p.total_rows_exported, 10);
        assert_eq!(p.failed_tasks.get("B").map(String::as_str), Some("boom"));
    }

    #[test]
    fn pool_de_clientes_entrega_y_recibe() {
        let state = EngineState::new(Progress::new("h", 0), vec![Box::new(MemoryStore::new())]);

        let client = state.checkout_client().unwrap();
        assert!(state.checkout_client().is_none());
        state.return_client(client);
        assert_eq!(state.take_clients().len(), 1);
        assert!(state.checkout_client().is_none());
    }
}
