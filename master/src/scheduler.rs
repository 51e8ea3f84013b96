use common::{
    config::{ConfigError, ExportConfig},
    progress::{config_hash, CheckpointStore, FileCheckpointStore, Progress, DEFAULT_PROGRESS_FILE},
    run::{RunStatus, RunSummary},
    store::{StoreClient, StoreConnector, StoreError},
    task::{TaskDefinition, TaskId, TaskLoadError, TaskLoader, TaskMap, TaskResult},
    CsvWriter, FilterError, WriterError,
};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;
use worker::{TaskExporter, DEFAULT_BATCH_SIZE};

use crate::{monitor, state::EngineState};

pub const DEFAULT_THREADS: usize = 4;
/// Cada cuántas tareas terminadas se guarda el checkpoint.
pub const SAVE_EVERY: u64 = 10;
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("filtros inválidos en la tarea {task_id}: {source}")]
    InvalidFilters {
        task_id: TaskId,
        #[source]
        source: FilterError,
    },

    #[error(transparent)]
    Tasks(#[from] TaskLoadError),

    #[error("no se pudo conectar al store: {0}")]
    Connection(#[source] StoreError),

    #[error(transparent)]
    Output(#[from] WriterError),

    #[error("error interno del engine: {0}")]
    Internal(String),
}

#[derive(Clone)]
pub struct ExportOptions {
    pub threads: usize,
    pub batch_size: usize,
    /// Pisa `output.directory` de la config
    pub output_dir: Option<PathBuf>,
    pub checkpoint: Arc<dyn CheckpointStore>,
    pub monitor_interval: Duration,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            batch_size: DEFAULT_BATCH_SIZE,
            output_dir: None,
            checkpoint: Arc::new(FileCheckpointStore::new(DEFAULT_PROGRESS_FILE)),
            monitor_interval: MONITOR_INTERVAL,
        }
    }
}

/// Engine del export: pool de clientes, pool acotado de workers y checkpoints.
pub struct Exporter {
    config: ExportConfig,
    tasks: Arc<TaskMap>,
    connector: Arc<dyn StoreConnector>,
    exporter: Arc<TaskExporter>,
    options: ExportOptions,
    clients: Vec<Box<dyn StoreClient>>,
}

impl Exporter {
    /// Valida la config, carga las tareas, revisa sus filtros y conecta
    /// `threads` clientes. Cualquier error acá es fatal.
    pub async fn new(
        config: ExportConfig,
        connector: Arc<dyn StoreConnector>,
        options: ExportOptions,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let threads = options.threads.max(1);

        let loader = TaskLoader::new();
        let tasks = loader.load(&config.tasks)?;
        if tasks.is_empty() {
            warn!("ninguna tarea tiene columnas; no hay nada para exportar");
        }

        let output_dir = options
            .output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(&config.output.directory));
        let writer = Arc::new(CsvWriter::new(&output_dir)?);
        let exporter = Arc::new(TaskExporter::new(&config, writer, options.batch_size));
        preflight(&exporter, &tasks)?;

        // el connect es bloqueante (cliente HTTP síncrono)
        let init_connector = Arc::clone(&connector);
        let clients = tokio::task::spawn_blocking(move || {
            (0..threads)
                .map(|_| init_connector.connect())
                .collect::<Result<Vec<_>, _>>()
        })
        .await
        .map_err(|e| EngineError::Internal(e.to_string()))?
        .map_err(EngineError::Connection)?;

        info!(
            "engine listo: tabla={}, {} tareas, {} workers, salida en {}",
            config.table,
            tasks.len(),
            threads,
            output_dir.display()
        );

        Ok(Self {
            config,
            tasks: Arc::new(tasks),
            connector,
            exporter,
            options: ExportOptions { threads, ..options },
            clients,
        })
    }

    pub fn tasks(&self) -> &TaskMap {
        &self.tasks
    }

    /// Corre (o retoma) el export. `cancel` se puede activar desde afuera (Ctrl+C).
    pub async fn run(self, resume: bool, cancel: Arc<AtomicBool>) -> Result<RunSummary, EngineError> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("export", run_id = %run_id);
        self.run_inner(run_id, resume, cancel).instrument(span).await
    }

    async fn run_inner(
        mut self,
        run_id: String,
        resume: bool,
        cancel: Arc<AtomicBool>,
    ) -> Result<RunSummary, EngineError> {
        let checkpoint = Arc::clone(&self.options.checkpoint);
        let hash = config_hash(&self.config.to_value());

        // LOAD_OR_CREATE_PROGRESS
        let mut progress = self.load_or_create_progress(resume, &hash);
        progress.total_tasks = self.tasks.len();

        // SCHEDULING
        let all_ids: Vec<TaskId> = self.tasks.keys().cloned().collect();
        let pending = progress.pending(&all_ids);
        info!(
            "tareas: {} en total, {} completadas, {} pendientes",
            all_ids.len(),
            all_ids.len() - pending.len(),
            pending.len()
        );

        let state = EngineState::new(progress, std::mem::take(&mut self.clients));

        if pending.is_empty() {
            info!("no hay tareas pendientes");
        } else {
            self.run_pending(&state, pending, &cancel, checkpoint.as_ref()).await;
        }

        // FINALIZING
        let checkpoint_error = match state.save_progress(checkpoint.as_ref()) {
            Ok(()) => None,
            Err(e) => {
                warn!("no se pudo guardar el checkpoint final: {}", e);
                Some(e.to_string())
            }
        };

        let interrupted = cancel.load(Ordering::SeqCst);
        let snapshot = state.progress_snapshot();
        let status = if interrupted {
            RunStatus::Interrupted
        } else if !snapshot.failed_tasks.is_empty() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };

        let counters = state.counters();
        let mut summary = RunSummary::from_progress(run_id, status, &snapshot, counters.cost, state.elapsed_secs());
        summary.checkpoint_error = checkpoint_error;

        // los clientes bloqueantes se sueltan fuera del executor
        let clients = state.take_clients();
        let _ = tokio::task::spawn_blocking(move || drop(clients)).await;

        info!(
            "export {}: {} completadas, {} fallidas, {} pendientes, {} filas, {} CU en {:.1}s",
            summary.status,
            summary.completed,
            summary.failed,
            summary.pending,
            summary.total_rows_exported,
            summary.total_cost,
            summary.duration_secs
        );
        Ok(summary)
    }

    fn load_or_create_progress(&self, resume: bool, hash: &str) -> Progress {
        if !resume {
            return Progress::new(hash, self.tasks.len());
        }

        match self.options.checkpoint.load() {
            Some(progress) if progress.validate(hash) => {
                info!("retomando desde el checkpoint ({} completadas)", progress.completed_tasks.len());
                progress
            }
            Some(progress) => {
                warn!(
                    "la config cambió desde el último checkpoint ({} != {}), se empieza de cero",
                    progress.config_hash, hash
                );
                Progress::new(hash, self.tasks.len())
            }
            None => {
                info!("no hay checkpoint previo, se empieza de cero");
                Progress::new(hash, self.tasks.len())
            }
        }
    }

    /// RUNNING: una unidad por tarea pendiente, a lo sumo `threads` a la vez.
    async fn run_pending(
        &self,
        state: &EngineState,
        pending: Vec<TaskId>,
        cancel: &Arc<AtomicBool>,
        checkpoint: &dyn CheckpointStore,
    ) {
        let monitor = tokio::spawn(monitor::monitor_progress(state.clone(), self.options.monitor_interval));
        let sem = Arc::new(Semaphore::new(self.options.threads));
        let mut units = JoinSet::new();

        for task_id in pending {
            let sem = Arc::clone(&sem);
            let state = state.clone();
            let tasks = Arc::clone(&self.tasks);
            let exporter = Arc::clone(&self.exporter);
            let connector = Arc::clone(&self.connector);
            let cancel = Arc::clone(cancel);

            units.spawn(async move {
                let _permit = sem.acquire_owned().await.ok()?;
                if cancel.load(Ordering::SeqCst) {
                    return None;
                }
                let task = tasks.get(&task_id)?.clone();
                run_unit(state, exporter, connector, task, cancel).await
            });
        }

        while let Some(joined) = units.join_next().await {
            let result = match joined {
                Ok(Some(result)) => result,
                Ok(None) => continue,
                Err(e) => {
                    error!("una unidad de trabajo terminó de forma inesperada: {}", e);
                    continue;
                }
            };

            if !result.success {
                warn!(
                    "✗ tarea {} falló: {}",
                    result.task_id,
                    result.error_message.as_deref().unwrap_or("-")
                );
            }

            let counters = state.record(&result);
            if counters.finished % SAVE_EVERY == 0 {
                if let Err(e) = state.save_progress(checkpoint) {
                    warn!("no se pudo guardar el checkpoint: {}", e);
                }
            }
        }

        monitor.abort();
    }
}

/// Filtros mal formados (chunk_by desconocido, rango invertido, límites no
/// enteros) son errores de config, no fallas de tarea.
fn preflight(exporter: &TaskExporter, tasks: &TaskMap) -> Result<(), EngineError> {
    let engine = exporter.filter_engine();
    for task in tasks.values() {
        let filters = exporter.task_filters(task);
        engine
            .parse_filters(&filters)
            .map_err(|source| EngineError::InvalidFilters {
                task_id: task.id.clone(),
                source,
            })?;
    }
    Ok(())
}

/// Saca un cliente del pool, corre la tarea en el pool bloqueante y lo devuelve.
/// Un panic dentro del export termina en un resultado fallido.
async fn run_unit(
    state: EngineState,
    exporter: Arc<TaskExporter>,
    connector: Arc<dyn StoreConnector>,
    task: TaskDefinition,
    cancel: Arc<AtomicBool>,
) -> Option<TaskResult> {
    let client = state.checkout_client();
    let task_id = task.id.clone();

    let joined = tokio::task::spawn_blocking(move || {
        let mut client = match client {
            Some(c) => c,
            // el cliente anterior se perdió en un panic: se reconecta
            None => match connector.connect() {
                Ok(c) => c,
                Err(e) => return (None, Some(TaskResult::failed(&task.id, e.to_string(), 0, 0, 0.0))),
            },
        };
        let result = exporter.export_task(client.as_mut(), &task, &cancel);
        (Some(client), result)
    })
    .await;

    match joined {
        Ok((client, result)) => {
            if let Some(client) = client {
                state.return_client(client);
            }
            result
        }
        Err(e) => {
            error!("panic exportando la tarea {}: {}", task_id, e);
            Some(TaskResult::failed(task_id, format!("panic en el worker: {}", e), 0, 0, 0.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{
        progress::ProgressError,
        store::{MemoryStore, PkValue, Row},
    };
    use serde_json::{json, Map, Value};
    use std::{
        env, fs,
        sync::{atomic::AtomicUsize, Mutex},
    };

    const Y2021: i64 = 1_609_459_200_000;
    const Y2022: i64 = 1_640_995_200_000;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("scheduler_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn config(out: &PathBuf, filters: Value) -> ExportConfig {
        let definitions = json!({
            "dev1": ["temp"],
            "dev2": ["temp"],
            "dev3": []
        });
        config_with_tasks(out, filters, definitions)
    }

    fn config_with_tasks(out: &PathBuf, filters: Value, definitions: Value) -> ExportConfig {
        serde_json::from_value(json!({
            "table": "metrics",
            "schema": { "partition_key": "device_id", "sort_key": "ts" },
            "filters": filters,
            "append_columns": ["ts"],
            "tasks": { "source": "inline", "definitions": definitions },
            "output": {
                "format": "csv",
                "directory": out.to_string_lossy(),
                "filename_pattern": "{partition_key}_{table}_{year}.csv"
            }
        }))
        .unwrap()
    }

    fn year_2021() -> Value {
        json!({ "ts": { "gte": Y2021, "lt": Y2022 } })
    }

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        for dev in ["dev1", "dev2"] {
            for i in 0..3 {
                store.put_row(
                    "metrics",
                    Row {
                        primary_key: vec![
                            ("device_id".to_string(), PkValue::String(dev.to_string())),
                            ("ts".to_string(), PkValue::Integer(Y2021 + i)),
                        ],
                        attribute_columns: vec![("temp".to_string(), json!(i))],
                    },
                );
            }
        }
        store
    }

    fn options(dir: &PathBuf) -> (ExportOptions, Arc<FileCheckpointStore>) {
        let checkpoint = Arc::new(FileCheckpointStore::new(dir.join("progress.json")));
        let opts = ExportOptions {
            threads: 2,
            batch_size: 2,
            output_dir: None,
            checkpoint: checkpoint.clone(),
            monitor_interval: Duration::from_secs(3600),
        };
        (opts, checkpoint)
    }

    /// Checkpoint en memoria que cuenta cuántas veces se guardó.
    #[derive(Default)]
    struct CountingCheckpoint {
        saves: AtomicUsize,
        last: Mutex<Option<Progress>>,
    }

    impl CheckpointStore for CountingCheckpoint {
        fn load(&self) -> Option<Progress> {
            self.last.lock().unwrap().clone()
        }

        fn save(&self, progress: &Progress) -> Result<(), ProgressError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(progress.clone());
            Ok(())
        }

        fn reset(&self) -> Result<(), ProgressError> {
            *self.last.lock().unwrap() = None;
            Ok(())
        }
    }

    struct FailingConnector;

    impl StoreConnector for FailingConnector {
        fn connect(&self) -> Result<Box<dyn StoreClient>, StoreError> {
            Err(StoreError::Connection("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn exporta_todas_las_tareas_y_guarda_checkpoint() {
        let dir = temp_dir("all");
        let out = dir.join("out");
        let (opts, checkpoint) = options(&dir);

        let exporter = Exporter::new(config(&out, year_2021()), Arc::new(store()), opts)
            .await
            .unwrap();
        // dev3 no tiene columnas
        assert_eq!(exporter.tasks().len(), 2);

        let summary = exporter.run(false, Arc::new(AtomicBool::new(false))).await.unwrap();

        assert_eq!(summary.status, RunStatus::Succeeded);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.total_rows_exported, 6);
        assert!(summary.total_cost >= 2);
        assert_eq!(summary.exit_code(), 0);
        assert!(out.join("dev1_metrics_2021.csv").exists());
        assert!(out.join("dev2_metrics_2021.csv").exists());

        let saved = checkpoint.load().unwrap();
        assert_eq!(saved.completed_tasks.len(), 2);
    }

    #[tokio::test]
    async fn resume_salta_las_tareas_completadas() {
        let dir = temp_dir("resume");
        let out = dir.join("out");
        let (opts, checkpoint) = options(&dir);
        let cfg = config(&out, year_2021());

        let mut previous = Progress::new(config_hash(&cfg.to_value()), 2);
        previous.mark_completed("dev1", 3);
        checkpoint.save(&previous).unwrap();

        // si dev1 se volviera a correr, fallaría
        let store = store();
        store.fail_partition("dev1", "no debería consultarse");

        let exporter = Exporter::new(cfg, Arc::new(store), opts).await.unwrap();
        let summary = exporter.run(true, Arc::new(AtomicBool::new(false))).await.unwrap();

        assert_eq!(summary.status, RunStatus::Succeeded);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.total_rows_exported, 6);
        assert!(!out.join("dev1_metrics_2021.csv").exists());
        assert!(out.join("dev2_metrics_2021.csv").exists());
    }

    #[tokio::test]
    async fn checkpoint_de_otra_config_se_descarta() {
        let dir = temp_dir("hash_mismatch");
        let out = dir.join("out");
        let (opts, checkpoint) = options(&dir);

        let mut previous = Progress::new("sha256:0000000000000000", 2);
        previous.mark_completed("dev1", 3);
        checkpoint.save(&previous).unwrap();

        let exporter = Exporter::new(config(&out, year_2021()), Arc::new(store()), opts)
            .await
            .unwrap();
        let summary = exporter.run(true, Arc::new(AtomicBool::new(false))).await.unwrap();

        assert_eq!(summary.completed, 2);
        assert!(out.join("dev1_metrics_2021.csv").exists());
        assert_ne!(checkpoint.load().unwrap().config_hash, "sha256:0000000000000000");
    }

    #[tokio::test]
    async fn tarea_fallida_queda_registrada() {
        let dir = temp_dir("failed");
        let out = dir.join("out");
        let (opts, checkpoint) = options(&dir);
        let store = store();
        store.fail_partition("dev2", "OTSServerBusy");

        let exporter = Exporter::new(config(&out, year_2021()), Arc::new(store), opts)
            .await
            .unwrap();
        let summary = exporter.run(false, Arc::new(AtomicBool::new(false))).await.unwrap();

        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.exit_code(), 1);

        let saved = checkpoint.load().unwrap();
        assert!(saved.failed_tasks["dev2"].contains("OTSServerBusy"));
    }

    #[tokio::test]
    async fn interrupcion_deja_todo_pendiente_y_guarda() {
        let dir = temp_dir("interrupted");
        let out = dir.join("out");
        let (opts, checkpoint) = options(&dir);
        let store = store();

        let exporter = Exporter::new(config(&out, year_2021()), Arc::new(store.clone()), opts)
            .await
            .unwrap();
        let summary = exporter.run(false, Arc::new(AtomicBool::new(true))).await.unwrap();

        assert_eq!(summary.status, RunStatus::Interrupted);
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.pending, 2);
        assert_eq!(summary.exit_code(), 130);
        assert_eq!(store.scan_count(), 0);
        assert!(checkpoint.load().is_some());
    }

    #[tokio::test]
    async fn chunk_by_invalido_es_error_fatal() {
        let dir = temp_dir("bad_filters");
        let out = dir.join("out");
        let (opts, _) = options(&dir);
        let filters = json!({ "ts": { "gte": Y2021, "lt": Y2022, "chunk_by": "week" } });

        let result = Exporter::new(config(&out, filters), Arc::new(FailingConnector), opts).await;
        // falla antes de intentar conectar
        assert!(matches!(result, Err(EngineError::InvalidFilters { .. })));
    }

    #[tokio::test]
    async fn error_de_conexion_al_iniciar_es_fatal() {
        let dir = temp_dir("connect_error");
        let out = dir.join("out");
        let (opts, _) = options(&dir);

        let result = Exporter::new(config(&out, year_2021()), Arc::new(FailingConnector), opts).await;
        assert!(matches!(result, Err(EngineError::Connection(_))));
    }

    #[tokio::test]
    async fn sin_tareas_ejecutables_termina_ok() {
        let dir = temp_dir("no_runnable_tasks");
        let out = dir.join("out");
        let (opts, checkpoint) = options(&dir);
        let cfg = config_with_tasks(&out, year_2021(), json!({ "dev1": [], "dev2": [] }));

        let exporter = Exporter::new(cfg, Arc::new(store()), opts).await.unwrap();
        assert!(exporter.tasks().is_empty());

        let summary = exporter.run(false, Arc::new(AtomicBool::new(false))).await.unwrap();
        assert_eq!(summary.status, RunStatus::Succeeded);
        assert_eq!(summary.total_tasks, 0);
        assert_eq!(summary.exit_code(), 0);
        assert!(checkpoint.load().is_some());
    }

    #[tokio::test]
    async fn checkpoint_se_guarda_cada_diez_tareas_y_al_final() {
        let dir = temp_dir("periodic_save");
        let out = dir.join("out");
        let (mut opts, _) = options(&dir);
        let counting = Arc::new(CountingCheckpoint::default());
        opts.checkpoint = counting.clone();

        let definitions: Map<String, Value> = (1..=11)
            .map(|i| (format!("dev{}", i), json!(["temp"])))
            .collect();
        let cfg = config_with_tasks(&out, year_2021(), Value::Object(definitions));

        let exporter = Exporter::new(cfg, Arc::new(store()), opts).await.unwrap();
        let summary = exporter.run(false, Arc::new(AtomicBool::new(false))).await.unwrap();

        assert_eq!(summary.completed, 11);
        // uno al llegar a 10 completadas y el final
        assert_eq!(counting.saves.load(Ordering::SeqCst), 2);
        assert_eq!(counting.load().unwrap().completed_tasks.len(), 11);
    }
}
