use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::{
    progress::{CheckpointStore, FileCheckpointStore, DEFAULT_PROGRESS_FILE},
    task::split_task_file,
    ConnectionConfig, ExportConfig, RunStatus, TaskLoader,
};
use master::{ExportOptions, Exporter, DEFAULT_THREADS};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use worker::{HttpStoreConnector, DEFAULT_BATCH_SIZE};

const DEFAULT_CONNECTION_FILE: &str = "config/connection.json";

#[derive(Parser)]
#[command(name = "kvexport")]
#[command(about = "Exporta tablas de un store clave-valor ordenado a CSV, con checkpoints y reanudación")]
struct Cli {
    /// Logs en nivel debug
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Corre (o retoma) un export
    Export {
        #[arg(long, value_name = "ARCHIVO")]
        config: PathBuf,

        #[arg(long, value_name = "ARCHIVO", default_value = DEFAULT_CONNECTION_FILE)]
        connection: PathBuf,

        /// Tareas en paralelo
        #[arg(long, default_value_t = DEFAULT_THREADS)]
        threads: usize,

        /// Retoma desde el checkpoint si la config no cambió
        #[arg(long)]
        resume: bool,

        /// Pisa output.directory de la config
        #[arg(long, value_name = "DIR")]
        output_dir: Option<PathBuf>,

        #[arg(long, value_name = "ARCHIVO", default_value = DEFAULT_PROGRESS_FILE)]
        progress_file: PathBuf,

        /// Filas por escritura al CSV
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        /// Valida config y tareas sin exportar nada
        #[arg(long)]
        dry_run: bool,
    },

    /// Valida los archivos de configuración
    Validate {
        #[arg(long, value_name = "ARCHIVO")]
        config: PathBuf,

        #[arg(long, value_name = "ARCHIVO", default_value = DEFAULT_CONNECTION_FILE)]
        connection: PathBuf,

        /// Carga y valida también las definiciones de tareas
        #[arg(long)]
        validate_tasks: bool,
    },

    /// Muestra el resumen del checkpoint
    Status {
        #[arg(long, value_name = "ARCHIVO", default_value = DEFAULT_PROGRESS_FILE)]
        progress_file: PathBuf,
    },

    /// Borra el checkpoint
    Reset {
        #[arg(long, value_name = "ARCHIVO", default_value = DEFAULT_PROGRESS_FILE)]
        progress_file: PathBuf,
    },

    /// Parte un archivo de tareas grande en varios más chicos
    SplitTasks {
        #[arg(long, value_name = "ARCHIVO")]
        input: PathBuf,

        #[arg(long, value_name = "DIR")]
        output_dir: PathBuf,

        /// Tareas por archivo
        #[arg(long, default_value_t = 10_000)]
        chunk_size: usize,

        #[arg(long, default_value = "tasks_batch_")]
        prefix: String,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info,reqwest=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Devuelve el código de salida del proceso.
pub async fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Export {
            config,
            connection,
            threads,
            resume,
            output_dir,
            progress_file,
            batch_size,
            dry_run,
        } => {
            let mut export_config = load_export_config(&config)?;
            if let Some(dir) = output_dir {
                info!("output.directory reemplazado por {}", dir.display());
                export_config.output.directory = dir.to_string_lossy().into_owned();
            }
            let connection_config = load_connection_config(&connection)?;
            print_config_summary(&export_config, &connection_config);

            if dry_run {
                let tasks = TaskLoader::new()
                    .load(&export_config.tasks)
                    .context("no se pudieron cargar las tareas")?;
                info!("dry run ok: configuración válida, {} tareas listas para exportar", tasks.len());
                return Ok(0);
            }

            let cancel = Arc::new(AtomicBool::new(false));
            spawn_ctrl_c_handler(Arc::clone(&cancel));

            let options = ExportOptions {
                threads,
                batch_size,
                checkpoint: Arc::new(FileCheckpointStore::new(&progress_file)),
                ..ExportOptions::default()
            };
            let connector = Arc::new(HttpStoreConnector::new(connection_config));

            let exporter = Exporter::new(export_config, connector, options)
                .await
                .context("no se pudo inicializar el export")?;
            let summary = exporter.run(resume, cancel).await?;

            println!("==============================");
            println!("Export {}", summary.status);
            println!("  run_id: {}", summary.run_id);
            println!(
                "  tareas: total={}, completadas={}, fallidas={}, pendientes={}",
                summary.total_tasks, summary.completed, summary.failed, summary.pending
            );
            println!("  filas exportadas: {}", summary.total_rows_exported);
            println!(
                "  costo: {} CU ({:.1} CU/s)",
                summary.total_cost, summary.avg_cost_per_sec
            );
            println!("  duración: {:.2}s", summary.duration_secs);
            println!("==============================");

            if let Some(err) = &summary.checkpoint_error {
                warn!("el checkpoint final no se pudo guardar: {}", err);
            }
            if summary.status == RunStatus::Interrupted {
                warn!(
                    "export interrumpido; el progreso quedó en {}. Usar --resume para continuar",
                    progress_file.display()
                );
            }

            Ok(summary.exit_code())
        }

        Commands::Validate {
            config,
            connection,
            validate_tasks,
        } => {
            let export_config = load_export_config(&config)?;
            info!("✓ configuración de export válida");
            let connection_config = load_connection_config(&connection)?;
            info!("✓ configuración de conexión válida");
            print_config_summary(&export_config, &connection_config);

            if validate_tasks {
                let loader = TaskLoader::new();
                let tasks = loader
                    .load(&export_config.tasks)
                    .context("no se pudieron cargar las tareas")?;
                let problems = loader.validate_tasks(&tasks);
                if !problems.is_empty() {
                    for p in &problems {
                        warn!("✗ {}", p);
                    }
                    return Ok(1);
                }
                info!("✓ {} tareas válidas", tasks.len());
            }

            Ok(0)
        }

        Commands::Status { progress_file } => {
            let store = FileCheckpointStore::new(&progress_file);
            match store.load() {
                Some(progress) => {
                    let s = progress.summary();
                    println!("Checkpoint {}:", progress_file.display());
                    println!("  config_hash: {}", progress.config_hash);
                    println!(
                        "  tareas: total={}, completadas={}, fallidas={}, pendientes={}",
                        s.total_tasks, s.completed, s.failed, s.pending
                    );
                    println!("  progreso: {:.1}%", s.completion_rate);
                    println!("  filas exportadas: {}", s.total_rows_exported);
                    println!("  inicio: {}", s.start_time.format("%Y-%m-%d %H:%M:%S"));
                    println!("  última actualización: {}", s.last_update.format("%Y-%m-%d %H:%M:%S"));
                    for (task_id, err) in &progress.failed_tasks {
                        println!("  ✗ {}: {}", task_id, err);
                    }
                }
                None => println!("No hay checkpoint en {}", progress_file.display()),
            }
            Ok(0)
        }

        Commands::Reset { progress_file } => {
            FileCheckpointStore::new(&progress_file)
                .reset()
                .with_context(|| format!("no se pudo borrar {}", progress_file.display()))?;
            println!("Checkpoint {} eliminado", progress_file.display());
            Ok(0)
        }

        Commands::SplitTasks {
            input,
            output_dir,
            chunk_size,
            prefix,
        } => {
            let files = split_task_file(&input, &output_dir, chunk_size, &prefix)
                .with_context(|| format!("no se pudo partir {}", input.display()))?;
            println!("{} archivos creados en {}", files.len(), output_dir.display());
            println!("Para usarlos en la config de export:");
            println!(
                "  \"tasks\": {{\"source\": \"pattern\", \"path\": \"{}/{}*.json\"}}",
                output_dir.display(),
                prefix
            );
            Ok(0)
        }
    }
}

fn load_export_config(path: &Path) -> Result<ExportConfig> {
    ExportConfig::load(path).with_context(|| format!("config de export inválida: {}", path.display()))
}

fn load_connection_config(path: &Path) -> Result<ConnectionConfig> {
    ConnectionConfig::load(path).with_context(|| format!("config de conexión inválida: {}", path.display()))
}

fn print_config_summary(config: &ExportConfig, connection: &ConnectionConfig) {
    info!("tabla: {}", config.table);
    info!("partition key: {}", config.schema.partition_key);
    info!("sort key: {}", config.schema.sort_key);
    info!("append columns: {:?}", config.append_columns);
    info!("directorio de salida: {}", config.output.directory);
    info!("endpoint: {} (instancia {})", connection.endpoint, connection.instance_name);
}

/// Primer Ctrl+C: se marca la cancelación y el engine guarda el progreso.
fn spawn_ctrl_c_handler(cancel: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupción recibida, terminando las tareas en curso y guardando el progreso...");
            cancel.store(true, Ordering::SeqCst);
        }
    });
}
