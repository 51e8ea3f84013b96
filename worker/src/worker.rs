use common::{
    config::{ExportConfig, OutputConfig},
    query::{QueryError, RowLookup},
    store::{Direction, RangeRequest, StoreClient, StoreError},
    task::{TaskDefinition, TaskResult},
    CsvWriter, Filter, FilterEngine, FilterError, QueryBuilder, TimeChunk, WriteMode, WriterError,
};
use serde_json::{Map, Value};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use thiserror::Error;
use tracing::{debug, error, info};

/// Filas pedidas por página de get_range.
pub const PAGE_LIMIT: u32 = 5000;
pub const DEFAULT_BATCH_SIZE: usize = 5000;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("no hay filtro de rango de tiempo definido")]
    NoTimeRange,

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Write(#[from] WriterError),
}

/// Acumulado de una tarea; sobrevive a un error a mitad de camino.
#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    rows: u64,
    cost: u64,
}

#[derive(Debug, PartialEq, Eq)]
enum ChunkStatus {
    Done,
    Interrupted,
}

/// Exporta una tarea completa: chunks -> páginas -> filtro -> lotes de CSV.
/// Es síncrono; el engine lo corre en el pool bloqueante de tokio.
pub struct TaskExporter {
    table: String,
    global_filters: Map<String, Value>,
    output: OutputConfig,
    filter_engine: FilterEngine,
    query_builder: QueryBuilder,
    writer: Arc<CsvWriter>,
    batch_size: usize,
}

impl TaskExporter {
    pub fn new(config: &ExportConfig, writer: Arc<CsvWriter>, batch_size: usize) -> Self {
        Self {
            table: config.table.clone(),
            global_filters: config.filters.clone(),
            output: config.output.clone(),
            filter_engine: FilterEngine::new(config.schema.clone()),
            query_builder: QueryBuilder::new(config.schema.clone(), config.append_columns.clone()),
            writer,
            batch_size: batch_size.max(1),
        }
    }

    pub fn filter_engine(&self) -> &FilterEngine {
        &self.filter_engine
    }

    /// Filtros efectivos de la tarea (globales pisados por los propios).
    pub fn task_filters(&self, task: &TaskDefinition) -> Map<String, Value> {
        FilterEngine::merge_filters(&self.global_filters, &task.filters)
    }

    /// `None` sólo si el export se canceló a mitad de la tarea: queda pendiente.
    /// Cualquier error termina en un `TaskResult` fallido con el mensaje.
    pub fn export_task(
        &self,
        client: &mut dyn StoreClient,
        task: &TaskDefinition,
        cancel: &AtomicBool,
    ) -> Option<TaskResult> {
        let started = Instant::now();
        info!("→ iniciando tarea {}", task.id);

        let mut totals = Totals::default();
        let outcome = self.run_task(client, task, cancel, &mut totals);
        let duration = started.elapsed().as_secs_f64();

        match outcome {
            Ok(ChunkStatus::Done) => {
                info!(
                    "✓ tarea {} completada: {} filas, {} CU, {:.1}s",
                    task.id, totals.rows, totals.cost, duration
                );
                Some(TaskResult::succeeded(&task.id, totals.rows, totals.cost, duration))
            }
            Ok(ChunkStatus::Interrupted) => {
                info!("tarea {} interrumpida, queda pendiente", task.id);
                None
            }
            Err(e) => {
                error!("error exportando la tarea {}: {}", task.id, e);
                Some(TaskResult::failed(&task.id, e.to_string(), totals.rows, totals.cost, duration))
            }
        }
    }

    fn run_task(
        &self,
        client: &mut dyn StoreClient,
        task: &TaskDefinition,
        cancel: &AtomicBool,
        totals: &mut Totals,
    ) -> Result<ChunkStatus, ExportError> {
        let filters = self.task_filters(task);
        let (regular, time_range) = self.filter_engine.parse_filters(&filters)?;
        let time_range = time_range.ok_or(ExportError::NoTimeRange)?;

        let chunks = FilterEngine::time_chunks(&time_range)?;
        let (pk_filters, attr_filters) = self.filter_engine.separate_pk_and_attr_filters(regular);

        // los filtros de PK que no entran en el rango se evalúan fila a fila
        let residual: Vec<Filter> = attr_filters.into_iter().chain(pk_filters.iter().cloned()).collect();

        debug!("tarea {}: {} chunks ({})", task.id, chunks.len(), time_range.chunk_by);

        for chunk in &chunks {
            let before = totals.rows;
            let status = self.export_time_chunk(client, task, &pk_filters, &residual, chunk, cancel, totals)?;
            if status == ChunkStatus::Interrupted {
                return Ok(ChunkStatus::Interrupted);
            }
            if totals.rows > before {
                debug!("tarea {}: chunk {} -> {} filas", task.id, chunk.label, totals.rows - before);
            }
        }

        Ok(ChunkStatus::Done)
    }

    /// Exporta un chunk de tiempo al archivo del año correspondiente.
    /// Un chunk sin filas no crea archivo. Siempre se escribe en modo Append:
    /// el writer decide si crear el archivo con el lock del archivo tomado.
    #[allow(clippy::too_many_arguments)]
    fn export_time_chunk(
        &self,
        client: &mut dyn StoreClient,
        task: &TaskDefinition,
        pk_filters: &[Filter],
        residual_filters: &[Filter],
        chunk: &TimeChunk,
        cancel: &AtomicBool,
        totals: &mut Totals,
    ) -> Result<ChunkStatus, ExportError> {
        let (inclusive_start, exclusive_end) = self.query_builder.build_range(&task.id, pk_filters, chunk)?;
        let filename = self.output.filename(&task.id, &self.table, chunk.year);
        let headers = self.query_builder.headers(&task.columns);


        let mut request = RangeRequest {
            table_name: self.table.clone(),
            direction: Direction::Forward,
            inclusive_start_primary_key: inclusive_start,
            exclusive_end_primary_key: exclusive_end,
            columns_to_get: Vec::new(),
            limit: PAGE_LIMIT,
            max_versions: 1,
        };

        let mut batch: Vec<Vec<String>> = Vec::with_capacity(self.batch_size.min(PAGE_LIMIT as usize));

        loop {
            if cancel.load(Ordering::SeqCst) {
                return Ok(ChunkStatus::Interrupted);
            }

            let page = client.get_range(&request)?;
            totals.cost += page.consumed.read;

            for row in &page.rows {
                let lookup: RowLookup = QueryBuilder::row_lookup(row);
                if !FilterEngine::apply_attribute_filters(&lookup, residual_filters) {
                    continue;
                }

                batch.push(self.query_builder.extract_from_lookup(&lookup, &task.columns));
                totals.rows += 1;

                if batch.len() >= self.batch_size {
                    self.writer.write_batch(&filename, &headers, &batch, WriteMode::Append)?;
                    batch.clear();
                }
            }

            match page.next_start_primary_key {
                Some(next) => request.inclusive_start_primary_key = next,
                None => break,
            }
        }

        if !batch.is_empty() {
            self.writer.write_batch(&filename, &headers, &batch, WriteMode::Append)?;
        }

        Ok(ChunkStatus::Done)
    }
}
