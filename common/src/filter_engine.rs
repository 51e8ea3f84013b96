use serde_json::{Map, Value};
use tracing::debug;

use crate::config::Schema;
use crate::filter::{ChunkBy, Filter, FilterError, FilterOperator, TimeRangeFilter, OPEN_END};
use crate::query::RowLookup;
use crate::time_chunk::{TimeChunk, TimeChunker};

const TIME_RANGE_MARKERS: [&str; 3] = ["gte", "lt", "chunk_by"];

/// Clasifica el mapa de filtros de una tarea:
/// - el rango de tiempo (sobre la sort key) que guía el chunking
/// - filtros sobre la PK
/// - filtros de atributos que se evalúan después de leer cada fila
#[derive(Debug, Clone)]
pub struct FilterEngine {
    schema: Schema,
}

impl FilterEngine {
    pub fn new(schema: Schema) -> Self {
        Self { schema }
    }

    /// Los filtros de la tarea pisan a los globales con la misma clave.
    pub fn merge_filters(global: &Map<String, Value>, task: &Map<String, Value>) -> Map<String, Value> {
        let mut merged = global.clone();
        for (key, value) in task {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Devuelve (filtros regulares, filtro de rango de tiempo).
    pub fn parse_filters(
        &self,
        filters: &Map<String, Value>,
    ) -> Result<(Vec<Filter>, Option<TimeRangeFilter>), FilterError> {
        let mut regular = Vec::new();
        let mut time_range = None;

        for (key, value) in filters {
            if key == &self.schema.sort_key {
                if let Value::Object(obj) = value {
                    if TIME_RANGE_MARKERS.iter().any(|m| obj.contains_key(*m)) {
                        time_range = Some(Self::parse_time_range_filter(key, obj)?);
                        continue;
                    }
                }
            }

            regular.extend(Self::parse_regular_filter(key, value));
        }

        Ok((regular, time_range))
    }

    /// Defaults: gte=0, lt=abierto, chunk_by=year.
    fn parse_time_range_filter(key: &str, obj: &Map<String, Value>) -> Result<TimeRangeFilter, FilterError> {
        let start = match obj.get("gte") {
            None => 0,
            Some(v) => v.as_i64().ok_or_else(|| FilterError::InvalidTimeBound {
                key: key.to_string(),
                bound: "gte",
                value: v.clone(),
            })?,
        };

        let end = match obj.get("lt") {
            None => OPEN_END,
            Some(v) => v.as_i64().ok_or_else(|| FilterError::InvalidTimeBound {
                key: key.to_string(),
                bound: "lt",
                value: v.clone(),
            })?,
        };

        let chunk_by = match obj.get("chunk_by") {
            None => ChunkBy::Year,
            Some(Value::String(s)) => s.parse()?,
            Some(other) => return Err(FilterError::UnsupportedChunkBy(other.to_string())),
        };

        TimeRangeFilter::new(key, start, end, chunk_by)
    }

    fn parse_regular_filter(key: &str, value: &Value) -> Vec<Filter> {
        // valor directo = eq
        let Value::Object(ops) = value else {
            return vec![Filter::new(key, FilterOperator::Eq, value.clone())];
        };

        ops.iter()
            .filter_map(|(op, operand)| match op.parse::<FilterOperator>() {
                Ok(operator) => Some(Filter::new(key, operator, operand.clone())),
                Err(_) => {
                    debug!("ignorando operador desconocido '{}' en el filtro '{}'", op, key);
                    None
                }
            })
            .collect()
    }

    /// (filtros de PK, filtros de atributos)
    pub fn separate_pk_and_attr_filters(&self, filters: Vec<Filter>) -> (Vec<Filter>, Vec<Filter>) {
        filters
            .into_iter()
            .partition(|f| self.schema.is_primary_key(&f.key))
    }

    /// true si la fila pasa todos los filtros.
    pub fn apply_attribute_filters(row: &RowLookup, filters: &[Filter]) -> bool {
        filters.iter().all(|f| f.evaluate(row.get(&f.key)))
    }

    pub fn time_chunks(range: &TimeRangeFilter) -> Result<Vec<TimeChunk>, FilterError> {
        TimeChunker::chunk(range.start, range.end, range.chunk_by)
    }
}
