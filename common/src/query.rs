use chrono::{TimeZone, Utc};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use crate::config::Schema;
use crate::filter::{Filter, FilterOperator};
use crate::store::{PkValue, PrimaryKey, Row};
use crate::time_chunk::TimeChunk;

/// Valor que se escribe cuando la fila no tiene la columna.
pub const MISSING_VALUE: &str = "-";

#[derive(Debug, Error, PartialEq)]
pub enum QueryError {
    #[error("el valor de partición no puede estar vacío")]
    EmptyPartition,

    #[error("el filtro eq sobre la clave '{key}' debe ser entero o string, se recibió {value}")]
    InvalidKeyValue { key: String, value: Value },
}

/// Fila ya "aplanada": PK + atributos en una sola tabla de búsqueda.
pub type RowLookup = HashMap<String, Value>;

/// Traduce chunks de tiempo a rangos de PK y filas del store a filas de CSV.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    schema: Schema,
    append_columns: Vec<String>,
}

impl QueryBuilder {
    pub fn new(schema: Schema, append_columns: Vec<String>) -> Self {
        Self {
            schema,
            append_columns,
        }
    }

    /// (inclusive_start, exclusive_end) para get_range.
    /// Orden fijo: partition key, claves secundarias con filtro eq, sort key.
    pub fn build_range(
        &self,
        partition_value: &str,
        pk_filters: &[Filter],
        chunk: &TimeChunk,
    ) -> Result<(PrimaryKey, PrimaryKey), QueryError> {
        if partition_value.is_empty() {
            return Err(QueryError::EmptyPartition);
        }

        let end_value = if chunk.is_open_ended() {
            PkValue::InfMax
        } else {
            PkValue::Integer(chunk.end)
        };

        let inclusive_start =
            self.build_pk_tuple(partition_value, pk_filters, PkValue::Integer(chunk.start))?;
        let exclusive_end = self.build_pk_tuple(partition_value, pk_filters, end_value)?;

        Ok((inclusive_start, exclusive_end))
    }

    fn build_pk_tuple(
        &self,
        partition_value: &str,
        pk_filters: &[Filter],
        time_value: PkValue,
    ) -> Result<PrimaryKey, QueryError> {
        let mut pk = Vec::with_capacity(self.schema.other_keys.len() + 2);
        pk.push((
            self.schema.partition_key.clone(),
            PkValue::String(partition_value.to_string()),
        ));

        for key in &self.schema.other_keys {
            let eq = pk_filters
                .iter()
                .find(|f| &f.key == key && f.operator == FilterOperator::Eq);
            if let Some(f) = eq {
                let value = PkValue::from_json(&f.value).ok_or_else(|| QueryError::InvalidKeyValue {
                    key: key.clone(),
                    value: f.value.clone(),
                })?;
                pk.push((key.clone(), value));
            }
        }

        pk.push((self.schema.sort_key.clone(), time_value));
        Ok(pk)
    }

    /// Encabezado del CSV: append columns y después las de la tarea.
    pub fn headers(&self, task_columns: &[String]) -> Vec<String> {
        self.append_columns
            .iter()
            .chain(task_columns.iter())
            .cloned()
            .collect()
    }

    /// Junta PK y atributos; si un nombre se repite gana el atributo.
    pub fn row_lookup(row: &Row) -> RowLookup {
        let mut lookup: RowLookup = row
            .primary_key
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect();
        for (name, value) in &row.attribute_columns {
            lookup.insert(name.clone(), value.clone());
        }
        lookup
    }

    pub fn extract_row(&self, row: &Row, task_columns: &[String]) -> Vec<String> {
        self.extract_from_lookup(&Self::row_lookup(row), task_columns)
    }

    /// Valores en el mismo orden que `headers`.
    pub fn extract_from_lookup(&self, lookup: &RowLookup, task_columns: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(self.append_columns.len() + task_columns.len());

        for col in &self.append_columns {
            let value = lookup.get(col);
            let cell = match value {
                Some(Value::Number(n)) if col == &self.schema.sort_key => n
                    .as_i64()
                    .or_else(|| n.as_f64().map(|f| f as i64))
                    .map(format_timestamp)
                    .unwrap_or_else(|| n.to_string()),
                other => render_cell(other),
            };
            out.push(cell);
        }

        for col in task_columns {
            out.push(render_cell(lookup.get(col)));
        }

        out
    }
}

/// ms epoch -> "YYYY-MM-DDTHH:MM:SSZ" (UTC)
pub fn format_timestamp(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        None => ms.to_string(),
    }
}

pub fn render_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => MISSING_VALUE.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => other.to_string(),
    }
}
