use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{cmp::Ordering, fmt, str::FromStr};
use thiserror::Error;

/// Fin "abierto" de un rango de tiempo (`lt` omitido en la config).
pub const OPEN_END: i64 = i64::MAX;

#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("rango de tiempo inválido: start ({start}) >= end ({end})")]
    InvalidTimeRange { start: i64, end: i64 },

    #[error("valor de chunk_by no soportado: {0}")]
    UnsupportedChunkBy(String),

    #[error("el límite '{bound}' del filtro de tiempo '{key}' debe ser un entero en ms, se recibió {value}")]
    InvalidTimeBound {
        key: String,
        bound: &'static str,
        value: Value,
    },

    #[error("timestamp fuera del rango representable: {0} ms")]
    TimestampOutOfRange(i64),

    #[error("operador de filtro desconocido: {0}")]
    UnknownOperator(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Between,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "eq",
            FilterOperator::Ne => "ne",
            FilterOperator::Gt => "gt",
            FilterOperator::Gte => "gte",
            FilterOperator::Lt => "lt",
            FilterOperator::Lte => "lte",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not_in",
            FilterOperator::Between => "between",
        }
    }
}

impl FromStr for FilterOperator {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(FilterOperator::Eq),
            "ne" => Ok(FilterOperator::Ne),
            "gt" => Ok(FilterOperator::Gt),
            "gte" => Ok(FilterOperator::Gte),
            "lt" => Ok(FilterOperator::Lt),
            "lte" => Ok(FilterOperator::Lte),
            "in" => Ok(FilterOperator::In),
            "not_in" => Ok(FilterOperator::NotIn),
            "between" => Ok(FilterOperator::Between),
            other => Err(FilterError::UnknownOperator(other.to_string())),
        }
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Una condición sobre un único atributo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub key: String,
    pub operator: FilterOperator,
    pub value: Value,
}

impl Filter {
    pub fn new(key: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            key: key.into(),
            operator,
            value,
        }
    }

    /// Evalúa el filtro contra el valor real de la fila.
    /// Un valor ausente (o null) nunca pasa ningún filtro.
    pub fn evaluate(&self, actual: Option<&Value>) -> bool {
        let actual = match actual {
            Some(v) if !v.is_null() => v,
            _ => return false,
        };

        match self.operator {
            FilterOperator::Eq => values_equal(actual, &self.value),
            FilterOperator::Ne => !values_equal(actual, &self.value),
            FilterOperator::Gt => compare_values(actual, &self.value) == Some(Ordering::Greater),
            FilterOperator::Gte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOperator::Lt => compare_values(actual, &self.value) == Some(Ordering::Less),
            FilterOperator::Lte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOperator::In => operand_list(&self.value)
                .iter()
                .any(|candidate| values_equal(actual, candidate)),
            FilterOperator::NotIn => !operand_list(&self.value)
                .iter()
                .any(|candidate| values_equal(actual, candidate)),
            FilterOperator::Between => match self.value.as_array().map(Vec::as_slice) {
                Some([lo, hi]) => {
                    matches!(
                        compare_values(actual, lo),
                        Some(Ordering::Greater | Ordering::Equal)
                    ) && matches!(
                        compare_values(actual, hi),
                        Some(Ordering::Less | Ordering::Equal)
                    )
                }
                _ => false,
            },
        }
    }
}

/// Operando de `in` / `not_in`: un escalar se trata como lista de un elemento.
fn operand_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

/// Igualdad "numérica": 25 == 25.0, pero "25" != 25.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

/// Orden entre valores del mismo tipo. Tipos distintos no son comparables.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return Some(x.cmp(&y));
            }
            if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                return Some(x.cmp(&y));
            }
            x.as_f64()?.partial_cmp(&y.as_f64()?)
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/* =========================
   Filtro de rango de tiempo
   ========================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkBy {
    Year,
    Month,
    Day,
}

impl FromStr for ChunkBy {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "year" => Ok(ChunkBy::Year),
            "month" => Ok(ChunkBy::Month),
            "day" => Ok(ChunkBy::Day),
            other => Err(FilterError::UnsupportedChunkBy(other.to_string())),
        }
    }
}

impl fmt::Display for ChunkBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChunkBy::Year => "year",
            ChunkBy::Month => "month",
            ChunkBy::Day => "day",
        };
        f.write_str(s)
    }
}

/// Rango `[start, end)` en milisegundos sobre la sort key, con su unidad de chunking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRangeFilter {
    pub key: String,
    pub start: i64,
    pub end: i64,
    pub chunk_by: ChunkBy,
}

impl TimeRangeFilter {
    pub fn new(
        key: impl Into<String>,
        start: i64,
        end: i64,
        chunk_by: ChunkBy,
    ) -> Result<Self, FilterError> {
        if start >= end {
            return Err(FilterError::InvalidTimeRange { start, end });
        }
        Ok(Self {
            key: key.into(),
            start,
            end,
            chunk_by,
        })
    }

    pub fn is_open_ended(&self) -> bool {
        self.end == OPEN_END
    }
}
