use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
        Arc, PoisonError, RwLock,
    },
};
use thiserror::Error;

/* --------- Tipos de clave primaria --------- */

/// Valor de una columna de la clave primaria.
/// El orden derivado (InfMin < Integer < String < InfMax) es el del store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PkValue {
    InfMin,
    Integer(i64),
    String(String),
    InfMax,
}

impl PkValue {
    /// Convierte un valor de filtro (JSON) en valor de PK: enteros o strings.
    pub fn from_json(value: &Value) -> Option<PkValue> {
        match value {
            Value::Number(n) => n.as_i64().map(PkValue::Integer),
            Value::String(s) => Some(PkValue::String(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            PkValue::Integer(i) => Value::from(*i),
            PkValue::String(s) => Value::String(s.clone()),
            PkValue::InfMin => Value::String("INF_MIN".to_string()),
            PkValue::InfMax => Value::String("INF_MAX".to_string()),
        }
    }
}

impl fmt::Display for PkValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PkValue::InfMin => f.write_str("INF_MIN"),
            PkValue::Integer(i) => write!(f, "{}", i),
            PkValue::String(s) => f.write_str(s),
            PkValue::InfMax => f.write_str("INF_MAX"),
        }
    }
}

/// Columnas (nombre, valor) de una clave primaria, en orden de esquema.
pub type PrimaryKey = Vec<(String, PkValue)>;

/// Compara dos tuplas de PK posición a posición (orden lexicográfico del store).
/// Si una es prefijo de la otra, la más corta va primero.
pub fn compare_primary_keys(a: &[(String, PkValue)], b: &[(String, PkValue)]) -> Ordering {
    a.iter()
        .map(|(_, v)| v)
        .cmp(b.iter().map(|(_, v)| v))
}

/* --------- Request / response de get_range --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeRequest {
    pub table_name: String,
    pub direction: Direction,
    pub inclusive_start_primary_key: PrimaryKey,
    pub exclusive_end_primary_key: PrimaryKey,
    /// Vacío = todas las columnas
    pub columns_to_get: Vec<String>,
    pub limit: u32,
    pub max_versions: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityUnit {
    pub read: u64,
    #[serde(default)]
    pub write: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub primary_key: PrimaryKey,
    #[serde(default)]
    pub attribute_columns: Vec<(String, Value)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangePage {
    pub consumed: CapacityUnit,
    /// `None` cuando el scan terminó
    pub next_start_primary_key: Option<PrimaryKey>,
    pub rows: Vec<Row>,
    #[serde(default)]
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("error de conexión con el store: {0}")]
    Connection(String),

    #[error("error del servicio ({status} {code}): {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },

    #[error("respuesta inválida del store: {0}")]
    InvalidResponse(String),
}

/// Capacidad única que necesitamos del store: scan por rango de PK.
/// Un cliente nunca se comparte entre hilos a la vez (`&mut self`).
pub trait StoreClient: Send {
    fn get_range(&mut self, request: &RangeRequest) -> Result<RangePage, StoreError>;
}

/// Fabrica clientes; el engine crea uno por slot del pool.
pub trait StoreConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn StoreClient>, StoreError>;
}

/* =========================
   Store en memoria
   ========================= */

type TableData = BTreeMap<Vec<PkValue>, Row>;

/// Store ordenado en memoria con la misma semántica de paginación que el real.
/// Cada fila cuesta 1 unidad de lectura por cada 4 KiB (o fracción) de su JSON;
/// una página vacía cuesta 1.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<HashMap<String, TableData>>>,
    failing_partitions: Arc<RwLock<HashMap<String, String>>>,
    scans: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_row(&self, table: &str, row: Row) {
        let key: Vec<PkValue> = row.primary_key.iter().map(|(_, v)| v.clone()).collect();
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.entry(table.to_string()).or_default().insert(key, row);
    }

    /// Hace que cualquier scan sobre esa partición falle con `message`.
    pub fn fail_partition(&self, partition_value: &str, message: &str) {
        let mut failing = self
            .failing_partitions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        failing.insert(partition_value.to_string(), message.to_string());
    }

    /// Cantidad de llamadas a get_range recibidas (todas las conexiones).
    pub fn scan_count(&self) -> usize {
        self.scans.load(AtomicOrdering::SeqCst)
    }

    fn scan(&self, request: &RangeRequest) -> Result<RangePage, StoreError> {
        self.scans.fetch_add(1, AtomicOrdering::SeqCst);

        if let Some((_, PkValue::String(partition))) = request.inclusive_start_primary_key.first() {
            let failing = self
                .failing_partitions
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(message) = failing.get(partition) {
                return Err(StoreError::Service {
                    status: 500,
                    code: "OTSInternalServerError".to_string(),
                    message: message.clone(),
                });
            }
        }

        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let data = tables.get(&request.table_name).ok_or_else(|| StoreError::Service {
            status: 404,
            code: "OTSObjectNotExist".to_string(),
            message: format!("Requested table does not exist: {}", request.table_name),
        })?;

        let limit = request.limit.max(1) as usize;
        let mut rows = Vec::new();
        let mut next_start_primary_key = None;

        let in_range = data.values().filter(|row| {
            compare_primary_keys(&row.primary_key, &request.inclusive_start_primary_key)
                != Ordering::Less
                && compare_primary_keys(&row.primary_key, &request.exclusive_end_primary_key)
                    == Ordering::Less
        });

        for row in in_range {
            if rows.len() == limit {
                next_start_primary_key = Some(row.primary_key.clone());
                break;
            }
            rows.push(row.clone());
        }

        let read = rows.iter().map(read_units).sum::<u64>().max(1);
        Ok(RangePage {
            consumed: CapacityUnit { read, write: 0 },
            next_start_primary_key,
            rows,
            next_token: None,
        })
    }
}

const READ_UNIT_BYTES: u64 = 4096;

fn read_units(row: &Row) -> u64 {
    let size = serde_json::to_vec(row).map(|b| b.len() as u64).unwrap_or(0);
    size.div_ceil(READ_UNIT_BYTES).max(1)
}

impl StoreClient for MemoryStore {
    fn get_range(&mut self, request: &RangeRequest) -> Result<RangePage, StoreError> {
        self.scan(request)
    }
}

impl StoreConnector for MemoryStore {
    fn connect(&self) -> Result<Box<dyn StoreClient>, StoreError> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(dev: &str, ts: i64, temp: i64) -> Row {
        Row {
            primary_key: vec![
                ("device_id".to_string(), PkValue::String(dev.to_string())),
                ("ts".to_string(), PkValue::Integer(ts)),
            ],
            attribute_columns: vec![("temp".to_string(), json!(temp))],
        }
    }

    fn request(dev: &str, start: i64, end: PkValue, limit: u32) -> RangeRequest {
        RangeRequest {
            table_name: "metrics".to_string(),
            direction: Direction::Forward,
            inclusive_start_primary_key: vec![
                ("device_id".to_string(), PkValue::String(dev.to_string())),
                ("ts".to_string(), PkValue::Integer(start)),
            ],
            exclusive_end_primary_key: vec![
                ("device_id".to_string(), PkValue::String(dev.to_string())),
                ("ts".to_string(), end),
            ],
            columns_to_get: vec![],
            limit,
            max_versions: 1,
        }
    }

    #[test]
    fn orden_de_pk_es_lexicografico() {
        let a = vec![("k".to_string(), PkValue::String("a".into())), ("t".to_string(), PkValue::Integer(5))];
        let b = vec![("k".to_string(), PkValue::String("a".into())), ("t".to_string(), PkValue::Integer(6))];
        let c = vec![("k".to_string(), PkValue::String("a".into())), ("t".to_string(), PkValue::InfMax)];
        assert_eq!(compare_primary_keys(&a, &b), Ordering::Less);
        assert_eq!(compare_primary_keys(&b, &c), Ordering::Less);
    }

    #[test]
    fn get_range_pagina_y_respeta_el_fin_exclusivo() {
        let store = MemoryStore::new();
        for ts in 0..5 {
            store.put_row("metrics", row("dev1", ts, ts * 10));
        }
        store.put_row("metrics", row("dev2", 1, 99));

        let mut client = store.clone();
        let page = client.get_range(&request("dev1", 0, PkValue::Integer(4), 3)).unwrap();
        assert_eq!(page.rows.len(), 3);
        let next = page.next_start_primary_key.clone().unwrap();
        assert_eq!(next[1].1, PkValue::Integer(3));

        let mut req = request("dev1", 0, PkValue::Integer(4), 3);
        req.inclusive_start_primary_key = next;
        let page = client.get_range(&req).unwrap();
        assert_eq!(page.rows.len(), 1);
        assert!(page.next_start_primary_key.is_none());
        assert_eq!(page.consumed.read, 1);
        assert_eq!(store.scan_count(), 2);
    }

    #[test]
    fn particion_marcada_falla_con_el_mensaje_original() {
        let store = MemoryStore::new();
        store.put_row("metrics", row("dev1", 1, 1));
        store.fail_partition("dev1", "boom");

        let mut client = store.clone();
        let err = client.get_range(&request("dev1", 0, PkValue::InfMax, 10)).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn tabla_inexistente_es_error_de_servicio() {
        let mut client = MemoryStore::new();
        let err = client.get_range(&request("dev1", 0, PkValue::InfMax, 10)).unwrap_err();
        assert!(matches!(err, StoreError::Service { status: 404, .. }));
    }
}
