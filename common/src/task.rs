use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::TaskSource;

pub type TaskId = String;

/// Tamaño a partir del cual avisamos que el archivo de tareas es grande.
const LARGE_TASK_FILE_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TaskLoadError {
    #[error("no se encontró el archivo de tareas {path}")]
    NotFound { path: PathBuf },

    #[error("error leyendo {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON inválido en {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path} debe contener un objeto {{ task_id: definición }}")]
    NotAnObject { path: PathBuf },

    #[error("patrón de tareas inválido '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("ningún archivo coincide con el patrón {0}")]
    NoMatch(String),

    #[error("el id de tarea no puede estar vacío")]
    EmptyId,

    #[error("formato inválido para la tarea {task_id}: se esperaba lista de columnas u objeto {{columns, filters}}")]
    InvalidShape { task_id: TaskId },

    #[error("columnas inválidas en la tarea {task_id}: {reason}")]
    InvalidColumns { task_id: TaskId, reason: String },

    #[error("chunk_size debe ser mayor que 0")]
    InvalidChunkSize,
}

/// Una tarea de export: una partición con sus columnas y filtros propios.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// También es el valor de la partition key
    pub id: TaskId,
    pub columns: Vec<String>,
    #[serde(default)]
    pub filters: Map<String, Value>,
}

impl TaskDefinition {
    /// Acepta `["col1", "col2"]` o `{"columns": [...], "filters": {...}}`.
    pub fn from_value(id: &str, value: &Value) -> Result<Self, TaskLoadError> {
        if id.trim().is_empty() {
            return Err(TaskLoadError::EmptyId);
        }

        let (columns, filters) = match value {
            Value::Array(cols) => (cols, Map::new()),
            Value::Object(obj) => {
                let columns = match obj.get("columns") {
                    Some(Value::Array(cols)) => cols,
                    None => return Ok(Self::empty(id)),
                    Some(_) => return Err(TaskLoadError::InvalidShape { task_id: id.to_string() }),
                };
                let filters = match obj.get("filters") {
                    Some(Value::Object(f)) => f.clone(),
                    None | Some(Value::Null) => Map::new(),
                    Some(_) => return Err(TaskLoadError::InvalidShape { task_id: id.to_string() }),
                };
                (columns, filters)
            }
            _ => return Err(TaskLoadError::InvalidShape { task_id: id.to_string() }),
        };

        let columns = columns
            .iter()
            .map(|c| match c {
                Value::String(s) => Ok(s.clone()),
                other => Err(TaskLoadError::InvalidColumns {
                    task_id: id.to_string(),
                    reason: format!("el nombre de columna {} no es un string", other),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let task = Self {
            id: id.to_string(),
            columns,
            filters,
        };
        task.check_columns()?;
        Ok(task)
    }

    fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            columns: Vec::new(),
            filters: Map::new(),
        }
    }

    fn check_columns(&self) -> Result<(), TaskLoadError> {
        let mut seen = HashSet::new();
        for col in &self.columns {
            if col.trim().is_empty() {
                return Err(TaskLoadError::InvalidColumns {
                    task_id: self.id.clone(),
                    reason: "hay nombres de columna vacíos".to_string(),
                });
            }
            if !seen.insert(col.as_str()) {
                return Err(TaskLoadError::InvalidColumns {
                    task_id: self.id.clone(),
                    reason: format!("columna duplicada '{}'", col),
                });
            }
        }
        Ok(())
    }
}

/// Resultado de ejecutar una tarea.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub success: bool,
    pub rows_exported: u64,
    pub cost_consumed: u64,
    pub error_message: Option<String>,
    pub duration_secs: f64,
}

impl TaskResult {
    pub fn succeeded(task_id: impl Into<TaskId>, rows_exported: u64, cost_consumed: u64, duration_secs: f64) -> Self {
        Self {
            task_id: task_id.into(),
            success: true,
            rows_exported,
            cost_consumed,
            error_message: None,
            duration_secs,
        }
    }

    /// Las filas y el costo consumidos antes del error se conservan.
    pub fn failed(
        task_id: impl Into<TaskId>,
        error: impl Into<String>,
        rows_exported: u64,
        cost_consumed: u64,
        duration_secs: f64,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            success: false,
            rows_exported,
            cost_consumed,
            error_message: Some(error.into()),
            duration_secs,
        }
    }
}

pub type TaskMap = BTreeMap<TaskId, TaskDefinition>;

/* =========================
   Carga de tareas
   ========================= */

#[derive(Debug, Clone, Copy, Default)]
pub struct TaskLoader;

impl TaskLoader {
    pub fn new() -> Self {
        Self
    }

    pub fn load(&self, source: &TaskSource) -> Result<TaskMap, TaskLoadError> {
        match source {
            TaskSource::File { path } => self.load_from_file(path),
            TaskSource::Pattern { path } => self.load_from_glob(path),
            TaskSource::Inline { definitions } => self.load_inline(definitions),
        }
    }

    pub fn load_from_file(&self, path: impl AsRef<Path>) -> Result<TaskMap, TaskLoadError> {
        let data = read_task_file(path.as_ref())?;
        info!("{} definiciones leídas de {}", data.len(), path.as_ref().display());
        self.parse_tasks(&data)
    }

    /// Une todos los archivos que coinciden; si un id se repite gana el último archivo (en orden alfabético).
    pub fn load_from_glob(&self, pattern: &str) -> Result<TaskMap, TaskLoadError> {
        info!("cargando tareas desde el patrón {}", pattern);

        let mut files: Vec<PathBuf> = glob::glob(pattern)
            .map_err(|source| TaskLoadError::Pattern {
                pattern: pattern.to_string(),
                source,
            })?
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("no se pudo leer una entrada del patrón {}: {}", pattern, e);
                    None
                }
            })
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(TaskLoadError::NoMatch(pattern.to_string()));
        }

        let mut all = TaskMap::new();
        for file in &files {
            debug!("cargando archivo de tareas {}", file.display());
            let tasks = self.load_from_file(file)?;

            let duplicates: Vec<&TaskId> = tasks.keys().filter(|id| all.contains_key(*id)).collect();
            if !duplicates.is_empty() {
                warn!("ids de tarea duplicados en {}: {:?}", file.display(), duplicates);
            }
            all.extend(tasks);
        }

        info!("{} tareas cargadas desde {} archivos", all.len(), files.len());
        Ok(all)
    }

    pub fn load_inline(&self, definitions: &Map<String, Value>) -> Result<TaskMap, TaskLoadError> {
        info!("cargando {} tareas inline", definitions.len());
        self.parse_tasks(definitions)
    }

    /// Las tareas sin columnas se descartan con un warning.
    pub fn parse_tasks(&self, data: &Map<String, Value>) -> Result<TaskMap, TaskLoadError> {
        let mut tasks = TaskMap::new();
        let mut skipped = 0usize;

        for (id, value) in data {
            let task = TaskDefinition::from_value(id, value)?;
            if task.columns.is_empty() {
                debug!("se omite la tarea {}: sin columnas", id);
                skipped += 1;
                continue;
            }
            tasks.insert(id.clone(), task);
        }

        if skipped > 0 {
            warn!("se omitieron {} tareas sin columnas", skipped);
        }
        info!("{} tareas válidas (omitidas {})", tasks.len(), skipped);
        Ok(tasks)
    }

    /// Lista de problemas; vacía si el set de tareas es ejecutable.
    pub fn validate_tasks(&self, tasks: &TaskMap) -> Vec<String> {
        if tasks.is_empty() {
            return vec!["no hay tareas definidas".to_string()];
        }

        tasks
            .values()
            .filter(|t| t.columns.is_empty())
            .map(|t| format!("la tarea {} no tiene columnas", t.id))
            .collect()
    }
}

fn read_task_file(path: &Path) -> Result<Map<String, Value>, TaskLoadError> {
    let meta = fs::metadata(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            TaskLoadError::NotFound { path: path.to_path_buf() }
        } else {
            TaskLoadError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    if meta.len() > LARGE_TASK_FILE_BYTES {
        warn!(
            "archivo de tareas grande ({:.2} MB): {}",
            meta.len() as f64 / 1024.0 / 1024.0,
            path.display()
        );
    }

    let raw = fs::read_to_string(path).map_err(|source| TaskLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_str(&raw).map_err(|source| TaskLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    match value {
        Value::Object(map) => Ok(map),
        _ => Err(TaskLoadError::NotAnObject { path: path.to_path_buf() }),
    }
}

/* =========================
   Split de archivos de tareas
   ========================= */

/// Parte un mapa de tareas en bloques de `chunk_size` (en orden de id).
pub fn split_tasks(tasks: &Map<String, Value>, chunk_size: usize) -> Result<Vec<Map<String, Value>>, TaskLoadError> {
    if chunk_size == 0 {
        return Err(TaskLoadError::InvalidChunkSize);
    }

    let entries: Vec<(&String, &Value)> = tasks.iter().collect();
    Ok(entries
        .chunks(chunk_size)
        .map(|chunk| chunk.iter().map(|(k, v)| ((*k).clone(), (*v).clone())).collect())
        .collect())
}

/// Lee `input`, lo parte y escribe `<output_dir>/<prefix><n>.json` (n desde 1).
pub fn split_task_file(
    input: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
    chunk_size: usize,
    prefix: &str,
) -> Result<Vec<PathBuf>, TaskLoadError> {
    let input = input.as_ref();
    let output_dir = output_dir.as_ref();

    let tasks = read_task_file(input)?;
    let chunks = split_tasks(&tasks, chunk_size)?;

    fs::create_dir_all(output_dir).map_err(|source| TaskLoadError::Io {
        path: output_dir.to_path_buf(),
        source,
    })?;

    let mut written = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.into_iter().enumerate() {
        let path = output_dir.join(format!("{}{}.json", prefix, i + 1));
        let json = serde_json::to_string_pretty(&Value::Object(chunk)).map_err(|source| TaskLoadError::Parse {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, json).map_err(|source| TaskLoadError::Io {
            path: path.clone(),
            source,
        })?;
        info!("creado {}", path.display());
        written.push(path);
    }

    info!(
        "{} tareas repartidas en {} archivos dentro de {}",
        tasks.len(),
        written.len(),
        output_dir.display()
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::env;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("task_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn acepta_lista_de_columnas_y_objeto() {
        let a = TaskDefinition::from_value("dev1", &json!(["temp", "humidity"])).unwrap();
        assert_eq!(a.columns, vec!["temp", "humidity"]);
        assert!(a.filters.is_empty());

        let b = TaskDefinition::from_value(
            "dev2",
            &json!({ "columns": ["temp"], "filters": { "status": "ok" } }),
        )
        .unwrap();
        assert_eq!(b.filters["status"], json!("ok"));
    }

    #[test]
    fn forma_invalida_es_error_tipado() {
        let err = TaskDefinition::from_value("dev1", &json!("temp")).unwrap_err();
        assert!(matches!(err, TaskLoadError::InvalidShape { task_id } if task_id == "dev1"));
    }

    #[test]
    fn columnas_duplicadas_o_vacias_son_error() {
        assert!(matches!(
            TaskDefinition::from_value("d", &json!(["a", "a"])),
            Err(TaskLoadError::InvalidColumns { .. })
        ));
        assert!(matches!(
            TaskDefinition::from_value("d", &json!(["a", " "])),
            Err(TaskLoadError::InvalidColumns { .. })
        ));
    }

    #[test]
    fn id_vacio_es_error() {
        assert!(matches!(
            TaskDefinition::from_value("", &json!(["a"])),
            Err(TaskLoadError::EmptyId)
        ));
    }

    #[test]
    fn tareas_sin_columnas_se_omiten() {
        let tasks = TaskLoader::new()
            .load_inline(&obj(json!({ "dev1": ["temp"], "dev2": [], "dev3": { "filters": {} } })))
            .unwrap();
        assert_eq!(tasks.keys().collect::<Vec<_>>(), vec!["dev1"]);
    }

    #[test]
    fn patron_une_archivos_y_el_ultimo_gana() {
        let dir = temp_dir("glob");
        fs::write(dir.join("a.json"), r#"{"dev1": ["temp"], "dev2": ["x"]}"#).unwrap();
        fs::write(dir.join("b.json"), r#"{"dev2": ["y"], "dev3": ["z"]}"#).unwrap();

        let pattern = format!("{}/*.json", dir.display());
        let tasks = TaskLoader::new().load_from_glob(&pattern).unwrap();

        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks["dev2"].columns, vec!["y"]);
    }

    #[test]
    fn patron_sin_coincidencias_es_error() {
        let dir = temp_dir("glob_empty");
        let pattern = format!("{}/*.json", dir.display());
        assert!(matches!(
            TaskLoader::new().load_from_glob(&pattern),
            Err(TaskLoadError::NoMatch(_))
        ));
    }

    #[test]
    fn archivo_que_no_es_objeto_es_error() {
        let dir = temp_dir("not_object");
        let path = dir.join("tasks.json");
        fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(
            TaskLoader::new().load_from_file(&path),
            Err(TaskLoadError::NotAnObject { .. })
        ));
    }

    #[test]
    fn validate_tasks_reporta_set_vacio() {
        let loader = TaskLoader::new();
        assert_eq!(loader.validate_tasks(&TaskMap::new()).len(), 1);

        let tasks = loader.load_inline(&obj(json!({ "dev1": ["temp"] }))).unwrap();
        assert!(loader.validate_tasks(&tasks).is_empty());
    }

    #[test]
    fn split_reparte_en_bloques() {
        let tasks = obj(json!({ "a": ["x"], "b": ["x"], "c": ["x"], "d": ["x"], "e": ["x"] }));
        let chunks = split_tasks(&tasks, 2).unwrap();
        assert_eq!(chunks.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![2, 2, 1]);
        assert!(split_tasks(&tasks, 0).is_err());
    }

    #[test]
    fn split_task_file_escribe_archivos_numerados() {
        let dir = temp_dir("split");
        let input = dir.join("all.json");
        fs::write(&input, r#"{"a": ["x"], "b": ["x"], "c": ["x"]}"#).unwrap();

        let out = dir.join("out");
        let files = split_task_file(&input, &out, 2, "tasks_batch_").unwrap();
        assert_eq!(files, vec![out.join("tasks_batch_1.json"), out.join("tasks_batch_2.json")]);

        let pattern = format!("{}/tasks_batch_*.json", out.display());
        let tasks = TaskLoader::new().load_from_glob(&pattern).unwrap();
        assert_eq!(tasks.len(), 3);
    }
}
