use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    fmt,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no se encontró el archivo de configuración {path}")]
    NotFound { path: PathBuf },

    #[error("error leyendo {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuración inválida en {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("falta el campo requerido: {0}")]
    MissingField(&'static str),

    #[error("formato de salida no soportado: {0}")]
    UnsupportedFormat(String),

    #[error("{0}")]
    Invalid(String),
}

/* --------- Config de export --------- */

/// Esquema de la clave primaria de la tabla.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub partition_key: String,
    pub sort_key: String,
    /// Claves secundarias, en el orden en que aparecen en la PK
    #[serde(default)]
    pub other_keys: Vec<String>,
}

impl Schema {
    pub fn is_primary_key(&self, key: &str) -> bool {
        key == self.partition_key || key == self.sort_key || self.other_keys.iter().any(|k| k == key)
    }
}

/// De dónde salen las definiciones de tareas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum TaskSource {
    /// Un único JSON `{ task_id: definición }`
    File { path: String },
    /// Un glob, ej: "tasks/*.json"
    Pattern { path: String },
    /// Definiciones dentro del propio archivo de config
    Inline { definitions: Map<String, Value> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub format: String,
    pub directory: String,
    /// Admite {partition_key}, {table} y {year}
    pub filename_pattern: String,
}

impl OutputConfig {
    pub fn filename(&self, partition_value: &str, table: &str, year: i32) -> String {
        // percent-encoding de separadores: no sale del directorio y dos valores
        // distintos nunca dan el mismo nombre
        let mut safe_partition = String::with_capacity(partition_value.len());
        for c in partition_value.chars() {
            match c {
                '%' => safe_partition.push_str("%25"),
                '/' => safe_partition.push_str("%2F"),
                '\\' => safe_partition.push_str("%5C"),
                c => safe_partition.push(c),
            }
        }

        self.filename_pattern
            .replace("{partition_key}", &safe_partition)
            .replace("{table}", table)
            .replace("{year}", &year.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    pub table: String,
    pub schema: Schema,
    /// Filtros globales; los de cada tarea los pisan por clave
    pub filters: Map<String, Value>,
    /// Columnas que van primero en cada fila (ej: la sort key)
    #[serde(default)]
    pub append_columns: Vec<String>,
    pub tasks: TaskSource,
    pub output: OutputConfig,
}

impl ExportConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("cargando config de export desde {}", path.display());
        let config: ExportConfig = read_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.table.trim().is_empty() {
            return Err(ConfigError::MissingField("table"));
        }
        if self.schema.partition_key.trim().is_empty() {
            return Err(ConfigError::MissingField("schema.partition_key"));
        }
        if self.schema.sort_key.trim().is_empty() {
            return Err(ConfigError::MissingField("schema.sort_key"));
        }
        if self.schema.partition_key == self.schema.sort_key {
            return Err(ConfigError::Invalid(
                "partition_key y sort_key deben ser distintas".to_string(),
            ));
        }

        match &self.tasks {
            TaskSource::File { path } | TaskSource::Pattern { path } if path.trim().is_empty() => {
                return Err(ConfigError::MissingField("tasks.path"));
            }
            _ => {}
        }

        if self.output.format != "csv" {
            return Err(ConfigError::UnsupportedFormat(self.output.format.clone()));
        }
        if self.output.directory.trim().is_empty() {
            return Err(ConfigError::MissingField("output.directory"));
        }
        if self.output.filename_pattern.trim().is_empty() {
            return Err(ConfigError::MissingField("output.filename_pattern"));
        }

        Ok(())
    }

    /// Representación JSON usada para el hash del checkpoint.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn output_filename(&self, partition_value: &str, year: i32) -> String {
        self.output.filename(partition_value, &self.table, year)
    }
}

/* --------- Config de conexión --------- */

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub endpoint: String,
    pub access_key_id: String,
    pub access_key_secret: String,
    pub instance_name: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

// el secreto nunca termina en logs
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &"***")
            .field("instance_name", &self.instance_name)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl ConnectionConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("cargando config de conexión desde {}", path.display());
        let config: ConnectionConfig = read_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("endpoint", &self.endpoint),
            ("access_key_id", &self.access_key_id),
            ("access_key_secret", &self.access_key_secret),
            ("instance_name", &self.instance_name),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "el campo de conexión '{}' no puede estar vacío",
                    name
                )));
            }
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "timeout_secs debe ser mayor que 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ExportConfig {
        serde_json::from_value(json!({
            "table": "metrics",
            "schema": { "partition_key": "device_id", "sort_key": "ts", "other_keys": ["channel"] },
            "filters": { "ts": { "gte": 0, "lt": 10 } },
            "append_columns": ["ts"],
            "tasks": { "source": "inline", "definitions": { "dev1": ["temp"] } },
            "output": { "format": "csv", "directory": "out", "filename_pattern": "{partition_key}_{table}_{year}.csv" }
        }))
        .unwrap()
    }

    #[test]
    fn config_de_ejemplo_es_valida() {
        let cfg = sample();
        cfg.validate().unwrap();
        assert_eq!(cfg.schema.other_keys, vec!["channel".to_string()]);
        assert!(cfg.schema.is_primary_key("channel"));
        assert!(!cfg.schema.is_primary_key("temp"));
    }

    #[test]
    fn formato_distinto_de_csv_es_rechazado() {
        let mut cfg = sample();
        cfg.output.format = "parquet".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::UnsupportedFormat(f)) if f == "parquet"));
    }

    #[test]
    fn task_source_sin_path_es_rechazado() {
        let mut cfg = sample();
        cfg.tasks = TaskSource::Pattern { path: " ".to_string() };
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingField("tasks.path"))));
    }

    #[test]
    fn filename_sustituye_placeholders_y_limpia_separadores() {
        let cfg = sample();
        assert_eq!(cfg.output_filename("dev1", 2021), "dev1_metrics_2021.csv");
        assert_eq!(cfg.output_filename("a/b", 2020), "a%2Fb_metrics_2020.csv");
        assert_eq!(cfg.output_filename("a\\b", 2020), "a%5Cb_metrics_2020.csv");
    }

    #[test]
    fn particiones_distintas_no_comparten_archivo() {
        let cfg = sample();
        let names = ["a/b", "a_b", "a%2Fb", "a\\b"].map(|p| cfg.output_filename(p, 2021));
        for (i, a) in names.iter().enumerate() {
            for b in &names[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn conexion_aplica_defaults_y_oculta_el_secreto() {
        let conn: ConnectionConfig = serde_json::from_value(json!({
            "endpoint": "https://ots.example.com",
            "access_key_id": "id",
            "access_key_secret": "super-secreto",
            "instance_name": "inst"
        }))
        .unwrap();
        conn.validate().unwrap();
        assert_eq!(conn.timeout_secs, DEFAULT_REQUEST_TIMEOUT_SECS);
        assert_eq!(conn.max_retries, DEFAULT_MAX_RETRIES);
        assert!(!format!("{:?}", conn).contains("super-secreto"));
    }

    #[test]
    fn conexion_con_campo_vacio_es_invalida() {
        let conn: ConnectionConfig = serde_json::from_value(json!({
            "endpoint": "",
            "access_key_id": "id",
            "access_key_secret": "s",
            "instance_name": "inst"
        }))
        .unwrap();
        assert!(conn.validate().is_err());
    }

    #[test]
    fn archivo_inexistente_es_not_found() {
        let err = ExportConfig::load("/no/existe/export.json").unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }
}
