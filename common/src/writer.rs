use std::{
    collections::HashMap,
    fs::{self, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("error de E/S escribiendo {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("error de CSV escribiendo {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Trunca el archivo y escribe el encabezado
    Create,
    /// Agrega filas al final; si el archivo no existe se comporta como Create
    Append,
}

/// Escritor de CSV compartido por todos los workers.
/// Un lock por archivo: dos workers sólo se bloquean si escriben el mismo archivo.
#[derive(Debug)]
pub struct CsvWriter {
    output_dir: PathBuf,
    file_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl CsvWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self, WriterError> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir).map_err(|source| WriterError::Io {
            path: output_dir.clone(),
            source,
        })?;

        Ok(Self {
            output_dir,
            file_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.output_dir.join(filename)
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        // el lock del mapa se suelta apenas tenemos el Arc
        let mut locks = self.file_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Saca el lock del mapa si nadie más lo está usando.
    /// Los Arc sólo se clonan con el mapa tomado, así que el conteo no cambia mientras miramos.
    fn release_lock(&self, path: &Path, lock: Arc<Mutex<()>>) {
        let mut locks = self.file_locks.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&lock) == 2 {
            locks.remove(path);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.file_locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Escribe un lote de filas. Devuelve la cantidad de filas escritas.
    pub fn write_batch(
        &self,
        filename: &str,
        headers: &[String],
        rows: &[Vec<String>],
        mode: WriteMode,
    ) -> Result<usize, WriterError> {
        let path = self.file_path(filename);
        let lock = self.lock_for(&path);
        let written = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            write_locked(&path, headers, rows, mode)
        };
        self.release_lock(&path, lock);
        written
    }
}

/// Escribe con el lock del archivo ya tomado.
fn write_locked(
    path: &Path,
    headers: &[String],
    rows: &[Vec<String>],
    mode: WriteMode,
) -> Result<usize, WriterError> {
    let mode = match mode {
        WriteMode::Append if !path.exists() => WriteMode::Create,
        m => m,
    };

    let file = match mode {
        WriteMode::Create => OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path),
        WriteMode::Append => OpenOptions::new().append(true).open(path),
    }
    .map_err(|source| WriterError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);

    let csv_err = |source| WriterError::Csv {
        path: path.to_path_buf(),
        source,
    };

    if mode == WriteMode::Create {
        writer.write_record(headers).map_err(csv_err)?;
    }
    for row in rows {
        writer.write_record(row).map_err(csv_err)?;
    }
    writer.flush().map_err(|source| WriterError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    debug!("{} filas escritas en {} ({:?})", rows.len(), path.display(), mode);
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, thread};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("writer_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn headers() -> Vec<String> {
        vec!["ts".to_string(), "temp".to_string()]
    }

    fn rows(n: usize, offset: usize) -> Vec<Vec<String>> {
        (0..n)
            .map(|i| vec![(offset + i).to_string(), "21.5".to_string()])
            .collect()
    }

    #[test]
    fn varios_lotes_dejan_un_solo_encabezado() {
        let writer = CsvWriter::new(temp_dir("single_header")).unwrap();

        writer.write_batch("out.csv", &headers(), &rows(3, 0), WriteMode::Create).unwrap();
        writer.write_batch("out.csv", &headers(), &rows(2, 3), WriteMode::Append).unwrap();

        let content = fs::read_to_string(writer.file_path("out.csv")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines.iter().filter(|l| **l == "ts,temp").count(), 1);
        assert_eq!(lines[0], "ts,temp");
        assert_eq!(lines[5], "4,21.5");
    }

    #[test]
    fn append_sobre_archivo_inexistente_crea_con_encabezado() {
        let writer = CsvWriter::new(temp_dir("append_missing")).unwrap();
        assert!(!writer.file_path("nuevo.csv").exists());

        writer.write_batch("nuevo.csv", &headers(), &rows(1, 0), WriteMode::Append).unwrap();

        let content = fs::read_to_string(writer.file_path("nuevo.csv")).unwrap();
        assert_eq!(content, "ts,temp\n0,21.5\n");
    }

    #[test]
    fn create_trunca_el_contenido_anterior() {
        let writer = CsvWriter::new(temp_dir("create_truncates")).unwrap();
        writer.write_batch("out.csv", &headers(), &rows(5, 0), WriteMode::Create).unwrap();
        writer.write_batch("out.csv", &headers(), &rows(1, 9), WriteMode::Create).unwrap();

        let content = fs::read_to_string(writer.file_path("out.csv")).unwrap();
        assert_eq!(content, "ts,temp\n9,21.5\n");
    }

    #[test]
    fn valores_con_comas_se_escapan() {
        let writer = CsvWriter::new(temp_dir("quoting")).unwrap();
        let row = vec![vec!["1".to_string(), "a,b".to_string()]];
        writer.write_batch("q.csv", &headers(), &row, WriteMode::Create).unwrap();

        let content = fs::read_to_string(writer.file_path("q.csv")).unwrap();
        assert_eq!(content, "ts,temp\n1,\"a,b\"\n");
    }

    #[test]
    fn escrituras_concurrentes_al_mismo_archivo_no_se_mezclan() {
        let writer = Arc::new(CsvWriter::new(temp_dir("concurrent")).unwrap());
        writer.write_batch("c.csv", &headers(), &[], WriteMode::Create).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let writer = Arc::clone(&writer);
                thread::spawn(move || {
                    for b in 0..10 {
                        writer
                            .write_batch("c.csv", &headers(), &rows(5, t * 1000 + b * 5), WriteMode::Append)
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let content = fs::read_to_string(writer.file_path("c.csv")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1 + 8 * 10 * 5);
        assert!(lines[1..].iter().all(|l| l.ends_with(",21.5") && l.split(',').count() == 2));
        assert_eq!(writer.tracked_locks(), 0);
    }

    #[test]
    fn locks_de_archivos_se_liberan_despues_de_escribir() {
        let writer = CsvWriter::new(temp_dir("lock_release")).unwrap();
        for i in 0..50 {
            writer
                .write_batch(&format!("f{}.csv", i), &headers(), &rows(1, i), WriteMode::Append)
                .unwrap();
        }
        assert_eq!(writer.tracked_locks(), 0);
        assert!(writer.file_path("f49.csv").exists());
    }
}
