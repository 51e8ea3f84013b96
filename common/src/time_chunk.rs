use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::filter::{ChunkBy, FilterError, OPEN_END};

/// Sub-intervalo `[start, end)` de un rango de tiempo, alineado al calendario UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeChunk {
    pub start: i64,
    pub end: i64,
    pub year: i32,
    /// Etiqueta legible: "2021", "2021-03" o "2021-03-05"
    pub label: String,
}

impl TimeChunk {
    pub fn is_open_ended(&self) -> bool {
        self.end == OPEN_END
    }
}

/// Divide rangos de tiempo en chunks de año / mes / día.
pub struct TimeChunker;

impl TimeChunker {
    /// Cubre `[start, end)` sin huecos ni solapes, en orden ascendente.
    /// El primer y el último chunk se recortan a los límites pedidos.
    pub fn chunk(start: i64, end: i64, chunk_by: ChunkBy) -> Result<Vec<TimeChunk>, FilterError> {
        Self::chunk_at(start, end, chunk_by, Utc::now().timestamp_millis())
    }

    /// Igual que `chunk`, con el "ahora" explícito. Sólo importa para rangos
    /// abiertos (`end == OPEN_END`): se generan chunks hasta la unidad que
    /// contiene `now_ms` y el último queda abierto.
    pub fn chunk_at(
        start: i64,
        end: i64,
        chunk_by: ChunkBy,
        now_ms: i64,
    ) -> Result<Vec<TimeChunk>, FilterError> {
        if start >= end {
            return Err(FilterError::InvalidTimeRange { start, end });
        }

        let open = end == OPEN_END;
        let limit = if open { now_ms.max(start) } else { end };

        let start_dt = from_millis(start)?;
        let mut cursor = unit_floor(start_dt, chunk_by).ok_or(FilterError::TimestampOutOfRange(start))?;
        let mut chunks = Vec::new();

        loop {
            let next = unit_next(cursor, chunk_by)
                .ok_or(FilterError::TimestampOutOfRange(cursor.timestamp_millis()))?;
            let unit_start = cursor.timestamp_millis();
            let unit_end = next.timestamp_millis();

            // rango cerrado: el fin cae dentro de esta unidad
            // rango abierto: esta unidad contiene "ahora"
            let last = if open { unit_end > limit } else { unit_end >= limit };

            chunks.push(TimeChunk {
                start: start.max(unit_start),
                end: if last { end } else { unit_end },
                year: cursor.year(),
                label: unit_label(cursor, chunk_by),
            });

            if last {
                break;
            }
            cursor = next;
        }

        Ok(chunks)
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, FilterError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(FilterError::TimestampOutOfRange(ms))
}

/// Inicio de la unidad de calendario que contiene `dt`.
fn unit_floor(dt: DateTime<Utc>, chunk_by: ChunkBy) -> Option<DateTime<Utc>> {
    let (month, day) = match chunk_by {
        ChunkBy::Year => (1, 1),
        ChunkBy::Month => (dt.month(), 1),
        ChunkBy::Day => (dt.month(), dt.day()),
    };
    Utc.with_ymd_and_hms(dt.year(), month, day, 0, 0, 0).single()
}

/// Inicio de la unidad siguiente (diciembre -> enero del año siguiente).
fn unit_next(dt: DateTime<Utc>, chunk_by: ChunkBy) -> Option<DateTime<Utc>> {
    match chunk_by {
        ChunkBy::Year => Utc.with_ymd_and_hms(dt.year() + 1, 1, 1, 0, 0, 0).single(),
        ChunkBy::Month => {
            let (year, month) = if dt.month() == 12 {
                (dt.year() + 1, 1)
            } else {
                (dt.year(), dt.month() + 1)
            };
            Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
        }
        ChunkBy::Day => dt.checked_add_signed(Duration::days(1)),
    }
}

fn unit_label(dt: DateTime<Utc>, chunk_by: ChunkBy) -> String {
    match chunk_by {
        ChunkBy::Year => format!("{}", dt.year()),
        ChunkBy::Month => format!("{}-{:02}", dt.year(), dt.month()),
        ChunkBy::Day => dt.format("%Y-%m-%d").to_string(),
    }
}
