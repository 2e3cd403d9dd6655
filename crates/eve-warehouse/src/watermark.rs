//! ETL cursor plumbing (C10). The `watermarks` table is the only durable
//! ETL state; a missing row means "start from the beginning."

use rusqlite::types::Value;
use rusqlite::{params, OptionalExtension};

use crate::error::Result;
use crate::writer::{WriteOp, Writer};

/// Read an integer watermark, defaulting to 0 if absent.
pub fn read_int(writer: &Writer, source: &str, name: &str) -> Result<i64> {
    writer.with_connection(|conn| {
        conn.query_row(
            "SELECT value_int FROM watermarks WHERE source = ?1 AND name = ?2",
            params![source, name],
            |row| row.get::<_, Option<i64>>(0),
        )
        .optional()
        .map(|v| v.flatten().unwrap_or(0))
    })
}

/// Queue an upsert advancing an integer watermark. Callers must only call
/// this after the rows that depend on the new cursor position have been
/// queued in the same flush, so a crash never advances past committed data.
pub fn advance_int(writer: &Writer, source: &str, name: &str, value: i64, now: i64) -> Result<()> {
    writer.write(WriteOp::new(
        "INSERT INTO watermarks (source, name, value_int, updated_ts) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (source, name) DO UPDATE SET value_int = excluded.value_int, updated_ts = excluded.updated_ts",
        vec![
            Value::Text(source.to_string()),
            Value::Text(name.to_string()),
            Value::Integer(value),
            Value::Integer(now),
        ],
    ))
}
