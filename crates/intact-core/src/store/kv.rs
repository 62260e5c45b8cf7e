use std::path::Path;

use rusqlite::Connection;

use crate::error::Result;

/// Open a single-file key-value database with the standard pragmas.
/// Callers create their own tables; the writer side relies on WAL so a
/// long-lived write transaction does not block concurrent readers.
pub(crate) fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(conn)
}

/// Schema of the index-blob cache: one row per directory key.
pub(crate) const DATA_SCHEMA: &str =
    "CREATE TABLE IF NOT EXISTS data(key TEXT PRIMARY KEY, value BLOB NOT NULL);";
