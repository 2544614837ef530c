//! Key/value bookkeeping in `schema_meta`.
//!
//! Records the schema version, the embedding model that produced the stored
//! vectors, and the vector width the `memories_vec` table was created with.

use anyhow::{bail, Result};
use rusqlite::{Connection, OptionalExtension};

/// The schema version that the current binary expects.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

fn get(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT value FROM schema_meta WHERE key = ?1", [key], |row| row.get(0))
        .optional()
}

fn set(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_meta (key, value) VALUES (?1, ?2)",
        [key, value],
    )?;
    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    Ok(get(conn, "schema_version")?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0))
}

/// Get the stored embedding model identifier, if any.
pub fn get_embedding_model(conn: &Connection) -> rusqlite::Result<Option<String>> {
    get(conn, "embedding_model")
}

pub fn set_embedding_model(conn: &Connection, model: &str) -> rusqlite::Result<()> {
    set(conn, "embedding_model", model)
}

pub fn get_embedding_dim(conn: &Connection) -> rusqlite::Result<Option<usize>> {
    Ok(get(conn, "embedding_dim")?.and_then(|v| v.parse().ok()))
}

/// Record `dim` on a fresh database, or check it against the stored width.
pub fn ensure_dimension(conn: &Connection, dim: usize) -> Result<()> {
    if dim == 0 {
        bail!("embedding dimension must be > 0");
    }
    match get_embedding_dim(conn)? {
        Some(stored) if stored != dim => bail!(
            "database stores {stored}-dimensional embeddings but the model produces {dim}; \
             use a different database or re-embed"
        ),
        Some(_) => Ok(()),
        None => {
            set(conn, "embedding_dim", &dim.to_string())?;
            tracing::debug!(dim, "recorded embedding dimension");
            Ok(())
        }
    }
}
