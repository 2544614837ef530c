pub mod meta;
pub mod registrar;
pub mod schema;

use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// How long a writer waits on a locked database before failing.
pub const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Open (or create) the embedding database at the given path, with
/// sqlite-vec registered and the schema sized for `dim`-wide vectors.
pub fn open_database(path: impl AsRef<Path>, dim: usize) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    // WAL for concurrent readers during bulk import
    conn.pragma_update(None, "journal_mode", "WAL")?;
    prepare(&conn, dim)?;

    tracing::info!(path = %path.display(), dim, "database initialized");
    Ok(conn)
}

/// Open a database created earlier by [`open_database`], taking the vector
/// width from its `schema_meta`. Used by commands that never load a model.
pub fn open_existing_database(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();
    if !path.exists() {
        bail!("no database at {}; store something with `alfred-embed embed` first", path.display());
    }

    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    registrar::register(&conn).context("failed to register sqlite-vec")?;
    schema::init_schema(&conn).context("failed to initialize schema")?;
    let dim = meta::get_embedding_dim(&conn)?
        .with_context(|| format!("{} has no recorded embedding dimension", path.display()))?;
    schema::init_vec_table(&conn, dim).context("failed to create vector table")?;

    tracing::debug!(path = %path.display(), dim, "database opened");
    Ok(conn)
}

/// Open an in-memory database with the full schema.
pub fn open_memory_database(dim: usize) -> Result<Connection> {
    let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    prepare(&conn, dim)?;
    Ok(conn)
}

fn prepare(conn: &Connection, dim: usize) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    registrar::register(conn).context("failed to register sqlite-vec")?;
    schema::init_schema(conn).context("failed to initialize schema")?;
    meta::ensure_dimension(conn, dim)?;
    schema::init_vec_table(conn, dim).context("failed to create vector table")?;
    Ok(())
}

/// Result of [`check_database_health`].
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub integrity_ok: bool,
    pub schema_version: u32,
    pub sqlite_vec_version: String,
    pub embedding_dim: Option<usize>,
    pub embedding_model: Option<String>,
    pub memory_count: u64,
    pub vector_count: u64,
}

/// Integrity check plus the bookkeeping a `doctor` run reports.
pub fn check_database_health(conn: &Connection) -> Result<HealthReport> {
    let integrity: String = conn
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .context("integrity check failed to run")?;
    let integrity_ok = integrity == "ok";
    if !integrity_ok {
        tracing::warn!(%integrity, "database integrity check reported problems");
    }

    let sqlite_vec_version = registrar::vec_version(conn).context("sqlite-vec is not available")?;
    let memory_count: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
    let vector_count: i64 = conn.query_row("SELECT COUNT(*) FROM memories_vec", [], |row| row.get(0))?;

    Ok(HealthReport {
        integrity_ok,
        schema_version: meta::get_schema_version(conn)?,
        sqlite_vec_version,
        embedding_dim: meta::get_embedding_dim(conn)?,
        embedding_model: meta::get_embedding_model(conn)?,
        memory_count: memory_count as u64,
        vector_count: vector_count as u64,
    })
}

/// Reclaim free pages. Run after large hard deletes.
pub fn vacuum(conn: &Connection) -> Result<()> {
    conn.execute_batch("VACUUM").context("vacuum failed")?;
    tracing::info!("database vacuumed");
    Ok(())
}

/// Write a consistent copy of the database to `dest` with `VACUUM INTO`.
pub fn backup_to(conn: &Connection, dest: impl AsRef<Path>) -> Result<()> {
    let dest = dest.as_ref();
    if dest.exists() {
        bail!("backup target {} already exists", dest.display());
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let target = dest
        .to_str()
        .with_context(|| format!("backup path {} is not valid UTF-8", dest.display()))?;
    conn.execute("VACUUM INTO ?1", [target])
        .with_context(|| format!("backup to {} failed", dest.display()))?;
    tracing::info!(dest = %dest.display(), "database backed up");
    Ok(())
}

/// Size of the main database in bytes (`page_count * page_size`).
pub fn database_size(conn: &Connection) -> Result<u64> {
    let pages: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
    let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
    Ok((pages * page_size) as u64)
}
