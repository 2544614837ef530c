use anyhow::Result;
use rusqlite::Connection;
use serde::Serialize;

use crate::db;

/// Response from memory_stats.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total_memories: u64,
    pub active_memories: u64,
    pub deleted_memories: u64,
    pub vectors: u64,
    pub db_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_dim: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_memory: Option<String>,
}

/// Compute memory store statistics.
pub fn memory_stats(conn: &Connection) -> Result<StatsResponse> {
    let (total, active) = count_memories(conn)?;
    let vectors: i64 = conn.query_row("SELECT COUNT(*) FROM memories_vec", [], |row| row.get(0))?;
    let (oldest, newest) = memory_time_range(conn)?;

    Ok(StatsResponse {
        total_memories: total,
        active_memories: active,
        deleted_memories: total - active,
        vectors: vectors as u64,
        db_size_bytes: db::database_size(conn)?,
        embedding_model: db::meta::get_embedding_model(conn)?,
        embedding_dim: db::meta::get_embedding_dim(conn)?,
        oldest_memory: oldest,
        newest_memory: newest,
    })
}

/// Total and active counts.
fn count_memories(conn: &Connection) -> Result<(u64, u64)> {
    let (total, active): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(is_deleted = 0), 0) FROM memories",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok((total as u64, active as u64))
}

/// Oldest and newest live memory timestamps.
fn memory_time_range(conn: &Connection) -> Result<(Option<String>, Option<String>)> {
    let range = conn.query_row(
        "SELECT MIN(created_at), MAX(created_at) FROM memories WHERE is_deleted = 0",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(range)
}
