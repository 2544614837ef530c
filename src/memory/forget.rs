//! Soft and hard memory deletion.
//!
//! Soft delete sets `is_deleted = 1` and keeps the row and vector so the
//! memory can be audited; hard delete removes both.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};
use serde::Serialize;

/// Result returned from a delete operation.
#[derive(Debug, Serialize)]
pub struct DeleteResult {
    pub id: String,
    /// `true` if the memory was permanently removed; `false` for soft delete.
    pub hard_deleted: bool,
}

/// Delete a memory by id. Fails if no such memory exists; a soft delete also
/// fails on a memory that is already soft-deleted. A hard delete still
/// removes soft-deleted rows.
pub fn delete_memory(conn: &mut Connection, memory_id: &str, hard: bool) -> Result<DeleteResult> {
    let tx = conn.transaction()?;

    let sql = if hard {
        "SELECT COUNT(*) > 0 FROM memories WHERE id = ?1"
    } else {
        "SELECT COUNT(*) > 0 FROM memories WHERE id = ?1 AND is_deleted = 0"
    };
    let exists: bool = tx.query_row(sql, params![memory_id], |row| row.get(0))?;
    if !exists {
        return Err(anyhow!("memory not found: {memory_id}"));
    }

    if hard {
        tx.execute("DELETE FROM memories_vec WHERE id = ?1", params![memory_id])?;
        tx.execute("DELETE FROM memories WHERE id = ?1", params![memory_id])?;
    } else {
        tx.execute(
            "UPDATE memories SET is_deleted = 1, updated_at = ?1 WHERE id = ?2",
            params![chrono::Utc::now().to_rfc3339(), memory_id],
        )?;
    }

    tx.commit()?;
    tracing::info!(id = memory_id, hard, "memory deleted");

    Ok(DeleteResult {
        id: memory_id.to_string(),
        hard_deleted: hard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::memory::{search, store};

    fn stored(conn: &mut Connection) -> String {
        let mut v = vec![0.0f32; 4];
        v[0] = 1.0;
        store::store_embedding(conn, "to forget", None, &v).unwrap().id
    }

    fn count(conn: &Connection, sql: &str, id: &str) -> i64 {
        conn.query_row(sql, params![id], |r| r.get(0)).unwrap()
    }

    #[test]
    fn soft_delete_hides_but_keeps_rows() {
        let mut conn = db::open_memory_database(4).unwrap();
        let id = stored(&mut conn);

        let result = delete_memory(&mut conn, &id, false).unwrap();
        assert!(!result.hard_deleted);
        assert!(search::get_memory(&conn, &id).unwrap().is_none());
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM memories WHERE id = ?1", &id), 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM memories_vec WHERE id = ?1", &id), 1);
    }

    #[test]
    fn hard_delete_removes_row_and_vector() {
        let mut conn = db::open_memory_database(4).unwrap();
        let id = stored(&mut conn);

        assert!(delete_memory(&mut conn, &id, true).unwrap().hard_deleted);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM memories WHERE id = ?1", &id), 0);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM memories_vec WHERE id = ?1", &id), 0);
    }

    #[test]
    fn deleting_unknown_id_fails() {
        let mut conn = db::open_memory_database(4).unwrap();
        let err = delete_memory(&mut conn, "missing", false).unwrap_err();
        assert!(err.to_string().contains("not found"));

        let id = stored(&mut conn);
        delete_memory(&mut conn, &id, false).unwrap();
        let updated_at: String = conn
            .query_row("SELECT updated_at FROM memories WHERE id = ?1", params![id], |r| r.get(0))
            .unwrap();
        let err = delete_memory(&mut conn, &id, false).unwrap_err();
        assert!(err.to_string().contains("not found"));
        let after: String = conn
            .query_row("SELECT updated_at FROM memories WHERE id = ?1", params![id], |r| r.get(0))
            .unwrap();
        assert_eq!(after, updated_at);

        assert!(delete_memory(&mut conn, &id, true).unwrap().hard_deleted);
    }
}
