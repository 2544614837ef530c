//! Write path: validate an embedding and persist it with its text.

use anyhow::{bail, Result};
use rusqlite::{params, Connection, Transaction};

use crate::db::meta;
use crate::memory::types::StoredMemory;

/// Insert `content` and its embedding into `memories` / `memories_vec`.
///
/// Both rows are written in one transaction. The embedding width must match
/// the dimension recorded for the database and every entry must be finite.
/// The row is tagged with whatever model the database already records.
pub fn store_embedding(
    conn: &mut Connection,
    content: &str,
    metadata: Option<&serde_json::Value>,
    embedding: &[f32],
) -> Result<StoredMemory> {
    store(conn, None, content, metadata, embedding)
}

/// Like [`store_embedding`], for vectors produced by `model`.
///
/// The first such store records `model` for the database in the same
/// transaction as the rows. A database that already records a different
/// model refuses the write.
pub fn store_embedding_from(
    conn: &mut Connection,
    model: &str,
    content: &str,
    metadata: Option<&serde_json::Value>,
    embedding: &[f32],
) -> Result<StoredMemory> {
    store(conn, Some(model), content, metadata, embedding)
}

fn store(
    conn: &mut Connection,
    model: Option<&str>,
    content: &str,
    metadata: Option<&serde_json::Value>,
    embedding: &[f32],
) -> Result<StoredMemory> {
    if content.trim().is_empty() {
        bail!("content is empty");
    }
    if let Some(i) = embedding.iter().position(|x| !x.is_finite()) {
        bail!("embedding[{i}] is not finite");
    }
    match meta::get_embedding_dim(conn)? {
        Some(dim) if dim != embedding.len() => {
            bail!("embedding has {} dimensions, database expects {dim}", embedding.len())
        }
        Some(_) => {}
        None => bail!("database has no recorded embedding dimension"),
    }

    let tx = conn.transaction()?;
    let id = uuid::Uuid::now_v7().to_string();
    let recorded = meta::get_embedding_model(&tx)?;
    let model = match (recorded, model) {
        (Some(stored), Some(model)) if stored != model => {
            bail!("database holds embeddings from {stored}, refusing to mix in {model}")
        }
        (None, Some(model)) => {
            meta::set_embedding_model(&tx, model)?;
            Some(model.to_string())
        }
        (recorded, _) => recorded,
    };

    insert_memory(&tx, &id, content, metadata, model.as_deref())?;
    insert_vec(&tx, &id, embedding)?;

    tx.commit()?;

    tracing::debug!(%id, dims = embedding.len(), "stored embedding");
    Ok(StoredMemory {
        id,
        dimensions: embedding.len(),
    })
}

fn insert_memory(
    conn: &Transaction,
    id: &str,
    content: &str,
    metadata: Option<&serde_json::Value>,
    model: Option<&str>,
) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    let metadata_json = metadata.map(serde_json::to_string).transpose()?;

    conn.execute(
        "INSERT INTO memories (id, content, metadata, model, created_at, updated_at, is_deleted) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?5, 0)",
        params![id, content, metadata_json, model, now],
    )?;
    Ok(())
}

/// Insert an embedding vector into the vec0 virtual table.
fn insert_vec(conn: &Transaction, id: &str, embedding: &[f32]) -> Result<()> {
    let embedding_bytes = super::embedding_to_bytes(embedding);
    conn.execute(
        "INSERT INTO memories_vec (id, embedding) VALUES (?1, ?2)",
        params![id, embedding_bytes],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn unit(i: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; 8];
        v[i % 8] = 1.0;
        v
    }

    #[test]
    fn stores_row_and_vector() {
        let mut conn = db::open_memory_database(8).unwrap();
        let meta = serde_json::json!({"source": "test"});
        let stored = store_embedding(&mut conn, "hello", Some(&meta), &unit(0)).unwrap();
        assert_eq!(stored.dimensions, 8);

        let (content, metadata): (String, String) = conn
            .query_row(
                "SELECT content, metadata FROM memories WHERE id = ?1",
                params![stored.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(content, "hello");
        assert!(metadata.contains("source"));

        let vecs: i64 = conn
            .query_row("SELECT COUNT(*) FROM memories_vec WHERE id = ?1", params![stored.id], |r| r.get(0))
            .unwrap();
        assert_eq!(vecs, 1);
    }

    #[test]
    fn rejects_wrong_dimension_and_non_finite() {
        let mut conn = db::open_memory_database(8).unwrap();
        assert!(store_embedding(&mut conn, "x", None, &[1.0; 4]).is_err());

        let mut v = unit(1);
        v[3] = f32::NAN;
        let err = store_embedding(&mut conn, "x", None, &v).unwrap_err();
        assert!(err.to_string().contains("not finite"));

        assert!(store_embedding(&mut conn, "   ", None, &unit(1)).is_err());

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn records_model_name() {
        let mut conn = db::open_memory_database(8).unwrap();
        db::meta::set_embedding_model(&conn, "qwen3").unwrap();
        let stored = store_embedding(&mut conn, "hello", None, &unit(2)).unwrap();
        let model: Option<String> = conn
            .query_row("SELECT model FROM memories WHERE id = ?1", params![stored.id], |r| r.get(0))
            .unwrap();
        assert_eq!(model.as_deref(), Some("qwen3"));
    }

    #[test]
    fn first_model_is_recorded_with_the_row() {
        let mut conn = db::open_memory_database(8).unwrap();
        assert!(store_embedding_from(&mut conn, "reference/a", "   ", None, &unit(0)).is_err());
        assert_eq!(meta::get_embedding_model(&conn).unwrap(), None);

        let stored = store_embedding_from(&mut conn, "reference/a", "hello", None, &unit(0)).unwrap();
        assert_eq!(meta::get_embedding_model(&conn).unwrap().as_deref(), Some("reference/a"));
        let model: Option<String> = conn
            .query_row("SELECT model FROM memories WHERE id = ?1", params![stored.id], |r| r.get(0))
            .unwrap();
        assert_eq!(model.as_deref(), Some("reference/a"));

        let err = store_embedding_from(&mut conn, "llama/a", "other", None, &unit(1)).unwrap_err();
        assert!(err.to_string().contains("reference/a"), "got {err}");
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }
}
