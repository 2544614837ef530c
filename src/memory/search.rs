//! Read path: nearest-neighbour search and direct lookups.

use anyhow::{bail, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::memory::types::{parse_metadata, Memory, SearchHit};

/// vec0 refuses KNN queries with `k` above this.
const MAX_KNN: usize = 4096;

/// K nearest stored embeddings to `query`, most similar first.
///
/// Similarity is cosine, derived from the L2 distance vec0 reports, which
/// assumes stored and query vectors are L2-normalized. Hits below
/// `min_similarity` and soft-deleted memories are dropped.
pub fn search_similar(
    conn: &Connection,
    query: &[f32],
    limit: usize,
    min_similarity: f64,
) -> Result<Vec<SearchHit>> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    if query.iter().any(|x| !x.is_finite()) {
        bail!("query embedding contains non-finite values");
    }

    // Over-fetch by the number of soft-deleted rows so filtering cannot starve the result.
    let deleted: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE is_deleted = 1",
        [],
        |row| row.get(0),
    )?;
    let k = (limit + deleted as usize).min(MAX_KNN);
    let max_distance = super::cosine_threshold_to_l2(min_similarity);

    let candidates = vector_search(conn, query, k)?;

    let mut hits = Vec::with_capacity(limit);
    for (id, distance) in candidates {
        if distance > max_distance {
            break;
        }
        if let Some(memory) = get_memory(conn, &id)? {
            hits.push(SearchHit {
                memory,
                similarity: super::l2_to_cosine(distance),
                distance,
            });
            if hits.len() == limit {
                break;
            }
        }
    }

    tracing::debug!(limit, candidates = k, hits = hits.len(), "vector search");
    Ok(hits)
}

/// Vector KNN search over vec0. Returns `(id, distance)` pairs in ascending distance.
fn vector_search(conn: &Connection, embedding: &[f32], limit: usize) -> Result<Vec<(String, f64)>> {
    let embedding_bytes = super::embedding_to_bytes(embedding);
    let mut stmt = conn.prepare(
        "SELECT id, distance FROM memories_vec \
         WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    let results = stmt
        .query_map(params![embedding_bytes, limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(results)
}

const MEMORY_COLUMNS: &str = "id, content, metadata, model, created_at, updated_at";

fn memory_from_row(row: &Row<'_>) -> rusqlite::Result<Memory> {
    Ok(Memory {
        id: row.get(0)?,
        content: row.get(1)?,
        metadata: parse_metadata(row.get(2)?),
        model: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/// Fetch one live memory by id. Soft-deleted memories read as absent.
pub fn get_memory(conn: &Connection, id: &str) -> Result<Option<Memory>> {
    let memory = conn
        .query_row(
            &format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1 AND is_deleted = 0"),
            params![id],
            memory_from_row,
        )
        .optional()?;
    Ok(memory)
}

/// Page through live memories, newest first.
pub fn list_memories(conn: &Connection, limit: usize, offset: usize) -> Result<Vec<Memory>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MEMORY_COLUMNS} FROM memories WHERE is_deleted = 0 \
         ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2"
    ))?;
    let memories = stmt
        .query_map(params![limit as i64, offset as i64], memory_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(memories)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::memory::{forget, store};

    fn unit(i: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; 8];
        v[i % 8] = 1.0;
        v
    }

    fn blend(a: usize, b: usize, wb: f32) -> Vec<f32> {
        let mut v = unit(a);
        v[b] += wb;
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter_mut().for_each(|x| *x /= norm);
        v
    }

    #[test]
    fn nearest_first_with_cosine_scores() {
        let mut conn = db::open_memory_database(8).unwrap();
        let a = store::store_embedding(&mut conn, "a", None, &unit(0)).unwrap();
        let b = store::store_embedding(&mut conn, "b", None, &unit(1)).unwrap();

        let hits = search_similar(&conn, &blend(0, 1, 0.2), 5, 0.0).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].memory.id, a.id);
        assert_eq!(hits[1].memory.id, b.id);
        assert!(hits[0].similarity > 0.9);
        assert!(hits[0].similarity > hits[1].similarity);
    }

    #[test]
    fn threshold_filters_dissimilar() {
        let mut conn = db::open_memory_database(8).unwrap();
        store::store_embedding(&mut conn, "a", None, &unit(0)).unwrap();
        store::store_embedding(&mut conn, "b", None, &unit(1)).unwrap();

        let hits = search_similar(&conn, &unit(0), 5, 0.7).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory.content, "a");
    }

    #[test]
    fn soft_deleted_rows_do_not_starve_results() {
        let mut conn = db::open_memory_database(8).unwrap();
        let near = store::store_embedding(&mut conn, "near", None, &unit(0)).unwrap();
        store::store_embedding(&mut conn, "far", None, &blend(0, 1, 1.0)).unwrap();
        forget::delete_memory(&mut conn, &near.id, false).unwrap();

        let hits = search_similar(&conn, &unit(0), 1, 0.0).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory.content, "far");
    }

    #[test]
    fn list_pages_newest_first() {
        let mut conn = db::open_memory_database(8).unwrap();
        for i in 0..5 {
            store::store_embedding(&mut conn, &format!("m{i}"), None, &unit(i)).unwrap();
        }
        let page = list_memories(&conn, 2, 0).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].content, "m4");
        let rest = list_memories(&conn, 10, 2).unwrap();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[2].content, "m0");
    }

    #[test]
    fn get_missing_is_none() {
        let conn = db::open_memory_database(8).unwrap();
        assert!(get_memory(&conn, "nope").unwrap().is_none());
    }
}
