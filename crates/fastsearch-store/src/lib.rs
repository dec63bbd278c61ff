use fastsearch_models::RerankerBackend;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid metadata json: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("rerank failed: {0}")]
    Rerank(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A chunk to insert, paired with its embedding.
#[derive(Debug, Clone)]
pub struct ChunkInsert {
    pub source: String,
    pub chunk_index: i64,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: serde_json::Value,
}

/// One search result row. Method-specific scoring fields are `None` (and
/// omitted from JSON) for the paths that do not produce them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: i64,
    pub source: String,
    pub chunk_index: i64,
    pub content: String,
    pub metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub distance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rrf_score: Option<f64>,
    /// `Some(None)` serializes as an explicit null: the hit came out of
    /// hybrid fusion but missed the BM25 list.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bm25_rank: Option<Option<i64>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub vec_rank: Option<Option<i64>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rerank_score: Option<f64>,
    /// 1-based position within the returned list.
    pub rank: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceCount {
    pub source: String,
    pub chunks: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_chunks: i64,
    pub total_sources: i64,
    pub top_sources: Vec<SourceCount>,
    pub db_size_bytes: u64,
    pub db_size_mb: f64,
}

/// RRF fusion parameters: `score = w_bm25/(k + bm25_rank) + w_vec/(k + vec_rank)`.
#[derive(Debug, Clone, Copy)]
pub struct HybridOptions {
    pub k: i64,
    pub w_bm25: f64,
    pub w_vec: f64,
}

impl Default for HybridOptions {
    fn default() -> Self {
        Self {
            k: 60,
            w_bm25: 1.0,
            w_vec: 1.0,
        }
    }
}

/// SQLite-backed chunk index: a `docs` table, an FTS5 mirror kept in sync by
/// triggers, and a vector table keyed by the same rowid.
///
/// The file can be opened by any number of reader processes; writers
/// serialize at the SQLite layer.
pub struct SearchDb {
    conn: Connection,
    db_path: PathBuf,
    dimension: usize,
}

impl SearchDb {
    /// Open (creating if needed) the index at `path` with the given
    /// embedding dimension.
    pub fn open(path: &Path, dimension: usize) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn,
            db_path: path.to_path_buf(),
            dimension,
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS docs (
                id INTEGER PRIMARY KEY,
                source TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_docs_source ON docs(source);

            CREATE VIRTUAL TABLE IF NOT EXISTS docs_fts USING fts5(
                content,
                content='docs',
                content_rowid='id'
            );

            CREATE TRIGGER IF NOT EXISTS docs_ai AFTER INSERT ON docs BEGIN
                INSERT INTO docs_fts(rowid, content) VALUES (new.id, new.content);
            END;
            CREATE TRIGGER IF NOT EXISTS docs_ad AFTER DELETE ON docs BEGIN
                INSERT INTO docs_fts(docs_fts, rowid, content)
                VALUES ('delete', old.id, old.content);
            END;
            CREATE TRIGGER IF NOT EXISTS docs_au AFTER UPDATE ON docs BEGIN
                INSERT INTO docs_fts(docs_fts, rowid, content)
                VALUES ('delete', old.id, old.content);
                INSERT INTO docs_fts(rowid, content) VALUES (new.id, new.content);
            END;

            CREATE TABLE IF NOT EXISTS docs_vec (
                id INTEGER PRIMARY KEY,
                embedding BLOB NOT NULL
            );",
        )?;
        Ok(())
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            });
        }
        Ok(())
    }

    /// Append one chunk and its vector. Both rows land in one transaction.
    pub fn index_one(
        &mut self,
        source: &str,
        chunk_index: i64,
        content: &str,
        embedding: &[f32],
        metadata: &serde_json::Value,
    ) -> Result<i64> {
        self.check_dimension(embedding)?;
        let tx = self.conn.transaction()?;
        let id = insert_chunk(&tx, source, chunk_index, content, embedding, metadata)?;
        tx.commit()?;
        Ok(id)
    }

    /// Atomic batch insert: either every item commits or none does.
    /// Returned ids match the input order.
    pub fn index_batch(&mut self, items: &[ChunkInsert]) -> Result<Vec<i64>> {
        for item in items {
            self.check_dimension(&item.embedding)?;
        }
        let tx = self.conn.transaction()?;
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            ids.push(insert_chunk(
                &tx,
                &item.source,
                item.chunk_index,
                &item.content,
                &item.embedding,
                &item.metadata,
            )?);
        }
        tx.commit()?;
        Ok(ids)
    }

    /// Remove every chunk of a source from all three structures.
    /// Returns the number of chunks removed.
    pub fn delete_source(&mut self, source: &str) -> Result<usize> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM docs_vec WHERE id IN (SELECT id FROM docs WHERE source = ?1)",
            params![source],
        )?;
        // The delete trigger keeps the FTS mirror in sync.
        let removed = tx.execute("DELETE FROM docs WHERE source = ?1", params![source])?;
        tx.commit()?;
        Ok(removed)
    }

    /// Full-text search ranked by raw BM25 score ascending (lower = better,
    /// SQLite's convention). Ties break by id ascending.
    pub fn search_bm25(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let mut stmt = self.conn.prepare(
            "SELECT d.id, d.source, d.chunk_index, d.content, d.metadata,
                    bm25(docs_fts) AS score
             FROM docs_fts f
             JOIN docs d ON f.rowid = d.id
             WHERE docs_fts MATCH ?1
             ORDER BY score, d.id
             LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![query, limit as i64])?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            let mut hit = row_to_hit(row, results.len() + 1)?;
            hit.score = Some(row.get::<_, f64>(5)?);
            results.push(hit);
        }
        Ok(results)
    }

    /// Top-k nearest neighbors by cosine distance ascending. Ties break by
    /// id ascending.
    pub fn search_vector(&self, embedding: &[f32], limit: usize) -> Result<Vec<SearchHit>> {
        self.check_dimension(embedding)?;
        let mut stmt = self.conn.prepare(
            "SELECT v.id, v.embedding, d.source, d.chunk_index, d.content, d.metadata
             FROM docs_vec v
             JOIN docs d ON v.id = d.id",
        )?;
        let mut rows = stmt.query([])?;
        let mut scored: Vec<(f64, SearchHit)> = Vec::new();
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            let stored = decode_vector(&blob);
            let distance = cosine_distance(embedding, &stored);
            let hit = SearchHit {
                id,
                source: row.get(2)?,
                chunk_index: row.get(3)?,
                content: row.get(4)?,
                metadata: parse_metadata(row.get::<_, Option<String>>(5)?)?,
                score: None,
                distance: Some(distance),
                rrf_score: None,
                bm25_rank: None,
                vec_rank: None,
                rerank_score: None,
                rank: 0,
            };
            scored.push((distance, hit));
        }
        scored.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        scored.truncate(limit);
        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(i, (_, mut hit))| {
                hit.rank = i + 1;
                hit
            })
            .collect())
    }

    /// Hybrid search: reciprocal rank fusion over independent BM25 and
    /// vector lookups.
    ///
    /// Each path contributes `3 * limit` candidates; an id absent from one
    /// list is charged the penalty rank `fetch_limit + 1` so single-modality
    /// hits still compete. Sorted by fused score descending with
    /// deterministic tie-breaking (bm25 rank, then vector rank, then id).
    pub fn search_hybrid(
        &self,
        query: &str,
        embedding: &[f32],
        limit: usize,
        opts: &HybridOptions,
    ) -> Result<Vec<SearchHit>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let fetch_limit = limit * 3;
        let bm25_results = self.search_bm25(query, fetch_limit)?;
        let vec_results = self.search_vector(embedding, fetch_limit)?;

        let bm25_ranks: HashMap<i64, i64> = bm25_results
            .iter()
            .map(|h| (h.id, h.rank as i64))
            .collect();
        let vec_ranks: HashMap<i64, i64> =
            vec_results.iter().map(|h| (h.id, h.rank as i64)).collect();

        let mut lookup: HashMap<i64, SearchHit> = HashMap::new();
        for hit in bm25_results.into_iter().chain(vec_results) {
            lookup.entry(hit.id).or_insert(hit);
        }

        let penalty = fetch_limit as i64 + 1;
        struct Fused {
            rrf_score: f64,
            bm25_rank: Option<i64>,
            vec_rank: Option<i64>,
            hit: SearchHit,
        }
        let mut fused: Vec<Fused> = lookup
            .into_values()
            .map(|hit| {
                let bm25_rank = bm25_ranks.get(&hit.id).copied();
                let vec_rank = vec_ranks.get(&hit.id).copied();
                let rrf_score = opts.w_bm25 / (opts.k + bm25_rank.unwrap_or(penalty)) as f64
                    + opts.w_vec / (opts.k + vec_rank.unwrap_or(penalty)) as f64;
                Fused {
                    rrf_score,
                    bm25_rank,
                    vec_rank,
                    hit,
                }
            })
            .collect();

        fused.sort_by(|a, b| {
            b.rrf_score
                .partial_cmp(&a.rrf_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    a.bm25_rank
                        .unwrap_or(penalty)
                        .cmp(&b.bm25_rank.unwrap_or(penalty))
                })
                .then_with(|| {
                    a.vec_rank
                        .unwrap_or(penalty)
                        .cmp(&b.vec_rank.unwrap_or(penalty))
                })
                .then_with(|| a.hit.id.cmp(&b.hit.id))
        });
        fused.truncate(limit);

        Ok(fused
            .into_iter()
            .enumerate()
            .map(|(i, f)| {
                let mut hit = f.hit;
                hit.score = None;
                hit.distance = None;
                hit.rrf_score = Some(f.rrf_score);
                hit.bm25_rank = Some(f.bm25_rank);
                hit.vec_rank = Some(f.vec_rank);
                hit.rank = i + 1;
                hit
            })
            .collect())
    }

    /// Hybrid search rescored by a cross-encoder.
    ///
    /// Fetches `rerank_top_k` RRF candidates, scores each `(query, content)`
    /// pair, and returns the top `limit` by reranker score descending (ties
    /// keep their RRF order).
    pub fn search_hybrid_reranked(
        &self,
        query: &str,
        embedding: &[f32],
        limit: usize,
        rerank_top_k: usize,
        reranker: &dyn RerankerBackend,
    ) -> Result<Vec<SearchHit>> {
        if rerank_top_k == 0 {
            return Ok(Vec::new());
        }
        let candidates =
            self.search_hybrid(query, embedding, rerank_top_k, &HybridOptions::default())?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let pairs: Vec<(String, String)> = candidates
            .iter()
            .map(|c| (query.to_string(), c.content.clone()))
            .collect();
        let scores = reranker.predict(&pairs).map_err(StoreError::Rerank)?;

        let mut rescored: Vec<(usize, f64, SearchHit)> = candidates
            .into_iter()
            .zip(scores)
            .enumerate()
            .map(|(i, (hit, score))| (i, score as f64, hit))
            .collect();
        rescored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        rescored.truncate(limit);

        Ok(rescored
            .into_iter()
            .enumerate()
            .map(|(i, (_, score, mut hit))| {
                hit.rerank_score = Some(score);
                hit.rank = i + 1;
                hit
            })
            .collect())
    }

    pub fn get_stats(&self) -> Result<StoreStats> {
        let total_chunks: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM docs", [], |row| row.get(0))?;
        let total_sources: i64 =
            self.conn
                .query_row("SELECT COUNT(DISTINCT source) FROM docs", [], |row| {
                    row.get(0)
                })?;

        let mut stmt = self.conn.prepare(
            "SELECT source, COUNT(*) AS chunks FROM docs
             GROUP BY source ORDER BY chunks DESC, source LIMIT 10",
        )?;
        let top_sources = stmt
            .query_map([], |row| {
                Ok(SourceCount {
                    source: row.get(0)?,
                    chunks: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let db_size_bytes = std::fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0);
        Ok(StoreStats {
            total_chunks,
            total_sources,
            top_sources,
            db_size_bytes,
            db_size_mb: round2(db_size_bytes as f64 / (1024.0 * 1024.0)),
        })
    }
}

fn insert_chunk(
    tx: &rusqlite::Transaction<'_>,
    source: &str,
    chunk_index: i64,
    content: &str,
    embedding: &[f32],
    metadata: &serde_json::Value,
) -> Result<i64> {
    let metadata_text = if metadata.is_null() {
        "{}".to_string()
    } else {
        serde_json::to_string(metadata)?
    };
    tx.execute(
        "INSERT INTO docs (source, chunk_index, content, metadata) VALUES (?1, ?2, ?3, ?4)",
        params![source, chunk_index, content, metadata_text],
    )?;
    let id = tx.last_insert_rowid();
    tx.execute(
        "INSERT INTO docs_vec (id, embedding) VALUES (?1, ?2)",
        params![id, encode_vector(embedding)],
    )?;
    Ok(id)
}

fn row_to_hit(row: &rusqlite::Row<'_>, rank: usize) -> Result<SearchHit> {
    Ok(SearchHit {
        id: row.get(0)?,
        source: row.get(1)?,
        chunk_index: row.get(2)?,
        content: row.get(3)?,
        metadata: parse_metadata(row.get::<_, Option<String>>(4)?)?,
        score: None,
        distance: None,
        rrf_score: None,
        bm25_rank: None,
        vec_rank: None,
        rerank_score: None,
        rank,
    })
}

fn parse_metadata(raw: Option<String>) -> Result<serde_json::Value> {
    match raw {
        Some(text) if !text.is_empty() => Ok(serde_json::from_str(&text)?),
        _ => Ok(serde_json::json!({})),
    }
}

/// Vectors are stored as little-endian f32 bytes, round-tripped exactly.
fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine distance in [0, 2]; zero-norm vectors are maximally distant from
/// everything.
fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - (dot / (norm_a * norm_b)) as f64
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastsearch_models::OverlapReranker;
    use tempfile::TempDir;

    const DIM: usize = 4;

    fn open_db(dir: &TempDir) -> SearchDb {
        SearchDb::open(&dir.path().join("test.db"), DIM).unwrap()
    }

    fn unit(index: usize) -> Vec<f32> {
        let mut v = vec![0.0; DIM];
        v[index] = 1.0;
        v
    }

    fn insert(db: &mut SearchDb, source: &str, chunk_index: i64, content: &str, v: Vec<f32>) -> i64 {
        db.index_one(source, chunk_index, content, &v, &serde_json::json!({}))
            .unwrap()
    }

    #[test]
    fn bm25_finds_single_document() {
        let dir = TempDir::new().unwrap();
        let mut db = open_db(&dir);
        let id = insert(&mut db, "doc.md", 0, "the quick brown fox", unit(0));

        let results = db.search_bm25("quick", 5).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, id);
        assert_eq!(results[0].rank, 1);
        assert!(results[0].score.is_some());
        assert!(results[0].distance.is_none());
    }

    #[test]
    fn bm25_misses_return_empty() {
        let dir = TempDir::new().unwrap();
        let mut db = open_db(&dir);
        insert(&mut db, "doc.md", 0, "the quick brown fox", unit(0));
        assert!(db.search_bm25("zebra", 5).unwrap().is_empty());
    }

    #[test]
    fn vector_search_orders_by_distance() {
        let dir = TempDir::new().unwrap();
        let mut db = open_db(&dir);
        let first = insert(&mut db, "a.md", 0, "first", unit(0));
        let second = insert(&mut db, "b.md", 0, "second", unit(1));

        let results = db.search_vector(&unit(0), 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, first);
        assert_eq!(results[0].rank, 1);
        assert_eq!(results[1].id, second);
        assert!(results[0].distance.unwrap() < results[1].distance.unwrap());
        assert!(results[0].distance.unwrap() < 1e-6);
    }

    #[test]
    fn exact_vector_match_returns_inserted_id() {
        let dir = TempDir::new().unwrap();
        let mut db = open_db(&dir);
        let mut ids = Vec::new();
        for i in 0..DIM {
            ids.push(insert(&mut db, "s.md", i as i64, &format!("chunk {i}"), unit(i)));
        }
        for (i, id) in ids.iter().enumerate() {
            let top = db.search_vector(&unit(i), 1).unwrap();
            assert_eq!(top[0].id, *id);
        }
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut db = open_db(&dir);
        let err = db
            .index_one("a.md", 0, "text", &[1.0, 0.0], &serde_json::json!({}))
            .expect_err("short vector");
        assert!(matches!(
            err,
            StoreError::DimensionMismatch { expected: 4, got: 2 }
        ));

        let err = db.search_vector(&[0.0; 8], 5).expect_err("long vector");
        assert!(matches!(
            err,
            StoreError::DimensionMismatch { expected: 4, got: 8 }
        ));
    }

    #[test]
    fn batch_insert_is_atomic() {
        let dir = TempDir::new().unwrap();
        let mut db = open_db(&dir);
        let items = vec![
            ChunkInsert {
                source: "a.md".into(),
                chunk_index: 0,
                content: "fine".into(),
                embedding: unit(0),
                metadata: serde_json::json!({}),
            },
            ChunkInsert {
                source: "a.md".into(),
                chunk_index: 1,
                content: "bad vector".into(),
                embedding: vec![1.0],
                metadata: serde_json::json!({}),
            },
        ];
        assert!(db.index_batch(&items).is_err());
        assert_eq!(db.get_stats().unwrap().total_chunks, 0);
    }

    #[test]
    fn batch_ids_match_input_order() {
        let dir = TempDir::new().unwrap();
        let mut db = open_db(&dir);
        let items: Vec<ChunkInsert> = (0..3)
            .map(|i| ChunkInsert {
                source: "a.md".into(),
                chunk_index: i,
                content: format!("chunk number {i}"),
                embedding: unit(i as usize % DIM),
                metadata: serde_json::json!({"i": i}),
            })
            .collect();
        let ids = db.index_batch(&items).unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn lexical_and_vector_mirrors_stay_consistent() {
        let dir = TempDir::new().unwrap();
        let mut db = open_db(&dir);
        insert(&mut db, "a.md", 0, "alpha beta", unit(0));
        insert(&mut db, "a.md", 1, "gamma delta", unit(1));
        insert(&mut db, "b.md", 0, "epsilon zeta", unit(2));
        db.delete_source("a.md").unwrap();

        let docs: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM docs", [], |r| r.get(0))
            .unwrap();
        let fts: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM docs_fts", [], |r| r.get(0))
            .unwrap();
        let vectors: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM docs_vec", [], |r| r.get(0))
            .unwrap();
        assert_eq!(docs, 1);
        assert_eq!(fts, 1);
        assert_eq!(vectors, 1);
    }

    #[test]
    fn delete_source_removes_from_every_search_path() {
        let dir = TempDir::new().unwrap();
        let mut db = open_db(&dir);
        insert(&mut db, "gone.md", 0, "unique disappearing words", unit(0));
        insert(&mut db, "kept.md", 0, "other content", unit(1));

        let removed = db.delete_source("gone.md").unwrap();
        assert_eq!(removed, 1);
        assert_eq!(db.delete_source("gone.md").unwrap(), 0);

        assert!(db.search_bm25("disappearing", 10).unwrap().is_empty());
        let vec_hits = db.search_vector(&unit(0), 10).unwrap();
        assert!(vec_hits.iter().all(|h| h.source != "gone.md"));

        let stats = db.get_stats().unwrap();
        assert_eq!(stats.total_chunks, 1);
        assert_eq!(stats.total_sources, 1);
        assert_eq!(stats.top_sources[0].source, "kept.md");
    }

    #[test]
    fn hybrid_scores_follow_rrf_formula() {
        let dir = TempDir::new().unwrap();
        let mut db = open_db(&dir);
        insert(&mut db, "a.md", 0, "quick fox jumps", unit(0));
        insert(&mut db, "b.md", 0, "lazy dog sleeps", unit(1));

        let results = db
            .search_hybrid("quick fox", &unit(0), 5, &HybridOptions::default())
            .unwrap();
        assert!(!results.is_empty());
        let top = &results[0];
        assert_eq!(top.rank, 1);

        let fetch_limit = 15_i64;
        let bm25_rank = top.bm25_rank.unwrap().unwrap_or(fetch_limit + 1);
        let vec_rank = top.vec_rank.unwrap().unwrap_or(fetch_limit + 1);
        let expected = 1.0 / (60 + bm25_rank) as f64 + 1.0 / (60 + vec_rank) as f64;
        assert!((top.rrf_score.unwrap() - expected).abs() < 1e-12);
        for hit in &results {
            assert!(hit.rrf_score.is_some());
        }
    }

    #[test]
    fn hybrid_keeps_single_modality_hits() {
        let dir = TempDir::new().unwrap();
        let mut db = open_db(&dir);
        // Lexical-only hit: matching words, orthogonal vector.
        let lexical = insert(&mut db, "lex.md", 0, "quick fox", unit(2));
        // Vector-only hit: no matching words, aligned vector.
        let semantic = insert(&mut db, "sem.md", 0, "renard rapide", unit(0));

        let results = db
            .search_hybrid("quick fox", &unit(0), 5, &HybridOptions::default())
            .unwrap();
        let ids: Vec<i64> = results.iter().map(|h| h.id).collect();
        assert!(ids.contains(&lexical));
        assert!(ids.contains(&semantic));

        let lex_hit = results.iter().find(|h| h.id == lexical).unwrap();
        assert_eq!(lex_hit.bm25_rank, Some(Some(1)));
        // Orthogonal vectors still appear in the scan; the penalty applies
        // only when a hit falls outside a list entirely.
        assert!(lex_hit.vec_rank.is_some());
    }

    #[test]
    fn hybrid_is_deterministic_across_runs() {
        let dir = TempDir::new().unwrap();
        let mut db = open_db(&dir);
        // Identical contents and identical vectors force ties everywhere.
        for i in 0..4 {
            insert(&mut db, &format!("tie{i}.md"), 0, "same words here", unit(0));
        }
        let opts = HybridOptions::default();
        let first = db.search_hybrid("same words", &unit(0), 4, &opts).unwrap();
        let second = db.search_hybrid("same words", &unit(0), 4, &opts).unwrap();
        let a = serde_json::to_string(&first).unwrap();
        let b = serde_json::to_string(&second).unwrap();
        assert_eq!(a, b, "tie order must be reproducible");
    }

    #[test]
    fn hybrid_weights_shift_ranking() {
        let dir = TempDir::new().unwrap();
        let mut db = open_db(&dir);
        let lexical = insert(&mut db, "lex.md", 0, "quick fox story", unit(2));
        let semantic = insert(&mut db, "sem.md", 0, "unrelated words", unit(0));

        let bm25_heavy = HybridOptions {
            w_bm25: 10.0,
            w_vec: 0.1,
            ..HybridOptions::default()
        };
        let results = db.search_hybrid("quick fox", &unit(0), 2, &bm25_heavy).unwrap();
        assert_eq!(results[0].id, lexical);

        let vec_heavy = HybridOptions {
            w_bm25: 0.1,
            w_vec: 10.0,
            ..HybridOptions::default()
        };
        let results = db.search_hybrid("quick fox", &unit(0), 2, &vec_heavy).unwrap();
        assert_eq!(results[0].id, semantic);
    }

    #[test]
    fn reranked_search_respects_limit_and_ranks() {
        let dir = TempDir::new().unwrap();
        let mut db = open_db(&dir);
        insert(&mut db, "a.md", 0, "quick brown fox", unit(0));
        insert(&mut db, "b.md", 0, "quick silver wolf", unit(1));
        insert(&mut db, "c.md", 0, "slow green turtle", unit(2));

        let reranker = OverlapReranker::new("overlap-test");
        let results = db
            .search_hybrid_reranked("quick brown fox", &unit(0), 2, 9, &reranker)
            .unwrap();
        assert!(results.len() <= 2);
        for (i, hit) in results.iter().enumerate() {
            assert_eq!(hit.rank, i + 1);
            assert!(hit.rerank_score.is_some());
        }
        assert_eq!(results[0].source, "a.md", "full overlap must win");
    }

    #[test]
    fn reranked_search_with_zero_top_k_skips_reranker() {
        let dir = TempDir::new().unwrap();
        let mut db = open_db(&dir);
        insert(&mut db, "a.md", 0, "content", unit(0));

        struct PanickingReranker;
        impl RerankerBackend for PanickingReranker {
            fn predict(&self, _pairs: &[(String, String)]) -> anyhow::Result<Vec<f32>> {
                panic!("reranker must not be invoked");
            }
            fn model_id(&self) -> &str {
                "panicking"
            }
        }
        let results = db
            .search_hybrid_reranked("content", &unit(0), 5, 0, &PanickingReranker)
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn reranked_search_on_empty_store_is_empty() {
        let dir = TempDir::new().unwrap();
        let db = SearchDb::open(&dir.path().join("empty.db"), DIM).unwrap();
        let reranker = OverlapReranker::new("overlap-test");
        let results = db
            .search_hybrid_reranked("anything", &unit(0), 5, 10, &reranker)
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn metadata_round_trips_as_json() {
        let dir = TempDir::new().unwrap();
        let mut db = open_db(&dir);
        let metadata = serde_json::json!({"lang": "en", "page": 3});
        db.index_one("m.md", 0, "metadata test", &unit(0), &metadata)
            .unwrap();
        let results = db.search_bm25("metadata", 1).unwrap();
        assert_eq!(results[0].metadata, metadata);

        // Null metadata reads back as an empty object.
        db.index_one("n.md", 0, "null metadata", &unit(1), &serde_json::Value::Null)
            .unwrap();
        let results = db.search_bm25("null", 1).unwrap();
        assert_eq!(results[0].metadata, serde_json::json!({}));
    }

    #[test]
    fn stats_reports_counts_and_size() {
        let dir = TempDir::new().unwrap();
        let mut db = open_db(&dir);
        for i in 0..3 {
            insert(&mut db, "big.md", i, &format!("chunk {i}"), unit(0));
        }
        insert(&mut db, "small.md", 0, "single", unit(1));

        let stats = db.get_stats().unwrap();
        assert_eq!(stats.total_chunks, 4);
        assert_eq!(stats.total_sources, 2);
        assert_eq!(stats.top_sources[0].source, "big.md");
        assert_eq!(stats.top_sources[0].chunks, 3);
        assert!(stats.db_size_bytes > 0);
    }

    #[test]
    fn vectors_round_trip_as_f32() {
        let v = vec![0.25f32, -1.5, 3.75, f32::MIN_POSITIVE];
        assert_eq!(decode_vector(&encode_vector(&v)), v);
    }

    #[test]
    fn reopen_preserves_index() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("persist.db");
        {
            let mut db = SearchDb::open(&path, DIM).unwrap();
            db.index_one("p.md", 0, "persistent content", &unit(0), &serde_json::json!({}))
                .unwrap();
        }
        let db = SearchDb::open(&path, DIM).unwrap();
        let results = db.search_bm25("persistent", 5).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(db.search_vector(&unit(0), 1).unwrap().len(), 1);
    }
}
