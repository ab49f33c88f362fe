//! SQLite implementations of `VectorStore` and `GraphStore`, plus the write
//! path used by ingestion.
//!
//! Vector search is a full scan: embeddings are stored as little-endian f32
//! blobs and scored with cosine similarity in Rust. Fine at personal
//! knowledge-base scale; an ANN index would replace this module, not the
//! contract.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::params;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::db::Db;
use crate::error::{Result, TwinError};
use crate::evidence::{GraphStore, VectorMatch, VectorQuery, VectorStore};
use crate::graph::{Edge, Node};

/// A chunk to ingest. The id is assigned on insert.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub context_id: String,
    pub source_id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub is_verified: bool,
}

#[derive(Debug, Clone)]
pub struct NewNode {
    pub context_id: String,
    pub name: String,
    pub node_type: String,
    pub description: String,
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct NewEdge {
    pub context_id: String,
    pub from_node_id: String,
    pub to_node_id: String,
    pub edge_type: String,
    pub weight: Option<f32>,
}

/// Store handle over one database. Cheap to clone.
#[derive(Clone)]
pub struct SqliteStore {
    db: Db,
}

impl SqliteStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn insert_chunk(&self, chunk: NewChunk) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let row_id = id.clone();
        self.db
            .with_connection(move |conn| {
                conn.execute(
                    "INSERT INTO chunks (id, context_id, source_id, text, embedding, is_verified)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        row_id,
                        chunk.context_id,
                        chunk.source_id,
                        chunk.text,
                        embedding_to_blob(&chunk.embedding),
                        chunk.is_verified as i32,
                    ],
                )
                .map_err(TwinError::Database)?;
                Ok(())
            })
            .await?;
        Ok(id)
    }

    pub async fn insert_node(&self, node: NewNode) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let row_id = id.clone();
        self.db
            .with_connection(move |conn| {
                // RFC 3339 so recency comparisons stay lexicographic.
                conn.execute(
                    "INSERT INTO nodes (id, context_id, name, type, description, properties_json, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        row_id,
                        node.context_id,
                        node.name,
                        node.node_type,
                        node.description,
                        Value::Object(node.properties).to_string(),
                        Utc::now().to_rfc3339(),
                    ],
                )
                .map_err(TwinError::Database)?;
                Ok(())
            })
            .await?;
        Ok(id)
    }

    pub async fn insert_edge(&self, edge: NewEdge) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let row_id = id.clone();
        self.db
            .with_connection(move |conn| {
                conn.execute(
                    "INSERT INTO edges (id, context_id, from_node_id, to_node_id, type, weight)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        row_id,
                        edge.context_id,
                        edge.from_node_id,
                        edge.to_node_id,
                        edge.edge_type,
                        edge.weight,
                    ],
                )
                .map_err(TwinError::Database)?;
                Ok(())
            })
            .await?;
        Ok(id)
    }

    /// Touch a node's `updated_at`, bumping it in recency order.
    pub async fn touch_node(&self, node_id: &str) -> Result<()> {
        let node_id = node_id.to_string();
        self.db
            .with_connection(move |conn| {
                conn.execute(
                    "UPDATE nodes SET updated_at = ?1 WHERE id = ?2",
                    params![Utc::now().to_rfc3339(), node_id],
                )
                .map_err(TwinError::Database)?;
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl VectorStore for SqliteStore {
    async fn query(&self, query: VectorQuery) -> Result<Vec<VectorMatch>> {
        let VectorQuery {
            embedding,
            context_id,
            verified,
            top_k,
        } = query;

        let rows = self
            .db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT source_id, text, embedding FROM chunks
                     WHERE context_id = ?1 AND is_verified = ?2 AND embedding IS NOT NULL",
                )?;
                let mut rows = stmt.query(params![context_id, verified as i32])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ));
                }
                Ok(out)
            })
            .await?;

        let mut scored: Vec<VectorMatch> = rows
            .into_iter()
            .filter_map(|(source_id, text, blob)| {
                let candidate = parse_embedding(&blob)?;
                if candidate.len() != embedding.len() {
                    log::warn!(
                        "chunk from {} has embedding dimension {}, expected {}",
                        source_id,
                        candidate.len(),
                        embedding.len()
                    );
                    return None;
                }
                Some(VectorMatch {
                    score: cosine_similarity(&embedding, &candidate),
                    text,
                    source_id,
                    verified,
                })
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[async_trait]
impl GraphStore for SqliteStore {
    async fn nodes(&self, context_id: &str, limit: usize) -> Result<Vec<Node>> {
        let context_id = context_id.to_string();
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, type, description, properties_json, created_at, updated_at
                     FROM nodes WHERE context_id = ?1
                     ORDER BY COALESCE(updated_at, created_at) DESC
                     LIMIT ?2",
                )?;
                let nodes = stmt
                    .query_map(params![context_id, limit as i64], row_to_node)?
                    .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()
                    .map_err(TwinError::Database)?;
                Ok(nodes)
            })
            .await
    }

    async fn nodes_by_ids(&self, context_id: &str, ids: &[String]) -> Result<Vec<Node>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let context_id = context_id.to_string();
        let ids = ids.to_vec();
        self.db
            .with_connection(move |conn| {
                let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
                let sql = format!(
                    "SELECT id, name, type, description, properties_json, created_at, updated_at
                     FROM nodes WHERE context_id = ? AND id IN ({})",
                    placeholders
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut values = vec![context_id];
                values.extend(ids);
                let nodes = stmt
                    .query_map(rusqlite::params_from_iter(values), row_to_node)?
                    .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()
                    .map_err(TwinError::Database)?;
                Ok(nodes)
            })
            .await
    }

    async fn edges(&self, context_id: &str) -> Result<Vec<Edge>> {
        let context_id = context_id.to_string();
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, from_node_id, to_node_id, type, weight
                     FROM edges WHERE context_id = ?1",
                )?;
                let edges = stmt
                    .query_map(params![context_id], |row| {
                        Ok(Edge {
                            id: row.get(0)?,
                            from_node_id: row.get(1)?,
                            to_node_id: row.get(2)?,
                            edge_type: row.get(3)?,
                            weight: row.get(4)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()
                    .map_err(TwinError::Database)?;
                Ok(edges)
            })
            .await
    }
}

fn row_to_node(row: &rusqlite::Row<'_>) -> std::result::Result<Node, rusqlite::Error> {
    let properties_json: String = row.get(4)?;
    // A corrupt properties blob degrades to no properties, not a failed query.
    let properties = serde_json::from_str::<Map<String, Value>>(&properties_json).unwrap_or_default();
    Ok(Node {
        id: row.get(0)?,
        name: row.get(1)?,
        node_type: row.get(2)?,
        description: row.get(3)?,
        properties,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

/// Serialize an embedding as a little-endian f32 blob.
pub fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn parse_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    blob.chunks(4)
        .map(|bytes| {
            let arr: [u8; 4] = bytes.try_into().ok()?;
            Some(f32::from_le_bytes(arr))
        })
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}
