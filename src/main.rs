use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use twinbrain::agent::{Orchestrator, SearchKnowledgeBase, Tool};
use twinbrain::cache::EmbeddingCache;
use twinbrain::clients::{HttpReranker, OpenAiChat, OpenAiEmbedder};
use twinbrain::db::{migrate, Db};
use twinbrain::evidence::{Embedder, GraphStore, Reranker, VectorStore};
use twinbrain::store::{NewChunk, NewEdge, NewNode, SqliteStore};
use twinbrain::{AnswerRequest, Config, HybridRetriever, SnapshotBuilder};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", "info")).init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("verify");

    match command {
        "ask" => {
            let context_id = args
                .get(2)
                .context("usage: twinbrain ask <context_id> <query>")?;
            let query = args.get(3..).filter(|q| !q.is_empty()).map(|q| q.join(" "));
            let query = query.context("usage: twinbrain ask <context_id> <query>")?;
            run_ask(context_id, &query).await?;
        }
        "ingest" => {
            let context_id = args
                .get(2)
                .context("usage: twinbrain ingest <context_id> <file.jsonl>")?;
            let file = args
                .get(3)
                .context("usage: twinbrain ingest <context_id> <file.jsonl>")?;
            run_ingest(context_id, Path::new(file)).await?;
        }
        _ => {
            run_verify().await?;
        }
    }

    Ok(())
}

async fn open_database(config: &Config) -> Result<Db> {
    let db = Db::new(config.db_path());
    let migrations_dir = config.twinbrain.migrations_dir.clone();
    db.with_connection(move |conn| migrate::run_migrations(conn, &migrations_dir))
        .await?;
    Ok(db)
}

fn build_embedder(config: &Config) -> Result<OpenAiEmbedder> {
    let api_key = config.embeddings_api_key()?;
    let mut embedder = OpenAiEmbedder::new(
        config.embeddings.base_url.clone(),
        api_key,
        config.embeddings.model.clone(),
    )
    .with_batch_size(config.embeddings.batch_size);
    if config.embeddings.cache_capacity > 0 {
        embedder = embedder.with_cache(Arc::new(EmbeddingCache::new(config.embeddings.cache_capacity)));
    }
    Ok(embedder)
}

/// Answer one query, printing the NDJSON event stream to stdout.
async fn run_ask(context_id: &str, query: &str) -> Result<()> {
    let config = Config::load()?;
    let db = open_database(&config).await?;
    let store = SqliteStore::new(db);

    let embedder: Arc<dyn Embedder> = Arc::new(build_embedder(&config)?);
    let vectors: Arc<dyn VectorStore> = Arc::new(store.clone());
    let graph: Arc<dyn GraphStore> = Arc::new(store);

    let mut retriever = HybridRetriever::new(embedder, vectors);
    if let Some(rerank) = &config.rerank {
        let api_key = std::env::var(&rerank.api_key_env)
            .with_context(|| format!("environment variable {} not set", rerank.api_key_env))?;
        let reranker: Arc<dyn Reranker> = Arc::new(HttpReranker::new(
            rerank.base_url.clone(),
            api_key,
            rerank.model.clone(),
        ));
        retriever = retriever.with_reranker(reranker);
    }
    let retriever = Arc::new(retriever);

    let snapshot = SnapshotBuilder::new(graph)
        .with_caps(config.graph.max_nodes, config.graph.max_edges)
        .build(context_id, Some(query))
        .await;
    log::info!(
        "graph snapshot: {} nodes, {} edges",
        snapshot.node_count(),
        snapshot.edge_count()
    );

    let model = OpenAiChat::new(
        config.llm.base_url.clone(),
        config.llm_api_key()?,
        config.llm.model.clone(),
    )
    .with_temperature(config.llm.temperature);

    let search: Arc<dyn Tool> = Arc::new(SearchKnowledgeBase::new(
        retriever,
        context_id,
        config.retrieval.top_k,
    ));
    let orchestrator = Arc::new(
        Orchestrator::new(Arc::new(model), vec![search])
            .with_max_iterations(config.agent.max_iterations)
            .with_escalation_threshold(config.agent.escalation_threshold),
    );

    let mut request = AnswerRequest::new(Uuid::new_v4().to_string(), query);
    if !snapshot.context_text.is_empty() {
        request.context_text = Some(snapshot.context_text);
    }

    let mut stream = orchestrator.run_stream(request);
    let mut saw_done = false;
    while let Some(event) = stream.next().await {
        if matches!(event, twinbrain::StreamEvent::Done { .. }) {
            saw_done = true;
        }
        println!("{}", event.to_ndjson());
    }
    if !saw_done {
        anyhow::bail!("answer stream ended without a terminal event");
    }
    Ok(())
}

/// One line of an ingest file.
#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum IngestRecord {
    Chunk {
        source_id: String,
        text: String,
        #[serde(default)]
        is_verified: bool,
    },
    Node {
        name: String,
        #[serde(rename = "type")]
        node_type: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        properties: Map<String, Value>,
    },
    Edge {
        /// Node names, resolved against nodes created in the same file.
        from: String,
        to: String,
        #[serde(rename = "type")]
        edge_type: String,
        #[serde(default)]
        weight: Option<f32>,
    },
}

/// Load a JSONL file of chunks, nodes and edges into one context.
async fn run_ingest(context_id: &str, file: &Path) -> Result<()> {
    let config = Config::load()?;
    let db = open_database(&config).await?;
    let store = SqliteStore::new(db);
    let embedder = build_embedder(&config)?;

    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let mut records = Vec::new();
    for (line_no, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: IngestRecord = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: bad record", file.display(), line_no + 1))?;
        records.push(record);
    }

    let chunk_texts: Vec<String> = records
        .iter()
        .filter_map(|r| match r {
            IngestRecord::Chunk { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect();
    let mut embeddings = embedder.embed_batch(chunk_texts).await?.into_iter();

    let mut node_ids = std::collections::HashMap::new();
    let mut counts = (0usize, 0usize, 0usize);
    for record in records {
        match record {
            IngestRecord::Chunk {
                source_id,
                text,
                is_verified,
            } => {
                let embedding = embeddings
                    .next()
                    .context("embedding batch shorter than chunk count")?;
                store
                    .insert_chunk(NewChunk {
                        context_id: context_id.to_string(),
                        source_id,
                        text,
                        embedding,
                        is_verified,
                    })
                    .await?;
                counts.0 += 1;
            }
            IngestRecord::Node {
                name,
                node_type,
                description,
                properties,
            } => {
                let id = store
                    .insert_node(NewNode {
                        context_id: context_id.to_string(),
                        name: name.clone(),
                        node_type,
                        description,
                        properties,
                    })
                    .await?;
                node_ids.insert(name, id);
                counts.1 += 1;
            }
            IngestRecord::Edge {
                from,
                to,
                edge_type,
                weight,
            } => {
                let (Some(from_id), Some(to_id)) = (node_ids.get(&from), node_ids.get(&to)) else {
                    log::warn!("edge {} -> {} references unknown node, skipping", from, to);
                    continue;
                };
                store
                    .insert_edge(NewEdge {
                        context_id: context_id.to_string(),
                        from_node_id: from_id.clone(),
                        to_node_id: to_id.clone(),
                        edge_type,
                        weight,
                    })
                    .await?;
                counts.2 += 1;
            }
        }
    }

    log::info!(
        "ingested {} chunks, {} nodes, {} edges into context {}",
        counts.0,
        counts.1,
        counts.2,
        context_id
    );
    Ok(())
}

/// Verify the database schema and pragmas.
async fn run_verify() -> Result<()> {
    log::info!("twinbrain v{}", env!("CARGO_PKG_VERSION"));
    let config = Config::load()?;
    log::info!("database path: {}", config.db_path().display());

    let db = open_database(&config).await?;
    db.with_connection(|conn| {
        let mut stmt =
            conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

        for table in ["chunks", "nodes", "edges", "schema_migrations"] {
            if !tables.iter().any(|t| t == table) {
                return Err(twinbrain::TwinError::Config(format!("missing table: {}", table)));
            }
            log::debug!("table exists: {}", table);
        }

        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        if journal_mode.to_uppercase() != "WAL" {
            return Err(twinbrain::TwinError::Config(format!(
                "journal mode is not WAL: {}",
                journal_mode
            )));
        }

        let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if integrity != "ok" {
            return Err(twinbrain::TwinError::Config(format!(
                "integrity check failed: {}",
                integrity
            )));
        }

        let applied = migrate::get_applied_migrations(conn)?;
        log::info!("{} migrations applied", applied.len());
        Ok(())
    })
    .await?;

    log::info!("schema verification complete");
    Ok(())
}
