//! Hybrid retrieval: owner-verified answers merged ahead of reranked
//! semantic matches.
//!
//! Verified content is owner-asserted truth and must never be outranked by a
//! better semantic match, so it is emitted first with its score forced to
//! 1.0. Unverified matches are optionally reranked by a cross-encoder; a
//! rerank failure degrades to the vector-similarity order instead of failing
//! the request.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TwinError};
use crate::evidence::{Embedder, Reranker, VectorMatch, VectorQuery, VectorStore};

/// Verified matches: few, high-precision, low threshold.
pub const VERIFIED_TOP_K: usize = 3;
pub const VERIFIED_MIN_SCORE: f32 = 0.25;
/// Unverified matches: over-fetched for rerank headroom.
pub const UNVERIFIED_FETCH_K: usize = 20;
pub const UNVERIFIED_MIN_SCORE: f32 = 0.30;

/// A scored snippet of retrieved text with provenance. Request-scoped and
/// immutable once built.
///
/// The serialized field names are the tool-payload wire contract consumed by
/// the agent loop's parser; they must stay stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub score: f32,
    pub source_id: String,
    pub is_verified: bool,
}

/// Queries the vector index for verified and unverified matches and merges
/// them verified-first.
pub struct HybridRetriever {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    reranker: Option<Arc<dyn Reranker>>,
}

impl HybridRetriever {
    pub fn new(embedder: Arc<dyn Embedder>, vectors: Arc<dyn VectorStore>) -> Self {
        Self {
            embedder,
            vectors,
            reranker: None,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Retrieve up to `top_k` chunks for `query` within one context.
    ///
    /// Fails with `TwinError::Retrieval` when the embedding call or either
    /// vector query fails: the caller must be told retrieval did not happen,
    /// never handed an empty result conflated with "nothing relevant". An
    /// empty result is valid when no match clears its threshold.
    pub async fn retrieve(&self, query: &str, context_id: &str, top_k: usize) -> Result<Vec<Chunk>> {
        let embedding = self
            .embedder
            .embed(query)
            .await
            .map_err(|e| TwinError::Retrieval(format!("query embedding failed: {}", e)))?;

        // The two filtered queries are independent; run them concurrently.
        let (verified, unverified) = tokio::join!(
            self.vectors.query(VectorQuery {
                embedding: embedding.clone(),
                context_id: context_id.to_string(),
                verified: true,
                top_k: VERIFIED_TOP_K,
            }),
            self.vectors.query(VectorQuery {
                embedding,
                context_id: context_id.to_string(),
                verified: false,
                top_k: UNVERIFIED_FETCH_K,
            }),
        );
        let verified = verified.map_err(|e| TwinError::Retrieval(format!("verified query failed: {}", e)))?;
        let unverified =
            unverified.map_err(|e| TwinError::Retrieval(format!("unverified query failed: {}", e)))?;

        // Owner-asserted truth overrides embedding similarity outright.
        let mut chunks: Vec<Chunk> = verified
            .into_iter()
            .filter(|m| m.score > VERIFIED_MIN_SCORE)
            .map(|m| Chunk {
                text: m.text,
                score: 1.0,
                source_id: m.source_id,
                is_verified: true,
            })
            .collect();

        let candidates: Vec<VectorMatch> = unverified
            .into_iter()
            .filter(|m| m.score > UNVERIFIED_MIN_SCORE)
            .collect();
        let ordered = self.rerank_or_fallback(query, candidates, top_k).await;

        chunks.extend(ordered.into_iter().map(|m| Chunk {
            text: m.text,
            score: m.score,
            source_id: m.source_id,
            is_verified: false,
        }));
        chunks.truncate(top_k);
        Ok(chunks)
    }

    /// Reorder unverified candidates with the cross-encoder when one is
    /// configured. Any rerank failure logs and falls back to vector order,
    /// truncated to `top_n`.
    async fn rerank_or_fallback(
        &self,
        query: &str,
        mut candidates: Vec<VectorMatch>,
        top_n: usize,
    ) -> Vec<VectorMatch> {
        let Some(reranker) = &self.reranker else {
            candidates.truncate(top_n);
            return candidates;
        };
        if candidates.is_empty() {
            return candidates;
        }

        let documents: Vec<String> = candidates.iter().map(|m| m.text.clone()).collect();
        match reranker.rerank(query, &documents, top_n).await {
            Ok(ranked) => {
                let mut slots: Vec<Option<VectorMatch>> = candidates.into_iter().map(Some).collect();
                ranked
                    .into_iter()
                    .filter_map(|r| slots.get_mut(r.index).and_then(Option::take))
                    .take(top_n)
                    .collect()
            }
            Err(e) => {
                log::warn!("rerank failed, falling back to vector order: {}", e);
                candidates.truncate(top_n);
                candidates
            }
        }
    }
}
