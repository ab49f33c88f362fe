//! Cross-encoder rerank client (Cohere-compatible `/rerank` endpoint).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TwinError};
use crate::evidence::{Reranked, Reranker};

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    top_n: usize,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f32,
}

pub struct HttpReranker {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpReranker {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, documents: &[String], top_n: usize) -> Result<Vec<Reranked>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let request = RerankRequest {
            model: &self.model,
            query,
            documents,
            top_n,
        };

        let response = self
            .client
            .post(format!("{}/rerank", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| TwinError::Rerank(format!("network error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unreadable error body".to_string());
            return Err(TwinError::Rerank(format!("rerank API error {}: {}", status, body)));
        }

        let result: RerankResponse = response
            .json()
            .await
            .map_err(|e| TwinError::Rerank(format!("malformed rerank response: {}", e)))?;

        Ok(result
            .results
            .into_iter()
            .map(|r| Reranked {
                index: r.index,
                relevance_score: r.relevance_score,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let documents = vec!["doc a".to_string(), "doc b".to_string()];
        let request = RerankRequest {
            model: "rerank-v3",
            query: "q",
            documents: &documents,
            top_n: 5,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "rerank-v3");
        assert_eq!(json["documents"][1], "doc b");
        assert_eq!(json["top_n"], 5);
    }

    #[test]
    fn test_response_parsing() {
        let raw = r#"{"results":[{"index":2,"relevance_score":0.91},{"index":0,"relevance_score":0.4}]}"#;
        let parsed: RerankResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.results.len(), 2);
        assert_eq!(parsed.results[0].index, 2);
    }
}
