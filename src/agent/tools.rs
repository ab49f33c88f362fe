//! Tool surface exposed to the chat model, and the parser for the payloads
//! tools hand back.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Result, TwinError};
use crate::evidence::ToolSpec;
use crate::retrieval::{Chunk, HybridRetriever};

/// Name of the retrieval tool as the model sees it. The orchestrator keys
/// its payload parsing on this name.
pub const SEARCH_TOOL_NAME: &str = "search_knowledge_base";

/// A callable tool bound into the agent loop.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn invoke(&self, arguments: &Value) -> Result<String>;
}

/// Outcome of parsing a retrieval-tool payload. The payload contract is a
/// hard boundary: one JSON shape, no permissive second parse. Anything that
/// does not deserialize is `Malformed` and contributes nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseResult {
    Ok(Vec<Chunk>),
    Malformed(String),
}

/// Parse a `search_knowledge_base` payload against the `Chunk[]` contract.
pub fn parse_search_payload(raw: &str) -> ParseResult {
    match serde_json::from_str::<Vec<Chunk>>(raw) {
        Ok(chunks) => ParseResult::Ok(chunks),
        Err(_) => ParseResult::Malformed(raw.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
}

/// The retriever wrapped as a tool: the model's primary source of grounded
/// knowledge. Bound to one context for the lifetime of a request.
pub struct SearchKnowledgeBase {
    retriever: Arc<HybridRetriever>,
    context_id: String,
    top_k: usize,
}

impl SearchKnowledgeBase {
    pub fn new(retriever: Arc<HybridRetriever>, context_id: impl Into<String>, top_k: usize) -> Self {
        Self {
            retriever,
            context_id: context_id.into(),
            top_k,
        }
    }
}

#[async_trait]
impl Tool for SearchKnowledgeBase {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: SEARCH_TOOL_NAME.to_string(),
            description: "Searches the owner's knowledge base for information relevant to \
                          the query. Use this for any question about facts, opinions, \
                          history, or documents. Returns a JSON array of context snippets."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Search query text"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn invoke(&self, arguments: &Value) -> Result<String> {
        // Bad arguments come from the model, not the caller: report them in
        // the tool output so the model can correct itself on the next turn.
        let args: SearchArgs = match serde_json::from_value(arguments.clone()) {
            Ok(args) => args,
            Err(e) => {
                log::warn!("{} called with bad arguments: {}", SEARCH_TOOL_NAME, e);
                return Ok(format!("Error: invalid search arguments: {}", e));
            }
        };

        let chunks = self
            .retriever
            .retrieve(&args.query, &self.context_id, self.top_k)
            .await?;
        log::debug!(
            "search_knowledge_base returned {} chunks for {:?}",
            chunks.len(),
            args.query
        );

        serde_json::to_string(&chunks)
            .map_err(|e| TwinError::ToolParse(format!("failed to serialize chunks: {}", e)))
    }
}
