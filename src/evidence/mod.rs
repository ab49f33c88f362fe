//! Contracts over the external collaborators that supply evidence and answers.
//!
//! Everything the core consumes from the outside world is behind one of these
//! traits: the vector index, the property graph, the reranker, the embedding
//! model and the chat model. Concrete implementations live in `store` (SQLite)
//! and `clients` (HTTP); tests substitute in-memory fakes. Components receive
//! their collaborators as explicit `Arc<dyn _>` constructor arguments, never
//! through globals.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::graph::{Edge, Node};

/// One filtered query against the vector index.
#[derive(Debug, Clone)]
pub struct VectorQuery {
    pub embedding: Vec<f32>,
    pub context_id: String,
    /// Restrict to owner-verified content (true) or inferred content (false).
    pub verified: bool,
    pub top_k: usize,
}

/// A single scored match from the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub score: f32,
    pub text: String,
    pub source_id: String,
    pub verified: bool,
}

/// One reranked document: its position in the input list plus the
/// cross-encoder relevance score.
#[derive(Debug, Clone, PartialEq)]
pub struct Reranked {
    pub index: usize,
    pub relevance_score: f32,
}

/// Embedding model contract. One text in, one vector out.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Vector index contract. Returns matches ordered by similarity, best first.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn query(&self, query: VectorQuery) -> Result<Vec<VectorMatch>>;
}

/// Cross-encoder reranker contract. Output is ordered by relevance, best
/// first, and refers back into `documents` by index.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, documents: &[String], top_n: usize) -> Result<Vec<Reranked>>;
}

/// Property graph contract. The store has no native filter by node set;
/// edge filtering against a chosen node set is this core's job.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Fetch up to `limit` nodes for a context, most recently updated first.
    async fn nodes(&self, context_id: &str, limit: usize) -> Result<Vec<Node>>;

    /// Fetch specific nodes by id. Unknown ids are silently absent.
    async fn nodes_by_ids(&self, context_id: &str, ids: &[String]) -> Result<Vec<Node>>;

    /// Fetch all edges for a context.
    async fn edges(&self, context_id: &str) -> Result<Vec<Edge>>;
}

/// Chat model contract: one completion round-trip over the full turn
/// history with the given tools bound. The returned turn may carry pending
/// tool calls; loop management is the orchestrator's responsibility.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, turns: &[ChatTurn], tools: &[ToolSpec]) -> Result<ChatTurn>;
}

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One message in the running conversation. The sequence of turns is the
/// agent loop's only mutable state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Set on `Role::Tool` turns: the id of the call this turn answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Whether this turn requests tool invocations that have not run yet.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Declaration of a callable tool, presented to the chat model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_serialization_is_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        assert_eq!(serde_json::to_string(&Role::Tool).unwrap(), "\"tool\"");
    }

    #[test]
    fn test_turn_constructors() {
        let turn = ChatTurn::user("hello");
        assert_eq!(turn.role, Role::User);
        assert_eq!(turn.content, "hello");
        assert!(!turn.has_tool_calls());

        let turn = ChatTurn::tool("call_1", "{}");
        assert_eq!(turn.role, Role::Tool);
        assert_eq!(turn.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_turn_with_tool_calls() {
        let mut turn = ChatTurn::assistant("");
        turn.tool_calls.push(ToolCallRequest {
            id: "call_1".to_string(),
            name: "search_knowledge_base".to_string(),
            arguments: json!({"query": "owner's favorite language"}),
        });
        assert!(turn.has_tool_calls());
    }

    #[test]
    fn test_turn_serialization_skips_empty_fields() {
        let json = serde_json::to_string(&ChatTurn::user("hi")).unwrap();
        assert!(!json.contains("tool_calls"));
        assert!(!json.contains("tool_call_id"));
    }
}
