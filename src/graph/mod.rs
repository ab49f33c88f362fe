//! Graph context module: bounded, query-relevant snapshots of the fact graph.
//!
//! Selects seed nodes by keyword relevance, expands one (conditionally two)
//! hops along edges, ranks and caps the result, and compresses it into
//! prompt-ready text. Graph context is supplementary: every failure here
//! degrades to an empty snapshot instead of failing the request.

mod snapshot;

pub use snapshot::{SnapshotBuilder, MAX_EDGES, MAX_NODES, MAX_SEED_NODES};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A node in the property graph. Read-only to this core; owned by the
/// graph store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub description: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// RFC 3339 timestamps; lexicographic order is chronological order.
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl Node {
    /// Recency key used for ranking: `updated_at`, falling back to
    /// `created_at`, falling back to the empty string (sorts last).
    pub fn recency(&self) -> &str {
        self.updated_at
            .as_deref()
            .or(self.created_at.as_deref())
            .unwrap_or("")
    }
}

/// A directed, typed edge between two nodes. Referential integrity is the
/// store's concern; this core drops edges with dangling endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub from_node_id: String,
    pub to_node_id: String,
    #[serde(rename = "type")]
    pub edge_type: String,
    #[serde(default)]
    pub weight: Option<f32>,
}

/// Bounded subgraph assembled for one query. Immutable after construction.
///
/// Invariants: `nodes.len() <= max_nodes`, `edges.len() <= max_edges`, and
/// every edge references two nodes present in `nodes`. `context_text` may be
/// empty even when `nodes` is not: structural counts and renderable text are
/// independent (nodes missing a name or description are kept structurally but
/// never rendered).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub context_text: String,
    pub query: Option<String>,
}

impl Snapshot {
    pub fn empty(query: Option<&str>) -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            context_text: String::new(),
            query: query.map(String::from),
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}
