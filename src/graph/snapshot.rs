//! Seed selection, bounded hop expansion, ranking and text compression.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::evidence::GraphStore;
use crate::graph::{Edge, Node, Snapshot};

/// Caps for the graph snapshot.
pub const MAX_SEED_NODES: usize = 8;
pub const MAX_NODES: usize = 12;
pub const MAX_EDGES: usize = 24;

/// How many candidate nodes to fetch for seed scoring.
const SEED_CANDIDATE_LIMIT: usize = 100;
/// Query terms shorter than this are ignored.
const SEED_TERM_MIN_LEN: usize = 2;
/// Only the first few meaningful terms participate in scoring.
const SEED_TERMS: usize = 3;
const NAME_MATCH_WEIGHT: u32 = 3;
const DESCRIPTION_MATCH_WEIGHT: u32 = 1;
/// Second hop runs only when fewer seeds than this were found.
const TWO_HOP_SEED_THRESHOLD: usize = 3;
/// At most this many fresh neighbors anchor the second hop.
const TWO_HOP_FRONTIER: usize = 3;
const MAX_RENDERED_EDGES: usize = 10;
const MAX_RENDERED_PROPS: usize = 3;

/// Builds bounded, query-relevant snapshots of one context's fact graph.
///
/// `build` never fails outward: graph context is supplementary, so every
/// internal error is logged and degrades to an empty snapshot.
pub struct SnapshotBuilder {
    store: Arc<dyn GraphStore>,
    max_nodes: usize,
    max_edges: usize,
}

impl SnapshotBuilder {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            store,
            max_nodes: MAX_NODES,
            max_edges: MAX_EDGES,
        }
    }

    pub fn with_caps(mut self, max_nodes: usize, max_edges: usize) -> Self {
        self.max_nodes = max_nodes;
        self.max_edges = max_edges;
        self
    }

    /// Build a snapshot for `query` against one context.
    ///
    /// Algorithm:
    /// 1. Seed selection by keyword match on node name/description
    /// 2. Recency fallback when no node matches (no edges)
    /// 3. 1-hop expansion along context edges, under the node budget
    /// 4. Conditional 2-hop when seeds are sparse and budget remains
    /// 5. Edge filter to in-set endpoints, capped
    /// 6. Rank seeds first, then by recency; compress to prompt text
    pub async fn build(&self, context_id: &str, query: Option<&str>) -> Snapshot {
        match self.try_build(context_id, query).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::error!("graph snapshot failed for context {}: {}", context_id, e);
                Snapshot::empty(query)
            }
        }
    }

    async fn try_build(&self, context_id: &str, query: Option<&str>) -> Result<Snapshot> {
        let seeds = self.select_seeds(context_id, query).await?;

        if seeds.is_empty() {
            // No keyword anchor: fall back to the most recently updated
            // nodes, with no relationship context.
            let mut nodes = self.store.nodes(context_id, self.max_nodes).await?;
            rank_nodes(&mut nodes, &HashSet::new());
            nodes.truncate(self.max_nodes);
            return Ok(format_snapshot(nodes, Vec::new(), query));
        }

        let seed_ids: HashSet<String> = seeds.iter().map(|n| n.id.clone()).collect();
        let mut nodes = seeds;
        let mut in_set = seed_ids.clone();

        let all_edges = self.store.edges(context_id).await?;
        let (mut connected, neighbor_ids) = expand_one_hop(&all_edges, &in_set);

        let neighbors = self.store.nodes_by_ids(context_id, &neighbor_ids).await?;
        let mut added_neighbors: Vec<String> = Vec::new();
        for node in neighbors {
            if nodes.len() >= self.max_nodes {
                break;
            }
            if in_set.insert(node.id.clone()) {
                added_neighbors.push(node.id.clone());
                nodes.push(node);
            }
        }

        if seed_ids.len() < TWO_HOP_SEED_THRESHOLD && nodes.len() < self.max_nodes {
            let frontier: HashSet<String> = added_neighbors
                .iter()
                .take(TWO_HOP_FRONTIER)
                .cloned()
                .collect();
            if !frontier.is_empty() {
                let (hop2_edges, hop2_ids) = expand_one_hop(&all_edges, &frontier);
                let hop2_nodes = self.store.nodes_by_ids(context_id, &hop2_ids).await?;
                for node in hop2_nodes {
                    if nodes.len() >= self.max_nodes {
                        break;
                    }
                    if in_set.insert(node.id.clone()) {
                        nodes.push(node);
                    }
                }
                connected.extend(hop2_edges);
            }
        }

        rank_nodes(&mut nodes, &seed_ids);
        nodes.truncate(self.max_nodes);

        // Retain only edges whose both endpoints survived the cut. Expansion
        // passes may have collected the same edge twice, so dedupe by id.
        let final_ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        let mut seen = HashSet::new();
        let edges: Vec<Edge> = connected
            .into_iter()
            .filter(|e| {
                final_ids.contains(e.from_node_id.as_str())
                    && final_ids.contains(e.to_node_id.as_str())
            })
            .filter(|e| seen.insert(e.id.clone()))
            .take(self.max_edges)
            .collect();

        Ok(format_snapshot(nodes, edges, query))
    }

    /// Score candidate nodes by keyword matches and keep the best.
    async fn select_seeds(&self, context_id: &str, query: Option<&str>) -> Result<Vec<Node>> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = self.store.nodes(context_id, SEED_CANDIDATE_LIMIT).await?;
        let mut scored: Vec<(u32, Node)> = candidates
            .into_iter()
            .filter_map(|node| {
                let score = seed_score(&node, &terms);
                (score > 0).then_some((score, node))
            })
            .collect();

        // Stable sort: ties keep the store's recency order.
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored
            .into_iter()
            .take(MAX_SEED_NODES)
            .map(|(_, node)| node)
            .collect())
    }
}

/// First few meaningful terms of the query, lowercased.
fn query_terms(query: Option<&str>) -> Vec<String> {
    query
        .unwrap_or_default()
        .split_whitespace()
        .filter(|w| w.len() > SEED_TERM_MIN_LEN)
        .take(SEED_TERMS)
        .map(|w| w.to_lowercase())
        .collect()
}

/// Name matches count triple; description matches count single.
fn seed_score(node: &Node, terms: &[String]) -> u32 {
    let name = node.name.to_lowercase();
    let description = node.description.to_lowercase();
    let mut score = 0;
    for term in terms {
        if name.contains(term.as_str()) {
            score += NAME_MATCH_WEIGHT;
        }
        if description.contains(term.as_str()) {
            score += DESCRIPTION_MATCH_WEIGHT;
        }
    }
    score
}

/// Edges touching the frontier, plus the off-frontier endpoints they reach.
fn expand_one_hop(edges: &[Edge], frontier: &HashSet<String>) -> (Vec<Edge>, Vec<String>) {
    let mut connected = Vec::new();
    let mut neighbor_ids = Vec::new();
    let mut seen = HashSet::new();

    for edge in edges {
        let from_in = frontier.contains(&edge.from_node_id);
        let to_in = frontier.contains(&edge.to_node_id);
        if !from_in && !to_in {
            continue;
        }
        connected.push(edge.clone());

        let neighbor = if from_in && !to_in {
            Some(&edge.to_node_id)
        } else if to_in && !from_in {
            Some(&edge.from_node_id)
        } else {
            None
        };
        if let Some(id) = neighbor {
            if seen.insert(id.clone()) {
                neighbor_ids.push(id.clone());
            }
        }
    }

    (connected, neighbor_ids)
}

/// Seeds sort before non-seeds; within each group, most recently updated
/// first. Stable, so ties keep their discovery order.
fn rank_nodes(nodes: &mut [Node], seed_ids: &HashSet<String>) {
    nodes.sort_by(|a, b| {
        let a_seed = seed_ids.contains(&a.id);
        let b_seed = seed_ids.contains(&b.id);
        b_seed
            .cmp(&a_seed)
            .then_with(|| b.recency().cmp(a.recency()))
    });
}

/// Compress ranked nodes and edges into prompt-ready context text.
fn format_snapshot(nodes: Vec<Node>, edges: Vec<Edge>, query: Option<&str>) -> Snapshot {
    let node_lines: Vec<String> = nodes.iter().filter_map(render_node).collect();

    let mut context_text = String::new();
    if !node_lines.is_empty() {
        context_text.push_str("MEMORIZED KNOWLEDGE (High Priority - Answer from here if relevant):\n");
        context_text.push_str(&node_lines.join("\n"));

        let name_by_id: HashMap<&str, &str> = nodes
            .iter()
            .map(|n| (n.id.as_str(), n.name.as_str()))
            .collect();
        let edge_lines: Vec<String> = edges
            .iter()
            .take(MAX_RENDERED_EDGES)
            .map(|e| {
                let from = name_by_id.get(e.from_node_id.as_str()).copied().unwrap_or("Unknown");
                let to = name_by_id.get(e.to_node_id.as_str()).copied().unwrap_or("Unknown");
                format!("  {} → {} → {}", from, e.edge_type, to)
            })
            .collect();
        if !edge_lines.is_empty() {
            context_text.push_str("\n\nKNOWN RELATIONSHIPS:\n");
            context_text.push_str(&edge_lines.join("\n"));
        }
    }

    Snapshot {
        nodes,
        edges,
        context_text,
        query: query.map(String::from),
    }
}

/// Render one node line, or None when it lacks a name or description.
/// Unrenderable nodes still count structurally.
fn render_node(node: &Node) -> Option<String> {
    if node.name.is_empty() || node.description.is_empty() {
        return None;
    }

    let props: Vec<String> = node
        .properties
        .iter()
        .filter(|(_, v)| v.is_string() || v.is_number() || v.is_boolean())
        .take(MAX_RENDERED_PROPS)
        .map(|(k, v)| match v {
            Value::String(s) => format!("{}: {}", k, s),
            other => format!("{}: {}", k, other),
        })
        .collect();
    let props_str = if props.is_empty() {
        String::new()
    } else {
        format!(" [{}]", props.join(", "))
    };

    Some(format!(
        "- {} ({}): {}{}",
        node.name, node.node_type, node.description, props_str
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TwinError;
    use async_trait::async_trait;
    use serde_json::json;

    struct MockGraph {
        nodes: Vec<Node>,
        edges: Vec<Edge>,
    }

    #[async_trait]
    impl GraphStore for MockGraph {
        async fn nodes(&self, _context_id: &str, limit: usize) -> Result<Vec<Node>> {
            Ok(self.nodes.iter().take(limit).cloned().collect())
        }

        async fn nodes_by_ids(&self, _context_id: &str, ids: &[String]) -> Result<Vec<Node>> {
            Ok(self
                .nodes
                .iter()
                .filter(|n| ids.contains(&n.id))
                .cloned()
                .collect())
        }

        async fn edges(&self, _context_id: &str) -> Result<Vec<Edge>> {
            Ok(self.edges.clone())
        }
    }

    struct FailingGraph;

    #[async_trait]
    impl GraphStore for FailingGraph {
        async fn nodes(&self, _context_id: &str, _limit: usize) -> Result<Vec<Node>> {
            Err(TwinError::Graph("connection refused".to_string()))
        }

        async fn nodes_by_ids(&self, _context_id: &str, _ids: &[String]) -> Result<Vec<Node>> {
            Err(TwinError::Graph("connection refused".to_string()))
        }

        async fn edges(&self, _context_id: &str) -> Result<Vec<Edge>> {
            Err(TwinError::Graph("connection refused".to_string()))
        }
    }

    fn node(id: &str, name: &str, description: &str, updated_at: &str) -> Node {
        Node {
            id: id.to_string(),
            name: name.to_string(),
            node_type: "fact".to_string(),
            description: description.to_string(),
            properties: serde_json::Map::new(),
            updated_at: Some(updated_at.to_string()),
            created_at: None,
        }
    }

    fn edge(id: &str, from: &str, to: &str) -> Edge {
        Edge {
            id: id.to_string(),
            from_node_id: from.to_string(),
            to_node_id: to.to_string(),
            edge_type: "RELATED_TO".to_string(),
            weight: None,
        }
    }

    fn builder(store: MockGraph) -> SnapshotBuilder {
        SnapshotBuilder::new(Arc::new(store))
    }

    #[tokio::test]
    async fn test_seed_selection_by_keyword() {
        let store = MockGraph {
            nodes: vec![
                node("n1", "Python", "Favorite programming language", "2024-01-01T00:00:00Z"),
                node("n2", "AI", "Interest in AI", "2024-01-02T00:00:00Z"),
            ],
            edges: vec![],
        };
        let snapshot = builder(store)
            .build("ctx", Some("python programming language"))
            .await;

        let names: Vec<&str> = snapshot.nodes.iter().map(|n| n.name.as_str()).collect();
        assert!(names.contains(&"Python"));
        assert!(!names.contains(&"AI"));
    }

    #[tokio::test]
    async fn test_no_keyword_match_falls_back_to_recency() {
        let store = MockGraph {
            nodes: vec![
                node("n1", "Coffee", "Drinks espresso daily", "2024-01-01T00:00:00Z"),
                node("n2", "Cycling", "Rides on weekends", "2024-03-01T00:00:00Z"),
            ],
            edges: vec![edge("e1", "n1", "n2")],
        };
        let snapshot = builder(store).build("ctx", Some("quantum entanglement")).await;

        // Fallback: recency-ordered nodes, no edges.
        assert_eq!(snapshot.node_count(), 2);
        assert_eq!(snapshot.nodes[0].name, "Cycling");
        assert_eq!(snapshot.edge_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_query_falls_back() {
        let store = MockGraph {
            nodes: vec![node("n1", "Coffee", "Drinks espresso", "2024-01-01T00:00:00Z")],
            edges: vec![],
        };
        let snapshot = builder(store).build("ctx", None).await;
        assert_eq!(snapshot.node_count(), 1);
        assert_eq!(snapshot.edge_count(), 0);
    }

    #[tokio::test]
    async fn test_one_hop_expansion_pulls_neighbors() {
        let store = MockGraph {
            nodes: vec![
                node("n1", "Python", "Programming language", "2024-01-01T00:00:00Z"),
                node("n2", "Django", "Web framework", "2024-01-02T00:00:00Z"),
                node("n3", "Espresso", "Morning drink", "2024-01-03T00:00:00Z"),
            ],
            edges: vec![edge("e1", "n1", "n2")],
        };
        let snapshot = builder(store).build("ctx", Some("python python python")).await;

        let ids: Vec<&str> = snapshot.nodes.iter().map(|n| n.id.as_str()).collect();
        assert!(ids.contains(&"n1"));
        assert!(ids.contains(&"n2")); // 1-hop neighbor
        assert!(!ids.contains(&"n3")); // unconnected
        assert_eq!(snapshot.edge_count(), 1);
    }

    #[tokio::test]
    async fn test_two_hop_only_for_sparse_seeds() {
        // One seed (n1) -> n2 -> n3 chain: n3 reachable only via second hop.
        let store = MockGraph {
            nodes: vec![
                node("n1", "Python", "Programming language", "2024-01-01T00:00:00Z"),
                node("n2", "Django", "Web framework", "2024-01-02T00:00:00Z"),
                node("n3", "Postgres", "Database behind the site", "2024-01-03T00:00:00Z"),
            ],
            edges: vec![edge("e1", "n1", "n2"), edge("e2", "n2", "n3")],
        };
        let snapshot = builder(store).build("ctx", Some("python")).await;

        let ids: Vec<&str> = snapshot.nodes.iter().map(|n| n.id.as_str()).collect();
        assert!(ids.contains(&"n3"), "2-hop neighbor should be included for a single seed");
    }

    #[tokio::test]
    async fn test_no_two_hop_when_seeds_plentiful() {
        // Three seeds suppress the second hop; n5 is two hops from any seed.
        let store = MockGraph {
            nodes: vec![
                node("s1", "Python", "language", "2024-01-01T00:00:00Z"),
                node("s2", "Python tooling", "stack", "2024-01-02T00:00:00Z"),
                node("s3", "Python hosting", "deploys", "2024-01-03T00:00:00Z"),
                node("n4", "Django", "framework", "2024-01-04T00:00:00Z"),
                node("n5", "Postgres", "database", "2024-01-05T00:00:00Z"),
            ],
            edges: vec![edge("e1", "s1", "n4"), edge("e2", "n4", "n5")],
        };
        let snapshot = builder(store).build("ctx", Some("python")).await;

        let ids: Vec<&str> = snapshot.nodes.iter().map(|n| n.id.as_str()).collect();
        assert!(ids.contains(&"n4"));
        assert!(!ids.contains(&"n5"), "2-hop must not run with 3 or more seeds");
    }

    #[tokio::test]
    async fn test_caps_respected() {
        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        for i in 0..40 {
            nodes.push(node(
                &format!("n{}", i),
                &format!("Python topic {}", i),
                "entry",
                "2024-01-01T00:00:00Z",
            ));
        }
        for i in 1..40 {
            edges.push(edge(&format!("e{}", i), "n0", &format!("n{}", i)));
        }
        let store = MockGraph { nodes, edges };
        let snapshot = builder(store).with_caps(5, 4).build("ctx", Some("python")).await;

        assert!(snapshot.node_count() <= 5);
        assert!(snapshot.edge_count() <= 4);
    }

    #[tokio::test]
    async fn test_edges_reference_snapshot_nodes_only() {
        let store = MockGraph {
            nodes: vec![
                node("n1", "Python", "language", "2024-01-01T00:00:00Z"),
                node("n2", "Django", "framework", "2024-01-02T00:00:00Z"),
            ],
            // e2 dangles: n9 does not exist in the store.
            edges: vec![edge("e1", "n1", "n2"), edge("e2", "n1", "n9")],
        };
        let snapshot = builder(store).build("ctx", Some("python")).await;

        let ids: HashSet<&str> = snapshot.nodes.iter().map(|n| n.id.as_str()).collect();
        for e in &snapshot.edges {
            assert!(ids.contains(e.from_node_id.as_str()));
            assert!(ids.contains(e.to_node_id.as_str()));
        }
        assert!(snapshot.edges.iter().all(|e| e.id != "e2"));
    }

    #[tokio::test]
    async fn test_store_failure_degrades_to_empty() {
        let builder = SnapshotBuilder::new(Arc::new(FailingGraph));
        let snapshot = builder.build("ctx", Some("python")).await;
        assert_eq!(snapshot.node_count(), 0);
        assert_eq!(snapshot.edge_count(), 0);
        assert!(snapshot.context_text.is_empty());
    }

    #[tokio::test]
    async fn test_unrenderable_nodes_counted_but_not_rendered() {
        // Node matches the query but has no description: it stays in the
        // snapshot structurally while the rendered text stays empty.
        let store = MockGraph {
            nodes: vec![node("n1", "Python", "", "2024-01-01T00:00:00Z")],
            edges: vec![],
        };
        let snapshot = builder(store).build("ctx", Some("python")).await;
        assert_eq!(snapshot.node_count(), 1);
        assert!(snapshot.context_text.is_empty());
    }

    #[tokio::test]
    async fn test_context_text_renders_props_and_edges() {
        let mut n1 = node("n1", "Python", "Favorite language", "2024-01-02T00:00:00Z");
        n1.properties.insert("since".to_string(), json!(2015));
        n1.properties.insert("level".to_string(), json!("expert"));
        n1.properties.insert("nested".to_string(), json!({"ignored": true}));
        let n2 = node("n2", "Django", "Preferred framework", "2024-01-01T00:00:00Z");
        let store = MockGraph {
            nodes: vec![n1, n2],
            edges: vec![edge("e1", "n1", "n2")],
        };
        let snapshot = builder(store).build("ctx", Some("python")).await;

        assert!(snapshot.context_text.contains("- Python (fact): Favorite language ["));
        assert!(snapshot.context_text.contains("level: expert"));
        assert!(!snapshot.context_text.contains("nested"));
        assert!(snapshot.context_text.contains("Python → RELATED_TO → Django"));
    }

    #[test]
    fn test_query_terms_filters_short_words() {
        let terms = query_terms(Some("is my cat a python expert today"));
        // "is", "my", "a" are dropped; only the first 3 survivors kept.
        assert_eq!(terms, vec!["cat", "python", "expert"]);
    }

    #[test]
    fn test_seed_score_weights() {
        let n = node("n1", "Python", "Favorite programming language", "2024-01-01T00:00:00Z");
        let terms = vec![
            "python".to_string(),
            "programming".to_string(),
            "language".to_string(),
        ];
        // name hit (3) + two description hits (1 + 1)
        assert_eq!(seed_score(&n, &terms), 5);
    }
}
