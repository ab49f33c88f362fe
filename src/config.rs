use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::agent::{DEFAULT_ESCALATION_THRESHOLD, DEFAULT_MAX_ITERATIONS};
use crate::graph::{MAX_EDGES, MAX_NODES};

/// Main configuration structure, loaded from `config.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub twinbrain: TwinbrainConfig,
    pub llm: LlmConfig,
    pub embeddings: EmbeddingsConfig,
    #[serde(default)]
    pub rerank: Option<RerankConfig>,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TwinbrainConfig {
    pub db_path: PathBuf,
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_openai_base")]
    pub base_url: String,
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingsConfig {
    #[serde(default = "default_openai_base")]
    pub base_url: String,
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

/// Optional cross-encoder reranking. Absent section means rerank disabled.
#[derive(Debug, Clone, Deserialize)]
pub struct RerankConfig {
    pub base_url: String,
    pub model: String,
    pub api_key_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { top_k: default_top_k() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,
    #[serde(default = "default_max_edges")]
    pub max_edges: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_nodes: default_max_nodes(),
            max_edges: default_max_edges(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: f32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            escalation_threshold: default_escalation_threshold(),
        }
    }
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_openai_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_batch_size() -> usize {
    100
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_top_k() -> usize {
    5
}

fn default_max_nodes() -> usize {
    MAX_NODES
}

fn default_max_edges() -> usize {
    MAX_EDGES
}

fn default_max_iterations() -> usize {
    DEFAULT_MAX_ITERATIONS
}

fn default_escalation_threshold() -> f32 {
    DEFAULT_ESCALATION_THRESHOLD
}

impl Config {
    /// Load configuration. `.env` is read first if present; the config file
    /// comes from `TWINBRAIN_CONFIG` or `./config.toml`.
    pub fn load() -> Result<Self> {
        let _ = dotenv::dotenv();

        let config_path = std::env::var("TWINBRAIN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config file: {}", config_path.display()))?;

        let config: Config = toml::from_str(&config_str).context("failed to parse config.toml")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        std::env::var(&self.llm.api_key_env).with_context(|| {
            format!(
                "environment variable {} not set; put it in .env or the environment",
                self.llm.api_key_env
            )
        })?;

        if let Some(rerank) = &self.rerank {
            std::env::var(&rerank.api_key_env).with_context(|| {
                format!("environment variable {} not set for [rerank]", rerank.api_key_env)
            })?;
        }

        if self.retrieval.top_k == 0 {
            anyhow::bail!("retrieval.top_k must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.agent.escalation_threshold) {
            anyhow::bail!("agent.escalation_threshold must be between 0.0 and 1.0");
        }
        if self.agent.max_iterations == 0 {
            anyhow::bail!("agent.max_iterations must be greater than 0");
        }
        if self.graph.max_nodes == 0 {
            anyhow::bail!("graph.max_nodes must be greater than 0");
        }
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.twinbrain.db_path
    }

    pub fn llm_api_key(&self) -> Result<String> {
        std::env::var(&self.llm.api_key_env)
            .with_context(|| format!("environment variable {} not set", self.llm.api_key_env))
    }

    pub fn embeddings_api_key(&self) -> Result<String> {
        std::env::var(&self.embeddings.api_key_env).with_context(|| {
            format!("environment variable {} not set", self.embeddings.api_key_env)
        })
    }
}
