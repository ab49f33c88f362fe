pub mod agent;
pub mod cache;
pub mod clients;
pub mod config;
pub mod db;
pub mod error;
pub mod evidence;
pub mod graph;
pub mod retrieval;
pub mod store;

pub use agent::{AnswerRequest, Orchestrator, StreamEvent};
pub use config::Config;
pub use error::{Result, TwinError};
pub use graph::{Snapshot, SnapshotBuilder};
pub use retrieval::{Chunk, HybridRetriever};
