//! HTTP clients for the model-side collaborators: embeddings, chat
//! completions and reranking. All speak OpenAI-compatible JSON APIs.

mod openai;
mod rerank;

pub use openai::{OpenAiChat, OpenAiEmbedder};
pub use rerank::HttpReranker;
