use thiserror::Error;

/// Main error type for twinbrain.
///
/// Fatality is decided by the component, not the variant: `Retrieval` and
/// `Llm` abort a run, while graph, rerank and tool-parse failures are
/// recovered locally by the component that observed them.
#[derive(Error, Debug)]
pub enum TwinError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Embedding API errors
    #[error("Embedding API error: {0}")]
    Embedding(String),

    /// Mandatory retrieval path failed (embedding or vector store)
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    /// Graph store errors (non-fatal; snapshot builder degrades to empty)
    #[error("Graph store error: {0}")]
    Graph(String),

    /// Reranker errors (non-fatal; retriever falls back to vector order)
    #[error("Rerank error: {0}")]
    Rerank(String),

    /// Chat model call failed
    #[error("LLM call error: {0}")]
    Llm(String),

    /// Tool output did not match the serialization contract
    #[error("Tool output parse error: {0}")]
    ToolParse(String),
}

/// Convenient Result type using TwinError
pub type Result<T> = std::result::Result<T, TwinError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TwinError::Retrieval("embedding call failed".to_string());
        assert!(err.to_string().contains("Retrieval error"));
        assert!(err.to_string().contains("embedding call failed"));
    }

    #[test]
    fn test_error_from_rusqlite() {
        let rusqlite_err = rusqlite::Error::InvalidQuery;
        let err: TwinError = rusqlite_err.into();
        assert!(matches!(err, TwinError::Database(_)));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TwinError = io_err.into();
        assert!(matches!(err, TwinError::Io(_)));
    }
}
