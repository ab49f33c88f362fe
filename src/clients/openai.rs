//! OpenAI-compatible embedding and chat clients.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::EmbeddingCache;
use crate::error::{Result, TwinError};
use crate::evidence::{ChatModel, ChatTurn, Embedder, Role, ToolCallRequest, ToolSpec};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_EMBED_BATCH: usize = 2048;

fn http_client() -> Client {
    // Builder only fails on malformed TLS config, which we never set.
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_default()
}

#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Embedding client with an optional query cache and retry on transient
/// upstream failures.
pub struct OpenAiEmbedder {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    batch_size: usize,
    max_retries: usize,
    cache: Option<Arc<EmbeddingCache>>,
}

impl OpenAiEmbedder {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            batch_size: 100,
            max_retries: 3,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<EmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_EMBED_BATCH);
        self
    }

    /// Embed many texts in API-sized batches, preserving input order.
    pub async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            all.extend(self.request_embeddings(batch.to_vec()).await?);
            // Brief pause between full batches to stay under rate limits.
            if batch.len() == self.batch_size {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        Ok(all)
    }

    async fn request_embeddings(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let request = EmbeddingRequest {
            model: self.model.clone(),
            input: texts,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| TwinError::Embedding(format!("network error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unreadable error body".to_string());
            return Err(TwinError::Embedding(format!(
                "embeddings API error {}: {}",
                status, body
            )));
        }

        let result: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| TwinError::Embedding(format!("malformed embeddings response: {}", e)))?;
        Ok(result.data.into_iter().map(|d| d.embedding).collect())
    }

    async fn embed_with_retry(&self, text: &str) -> Result<Vec<f32>> {
        let mut attempt = 0;
        let mut delay = Duration::from_secs(1);
        loop {
            match self.request_embeddings(vec![text.to_string()]).await {
                Ok(mut embeddings) => {
                    if embeddings.is_empty() {
                        return Err(TwinError::Embedding("empty embeddings response".to_string()));
                    }
                    return Ok(embeddings.remove(0));
                }
                Err(e) if attempt < self.max_retries && is_transient(&e) => {
                    log::warn!("embedding retry {}/{} after: {}", attempt + 1, self.max_retries, e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_transient(e: &TwinError) -> bool {
    let text = e.to_string();
    ["429", "500", "502", "503", "504"].iter().any(|code| text.contains(code))
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(text) {
                log::debug!("embedding cache hit");
                return Ok(cached);
            }
        }
        let embedding = self.embed_with_retry(text).await?;
        if let Some(cache) = &self.cache {
            cache.put(text.to_string(), embedding.clone());
        }
        Ok(embedding)
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    temperature: f32,
}

#[derive(Serialize)]
struct WireMessage {
    role: Role,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: WireFunctionCall,
}

#[derive(Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    /// JSON-encoded string per the wire format, not a nested object.
    arguments: String,
}

#[derive(Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: WireFunction,
}

#[derive(Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: WireResponseMessage,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

/// Chat-completions client with function calling.
pub struct OpenAiChat {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl OpenAiChat {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.2,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

fn to_wire_message(turn: &ChatTurn) -> WireMessage {
    WireMessage {
        role: turn.role,
        content: turn.content.clone(),
        tool_calls: turn
            .tool_calls
            .iter()
            .map(|call| WireToolCall {
                id: call.id.clone(),
                call_type: "function".to_string(),
                function: WireFunctionCall {
                    name: call.name.clone(),
                    arguments: call.arguments.to_string(),
                },
            })
            .collect(),
        tool_call_id: turn.tool_call_id.clone(),
    }
}

fn from_wire_call(call: WireToolCall) -> ToolCallRequest {
    // Arguments arrive as a JSON-encoded string. Keep malformed arguments as
    // null rather than dropping the call; the tool reports the bad input.
    let arguments = serde_json::from_str(&call.function.arguments).unwrap_or_else(|e| {
        log::warn!("unparseable arguments for tool {}: {}", call.function.name, e);
        Value::Null
    });
    ToolCallRequest {
        id: call.id,
        name: call.function.name,
        arguments,
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    async fn complete(&self, turns: &[ChatTurn], tools: &[ToolSpec]) -> Result<ChatTurn> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: turns.iter().map(to_wire_message).collect(),
            tools: tools
                .iter()
                .map(|spec| WireTool {
                    tool_type: "function".to_string(),
                    function: WireFunction {
                        name: spec.name.clone(),
                        description: spec.description.clone(),
                        parameters: spec.parameters.clone(),
                    },
                })
                .collect(),
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| TwinError::Llm(format!("network error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unreadable error body".to_string());
            return Err(TwinError::Llm(format!("chat API error {}: {}", status, body)));
        }

        let mut result: ChatResponse = response
            .json()
            .await
            .map_err(|e| TwinError::Llm(format!("malformed chat response: {}", e)))?;
        if result.choices.is_empty() {
            return Err(TwinError::Llm("chat response has no choices".to_string()));
        }
        let message = result.choices.remove(0).message;

        let mut turn = ChatTurn::assistant(message.content.unwrap_or_default());
        turn.tool_calls = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(from_wire_call)
            .collect();
        Ok(turn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_message_shapes() {
        let json = serde_json::to_value(to_wire_message(&ChatTurn::user("hi"))).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hi");
        assert!(json.get("tool_calls").is_none());

        let json = serde_json::to_value(to_wire_message(&ChatTurn::tool("call_1", "{}"))).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call_1");
    }

    #[test]
    fn test_assistant_tool_call_roundtrips_arguments() {
        let mut turn = ChatTurn::assistant("");
        turn.tool_calls.push(ToolCallRequest {
            id: "call_1".to_string(),
            name: "search_knowledge_base".to_string(),
            arguments: json!({"query": "favorite language"}),
        });
        let wire = to_wire_message(&turn);
        assert_eq!(wire.tool_calls[0].function.arguments, r#"{"query":"favorite language"}"#);
    }

    #[test]
    fn test_malformed_wire_arguments_degrade_to_null() {
        let call = WireToolCall {
            id: "call_1".to_string(),
            call_type: "function".to_string(),
            function: WireFunctionCall {
                name: "search_knowledge_base".to_string(),
                arguments: "{not json".to_string(),
            },
        };
        let parsed = from_wire_call(call);
        assert_eq!(parsed.arguments, Value::Null);
        assert_eq!(parsed.name, "search_knowledge_base");
    }

    #[test]
    fn test_batch_size_clamped() {
        let embedder = OpenAiEmbedder::new("http://localhost", "k", "m").with_batch_size(5000);
        assert_eq!(embedder.batch_size, MAX_EMBED_BATCH);
    }

    #[test]
    fn test_transient_error_detection() {
        assert!(is_transient(&TwinError::Embedding("API error 429: slow down".to_string())));
        assert!(is_transient(&TwinError::Embedding("API error 503: busy".to_string())));
        assert!(!is_transient(&TwinError::Embedding("API error 401: bad key".to_string())));
    }
}
