//! Agent loop: a strictly alternating two-state machine driving the chat
//! model against the bound tools.
//!
//! `Agent` invokes the model with the full turn history; when the returned
//! turn carries pending tool calls the loop enters `Tools`, executes every
//! requested call, appends the tool turns and goes back to `Agent`. A model
//! turn without tool calls is terminal. There is no backtracking and no other
//! state; a configurable iteration ceiling bounds the loop.

pub mod confidence;
pub mod events;
pub mod tools;

pub use confidence::{assess, Confidence, ConfidenceResult, TurnTally, DEFAULT_ESCALATION_THRESHOLD};
pub use events::StreamEvent;
pub use tools::{parse_search_payload, ParseResult, SearchKnowledgeBase, Tool, SEARCH_TOOL_NAME};

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::Result;
use crate::evidence::{ChatModel, ChatTurn, Role, ToolCallRequest, ToolSpec};

/// Default hard ceiling on model turns per run. The model's own inclination
/// to stop calling tools usually terminates the loop well before this.
pub const DEFAULT_MAX_ITERATIONS: usize = 6;

/// Loop states. `Agent` calls the model; `Tools` executes its requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Agent,
    Tools,
}

/// Pure transition function over the most recent turn: pending tool calls on
/// an assistant turn continue the loop, anything else is terminal (`None`).
pub fn transition(latest: &ChatTurn) -> Option<LoopState> {
    if latest.role == Role::Assistant && latest.has_tool_calls() {
        Some(LoopState::Tools)
    } else {
        None
    }
}

/// One answering request. History and query are the caller's; the snapshot
/// context text (if any) is folded into the system prompt.
#[derive(Debug, Clone)]
pub struct AnswerRequest {
    pub conversation_id: String,
    pub query: String,
    pub history: Vec<ChatTurn>,
    /// Full replacement for the default system prompt.
    pub system_prompt: Option<String>,
    /// Prompt-ready graph context, appended to the system prompt.
    pub context_text: Option<String>,
}

impl AnswerRequest {
    pub fn new(conversation_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            query: query.into(),
            history: Vec::new(),
            system_prompt: None,
            context_text: None,
        }
    }
}

/// Outcome of one complete agent run.
#[derive(Debug, Clone)]
pub struct AgentRun {
    pub answer: String,
    /// Deduplicated source ids cited across all tool turns.
    pub citations: Vec<String>,
    pub confidence: Confidence,
    pub escalated: bool,
    pub turns: Vec<ChatTurn>,
}

/// Drives repeated model calls, dispatches tool invocations, accumulates
/// citations and confidence, and decides termination. All state is owned by
/// one invocation; nothing is shared across requests.
pub struct Orchestrator {
    model: Arc<dyn ChatModel>,
    tools: Vec<Arc<dyn Tool>>,
    max_iterations: usize,
    escalation_threshold: f32,
}

impl Orchestrator {
    pub fn new(model: Arc<dyn ChatModel>, tools: Vec<Arc<dyn Tool>>) -> Self {
        Self {
            model,
            tools,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            escalation_threshold: DEFAULT_ESCALATION_THRESHOLD,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_escalation_threshold(mut self, threshold: f32) -> Self {
        self.escalation_threshold = threshold;
        self
    }

    /// Run to completion and return the accumulated outcome.
    pub async fn run(&self, req: &AnswerRequest) -> Result<AgentRun> {
        self.run_inner(req, None).await
    }

    /// Run in a spawned task, streaming NDJSON events: one `metadata`, zero
    /// or more `content` deltas, one `done`. Dropping the receiver cancels
    /// the run at the next model-turn boundary; tool calls already in flight
    /// complete first, so the accumulator is never left half-updated. A fatal
    /// error closes the stream without a `done` event.
    pub fn run_stream(self: Arc<Self>, req: AnswerRequest) -> ReceiverStream<StreamEvent> {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let conversation_id = req.conversation_id.clone();
            match self.run_inner(&req, Some(&tx)).await {
                Ok(run) => {
                    let _ = tx
                        .send(StreamEvent::Metadata {
                            confidence_score: run.confidence.as_score(),
                            citations: run.citations.clone(),
                            conversation_id,
                        })
                        .await;
                    if !run.answer.is_empty() {
                        let _ = tx.send(StreamEvent::Content { content: run.answer.clone() }).await;
                    }
                    let _ = tx.send(StreamEvent::Done { escalated: run.escalated }).await;
                }
                Err(e) => {
                    log::error!("agent run for conversation {} failed: {}", conversation_id, e);
                }
            }
        });
        ReceiverStream::new(rx)
    }

    async fn run_inner(
        &self,
        req: &AnswerRequest,
        stream: Option<&mpsc::Sender<StreamEvent>>,
    ) -> Result<AgentRun> {
        let specs: Vec<ToolSpec> = self.tools.iter().map(|t| t.spec()).collect();

        let mut turns = vec![self.system_turn(req)];
        turns.extend(req.history.iter().cloned());
        turns.push(ChatTurn::user(req.query.clone()));

        let mut citations: BTreeSet<String> = BTreeSet::new();
        // Non-retrieval turns need no grounding, so the loop starts trusting.
        let mut confidence = Confidence::Score(1.0);
        let mut answer = String::new();

        for iteration in 0..self.max_iterations {
            if let Some(tx) = stream {
                if tx.is_closed() {
                    log::info!("caller disconnected; no further model turns");
                    break;
                }
            }

            let assistant = self.model.complete(&turns, &specs).await?;
            turns.push(assistant.clone());

            // Re-entering `Agent` is the loop itself; the only question per
            // turn is whether a tools step comes first.
            if transition(&assistant) != Some(LoopState::Tools) {
                answer = assistant.content;
                break;
            }

            let mut tally = TurnTally::default();
            for call in &assistant.tool_calls {
                let output = self.dispatch(call).await?;
                if call.name == SEARCH_TOOL_NAME {
                    match parse_search_payload(&output) {
                        ParseResult::Ok(chunks) => {
                            for chunk in &chunks {
                                citations.insert(chunk.source_id.clone());
                            }
                            tally.absorb(&chunks);
                        }
                        ParseResult::Malformed(raw) => {
                            log::warn!(
                                "malformed payload from {} ({} bytes), contributes nothing",
                                call.name,
                                raw.len()
                            );
                            tally.note_malformed();
                        }
                    }
                }
                turns.push(ChatTurn::tool(call.id.clone(), output));
            }
            // Replace, not average: the latest evidence pass wins.
            confidence = tally.confidence();

            if iteration + 1 == self.max_iterations {
                log::warn!(
                    "iteration ceiling ({}) reached before a terminal turn",
                    self.max_iterations
                );
            }
        }

        let result = assess(confidence, self.escalation_threshold);
        Ok(AgentRun {
            answer,
            citations: citations.into_iter().collect(),
            confidence,
            escalated: result.escalate,
            turns,
        })
    }

    async fn dispatch(&self, call: &ToolCallRequest) -> Result<String> {
        match self.tools.iter().find(|t| t.spec().name == call.name) {
            Some(tool) => tool.invoke(&call.arguments).await,
            None => {
                log::warn!("model requested unknown tool {:?}", call.name);
                Ok(format!("Error: unknown tool '{}'", call.name))
            }
        }
    }

    fn system_turn(&self, req: &AnswerRequest) -> ChatTurn {
        let mut prompt = req
            .system_prompt
            .clone()
            .unwrap_or_else(default_system_prompt);
        if let Some(context) = req.context_text.as_deref() {
            if !context.is_empty() {
                prompt.push_str("\n\n");
                prompt.push_str(context);
            }
        }
        ChatTurn::system(prompt)
    }
}

fn default_system_prompt() -> String {
    format!(
        "You are the owner's digital twin. Your primary intelligence comes from the \
         `{tool}` tool.\n\n\
         CRITICAL OPERATING PROCEDURES:\n\
         1. Factual questions: for ANY question about facts, opinions, history, or \
         documents, you MUST FIRST call `{tool}`.\n\
         2. Verified info: if a result carries \"is_verified\": true, this is the \
         owner's direct word. Use it exactly.\n\
         3. No data: if the tool returns no relevant information, explicitly state: \
         \"I don't have this specific information in my knowledge base.\" Do NOT make \
         things up.\n\
         4. Citations: always cite your sources using [Source ID] when using tool \
         results.\n\
         5. Personal identity: speak in the first person (\"I\", \"my\") as the owner, \
         grounded in the verified data.\n\
         6. Greetings: simple greetings may be answered briefly without searching; for \
         anything else, SEARCH.",
        tool = SEARCH_TOOL_NAME
    )
}
