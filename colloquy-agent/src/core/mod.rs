use std::sync::Arc;
use thiserror::Error;
use tracing::{Instrument, Span, debug, info_span};

use crate::clients::{LLMError, Message, MessageRole, SharedClient};
use crate::config::AgentConfig;
use crate::memory::{
    CompressionError, CompressionResult, CompressionState, CompressionTrigger, ContextCompressor,
    ConversationHistory,
};
use crate::prompts::build_rag_context_prompt;
use crate::rag::{SearchResult, StoreError, VectorStore, format_context};
use crate::tools::{ConfirmationCallback, ToolCallLoop, ToolExecutor, ToolLoopError, ToolLoopOutcome};

pub mod stream;
pub mod telemetry;

pub use stream::{
    CallbackError, ChunkKind, END_OF_REASONING, GenerationChunk, GenerationResult,
    GenerationStream, StopHandle, StreamingEngine,
};
pub use telemetry::{
    RequestMetadata, ResponseMetadata, SharedTelemetryCallback, Telemetry, TelemetryCallback,
};

#[derive(Debug, Error)]
pub enum AgentError {
    /// Stopped through a `StopHandle`. `partial` holds the text delivered so far.
    #[error("Generation cancelled")]
    Cancelled { partial: String },
    #[error("LLM error: {0}")]
    Llm(#[from] LLMError),
    #[error("Callback error: {0}")]
    Callback(#[from] CallbackError),
    #[error("Compression error: {0}")]
    Compression(#[from] CompressionError),
    #[error("Vector store error: {0}")]
    Store(#[from] StoreError),
    #[error("Tool loop error: {0}")]
    ToolLoop(#[from] ToolLoopError),
    #[error("No {0} configured for this session")]
    NotConfigured(&'static str),
}

impl AgentError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            AgentError::Cancelled { .. } => true,
            AgentError::ToolLoop(e) => e.is_cancelled(),
            _ => false,
        }
    }

    pub fn is_context_exceeded(&self) -> bool {
        matches!(self, AgentError::Llm(e) if e.is_context_exceeded())
    }
}

/// One conversation: history, streaming generation, optional compression,
/// retrieval and tool calling.
pub struct ConversationSession {
    config: AgentConfig,
    client: SharedClient,
    engine: StreamingEngine,
    history: ConversationHistory,
    compression: Option<CompressionTrigger>,
    store: Option<VectorStore>,
    confirmation: Option<ConfirmationCallback>,
    telemetry_callback: Option<SharedTelemetryCallback>,
    span: Span,
}

impl ConversationSession {
    /// Builds a session from `config`. A compressor is attached when
    /// `compressor_model` is set; it shares `client`.
    pub fn new(config: AgentConfig, client: SharedClient) -> Self {
        let history = ConversationHistory::new(
            Some(config.system_instructions.clone()),
            config.keep_history,
        );
        let engine = StreamingEngine::new(Arc::clone(&client), config.chat_params());
        let span = info_span!("session", name = %config.session_name);

        let mut session = Self {
            config,
            client,
            engine,
            history,
            compression: None,
            store: None,
            confirmation: None,
            telemetry_callback: None,
            span,
        };
        if let Some(model) = session.config.compressor_model.clone() {
            let compressor = ContextCompressor::new(Arc::clone(&session.client), model)
                .with_prompt(session.config.compression_prompt);
            session = session.with_compressor(compressor);
        }
        session
    }

    pub fn with_compressor(mut self, compressor: ContextCompressor) -> Self {
        if let Some(callback) = &self.telemetry_callback {
            compressor.telemetry().set_callback(Arc::clone(callback));
        }
        let mut trigger =
            CompressionTrigger::new(Arc::new(compressor), self.config.compression_threshold);
        if self.config.preserve_system_instructions {
            trigger = trigger.preserve_system_instructions(self.config.system_instructions.clone());
        }
        self.compression = Some(trigger);
        self
    }

    pub fn with_vector_store(mut self, store: VectorStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_confirmation(mut self, confirmation: ConfirmationCallback) -> Self {
        self.confirmation = Some(confirmation);
        self
    }

    pub fn with_telemetry_callback(mut self, callback: SharedTelemetryCallback) -> Self {
        self.set_telemetry_callback(callback);
        self
    }

    /// Sends the telemetry of the chat model and of the compressor to
    /// `callback`.
    pub fn set_telemetry_callback(&mut self, callback: SharedTelemetryCallback) {
        self.engine.telemetry().set_callback(Arc::clone(&callback));
        if let Some(trigger) = &self.compression {
            trigger.compressor().telemetry().set_callback(Arc::clone(&callback));
        }
        self.telemetry_callback = Some(callback);
    }

    /// Telemetry of the chat model, tool rounds included.
    pub fn telemetry(&self) -> &Telemetry {
        self.engine.telemetry()
    }

    pub fn compressor_telemetry(&self) -> Option<&Telemetry> {
        self.compression.as_ref().map(|t| t.compressor().telemetry())
    }

    /// Tokens used by the chat model and the compressor together.
    pub fn total_tokens_used(&self) -> u64 {
        self.telemetry().total_tokens_used()
            + self.compressor_telemetry().map_or(0, |t| t.total_tokens_used())
    }

    pub fn reset_telemetry(&self) {
        self.telemetry().reset();
        if let Some(telemetry) = self.compressor_telemetry() {
            telemetry.reset();
        }
    }

    pub fn name(&self) -> &str {
        &self.config.session_name
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn messages(&self) -> &[Message] {
        self.history.all()
    }

    pub fn vector_store(&self) -> Option<&VectorStore> {
        self.store.as_ref()
    }

    pub fn vector_store_mut(&mut self) -> Option<&mut VectorStore> {
        self.store.as_mut()
    }

    pub fn compression_state(&self) -> Option<CompressionState> {
        self.compression.as_ref().map(|t| t.state())
    }

    /// Approximate history size in characters.
    pub fn size(&self) -> usize {
        self.history.approximate_size()
    }

    pub fn append(&mut self, role: MessageRole, content: impl Into<String>) {
        self.history.append(role, content);
    }

    pub fn reset(&mut self) {
        self.history.reset();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.engine.stop_handle()
    }

    /// Stops the generation or tool loop in flight. A no-op when idle.
    pub fn stop(&self) {
        self.engine.stop();
    }

    /// Messages sent for a new turn. Without `keep_history` only the pinned
    /// system message goes along with the question. `context` is inserted as a
    /// second system message just before the question and never stored.
    fn turn_messages(&self, user_text: &str, context: Option<&str>) -> Vec<Message> {
        let mut messages = if self.history.keep_history() {
            self.history.get_messages()
        } else {
            self.history.system_message().cloned().into_iter().collect()
        };
        if let Some(context) = context {
            messages.push(Message::system(context));
        }
        messages.push(Message::user(user_text));
        messages
    }

    /// Records a finished exchange. Without `keep_history` nothing is kept.
    pub fn commit_turn(&mut self, user_text: &str, answer: &str) {
        if !self.history.keep_history() {
            return;
        }
        self.history.append(MessageRole::User, user_text);
        self.history.append(MessageRole::Assistant, answer);
    }

    /// Streams an answer to `user_text` through `on_chunk(text, finish_reason)`.
    ///
    /// The question and answer enter the history only once the answer is
    /// complete; a failed or cancelled turn leaves the history as it was.
    pub async fn generate<F>(&mut self, user_text: &str, on_chunk: F) -> Result<GenerationResult, AgentError>
    where
        F: FnMut(&str, &str) -> Result<(), CallbackError> + Send,
    {
        self.converse(user_text, None, |_, _| Ok(()), on_chunk).await
    }

    pub async fn generate_with_reasoning<R, F>(
        &mut self,
        user_text: &str,
        on_reasoning: R,
        on_response: F,
    ) -> Result<GenerationResult, AgentError>
    where
        R: FnMut(&str, &str) -> Result<(), CallbackError> + Send,
        F: FnMut(&str, &str) -> Result<(), CallbackError> + Send,
    {
        self.converse(user_text, None, on_reasoning, on_response).await
    }

    /// Non-streaming turn.
    pub async fn generate_once(&mut self, user_text: &str) -> Result<GenerationResult, AgentError> {
        let messages = self.turn_messages(user_text, None);
        let result = self
            .engine
            .generate_once(messages)
            .instrument(self.span.clone())
            .await?;
        self.commit_turn(user_text, &result.text);
        Ok(result)
    }

    /// Chunk stream for one turn. The history is not touched; call
    /// `commit_turn` once the stream has been consumed.
    pub fn stream(&self, user_text: &str) -> GenerationStream {
        let messages = self.turn_messages(user_text, None);
        self.engine.stream(messages)
    }

    /// Nearest passages for `query` from the attached vector store.
    pub async fn retrieve_context(&self, query: &str) -> Result<Vec<SearchResult>, AgentError> {
        let store = self.store.as_ref().ok_or(AgentError::NotConfigured("vector store"))?;
        let results = store
            .search_top_n(
                self.client.as_ref(),
                query,
                self.config.min_similarity,
                self.config.top_n,
            )
            .instrument(self.span.clone())
            .await?;
        debug!(parent: &self.span, matches = results.len(), "retrieved context");
        Ok(results)
    }

    /// `generate` preceded by retrieval. Matching passages are sent with this
    /// request only.
    pub async fn generate_with_context<F>(
        &mut self,
        user_text: &str,
        on_chunk: F,
    ) -> Result<GenerationResult, AgentError>
    where
        F: FnMut(&str, &str) -> Result<(), CallbackError> + Send,
    {
        let results = self.retrieve_context(user_text).await?;
        let context = if results.is_empty() {
            None
        } else {
            Some(build_rag_context_prompt(&format_context(&results)))
        };
        self.converse(user_text, context, |_, _| Ok(()), on_chunk).await
    }

    async fn converse<R, F>(
        &mut self,
        user_text: &str,
        context: Option<String>,
        on_reasoning: R,
        on_response: F,
    ) -> Result<GenerationResult, AgentError>
    where
        R: FnMut(&str, &str) -> Result<(), CallbackError> + Send,
        F: FnMut(&str, &str) -> Result<(), CallbackError> + Send,
    {
        let messages = self.turn_messages(user_text, context.as_deref());
        let result = self
            .engine
            .generate_with_reasoning(messages, on_reasoning, on_response)
            .instrument(self.span.clone())
            .await?;
        self.commit_turn(user_text, &result.text);
        Ok(result)
    }

    /// Checkpoint hook: compresses when the history is over the threshold.
    /// Sessions without a compressor never compress.
    pub async fn compress_if_over_threshold(&mut self) -> Result<Option<CompressionResult>, AgentError> {
        let Some(trigger) = self.compression.as_mut() else {
            return Ok(None);
        };
        let outcome = trigger
            .compress_if_over_threshold(&mut self.history)
            .instrument(self.span.clone())
            .await?;
        Ok(outcome)
    }

    pub async fn compress(&mut self) -> Result<CompressionResult, AgentError> {
        let trigger = self
            .compression
            .as_mut()
            .ok_or(AgentError::NotConfigured("compressor"))?;
        let outcome = trigger
            .compress(&mut self.history)
            .instrument(self.span.clone())
            .await?;
        Ok(outcome)
    }

    fn tool_loop(&self, executor: Arc<dyn ToolExecutor>) -> ToolCallLoop {
        let tool_loop = ToolCallLoop::new(Arc::clone(&self.client), self.config.tool_params(), executor)
            .with_mode(self.config.tool_execution)
            .with_max_rounds(self.config.max_tool_rounds)
            .with_stop_handle(self.engine.stop_handle())
            .with_telemetry(Arc::clone(self.engine.telemetry()));
        match &self.confirmation {
            Some(confirmation) => tool_loop.with_confirmation(Arc::clone(confirmation)),
            None => tool_loop,
        }
    }

    /// A loop that ended without any assistant text (round limit, abort or
    /// quit right after tool calls) leaves the history as it was.
    fn commit_tool_turn(&mut self, user_text: &str, outcome: &ToolLoopOutcome) {
        if outcome.last_assistant_message.trim().is_empty() {
            return;
        }
        self.commit_turn(user_text, &outcome.last_assistant_message);
    }

    /// Answers `user_text` with the executor's tools available. Only the
    /// question and the final assistant message are kept in the history.
    pub async fn run_tools(
        &mut self,
        user_text: &str,
        executor: Arc<dyn ToolExecutor>,
    ) -> Result<ToolLoopOutcome, AgentError> {
        let catalog = executor.catalog();
        let tool_loop = self.tool_loop(executor);
        let outcome = tool_loop
            .run(self.turn_messages(user_text, None), &catalog)
            .instrument(self.span.clone())
            .await?;
        self.commit_tool_turn(user_text, &outcome);
        Ok(outcome)
    }

    /// `run_tools` with the assistant text of every round streamed to `on_chunk`.
    pub async fn run_tools_streaming<F>(
        &mut self,
        user_text: &str,
        executor: Arc<dyn ToolExecutor>,
        on_chunk: F,
    ) -> Result<ToolLoopOutcome, AgentError>
    where
        F: FnMut(&str, &str) -> Result<(), CallbackError> + Send,
    {
        let catalog = executor.catalog();
        let tool_loop = self.tool_loop(executor);
        let outcome = tool_loop
            .run_streaming(self.turn_messages(user_text, None), &catalog, on_chunk)
            .instrument(self.span.clone())
            .await?;
        self.commit_tool_turn(user_text, &outcome);
        Ok(outcome)
    }
}
