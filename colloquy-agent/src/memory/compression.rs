use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::ConversationHistory;
use crate::clients::{
    ChunkType, CompletionRequest, CompletionResponse, FinishReason, GenerationParams, LLMError,
    Message, SharedClient,
};
use crate::core::stream::CallbackError;
use crate::core::telemetry::Telemetry;
use crate::prompts::{
    COMPRESSOR_SYSTEM_INSTRUCTIONS, CompressionPrompt, build_compressed_system_message,
    build_conversation_transcript,
};

pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 6000;

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("Nothing to compress")]
    Empty,
    #[error("Compressor returned an empty summary")]
    EmptySummary,
    #[error("Compressed context is not smaller ({after} >= {before} characters)")]
    NotSmaller { before: usize, after: usize },
    #[error("Compressor request failed: {0}")]
    Llm(#[from] LLMError),
    #[error("Compression callback failed: {0}")]
    Callback(#[from] CallbackError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompressionResult {
    pub compressed_text: String,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionState {
    #[default]
    Normal,
    Compressing,
}

/// Summarization agent with its own model and a deterministic temperature.
pub struct ContextCompressor {
    client: SharedClient,
    params: GenerationParams,
    prompt: CompressionPrompt,
    system_instructions: String,
    telemetry: Telemetry,
}

impl ContextCompressor {
    pub fn new(client: SharedClient, model: impl Into<String>) -> Self {
        Self {
            client,
            params: GenerationParams::new(model).with_temperature(0.0),
            prompt: CompressionPrompt::default(),
            system_instructions: COMPRESSOR_SYSTEM_INSTRUCTIONS.to_string(),
            telemetry: Telemetry::new(),
        }
    }

    pub fn with_prompt(mut self, prompt: CompressionPrompt) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_system_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.system_instructions = instructions.into();
        self
    }

    /// Overrides the sampling parameters. The temperature stays at 0.0.
    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params.with_temperature(0.0);
        self
    }

    pub fn prompt(&self) -> CompressionPrompt {
        self.prompt
    }

    pub fn model(&self) -> &str {
        &self.params.model
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    fn build_request(&self, messages: &[Message]) -> Result<CompletionRequest, CompressionError> {
        if messages.is_empty() {
            return Err(CompressionError::Empty);
        }
        let request_messages = vec![
            Message::system(self.system_instructions.clone()),
            Message::user(self.prompt.text()),
            Message::user(build_conversation_transcript(messages)),
        ];
        Ok(CompletionRequest::new(self.params.clone(), request_messages))
    }

    pub async fn compress(&self, messages: &[Message]) -> Result<CompressionResult, CompressionError> {
        let request = self.build_request(messages)?;
        debug!(model = %self.params.model, messages = messages.len(), "compressing context");
        let started = self.telemetry.capture_request(&request, false);
        let response = self
            .client
            .complete(request)
            .await
            .inspect_err(|e| self.telemetry.capture_error(e, "compress"))?;
        self.telemetry.capture_response(&self.params.model, &response, started);
        Ok(CompressionResult {
            compressed_text: response.content,
            finish_reason: response.finish_reason,
        })
    }

    /// Streams the summary through `on_chunk` as it is produced. The final call
    /// carries an empty text and the finish reason.
    pub async fn compress_stream<F>(
        &self,
        messages: &[Message],
        mut on_chunk: F,
    ) -> Result<CompressionResult, CompressionError>
    where
        F: FnMut(&str, &str) -> Result<(), CallbackError> + Send,
    {
        let request = self.build_request(messages)?;
        let started = self.telemetry.capture_request(&request, true);
        let mut stream = self
            .client
            .stream_complete(request)
            .await
            .inspect_err(|e| self.telemetry.capture_error(e, "compress_stream"))?;
        let mut compressed_text = String::new();
        let mut finish_reason = FinishReason::Stop;
        let mut usage = None;
        let mut index = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.inspect_err(|e| self.telemetry.capture_error(e, "compress_stream"))?;
            match chunk.chunk_type {
                ChunkType::Content if !chunk.content.is_empty() => {
                    self.telemetry.capture_chunk(&chunk.content, index);
                    index += 1;
                    on_chunk(&chunk.content, "")?;
                    compressed_text.push_str(&chunk.content);
                }
                ChunkType::Done => {
                    if let Some(reason) = chunk.finish_reason {
                        finish_reason = reason;
                    }
                    usage = chunk.usage;
                    break;
                }
                _ => {}
            }
        }
        let response = CompletionResponse {
            usage,
            finish_reason: finish_reason.clone(),
            ..CompletionResponse::text(compressed_text.clone())
        };
        self.telemetry.capture_response(&self.params.model, &response, started);
        on_chunk("", finish_reason.as_str())?;

        Ok(CompressionResult {
            compressed_text,
            finish_reason,
        })
    }
}

/// Replaces a history with its summary once it grows past `threshold`
/// characters.
pub struct CompressionTrigger {
    compressor: Arc<ContextCompressor>,
    threshold: usize,
    state: CompressionState,
    preserved_instructions: Option<String>,
}

struct StateGuard<'a>(&'a mut CompressionState);

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        *self.0 = CompressionState::Normal;
    }
}

impl CompressionTrigger {
    pub fn new(compressor: Arc<ContextCompressor>, threshold: usize) -> Self {
        Self {
            compressor,
            threshold,
            state: CompressionState::Normal,
            preserved_instructions: None,
        }
    }

    /// Keeps `instructions` at the head of the compressed system message.
    pub fn preserve_system_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.preserved_instructions = Some(instructions.into());
        self
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn state(&self) -> CompressionState {
        self.state
    }

    pub fn compressor(&self) -> &ContextCompressor {
        &self.compressor
    }

    pub fn needs_compression(&self, history: &ConversationHistory) -> bool {
        history.approximate_size() > self.threshold
    }

    pub async fn compress_if_over_threshold(
        &mut self,
        history: &mut ConversationHistory,
    ) -> Result<Option<CompressionResult>, CompressionError> {
        if !self.needs_compression(history) {
            return Ok(None);
        }
        info!(
            size = history.approximate_size(),
            threshold = self.threshold,
            "context over threshold"
        );
        self.compress(history).await.map(Some)
    }

    /// Compresses unconditionally. On failure the history is left untouched.
    pub async fn compress(
        &mut self,
        history: &mut ConversationHistory,
    ) -> Result<CompressionResult, CompressionError> {
        self.state = CompressionState::Compressing;
        let guard = StateGuard(&mut self.state);

        let before = history.approximate_size();
        let result = self.compressor.compress(history.all()).await;
        drop(guard);

        let result = match result {
            Ok(result) if result.compressed_text.trim().is_empty() => {
                warn!("compressor returned an empty summary, history kept");
                return Err(CompressionError::EmptySummary);
            }
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "context compression failed, history kept");
                return Err(e);
            }
        };

        let compressed = build_compressed_system_message(
            &result.compressed_text,
            self.preserved_instructions.as_deref(),
        );
        let after = compressed.chars().count();
        if after >= before {
            warn!(before, after, "compressed context is not smaller, history kept");
            return Err(CompressionError::NotSmaller { before, after });
        }

        history.clear();
        history.set_system_instructions(compressed);
        info!(before, after, "context compressed");
        Ok(result)
    }
}
