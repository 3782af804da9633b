//! Scripted completion provider for unit tests.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use super::{
    ChunkStream, CompletionRequest, CompletionResponse, FinishReason, LLMClient, LLMError,
    StreamChunk, ToolCallDelta,
};

pub(crate) enum Scripted {
    Response(CompletionResponse),
    Stream(Vec<StreamChunk>),
    /// Yields the chunks, then never produces another item.
    Hang(Vec<StreamChunk>),
    Error(LLMError),
}

#[derive(Default)]
pub(crate) struct MockClient {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<CompletionRequest>>,
    embeddings: HashMap<String, Vec<f32>>,
    embed_calls: Mutex<usize>,
}

impl MockClient {
    pub(crate) fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    pub(crate) fn with_embeddings(embeddings: &[(&str, Vec<f32>)]) -> Self {
        Self {
            embeddings: embeddings
                .iter()
                .map(|(text, vector)| (text.to_string(), vector.clone()))
                .collect(),
            ..Default::default()
        }
    }

    pub(crate) fn with_script(self, script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..self
        }
    }

    pub(crate) fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    pub(crate) fn embed_calls(&self) -> usize {
        *self.embed_calls.lock()
    }

    fn next(&self, request: CompletionRequest) -> Scripted {
        self.requests.lock().push(request);
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Scripted::Error(LLMError::RequestFailed("script exhausted".to_string())))
    }
}

/// Splits a response into the chunk sequence a streaming engine would send.
pub(crate) fn response_chunks(response: &CompletionResponse) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    if let Some(reasoning) = &response.reasoning {
        chunks.push(StreamChunk::reasoning(reasoning.clone()));
    }
    if !response.content.is_empty() {
        chunks.push(StreamChunk::content(response.content.clone()));
    }
    for (index, call) in response.tool_calls.iter().enumerate() {
        chunks.push(StreamChunk::tool_call(ToolCallDelta {
            index,
            id: Some(call.id.clone()),
            name: Some(call.function.name.clone()),
            arguments: call.function.arguments.clone(),
        }));
    }
    let mut done = StreamChunk::done(response.finish_reason.clone());
    done.usage = response.usage;
    chunks.push(done);
    chunks
}

pub(crate) fn text_chunks(parts: &[&str], finish: FinishReason) -> Vec<StreamChunk> {
    let mut chunks: Vec<StreamChunk> = parts.iter().map(|p| StreamChunk::content(*p)).collect();
    chunks.push(StreamChunk::done(finish));
    chunks
}

#[async_trait]
impl LLMClient for MockClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        match self.next(request) {
            Scripted::Response(response) => Ok(response),
            Scripted::Stream(chunks) | Scripted::Hang(chunks) => {
                let content: String = chunks.iter().map(|c| c.content.as_str()).collect();
                let finish_reason = chunks
                    .iter()
                    .find_map(|c| c.finish_reason.clone())
                    .unwrap_or(FinishReason::Stop);
                Ok(CompletionResponse {
                    content,
                    reasoning: None,
                    finish_reason,
                    tool_calls: Vec::new(),
                    usage: chunks.iter().find_map(|c| c.usage),
                })
            }
            Scripted::Error(e) => Err(e),
        }
    }

    async fn stream_complete(&self, request: CompletionRequest) -> Result<ChunkStream, LLMError> {
        match self.next(request) {
            Scripted::Response(response) => {
                Ok(Box::pin(stream::iter(response_chunks(&response).into_iter().map(Ok))))
            }
            Scripted::Stream(chunks) => Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok)))),
            Scripted::Hang(chunks) => Ok(Box::pin(
                stream::iter(chunks.into_iter().map(Ok)).chain(stream::pending()),
            )),
            Scripted::Error(e) => Err(e),
        }
    }

    async fn embed(&self, _model: &str, input: &str) -> Result<Vec<f32>, LLMError> {
        *self.embed_calls.lock() += 1;
        self.embeddings
            .get(input)
            .cloned()
            .ok_or_else(|| LLMError::ApiError {
                status: 500,
                message: format!("no embedding scripted for {:?}", input),
            })
    }
}
