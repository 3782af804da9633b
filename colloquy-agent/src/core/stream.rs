//! Streaming completion with cooperative cancellation.

use async_stream::stream;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::AgentError;
use super::telemetry::Telemetry;
use crate::clients::{
    ChunkType, CompletionRequest, CompletionResponse, FinishReason, GenerationParams, LLMError,
    Message, SharedClient,
};

/// Finish reason reported on the reasoning channel once the answer starts.
pub const END_OF_REASONING: &str = "end_of_reasoning";

/// Error raised by a chunk callback. Aborts the stream it was raised from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CallbackError(pub String);

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<std::io::Error> for CallbackError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

/// Cloneable handle that stops whichever stream its engine is running.
///
/// Each stream arms a fresh token when it starts, so stopping while idle
/// has no effect on the next stream.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    token: Arc<Mutex<CancellationToken>>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.token.lock().cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.lock().is_cancelled()
    }

    pub(crate) fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.token.lock() = token.clone();
        token
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Content,
    Reasoning,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationChunk {
    pub kind: ChunkKind,
    pub text: String,
    /// Set only on the last chunk of a stream.
    pub finish_reason: Option<FinishReason>,
}

impl GenerationChunk {
    fn text(kind: ChunkKind, text: String) -> Self {
        Self {
            kind,
            text,
            finish_reason: None,
        }
    }

    fn finished(reason: FinishReason) -> Self {
        Self {
            kind: ChunkKind::Content,
            text: String::new(),
            finish_reason: Some(reason),
        }
    }
}

pub type GenerationStream = Pin<Box<dyn Stream<Item = Result<GenerationChunk, LLMError>> + Send>>;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub text: String,
    pub reasoning: String,
    pub finish_reason: FinishReason,
}

enum Next<T> {
    Cancelled,
    Item(T),
}

pub struct StreamingEngine {
    client: SharedClient,
    params: GenerationParams,
    stop: StopHandle,
    telemetry: Arc<Telemetry>,
}

impl StreamingEngine {
    pub fn new(client: SharedClient, params: GenerationParams) -> Self {
        Self {
            client,
            params,
            stop: StopHandle::new(),
            telemetry: Arc::new(Telemetry::new()),
        }
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    pub fn client(&self) -> &SharedClient {
        &self.client
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Starts a generation. Nothing is sent until the stream is polled; the
    /// stream ends after the chunk carrying the finish reason, or with
    /// `LLMError::Cancelled` once stopped.
    pub fn stream(&self, messages: Vec<Message>) -> GenerationStream {
        let token = self.stop.arm();
        let client = Arc::clone(&self.client);
        let telemetry = Arc::clone(&self.telemetry);
        let request = CompletionRequest::new(self.params.clone(), messages);
        let model = request.params.model.clone();

        Box::pin(stream! {
            let started = telemetry.capture_request(&request, true);
            let mut text = String::new();
            let mut reasoning = String::new();
            let mut index = 0;

            let opened = tokio::select! {
                biased;
                _ = token.cancelled() => Next::Cancelled,
                opened = client.stream_complete(request) => Next::Item(opened),
            };
            let mut upstream = match opened {
                Next::Cancelled => {
                    yield Err(LLMError::Cancelled);
                    return;
                }
                Next::Item(Err(e)) => {
                    telemetry.capture_error(&e, "stream_complete");
                    yield Err(e);
                    return;
                }
                Next::Item(Ok(upstream)) => upstream,
            };

            loop {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => Next::Cancelled,
                    next = upstream.next() => Next::Item(next),
                };
                let chunk = match next {
                    Next::Cancelled => {
                        yield Err(LLMError::Cancelled);
                        return;
                    }
                    Next::Item(None) => {
                        let response = CompletionResponse {
                            reasoning: (!reasoning.is_empty()).then_some(reasoning),
                            ..CompletionResponse::text(text)
                        };
                        telemetry.capture_response(&model, &response, started);
                        yield Ok(GenerationChunk::finished(FinishReason::Stop));
                        return;
                    }
                    Next::Item(Some(Err(e))) => {
                        telemetry.capture_error(&e, "stream");
                        yield Err(e);
                        return;
                    }
                    Next::Item(Some(Ok(chunk))) => chunk,
                };
                if token.is_cancelled() {
                    yield Err(LLMError::Cancelled);
                    return;
                }
                match chunk.chunk_type {
                    ChunkType::Content if !chunk.content.is_empty() => {
                        telemetry.capture_chunk(&chunk.content, index);
                        index += 1;
                        text.push_str(&chunk.content);
                        yield Ok(GenerationChunk::text(ChunkKind::Content, chunk.content));
                    }
                    ChunkType::Reasoning if !chunk.content.is_empty() => {
                        reasoning.push_str(&chunk.content);
                        yield Ok(GenerationChunk::text(ChunkKind::Reasoning, chunk.content));
                    }
                    ChunkType::Done => {
                        let reason = chunk.finish_reason.unwrap_or(FinishReason::Stop);
                        let response = CompletionResponse {
                            content: text,
                            reasoning: (!reasoning.is_empty()).then_some(reasoning),
                            finish_reason: reason.clone(),
                            tool_calls: Vec::new(),
                            usage: chunk.usage,
                        };
                        telemetry.capture_response(&model, &response, started);
                        yield Ok(GenerationChunk::finished(reason));
                        return;
                    }
                    _ => {}
                }
            }
        })
    }

    /// Streams an answer through `on_chunk(text, finish_reason)`. The last
    /// call has empty text and a non-empty finish reason.
    pub async fn generate<F>(
        &self,
        messages: Vec<Message>,
        mut on_chunk: F,
    ) -> Result<GenerationResult, AgentError>
    where
        F: FnMut(&str, &str) -> Result<(), CallbackError> + Send,
    {
        self.generate_with_reasoning(messages, |_, _| Ok(()), &mut on_chunk)
            .await
    }

    /// Like `generate`, with reasoning tokens routed to `on_reasoning`. When
    /// the answer starts, `on_reasoning` receives `("", "end_of_reasoning")`.
    pub async fn generate_with_reasoning<R, F>(
        &self,
        messages: Vec<Message>,
        mut on_reasoning: R,
        mut on_response: F,
    ) -> Result<GenerationResult, AgentError>
    where
        R: FnMut(&str, &str) -> Result<(), CallbackError> + Send,
        F: FnMut(&str, &str) -> Result<(), CallbackError> + Send,
    {
        debug!(model = %self.params.model, messages = messages.len(), "starting generation");
        let mut stream = self.stream(messages);
        let mut text = String::new();
        let mut reasoning = String::new();
        let mut reasoning_open = false;

        while let Some(item) = stream.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(LLMError::Cancelled) => {
                    info!(delivered = text.len(), "generation stopped");
                    return Err(AgentError::Cancelled { partial: text });
                }
                Err(e) => return Err(e.into()),
            };

            if let Some(reason) = chunk.finish_reason {
                if reasoning_open {
                    on_reasoning("", END_OF_REASONING)?;
                }
                on_response("", reason.as_str())?;
                return Ok(GenerationResult {
                    text,
                    reasoning,
                    finish_reason: reason,
                });
            }

            match chunk.kind {
                ChunkKind::Reasoning => {
                    on_reasoning(&chunk.text, "")?;
                    reasoning.push_str(&chunk.text);
                    reasoning_open = true;
                }
                ChunkKind::Content => {
                    if reasoning_open {
                        on_reasoning("", END_OF_REASONING)?;
                        reasoning_open = false;
                    }
                    on_response(&chunk.text, "")?;
                    text.push_str(&chunk.text);
                }
            }
        }

        Ok(GenerationResult {
            text,
            reasoning,
            finish_reason: FinishReason::Stop,
        })
    }

    /// Non-streaming generation.
    pub async fn generate_once(&self, messages: Vec<Message>) -> Result<GenerationResult, AgentError> {
        let token = self.stop.arm();
        let request = CompletionRequest::new(self.params.clone(), messages);
        let started = self.telemetry.capture_request(&request, false);
        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(AgentError::Cancelled { partial: String::new() }),
            response = self.client.complete(request) => response,
        };
        let response = response.inspect_err(|e| self.telemetry.capture_error(e, "complete"))?;
        self.telemetry.capture_response(&self.params.model, &response, started);
        Ok(GenerationResult {
            text: response.content,
            reasoning: response.reasoning.unwrap_or_default(),
            finish_reason: response.finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::mock::{MockClient, Scripted, text_chunks};
    use crate::clients::{StreamChunk, Usage};
    use std::time::Duration;

    fn engine(script: Vec<Scripted>) -> StreamingEngine {
        let client: SharedClient = Arc::new(MockClient::new(script));
        StreamingEngine::new(client, GenerationParams::new("chat"))
    }

    #[tokio::test]
    async fn test_generate_delivers_chunks_then_finish() {
        let engine = engine(vec![Scripted::Stream(text_chunks(
            &["Hello", ", ", "world"],
            FinishReason::Stop,
        ))]);
        let mut calls = Vec::new();

        let result = engine
            .generate(vec![Message::user("hi")], |text, reason| {
                calls.push((text.to_string(), reason.to_string()));
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(result.text, "Hello, world");
        assert_eq!(result.finish_reason, FinishReason::Stop);
        assert_eq!(calls.len(), 4);
        assert!(calls[..3].iter().all(|(_, reason)| reason.is_empty()));
        assert_eq!(calls[3], (String::new(), "stop".to_string()));
    }

    #[tokio::test]
    async fn test_length_finish_reason_is_reported() {
        let engine = engine(vec![Scripted::Stream(text_chunks(&["cut"], FinishReason::Length))]);
        let result = engine.generate(vec![Message::user("hi")], |_, _| Ok(())).await.unwrap();
        assert_eq!(result.finish_reason, FinishReason::Length);
    }

    #[tokio::test]
    async fn test_stop_before_first_chunk() {
        let engine = engine(vec![Scripted::Hang(vec![])]);
        let handle = engine.stop_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.stop();
        });
        let mut calls = 0;

        let err = engine
            .generate(vec![Message::user("hi")], |_, _| {
                calls += 1;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::Cancelled { ref partial } if partial.is_empty()));
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn test_stop_mid_stream_keeps_delivered_text() {
        let engine = engine(vec![Scripted::Hang(vec![
            StreamChunk::content("a"),
            StreamChunk::content("b"),
            StreamChunk::content("c"),
        ])]);
        let handle = engine.stop_handle();
        let mut delivered = Vec::new();

        let err = engine
            .generate(vec![Message::user("hi")], |text, _| {
                delivered.push(text.to_string());
                if delivered.len() == 2 {
                    handle.stop();
                }
                Ok(())
            })
            .await
            .unwrap_err();

        assert_eq!(delivered, vec!["a", "b"]);
        match err {
            AgentError::Cancelled { partial } => assert_eq!(partial, "ab"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stop_from_another_task_while_waiting() {
        let engine = engine(vec![Scripted::Hang(vec![
            StreamChunk::content("par"),
            StreamChunk::content("tial"),
        ])]);
        let handle = engine.stop_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.stop();
        });

        let err = engine
            .generate(vec![Message::user("hi")], |_, _| Ok(()))
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::Cancelled { ref partial } if partial == "partial"));
    }

    #[tokio::test]
    async fn test_stop_while_idle_does_not_affect_next_stream() {
        let engine = engine(vec![Scripted::Stream(text_chunks(&["ok"], FinishReason::Stop))]);
        engine.stop();

        let result = engine.generate(vec![Message::user("hi")], |_, _| Ok(())).await.unwrap();

        assert_eq!(result.text, "ok");
        engine.stop();
        assert!(engine.stop_handle().is_stopped());
    }

    #[tokio::test]
    async fn test_callback_error_aborts_stream() {
        let engine = engine(vec![Scripted::Stream(text_chunks(&["a", "b"], FinishReason::Stop))]);
        let mut calls = 0;

        let err = engine
            .generate(vec![Message::user("hi")], |_, _| {
                calls += 1;
                Err(CallbackError::new("display closed"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::Callback(_)));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_transport_error_is_surfaced() {
        let engine = engine(vec![Scripted::Error(LLMError::ContextExceeded("too long".to_string()))]);
        let err = engine.generate(vec![Message::user("hi")], |_, _| Ok(())).await.unwrap_err();
        assert!(matches!(err, AgentError::Llm(ref e) if e.is_context_exceeded()));
    }

    #[tokio::test]
    async fn test_reasoning_channel_reports_end() {
        let engine = engine(vec![Scripted::Stream(vec![
            StreamChunk::reasoning("think"),
            StreamChunk::content("answer"),
            StreamChunk::done(FinishReason::Stop),
        ])]);
        let mut reasoning_calls = Vec::new();
        let mut response_calls = Vec::new();

        let result = engine
            .generate_with_reasoning(
                vec![Message::user("hi")],
                |text, reason| {
                    reasoning_calls.push((text.to_string(), reason.to_string()));
                    Ok(())
                },
                |text, reason| {
                    response_calls.push((text.to_string(), reason.to_string()));
                    Ok(())
                },
            )
            .await
            .unwrap();

        assert_eq!(result.reasoning, "think");
        assert_eq!(result.text, "answer");
        assert_eq!(
            reasoning_calls,
            vec![
                ("think".to_string(), String::new()),
                (String::new(), END_OF_REASONING.to_string())
            ]
        );
        assert_eq!(response_calls.last().unwrap().1, "stop");
    }

    #[tokio::test]
    async fn test_generate_once_buffers_response() {
        let engine = engine(vec![Scripted::Response(CompletionResponse::text("whole answer"))]);
        let result = engine.generate_once(vec![Message::user("hi")]).await.unwrap();
        assert_eq!(result.text, "whole answer");
        assert_eq!(result.finish_reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn test_telemetry_records_streamed_and_buffered_turns() {
        let mut chunks = text_chunks(&["Hel", "lo"], FinishReason::Stop);
        if let Some(done) = chunks.last_mut() {
            done.usage = Some(Usage::new(20, 2));
        }
        let engine = engine(vec![
            Scripted::Stream(chunks),
            Scripted::Response(CompletionResponse::text("again").with_usage(Usage::new(30, 5))),
            Scripted::Error(LLMError::RequestFailed("down".to_string())),
        ]);

        engine.generate(vec![Message::user("hi")], |_, _| Ok(())).await.unwrap();
        let telemetry = engine.telemetry();
        let request = telemetry.last_request_metadata().unwrap();
        assert!(request.stream);
        assert_eq!(request.model, "chat");
        let response = telemetry.last_response_metadata().unwrap();
        assert_eq!(response.finish_reason, "stop");
        assert_eq!(response.usage, Usage::new(20, 2));
        assert!(telemetry.last_response_json().unwrap().contains("Hello"));

        engine.generate_once(vec![Message::user("again")]).await.unwrap();
        assert!(!telemetry.last_request_metadata().unwrap().stream);
        assert_eq!(telemetry.total_tokens_used(), 57);

        assert!(engine.generate_once(vec![Message::user("fail")]).await.is_err());
        assert_eq!(telemetry.total_tokens_used(), 57);
        assert!(telemetry.last_request_json().unwrap().contains("fail"));

        telemetry.reset();
        assert_eq!(telemetry.total_tokens_used(), 0);
    }

    #[tokio::test]
    async fn test_stream_yields_cancelled_item() {
        let engine = engine(vec![Scripted::Hang(vec![StreamChunk::content("x")])]);
        let mut stream = engine.stream(vec![Message::user("hi")]);

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.text, "x");
        engine.stop();
        assert!(matches!(stream.next().await, Some(Err(LLMError::Cancelled))));
        assert!(stream.next().await.is_none());
    }
}
